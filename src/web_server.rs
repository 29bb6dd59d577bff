use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::routes::{
    delete_session_handler, get_environment_handler, get_environments_handler,
    get_sessions_handler, json_error_handler, post_run_handler, run_ws_handler,
};
use crate::session::SessionController;

pub fn build_server(
    server_config: ServerConfig,
    controller: web::Data<SessionController>,
) -> std::io::Result<Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(controller.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .configure(configure_routes)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(8080),
    ))?
    .disable_signals()
    .run();

    Ok(server)
}

/// Registers every route; shared with the tests
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(get_environments_handler)
        .service(get_environment_handler)
        .service(post_run_handler)
        .service(run_ws_handler)
        .service(get_sessions_handler)
        .service(delete_session_handler);
}
