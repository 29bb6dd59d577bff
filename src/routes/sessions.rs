use actix_web::{HttpResponse, Responder, delete, get, web};

use super::not_found;
use crate::session::SessionController;

#[get("/sessions")]
pub async fn get_sessions_handler(controller: web::Data<SessionController>) -> impl Responder {
    HttpResponse::Ok().json(controller.tracker().list())
}

#[delete("/sessions/{id}")]
pub async fn delete_session_handler(
    controller: web::Data<SessionController>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let session_id = path.into_inner().0;
    if controller.tracker().cancel(&session_id) {
        HttpResponse::Ok().finish()
    } else {
        not_found(format!("Session {session_id} not running."))
    }
}
