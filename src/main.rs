use std::sync::Arc;

use actix_web::web;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use coderun::config::{CliArgs, Config};
use coderun::environment::EnvironmentRegistry;
use coderun::session::SessionController;
use coderun::tracker::SessionTracker;
use coderun::web_server::build_server;

/// Grace period for running sessions to clean up after shutdown was signalled
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        sandbox: sandbox_config,
        environments_dir,
    } = cli.to_config()?;

    let registry = EnvironmentRegistry::load(&environments_dir)?;
    if registry.is_empty() {
        log::warn!(
            "No environments found in {}, every run will be rejected",
            environments_dir.display()
        );
    }

    let shutdown_token = CancellationToken::new();
    let tracker = Arc::new(SessionTracker::new(shutdown_token.clone()));
    let controller = web::Data::new(SessionController::new(
        Arc::new(registry),
        sandbox_config,
        tracker.clone(),
    ));

    // ======= PREPARATION END, EXECUTION START =======

    let server = build_server(server_config, controller)?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    // 1. Cancel running sessions, so they kill their sandboxes and clean up
    tracker.shutdown();
    log::info!(
        "Shutdown signal sent to {} running session(s), waiting for them to finish...",
        tracker.len()
    );

    // 2. Stop the server; in-flight handlers finish their cleanup first
    if tokio::time::timeout(SHUTDOWN_GRACE, server_handle.stop(true))
        .await
        .is_err()
    {
        log::error!("Server did not stop within {SHUTDOWN_GRACE:?}");
    }

    // 3. Wait until every session has left the tracker
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while !tracker.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    if !tracker.is_empty() {
        log::error!("{} session(s) still running at exit", tracker.len());
    }

    log::info!("Shutdown complete");
    Ok(())
}
