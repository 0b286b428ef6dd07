use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use wsbroadcast::config::{Settings, load_config};
use wsbroadcast::registry::ConnectionRegistry;
use wsbroadcast::transport::start_websocket_server;
use wsbroadcast::utils::error::ServerError;
use wsbroadcast::utils::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.log.level);

    if let Err(e) = run_server(settings).await {
        error!("Server failed: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run_server(settings: Settings) -> Result<(), ServerError> {
    let registry = Arc::new(ConnectionRegistry::new());
    start_websocket_server(settings, registry, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("SIGINT received, initiating graceful shutdown."),
        () = terminate => info!("SIGTERM received, initiating graceful shutdown."),
    }
}
