pub mod error;
pub mod extract;
pub mod handlers;
pub mod pending;
pub mod routes;
pub mod state;

use anyhow::Context;
use tokio::signal;

pub use routes::create_router;
pub use state::{AppState, SharedState};

/// Binds the configured address and serves until Ctrl-C or SIGTERM.
pub async fn serve(state: SharedState) -> anyhow::Result<()> {
    let addr = state.config.socket_addr();
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Could not bind {}", addr))?;
    log::info!("Listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    log::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log::error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Received Ctrl+C, shutting down"),
        _ = terminate => log::info!("Received SIGTERM, shutting down"),
    }
}
