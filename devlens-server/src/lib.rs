//! devlens server: binds the event plane to an HTTP/WebSocket surface.

pub mod app_state;
pub mod routes;
pub mod ws;

use anyhow::Context;
use devlens_config::DevlensConfig;
use devlens_core::Runtime;
use tracing::info;

use app_state::AppState;

/// Run the event plane and serve it until ctrl-c (or a fatal persistence
/// failure) stops it.
pub async fn serve(config: DevlensConfig) -> anyhow::Result<()> {
    let bind = config.server.bind_addr()?;
    let runtime = Runtime::start(config.runtime.clone())
        .await
        .context("failed to start the event plane")?;

    let state = AppState {
        facade: runtime.facade(),
        fanout: runtime.fanout(),
        server_config: config.server.clone(),
    };
    let router = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(%bind, "devlens server listening");

    let fatal = runtime.cancelled();
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("ctrl-c received, shutting down");
                }
                _ = fatal.cancelled() => {
                    info!("runtime requested shutdown");
                }
            }
        })
        .await;

    runtime.shutdown().await?;
    result.context("server error")
}
