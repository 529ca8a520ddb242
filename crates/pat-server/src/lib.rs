//! pat-server: Axum HTTP API for starting experiments and reading their
//! samples, with SSE streaming of new samples.

pub mod api;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use pat_core::{Laboratory, Worker};
use tokio::runtime::Handle;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use state::{AppState, ServerConfig};

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api::router())
        .with_state(state)
        .layer(cors)
}

/// Open the configured store and serve until the process is stopped.
pub async fn serve(config: ServerConfig, worker: Arc<dyn Worker>) -> anyhow::Result<()> {
    let store = config.store.open()?;
    let lab = Laboratory::with_handle(store, Handle::current());
    let app = build_router(AppState::new(lab, worker));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("pat listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
