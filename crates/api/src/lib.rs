pub mod config;
pub mod relay;
pub mod rooms;
pub mod routes;
pub mod state;
pub mod ws;

pub use config::RelayConfig;
pub use state::AppState;

use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tradedesk_core::ChatStore;

/// Build the Axum application router: REST under `/api`, the socket at `/ws`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = state.config.cors_layer();

    Router::new()
        .nest("/api", routes::api_routes())
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already-bound listener.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    axum::serve(listener, build_router(state)).await
}

/// Start the relay server.
pub async fn start_server(store: Arc<dyn ChatStore>, config: RelayConfig) -> anyhow::Result<()> {
    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!(
        origins = ?config.allowed_origins,
        "Relay server listening on {}",
        bind_addr
    );
    serve(listener, Arc::new(AppState::new(store, config))).await?;
    Ok(())
}
