//! HTTP/WebSocket API layer.
//!
//! This module contains thin handlers that delegate to the room service.
//! It provides router construction and server startup; REST routes and
//! the bidirectional channel share one listen port.

use std::sync::Arc;

use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};

use crate::room::Room;
use crate::state::Config;

pub mod http;
pub mod ws;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the configured TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer.
///
/// All business logic lives in the room service; handlers only parse,
/// delegate, and shape responses.
#[derive(Clone)]
pub struct AppState {
    /// The room coordinator.
    pub room: Arc<Room>,
    /// Shared HTTP client, used by the OAuth grant handlers.
    pub http_client: reqwest::Client,
    /// Application configuration.
    pub config: Arc<Config>,
}

/// Starts the HTTP + WebSocket server on the configured port.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let port = state.config.listen_port;
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    log::info!("Server listening on http://0.0.0.0:{}", port);
    let app = http::create_router(state).layer(cors);

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
