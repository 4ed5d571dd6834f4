// WebSocket daemon: axum router, shared state and the per-socket loop.

mod call;
mod limits;
mod ws;

pub use call::run_call;
pub use limits::{CallLimiter, CallPermit};

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use conclave_common::TimeoutConfig;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::session::SessionRegistry;
use crate::tools::ToolRegistry;

/// Everything a connection needs, shared across sockets.
pub struct AppState {
    pub config: DaemonConfig,
    pub timeouts: TimeoutConfig,
    pub registry: SessionRegistry,
    pub limiter: CallLimiter,
    pub tools: Arc<dyn ToolRegistry>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: DaemonConfig,
        timeouts: TimeoutConfig,
        tools: Arc<dyn ToolRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(shutdown.clone()),
            limiter: CallLimiter::new(
                config.max_concurrent_calls,
                config.max_concurrent_calls_per_session,
            ),
            config,
            timeouts,
            tools,
            shutdown,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let max_frame_bytes = state.config.max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| ws::handle_socket(state, socket))
}

/// Liveness only. A protocol-correct probe goes through the hello handshake.
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.registry.len(),
        "in_flight": state.registry.total_in_flight(),
    }))
}
