use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tokio::sync::{oneshot, watch};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::gateway::Gateway;

#[derive(Debug)]
pub struct ApiError {
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal_error(message: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

#[derive(Clone)]
pub struct RouteState {
    pub gateway: Arc<Gateway>,
    pub server_handle: axum_server::Handle,
    pub shutdown_tx: watch::Sender<()>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    Router::new()
        .route("/shutdown", post(shutdown))
        .route("/hello", get(hello))
        .route("/function/{name}", post(invoke_function))
        .layer(TraceLayer::new_for_http())
        .with_state(route_state)
}

async fn hello() -> &'static str {
    "Hello world\n"
}

/// Schedules a graceful stop: listeners close, in-flight calls finalize
/// as their workers respond.
async fn shutdown(State(state): State<RouteState>) -> &'static str {
    info!("shutdown requested");
    let _ = state.shutdown_tx.send(());
    state
        .server_handle
        .graceful_shutdown(Some(Duration::from_secs(30)));
    "Server is shutting down\n"
}

async fn invoke_function(
    Path(name): Path<String>,
    State(state): State<RouteState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let func_id = state
        .gateway
        .func_config()
        .find_by_func_name(&name)
        .ok_or_else(|| ApiError::not_found(&format!("unknown function {name}")))?
        .func_id;
    let (tx, rx) = oneshot::channel();
    state.gateway.on_external_http(func_id, body, tx);
    let outcome = rx
        .await
        .map_err(|_| ApiError::internal_error("call context dropped"))?;
    Ok((outcome.status, outcome.body).into_response())
}
