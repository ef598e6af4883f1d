use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use switchboard_core::{AgentDirectory, ComplianceMonitor, Coordinator, MessageRouter, SwitchboardError};

pub mod api;

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Core(#[from] SwitchboardError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::Core(e) => status_for(e),
            BridgeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Core(e) => e.kind(),
            BridgeError::BadRequest(_) => "validation",
            BridgeError::Internal(_) => "internal",
        }
    }
}

/// HTTP status for a core error.
pub fn status_for(err: &SwitchboardError) -> StatusCode {
    match err {
        SwitchboardError::Validation(_) => StatusCode::BAD_REQUEST,
        SwitchboardError::NotFound(_) => StatusCode::NOT_FOUND,
        SwitchboardError::Expired(_) => StatusCode::GONE,
        SwitchboardError::Overload(_) | SwitchboardError::Offline(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SwitchboardError::Transient(_) => StatusCode::GATEWAY_TIMEOUT,
        SwitchboardError::Fatal(_) => StatusCode::BAD_GATEWAY,
        SwitchboardError::Config(_)
        | SwitchboardError::Storage(_)
        | SwitchboardError::Io(_)
        | SwitchboardError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.to_string(), "kind": self.kind() });
        (self.status(), Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct BridgeState {
    pub directory: Arc<AgentDirectory>,
    pub router: MessageRouter,
    pub monitor: Arc<ComplianceMonitor>,
    pub started_at: DateTime<Utc>,
}

impl BridgeState {
    pub fn new(
        directory: Arc<AgentDirectory>,
        router: MessageRouter,
        monitor: Arc<ComplianceMonitor>,
    ) -> Self {
        Self {
            directory,
            router,
            monitor,
            started_at: Utc::now(),
        }
    }

    pub fn from_coordinator(coordinator: &Coordinator) -> Self {
        Self::new(
            Arc::clone(&coordinator.directory),
            coordinator.router.clone(),
            Arc::clone(&coordinator.monitor),
        )
    }
}

/// Routes exposed to external agents and operators.
pub fn app(state: BridgeState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/register", post(api::register))
        .route("/heartbeat/:id", post(api::heartbeat))
        .route("/deregister/:id", delete(api::deregister))
        .route("/discover", get(api::discover))
        .route("/send", post(api::send))
        .route("/messages/:id", get(api::message_status).delete(api::cancel_message))
        .route("/compliance", get(api::compliance_summary))
        .route("/compliance/:id", get(api::compliance_agent))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serves until `shutdown` resolves.
pub async fn start_server<F>(addr: SocketAddr, state: BridgeState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| BridgeError::Internal(format!("bind {addr}: {e}")))?;
    info!(target: "bridge", %addr, "Switchboard bridge listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| BridgeError::Internal(e.to_string()))
}
