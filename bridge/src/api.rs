// HTTP handlers for the bridge
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use switchboard_core::{
    AgentRegistration, DiscoveryQuery, HealthState, MessageEnvelope, SwitchboardError,
};

use crate::{status_for, BridgeError, BridgeState, Result};

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| BridgeError::BadRequest(e.body_text()))
}

pub async fn health(State(state): State<BridgeState>) -> impl IntoResponse {
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds().max(0);
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
        "agents": state.directory.live_agents().len(),
    }))
}

pub async fn register(
    State(state): State<BridgeState>,
    payload: std::result::Result<Json<AgentRegistration>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let registration = body(payload)?;
    let descriptor = state.directory.register(registration)?;
    Ok((StatusCode::OK, Json(descriptor)))
}

pub async fn heartbeat(
    State(state): State<BridgeState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let deadline = state.directory.heartbeat(&id)?;
    Ok(Json(json!({ "agent_id": id, "heartbeat_deadline": deadline })))
}

pub async fn deregister(
    State(state): State<BridgeState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let removed = state.directory.deregister(&id)?;
    Ok(Json(removed))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverParams {
    /// Comma-separated tags.
    pub capabilities: String,
    #[serde(default, alias = "min_health")]
    pub min_health: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl DiscoverParams {
    fn into_query(self) -> Result<DiscoveryQuery> {
        let mut query = DiscoveryQuery::new(
            self.capabilities
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty()),
        );
        if let Some(h) = self.min_health.as_deref() {
            query.min_health = Some(h.parse::<HealthState>()?);
        }
        query.protocol = self.protocol.filter(|p| !p.is_empty());
        query.limit = self.limit;
        Ok(query)
    }
}

pub async fn discover(
    State(state): State<BridgeState>,
    params: std::result::Result<Query<DiscoverParams>, axum::extract::rejection::QueryRejection>,
) -> Result<impl IntoResponse> {
    let Query(params) = params.map_err(|e| BridgeError::BadRequest(e.body_text()))?;
    let query = params.into_query()?;
    let agents = state.directory.discover(&query)?;
    debug!(target: "bridge", tags = ?query.capabilities, matches = agents.len(), "Discover");
    Ok(Json(agents))
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub accepted: bool,
    pub message_id: String,
    pub recipients: Vec<String>,
    pub rejected: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
}

/// Admission only; delivery continues in the background and is visible
/// through `GET /messages/{id}`.
pub async fn send(
    State(state): State<BridgeState>,
    payload: std::result::Result<Json<MessageEnvelope>, JsonRejection>,
) -> Response {
    let envelope = match body(payload) {
        Ok(e) => e,
        Err(e) => return e.into_response(),
    };
    let message_id = envelope.message_id.clone();
    match state.router.send(envelope) {
        Ok(receipt) => {
            info!(target: "bridge", %message_id, recipients = ?receipt.recipients, "Envelope accepted");
            let reason = (!receipt.rejected.is_empty())
                .then(|| "some recipient queues are full".to_string());
            Json(SendResponse {
                accepted: true,
                message_id: receipt.message_id,
                recipients: receipt.recipients,
                rejected: receipt.rejected,
                reason,
                kind: None,
            })
            .into_response()
        }
        Err(e) => rejected(message_id, e),
    }
}

fn rejected(message_id: String, err: SwitchboardError) -> Response {
    let status = status_for(&err);
    let body = SendResponse {
        accepted: false,
        message_id,
        recipients: Vec::new(),
        rejected: Vec::new(),
        reason: Some(err.to_string()),
        kind: Some(err.kind()),
    };
    (status, Json(body)).into_response()
}

pub async fn message_status(
    State(state): State<BridgeState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.router.status(&id)?))
}

pub async fn cancel_message(
    State(state): State<BridgeState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let cancelled = state.router.cancel(&id)?;
    Ok(Json(json!({ "message_id": id, "cancelled": cancelled })))
}

pub async fn compliance_agent(
    State(state): State<BridgeState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    state
        .monitor
        .snapshot(&id)
        .map(Json)
        .ok_or_else(|| SwitchboardError::NotFound(format!("no compliance data for {id}")).into())
}

pub async fn compliance_summary(State(state): State<BridgeState>) -> impl IntoResponse {
    Json(state.monitor.summary())
}
