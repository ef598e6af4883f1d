use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::{Result, SwitchboardError};

/// Registry health classification.
///
/// Variants are declared best-first, so the derived ordering ranks
/// `Healthy < Degraded < Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    /// Terminal: the heartbeat deadline passed. Only `register` revives the id.
    Expired,
}

impl HealthState {
    /// True when this state is live and at least as good as `min`.
    pub fn satisfies(self, min: HealthState) -> bool {
        self != HealthState::Expired && self <= min
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Expired => "expired",
        }
    }
}

impl std::str::FromStr for HealthState {
    type Err = SwitchboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "healthy" => Ok(HealthState::Healthy),
            "degraded" => Ok(HealthState::Degraded),
            "expired" => Ok(HealthState::Expired),
            other => Err(SwitchboardError::Validation(format!(
                "unknown health state: {other}"
            ))),
        }
    }
}

/// What an agent submits to `register`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentRegistration {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub capabilities: Vec<String>,
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AgentRegistration {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            endpoints: vec![endpoint.into()],
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SwitchboardError::Validation("agent id is empty".into()));
        }
        if normalize_tags(&self.capabilities).is_empty() {
            return Err(SwitchboardError::Validation(format!(
                "agent {} advertises no capabilities",
                self.id
            )));
        }
        if self.endpoints.is_empty() {
            return Err(SwitchboardError::Validation(format!(
                "agent {} has no endpoints",
                self.id
            )));
        }
        for endpoint in &self.endpoints {
            validate_endpoint(endpoint)?;
        }
        Ok(())
    }
}

/// Registry-owned view of an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    /// Deduplicated, in advertised order.
    pub capabilities: Vec<String>,
    pub endpoints: Vec<String>,
    pub protocols: Vec<String>,
    pub health: HealthState,
    pub registered_at: DateTime<Utc>,
    pub heartbeat_deadline: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AgentDescriptor {
    pub(crate) fn from_registration(
        registration: AgentRegistration,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        let capabilities = normalize_tags(&registration.capabilities);
        let name = if registration.name.trim().is_empty() {
            registration.id.clone()
        } else {
            registration.name
        };
        Self {
            id: registration.id,
            name,
            capabilities,
            endpoints: registration.endpoints,
            protocols: registration.protocols,
            health: HealthState::Healthy,
            registered_at: now,
            heartbeat_deadline: deadline,
            last_heartbeat: now,
            metadata: registration.metadata,
        }
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c == tag)
    }

    pub fn speaks(&self, protocol: &str) -> bool {
        self.protocols.iter().any(|p| p == protocol)
    }

    pub fn is_expired(&self) -> bool {
        self.health == HealthState::Expired
    }
}

/// Capability-filtered discovery request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryQuery {
    /// Every tag must be advertised by a match.
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Worst acceptable health; `None` means healthy agents only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_health: Option<HealthState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl DiscoveryQuery {
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn include_degraded(mut self) -> Self {
        self.min_health = Some(HealthState::Degraded);
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn min_health(&self) -> HealthState {
        self.min_health.unwrap_or(HealthState::Healthy)
    }

    pub fn tags(&self) -> Vec<String> {
        normalize_tags(&self.capabilities)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tags().is_empty() {
            return Err(SwitchboardError::Validation(
                "discovery query names no capabilities".into(),
            ));
        }
        if self.min_health == Some(HealthState::Expired) {
            return Err(SwitchboardError::Validation(
                "expired agents are never discoverable".into(),
            ));
        }
        Ok(())
    }
}

/// Trims, drops empties and deduplicates while keeping first-seen order.
pub(crate) fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let url = Url::parse(endpoint).map_err(|e| {
        SwitchboardError::Validation(format!("unparsable endpoint {endpoint:?}: {e}"))
    })?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(()),
        "http" | "https" => Err(SwitchboardError::Validation(format!(
            "endpoint {endpoint:?} has no host"
        ))),
        other => Err(SwitchboardError::Validation(format!(
            "endpoint {endpoint:?} uses unsupported scheme {other}"
        ))),
    }
}

pub(crate) fn chrono_span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
