use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::DiscoveryQuery;
use crate::{Result, SwitchboardError};

/// Reserved header names stamped on outbound deliveries.
///
/// Transports carry these next to the serialized envelope so a receiving
/// agent can deduplicate retries and order replies without parsing the body.
pub mod keys {
    /// Envelope message id
    pub const MESSAGE_ID: &str = "x-switchboard-message-id";
    /// Correlation id linking a response to its request
    pub const CORRELATION_ID: &str = "x-switchboard-correlation-id";
    /// Sending agent id
    pub const SENDER: &str = "x-switchboard-sender";
    /// Envelope priority, lowercase
    pub const PRIORITY: &str = "x-switchboard-priority";
    /// Zero-based delivery attempt number
    pub const ATTEMPT: &str = "x-switchboard-attempt";
    /// Expiry instant, RFC 3339
    pub const EXPIRES_AT: &str = "x-switchboard-expires-at";
}

/// Delivery priority. Declaration order is the ordering: `Low < Critical`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Notification,
    Error,
}

impl MessageType {
    /// Events and notifications go to every capability match, not just the best one.
    pub fn fans_out(self) -> bool {
        matches!(self, MessageType::Event | MessageType::Notification)
    }
}

/// Destination of an envelope.
///
/// Serialized as `{"agent": "a1"}` or `{"capability": {"capabilities": [...]}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Agent(String),
    Capability(DiscoveryQuery),
}

impl Recipient {
    pub fn agent(id: impl Into<String>) -> Self {
        Recipient::Agent(id.into())
    }

    pub fn capability<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Recipient::Capability(DiscoveryQuery::new(capabilities))
    }
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Unit of message exchange: routing, priority, TTL and an opaque payload.
///
/// `expires_at` is always derived as `created_at + ttl`; it is never stored,
/// so a deserialized envelope cannot carry an inconsistent expiry.
///
/// # Examples
///
/// ```
/// use switchboard_core::{MessageEnvelope, MessageType, Priority, Recipient};
///
/// let env = MessageEnvelope::new("agent.ops", Recipient::agent("a1"), MessageType::Request, 5.0)
///     .with_priority(Priority::Critical);
/// assert!(env.validate().is_ok());
/// assert_eq!(env.expires_at() - env.created_at, chrono::Duration::seconds(5));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(default = "new_message_id")]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub from: String,
    pub to: Recipient,
    #[serde(default)]
    pub priority: Priority,
    /// Seconds; fractional values are allowed.
    pub ttl: f64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl MessageEnvelope {
    pub fn new(
        from: impl Into<String>,
        to: Recipient,
        message_type: MessageType,
        ttl_secs: f64,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            correlation_id: None,
            from: from.into(),
            to,
            priority: Priority::Normal,
            ttl: ttl_secs,
            created_at: Utc::now(),
            message_type,
            payload: serde_json::Value::Null,
            metadata: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builds a `Response` addressed back to this envelope's sender.
    ///
    /// The correlation id is this envelope's correlation id when present,
    /// otherwise its message id.
    pub fn reply(&self, from: impl Into<String>, payload: serde_json::Value) -> Self {
        let correlation = self
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.message_id.clone());
        MessageEnvelope::new(
            from,
            Recipient::Agent(self.from.clone()),
            MessageType::Response,
            self.ttl,
        )
        .with_priority(self.priority)
        .with_correlation_id(correlation)
        .with_payload(payload)
    }

    pub fn ttl_duration(&self) -> Option<Duration> {
        if self.ttl.is_finite() && self.ttl > 0.0 {
            Duration::try_from_secs_f64(self.ttl).ok()
        } else {
            None
        }
    }

    /// `created_at + ttl`, or `None` when that instant is out of range.
    pub fn checked_expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl_ms = if self.ttl.is_finite() {
            (self.ttl * 1000.0).round() as i64
        } else {
            0
        };
        chrono::Duration::try_milliseconds(ttl_ms.max(0))
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
    }

    /// Saturates at the latest representable instant; admission rejects such envelopes.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.checked_expires_at().unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Time left before expiry, `None` once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at() - now)
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
    }

    /// Admission checks. Expiry is reported as `Expired`, everything else as `Validation`.
    pub fn validate(&self) -> Result<()> {
        if self.message_id.trim().is_empty() {
            return Err(SwitchboardError::Validation("message_id is empty".into()));
        }
        if self.from.trim().is_empty() {
            return Err(SwitchboardError::Validation(format!(
                "message {} has no sender",
                self.message_id
            )));
        }
        if self.ttl_duration().is_none() {
            return Err(SwitchboardError::Validation(format!(
                "message {} has non-positive ttl {}",
                self.message_id, self.ttl
            )));
        }
        if self.checked_expires_at().is_none() {
            return Err(SwitchboardError::Validation(format!(
                "message {} has ttl {} past the representable time range",
                self.message_id, self.ttl
            )));
        }
        match &self.to {
            Recipient::Agent(id) if id.trim().is_empty() => {
                return Err(SwitchboardError::Validation(format!(
                    "message {} has an empty recipient id",
                    self.message_id
                )));
            }
            Recipient::Agent(_) => {}
            Recipient::Capability(query) => query.validate()?,
        }
        if self.message_type == MessageType::Response && self.correlation_id.is_none() {
            return Err(SwitchboardError::Validation(format!(
                "response {} carries no correlation_id",
                self.message_id
            )));
        }
        if self.is_expired_at(Utc::now()) {
            return Err(SwitchboardError::Expired(format!(
                "message {} expired before admission",
                self.message_id
            )));
        }
        Ok(())
    }

    /// Header set a transport sends with delivery attempt `attempt`.
    pub fn delivery_headers(&self, attempt: u32) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(keys::MESSAGE_ID.into(), self.message_id.clone());
        if let Some(correlation) = &self.correlation_id {
            headers.insert(keys::CORRELATION_ID.into(), correlation.clone());
        }
        headers.insert(keys::SENDER.into(), self.from.clone());
        headers.insert(keys::PRIORITY.into(), self.priority.as_str().into());
        headers.insert(keys::ATTEMPT.into(), attempt.to_string());
        headers.insert(keys::EXPIRES_AT.into(), self.expires_at().to_rfc3339());
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_correlates_to_request() {
        let req = MessageEnvelope::new("a", Recipient::agent("b"), MessageType::Request, 2.0);
        let resp = req.reply("b", serde_json::json!({"ok": true}));
        assert_eq!(resp.correlation_id.as_deref(), Some(req.message_id.as_str()));
        assert_eq!(resp.to, Recipient::agent("a"));
        assert!(resp.validate().is_ok());
    }

    #[test]
    fn remaining_is_none_after_expiry() {
        let mut env = MessageEnvelope::new("a", Recipient::agent("b"), MessageType::Event, 1.0);
        env.created_at = Utc::now() - chrono::Duration::seconds(5);
        assert!(env.remaining(Utc::now()).is_none());
        assert!(matches!(env.validate(), Err(SwitchboardError::Expired(_))));
    }

    #[test]
    fn huge_ttl_is_rejected_not_overflowed() {
        let env = MessageEnvelope::new("a", Recipient::agent("b"), MessageType::Event, 1e13);
        assert!(env.checked_expires_at().is_none());
        assert_eq!(env.expires_at(), DateTime::<Utc>::MAX_UTC);
        assert!(matches!(env.validate(), Err(SwitchboardError::Validation(_))));

        let year = 86_400.0 * 365.0;
        let long = MessageEnvelope::new("a", Recipient::agent("b"), MessageType::Event, year);
        assert!(long.validate().is_ok());
    }

    #[test]
    fn headers_carry_attempt_and_priority() {
        let env = MessageEnvelope::new("a", Recipient::agent("b"), MessageType::Event, 1.0)
            .with_priority(Priority::High);
        let headers = env.delivery_headers(2);
        assert_eq!(headers.get(keys::ATTEMPT).map(String::as_str), Some("2"));
        assert_eq!(headers.get(keys::PRIORITY).map(String::as_str), Some("high"));
    }
}
