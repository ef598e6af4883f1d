#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use switchboard_core::{
    AgentRegistration, CoordinatorConfig, DeliveryTransport, MessageEnvelope, TransportError,
};

/// One call seen by [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct Call {
    pub endpoint: String,
    pub message_id: String,
    pub attempt: u32,
    pub succeeded: bool,
}

/// In-process stand-in for remote agents.
///
/// Each endpoint answers from its script first and succeeds once the script
/// runs out. An optional per-endpoint delay models a slow agent.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Result<(), TransportError>>>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, endpoint: &str, results: Vec<Result<(), TransportError>>) {
        self.scripts
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .extend(results);
    }

    pub fn slow(&self, endpoint: &str, delay: Duration) {
        self.delays.lock().insert(endpoint.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Message ids delivered successfully, in delivery order.
    pub fn delivered(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.succeeded)
            .map(|c| c.message_id.clone())
            .collect()
    }
}

#[async_trait]
impl DeliveryTransport for ScriptedTransport {
    async fn deliver(
        &self,
        endpoint: &str,
        envelope: &MessageEnvelope,
        attempt: u32,
    ) -> Result<(), TransportError> {
        let delay = self.delays.lock().get(endpoint).copied();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let result = self
            .scripts
            .lock()
            .get_mut(endpoint)
            .and_then(|s| s.pop_front())
            .unwrap_or(Ok(()));
        self.calls.lock().push(Call {
            endpoint: endpoint.to_string(),
            message_id: envelope.message_id.clone(),
            attempt,
            succeeded: result.is_ok(),
        });
        result
    }
}

pub fn endpoint(agent_id: &str) -> String {
    format!("http://{agent_id}.test/inbox")
}

pub fn registration(agent_id: &str, capabilities: &[&str]) -> AgentRegistration {
    capabilities
        .iter()
        .fold(AgentRegistration::new(agent_id, endpoint(agent_id)), |r, c| {
            r.with_capability(*c)
        })
}

/// Short timings so tests finish quickly.
pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_lease: Duration::from_millis(200),
        sweep_interval: Duration::from_millis(20),
        max_retries: 3,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        jitter_ratio: 0.0,
        transport_timeout: Duration::from_millis(500),
        sla_min_samples: 3,
        sla_cooldown: Duration::from_millis(100),
        ..CoordinatorConfig::default()
    }
}

/// Polls `check` until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < within {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
