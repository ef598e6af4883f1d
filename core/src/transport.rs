//! Outbound delivery with classified failures and bounded retries.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

use crate::envelope::MessageEnvelope;
use crate::{Result, SwitchboardError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Network/timeout/5xx-class; retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// 4xx-class; retrying cannot help.
    #[error("fatal: {0}")]
    Fatal(String),
    /// No network at all; retries are short-circuited.
    #[error("offline: {0}")]
    Offline(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

impl From<TransportError> for SwitchboardError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Transient(m) => SwitchboardError::Transient(m),
            TransportError::Fatal(m) => SwitchboardError::Fatal(m),
            TransportError::Offline(m) => SwitchboardError::Offline(m),
        }
    }
}

/// Exponential backoff with proportional jitter.
///
/// Before retry `n` (zero-based) the client waits
/// `min(initial_delay * 2^n, max_delay) * (1 + jitter_ratio * u)` with `u` drawn
/// uniformly from `[0, 1)`. With `jitter_ratio <= 1` the sequence never
/// shrinks until the cap is reached.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
    /// Upper bound for a single attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter_ratio: 0.2,
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Capped exponential delay before retry `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry `attempt` for a given jitter sample in `[0, 1)`.
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = jitter.clamp(0.0, 1.0) * self.jitter_ratio.max(0.0);
        base + base.mul_f64(jitter)
    }

    fn sample_delay(&self, attempt: u32) -> Duration {
        let u: f64 = rand::thread_rng().gen_range(0.0..1.0);
        self.delay_for(attempt, u)
    }
}

/// Reports whether the network is reachable at all.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Probe for environments without connectivity signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

#[async_trait]
impl ConnectivityProbe for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

/// Result of a retried call plus what it took to get there.
#[derive(Debug)]
pub struct CallOutcome<T> {
    pub result: std::result::Result<T, TransportError>,
    pub attempts: u32,
    pub elapsed: Duration,
    pub attempt_latencies: Vec<Duration>,
    /// Backoff actually slept between attempts.
    pub delays: Vec<Duration>,
}

impl<T> CallOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Wraps a fallible async operation in the retry policy.
#[derive(Clone)]
pub struct ResilientClient {
    policy: RetryPolicy,
    probe: Arc<dyn ConnectivityProbe>,
}

impl ResilientClient {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            probe: Arc::new(AlwaysOnline),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn call<T, F, Fut>(&self, op: F) -> CallOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        self.call_within(None, op).await
    }

    /// Like [`call`](Self::call) but never runs past `budget`.
    ///
    /// Each attempt is cut to the remaining budget, and a backoff that would
    /// overrun it ends the call with the last transient error instead.
    pub async fn call_within<T, F, Fut>(&self, budget: Option<Duration>, mut op: F) -> CallOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        let started = Instant::now();
        let mut latencies = Vec::new();
        let mut delays = Vec::new();
        let mut attempt = 0u32;

        let result = loop {
            if !self.probe.is_online().await {
                break Err(TransportError::Offline("connectivity probe reports offline".into()));
            }

            let remaining = budget.map(|b| b.saturating_sub(started.elapsed()));
            let attempt_timeout = match remaining {
                Some(r) if r.is_zero() => {
                    break Err(TransportError::Transient("time budget exhausted".into()))
                }
                Some(r) => r.min(self.policy.timeout),
                None => self.policy.timeout,
            };

            let attempt_start = Instant::now();
            let outcome = match tokio::time::timeout(attempt_timeout, op(attempt)).await {
                Ok(r) => r,
                Err(_) => Err(TransportError::Transient(format!(
                    "attempt timed out after {}ms",
                    attempt_timeout.as_millis()
                ))),
            };
            latencies.push(attempt_start.elapsed());
            attempt += 1;

            match outcome {
                Ok(value) => break Ok(value),
                Err(TransportError::Transient(reason)) if attempt <= self.policy.max_retries => {
                    let delay = self.policy.sample_delay(attempt - 1);
                    if let Some(b) = budget {
                        if started.elapsed() + delay >= b {
                            break Err(TransportError::Transient(reason));
                        }
                    }
                    debug!(target: "transport", attempt, delay_ms = delay.as_millis() as u64, %reason, "Retrying after transient failure");
                    delays.push(delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = &result {
            warn!(target: "transport", attempts = attempt, error = %e, "Call failed");
        }

        CallOutcome {
            result,
            attempts: attempt,
            elapsed: started.elapsed(),
            attempt_latencies: latencies,
            delays,
        }
    }
}

/// Carries one envelope to one endpoint; a single attempt, no retries.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(
        &self,
        endpoint: &str,
        envelope: &MessageEnvelope,
        attempt: u32,
    ) -> std::result::Result<(), TransportError>;
}

/// POSTs the envelope as JSON with the delivery headers attached.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SwitchboardError::Config(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    /// 408, 429 and 5xx are worth retrying; any other non-success is not.
    pub fn classify_status(status: StatusCode) -> std::result::Result<(), TransportError> {
        if status.is_success() {
            Ok(())
        } else if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            Err(TransportError::Transient(format!("endpoint answered {status}")))
        } else {
            Err(TransportError::Fatal(format!("endpoint answered {status}")))
        }
    }

    fn classify_error(err: &reqwest::Error) -> TransportError {
        if network_unreachable(err) {
            TransportError::Offline(err.to_string())
        } else if err.is_builder() {
            TransportError::Fatal(err.to_string())
        } else {
            TransportError::Transient(err.to_string())
        }
    }
}

fn network_unreachable(err: &(dyn StdError + 'static)) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::NetworkUnreachable
                    | std::io::ErrorKind::NetworkDown
                    | std::io::ErrorKind::HostUnreachable
            ) {
                return true;
            }
        }
        source = e.source();
    }
    false
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn deliver(
        &self,
        endpoint: &str,
        envelope: &MessageEnvelope,
        attempt: u32,
    ) -> std::result::Result<(), TransportError> {
        let mut req = self.client.post(endpoint).json(envelope);
        for (name, value) in envelope.delivery_headers(attempt) {
            req = req.header(name, value);
        }
        let response = req.send().await.map_err(|e| Self::classify_error(&e))?;
        Self::classify_status(response.status())
    }
}
