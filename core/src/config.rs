//! Coordinator configuration.
//!
//! Values start from built-in defaults, are overridden by `SWITCHBOARD_*`
//! environment variables, and finally by an optional TOML file named by
//! `SWITCHBOARD_CONFIG` (default `./switchboard.toml`).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::directory::DirectoryConfig;
use crate::monitor::SlaPolicy;
use crate::router::RouterConfig;
use crate::transport::RetryPolicy;
use crate::{Result, SwitchboardError};

#[derive(Clone, Debug, PartialEq)]
pub struct CoordinatorConfig {
    /// Expected heartbeat cadence; used to count missed beats.
    pub heartbeat_interval: Duration,
    /// How far each accepted heartbeat pushes the deadline.
    pub heartbeat_lease: Duration,
    /// Consecutive missed beats tolerated before demotion.
    pub heartbeat_miss_cap: u32,
    pub sweep_interval: Duration,
    /// How long an expired descriptor is kept for audit.
    pub tombstone_retention: Duration,
    /// Bound on a single capability lookup.
    pub discovery_timeout: Duration,

    pub queue_capacity: usize,
    pub workers_per_recipient: usize,
    pub record_retention: usize,

    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_ratio: f64,
    pub transport_timeout: Duration,

    pub sla_success_rate: f64,
    pub sla_p95_latency: Duration,
    pub sla_min_samples: usize,
    pub sla_window: usize,
    pub sla_cooldown: Duration,
    pub monitor_buffer: usize,

    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_lease: Duration::from_secs(40),
            heartbeat_miss_cap: 2,
            sweep_interval: Duration::from_secs(1),
            tombstone_retention: Duration::from_secs(300),
            discovery_timeout: Duration::from_millis(250),
            queue_capacity: 1024,
            workers_per_recipient: 1,
            record_retention: 4096,
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            jitter_ratio: 0.2,
            transport_timeout: Duration::from_secs(10),
            sla_success_rate: 0.95,
            sla_p95_latency: Duration::from_secs(2),
            sla_min_samples: 5,
            sla_window: 100,
            sla_cooldown: Duration::from_secs(60),
            monitor_buffer: 4096,
            snapshot_path: None,
            snapshot_interval: None,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|v| v.parse::<T>().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

impl CoordinatorConfig {
    /// Defaults overridden by `SWITCHBOARD_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            heartbeat_interval: env_millis("SWITCHBOARD_HEARTBEAT_INTERVAL_MS")
                .unwrap_or(d.heartbeat_interval),
            heartbeat_lease: env_millis("SWITCHBOARD_HEARTBEAT_LEASE_MS")
                .unwrap_or(d.heartbeat_lease),
            heartbeat_miss_cap: env_parse("SWITCHBOARD_HEARTBEAT_MISS_CAP")
                .unwrap_or(d.heartbeat_miss_cap),
            sweep_interval: env_millis("SWITCHBOARD_SWEEP_INTERVAL_MS").unwrap_or(d.sweep_interval),
            tombstone_retention: env_millis("SWITCHBOARD_TOMBSTONE_RETENTION_MS")
                .unwrap_or(d.tombstone_retention),
            discovery_timeout: env_millis("SWITCHBOARD_DISCOVERY_TIMEOUT_MS")
                .unwrap_or(d.discovery_timeout),
            queue_capacity: env_parse("SWITCHBOARD_QUEUE_CAPACITY").unwrap_or(d.queue_capacity),
            workers_per_recipient: env_parse("SWITCHBOARD_WORKERS_PER_RECIPIENT")
                .unwrap_or(d.workers_per_recipient),
            record_retention: env_parse("SWITCHBOARD_RECORD_RETENTION")
                .unwrap_or(d.record_retention),
            max_retries: env_parse("SWITCHBOARD_MAX_RETRIES").unwrap_or(d.max_retries),
            initial_backoff: env_millis("SWITCHBOARD_INITIAL_BACKOFF_MS")
                .unwrap_or(d.initial_backoff),
            max_backoff: env_millis("SWITCHBOARD_MAX_BACKOFF_MS").unwrap_or(d.max_backoff),
            jitter_ratio: env_parse("SWITCHBOARD_JITTER_RATIO").unwrap_or(d.jitter_ratio),
            transport_timeout: env_millis("SWITCHBOARD_TRANSPORT_TIMEOUT_MS")
                .unwrap_or(d.transport_timeout),
            sla_success_rate: env_parse("SWITCHBOARD_SLA_SUCCESS_RATE")
                .unwrap_or(d.sla_success_rate),
            sla_p95_latency: env_millis("SWITCHBOARD_SLA_P95_LATENCY_MS")
                .unwrap_or(d.sla_p95_latency),
            sla_min_samples: env_parse("SWITCHBOARD_SLA_MIN_SAMPLES").unwrap_or(d.sla_min_samples),
            sla_window: env_parse("SWITCHBOARD_SLA_WINDOW").unwrap_or(d.sla_window),
            sla_cooldown: env_millis("SWITCHBOARD_SLA_COOLDOWN_MS").unwrap_or(d.sla_cooldown),
            monitor_buffer: env_parse("SWITCHBOARD_MONITOR_BUFFER").unwrap_or(d.monitor_buffer),
            snapshot_path: std::env::var("SWITCHBOARD_SNAPSHOT_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            snapshot_interval: env_millis("SWITCHBOARD_SNAPSHOT_INTERVAL_MS"),
        }
    }

    /// Load configuration from a TOML file (path via SWITCHBOARD_CONFIG or ./switchboard.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let base = Self::from_env();
        let path =
            std::env::var("SWITCHBOARD_CONFIG").unwrap_or_else(|_| "switchboard.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "config", path = %path, "No TOML config found; using defaults/env");
            return base;
        }
        match std::fs::read_to_string(p) {
            Ok(s) => match Self::from_toml_str(&s, base.clone()) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(target: "config", error = %e, "Failed to parse TOML; using defaults");
                    base
                }
            },
            Err(e) => {
                tracing::warn!(target: "config", error = %e, "Failed to read TOML; using defaults");
                base
            }
        }
    }

    /// Overlays a TOML document onto `base`; absent keys keep their base value.
    pub fn from_toml_str(s: &str, base: Self) -> Result<Self> {
        let t: CoordinatorToml =
            toml::from_str(s).map_err(|e| SwitchboardError::Config(e.to_string()))?;
        Ok(t.overlay(base))
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(SwitchboardError::Config(msg.to_string()));
        if self.queue_capacity == 0 {
            return fail("queue_capacity must be at least 1");
        }
        if self.workers_per_recipient == 0 {
            return fail("workers_per_recipient must be at least 1");
        }
        if self.heartbeat_lease.is_zero() || self.heartbeat_interval.is_zero() {
            return fail("heartbeat interval and lease must be non-zero");
        }
        if self.sweep_interval.is_zero() {
            return fail("sweep_interval must be non-zero");
        }
        // The sweep has to observe `miss_cap + 1` missed beats before the lease runs out.
        let demote_after = self
            .heartbeat_interval
            .checked_mul(self.heartbeat_miss_cap.saturating_add(1))
            .and_then(|d| d.checked_add(self.sweep_interval));
        match demote_after {
            Some(d) if d <= self.heartbeat_lease => {}
            _ => return fail("heartbeat_lease runs out before the miss cap can be reached"),
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return fail("jitter_ratio must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.sla_success_rate) {
            return fail("sla_success_rate must be within [0, 1]");
        }
        if self.initial_backoff > self.max_backoff {
            return fail("initial_backoff exceeds max_backoff");
        }
        if self.sla_window == 0 || self.monitor_buffer == 0 {
            return fail("sla_window and monitor_buffer must be at least 1");
        }
        if self.transport_timeout.is_zero() || self.discovery_timeout.is_zero() {
            return fail("transport and discovery timeouts must be non-zero");
        }
        Ok(())
    }

    pub fn directory_config(&self) -> DirectoryConfig {
        DirectoryConfig {
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_lease: self.heartbeat_lease,
            tombstone_retention: self.tombstone_retention,
            discovery_timeout: self.discovery_timeout,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: self.initial_backoff,
            max_delay: self.max_backoff,
            jitter_ratio: self.jitter_ratio,
            timeout: self.transport_timeout,
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            queue_capacity: self.queue_capacity,
            workers_per_recipient: self.workers_per_recipient,
            record_retention: self.record_retention,
            retry: self.retry_policy(),
        }
    }

    pub fn sla_policy(&self) -> SlaPolicy {
        SlaPolicy {
            success_rate_floor: self.sla_success_rate,
            p95_latency_ceiling: self.sla_p95_latency,
            heartbeat_miss_cap: self.heartbeat_miss_cap,
            min_samples: self.sla_min_samples,
            window_size: self.sla_window,
            cooldown: self.sla_cooldown,
        }
    }
}

/// TOML overlay; durations are milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CoordinatorToml {
    #[serde(default)]
    registry: RegistryToml,
    #[serde(default)]
    router: RouterToml,
    #[serde(default)]
    transport: TransportToml,
    #[serde(default)]
    sla: SlaToml,
    #[serde(default)]
    snapshot: SnapshotToml,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryToml {
    heartbeat_interval_ms: Option<u64>,
    heartbeat_lease_ms: Option<u64>,
    heartbeat_miss_cap: Option<u32>,
    sweep_interval_ms: Option<u64>,
    tombstone_retention_ms: Option<u64>,
    discovery_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouterToml {
    queue_capacity: Option<usize>,
    workers_per_recipient: Option<usize>,
    record_retention: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransportToml {
    max_retries: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    jitter_ratio: Option<f64>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SlaToml {
    success_rate: Option<f64>,
    p95_latency_ms: Option<u64>,
    min_samples: Option<usize>,
    window: Option<usize>,
    cooldown_ms: Option<u64>,
    monitor_buffer: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SnapshotToml {
    path: Option<PathBuf>,
    interval_ms: Option<u64>,
}

impl CoordinatorToml {
    fn overlay(self, mut c: CoordinatorConfig) -> CoordinatorConfig {
        let ms = Duration::from_millis;
        let r = self.registry;
        if let Some(v) = r.heartbeat_interval_ms {
            c.heartbeat_interval = ms(v);
        }
        if let Some(v) = r.heartbeat_lease_ms {
            c.heartbeat_lease = ms(v);
        }
        if let Some(v) = r.heartbeat_miss_cap {
            c.heartbeat_miss_cap = v;
        }
        if let Some(v) = r.sweep_interval_ms {
            c.sweep_interval = ms(v);
        }
        if let Some(v) = r.tombstone_retention_ms {
            c.tombstone_retention = ms(v);
        }
        if let Some(v) = r.discovery_timeout_ms {
            c.discovery_timeout = ms(v);
        }

        let q = self.router;
        if let Some(v) = q.queue_capacity {
            c.queue_capacity = v;
        }
        if let Some(v) = q.workers_per_recipient {
            c.workers_per_recipient = v;
        }
        if let Some(v) = q.record_retention {
            c.record_retention = v;
        }

        let t = self.transport;
        if let Some(v) = t.max_retries {
            c.max_retries = v;
        }
        if let Some(v) = t.initial_backoff_ms {
            c.initial_backoff = ms(v);
        }
        if let Some(v) = t.max_backoff_ms {
            c.max_backoff = ms(v);
        }
        if let Some(v) = t.jitter_ratio {
            c.jitter_ratio = v;
        }
        if let Some(v) = t.timeout_ms {
            c.transport_timeout = ms(v);
        }

        let s = self.sla;
        if let Some(v) = s.success_rate {
            c.sla_success_rate = v;
        }
        if let Some(v) = s.p95_latency_ms {
            c.sla_p95_latency = ms(v);
        }
        if let Some(v) = s.min_samples {
            c.sla_min_samples = v;
        }
        if let Some(v) = s.window {
            c.sla_window = v;
        }
        if let Some(v) = s.cooldown_ms {
            c.sla_cooldown = ms(v);
        }
        if let Some(v) = s.monitor_buffer {
            c.monitor_buffer = v;
        }

        if let Some(p) = self.snapshot.path {
            c.snapshot_path = Some(p);
        }
        if let Some(v) = self.snapshot.interval_ms {
            c.snapshot_interval = Some(ms(v));
        }
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(CoordinatorConfig::default().validate().is_ok());
    }

    #[test]
    fn toml_overlays_only_present_keys() {
        let doc = r#"
            [router]
            queue_capacity = 8

            [transport]
            max_retries = 5
            initial_backoff_ms = 20

            [snapshot]
            path = "/tmp/switchboard.json"
        "#;
        let cfg = CoordinatorConfig::from_toml_str(doc, CoordinatorConfig::default())
            .expect("valid toml");
        assert_eq!(cfg.queue_capacity, 8);
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.initial_backoff, Duration::from_millis(20));
        assert_eq!(cfg.snapshot_path, Some(PathBuf::from("/tmp/switchboard.json")));
        assert_eq!(cfg.heartbeat_lease, CoordinatorConfig::default().heartbeat_lease);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = CoordinatorConfig::from_toml_str("[router]\nqueue = 1", CoordinatorConfig::default());
        assert!(matches!(err, Err(SwitchboardError::Config(_))));
    }

    #[test]
    fn lease_must_outlast_the_miss_cap() {
        let short = CoordinatorConfig {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_lease: Duration::from_secs(30),
            heartbeat_miss_cap: 2,
            ..Default::default()
        };
        assert!(matches!(short.validate(), Err(SwitchboardError::Config(_))));

        let enough = CoordinatorConfig {
            heartbeat_lease: Duration::from_secs(31),
            ..short
        };
        assert!(enough.validate().is_ok());
    }

    #[test]
    fn validate_catches_inverted_backoff() {
        let cfg = CoordinatorConfig {
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
