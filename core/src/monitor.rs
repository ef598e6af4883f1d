//! SLA tracking per agent.
//!
//! The monitor consumes delivery outcomes and registry events, keeps a
//! count-bounded window per agent and asks the registry to demote or restore
//! agents. It never sits on the delivery path: the router hands outcomes over
//! with `try_send`, and everything here runs on the monitor's own task.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opentelemetry::metrics::Counter;
use opentelemetry::{global, KeyValue};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::directory::{AgentDirectory, RegistryEvent};
use crate::router::{DeliveryOutcome, DeliveryStatus, FailureReason};
use crate::types::{chrono_span, HealthState};

/// Input to the monitor.
#[derive(Debug, Clone)]
pub enum ComplianceEvent {
    Delivery(DeliveryOutcome),
    Registry(RegistryEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlaPolicy {
    pub success_rate_floor: f64,
    pub p95_latency_ceiling: Duration,
    /// Consecutive missed heartbeats tolerated; one more demotes.
    pub heartbeat_miss_cap: u32,
    /// Rate and latency rules stay quiet below this many samples.
    pub min_samples: usize,
    pub window_size: usize,
    /// How long metrics must stay clean before a degraded agent is restored.
    pub cooldown: Duration,
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self {
            success_rate_floor: 0.95,
            p95_latency_ceiling: Duration::from_secs(2),
            heartbeat_miss_cap: 2,
            min_samples: 5,
            window_size: 100,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    LowSuccessRate,
    HighLatency,
    MissedHeartbeats,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationKind::LowSuccessRate => "low_success_rate",
            ViolationKind::HighLatency => "high_latency",
            ViolationKind::MissedHeartbeats => "missed_heartbeats",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub observed: f64,
    pub threshold: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceSnapshot {
    pub agent_id: String,
    pub samples: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p50_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95_latency_ms: Option<u64>,
    pub consecutive_missed_heartbeats: u32,
    pub total_missed_heartbeats: u64,
    pub health: HealthState,
    pub violations: Vec<Violation>,
    pub total_violations: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceSummary {
    pub agents: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub expired: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_success_rate: Option<f64>,
    pub total_violations: u64,
    pub snapshots: Vec<ComplianceSnapshot>,
}

const MAX_VIOLATIONS: usize = 32;

// Log-scale buckets, 5% wide, from 1ms to ~2 minutes; the last one is overflow.
const GROWTH: f64 = 1.05;
const BUCKETS: usize = 250;

fn bucket_of(ms: u64) -> usize {
    if ms <= 1 {
        return 0;
    }
    let idx = ((ms as f64).ln() / GROWTH.ln()).ceil() as usize;
    idx.min(BUCKETS - 1)
}

fn bucket_bound(idx: usize) -> u64 {
    GROWTH.powi(idx as i32).round() as u64
}

/// Fixed-bucket latency histogram; updates are O(1), percentiles read the
/// bucket's upper bound (within 5% of the true value).
#[derive(Debug, Clone)]
struct LatencyHistogram {
    counts: Vec<u32>,
    total: u32,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            counts: vec![0; BUCKETS],
            total: 0,
        }
    }

    fn add(&mut self, ms: u64) {
        self.counts[bucket_of(ms)] += 1;
        self.total += 1;
    }

    fn remove(&mut self, ms: u64) {
        let b = bucket_of(ms);
        if self.counts[b] > 0 {
            self.counts[b] -= 1;
            self.total -= 1;
        }
    }

    fn percentile(&self, q: f64) -> Option<u64> {
        if self.total == 0 {
            return None;
        }
        let rank = ((q * self.total as f64).ceil() as u32).max(1);
        let mut seen = 0;
        for (idx, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return Some(bucket_bound(idx));
            }
        }
        Some(bucket_bound(BUCKETS - 1))
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    success: bool,
    latency_ms: Option<u64>,
}

#[derive(Debug, Clone)]
struct AgentWindow {
    samples: VecDeque<Sample>,
    successes: usize,
    latencies: LatencyHistogram,
    consecutive_misses: u32,
    total_misses: u64,
    health: HealthState,
    clean_since: Option<DateTime<Utc>>,
    active: HashSet<ViolationKind>,
    violations: VecDeque<Violation>,
    total_violations: u64,
    updated_at: DateTime<Utc>,
}

impl AgentWindow {
    fn new(health: HealthState) -> Self {
        Self {
            samples: VecDeque::new(),
            successes: 0,
            latencies: LatencyHistogram::new(),
            consecutive_misses: 0,
            total_misses: 0,
            health,
            clean_since: None,
            active: HashSet::new(),
            violations: VecDeque::new(),
            total_violations: 0,
            updated_at: Utc::now(),
        }
    }

    fn push(&mut self, sample: Sample, window_size: usize) {
        if self.samples.len() >= window_size.max(1) {
            if let Some(old) = self.samples.pop_front() {
                if old.success {
                    self.successes -= 1;
                }
                if let Some(ms) = old.latency_ms {
                    self.latencies.remove(ms);
                }
            }
        }
        if sample.success {
            self.successes += 1;
        }
        if let Some(ms) = sample.latency_ms {
            self.latencies.add(ms);
        }
        self.samples.push_back(sample);
    }

    fn clear_samples(&mut self) {
        self.samples.clear();
        self.successes = 0;
        self.latencies = LatencyHistogram::new();
    }

    /// Raises the consecutive count to `missed`, adding only the new misses to the total.
    fn note_misses(&mut self, missed: u32) {
        if missed > self.consecutive_misses {
            self.total_misses += u64::from(missed - self.consecutive_misses);
            self.consecutive_misses = missed;
        }
    }

    fn success_rate(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.successes as f64 / self.samples.len() as f64)
        }
    }

    fn breaches(&self, policy: &SlaPolicy) -> Vec<(ViolationKind, f64, f64)> {
        let mut out = Vec::new();
        if self.samples.len() >= policy.min_samples {
            if let Some(rate) = self.success_rate() {
                if rate < policy.success_rate_floor {
                    out.push((ViolationKind::LowSuccessRate, rate, policy.success_rate_floor));
                }
            }
        }
        if self.latencies.total as usize >= policy.min_samples {
            if let Some(p95) = self.latencies.percentile(0.95) {
                let ceiling = policy.p95_latency_ceiling.as_millis() as u64;
                if p95 > ceiling {
                    out.push((ViolationKind::HighLatency, p95 as f64, ceiling as f64));
                }
            }
        }
        if self.consecutive_misses > policy.heartbeat_miss_cap {
            out.push((
                ViolationKind::MissedHeartbeats,
                f64::from(self.consecutive_misses),
                f64::from(policy.heartbeat_miss_cap),
            ));
        }
        out
    }

    fn snapshot(&self, agent_id: &str) -> ComplianceSnapshot {
        ComplianceSnapshot {
            agent_id: agent_id.to_string(),
            samples: self.samples.len(),
            success_rate: self.success_rate(),
            p50_latency_ms: self.latencies.percentile(0.50),
            p95_latency_ms: self.latencies.percentile(0.95),
            consecutive_missed_heartbeats: self.consecutive_misses,
            total_missed_heartbeats: self.total_misses,
            health: self.health,
            violations: self.violations.iter().cloned().collect(),
            total_violations: self.total_violations,
            updated_at: self.updated_at,
        }
    }
}

/// Health change the monitor wants the registry to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Demote,
    Restore,
}

pub struct ComplianceMonitor {
    policy: SlaPolicy,
    directory: Arc<AgentDirectory>,
    windows: DashMap<String, AgentWindow>,
    violations_counter: Counter<u64>,
    transitions_counter: Counter<u64>,
}

impl ComplianceMonitor {
    pub fn new(policy: SlaPolicy, directory: Arc<AgentDirectory>) -> Self {
        let meter = global::meter("switchboard.monitor");
        Self {
            policy,
            directory,
            windows: DashMap::new(),
            violations_counter: meter
                .u64_counter("switchboard.monitor.violations_total")
                .with_description("SLA violations detected")
                .init(),
            transitions_counter: meter
                .u64_counter("switchboard.monitor.health_transitions_total")
                .with_description("Demotions and restorations requested")
                .init(),
        }
    }

    pub fn policy(&self) -> &SlaPolicy {
        &self.policy
    }

    fn initial_health(&self, agent_id: &str) -> HealthState {
        self.directory
            .get(agent_id)
            .map(|d| d.health)
            .unwrap_or(HealthState::Healthy)
    }

    pub fn observe(&self, event: ComplianceEvent) {
        let now = Utc::now();
        let agent_id = match &event {
            ComplianceEvent::Delivery(o) => o.recipient.clone(),
            ComplianceEvent::Registry(e) => e.agent_id().to_string(),
        };

        let verdict = match event {
            ComplianceEvent::Delivery(outcome) => {
                let Some(sample) = sample_of(&outcome) else {
                    return;
                };
                // Late outcomes for departed agents must not resurrect a window.
                if self.directory.get(&agent_id).is_none() {
                    return;
                }
                let mut window = self
                    .windows
                    .entry(agent_id.clone())
                    .or_insert_with(|| AgentWindow::new(self.initial_health(&agent_id)));
                window.push(sample, self.policy.window_size);
                window.updated_at = now;
                self.evaluate(&agent_id, &mut window, now)
            }
            ComplianceEvent::Registry(event) => self.apply_registry(&agent_id, event, now),
        };

        if let Some(verdict) = verdict {
            self.enforce(&agent_id, verdict);
        }
    }

    fn apply_registry(
        &self,
        agent_id: &str,
        event: RegistryEvent,
        now: DateTime<Utc>,
    ) -> Option<Verdict> {
        match event {
            RegistryEvent::Registered { fresh: true, .. } => {
                self.windows
                    .insert(agent_id.to_string(), AgentWindow::new(HealthState::Healthy));
                None
            }
            RegistryEvent::Registered { .. } => None,
            RegistryEvent::Deregistered { .. } | RegistryEvent::Purged { .. } => {
                self.forget(agent_id);
                None
            }
            RegistryEvent::Expired { .. } => {
                if let Some(mut w) = self.windows.get_mut(agent_id) {
                    w.health = HealthState::Expired;
                    w.clean_since = None;
                    w.updated_at = now;
                }
                None
            }
            RegistryEvent::HealthChanged { to, .. } => {
                if let Some(mut w) = self.windows.get_mut(agent_id) {
                    w.health = to;
                    w.updated_at = now;
                }
                None
            }
            RegistryEvent::HeartbeatOverdue { missed, .. } => {
                let mut window = self
                    .windows
                    .entry(agent_id.to_string())
                    .or_insert_with(|| AgentWindow::new(self.initial_health(agent_id)));
                window.note_misses(missed);
                window.updated_at = now;
                self.evaluate(agent_id, &mut window, now)
            }
            RegistryEvent::Heartbeat { missed_before, .. } => {
                let mut window = self
                    .windows
                    .entry(agent_id.to_string())
                    .or_insert_with(|| AgentWindow::new(self.initial_health(agent_id)));
                window.note_misses(missed_before);
                let verdict = self.evaluate(agent_id, &mut window, now);
                // The beat arrived, so the streak ends here.
                window.consecutive_misses = 0;
                window.updated_at = now;
                verdict
            }
        }
    }

    fn evaluate(
        &self,
        agent_id: &str,
        window: &mut AgentWindow,
        now: DateTime<Utc>,
    ) -> Option<Verdict> {
        if window.health == HealthState::Expired {
            return None;
        }
        let breaches = window.breaches(&self.policy);

        let current: HashSet<ViolationKind> = breaches.iter().map(|(k, _, _)| *k).collect();
        for (kind, observed, threshold) in &breaches {
            if window.active.contains(kind) {
                continue;
            }
            warn!(target: "monitor", agent_id, kind = kind.as_str(), observed, threshold, "SLA violation");
            self.violations_counter
                .add(1, &[KeyValue::new("kind", kind.as_str())]);
            window.total_violations += 1;
            window.violations.push_back(Violation {
                kind: *kind,
                observed: *observed,
                threshold: *threshold,
                at: now,
            });
            while window.violations.len() > MAX_VIOLATIONS {
                window.violations.pop_front();
            }
        }
        window.active = current;

        if !breaches.is_empty() {
            window.clean_since = None;
            return (window.health == HealthState::Healthy).then_some(Verdict::Demote);
        }

        if window.health == HealthState::Degraded {
            let since = *window.clean_since.get_or_insert(now);
            if now - since >= chrono_span(self.policy.cooldown) {
                return Some(Verdict::Restore);
            }
        }
        None
    }

    fn enforce(&self, agent_id: &str, verdict: Verdict) {
        let target = match verdict {
            Verdict::Demote => HealthState::Degraded,
            Verdict::Restore => HealthState::Healthy,
        };
        match self.directory.set_health(agent_id, target) {
            Ok(changed) => {
                if let Some(mut w) = self.windows.get_mut(agent_id) {
                    w.health = target;
                    w.clean_since = None;
                    if verdict == Verdict::Demote {
                        // Probation: restoration is judged on fresh traffic only.
                        w.clear_samples();
                        w.active.clear();
                    }
                }
                if changed {
                    self.transitions_counter
                        .add(1, &[KeyValue::new("to", target.as_str())]);
                    info!(target: "monitor", agent_id, to = target.as_str(), "Health transition applied");
                }
            }
            Err(e) => {
                debug!(target: "monitor", agent_id, error = %e, "Health transition not applied");
            }
        }
    }

    /// Re-checks every window; restorations depend on elapsed time, not traffic.
    pub fn evaluate_all(&self) {
        let now = Utc::now();
        let ids: Vec<String> = self.windows.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let verdict = match self.windows.get_mut(&id) {
                Some(mut w) => self.evaluate(&id, &mut w, now),
                None => None,
            };
            if let Some(verdict) = verdict {
                self.enforce(&id, verdict);
            }
        }
    }

    pub fn snapshot(&self, agent_id: &str) -> Option<ComplianceSnapshot> {
        self.windows.get(agent_id).map(|w| w.snapshot(agent_id))
    }

    pub fn summary(&self) -> ComplianceSummary {
        let mut snapshots: Vec<ComplianceSnapshot> = self
            .windows
            .iter()
            .map(|e| e.value().snapshot(e.key()))
            .collect();
        snapshots.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let count = |h: HealthState| snapshots.iter().filter(|s| s.health == h).count();
        let rates: Vec<f64> = snapshots.iter().filter_map(|s| s.success_rate).collect();
        let mean_success_rate = if rates.is_empty() {
            None
        } else {
            Some(rates.iter().sum::<f64>() / rates.len() as f64)
        };

        ComplianceSummary {
            agents: snapshots.len(),
            healthy: count(HealthState::Healthy),
            degraded: count(HealthState::Degraded),
            expired: count(HealthState::Expired),
            mean_success_rate,
            total_violations: snapshots.iter().map(|s| s.total_violations).sum(),
            snapshots,
        }
    }

    pub fn forget(&self, agent_id: &str) {
        self.windows.remove(agent_id);
    }

    /// Number of agents with a sample window.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    /// Drains both event streams until they close.
    pub async fn run(
        self: Arc<Self>,
        mut deliveries: mpsc::Receiver<ComplianceEvent>,
        mut registry: broadcast::Receiver<RegistryEvent>,
    ) {
        let period = self
            .policy
            .cooldown
            .min(Duration::from_secs(1))
            .max(Duration::from_millis(10));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut deliveries_open = true;
        let mut registry_open = true;

        info!(target: "monitor", "Compliance monitor running");
        while deliveries_open || registry_open {
            tokio::select! {
                ev = deliveries.recv(), if deliveries_open => match ev {
                    Some(ev) => self.observe(ev),
                    None => deliveries_open = false,
                },
                ev = registry.recv(), if registry_open => match ev {
                    Ok(ev) => self.observe(ComplianceEvent::Registry(ev)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "monitor", skipped = n, "Registry events skipped; monitor lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => registry_open = false,
                },
                _ = tick.tick() => self.evaluate_all(),
            }
        }
        info!(target: "monitor", "Compliance monitor stopped");
    }
}

/// Outcomes that say nothing about the agent itself are not sampled.
fn sample_of(outcome: &DeliveryOutcome) -> Option<Sample> {
    match (outcome.status, outcome.failure) {
        (DeliveryStatus::Delivered, _) => Some(Sample {
            success: true,
            latency_ms: outcome.latency_ms,
        }),
        (DeliveryStatus::Expired, _) => Some(Sample {
            success: false,
            latency_ms: None,
        }),
        (DeliveryStatus::Failed, Some(FailureReason::RetriesExhausted | FailureReason::Fatal)) => {
            Some(Sample {
                success: false,
                latency_ms: None,
            })
        }
        _ => None,
    }
}
