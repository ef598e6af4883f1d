use std::cmp::Reverse;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use opentelemetry::metrics::{Counter, UpDownCounter};
use opentelemetry::{global, KeyValue};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::types::{chrono_span, normalize_tags, AgentDescriptor, AgentRegistration, DiscoveryQuery, HealthState};
use crate::{Result, SwitchboardError};

/// Registry timing knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_lease: Duration,
    pub tombstone_retention: Duration,
    pub discovery_timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_lease: Duration::from_secs(40),
            tombstone_retention: Duration::from_secs(300),
            discovery_timeout: Duration::from_millis(250),
        }
    }
}

/// Change notifications published by the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// `fresh` is false for an in-place update of a live agent.
    Registered { agent_id: String, fresh: bool },
    /// `missed_before` counts whole heartbeat intervals skipped before this beat.
    Heartbeat {
        agent_id: String,
        missed_before: u32,
        deadline: DateTime<Utc>,
    },
    HeartbeatOverdue { agent_id: String, missed: u32 },
    HealthChanged {
        agent_id: String,
        from: HealthState,
        to: HealthState,
    },
    Expired { agent_id: String },
    Deregistered { agent_id: String },
    /// An expired tombstone outlived its retention and was dropped.
    Purged { agent_id: String },
}

impl RegistryEvent {
    pub fn agent_id(&self) -> &str {
        match self {
            RegistryEvent::Registered { agent_id, .. }
            | RegistryEvent::Heartbeat { agent_id, .. }
            | RegistryEvent::HeartbeatOverdue { agent_id, .. }
            | RegistryEvent::HealthChanged { agent_id, .. }
            | RegistryEvent::Expired { agent_id }
            | RegistryEvent::Deregistered { agent_id }
            | RegistryEvent::Purged { agent_id } => agent_id,
        }
    }
}

struct DirectoryMetrics {
    registrations: Counter<u64>,
    expirations: Counter<u64>,
    live_agents: UpDownCounter<i64>,
}

impl DirectoryMetrics {
    fn new() -> Self {
        let meter = global::meter("switchboard.directory");
        Self {
            registrations: meter
                .u64_counter("switchboard.directory.registrations_total")
                .with_description("Total number of accepted registrations")
                .init(),
            expirations: meter
                .u64_counter("switchboard.directory.expirations_total")
                .with_description("Total number of agents expired by the sweep")
                .init(),
            live_agents: meter
                .i64_up_down_counter("switchboard.directory.live_agents")
                .with_description("Number of live (non-expired) agents")
                .init(),
        }
    }
}

/// In-memory registry of agents, indexed by capability.
///
/// Every write to one agent happens under that agent's map entry lock, so
/// `register`, `heartbeat`, `set_health` and the expiry sweep are mutually
/// exclusive per id while unrelated ids proceed in parallel. When a write
/// also touches the capability index, the entry lock is taken first; readers
/// never hold an index guard while reading an entry.
pub struct AgentDirectory {
    config: DirectoryConfig,
    agents: DashMap<String, AgentDescriptor>,
    capability_index: DashMap<String, HashSet<String>>, // capability -> agent_ids
    in_flight: DashMap<String, usize>,                   // agent_id -> queued + in-flight
    events: broadcast::Sender<RegistryEvent>,
    metrics: DirectoryMetrics,
}

impl Default for AgentDirectory {
    fn default() -> Self {
        Self::new(DirectoryConfig::default())
    }
}

impl AgentDirectory {
    pub fn new(config: DirectoryConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            agents: DashMap::new(),
            capability_index: DashMap::new(),
            in_flight: DashMap::new(),
            events,
            metrics: DirectoryMetrics::new(),
        }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine; the monitor may not be running.
        let _ = self.events.send(event);
    }

    fn index(&self, id: &str, capabilities: &[String]) {
        for c in capabilities {
            self.capability_index
                .entry(c.clone())
                .or_default()
                .insert(id.to_string());
        }
    }

    fn unindex(&self, id: &str, capabilities: &[String]) {
        for c in capabilities {
            if let Some(mut set) = self.capability_index.get_mut(c) {
                set.remove(id);
            }
        }
        self.capability_index.retain(|_, ids| !ids.is_empty());
    }

    fn lease_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono_span(self.config.heartbeat_lease)
    }

    /// Admits a new agent or updates a live one in place.
    ///
    /// Re-registering a live id keeps its `registered_at` and health and
    /// replaces everything the agent advertises. Re-registering an expired id
    /// starts a fresh lifetime.
    #[tracing::instrument(skip(self, registration), fields(agent_id = %registration.id))]
    pub fn register(&self, registration: AgentRegistration) -> Result<AgentDescriptor> {
        registration.validate()?;
        let now = Utc::now();
        let id = registration.id.trim().to_string();
        let registration = AgentRegistration { id: id.clone(), ..registration };

        let (descriptor, fresh) = match self.agents.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                let current = slot.get_mut();
                if current.is_expired() {
                    // Tombstone: capabilities were unindexed when it expired.
                    *current = AgentDescriptor::from_registration(
                        registration,
                        now,
                        self.lease_from(now),
                    );
                    self.index(&id, &current.capabilities);
                    (current.clone(), true)
                } else {
                    let old_caps = std::mem::take(&mut current.capabilities);
                    self.unindex(&id, &old_caps);
                    current.capabilities = normalize_tags(&registration.capabilities);
                    if !registration.name.trim().is_empty() {
                        current.name = registration.name;
                    }
                    current.endpoints = registration.endpoints;
                    current.protocols = registration.protocols;
                    current.metadata = registration.metadata;
                    current.heartbeat_deadline = std::cmp::max(
                        self.lease_from(now),
                        current.heartbeat_deadline + chrono::Duration::milliseconds(1),
                    );
                    current.last_heartbeat = now;
                    self.index(&id, &current.capabilities);
                    (current.clone(), false)
                }
            }
            Entry::Vacant(slot) => {
                let descriptor =
                    AgentDescriptor::from_registration(registration, now, self.lease_from(now));
                self.index(&id, &descriptor.capabilities);
                slot.insert(descriptor.clone());
                (descriptor, true)
            }
        };

        self.metrics.registrations.add(1, &[KeyValue::new("fresh", fresh)]);
        if fresh {
            self.metrics.live_agents.add(1, &[]);
        }
        info!(target: "directory", agent_id = %id, caps = ?descriptor.capabilities, fresh, "Agent registered");
        self.emit(RegistryEvent::Registered {
            agent_id: id,
            fresh,
        });
        Ok(descriptor)
    }

    /// Extends the agent's deadline. Expired agents are not revived.
    pub fn heartbeat(&self, agent_id: &str) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let outcome = {
            let mut entry = self
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| SwitchboardError::NotFound(format!("agent {agent_id}")))?;
            if entry.is_expired() {
                None
            } else if entry.heartbeat_deadline <= now {
                // Past the deadline but not yet swept: expire now rather than revive.
                self.expire_locked(&mut entry);
                Some(Err(()))
            } else {
                let gap = (now - entry.last_heartbeat).to_std().unwrap_or_default();
                let deadline = std::cmp::max(
                    self.lease_from(now),
                    entry.heartbeat_deadline + chrono::Duration::milliseconds(1),
                );
                entry.heartbeat_deadline = deadline;
                entry.last_heartbeat = now;
                Some(Ok((deadline, self.missed_in(gap).saturating_sub(1))))
            }
        };

        match outcome {
            Some(Ok((deadline, missed_before))) => {
                debug!(target: "directory", agent_id, %deadline, "Heartbeat accepted");
                self.emit(RegistryEvent::Heartbeat {
                    agent_id: agent_id.to_string(),
                    missed_before,
                    deadline,
                });
                Ok(deadline)
            }
            Some(Err(())) => {
                self.after_expiry(agent_id);
                Err(SwitchboardError::Expired(format!(
                    "agent {agent_id} missed its heartbeat deadline; register again"
                )))
            }
            None => {
                warn!(target: "directory", agent_id, "Heartbeat from expired agent ignored");
                Err(SwitchboardError::Expired(format!(
                    "agent {agent_id} is expired; register again"
                )))
            }
        }
    }

    /// Whole heartbeat intervals contained in `gap`.
    fn missed_in(&self, gap: Duration) -> u32 {
        let interval = self.config.heartbeat_interval.as_millis().max(1);
        u32::try_from(gap.as_millis() / interval).unwrap_or(u32::MAX)
    }

    fn expire_locked(&self, descriptor: &mut AgentDescriptor) {
        descriptor.health = HealthState::Expired;
        self.unindex(&descriptor.id, &descriptor.capabilities);
    }

    fn after_expiry(&self, agent_id: &str) {
        self.metrics.expirations.add(1, &[]);
        self.metrics.live_agents.add(-1, &[]);
        info!(target: "directory", agent_id, "Agent expired");
        self.emit(RegistryEvent::Expired {
            agent_id: agent_id.to_string(),
        });
    }

    /// Capability-filtered lookup, best candidates first.
    ///
    /// Candidates come from the smallest index set among the required tags,
    /// so cost scales with the matching agents rather than the whole registry.
    /// Ranking: health, then fewest in-flight messages, then newest registration.
    /// A scan that outlives `discovery_timeout` fails with `Transient`.
    pub fn discover(&self, query: &DiscoveryQuery) -> Result<Vec<AgentDescriptor>> {
        query.validate()?;
        let deadline = Instant::now() + self.config.discovery_timeout;
        let tags = query.tags();
        let min_health = query.min_health();

        let mut smallest: Option<Vec<String>> = None;
        for tag in &tags {
            let ids: Vec<String> = match self.capability_index.get(tag) {
                Some(set) => set.iter().cloned().collect(),
                None => return Ok(Vec::new()),
            };
            if smallest.as_ref().map_or(true, |s| ids.len() < s.len()) {
                smallest = Some(ids);
            }
        }
        let candidates = smallest.unwrap_or_default();

        let mut matches: Vec<(AgentDescriptor, usize)> = Vec::new();
        for (i, id) in candidates.into_iter().enumerate() {
            if i % 64 == 63 && Instant::now() >= deadline {
                warn!(target: "directory", tags = ?tags, "Discovery timed out");
                return Err(SwitchboardError::Transient(format!(
                    "discovery for {tags:?} exceeded {}ms",
                    self.config.discovery_timeout.as_millis()
                )));
            }
            let Some(d) = self.agents.get(&id).map(|d| d.clone()) else {
                continue;
            };
            if !d.health.satisfies(min_health)
                || !tags.iter().all(|t| d.has_capability(t))
                || !query.protocol.as_deref().map_or(true, |p| d.speaks(p))
            {
                continue;
            }
            let load = self.in_flight(&d.id);
            matches.push((d, load));
        }

        matches.sort_by(|(a, load_a), (b, load_b)| {
            (a.health, *load_a, Reverse(a.registered_at), &a.id).cmp(&(
                b.health,
                *load_b,
                Reverse(b.registered_at),
                &b.id,
            ))
        });

        let mut out: Vec<AgentDescriptor> = matches.into_iter().map(|(d, _)| d).collect();
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        debug!(target: "directory", tags = ?tags, matches = out.len(), "Discovery");
        Ok(out)
    }

    /// Explicit removal, tombstone included.
    pub fn deregister(&self, agent_id: &str) -> Result<AgentDescriptor> {
        let old = match self.agents.entry(agent_id.to_string()) {
            Entry::Occupied(slot) => {
                // Unindex before the entry lock is released so a concurrent
                // re-register cannot be stripped from the index.
                if !slot.get().is_expired() {
                    self.unindex(agent_id, &slot.get().capabilities);
                    self.metrics.live_agents.add(-1, &[]);
                }
                slot.remove()
            }
            Entry::Vacant(_) => {
                return Err(SwitchboardError::NotFound(format!("agent {agent_id}")));
            }
        };
        // Copies still queued for the agent release their own counts.
        self.in_flight.remove_if(agent_id, |_, count| *count == 0);
        info!(target: "directory", agent_id, "Agent deregistered");
        self.emit(RegistryEvent::Deregistered {
            agent_id: agent_id.to_string(),
        });
        Ok(old)
    }

    /// Requested by the compliance monitor. Returns whether the state changed.
    ///
    /// Expiry is decided only by the heartbeat sweep, and an expired agent
    /// keeps that state until it registers again.
    pub fn set_health(&self, agent_id: &str, state: HealthState) -> Result<bool> {
        if state == HealthState::Expired {
            return Err(SwitchboardError::Validation(
                "expiry is decided by the heartbeat sweep".into(),
            ));
        }
        let from = {
            let mut entry = self
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| SwitchboardError::NotFound(format!("agent {agent_id}")))?;
            if entry.is_expired() {
                return Err(SwitchboardError::Expired(format!("agent {agent_id}")));
            }
            if entry.health == state {
                return Ok(false);
            }
            std::mem::replace(&mut entry.health, state)
        };
        info!(target: "directory", agent_id, from = from.as_str(), to = state.as_str(), "Health changed");
        self.emit(RegistryEvent::HealthChanged {
            agent_id: agent_id.to_string(),
            from,
            to: state,
        });
        Ok(true)
    }

    /// Expires agents past their deadline, purges old tombstones and reports
    /// overdue heartbeats. Returns the ids expired by this pass.
    pub fn sweep(&self) -> Vec<String> {
        let now = Utc::now();
        let retention = chrono_span(self.config.tombstone_retention);

        let mut due = Vec::new();
        let mut overdue = Vec::new();
        let mut stale = Vec::new();
        for entry in self.agents.iter() {
            let d = entry.value();
            if d.is_expired() {
                if d.heartbeat_deadline + retention <= now {
                    stale.push(d.id.clone());
                }
            } else if d.heartbeat_deadline <= now {
                due.push(d.id.clone());
            } else {
                let gap = (now - d.last_heartbeat).to_std().unwrap_or_default();
                let missed = self.missed_in(gap);
                if missed > 0 {
                    overdue.push((d.id.clone(), missed));
                }
            }
        }

        let mut expired = Vec::new();
        for id in due {
            // Re-check under the entry lock: a heartbeat may have landed since the scan.
            let did_expire = match self.agents.get_mut(&id) {
                Some(mut entry) if !entry.is_expired() && entry.heartbeat_deadline <= now => {
                    self.expire_locked(&mut entry);
                    true
                }
                _ => false,
            };
            if did_expire {
                self.after_expiry(&id);
                expired.push(id);
            }
        }

        for id in stale {
            let removed = self
                .agents
                .remove_if(&id, |_, d| d.is_expired() && d.heartbeat_deadline + retention <= now);
            if removed.is_some() {
                self.in_flight.remove_if(&id, |_, count| *count == 0);
                debug!(target: "directory", agent_id = %id, "Tombstone purged");
                self.emit(RegistryEvent::Purged { agent_id: id });
            }
        }

        for (agent_id, missed) in overdue {
            self.emit(RegistryEvent::HeartbeatOverdue { agent_id, missed });
        }
        expired
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.agents.get(agent_id).map(|e| e.clone())
    }

    /// The descriptor of a live agent, or `NotFound` / `Expired`.
    pub fn live(&self, agent_id: &str) -> Result<AgentDescriptor> {
        match self.get(agent_id) {
            Some(d) if d.is_expired() => {
                Err(SwitchboardError::Expired(format!("agent {agent_id}")))
            }
            Some(d) => Ok(d),
            None => Err(SwitchboardError::NotFound(format!("agent {agent_id}"))),
        }
    }

    pub fn by_capability(&self, capability: &str) -> Vec<String> {
        self.capability_index
            .get(capability)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every descriptor, tombstones included.
    pub fn all(&self) -> Vec<AgentDescriptor> {
        self.agents.iter().map(|e| e.clone()).collect()
    }

    pub fn live_agents(&self) -> Vec<AgentDescriptor> {
        self.agents
            .iter()
            .filter(|e| !e.is_expired())
            .map(|e| e.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Router bookkeeping for the load-aware ranking.
    pub fn adjust_in_flight(&self, agent_id: &str, delta: isize) {
        let drained = {
            let mut count = self.in_flight.entry(agent_id.to_string()).or_insert(0);
            *count = count.saturating_add_signed(delta);
            *count == 0
        };
        // Counters of departed agents go away once their last copy finishes.
        if drained && !self.agents.contains_key(agent_id) {
            self.in_flight.remove_if(agent_id, |_, count| *count == 0);
        }
    }

    /// Agents with a load counter entry, departed ones still draining included.
    pub fn tracked_loads(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight(&self, agent_id: &str) -> usize {
        self.in_flight.get(agent_id).map(|c| *c).unwrap_or(0)
    }

    /// Re-admits persisted descriptors whose deadline has not passed.
    pub fn restore(&self, descriptors: Vec<AgentDescriptor>) -> usize {
        let now = Utc::now();
        let mut restored = 0;
        for d in descriptors {
            if d.is_expired() || d.heartbeat_deadline <= now {
                debug!(target: "directory", agent_id = %d.id, "Skipping expired agent from snapshot");
                continue;
            }
            if let Entry::Vacant(slot) = self.agents.entry(d.id.clone()) {
                self.index(&d.id, &d.capabilities);
                self.metrics.live_agents.add(1, &[]);
                slot.insert(d);
                restored += 1;
            }
        }
        restored
    }
}
