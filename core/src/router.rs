// Message Router implementation
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};
use opentelemetry::{global, KeyValue};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::directory::AgentDirectory;
use crate::envelope::{MessageEnvelope, MessageType, Priority, Recipient};
use crate::monitor::ComplianceEvent;
use crate::queue::{Dequeued, QueuedEnvelope, RecipientQueue};
use crate::transport::{DeliveryTransport, ResilientClient, RetryPolicy, TransportError};
use crate::{Result, SwitchboardError};

#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    /// Per-recipient queue bound.
    pub queue_capacity: usize,
    pub workers_per_recipient: usize,
    /// Terminal records kept for `status` lookups.
    pub record_retention: usize,
    pub retry: RetryPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            workers_per_recipient: 1,
            record_retention: 4096,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    InFlight,
    Delivered,
    Expired,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered | DeliveryStatus::Expired | DeliveryStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::InFlight => "in_flight",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Expired => "expired",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// Why a copy ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Transient failures outlasted the retry policy.
    RetriesExhausted,
    Fatal,
    Offline,
    /// Recipient deregistered or expired before delivery.
    RecipientGone,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::RetriesExhausted => "retries_exhausted",
            FailureReason::Fatal => "fatal",
            FailureReason::Offline => "offline",
            FailureReason::RecipientGone => "recipient_gone",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

/// Lifecycle of one envelope copy addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub delivery_id: String,
    pub message_id: String,
    pub recipient: String,
    pub priority: Priority,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub attempt_latencies_ms: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub envelope: MessageEnvelope,
}

impl DeliveryRecord {
    fn queued(delivery_id: String, recipient: String, envelope: MessageEnvelope) -> Self {
        Self {
            delivery_id,
            message_id: envelope.message_id.clone(),
            recipient,
            priority: envelope.priority,
            status: DeliveryStatus::Queued,
            attempts: 0,
            attempt_latencies_ms: Vec::new(),
            failure: None,
            error: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            envelope,
        }
    }
}

fn delivery_id(message_id: &str, recipient: &str) -> String {
    format!("{message_id}:{recipient}")
}

/// Terminal result of one copy, as reported to handles and the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub delivery_id: String,
    pub message_id: String,
    pub recipient: String,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    /// End-to-end transport time, set only for delivered copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub finished_at: DateTime<Utc>,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }
}

/// Resolves once to the copy's terminal outcome.
#[derive(Debug)]
pub struct DeliveryHandle {
    pub delivery_id: String,
    pub recipient: String,
    rx: oneshot::Receiver<DeliveryOutcome>,
}

impl DeliveryHandle {
    /// Fails only if the router shut down first; the copy then stays
    /// non-terminal and is carried by the next snapshot.
    pub async fn outcome(self) -> Result<DeliveryOutcome> {
        self.rx.await.map_err(|_| {
            SwitchboardError::Transient(format!(
                "router stopped before {} completed",
                self.delivery_id
            ))
        })
    }
}

/// Admission result of `send`.
#[derive(Debug)]
pub struct SendReceipt {
    pub message_id: String,
    /// Recipients whose copy was enqueued.
    pub recipients: Vec<String>,
    /// Fan-out recipients whose queue was full.
    pub rejected: Vec<String>,
    /// A `Response` that completed a waiting `request`.
    pub answered_pending: bool,
    pub handles: Vec<DeliveryHandle>,
}

impl SendReceipt {
    pub async fn wait_all(self) -> Result<Vec<DeliveryOutcome>> {
        let mut outcomes = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            outcomes.push(handle.outcome().await?);
        }
        Ok(outcomes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Reply(MessageEnvelope),
    TimedOut,
}

/// Outstanding `request`; its correlation entry is dropped with it.
pub struct PendingReply {
    correlation_id: String,
    deadline: DateTime<Utc>,
    rx: oneshot::Receiver<MessageEnvelope>,
    receipt: Option<SendReceipt>,
    inner: Arc<RouterInner>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// The request's own admission receipt.
    pub fn take_receipt(&mut self) -> Option<SendReceipt> {
        self.receipt.take()
    }

    /// Waits for the correlated response until the request's TTL runs out.
    pub async fn wait(mut self) -> ReplyOutcome {
        let remaining = (self.deadline - Utc::now()).to_std().unwrap_or_default();
        match tokio::time::timeout(remaining, &mut self.rx).await {
            Ok(Ok(reply)) => ReplyOutcome::Reply(reply),
            _ => {
                debug!(target: "router", correlation_id = %self.correlation_id, "Request timed out without reply");
                ReplyOutcome::TimedOut
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.inner.pending_replies.remove(&self.correlation_id);
    }
}

struct RouterMetrics {
    admitted: Counter<u64>,
    rejected: Counter<u64>,
    delivered: Counter<u64>,
    expired: Counter<u64>,
    failed: Counter<u64>,
    unobserved: Counter<u64>,
    latency: Histogram<f64>,
    queued: UpDownCounter<i64>,
}

impl RouterMetrics {
    fn new() -> Self {
        let meter = global::meter("switchboard.router");
        Self {
            admitted: meter
                .u64_counter("switchboard.router.admitted_total")
                .with_description("Envelope copies accepted into a recipient queue")
                .init(),
            rejected: meter
                .u64_counter("switchboard.router.overload_total")
                .with_description("Envelope copies rejected by a full queue")
                .init(),
            delivered: meter
                .u64_counter("switchboard.router.delivered_total")
                .with_description("Copies delivered")
                .init(),
            expired: meter
                .u64_counter("switchboard.router.expired_total")
                .with_description("Copies whose TTL lapsed before delivery")
                .init(),
            failed: meter
                .u64_counter("switchboard.router.failed_total")
                .with_description("Copies that failed")
                .init(),
            unobserved: meter
                .u64_counter("switchboard.router.unobserved_total")
                .with_description("Outcomes not handed to the compliance monitor")
                .init(),
            latency: meter
                .f64_histogram("switchboard.router.delivery_latency_ms")
                .with_description("Transport time of delivered copies in milliseconds")
                .init(),
            queued: meter
                .i64_up_down_counter("switchboard.router.queued")
                .with_description("Copies currently queued or in flight")
                .init(),
        }
    }
}

struct RouterInner {
    config: RouterConfig,
    directory: Arc<AgentDirectory>,
    transport: Arc<dyn DeliveryTransport>,
    client: ResilientClient,
    queues: DashMap<String, Arc<RecipientQueue>>, // agent_id -> queue
    workers: Mutex<Vec<JoinHandle<()>>>,
    records: DashMap<String, DeliveryRecord>,      // delivery_id -> live record
    by_message: DashMap<String, Vec<String>>,      // message_id -> live delivery ids
    archive: Mutex<VecDeque<DeliveryRecord>>,
    waiters: DashMap<String, oneshot::Sender<DeliveryOutcome>>,
    pending_replies: DashMap<String, oneshot::Sender<MessageEnvelope>>,
    monitor: RwLock<Option<mpsc::Sender<ComplianceEvent>>>,
    metrics: RouterMetrics,
    stopped: AtomicBool,
}

/// Resolves recipients, queues per-recipient copies and drives delivery.
///
/// Each recipient owns a bounded priority queue drained by its own workers,
/// so a slow agent only ever delays its own traffic.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl MessageRouter {
    pub fn new(
        config: RouterConfig,
        directory: Arc<AgentDirectory>,
        transport: Arc<dyn DeliveryTransport>,
    ) -> Self {
        let client = ResilientClient::new(config.retry.clone());
        Self::with_client(config, directory, transport, client)
    }

    /// Uses a preconfigured client, e.g. one with a connectivity probe.
    pub fn with_client(
        config: RouterConfig,
        directory: Arc<AgentDirectory>,
        transport: Arc<dyn DeliveryTransport>,
        client: ResilientClient,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                config,
                directory,
                transport,
                client,
                queues: DashMap::new(),
                workers: Mutex::new(Vec::new()),
                records: DashMap::new(),
                by_message: DashMap::new(),
                archive: Mutex::new(VecDeque::new()),
                waiters: DashMap::new(),
                pending_replies: DashMap::new(),
                monitor: RwLock::new(None),
                metrics: RouterMetrics::new(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Feeds terminal outcomes to the compliance monitor.
    pub fn with_monitor(self, tx: mpsc::Sender<ComplianceEvent>) -> Self {
        *self.inner.monitor.write() = Some(tx);
        self
    }

    pub fn directory(&self) -> &Arc<AgentDirectory> {
        &self.inner.directory
    }

    /// Admits an envelope and enqueues one copy per resolved recipient.
    #[tracing::instrument(skip(self, envelope), fields(message_id = %envelope.message_id, from = %envelope.from))]
    pub fn send(&self, envelope: MessageEnvelope) -> Result<SendReceipt> {
        if self.inner.stopped.load(AtomicOrdering::Acquire) {
            return Err(SwitchboardError::Overload("router is shut down".into()));
        }
        envelope.validate()?;

        let answered_pending = envelope.message_type == MessageType::Response
            && self.inner.complete_pending(&envelope);

        let recipients = match self.resolve(&envelope) {
            Ok(r) => r,
            Err(SwitchboardError::NotFound(reason)) if answered_pending => {
                debug!(target: "router", %reason, "Response answered a pending request; no deliverable recipient");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let message_id = envelope.message_id.clone();
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let mut handles = Vec::new();
        let mut last_overload = None;

        for recipient in recipients {
            match self.enqueue(recipient.clone(), envelope.clone()) {
                Ok(handle) => {
                    accepted.push(recipient);
                    handles.push(handle);
                }
                Err(SwitchboardError::Overload(reason)) => {
                    warn!(target: "router", %message_id, recipient = %recipient, "Recipient queue full");
                    rejected.push(recipient);
                    last_overload = Some(reason);
                }
                Err(e) => return Err(e),
            }
        }

        if accepted.is_empty() {
            if let Some(reason) = last_overload {
                return Err(SwitchboardError::Overload(reason));
            }
        }

        info!(target: "router", %message_id, recipients = ?accepted, rejected = rejected.len(), "Envelope admitted");
        Ok(SendReceipt {
            message_id,
            recipients: accepted,
            rejected,
            answered_pending,
            handles,
        })
    }

    /// Sends a `Request` and returns a handle that waits for its correlated reply.
    pub fn request(&self, envelope: MessageEnvelope) -> Result<PendingReply> {
        if envelope.message_type != MessageType::Request {
            return Err(SwitchboardError::Validation(format!(
                "message {} is not a request",
                envelope.message_id
            )));
        }
        let correlation_id = envelope.message_id.clone();
        let deadline = envelope.expires_at();
        let (tx, rx) = oneshot::channel();
        match self.inner.pending_replies.entry(correlation_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SwitchboardError::Validation(format!(
                    "request {correlation_id} is already pending"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        let mut pending = PendingReply {
            correlation_id,
            deadline,
            rx,
            receipt: None,
            inner: Arc::clone(&self.inner),
        };
        // On error the pending entry is dropped with `pending`.
        pending.receipt = Some(self.send(envelope)?);
        Ok(pending)
    }

    fn resolve(&self, envelope: &MessageEnvelope) -> Result<Vec<String>> {
        match &envelope.to {
            Recipient::Agent(id) => match self.inner.directory.live(id) {
                Ok(d) => Ok(vec![d.id]),
                Err(SwitchboardError::Expired(_)) => Err(SwitchboardError::NotFound(format!(
                    "agent {id} is expired"
                ))),
                Err(e) => Err(e),
            },
            Recipient::Capability(query) => {
                let unbounded = crate::types::DiscoveryQuery {
                    limit: None,
                    ..query.clone()
                };
                let mut ids: Vec<String> = self
                    .inner
                    .directory
                    .discover(&unbounded)?
                    .into_iter()
                    .map(|d| d.id)
                    .filter(|id| id != &envelope.from)
                    .collect();
                if ids.is_empty() {
                    return Err(SwitchboardError::NotFound(format!(
                        "no agent offers {:?}",
                        query.tags()
                    )));
                }
                let keep = if envelope.message_type.fans_out() {
                    query.limit.unwrap_or(usize::MAX)
                } else {
                    1
                };
                ids.truncate(keep.max(1));
                Ok(ids)
            }
        }
    }

    fn enqueue(&self, recipient: String, envelope: MessageEnvelope) -> Result<DeliveryHandle> {
        let id = delivery_id(&envelope.message_id, &recipient);
        let (tx, rx) = oneshot::channel();
        let record = DeliveryRecord::queued(id.clone(), recipient.clone(), envelope);
        self.admit(record, Some(tx))?;
        Ok(DeliveryHandle {
            delivery_id: id,
            recipient,
            rx,
        })
    }

    fn admit(
        &self,
        record: DeliveryRecord,
        waiter: Option<oneshot::Sender<DeliveryOutcome>>,
    ) -> Result<()> {
        let inner = &self.inner;
        let id = record.delivery_id.clone();
        let recipient = record.recipient.clone();
        let envelope = record.envelope.clone();

        match inner.records.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SwitchboardError::Validation(format!(
                    "message {} is already queued for {recipient}",
                    record.message_id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
        if let Some(tx) = waiter {
            inner.waiters.insert(id.clone(), tx);
        }
        inner
            .by_message
            .entry(envelope.message_id.clone())
            .or_default()
            .push(id.clone());

        // Count the copy before a worker can see it; `finish` releases it.
        inner.directory.adjust_in_flight(&recipient, 1);
        inner.metrics.queued.add(1, &[]);
        let queue = self.queue_for(&recipient);
        if let Err(e) = queue.push(id.clone(), envelope) {
            inner.forget_live(&id);
            inner.directory.adjust_in_flight(&recipient, -1);
            inner.metrics.queued.add(-1, &[]);
            inner
                .metrics
                .rejected
                .add(1, &[KeyValue::new("recipient", recipient)]);
            return Err(e);
        }
        inner.metrics.admitted.add(1, &[]);
        Ok(())
    }

    fn queue_for(&self, recipient: &str) -> Arc<RecipientQueue> {
        if let Some(q) = self.inner.queues.get(recipient) {
            return Arc::clone(&q);
        }
        let queue = self
            .inner
            .queues
            .entry(recipient.to_string())
            .or_insert_with(|| {
                let queue = Arc::new(RecipientQueue::new(recipient, self.inner.config.queue_capacity));
                let mut workers = self.inner.workers.lock();
                for _ in 0..self.inner.config.workers_per_recipient.max(1) {
                    workers.push(tokio::spawn(worker_loop(
                        Arc::clone(&self.inner),
                        Arc::clone(&queue),
                    )));
                }
                debug!(target: "router", recipient, "Spawned recipient workers");
                queue
            });
        Arc::clone(&queue)
    }

    /// Pulls still-queued copies of a message. Copies already in flight are
    /// left alone. Returns the cancelled delivery ids.
    pub fn cancel(&self, message_id: &str) -> Result<Vec<String>> {
        let live = self
            .inner
            .by_message
            .get(message_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        if live.is_empty() && !self.inner.archived(message_id) {
            return Err(SwitchboardError::NotFound(format!("message {message_id}")));
        }

        let mut cancelled = Vec::new();
        for id in live {
            let Some(recipient) = self.inner.records.get(&id).map(|r| r.recipient.clone()) else {
                continue;
            };
            let removed = self
                .inner
                .queues
                .get(&recipient)
                .and_then(|q| q.remove(&id));
            if removed.is_some() {
                self.inner.finish(
                    &id,
                    Completion::failed(FailureReason::Cancelled, "cancelled".into()),
                );
                cancelled.push(id);
            }
        }
        info!(target: "router", message_id, cancelled = cancelled.len(), "Cancel requested");
        Ok(cancelled)
    }

    /// Live and archived records for a message.
    pub fn status(&self, message_id: &str) -> Result<Vec<DeliveryRecord>> {
        let mut out: Vec<DeliveryRecord> = self
            .inner
            .by_message
            .get(message_id)
            .map(|ids| ids.clone())
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.inner.records.get(id).map(|r| r.clone()))
            .collect();
        out.extend(
            self.inner
                .archive
                .lock()
                .iter()
                .filter(|r| r.message_id == message_id)
                .cloned(),
        );
        if out.is_empty() {
            return Err(SwitchboardError::NotFound(format!("message {message_id}")));
        }
        out.sort_by(|a, b| a.recipient.cmp(&b.recipient));
        Ok(out)
    }

    /// Every non-terminal record.
    pub fn in_flight_records(&self) -> Vec<DeliveryRecord> {
        self.inner.records.iter().map(|r| r.clone()).collect()
    }

    /// Reports queued copies whose TTL already lapsed, without waiting for a
    /// worker to reach them behind a slow delivery.
    pub fn expire_queued(&self) -> usize {
        let now = Utc::now();
        let mut expired = 0;
        for queue in self.inner.queues.iter() {
            for q in queue.drain_expired(now) {
                self.inner
                    .finish(&q.delivery_id, Completion::expired("ttl lapsed while queued"));
                expired += 1;
            }
        }
        expired
    }

    /// Closes and drops the queues of recipients that left the registry or
    /// expired, once nothing is waiting in them. Returns the number dropped.
    pub fn reap_departed(&self) -> usize {
        let inner = &self.inner;
        let departed = |id: &str| inner.directory.get(id).map_or(true, |d| d.is_expired());
        let candidates: Vec<String> = inner
            .queues
            .iter()
            .filter(|q| q.is_empty())
            .map(|q| q.key().clone())
            .collect();

        let mut reaped = 0;
        for id in candidates {
            if !departed(&id) {
                continue;
            }
            let Some((_, queue)) = inner.queues.remove_if(&id, |_, q| q.is_empty()) else {
                continue;
            };
            // A push may have slipped in after the emptiness check.
            for q in queue.close_and_drain() {
                inner.finish(
                    &q.delivery_id,
                    Completion::failed(FailureReason::RecipientGone, format!("agent {id} left")),
                );
            }
            reaped += 1;
            debug!(target: "router", recipient = %id, "Dropped queue of departed recipient");
        }
        if reaped > 0 {
            inner.workers.lock().retain(|w| !w.is_finished());
        }
        reaped
    }

    /// Recipients that currently own a queue.
    pub fn active_queues(&self) -> usize {
        self.inner.queues.len()
    }

    pub fn queue_depth(&self, recipient: &str) -> usize {
        self.inner.queues.get(recipient).map(|q| q.len()).unwrap_or(0)
    }

    /// Re-enqueues persisted records. Expired ones are archived as `Expired`.
    /// Returns `(requeued, dropped)`.
    pub fn restore(&self, records: Vec<DeliveryRecord>) -> (usize, usize) {
        let now = Utc::now();
        let mut requeued = 0;
        let mut dropped = 0;
        for mut record in records {
            if record.status.is_terminal() {
                continue;
            }
            record.status = DeliveryStatus::Queued;
            record.started_at = None;
            if record.envelope.is_expired_at(now) {
                let id = record.delivery_id.clone();
                self.inner.directory.adjust_in_flight(&record.recipient, 1);
                self.inner.metrics.queued.add(1, &[]);
                self.inner.records.insert(id.clone(), record);
                self.inner.finish(&id, Completion::expired("ttl lapsed before restart"));
                dropped += 1;
                continue;
            }
            let id = record.delivery_id.clone();
            match self.admit(record, None) {
                Ok(()) => requeued += 1,
                Err(e) => {
                    warn!(target: "router", delivery_id = %id, error = %e, "Could not requeue restored record");
                    dropped += 1;
                }
            }
        }
        (requeued, dropped)
    }

    /// Closes every queue and stops the workers. Queued copies stay recorded.
    pub fn shutdown(&self) {
        self.inner.stopped.store(true, AtomicOrdering::Release);
        for q in self.inner.queues.iter() {
            q.close();
        }
        for worker in self.inner.workers.lock().drain(..) {
            worker.abort();
        }
        info!(target: "router", "Router stopped");
    }
}

/// How a copy finished.
struct Completion {
    status: DeliveryStatus,
    failure: Option<FailureReason>,
    error: Option<String>,
    attempts: u32,
    latencies: Vec<Duration>,
    elapsed: Option<Duration>,
}

impl Completion {
    fn expired(reason: &str) -> Self {
        Self {
            status: DeliveryStatus::Expired,
            failure: None,
            error: Some(reason.to_string()),
            attempts: 0,
            latencies: Vec::new(),
            elapsed: None,
        }
    }

    fn failed(reason: FailureReason, error: String) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            failure: Some(reason),
            error: Some(error),
            attempts: 0,
            latencies: Vec::new(),
            elapsed: None,
        }
    }
}

impl RouterInner {
    fn complete_pending(&self, response: &MessageEnvelope) -> bool {
        let Some(cid) = response.correlation_id.as_deref() else {
            return false;
        };
        match self.pending_replies.remove(cid) {
            Some((_, tx)) => tx.send(response.clone()).is_ok(),
            None => false,
        }
    }

    fn archived(&self, message_id: &str) -> bool {
        self.archive.lock().iter().any(|r| r.message_id == message_id)
    }

    fn forget_live(&self, delivery_id: &str) -> Option<DeliveryRecord> {
        let (_, record) = self.records.remove(delivery_id)?;
        self.waiters.remove(delivery_id);
        let now_empty = match self.by_message.get_mut(&record.message_id) {
            Some(mut ids) => {
                ids.retain(|i| i != delivery_id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_message.remove_if(&record.message_id, |_, ids| ids.is_empty());
        }
        Some(record)
    }

    fn mark_in_flight(&self, delivery_id: &str) -> bool {
        match self.records.get_mut(delivery_id) {
            Some(mut r) => {
                r.status = DeliveryStatus::InFlight;
                r.started_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Moves a live record to the archive and reports its outcome exactly once.
    fn finish(&self, delivery_id: &str, completion: Completion) {
        let waiter = self.waiters.remove(delivery_id).map(|(_, tx)| tx);
        let Some(mut record) = self.forget_live(delivery_id) else {
            return;
        };
        let now = Utc::now();
        record.status = completion.status;
        record.failure = completion.failure;
        record.error = completion.error;
        record.attempts += completion.attempts;
        record
            .attempt_latencies_ms
            .extend(completion.latencies.iter().map(|d| d.as_millis() as u64));
        record.finished_at = Some(now);

        self.directory.adjust_in_flight(&record.recipient, -1);
        self.metrics.queued.add(-1, &[]);

        let latency_ms = match completion.elapsed {
            Some(e) if record.status == DeliveryStatus::Delivered => Some(e.as_millis() as u64),
            _ => None,
        };
        let outcome = DeliveryOutcome {
            delivery_id: record.delivery_id.clone(),
            message_id: record.message_id.clone(),
            recipient: record.recipient.clone(),
            status: record.status,
            failure: record.failure,
            error: record.error.clone(),
            attempts: record.attempts,
            latency_ms,
            finished_at: now,
        };

        let labels = [KeyValue::new("recipient", record.recipient.clone())];
        match record.status {
            DeliveryStatus::Delivered => {
                self.metrics.delivered.add(1, &labels);
                if let Some(ms) = latency_ms {
                    self.metrics.latency.record(ms as f64, &labels);
                }
                debug!(target: "router", delivery_id, attempts = record.attempts, latency_ms, "Delivered");
            }
            DeliveryStatus::Expired => {
                self.metrics.expired.add(1, &labels);
                info!(target: "router", delivery_id, "Copy expired before delivery");
            }
            _ => {
                let reason = record.failure.map(FailureReason::as_str).unwrap_or("unknown");
                self.metrics
                    .failed
                    .add(1, &[KeyValue::new("reason", reason)]);
                warn!(target: "router", delivery_id, reason, error = ?record.error, "Delivery failed");
            }
        }

        {
            let mut archive = self.archive.lock();
            archive.push_back(record);
            while archive.len() > self.config.record_retention {
                archive.pop_front();
            }
        }

        if let Some(tx) = waiter {
            let _ = tx.send(outcome.clone());
        }
        self.observe(outcome);
    }

    fn observe(&self, outcome: DeliveryOutcome) {
        let guard = self.monitor.read();
        let Some(tx) = guard.as_ref() else {
            return;
        };
        if let Err(e) = tx.try_send(ComplianceEvent::Delivery(outcome)) {
            self.metrics.unobserved.add(1, &[]);
            debug!(target: "router", error = %e, "Compliance monitor not keeping up; outcome skipped");
        }
    }

    async fn deliver(&self, queued: QueuedEnvelope) {
        let id = queued.delivery_id.clone();
        if !self.mark_in_flight(&id) {
            return;
        }

        let descriptor = match self.directory.live(&queued.recipient) {
            Ok(d) => d,
            Err(e) => {
                self.finish(&id, Completion::failed(FailureReason::RecipientGone, e.to_string()));
                return;
            }
        };
        let envelope = Arc::new(queued.envelope);
        let Some(budget) = envelope.remaining(Utc::now()) else {
            self.finish(&id, Completion::expired("ttl lapsed before first attempt"));
            return;
        };

        let endpoints = Arc::new(descriptor.endpoints);
        let transport = Arc::clone(&self.transport);
        let call = self
            .client
            .call_within(Some(budget), |attempt| {
                let endpoints = Arc::clone(&endpoints);
                let transport = Arc::clone(&transport);
                let envelope = Arc::clone(&envelope);
                async move {
                    if envelope.is_expired_at(Utc::now()) {
                        return Err(TransportError::Fatal("ttl lapsed".into()));
                    }
                    if endpoints.is_empty() {
                        return Err(TransportError::Fatal("recipient has no endpoints".into()));
                    }
                    // Rotate so a retry does not hammer the endpoint that just failed.
                    let endpoint = &endpoints[attempt as usize % endpoints.len()];
                    transport.deliver(endpoint, &envelope, attempt).await
                }
            })
            .await;

        let mut completion = match &call.result {
            Ok(()) => Completion {
                status: DeliveryStatus::Delivered,
                failure: None,
                error: None,
                attempts: 0,
                latencies: Vec::new(),
                elapsed: Some(call.elapsed),
            },
            Err(_) if envelope.is_expired_at(Utc::now()) => {
                Completion::expired("ttl lapsed during delivery")
            }
            Err(TransportError::Transient(e)) => {
                Completion::failed(FailureReason::RetriesExhausted, e.clone())
            }
            Err(TransportError::Fatal(e)) => Completion::failed(FailureReason::Fatal, e.clone()),
            Err(TransportError::Offline(e)) => {
                Completion::failed(FailureReason::Offline, e.clone())
            }
        };
        completion.attempts = call.attempts;
        completion.latencies = call.attempt_latencies;
        self.finish(&id, completion);
    }
}

async fn worker_loop(inner: Arc<RouterInner>, queue: Arc<RecipientQueue>) {
    while let Some(item) = queue.next().await {
        match item {
            Dequeued::Expired(q) => {
                inner.finish(&q.delivery_id, Completion::expired("ttl lapsed while queued"))
            }
            Dequeued::Deliver(q) => inner.deliver(q).await,
        }
    }
    debug!(target: "router", recipient = queue.agent_id(), "Recipient worker exiting");
}
