//! Bounded per-recipient priority queue.
//!
//! Entries pop highest priority first and FIFO within a priority. A full
//! queue rejects the push instead of evicting anything, so every admitted
//! envelope reaches a terminal state through the worker that drains it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::envelope::{MessageEnvelope, Priority};
use crate::{Result, SwitchboardError};

/// One delivery copy waiting in a recipient's queue.
#[derive(Debug, Clone)]
pub struct QueuedEnvelope {
    pub delivery_id: String,
    pub recipient: String,
    pub envelope: MessageEnvelope,
    pub(crate) seq: u64,
}

impl QueuedEnvelope {
    pub fn priority(&self) -> Priority {
        self.envelope.priority
    }
}

/// What a worker gets back from the queue.
#[derive(Debug)]
pub enum Dequeued {
    Deliver(QueuedEnvelope),
    /// TTL lapsed while the copy was waiting.
    Expired(QueuedEnvelope),
}

// Max heap by priority, then by lower sequence (earlier admission).
#[derive(Debug)]
struct HeapEntry(QueuedEnvelope);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority() == other.0.priority() && self.0.seq == other.0.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.0.priority().cmp(&other.0.priority()) {
            Ordering::Equal => other.0.seq.cmp(&self.0.seq),
            other => other,
        }
    }
}

pub struct RecipientQueue {
    agent_id: String,
    capacity: usize,
    heap: Mutex<BinaryHeap<HeapEntry>>,
    sequence: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl RecipientQueue {
    pub fn new(agent_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            agent_id: agent_id.into(),
            capacity,
            heap: Mutex::new(BinaryHeap::with_capacity(capacity.min(64))),
            sequence: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Admits a copy or fails with `Overload` when the queue is full.
    pub fn push(&self, delivery_id: String, envelope: MessageEnvelope) -> Result<()> {
        {
            let mut heap = self.heap.lock();
            // Checked under the heap lock so nothing lands after `close_and_drain`.
            if self.closed.load(AtomicOrdering::Acquire) {
                return Err(SwitchboardError::Overload(format!(
                    "queue for {} is closed",
                    self.agent_id
                )));
            }
            if heap.len() >= self.capacity {
                return Err(SwitchboardError::Overload(format!(
                    "queue for {} is full ({} entries)",
                    self.agent_id, self.capacity
                )));
            }
            let seq = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
            heap.push(HeapEntry(QueuedEnvelope {
                delivery_id,
                recipient: self.agent_id.clone(),
                envelope,
                seq,
            }));
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Non-blocking pop. Expired heads are handed back as `Expired` so the
    /// caller can record them.
    pub fn pop(&self, now: DateTime<Utc>) -> Option<Dequeued> {
        let entry = self.heap.lock().pop()?;
        let queued = entry.0;
        if queued.envelope.is_expired_at(now) {
            Some(Dequeued::Expired(queued))
        } else {
            Some(Dequeued::Deliver(queued))
        }
    }

    /// Waits for the next entry. Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<Dequeued> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(AtomicOrdering::Acquire) {
                return None;
            }
            if let Some(item) = self.pop(Utc::now()) {
                return Some(item);
            }
            notified.await;
        }
    }

    /// Pulls a still-queued copy out, e.g. on cancellation.
    pub fn remove(&self, delivery_id: &str) -> Option<QueuedEnvelope> {
        let mut heap = self.heap.lock();
        let mut removed = None;
        heap.retain(|e| {
            if removed.is_none() && e.0.delivery_id == delivery_id {
                removed = Some(e.0.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drains every expired entry without waiting for a worker to reach it.
    pub fn drain_expired(&self, now: DateTime<Utc>) -> Vec<QueuedEnvelope> {
        let mut heap = self.heap.lock();
        let mut expired = Vec::new();
        heap.retain(|e| {
            if e.0.envelope.is_expired_at(now) {
                expired.push(e.0.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        self.notify.notify_waiters();
    }

    /// Closes the queue and hands back whatever was still waiting.
    pub fn close_and_drain(&self) -> Vec<QueuedEnvelope> {
        let drained: Vec<QueuedEnvelope> = {
            let mut heap = self.heap.lock();
            self.closed.store(true, AtomicOrdering::Release);
            heap.drain().map(|e| e.0).collect()
        };
        self.notify.notify_waiters();
        drained
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{MessageType, Recipient};

    fn env(priority: Priority, ttl: f64) -> MessageEnvelope {
        MessageEnvelope::new("sender", Recipient::agent("r"), MessageType::Event, ttl)
            .with_priority(priority)
    }

    fn id_of(d: Option<Dequeued>) -> String {
        match d {
            Some(Dequeued::Deliver(q)) | Some(Dequeued::Expired(q)) => q.delivery_id,
            None => String::new(),
        }
    }

    #[test]
    fn higher_priority_pops_first_then_fifo() {
        let q = RecipientQueue::new("r", 8);
        q.push("low".into(), env(Priority::Low, 10.0)).unwrap();
        q.push("n1".into(), env(Priority::Normal, 10.0)).unwrap();
        q.push("crit".into(), env(Priority::Critical, 10.0)).unwrap();
        q.push("n2".into(), env(Priority::Normal, 10.0)).unwrap();

        let now = Utc::now();
        let order: Vec<String> = (0..4).map(|_| id_of(q.pop(now))).collect();
        assert_eq!(order, vec!["crit", "n1", "n2", "low"]);
    }

    #[test]
    fn full_queue_rejects_without_evicting() {
        let q = RecipientQueue::new("r", 2);
        q.push("a".into(), env(Priority::Low, 10.0)).unwrap();
        q.push("b".into(), env(Priority::Low, 10.0)).unwrap();
        let err = q.push("c".into(), env(Priority::Critical, 10.0)).unwrap_err();
        assert!(matches!(err, SwitchboardError::Overload(_)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn expired_heads_are_reported() {
        let q = RecipientQueue::new("r", 4);
        let mut stale = env(Priority::High, 1.0);
        stale.created_at = Utc::now() - chrono::Duration::seconds(2);
        q.push("stale".into(), stale).unwrap();
        assert!(matches!(q.pop(Utc::now()), Some(Dequeued::Expired(_))));
    }

    #[test]
    fn drain_expired_leaves_live_entries() {
        let q = RecipientQueue::new("r", 4);
        let mut stale = env(Priority::Low, 1.0);
        stale.created_at = Utc::now() - chrono::Duration::seconds(2);
        q.push("stale".into(), stale).unwrap();
        q.push("fresh".into(), env(Priority::Low, 10.0)).unwrap();

        let drained = q.drain_expired(Utc::now());
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].delivery_id, "stale");
        assert_eq!(id_of(q.pop(Utc::now())), "fresh");
    }

    #[test]
    fn remove_takes_only_the_named_copy() {
        let q = RecipientQueue::new("r", 4);
        q.push("a".into(), env(Priority::Normal, 10.0)).unwrap();
        q.push("b".into(), env(Priority::Normal, 10.0)).unwrap();
        assert_eq!(q.remove("a").map(|e| e.delivery_id).as_deref(), Some("a"));
        assert!(q.remove("a").is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn close_and_drain_hands_back_waiting_copies() {
        let q = RecipientQueue::new("r", 4);
        q.push("a".into(), env(Priority::Normal, 10.0)).unwrap();
        q.push("b".into(), env(Priority::High, 10.0)).unwrap();

        let mut drained: Vec<String> = q
            .close_and_drain()
            .into_iter()
            .map(|e| e.delivery_id)
            .collect();
        drained.sort();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(q.is_empty());
        assert!(matches!(
            q.push("c".into(), env(Priority::Normal, 10.0)),
            Err(SwitchboardError::Overload(_))
        ));
    }

    #[tokio::test]
    async fn next_returns_none_after_close() {
        let q = std::sync::Arc::new(RecipientQueue::new("r", 4));
        let waiter = {
            let q = std::sync::Arc::clone(&q);
            tokio::spawn(async move { q.next().await.is_none() })
        };
        tokio::task::yield_now().await;
        q.close();
        assert!(waiter.await.unwrap());
    }
}
