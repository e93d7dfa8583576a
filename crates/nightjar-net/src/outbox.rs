//! Durable store-and-forward outbox
//!
//! Events that could not reach any relay wait here across offline spans
//! and process restarts. Entries are keyed by event id (re-enqueueing
//! unions the relay lists), flushed strictly in insertion order, capped in
//! size, retries, and age, and persisted after every mutation.

use crate::config::OutboxConfig;
use crate::pool::PublishResult;
use crate::relay::epoch_ms;
use crate::store::{StateStore, StoreError};
use futures_util::future::BoxFuture;
use nightjar_core::types::Event;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// The downstream publisher the outbox drains into. The client facade
/// injects the relay pool here; tests inject mocks.
pub trait OutboxSender: Send + Sync {
    fn send(&self, event: &Event, relay_urls: &[String]) -> BoxFuture<'static, PublishResult>;
}

/// One queued event and its delivery bookkeeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuedEvent {
    pub event: Event,
    /// Relays this event should go to; unioned across enqueues
    pub relay_urls: Vec<String>,
    /// Epoch milliseconds at first enqueue
    pub queued_at: u64,
    pub attempts: u32,
    /// Epoch milliseconds of the last flush attempt
    pub last_attempt_at: Option<u64>,
}

impl Default for QueuedEvent {
    fn default() -> Self {
        Self {
            event: Event {
                id: String::new(),
                pubkey: String::new(),
                created_at: 0,
                kind: 0,
                tags: Vec::new(),
                content: String::new(),
                sig: String::new(),
            },
            relay_urls: Vec::new(),
            queued_at: 0,
            attempts: 0,
            last_attempt_at: None,
        }
    }
}

/// Persistent outbox queue. One instance exclusively owns its storage key.
pub struct Outbox {
    config: OutboxConfig,
    store: Arc<dyn StateStore>,
    sender: Arc<dyn OutboxSender>,
    queue: Mutex<Vec<QueuedEvent>>,
    /// Serializes flushes; a caller arriving mid-flush waits, then drains
    /// whatever the first pass left behind
    flush_lock: tokio::sync::Mutex<()>,
    /// Set when persistence failed twice; the queue lives on in memory
    memory_only: AtomicBool,
}

impl Outbox {
    /// Build an outbox over a store, loading and pruning any persisted
    /// queue. Malformed persisted bytes reset to an empty queue.
    pub fn new(
        config: OutboxConfig,
        store: Arc<dyn StateStore>,
        sender: Arc<dyn OutboxSender>,
    ) -> Self {
        let queue = match store.get(&config.storage_key) {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<QueuedEvent>>(&bytes) {
                Ok(queue) => queue,
                Err(err) => {
                    warn!(%err, "resetting malformed outbox state");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(%err, "failed to load outbox state");
                Vec::new()
            }
        };
        let outbox = Self {
            config,
            store,
            sender,
            queue: Mutex::new(queue),
            flush_lock: tokio::sync::Mutex::new(()),
            memory_only: AtomicBool::new(false),
        };
        if outbox.prune_expired() > 0 {
            outbox.persist();
        }
        outbox
    }

    /// Queue an event for the given relays.
    ///
    /// Idempotent by event id: a repeat enqueue unions the relay lists
    /// (insertion order, no duplicates) and does not touch the attempt
    /// counter. Overflow drops the oldest entries first.
    pub fn enqueue(&self, event: Event, relay_urls: Vec<String>) {
        {
            let mut queue = self.queue.lock();
            if let Some(existing) = queue.iter_mut().find(|q| q.event.id == event.id) {
                for url in relay_urls {
                    if !existing.relay_urls.contains(&url) {
                        existing.relay_urls.push(url);
                    }
                }
            } else {
                queue.push(QueuedEvent {
                    event,
                    relay_urls,
                    queued_at: epoch_ms(),
                    attempts: 0,
                    last_attempt_at: None,
                });
            }
            while queue.len() > self.config.max_queue_size {
                let dropped = queue.remove(0);
                warn!(event = %dropped.event.id, "outbox full, dropping oldest event");
            }
        }
        self.persist();
    }

    /// Attempt delivery of every queued event, in insertion order.
    ///
    /// Expired entries are pruned without a send. Delivered entries leave
    /// the queue; entries that exhausted `max_retries` are dropped (and
    /// logged); everything else stays for a later flush. Flushes are
    /// serialized; this is not a scheduler, the client facade calls it on
    /// connectivity transitions.
    pub async fn flush(&self) {
        let _guard = self.flush_lock.lock().await;

        let pruned = self.prune_expired();
        if pruned > 0 {
            debug!(pruned, "pruned expired outbox events");
        }

        let pending: Vec<(String, Event, Vec<String>)> = self
            .queue
            .lock()
            .iter()
            .map(|q| (q.event.id.clone(), q.event.clone(), q.relay_urls.clone()))
            .collect();

        for (id, event, relay_urls) in pending {
            // The entry may have been head-dropped by a concurrent
            // enqueue; skip silently in that case.
            let attempts = {
                let mut queue = self.queue.lock();
                let Some(entry) = queue.iter_mut().find(|q| q.event.id == id) else {
                    continue;
                };
                entry.attempts += 1;
                entry.last_attempt_at = Some(epoch_ms());
                entry.attempts
            };

            let result = self.sender.send(&event, &relay_urls).await;
            if result.success {
                self.queue.lock().retain(|q| q.event.id != id);
            } else if attempts >= self.config.max_retries {
                warn!(event = %id, attempts, "dropping outbox event after max retries");
                self.queue.lock().retain(|q| q.event.id != id);
            }
        }

        self.persist();
    }

    /// Drop entries older than `max_event_age`. Returns how many went.
    pub fn prune_expired(&self) -> usize {
        let now = epoch_ms();
        let max_age_ms = self.config.max_event_age.as_millis() as u64;
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|q| now.saturating_sub(q.queued_at) < max_age_ms);
        before - queue.len()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Snapshot of the queue in flush order.
    pub fn queued_events(&self) -> Vec<QueuedEvent> {
        self.queue.lock().clone()
    }

    /// Write the queue to storage. On failure, drop the oldest half and
    /// retry once; if that also fails, degrade to memory-only operation.
    fn persist(&self) {
        if self.memory_only.load(Ordering::Relaxed) {
            return;
        }
        match self.try_persist() {
            Ok(()) => {}
            Err(err) => {
                warn!(%err, "outbox persistence failed, dropping oldest half");
                {
                    let mut queue = self.queue.lock();
                    let half = queue.len() / 2;
                    queue.drain(..half);
                }
                if let Err(err) = self.try_persist() {
                    warn!(%err, "outbox persistence failed again, going memory-only");
                    self.memory_only.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    fn try_persist(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&*self.queue.lock())?;
        self.store.put(&self.config.storage_key, &bytes)
    }
}
