//! Relay pool and message router
//!
//! Owns one [`RelayState`] and at most one actor per relay URL, fans
//! publishes out across the best-scoring connected relays, fans
//! subscription traffic in with cross-relay dedup, and persists stats,
//! lists, and the user location across restarts.

use crate::config::PoolConfig;
use crate::defaults;
use crate::geo::{haversine_km, Geolocation};
use crate::relay::{
    epoch_ms, run_relay, ConnectionState, RelayCommand, RelayEvent, RelayState, RelayStats,
};
use crate::store::StateStore;
use crate::wire::{ClientMessage, RelayMessage};
use nightjar_core::types::{Event, Filter};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Storage key for the persisted pool document.
const RELAY_STATE_KEY: &str = "relay_state";
/// Actor command channel depth.
const COMMAND_BUFFER: usize = 64;
/// Pool event channel depth.
const EVENT_BUFFER: usize = 1_024;

// =============================================================================
// RESULTS
// =============================================================================

/// Outcome of one relay's leg of a publish.
#[derive(Clone, Debug)]
pub struct RelayPublishOutcome {
    pub accepted: bool,
    /// Relay OK message, or the failure reason (`"timeout"`, transport error)
    pub message: String,
    pub latency_ms: f64,
}

/// Aggregate publish outcome. Never an error: per-relay failures are data.
#[derive(Clone, Debug, Default)]
pub struct PublishResult {
    pub event_id: String,
    pub relay_results: HashMap<String, RelayPublishOutcome>,
    /// True when at least one relay accepted the event
    pub success: bool,
}

/// Routing record kept for the last `max_routing_results` publishes.
#[derive(Clone, Debug)]
pub struct MessageRoutingResult {
    pub event_id: String,
    pub attempted: Vec<String>,
    pub succeeded: Vec<String>,
    pub failed: HashMap<String, String>,
    /// Epoch milliseconds
    pub timestamp: u64,
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

/// Called for every deduplicated event: `(event, source_relay_url)`.
pub type EventCallback = Box<dyn Fn(&Event, &str) + Send + Sync>;
/// Called once when the pool first reports end-of-stored-events.
pub type EoseCallback = Box<dyn FnOnce() + Send>;
/// Called when a relay closes the subscription server-side.
pub type CloseCallback = Box<dyn FnOnce(&str) + Send>;

/// Optional subscription callbacks.
#[derive(Default)]
pub struct SubscriptionOptions {
    pub on_eose: Option<EoseCallback>,
    pub on_close: Option<CloseCallback>,
}

struct SeenSet {
    set: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl SeenSet {
    fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Insert an id; returns false when it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if !self.set.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

struct SubscriptionEntry {
    id: String,
    filters: Vec<Filter>,
    target_relays: Vec<String>,
    on_event: EventCallback,
    on_eose: Mutex<Option<EoseCallback>>,
    on_close: Mutex<Option<CloseCallback>>,
    seen: Mutex<SeenSet>,
}

/// Handle for an active subscription; `close` tears down the per-relay
/// receivers and purges the dedup set.
pub struct SubscriptionHandle {
    id: String,
    inner: Weak<PoolInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn close(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(&self.id);
        }
    }
}

/// Cross-relay index of which relays delivered which event.
struct SeenIndex {
    relays_by_event: HashMap<String, HashSet<String>>,
    order: VecDeque<String>,
    cap: usize,
}

impl SeenIndex {
    fn new(cap: usize) -> Self {
        Self {
            relays_by_event: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn record(&mut self, event_id: &str, relay_url: &str) {
        if let Some(relays) = self.relays_by_event.get_mut(event_id) {
            relays.insert(relay_url.to_string());
            return;
        }
        self.relays_by_event.insert(
            event_id.to_string(),
            HashSet::from([relay_url.to_string()]),
        );
        self.order.push_back(event_id.to_string());
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.relays_by_event.remove(&evicted);
            }
        }
    }
}

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Durable pool document. Unknown keys from other builds are tolerated.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct PersistedPoolState {
    stats: HashMap<String, RelayStats>,
    whitelist: Vec<String>,
    blacklist: Vec<String>,
    user_location: Option<Geolocation>,
}

// =============================================================================
// POOL
// =============================================================================

struct RelayEntry {
    state: RelayState,
    commands: Option<mpsc::Sender<RelayCommand>>,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    relays: RwLock<HashMap<String, RelayEntry>>,
    subscriptions: RwLock<HashMap<String, Arc<SubscriptionEntry>>>,
    seen_index: Mutex<SeenIndex>,
    routing: Mutex<VecDeque<MessageRoutingResult>>,
    user_location: RwLock<Option<Geolocation>>,
    /// Stats loaded from storage, claimed as relays are first referenced
    persisted_stats: Mutex<HashMap<String, RelayStats>>,
    /// Bumped by `disconnect_all`; invalidates in-flight actors and timers
    generation: AtomicU64,
    subscription_counter: AtomicU64,
    events_tx: mpsc::Sender<RelayEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<RelayEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    store: Option<Arc<dyn StateStore>>,
}

/// The relay pool. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    /// Build a pool, loading persisted stats/lists/location when a store
    /// is supplied.
    pub fn new(config: PoolConfig, store: Option<Arc<dyn StateStore>>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let inner = Arc::new(PoolInner {
            seen_index: Mutex::new(SeenIndex::new(config.max_seen_events)),
            config,
            relays: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            routing: Mutex::new(VecDeque::new()),
            user_location: RwLock::new(None),
            persisted_stats: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            subscription_counter: AtomicU64::new(0),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(Vec::new()),
            store,
        });
        inner.load_persisted_state();
        Self { inner }
    }

    /// Spawn the event-dispatch and health-check loops. Idempotent per
    /// pool instance only in the sense that it should be called once.
    pub fn start(&self) {
        let Some(mut events_rx) = self.inner.events_rx.lock().take() else {
            return;
        };
        let dispatch_inner = self.inner.clone();
        let dispatch = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                dispatch_inner.handle_relay_event(event);
            }
        });

        let health_inner = self.inner.clone();
        let interval = self.inner.config.health_check_interval;
        let health = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; consume it so the first
            // real check lands one interval out.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                health_inner.health_check();
            }
        });

        let mut tasks = self.inner.tasks.lock();
        tasks.push(dispatch);
        tasks.push(health);
    }

    /// Stop the background loops. Relay actors are taken down separately
    /// by [`RelayPool::disconnect_all`].
    pub fn stop(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Connect to one relay.
    pub async fn connect(&self, url: &str) {
        self.inner.connect_relay(url);
    }

    /// Connect to an initial selection of relays (see
    /// [`RelayPool::select_for_connect`]); `max` defaults to the
    /// configured minimum connection count.
    pub async fn connect_all(&self, max: Option<usize>) {
        let max = max.unwrap_or(self.inner.config.min_connections);
        for url in self.select_for_connect(max, false, None) {
            self.inner.connect_relay(&url);
        }
    }

    /// Disconnect one relay and leave it disconnected.
    pub async fn disconnect(&self, url: &str) {
        self.inner.disconnect_relay(url);
    }

    /// Disconnect every relay and invalidate all reconnect timers.
    pub async fn disconnect_all(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let urls: Vec<String> = self.inner.relays.read().keys().cloned().collect();
        for url in urls {
            self.inner.disconnect_relay(&url);
        }
        self.inner.persist_state();
    }

    /// Manual retry: reset the attempt counter and reconnect now.
    pub async fn retry(&self, url: &str) {
        {
            let mut relays = self.inner.relays.write();
            if let Some(entry) = relays.get_mut(url) {
                entry.state.reconnect_attempts = 0;
                entry.state.next_reconnect_at = None;
            }
        }
        self.inner.connect_relay(url);
    }

    /// Publish to the best currently connected relays.
    pub async fn publish(&self, event: &Event) -> PublishResult {
        let targets = self.select_for_publish();
        self.publish_to(event, &targets).await
    }

    /// Publish to an explicit relay set. Each leg races the configured
    /// per-relay timeout; legs fail independently.
    pub async fn publish_to(&self, event: &Event, urls: &[String]) -> PublishResult {
        let frame = match ClientMessage::Event(event.clone()).to_json() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "failed to encode event for publish");
                return PublishResult {
                    event_id: event.id.clone(),
                    relay_results: HashMap::new(),
                    success: false,
                };
            }
        };

        let timeout = self.inner.config.publish_timeout;
        let legs = urls.iter().map(|url| {
            let sender = self
                .inner
                .relays
                .read()
                .get(url)
                .and_then(|entry| entry.commands.clone());
            let url = url.clone();
            let frame = frame.clone();
            let event_id = event.id.clone();
            async move {
                let started = std::time::Instant::now();
                let outcome = match sender {
                    None => Err("not connected".to_string()),
                    Some(sender) => {
                        let (reply_tx, reply_rx) = oneshot::channel();
                        let command = RelayCommand::Publish {
                            event_id,
                            frame,
                            reply: reply_tx,
                        };
                        if sender.send(command).await.is_err() {
                            Err("not connected".to_string())
                        } else {
                            match tokio::time::timeout(timeout, reply_rx).await {
                                Ok(Ok(result)) => result,
                                Ok(Err(_)) => Err("connection closed".to_string()),
                                Err(_) => Err("timeout".to_string()),
                            }
                        }
                    }
                };
                let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
                (url, outcome, latency_ms)
            }
        });
        let outcomes = futures_util::future::join_all(legs).await;

        let mut result = PublishResult {
            event_id: event.id.clone(),
            relay_results: HashMap::new(),
            success: false,
        };
        let mut routing = MessageRoutingResult {
            event_id: event.id.clone(),
            attempted: urls.to_vec(),
            succeeded: Vec::new(),
            failed: HashMap::new(),
            timestamp: epoch_ms(),
        };

        {
            let now = epoch_ms();
            let mut relays = self.inner.relays.write();
            for (url, outcome, latency_ms) in outcomes {
                let (accepted, message) = match outcome {
                    Ok(message) => (true, message),
                    Err(message) => (false, message),
                };
                if let Some(entry) = relays.get_mut(&url) {
                    if accepted {
                        entry.state.stats.record_publish_success(latency_ms);
                    } else {
                        entry.state.stats.record_publish_failure();
                    }
                    entry
                        .state
                        .stats
                        .recompute_score(entry.state.is_primary, now);
                }
                if accepted {
                    result.success = true;
                    routing.succeeded.push(url.clone());
                } else {
                    routing.failed.insert(url.clone(), message.clone());
                }
                result.relay_results.insert(
                    url,
                    RelayPublishOutcome {
                        accepted,
                        message,
                        latency_ms,
                    },
                );
            }
        }

        let mut log = self.inner.routing.lock();
        log.push_back(routing);
        while log.len() > self.inner.config.max_routing_results {
            log.pop_front();
        }
        drop(log);

        result
    }

    /// Open a subscription across `target_relays` (default: every
    /// currently connected relay).
    pub async fn subscribe(
        &self,
        target_relays: Option<Vec<String>>,
        filters: Vec<Filter>,
        on_event: EventCallback,
        options: SubscriptionOptions,
    ) -> SubscriptionHandle {
        let id = format!(
            "sub{}",
            self.inner
                .subscription_counter
                .fetch_add(1, Ordering::SeqCst)
        );
        let targets = target_relays.unwrap_or_else(|| self.connected_relays());
        let entry = Arc::new(SubscriptionEntry {
            id: id.clone(),
            filters: filters.clone(),
            target_relays: targets.clone(),
            on_event,
            on_eose: Mutex::new(options.on_eose),
            on_close: Mutex::new(options.on_close),
            seen: Mutex::new(SeenSet::new(self.inner.config.max_seen_events)),
        });
        self.inner
            .subscriptions
            .write()
            .insert(id.clone(), entry);

        if let Ok(frame) = (ClientMessage::Req {
            subscription_id: id.clone(),
            filters,
        })
        .to_json()
        {
            self.inner.send_to_relays(&targets, &frame);
        }

        SubscriptionHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Close a subscription by id (equivalent to dropping its handle via
    /// [`SubscriptionHandle::close`]).
    pub fn unsubscribe(&self, subscription_id: &str) {
        self.inner.unsubscribe(subscription_id);
    }

    /// Close every open subscription.
    pub fn close_all_subscriptions(&self) {
        let ids: Vec<String> = self.inner.subscriptions.read().keys().cloned().collect();
        for id in ids {
            self.inner.unsubscribe(&id);
        }
    }

    // -------------------------------------------------------------------------
    // Selection policies
    // -------------------------------------------------------------------------

    /// Pick publish targets: connected, non-blacklisted; primaries first,
    /// then reliability score descending, then latency ascending.
    pub fn select_for_publish(&self) -> Vec<String> {
        let relays = self.inner.relays.read();
        let mut candidates: Vec<&RelayEntry> = relays
            .values()
            .filter(|entry| {
                entry.state.conn == ConnectionState::Connected && !entry.state.is_blacklisted
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.state
                .is_primary
                .cmp(&a.state.is_primary)
                .then(
                    b.state
                        .stats
                        .reliability_score
                        .partial_cmp(&a.state.stats.reliability_score)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(
                    a.state
                        .latency_ms
                        .unwrap_or(f64::MAX)
                        .partial_cmp(&b.state.latency_ms.unwrap_or(f64::MAX))
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        candidates
            .into_iter()
            .take(self.inner.config.publish_redundancy)
            .map(|entry| entry.state.url.clone())
            .collect()
    }

    /// Pick up to `max` relays for an initial connect.
    ///
    /// A custom list short-circuits everything but the blacklist. The
    /// default path takes whitelisted relays, then primaries, then fills
    /// by proximity (when requested and the user location is known) or by
    /// reliability score.
    pub fn select_for_connect(
        &self,
        max: usize,
        prioritize_proximity: bool,
        custom: Option<Vec<String>>,
    ) -> Vec<String> {
        let relays = self.inner.relays.read();
        let blacklisted: HashSet<&str> = relays
            .values()
            .filter(|e| e.state.is_blacklisted)
            .map(|e| e.state.url.as_str())
            .collect();

        if let Some(custom) = custom {
            let mut seen = HashSet::new();
            return custom
                .into_iter()
                .filter(|url| !blacklisted.contains(url.as_str()))
                .filter(|url| seen.insert(url.clone()))
                .take(max)
                .collect();
        }

        let mut selection: Vec<String> = Vec::new();
        let mut picked = HashSet::new();
        let mut push = |url: &str, selection: &mut Vec<String>| {
            if !blacklisted.contains(url) && picked.insert(url.to_string()) {
                selection.push(url.to_string());
            }
        };

        for entry in relays.values().filter(|e| e.state.is_whitelisted) {
            push(&entry.state.url, &mut selection);
        }
        for url in &self.inner.config.primary_relays {
            push(url, &mut selection);
        }

        // Fill with the remaining candidates: everything we know about
        // plus the default set.
        let mut fill: Vec<(String, f64, f64)> = Vec::new(); // (url, score, distance)
        let location = *self.inner.user_location.read();
        let mut consider = |url: &str, score: f64, geolocation: Option<Geolocation>| {
            let distance = match (location, geolocation) {
                (Some(here), Some(there)) => haversine_km(here, there),
                _ => f64::MAX,
            };
            fill.push((url.to_string(), score, distance));
        };
        for entry in relays.values() {
            consider(
                &entry.state.url,
                entry.state.stats.reliability_score,
                entry.state.geolocation,
            );
        }
        for descriptor in defaults::DEFAULT_RELAYS {
            if !relays.contains_key(descriptor.url) {
                consider(descriptor.url, 50.0, descriptor.geolocation);
            }
        }

        if prioritize_proximity && location.is_some() {
            fill.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));
        } else {
            fill.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        }
        for (url, _, _) in fill {
            if selection.len() >= max {
                break;
            }
            push(&url, &mut selection);
        }
        selection.truncate(max);
        selection
    }

    // -------------------------------------------------------------------------
    // Lists, location, introspection
    // -------------------------------------------------------------------------

    /// Whitelist a relay; whitelisted relays are always part of connect
    /// selection.
    pub fn add_to_whitelist(&self, url: &str) {
        self.inner.ensure_relay(url);
        if let Some(entry) = self.inner.relays.write().get_mut(url) {
            entry.state.is_whitelisted = true;
        }
        self.inner.persist_state();
    }

    pub fn remove_from_whitelist(&self, url: &str) {
        if let Some(entry) = self.inner.relays.write().get_mut(url) {
            entry.state.is_whitelisted = false;
        }
        self.inner.persist_state();
    }

    /// Blacklist a relay, disconnecting it if currently active.
    pub fn add_to_blacklist(&self, url: &str) {
        self.inner.ensure_relay(url);
        let active = {
            let mut relays = self.inner.relays.write();
            let entry = relays.get_mut(url);
            match entry {
                Some(entry) => {
                    entry.state.is_blacklisted = true;
                    matches!(
                        entry.state.conn,
                        ConnectionState::Connected | ConnectionState::Connecting
                    )
                }
                None => false,
            }
        };
        if active {
            self.inner.disconnect_relay(url);
        }
        self.inner.persist_state();
    }

    pub fn remove_from_blacklist(&self, url: &str) {
        if let Some(entry) = self.inner.relays.write().get_mut(url) {
            entry.state.is_blacklisted = false;
        }
        self.inner.persist_state();
    }

    /// Set (or clear) the user location used by proximity selection.
    pub fn set_user_location(&self, location: Option<Geolocation>) {
        *self.inner.user_location.write() = location;
        self.inner.persist_state();
    }

    pub fn connected_count(&self) -> usize {
        self.inner
            .relays
            .read()
            .values()
            .filter(|entry| entry.state.conn == ConnectionState::Connected)
            .count()
    }

    pub fn connected_relays(&self) -> Vec<String> {
        self.inner
            .relays
            .read()
            .values()
            .filter(|entry| entry.state.conn == ConnectionState::Connected)
            .map(|entry| entry.state.url.clone())
            .collect()
    }

    /// Snapshot of one relay's state.
    pub fn relay_state(&self, url: &str) -> Option<RelayState> {
        self.inner
            .relays
            .read()
            .get(url)
            .map(|entry| entry.state.clone())
    }

    /// Snapshot of every known relay state.
    pub fn relay_states(&self) -> Vec<RelayState> {
        self.inner
            .relays
            .read()
            .values()
            .map(|entry| entry.state.clone())
            .collect()
    }

    /// Relays that delivered a given event, from the bounded global index.
    pub fn relays_for_event(&self, event_id: &str) -> Option<HashSet<String>> {
        self.inner
            .seen_index
            .lock()
            .relays_by_event
            .get(event_id)
            .cloned()
    }

    /// Recent routing results, oldest first.
    pub fn routing_results(&self) -> Vec<MessageRoutingResult> {
        self.inner.routing.lock().iter().cloned().collect()
    }

    /// Persist stats, lists, and location now (the health loop also does
    /// this periodically).
    pub fn persist(&self) {
        self.inner.persist_state();
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }
}

impl PoolInner {
    /// Get or create the entry for a URL, seeding geolocation, primary
    /// flag, and any persisted stats.
    fn ensure_relay(&self, url: &str) {
        let mut relays = self.relays.write();
        if relays.contains_key(url) {
            return;
        }
        let mut state = RelayState::new(url);
        state.geolocation = defaults::geolocation_for(url);
        state.is_primary = self.config.primary_relays.contains(url);
        if let Some(stats) = self.persisted_stats.lock().remove(url) {
            state.stats = stats;
        }
        relays.insert(
            url.to_string(),
            RelayEntry {
                state,
                commands: None,
            },
        );
    }

    /// Drive a relay into `Connecting` and spawn its actor.
    fn connect_relay(self: &Arc<Self>, url: &str) {
        self.ensure_relay(url);
        let generation = self.generation.load(Ordering::SeqCst);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        {
            let mut relays = self.relays.write();
            let Some(entry) = relays.get_mut(url) else {
                return;
            };
            if entry.state.is_blacklisted {
                return;
            }
            if matches!(
                entry.state.conn,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                return;
            }
            entry.state.conn = ConnectionState::Connecting;
            entry.state.next_reconnect_at = None;
            entry.state.stats.record_connection_attempt();
            entry.commands = Some(command_tx);
        }
        debug!(%url, "connecting to relay");
        tokio::spawn(run_relay(
            url.to_string(),
            generation,
            self.config.connect_timeout,
            command_rx,
            self.events_tx.clone(),
        ));
    }

    /// Manual disconnect: close the actor and rest at `Disconnected`.
    fn disconnect_relay(&self, url: &str) {
        let sender = {
            let mut relays = self.relays.write();
            let Some(entry) = relays.get_mut(url) else {
                return;
            };
            entry.state.conn = ConnectionState::Disconnected;
            entry.state.last_disconnected_at = Some(epoch_ms());
            entry.state.next_reconnect_at = None;
            entry.commands.take()
        };
        if let Some(sender) = sender {
            let _ = sender.try_send(RelayCommand::Close);
        }
    }

    /// Apply one actor event to the state machine. Synchronous so tests
    /// can drive it directly; the dispatch task is a thin pump.
    pub(crate) fn handle_relay_event(self: &Arc<Self>, event: RelayEvent) {
        match event {
            RelayEvent::Connected {
                url,
                generation,
                latency_ms,
            } => {
                if generation != self.generation.load(Ordering::SeqCst) {
                    return;
                }
                let now = epoch_ms();
                {
                    let mut relays = self.relays.write();
                    let Some(entry) = relays.get_mut(&url) else {
                        return;
                    };
                    entry.state.conn = ConnectionState::Connected;
                    entry.state.last_connected_at = Some(now);
                    entry.state.last_error = None;
                    entry.state.reconnect_attempts = 0;
                    entry.state.next_reconnect_at = None;
                    entry.state.latency_ms = Some(latency_ms);
                    entry.state.stats.record_connection_success(latency_ms, now);
                    entry
                        .state
                        .stats
                        .recompute_score(entry.state.is_primary, now);
                }
                info!(%url, latency_ms, "relay connected");
                self.resend_subscriptions(&url);
            }
            RelayEvent::Disconnected {
                url,
                generation,
                error,
            } => {
                if generation != self.generation.load(Ordering::SeqCst) {
                    return;
                }
                let now = epoch_ms();
                {
                    let mut relays = self.relays.write();
                    let Some(entry) = relays.get_mut(&url) else {
                        return;
                    };
                    // A manual disconnect already parked this relay; a
                    // racing transport error must not resurrect it.
                    if entry.state.conn == ConnectionState::Disconnected {
                        return;
                    }
                    entry.state.conn = ConnectionState::Error;
                    entry.state.last_error = error.clone();
                    entry.state.last_disconnected_at = Some(now);
                    entry.commands = None;
                    entry
                        .state
                        .stats
                        .recompute_score(entry.state.is_primary, now);
                }
                debug!(%url, ?error, "relay disconnected");
                self.schedule_reconnect(&url);
            }
            RelayEvent::Incoming { url, message } => self.handle_incoming(&url, message),
        }
    }

    /// Queue the next reconnect per the backoff schedule, if attempts
    /// remain.
    fn schedule_reconnect(self: &Arc<Self>, url: &str) {
        let delay = {
            let mut relays = self.relays.write();
            let Some(entry) = relays.get_mut(url) else {
                return;
            };
            if entry.state.is_blacklisted {
                return;
            }
            entry.state.reconnect_attempts += 1;
            if entry.state.reconnect_attempts >= self.config.backoff.max_attempts {
                entry.state.next_reconnect_at = None;
                warn!(
                    %url,
                    attempts = entry.state.reconnect_attempts,
                    "giving up on relay until manual retry"
                );
                return;
            }
            let delay = self.config.backoff.delay_for(entry.state.reconnect_attempts);
            entry.state.next_reconnect_at = Some(epoch_ms() + delay.as_millis() as u64);
            delay
        };

        let inner = self.clone();
        let url = url.to_string();
        let generation = self.generation.load(Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let due = {
                let relays = inner.relays.read();
                relays.get(&url).map_or(false, |entry| {
                    entry.state.conn == ConnectionState::Error && !entry.state.is_blacklisted
                })
            };
            if due {
                inner.connect_relay(&url);
            }
        });
    }

    /// Route one relay→client message.
    fn handle_incoming(self: &Arc<Self>, url: &str, message: RelayMessage) {
        {
            let mut relays = self.relays.write();
            if let Some(entry) = relays.get_mut(url) {
                entry.state.stats.messages_received += 1;
            }
        }
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                let Some(subscription) = self
                    .subscriptions
                    .read()
                    .get(&subscription_id)
                    .cloned()
                else {
                    return;
                };
                self.seen_index.lock().record(&event.id, url);
                let fresh = subscription.seen.lock().insert(&event.id);
                if fresh {
                    (subscription.on_event)(&event, url);
                }
            }
            RelayMessage::Eose { subscription_id } => {
                let Some(subscription) = self
                    .subscriptions
                    .read()
                    .get(&subscription_id)
                    .cloned()
                else {
                    return;
                };
                if let Some(on_eose) = subscription.on_eose.lock().take() {
                    on_eose();
                };
            }
            RelayMessage::Closed {
                subscription_id,
                reason,
            } => {
                debug!(%url, %subscription_id, %reason, "subscription closed by relay");
                let Some(subscription) = self
                    .subscriptions
                    .read()
                    .get(&subscription_id)
                    .cloned()
                else {
                    return;
                };
                if let Some(on_close) = subscription.on_close.lock().take() {
                    on_close(&reason);
                };
            }
            RelayMessage::Notice { message } => {
                debug!(%url, %message, "relay notice");
            }
            RelayMessage::Auth { .. } => {
                // NIP-42 authentication is out of scope; ignore challenges.
                debug!(%url, "ignoring auth challenge");
            }
            RelayMessage::Ok { .. } => {
                // OK frames are resolved inside the relay actor.
            }
        }
    }

    /// Re-issue REQ frames for subscriptions targeting a relay that just
    /// (re)connected.
    fn resend_subscriptions(&self, url: &str) {
        let frames: Vec<String> = self
            .subscriptions
            .read()
            .values()
            .filter(|sub| sub.target_relays.iter().any(|target| target == url))
            .filter_map(|sub| {
                ClientMessage::Req {
                    subscription_id: sub.id.clone(),
                    filters: sub.filters.clone(),
                }
                .to_json()
                .ok()
            })
            .collect();
        let target = [url.to_string()];
        for frame in frames {
            self.send_to_relays(&target, &frame);
        }
    }

    /// Fire a frame at every listed relay that is currently connected.
    fn send_to_relays(&self, urls: &[String], frame: &str) {
        let relays = self.relays.read();
        for url in urls {
            let Some(entry) = relays.get(url) else {
                continue;
            };
            if entry.state.conn != ConnectionState::Connected {
                continue;
            }
            if let Some(sender) = &entry.commands {
                if sender
                    .try_send(RelayCommand::Send {
                        frame: frame.to_string(),
                    })
                    .is_err()
                {
                    warn!(%url, "relay command queue full, dropping frame");
                }
            }
        }
    }

    fn unsubscribe(&self, subscription_id: &str) {
        let Some(subscription) = self.subscriptions.write().remove(subscription_id) else {
            return;
        };
        if let Ok(frame) = (ClientMessage::Close {
            subscription_id: subscription_id.to_string(),
        })
        .to_json()
        {
            self.send_to_relays(&subscription.target_relays, &frame);
        }
        // The entry (and its seen set) drops here.
    }

    fn health_check(self: &Arc<Self>) {
        let connected = self
            .relays
            .read()
            .values()
            .filter(|entry| entry.state.conn == ConnectionState::Connected)
            .count();
        if connected < self.config.min_connections {
            let needed = self.config.min_connections - connected;
            let mut candidates: Vec<(String, f64)> = self
                .relays
                .read()
                .values()
                .filter(|entry| {
                    matches!(
                        entry.state.conn,
                        ConnectionState::Disconnected | ConnectionState::Error
                    ) && !entry.state.is_blacklisted
                        && entry.state.next_reconnect_at.is_none()
                        // Relays that exhausted their attempts wait for a
                        // manual retry.
                        && entry.state.reconnect_attempts < self.config.backoff.max_attempts
                })
                .map(|entry| (entry.state.url.clone(), entry.state.stats.reliability_score))
                .collect();
            for descriptor in defaults::DEFAULT_RELAYS {
                if !self.relays.read().contains_key(descriptor.url) {
                    candidates.push((descriptor.url.to_string(), 50.0));
                }
            }
            candidates
                .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            for (url, _) in candidates.into_iter().take(needed) {
                self.connect_relay(&url);
            }
        }
        self.persist_state();
    }

    fn load_persisted_state(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let persisted = match store.get(RELAY_STATE_KEY) {
            Ok(Some(bytes)) => match serde_json::from_slice::<PersistedPoolState>(&bytes) {
                Ok(state) => state,
                Err(err) => {
                    warn!(%err, "discarding malformed relay state");
                    return;
                }
            },
            Ok(None) => return,
            Err(err) => {
                warn!(%err, "failed to load relay state");
                return;
            }
        };

        *self.persisted_stats.lock() = persisted.stats;
        *self.user_location.write() = persisted.user_location;
        for url in persisted.whitelist {
            self.ensure_relay(&url);
            if let Some(entry) = self.relays.write().get_mut(&url) {
                entry.state.is_whitelisted = true;
            }
        }
        for url in persisted.blacklist {
            self.ensure_relay(&url);
            if let Some(entry) = self.relays.write().get_mut(&url) {
                entry.state.is_blacklisted = true;
            }
        }
    }

    fn persist_state(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let mut persisted = PersistedPoolState {
            user_location: *self.user_location.read(),
            ..Default::default()
        };
        {
            let relays = self.relays.read();
            for (url, entry) in relays.iter() {
                persisted.stats.insert(url.clone(), entry.state.stats.clone());
                if entry.state.is_whitelisted {
                    persisted.whitelist.push(url.clone());
                }
                if entry.state.is_blacklisted {
                    persisted.blacklist.push(url.clone());
                }
            }
        }
        // Keep unclaimed persisted stats for relays we never touched.
        for (url, stats) in self.persisted_stats.lock().iter() {
            persisted
                .stats
                .entry(url.clone())
                .or_insert_with(|| stats.clone());
        }
        persisted.whitelist.sort();
        persisted.blacklist.sort();

        let bytes = match serde_json::to_vec(&persisted) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "failed to serialize relay state");
                return;
            }
        };
        if let Err(err) = store.put(RELAY_STATE_KEY, &bytes) {
            warn!(%err, "failed to persist relay state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::store::MemoryStore;
    use nightjar_core::types::Event;
    use std::sync::atomic::AtomicUsize;

    fn test_event(id_byte: char) -> Event {
        Event {
            id: id_byte.to_string().repeat(64),
            pubkey: "a".repeat(64),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: "x".into(),
            sig: "b".repeat(128),
        }
    }

    fn set_state(
        pool: &RelayPool,
        url: &str,
        conn: ConnectionState,
        score: f64,
        latency: Option<f64>,
        primary: bool,
    ) {
        pool.inner().ensure_relay(url);
        let mut relays = pool.inner().relays.write();
        let entry = relays.get_mut(url).unwrap();
        entry.state.conn = conn;
        entry.state.stats.reliability_score = score;
        entry.state.latency_ms = latency;
        entry.state.is_primary = primary;
    }

    #[tokio::test]
    async fn test_backoff_after_failed_connect() {
        let config = PoolConfig {
            backoff: BackoffConfig {
                initial_ms: 100,
                multiplier: 2.0,
                max_ms: 1_000,
                jitter_ms: 0,
                max_attempts: 5,
            },
            ..Default::default()
        };
        let pool = RelayPool::new(config, None);
        pool.start();

        let before = epoch_ms();
        // Port 1 refuses immediately; no DNS involved.
        pool.connect("wss://127.0.0.1:1").await;

        let mut state = None;
        for _ in 0..200 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let snapshot = pool.relay_state("wss://127.0.0.1:1").unwrap();
            if snapshot.conn == ConnectionState::Error {
                state = Some(snapshot);
                break;
            }
        }
        let state = state.expect("relay never reached Error state");
        assert_eq!(state.reconnect_attempts, 1);
        assert!(state.last_error.is_some());
        let next = state.next_reconnect_at.expect("reconnect must be scheduled");
        let offset = next - before;
        assert!(
            (100..300).contains(&offset),
            "reconnect scheduled {offset} ms out"
        );
        pool.stop();
        pool.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_reconnect_attempts_cap() {
        let config = PoolConfig {
            backoff: BackoffConfig {
                initial_ms: 10,
                multiplier: 1.0,
                max_ms: 10,
                jitter_ms: 0,
                max_attempts: 3,
            },
            ..Default::default()
        };
        let pool = RelayPool::new(config, None);
        pool.start();
        pool.connect("wss://127.0.0.1:1").await;

        // Wait for the attempt counter to reach the cap and stop.
        let mut capped = false;
        for _ in 0..300 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let state = pool.relay_state("wss://127.0.0.1:1").unwrap();
            if state.reconnect_attempts >= 3 {
                capped = true;
                break;
            }
        }
        assert!(capped, "never reached the attempt cap");
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let state = pool.relay_state("wss://127.0.0.1:1").unwrap();
        assert_eq!(state.reconnect_attempts, 3);
        assert!(state.next_reconnect_at.is_none());
        pool.stop();
        pool.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_select_for_publish_ordering() {
        let pool = RelayPool::new(PoolConfig::default(), None);
        set_state(&pool, "wss://low", ConnectionState::Connected, 20.0, Some(50.0), false);
        set_state(&pool, "wss://high", ConnectionState::Connected, 90.0, Some(200.0), false);
        set_state(&pool, "wss://primary", ConnectionState::Connected, 10.0, Some(900.0), true);
        set_state(&pool, "wss://offline", ConnectionState::Disconnected, 99.0, None, false);
        set_state(&pool, "wss://banned", ConnectionState::Connected, 99.0, None, false);
        pool.inner()
            .relays
            .write()
            .get_mut("wss://banned")
            .unwrap()
            .state
            .is_blacklisted = true;

        let selection = pool.select_for_publish();
        assert_eq!(selection, vec!["wss://primary", "wss://high", "wss://low"]);
    }

    #[tokio::test]
    async fn test_select_for_publish_latency_tiebreak() {
        let pool = RelayPool::new(PoolConfig::default(), None);
        set_state(&pool, "wss://slow", ConnectionState::Connected, 50.0, Some(800.0), false);
        set_state(&pool, "wss://fast", ConnectionState::Connected, 50.0, Some(30.0), false);
        let selection = pool.select_for_publish();
        assert_eq!(selection, vec!["wss://fast", "wss://slow"]);
    }

    #[tokio::test]
    async fn test_select_for_connect_custom_and_blacklist() {
        let pool = RelayPool::new(PoolConfig::default(), None);
        pool.add_to_blacklist("wss://banned");
        let selection = pool.select_for_connect(
            10,
            false,
            Some(vec![
                "wss://one".into(),
                "wss://banned".into(),
                "wss://one".into(),
                "wss://two".into(),
            ]),
        );
        assert_eq!(selection, vec!["wss://one", "wss://two"]);
    }

    #[tokio::test]
    async fn test_select_for_connect_whitelist_first() {
        let pool = RelayPool::new(PoolConfig::default(), None);
        pool.add_to_whitelist("wss://mine");
        let selection = pool.select_for_connect(3, false, None);
        assert_eq!(selection[0], "wss://mine");
        assert_eq!(selection.len(), 3);
    }

    #[tokio::test]
    async fn test_select_for_connect_proximity() {
        let pool = RelayPool::new(PoolConfig::default(), None);
        // Tokyo: the Japanese relays should lead the proximity sort.
        pool.set_user_location(Some(Geolocation::new(35.68, 139.69)));
        let selection = pool.select_for_connect(2, true, None);
        assert_eq!(
            selection,
            vec!["wss://relay-jp.nostr.wirednet.jp", "wss://nostr.h3z.jp"]
        );
    }

    #[tokio::test]
    async fn test_publish_with_no_connected_relays() {
        let pool = RelayPool::new(PoolConfig::default(), None);
        let result = pool.publish(&test_event('1')).await;
        assert!(!result.success);
        assert!(result.relay_results.is_empty());
    }

    #[tokio::test]
    async fn test_publish_to_unconnected_relay_fails_per_leg() {
        let pool = RelayPool::new(PoolConfig::default(), None);
        pool.inner().ensure_relay("wss://nowhere");
        let result = pool
            .publish_to(&test_event('2'), &["wss://nowhere".to_string()])
            .await;
        assert!(!result.success);
        let leg = &result.relay_results["wss://nowhere"];
        assert!(!leg.accepted);
        assert_eq!(leg.message, "not connected");

        // Failure recorded in stats and the routing log.
        let state = pool.relay_state("wss://nowhere").unwrap();
        assert_eq!(state.stats.failure_count, 1);
        let routing = pool.routing_results();
        assert_eq!(routing.len(), 1);
        assert_eq!(routing[0].failed["wss://nowhere"], "not connected");
    }

    #[tokio::test]
    async fn test_routing_log_bounded() {
        let config = PoolConfig {
            max_routing_results: 5,
            ..Default::default()
        };
        let pool = RelayPool::new(config, None);
        for i in 0..12u8 {
            let mut event = test_event('3');
            event.id = format!("{i:064}");
            pool.publish_to(&event, &[]).await;
        }
        assert_eq!(pool.routing_results().len(), 5);
    }

    #[tokio::test]
    async fn test_subscription_dedup_across_relays() {
        let pool = RelayPool::new(PoolConfig::default(), None);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = hits.clone();
        let handle = pool
            .subscribe(
                Some(vec!["wss://a".into(), "wss://b".into()]),
                vec![Filter::new().kinds([1])],
                Box::new(move |_event, _relay| {
                    hits_cb.fetch_add(1, Ordering::SeqCst);
                }),
                SubscriptionOptions::default(),
            )
            .await;

        let event = test_event('4');
        for relay in ["wss://a", "wss://b", "wss://a"] {
            pool.inner().handle_incoming(
                relay,
                RelayMessage::Event {
                    subscription_id: handle.id().to_string(),
                    event: event.clone(),
                },
            );
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Both relays are recorded in the global index.
        let relays = pool.relays_for_event(&event.id).unwrap();
        assert_eq!(relays.len(), 2);
        handle.close();
    }

    #[tokio::test]
    async fn test_subscription_eose_fires_once() {
        let pool = RelayPool::new(PoolConfig::default(), None);
        let eose_hits = Arc::new(AtomicUsize::new(0));
        let eose_cb = eose_hits.clone();
        let handle = pool
            .subscribe(
                Some(vec!["wss://a".into()]),
                vec![Filter::new()],
                Box::new(|_, _| {}),
                SubscriptionOptions {
                    on_eose: Some(Box::new(move || {
                        eose_cb.fetch_add(1, Ordering::SeqCst);
                    })),
                    on_close: None,
                },
            )
            .await;

        for _ in 0..3 {
            pool.inner().handle_incoming(
                "wss://a",
                RelayMessage::Eose {
                    subscription_id: handle.id().to_string(),
                },
            );
        }
        assert_eq!(eose_hits.load(Ordering::SeqCst), 1);
        handle.close();
    }

    #[tokio::test]
    async fn test_closed_subscription_stops_delivering() {
        let pool = RelayPool::new(PoolConfig::default(), None);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = hits.clone();
        let handle = pool
            .subscribe(
                Some(vec!["wss://a".into()]),
                vec![Filter::new()],
                Box::new(move |_, _| {
                    hits_cb.fetch_add(1, Ordering::SeqCst);
                }),
                SubscriptionOptions::default(),
            )
            .await;
        let id = handle.id().to_string();
        handle.close();

        pool.inner().handle_incoming(
            "wss://a",
            RelayMessage::Event {
                subscription_id: id,
                event: test_event('5'),
            },
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_blacklist_disconnects_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let pool = RelayPool::new(PoolConfig::default(), Some(store.clone()));
        set_state(&pool, "wss://bad", ConnectionState::Connected, 50.0, None, false);
        pool.add_to_blacklist("wss://bad");

        let state = pool.relay_state("wss://bad").unwrap();
        assert!(state.is_blacklisted);
        assert_eq!(state.conn, ConnectionState::Disconnected);

        // A fresh pool over the same store remembers the blacklist.
        let pool2 = RelayPool::new(PoolConfig::default(), Some(store));
        let state2 = pool2.relay_state("wss://bad").unwrap();
        assert!(state2.is_blacklisted);
    }

    #[tokio::test]
    async fn test_stats_and_location_persist_across_restart() {
        let store = Arc::new(MemoryStore::new());
        let pool = RelayPool::new(PoolConfig::default(), Some(store.clone()));
        set_state(&pool, "wss://kept", ConnectionState::Connected, 77.5, None, false);
        pool.set_user_location(Some(Geolocation::new(1.0, 2.0)));
        pool.persist();

        let pool2 = RelayPool::new(PoolConfig::default(), Some(store));
        pool2.inner().ensure_relay("wss://kept");
        let state = pool2.relay_state("wss://kept").unwrap();
        assert_eq!(state.stats.reliability_score, 77.5);
        assert_eq!(
            *pool2.inner().user_location.read(),
            Some(Geolocation::new(1.0, 2.0))
        );
    }

    #[tokio::test]
    async fn test_seen_index_bounded() {
        let config = PoolConfig {
            max_seen_events: 3,
            ..Default::default()
        };
        let pool = RelayPool::new(config, None);
        let handle = pool
            .subscribe(
                Some(vec!["wss://a".into()]),
                vec![Filter::new()],
                Box::new(|_, _| {}),
                SubscriptionOptions::default(),
            )
            .await;
        for i in 0..5u8 {
            let mut event = test_event('6');
            event.id = format!("{i:064}");
            pool.inner().handle_incoming(
                "wss://a",
                RelayMessage::Event {
                    subscription_id: handle.id().to_string(),
                    event,
                },
            );
        }
        let index = pool.inner().seen_index.lock();
        assert_eq!(index.relays_by_event.len(), 3);
        assert!(!index.relays_by_event.contains_key(&format!("{:064}", 0)));
        drop(index);
        handle.close();
    }
}
