//! Configuration for the relay pool, supervisor, and outbox

use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Exponential backoff schedule for relay reconnects.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// First retry delay in milliseconds
    pub initial_ms: u64,
    /// Per-attempt multiplier
    pub multiplier: f64,
    /// Delay ceiling in milliseconds
    pub max_ms: u64,
    /// Uniform random jitter added on top, in milliseconds
    pub jitter_ms: u64,
    /// Attempts after which automatic reconnects stop; `retry()` resets
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            multiplier: 2.0,
            max_ms: 300_000,
            jitter_ms: 500,
            max_attempts: 20,
        }
    }
}

impl BackoffConfig {
    /// Delay before reconnect attempt number `attempts` (1-based):
    /// `min(initial * multiplier^(attempts-1), max) + uniform(0, jitter)`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(63);
        let base = self.initial_ms as f64 * self.multiplier.powi(exponent as i32);
        let capped = base.min(self.max_ms as f64) as u64;
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        };
        Duration::from_millis(capped + jitter)
    }
}

/// Relay pool behavior.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Health loop tops the pool back up to this many live connections
    pub min_connections: usize,
    /// How many relays a publish fans out to
    pub publish_redundancy: usize,
    /// Per-relay publish deadline
    pub publish_timeout: Duration,
    /// Deadline for the WebSocket handshake
    pub connect_timeout: Duration,
    /// Health-check cadence
    pub health_check_interval: Duration,
    /// Bound on the routing-result log (FIFO eviction)
    pub max_routing_results: usize,
    /// Bound on the global event → relays index (FIFO eviction)
    pub max_seen_events: usize,
    /// Relays pinned to the front of every selection
    pub primary_relays: HashSet<String>,
    /// Reconnect schedule
    pub backoff: BackoffConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 5,
            publish_redundancy: 5,
            publish_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(60),
            max_routing_results: 1_000,
            max_seen_events: 10_000,
            primary_relays: HashSet::new(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Outbox queue behavior.
#[derive(Clone, Debug)]
pub struct OutboxConfig {
    /// Oldest entries are dropped beyond this size
    pub max_queue_size: usize,
    /// Entries are dropped after this many failed flush attempts
    pub max_retries: u32,
    /// Entries older than this are pruned without a send attempt
    pub max_event_age: Duration,
    /// Storage key this outbox exclusively owns
    pub storage_key: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_retries: 5,
            max_event_age: Duration::from_secs(24 * 60 * 60),
            storage_key: "outbox".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let backoff = BackoffConfig {
            initial_ms: 100,
            multiplier: 2.0,
            max_ms: 1_000,
            jitter_ms: 0,
            max_attempts: 5,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(800));
        // Capped at max from the fifth attempt on.
        assert_eq!(backoff.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for(20), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let backoff = BackoffConfig {
            initial_ms: 100,
            multiplier: 2.0,
            max_ms: 1_000,
            jitter_ms: 50,
            max_attempts: 5,
        };
        for _ in 0..100 {
            let delay = backoff.delay_for(1).as_millis() as u64;
            assert!((100..150).contains(&delay));
        }
    }

    #[test]
    fn test_defaults_match_contract() {
        let pool = PoolConfig::default();
        assert_eq!(pool.min_connections, 5);
        assert_eq!(pool.publish_redundancy, 5);
        assert_eq!(pool.publish_timeout, Duration::from_secs(10));
        assert_eq!(pool.backoff.initial_ms, 1_000);
        assert_eq!(pool.backoff.max_ms, 300_000);
        assert_eq!(pool.backoff.max_attempts, 20);

        let outbox = OutboxConfig::default();
        assert_eq!(outbox.max_queue_size, 100);
        assert_eq!(outbox.max_retries, 5);
        assert_eq!(outbox.max_event_age, Duration::from_secs(86_400));
    }
}
