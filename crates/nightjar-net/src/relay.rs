//! Per-relay connection state, scoring, and the WebSocket actor
//!
//! Each relay URL maps to exactly one [`RelayState`] and at most one actor
//! task owning the transport. The pool drives the state machine:
//!
//! ```text
//! Disconnected -- connect() --> Connecting
//! Connecting   -- ok        --> Connected   (reset attempts)
//! Connecting   -- err       --> Error       (schedule reconnect)
//! Connected    -- closed    --> Error       (schedule reconnect)
//! Any          -- disconnect/blacklist --> Disconnected
//! Error        -- backoff elapsed --> Connecting
//! ```

use crate::geo::Geolocation;
use crate::wire::RelayMessage;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// STATE
// =============================================================================

/// Transport connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Cumulative per-relay statistics. Persisted as JSON; unknown keys from
/// newer builds are tolerated.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub avg_latency_ms: f64,
    pub latency_samples: u64,
    pub connection_attempts: u64,
    pub successful_connections: u64,
    /// Epoch milliseconds of the last successful connection
    pub last_successful_connection: Option<u64>,
    pub reliability_score: f64,
}

impl Default for RelayStats {
    fn default() -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            messages_sent: 0,
            messages_received: 0,
            avg_latency_ms: 0.0,
            latency_samples: 0,
            connection_attempts: 0,
            successful_connections: 0,
            last_successful_connection: None,
            // Unknown relays start neutral.
            reliability_score: 50.0,
        }
    }
}

impl RelayStats {
    /// Fold one latency sample into the running mean.
    pub fn record_latency(&mut self, latency_ms: f64) {
        let total = self.avg_latency_ms * self.latency_samples as f64 + latency_ms;
        self.latency_samples += 1;
        self.avg_latency_ms = total / self.latency_samples as f64;
    }

    pub fn record_publish_success(&mut self, latency_ms: f64) {
        self.success_count += 1;
        self.messages_sent += 1;
        self.record_latency(latency_ms);
    }

    pub fn record_publish_failure(&mut self) {
        self.failure_count += 1;
    }

    pub fn record_connection_attempt(&mut self) {
        self.connection_attempts += 1;
    }

    pub fn record_connection_success(&mut self, latency_ms: f64, now_ms: u64) {
        self.successful_connections += 1;
        self.last_successful_connection = Some(now_ms);
        self.record_latency(latency_ms);
    }

    /// Recompute the reliability score in [0, 100].
    ///
    /// Starts neutral at 50; publish success rate weighs 80, connection
    /// success rate 40, latency 40 (2000 ms maps to 0, 100 ms to ~1),
    /// recency of the last good connection up to 10, primary status 10.
    /// Dimensions with no samples stay neutral.
    pub fn recompute_score(&mut self, is_primary: bool, now_ms: u64) {
        let mut score = 50.0;

        let publishes = self.success_count + self.failure_count;
        if publishes > 0 {
            let success_rate = self.success_count as f64 / publishes as f64;
            score += (success_rate - 0.5) * 80.0;
        }

        if self.connection_attempts > 0 {
            let conn_rate =
                self.successful_connections as f64 / self.connection_attempts as f64;
            score += (conn_rate - 0.5) * 40.0;
        }

        if self.latency_samples > 0 {
            let latency_factor = ((2_000.0 - self.avg_latency_ms) / 1_900.0).clamp(0.0, 1.0);
            score += (latency_factor - 0.5) * 40.0;
        }

        if let Some(last) = self.last_successful_connection {
            let age_ms = now_ms.saturating_sub(last);
            if age_ms <= 60_000 {
                score += 10.0;
            } else if age_ms <= 300_000 {
                score += 5.0;
            }
        }

        if is_primary {
            score += 10.0;
        }

        self.reliability_score = score.clamp(0.0, 100.0);
    }
}

/// Everything the pool tracks about one relay URL.
#[derive(Clone, Debug)]
pub struct RelayState {
    pub url: String,
    pub conn: ConnectionState,
    pub last_error: Option<String>,
    /// Epoch milliseconds
    pub last_connected_at: Option<u64>,
    /// Epoch milliseconds
    pub last_disconnected_at: Option<u64>,
    pub reconnect_attempts: u32,
    /// Epoch milliseconds of the next scheduled reconnect
    pub next_reconnect_at: Option<u64>,
    /// Most recent connection latency
    pub latency_ms: Option<f64>,
    pub geolocation: Option<Geolocation>,
    pub stats: RelayStats,
    pub is_primary: bool,
    pub is_whitelisted: bool,
    pub is_blacklisted: bool,
}

impl RelayState {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            conn: ConnectionState::Disconnected,
            last_error: None,
            last_connected_at: None,
            last_disconnected_at: None,
            reconnect_attempts: 0,
            next_reconnect_at: None,
            latency_ms: None,
            geolocation: None,
            stats: RelayStats::default(),
            is_primary: false,
            is_whitelisted: false,
            is_blacklisted: false,
        }
    }
}

// =============================================================================
// ACTOR
// =============================================================================

/// Commands the pool sends into a relay actor.
pub(crate) enum RelayCommand {
    /// Publish an already-encoded EVENT frame and await the relay's OK
    Publish {
        event_id: String,
        frame: String,
        reply: oneshot::Sender<Result<String, String>>,
    },
    /// Fire-and-forget frame (REQ, CLOSE, AUTH)
    Send { frame: String },
    /// Close the transport and exit
    Close,
}

/// Events a relay actor reports back to the pool.
pub(crate) enum RelayEvent {
    Connected {
        url: String,
        generation: u64,
        latency_ms: f64,
    },
    Disconnected {
        url: String,
        generation: u64,
        error: Option<String>,
    },
    Incoming {
        url: String,
        message: RelayMessage,
    },
}

/// Run the actor for one relay connection attempt.
///
/// Dials the URL, reports `Connected` (with handshake latency) or
/// `Disconnected`, then pumps frames both ways until the transport closes
/// or a [`RelayCommand::Close`] arrives. OK frames resolve their pending
/// publish directly; everything else is forwarded to the pool.
pub(crate) async fn run_relay(
    url: String,
    generation: u64,
    connect_timeout: Duration,
    mut commands: mpsc::Receiver<RelayCommand>,
    events: mpsc::Sender<RelayEvent>,
) {
    let started = Instant::now();
    let stream = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await
    {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(err)) => {
            let _ = events
                .send(RelayEvent::Disconnected {
                    url,
                    generation,
                    error: Some(err.to_string()),
                })
                .await;
            return;
        }
        Err(_) => {
            let _ = events
                .send(RelayEvent::Disconnected {
                    url,
                    generation,
                    error: Some("timeout".into()),
                })
                .await;
            return;
        }
    };
    let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
    let _ = events
        .send(RelayEvent::Connected {
            url: url.clone(),
            generation,
            latency_ms,
        })
        .await;

    let (mut sink, mut source) = stream.split();
    let mut pending: HashMap<String, oneshot::Sender<Result<String, String>>> = HashMap::new();
    let mut close_error: Option<String> = None;
    let mut manual_close = false;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(RelayCommand::Publish { event_id, frame, reply }) => {
                    match sink.send(WsMessage::Text(frame)).await {
                        Ok(()) => {
                            pending.insert(event_id, reply);
                        }
                        Err(err) => {
                            let _ = reply.send(Err(err.to_string()));
                            close_error = Some(err.to_string());
                            break;
                        }
                    }
                }
                Some(RelayCommand::Send { frame }) => {
                    if let Err(err) = sink.send(WsMessage::Text(frame)).await {
                        close_error = Some(err.to_string());
                        break;
                    }
                }
                Some(RelayCommand::Close) | None => {
                    manual_close = true;
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            frame = source.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    match RelayMessage::from_json(&text) {
                        Ok(RelayMessage::Ok { event_id, accepted, message }) => {
                            if let Some(reply) = pending.remove(&event_id) {
                                let result = if accepted {
                                    Ok(message)
                                } else {
                                    Err(message)
                                };
                                let _ = reply.send(result);
                            }
                        }
                        Ok(message) => {
                            let _ = events
                                .send(RelayEvent::Incoming {
                                    url: url.clone(),
                                    message,
                                })
                                .await;
                        }
                        Err(err) => {
                            debug!(%url, %err, "dropping unrecognized relay frame");
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) => {
                    close_error = Some("closed by relay".into());
                    break;
                }
                Some(Ok(_)) => {} // ping/pong/binary: nothing to do
                Some(Err(err)) => {
                    close_error = Some(err.to_string());
                    break;
                }
                None => {
                    close_error = Some("connection closed".into());
                    break;
                }
            }
        }
    }

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err("connection closed".into()));
    }

    if !manual_close {
        if let Some(err) = &close_error {
            warn!(%url, error = %err, "relay transport lost");
        }
        let _ = events
            .send(RelayEvent::Disconnected {
                url,
                generation,
                error: close_error,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_stats_are_neutral() {
        let mut stats = RelayStats::default();
        stats.recompute_score(false, epoch_ms());
        assert_eq!(stats.reliability_score, 50.0);
    }

    #[test]
    fn test_score_stays_in_bounds() {
        let now = epoch_ms();

        let mut perfect = RelayStats::default();
        for _ in 0..50 {
            perfect.record_publish_success(100.0);
        }
        perfect.record_connection_attempt();
        perfect.record_connection_success(80.0, now);
        perfect.recompute_score(true, now);
        assert!(perfect.reliability_score <= 100.0);
        assert!(perfect.reliability_score > 90.0);

        let mut awful = RelayStats::default();
        for _ in 0..50 {
            awful.record_publish_failure();
            awful.record_connection_attempt();
        }
        awful.record_latency(5_000.0);
        awful.recompute_score(false, now);
        assert!(awful.reliability_score >= 0.0);
        assert!(awful.reliability_score < 10.0);
    }

    #[test]
    fn test_primary_and_recency_bonuses() {
        let now = epoch_ms();
        let mut stats = RelayStats::default();
        stats.recompute_score(false, now);
        let base = stats.reliability_score;

        stats.recompute_score(true, now);
        assert_eq!(stats.reliability_score, base + 10.0);

        stats.last_successful_connection = Some(now.saturating_sub(30_000));
        stats.recompute_score(false, now);
        assert_eq!(stats.reliability_score, base + 10.0);

        stats.last_successful_connection = Some(now.saturating_sub(200_000));
        stats.recompute_score(false, now);
        assert_eq!(stats.reliability_score, base + 5.0);

        stats.last_successful_connection = Some(now.saturating_sub(400_000));
        stats.recompute_score(false, now);
        assert_eq!(stats.reliability_score, base);
    }

    #[test]
    fn test_latency_running_mean() {
        let mut stats = RelayStats::default();
        stats.record_latency(100.0);
        stats.record_latency(300.0);
        assert_eq!(stats.avg_latency_ms, 200.0);
        assert_eq!(stats.latency_samples, 2);
    }

    #[test]
    fn test_stats_tolerate_unknown_keys() {
        let stats: RelayStats = serde_json::from_str(
            r#"{"success_count":3,"some_future_field":{"x":1}}"#,
        )
        .unwrap();
        assert_eq!(stats.success_count, 3);
        assert_eq!(stats.failure_count, 0);
    }
}
