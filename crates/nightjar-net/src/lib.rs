//! nightjar networking library
//!
//! Relay-facing half of the nightjar messaging core: the typed relay wire
//! protocol, per-relay connection supervision with backoff and scoring,
//! the publish/subscribe router, the durable outbox, and the client facade
//! that binds them to the host's connectivity signal.
//!
//! # Modules
//!
//! - [`wire`]: client↔relay JSON message codec
//! - [`relay`]: per-relay state machine, stats, WebSocket actor
//! - [`pool`]: publish fan-out, subscription fan-in, relay selection
//! - [`geo`]: Haversine proximity helpers
//! - [`defaults`]: geo-annotated default relay set
//! - [`outbox`]: durable store-and-forward queue
//! - [`store`]: persistence seam (sled / in-memory)
//! - [`client`]: the facade a chat UI talks to
//! - [`config`]: tunables and their defaults

pub mod client;
pub mod config;
pub mod defaults;
pub mod geo;
pub mod outbox;
pub mod pool;
pub mod relay;
pub mod store;
pub mod wire;

pub use client::Client;
pub use config::{BackoffConfig, OutboxConfig, PoolConfig};
pub use outbox::{Outbox, OutboxSender, QueuedEvent};
pub use pool::{
    MessageRoutingResult, PublishResult, RelayPool, SubscriptionHandle, SubscriptionOptions,
};
pub use relay::{ConnectionState, RelayState, RelayStats};
pub use store::{MemoryStore, SledStore, StateStore};
