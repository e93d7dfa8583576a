//! Client facade
//!
//! Binds the relay pool, the outbox, and the host's connectivity signal
//! into the surface a chat UI talks to. Publishes fall back to the outbox
//! while offline; the outbox drains when the host reports connectivity.

use crate::config::{OutboxConfig, PoolConfig};
use crate::outbox::{Outbox, OutboxSender};
use crate::pool::{
    EventCallback, PublishResult, RelayPool, SubscriptionHandle, SubscriptionOptions,
};
use crate::store::StateStore;
use futures_util::future::BoxFuture;
use nightjar_core::types::{Event, Filter};
use std::sync::Arc;
use tracing::info;

/// Outbox sender backed by the relay pool: targeted relays when the entry
/// names them, best-available fan-out otherwise.
struct PoolSender {
    pool: RelayPool,
}

impl OutboxSender for PoolSender {
    fn send(&self, event: &Event, relay_urls: &[String]) -> BoxFuture<'static, PublishResult> {
        let pool = self.pool.clone();
        let event = event.clone();
        let relay_urls = relay_urls.to_vec();
        Box::pin(async move {
            if relay_urls.is_empty() {
                pool.publish(&event).await
            } else {
                pool.publish_to(&event, &relay_urls).await
            }
        })
    }
}

/// The messaging client: one pool, one outbox, one storage namespace.
pub struct Client {
    pool: RelayPool,
    outbox: Arc<Outbox>,
}

impl Client {
    /// Assemble a client. The store (when given) is shared by the pool's
    /// relay-state document and the outbox queue, under distinct keys.
    pub fn new(
        pool_config: PoolConfig,
        outbox_config: OutboxConfig,
        store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        let pool = RelayPool::new(pool_config, store.clone());
        let sender: Arc<dyn OutboxSender> = Arc::new(PoolSender { pool: pool.clone() });
        let outbox_store = store.unwrap_or_else(|| Arc::new(crate::store::MemoryStore::new()));
        let outbox = Arc::new(Outbox::new(outbox_config, outbox_store, sender));
        Self { pool, outbox }
    }

    /// Start background supervision (event dispatch, health checks).
    pub fn start(&self) {
        self.pool.start();
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Publish an event, or queue it when no relay is connected.
    ///
    /// The queued case reports `success: false`: the network has not
    /// carried the event yet, the outbox only promises to keep trying.
    pub async fn publish(&self, event: Event, relay_urls: Option<Vec<String>>) -> PublishResult {
        if self.pool.connected_count() == 0 {
            let event_id = event.id.clone();
            self.outbox
                .enqueue(event, relay_urls.unwrap_or_default());
            return PublishResult {
                event_id,
                relay_results: Default::default(),
                success: false,
            };
        }
        match relay_urls {
            Some(urls) if !urls.is_empty() => self.pool.publish_to(&event, &urls).await,
            _ => self.pool.publish(&event).await,
        }
    }

    /// Open a subscription (delegated to the pool; subscription intent is
    /// not queued across disconnects).
    pub async fn subscribe(
        &self,
        target_relays: Option<Vec<String>>,
        filters: Vec<Filter>,
        on_event: EventCallback,
        options: SubscriptionOptions,
    ) -> SubscriptionHandle {
        self.pool
            .subscribe(target_relays, filters, on_event, options)
            .await
    }

    /// Drain the outbox now.
    pub async fn flush_outbox(&self) {
        self.outbox.flush().await;
    }

    /// Host connectivity callback: on regaining the network, reconnect
    /// and drain the outbox; on losing it, nothing to do (publishes start
    /// queueing on their own once the relays drop).
    pub async fn set_online(&self, online: bool) {
        if online {
            info!("connectivity restored, reconnecting and flushing outbox");
            self.pool.connect_all(None).await;
            self.outbox.flush().await;
        }
    }

    /// Tear down networking: stop supervision, close subscriptions and
    /// transports. Stats, whitelist/blacklist, and the queued outbox all
    /// survive.
    pub async fn disconnect(&self) {
        self.pool.stop();
        self.pool.close_all_subscriptions();
        self.pool.disconnect_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn test_event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "a".repeat(64),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: "hello".into(),
            sig: "b".repeat(128),
        }
    }

    #[tokio::test]
    async fn test_offline_publish_queues() {
        let client = Client::new(
            PoolConfig::default(),
            OutboxConfig::default(),
            Some(Arc::new(MemoryStore::new())),
        );
        let result = client
            .publish(test_event("offline1"), Some(vec!["wss://a".into()]))
            .await;
        assert!(!result.success);
        assert!(result.relay_results.is_empty());
        assert_eq!(client.outbox().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_publish_is_idempotent() {
        let client = Client::new(PoolConfig::default(), OutboxConfig::default(), None);
        client
            .publish(test_event("dup"), Some(vec!["wss://a".into()]))
            .await;
        client
            .publish(test_event("dup"), Some(vec!["wss://b".into()]))
            .await;
        assert_eq!(client.outbox().len(), 1);
        assert_eq!(
            client.outbox().queued_events()[0].relay_urls,
            vec!["wss://a", "wss://b"]
        );
    }

    #[tokio::test]
    async fn test_queue_survives_client_restart() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        {
            let client = Client::new(
                PoolConfig::default(),
                OutboxConfig::default(),
                Some(store.clone()),
            );
            client.publish(test_event("persisted"), None).await;
        }
        let client = Client::new(
            PoolConfig::default(),
            OutboxConfig::default(),
            Some(store),
        );
        assert_eq!(client.outbox().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_preserves_state() {
        let store = Arc::new(MemoryStore::new());
        let client = Client::new(
            PoolConfig::default(),
            OutboxConfig::default(),
            Some(store),
        );
        client.start();
        client.pool().add_to_whitelist("wss://mine");
        client.publish(test_event("kept"), None).await;
        client.disconnect().await;

        assert_eq!(client.outbox().len(), 1);
        assert!(client.pool().relay_state("wss://mine").unwrap().is_whitelisted);
    }
}
