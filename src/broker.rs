//! # Pub/sub broker
//!
//! [`PubSub`] multiplexes any number of logical channels and subscriptions
//! over one physical LISTEN connection per instance.
//!
//! - `subscribe` brings the listener up on first use and records new channels
//!   in the instance's registry row.
//! - Incoming notifications are decoded by the pump and fanned out to every
//!   local subscription of the message's channel.
//! - When the last subscription of a channel goes away the channel leaves the
//!   registry row; when the last subscription overall goes away the listener
//!   is torn down.
//!
//! All of these mutations are serialised by one async mutex per instance. The
//! pump reads the routing table without taking that mutex.
//!
//! ```rust,no_run
//! use pg_pubsub::{PubSub, PubSubConfig};
//! use serde_json::json;
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> pg_pubsub::Result<()> {
//! let broker = PubSub::new(pool, PubSubConfig::new().with_name("OrderService"))?;
//! broker.migrate().await?;
//!
//! let mut created = broker.subscribe("orders.created").await?;
//! broker.publish("orders.created", &[json!("order-42")]).await?;
//!
//! if let Some(Ok(message)) = created.recv().await {
//!     let (order_id,): (String,) = message.decode()?;
//!     println!("order {order_id} created");
//! }
//! created.unsubscribe().await?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::codec::{validate_channel, PayloadCodec};
use crate::config::PubSubConfig;
use crate::error::Result;
use crate::listener::{ActiveListener, ConnectionManager, ListenerStats, Routes};
use crate::liveness::ClassId;
use crate::publisher::{self, ChannelPublisher};
use crate::registry::{ListenerRecord, ListenerRegistry};
use crate::subscription::{Mailbox, Subscription};

/// Result of [`PubSub::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStatus {
    /// Registry rows of this class whose liveness lock is held
    pub live_listeners: i64,
}

/// Local view of a broker instance
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    pub listener: ListenerStats,
    pub channels: usize,
    pub subscriptions: usize,
}

#[derive(Debug, Default)]
struct BrokerState {
    active: Option<ActiveListener>,
}

/// State shared by the broker handle and its subscriptions
#[derive(Debug)]
pub(crate) struct BrokerShared {
    pool: PgPool,
    config: Arc<PubSubConfig>,
    registry: ListenerRegistry,
    codec: PayloadCodec,
    connections: ConnectionManager,
    pub(crate) routes: Arc<Routes>,
    state: Mutex<BrokerState>,
    next_subscription_id: AtomicU64,
}

/// Publish/subscribe broker over PostgreSQL LISTEN/NOTIFY
///
/// Cheap to clone; clones share the same physical listener.
#[derive(Debug, Clone)]
pub struct PubSub {
    shared: Arc<BrokerShared>,
}

impl PubSub {
    /// Create a broker; no connection is made until the first subscribe
    pub fn new(pool: PgPool, config: PubSubConfig) -> Result<Self> {
        config.validate()?;

        let config = Arc::new(config);
        let registry = ListenerRegistry::new(&config);
        let routes = Arc::new(Routes::new());
        let connections = ConnectionManager::new(
            pool.clone(),
            Arc::clone(&config),
            registry.clone(),
            Arc::clone(&routes),
        );

        info!(
            name = %config.name,
            class_id = %registry.class_id(),
            schema = %config.schema,
            "Created pub/sub broker"
        );

        Ok(Self {
            shared: Arc::new(BrokerShared {
                pool,
                codec: PayloadCodec::new(config.max_payload_size),
                config,
                registry,
                connections,
                routes,
                state: Mutex::new(BrokerState::default()),
                next_subscription_id: AtomicU64::new(1),
            }),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &PubSubConfig {
        &self.shared.config
    }

    /// Advisory-lock namespace of this broker
    pub fn class_id(&self) -> ClassId {
        self.shared.registry.class_id()
    }

    /// Create the registry schema and table if missing
    pub async fn migrate(&self) -> Result<()> {
        self.shared.registry.migrate(&self.shared.pool).await
    }

    /// Subscribe to a logical channel
    ///
    /// Two subscriptions to the same channel each receive every message.
    #[instrument(skip(self), fields(class_id = %self.class_id()))]
    pub async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        validate_channel(channel)?;
        let shared = &self.shared;

        let mut state = shared.state.lock().await;
        let listener_id = shared.ensure_listening(&mut state).await?;

        if !shared.routes.contains_key(channel) {
            let mut channels = shared.channel_names();
            channels.push(channel.to_string());

            if let Err(e) = shared
                .registry
                .update_channels(&shared.pool, listener_id, &channels)
                .await
            {
                // Leave the instance as it was before the call
                if shared.routes.is_empty() {
                    if let Some(active) = state.active.take() {
                        shared.connections.teardown(active).await;
                    }
                }
                return Err(e);
            }
        }

        let id = shared.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let (mailbox, subscription) = Subscription::open(
            id,
            channel,
            shared.config.backlog_warning_threshold,
            Arc::clone(shared),
        );
        if shared.route(channel, mailbox, listener_id, state.active.as_ref()) {
            debug!(subscription_id = id, listener_id, "Subscribed");
        }
        Ok(subscription)
    }

    /// Remove a subscription; same as [`Subscription::unsubscribe`]
    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<()> {
        subscription.unsubscribe().await
    }

    /// Publish to every live listener of this class subscribed to `channel`
    ///
    /// Returns how many physical listeners were notified.
    pub async fn publish(&self, channel: &str, data: &[Value]) -> Result<u64> {
        self.publish_with(&self.shared.pool, channel, data).await
    }

    /// Publish through a caller-supplied executor, typically a transaction
    ///
    /// Notifications issued inside a transaction are delivered on commit and
    /// discarded on rollback.
    pub async fn publish_with<'c, E>(&self, executor: E, channel: &str, data: &[Value]) -> Result<u64>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let payload = self.shared.codec.encode(channel, data)?;
        publisher::notify_listeners(
            executor,
            &self.shared.registry,
            &self.shared.config.channel_prefix,
            channel,
            &payload,
        )
        .await
    }

    /// Publish any value that serializes to a JSON array
    pub async fn publish_values<T>(&self, channel: &str, data: &T) -> Result<u64>
    where
        T: Serialize + ?Sized,
    {
        let payload = self.shared.codec.encode_values(channel, data)?;
        publisher::notify_listeners(
            &self.shared.pool,
            &self.shared.registry,
            &self.shared.config.channel_prefix,
            channel,
            &payload,
        )
        .await
    }

    /// Publisher bound to a service name, see [`ChannelPublisher`]
    pub fn publisher<S: Into<String>>(&self, service: S) -> ChannelPublisher<'_, PubSub> {
        ChannelPublisher::new(self, service)
    }

    /// Count live listeners of this class
    pub async fn status(&self) -> Result<BrokerStatus> {
        let live_listeners = self.shared.registry.live_count(&self.shared.pool).await?;
        Ok(BrokerStatus { live_listeners })
    }

    /// Delete registry rows of this class whose owners are gone
    pub async fn sweep(&self) -> Result<u64> {
        self.shared.registry.sweep(&self.shared.pool).await
    }

    /// Registry rows of this class
    pub async fn listeners(&self) -> Result<Vec<ListenerRecord>> {
        self.shared.registry.list(&self.shared.pool).await
    }

    /// Id of the current physical listener, if one is up
    pub fn listener_id(&self) -> Option<i32> {
        self.shared.connections.stats().listener_id
    }

    /// Local counters of this broker instance
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            listener: self.shared.connections.stats(),
            channels: self.shared.routes.len(),
            subscriptions: self
                .shared
                .routes
                .iter()
                .map(|entry| entry.value().len())
                .sum(),
        }
    }

    /// End every subscription and tear the listener down
    #[instrument(skip(self), fields(class_id = %self.class_id()))]
    pub async fn shutdown(&self) {
        let mut state = self.shared.state.lock().await;
        // Dropping the mailboxes ends every subscription stream
        self.shared.routes.clear();
        if let Some(active) = state.active.take() {
            self.shared.connections.teardown(active).await;
        }
        info!("Pub/sub broker shut down");
    }

    /// Check whether the database is reachable
    pub async fn is_healthy(&self) -> bool {
        self.shared.pool.acquire().await.is_ok()
    }
}

impl BrokerShared {
    /// Return the running listener's id, bringing one up if needed
    async fn ensure_listening(&self, state: &mut BrokerState) -> Result<i32> {
        if let Some(active) = state.active.take() {
            if active.is_running() {
                let listener_id = active.listener_id();
                state.active = Some(active);
                return Ok(listener_id);
            }
            debug!(
                listener_id = active.listener_id(),
                "Replacing listener whose connection was lost"
            );
            self.connections.teardown(active).await;
        }

        let active = self.connections.establish().await?;
        let listener_id = active.listener_id();
        state.active = Some(active);
        Ok(listener_id)
    }

    fn channel_names(&self) -> Vec<String> {
        self.routes.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Put a new subscription's mailbox into the routing table
    ///
    /// The pump empties the table when its connection drops, so a mailbox
    /// added after that would wait forever. The listener is checked after the
    /// push; if it is gone the mailbox is taken out again and told about the
    /// loss. Returns whether the mailbox stays routed.
    pub(crate) fn route(
        &self,
        channel: &str,
        mailbox: Arc<Mailbox>,
        listener_id: i32,
        active: Option<&ActiveListener>,
    ) -> bool {
        self.routes
            .entry(channel.to_string())
            .or_default()
            .push(Arc::clone(&mailbox));

        if active.is_some_and(ActiveListener::is_running) {
            return true;
        }

        warn!(listener_id, channel, "Listener connection lost while subscribing");
        self.detach(mailbox.id(), channel);
        self.routes.remove_if(channel, |_, mailboxes| mailboxes.is_empty());
        mailbox.connection_lost(listener_id);
        false
    }

    /// Stop routing to a subscription
    ///
    /// Takes the routing table's write lock, so no delivery to the mailbox is
    /// in flight once this returns.
    pub(crate) fn detach(&self, subscription_id: u64, channel: &str) {
        if let Some(mut mailboxes) = self.routes.get_mut(channel) {
            mailboxes.retain(|mailbox| mailbox.id() != subscription_id);
        }
    }

    /// Registry bookkeeping after a subscription of `channel` was detached
    pub(crate) async fn release(&self, channel: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        let channel_emptied = self
            .routes
            .remove_if(channel, |_, mailboxes| mailboxes.is_empty())
            .is_some();

        if self.routes.is_empty() {
            if let Some(active) = state.active.take() {
                self.connections.teardown(active).await;
            }
            return Ok(());
        }

        if channel_emptied {
            if let Some(active) = state.active.as_ref() {
                self.registry
                    .update_channels(&self.pool, active.listener_id(), &self.channel_names())
                    .await?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn detached_for_tests() -> Arc<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/pg_pubsub_unused")
            .expect("lazy pool");
        Arc::clone(&PubSub::new(pool, PubSubConfig::default()).expect("broker").shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_broker_is_idle() {
        let shared = BrokerShared::detached_for_tests();
        let broker = PubSub { shared };

        assert_eq!(broker.listener_id(), None);
        let stats = broker.stats();
        assert!(!stats.listener.connected);
        assert_eq!(stats.channels, 0);
        assert_eq!(stats.subscriptions, 0);
        assert_eq!(broker.class_id(), ClassId::from_name("PubSub"));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/pg_pubsub_unused")
            .unwrap();
        let config = PubSubConfig::new().with_schema("drop table");
        assert!(PubSub::new(pool, config).is_err());
    }

    #[tokio::test]
    async fn test_release_without_listener_is_a_no_op() {
        let shared = BrokerShared::detached_for_tests();
        shared.detach(1, "unknown");
        assert!(shared.release("unknown").await.is_ok());
        assert!(shared.state.lock().await.active.is_none());
    }

    #[tokio::test]
    async fn test_publish_rejects_oversized_payload_before_database() {
        let broker = PubSub {
            shared: BrokerShared::detached_for_tests(),
        };
        let data = [Value::String("x".repeat(8000))];
        let err = broker.publish("c", &data).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::PubSubError::OversizedPayload { .. }
        ));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_empty_channel() {
        let broker = PubSub {
            shared: BrokerShared::detached_for_tests(),
        };
        assert!(matches!(
            broker.subscribe("").await,
            Err(crate::error::PubSubError::ProtocolViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_route_behind_dead_listener_reports_connection_loss() {
        let shared = BrokerShared::detached_for_tests();
        let (existing, _kept) = Subscription::open(1, "orders", 10, Arc::clone(&shared));
        shared
            .routes
            .entry("orders".to_string())
            .or_default()
            .push(existing);

        let (mailbox, mut late) = Subscription::open(2, "orders", 10, Arc::clone(&shared));
        assert!(!shared.route("orders", mailbox, 4, None));

        // The late mailbox is gone again, the existing one untouched
        let routed: Vec<u64> = shared.routes.get("orders").unwrap().iter().map(|m| m.id()).collect();
        assert_eq!(routed, vec![1]);

        assert!(matches!(
            late.try_recv(),
            Some(Err(crate::error::PubSubError::ConnectionLost { listener_id: 4 }))
        ));
        assert!(late.recv().await.is_none());
    }
}
