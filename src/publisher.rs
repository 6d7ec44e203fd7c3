//! Publishing: the targeted NOTIFY statement and publisher handles

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Executor, Postgres};
use tracing::{debug, error, instrument, warn};

use crate::broker::PubSub;
use crate::error::{PubSubError, Result};
use crate::registry::ListenerRegistry;

/// Notify every live listener of the registry's class subscribed to `channel`
///
/// One statement: the registry rows are filtered by channel interest, each
/// candidate's liveness lock is probed with a transaction-scoped try-lock
/// (a failed attempt means its owner is alive), and the survivors receive the
/// payload on their physical channel. Listeners that die between the scan and
/// the notify simply miss the message.
#[instrument(skip(executor, registry, payload), fields(class_id = %registry.class_id()))]
pub(crate) async fn notify_listeners<'c, E>(
    executor: E,
    registry: &ListenerRegistry,
    prefix: &str,
    channel: &str,
    payload: &str,
) -> Result<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    let sql = format!(
        "SELECT pg_notify($1 || id::text, $2) FROM {} \
         WHERE class_id = $3 AND $4 = ANY(channels) \
         AND NOT pg_try_advisory_xact_lock($3, id)",
        registry.table()
    );

    let notified = sqlx::query(&sql)
        .bind(prefix)
        .bind(payload)
        .bind(registry.class_id().value())
        .bind(channel)
        .execute(executor)
        .await
        .map_err(|e| {
            error!("Failed to publish to channel {}: {}", channel, e);
            PubSubError::Database(e)
        })?
        .rows_affected();

    debug!(listeners = notified, "Published notification");
    Ok(notified)
}

/// Anything that can publish positional data to a logical channel
#[async_trait]
pub trait Publish: Send + Sync {
    /// Publish `data` to `channel`, returning how many listeners were notified
    async fn publish(&self, channel: &str, data: &[Value]) -> Result<u64>;

    /// Check if the publisher can currently reach its transport
    async fn is_healthy(&self) -> bool;
}

#[async_trait]
impl Publish for PubSub {
    async fn publish(&self, channel: &str, data: &[Value]) -> Result<u64> {
        PubSub::publish(self, channel, data).await
    }

    async fn is_healthy(&self) -> bool {
        match self.status().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Pub/sub health check failed: {}", e);
                false
            }
        }
    }
}

/// No-operation publisher for testing and disabled scenarios
#[derive(Debug, Clone, Default)]
pub struct NoopPublisher;

#[async_trait]
impl Publish for NoopPublisher {
    async fn publish(&self, channel: &str, data: &[Value]) -> Result<u64> {
        debug!(
            "NoopPublisher: Would publish {} values to channel {}",
            data.len(),
            channel
        );
        Ok(0)
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Publisher bound to a service, deriving channel names from event names
///
/// By default an event `created` of service `Orders` goes to the channel
/// `ordersCreated`. [`ChannelPublisher::channel`] pins every publish to one
/// explicit channel instead.
///
/// ```rust
/// use pg_pubsub::publisher::{ChannelPublisher, NoopPublisher};
///
/// let noop = NoopPublisher;
/// let orders = ChannelPublisher::new(&noop, "OrderService");
/// assert_eq!(orders.channel_for("line_added"), "orderServiceLineAdded");
///
/// let line_added = ChannelPublisher::new(&noop, "OrderService").event("line_added");
/// assert_eq!(line_added.default_channel(), "orderServiceLineAdded");
///
/// let pinned = ChannelPublisher::new(&noop, "OrderService").channel("orders");
/// assert_eq!(pinned.channel_for("line_added"), "orders");
/// ```
#[derive(Debug)]
pub struct ChannelPublisher<'a, P: Publish + ?Sized> {
    publisher: &'a P,
    service: String,
    event: Option<String>,
    pinned: Option<String>,
}

impl<'a, P: Publish + ?Sized> ChannelPublisher<'a, P> {
    pub fn new<S: Into<String>>(publisher: &'a P, service: S) -> Self {
        Self {
            publisher,
            service: service.into(),
            event: None,
            pinned: None,
        }
    }

    /// Send every publish to `channel` regardless of event name
    pub fn channel<S: Into<String>>(mut self, channel: S) -> Self {
        self.pinned = Some(channel.into());
        self
    }

    /// Make `event` the default for [`Self::publish`]
    pub fn event<S: Into<String>>(mut self, event: S) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Channel an event of this service is published on
    pub fn channel_for(&self, event: &str) -> String {
        match &self.pinned {
            Some(channel) => channel.clone(),
            None => camel_case(&format!("{}_{}", self.service, event)),
        }
    }

    /// Channel used when no event name is given
    pub fn default_channel(&self) -> String {
        match (&self.pinned, &self.event) {
            (Some(channel), _) => channel.clone(),
            (None, Some(event)) => self.channel_for(event),
            (None, None) => self.service.clone(),
        }
    }

    /// Publish to the default channel
    pub async fn publish(&self, data: &[Value]) -> Result<u64> {
        self.publisher.publish(&self.default_channel(), data).await
    }

    /// Publish an event on its derived channel
    pub async fn publish_event(&self, event: &str, data: &[Value]) -> Result<u64> {
        self.publisher.publish(&self.channel_for(event), data).await
    }
}

impl ChannelPublisher<'_, PubSub> {
    /// Publish to the default channel inside the caller's transaction
    pub async fn publish_with<'c, E>(&self, executor: E, data: &[Value]) -> Result<u64>
    where
        E: Executor<'c, Database = Postgres>,
    {
        self.publisher
            .publish_with(executor, &self.default_channel(), data)
            .await
    }

    /// Publish an event inside the caller's transaction
    pub async fn publish_event_with<'c, E>(
        &self,
        executor: E,
        event: &str,
        data: &[Value],
    ) -> Result<u64>
    where
        E: Executor<'c, Database = Postgres>,
    {
        self.publisher
            .publish_with(executor, &self.channel_for(event), data)
            .await
    }
}

/// `OrderService_line-added` -> `orderServiceLineAdded`
///
/// Words are split at separators, at lower-to-upper changes and where an
/// acronym meets the next word, so `HTTPRequest_x` becomes `httpRequestX`.
pub fn camel_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());

    for (index, word) in split_words(input).into_iter().enumerate() {
        let mut chars = word.chars();
        let Some(first) = chars.next() else { continue };

        if index == 0 {
            out.extend(first.to_lowercase());
        } else {
            out.extend(first.to_uppercase());
        }
        out.extend(chars.flat_map(char::to_lowercase));
    }

    out
}

fn split_words(input: &str) -> Vec<&str> {
    let mut words = Vec::new();

    let chunks = input
        .split(|c: char| !c.is_alphanumeric())
        .filter(|chunk| !chunk.is_empty());

    for chunk in chunks {
        let chars: Vec<(usize, char)> = chunk.char_indices().collect();
        let mut start = 0;

        for i in 1..chars.len() {
            let (at, current) = chars[i];
            let previous = chars[i - 1].1;
            let next_is_lower = chars.get(i + 1).is_some_and(|(_, c)| c.is_lowercase());

            let boundary = current.is_uppercase()
                && (previous.is_lowercase()
                    || previous.is_numeric()
                    || (previous.is_uppercase() && next_is_lower));
            if boundary {
                words.push(&chunk[start..at]);
                start = at;
            }
        }
        words.push(&chunk[start..]);
    }

    words
}
