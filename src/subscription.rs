//! Subscription handles and the mailboxes the notification pump routes into

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::broker::BrokerShared;
use crate::channel_metrics::{SubscriptionMetrics, SubscriptionMonitor};
use crate::codec::Message;
use crate::error::{PubSubError, Result};

/// What the pump hands to a subscription
#[derive(Debug)]
pub(crate) enum Delivery {
    Message(Message),
    ConnectionLost { listener_id: i32 },
}

/// Producer side of a subscription, owned by the routing table
#[derive(Debug)]
pub(crate) struct Mailbox {
    id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
    monitor: SubscriptionMonitor,
}

impl Mailbox {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Queue a message without waiting for the consumer
    pub(crate) fn deliver(&self, message: Message) {
        if self.sender.send(Delivery::Message(message)).is_ok() {
            self.monitor.record_routed();
        }
    }

    /// Tell the consumer its physical connection is gone
    pub(crate) fn connection_lost(&self, listener_id: i32) {
        let _ = self.sender.send(Delivery::ConnectionLost { listener_id });
    }
}

/// A consumer's interest in one logical channel
///
/// Messages are buffered until the consumer pulls them, either through
/// [`Subscription::recv`] or the [`Stream`] implementation. Nothing is dropped
/// while the subscription is open.
///
/// Dropping a subscription detaches it immediately and releases its registry
/// interest in the background; [`Subscription::unsubscribe`] does the same
/// but waits for the release to finish.
pub struct Subscription {
    id: u64,
    channel: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    monitor: SubscriptionMonitor,
    broker: Arc<BrokerShared>,
    released: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("backlog", &self.monitor.backlog())
            .finish()
    }
}

impl Subscription {
    pub(crate) fn open(
        id: u64,
        channel: &str,
        warning_threshold: usize,
        broker: Arc<BrokerShared>,
    ) -> (Arc<Mailbox>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let monitor = SubscriptionMonitor::new(channel, warning_threshold);

        let mailbox = Arc::new(Mailbox {
            id,
            sender,
            monitor: monitor.clone(),
        });
        let subscription = Self {
            id,
            channel: channel.to_string(),
            receiver,
            monitor,
            broker,
            released: false,
        };
        (mailbox, subscription)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Logical channel this subscription receives
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message
    ///
    /// Returns `None` once the subscription has ended, and yields
    /// [`PubSubError::ConnectionLost`] once before ending if the physical
    /// connection went away.
    pub async fn recv(&mut self) -> Option<Result<Message>> {
        self.next().await
    }

    /// Take a buffered message without waiting
    pub fn try_recv(&mut self) -> Option<Result<Message>> {
        self.receiver.try_recv().ok().map(|delivery| self.unwrap_delivery(delivery))
    }

    /// Backlog counters of this subscription
    pub fn metrics(&self) -> SubscriptionMetrics {
        self.monitor.metrics()
    }

    /// Stop receiving and release this subscription's registry interest
    ///
    /// Once this resolves no further message is routed to the subscription.
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.released = true;
        self.broker.detach(self.id, &self.channel);
        self.receiver.close();
        self.broker.release(&self.channel).await
    }

    fn unwrap_delivery(&self, delivery: Delivery) -> Result<Message> {
        match delivery {
            Delivery::Message(message) => {
                self.monitor.record_consumed();
                Ok(message)
            }
            Delivery::ConnectionLost { listener_id } => {
                Err(PubSubError::ConnectionLost { listener_id })
            }
        }
    }
}

impl Stream for Subscription {
    type Item = Result<Message>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(delivery)) => Poll::Ready(Some(this.unwrap_delivery(delivery))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        self.broker.detach(self.id, &self.channel);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let broker = Arc::clone(&self.broker);
                let channel = self.channel.clone();
                let id = self.id;
                handle.spawn(async move {
                    match broker.release(&channel).await {
                        Ok(()) => debug!(subscription_id = id, channel = %channel, "Released dropped subscription"),
                        Err(e) => error!(
                            subscription_id = id,
                            channel = %channel,
                            "Failed to release dropped subscription: {}",
                            e
                        ),
                    }
                });
            }
            Err(_) => warn!(
                subscription_id = self.id,
                channel = %self.channel,
                "Subscription dropped outside a tokio runtime; registry row left for sweep"
            ),
        }
    }
}
