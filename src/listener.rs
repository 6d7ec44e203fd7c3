//! Physical listener connection lifecycle using sqlx::PgListener
//!
//! Each broker owns at most one dedicated connection. Bringing it up inserts a
//! registry row, takes the liveness lock and LISTENs on `{prefix}{id}`, all on
//! that same session, before the connection is handed to a pump task that
//! decodes notifications and routes them to local mailboxes.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::PayloadCodec;
use crate::config::PubSubConfig;
use crate::error::{PubSubError, Result};
use crate::liveness::LockKey;
use crate::registry::ListenerRegistry;
use crate::subscription::Mailbox;

/// Logical channel -> mailboxes of the local subscriptions interested in it
pub(crate) type Routes = DashMap<String, Vec<Arc<Mailbox>>>;

/// Statistics about the physical listener
#[derive(Debug, Clone, Default)]
pub struct ListenerStats {
    pub connected: bool,
    pub listener_id: Option<i32>,
    pub connections_opened: u64,
    pub notifications_received: u64,
    pub decode_errors: u64,
    pub unrouted_notifications: u64,
    pub connection_errors: u64,
    pub last_notification_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// A running physical listener
pub struct ActiveListener {
    lock: LockKey,
    channel: String,
    shutdown: Option<oneshot::Sender<()>>,
    pump: JoinHandle<Option<PgListener>>,
}

impl std::fmt::Debug for ActiveListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveListener")
            .field("lock", &self.lock)
            .field("channel", &self.channel)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ActiveListener {
    pub fn listener_id(&self) -> i32 {
        self.lock.listener_id
    }

    /// Physical channel this listener is LISTENing on
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether the pump is still reading from the connection
    pub fn is_running(&self) -> bool {
        !self.pump.is_finished()
    }
}

/// Acquires and releases the dedicated listener connection
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    pool: PgPool,
    config: Arc<PubSubConfig>,
    registry: ListenerRegistry,
    codec: PayloadCodec,
    routes: Arc<Routes>,
    stats: Arc<RwLock<ListenerStats>>,
}

impl ConnectionManager {
    pub(crate) fn new(
        pool: PgPool,
        config: Arc<PubSubConfig>,
        registry: ListenerRegistry,
        routes: Arc<Routes>,
    ) -> Self {
        let codec = PayloadCodec::new(config.max_payload_size);
        Self {
            pool,
            config,
            registry,
            codec,
            routes,
            stats: Arc::new(RwLock::new(ListenerStats::default())),
        }
    }

    /// Get listener statistics
    pub fn stats(&self) -> ListenerStats {
        self.stats.read().clone()
    }

    /// Bring up a listener: connection, registry row, liveness lock, LISTEN
    ///
    /// On failure the lock is released, the connection handed back and the
    /// row, if one was inserted, removed on a best-effort basis.
    #[instrument(skip(self), fields(class_id = %self.registry.class_id()))]
    pub async fn establish(&self) -> Result<ActiveListener> {
        info!("Connecting pub/sub listener to database");

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(PubSubError::TransportUnavailable)?;

        let listener_id = self.registry.insert_locked(&mut listener).await?;
        let lock = LockKey::new(self.registry.class_id(), listener_id);
        let channel = self.config.listener_channel(listener_id);

        if let Err(e) = listener.listen(&channel).await {
            error!(listener_id, "Failed to bring up listener: {}", e);
            self.abandon(listener, lock).await;
            return Err(e.into());
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let pump = tokio::spawn(run_pump(
            listener,
            listener_id,
            shutdown_rx,
            Arc::clone(&self.routes),
            self.codec,
            Arc::clone(&self.stats),
        ));

        {
            let mut stats = self.stats.write();
            stats.connected = true;
            stats.listener_id = Some(listener_id);
            stats.connections_opened += 1;
        }

        info!(listener_id, channel = %channel, "Pub/sub listener is up");
        Ok(ActiveListener {
            lock,
            channel,
            shutdown: Some(shutdown_tx),
            pump,
        })
    }

    /// Undo a listener that never started pumping
    ///
    /// The connection goes back to the pool rather than closing, so the
    /// session lock has to be released explicitly before the row is removed.
    async fn abandon(&self, mut listener: PgListener, lock: LockKey) {
        if let Err(e) = lock.release(&mut listener).await {
            warn!(
                listener_id = lock.listener_id,
                "Failed to release liveness lock of failed listener: {}", e
            );
        }
        drop(listener);

        if let Err(e) = self.registry.delete(&self.pool, lock.listener_id).await {
            warn!(
                listener_id = lock.listener_id,
                "Could not remove registry row of failed listener, leaving it for sweep: {}", e
            );
        }
    }

    /// Close the listener connection and sweep its registry row
    ///
    /// Best-effort: failures are logged and teardown carries on, so a broken
    /// connection can never wedge the caller.
    #[instrument(skip(self, active), fields(listener_id = active.listener_id()))]
    pub async fn teardown(&self, mut active: ActiveListener) {
        if let Some(shutdown) = active.shutdown.take() {
            let _ = shutdown.send(());
        }

        match (&mut active.pump).await {
            Ok(Some(mut listener)) => {
                match active.lock.release(&mut listener).await {
                    Ok(true) => debug!("Released liveness lock"),
                    Ok(false) => warn!("Liveness lock was not held at teardown"),
                    Err(e) => warn!("Failed to release liveness lock, relying on session end: {}", e),
                }
                // Dropping the listener UNLISTENs and ends the session
                drop(listener);
            }
            Ok(None) => debug!("Listener connection was already closed"),
            Err(e) => error!("Listener pump task failed: {}", e),
        }

        {
            let mut stats = self.stats.write();
            stats.connected = false;
            stats.listener_id = None;
        }

        if let Err(e) = self.registry.sweep(&self.pool).await {
            warn!("Failed to sweep listener registry during teardown: {}", e);
        }

        info!("Pub/sub listener torn down");
    }
}

/// Read notifications until shutdown or connection loss
///
/// Hands the listener back on shutdown so the caller can release the lock on
/// the same session.
async fn run_pump(
    mut listener: PgListener,
    listener_id: i32,
    mut shutdown: oneshot::Receiver<()>,
    routes: Arc<Routes>,
    codec: PayloadCodec,
    stats: Arc<RwLock<ListenerStats>>,
) -> Option<PgListener> {
    debug!(listener_id, "Started listening for notifications");

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                debug!(listener_id, "Listener pump stopping");
                return Some(listener);
            }
            received = listener.try_recv() => match received {
                Ok(Some(notification)) => {
                    dispatch(&routes, &codec, &stats, notification.payload());
                }
                Ok(None) => {
                    warn!(listener_id, "Listener connection closed by the server");
                    break;
                }
                Err(e) => {
                    error!(listener_id, "Connection error in listener: {}", e);
                    break;
                }
            }
        }
    }

    {
        let mut stats = stats.write();
        stats.connection_errors += 1;
        stats.connected = false;
        stats.last_error_at = Some(Utc::now());
    }

    close_all(&routes, listener_id);
    None
}

/// Decode one notification and hand it to every interested mailbox
pub(crate) fn dispatch(
    routes: &Routes,
    codec: &PayloadCodec,
    stats: &RwLock<ListenerStats>,
    payload: &str,
) {
    {
        let mut stats = stats.write();
        stats.notifications_received += 1;
        stats.last_notification_at = Some(Utc::now());
    }

    let message = match codec.decode(payload) {
        Ok(message) => message,
        Err(e) => {
            {
                let mut stats = stats.write();
                stats.decode_errors += 1;
                stats.last_error_at = Some(Utc::now());
            }
            warn!("Failed to decode notification: {} - payload: {}", e, payload);
            return;
        }
    };

    match routes.get(&message.channel) {
        Some(mailboxes) if !mailboxes.is_empty() => {
            for mailbox in mailboxes.iter() {
                mailbox.deliver(message.clone());
            }
        }
        _ => {
            stats.write().unrouted_notifications += 1;
            debug!(channel = %message.channel, "No local subscription for notification");
        }
    }
}

/// End every subscription after the connection went away
fn close_all(routes: &Routes, listener_id: i32) {
    let channels: Vec<String> = routes.iter().map(|entry| entry.key().clone()).collect();
    for channel in channels {
        if let Some((_, mailboxes)) = routes.remove(&channel) {
            for mailbox in mailboxes {
                mailbox.connection_lost(listener_id);
            }
        }
    }
}
