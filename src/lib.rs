#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # pg-pubsub
//!
//! Multi-channel publish/subscribe for services sharing a PostgreSQL database,
//! without running a separate broker.
//!
//! ## Overview
//!
//! PostgreSQL's LISTEN/NOTIFY is connection-scoped, unstructured and knows
//! nothing about who is still alive. This crate turns it into a broker:
//!
//! - **One connection per broker**: every logical channel and subscription of
//!   a [`PubSub`] instance shares a single dedicated LISTEN connection.
//! - **Listener registry**: each physical listener has a row naming the logical
//!   channels it wants, so publishers only wake interested listeners.
//! - **Heartbeat-free liveness**: listeners hold a session advisory lock; a
//!   failed try-lock proves the owner is alive, a successful one proves it gone.
//! - **Backpressure without loss**: subscriptions buffer until the consumer
//!   pulls, and the connection's reader never blocks.
//!
//! ## Module Organization
//!
//! - [`broker`] - the [`PubSub`] broker and its public operations
//! - [`listener`] - physical connection lifecycle and notification pump
//! - [`subscription`] - consumer handles
//! - [`publisher`] - the targeted NOTIFY statement and publisher handles
//! - [`registry`] - listener registry table
//! - [`liveness`] - advisory-lock class ids and keys
//! - [`codec`] - payload wire format
//! - [`channel_metrics`] - subscription backlog monitoring
//! - [`config`] - configuration
//! - [`error`] - structured error handling
//! - [`logging`] - tracing subscriber setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pg_pubsub::{PubSub, PubSubConfig};
//! use futures::StreamExt;
//! use serde_json::json;
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let broker = PubSub::new(pool, PubSubConfig::new().with_name("OrderService"))?;
//! broker.migrate().await?;
//!
//! let mut subscription = broker.subscribe("orders.created").await?;
//! broker.publish("orders.created", &[json!("order-42")]).await?;
//!
//! while let Some(message) = subscription.next().await {
//!     println!("{:?}", message?.data);
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod channel_metrics;
pub mod codec;
pub mod config;
pub mod error;
pub mod listener;
pub mod liveness;
pub mod logging;
pub mod publisher;
pub mod registry;
pub mod subscription;

pub use broker::{BrokerStats, BrokerStatus, PubSub};
pub use codec::{Message, PayloadCodec};
pub use config::PubSubConfig;
pub use error::{PubSubError, Result};
pub use liveness::ClassId;
pub use publisher::{ChannelPublisher, NoopPublisher, Publish};
pub use registry::ListenerRecord;
pub use subscription::Subscription;
