//! # Configuration for pg-pubsub
//!
//! Broker settings: which schema holds the listener registry, how physical
//! notification channels are named, how the advisory-lock namespace is chosen,
//! and the payload and backlog limits enforced locally.
//!
//! A configuration is built explicitly and handed to [`crate::PubSub::new`];
//! nothing is read from process-wide state unless [`PubSubConfig::load`] is
//! called.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{PubSubError, Result};
use crate::liveness::ClassId;

/// Hard limit PostgreSQL applies to a NOTIFY payload
pub const NOTIFY_PAYLOAD_LIMIT: usize = 8000;

/// PostgreSQL truncates identifiers beyond this many bytes
const MAX_IDENTIFIER_LEN: usize = 63;

/// Longest prefix that still leaves room for a ten digit listener id
const MAX_PREFIX_LEN: usize = MAX_IDENTIFIER_LEN - 15;

/// Environment variable prefix used by [`PubSubConfig::load`]
pub const ENV_PREFIX: &str = "PUBSUB";

/// Configuration for a pub/sub broker instance
///
/// # Examples
///
/// ```rust
/// use pg_pubsub::config::PubSubConfig;
///
/// let config = PubSubConfig::new()
///     .with_name("OrderService")
///     .with_channel_prefix("orders_pubsub")
///     .with_max_payload_size(4000);
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.listener_channel(42), "orders_pubsub42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Logical broker name; hashed into the lock namespace when `lock_id` is unset
    pub name: String,

    /// Explicit advisory-lock class id, overrides the hash of `name`
    pub lock_id: Option<i32>,

    /// Schema holding the `listeners` registry table
    pub schema: String,

    /// Prefix of every physical channel; the listener id is appended
    pub channel_prefix: String,

    /// Largest encoded payload accepted by publish, in bytes
    pub max_payload_size: usize,

    /// Buffered messages per subscription before backlog warnings are logged
    pub backlog_warning_threshold: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            name: "PubSub".to_string(),
            lock_id: None,
            schema: "pubsub".to_string(),
            channel_prefix: "pubsub".to_string(),
            max_payload_size: 7800, // Leave buffer under 8KB limit
            backlog_warning_threshold: 1000,
        }
    }
}

impl PubSubConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from an optional TOML file overlaid with `PUBSUB_*`
    /// environment variables, then validate it
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Set the logical broker name
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Pin the advisory-lock class id
    pub fn with_lock_id(mut self, lock_id: i32) -> Self {
        self.lock_id = Some(lock_id);
        self
    }

    /// Set the registry schema
    pub fn with_schema<S: Into<String>>(mut self, schema: S) -> Self {
        self.schema = schema.into();
        self
    }

    /// Set the physical channel prefix
    pub fn with_channel_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    /// Set maximum payload size
    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size.min(NOTIFY_PAYLOAD_LIMIT - 1); // Enforce pg_notify limit
        self
    }

    /// Set the per-subscription backlog warning threshold
    pub fn with_backlog_warning_threshold(mut self, threshold: usize) -> Self {
        self.backlog_warning_threshold = threshold;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !is_identifier(&self.schema) {
            return Err(PubSubError::config(format!(
                "schema must be a 1-{MAX_IDENTIFIER_LEN} character SQL identifier, got {:?}",
                self.schema
            )));
        }

        if self.channel_prefix.is_empty() || self.channel_prefix.len() > MAX_PREFIX_LEN {
            return Err(PubSubError::config(format!(
                "channel_prefix must be 1-{MAX_PREFIX_LEN} characters"
            )));
        }
        if !self
            .channel_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
        {
            return Err(PubSubError::config(
                "channel_prefix may only contain ASCII letters, digits, '_', '.', ':' and '-'",
            ));
        }

        if self.max_payload_size == 0 || self.max_payload_size >= NOTIFY_PAYLOAD_LIMIT {
            return Err(PubSubError::config(format!(
                "max_payload_size must be between 1 and {} bytes (pg_notify limit)",
                NOTIFY_PAYLOAD_LIMIT - 1
            )));
        }

        if self.backlog_warning_threshold == 0 {
            return Err(PubSubError::config(
                "backlog_warning_threshold must be greater than zero",
            ));
        }

        if self.lock_id.is_none() && self.name.is_empty() {
            return Err(PubSubError::config("name is required when lock_id is unset"));
        }

        Ok(())
    }

    /// Resolve the advisory-lock class id for this broker
    pub fn class_id(&self) -> ClassId {
        match self.lock_id {
            Some(id) => ClassId::new(id),
            None => ClassId::from_name(&self.name),
        }
    }

    /// Physical channel the listener with `listener_id` LISTENs on
    pub fn listener_channel(&self, listener_id: i32) -> String {
        format!("{}{}", self.channel_prefix, listener_id)
    }

    /// Quoted, schema-qualified registry table name
    pub(crate) fn listeners_table(&self) -> String {
        format!("\"{}\".listeners", self.schema)
    }
}

fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    value.len() <= MAX_IDENTIFIER_LEN && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
