//! # Payload codec
//!
//! Notifications carry a single text payload, so the logical channel and the
//! message travel together in a versioned JSON envelope:
//!
//! ```text
//! {"v":1,"channel":"orders.created","data":["order-42",{"total":12.5}]}
//! ```
//!
//! `data` is always a JSON array. Temporal values are carried as RFC 3339
//! strings and come back as `DateTime` through [`Message::decode`].
//!
//! ## Usage
//!
//! ```rust
//! use pg_pubsub::codec::PayloadCodec;
//! use serde_json::json;
//!
//! let codec = PayloadCodec::new(7800);
//! let text = codec.encode("orders.created", &[json!("order-42")]).unwrap();
//! let message = codec.decode(&text).unwrap();
//!
//! assert_eq!(message.channel, "orders.created");
//! assert_eq!(message.data, vec![json!("order-42")]);
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PubSubError, Result};

/// Envelope version written by this release
pub const WIRE_VERSION: u8 = 1;

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    v: u8,
    channel: &'a str,
    data: &'a [Value],
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    v: u8,
    channel: String,
    data: Value,
}

/// A message delivered to a subscription
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    /// Logical channel the message was published to
    pub channel: String,
    /// Positional message arguments
    pub data: Vec<Value>,
    /// When the notification was decoded by this process
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Deserialize the message arguments into a typed value
    ///
    /// The arguments are presented as a JSON array, so tuples and `Vec`s are
    /// the natural targets.
    ///
    /// ```rust
    /// use chrono::{DateTime, Utc};
    /// use pg_pubsub::codec::PayloadCodec;
    /// use serde_json::json;
    ///
    /// let codec = PayloadCodec::new(7800);
    /// let text = codec
    ///     .encode("jobs", &[json!(7), json!("2024-05-01T10:00:00Z")])
    ///     .unwrap();
    /// let (id, at): (u32, DateTime<Utc>) = codec.decode(&text).unwrap().decode().unwrap();
    /// assert_eq!(id, 7);
    /// assert_eq!(at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    /// ```
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Array(self.data.clone()))?)
    }
}

/// Encodes `(channel, data)` pairs into notification payloads and back
#[derive(Debug, Clone, Copy)]
pub struct PayloadCodec {
    max_payload_size: usize,
}

impl PayloadCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Encode a channel and its positional arguments
    ///
    /// Fails with [`PubSubError::OversizedPayload`] before anything reaches the
    /// database when the envelope exceeds the configured limit.
    pub fn encode(&self, channel: &str, data: &[Value]) -> Result<String> {
        validate_channel(channel)?;

        let payload = serde_json::to_string(&OutgoingEnvelope {
            v: WIRE_VERSION,
            channel,
            data,
        })?;

        // Check payload size limit
        if payload.len() > self.max_payload_size {
            return Err(PubSubError::OversizedPayload {
                size: payload.len(),
                limit: self.max_payload_size,
            });
        }

        Ok(payload)
    }

    /// Encode any value that serializes to a JSON array
    pub fn encode_values<T>(&self, channel: &str, data: &T) -> Result<String>
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_value(data)? {
            Value::Array(items) => self.encode(channel, &items),
            other => Err(PubSubError::protocol(format!(
                "`data` must serialize to an array, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Decode a notification payload
    pub fn decode(&self, payload: &str) -> Result<Message> {
        let envelope: IncomingEnvelope = serde_json::from_str(payload)
            .map_err(|e| PubSubError::protocol(format!("malformed payload: {e}")))?;

        if envelope.v != WIRE_VERSION {
            return Err(PubSubError::protocol(format!(
                "unsupported payload version {}",
                envelope.v
            )));
        }

        let data = match envelope.data {
            Value::Array(items) => items,
            other => {
                return Err(PubSubError::protocol(format!(
                    "payload data must be an array, got {}",
                    json_kind(&other)
                )))
            }
        };

        Ok(Message {
            channel: envelope.channel,
            data,
            received_at: Utc::now(),
        })
    }
}

/// Reject channel names that cannot be routed
pub fn validate_channel(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(PubSubError::protocol("channel name must not be empty"));
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
