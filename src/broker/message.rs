//! Message definitions for the broker link
//!
//! `BrokerMessage` is what a link hands to the multiplexer for every inbound
//! message. `ClientFrame` and `ServerFrame` are the JSON frames exchanged
//! with a pub/sub broker over a WebSocket.
//!
//! Notes on frame fields:
//! - `payload`: message body as a string, usually JSON
//! - `timestamp`: milliseconds since UNIX epoch, stamped by the broker
//! - `message_id` / `qos`: broker bookkeeping, ignored by the gateway

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// An inbound message for a subscribed topic. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub received_at: DateTime<Utc>,
    pub payload: Bytes,
}

impl BrokerMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            received_at: Utc::now(),
            payload: payload.into(),
        }
    }

    /// Build a message stamped with the broker's timestamp, falling back to
    /// the local clock when the broker did not provide one.
    pub fn stamped(timestamp_ms: i64, payload: impl Into<Bytes>) -> Self {
        let received_at = if timestamp_ms > 0 {
            DateTime::<Utc>::from_timestamp_millis(timestamp_ms).unwrap_or_else(Utc::now)
        } else {
            Utc::now()
        };
        Self {
            received_at,
            payload: payload.into(),
        }
    }

    /// The envelope delivered to consumers: `{"timestamp": ms, "data": payload}`.
    ///
    /// JSON payloads are embedded as-is; anything else becomes a JSON string.
    pub fn envelope(&self) -> Value {
        let data = serde_json::from_slice::<Value>(&self.payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&self.payload).into_owned()));
        json!({
            "timestamp": self.received_at.timestamp_millis(),
            "data": data,
        })
    }

    pub fn to_json(&self) -> String {
        self.envelope().to_string()
    }
}

/// Frames the gateway sends to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth { token: String },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

/// Frames the broker sends to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Authenticated {},
    Error {
        message: String,
    },
    Message {
        topic: String,
        payload: String,
        #[serde(default)]
        timestamp: i64,
        #[serde(default)]
        message_id: String,
        #[serde(default)]
        qos: u8,
    },
}
