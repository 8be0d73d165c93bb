//! Nachrichten auf dem Peer-to-Peer Data Channel
//!
//! Format: `{ "type": ..., "data": ..., "timestamp": ... }` mit den Typen
//! `translation`, `ping`, `pong` und `control`. Auf ein `ping` antwortet der
//! Empfänger mit einem `pong`, das `originalTimestamp` zurückspiegelt.

use crate::translation::TranslationPayload;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataMessageType {
    Translation,
    Ping,
    Pong,
    Control,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChannelMessage {
    #[serde(rename = "type")]
    pub message_type: DataMessageType,
    #[serde(default)]
    pub data: Value,
    /// Unix ms beim Absender
    pub timestamp: i64,
}

impl DataChannelMessage {
    pub fn ping(now_ms: i64) -> Self {
        Self {
            message_type: DataMessageType::Ping,
            data: json!({ "timestamp": now_ms }),
            timestamp: now_ms,
        }
    }

    pub fn pong(original_timestamp: i64, now_ms: i64) -> Self {
        Self {
            message_type: DataMessageType::Pong,
            data: json!({ "originalTimestamp": original_timestamp }),
            timestamp: now_ms,
        }
    }

    pub fn control(data: Value, now_ms: i64) -> Self {
        Self {
            message_type: DataMessageType::Control,
            data,
            timestamp: now_ms,
        }
    }

    pub fn translation(
        payload: &TranslationPayload,
        now_ms: i64,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_type: DataMessageType::Translation,
            data: serde_json::to_value(payload)?,
            timestamp: now_ms,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Zeitstempel eines Pings; fällt auf den Header zurück
    pub fn ping_timestamp(&self) -> Option<i64> {
        if self.message_type != DataMessageType::Ping {
            return None;
        }
        Some(
            self.data
                .get("timestamp")
                .and_then(Value::as_i64)
                .unwrap_or(self.timestamp),
        )
    }

    pub fn original_timestamp(&self) -> Option<i64> {
        if self.message_type != DataMessageType::Pong {
            return None;
        }
        self.data.get("originalTimestamp").and_then(Value::as_i64)
    }

    /// Antwort auf einen Ping
    pub fn reply_to_ping(&self, now_ms: i64) -> Option<Self> {
        self.ping_timestamp().map(|ts| Self::pong(ts, now_ms))
    }

    /// Round-Trip-Time eines Pongs in ms
    pub fn rtt_ms(&self, now_ms: i64) -> Option<f64> {
        self.original_timestamp()
            .map(|original| (now_ms - original).max(0) as f64)
    }

    pub fn as_translation(&self) -> Option<TranslationPayload> {
        if self.message_type != DataMessageType::Translation {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}
