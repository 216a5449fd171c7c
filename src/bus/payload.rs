//! Publish payloads and their wire encoding.

use bytes::Bytes;
use serde::Serialize;

use super::{BusError, Result};

/// A payload handed to `Bus::publish`.
///
/// Bytes and text go out unchanged; structured values are JSON encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    /// Serialize any value into a JSON payload.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        // Encoded eagerly: non-string map keys and similar fail here.
        let encoded = serde_json::to_vec(value)?;
        Ok(Payload::Bytes(Bytes::from(encoded)))
    }

    /// Wire representation.
    pub fn into_bytes(self) -> Result<Bytes> {
        match self {
            Payload::Bytes(bytes) => Ok(bytes),
            Payload::Text(text) => Ok(Bytes::from(text)),
            Payload::Json(value) => Ok(Bytes::from(serde_json::to_vec(&value)?)),
        }
    }

    /// Textual representation, for transports that only carry text.
    pub fn into_text(self) -> Result<String> {
        match self {
            Payload::Text(text) => Ok(text),
            Payload::Json(value) => Ok(serde_json::to_string(&value)?),
            Payload::Bytes(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|e| BusError::Serialization(format!("payload is not valid UTF-8: {}", e))),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(Bytes::copy_from_slice(bytes))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}
