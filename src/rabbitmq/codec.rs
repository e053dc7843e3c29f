// src/rabbitmq/codec.rs
use serde::{de::DeserializeOwned, Serialize};

use super::errors::{QueueError, Result};

/// Turns typed messages into message bodies and back.
pub trait Codec: Send + Sync + 'static {
    /// Value for the `content_type` property, if the format has one.
    fn content_type(&self) -> Option<&str> {
        None
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> Option<&str> {
        Some("application/json")
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| QueueError::SerializationError(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::DeserializationError(e.to_string()))
    }
}
