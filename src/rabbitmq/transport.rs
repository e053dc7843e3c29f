// src/rabbitmq/transport.rs
//! Broker operations the dispatcher relies on.
//!
//! A `Transport` opens one `BrokerChannel` per receive loop or send call.
//! The channel owns its connection and is never shared between loops.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

use super::errors::Result;
use crate::models::{Credentials, QueueEndpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Topic,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

/// A message handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub exchange: String,
    pub routing_key: String,
    pub headers: Option<HashMap<String, String>>,
    /// Delivery mode 2 when set.
    pub persistent: bool,
    pub content_type: Option<String>,
    pub payload: Vec<u8>,
}

/// Settles a single delivery. Never cumulative.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One message received from a consumed queue.
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub headers: HashMap<String, String>,
    pub data: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        routing_key: impl Into<String>,
        headers: HashMap<String, String>,
        data: Vec<u8>,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            routing_key: routing_key.into(),
            headers,
            data,
            acker,
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("headers", &self.headers)
            .field("len", &self.data.len())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A connected channel. Declarations are durable, queues are neither
/// exclusive nor auto-deleted.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<()>;

    /// Returns the name the broker assigned to the queue.
    async fn declare_queue(&self, name: &str) -> Result<String>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<()>;

    async fn publish(&self, request: PublishRequest) -> Result<()>;

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream>;

    /// Releases the channel and its connection.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        endpoint: &QueueEndpoint,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn BrokerChannel>>;
}
