// src/rabbitmq/connection.rs
//! `Transport` backed by lapin. Every call to `connect` dials a fresh
//! connection and opens a single channel on it.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    options::*,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::{AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::errors::{QueueError, Result};
use super::transport::{
    Acker, BrokerChannel, Delivery, DeliveryStream, ExchangeType, PublishRequest, Transport,
};
use crate::models::{Credentials, QueueEndpoint};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LapinTransport {
    connect_timeout: Duration,
}

impl Default for LapinTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl LapinTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

/// Builds the broker URI for an endpoint. Without credentials the URI keeps
/// the broker's default identity.
pub fn amqp_uri(endpoint: &QueueEndpoint, credentials: Option<&Credentials>) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.host = endpoint.endpoint.clone();
    uri.authority.port = endpoint.effective_port();
    uri.vhost = endpoint.effective_virtual_host().to_string();
    if let Some(credentials) = credentials {
        uri.authority.userinfo = AMQPUserInfo {
            username: credentials.user.clone(),
            password: credentials.password.clone(),
        };
    }
    uri
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(
        &self,
        endpoint: &QueueEndpoint,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn BrokerChannel>> {
        info!(
            host = %endpoint.endpoint,
            port = endpoint.effective_port(),
            vhost = %endpoint.effective_virtual_host(),
            "Connecting to RabbitMQ"
        );

        let uri = amqp_uri(endpoint, credentials);
        let connection = tokio::time::timeout(
            self.connect_timeout,
            Connection::connect_uri(uri, ConnectionProperties::default()),
        )
        .await?
        .map_err(|e| {
            error!(host = %endpoint.endpoint, "Failed to connect to RabbitMQ: {}", e);
            QueueError::ConnectionError(e.to_string())
        })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::ChannelError(format!("Failed to create channel: {}", e)))?;

        debug!(channel_id = channel.id(), "Channel opened");
        Ok(Box::new(LapinChannel {
            connection,
            channel,
        }))
    }
}

struct LapinChannel {
    connection: Connection,
    channel: Channel,
}

fn field_table(entries: &HashMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in entries {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

/// String-valued headers of a delivery; other value types are skipped.
fn header_map(properties: &BasicProperties) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            let text = match value {
                AMQPValue::LongString(value) => String::from_utf8_lossy(value.as_bytes()).into_owned(),
                AMQPValue::ShortString(value) => value.as_str().to_string(),
                _ => continue,
            };
            headers.insert(key.as_str().to_string(), text);
        }
    }
    headers
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<()> {
        let kind = match kind {
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Headers => ExchangeKind::Headers,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::ChannelError(format!("Failed to declare exchange: {}", e)))
    }

    async fn declare_queue(&self, name: &str) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::ChannelError(format!("Failed to declare queue: {}", e)))?;

        debug!(queue = %name, messages = queue.message_count(), "Queue declared");
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                field_table(arguments),
            )
            .await
            .map_err(|e| QueueError::ChannelError(format!("Failed to bind queue: {}", e)))
    }

    async fn publish(&self, request: PublishRequest) -> Result<()> {
        let mut properties = BasicProperties::default()
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);
        if request.persistent {
            properties = properties.with_delivery_mode(2);
        }
        if let Some(headers) = &request.headers {
            properties = properties.with_headers(field_table(headers));
        }
        if let Some(content_type) = &request.content_type {
            properties = properties.with_content_type(ShortString::from(content_type.clone()));
        }

        // The publisher confirm is not awaited.
        self.channel
            .basic_publish(
                &request.exchange,
                &request.routing_key,
                BasicPublishOptions::default(),
                &request.payload,
                properties,
            )
            .await
            .map_err(|e| QueueError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &format!("file-queue-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::ConsumeError(e.to_string()))?;

        let stream = consumer.map(|delivery| match delivery {
            Ok(delivery) => Ok(Delivery::new(
                delivery.delivery_tag,
                delivery.routing_key.as_str(),
                header_map(&delivery.properties),
                delivery.data,
                Box::new(ChannelAcker(delivery.acker)),
            )),
            Err(e) => Err(QueueError::ConsumeError(e.to_string())),
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        close_in_order(
            self.channel.close(0, "Closing file queue channel"),
            self.connection.close(0, "Closing file queue connection"),
        )
        .await
    }
}

/// Closes the channel, then the connection. After a broker-side error the
/// channel is already gone, so its failure is only logged and the
/// connection is closed regardless.
async fn close_in_order<E, F>(
    channel: impl Future<Output = std::result::Result<(), E>>,
    connection: impl Future<Output = std::result::Result<(), F>>,
) -> Result<()>
where
    E: fmt::Display,
    QueueError: From<F>,
{
    if let Err(e) = channel.await {
        warn!("Failed to close channel: {}", e);
    }
    connection.await?;
    Ok(())
}

struct ChannelAcker(LapinAcker);

#[async_trait]
impl Acker for ChannelAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|e| QueueError::AckError(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| QueueError::AckError(e.to_string()))
    }
}
