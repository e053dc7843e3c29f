// src/dispatch/publisher.rs
use tracing::{info, warn};

use crate::models::{Credentials, FileMessage, HeaderBinding, QueueEndpoint, TopicBinding};
use crate::rabbitmq::codec::Codec;
use crate::rabbitmq::errors::Result;
use crate::rabbitmq::transport::{ExchangeType, PublishRequest, Transport};

/// Publishes a file to a headers exchange with the binding's headers.
/// Returns once the broker client has accepted the message.
pub async fn publish_to_headers<C: Codec>(
    transport: &dyn Transport,
    codec: &C,
    binding: &HeaderBinding,
    message: &FileMessage,
    credentials: Option<&Credentials>,
) -> Result<()> {
    let request = PublishRequest {
        exchange: binding.endpoint.exchange.clone(),
        routing_key: String::new(),
        headers: Some(binding.headers.clone()),
        persistent: true,
        content_type: codec.content_type().map(str::to_string),
        payload: codec.encode(message)?,
    };
    publish(transport, &binding.endpoint, ExchangeType::Headers, request, credentials).await?;

    info!(
        exchange = %binding.endpoint.exchange,
        destination = ?binding.destination(),
        file = %message.name,
        "Published file message"
    );
    Ok(())
}

/// Publishes a file to a topic exchange with the binding's routing key.
pub async fn publish_to_topic<C: Codec>(
    transport: &dyn Transport,
    codec: &C,
    binding: &TopicBinding,
    message: &FileMessage,
    credentials: Option<&Credentials>,
) -> Result<()> {
    let request = PublishRequest {
        exchange: binding.endpoint.exchange.clone(),
        routing_key: binding.routing_key.clone(),
        headers: None,
        persistent: false,
        content_type: codec.content_type().map(str::to_string),
        payload: codec.encode(message)?,
    };
    publish(transport, &binding.endpoint, ExchangeType::Topic, request, credentials).await?;

    info!(
        exchange = %binding.endpoint.exchange,
        routing_key = %binding.routing_key,
        file = %message.name,
        "Published file message"
    );
    Ok(())
}

async fn publish(
    transport: &dyn Transport,
    endpoint: &QueueEndpoint,
    kind: ExchangeType,
    request: PublishRequest,
    credentials: Option<&Credentials>,
) -> Result<()> {
    endpoint.validate()?;

    let channel = transport.connect(endpoint, credentials).await?;
    let outcome = match channel.declare_exchange(&endpoint.exchange, kind).await {
        Ok(()) => channel.publish(request).await,
        Err(e) => Err(e),
    };

    // The connection lives only for this send.
    if let Err(e) = channel.close().await {
        warn!(exchange = %endpoint.exchange, "Failed to close publish channel: {}", e);
    }
    outcome
}
