// src/dispatch/consumer.rs
//! Receive loops. One loop per binding, each owning its own channel.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::header_filter::HeaderFilter;
use super::observer::ObserverSet;
use crate::models::{Binding, Credentials, FileMessage};
use crate::rabbitmq::codec::Codec;
use crate::rabbitmq::errors::Result;
use crate::rabbitmq::transport::{BrokerChannel, DeliveryStream, ExchangeType, Transport};

/// A receive loop whose channel is set up and consuming, not yet running.
pub(crate) struct ReceiveLoop {
    binding: Binding,
    queue: String,
    channel: Box<dyn BrokerChannel>,
    deliveries: DeliveryStream,
    filter: Option<HeaderFilter>,
}

impl ReceiveLoop {
    /// Connects, declares the exchange and queue, binds them and starts
    /// consuming. Header queues consume with manual acknowledgement.
    pub(crate) async fn open(
        binding: Binding,
        transport: &dyn Transport,
        credentials: Option<&Credentials>,
    ) -> Result<Self> {
        let filter = match &binding {
            Binding::Header(header) => Some(HeaderFilter::for_binding(header)?),
            Binding::Topic(_) => None,
        };

        let channel = transport.connect(binding.endpoint(), credentials).await?;
        match Self::declare_and_consume(&binding, channel.as_ref()).await {
            Ok((queue, deliveries)) => {
                info!(
                    kind = %binding.kind(),
                    exchange = %binding.endpoint().exchange,
                    queue = %queue,
                    "Receive loop consuming"
                );
                Ok(Self {
                    binding,
                    queue,
                    channel,
                    deliveries,
                    filter,
                })
            }
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    warn!("Failed to close channel after setup error: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn declare_and_consume(
        binding: &Binding,
        channel: &dyn BrokerChannel,
    ) -> Result<(String, DeliveryStream)> {
        let exchange = &binding.endpoint().exchange;
        let (queue, routing_key, arguments, auto_ack) = match binding {
            Binding::Topic(topic) => {
                channel.declare_exchange(exchange, ExchangeType::Topic).await?;
                (topic.queue_name(), topic.routing_key.clone(), HashMap::new(), true)
            }
            Binding::Header(header) => {
                channel.declare_exchange(exchange, ExchangeType::Headers).await?;
                (header.queue_name(), String::new(), header.bind_arguments(), false)
            }
        };

        let queue = channel.declare_queue(&queue).await?;
        channel
            .bind_queue(&queue, exchange, &routing_key, &arguments)
            .await?;
        let deliveries = channel.consume(&queue, auto_ack).await?;
        Ok((queue, deliveries))
    }

    pub(crate) async fn close(self) {
        if let Err(e) = self.channel.close().await {
            warn!(queue = %self.queue, "Failed to close channel: {}", e);
        }
    }

    /// Consumes until the token is cancelled or the delivery stream ends,
    /// then releases the channel.
    pub(crate) async fn run<C: Codec>(
        mut self,
        codec: Arc<C>,
        observers: Arc<ObserverSet>,
        token: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!(queue = %self.queue, "Receive loop cancelled");
                    break;
                }
                next = self.deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => match &self.filter {
                    Some(filter) => {
                        filter.handle(delivery, codec.as_ref(), &observers).await;
                    }
                    None => match codec.decode::<FileMessage>(&delivery.data) {
                        Ok(message) => {
                            let delivered = observers.broadcast(&message);
                            debug!(
                                queue = %self.queue,
                                file = %message.name,
                                delivered,
                                "File message dispatched"
                            );
                        }
                        Err(e) => warn!(
                            queue = %self.queue,
                            delivery_tag = delivery.delivery_tag,
                            "Skipping undecodable file message: {}", e
                        ),
                    },
                },
                Some(Err(e)) => {
                    error!(queue = %self.queue, "Receive loop stopped on broker error: {}", e);
                    break;
                }
                None => {
                    warn!(queue = %self.queue, "Delivery stream ended");
                    break;
                }
            }
        }

        debug!(
            kind = %self.binding.kind(),
            exchange = %self.binding.endpoint().exchange,
            "Releasing receive loop channel"
        );
        self.close().await;
    }
}
