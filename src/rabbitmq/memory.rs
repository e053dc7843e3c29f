// src/rabbitmq/memory.rs
//! In-process broker implementing the transport traits.
//!
//! Exchanges route with topic patterns (`*`, `#`) or header matching
//! (`x-match` any/all). A message is handed to one consumer of a queue,
//! round robin. Messages nacked with requeue go back to the queue's ready
//! list and are redelivered to the next consumer that attaches, so a lone
//! consumer that rejects a message does not see it again.
//!
//! Every connection, publish and settlement is recorded for inspection.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::errors::{QueueError, Result};
use super::transport::{
    Acker, BrokerChannel, Delivery, DeliveryStream, ExchangeType, PublishRequest, Transport,
};
use crate::models::{Credentials, QueueEndpoint};

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked { requeue: bool },
}

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub endpoint: QueueEndpoint,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueBindRecord {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub arguments: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    headers: HashMap<String, String>,
    data: Vec<u8>,
}

struct ConsumerSlot {
    channel_id: u64,
    auto_ack: bool,
    inbox: mpsc::UnboundedSender<Result<Delivery>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

#[derive(Default)]
struct Broker {
    next_tag: u64,
    next_channel: u64,
    refuse_connections: Option<String>,
    exchanges: HashMap<String, ExchangeType>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBindRecord>,
    connections: Vec<ConnectionRecord>,
    published: Vec<PublishRequest>,
    settlements: Vec<(u64, Settlement)>,
    closed_channels: usize,
}

type SharedBroker = Arc<Mutex<Broker>>;

fn lock(broker: &SharedBroker) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn walk(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| walk(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && walk(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && walk(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    walk(&pattern, &key)
}

/// Headers exchange matching against the binding arguments.
pub fn headers_match(arguments: &HashMap<String, String>, headers: &HashMap<String, String>) -> bool {
    let match_all = arguments.get("x-match").map(String::as_str) == Some("all");
    let mut expected = arguments.iter().filter(|(key, _)| !key.starts_with("x-")).peekable();
    if expected.peek().is_none() {
        return match_all;
    }

    let mut matched = expected.map(|(key, value)| headers.get(key) == Some(value));
    if match_all {
        matched.all(|hit| hit)
    } else {
        matched.any(|hit| hit)
    }
}

impl Broker {
    fn enqueue(&mut self, broker: &SharedBroker, queue: &str, message: StoredMessage) {
        let state = self.queues.entry(queue.to_string()).or_default();
        state.consumers.retain(|slot| !slot.inbox.is_closed());
        if state.consumers.is_empty() {
            state.ready.push_back(message);
            return;
        }

        let index = state.next_consumer % state.consumers.len();
        state.next_consumer = index + 1;
        self.next_tag += 1;
        let tag = self.next_tag;
        let slot = &state.consumers[index];
        let delivery = Delivery::new(
            tag,
            message.routing_key.clone(),
            message.headers.clone(),
            message.data.clone(),
            Box::new(MemoryAcker {
                broker: Arc::clone(broker),
                queue: queue.to_string(),
                tag,
                message,
            }),
        );
        let auto_ack = slot.auto_ack;
        if slot.inbox.send(Ok(delivery)).is_ok() && auto_ack {
            self.settlements.push((tag, Settlement::Acked));
        }
    }

    fn route(&self, request: &PublishRequest) -> Vec<String> {
        let kind = match self.exchanges.get(&request.exchange) {
            Some(kind) => *kind,
            None => return Vec::new(),
        };
        let headers = request.headers.clone().unwrap_or_default();

        let mut queues: Vec<String> = Vec::new();
        for bind in self.bindings.iter().filter(|b| b.exchange == request.exchange) {
            let hit = match kind {
                ExchangeType::Topic => topic_matches(&bind.routing_key, &request.routing_key),
                ExchangeType::Headers => headers_match(&bind.arguments, &headers),
            };
            if hit && !queues.contains(&bind.queue) {
                queues.push(bind.queue.clone());
            }
        }
        queues
    }
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: SharedBroker,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `connect` fail with a connection error.
    pub fn refuse_connections(&self, reason: impl Into<String>) {
        lock(&self.broker).refuse_connections = Some(reason.into());
    }

    pub fn accept_connections(&self) {
        lock(&self.broker).refuse_connections = None;
    }

    /// Puts a message straight on a queue, bypassing exchanges.
    pub fn deliver(&self, queue: &str, headers: HashMap<String, String>, data: Vec<u8>) {
        let mut broker = lock(&self.broker);
        let message = StoredMessage {
            routing_key: String::new(),
            headers,
            data,
        };
        broker.enqueue(&self.broker, queue, message);
    }

    pub fn connections(&self) -> Vec<ConnectionRecord> {
        lock(&self.broker).connections.clone()
    }

    pub fn published(&self) -> Vec<PublishRequest> {
        lock(&self.broker).published.clone()
    }

    pub fn bindings(&self) -> Vec<QueueBindRecord> {
        lock(&self.broker).bindings.clone()
    }

    pub fn exchange_type(&self, exchange: &str) -> Option<ExchangeType> {
        lock(&self.broker).exchanges.get(exchange).copied()
    }

    pub fn settlements(&self) -> Vec<(u64, Settlement)> {
        lock(&self.broker).settlements.clone()
    }

    /// Live consumers attached to a queue.
    pub fn consumer_count(&self, queue: &str) -> usize {
        lock(&self.broker)
            .queues
            .get(queue)
            .map(|state| state.consumers.iter().filter(|slot| !slot.inbox.is_closed()).count())
            .unwrap_or(0)
    }

    /// Messages waiting on a queue for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        lock(&self.broker)
            .queues
            .get(queue)
            .map(|state| state.ready.len())
            .unwrap_or(0)
    }

    pub fn closed_channels(&self) -> usize {
        lock(&self.broker).closed_channels
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        endpoint: &QueueEndpoint,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn BrokerChannel>> {
        let mut broker = lock(&self.broker);
        broker.connections.push(ConnectionRecord {
            endpoint: endpoint.clone(),
            credentials: credentials.cloned(),
        });
        if let Some(reason) = &broker.refuse_connections {
            return Err(QueueError::ConnectionError(format!(
                "{}: {}",
                endpoint.endpoint, reason
            )));
        }

        broker.next_channel += 1;
        Ok(Box::new(MemoryChannel {
            id: broker.next_channel,
            broker: Arc::clone(&self.broker),
        }))
    }
}

struct MemoryChannel {
    id: u64,
    broker: SharedBroker,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<()> {
        let mut broker = lock(&self.broker);
        match broker.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(QueueError::ChannelError(format!(
                "exchange '{}' already declared as {}",
                name,
                existing.as_str()
            ))),
            _ => {
                broker.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str) -> Result<String> {
        let mut broker = lock(&self.broker);
        let name = if name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4())
        } else {
            name.to_string()
        };
        broker.queues.entry(name.clone()).or_default();
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<()> {
        let mut broker = lock(&self.broker);
        if !broker.exchanges.contains_key(exchange) {
            return Err(QueueError::ChannelError(format!("no exchange '{}'", exchange)));
        }
        let record = QueueBindRecord {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            arguments: arguments.clone(),
        };
        if !broker.bindings.contains(&record) {
            broker.bindings.push(record);
        }
        Ok(())
    }

    async fn publish(&self, request: PublishRequest) -> Result<()> {
        let mut broker = lock(&self.broker);
        if !broker.exchanges.contains_key(&request.exchange) {
            return Err(QueueError::PublishError(format!(
                "no exchange '{}'",
                request.exchange
            )));
        }

        for queue in broker.route(&request) {
            let message = StoredMessage {
                routing_key: request.routing_key.clone(),
                headers: request.headers.clone().unwrap_or_default(),
                data: request.payload.clone(),
            };
            broker.enqueue(&self.broker, &queue, message);
        }
        broker.published.push(request);
        Ok(())
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<DeliveryStream> {
        let (inbox, outbox) = mpsc::unbounded_channel();
        let pending: Vec<StoredMessage> = {
            let mut broker = lock(&self.broker);
            let state = broker
                .queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::ConsumeError(format!("no queue '{}'", queue)))?;
            state.consumers.push(ConsumerSlot {
                channel_id: self.id,
                auto_ack,
                inbox,
            });
            state.ready.drain(..).collect()
        };

        {
            let mut broker = lock(&self.broker);
            for message in pending {
                broker.enqueue(&self.broker, queue, message);
            }
        }

        let stream = futures::stream::unfold(outbox, |mut outbox| async move {
            outbox.recv().await.map(|delivery| (delivery, outbox))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        let mut broker = lock(&self.broker);
        for state in broker.queues.values_mut() {
            state.consumers.retain(|slot| slot.channel_id != self.id);
        }
        broker.closed_channels += 1;
        Ok(())
    }
}

struct MemoryAcker {
    broker: SharedBroker,
    queue: String,
    tag: u64,
    message: StoredMessage,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        lock(&self.broker).settlements.push((self.tag, Settlement::Acked));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let mut broker = lock(&self.broker);
        broker
            .settlements
            .push((self.tag, Settlement::Nacked { requeue }));
        if requeue {
            broker
                .queues
                .entry(self.queue.clone())
                .or_default()
                .ready
                .push_back(self.message.clone());
        }
        Ok(())
    }
}
