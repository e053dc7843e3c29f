// src/dispatch/header_filter.rs
//! Selective consumption for header-routed queues.
//!
//! A headers exchange bound with `x-match: any` hands a queue every message
//! that shares at least one header with the binding. The filter restores
//! exact `Destination` equality on the client: matching deliveries are
//! acknowledged after fan-out, the rest are nacked with requeue so another
//! consumer can take them.

use std::collections::HashMap;
use tracing::{debug, error, warn};

use super::observer::ObserverSet;
use crate::models::{FileMessage, HeaderBinding, DESTINATION_HEADER};
use crate::rabbitmq::codec::Codec;
use crate::rabbitmq::errors::{QueueError, Result};
use crate::rabbitmq::transport::Delivery;

/// What happens to a header-mode delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Destination matched and the body decoded; observers were notified.
    Ack,
    /// Destination missing or different; the broker keeps the message.
    Requeue,
    /// Destination matched but the body could not be decoded.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFilter {
    destination: String,
}

impl HeaderFilter {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
        }
    }

    pub fn for_binding(binding: &HeaderBinding) -> Result<Self> {
        binding
            .destination()
            .map(Self::new)
            .ok_or_else(|| QueueError::DestinationMissing {
                queue_name: binding.queue_name.clone(),
            })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn matches(&self, headers: &HashMap<String, String>) -> bool {
        headers
            .get(DESTINATION_HEADER)
            .map_or(false, |value| *value == self.destination)
    }

    /// Decides the fate of a delivery, decoding and fanning out matches.
    pub fn evaluate<C: Codec>(
        &self,
        delivery: &Delivery,
        codec: &C,
        observers: &ObserverSet,
    ) -> Disposition {
        if !self.matches(&delivery.headers) {
            debug!(
                delivery_tag = delivery.delivery_tag,
                expected = %self.destination,
                found = ?delivery.header(DESTINATION_HEADER),
                "Destination mismatch, requeueing"
            );
            return Disposition::Requeue;
        }

        match codec.decode::<FileMessage>(&delivery.data) {
            Ok(message) => {
                observers.broadcast(&message);
                Disposition::Ack
            }
            Err(e) => {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    destination = %self.destination,
                    "Rejecting undecodable file message: {}", e
                );
                Disposition::Reject
            }
        }
    }

    /// Evaluates a delivery and settles it with the broker.
    pub async fn handle<C: Codec>(
        &self,
        delivery: Delivery,
        codec: &C,
        observers: &ObserverSet,
    ) -> Disposition {
        let disposition = self.evaluate(&delivery, codec, observers);
        let settled = match disposition {
            Disposition::Ack => delivery.ack().await,
            Disposition::Requeue => delivery.nack(true).await,
            Disposition::Reject => delivery.nack(false).await,
        };
        if let Err(e) = settled {
            error!(
                delivery_tag = delivery.delivery_tag,
                ?disposition,
                "Failed to settle delivery: {}", e
            );
        }
        disposition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::observer::{Observer, ObserverError};
    use crate::models::QueueEndpoint;
    use crate::rabbitmq::codec::JsonCodec;
    use crate::rabbitmq::transport::Acker;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Counter {
        seen: Mutex<Vec<String>>,
    }

    impl Observer for Counter {
        fn on_next(&self, message: &FileMessage) -> std::result::Result<(), ObserverError> {
            self.seen.lock().unwrap().push(message.name.clone());
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingAcker {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Acker for RecordingAcker {
        async fn ack(&self) -> Result<()> {
            self.calls.lock().unwrap().push("ack");
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(if requeue { "nack-requeue" } else { "nack-drop" });
            Ok(())
        }
    }

    fn delivery(destination: Option<&str>, body: Vec<u8>, acker: &RecordingAcker) -> Delivery {
        let mut headers = HashMap::new();
        if let Some(destination) = destination {
            headers.insert(DESTINATION_HEADER.to_string(), destination.to_string());
        }
        Delivery::new(1, "", headers, body, Box::new(acker.clone()))
    }

    fn file_body(name: &str) -> Vec<u8> {
        serde_json::to_vec(&FileMessage::new(name, b"data".to_vec())).unwrap()
    }

    fn setup() -> (HeaderFilter, Arc<ObserverSet>, Arc<Counter>) {
        let observers = Arc::new(ObserverSet::new());
        let counter = Arc::new(Counter::default());
        observers.insert(counter.clone());
        (HeaderFilter::new("siteA"), observers, counter)
    }

    #[test]
    fn filter_requires_destination_on_binding() {
        let binding = HeaderBinding::new(QueueEndpoint::new("broker1", "files"), "q1");
        assert!(matches!(
            HeaderFilter::for_binding(&binding),
            Err(QueueError::DestinationMissing { .. })
        ));

        let binding = binding.with_destination("siteA");
        assert_eq!(HeaderFilter::for_binding(&binding).unwrap().destination(), "siteA");
    }

    #[tokio::test]
    async fn matching_delivery_is_dispatched_then_acked() {
        let (filter, observers, counter) = setup();
        let acker = RecordingAcker::default();

        let outcome = filter
            .handle(delivery(Some("siteA"), file_body("a.txt"), &acker), &JsonCodec, &observers)
            .await;

        assert_eq!(outcome, Disposition::Ack);
        assert_eq!(*counter.seen.lock().unwrap(), vec!["a.txt".to_string()]);
        assert_eq!(*acker.calls.lock().unwrap(), vec!["ack"]);
    }

    #[tokio::test]
    async fn other_destination_is_requeued() {
        let (filter, observers, counter) = setup();
        let acker = RecordingAcker::default();

        let outcome = filter
            .handle(delivery(Some("siteB"), file_body("b.txt"), &acker), &JsonCodec, &observers)
            .await;

        assert_eq!(outcome, Disposition::Requeue);
        assert!(counter.seen.lock().unwrap().is_empty());
        assert_eq!(*acker.calls.lock().unwrap(), vec!["nack-requeue"]);
    }

    #[tokio::test]
    async fn missing_destination_is_requeued() {
        let (filter, observers, counter) = setup();
        let acker = RecordingAcker::default();

        let outcome = filter
            .handle(delivery(None, file_body("c.txt"), &acker), &JsonCodec, &observers)
            .await;

        assert_eq!(outcome, Disposition::Requeue);
        assert!(counter.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_match_is_rejected_once() {
        let (filter, observers, counter) = setup();
        let acker = RecordingAcker::default();

        let outcome = filter
            .handle(delivery(Some("siteA"), b"\x00garbage".to_vec(), &acker), &JsonCodec, &observers)
            .await;

        assert_eq!(outcome, Disposition::Reject);
        assert!(counter.seen.lock().unwrap().is_empty());
        assert_eq!(*acker.calls.lock().unwrap(), vec!["nack-drop"]);
    }

    #[test]
    fn destination_comparison_is_exact() {
        let filter = HeaderFilter::new("siteA");
        let mut headers = HashMap::new();
        headers.insert(DESTINATION_HEADER.to_string(), "sitea".to_string());
        assert!(!filter.matches(&headers));
        headers.insert(DESTINATION_HEADER.to_string(), "siteA".to_string());
        assert!(filter.matches(&headers));
    }
}
