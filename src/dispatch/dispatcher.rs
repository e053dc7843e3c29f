// src/dispatch/dispatcher.rs
use futures::future::join_all;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::consumer::ReceiveLoop;
use super::observer::{Observer, ObserverSet};
use super::publisher;
use super::subscription::Subscription;
use crate::models::{Binding, BindingKind, Credentials, FileMessage, HeaderBinding, TopicBinding};
use crate::rabbitmq::codec::{Codec, JsonCodec};
use crate::rabbitmq::errors::{QueueError, Result};
use crate::rabbitmq::transport::Transport;

/// Sends file messages and fans received ones out to observers.
///
/// Topic and header bindings are configured separately. The first time an
/// observer subscribes, one receive loop per configured binding of that
/// kind is started; every loop delivers to every registered observer.
/// Subscribe calls on one dispatcher start their loops one at a time.
pub struct FileQueueDispatcher<C: Codec = JsonCodec> {
    transport: Arc<dyn Transport>,
    codec: Arc<C>,
    topics: RwLock<Option<Arc<[TopicBinding]>>>,
    headers: RwLock<Option<Arc<[HeaderBinding]>>>,
    observers: Arc<ObserverSet>,
    starting: Mutex<()>,
}

impl FileQueueDispatcher<JsonCodec> {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_codec(transport, JsonCodec)
    }
}

impl<C: Codec> FileQueueDispatcher<C> {
    pub fn with_codec(transport: Arc<dyn Transport>, codec: C) -> Self {
        Self {
            transport,
            codec: Arc::new(codec),
            topics: RwLock::new(None),
            headers: RwLock::new(None),
            observers: Arc::new(ObserverSet::new()),
            starting: Mutex::new(()),
        }
    }

    /// Replaces the topic bindings. Loops already running keep theirs.
    pub fn configure(&self, topics: Option<Vec<TopicBinding>>) -> Result<()> {
        let topics = topics.ok_or_else(|| {
            QueueError::ConfigurationError("topic bindings cannot be absent".to_string())
        })?;
        info!(count = topics.len(), "Topic bindings configured");
        *self.topics.write().unwrap_or_else(PoisonError::into_inner) = Some(topics.into());
        Ok(())
    }

    /// Replaces the header bindings. Loops already running keep theirs.
    pub fn configure_headers(&self, headers: Option<Vec<HeaderBinding>>) -> Result<()> {
        let headers = headers.ok_or_else(|| {
            QueueError::ConfigurationError("header bindings cannot be absent".to_string())
        })?;
        info!(count = headers.len(), "Header bindings configured");
        *self.headers.write().unwrap_or_else(PoisonError::into_inner) = Some(headers.into());
        Ok(())
    }

    pub fn topic_bindings(&self) -> Option<Arc<[TopicBinding]>> {
        self.topics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn header_bindings(&self) -> Option<Arc<[HeaderBinding]>> {
        self.headers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub async fn subscribe_to_topics(
        &self,
        observer: Arc<dyn Observer>,
        token: CancellationToken,
    ) -> Result<Subscription> {
        self.subscribe(BindingKind::Topic, observer, token, None).await
    }

    pub async fn subscribe_to_topics_with_authentication(
        &self,
        observer: Arc<dyn Observer>,
        token: CancellationToken,
        user: &str,
        password: &str,
    ) -> Result<Subscription> {
        let credentials = Credentials::new(user, password);
        self.subscribe(BindingKind::Topic, observer, token, Some(credentials))
            .await
    }

    pub async fn subscribe_to_headers(
        &self,
        observer: Arc<dyn Observer>,
        token: CancellationToken,
    ) -> Result<Subscription> {
        self.subscribe(BindingKind::Header, observer, token, None).await
    }

    pub async fn subscribe_to_headers_with_authentication(
        &self,
        observer: Arc<dyn Observer>,
        token: CancellationToken,
        user: &str,
        password: &str,
    ) -> Result<Subscription> {
        let credentials = Credentials::new(user, password);
        self.subscribe(BindingKind::Header, observer, token, Some(credentials))
            .await
    }

    pub async fn send_file(&self, binding: &HeaderBinding, message: &FileMessage) -> Result<()> {
        publisher::publish_to_headers(self.transport.as_ref(), self.codec.as_ref(), binding, message, None)
            .await
    }

    pub async fn send_file_with_authentication(
        &self,
        binding: &HeaderBinding,
        message: &FileMessage,
        user: &str,
        password: &str,
    ) -> Result<()> {
        let credentials = Credentials::new(user, password);
        publisher::publish_to_headers(
            self.transport.as_ref(),
            self.codec.as_ref(),
            binding,
            message,
            Some(&credentials),
        )
        .await
    }

    pub async fn send_file_to_topic(&self, binding: &TopicBinding, message: &FileMessage) -> Result<()> {
        publisher::publish_to_topic(self.transport.as_ref(), self.codec.as_ref(), binding, message, None)
            .await
    }

    pub async fn send_file_to_topic_with_authentication(
        &self,
        binding: &TopicBinding,
        message: &FileMessage,
        user: &str,
        password: &str,
    ) -> Result<()> {
        let credentials = Credentials::new(user, password);
        publisher::publish_to_topic(
            self.transport.as_ref(),
            self.codec.as_ref(),
            binding,
            message,
            Some(&credentials),
        )
        .await
    }

    /// Copies the configured bindings of one kind, validated.
    fn snapshot(&self, kind: BindingKind) -> Result<Vec<Binding>> {
        let bindings: Vec<Binding> = match kind {
            BindingKind::Topic => self
                .topic_bindings()
                .ok_or_else(|| QueueError::ConfigurationError("topic bindings are not configured".to_string()))?
                .iter()
                .cloned()
                .map(Binding::Topic)
                .collect(),
            BindingKind::Header => self
                .header_bindings()
                .ok_or_else(|| QueueError::ConfigurationError("header bindings are not configured".to_string()))?
                .iter()
                .cloned()
                .map(Binding::Header)
                .collect(),
        };

        for binding in &bindings {
            binding.validate()?;
        }
        Ok(bindings)
    }

    async fn subscribe(
        &self,
        kind: BindingKind,
        observer: Arc<dyn Observer>,
        token: CancellationToken,
        credentials: Option<Credentials>,
    ) -> Result<Subscription> {
        let bindings = self.snapshot(kind)?;

        // Held until loops are running or rolled back, so a concurrent
        // subscribe of the same observer sees the settled outcome.
        let _starting = self.starting.lock().await;
        let (registration, added) = self.observers.insert(observer);
        if !added {
            debug!(%kind, "Observer already subscribed, no loops started");
            return Ok(Subscription::new(Arc::clone(&self.observers), registration, kind));
        }

        let opened = join_all(bindings.into_iter().map(|binding| {
            ReceiveLoop::open(binding, self.transport.as_ref(), credentials.as_ref())
        }))
        .await;

        let mut loops = Vec::with_capacity(opened.len());
        let mut failure = None;
        for result in opened {
            match result {
                Ok(receive_loop) => loops.push(receive_loop),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            warn!(%kind, "Receive loop failed to start, rolling back subscription: {}", e);
            for receive_loop in loops {
                receive_loop.close().await;
            }
            self.observers.remove(registration);
            return Err(e);
        }

        info!(%kind, loops = loops.len(), "Subscribed observer");
        for receive_loop in loops {
            tokio::spawn(receive_loop.run(
                Arc::clone(&self.codec),
                Arc::clone(&self.observers),
                token.clone(),
            ));
        }

        // The subscribe token bounds the registration as well as the loops.
        // The watcher also ends once the registration is disposed.
        if let Some(released) = self.observers.released(registration) {
            let observers = Arc::clone(&self.observers);
            tokio::spawn(async move {
                tokio::select! {
                    _ = released.cancelled() => {}
                    _ = token.cancelled() => {
                        if observers.remove(registration) {
                            debug!(%kind, "Observer removed on cancellation");
                        }
                    }
                }
            });
        }

        Ok(Subscription::new(Arc::clone(&self.observers), registration, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::memory::MemoryTransport;
    use std::time::Duration;

    struct Quiet;

    impl Observer for Quiet {
        fn on_next(&self, _message: &FileMessage) -> std::result::Result<(), crate::dispatch::ObserverError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn disposed_subscriptions_leave_no_watchers_behind() {
        let dispatcher = FileQueueDispatcher::new(Arc::new(MemoryTransport::new()));
        dispatcher.configure(Some(Vec::new())).unwrap();
        let token = CancellationToken::new();

        for _ in 0..20 {
            let subscription = dispatcher
                .subscribe_to_topics(Arc::new(Quiet), token.clone())
                .await
                .unwrap();
            subscription.dispose();
        }
        assert_eq!(dispatcher.observer_count(), 0);

        // Only the dispatcher itself still holds the observer set once
        // every watcher has finished.
        for _ in 0..200 {
            if Arc::strong_count(&dispatcher.observers) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(Arc::strong_count(&dispatcher.observers), 1);
        assert!(!token.is_cancelled());
    }
}
