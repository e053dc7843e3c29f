// tests/header_routing.rs

mod common;

use common::*;
use file_queue::rabbitmq::memory::Settlement;
use file_queue::rabbitmq::ExchangeType;
use file_queue::{
    CancellationToken, Credentials, FileMessage, HeaderBinding, HeaderMatch, QueueEndpoint, QueueError,
    TopicBinding,
};

fn site(destination: &str, queue_name: &str) -> HeaderBinding {
    HeaderBinding::new(QueueEndpoint::new("broker1", "files"), queue_name).with_destination(destination)
}

#[tokio::test]
async fn matching_destination_is_acked_and_other_is_requeued() {
    // ---
    // Arrange
    // ---
    let (transport, dispatcher) = memory_dispatcher();
    dispatcher.configure_headers(Some(vec![site("siteA", "q1")])).unwrap();
    let (observer, mut rx) = RecordingObserver::new();
    let _subscription = dispatcher
        .subscribe_to_headers(observer.clone(), CancellationToken::new())
        .await
        .unwrap();

    // ---
    // Act
    // ---
    transport.deliver("q1Queue", destination("siteA"), body("for-a.txt"));
    transport.deliver("q1Queue", destination("siteB"), body("for-b.txt"));

    // ---
    // Assert
    // ---
    assert_eq!(next_file(&mut rx).await.name, "for-a.txt");
    assert_quiet(&mut rx).await;
    eventually(|| transport.settlements().len() == 2).await;

    let settlements: Vec<Settlement> = transport.settlements().into_iter().map(|(_, s)| s).collect();
    assert_eq!(
        settlements,
        vec![Settlement::Acked, Settlement::Nacked { requeue: true }]
    );
    assert_eq!(observer.names(), vec!["for-a.txt".to_string()]);
    // The rejected file waits on the queue for another consumer.
    assert_eq!(transport.ready_count("q1Queue"), 1);
}

#[tokio::test]
async fn delivery_without_destination_is_requeued() {
    let (transport, dispatcher) = memory_dispatcher();
    dispatcher.configure_headers(Some(vec![site("siteA", "q1")])).unwrap();
    let (observer, mut rx) = RecordingObserver::new();
    let _subscription = dispatcher
        .subscribe_to_headers(observer, CancellationToken::new())
        .await
        .unwrap();

    transport.deliver("q1Queue", Default::default(), body("nowhere.txt"));

    eventually(|| transport.settlements().len() == 1).await;
    assert_eq!(transport.settlements()[0].1, Settlement::Nacked { requeue: true });
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn undecodable_match_is_dropped_and_loop_continues() {
    let (transport, dispatcher) = memory_dispatcher();
    dispatcher.configure_headers(Some(vec![site("siteA", "q1")])).unwrap();
    let (observer, mut rx) = RecordingObserver::new();
    let _subscription = dispatcher
        .subscribe_to_headers(observer, CancellationToken::new())
        .await
        .unwrap();

    transport.deliver("q1Queue", destination("siteA"), b"{\"broken\":".to_vec());
    transport.deliver("q1Queue", destination("siteA"), body("good.txt"));

    assert_eq!(next_file(&mut rx).await.name, "good.txt");
    eventually(|| transport.settlements().len() == 2).await;
    let settlements: Vec<Settlement> = transport.settlements().into_iter().map(|(_, s)| s).collect();
    assert_eq!(
        settlements,
        vec![Settlement::Nacked { requeue: false }, Settlement::Acked]
    );
    assert_eq!(transport.ready_count("q1Queue"), 0);
}

#[tokio::test]
async fn requeued_file_goes_to_the_right_consumer() {
    let (transport, dispatcher_a) = memory_dispatcher();
    let dispatcher_b = file_queue::FileQueueDispatcher::new(std::sync::Arc::new(transport.clone()));

    // Two sites share one queue; each only keeps its own files.
    dispatcher_a.configure_headers(Some(vec![site("siteA", "shared")])).unwrap();
    dispatcher_b.configure_headers(Some(vec![site("siteB", "shared")])).unwrap();

    let (observer_a, mut rx_a) = RecordingObserver::new();
    let _a = dispatcher_a
        .subscribe_to_headers(observer_a, CancellationToken::new())
        .await
        .unwrap();

    transport.deliver("sharedQueue", destination("siteB"), body("for-b.txt"));
    eventually(|| transport.ready_count("sharedQueue") == 1).await;

    let (observer_b, mut rx_b) = RecordingObserver::new();
    let _b = dispatcher_b
        .subscribe_to_headers(observer_b, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(next_file(&mut rx_b).await.name, "for-b.txt");
    assert_quiet(&mut rx_a).await;
}

#[tokio::test]
async fn credentials_reach_every_header_loop_connection() {
    let (transport, dispatcher) = memory_dispatcher();
    dispatcher
        .configure_headers(Some(vec![site("siteA", "q1"), site("siteB", "q2")]))
        .unwrap();
    let (observer, _rx) = RecordingObserver::new();

    let _subscription = dispatcher
        .subscribe_to_headers_with_authentication(observer, CancellationToken::new(), "files", "secret")
        .await
        .unwrap();

    let connections = transport.connections();
    assert_eq!(connections.len(), 2);
    for connection in &connections {
        assert_eq!(connection.credentials, Some(Credentials::new("files", "secret")));
        assert_eq!(connection.endpoint.exchange, "files");
    }
    assert_eq!(transport.consumer_count("q1Queue"), 1);
    assert_eq!(transport.consumer_count("q2Queue"), 1);
}

#[tokio::test]
async fn header_queue_is_bound_with_match_mode() {
    let (transport, dispatcher) = memory_dispatcher();
    dispatcher
        .configure_headers(Some(vec![site("siteA", "q1").with_match_mode(HeaderMatch::All)]))
        .unwrap();
    let (observer, _rx) = RecordingObserver::new();
    let _subscription = dispatcher
        .subscribe_to_headers(observer, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(transport.exchange_type("files"), Some(ExchangeType::Headers));
    let bindings = transport.bindings();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].queue, "q1Queue");
    assert_eq!(bindings[0].routing_key, "");
    assert_eq!(bindings[0].arguments.get("x-match").map(String::as_str), Some("all"));
    assert_eq!(bindings[0].arguments.get("Destination").map(String::as_str), Some("siteA"));
}

#[tokio::test]
async fn sent_file_reaches_header_subscriber() {
    let (transport, dispatcher) = memory_dispatcher();
    let binding = site("siteA", "q1");
    dispatcher.configure_headers(Some(vec![binding.clone()])).unwrap();
    let (observer, mut rx) = RecordingObserver::new();
    let _subscription = dispatcher
        .subscribe_to_headers(observer, CancellationToken::new())
        .await
        .unwrap();

    let file = FileMessage::new("report.pdf", b"%PDF".to_vec()).with_content_type("application/pdf");
    dispatcher.send_file(&binding, &file).await.expect("send failed");

    let received = next_file(&mut rx).await;
    assert_eq!(received, file);

    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert!(published[0].persistent);
    assert_eq!(published[0].routing_key, "");
    assert_eq!(published[0].content_type.as_deref(), Some("application/json"));
    assert_eq!(
        published[0].headers.as_ref().and_then(|h| h.get("Destination")).map(String::as_str),
        Some("siteA")
    );
    // The send connection is closed once the message is handed over.
    assert_eq!(transport.closed_channels(), 1);
}

#[tokio::test]
async fn send_with_authentication_uses_credentials() {
    let (transport, dispatcher) = memory_dispatcher();
    let binding = site("siteA", "q1");

    dispatcher
        .send_file_with_authentication(&binding, &FileMessage::new("a.txt", Vec::new()), "files", "secret")
        .await
        .unwrap();

    let connections = transport.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].credentials, Some(Credentials::new("files", "secret")));
    assert_eq!(connections[0].endpoint.endpoint, "broker1");
}

#[tokio::test]
async fn send_failure_propagates() {
    let (transport, dispatcher) = memory_dispatcher();
    transport.refuse_connections("broker down");

    let err = dispatcher
        .send_file(&site("siteA", "q1"), &FileMessage::new("a.txt", Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::ConnectionError(_)));
    assert!(transport.published().is_empty());
}

#[tokio::test]
async fn send_to_empty_exchange_is_a_configuration_error() {
    let (transport, dispatcher) = memory_dispatcher();
    let binding = HeaderBinding::new(QueueEndpoint::new("broker1", ""), "q1").with_destination("siteA");

    let err = dispatcher
        .send_file(&binding, &FileMessage::new("a.txt", Vec::new()))
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(transport.connections().is_empty());
}

#[tokio::test]
async fn topic_send_reaches_pattern_subscriber() {
    let (transport, dispatcher) = memory_dispatcher();
    dispatcher
        .configure(Some(vec![TopicBinding::new(
            QueueEndpoint::new("broker1", "files.topic"),
            "files.*",
        )]))
        .unwrap();
    let (observer, mut rx) = RecordingObserver::new();
    let _subscription = dispatcher
        .subscribe_to_topics(observer, CancellationToken::new())
        .await
        .unwrap();

    let target = TopicBinding::new(QueueEndpoint::new("broker1", "files.topic"), "files.siteA");
    dispatcher
        .send_file_to_topic(&target, &FileMessage::new("a.txt", Vec::new()))
        .await
        .unwrap();
    dispatcher
        .send_file_to_topic_with_authentication(
            &TopicBinding::new(QueueEndpoint::new("broker1", "files.topic"), "other.siteA"),
            &FileMessage::new("ignored.txt", Vec::new()),
            "files",
            "secret",
        )
        .await
        .unwrap();

    assert_eq!(next_file(&mut rx).await.name, "a.txt");
    assert_quiet(&mut rx).await;
    assert_eq!(transport.published().len(), 2);
    assert!(!transport.published()[0].persistent);
}
