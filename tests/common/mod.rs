// tests/common/mod.rs
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use file_queue::dispatch::ObserverError;
use file_queue::rabbitmq::MemoryTransport;
use file_queue::{FileMessage, FileQueueDispatcher, Observer};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Records every file it is handed and forwards it on a channel.
pub struct RecordingObserver {
    seen: Mutex<Vec<FileMessage>>,
    tx: mpsc::UnboundedSender<FileMessage>,
}

impl RecordingObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FileMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            tx,
        });
        (observer, rx)
    }

    pub fn names(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|m| m.name.clone()).collect()
    }
}

impl Observer for RecordingObserver {
    fn on_next(&self, message: &FileMessage) -> Result<(), ObserverError> {
        self.seen.lock().unwrap().push(message.clone());
        let _ = self.tx.send(message.clone());
        Ok(())
    }
}

/// Always fails, to check that fan-out keeps going.
pub struct FailingObserver;

impl Observer for FailingObserver {
    fn on_next(&self, _message: &FileMessage) -> Result<(), ObserverError> {
        Err("observer rejected file".into())
    }
}

pub fn memory_dispatcher() -> (MemoryTransport, FileQueueDispatcher) {
    let transport = MemoryTransport::new();
    let dispatcher = FileQueueDispatcher::new(Arc::new(transport.clone()));
    (transport, dispatcher)
}

pub fn body(name: &str) -> Vec<u8> {
    serde_json::to_vec(&FileMessage::new(name, b"content".to_vec())).unwrap()
}

pub fn destination(value: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert("Destination".to_string(), value.to_string());
    headers
}

pub async fn next_file(rx: &mut mpsc::UnboundedReceiver<FileMessage>) -> FileMessage {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a file message")
        .expect("observer channel closed")
}

/// Asserts nothing arrives within a short window.
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<FileMessage>) {
    if let Ok(Some(message)) = timeout(Duration::from_millis(150), rx.recv()).await {
        panic!("unexpected file message: {}", message.name);
    }
}

/// Polls a condition until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
