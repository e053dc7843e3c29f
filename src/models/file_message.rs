// src/models/file_message.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A file carried over the broker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileMessage {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub content: Vec<u8>,
    #[serde(default)]
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FileMessage {
    /// Creates a FileMessage with the current timestamp and a generated UUID.
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        FileMessage {
            id: Uuid::new_v4(),
            name: name.into(),
            content: content.into(),
            content_type: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}
