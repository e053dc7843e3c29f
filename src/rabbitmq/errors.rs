// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue configuration error: {0}")]
    ConfigurationError(String),

    #[error("Header binding for queue '{queue_name}' has no Destination header")]
    DestinationMissing { queue_name: String },

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(String),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),
}

// Custom Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

impl QueueError {
    /// Errors raised before any broker resource is touched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            QueueError::ConfigurationError(_) | QueueError::DestinationMissing { .. }
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for QueueError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();

        if error_text.contains("connection") || error_text.contains("IO error") {
            QueueError::ConnectionError(error_text)
        } else if error_text.contains("publish") {
            QueueError::PublishError(error_text)
        } else if error_text.contains("consume") {
            QueueError::ConsumeError(error_text)
        } else if error_text.contains("ack") {
            QueueError::AckError(error_text)
        } else {
            QueueError::ChannelError(error_text)
        }
    }
}

impl From<SerdeError> for QueueError {
    fn from(error: SerdeError) -> Self {
        if error.is_data() || error.is_syntax() || error.is_eof() {
            QueueError::DeserializationError(error.to_string())
        } else {
            QueueError::SerializationError(error.to_string())
        }
    }
}

impl From<Elapsed> for QueueError {
    fn from(_: Elapsed) -> Self {
        QueueError::TimeoutError("Connection timed out".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_flagged() {
        assert!(QueueError::ConfigurationError("x".into()).is_configuration());
        assert!(QueueError::DestinationMissing {
            queue_name: "q1".into()
        }
        .is_configuration());
        assert!(!QueueError::ConnectionError("refused".into()).is_configuration());
    }

    #[test]
    fn malformed_json_maps_to_deserialization() {
        let err = serde_json::from_slice::<serde_json::Value>(b"{not json").unwrap_err();
        assert!(matches!(
            QueueError::from(err),
            QueueError::DeserializationError(_)
        ));
    }

    #[test]
    fn destination_missing_names_the_queue() {
        let err = QueueError::DestinationMissing {
            queue_name: "inbox".into(),
        };
        assert!(err.to_string().contains("'inbox'"));
    }
}
