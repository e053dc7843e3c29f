//! Send and receive file messages through RabbitMQ topic and headers
//! exchanges, fanning every received file out to registered observers.

pub mod config;
pub mod dispatch;
pub mod env;
pub mod models;
pub mod rabbitmq;

pub use dispatch::{FileQueueDispatcher, Observer, ObserverError, Subscription};
pub use models::{Credentials, FileMessage, HeaderBinding, HeaderMatch, QueueEndpoint, TopicBinding};
pub use rabbitmq::{QueueError, Result};
pub use tokio_util::sync::CancellationToken;
