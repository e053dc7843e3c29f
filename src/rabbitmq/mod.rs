// src/rabbitmq/mod.rs
// Broker-facing layer: transport traits, the lapin and in-memory transports, codecs

pub mod codec;
pub mod connection;
pub mod errors;
pub mod memory;
pub mod transport;

// Re-export specific items to simplify imports elsewhere
pub use codec::{Codec, JsonCodec};
pub use connection::LapinTransport;
pub use errors::{QueueError, Result};
pub use memory::MemoryTransport;
pub use transport::{BrokerChannel, Delivery, ExchangeType, PublishRequest, Transport};
