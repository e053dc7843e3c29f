// src/models/mod.rs

mod file_message;
pub mod queue;

pub use file_message::FileMessage;
pub use queue::{
    Binding, BindingKind, Credentials, HeaderBinding, HeaderMatch, QueueEndpoint, TopicBinding,
    DESTINATION_HEADER,
};
