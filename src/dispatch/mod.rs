// src/dispatch/mod.rs
// Subscription and dispatch engine over the broker transport

mod consumer;
pub mod dispatcher;
pub mod header_filter;
pub mod observer;
pub mod publisher;
pub mod subscription;

pub use dispatcher::FileQueueDispatcher;
pub use header_filter::{Disposition, HeaderFilter};
pub use observer::{Observer, ObserverError, ObserverSet, RegistrationId};
pub use subscription::Subscription;
