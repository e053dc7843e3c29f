// src/models/queue.rs
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::rabbitmq::errors::{QueueError, Result};

/// Header key carrying the logical destination of a header-routed message.
pub const DESTINATION_HEADER: &str = "Destination";

/// AMQP port used when a binding leaves `port` at zero.
pub const DEFAULT_AMQP_PORT: u16 = 5672;

/// Address of a RabbitMQ server and the exchange to use on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEndpoint {
    /// Host name of the broker.
    pub endpoint: String,

    /// Broker port, 0 selects the AMQP default.
    #[serde(default)]
    pub port: u16,

    /// Virtual host, `/` when absent or empty.
    #[serde(default)]
    pub virtual_host: Option<String>,

    /// The exchange to publish to or listen on.
    pub exchange: String,
}

impl QueueEndpoint {
    pub fn new(endpoint: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            port: 0,
            virtual_host: None,
            exchange: exchange.into(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.virtual_host = Some(virtual_host.into());
        self
    }

    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_AMQP_PORT
        } else {
            self.port
        }
    }

    pub fn effective_virtual_host(&self) -> &str {
        match self.virtual_host.as_deref() {
            Some(vhost) if !vhost.is_empty() => vhost,
            _ => "/",
        }
    }

    /// Checks the fields needed to open a connection.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(QueueError::ConfigurationError(
                "endpoint cannot be empty".to_string(),
            ));
        }
        if self.exchange.trim().is_empty() {
            return Err(QueueError::ConfigurationError(format!(
                "exchange cannot be empty for endpoint {}",
                self.endpoint
            )));
        }
        Ok(())
    }
}

/// Binding to a topic exchange through a routing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicBinding {
    #[serde(flatten)]
    pub endpoint: QueueEndpoint,

    /// Routing key (or pattern when consuming), e.g. `files.site_a.*`.
    pub routing_key: String,
}

impl TopicBinding {
    pub fn new(endpoint: QueueEndpoint, routing_key: impl Into<String>) -> Self {
        Self {
            endpoint,
            routing_key: routing_key.into(),
        }
    }

    pub fn queue_name(&self) -> String {
        format!("{}Queue", self.routing_key)
    }
}

/// How the headers of a binding are matched by the exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderMatch {
    #[default]
    Any,
    All,
}

impl HeaderMatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeaderMatch::Any => "any",
            HeaderMatch::All => "all",
        }
    }
}

/// Binding to a headers exchange, filtered by a header map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderBinding {
    #[serde(flatten)]
    pub endpoint: QueueEndpoint,

    /// Headers attached when sending and matched when consuming.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Logical queue name; the broker queue is `{queue_name}Queue`.
    pub queue_name: String,

    #[serde(default)]
    pub match_mode: HeaderMatch,
}

impl HeaderBinding {
    pub fn new(endpoint: QueueEndpoint, queue_name: impl Into<String>) -> Self {
        Self {
            endpoint,
            headers: HashMap::new(),
            queue_name: queue_name.into(),
            match_mode: HeaderMatch::default(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_destination(self, destination: impl Into<String>) -> Self {
        self.with_header(DESTINATION_HEADER, destination)
    }

    pub fn with_match_mode(mut self, match_mode: HeaderMatch) -> Self {
        self.match_mode = match_mode;
        self
    }

    pub fn destination(&self) -> Option<&str> {
        self.headers.get(DESTINATION_HEADER).map(String::as_str)
    }

    pub fn queue_name(&self) -> String {
        format!("{}Queue", self.queue_name)
    }

    /// Arguments for binding the queue: the header map plus `x-match`.
    pub fn bind_arguments(&self) -> HashMap<String, String> {
        let mut arguments = self.headers.clone();
        arguments.insert("x-match".to_string(), self.match_mode.as_str().to_string());
        arguments
    }
}

/// The two kinds of exchange binding a dispatcher manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Topic,
    Header,
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingKind::Topic => write!(f, "topic"),
            BindingKind::Header => write!(f, "header"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Topic(TopicBinding),
    Header(HeaderBinding),
}

impl Binding {
    pub fn kind(&self) -> BindingKind {
        match self {
            Binding::Topic(_) => BindingKind::Topic,
            Binding::Header(_) => BindingKind::Header,
        }
    }

    pub fn endpoint(&self) -> &QueueEndpoint {
        match self {
            Binding::Topic(topic) => &topic.endpoint,
            Binding::Header(header) => &header.endpoint,
        }
    }

    /// Broker queue consumed for this binding.
    pub fn queue_name(&self) -> String {
        match self {
            Binding::Topic(topic) => topic.queue_name(),
            Binding::Header(header) => header.queue_name(),
        }
    }

    /// Validation run before a receive loop is started.
    pub fn validate(&self) -> Result<()> {
        self.endpoint().validate()?;
        if let Binding::Header(header) = self {
            if header.destination().is_none() {
                return Err(QueueError::DestinationMissing {
                    queue_name: header.queue_name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Per-call broker identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}
