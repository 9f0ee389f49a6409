//! Broker seam.
//!
//! The engine talks to the broker through three object-safe traits so the
//! same connection manager, listener and client run over RabbitMQ
//! ([`amqp`]) or the in-process broker ([`memory`]).

pub mod amqp;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors raised by a broker implementation
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Network-class failure while connecting; retried
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// Credentials refused; never retried
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A channel-level operation was refused
    #[error("channel error: {0}")]
    Channel(String),

    /// The connection or channel is no longer open
    #[error("connection closed: {0}")]
    Closed(String),
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Closed(_))
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
        }
    }
}

/// Queue declaration. An empty name asks the broker to generate one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            ..Default::default()
        }
    }

    /// Server-named, exclusive, auto-deleted queue used for replies
    pub fn exclusive_reply() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

/// The message properties the RPC engine reads and writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
}

impl MessageProperties {
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// Out-of-band connection notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Blocked(String),
    Unblocked,
    Shutdown(String),
    CallbackFault(String),
}

pub type EventHandler = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Opens connections to one broker endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Human-readable endpoint, used in logs and errors (no credentials)
    fn endpoint(&self) -> String;

    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Register the handler that receives [`ConnectionEvent`]s
    fn set_event_handler(&self, handler: EventHandler);

    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> BrokerResult<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> BrokerResult<()>;

    /// Declare a queue and return its (possibly broker-generated) name
    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str, auto_ack: bool) -> BrokerResult<DeliveryStream>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> BrokerResult<()>;

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;
}

/// A channel whose publishes are serialized.
///
/// The lock is held only for the duration of a single `publish`.
pub struct SerializedPublisher {
    channel: Arc<dyn BrokerChannel>,
    gate: Mutex<()>,
}

impl SerializedPublisher {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            channel,
            gate: Mutex::new(()),
        }
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> BrokerResult<()> {
        let _guard = self.gate.lock().await;
        self.channel.publish(exchange, routing_key, properties, body).await
    }
}

impl std::fmt::Debug for SerializedPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializedPublisher")
            .field("open", &self.is_open())
            .finish()
    }
}
