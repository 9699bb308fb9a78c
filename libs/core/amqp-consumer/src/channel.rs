//! Channel source contract
//!
//! The consumer does not own broker connections. It leases channels from a
//! [`ChannelSource`] (usually a channel pool) and talks to them through the
//! [`AmqpChannel`] trait, which keeps the engine independent of any particular
//! AMQP client.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Opaque protocol arguments passed through to `basic.consume`.
pub type FieldTable = BTreeMap<String, Value>;

/// Stream of raw deliveries for one `basic.consume` on one channel.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Errors raised by a channel source or a leased channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// No channel could be leased (pool exhausted, connection down, ...)
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    /// The broker rejected a protocol method
    #[error("protocol error {code}: {message}")]
    Protocol { code: u16, message: String },

    /// The channel was already closed when the method was issued
    #[error("channel is closed")]
    Closed,
}

impl ChannelError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        ChannelError::Unavailable(message.into())
    }

    pub fn protocol(code: u16, message: impl Into<String>) -> Self {
        ChannelError::Protocol {
            code,
            message: message.into(),
        }
    }
}

/// Reason the broker (or the client library) gave for closing a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

/// One unit of data pushed by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            body: body.into(),
            ..Default::default()
        }
    }
}

/// Flags for `basic.consume`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
}

/// A leased AMQP channel.
///
/// Implementations wrap a real client channel. `ack`/`nack` are never called by
/// the consumer itself: they are exposed so the application can settle a
/// [`Message`](crate::Message) through the channel it arrived on.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Identifier used for logging.
    fn id(&self) -> u64;

    /// Apply `basic.qos` prefetch limits.
    async fn qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        global: bool,
    ) -> Result<(), ChannelError>;

    /// Start a `basic.consume` and return the resulting delivery stream.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        arguments: &FieldTable,
    ) -> Result<DeliveryStream, ChannelError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), ChannelError>;

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), ChannelError>;
}

/// A channel lease: the channel plus its close-notification feed.
///
/// A reason arriving on `close_notifications` means the channel is dead. If the
/// sender side is dropped without a reason the feed is simply exhausted.
pub struct ChannelHost {
    pub channel: Arc<dyn AmqpChannel>,
    pub close_notifications: mpsc::Receiver<CloseReason>,
}

impl ChannelHost {
    pub fn new(
        channel: Arc<dyn AmqpChannel>,
        close_notifications: mpsc::Receiver<CloseReason>,
    ) -> Self {
        Self {
            channel,
            close_notifications,
        }
    }
}

impl fmt::Debug for ChannelHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHost")
            .field("channel_id", &self.channel.id())
            .finish_non_exhaustive()
    }
}

/// Supplies channels on demand.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Lease a channel.
    async fn acquire(&self) -> Result<ChannelHost, ChannelError>;

    /// Give a channel back once the consumer is done with it.
    ///
    /// `errored` is true when the lease ended because the channel closed or
    /// its delivery stream died. Default: no-op.
    async fn release(&self, channel: Arc<dyn AmqpChannel>, errored: bool) {
        let _ = (channel, errored);
    }
}
