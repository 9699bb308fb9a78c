//! AMQP Consumer
//!
//! A resilient consumer that pulls messages from one AMQP queue and hands them
//! to the application through bounded queues.
//!
//! ## Features
//!
//! - **Channel re-acquisition**: a broker-closed channel is replaced transparently
//! - **Fixed backoff**: failed acquisitions and consumes are retried forever
//! - **Bounded queues**: messages and errors are buffered with fixed capacities
//! - **Drain on stop**: graceful stop waits for every pulled delivery to be queued
//! - **Prometheus metrics**: built-in observability
//!
//! The consumer never acks. Each [`Message`] carries the channel it arrived on so
//! the application can settle it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use amqp_consumer::{Consumer, ConsumerConfig, PoolConfig};
//!
//! let config = ConsumerConfig::new("orders", "orders-worker")
//!     .with_buffers(100, 10)
//!     .with_qos_override(20, 65536);
//!
//! let consumer = Consumer::new(config, PoolConfig::default(), channel_pool)?;
//! consumer.start_consuming().await?;
//!
//! // ... read consumer.messages() and consumer.errors() ...
//!
//! consumer.stop_consuming(false).await?;
//! consumer.stopped().await;
//! ```

mod channel;
mod config;
mod consumer;
mod engine;
mod error;
mod in_flight;
mod message;
pub mod metrics;
mod queue;

pub use channel::{
    AmqpChannel, ChannelError, ChannelHost, ChannelSource, CloseReason, ConsumeOptions,
    Delivery, DeliveryStream, FieldTable,
};
pub use config::{ConsumerConfig, PoolConfig, RabbitConfig};
pub use consumer::Consumer;
pub use error::{ConsumerError, ErrorCategory};
pub use message::Message;
pub use metrics::{init_metrics, render_metrics, ConsumerMetrics};
pub use queue::QueueReader;
