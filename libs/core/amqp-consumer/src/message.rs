//! Consumed message
//!
//! Wraps a delivery with the channel it arrived on so the application can
//! settle it later.

use crate::channel::{AmqpChannel, Delivery};
use std::fmt;
use std::sync::Arc;

/// A delivery handed to the application.
#[derive(Clone)]
pub struct Message {
    ackable: bool,
    body: Vec<u8>,
    delivery_tag: u64,
    channel: Arc<dyn AmqpChannel>,
}

impl Message {
    /// Convert a raw delivery into a message.
    ///
    /// `ackable` is true when the consumer was not auto-acking at receipt time.
    pub fn from_delivery(channel: Arc<dyn AmqpChannel>, delivery: Delivery, ackable: bool) -> Self {
        Self {
            ackable,
            body: delivery.body,
            delivery_tag: delivery.delivery_tag,
            channel,
        }
    }

    /// Whether the application must ack/nack this message
    pub fn is_ackable(&self) -> bool {
        self.ackable
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// The channel the delivery arrived on. Delivery tags are only valid there.
    pub fn channel(&self) -> &Arc<dyn AmqpChannel> {
        &self.channel
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("ackable", &self.ackable)
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body.len())
            .field("channel_id", &self.channel.id())
            .finish()
    }
}
