//! Consumer error types and error categorization
//!
//! Errors are categorized by what the consumer does about them:
//! - **Recoverable**: reported on the error queue, the consuming loop keeps going
//! - **Fatal**: returned synchronously to the caller, nothing was changed

use crate::channel::ChannelError;
use std::fmt;
use thiserror::Error;

/// Category of error for determining how it propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Reported on `errors()`, the loop retries or re-acquires
    Recoverable,
    /// Returned from the call that caused it
    Fatal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Recoverable => write!(f, "recoverable"),
            ErrorCategory::Fatal => write!(f, "fatal"),
        }
    }
}

/// Consumer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// Invalid consumer configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// `start_consuming` on a running consumer
    #[error("can't start an already started consumer")]
    AlreadyStarted,

    /// `stop_consuming` on a stopped consumer
    #[error("can't stop a stopped consumer")]
    NotStarted,

    /// The channel source could not lease a channel
    #[error("failed to acquire channel: {0}")]
    Acquisition(#[source] ChannelError),

    /// `basic.consume` failed on a freshly leased channel
    #[error("failed to consume from queue '{queue}': {source}")]
    StreamOpen {
        queue: String,
        #[source]
        source: ChannelError,
    },

    /// A QoS override could not be applied
    #[error("failed to apply qos (count: {prefetch_count}, size: {prefetch_size}): {source}")]
    Qos {
        prefetch_count: u16,
        prefetch_size: u32,
        #[source]
        source: ChannelError,
    },

    /// The broker closed the channel being consumed
    #[error("consumer's current channel closed [reason: {reason}] [code: {code}]")]
    ChannelClosed { reason: String, code: u16 },

    /// The delivery stream ended without a close reason (e.g. consumer cancelled)
    #[error("delivery stream for queue '{queue}' ended")]
    DeliveryStreamEnded { queue: String },
}

impl ConsumerError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        ConsumerError::Config(message.into())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            ConsumerError::Config(_) => ErrorCategory::Fatal,
            ConsumerError::AlreadyStarted => ErrorCategory::Fatal,
            ConsumerError::NotStarted => ErrorCategory::Fatal,
            ConsumerError::Acquisition(_) => ErrorCategory::Recoverable,
            ConsumerError::StreamOpen { .. } => ErrorCategory::Recoverable,
            ConsumerError::Qos { .. } => ErrorCategory::Recoverable,
            ConsumerError::ChannelClosed { .. } => ErrorCategory::Recoverable,
            ConsumerError::DeliveryStreamEnded { .. } => ErrorCategory::Recoverable,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.category() == ErrorCategory::Recoverable
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ConsumerError::Config(_) => "config",
            ConsumerError::AlreadyStarted | ConsumerError::NotStarted => "lifecycle",
            ConsumerError::Acquisition(_) => "acquisition",
            ConsumerError::StreamOpen { .. } => "stream_open",
            ConsumerError::Qos { .. } => "qos",
            ConsumerError::ChannelClosed { .. } => "channel_closed",
            ConsumerError::DeliveryStreamEnded { .. } => "stream_ended",
        }
    }
}
