//! Consumer configuration
//!
//! `ConsumerConfig` describes one consumer, `PoolConfig` carries the pool-wide
//! QoS that is restored after a channel closes, and `RabbitConfig` is the JSON
//! document that holds both.
//!
//! ```json
//! {
//!   "PoolConfig": { "GlobalQosCount": 50, "GlobalQosSize": 0 },
//!   "ConsumerConfigs": {
//!     "orders": {
//!       "Enabled": true,
//!       "QueueName": "orders",
//!       "ConsumerName": "orders-worker",
//!       "AutoAck": false,
//!       "MessageBuffer": 100,
//!       "ErrorBuffer": 10
//!     }
//!   }
//! }
//! ```

use crate::channel::{ConsumeOptions, FieldTable};
use crate::error::ConsumerError;
use core_config::{env_flag, env_or_default, env_parse, env_required, ConfigError, FromEnv};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const DEFAULT_SLEEP_ON_ERROR_MS: u64 = 1000;
const DEFAULT_SLEEP_ON_IDLE_MS: u64 = 100;

/// Configuration for a single consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConsumerConfig {
    /// Whether the consumer should be started by the application
    pub enabled: bool,

    /// Queue to consume from
    pub queue_name: String,

    /// Consumer tag sent with `basic.consume`
    pub consumer_name: String,

    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub no_local: bool,

    /// Per-channel prefetch count (0 = use the pool default)
    pub qos_count_override: u16,

    /// Per-channel prefetch size (0 = use the pool default)
    pub qos_size_override: u32,

    /// Capacity of the messages queue. Must be non-zero.
    pub message_buffer: usize,

    /// Capacity of the errors queue. Must be non-zero.
    pub error_buffer: usize,

    /// Backoff in milliseconds after a failed acquisition or consume
    pub sleep_on_error_interval: u64,

    /// Pause in milliseconds after a delivery stream ends without a close reason
    pub sleep_on_idle_interval: u64,

    /// Upper bound on deliveries pulled but not yet queued (0 = `message_buffer`)
    pub max_in_flight: usize,

    /// Protocol arguments for `basic.consume`
    pub args: FieldTable,
}

impl ConsumerConfig {
    /// Create a new ConsumerConfig with explicit queue and consumer names
    pub fn new(queue_name: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            consumer_name: consumer_name.into(),
            ..Default::default()
        }
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    /// Set the per-channel QoS override. Only applied when both are non-zero.
    pub fn with_qos_override(mut self, count: u16, size: u32) -> Self {
        self.qos_count_override = count;
        self.qos_size_override = size;
        self
    }

    /// Set the messages and errors queue capacities
    pub fn with_buffers(mut self, message_buffer: usize, error_buffer: usize) -> Self {
        self.message_buffer = message_buffer;
        self.error_buffer = error_buffer;
        self
    }

    pub fn with_sleep_on_error(mut self, interval: Duration) -> Self {
        self.sleep_on_error_interval = duration_millis(interval);
        self
    }

    pub fn with_sleep_on_idle(mut self, interval: Duration) -> Self {
        self.sleep_on_idle_interval = duration_millis(interval);
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Add a `basic.consume` argument (e.g. `x-priority`)
    pub fn with_arg(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Check the invariants the consumer relies on.
    ///
    /// Only the buffer capacities are checked here. Queue and consumer names are
    /// the broker's business and surface as consume errors.
    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.message_buffer == 0 || self.error_buffer == 0 {
            return Err(ConsumerError::config(
                "message and/or error buffer in config can't be 0",
            ));
        }
        Ok(())
    }

    /// Flags for `basic.consume`
    pub fn consume_options(&self) -> ConsumeOptions {
        ConsumeOptions {
            auto_ack: self.auto_ack,
            exclusive: self.exclusive,
            no_local: self.no_local,
            no_wait: self.no_wait,
        }
    }

    /// The per-channel QoS override, if both count and size are set
    pub fn qos_override(&self) -> Option<(u16, u32)> {
        (self.qos_count_override != 0 && self.qos_size_override != 0)
            .then_some((self.qos_count_override, self.qos_size_override))
    }

    pub fn sleep_on_error(&self) -> Duration {
        Duration::from_millis(self.sleep_on_error_interval)
    }

    pub fn sleep_on_idle(&self) -> Duration {
        Duration::from_millis(self.sleep_on_idle_interval)
    }

    /// Effective bound on in-flight deliveries
    pub fn in_flight_limit(&self) -> usize {
        if self.max_in_flight == 0 {
            self.message_buffer
        } else {
            self.max_in_flight
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
fn duration_millis(interval: Duration) -> u64 {
    u64::try_from(interval.as_millis()).unwrap_or(u64::MAX)
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_name: String::new(),
            consumer_name: String::new(),
            auto_ack: false,
            exclusive: false,
            no_wait: false,
            no_local: false,
            qos_count_override: 0,
            qos_size_override: 0,
            message_buffer: 100,
            error_buffer: 10,
            sleep_on_error_interval: DEFAULT_SLEEP_ON_ERROR_MS,
            sleep_on_idle_interval: DEFAULT_SLEEP_ON_IDLE_MS,
            max_in_flight: 0,
            args: FieldTable::new(),
        }
    }
}

impl FromEnv for ConsumerConfig {
    /// Requires AMQP_QUEUE_NAME. Every other key falls back to the defaults.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            enabled: env_flag("AMQP_CONSUMER_ENABLED", defaults.enabled)?,
            queue_name: env_required("AMQP_QUEUE_NAME")?,
            consumer_name: env_or_default("AMQP_CONSUMER_NAME", ""),
            auto_ack: env_flag("AMQP_AUTO_ACK", defaults.auto_ack)?,
            exclusive: env_flag("AMQP_EXCLUSIVE", defaults.exclusive)?,
            no_wait: env_flag("AMQP_NO_WAIT", defaults.no_wait)?,
            no_local: env_flag("AMQP_NO_LOCAL", defaults.no_local)?,
            qos_count_override: env_parse("AMQP_QOS_COUNT", defaults.qos_count_override)?,
            qos_size_override: env_parse("AMQP_QOS_SIZE", defaults.qos_size_override)?,
            message_buffer: env_parse("AMQP_MESSAGE_BUFFER", defaults.message_buffer)?,
            error_buffer: env_parse("AMQP_ERROR_BUFFER", defaults.error_buffer)?,
            sleep_on_error_interval: env_parse(
                "AMQP_SLEEP_ON_ERROR_MS",
                defaults.sleep_on_error_interval,
            )?,
            sleep_on_idle_interval: env_parse(
                "AMQP_SLEEP_ON_IDLE_MS",
                defaults.sleep_on_idle_interval,
            )?,
            max_in_flight: env_parse("AMQP_MAX_IN_FLIGHT", defaults.max_in_flight)?,
            args: FieldTable::new(),
        })
    }
}

/// Pool-wide settings the consumer depends on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PoolConfig {
    /// Prefetch count restored on a channel after it closes (0 = none)
    pub global_qos_count: u16,

    /// Prefetch size restored on a channel after it closes (0 = none)
    pub global_qos_size: u32,
}

impl PoolConfig {
    pub fn new(global_qos_count: u16, global_qos_size: u32) -> Self {
        Self {
            global_qos_count,
            global_qos_size,
        }
    }

    /// The pool QoS, if both count and size are set
    pub fn global_qos(&self) -> Option<(u16, u32)> {
        (self.global_qos_count != 0 && self.global_qos_size != 0)
            .then_some((self.global_qos_count, self.global_qos_size))
    }
}

impl FromEnv for PoolConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            global_qos_count: env_parse("AMQP_GLOBAL_QOS_COUNT", 0)?,
            global_qos_size: env_parse("AMQP_GLOBAL_QOS_SIZE", 0)?,
        })
    }
}

/// Top-level JSON configuration document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RabbitConfig {
    pub pool_config: PoolConfig,
    pub consumer_configs: HashMap<String, ConsumerConfig>,
}

impl RabbitConfig {
    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, ConsumerError> {
        serde_json::from_str(json)
            .map_err(|e| ConsumerError::config(format!("invalid consumer configuration: {}", e)))
    }

    /// Read and parse a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConsumerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConsumerError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Look up a consumer by its configuration key
    pub fn consumer(&self, name: &str) -> Option<&ConsumerConfig> {
        self.consumer_configs.get(name)
    }

    /// Consumers with `Enabled: true`, sorted by key
    pub fn enabled_consumers(&self) -> Vec<(&str, &ConsumerConfig)> {
        let mut enabled: Vec<_> = self
            .consumer_configs
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(name, config)| (name.as_str(), config))
            .collect();
        enabled.sort_by_key(|(name, _)| *name);
        enabled
    }
}
