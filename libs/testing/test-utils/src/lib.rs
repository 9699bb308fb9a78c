//! Shared test utilities for consumer testing
//!
//! This crate provides reusable test infrastructure:
//! - `MemoryBroker`: in-memory AMQP broker implementing `ChannelSource` (feature: "amqp")
//! - `TestDataBuilder`: Deterministic test data generation (always available)
//! - `assertions`: Custom assertion helpers (always available)
//!
//! # Features
//!
//! - `amqp` (default): Enables the in-memory AMQP broker
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{MemoryBroker, TestDataBuilder};
//!
//! #[tokio::test]
//! async fn my_consumer_test() {
//!     let builder = TestDataBuilder::from_test_name("my_consumer_test");
//!     let queue = builder.name("queue", "main");
//!     let broker = MemoryBroker::new(&queue);
//!
//!     let consumer = Consumer::new(
//!         ConsumerConfig::new(&queue, builder.name("consumer", "main")),
//!         PoolConfig::default(),
//!         Arc::new(broker.clone()),
//!     )
//!     .unwrap();
//!     consumer.start_consuming().await.unwrap();
//!     broker.wait_for_consumers(1).await;
//!     broker.publish("hello");
//! }
//! ```

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "amqp")]
pub use amqp::{ConsumeCall, MemoryBroker, MemoryChannel, QosCall, recv_n};

/// Builder for test data with deterministic naming
///
/// Tests running in parallel get distinct queue and consumer names.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_graceful_stop");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Generate a unique name for testing
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("my_test");
    /// let name = builder.name("queue", "main");
    /// assert!(name.starts_with("test-queue-"));
    /// ```
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }

    /// Deterministic message body `n` for this test
    pub fn body(&self, n: usize) -> Vec<u8> {
        format!("body-{}-{}", self.seed, n).into_bytes()
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::future::Future;
    use std::time::Duration;

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Poll `check` every 10ms until it returns true, panicking after `timeout`.
    pub async fn eventually<F, Fut>(timeout: Duration, context: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let polled = tokio::time::timeout(timeout, async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        if polled.is_err() {
            panic!("{}: condition not met within {:?}", context, timeout);
        }
    }

    /// Await `future`, panicking if it takes longer than `timeout`.
    pub async fn within<T>(timeout: Duration, context: &str, future: impl Future<Output = T>) -> T {
        tokio::time::timeout(timeout, future)
            .await
            .unwrap_or_else(|_| panic!("{}: timed out after {:?}", context, timeout))
    }
}
