//! Prometheus metrics for consumers
//!
//! Provides observability into channel churn and delivery throughput.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");
        info!("Prometheus metrics initialized");
        handle
    });
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Consumer metrics helper
#[derive(Debug, Clone)]
pub struct ConsumerMetrics {
    queue: String,
    consumer: String,
}

impl ConsumerMetrics {
    pub fn new(queue: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            consumer: consumer.into(),
        }
    }

    /// Record a delivery pulled off the wire
    pub fn delivery_received(&self) {
        counter!(
            "amqp_consumer_deliveries_received_total",
            "queue" => self.queue.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }

    /// Record a message placed on the messages queue
    pub fn message_enqueued(&self) {
        counter!(
            "amqp_consumer_messages_enqueued_total",
            "queue" => self.queue.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }

    /// Record an error placed on the errors queue
    pub fn error_reported(&self, kind: &'static str) {
        counter!(
            "amqp_consumer_errors_total",
            "queue" => self.queue.clone(),
            "consumer" => self.consumer.clone(),
            "kind" => kind
        )
        .increment(1);
    }

    /// Record an error dropped because the errors queue was full
    pub fn error_dropped(&self, kind: &'static str) {
        counter!(
            "amqp_consumer_errors_dropped_total",
            "queue" => self.queue.clone(),
            "consumer" => self.consumer.clone(),
            "kind" => kind
        )
        .increment(1);
    }

    /// Record a channel acquisition attempt
    pub fn channel_acquired(&self, success: bool) {
        counter!(
            "amqp_consumer_channel_acquisitions_total",
            "queue" => self.queue.clone(),
            "consumer" => self.consumer.clone(),
            "status" => if success { "success" } else { "failed" }
        )
        .increment(1);
    }

    /// Record a broker-initiated channel closure
    pub fn channel_closed(&self) {
        counter!(
            "amqp_consumer_channel_closures_total",
            "queue" => self.queue.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }

    /// Update the in-flight deliveries gauge
    pub fn in_flight(&self, count: usize) {
        gauge!(
            "amqp_consumer_in_flight",
            "queue" => self.queue.clone(),
            "consumer" => self.consumer.clone()
        )
        .set(count as f64);
    }
}
