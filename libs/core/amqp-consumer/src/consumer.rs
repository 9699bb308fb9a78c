//! Consumer lifecycle
//!
//! [`Consumer`] is the public surface: it validates configuration, owns the
//! bounded queues and arms/disarms the consuming loop in [`crate::engine`].
//! Start and stop are serialized by one lock around [`RunState`].

use crate::channel::ChannelSource;
use crate::config::{ConsumerConfig, PoolConfig, RabbitConfig};
use crate::engine;
use crate::error::ConsumerError;
use crate::in_flight::InFlight;
use crate::message::Message;
use crate::metrics::ConsumerMetrics;
use crate::queue::{self, QueueReader};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

/// Lifecycle flags. Only touched under `Shared::state`.
pub(crate) struct RunState {
    pub(crate) started: bool,
    pub(crate) stop_requested: bool,
    pub(crate) immediate_stop: bool,
    /// Parked here while stopped, owned by the loop while started.
    pub(crate) stop_rx: Option<mpsc::Receiver<()>>,
}

/// State shared between the [`Consumer`] handle and its consuming loop.
pub(crate) struct Shared {
    pub(crate) config: ConsumerConfig,
    pub(crate) pool_config: PoolConfig,
    pub(crate) source: Arc<dyn ChannelSource>,
    pub(crate) state: Mutex<RunState>,
    pub(crate) running: watch::Sender<bool>,
    pub(crate) messages_tx: mpsc::Sender<Message>,
    pub(crate) messages: QueueReader<Message>,
    pub(crate) errors_tx: mpsc::Sender<ConsumerError>,
    pub(crate) errors: QueueReader<ConsumerError>,
    pub(crate) stop_tx: mpsc::Sender<()>,
    pub(crate) in_flight: InFlight,
    pub(crate) metrics: ConsumerMetrics,
}

/// Receives messages from one AMQP queue.
///
/// The consumer keeps a channel leased from its [`ChannelSource`], re-acquires
/// a fresh one whenever the broker closes it, and hands every delivery to the
/// application through [`messages`](Self::messages). Recoverable failures show
/// up on [`errors`](Self::errors).
///
/// # Example
///
/// ```rust,ignore
/// let config = ConsumerConfig::new("orders", "orders-worker").with_buffers(100, 10);
/// let consumer = Consumer::new(config, PoolConfig::default(), pool)?;
///
/// consumer.start_consuming().await?;
/// let messages = consumer.messages();
/// while let Some(message) = messages.recv().await {
///     handle(message.body()).await;
///     message.channel().ack(message.delivery_tag(), false).await?;
/// }
/// ```
#[derive(Clone)]
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    /// Create a consumer. Fails if either buffer capacity is zero.
    pub fn new(
        config: ConsumerConfig,
        pool_config: PoolConfig,
        source: Arc<dyn ChannelSource>,
    ) -> Result<Self, ConsumerError> {
        config.validate()?;

        let (messages_tx, messages) = queue::bounded(config.message_buffer);
        let (errors_tx, errors) = queue::bounded(config.error_buffer);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (running, _) = watch::channel(false);

        let shared = Shared {
            in_flight: InFlight::new(config.in_flight_limit()),
            metrics: ConsumerMetrics::new(&config.queue_name, &config.consumer_name),
            config,
            pool_config,
            source,
            state: Mutex::new(RunState {
                started: false,
                stop_requested: false,
                immediate_stop: false,
                stop_rx: Some(stop_rx),
            }),
            running,
            messages_tx,
            messages,
            errors_tx,
            errors,
            stop_tx,
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Create the consumer registered under `name` in a JSON configuration.
    pub fn from_rabbit_config(
        rabbit_config: &RabbitConfig,
        name: &str,
        source: Arc<dyn ChannelSource>,
    ) -> Result<Self, ConsumerError> {
        let config = rabbit_config
            .consumer(name)
            .cloned()
            .ok_or_else(|| ConsumerError::config(format!("no consumer named '{}'", name)))?;

        Self::new(config, rabbit_config.pool_config, source)
    }

    /// Start the consuming loop.
    ///
    /// Stale stop signals and queued errors are flushed first. Returning `Ok`
    /// does not mean a channel has been acquired yet.
    pub async fn start_consuming(&self) -> Result<(), ConsumerError> {
        let mut state = self.shared.state.lock().await;

        if state.started {
            return Err(ConsumerError::AlreadyStarted);
        }

        let flushed = self.flush_errors();
        let Some(mut stop_rx) = state.stop_rx.take() else {
            return Err(ConsumerError::AlreadyStarted);
        };
        while stop_rx.try_recv().is_ok() {}

        info!(
            queue = %self.shared.config.queue_name,
            consumer = %self.shared.config.consumer_name,
            flushed_errors = flushed,
            "Starting consumer"
        );

        tokio::spawn(engine::consume_loop(Arc::clone(&self.shared), stop_rx));
        state.started = true;
        self.shared.running.send_replace(true);
        Ok(())
    }

    /// Ask the consuming loop to stop.
    ///
    /// With `immediate = false` the loop waits until every delivery it already
    /// pulled has reached the messages queue before reporting itself stopped.
    /// With `immediate = true` it stops right away and those deliveries may
    /// still land on the queue afterwards.
    pub async fn stop_consuming(&self, immediate: bool) -> Result<(), ConsumerError> {
        let mut state = self.shared.state.lock().await;

        if !state.started {
            return Err(ConsumerError::NotStarted);
        }

        state.immediate_stop = immediate;
        state.stop_requested = true;

        match self.shared.stop_tx.try_send(()) {
            Ok(()) => {
                info!(
                    queue = %self.shared.config.queue_name,
                    immediate,
                    "Stop requested"
                );
            }
            Err(TrySendError::Full(())) => {
                debug!("Stop already pending");
            }
            Err(TrySendError::Closed(())) => {}
        }

        Ok(())
    }

    /// Messages ready for the application.
    pub fn messages(&self) -> QueueReader<Message> {
        self.shared.messages.clone()
    }

    /// Recoverable errors raised by the consuming loop.
    pub fn errors(&self) -> QueueReader<ConsumerError> {
        self.shared.errors.clone()
    }

    /// Drop any pending stop signal.
    pub async fn flush_stop(&self) {
        let mut state = self.shared.state.lock().await;
        if let Some(stop_rx) = state.stop_rx.as_mut() {
            while stop_rx.try_recv().is_ok() {}
        }
    }

    /// Drop every queued error. Returns how many were dropped.
    pub fn flush_errors(&self) -> usize {
        self.shared.errors.flush()
    }

    /// Drop every queued message. Returns how many were dropped.
    ///
    /// **This loses messages**: anything not yet read is gone, and unacked
    /// deliveries stay unacked on the broker until their channel closes.
    pub fn flush_messages(&self) -> usize {
        self.shared.messages.flush()
    }

    pub async fn is_started(&self) -> bool {
        self.shared.state.lock().await.started
    }

    /// True between a stop request and the loop reporting itself stopped
    pub async fn is_stopping(&self) -> bool {
        self.shared.state.lock().await.stop_requested
    }

    /// Wait until the consumer is stopped (returns immediately if it is).
    pub async fn stopped(&self) {
        let mut running = self.shared.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
    }

    /// Deliveries pulled off the wire but not yet on the messages queue
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.current()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.shared.config
    }

    pub fn pool_config(&self) -> &PoolConfig {
        &self.shared.pool_config
    }
}
