//! The consuming loop
//!
//! ```text
//! Stopped -> Acquiring -> Streaming -> Draining -> Stopped
//!               ^             |
//!               +-------------+  channel closed / stream ended
//! ```
//!
//! While streaming, every iteration waits on three sources in fixed priority
//! order: close notifications, then deliveries, then the stop signal. After a
//! delivery is dispatched the stop signal is checked once more so a busy queue
//! cannot starve a stop request.
//!
//! Clients do not agree on whether a dying channel ends its delivery stream
//! before or after firing the close reason. When the stream ends first, the
//! loop waits up to `sleep_on_idle_interval` for a reason before treating the
//! end as a plain cancellation.

use crate::channel::{AmqpChannel, ChannelHost, CloseReason, Delivery, DeliveryStream};
use crate::consumer::Shared;
use crate::error::ConsumerError;
use crate::in_flight::InFlight;
use crate::message::Message;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why the streaming phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamExit {
    Stopped,
    ChannelClosed,
    /// Re-acquire no earlier than the given instant
    StreamEnded(Instant),
}

enum StreamEvent {
    Closed(CloseReason),
    NotificationsEnded,
    Delivery(OwnedSemaphorePermit, Delivery),
    StreamEnded,
    Stop,
}

pub(crate) async fn consume_loop(shared: Arc<Shared>, mut stop_rx: mpsc::Receiver<()>) {
    let config = &shared.config;

    loop {
        if stop_rx.try_recv().is_ok() {
            debug!(queue = %config.queue_name, "Stop requested while acquiring");
            break;
        }

        let ChannelHost {
            channel,
            mut close_notifications,
        } = match shared.source.acquire().await {
            Ok(host) => {
                shared.metrics.channel_acquired(true);
                host
            }
            Err(e) => {
                shared.metrics.channel_acquired(false);
                warn!(
                    queue = %config.queue_name,
                    error = %e,
                    backoff_ms = config.sleep_on_error_interval,
                    "Failed to acquire channel, retrying"
                );
                shared.report(ConsumerError::Acquisition(e));
                tokio::time::sleep(config.sleep_on_error()).await;
                continue;
            }
        };

        if let Some((prefetch_count, prefetch_size)) = config.qos_override() {
            if let Err(source) = channel.qos(prefetch_count, prefetch_size, false).await {
                warn!(
                    channel_id = channel.id(),
                    error = %source,
                    "Failed to apply qos override"
                );
                shared.report(ConsumerError::Qos {
                    prefetch_count,
                    prefetch_size,
                    source,
                });
            }
        }

        let deliveries = match channel
            .consume(
                &config.queue_name,
                &config.consumer_name,
                config.consume_options(),
                &config.args,
            )
            .await
        {
            Ok(deliveries) => deliveries,
            Err(source) => {
                warn!(
                    queue = %config.queue_name,
                    channel_id = channel.id(),
                    error = %source,
                    backoff_ms = config.sleep_on_error_interval,
                    "Failed to start consuming, retrying"
                );
                shared.report(ConsumerError::StreamOpen {
                    queue: config.queue_name.clone(),
                    source,
                });
                shared.source.release(channel, true).await;
                tokio::time::sleep(config.sleep_on_error()).await;
                continue;
            }
        };

        info!(
            queue = %config.queue_name,
            consumer = %config.consumer_name,
            channel_id = channel.id(),
            "Consuming"
        );

        let exit = stream_deliveries(
            &shared,
            &channel,
            &mut close_notifications,
            deliveries,
            &mut stop_rx,
        )
        .await;

        match exit {
            StreamExit::Stopped => {
                shared.source.release(channel, false).await;
                break;
            }
            StreamExit::ChannelClosed => {
                restore_global_qos(&shared, channel.as_ref()).await;
                shared.source.release(channel, true).await;
            }
            StreamExit::StreamEnded(resume_at) => {
                restore_global_qos(&shared, channel.as_ref()).await;
                shared.source.release(channel, true).await;
                tokio::time::sleep_until(resume_at).await;
            }
        }
    }

    drain(&shared, stop_rx).await;
}

async fn stream_deliveries(
    shared: &Arc<Shared>,
    channel: &Arc<dyn AmqpChannel>,
    close_notifications: &mut mpsc::Receiver<CloseReason>,
    mut deliveries: DeliveryStream,
    stop_rx: &mut mpsc::Receiver<()>,
) -> StreamExit {
    let config = &shared.config;
    let ackable = !config.auto_ack;
    let mut watching_close = true;

    loop {
        let event = tokio::select! {
            biased;

            reason = close_notifications.recv(), if watching_close => match reason {
                Some(reason) => StreamEvent::Closed(reason),
                None => StreamEvent::NotificationsEnded,
            },
            next = next_delivery(&shared.in_flight, &mut deliveries) => match next {
                (permit, Some(delivery)) => StreamEvent::Delivery(permit, delivery),
                (_, None) => StreamEvent::StreamEnded,
            },
            _ = stop_rx.recv() => StreamEvent::Stop,
        };

        match event {
            StreamEvent::Closed(reason) => return channel_closed(shared, channel.as_ref(), reason),
            StreamEvent::NotificationsEnded => {
                debug!(channel_id = channel.id(), "Close notifications exhausted");
                watching_close = false;
            }
            StreamEvent::Delivery(permit, delivery) => {
                dispatch(shared, channel, delivery, permit, ackable);

                if stop_rx.try_recv().is_ok() {
                    return StreamExit::Stopped;
                }
            }
            StreamEvent::StreamEnded => {
                let resume_at = Instant::now() + config.sleep_on_idle();

                if watching_close {
                    let late = close_notifications.recv();
                    if let Ok(Some(reason)) = tokio::time::timeout_at(resume_at, late).await {
                        return channel_closed(shared, channel.as_ref(), reason);
                    }
                }

                warn!(
                    queue = %config.queue_name,
                    channel_id = channel.id(),
                    "Delivery stream ended, re-acquiring"
                );
                shared.report(ConsumerError::DeliveryStreamEnded {
                    queue: config.queue_name.clone(),
                });
                return StreamExit::StreamEnded(resume_at);
            }
            StreamEvent::Stop => return StreamExit::Stopped,
        }
    }
}

fn channel_closed(shared: &Shared, channel: &dyn AmqpChannel, reason: CloseReason) -> StreamExit {
    warn!(
        queue = %shared.config.queue_name,
        channel_id = channel.id(),
        code = reason.code,
        reason = %reason.reason,
        "Channel closed, re-acquiring"
    );
    shared.metrics.channel_closed();
    shared.report(ConsumerError::ChannelClosed {
        reason: reason.reason,
        code: reason.code,
    });
    StreamExit::ChannelClosed
}

/// Reserve an in-flight slot, then take the next delivery.
async fn next_delivery(
    in_flight: &InFlight,
    deliveries: &mut DeliveryStream,
) -> (OwnedSemaphorePermit, Option<Delivery>) {
    let permit = in_flight.reserve().await;
    (permit, deliveries.next().await)
}

/// Hand a delivery to its own task so a full messages queue never stalls the loop.
fn dispatch(
    shared: &Arc<Shared>,
    channel: &Arc<dyn AmqpChannel>,
    delivery: Delivery,
    permit: OwnedSemaphorePermit,
    ackable: bool,
) {
    let guard = shared.in_flight.track(permit);
    shared.metrics.delivery_received();
    shared.metrics.in_flight(shared.in_flight.current());

    debug!(
        channel_id = channel.id(),
        delivery_tag = delivery.delivery_tag,
        "Delivery received"
    );

    let message = Message::from_delivery(Arc::clone(channel), delivery, ackable);
    let shared = Arc::clone(shared);

    tokio::spawn(async move {
        if shared.messages_tx.send(message).await.is_ok() {
            shared.metrics.message_enqueued();
        }
        drop(guard);
        shared.metrics.in_flight(shared.in_flight.current());
    });
}

/// Put the pool-wide QoS back on a channel whose lease just ended.
async fn restore_global_qos(shared: &Shared, channel: &dyn AmqpChannel) {
    let Some((prefetch_count, prefetch_size)) = shared.pool_config.global_qos() else {
        return;
    };

    if let Err(e) = channel.qos(prefetch_count, prefetch_size, false).await {
        debug!(
            channel_id = channel.id(),
            error = %e,
            "Could not restore global qos"
        );
    }
}

/// Wait for in-flight deliveries (unless stopping immediately), then mark the
/// consumer stopped and park the stop receiver for the next start.
async fn drain(shared: &Shared, stop_rx: mpsc::Receiver<()>) {
    let immediate = shared.state.lock().await.immediate_stop;

    if !immediate {
        debug!(
            queue = %shared.config.queue_name,
            in_flight = shared.in_flight.current(),
            "Draining in-flight deliveries"
        );
        shared.in_flight.wait_idle().await;
    }

    let mut state = shared.state.lock().await;
    state.stop_rx = Some(stop_rx);
    state.started = false;
    state.stop_requested = false;
    state.immediate_stop = false;
    shared.running.send_replace(false);

    info!(
        queue = %shared.config.queue_name,
        consumer = %shared.config.consumer_name,
        immediate,
        "Consumer stopped"
    );
}

impl Shared {
    /// Queue a recoverable error without ever blocking the loop.
    ///
    /// A full errors queue drops the report.
    pub(crate) fn report(&self, error: ConsumerError) {
        let kind = error.kind();

        match self.errors_tx.try_send(error) {
            Ok(()) => self.metrics.error_reported(kind),
            Err(TrySendError::Full(error)) => {
                warn!(
                    queue = %self.config.queue_name,
                    error = %error,
                    "Errors queue full, dropping report"
                );
                self.metrics.error_dropped(kind);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
