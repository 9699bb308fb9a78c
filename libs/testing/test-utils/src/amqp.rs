//! In-memory AMQP broker for consumer tests.
//!
//! `MemoryBroker` implements [`ChannelSource`] over a single queue. It hands out
//! [`MemoryChannel`]s, routes published bodies to whichever channel is
//! consuming, tracks unacked deliveries per channel and requeues them (marked
//! redelivered) when a channel is closed, like RabbitMQ does.
//!
//! Failures are scripted: `fail_next_acquires(n)` and `fail_next_consumes(n)`
//! make the next `n` calls fail.

use amqp_consumer::{
    AmqpChannel, ChannelError, ChannelHost, ChannelSource, CloseReason, ConsumeOptions, Delivery,
    DeliveryStream, FieldTable, QueueReader,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// A recorded `basic.qos` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosCall {
    pub prefetch_count: u16,
    pub prefetch_size: u32,
    pub global: bool,
}

/// A recorded `basic.consume` call
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeCall {
    pub queue: String,
    pub consumer_tag: String,
    pub options: ConsumeOptions,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone)]
struct Ready {
    body: Vec<u8>,
    redelivered: bool,
}

struct ChannelState {
    open: bool,
    close_tx: Option<mpsc::Sender<CloseReason>>,
    deliveries_tx: Option<mpsc::UnboundedSender<Delivery>>,
    auto_ack: bool,
    next_tag: u64,
    unacked: BTreeMap<u64, Vec<u8>>,
    qos_calls: Vec<QosCall>,
    consume_calls: Vec<ConsumeCall>,
    acked: Vec<u64>,
    nacked: Vec<u64>,
}

struct ChannelRecord {
    id: u64,
    state: Mutex<ChannelState>,
}

impl ChannelRecord {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push a body to the consuming stream. Gives the body back if nobody listens.
    fn deliver(&self, ready: Ready) -> Result<(), Ready> {
        let mut state = self.lock();
        let Some(tx) = state.deliveries_tx.as_ref() else {
            return Err(ready);
        };

        let tag = state.next_tag;
        let delivery = Delivery {
            delivery_tag: tag,
            body: ready.body.clone(),
            redelivered: ready.redelivered,
            ..Default::default()
        };

        if tx.send(delivery).is_err() {
            state.deliveries_tx = None;
            return Err(ready);
        }

        state.next_tag += 1;
        if !state.auto_ack {
            state.unacked.insert(tag, ready.body);
        }
        Ok(())
    }
}

impl ChannelState {
    /// Remove `tag` (or everything up to it) from the unacked set.
    fn settle(&mut self, tag: u64, multiple: bool) -> Result<Vec<Vec<u8>>, ChannelError> {
        if multiple {
            let keep = self.unacked.split_off(&(tag + 1));
            let settled = std::mem::replace(&mut self.unacked, keep);
            return Ok(settled.into_values().collect());
        }

        self.unacked.remove(&tag).map(|body| vec![body]).ok_or_else(|| {
            ChannelError::protocol(
                406,
                format!("PRECONDITION_FAILED - unknown delivery tag {}", tag),
            )
        })
    }
}

#[derive(Default)]
struct BrokerState {
    fail_acquires: usize,
    fail_consumes: usize,
    next_channel_id: u64,
    channels: Vec<Arc<ChannelRecord>>,
    active: Option<Arc<ChannelRecord>>,
    ready: VecDeque<Ready>,
    released: Vec<(u64, bool)>,
}

impl BrokerState {
    fn channel(&self, id: u64) -> Option<Arc<ChannelRecord>> {
        self.channels.iter().find(|c| c.id == id).cloned()
    }

    /// Hand queued bodies to the active consumer, if any.
    fn pump(&mut self) {
        while let Some(ready) = self.ready.pop_front() {
            let Some(active) = self.active.clone() else {
                self.ready.push_front(ready);
                return;
            };
            if let Err(ready) = active.deliver(ready) {
                self.active = None;
                self.ready.push_front(ready);
                return;
            }
        }
    }
}

struct BrokerInner {
    queue: String,
    state: Mutex<BrokerState>,
    acquisitions: watch::Sender<usize>,
    consumers: watch::Sender<usize>,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn requeue(&self, bodies: Vec<Vec<u8>>) {
        if bodies.is_empty() {
            return;
        }
        let mut state = self.lock();
        for body in bodies.into_iter().rev() {
            state.ready.push_front(Ready {
                body,
                redelivered: true,
            });
        }
        state.pump();
    }
}

/// Single-queue in-memory broker
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Broker serving one queue. `basic.consume` on any other queue fails with 404.
    pub fn new(queue: impl Into<String>) -> Self {
        let (acquisitions, _) = watch::channel(0);
        let (consumers, _) = watch::channel(0);
        Self {
            inner: Arc::new(BrokerInner {
                queue: queue.into(),
                state: Mutex::new(BrokerState {
                    next_channel_id: 1,
                    ..Default::default()
                }),
                acquisitions,
                consumers,
            }),
        }
    }

    /// Make the next `n` acquisitions fail
    pub fn fail_next_acquires(&self, n: usize) {
        self.inner.lock().fail_acquires = n;
    }

    /// Make the next `n` consume calls fail
    pub fn fail_next_consumes(&self, n: usize) {
        self.inner.lock().fail_consumes = n;
    }

    /// Publish a body to the queue
    pub fn publish(&self, body: impl Into<Vec<u8>>) {
        let mut state = self.inner.lock();
        state.ready.push_back(Ready {
            body: body.into(),
            redelivered: false,
        });
        state.pump();
    }

    /// Close the channel that is currently consuming. Returns its id.
    pub fn close_active_channel(&self, code: u16, reason: &str) -> Option<u64> {
        let id = self.inner.lock().active.as_ref().map(|c| c.id)?;
        self.close_channel(id, code, reason);
        Some(id)
    }

    /// Close a channel as the broker would: notify, end its stream and requeue unacked deliveries.
    pub fn close_channel(&self, id: u64, code: u16, reason: &str) {
        let Some(record) = self.inner.lock().channel(id) else {
            return;
        };

        let unacked = {
            let mut state = record.lock();
            if !state.open {
                return;
            }
            state.open = false;
            if let Some(close_tx) = state.close_tx.take() {
                let _ = close_tx.try_send(CloseReason::new(code, reason));
            }
            state.deliveries_tx = None;
            std::mem::take(&mut state.unacked).into_values().collect::<Vec<_>>()
        };

        {
            let mut state = self.inner.lock();
            if state.active.as_ref().is_some_and(|c| c.id == id) {
                state.active = None;
            }
        }

        debug!(channel_id = id, code, reason, requeued = unacked.len(), "Closed channel");
        self.inner.requeue(unacked);
    }

    /// End the active consumer's stream without closing the channel (consumer cancel).
    pub fn cancel_active_consumer(&self) -> Option<u64> {
        let mut state = self.inner.lock();
        let active = state.active.take()?;
        active.lock().deliveries_tx = None;
        Some(active.id)
    }

    /// Close the active channel the way some clients do: the delivery stream
    /// ends first and the close reason only follows after `delay`.
    pub fn close_active_channel_late(
        &self,
        code: u16,
        reason: &str,
        delay: Duration,
    ) -> Option<u64> {
        let id = self.cancel_active_consumer()?;
        let broker = self.clone();
        let reason = reason.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            broker.close_channel(id, code, &reason);
        });
        Some(id)
    }

    /// Wait until at least `n` consume calls have succeeded
    pub async fn wait_for_consumers(&self, n: usize) {
        let mut rx = self.inner.consumers.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// Wait until at least `n` acquisitions were attempted
    pub async fn wait_for_acquisitions(&self, n: usize) {
        let mut rx = self.inner.acquisitions.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    pub fn acquisitions(&self) -> usize {
        *self.inner.acquisitions.borrow()
    }

    pub fn consumers(&self) -> usize {
        *self.inner.consumers.borrow()
    }

    /// Ids of every channel handed out, in order
    pub fn channel_ids(&self) -> Vec<u64> {
        self.inner.lock().channels.iter().map(|c| c.id).collect()
    }

    pub fn active_channel(&self) -> Option<u64> {
        self.inner.lock().active.as_ref().map(|c| c.id)
    }

    /// Bodies waiting for a consumer
    pub fn ready_count(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// `(channel id, errored)` for every release
    pub fn released(&self) -> Vec<(u64, bool)> {
        self.inner.lock().released.clone()
    }

    pub fn qos_calls(&self, id: u64) -> Vec<QosCall> {
        self.with_channel(id, |state| state.qos_calls.clone())
    }

    pub fn consume_calls(&self, id: u64) -> Vec<ConsumeCall> {
        self.with_channel(id, |state| state.consume_calls.clone())
    }

    pub fn acked(&self, id: u64) -> Vec<u64> {
        self.with_channel(id, |state| state.acked.clone())
    }

    pub fn nacked(&self, id: u64) -> Vec<u64> {
        self.with_channel(id, |state| state.nacked.clone())
    }

    pub fn unacked(&self, id: u64) -> Vec<u64> {
        self.with_channel(id, |state| state.unacked.keys().copied().collect())
    }

    fn with_channel<T: Default>(&self, id: u64, f: impl FnOnce(&ChannelState) -> T) -> T {
        let Some(record) = self.inner.lock().channel(id) else {
            return T::default();
        };
        let state = record.lock();
        f(&state)
    }
}

#[async_trait]
impl ChannelSource for MemoryBroker {
    async fn acquire(&self) -> Result<ChannelHost, ChannelError> {
        self.inner.acquisitions.send_modify(|count| *count += 1);

        let mut state = self.inner.lock();
        if state.fail_acquires > 0 {
            state.fail_acquires -= 1;
            return Err(ChannelError::unavailable("connection refused"));
        }

        let id = state.next_channel_id;
        state.next_channel_id += 1;

        let (close_tx, close_rx) = mpsc::channel(1);
        let record = Arc::new(ChannelRecord {
            id,
            state: Mutex::new(ChannelState {
                open: true,
                close_tx: Some(close_tx),
                deliveries_tx: None,
                auto_ack: false,
                next_tag: 1,
                unacked: BTreeMap::new(),
                qos_calls: Vec::new(),
                consume_calls: Vec::new(),
                acked: Vec::new(),
                nacked: Vec::new(),
            }),
        });
        state.channels.push(Arc::clone(&record));

        let channel = MemoryChannel {
            record,
            broker: Arc::clone(&self.inner),
        };
        Ok(ChannelHost::new(Arc::new(channel), close_rx))
    }

    async fn release(&self, channel: Arc<dyn AmqpChannel>, errored: bool) {
        let id = channel.id();
        let mut state = self.inner.lock();
        state.released.push((id, errored));
        if state.active.as_ref().is_some_and(|c| c.id == id) {
            state.active = None;
        }
        if let Some(record) = state.channel(id) {
            record.lock().deliveries_tx = None;
        }
    }
}

/// Channel handed out by [`MemoryBroker`]
pub struct MemoryChannel {
    record: Arc<ChannelRecord>,
    broker: Arc<BrokerInner>,
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn id(&self) -> u64 {
        self.record.id
    }

    async fn qos(
        &self,
        prefetch_count: u16,
        prefetch_size: u32,
        global: bool,
    ) -> Result<(), ChannelError> {
        let mut state = self.record.lock();
        state.qos_calls.push(QosCall {
            prefetch_count,
            prefetch_size,
            global,
        });
        if state.open {
            Ok(())
        } else {
            Err(ChannelError::Closed)
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        arguments: &FieldTable,
    ) -> Result<DeliveryStream, ChannelError> {
        let mut broker = self.broker.lock();
        if broker.fail_consumes > 0 {
            broker.fail_consumes -= 1;
            return Err(ChannelError::protocol(541, "INTERNAL_ERROR - consume refused"));
        }
        if queue != self.broker.queue {
            return Err(ChannelError::protocol(
                404,
                format!("NOT_FOUND - no queue '{}'", queue),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.record.lock();
            if !state.open {
                return Err(ChannelError::Closed);
            }
            state.consume_calls.push(ConsumeCall {
                queue: queue.to_string(),
                consumer_tag: consumer_tag.to_string(),
                options,
                arguments: arguments.clone(),
            });
            state.auto_ack = options.auto_ack;
            state.deliveries_tx = Some(tx);
        }

        broker.active = Some(Arc::clone(&self.record));
        broker.pump();
        drop(broker);

        self.broker.consumers.send_modify(|count| *count += 1);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), ChannelError> {
        let mut state = self.record.lock();
        if !state.open {
            return Err(ChannelError::Closed);
        }
        state.settle(delivery_tag, multiple)?;
        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), ChannelError> {
        let settled = {
            let mut state = self.record.lock();
            if !state.open {
                return Err(ChannelError::Closed);
            }
            let settled = state.settle(delivery_tag, multiple)?;
            state.nacked.push(delivery_tag);
            settled
        };

        if requeue {
            self.broker.requeue(settled);
        }
        Ok(())
    }
}

/// Read `n` items from a consumer queue, panicking if they do not all arrive within `timeout`.
pub async fn recv_n<T>(reader: &QueueReader<T>, n: usize, timeout: Duration) -> Vec<T> {
    let received = tokio::time::timeout(timeout, async {
        let mut items = Vec::with_capacity(n);
        while items.len() < n {
            match reader.recv().await {
                Some(item) => items.push(item),
                None => break,
            }
        }
        items
    })
    .await;

    match received {
        Ok(items) if items.len() == n => items,
        Ok(items) => panic!("queue closed after {} of {} items", items.len(), n),
        Err(_) => panic!("timed out waiting for {} items", n),
    }
}
