//! Bounded output queues
//!
//! The consumer writes into tokio mpsc channels. Readers get a cloneable
//! [`QueueReader`] so several tasks can drain the same queue.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Create a bounded queue and its shared reader.
pub(crate) fn bounded<T>(capacity: usize) -> (mpsc::Sender<T>, QueueReader<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let reader = QueueReader {
        rx: Arc::new(Mutex::new(rx)),
        tx: tx.downgrade(),
        capacity,
    };
    (tx, reader)
}

/// Read side of a bounded queue.
///
/// Cloning is cheap: all clones share the same underlying receiver.
pub struct QueueReader<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
    tx: mpsc::WeakSender<T>,
    capacity: usize,
}

impl<T> Clone for QueueReader<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> QueueReader<T> {
    /// Take the next item if one is ready.
    ///
    /// Returns `None` when the queue is empty or another reader is currently
    /// waiting in [`recv`](Self::recv).
    pub fn try_recv(&self) -> Option<T> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Wait for the next item.
    ///
    /// Only returns `None` if every sender is gone, which cannot happen while
    /// the owning consumer is alive.
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Discard everything currently queued. Returns how many items were dropped.
    pub fn flush(&self) -> usize {
        let Ok(mut rx) = self.rx.try_lock() else {
            return 0;
        };

        let mut flushed = 0;
        while rx.try_recv().is_ok() {
            flushed += 1;
        }
        flushed
    }

    /// Items currently queued (including slots reserved by pending sends)
    pub fn len(&self) -> usize {
        self.tx
            .upgrade()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_recv_is_non_blocking() {
        let (tx, reader) = bounded::<u32>(2);
        assert_eq!(reader.try_recv(), None);

        tx.send(1).await.unwrap();
        assert_eq!(reader.try_recv(), Some(1));
        assert_eq!(reader.try_recv(), None);
    }

    #[tokio::test]
    async fn test_flush_empties_queue() {
        let (tx, reader) = bounded::<u32>(4);
        for i in 0..3 {
            tx.send(i).await.unwrap();
        }

        assert_eq!(reader.len(), 3);
        assert_eq!(reader.flush(), 3);
        assert!(reader.is_empty());
        assert_eq!(reader.try_recv(), None);
        assert_eq!(reader.flush(), 0);
    }

    #[tokio::test]
    async fn test_clones_share_queue() {
        let (tx, reader) = bounded::<&str>(2);
        let other = reader.clone();

        tx.send("a").await.unwrap();
        assert_eq!(other.recv().await, Some("a"));
        assert_eq!(reader.try_recv(), None);
        assert_eq!(reader.capacity(), 2);
    }
}
