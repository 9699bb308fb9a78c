//! In-flight delivery tracking
//!
//! Counts deliveries that were pulled off the wire but have not reached the
//! messages queue yet. Graceful stop waits for the count to reach zero.
//! A semaphore caps how many can be outstanding at once.

use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

pub(crate) struct InFlight {
    count: Arc<watch::Sender<usize>>,
    permits: Arc<Semaphore>,
}

impl InFlight {
    pub(crate) fn new(limit: usize) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
            permits: Arc::new(Semaphore::new(limit.clamp(1, Semaphore::MAX_PERMITS))),
        }
    }

    /// Wait until another delivery may be taken.
    pub(crate) async fn reserve(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("Semaphore closed")
    }

    /// Count a delivery as in flight until the returned guard is dropped.
    pub(crate) fn track(&self, permit: OwnedSemaphorePermit) -> InFlightGuard {
        self.count.send_modify(|count| *count += 1);
        InFlightGuard {
            count: Arc::clone(&self.count),
            _permit: permit,
        }
    }

    pub(crate) fn current(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolve once nothing is in flight.
    pub(crate) async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

pub(crate) struct InFlightGuard {
    count: Arc<watch::Sender<usize>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.send_modify(|count| *count -= 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_empty() {
        let in_flight = InFlight::new(4);
        tokio::time::timeout(Duration::from_millis(100), in_flight.wait_idle())
            .await
            .expect("wait_idle should not block");
    }

    #[tokio::test]
    async fn test_wait_idle_waits_for_guards() {
        let in_flight = Arc::new(InFlight::new(4));
        let first = in_flight.track(in_flight.reserve().await);
        let second = in_flight.track(in_flight.reserve().await);
        assert_eq!(in_flight.current(), 2);

        let waiter = {
            let in_flight = Arc::clone(&in_flight);
            tokio::spawn(async move { in_flight.wait_idle().await })
        };

        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert_eq!(in_flight.current(), 0);
    }

    #[tokio::test]
    async fn test_reserve_is_bounded() {
        let in_flight = InFlight::new(1);
        let guard = in_flight.track(in_flight.reserve().await);

        let blocked = tokio::time::timeout(Duration::from_millis(50), in_flight.reserve()).await;
        assert!(blocked.is_err());

        drop(guard);
        tokio::time::timeout(Duration::from_millis(100), in_flight.reserve())
            .await
            .expect("permit should be free again");
    }
}
