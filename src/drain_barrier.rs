use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, info};

/// Graceful shutdown for components that process work concurrently: once the barrier is closed,
///  no new work is admitted, and [DrainBarrier::close_and_drain] waits for the work that is in
///  flight to finish.
///
/// Work is registered by holding an [InFlightGuard] for its duration.
#[derive(Default)]
pub struct DrainBarrier {
    closed: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// Registers one in-flight operation with a [DrainBarrier] until it is dropped
pub struct InFlightGuard {
    barrier: Arc<DrainBarrier>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let prev = self.barrier.in_flight.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.barrier.closed.load(Ordering::SeqCst) {
            self.barrier.drained.notify_waiters();
        }
    }
}

impl DrainBarrier {
    pub fn new() -> DrainBarrier {
        Default::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Registers an operation, or returns `None` if the barrier is closed
    pub fn try_enter(self: &Arc<Self>) -> Option<InFlightGuard> {
        // increment first so that a concurrent close either sees this operation or it sees the
        //  closed flag
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard { barrier: self.clone() };
        if self.is_closed() {
            return None;
        }
        Some(guard)
    }

    /// Closes the barrier and waits until all in-flight operations are finished, logging progress
    ///  every `progress_interval`. Fails if operations are still in flight after `timeout`; the
    ///  barrier stays closed either way.
    pub async fn close_and_drain(&self, timeout: Duration, progress_interval: Duration) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + timeout;
        let mut progress = time::interval_at(Instant::now() + progress_interval, progress_interval);
        loop {
            let drained = self.drained.notified();
            let remaining = self.in_flight();
            if remaining == 0 {
                debug!("drained all in-flight operations");
                return Ok(());
            }

            select! {
                _ = drained => {}
                _ = progress.tick() => info!("waiting for {} in-flight operations to finish", remaining),
                _ = time::sleep_until(deadline) => bail!("timed out after {:?} with {} operations still in flight", timeout, remaining),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_and_leave() {
        let barrier = Arc::new(DrainBarrier::new());
        let a = barrier.try_enter().unwrap();
        let b = barrier.try_enter().unwrap();
        assert_eq!(barrier.in_flight(), 2);
        drop(a);
        assert_eq!(barrier.in_flight(), 1);
        drop(b);
        assert_eq!(barrier.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_closed_barrier_refuses_work() {
        let barrier = Arc::new(DrainBarrier::new());
        barrier.close_and_drain(Duration::from_secs(1), Duration::from_secs(1)).await.unwrap();

        assert!(barrier.is_closed());
        assert!(barrier.try_enter().is_none());
        assert_eq!(barrier.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_in_flight_work() {
        let barrier = Arc::new(DrainBarrier::new());
        let guard = barrier.try_enter().unwrap();

        let draining = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.close_and_drain(Duration::from_secs(30), Duration::from_secs(5)).await })
        };

        time::sleep(Duration::from_secs(12)).await;
        assert!(!draining.is_finished());
        assert!(barrier.try_enter().is_none());

        let start = Instant::now();
        drop(guard);
        draining.await.unwrap().unwrap();
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let barrier = Arc::new(DrainBarrier::new());
        let _guard = barrier.try_enter().unwrap();

        let start = Instant::now();
        assert!(barrier.close_and_drain(Duration::from_secs(10), Duration::from_secs(3)).await.is_err());
        assert_eq!(Instant::now() - start, Duration::from_secs(10));
        assert_eq!(barrier.in_flight(), 1);
    }
}
