//! Countdown latch.
//!
//! A one-shot synchronisation point: waiters block until `count_down` has
//! been called `n` times, a timeout expires, or a cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Latch released after a fixed number of `count_down` calls.
///
/// Cheap to clone; clones share the same count.
///
/// ```
/// # use mom_delivery::CountdownLatch;
/// # use std::time::Duration;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let latch = CountdownLatch::new(1);
/// let remote = latch.clone();
/// tokio::spawn(async move { remote.count_down() });
///
/// assert_eq!(latch.wait_timeout(Duration::from_secs(10)).await, 0);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct CountdownLatch {
    count: Arc<watch::Sender<usize>>,
}

impl CountdownLatch {
    // ---
    pub fn new(count: usize) -> Self {
        Self {
            count: Arc::new(watch::Sender::new(count)),
        }
    }

    /// Decrement the count; saturates at zero.
    pub fn count_down(&self) {
        // ---
        self.count.send_if_modified(|count| {
            if *count == 0 {
                return false;
            }
            *count -= 1;
            true
        });
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait for the count to reach zero or `timeout` to pass.
    ///
    /// Returns the remaining count (0 on release).
    pub async fn wait_timeout(&self, timeout: Duration) -> usize {
        // ---
        let mut rx = self.count.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|count| *count == 0)).await;
        self.count()
    }

    /// Like [`wait_timeout`](Self::wait_timeout) but also returns early when
    /// `cancel` fires.
    pub async fn wait_cancellable(&self, timeout: Duration, cancel: &CancellationToken) -> usize {
        // ---
        tokio::select! {
            remaining = self.wait_timeout(timeout) => remaining,
            _ = cancel.cancelled() => self.count(),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_released_by_count_down() {
        // ---
        let latch = CountdownLatch::new(2);
        let remote = latch.clone();

        tokio::spawn(async move {
            remote.count_down();
            remote.count_down();
            remote.count_down();
        });

        assert_eq!(latch.wait_timeout(Duration::from_secs(5)).await, 0);
        assert_eq!(latch.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_remaining() {
        // ---
        let latch = CountdownLatch::new(3);
        latch.count_down();

        assert_eq!(latch.wait_timeout(Duration::from_millis(100)).await, 2);
    }

    #[tokio::test]
    async fn test_cancel_ends_wait() {
        // ---
        let latch = CountdownLatch::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let remaining = latch
            .wait_cancellable(Duration::from_secs(3600), &cancel)
            .await;
        assert_eq!(remaining, 1);
    }
}
