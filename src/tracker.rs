//! Delivery tracker.
//!
//! Records every in-flight send from the moment it is enqueued until it
//! reaches a terminal outcome. The tracker owns the completion channel of
//! each attempt, so the caller's [`PendingAck`] resolves exactly once:
//! acknowledged, failed permanently, exhausted, or abandoned at shutdown.
//!
//! ## Retry timers
//!
//! At most one retry may be scheduled per attempt. [`mark_failed`] arms
//! the timer; [`begin_attempt`] disarms it. A second failure report while
//! the timer is armed is rejected with [`FailureOutcome::AlreadyScheduled`].
//!
//! ## Shutdown
//!
//! Attempts are never dropped silently: [`drain`] waits for completion and
//! [`abandon_all`] resolves whatever is left with
//! [`DeliveryError::Abandoned`]. Dropping the tracker abandons the rest.
//!
//! [`mark_failed`]: DeliveryTracker::mark_failed
//! [`begin_attempt`]: DeliveryTracker::begin_attempt
//! [`drain`]: DeliveryTracker::drain
//! [`abandon_all`]: DeliveryTracker::abandon_all

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify};

use crate::lock::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_warn,
    Ack,
    BackoffConfig,
    DeliveryError,
    ErrorKind,
    Message,
    Result,
};

/// Identifier of a tracked delivery; monotonically increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptHandle(u64);

impl AttemptHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AttemptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt-{}", self.0)
    }
}

/// Retry state of one in-flight delivery.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub message: Message,
    /// Broker calls made so far.
    pub attempt_count: u32,
    pub last_error: Option<ErrorKind>,
    /// When the next attempt is due; equals the tracking time before the
    /// first attempt.
    pub next_retry_at: Instant,
}

/// Decision returned by [`DeliveryTracker::mark_failed`].
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Retry after `delay`; the retry timer is now armed.
    Retry { delay: Duration, retry: u32 },
    /// The attempt was resolved with this error and removed.
    Terminal(DeliveryError),
    /// A retry is already scheduled for this attempt; report ignored.
    AlreadyScheduled,
    /// Handle is not tracked (already resolved or abandoned).
    Untracked,
}

struct Entry {
    // ---
    attempt: DeliveryAttempt,
    last_detail: Option<String>,
    retry_armed: bool,
    reply: oneshot::Sender<Result<Ack>>,
}

impl Entry {
    fn resolve(self, outcome: Result<Ack>) {
        // Receiver gone means the caller stopped waiting; nothing to report.
        let _ = self.reply.send(outcome);
    }
}

/// Future resolving to the terminal outcome of a tracked delivery.
///
/// Resolves to [`DeliveryError::Abandoned`] if the tracker is dropped
/// without reporting an outcome.
pub struct PendingAck {
    // ---
    handle: AttemptHandle,
    rx: oneshot::Receiver<Result<Ack>>,
}

impl PendingAck {
    pub fn handle(&self) -> AttemptHandle {
        self.handle
    }
}

impl Future for PendingAck {
    type Output = Result<Ack>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // ---
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_closed)) => Poll::Ready(Err(DeliveryError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// In-memory registry of in-flight deliveries.
pub struct DeliveryTracker {
    // ---
    max_attempts: u32,
    backoff: BackoffConfig,
    next_id: AtomicU64,
    attempts: Mutex<HashMap<AttemptHandle, Entry>>,
    idle: Notify,
}

impl DeliveryTracker {
    // ---
    /// Create a tracker that allows `max_attempts` broker calls per message.
    pub fn new(max_attempts: u32, backoff: BackoffConfig) -> Self {
        // ---
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            next_id: AtomicU64::new(1),
            attempts: Mutex::new(HashMap::new()),
            idle: Notify::new(),
        }
    }

    /// Start tracking `message`.
    ///
    /// Returns the handle used to report outcomes and the future the caller
    /// awaits for the terminal result.
    pub fn track(&self, message: Message) -> (AttemptHandle, PendingAck) {
        // ---
        let handle = AttemptHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (reply, rx) = oneshot::channel();

        let entry = Entry {
            attempt: DeliveryAttempt {
                message,
                attempt_count: 0,
                last_error: None,
                next_retry_at: Instant::now(),
            },
            last_detail: None,
            retry_armed: false,
            reply,
        };

        lock_ignore_poison(&self.attempts).insert(handle, entry);

        (handle, PendingAck { handle, rx })
    }

    /// Count a new broker call for `handle` and return the message to send.
    ///
    /// Disarms the retry timer. Returns `None` if the attempt is no longer
    /// tracked.
    pub fn begin_attempt(&self, handle: AttemptHandle) -> Option<(Message, u32)> {
        // ---
        let mut attempts = lock_ignore_poison(&self.attempts);
        let entry = attempts.get_mut(&handle)?;

        entry.retry_armed = false;
        entry.attempt.attempt_count += 1;

        Some((entry.attempt.message.clone(), entry.attempt.attempt_count))
    }

    /// Resolve `handle` successfully. Returns `false` if it was not tracked.
    pub fn mark_acked(&self, handle: AttemptHandle, ack: Ack) -> bool {
        // ---
        match self.remove(handle) {
            Some(entry) => {
                entry.resolve(Ok(ack));
                true
            }
            None => false,
        }
    }

    /// Report a failed broker call for `handle`.
    ///
    /// Transient errors schedule a retry until `max_attempts` broker calls
    /// have been made; then the attempt resolves with
    /// [`DeliveryError::Exhausted`]. Any other error resolves it as is.
    pub fn mark_failed(&self, handle: AttemptHandle, error: DeliveryError) -> FailureOutcome {
        // ---
        let mut attempts = lock_ignore_poison(&self.attempts);
        let Some(entry) = attempts.get_mut(&handle) else {
            return FailureOutcome::Untracked;
        };

        if entry.retry_armed {
            return FailureOutcome::AlreadyScheduled;
        }

        entry.attempt.last_error = Some(error.kind());
        entry.last_detail = Some(error.to_string());

        let attempt_count = entry.attempt.attempt_count;

        if error.is_retryable() && attempt_count < self.max_attempts {
            let delay = self.backoff.delay(attempt_count);
            entry.retry_armed = true;
            entry.attempt.next_retry_at = Instant::now() + delay;
            return FailureOutcome::Retry {
                delay,
                retry: attempt_count,
            };
        }

        let terminal = if error.is_retryable() {
            DeliveryError::Exhausted {
                attempts: attempt_count,
                last_error: error.to_string(),
            }
        } else {
            error
        };

        let entry = attempts.remove(&handle);
        let now_idle = attempts.is_empty();
        drop(attempts);

        if let Some(entry) = entry {
            entry.resolve(Err(terminal.clone()));
        }
        if now_idle {
            self.idle.notify_waiters();
        }

        FailureOutcome::Terminal(terminal)
    }

    /// Resolve `handle` with `error` regardless of retry state.
    pub fn fail(&self, handle: AttemptHandle, error: DeliveryError) -> bool {
        // ---
        match self.remove(handle) {
            Some(entry) => {
                entry.resolve(Err(error));
                true
            }
            None => false,
        }
    }

    /// Snapshot of the retry state of `handle`.
    pub fn attempt(&self, handle: AttemptHandle) -> Option<DeliveryAttempt> {
        // ---
        lock_ignore_poison(&self.attempts)
            .get(&handle)
            .map(|entry| entry.attempt.clone())
    }

    /// Number of deliveries not yet resolved.
    pub fn outstanding(&self) -> usize {
        lock_ignore_poison(&self.attempts).len()
    }

    /// Wait until nothing is outstanding or `grace` elapses.
    ///
    /// Returns the number of deliveries still outstanding.
    pub async fn drain(&self, grace: Duration) -> usize {
        // ---
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            let outstanding = self.outstanding();
            if outstanding == 0 {
                return 0;
            }

            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.outstanding();
            }
        }
    }

    /// Resolve every outstanding delivery with [`DeliveryError::Abandoned`].
    ///
    /// Returns the number of deliveries abandoned.
    pub fn abandon_all(&self) -> usize {
        // ---
        let drained: Vec<(AttemptHandle, Entry)> = {
            let mut attempts = lock_ignore_poison(&self.attempts);
            attempts.drain().collect()
        };

        let count = drained.len();
        for (_handle, entry) in drained {
            log_warn!(
                "abandoning {_handle} after {} attempts (last error: {:?})",
                entry.attempt.attempt_count,
                entry.last_detail
            );
            entry.resolve(Err(DeliveryError::Abandoned));
        }

        if count > 0 {
            self.idle.notify_waiters();
        }
        count
    }

    fn remove(&self, handle: AttemptHandle) -> Option<Entry> {
        // ---
        let mut attempts = lock_ignore_poison(&self.attempts);
        let entry = attempts.remove(&handle);
        let now_idle = attempts.is_empty();
        drop(attempts);

        if entry.is_some() && now_idle {
            self.idle.notify_waiters();
        }
        if entry.is_some() {
            log_debug!("{handle} resolved");
        }
        entry
    }
}

impl Drop for DeliveryTracker {
    fn drop(&mut self) {
        // ---
        let abandoned = self.abandon_all();
        if abandoned > 0 {
            log_warn!("delivery tracker dropped with {abandoned} outstanding deliveries");
        }
    }
}
