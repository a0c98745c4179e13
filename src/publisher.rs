//! Retrying publisher.
//!
//! Wraps [`Broker::send`](crate::Broker::send) with bounded retry,
//! exponential backoff and a shared circuit breaker.
//!
//! ## Ordering
//!
//! The publisher runs a fixed pool of workers. Each message is routed to a
//! worker by partition hint, else by key hash, else round-robin. A worker
//! delivers its queue strictly one message at a time, including retries, so
//! messages sharing a hint or key are never reordered relative to each other.
//!
//! ## Shutdown
//!
//! [`shutdown`](RetryingPublisher::shutdown) stops accepting work, lets the
//! workers drain their queues for the configured grace period, then reports
//! everything still in flight as [`DeliveryError::Abandoned`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::circuit::CircuitBreaker;
use crate::lock::lock_ignore_poison;
use crate::tracker::{AttemptHandle, DeliveryTracker, FailureOutcome, PendingAck};
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    Ack,
    BrokerPtr,
    CircuitState,
    DeliveryConfig,
    DeliveryError,
    DeliveryMetrics,
    Message,
    Result,
    Topic,
    MESSAGE_ID_HEADER,
};

/// Unit of work queued to a publisher worker.
struct Job {
    // ---
    topic: Topic,
    handle: AttemptHandle,
}

/// State shared by the publisher handle and its workers.
///
/// Workers hold this, not the queue senders, so dropping every publisher
/// handle closes the queues and lets workers exit.
struct Shared {
    // ---
    broker: BrokerPtr,
    tracker: DeliveryTracker,
    breaker: Option<CircuitBreaker>,
    metrics: DeliveryMetrics,
}

struct Inner {
    // ---
    shared: Arc<Shared>,
    default_topic: Topic,
    queues: Mutex<Option<Vec<mpsc::Sender<Job>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    round_robin: AtomicUsize,
    config: DeliveryConfig,
}

/// Outcome of [`RetryingPublisher::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Deliveries resolved as [`DeliveryError::Abandoned`].
    pub abandoned: usize,
}

/// Publisher with bounded retry and per-key ordering.
///
/// Cheap to clone; clones share workers, tracker and circuit breaker.
///
/// # Example
///
/// ```
/// # use mom_delivery::{DeliveryConfig, DeliveryMetrics, MemoryBroker, Message, RetryingPublisher, Topic};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> mom_delivery::Result<()> {
/// let broker = MemoryBroker::new();
/// let publisher = RetryingPublisher::new(
///     broker.clone(),
///     Topic::from("helloworld.t"),
///     DeliveryConfig::default(),
///     DeliveryMetrics::new()?,
/// )?;
///
/// let ack = publisher.publish(Message::new("Hello Spring Kafka!")).await?;
/// assert_eq!(ack.offset, 0);
///
/// publisher.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RetryingPublisher {
    inner: Arc<Inner>,
}

impl RetryingPublisher {
    // ---
    /// Create a publisher sending to `default_topic` and spawn its workers.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Config`] if `config` is invalid.
    pub fn new(
        broker: BrokerPtr,
        default_topic: Topic,
        config: DeliveryConfig,
        metrics: DeliveryMetrics,
    ) -> Result<Self> {
        // ---
        config.validate()?;

        let shared = Arc::new(Shared {
            broker,
            tracker: DeliveryTracker::new(config.max_attempts, config.backoff.clone()),
            breaker: config.circuit_breaker.clone().map(CircuitBreaker::new),
            metrics,
        });

        let mut queues = Vec::with_capacity(config.publisher_workers);
        let mut workers = Vec::with_capacity(config.publisher_workers);

        for worker in 0..config.publisher_workers {
            let (tx, rx) = mpsc::channel(config.queue_capacity);
            queues.push(tx);
            workers.push(tokio::spawn(run_worker(shared.clone(), worker, rx)));
        }

        log_debug!(
            "publisher for {default_topic} started with {} workers",
            config.publisher_workers
        );

        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                default_topic,
                queues: Mutex::new(Some(queues)),
                workers: Mutex::new(workers),
                round_robin: AtomicUsize::new(0),
                config,
            }),
        })
    }

    /// Topic used by [`publish`](Self::publish) and [`enqueue`](Self::enqueue).
    pub fn default_topic(&self) -> &Topic {
        &self.inner.default_topic
    }

    /// Publish to the default topic and wait for the terminal outcome.
    ///
    /// # Errors
    ///
    /// - [`DeliveryError::Permanent`] if the broker rejected the message
    /// - [`DeliveryError::Exhausted`] after `max_attempts` transient failures
    /// - [`DeliveryError::Abandoned`] if shutdown overtook the delivery
    /// - [`DeliveryError::Closed`] if the publisher is shut down
    pub async fn publish(&self, message: Message) -> Result<Ack> {
        self.enqueue(message).await?.await
    }

    /// Publish to `topic` and wait for the terminal outcome.
    pub async fn publish_to(&self, topic: Topic, message: Message) -> Result<Ack> {
        self.enqueue_to(topic, message).await?.await
    }

    /// Enqueue to the default topic; the returned future yields the outcome.
    ///
    /// Suspends only while the target worker's queue is full.
    pub async fn enqueue(&self, message: Message) -> Result<PendingAck> {
        let topic = self.inner.default_topic.clone();
        self.enqueue_to(topic, message).await
    }

    /// Enqueue to `topic`; the returned future yields the outcome.
    pub async fn enqueue_to(&self, topic: Topic, message: Message) -> Result<PendingAck> {
        // ---
        let message = match message.message_id() {
            Some(_) => message,
            None => message.with_header(MESSAGE_ID_HEADER, Uuid::new_v4().to_string()),
        };

        let queue = {
            let queues = lock_ignore_poison(&self.inner.queues);
            let Some(queues) = queues.as_ref() else {
                return Err(DeliveryError::Closed);
            };
            let fallback = self.inner.round_robin.fetch_add(1, Ordering::Relaxed);
            queues[crate::broker::route(&message, queues.len(), fallback)].clone()
        };

        let tracker = &self.inner.shared.tracker;
        let (handle, pending) = tracker.track(message);

        if queue.send(Job { topic, handle }).await.is_err() {
            // Worker queue closed between the check above and the send.
            tracker.fail(handle, DeliveryError::Closed);
        }

        Ok(pending)
    }

    /// Number of deliveries enqueued but not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.inner.shared.tracker.outstanding()
    }

    /// Current circuit breaker state; `Closed` when the breaker is disabled.
    pub fn circuit_state(&self) -> CircuitState {
        // ---
        self.inner
            .shared
            .breaker
            .as_ref()
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }

    /// Returns `true` once shutdown has begun.
    pub fn is_closed(&self) -> bool {
        lock_ignore_poison(&self.inner.queues).is_none()
    }

    /// Stop accepting work and drain within the configured grace period.
    ///
    /// Deliveries still in flight when the grace period ends resolve as
    /// [`DeliveryError::Abandoned`]. Calling this more than once is harmless.
    pub async fn shutdown(&self) -> ShutdownReport {
        // ---
        let queues = lock_ignore_poison(&self.inner.queues).take();
        if queues.is_none() {
            return ShutdownReport::default();
        }
        // Dropping the senders lets each worker finish its queue and exit.
        drop(queues);

        let grace = self.inner.config.shutdown_grace();
        let tracker = &self.inner.shared.tracker;

        let remaining = tracker.drain(grace).await;
        let abandoned = if remaining > 0 {
            let abandoned = tracker.abandon_all();
            log_warn!("publisher shutdown: abandoned {abandoned} deliveries after {grace:?} grace");
            abandoned
        } else {
            0
        };

        let workers: Vec<JoinHandle<()>> =
            lock_ignore_poison(&self.inner.workers).drain(..).collect();
        for worker in workers {
            if remaining > 0 {
                worker.abort();
            }
            let _ = worker.await;
        }

        log_info!(
            "publisher for {} shut down ({abandoned} abandoned)",
            self.inner.default_topic
        );

        ShutdownReport { abandoned }
    }
}

/// Worker loop: deliver queued jobs one at a time.
async fn run_worker(shared: Arc<Shared>, _worker: usize, mut queue: mpsc::Receiver<Job>) {
    // ---
    while let Some(job) = queue.recv().await {
        deliver(&shared, job).await;
    }

    log_debug!("publisher worker {_worker} stopped");
}

/// Drive one job to a terminal outcome.
async fn deliver(shared: &Shared, job: Job) {
    // ---
    let tracker = &shared.tracker;

    loop {
        let Some((message, _attempt)) = tracker.begin_attempt(job.handle) else {
            // Abandoned while queued or backing off.
            return;
        };

        if let Some(breaker) = &shared.breaker {
            breaker.admit().await;
        }

        match shared.broker.send(&job.topic, message).await {
            Ok(ack) => {
                if let Some(breaker) = &shared.breaker {
                    breaker.record_success();
                }
                shared.metrics.messages_published.inc();
                log_debug!(
                    "{} acked at {}/{}@{} on attempt {_attempt}",
                    job.handle,
                    ack.topic,
                    ack.partition,
                    ack.offset
                );
                tracker.mark_acked(job.handle, ack);
                return;
            }
            Err(err) => {
                if err.is_retryable() {
                    if let Some(breaker) = &shared.breaker {
                        breaker.record_failure();
                    }
                }

                match tracker.mark_failed(job.handle, err) {
                    FailureOutcome::Retry { delay, retry } => {
                        shared.metrics.delivery_retries.inc();
                        log_debug!(
                            "{} retry {retry}, waiting {delay:?} before next attempt",
                            job.handle
                        );
                        tokio::time::sleep(delay).await;
                    }
                    FailureOutcome::Terminal(_terminal) => {
                        log_warn!("{} failed: {_terminal}", job.handle);
                        return;
                    }
                    FailureOutcome::AlreadyScheduled | FailureOutcome::Untracked => return,
                }
            }
        }
    }
}
