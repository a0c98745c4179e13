//! Per-partition consumption loop.
//!
//! One task per partition cycles `Idle → Fetching → Dispatching →
//! Committing → Idle` until cancelled:
//!
//! - fetch a batch after the last delivered offset, bounded by the poll
//!   timeout (an empty batch is a no-op cycle)
//! - hand each record to the handler in offset order, retrying failures and
//!   dead-lettering records that keep failing
//! - commit the highest offset with no unhandled predecessor
//!
//! Cancellation is observed between records, never inside the handler.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::offsets::NO_OFFSET;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    BrokerPtr,
    DeadLetterRouter,
    DeliveryConfig,
    DeliveryError,
    DeliveryMetrics,
    HandlerPtr,
    OffsetCommitCoordinator,
    Record,
    Topic,
};

/// Broker commit tries per cycle before deferring to the next cycle.
const COMMIT_TRIES: u32 = 3;
const COMMIT_RETRY_PAUSE: Duration = Duration::from_millis(50);
/// Pause after a failed fetch or resume lookup.
const BROKER_ERROR_PAUSE: Duration = Duration::from_millis(200);

/// Observable state of a consumption loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopState {
    Idle,
    Fetching,
    Dispatching,
    Committing,
    Stopped,
}

/// Position of a consumption loop within its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumptionCursor {
    /// Offset of the last record handed to the handler; `-1` before the first.
    pub last_delivered_offset: i64,
    /// Records of the current batch not yet handled.
    pub in_flight_count: usize,
}

impl Default for ConsumptionCursor {
    fn default() -> Self {
        Self {
            last_delivered_offset: NO_OFFSET,
            in_flight_count: 0,
        }
    }
}

/// How a record left the dispatch stage.
enum Disposition {
    Handled,
    DeadLettered,
    Interrupted,
}

pub(crate) struct ConsumptionLoop {
    // ---
    broker: BrokerPtr,
    topic: Topic,
    partition: u32,
    handler: HandlerPtr,
    dead_letter: DeadLetterRouter,
    config: DeliveryConfig,
    metrics: DeliveryMetrics,
    offsets: OffsetCommitCoordinator,
    cursor: ConsumptionCursor,
    state: watch::Sender<LoopState>,
    cancel: CancellationToken,
}

impl ConsumptionLoop {
    // ---
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        broker: BrokerPtr,
        topic: Topic,
        partition: u32,
        handler: HandlerPtr,
        dead_letter: DeadLetterRouter,
        config: DeliveryConfig,
        metrics: DeliveryMetrics,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<LoopState>) {
        // ---
        let (state, state_rx) = watch::channel(LoopState::Idle);

        let this = Self {
            broker,
            topic,
            partition,
            handler,
            dead_letter,
            config,
            metrics,
            offsets: OffsetCommitCoordinator::new(),
            cursor: ConsumptionCursor::default(),
            state,
            cancel,
        };
        (this, state_rx)
    }

    /// Run until cancelled; returns the final cursor.
    pub(crate) async fn run(mut self) -> ConsumptionCursor {
        // ---
        if self.resume().await {
            log_info!(
                "consuming {}/{} from offset {}",
                self.topic,
                self.partition,
                self.cursor.last_delivered_offset + 1
            );

            while !self.cancel.is_cancelled() {
                self.cycle().await;
            }

            // Best-effort final commit of what was handled before the stop.
            self.commit().await;
        }

        self.set_state(LoopState::Stopped);
        log_debug!(
            "consumption of {}/{} stopped at {:?}",
            self.topic,
            self.partition,
            self.cursor
        );
        self.cursor
    }

    /// Seed offsets from the broker's committed position.
    ///
    /// Returns `false` if cancelled before the broker answered.
    async fn resume(&mut self) -> bool {
        // ---
        loop {
            match self.broker.committed(&self.topic, self.partition).await {
                Ok(committed) => {
                    self.offsets.seed(self.partition, committed);
                    self.cursor.last_delivered_offset = committed.unwrap_or(NO_OFFSET);
                    return true;
                }
                Err(_err) => {
                    log_warn!(
                        "cannot read committed offset of {}/{}: {_err}",
                        self.topic,
                        self.partition
                    );
                    if !self.pause(BROKER_ERROR_PAUSE).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn cycle(&mut self) {
        // ---
        self.set_state(LoopState::Fetching);

        let from = self.cursor.last_delivered_offset + 1;
        let fetch = self.broker.fetch(
            &self.topic,
            self.partition,
            from,
            self.config.fetch_max_messages,
            self.config.poll_timeout(),
        );

        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => return,
            fetched = fetch => fetched,
        };

        let records = match fetched {
            Ok(records) => records,
            Err(_err) => {
                log_warn!("fetch from {}/{} failed: {_err}", self.topic, self.partition);
                self.pause(BROKER_ERROR_PAUSE).await;
                return;
            }
        };

        if !records.is_empty() {
            self.set_state(LoopState::Dispatching);
            self.dispatch(records).await;
        }

        if self.offsets.commit_target(self.partition).is_some() {
            self.set_state(LoopState::Committing);
            self.commit().await;
        }

        // Lag follows the commit, including one that lands in an empty cycle.
        self.update_lag().await;
        self.set_state(LoopState::Idle);
    }

    async fn dispatch(&mut self, records: Vec<Record>) {
        // ---
        let partition = self.partition;

        // Records at or below the committable point were already handled.
        let committable = self.offsets.committable(partition);
        let batch: Vec<Record> = records
            .into_iter()
            .filter(|record| record.offset > committable)
            .collect();
        self.cursor.in_flight_count = batch.len();

        for record in &batch {
            if self.cancel.is_cancelled() {
                break;
            }

            // Offsets the broker skipped over do not exist.
            self.offsets.skip_to(partition, record.offset);
            if !self.offsets.record_pending(partition, record.offset) {
                self.cursor.in_flight_count -= 1;
                continue;
            }

            match self.process(record).await {
                Disposition::Handled | Disposition::DeadLettered => {
                    self.offsets.record_handled(partition, record.offset);
                    self.cursor.last_delivered_offset = record.offset;
                    self.cursor.in_flight_count -= 1;
                }
                Disposition::Interrupted => {
                    self.offsets.release_from(partition, record.offset);
                    break;
                }
            }
        }

        self.cursor.in_flight_count = 0;
    }

    /// Invoke the handler with retries; dead-letter once retries run out.
    async fn process(&self, record: &Record) -> Disposition {
        // ---
        let max_invocations = self.config.max_handler_retries.saturating_add(1);
        let mut invocations = 0;

        loop {
            invocations += 1;

            let detail = match self.invoke(record).await {
                Ok(()) => {
                    self.metrics.messages_delivered.inc();
                    return Disposition::Handled;
                }
                Err(detail) => detail,
            };

            if invocations >= max_invocations {
                log_error!(
                    "handler failed {invocations} times on {}/{}@{}, dead-lettering to {}: {detail}",
                    record.topic,
                    record.partition,
                    record.offset,
                    self.dead_letter.topic()
                );
                let error = DeliveryError::HandlerFailure(detail);
                // Detached; the publish completes on its own task.
                drop(self.dead_letter.quarantine(record, &error, invocations));
                return Disposition::DeadLettered;
            }

            log_debug!(
                "handler failed on {}/{}@{} (invocation {invocations}): {detail}",
                record.topic,
                record.partition,
                record.offset
            );

            if !self.pause(self.config.handler_retry_delay()).await {
                return Disposition::Interrupted;
            }
        }
    }

    /// Call the handler, turning errors and panics into a failure detail.
    async fn invoke(&self, record: &Record) -> Result<(), String> {
        // ---
        let call = AssertUnwindSafe(self.handler.handle(record)).catch_unwind();

        match call.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_owned());
                Err(format!("handler panicked: {reason}"))
            }
        }
    }

    /// Commit the committable offset; deferred to the next cycle on failure.
    async fn commit(&mut self) {
        // ---
        let partition = self.partition;
        let Some(target) = self.offsets.commit_target(partition) else {
            return;
        };

        for attempt in 1..=COMMIT_TRIES {
            match self.broker.commit(&self.topic, partition, target).await {
                Ok(()) => {
                    self.offsets.mark_committed(partition, target);
                    log_debug!("committed {}/{partition}@{target}", self.topic);
                    return;
                }
                Err(_err) => {
                    log_warn!(
                        "commit of {}/{partition}@{target} failed (try {attempt}/{COMMIT_TRIES}): {_err}",
                        self.topic
                    );
                    if attempt < COMMIT_TRIES {
                        tokio::time::sleep(COMMIT_RETRY_PAUSE * attempt).await;
                    }
                }
            }
        }

        log_warn!(
            "commit of {}/{partition}@{target} deferred to next cycle",
            self.topic
        );
    }

    async fn update_lag(&self) {
        // ---
        match self.broker.latest_offset(&self.topic, self.partition).await {
            Ok(latest) => {
                let latest = latest.unwrap_or(NO_OFFSET);
                let lag = (latest - self.offsets.committed(self.partition)).max(0);
                self.metrics.set_consumer_lag(self.partition, lag);
            }
            Err(_err) => {
                log_debug!(
                    "cannot read latest offset of {}/{}: {_err}",
                    self.topic,
                    self.partition
                );
            }
        }
    }

    /// Sleep for `delay` unless cancelled first; returns `false` on cancel.
    async fn pause(&self, delay: Duration) -> bool {
        // ---
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{handler_fn, Broker, Message, MemoryBroker, RetryingPublisher};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn fast_config() -> DeliveryConfig {
        DeliveryConfig::default()
            .with_poll_timeout(Duration::from_millis(20))
            .with_handler_retry_delay(Duration::from_millis(1))
            .with_circuit_breaker(None)
    }

    fn spawn_loop(
        broker: &Arc<MemoryBroker>,
        handler: HandlerPtr,
        config: DeliveryConfig,
        metrics: DeliveryMetrics,
    ) -> (tokio::task::JoinHandle<ConsumptionCursor>, watch::Receiver<LoopState>, CancellationToken) {
        // ---
        let topic = Topic::from("t");
        let publisher =
            RetryingPublisher::new(broker.clone(), topic.clone(), config.clone(), metrics.clone())
                .unwrap();
        let router = DeadLetterRouter::new(
            publisher,
            DeadLetterRouter::default_topic(&topic),
            metrics.clone(),
        );
        let cancel = CancellationToken::new();
        let (consumption, state) = ConsumptionLoop::new(
            broker.clone(),
            topic,
            0,
            handler,
            router,
            config,
            metrics,
            cancel.clone(),
        );
        (tokio::spawn(consumption.run()), state, cancel)
    }

    async fn wait_committed(broker: &MemoryBroker, offset: i64) {
        // ---
        let topic = Topic::from("t");
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.committed(&topic, 0).await.unwrap() != Some(offset) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("offset never committed");
    }

    #[tokio::test]
    async fn test_handles_in_order_and_commits() {
        // ---
        let broker = MemoryBroker::new();
        let topic = Topic::from("t");
        for n in 0..5 {
            broker.send(&topic, Message::new(format!("m{n}"))).await.unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = Arc::new(handler_fn(move |record: Record| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(record.offset);
                Ok(())
            }
        }));
        let metrics = DeliveryMetrics::new().unwrap();

        let (task, _state, cancel) = spawn_loop(&broker, handler, fast_config(), metrics.clone());
        wait_committed(&broker, 4).await;
        cancel.cancel();

        let cursor = task.await.unwrap();
        assert_eq!(cursor.last_delivered_offset, 4);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(metrics.messages_delivered.get(), 5);
        assert_eq!(metrics.consumer_lag(0), 0);
    }

    #[tokio::test]
    async fn test_handler_calls_never_overlap() {
        // ---
        let broker = MemoryBroker::new();
        let topic = Topic::from("t");
        for n in 0..4 {
            broker.send(&topic, Message::new(format!("m{n}"))).await.unwrap();
        }

        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicU32::new(0));
        let (flag, counter) = (busy.clone(), overlaps.clone());
        let handler = Arc::new(handler_fn(move |_record: Record| {
            let (flag, counter) = (flag.clone(), counter.clone());
            async move {
                if flag.swap(true, Ordering::SeqCst) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                flag.store(false, Ordering::SeqCst);
                Ok(())
            }
        }));

        let (task, _state, cancel) =
            spawn_loop(&broker, handler, fast_config(), DeliveryMetrics::new().unwrap());
        wait_committed(&broker, 3).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resumes_after_committed_offset() {
        // ---
        let broker = MemoryBroker::new();
        let topic = Topic::from("t");
        for n in 0..4 {
            broker.send(&topic, Message::new(format!("m{n}"))).await.unwrap();
        }
        broker.commit(&topic, 0, 1).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = Arc::new(handler_fn(move |record: Record| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(record.offset);
                Ok(())
            }
        }));

        let (task, _state, cancel) =
            spawn_loop(&broker, handler, fast_config(), DeliveryMetrics::new().unwrap());
        wait_committed(&broker, 3).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_dead_lettered() {
        // ---
        let broker = MemoryBroker::new();
        let topic = Topic::from("t");
        broker.send(&topic, Message::new("poison")).await.unwrap();
        broker.send(&topic, Message::new("fine")).await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = Arc::new(handler_fn(move |record: Record| {
            let counter = counter.clone();
            async move {
                if record.message.value_str() == Some("poison") {
                    counter.fetch_add(1, Ordering::SeqCst);
                    panic!("cannot parse");
                }
                Ok(())
            }
        }));
        let metrics = DeliveryMetrics::new().unwrap();
        let config = fast_config().with_max_handler_retries(2);

        let (task, _state, cancel) = spawn_loop(&broker, handler, config, metrics.clone());
        wait_committed(&broker, 1).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.messages_delivered.get(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.all_records(&Topic::from("t.dlt")).is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dead letter never published");
    }

    #[tokio::test]
    async fn test_commit_failure_retried_next_cycle() {
        // ---
        let broker = MemoryBroker::new();
        let topic = Topic::from("t");
        broker.send(&topic, Message::new("m")).await.unwrap();
        broker.fail_next_commits(COMMIT_TRIES + 1);

        let handler = Arc::new(handler_fn(|_record: Record| async { Ok(()) }));
        let (task, _state, cancel) =
            spawn_loop(&broker, handler, fast_config(), DeliveryMetrics::new().unwrap());

        wait_committed(&broker, 0).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(broker.commit_calls() >= u64::from(COMMIT_TRIES) + 2);
    }

    #[tokio::test]
    async fn test_lag_follows_deferred_commit() {
        // ---
        let broker = MemoryBroker::new();
        let topic = Topic::from("t");
        broker.send(&topic, Message::new("m")).await.unwrap();
        broker.fail_next_commits(COMMIT_TRIES);

        let handler = Arc::new(handler_fn(|_record: Record| async { Ok(()) }));
        let metrics = DeliveryMetrics::new().unwrap();
        let (task, _state, cancel) = spawn_loop(&broker, handler, fast_config(), metrics.clone());

        // The first cycle defers the commit; a later empty cycle lands it.
        wait_committed(&broker, 0).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.consumer_lag(0) != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("lag never caught up with the commit");

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(metrics.consumer_lag(0), 0);
    }

    #[tokio::test]
    async fn test_cancel_reaches_stopped() {
        // ---
        let broker = MemoryBroker::new();
        let handler = Arc::new(handler_fn(|_record: Record| async { Ok(()) }));
        let (task, mut state, cancel) =
            spawn_loop(&broker, handler, fast_config(), DeliveryMetrics::new().unwrap());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == LoopState::Stopped))
            .await
            .expect("loop did not stop")
            .unwrap();

        assert_eq!(task.await.unwrap(), ConsumptionCursor::default());
    }
}
