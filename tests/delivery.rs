// tests/delivery.rs

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mom_delivery::{
    // ---
    handler_fn,
    Ack,
    Broker,
    ConsumerBuilder,
    DeadLetterRecord,
    Deduplicate,
    DeliveryError,
    DeliveryMetrics,
    ErrorKind,
    MemoryBroker,
    Message,
    Record,
    Result,
    RetryingPublisher,
    Topic,
    MESSAGE_ID_HEADER,
};

/// Broker that records every commit the broker accepted.
struct RecordingBroker {
    // ---
    inner: Arc<MemoryBroker>,
    commits: Mutex<Vec<(u32, i64)>>,
}

#[async_trait]
impl Broker for RecordingBroker {
    // ---
    async fn partitions(&self, topic: &Topic) -> Result<u32> {
        self.inner.partitions(topic).await
    }

    async fn send(&self, topic: &Topic, message: Message) -> Result<Ack> {
        self.inner.send(topic, message).await
    }

    async fn fetch(
        &self,
        topic: &Topic,
        partition: u32,
        offset: i64,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>> {
        self.inner
            .fetch(topic, partition, offset, max_messages, timeout)
            .await
    }

    async fn commit(&self, topic: &Topic, partition: u32, offset: i64) -> Result<()> {
        // ---
        self.inner.commit(topic, partition, offset).await?;
        self.commits.lock().unwrap().push((partition, offset));
        Ok(())
    }

    async fn committed(&self, topic: &Topic, partition: u32) -> Result<Option<i64>> {
        self.inner.committed(topic, partition).await
    }

    async fn latest_offset(&self, topic: &Topic, partition: u32) -> Result<Option<i64>> {
        self.inner.latest_offset(topic, partition).await
    }
}

fn publisher(broker: Arc<dyn Broker>, topic: &Topic) -> RetryingPublisher {
    RetryingPublisher::new(
        broker,
        topic.clone(),
        common::fast_config(),
        DeliveryMetrics::new().unwrap(),
    )
    .unwrap()
}

/// Handler that records `(key, value)` in arrival order.
fn collecting(seen: Arc<Mutex<Vec<(String, String)>>>) -> impl mom_delivery::MessageHandler {
    handler_fn(move |record: Record| {
        let seen = seen.clone();
        async move {
            let key = record
                .message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned())
                .unwrap_or_default();
            let value = record.message.value_str().unwrap_or_default().to_owned();
            seen.lock().unwrap().push((key, value));
            Ok(())
        }
    })
}

async fn committed(broker: &MemoryBroker, topic: &Topic, partition: u32) -> Option<i64> {
    broker.committed(topic, partition).await.unwrap()
}

/// Wait until `partition` of `topic` is committed at `offset`.
async fn wait_committed(broker: &MemoryBroker, topic: &Topic, partition: u32, offset: i64) {
    // ---
    let wait = async {
        while committed(broker, topic, partition).await != Some(offset) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap_or_else(|_| panic!("{topic}/{partition}@{offset} never committed"));
}

#[tokio::test]
async fn test_fault_free_delivers_each_message_once() {
    // ---
    common::init_logging();

    let broker = MemoryBroker::with_partitions(3);
    let topic = Topic::from("orders");
    let counts: Arc<Mutex<HashMap<String, u32>>> = Arc::default();

    let sink = counts.clone();
    let consumer = ConsumerBuilder::new(broker.clone(), topic.clone())
        .handler(handler_fn(move |record: Record| {
            let sink = sink.clone();
            async move {
                let id = record.message.message_id().unwrap_or_default().to_owned();
                *sink.lock().unwrap().entry(id).or_default() += 1;
                Ok(())
            }
        }))
        .config(common::fast_config())
        .build()
        .unwrap();
    let running = consumer.start(CancellationToken::new()).await.unwrap();

    let publisher = publisher(broker.clone(), &topic);
    for n in 0..60 {
        let message = Message::new(format!("order-{n}")).with_key(format!("customer-{}", n % 7));
        publisher.publish(message).await.unwrap();
    }

    common::eventually("all 60 messages", || {
        counts.lock().unwrap().values().sum::<u32>() >= 60
    })
    .await;
    running.shutdown().await;
    publisher.shutdown().await;

    let counts = counts.lock().unwrap();
    assert_eq!(counts.len(), 60);
    assert!(counts.values().all(|&n| n == 1));

    for partition in 0..3 {
        assert_eq!(
            committed(&broker, &topic, partition).await,
            broker.latest_offset(&topic, partition).await.unwrap()
        );
    }
}

#[tokio::test]
async fn test_same_key_keeps_order() {
    // ---
    common::init_logging();

    let broker = MemoryBroker::with_partitions(2);
    let topic = Topic::from("keys");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let consumer = ConsumerBuilder::new(broker.clone(), topic.clone())
        .handler(collecting(seen.clone()))
        .config(common::fast_config())
        .build()
        .unwrap();
    let running = consumer.start(CancellationToken::new()).await.unwrap();

    // The first two sends fail, so early messages are retried while others proceed.
    broker.fail_next_sends([
        DeliveryError::Transient("leader not ready".into()),
        DeliveryError::Transient("leader not ready".into()),
    ]);
    let publisher = publisher(broker.clone(), &topic);
    let a1 = publisher
        .enqueue(Message::new("A1").with_key("A"))
        .await
        .unwrap();
    let b1 = publisher
        .enqueue(Message::new("B1").with_key("B"))
        .await
        .unwrap();
    let a2 = publisher
        .enqueue(Message::new("A2").with_key("A"))
        .await
        .unwrap();
    a1.await.unwrap();
    b1.await.unwrap();
    a2.await.unwrap();

    common::eventually("three messages", || seen.lock().unwrap().len() == 3).await;
    running.shutdown().await;
    publisher.shutdown().await;

    let seen = seen.lock().unwrap();
    let a_values: Vec<&str> = seen
        .iter()
        .filter(|(key, _)| key == "A")
        .map(|(_, value)| value.as_str())
        .collect();
    assert_eq!(a_values, vec!["A1", "A2"]);
}

#[tokio::test]
async fn test_retry_bound_is_max_attempts() {
    // ---
    common::init_logging();

    let broker = MemoryBroker::new();
    broker.fail_all_sends(DeliveryError::Transient("broker unavailable".into()));
    let topic = Topic::from("t");
    let publisher = RetryingPublisher::new(
        broker.clone(),
        topic,
        common::fast_config().with_max_attempts(5),
        DeliveryMetrics::new().unwrap(),
    )
    .unwrap();

    let err = publisher.publish(Message::new("m")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Exhausted);
    assert!(matches!(err, DeliveryError::Exhausted { attempts: 5, .. }));
    assert_eq!(broker.send_calls(), 5);
    assert_eq!(publisher.in_flight(), 0);
}

#[tokio::test]
async fn test_poison_message_dead_lettered_once() {
    // ---
    common::init_logging();

    let broker = MemoryBroker::new();
    let topic = Topic::from("payments");
    let metrics = DeliveryMetrics::new().unwrap();
    let invocations = Arc::new(Mutex::new(0_u32));

    let counter = invocations.clone();
    let consumer = ConsumerBuilder::new(broker.clone(), topic.clone())
        .handler(handler_fn(move |record: Record| {
            let counter = counter.clone();
            async move {
                if record.message.value_str() == Some("poison") {
                    *counter.lock().unwrap() += 1;
                    anyhow::bail!("cannot decode payment");
                }
                Ok(())
            }
        }))
        .config(common::fast_config().with_max_handler_retries(3))
        .metrics(metrics.clone())
        .build()
        .unwrap();
    let running = consumer.start(CancellationToken::new()).await.unwrap();

    let publisher = publisher(broker.clone(), &topic);
    publisher.publish(Message::new("poison").with_key("p")).await.unwrap();
    publisher.publish(Message::new("valid").with_key("p")).await.unwrap();

    let dlt = Topic::from("payments.dlt");
    common::eventually("dead letter", || metrics.dead_lettered.get() == 1).await;
    wait_committed(&broker, &topic, 0, 1).await;

    let cursors = running.shutdown().await;
    publisher.shutdown().await;

    assert_eq!(*invocations.lock().unwrap(), 4);
    assert_eq!(cursors[&0].last_delivered_offset, 1);
    assert_eq!(committed(&broker, &topic, 0).await, Some(1));

    let quarantined = broker.all_records(&dlt);
    assert_eq!(quarantined.len(), 1);
    let dead_letter = DeadLetterRecord::decode(&quarantined[0].message).unwrap();
    assert_eq!(dead_letter.failure_reason, ErrorKind::HandlerFailure);
    assert_eq!(dead_letter.attempts, 4);
    assert_eq!(dead_letter.source_offset, 0);
    assert_eq!(dead_letter.original.value_str(), Some("poison"));
    assert_eq!(quarantined[0].message.key().map(|k| k.as_ref()), Some(&b"p"[..]));
}

#[tokio::test]
async fn test_commits_monotonic_under_commit_failures() {
    // ---
    common::init_logging();

    let memory = MemoryBroker::new();
    let broker = Arc::new(RecordingBroker {
        inner: memory.clone(),
        commits: Mutex::new(Vec::new()),
    });
    let topic = Topic::from("t");
    let handled = Arc::new(Mutex::new(0_usize));

    let counter = handled.clone();
    let consumer = ConsumerBuilder::new(broker.clone(), topic.clone())
        .handler(handler_fn(move |_record: Record| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Ok(())
            }
        }))
        .config(common::fast_config())
        .build()
        .unwrap();
    let running = consumer.start(CancellationToken::new()).await.unwrap();

    let publisher = publisher(memory.clone(), &topic);
    for batch in 0..5 {
        memory.fail_next_commits(4);
        for n in 0..6 {
            publisher
                .publish(Message::new(format!("m{batch}-{n}")))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    common::eventually("final commit", || {
        broker.commits.lock().unwrap().last() == Some(&(0, 29))
    })
    .await;
    running.shutdown().await;
    publisher.shutdown().await;

    let commits = broker.commits.lock().unwrap();
    assert!(commits.windows(2).all(|pair| pair[0].1 <= pair[1].1));
    assert_eq!(*handled.lock().unwrap(), 30);
}

#[tokio::test]
async fn test_restart_resumes_after_commit() {
    // ---
    common::init_logging();

    let broker = MemoryBroker::new();
    let topic = Topic::from("t");
    let publisher = publisher(broker.clone(), &topic);
    for n in 0..3 {
        publisher.publish(Message::new(format!("first-{n}"))).await.unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = ConsumerBuilder::new(broker.clone(), topic.clone())
        .handler(collecting(seen.clone()))
        .config(common::fast_config())
        .build()
        .unwrap();
    let running = consumer.start(CancellationToken::new()).await.unwrap();
    common::eventually("first generation", || seen.lock().unwrap().len() == 3).await;
    running.shutdown().await;
    assert_eq!(committed(&broker, &topic, 0).await, Some(2));

    for n in 0..2 {
        publisher.publish(Message::new(format!("second-{n}"))).await.unwrap();
    }

    let consumer = ConsumerBuilder::new(broker.clone(), topic.clone())
        .handler(collecting(seen.clone()))
        .config(common::fast_config())
        .build()
        .unwrap();
    let running = consumer.start(CancellationToken::new()).await.unwrap();
    common::eventually("second generation", || seen.lock().unwrap().len() == 5).await;
    running.shutdown().await;
    publisher.shutdown().await;

    let values: Vec<String> = seen.lock().unwrap().iter().map(|(_, v)| v.clone()).collect();
    assert_eq!(
        values,
        vec!["first-0", "first-1", "first-2", "second-0", "second-1"]
    );
}

#[tokio::test]
async fn test_dedup_skips_republished_message() {
    // ---
    common::init_logging();

    let broker = MemoryBroker::new();
    let topic = Topic::from("t");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let consumer = ConsumerBuilder::new(broker.clone(), topic.clone())
        .handler(Deduplicate::new(collecting(seen.clone())))
        .config(common::fast_config())
        .build()
        .unwrap();
    let running = consumer.start(CancellationToken::new()).await.unwrap();

    let publisher = publisher(broker.clone(), &topic);
    let message = Message::new("charge").with_header(MESSAGE_ID_HEADER, "charge-42");
    publisher.publish(message.clone()).await.unwrap();
    publisher.publish(message).await.unwrap();
    publisher.publish(Message::new("refund")).await.unwrap();

    wait_committed(&broker, &topic, 0, 2).await;

    running.shutdown().await;
    publisher.shutdown().await;

    let values: Vec<String> = seen.lock().unwrap().iter().map(|(_, v)| v.clone()).collect();
    assert_eq!(values, vec!["charge", "refund"]);
}
