// demos/hello.rs
//
// Send "Hello Spring Kafka!" through the in-memory broker and wait until the
// consumer has seen it.
//
//   cargo run --example hello
//   RUST_LOG=mom_delivery=debug cargo run --example hello

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mom_delivery::{
    // ---
    handler_fn,
    ConsumerBuilder,
    CountdownLatch,
    DeliveryConfig,
    DeliveryMetrics,
    MemoryBroker,
    Message,
    Record,
    RetryingPublisher,
    Topic,
};

const HELLOWORLD_TOPIC: &str = "helloworld.t";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = DeliveryConfig::default().with_poll_timeout(Duration::from_millis(200));
    let metrics = DeliveryMetrics::new()?;
    let broker = MemoryBroker::with_partitions(1);
    let topic = Topic::from(HELLOWORLD_TOPIC);
    let cancel = CancellationToken::new();

    let latch = CountdownLatch::new(1);
    let received = latch.clone();

    let consumer = ConsumerBuilder::new(broker.clone(), topic.clone())
        .handler(handler_fn(move |record: Record| {
            let received = received.clone();
            async move {
                tracing::info!(
                    "received payload='{}' at {}/{}@{}",
                    record.message.value_str().unwrap_or("<binary>"),
                    record.topic,
                    record.partition,
                    record.offset
                );
                received.count_down();
                Ok(())
            }
        }))
        .config(config.clone())
        .metrics(metrics.clone())
        .build()?;
    let running = consumer.start(cancel.clone()).await?;

    let publisher = RetryingPublisher::new(broker.clone(), topic, config, metrics.clone())?;
    let ack = publisher.publish(Message::new("Hello Spring Kafka!")).await?;
    tracing::info!("sent to {}/{}@{}", ack.topic, ack.partition, ack.offset);

    let remaining = latch
        .wait_cancellable(Duration::from_millis(10_000), &cancel)
        .await;

    running.shutdown().await;
    publisher.shutdown().await;

    if remaining != 0 {
        anyhow::bail!("message not received within 10s");
    }

    print!("{}", metrics.encode()?);
    Ok(())
}
