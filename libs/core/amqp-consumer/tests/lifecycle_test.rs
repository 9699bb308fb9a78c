//! Lifecycle tests for the AMQP consumer
//!
//! These tests run the consumer against the in-memory broker to check:
//! - Start/stop state transitions and their errors
//! - Graceful stop drains every pulled delivery
//! - Immediate stop returns without waiting
//! - Messages carry the channel they can be settled on

use amqp_consumer::*;
use core_config::{Environment, tracing::init_tracing};
use std::sync::Arc;
use std::time::Duration;
use test_utils::{MemoryBroker, TestDataBuilder, assertions::*, recv_n};

const WAIT: Duration = Duration::from_secs(2);

fn consumer_for(broker: &MemoryBroker, config: ConsumerConfig) -> Consumer {
    init_tracing(&Environment::from_env());
    Consumer::new(config, PoolConfig::default(), Arc::new(broker.clone())).unwrap()
}

fn test_config(builder: &TestDataBuilder) -> ConsumerConfig {
    ConsumerConfig::new(builder.name("queue", "main"), builder.name("consumer", "main"))
        .with_sleep_on_error(Duration::from_millis(10))
        .with_sleep_on_idle(Duration::from_millis(10))
}

// ============================================================================
// Start / Stop
// ============================================================================

#[tokio::test]
async fn test_graceful_stop_keeps_consumed_messages() {
    let broker = MemoryBroker::new("Q");
    let consumer = consumer_for(&broker, ConsumerConfig::new("Q", "C").with_buffers(10, 10));
    let messages = consumer.messages();

    for body in ["one", "two", "three"] {
        broker.publish(body);
    }

    consumer.start_consuming().await.unwrap();
    assert!(consumer.is_started().await);

    eventually(WAIT, "three messages queued", || {
        let done = messages.len() == 3;
        async move { done }
    })
    .await;

    consumer.stop_consuming(false).await.unwrap();
    within(WAIT, "graceful stop", consumer.stopped()).await;
    assert!(!consumer.is_started().await);
    assert!(!consumer.is_stopping().await);

    let mut received: Vec<Message> = std::iter::from_fn(|| messages.try_recv()).collect();
    received.sort_by_key(|m| m.delivery_tag());

    let tags: Vec<u64> = received.iter().map(|m| m.delivery_tag()).collect();
    assert_eq!(tags, vec![1, 2, 3]);
    assert!(received.iter().all(|m| m.is_ackable()));
    assert_eq!(broker.released(), vec![(1, false)]);
}

#[tokio::test]
async fn test_start_twice_fails() {
    let builder = TestDataBuilder::from_test_name("start_twice");
    let broker = MemoryBroker::new(builder.name("queue", "main"));
    let consumer = consumer_for(&broker, test_config(&builder));

    consumer.start_consuming().await.unwrap();
    within(WAIT, "consumer", broker.wait_for_consumers(1)).await;
    assert_eq!(
        consumer.start_consuming().await,
        Err(ConsumerError::AlreadyStarted)
    );

    // The rejected start must not have launched a second loop
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.acquisitions(), 1);
    assert_eq!(broker.consumers(), 1);

    consumer.stop_consuming(false).await.unwrap();
    within(WAIT, "stop", consumer.stopped()).await;
}

#[tokio::test]
async fn test_concurrent_starts_run_one_loop() {
    let builder = TestDataBuilder::from_test_name("concurrent_starts");
    let broker = MemoryBroker::new(builder.name("queue", "main"));
    let consumer = consumer_for(&broker, test_config(&builder));
    let other = consumer.clone();

    let (first, second) = tokio::join!(consumer.start_consuming(), other.start_consuming());
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.contains(&Err(ConsumerError::AlreadyStarted)));

    within(WAIT, "consumer", broker.wait_for_consumers(1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.acquisitions(), 1);
    assert_eq!(broker.consumers(), 1);
    assert_eq!(broker.channel_ids(), vec![1]);

    consumer.stop_consuming(false).await.unwrap();
    within(WAIT, "stop", consumer.stopped()).await;
    assert_eq!(broker.released(), vec![(1, false)]);
}

#[tokio::test]
async fn test_stop_when_stopped_fails() {
    let builder = TestDataBuilder::from_test_name("stop_when_stopped");
    let broker = MemoryBroker::new(builder.name("queue", "main"));
    let consumer = consumer_for(&broker, test_config(&builder));

    assert_eq!(
        consumer.stop_consuming(true).await,
        Err(ConsumerError::NotStarted)
    );

    consumer.start_consuming().await.unwrap();
    consumer.stop_consuming(true).await.unwrap();
    within(WAIT, "stop", consumer.stopped()).await;

    assert_eq!(
        consumer.stop_consuming(false).await,
        Err(ConsumerError::NotStarted)
    );
}

#[tokio::test]
async fn test_restart_after_stop() {
    let builder = TestDataBuilder::from_test_name("restart_after_stop");
    let broker = MemoryBroker::new(builder.name("queue", "main"));
    let consumer = consumer_for(&broker, test_config(&builder));
    let messages = consumer.messages();

    consumer.start_consuming().await.unwrap();
    within(WAIT, "first consumer", broker.wait_for_consumers(1)).await;
    consumer.stop_consuming(false).await.unwrap();
    within(WAIT, "first stop", consumer.stopped()).await;

    consumer.start_consuming().await.unwrap();
    within(WAIT, "second consumer", broker.wait_for_consumers(2)).await;

    broker.publish(builder.body(1));
    let received = recv_n(&messages, 1, WAIT).await;
    assert_eq!(received[0].body(), builder.body(1).as_slice());
    assert_eq!(received[0].channel().id(), 2);

    consumer.stop_consuming(false).await.unwrap();
    within(WAIT, "second stop", consumer.stopped()).await;
    assert_eq!(broker.released(), vec![(1, false), (2, false)]);
}

#[tokio::test]
async fn test_start_flushes_stale_errors() {
    let builder = TestDataBuilder::from_test_name("start_flushes_errors");
    let broker = MemoryBroker::new(builder.name("queue", "main"));
    let consumer = consumer_for(&broker, test_config(&builder));
    let errors = consumer.errors();

    broker.fail_next_acquires(1);
    consumer.start_consuming().await.unwrap();
    within(WAIT, "consumer after failure", broker.wait_for_consumers(1)).await;
    assert_eq!(errors.len(), 1);

    consumer.stop_consuming(false).await.unwrap();
    within(WAIT, "stop", consumer.stopped()).await;

    consumer.start_consuming().await.unwrap();
    assert!(errors.is_empty());

    consumer.stop_consuming(true).await.unwrap();
    within(WAIT, "stop", consumer.stopped()).await;
}

// ============================================================================
// Draining
// ============================================================================

/// Publish five bodies into a consumer with room for two queued and two in flight,
/// and wait until both are full.
async fn saturate(builder: &TestDataBuilder) -> (MemoryBroker, Consumer) {
    let broker = MemoryBroker::new(builder.name("queue", "main"));
    let consumer = consumer_for(&broker, test_config(builder).with_buffers(2, 10));
    let messages = consumer.messages();

    for n in 0..5 {
        broker.publish(builder.body(n));
    }
    consumer.start_consuming().await.unwrap();

    eventually(WAIT, "queue and in-flight slots full", || {
        let done = messages.len() == 2 && consumer.in_flight() == 2;
        async move { done }
    })
    .await;

    (broker, consumer)
}

#[tokio::test]
async fn test_graceful_stop_waits_for_in_flight() {
    let builder = TestDataBuilder::from_test_name("graceful_waits");
    let (_broker, consumer) = saturate(&builder).await;
    let messages = consumer.messages();

    consumer.stop_consuming(false).await.unwrap();
    assert!(consumer.is_stopping().await);

    let early = tokio::time::timeout(Duration::from_millis(100), consumer.stopped()).await;
    assert!(early.is_err(), "graceful stop must wait for in-flight deliveries");
    assert!(consumer.is_started().await);

    let received = recv_n(&messages, 4, WAIT).await;
    assert_eq!(received.len(), 4);

    within(WAIT, "drain", consumer.stopped()).await;
    assert_eq!(consumer.in_flight(), 0);
    assert!(!consumer.is_started().await);
}

#[tokio::test]
async fn test_immediate_stop_does_not_wait() {
    let builder = TestDataBuilder::from_test_name("immediate_stop");
    let (_broker, consumer) = saturate(&builder).await;
    let messages = consumer.messages();

    consumer.stop_consuming(true).await.unwrap();
    within(WAIT, "immediate stop", consumer.stopped()).await;
    assert!(!consumer.is_started().await);
    assert_eq!(consumer.in_flight(), 2);

    // In-flight deliveries still land once there is room
    let received = recv_n(&messages, 4, WAIT).await;
    assert_eq!(received.len(), 4);

    eventually(WAIT, "in-flight settled", || {
        let done = consumer.in_flight() == 0;
        async move { done }
    })
    .await;
}

#[tokio::test]
async fn test_flush_messages_drops_queued() {
    let builder = TestDataBuilder::from_test_name("flush_messages");
    let broker = MemoryBroker::new(builder.name("queue", "main"));
    let consumer = consumer_for(&broker, test_config(&builder));
    let messages = consumer.messages();

    consumer.start_consuming().await.unwrap();
    within(WAIT, "consumer", broker.wait_for_consumers(1)).await;
    for n in 0..3 {
        broker.publish(builder.body(n));
    }

    eventually(WAIT, "three messages queued", || {
        let done = messages.len() == 3;
        async move { done }
    })
    .await;

    assert_eq!(consumer.flush_messages(), 3);
    assert!(messages.try_recv().is_none());
    // Flushed deliveries stay unacked on the broker
    assert_eq!(broker.unacked(1), vec![1, 2, 3]);

    consumer.stop_consuming(false).await.unwrap();
    within(WAIT, "stop", consumer.stopped()).await;
}

// ============================================================================
// Messages
// ============================================================================

#[tokio::test]
async fn test_ack_through_message_channel() {
    let builder = TestDataBuilder::from_test_name("ack_through_channel");
    let broker = MemoryBroker::new(builder.name("queue", "main"));
    let consumer = consumer_for(&broker, test_config(&builder));

    consumer.start_consuming().await.unwrap();
    within(WAIT, "consumer", broker.wait_for_consumers(1)).await;
    broker.publish(builder.body(7));

    let message = assert_some(
        recv_n(&consumer.messages(), 1, WAIT).await.pop(),
        "message should arrive",
    );
    assert!(message.is_ackable());
    assert_eq!(message.body(), builder.body(7).as_slice());

    message
        .channel()
        .ack(message.delivery_tag(), false)
        .await
        .unwrap();
    assert_eq!(broker.acked(1), vec![1]);
    assert!(broker.unacked(1).is_empty());

    consumer.stop_consuming(false).await.unwrap();
    within(WAIT, "stop", consumer.stopped()).await;
}

#[tokio::test]
async fn test_nack_requeue_redelivers() {
    let builder = TestDataBuilder::from_test_name("nack_requeue");
    let broker = MemoryBroker::new(builder.name("queue", "main"));
    let consumer = consumer_for(&broker, test_config(&builder));
    let messages = consumer.messages();

    consumer.start_consuming().await.unwrap();
    within(WAIT, "consumer", broker.wait_for_consumers(1)).await;
    broker.publish(builder.body(1));

    let first = recv_n(&messages, 1, WAIT).await.remove(0);
    first
        .channel()
        .nack(first.delivery_tag(), false, true)
        .await
        .unwrap();

    let second = recv_n(&messages, 1, WAIT).await.remove(0);
    assert_eq!(second.body(), first.body());
    assert_eq!(second.delivery_tag(), 2);

    consumer.stop_consuming(false).await.unwrap();
    within(WAIT, "stop", consumer.stopped()).await;
}

#[tokio::test]
async fn test_auto_ack_messages_are_not_ackable() {
    let builder = TestDataBuilder::from_test_name("auto_ack");
    let broker = MemoryBroker::new(builder.name("queue", "main"));
    let consumer = consumer_for(&broker, test_config(&builder).with_auto_ack(true));

    consumer.start_consuming().await.unwrap();
    within(WAIT, "consumer", broker.wait_for_consumers(1)).await;
    broker.publish(builder.body(1));

    let received = recv_n(&consumer.messages(), 1, WAIT).await;
    assert!(!received[0].is_ackable());
    assert!(broker.unacked(1).is_empty());
    assert!(broker.consume_calls(1)[0].options.auto_ack);

    consumer.stop_consuming(false).await.unwrap();
    within(WAIT, "stop", consumer.stopped()).await;
}

#[tokio::test]
async fn test_from_rabbit_config() {
    let raw = r#"{
        "PoolConfig": { "GlobalQosCount": 10, "GlobalQosSize": 4096 },
        "ConsumerConfigs": {
            "orders": {
                "QueueName": "orders",
                "ConsumerName": "orders-worker",
                "MessageBuffer": 5,
                "ErrorBuffer": 5,
                "Exclusive": true,
                "Args": { "x-priority": 3 }
            }
        }
    }"#;
    let rabbit_config = RabbitConfig::from_json_str(raw).unwrap();
    let broker = MemoryBroker::new("orders");
    let consumer =
        Consumer::from_rabbit_config(&rabbit_config, "orders", Arc::new(broker.clone())).unwrap();
    assert_eq!(consumer.pool_config().global_qos(), Some((10, 4096)));
    assert_eq!(consumer.messages().capacity(), 5);

    consumer.start_consuming().await.unwrap();
    within(WAIT, "consumer", broker.wait_for_consumers(1)).await;

    let call = assert_some(broker.consume_calls(1).pop(), "consume call recorded");
    assert_eq!(call.queue, "orders");
    assert_eq!(call.consumer_tag, "orders-worker");
    assert!(call.options.exclusive);
    assert_eq!(call.arguments.get("x-priority"), Some(&serde_json::json!(3)));

    consumer.stop_consuming(false).await.unwrap();
    within(WAIT, "stop", consumer.stopped()).await;
}
