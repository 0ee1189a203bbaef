use crate::helpers::{
    eventually, fast_reconnect, probe_registry, BrokerEvent, InMemoryBroker, Probe, PROBE_HANDLER,
};
use amqp_dispatcher::configuration::{DispatcherConfig, DispatcherEnvironment};
use amqp_dispatcher::consumers::{ConsumerSpec, HandlerRegistry};
use amqp_dispatcher::dispatcher::Dispatcher;
use amqp_dispatcher::topology::QueueSpec;
use amqp_dispatcher::DispatchError;
use fake::faker::lorem::en::Sentence;
use fake::Fake;
use shutdown_handler::ShutdownHandler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

struct Running {
    shutdown: Arc<ShutdownHandler>,
    handle: JoinHandle<Result<(), DispatchError>>,
}

impl Running {
    async fn stop(self) -> Result<(), DispatchError> {
        self.shutdown.shutdown();
        self.handle.await.unwrap()
    }
}

fn start(broker: &InMemoryBroker, config: DispatcherConfig, registry: HandlerRegistry) -> Running {
    let shutdown = Arc::new(ShutdownHandler::new());
    let dispatcher = Dispatcher::new(config, registry, DispatcherEnvironment::default());
    let handle = tokio::spawn(dispatcher.run_with_transport(
        broker.clone(),
        fast_reconnect(),
        shutdown.clone(),
    ));
    Running { shutdown, handle }
}

fn orders_config(consumer: ConsumerSpec) -> DispatcherConfig {
    DispatcherConfig {
        queues: vec![QueueSpec::new("orders").with_binding("orders-x", "created")],
        consumers: vec![consumer],
        startup_handler: None,
    }
}

fn position(events: &[BrokerEvent], predicate: impl Fn(&BrokerEvent) -> bool) -> usize {
    events.iter().position(predicate).unwrap()
}

#[tokio::test]
async fn orders_are_processed_two_at_a_time_and_acknowledged_once() {
    // Arrange
    let broker = InMemoryBroker::new();
    let probe = Arc::new(Probe::default());
    let config = orders_config(
        ConsumerSpec::new("orders", PROBE_HANDLER)
            .with_prefetch_count(2)
            .with_consumer_count(2),
    );
    let running = start(&broker, config, probe_registry(&probe));
    eventually(|| broker.consumer_tags().len() == 1).await;

    // Act
    for _ in 0..3 {
        broker.publish("orders-x", "created", b"slow:50");
    }
    eventually(|| broker.acked().len() == 3).await;
    running.stop().await.unwrap();

    // Assert
    assert_eq!(probe.instances(), 2);
    assert_eq!(probe.max_in_flight(), 2);
    assert!(broker.rejected().is_empty());
    let mut acked = broker.acked();
    acked.sort_unstable();
    acked.dedup();
    assert_eq!(acked.len(), 3);

    let events = broker.events();
    let declared = position(&events, |e| {
        *e == BrokerEvent::Declared {
            queue: "orders".into(),
            durable: true,
        }
    });
    let bound = position(&events, |e| {
        matches!(e, BrokerEvent::Bound { exchange, .. } if exchange == "orders-x")
    });
    let consumed = position(&events, |e| matches!(e, BrokerEvent::Consumed { .. }));
    assert!(declared < bound && bound < consumed);
    assert!(events.contains(&BrokerEvent::Prefetch(2)));
}

#[tokio::test]
async fn consumer_tags_identify_the_process_and_the_handler() {
    let broker = InMemoryBroker::new();
    let probe = Arc::new(Probe::default());
    let running = start(
        &broker,
        orders_config(ConsumerSpec::new("orders", PROBE_HANDLER)),
        probe_registry(&probe),
    );

    eventually(|| broker.consumer_tags().len() == 1).await;
    running.stop().await.unwrap();

    let tag = &broker.consumer_tags()[0];
    assert!(
        tag.starts_with("amqp-dispatcher.local-[tests.handlers:ProbeHandler]-"),
        "{tag}"
    );
}

#[tokio::test]
async fn no_more_messages_than_handler_instances_are_processed_concurrently() {
    let broker = InMemoryBroker::new();
    let probe = Arc::new(Probe::default());
    let config = orders_config(
        ConsumerSpec::new("orders", PROBE_HANDLER)
            .with_prefetch_count(10)
            .with_consumer_count(3),
    );
    let running = start(&broker, config, probe_registry(&probe));
    eventually(|| broker.consumer_tags().len() == 1).await;

    for _ in 0..9 {
        broker.publish("", "orders", b"slow:30");
    }
    eventually(|| broker.acked().len() == 9).await;
    running.stop().await.unwrap();

    assert_eq!(probe.instances(), 3);
    assert_eq!(probe.max_in_flight(), 3);
}

#[tokio::test]
async fn every_message_reaches_a_handler_exactly_once() {
    let broker = InMemoryBroker::new();
    let probe = Arc::new(Probe::default());
    let config = orders_config(ConsumerSpec::new("orders", PROBE_HANDLER).with_consumer_count(4));
    let running = start(&broker, config, probe_registry(&probe));
    eventually(|| broker.consumer_tags().len() == 1).await;

    let mut payloads: Vec<Vec<u8>> = (0..20)
        .map(|_| Sentence(3..8).fake::<String>().into_bytes())
        .collect();
    for payload in &payloads {
        broker.publish("orders-x", "created", payload);
    }
    eventually(|| broker.acked().len() == 20).await;
    running.stop().await.unwrap();

    let mut received = probe.payloads.lock().unwrap().clone();
    received.sort();
    payloads.sort();
    assert_eq!(received, payloads);
    assert_eq!(broker.unacked_messages(), 0);
}

#[tokio::test]
async fn a_failed_message_is_requeued_and_the_handler_is_reused() {
    // Arrange
    let broker = InMemoryBroker::new();
    let probe = Arc::new(Probe::default());
    let running = start(
        &broker,
        orders_config(ConsumerSpec::new("orders", PROBE_HANDLER)),
        probe_registry(&probe),
    );
    eventually(|| broker.consumer_tags().len() == 1).await;

    // Act
    broker.publish("", "orders", b"fail-once");
    eventually(|| broker.acked().len() == 1).await;
    broker.publish("", "orders", b"ok");
    eventually(|| broker.acked().len() == 2).await;
    running.stop().await.unwrap();

    // Assert
    let rejected = broker.rejected();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].1, "the message should have been requeued");
    assert!(!broker.acked().contains(&rejected[0].0));
    assert_eq!(probe.shutdowns(), vec!["transient failure"]);
    assert_eq!(probe.instances(), 1);
}

#[tokio::test]
async fn a_panicking_handler_does_not_take_the_consumer_down() {
    let broker = InMemoryBroker::new();
    let probe = Arc::new(Probe::default());
    let running = start(
        &broker,
        orders_config(ConsumerSpec::new("orders", PROBE_HANDLER)),
        probe_registry(&probe),
    );
    eventually(|| broker.consumer_tags().len() == 1).await;

    broker.publish("", "orders", b"panic-once");
    eventually(|| broker.acked().len() == 1).await;
    broker.publish("", "orders", b"ok");
    eventually(|| broker.acked().len() == 2).await;
    running.stop().await.unwrap();

    assert_eq!(broker.rejected().len(), 1);
    assert_eq!(
        probe.shutdowns(),
        vec!["handler panicked: handler bug".to_string()]
    );
}

#[tokio::test]
async fn a_reject_chosen_by_the_handler_is_not_overridden() {
    let broker = InMemoryBroker::new();
    let probe = Arc::new(Probe::default());
    let running = start(
        &broker,
        orders_config(ConsumerSpec::new("orders", PROBE_HANDLER)),
        probe_registry(&probe),
    );
    eventually(|| broker.consumer_tags().len() == 1).await;

    broker.publish("", "orders", b"poison");
    eventually(|| probe.completed() == 1).await;
    running.stop().await.unwrap();

    assert_eq!(broker.rejected().len(), 1);
    assert!(!broker.rejected()[0].1, "the message should not be requeued");
    assert!(broker.acked().is_empty());
    assert_eq!(broker.ready_messages("orders"), 0);
    assert_eq!(probe.shutdowns(), vec!["poison message"]);
}

#[tokio::test]
async fn a_failure_after_acknowledging_does_not_reject_the_message() {
    let broker = InMemoryBroker::new();
    let probe = Arc::new(Probe::default());
    let running = start(
        &broker,
        orders_config(ConsumerSpec::new("orders", PROBE_HANDLER)),
        probe_registry(&probe),
    );
    eventually(|| broker.consumer_tags().len() == 1).await;

    broker.publish("", "orders", b"ack-then-fail");
    eventually(|| probe.completed() == 1).await;
    running.stop().await.unwrap();

    assert_eq!(broker.acked().len(), 1);
    assert!(broker.rejected().is_empty());
    assert_eq!(probe.shutdowns(), vec!["failure after acknowledging"]);
}

#[tokio::test]
async fn handlers_can_publish_messages() {
    let broker = InMemoryBroker::new();
    let probe = Arc::new(Probe::default());
    let mut config = orders_config(ConsumerSpec::new("orders", PROBE_HANDLER));
    config
        .queues
        .push(QueueSpec::new("audit").with_binding("audit-x", "seen"));
    let running = start(&broker, config, probe_registry(&probe));
    eventually(|| broker.consumer_tags().len() == 1).await;

    broker.publish("", "orders", b"forward:audit-x:seen");
    eventually(|| broker.acked().len() == 1).await;
    running.stop().await.unwrap();

    assert_eq!(broker.ready_messages("audit"), 1);
    assert!(broker.events().contains(&BrokerEvent::Published {
        exchange: "audit-x".into(),
        routing_key: "seen".into(),
        payload: b"forwarded".to_vec(),
        origin: Some("orders".into()),
    }));
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_messages() {
    let broker = InMemoryBroker::new();
    let probe = Arc::new(Probe::default());
    let running = start(
        &broker,
        orders_config(ConsumerSpec::new("orders", PROBE_HANDLER)),
        probe_registry(&probe),
    );
    eventually(|| broker.consumer_tags().len() == 1).await;

    broker.publish("", "orders", b"slow:200");
    eventually(|| probe.started() == 1).await;
    running.stop().await.unwrap();

    // The consumer registration is cancelled first, the in-flight message still completes.
    assert_eq!(probe.completed(), 1);
    let events = broker.events();
    let cancelled = position(&events, |e| matches!(e, BrokerEvent::Cancelled { .. }));
    let acked = position(&events, |e| matches!(e, BrokerEvent::Acked(_)));
    assert!(cancelled < acked);
}

#[tokio::test]
async fn consumption_resumes_after_a_reconnection() {
    // Arrange
    let broker = InMemoryBroker::new();
    let probe = Arc::new(Probe::default());
    let running = start(
        &broker,
        orders_config(ConsumerSpec::new("orders", PROBE_HANDLER)),
        probe_registry(&probe),
    );
    eventually(|| broker.consumer_tags().len() == 1).await;
    broker.publish("", "orders", b"before");
    eventually(|| broker.acked().len() == 1).await;

    // Act
    broker.refuse_connections(2);
    broker.disconnect();
    broker.publish("", "orders", b"during");
    eventually(|| broker.acked().len() == 2).await;
    running.stop().await.unwrap();

    // Assert
    assert_eq!(broker.connections(), 2);
    let tags = broker.consumer_tags();
    assert_eq!(tags.len(), 2);
    assert_ne!(tags[0], tags[1]);
    let declarations = broker
        .events()
        .into_iter()
        .filter(|e| matches!(e, BrokerEvent::Declared { .. }))
        .count();
    assert_eq!(declarations, 2);
}

#[tokio::test]
async fn unacknowledged_messages_are_redelivered_after_a_reconnection() {
    let broker = InMemoryBroker::new();
    let probe = Arc::new(Probe::default());
    let running = start(
        &broker,
        orders_config(ConsumerSpec::new("orders", PROBE_HANDLER)),
        probe_registry(&probe),
    );
    eventually(|| broker.consumer_tags().len() == 1).await;

    broker.publish("", "orders", b"slow:100");
    eventually(|| probe.started() == 1).await;
    broker.disconnect();
    eventually(|| broker.acked().len() == 1).await;
    running.stop().await.unwrap();

    // The first attempt could not be acknowledged on the dead link.
    assert_eq!(probe.started(), 2);
    assert_eq!(
        *probe.payloads.lock().unwrap(),
        vec![b"slow:100".to_vec(), b"slow:100".to_vec()]
    );
}

#[tokio::test]
async fn buffered_messages_are_not_handed_to_old_handlers_after_a_reconnection() {
    // Arrange
    let broker = InMemoryBroker::new();
    let probe = Arc::new(Probe::default());
    let running = start(
        &broker,
        orders_config(
            ConsumerSpec::new("orders", PROBE_HANDLER)
                .with_prefetch_count(3)
                .with_consumer_count(1),
        ),
        probe_registry(&probe),
    );
    eventually(|| broker.consumer_tags().len() == 1).await;
    for payload in ["slow:150", "slow:151", "slow:152"] {
        broker.publish("", "orders", payload.as_bytes());
    }
    eventually(|| probe.started() == 1).await;

    // Act
    broker.disconnect();
    eventually(|| broker.acked().len() == 3).await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    running.stop().await.unwrap();

    // Assert
    // Only the message that was being processed ran on the first link, every message ran
    // once on the second.
    assert_eq!(probe.instances(), 2);
    assert_eq!(probe.started(), 4);
    let mut payloads = probe.payloads.lock().unwrap().clone();
    payloads.sort();
    assert_eq!(
        payloads,
        vec![
            b"slow:150".to_vec(),
            b"slow:150".to_vec(),
            b"slow:151".to_vec(),
            b"slow:152".to_vec(),
        ]
    );
    assert_eq!(broker.unacked_messages(), 0);
    assert_eq!(broker.ready_messages("orders"), 0);
}

#[tokio::test]
async fn consumers_whose_handler_cannot_be_loaded_are_skipped() {
    let broker = InMemoryBroker::new();
    let probe = Arc::new(Probe::default());
    let config = DispatcherConfig {
        queues: vec![QueueSpec::new("orders"), QueueSpec::new("invoices")],
        consumers: vec![
            ConsumerSpec::new("invoices", "tests.handlers:Missing"),
            ConsumerSpec::new("orders", PROBE_HANDLER),
        ],
        startup_handler: None,
    };
    let running = start(&broker, config, probe_registry(&probe));
    eventually(|| broker.consumer_tags().len() == 1).await;

    broker.publish("", "orders", b"ok");
    eventually(|| broker.acked().len() == 1).await;
    running.stop().await.unwrap();

    assert!(broker.events().iter().all(|e| !matches!(
        e,
        BrokerEvent::Consumed { queue, .. } if queue == "invoices"
    )));
}

#[tokio::test]
async fn consumers_can_consume_from_queues_declared_elsewhere() {
    let broker = InMemoryBroker::new();
    broker.declare("legacy");
    let probe = Arc::new(Probe::default());
    let config = DispatcherConfig {
        consumers: vec![ConsumerSpec::new("legacy", PROBE_HANDLER)],
        ..Default::default()
    };
    let running = start(&broker, config, probe_registry(&probe));
    eventually(|| broker.consumer_tags().len() == 1).await;

    broker.publish("", "legacy", b"ok");
    eventually(|| broker.acked().len() == 1).await;
    running.stop().await.unwrap();

    assert!(broker
        .events()
        .iter()
        .all(|e| !matches!(e, BrokerEvent::Declared { .. })));
}

#[tokio::test]
async fn the_startup_handler_runs_once_before_connecting() {
    let broker = InMemoryBroker::new();
    let probe = Arc::new(Probe::default());
    let runs = Arc::new(AtomicUsize::new(0));
    let registry = probe_registry(&probe).register_startup_hook("tests.hooks:count", {
        let runs = runs.clone();
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let config = DispatcherConfig {
        startup_handler: Some("tests.hooks:count".into()),
        ..orders_config(ConsumerSpec::new("orders", PROBE_HANDLER))
    };
    let running = start(&broker, config, registry);
    eventually(|| broker.consumer_tags().len() == 1).await;

    broker.disconnect();
    eventually(|| broker.consumer_tags().len() == 2).await;
    running.stop().await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_failing_startup_handler_prevents_connecting() {
    let broker = InMemoryBroker::new();
    let registry =
        HandlerRegistry::new().register_startup_hook("tests.hooks:fail", || anyhow::bail!("nope"));
    let config = DispatcherConfig {
        startup_handler: Some("tests.hooks:fail".into()),
        ..Default::default()
    };

    let outcome = start(&broker, config, registry).handle.await.unwrap();

    assert!(matches!(outcome, Err(DispatchError::Startup { .. })));
    assert_eq!(broker.connections(), 0);
}

#[tokio::test]
async fn an_unreachable_broker_at_startup_is_fatal() {
    let broker = InMemoryBroker::new();
    broker.refuse_connections(1);

    let outcome = start(&broker, DispatcherConfig::default(), HandlerRegistry::new())
        .handle
        .await
        .unwrap();

    assert!(matches!(outcome, Err(DispatchError::Connection(_))));
}

#[tokio::test]
async fn a_conflicting_queue_declaration_is_fatal() {
    let broker = InMemoryBroker::new();
    broker.fail_declaration_of("orders");
    let probe = Arc::new(Probe::default());

    let outcome = start(
        &broker,
        orders_config(ConsumerSpec::new("orders", PROBE_HANDLER)),
        probe_registry(&probe),
    )
    .handle
    .await
    .unwrap();

    assert!(matches!(outcome, Err(DispatchError::Declaration { queue, .. }) if queue == "orders"));
    assert!(broker.consumer_tags().is_empty());
}

#[tokio::test]
async fn binding_to_a_missing_exchange_is_fatal() {
    let broker = InMemoryBroker::new();
    broker.fail_bindings_to("orders-x");
    let probe = Arc::new(Probe::default());

    let outcome = start(
        &broker,
        orders_config(ConsumerSpec::new("orders", PROBE_HANDLER)),
        probe_registry(&probe),
    )
    .handle
    .await
    .unwrap();

    assert!(matches!(
        outcome,
        Err(DispatchError::Binding { exchange, routing_key, .. })
            if exchange == "orders-x" && routing_key == "created"
    ));
    assert!(broker.consumer_tags().is_empty());
}
