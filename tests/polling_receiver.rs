//! Polling receivers scheduled on a connector: one poll at a time, bounded
//! shutdown, transacted fan-out and cluster primary gating.

mod helpers;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use connector_runtime::transport::memory::REPLY_TO;
use connector_runtime::transport::{MemoryBroker, MemoryTransport};
use connector_runtime::work::ShutdownTimeout;
use connector_runtime::{
    Connector, ConnectorConfig, Endpoint, FlowConstruct, LifecycleState, Message, Poller,
    PollingMessageReceiver, ReceiverHooks, RuntimeContext,
};
use helpers::flow::{TestFlow, bounded, eventually};
use helpers::polling::{FailingPoller, SlowPoller};
use helpers::transport::{TestTransport, test_config};

type Created = Arc<Mutex<Vec<Arc<PollingMessageReceiver>>>>;

/// Transport whose receivers poll with `poller`, starting immediately.
fn polling_transport(poller: Arc<dyn Poller>, frequency: Duration) -> (Arc<TestTransport>, Created) {
    let created: Created = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&created);
    let transport = TestTransport::new().with_receivers(move |_endpoint| {
        let receiver = Arc::new(
            PollingMessageReceiver::new(Arc::clone(&poller), frequency)
                .with_startup_delay(Duration::ZERO),
        );
        sink.lock().unwrap().push(Arc::clone(&receiver));
        let hooks: Arc<dyn ReceiverHooks> = receiver;
        hooks
    });
    (Arc::new(transport), created)
}

async fn connector_on(
    transport: Arc<TestTransport>,
    config: ConnectorConfig,
    runtime: Arc<RuntimeContext>,
) -> Connector {
    let connector = Connector::new(config, transport, runtime).unwrap();
    connector.initialise().await.unwrap();
    connector
}

fn inbound(address: &str) -> Endpoint {
    Endpoint::parse(&format!("test://{address}")).unwrap()
}

#[tokio::test]
async fn polls_never_overlap() {
    let slow = SlowPoller::new(Duration::from_millis(60));
    let (transport, _) = polling_transport(slow.clone(), Duration::from_millis(5));
    let connector =
        connector_on(transport, test_config("c"), Arc::new(RuntimeContext::default())).await;
    let flow: Arc<dyn FlowConstruct> = TestFlow::new("flow");
    connector.register_listener(flow, inbound("in")).await.unwrap();

    connector.start().await.unwrap();
    assert!(eventually(Duration::from_secs(5), || slow.polls() >= 3).await);
    connector.stop().await.unwrap();

    assert_eq!(slow.overlaps.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stop_waits_for_the_poll_in_progress() {
    let slow = SlowPoller::new(Duration::from_millis(200));
    let (transport, created) = polling_transport(slow.clone(), Duration::from_millis(10));
    let connector =
        connector_on(transport, test_config("c"), Arc::new(RuntimeContext::default())).await;
    let flow: Arc<dyn FlowConstruct> = TestFlow::new("flow");
    connector.register_listener(flow, inbound("in")).await.unwrap();

    connector.start().await.unwrap();
    assert!(eventually(Duration::from_secs(5), || slow.is_active()).await);

    bounded(connector.stop()).await.unwrap();

    assert!(!slow.is_active());
    assert_eq!(slow.completed.load(std::sync::atomic::Ordering::SeqCst), slow.polls());
    let receiver = Arc::clone(&created.lock().unwrap()[0]);
    assert_eq!(receiver.schedule_count(), 0);
    assert!(!receiver.is_polling());
}

#[tokio::test(start_paused = true)]
async fn stop_gives_up_on_a_poll_after_the_shutdown_timeout() {
    let slow = SlowPoller::new(Duration::from_secs(600));
    let (transport, _) = polling_transport(slow.clone(), Duration::from_millis(10));
    let runtime = Arc::new(RuntimeContext::with_shutdown_timeout(
        ShutdownTimeout::from_millis(100).unwrap(),
    ));
    let connector = connector_on(transport, test_config("c"), runtime).await;
    let flow: Arc<dyn FlowConstruct> = TestFlow::new("flow");
    connector.register_listener(flow, inbound("in")).await.unwrap();

    connector.start().await.unwrap();
    assert!(eventually(Duration::from_secs(5), || slow.is_active()).await);

    let began = tokio::time::Instant::now();
    connector.stop().await.unwrap();

    assert!(began.elapsed() < Duration::from_secs(60));
    assert_eq!(connector.state(), LifecycleState::Stopped);
    assert_eq!(slow.completed.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn transacted_endpoints_get_concurrent_pollers() {
    let slow = SlowPoller::new(Duration::from_millis(1));
    let (transport, created) = polling_transport(slow.clone(), Duration::from_millis(50));
    let mut config = test_config("c");
    config.number_of_concurrent_transacted_receivers = 3;
    let connector = connector_on(transport, config, Arc::new(RuntimeContext::default())).await;
    let flow: Arc<dyn FlowConstruct> = TestFlow::new("flow");
    connector
        .register_listener(flow.clone(), inbound("tx").with_transacted(true))
        .await
        .unwrap();
    connector
        .register_listener(flow, inbound("plain"))
        .await
        .unwrap();

    connector.start().await.unwrap();

    let counts: Vec<usize> = created
        .lock()
        .unwrap()
        .iter()
        .map(|receiver| receiver.schedule_count())
        .collect();
    assert_eq!(counts, vec![3, 1]);

    connector.dispose().await.unwrap();
}

#[tokio::test]
async fn single_poller_when_multiple_transacted_receivers_are_disabled() {
    let slow = SlowPoller::new(Duration::from_millis(1));
    let (transport, created) = polling_transport(slow.clone(), Duration::from_millis(50));
    let mut config = test_config("c");
    config.create_multiple_transacted_receivers = false;
    let connector = connector_on(transport, config, Arc::new(RuntimeContext::default())).await;
    let flow: Arc<dyn FlowConstruct> = TestFlow::new("flow");
    connector
        .register_listener(flow, inbound("tx").with_transacted(true))
        .await
        .unwrap();

    connector.start().await.unwrap();

    assert_eq!(created.lock().unwrap()[0].schedule_count(), 1);
    connector.dispose().await.unwrap();
}

#[tokio::test]
async fn batch_size_is_half_the_receiving_capacity() {
    let slow = SlowPoller::new(Duration::from_millis(1));
    let (transport, _) = polling_transport(slow, Duration::from_secs(60));
    let mut config = test_config("c");
    config.receiver_threading.max_threads_active = 16;
    let connector = connector_on(transport, config, Arc::new(RuntimeContext::default())).await;
    let flow: Arc<dyn FlowConstruct> = TestFlow::new("flow");
    let receiver = connector.register_listener(flow, inbound("in")).await.unwrap();

    assert_eq!(PollingMessageReceiver::batch_size(&receiver, 0), 0);
    assert_eq!(PollingMessageReceiver::batch_size(&receiver, 3), 3);
    assert_eq!(PollingMessageReceiver::batch_size(&receiver, 100), 8);
}

#[tokio::test]
async fn batch_size_is_at_least_one() {
    let slow = SlowPoller::new(Duration::from_millis(1));
    let (transport, _) = polling_transport(slow, Duration::from_secs(60));
    let mut config = test_config("c");
    config.receiver_threading.max_threads_active = 1;
    let connector = connector_on(transport, config, Arc::new(RuntimeContext::default())).await;
    let flow: Arc<dyn FlowConstruct> = TestFlow::new("flow");
    let receiver = connector.register_listener(flow, inbound("in")).await.unwrap();

    assert_eq!(PollingMessageReceiver::batch_size(&receiver, 10), 1);
}

/// A receiver that consumes only on the primary node stays idle on a
/// secondary and starts polling once this node is promoted.
#[tokio::test]
async fn primary_only_receiver_waits_for_promotion() {
    let slow = SlowPoller::primary_only(Duration::from_millis(1));
    let (transport, _) = polling_transport(slow.clone(), Duration::from_millis(10));
    let runtime = Arc::new(RuntimeContext::default());
    runtime.set_primary(false);
    let connector = connector_on(transport, test_config("c"), Arc::clone(&runtime)).await;
    let flow: Arc<dyn FlowConstruct> = TestFlow::new("flow");
    let receiver = connector.register_listener(flow, inbound("in")).await.unwrap();

    connector.start().await.unwrap();
    assert!(receiver.is_connected());
    assert!(receiver.is_started());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(slow.polls(), 0);
    assert_eq!(slow.connects.load(std::sync::atomic::Ordering::SeqCst), 0);

    runtime.set_primary(true);

    assert!(eventually(Duration::from_secs(5), || slow.polls() > 0).await);
    assert_eq!(slow.connects.load(std::sync::atomic::Ordering::SeqCst), 1);
    connector.dispose().await.unwrap();
}

#[tokio::test]
async fn poll_failures_reach_the_flow() {
    let (transport, _) = polling_transport(Arc::new(FailingPoller), Duration::from_millis(10));
    let connector =
        connector_on(transport, test_config("c"), Arc::new(RuntimeContext::default())).await;
    let flow = TestFlow::new("flow");
    let handler: Arc<dyn FlowConstruct> = flow.clone();
    connector.register_listener(handler, inbound("in")).await.unwrap();

    connector.start().await.unwrap();

    assert!(eventually(Duration::from_secs(5), || !flow.exceptions().is_empty()).await);
    assert_eq!(flow.exceptions()[0], "Poll failed for receiver c/in");
    assert!(connector.is_started(), "a failed poll does not stop the receiver");
    connector.dispose().await.unwrap();
}

#[tokio::test]
async fn memory_receiver_routes_queued_messages_to_the_flow() {
    let broker = MemoryBroker::new();
    let transport = MemoryTransport::new(broker.clone())
        .with_frequency(Duration::from_millis(10))
        .with_startup_delay(Duration::ZERO);
    let connector = Connector::new(
        ConnectorConfig::new("mem", "memory"),
        Arc::new(transport),
        Arc::new(RuntimeContext::default()),
    )
    .unwrap();
    connector.initialise().await.unwrap();
    let flow = TestFlow::new("orders-flow");
    let handler: Arc<dyn FlowConstruct> = flow.clone();
    let orders = Endpoint::parse("memory://orders").unwrap();
    connector
        .register_listener(handler, orders.clone())
        .await
        .unwrap();
    connector.start().await.unwrap();

    for i in 0..3 {
        connector
            .dispatch(orders.clone(), Message::text(format!("order {i}")), None)
            .await
            .unwrap();
    }
    broker.push("orders", Message::text("order 3").with_property(REPLY_TO, "replies"));

    assert!(eventually(Duration::from_secs(5), || flow.processed().len() == 4).await);
    let mut processed = flow.processed();
    processed.sort();
    assert_eq!(processed, vec!["order 0", "order 1", "order 2", "order 3"]);

    let reply = broker.pop_timeout("replies", Duration::from_secs(5)).await;
    assert_eq!(
        reply.and_then(|m| m.as_text()).as_deref(),
        Some("processed order 3")
    );

    connector.dispose().await.unwrap();
}
