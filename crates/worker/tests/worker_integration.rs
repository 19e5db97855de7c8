//! Integration tests for the worker: demo saga, trigger dispatch and
//! background tasks.

use std::sync::Arc;
use std::time::Duration;

use common::SagaId;
use saga::{RetryPolicy, RunOutcome, SagaConfig, SagaContext, SagaDefinition, SagaOrchestrator};
use saga_store::{InMemorySagaStateStore, SagaState, SagaStateStore, SagaStatus, StepStatus};
use saga_worker::demo::{self, DemoServices, OrderLine, OrderRequest};
use saga_worker::{
    CleanupTask, RetryScheduler, SagaTrigger, TriggerDispatcher, Worker, WorkerConfig,
    handle_trigger,
};
use tokio::sync::watch;

type TestOrchestrator = SagaOrchestrator<InMemorySagaStateStore>;

struct TestHarness {
    orchestrator: Arc<TestOrchestrator>,
    store: InMemorySagaStateStore,
    services: DemoServices,
    definition: SagaDefinition,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_config(SagaConfig {
            retry_policy: RetryPolicy {
                initial_delay: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn with_config(config: SagaConfig) -> Self {
        let services = DemoServices::default();
        let registry = demo::registry(&services).unwrap();
        let definition = demo::definition(&registry).unwrap();
        let store = InMemorySagaStateStore::new();
        let orchestrator = Arc::new(SagaOrchestrator::new(store.clone(), registry, config));

        Self {
            orchestrator,
            store,
            services,
            definition,
        }
    }

    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            saga: self.orchestrator.config().clone(),
            retry_poll_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    async fn create(&self, order: &OrderRequest) -> SagaId {
        let ctx = SagaContext::new(order)
            .unwrap()
            .with_correlation_id(order.order_id.clone());
        self.orchestrator
            .create(&self.definition, ctx)
            .await
            .unwrap()
    }

    async fn state(&self, saga_id: SagaId) -> SagaState {
        self.store.get(saga_id).await.unwrap().unwrap()
    }

    /// Polls the store until the saga is terminal.
    async fn wait_for_terminal(&self, saga_id: SagaId) -> SagaState {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let state = self.state(saga_id).await;
                if state.is_terminal() {
                    return state;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("saga did not finish in time")
    }
}

fn order(order_id: &str, quantity: u32, amount_cents: u64) -> OrderRequest {
    OrderRequest {
        order_id: order_id.to_string(),
        customer_id: "CUST-1".to_string(),
        lines: vec![OrderLine {
            sku: "WIDGET".to_string(),
            quantity,
        }],
        amount_cents,
    }
}

#[tokio::test]
async fn test_order_fulfillment_happy_path() {
    let harness = TestHarness::new();
    let saga_id = harness.create(&order("ORD-1", 3, 2_500)).await;

    let outcome = handle_trigger(&harness.orchestrator, SagaTrigger::start(saga_id))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let state = harness.state(saga_id).await;
    assert_eq!(state.status, SagaStatus::Completed);
    assert_eq!(state.correlation_id.as_deref(), Some("ORD-1"));

    let ctx = SagaContext::from_data(state.data).unwrap();
    assert_eq!(
        ctx.get::<String>("reservation_id").unwrap().as_deref(),
        Some("RES-0001")
    );
    assert_eq!(
        ctx.get::<String>("payment_id").unwrap().as_deref(),
        Some("PAY-0001")
    );
    assert_eq!(
        ctx.get::<String>("tracking_number").unwrap().as_deref(),
        Some("TRK-0001")
    );

    assert_eq!(harness.services.inventory.available("WIDGET").await, 97);
    assert_eq!(harness.services.payment.charge_count().await, 1);
    assert_eq!(harness.services.shipping.shipment_count().await, 1);
}

#[tokio::test]
async fn test_declined_payment_releases_inventory() {
    let harness = TestHarness::new();
    let saga_id = harness.create(&order("ORD-2", 5, 250_000)).await;

    let outcome = harness.orchestrator.resume(saga_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Compensated);

    let state = harness.state(saga_id).await;
    assert_eq!(
        state.steps.iter().map(|s| s.status).collect::<Vec<_>>(),
        [
            StepStatus::Compensated,
            StepStatus::Failed,
            StepStatus::Pending
        ]
    );
    assert!(state.last_error.unwrap().contains("Payment declined"));

    let ctx = SagaContext::from_data(state.data).unwrap();
    assert!(!ctx.contains_key("reservation_id"));

    assert_eq!(harness.services.inventory.available("WIDGET").await, 100);
    assert_eq!(harness.services.inventory.reservation_count().await, 0);
    assert_eq!(harness.services.payment.charge_count().await, 0);
    assert_eq!(harness.services.shipping.shipment_count().await, 0);
}

#[tokio::test]
async fn test_out_of_stock_compensates_nothing() {
    let harness = TestHarness::new();
    let saga_id = harness.create(&order("ORD-3", 1_000, 100)).await;

    let outcome = harness.orchestrator.resume(saga_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Compensated);
    assert_eq!(harness.state(saga_id).await.steps[0].status, StepStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_retries_transient_shipping_outage() {
    let harness = TestHarness::new();
    harness.services.shipping.fail_next(2).await;

    let worker = Worker::spawn(Arc::clone(&harness.orchestrator), &harness.worker_config());
    let saga_id = harness.create(&order("ORD-4", 1, 999)).await;
    worker
        .triggers()
        .send(SagaTrigger::start(saga_id))
        .await
        .unwrap();

    let state = harness.wait_for_terminal(saga_id).await;
    worker.shutdown().await;

    assert_eq!(state.status, SagaStatus::Completed);
    assert_eq!(state.steps[2].retry_count, 2);
    assert_eq!(harness.services.shipping.shipment_count().await, 1);
    assert_eq!(harness.services.payment.charge_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_triggers_run_saga_once() {
    let harness = TestHarness::new();
    let worker = Worker::spawn(Arc::clone(&harness.orchestrator), &harness.worker_config());

    let saga_id = harness.create(&order("ORD-5", 2, 1_000)).await;
    let triggers = worker.triggers();
    for _ in 0..5 {
        triggers.send(SagaTrigger::start(saga_id)).await.unwrap();
    }
    triggers.send(SagaTrigger::resume(saga_id)).await.unwrap();

    let state = harness.wait_for_terminal(saga_id).await;
    worker.shutdown().await;

    assert_eq!(state.status, SagaStatus::Completed);
    assert_eq!(harness.services.inventory.available("WIDGET").await, 98);
    assert_eq!(harness.services.inventory.reservation_count().await, 1);
    assert_eq!(harness.services.payment.charge_count().await, 1);
    assert_eq!(harness.services.shipping.shipment_count().await, 1);
}

#[tokio::test]
async fn test_retry_scheduler_queues_due_sagas() {
    let harness = TestHarness::new();
    harness.services.shipping.fail_next(1).await;

    let saga_id = harness.create(&order("ORD-6", 1, 500)).await;
    let outcome = harness.orchestrator.resume(saga_id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::RetryScheduled { .. }));

    let (dispatcher, triggers) =
        TriggerDispatcher::new(Arc::clone(&harness.orchestrator), 16, 2);
    let scheduler = RetryScheduler::new(
        Arc::clone(&harness.orchestrator),
        triggers,
        Duration::from_secs(60),
    );

    assert_eq!(scheduler.poll_once().await.unwrap(), 1);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(dispatcher.run(shutdown_rx));

    let state = harness.wait_for_terminal(saga_id).await;
    assert_eq!(state.status, SagaStatus::Completed);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_dispatcher_stops_when_senders_dropped() {
    let harness = TestHarness::new();
    let (dispatcher, triggers) = TriggerDispatcher::new(Arc::clone(&harness.orchestrator), 4, 1);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let saga_id = harness.create(&order("ORD-7", 1, 100)).await;
    triggers.send(SagaTrigger::start(saga_id)).await.unwrap();
    drop(triggers);

    tokio::time::timeout(Duration::from_secs(5), dispatcher.run(shutdown_rx))
        .await
        .expect("dispatcher did not stop");

    // Queued triggers are drained before the dispatcher stops.
    assert_eq!(harness.state(saga_id).await.status, SagaStatus::Completed);
}

#[tokio::test]
async fn test_cleanup_purges_finished_sagas() {
    let harness = TestHarness::with_config(SagaConfig {
        retention: Duration::ZERO,
        ..Default::default()
    });

    let finished = harness.create(&order("ORD-8", 1, 100)).await;
    harness.orchestrator.resume(finished).await.unwrap();
    let waiting = harness.create(&order("ORD-9", 1, 100)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let cleanup = CleanupTask::new(Arc::clone(&harness.orchestrator), Duration::from_secs(60));
    assert_eq!(cleanup.run_once().await.unwrap(), 1);

    assert!(harness.store.get(finished).await.unwrap().is_none());
    assert!(harness.store.get(waiting).await.unwrap().is_some());
}

#[tokio::test]
async fn test_worker_shutdown_is_prompt() {
    let harness = TestHarness::new();
    let worker = Worker::spawn(Arc::clone(&harness.orchestrator), &harness.worker_config());

    tokio::time::timeout(Duration::from_secs(5), worker.shutdown())
        .await
        .expect("worker did not shut down");
}
