//! Trigger channel feeding sagas to the orchestrator.
//!
//! Triggers are delivered at least once. Duplicates are harmless: the
//! orchestrator ignores terminal sagas, sagas not yet due and steps leased by
//! another invocation.

use std::fmt;
use std::sync::Arc;

use common::SagaId;
use saga::{RunOutcome, SagaOrchestrator};
use saga_store::SagaStateStore;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinError, JoinSet};

use crate::error::{Result, WorkerError};

/// Why a saga is being pushed to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// The saga was just created.
    Start,
    /// Explicit resume, e.g. after suspension or a crash.
    Resume,
    /// A retry backoff elapsed.
    RetryDue,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::Start => "start",
            TriggerReason::Resume => "resume",
            TriggerReason::RetryDue => "retry_due",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to drive one saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaTrigger {
    pub saga_id: SagaId,
    pub reason: TriggerReason,
}

impl SagaTrigger {
    pub fn new(saga_id: SagaId, reason: TriggerReason) -> Self {
        Self { saga_id, reason }
    }

    pub fn start(saga_id: SagaId) -> Self {
        Self::new(saga_id, TriggerReason::Start)
    }

    pub fn resume(saga_id: SagaId) -> Self {
        Self::new(saga_id, TriggerReason::Resume)
    }

    pub fn retry_due(saga_id: SagaId) -> Self {
        Self::new(saga_id, TriggerReason::RetryDue)
    }
}

/// Sending half of the trigger channel.
#[derive(Debug, Clone)]
pub struct TriggerSender {
    tx: mpsc::Sender<SagaTrigger>,
}

impl TriggerSender {
    /// Queues a trigger, waiting while the channel is full.
    pub async fn send(&self, trigger: SagaTrigger) -> Result<()> {
        self.tx
            .send(trigger)
            .await
            .map_err(|_| WorkerError::ChannelClosed)
    }
}

/// Handles a single trigger.
///
/// Every reason maps to [`SagaOrchestrator::resume`]; the reason only shows
/// up in logs and metrics.
pub async fn handle_trigger<S: SagaStateStore>(
    orchestrator: &SagaOrchestrator<S>,
    trigger: SagaTrigger,
) -> saga::Result<RunOutcome> {
    metrics::counter!("saga_triggers_total", "reason" => trigger.reason.as_str()).increment(1);

    let result = orchestrator.resume(trigger.saga_id).await;
    match &result {
        Ok(outcome) => tracing::debug!(
            saga_id = %trigger.saga_id,
            reason = %trigger.reason,
            ?outcome,
            "trigger handled"
        ),
        Err(err) => tracing::warn!(
            saga_id = %trigger.saga_id,
            reason = %trigger.reason,
            error = %err,
            "trigger failed"
        ),
    }
    result
}

/// Receives triggers and drives the sagas, a bounded number at a time.
pub struct TriggerDispatcher<S> {
    orchestrator: Arc<SagaOrchestrator<S>>,
    rx: mpsc::Receiver<SagaTrigger>,
    permits: Arc<Semaphore>,
}

impl<S: SagaStateStore + 'static> TriggerDispatcher<S> {
    /// Creates a dispatcher with a channel of `buffer` triggers, running at
    /// most `concurrency` sagas at once.
    pub fn new(
        orchestrator: Arc<SagaOrchestrator<S>>,
        buffer: usize,
        concurrency: usize,
    ) -> (Self, TriggerSender) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let dispatcher = Self {
            orchestrator,
            rx,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        };
        (dispatcher, TriggerSender { tx })
    }

    /// Dispatches triggers until shutdown is signalled or every sender is
    /// dropped, then waits for the sagas already being driven.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                trigger = self.rx.recv() => {
                    let Some(trigger) = trigger else {
                        break;
                    };
                    let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                        break;
                    };
                    let orchestrator = Arc::clone(&self.orchestrator);
                    tasks.spawn(async move {
                        let _permit = permit;
                        let _ = handle_trigger(&orchestrator, trigger).await;
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
            }
        }

        tracing::info!(in_flight = tasks.len(), "trigger dispatcher draining");
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        tracing::info!("trigger dispatcher stopped");
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(err) = joined {
        tracing::error!(error = %err, "saga task panicked");
    }
}
