//! Periodic background tasks: retry wake-ups and retention cleanup.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use saga::SagaOrchestrator;
use saga_store::{SagaStateStore, SagaStateStoreExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::{Result, WorkerError};
use crate::trigger::{SagaTrigger, TriggerSender};

const DEFAULT_BATCH_SIZE: usize = 100;

/// Turns elapsed retry backoffs into `RetryDue` triggers.
pub struct RetryScheduler<S> {
    orchestrator: Arc<SagaOrchestrator<S>>,
    triggers: TriggerSender,
    interval: Duration,
    batch_size: usize,
}

impl<S: SagaStateStore + 'static> RetryScheduler<S> {
    pub fn new(
        orchestrator: Arc<SagaOrchestrator<S>>,
        triggers: TriggerSender,
        interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            triggers,
            interval,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Caps how many due sagas are queued per poll.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Queues a trigger for every saga whose retry is due. Returns how many
    /// were queued.
    pub async fn poll_once(&self) -> Result<usize> {
        let due = self
            .orchestrator
            .store()
            .find_due_for_retry(Utc::now(), self.batch_size)
            .await?;

        for saga_id in &due {
            self.triggers.send(SagaTrigger::retry_due(*saga_id)).await?;
        }
        if !due.is_empty() {
            tracing::debug!(count = due.len(), "queued due retries");
        }
        Ok(due.len())
    }

    /// Polls every interval until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => match self.poll_once().await {
                    Ok(_) => {}
                    Err(WorkerError::ChannelClosed) => break,
                    Err(err) => tracing::warn!(error = %err, "retry poll failed"),
                },
            }
        }
        tracing::info!("retry scheduler stopped");
    }
}

/// Deletes terminal sagas past their retention window.
pub struct CleanupTask<S> {
    orchestrator: Arc<SagaOrchestrator<S>>,
    interval: Duration,
}

impl<S: SagaStateStore + 'static> CleanupTask<S> {
    pub fn new(orchestrator: Arc<SagaOrchestrator<S>>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    pub async fn run_once(&self) -> Result<u64> {
        Ok(self.orchestrator.purge_expired().await?)
    }

    /// Purges every interval until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        tracing::warn!(error = %err, "retention cleanup failed");
                    }
                }
            }
        }
        tracing::info!("cleanup task stopped");
    }
}
