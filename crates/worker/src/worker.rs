//! Wiring of the background tasks that make up a worker.

use std::sync::Arc;

use saga::SagaOrchestrator;
use saga_store::SagaStateStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::WorkerConfig;
use crate::scheduler::{CleanupTask, RetryScheduler};
use crate::trigger::{TriggerDispatcher, TriggerSender};

/// A running worker: trigger dispatcher, retry scheduler and cleanup task
/// sharing one orchestrator.
pub struct Worker {
    triggers: TriggerSender,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Worker {
    /// Spawns the worker's tasks on the current runtime.
    pub fn spawn<S: SagaStateStore + 'static>(
        orchestrator: Arc<SagaOrchestrator<S>>,
        config: &WorkerConfig,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let (dispatcher, triggers) = TriggerDispatcher::new(
            Arc::clone(&orchestrator),
            config.trigger_buffer,
            config.trigger_concurrency,
        );
        let retries = RetryScheduler::new(
            Arc::clone(&orchestrator),
            triggers.clone(),
            config.retry_poll_interval,
        );
        let cleanup = CleanupTask::new(orchestrator, config.cleanup_interval);

        let tasks = vec![
            tokio::spawn(dispatcher.run(shutdown_rx.clone())),
            tokio::spawn(retries.run(shutdown_rx.clone())),
            tokio::spawn(cleanup.run(shutdown_rx)),
        ];

        tracing::info!(
            concurrency = config.trigger_concurrency,
            retry_poll = ?config.retry_poll_interval,
            "worker started"
        );

        Self {
            triggers,
            shutdown,
            tasks,
        }
    }

    /// Returns a handle for queueing triggers.
    pub fn triggers(&self) -> TriggerSender {
        self.triggers.clone()
    }

    /// Signals shutdown and waits for in-flight sagas to finish their
    /// current invocation.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "worker task panicked");
            }
        }
        tracing::info!("worker shut down");
    }
}
