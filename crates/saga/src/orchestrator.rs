//! Saga orchestrator.
//!
//! Drives a saga through its steps, persisting after every transition. Any
//! number of orchestrators may share one store: every transition is written
//! with a compare-and-swap on the saga version, and the loser of a race stops
//! without touching the step.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::SagaId;
use saga_store::{SagaState, SagaStateStore, SagaStateStoreExt, SagaStatus, StepStatus};
use tokio::time::Instant;

use crate::config::SagaConfig;
use crate::context::SagaContext;
use crate::error::{Result, SagaError};
use crate::registry::{SagaDefinition, StepRegistry};
use crate::step::{Step, StepError};

/// What a single orchestrator invocation did with a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every step completed.
    Completed,

    /// A step failed and every completed step was undone.
    Compensated,

    /// A compensation failed. The saga needs manual attention.
    Failed,

    /// The run exceeded its time budget, or an operator suspended the saga.
    Suspended,

    /// A step failed transiently and may be retried at `at`.
    RetryScheduled { at: DateTime<Utc> },

    /// Another worker committed a transition first.
    Conflict,

    /// Another worker holds a live lease on a step of this saga.
    InFlight,

    /// The saga had already finished.
    AlreadyTerminal,

    /// A retry is scheduled but not yet due.
    NotDue,
}

impl RunOutcome {
    /// Returns true if the saga reached a terminal status during this run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunOutcome::Completed | RunOutcome::Compensated | RunOutcome::Failed
        )
    }
}

/// Executes sagas defined against a [`StepRegistry`], persisting progress in
/// a [`SagaStateStore`].
pub struct SagaOrchestrator<S> {
    store: S,
    registry: StepRegistry,
    config: SagaConfig,
}

impl<S: SagaStateStore> SagaOrchestrator<S> {
    /// Creates a new orchestrator.
    pub fn new(store: S, registry: StepRegistry, config: SagaConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    /// Persists a new `Pending` saga without running it.
    ///
    /// The saga is picked up by the next [`resume`](Self::resume).
    #[tracing::instrument(skip(self, definition, context), fields(saga_name = definition.name()))]
    pub async fn create(&self, definition: &SagaDefinition, context: SagaContext) -> Result<SagaId> {
        let state = self.create_state(definition, context).await?;
        Ok(state.saga_id)
    }

    /// Creates a saga and runs it until it finishes, suspends, waits for a
    /// retry or loses a race.
    #[tracing::instrument(skip(self, definition, context), fields(saga_name = definition.name()))]
    pub async fn start(&self, definition: &SagaDefinition, context: SagaContext) -> Result<SagaId> {
        let state = self.create_state(definition, context).await?;
        let saga_id = state.saga_id;

        let outcome = self.run(state).await?;
        tracing::info!(%saga_id, ?outcome, "saga run finished");

        Ok(saga_id)
    }

    /// Continues a saga from its persisted progress.
    ///
    /// Safe to call from any worker at any time, including repeatedly for the
    /// same saga: terminal sagas are left alone, and concurrent callers race
    /// on the store so that each transition is taken once.
    #[tracing::instrument(skip(self, saga_id), fields(saga_id = %saga_id))]
    pub async fn resume(&self, saga_id: SagaId) -> Result<RunOutcome> {
        let state = self
            .store
            .get(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;

        self.run(state).await
    }

    /// Suspends a pending or running saga.
    ///
    /// Returns `false` if the saga was already suspended or the suspension
    /// lost a race with another writer.
    #[tracing::instrument(skip(self, saga_id), fields(saga_id = %saga_id))]
    pub async fn suspend(&self, saga_id: SagaId, reason: &str) -> Result<bool> {
        let state = self
            .store
            .get(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;

        if state.status == SagaStatus::Suspended {
            return Ok(false);
        }
        if !state.status.can_suspend() {
            return Err(SagaError::InvalidState {
                saga_id,
                expected: "Pending or Running".to_string(),
                actual: state.status,
            });
        }

        let outcome = self.suspend_state(state, reason.to_string()).await?;
        Ok(outcome == RunOutcome::Suspended)
    }

    /// Loads a saga.
    pub async fn get_saga(&self, saga_id: SagaId) -> Result<Option<SagaState>> {
        Ok(self.store.get(saga_id).await?)
    }

    /// Resumes up to `limit` running sagas whose retry backoff has elapsed.
    ///
    /// Sagas that cannot be resumed for reasons other than a store failure are
    /// logged and skipped so they do not block the rest of the batch.
    pub async fn resume_due(&self, limit: usize) -> Result<Vec<(SagaId, RunOutcome)>> {
        let due = self.store.find_due_for_retry(Utc::now(), limit).await?;

        let mut outcomes = Vec::with_capacity(due.len());
        for saga_id in due {
            match self.resume(saga_id).await {
                Ok(outcome) => outcomes.push((saga_id, outcome)),
                Err(err @ SagaError::Store(_)) => return Err(err),
                Err(err) => {
                    tracing::warn!(%saga_id, error = %err, "failed to resume due saga");
                }
            }
        }
        Ok(outcomes)
    }

    /// Deletes terminal sagas last updated before the retention window.
    #[tracing::instrument(skip(self))]
    pub async fn purge_expired(&self) -> Result<u64> {
        let cutoff = self.config.retention_cutoff(Utc::now());
        let deleted = self.store.delete_older_than(cutoff, true).await?;
        if deleted > 0 {
            tracing::info!(deleted, %cutoff, "purged expired sagas");
        }
        Ok(deleted)
    }

    async fn create_state(
        &self,
        definition: &SagaDefinition,
        mut context: SagaContext,
    ) -> Result<SagaState> {
        if definition.is_empty() {
            return Err(SagaError::EmptyDefinition(definition.name().to_string()));
        }
        self.registry.resolve(definition.step_names())?;

        let saga_id = SagaId::new();
        context.set_saga_id(saga_id);

        let mut state = SagaState::new(saga_id, definition.name(), definition.step_names())
            .with_data(context.to_data()?);
        state.correlation_id = context.correlation_id().map(str::to_string);
        state.tenant_id = context.tenant_id().map(str::to_string);

        self.store.create(&state).await?;

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(%saga_id, steps = state.steps.len(), "saga created");

        Ok(state)
    }

    async fn run(&self, state: SagaState) -> Result<RunOutcome> {
        if state.is_terminal() {
            tracing::debug!(saga_id = %state.saga_id, status = %state.status, "saga already terminal");
            return Ok(RunOutcome::AlreadyTerminal);
        }

        let now = Utc::now();
        if self.lease_held(&state, now) {
            tracing::debug!(saga_id = %state.saga_id, "step in flight on another worker");
            return Ok(RunOutcome::InFlight);
        }

        let steps = self.registry.resolve(state.step_names())?;
        let ctx = SagaContext::from_data(state.data.clone())?;

        if state.status == SagaStatus::Compensating {
            return self.compensate(state, &steps, ctx).await;
        }
        if state.is_waiting_for_retry(now) {
            return Ok(RunOutcome::NotDue);
        }

        self.run_forward(state, &steps, ctx).await
    }

    /// A step left `Executing` or `Compensating` belongs to whoever persisted
    /// it until `updated_at + step_timeout`; after that it is presumed crashed.
    fn lease_held(&self, state: &SagaState, now: DateTime<Utc>) -> bool {
        if !state.steps.iter().any(|step| step.status.is_in_flight()) {
            return false;
        }
        chrono::Duration::from_std(self.config.step_timeout)
            .ok()
            .and_then(|timeout| state.updated_at.checked_add_signed(timeout))
            .is_none_or(|expires| expires > now)
    }

    /// Time left on the lease taken by the last commit, counted from the
    /// `updated_at` stamped before the write. Store latency comes out of the
    /// step's budget; the step never outlives the lease other workers see.
    fn lease_remaining(&self, state: &SagaState) -> Duration {
        chrono::Duration::from_std(self.config.step_timeout)
            .ok()
            .and_then(|timeout| state.updated_at.checked_add_signed(timeout))
            .and_then(|expires| (expires - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    async fn run_forward(
        &self,
        mut state: SagaState,
        steps: &[Arc<dyn Step>],
        mut ctx: SagaContext,
    ) -> Result<RunOutcome> {
        let deadline = deadline_after(self.config.default_timeout);

        loop {
            let index = state.current_step_index;
            let Some(step) = steps.get(index) else {
                return self.complete(state).await;
            };

            if Instant::now() >= deadline {
                return self
                    .suspend_state(state, "saga run exceeded its timeout".to_string())
                    .await;
            }

            let was_running = state.status == SagaStatus::Running;
            state.status = SagaStatus::Running;
            state.next_retry_at = None;
            let step_state = &mut state.steps[index];
            step_state.status = StepStatus::Executing;
            step_state.started_at = Some(Utc::now());

            if !self.commit(&mut state).await? {
                return Ok(RunOutcome::Conflict);
            }
            if !was_running {
                tracing::info!(saga_id = %state.saga_id, step_index = index, "saga running");
            }

            let lease = self.lease_remaining(&state);
            let remaining = deadline.saturating_duration_since(Instant::now());
            let budget = lease.min(remaining);

            let mut scoped = ctx.clone();
            let started = Instant::now();
            let result = tokio::time::timeout(budget, step.execute(&mut scoped)).await;
            metrics::histogram!("saga_step_duration_seconds")
                .record(started.elapsed().as_secs_f64());

            let output = match result {
                Ok(Ok(output)) => output,
                Ok(Err(err)) => return self.fail_step(state, steps, ctx, err).await,
                Err(_) if remaining < lease => {
                    let reason =
                        format!("saga run exceeded its timeout during step '{}'", step.name());
                    return self.suspend_state(state, reason).await;
                }
                Err(_) => {
                    let err = StepError::retryable(format!("step timed out after {budget:?}"));
                    return self.fail_step(state, steps, ctx, err).await;
                }
            };

            ctx = scoped;
            state.data = ctx.to_data()?;
            state.current_step_index = index + 1;
            state.retry_count = 0;
            let step_state = &mut state.steps[index];
            step_state.status = StepStatus::Completed;
            step_state.result_data = output;
            step_state.completed_at = Some(Utc::now());

            if !self.commit(&mut state).await? {
                return Ok(RunOutcome::Conflict);
            }
            tracing::debug!(saga_id = %state.saga_id, step = step.name(), "step completed");
        }
    }

    async fn complete(&self, mut state: SagaState) -> Result<RunOutcome> {
        state.status = SagaStatus::Completed;
        state.completed_at = Some(Utc::now());
        state.next_retry_at = None;
        state.retry_count = 0;

        if !self.commit(&mut state).await? {
            return Ok(RunOutcome::Conflict);
        }

        metrics::counter!("saga_completed_total").increment(1);
        tracing::info!(saga_id = %state.saga_id, saga_name = %state.saga_name, "saga completed");
        Ok(RunOutcome::Completed)
    }

    async fn fail_step(
        &self,
        mut state: SagaState,
        steps: &[Arc<dyn Step>],
        ctx: SagaContext,
        err: StepError,
    ) -> Result<RunOutcome> {
        let index = state.current_step_index;
        let step_state = &mut state.steps[index];
        let step_name = step_state.step_name.clone();
        step_state.error_message = Some(err.message().to_string());

        let decision = self.config.retry_policy.evaluate(step_state.retry_count);
        if err.is_retryable() && decision.should_retry {
            step_state.retry_count += 1;
            step_state.status = StepStatus::Pending;
            let retry_count = step_state.retry_count;

            let at = retry_at(Utc::now(), decision.delay);
            state.retry_count = retry_count;
            state.next_retry_at = Some(at);
            state.last_error = Some(format!("step '{step_name}' failed: {err}"));

            if !self.commit(&mut state).await? {
                return Ok(RunOutcome::Conflict);
            }

            metrics::counter!("saga_step_retries_total").increment(1);
            tracing::warn!(
                saga_id = %state.saga_id,
                step = %step_name,
                retry_count,
                retry_at = %at,
                error = %err,
                "step failed, retry scheduled"
            );
            return Ok(RunOutcome::RetryScheduled { at });
        }

        step_state.status = StepStatus::Failed;
        state.status = SagaStatus::Compensating;
        state.next_retry_at = None;
        state.last_error = Some(format!("step '{step_name}' failed: {err}"));

        if !self.commit(&mut state).await? {
            return Ok(RunOutcome::Conflict);
        }

        tracing::warn!(
            saga_id = %state.saga_id,
            step = %step_name,
            retryable = err.is_retryable(),
            error = %err,
            "step failed, compensating"
        );
        self.compensate(state, steps, ctx).await
    }

    /// Undoes completed steps below `current_step_index`, highest first.
    async fn compensate(
        &self,
        mut state: SagaState,
        steps: &[Arc<dyn Step>],
        mut ctx: SagaContext,
    ) -> Result<RunOutcome> {
        loop {
            let upper = state.current_step_index.min(state.steps.len());
            let next = (0..upper)
                .rev()
                .find(|&i| state.steps[i].status.needs_compensation());

            let Some(index) = next else {
                state.status = SagaStatus::Compensated;
                state.completed_at = Some(Utc::now());

                if !self.commit(&mut state).await? {
                    return Ok(RunOutcome::Conflict);
                }

                metrics::counter!("saga_compensated_total").increment(1);
                tracing::info!(saga_id = %state.saga_id, saga_name = %state.saga_name, "saga compensated");
                return Ok(RunOutcome::Compensated);
            };

            let step = &steps[index];
            state.steps[index].status = StepStatus::Compensating;
            if !self.commit(&mut state).await? {
                return Ok(RunOutcome::Conflict);
            }

            let budget = self.lease_remaining(&state);
            let mut scoped = ctx.clone();
            let started = Instant::now();
            let result = match tokio::time::timeout(budget, step.compensate(&mut scoped)).await {
                Ok(result) => result,
                Err(_) => Err(StepError::retryable(format!(
                    "compensation timed out after {budget:?}"
                ))),
            };
            metrics::histogram!("saga_step_duration_seconds")
                .record(started.elapsed().as_secs_f64());

            match result {
                Ok(()) => {
                    ctx = scoped;
                    state.data = ctx.to_data()?;
                    state.current_step_index = index;
                    let step_state = &mut state.steps[index];
                    step_state.status = StepStatus::Compensated;
                    step_state.completed_at = Some(Utc::now());

                    if !self.commit(&mut state).await? {
                        return Ok(RunOutcome::Conflict);
                    }
                    tracing::debug!(saga_id = %state.saga_id, step = step.name(), "step compensated");
                }
                Err(err) => {
                    let step_state = &mut state.steps[index];
                    step_state.status = StepStatus::CompensationFailed;
                    step_state.error_message = Some(err.message().to_string());
                    state.status = SagaStatus::Failed;
                    state.completed_at = Some(Utc::now());
                    state.last_error = Some(format!(
                        "compensation of step '{}' failed: {err}",
                        step.name()
                    ));

                    if !self.commit(&mut state).await? {
                        return Ok(RunOutcome::Conflict);
                    }

                    metrics::counter!("saga_failed_total").increment(1);
                    tracing::warn!(
                        saga_id = %state.saga_id,
                        step = step.name(),
                        error = %err,
                        "compensation failed, saga needs manual attention"
                    );
                    return Ok(RunOutcome::Failed);
                }
            }
        }
    }

    async fn suspend_state(&self, mut state: SagaState, reason: String) -> Result<RunOutcome> {
        if let Some(step) = state.steps.get_mut(state.current_step_index)
            && step.status == StepStatus::Executing
        {
            step.status = StepStatus::Pending;
        }
        state.status = SagaStatus::Suspended;
        state.next_retry_at = None;
        state.last_error = Some(reason);

        if !self.commit(&mut state).await? {
            return Ok(RunOutcome::Conflict);
        }

        metrics::counter!("saga_suspended_total").increment(1);
        tracing::warn!(
            saga_id = %state.saga_id,
            reason = state.last_error.as_deref().unwrap_or_default(),
            "saga suspended"
        );
        Ok(RunOutcome::Suspended)
    }

    /// Writes `state` as the successor of the version it was loaded at.
    ///
    /// Returns `false` if another writer got there first; `state` is then
    /// stale and must be dropped.
    async fn commit(&self, state: &mut SagaState) -> Result<bool> {
        let expected = state.version;
        state.version = expected.next();
        state.updated_at = Utc::now();

        let committed = self.store.try_update(state, expected).await?;
        if !committed {
            metrics::counter!("saga_conflicts_total").increment(1);
            tracing::warn!(
                saga_id = %state.saga_id,
                expected = %expected,
                "saga transition lost to a concurrent writer"
            );
        }
        Ok(committed)
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 3600))
}

fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
