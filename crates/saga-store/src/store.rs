use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Result, SagaId, SagaQuery, SagaState, SagaStoreError, Version};

/// Core trait for saga state store implementations.
///
/// A store persists one [`SagaState`] per saga ID. Writers coordinate
/// exclusively through [`try_update`](SagaStateStore::try_update), so every
/// implementation must make that operation an atomic compare-and-swap.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStateStore: Send + Sync {
    /// Persists a new saga.
    ///
    /// Fails with `AlreadyExists` if a saga with the same ID is stored.
    async fn create(&self, state: &SagaState) -> Result<()>;

    /// Fetches the current state of a saga.
    ///
    /// Returns None if the saga doesn't exist.
    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaState>>;

    /// Replaces the stored state if, and only if, it is still at
    /// `expected_version`.
    ///
    /// `state.version` must be `expected_version.next()`. Returns `Ok(false)`
    /// when another writer got there first; that is a normal outcome, not an
    /// error.
    async fn try_update(&self, state: &SagaState, expected_version: Version) -> Result<bool>;

    /// Deletes sagas last updated before `cutoff`.
    ///
    /// With `only_terminal`, sagas that can still make progress are kept.
    /// Returns the number of deleted sagas.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>, only_terminal: bool) -> Result<u64>;

    /// Retrieves sagas matching a query, oldest first.
    async fn query(&self, query: SagaQuery) -> Result<Vec<SagaState>>;
}

#[async_trait]
impl<T: SagaStateStore + ?Sized> SagaStateStore for Arc<T> {
    async fn create(&self, state: &SagaState) -> Result<()> {
        (**self).create(state).await
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaState>> {
        (**self).get(saga_id).await
    }

    async fn try_update(&self, state: &SagaState, expected_version: Version) -> Result<bool> {
        (**self).try_update(state, expected_version).await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, only_terminal: bool) -> Result<u64> {
        (**self).delete_older_than(cutoff, only_terminal).await
    }

    async fn query(&self, query: SagaQuery) -> Result<Vec<SagaState>> {
        (**self).query(query).await
    }
}

/// Extension trait providing convenience methods for saga state stores.
#[async_trait]
pub trait SagaStateStoreExt: SagaStateStore {
    /// Checks if a saga exists.
    async fn exists(&self, saga_id: SagaId) -> Result<bool> {
        Ok(self.get(saga_id).await?.is_some())
    }

    /// Returns IDs of running sagas whose retry backoff has elapsed at `now`.
    async fn find_due_for_retry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SagaId>> {
        let due = self
            .query(SagaQuery::due_for_retry(now).limit(limit))
            .await?;
        Ok(due.into_iter().map(|s| s.saga_id).collect())
    }
}

// Blanket implementation for all SagaStateStore implementations
impl<T: SagaStateStore + ?Sized> SagaStateStoreExt for T {}

/// Validates a state before it is created.
pub fn validate_state(state: &SagaState) -> Result<()> {
    if state.steps.is_empty() {
        return Err(SagaStoreError::Validation(format!(
            "saga {} has no steps",
            state.saga_id
        )));
    }

    for (position, step) in state.steps.iter().enumerate() {
        if step.step_index != position {
            return Err(SagaStoreError::Validation(format!(
                "step '{}' has index {} but is stored at position {}",
                step.step_name, step.step_index, position
            )));
        }
    }

    if state.current_step_index > state.steps.len() {
        return Err(SagaStoreError::Validation(format!(
            "current step index {} exceeds step count {}",
            state.current_step_index,
            state.steps.len()
        )));
    }

    Ok(())
}

/// Validates a state before a compare-and-swap write.
pub fn validate_update(state: &SagaState, expected_version: Version) -> Result<()> {
    validate_state(state)?;

    let successor = expected_version.next();
    if state.version != successor {
        return Err(SagaStoreError::InvalidVersion {
            saga_id: state.saga_id,
            expected: successor,
            actual: state.version,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_state_without_steps() {
        let state = SagaState::new(SagaId::new(), "empty", Vec::<String>::new());
        assert!(matches!(
            validate_state(&state),
            Err(SagaStoreError::Validation(_))
        ));
    }

    #[test]
    fn rejects_misnumbered_steps() {
        let mut state = SagaState::new(SagaId::new(), "order", ["a", "b"]);
        state.steps[1].step_index = 5;
        assert!(validate_state(&state).is_err());
    }

    #[test]
    fn rejects_index_past_end() {
        let mut state = SagaState::new(SagaId::new(), "order", ["a", "b"]);
        state.current_step_index = 2;
        assert!(validate_state(&state).is_ok());
        state.current_step_index = 3;
        assert!(validate_state(&state).is_err());
    }

    #[test]
    fn update_requires_successor_version() {
        let mut state = SagaState::new(SagaId::new(), "order", ["a"]);
        state.version = Version::new(3);

        assert!(validate_update(&state, Version::new(2)).is_ok());
        assert!(matches!(
            validate_update(&state, Version::new(3)),
            Err(SagaStoreError::InvalidVersion { .. })
        ));
    }
}
