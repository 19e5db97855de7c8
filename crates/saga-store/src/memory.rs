use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    Result, SagaId, SagaQuery, SagaState, SagaStoreError, Version,
    store::{SagaStateStore, validate_state, validate_update},
};

/// In-memory saga state store for tests and local development.
///
/// The compare-and-swap happens under a single write lock, which gives the
/// same atomicity as the PostgreSQL implementation within one process.
#[derive(Clone, Default)]
pub struct InMemorySagaStateStore {
    sagas: Arc<RwLock<HashMap<SagaId, SagaState>>>,
}

impl InMemorySagaStateStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaStateStore for InMemorySagaStateStore {
    async fn create(&self, state: &SagaState) -> Result<()> {
        validate_state(state)?;

        let mut sagas = self.sagas.write().await;
        if sagas.contains_key(&state.saga_id) {
            return Err(SagaStoreError::AlreadyExists(state.saga_id));
        }
        sagas.insert(state.saga_id, state.clone());
        tracing::debug!(saga_id = %state.saga_id, "saga created");
        Ok(())
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaState>> {
        Ok(self.sagas.read().await.get(&saga_id).cloned())
    }

    async fn try_update(&self, state: &SagaState, expected_version: Version) -> Result<bool> {
        validate_update(state, expected_version)?;

        let mut sagas = self.sagas.write().await;
        match sagas.get_mut(&state.saga_id) {
            Some(stored) if stored.version == expected_version => {
                *stored = state.clone();
                Ok(true)
            }
            Some(stored) => {
                tracing::debug!(
                    saga_id = %state.saga_id,
                    expected = %expected_version,
                    actual = %stored.version,
                    "saga update lost compare-and-swap"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, only_terminal: bool) -> Result<u64> {
        let mut sagas = self.sagas.write().await;
        let before = sagas.len();
        sagas.retain(|_, s| s.updated_at >= cutoff || (only_terminal && !s.is_terminal()));
        Ok((before - sagas.len()) as u64)
    }

    async fn query(&self, query: SagaQuery) -> Result<Vec<SagaState>> {
        let sagas = self.sagas.read().await;
        let mut matching: Vec<_> = sagas
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.saga_id.cmp(&b.saga_id))
        });

        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }

        Ok(matching)
    }
}
