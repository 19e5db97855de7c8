use chrono::{DateTime, Utc};

use crate::{SagaState, SagaStatus};

/// Builder for constructing saga queries.
///
/// Used by operators to list sagas needing attention and by the retry
/// scheduler to find sagas whose backoff has elapsed.
#[derive(Debug, Clone, Default)]
pub struct SagaQuery {
    /// Filter by status (any of these).
    pub statuses: Option<Vec<SagaStatus>>,

    /// Filter by saga definition name.
    pub saga_name: Option<String>,

    /// Filter by correlation ID.
    pub correlation_id: Option<String>,

    /// Filter by tenant ID.
    pub tenant_id: Option<String>,

    /// Only sagas with a scheduled retry due at or before this instant.
    pub due_before: Option<DateTime<Utc>>,

    /// Maximum number of sagas to return.
    pub limit: Option<usize>,
}

impl SagaQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for running sagas whose retry is due at `now`.
    pub fn due_for_retry(now: DateTime<Utc>) -> Self {
        Self {
            statuses: Some(vec![SagaStatus::Running]),
            due_before: Some(now),
            ..Default::default()
        }
    }

    /// Filters by a single status.
    pub fn status(mut self, status: SagaStatus) -> Self {
        self.statuses = Some(vec![status]);
        self
    }

    /// Filters by multiple statuses (any of these).
    pub fn statuses(mut self, statuses: Vec<SagaStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    /// Filters by saga name.
    pub fn saga_name(mut self, saga_name: impl Into<String>) -> Self {
        self.saga_name = Some(saga_name.into());
        self
    }

    /// Filters by correlation ID.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Filters by tenant ID.
    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Limits the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the state satisfies every filter except `limit`.
    pub fn matches(&self, state: &SagaState) -> bool {
        if let Some(ref statuses) = self.statuses
            && !statuses.contains(&state.status)
        {
            return false;
        }
        if let Some(ref name) = self.saga_name
            && &state.saga_name != name
        {
            return false;
        }
        if let Some(ref correlation_id) = self.correlation_id
            && state.correlation_id.as_ref() != Some(correlation_id)
        {
            return false;
        }
        if let Some(ref tenant_id) = self.tenant_id
            && state.tenant_id.as_ref() != Some(tenant_id)
        {
            return false;
        }
        if let Some(due) = self.due_before {
            match state.next_retry_at {
                Some(at) if at <= due => {}
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SagaId;

    #[test]
    fn query_builder() {
        let query = SagaQuery::new()
            .status(SagaStatus::Failed)
            .saga_name("order")
            .tenant_id("acme")
            .limit(10);

        assert_eq!(query.statuses, Some(vec![SagaStatus::Failed]));
        assert_eq!(query.saga_name, Some("order".to_string()));
        assert_eq!(query.tenant_id, Some("acme".to_string()));
        assert_eq!(query.limit, Some(10));
    }

    #[test]
    fn empty_query_matches_everything() {
        let state = SagaState::new(SagaId::new(), "order", ["a"]);
        assert!(SagaQuery::new().matches(&state));
    }

    #[test]
    fn due_for_retry_requires_running_and_elapsed_backoff() {
        let now = Utc::now();
        let mut state = SagaState::new(SagaId::new(), "order", ["a"]);
        state.status = SagaStatus::Running;

        let query = SagaQuery::due_for_retry(now);
        assert!(!query.matches(&state), "no retry scheduled");

        state.next_retry_at = Some(now - chrono::Duration::seconds(1));
        assert!(query.matches(&state));

        state.next_retry_at = Some(now + chrono::Duration::seconds(30));
        assert!(!query.matches(&state), "backoff not elapsed");

        state.next_retry_at = Some(now);
        state.status = SagaStatus::Suspended;
        assert!(!query.matches(&state), "wrong status");
    }

    #[test]
    fn correlation_filter() {
        let state = SagaState::new(SagaId::new(), "order", ["a"]).with_correlation_id("c-1");
        assert!(SagaQuery::new().correlation_id("c-1").matches(&state));
        assert!(!SagaQuery::new().correlation_id("c-2").matches(&state));
    }
}
