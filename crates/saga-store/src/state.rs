use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SagaId, SagaStatus, StepStatus};

/// Version number of a saga state, used for optimistic concurrency control.
///
/// A freshly created saga is at [`Version::first`]; every persisted
/// transition moves it to [`Version::next`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the version of a newly created saga (1).
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// Persisted progress of one step within a saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    /// Position of the step; equals its index in [`SagaState::steps`].
    pub step_index: usize,

    /// Stable step name, resolved through the step registry on resume.
    pub step_name: String,

    pub status: StepStatus,

    /// Output of a successful `execute`, if the step produced any.
    pub result_data: Option<serde_json::Value>,

    /// Last failure reported by the step.
    pub error_message: Option<String>,

    /// When the most recent execution attempt started.
    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Number of retries consumed by this step.
    pub retry_count: u32,
}

impl StepState {
    /// Creates a pending step at the given position.
    pub fn new(step_index: usize, step_name: impl Into<String>) -> Self {
        Self {
            step_index,
            step_name: step_name.into(),
            status: StepStatus::Pending,
            result_data: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
        }
    }
}

/// Durable snapshot of one saga instance.
///
/// Only the orchestrator mutates a `SagaState`, and only by writing it back
/// through [`crate::SagaStateStore::try_update`] with the version it loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaState {
    pub saga_id: SagaId,

    /// Name of the saga definition this instance was started from.
    pub saga_name: String,

    pub status: SagaStatus,

    /// Next step to execute going forward, or one past the next step to
    /// compensate going backward.
    pub current_step_index: usize,

    /// Serialized saga context.
    pub data: serde_json::Value,

    /// Steps in execution order.
    pub steps: Vec<StepState>,

    pub version: Version,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    pub correlation_id: Option<String>,
    pub tenant_id: Option<String>,

    pub last_error: Option<String>,

    /// Retries consumed by the step currently being attempted.
    pub retry_count: u32,

    /// Earliest time the pending retry may run.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl SagaState {
    /// Creates a pending saga with one pending step per name.
    pub fn new<I, N>(saga_id: SagaId, saga_name: impl Into<String>, step_names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let now = Utc::now();
        Self {
            saga_id,
            saga_name: saga_name.into(),
            status: SagaStatus::Pending,
            current_step_index: 0,
            data: serde_json::Value::Null,
            steps: step_names
                .into_iter()
                .enumerate()
                .map(|(index, name)| StepState::new(index, name))
                .collect(),
            version: Version::first(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            correlation_id: None,
            tenant_id: None,
            last_error: None,
            retry_count: 0,
            next_retry_at: None,
        }
    }

    /// Sets the serialized context.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Sets the correlation ID.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the tenant ID.
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Returns true if the saga reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the step the forward run would execute next.
    pub fn current_step(&self) -> Option<&StepState> {
        self.steps.get(self.current_step_index)
    }

    /// Returns the names of the steps in execution order.
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.step_name.as_str())
    }

    /// Returns true if a retry is scheduled and not yet due at `now`.
    pub fn is_waiting_for_retry(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_some_and(|at| at > now)
    }
}
