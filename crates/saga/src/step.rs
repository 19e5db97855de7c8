//! The unit of work a saga is built from.

use async_trait::async_trait;
use thiserror::Error;

use crate::context::SagaContext;

/// Failure reported by a step.
///
/// The orchestrator decides between retrying and compensating by matching on
/// the variant alone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Transient failure; the step may succeed if attempted again.
    #[error("{0}")]
    Retryable(String),

    /// Permanent failure; retrying cannot help.
    #[error("{0}")]
    Fatal(String),
}

impl StepError {
    pub fn retryable(message: impl Into<String>) -> Self {
        StepError::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        StepError::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StepError::Retryable(message) | StepError::Fatal(message) => message,
        }
    }
}

/// A context that cannot be (de)serialized will not fix itself on retry.
impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        StepError::Fatal(format!("invalid saga context: {err}"))
    }
}

/// Result type returned by step invocations.
pub type StepResult<T> = std::result::Result<T, StepError>;

/// A saga step with a forward action and an optional compensation.
///
/// Both actions may be invoked again for the same saga if a worker crashes
/// after the call but before the orchestrator persisted its outcome, so they
/// must be idempotent, for example by deriving an idempotency key from
/// [`SagaContext::saga_id`].
///
/// Changes a step makes to the context are kept only when the call succeeds.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable name used to persist the saga definition and resolve the step
    /// on resume. Renaming a step orphans every saga persisted with the old
    /// name.
    fn name(&self) -> &str;

    /// Runs the forward action.
    ///
    /// The returned value is stored as the step's result data.
    async fn execute(&self, ctx: &mut SagaContext) -> StepResult<Option<serde_json::Value>>;

    /// Undoes the forward action after a later step failed.
    ///
    /// The default implementation is a no-op, suitable for read-only steps.
    async fn compensate(&self, ctx: &mut SagaContext) -> StepResult<()> {
        let _ = ctx;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReadOnly;

    #[async_trait]
    impl Step for ReadOnly {
        fn name(&self) -> &str {
            "read_only"
        }

        async fn execute(&self, ctx: &mut SagaContext) -> StepResult<Option<serde_json::Value>> {
            let n: u32 = ctx.payload()?;
            Ok(Some(serde_json::json!(n * 2)))
        }
    }

    #[tokio::test]
    async fn default_compensation_is_noop() {
        let mut ctx = SagaContext::from_value(serde_json::json!(21));
        let before = ctx.clone();

        assert_eq!(
            ReadOnly.execute(&mut ctx).await,
            Ok(Some(serde_json::json!(42)))
        );
        assert_eq!(ReadOnly.compensate(&mut ctx).await, Ok(()));
        assert_eq!(ctx, before);
    }

    #[tokio::test]
    async fn bad_context_is_fatal() {
        let mut ctx = SagaContext::from_value(serde_json::json!("not a number"));
        let err = ReadOnly.execute(&mut ctx).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.message().starts_with("invalid saga context"));
    }

    #[test]
    fn error_constructors() {
        assert!(StepError::retryable("timeout").is_retryable());
        assert!(!StepError::fatal("declined").is_retryable());
        assert_eq!(StepError::fatal("declined").to_string(), "declined");
    }
}
