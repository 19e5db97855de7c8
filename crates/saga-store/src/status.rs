//! Saga and step state machines.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::SagaStoreError;

/// The lifecycle status of a saga instance.
///
/// State transitions:
/// ```text
/// Pending ──► Running ──┬──► Completed
///               ▲       ├──► Suspended ──┐
///               │       │                │
///               └───────┼────────────────┘
///                       └──► Compensating ──┬──► Compensated
///                                           └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// Created but no step has been attempted yet.
    #[default]
    Pending,

    /// Steps are being executed forward.
    Running,

    /// Paused by a timeout or an operator; resumable.
    Suspended,

    /// A step failed irrecoverably and completed steps are being undone.
    Compensating,

    /// All steps completed successfully (terminal state).
    Completed,

    /// Every completed step was compensated (terminal state).
    Compensated,

    /// A compensation failed; needs operator intervention (terminal state).
    Failed,
}

impl SagaStatus {
    /// All statuses after which the saga never changes again.
    pub const TERMINAL: [SagaStatus; 3] = [
        SagaStatus::Completed,
        SagaStatus::Compensated,
        SagaStatus::Failed,
    ];

    /// Returns true if an operator may suspend the saga.
    pub fn can_suspend(&self) -> bool {
        matches!(self, SagaStatus::Pending | SagaStatus::Running)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "Pending",
            SagaStatus::Running => "Running",
            SagaStatus::Suspended => "Suspended",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Completed => "Completed",
            SagaStatus::Compensated => "Compensated",
            SagaStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SagaStatus {
    type Err = SagaStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(SagaStatus::Pending),
            "Running" => Ok(SagaStatus::Running),
            "Suspended" => Ok(SagaStatus::Suspended),
            "Compensating" => Ok(SagaStatus::Compensating),
            "Completed" => Ok(SagaStatus::Completed),
            "Compensated" => Ok(SagaStatus::Compensated),
            "Failed" => Ok(SagaStatus::Failed),
            other => Err(SagaStoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// The status of a single step within a saga.
///
/// ```text
/// Pending ──► Executing ──┬──► Completed ──► Compensating ──┬──► Compensated
///    ▲            │       │                                 └──► CompensationFailed
///    └── retry ───┘       └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StepStatus {
    #[default]
    Pending,
    Executing,
    Completed,
    Failed,
    Compensating,
    Compensated,
    CompensationFailed,
    /// Conditionally omitted; never set by a forward run.
    Skipped,
}

impl StepStatus {
    /// Returns true while an invocation of the step may be in flight.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, StepStatus::Executing | StepStatus::Compensating)
    }

    /// Returns true if the step must be undone by a compensation sweep.
    pub fn needs_compensation(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Compensating)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "Pending",
            StepStatus::Executing => "Executing",
            StepStatus::Completed => "Completed",
            StepStatus::Failed => "Failed",
            StepStatus::Compensating => "Compensating",
            StepStatus::Compensated => "Compensated",
            StepStatus::CompensationFailed => "CompensationFailed",
            StepStatus::Skipped => "Skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = SagaStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(StepStatus::Pending),
            "Executing" => Ok(StepStatus::Executing),
            "Completed" => Ok(StepStatus::Completed),
            "Failed" => Ok(StepStatus::Failed),
            "Compensating" => Ok(StepStatus::Compensating),
            "Compensated" => Ok(StepStatus::Compensated),
            "CompensationFailed" => Ok(StepStatus::CompensationFailed),
            "Skipped" => Ok(StepStatus::Skipped),
            other => Err(SagaStoreError::InvalidStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(SagaStatus::default(), SagaStatus::Pending);
        assert_eq!(StepStatus::default(), StepStatus::Pending);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SagaStatus::Pending.is_terminal());
        assert!(!SagaStatus::Running.is_terminal());
        assert!(!SagaStatus::Suspended.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
    }

    #[test]
    fn test_step_flags() {
        assert!(StepStatus::Executing.is_in_flight());
        assert!(StepStatus::Compensating.is_in_flight());
        assert!(!StepStatus::Completed.is_in_flight());

        assert!(StepStatus::Completed.needs_compensation());
        assert!(!StepStatus::Pending.needs_compensation());
        assert!(!StepStatus::Failed.needs_compensation());
        assert!(!StepStatus::Compensated.needs_compensation());
    }

    #[test]
    fn test_status_strings_parse_back() {
        for status in [
            SagaStatus::Pending,
            SagaStatus::Running,
            SagaStatus::Suspended,
            SagaStatus::Compensating,
            SagaStatus::Completed,
            SagaStatus::Compensated,
            SagaStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<SagaStatus>().unwrap(), status);
        }
        assert_eq!(
            "CompensationFailed".parse::<StepStatus>().unwrap(),
            StepStatus::CompensationFailed
        );
        assert!(matches!(
            "Exploded".parse::<StepStatus>(),
            Err(SagaStoreError::InvalidStatus(_))
        ));
    }
}
