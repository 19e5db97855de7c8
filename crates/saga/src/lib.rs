//! Saga orchestration engine.
//!
//! A saga is an ordered list of [`Step`]s, each with a forward action and an
//! optional compensation. The [`SagaOrchestrator`] runs the steps in order,
//! persisting progress after every transition, and if a step fails for good
//! it undoes the completed steps in reverse order.
//!
//! Progress lives in a [`saga_store::SagaStateStore`], so any worker can pick
//! a saga up with [`SagaOrchestrator::resume`] after a crash. Workers never
//! lock each other out in-process; a transition is kept only if its
//! compare-and-swap on the saga version succeeds.
//!
//! Steps are resolved by name through a [`StepRegistry`], so every worker
//! that resumes sagas must register the same steps.

pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod step;

pub use config::{ConfigError, SagaConfig, StoreKind};
pub use context::SagaContext;
pub use error::{Result, SagaError};
pub use orchestrator::{RunOutcome, SagaOrchestrator};
pub use registry::{SagaDefinition, StepRegistry};
pub use retry::{RetryDecision, RetryPolicy};
pub use step::{Step, StepError, StepResult};
