//! Saga worker.
//!
//! Feeds sagas to a [`saga::SagaOrchestrator`]: a bounded trigger channel
//! drives sagas concurrently, a scheduler turns elapsed retry backoffs into
//! triggers, and a cleanup task purges finished sagas past their retention.
//! All three stop on a shared shutdown signal.

pub mod config;
pub mod demo;
pub mod error;
pub mod scheduler;
pub mod trigger;
pub mod worker;

pub use config::{LogFormat, WorkerConfig};
pub use error::{Result, WorkerError};
pub use scheduler::{CleanupTask, RetryScheduler};
pub use trigger::{SagaTrigger, TriggerDispatcher, TriggerReason, TriggerSender, handle_trigger};
pub use worker::Worker;
