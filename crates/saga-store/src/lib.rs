//! Persistence for saga progress.
//!
//! A [`SagaState`] is the durable snapshot of one saga instance. Stores only
//! mutate it through [`SagaStateStore::try_update`], an atomic compare-and-swap
//! on [`Version`], which is the sole coordination point between workers.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod state;
pub mod status;
pub mod store;

pub use common::SagaId;
pub use error::{Result, SagaStoreError};
pub use memory::InMemorySagaStateStore;
pub use postgres::PostgresSagaStateStore;
pub use query::SagaQuery;
pub use state::{SagaState, StepState, Version};
pub use status::{SagaStatus, StepStatus};
pub use store::{SagaStateStore, SagaStateStoreExt};
