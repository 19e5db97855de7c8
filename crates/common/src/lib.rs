//! Shared identifier types for the saga engine crates.

pub mod types;

pub use types::SagaId;
