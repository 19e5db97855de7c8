//! Working data shared by the steps of one saga.

use std::collections::BTreeMap;

use common::SagaId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The serializable working data of a saga.
///
/// Holds the primary business payload plus a property bag steps use to hand
/// values to later steps and to their own compensation. Everything is kept as
/// JSON, so only serializable values can be stored, and the context survives
/// the round trip through [`saga_store::SagaState::data`] between every step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SagaContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    saga_id: Option<SagaId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    tenant_id: Option<String>,

    #[serde(default)]
    payload: serde_json::Value,

    #[serde(default)]
    properties: BTreeMap<String, serde_json::Value>,
}

impl SagaContext {
    /// Creates a context around a serializable business payload.
    pub fn new<T: Serialize>(payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from_value(serde_json::to_value(payload)?))
    }

    /// Creates a context around a raw JSON payload.
    pub fn from_value(payload: serde_json::Value) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    /// Sets the correlation ID propagated to the saga record.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the tenant ID propagated to the saga record.
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// The saga this context belongs to, once the saga has been created.
    ///
    /// Steps use it to build idempotency keys for downstream calls.
    pub fn saga_id(&self) -> Option<SagaId> {
        self.saga_id
    }

    pub(crate) fn set_saga_id(&mut self, saga_id: SagaId) {
        self.saga_id = Some(saga_id);
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Deserializes the business payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Returns the raw business payload.
    pub fn payload_value(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Replaces the business payload.
    pub fn set_payload<T: Serialize>(&mut self, payload: &T) -> Result<(), serde_json::Error> {
        self.payload = serde_json::to_value(payload)?;
        Ok(())
    }

    /// Reads a property, returning None if it was never set.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.properties
            .get(key)
            .map(T::deserialize)
            .transpose()
    }

    /// Stores a property, replacing any previous value.
    pub fn insert<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        self.properties
            .insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Removes a property, returning its raw value.
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.properties.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    /// Serializes the context for [`saga_store::SagaState::data`].
    pub fn to_data(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Restores a context from [`saga_store::SagaState::data`].
    pub fn from_data(data: serde_json::Value) -> Result<Self, serde_json::Error> {
        if data.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(data)
    }
}
