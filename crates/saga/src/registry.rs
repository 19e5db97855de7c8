//! Explicit mapping from step names to step implementations.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, SagaError};
use crate::step::Step;

/// Registry of the steps a worker can run.
///
/// Sagas are persisted with step names only; every worker that may resume a
/// saga must register the same names.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a step under its own name.
    pub fn register<S: Step + 'static>(&mut self, step: S) -> Result<&mut Self> {
        self.register_arc(Arc::new(step))
    }

    /// Registers a shared step under its own name.
    pub fn register_arc(&mut self, step: Arc<dyn Step>) -> Result<&mut Self> {
        let name = step.name().to_string();
        if self.steps.contains_key(&name) {
            return Err(SagaError::DuplicateStep(name));
        }
        self.steps.insert(name, step);
        Ok(self)
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with_step<S: Step + 'static>(mut self, step: S) -> Result<Self> {
        self.register(step)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(name).cloned()
    }

    /// Resolves an ordered list of step names.
    pub fn resolve<'a, I>(&self, names: I) -> Result<Vec<Arc<dyn Step>>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        names
            .into_iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| SagaError::UnknownStep(name.to_string()))
            })
            .collect()
    }

    /// Builds a saga definition, checking every step is registered.
    pub fn define<I, N>(&self, saga_name: impl Into<String>, step_names: I) -> Result<SagaDefinition>
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let definition = SagaDefinition::new(saga_name, step_names);
        if definition.is_empty() {
            return Err(SagaError::EmptyDefinition(definition.name));
        }
        self.resolve(definition.step_names())?;
        Ok(definition)
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.steps.keys().collect();
        names.sort();
        f.debug_struct("StepRegistry").field("steps", &names).finish()
    }
}

/// A named, ordered list of steps.
///
/// Steps run in the order given here and are never reordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaDefinition {
    name: String,
    steps: Vec<String>,
}

impl SagaDefinition {
    pub fn new<I, N>(name: impl Into<String>, step_names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        Self {
            name: name.into(),
            steps: step_names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::context::SagaContext;
    use crate::step::StepResult;

    struct Named(&'static str);

    #[async_trait]
    impl Step for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _ctx: &mut SagaContext) -> StepResult<Option<serde_json::Value>> {
            Ok(None)
        }
    }

    fn registry() -> StepRegistry {
        StepRegistry::new()
            .with_step(Named("reserve"))
            .unwrap()
            .with_step(Named("charge"))
            .unwrap()
    }

    #[test]
    fn register_and_lookup() {
        let registry = registry();
        assert_eq!(registry.get("reserve").unwrap().name(), "reserve");
        assert_eq!(registry.get("charge").unwrap().name(), "charge");
        assert!(registry.get("ship").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = registry();
        let result = registry.register(Named("reserve"));
        assert!(matches!(result, Err(SagaError::DuplicateStep(name)) if name == "reserve"));
    }

    #[test]
    fn resolve_preserves_order() {
        let steps = registry().resolve(["charge", "reserve", "charge"]).unwrap();
        let names: Vec<_> = steps.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, ["charge", "reserve", "charge"]);
    }

    #[test]
    fn resolve_unknown_step_fails() {
        let result = registry().resolve(["reserve", "ship"]);
        assert!(matches!(result, Err(SagaError::UnknownStep(name)) if name == "ship"));
    }

    #[test]
    fn define_validates_steps() {
        let registry = registry();
        let definition = registry.define("order", ["reserve", "charge"]).unwrap();
        assert_eq!(definition.name(), "order");
        assert_eq!(definition.step_names().collect::<Vec<_>>(), ["reserve", "charge"]);

        assert!(matches!(
            registry.define("order", ["reserve", "ship"]),
            Err(SagaError::UnknownStep(_))
        ));
        assert!(matches!(
            registry.define("empty", Vec::<String>::new()),
            Err(SagaError::EmptyDefinition(_))
        ));
    }

    #[test]
    fn debug_lists_sorted_names() {
        assert_eq!(
            format!("{:?}", registry()),
            r#"StepRegistry { steps: ["charge", "reserve"] }"#
        );
    }
}
