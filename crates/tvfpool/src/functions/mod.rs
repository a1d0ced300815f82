//! Table-valued functions executed inside workers.
//!
//! A `TableFunction` is a named factory; each session gets its own `Evaluation`
//! which is stepped once per request until it finishes or fails.

mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

pub use builtin::builtin_registry;

/// Result of one successful evaluation step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// More steps follow; the caller issues a continue request.
    Partial(serde_json::Value),
    Finish(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FunctionError {
    #[error("function not found: {0}")]
    NotFound(String),
    #[error("{function}: unknown method '{method}'")]
    UnknownMethod { function: String, method: String },
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Failed(String),
}

impl FunctionError {
    pub fn unknown_method(function: impl Into<String>, method: impl Into<String>) -> Self {
        Self::UnknownMethod {
            function: function.into(),
            method: method.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }
}

/// Per-session evaluation state.
#[async_trait]
pub trait Evaluation: Send {
    async fn step(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Step, FunctionError>;
}

pub trait TableFunction: Send + Sync + 'static {
    fn start(&self) -> Box<dyn Evaluation>;
}

impl<F> TableFunction for F
where
    F: Fn() -> Box<dyn Evaluation> + Send + Sync + 'static,
{
    fn start(&self) -> Box<dyn Evaluation> {
        self()
    }
}

/// Functions a worker can resolve by name.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn TableFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, function: impl TableFunction) {
        let name = name.into();
        if self
            .functions
            .insert(name.clone(), Arc::new(function))
            .is_some()
        {
            tracing::warn!(function = %name, "Replacing previously registered function");
        }
    }

    pub fn with(mut self, name: impl Into<String>, function: impl TableFunction) -> Self {
        self.register(name, function);
        self
    }

    /// Start a new evaluation of the named function.
    pub fn resolve(&self, name: &str) -> Result<Box<dyn Evaluation>, FunctionError> {
        self.functions
            .get(name)
            .map(|f| f.start())
            .ok_or_else(|| FunctionError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Constant(serde_json::Value);

    #[async_trait]
    impl Evaluation for Constant {
        async fn step(
            &mut self,
            _method: &str,
            _params: serde_json::Value,
        ) -> Result<Step, FunctionError> {
            Ok(Step::Finish(self.0.clone()))
        }
    }

    #[tokio::test]
    async fn resolve_starts_fresh_evaluation() {
        let registry = FunctionRegistry::new()
            .with("const", || Box::new(Constant(json!(3))) as Box<dyn Evaluation>);

        let mut eval = registry.resolve("const").unwrap();
        assert_eq!(
            eval.step("run", json!(null)).await.unwrap(),
            Step::Finish(json!(3))
        );
    }

    #[test]
    fn resolve_unknown_function() {
        let registry = FunctionRegistry::new();
        assert_eq!(
            registry.resolve("missing").err(),
            Some(FunctionError::NotFound("missing".to_string()))
        );
    }

    #[test]
    fn names_are_sorted() {
        let registry = FunctionRegistry::new()
            .with("b", || Box::new(Constant(json!(1))) as Box<dyn Evaluation>)
            .with("a", || Box::new(Constant(json!(2))) as Box<dyn Evaluation>);
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.contains("a"));
    }
}
