//! Component definitions and the registry the scheduler runs from.
//!
//! A component is one analytical stage: an executor, the names of the
//! stages whose outputs it consumes, a validator for its result shape, and
//! a `required` flag deciding whether its failure fails the whole session.

use crate::analysis::context::JobRequest;
use crate::errors::ErrorKind;
use crate::pipeline::graph::ComponentGraph;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

/// Everything an executor gets to see: the job plus its declared
/// predecessors' outputs (error sentinels included).
#[derive(Debug, Clone)]
pub struct ComponentInput {
    pub session_id: String,
    pub job: JobRequest,
    pub previous_results: BTreeMap<String, Value>,
}

impl ComponentInput {
    /// A predecessor's output, if it produced one.
    pub fn dependency(&self, name: &str) -> Option<&Value> {
        self.previous_results.get(name)
    }

    /// Whether a predecessor ended in an error sentinel.
    pub fn dependency_errored(&self, name: &str) -> bool {
        self.previous_results
            .get(name)
            .is_some_and(|v| v.get("error").is_some())
    }
}

/// One analytical stage. Implementations must be cancellation-aware: the
/// token is threaded into every outbound call.
#[async_trait]
pub trait ComponentExecutor: Send + Sync {
    async fn execute(&self, input: &ComponentInput, cancel: &CancellationToken) -> Result<Value>;
}

/// Shape check applied to the normalized result.
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Default validator: a non-empty JSON object that does not carry an
/// error discriminator.
pub fn non_empty_object(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| !map.is_empty() && !map.contains_key("error"))
}

/// Validator requiring specific keys on top of [`non_empty_object`].
pub fn requires_fields(fields: &'static [&'static str]) -> Validator {
    Arc::new(move |value: &Value| {
        non_empty_object(value)
            && value
                .as_object()
                .is_some_and(|map| fields.iter().all(|f| map.contains_key(*f)))
    })
}

/// A registered component.
#[derive(Clone)]
pub struct ComponentDefinition {
    pub name: String,
    pub dependencies: Vec<String>,
    pub required: bool,
    /// Storage bucket its artifacts land in
    pub category: String,
    pub executor: Arc<dyn ComponentExecutor>,
    pub validator: Validator,
}

impl ComponentDefinition {
    pub fn new(name: &str, executor: Arc<dyn ComponentExecutor>) -> Self {
        Self {
            name: name.to_string(),
            dependencies: Vec::new(),
            required: true,
            category: crate::checkpoint::categories::ANALYSIS.to_string(),
            executor,
            validator: Arc::new(non_empty_object),
        }
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }
}

impl std::fmt::Debug for ComponentDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentDefinition")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("required", &self.required)
            .finish()
    }
}

/// How a component ended, as recorded in artifacts and the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Ok,
    Error,
    SkippedFromCheckpoint,
}

/// The tagged result of one component run. This is the only shape the
/// scheduler stores; the error discriminator lives in `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentOutcome {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub value: Value,
}

impl ComponentOutcome {
    pub fn ok(value: Value) -> Self {
        Self {
            status: ComponentStatus::Ok,
            kind: None,
            value,
        }
    }

    pub fn error(component: &str, kind: ErrorKind, message: &str) -> Self {
        Self {
            status: ComponentStatus::Error,
            kind: Some(kind),
            value: serde_json::json!({
                "error": message,
                "kind": kind,
                "component": component,
            }),
        }
    }

    pub fn skipped(value: Value) -> Self {
        Self {
            status: ComponentStatus::SkippedFromCheckpoint,
            kind: None,
            value,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, ComponentStatus::Ok | ComponentStatus::SkippedFromCheckpoint)
    }
}

/// Holds the component definitions and revalidates the dependency graph on
/// every registration; a registration that would introduce a cycle or an
/// unknown dependency is rejected.
#[derive(Default)]
pub struct ComponentRegistry {
    components: RwLock<Vec<ComponentDefinition>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, definition: ComponentDefinition) -> Result<()> {
        let mut components = self.components.write().expect("component lock poisoned");
        let mut candidate: Vec<(String, Vec<String>)> = components
            .iter()
            .filter(|c| c.name != definition.name)
            .map(|c| (c.name.clone(), c.dependencies.clone()))
            .collect();
        candidate.push((definition.name.clone(), definition.dependencies.clone()));
        ComponentGraph::build(&candidate)?;

        // Duplicate names overwrite, mirroring provider registration.
        components.retain(|c| c.name != definition.name);
        components.push(definition);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.components.read().expect("component lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, name: &str) -> Option<ComponentDefinition> {
        self.components
            .read()
            .expect("component lock poisoned")
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.components
            .read()
            .expect("component lock poisoned")
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// The stable execution order over all registered components.
    pub fn execution_order(&self) -> Vec<String> {
        let components = self.components.read().expect("component lock poisoned");
        let nodes: Vec<(String, Vec<String>)> = components
            .iter()
            .map(|c| (c.name.clone(), c.dependencies.clone()))
            .collect();
        // The graph was validated at registration time.
        ComponentGraph::build(&nodes)
            .map(|g| g.execution_order())
            .unwrap_or_default()
    }
}
