//! Tool Registry & Dispatch
//!
//! The registry is a read-only catalog of tool descriptors; the dispatcher
//! binds catalog entries to async handlers and invokes them:
//! - Descriptor lookup by tool id
//! - Required-input validation
//! - Typed dispatch failures (unknown tool, missing inputs, tool error, timeout)
//! - Optional result cache, notes journal and metrics
//!
//! Retry policy does not live here; see [`crate::agent::executor`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::catalog::CatalogError;
use super::notes::{AgentNotes, NoteKind};
use crate::cache::ToolResultCache;
use crate::metrics::OrchestrationMetrics;

/// Keyword arguments passed to a tool
pub type ToolInputs = Map<String, Value>;

/// Result of a single dispatch
pub type DispatchOutcome = Result<Value, DispatchError>;

/// Specification of one tool input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    /// Whether the dispatcher rejects calls that omit this input
    pub required: bool,
    /// Type hint, e.g. `str`, `int`, `List[str]`
    pub type_hint: String,
    /// Free-text description for the planner prompt
    pub description: String,
}

impl InputSpec {
    /// Parse a catalog spec such as `"str - required. Search keywords"`.
    ///
    /// An input is optional exactly when the spec mentions `Optional`.
    pub fn parse(spec: &str) -> Self {
        let required = !spec.contains("Optional");
        let (head, description) = match spec.split_once(" - ") {
            Some((head, tail)) => (head.trim(), tail.trim()),
            None => (spec.trim(), ""),
        };

        let type_hint = head
            .strip_prefix("Optional[")
            .and_then(|inner| inner.strip_suffix(']'))
            .unwrap_or(head)
            .to_string();

        Self {
            required,
            type_hint,
            description: description.to_string(),
        }
    }

    /// Render back to the catalog's textual form
    pub fn render(&self) -> String {
        let hint = if self.required {
            self.type_hint.clone()
        } else {
            format!("Optional[{}]", self.type_hint)
        };
        if self.description.is_empty() {
            hint
        } else {
            format!("{} - {}", hint, self.description)
        }
    }
}

/// Immutable description of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub tool_id: String,
    pub name: String,
    pub description: String,
    pub inputs: BTreeMap<String, InputSpec>,
    pub outputs: BTreeMap<String, String>,
}

impl ToolDescriptor {
    /// Create a descriptor with no inputs or outputs
    pub fn new(tool_id: &str, name: &str, description: &str) -> Self {
        Self {
            tool_id: tool_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Add an input from its catalog spec string
    pub fn with_input(mut self, name: &str, spec: &str) -> Self {
        self.inputs.insert(name.to_string(), InputSpec::parse(spec));
        self
    }

    /// Add an output field description
    pub fn with_output(mut self, name: &str, description: &str) -> Self {
        self.outputs.insert(name.to_string(), description.to_string());
        self
    }

    /// Names of inputs not marked optional
    pub fn required_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name.as_str())
    }

    /// Required inputs absent from `inputs`, in catalog order
    pub fn missing_inputs(&self, inputs: &ToolInputs) -> Vec<String> {
        self.required_inputs()
            .filter(|name| !inputs.contains_key(*name))
            .map(str::to_string)
            .collect()
    }

    /// Keep only the inputs this tool declares
    pub fn select_inputs(&self, inputs: &ToolInputs) -> ToolInputs {
        inputs
            .iter()
            .filter(|(name, _)| self.inputs.contains_key(name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// One catalog entry rendered for a planning prompt
    pub fn render(&self) -> String {
        let mut s = format!("- [{}] {}: {}\n", self.tool_id, self.name, self.description);
        if self.inputs.is_empty() {
            s.push_str("    inputs: (none)\n");
        }
        for (name, spec) in &self.inputs {
            s.push_str(&format!("    input {}: {}\n", name, spec.render()));
        }
        for (name, description) in &self.outputs {
            s.push_str(&format!("    output {}: {}\n", name, description));
        }
        s
    }
}

/// Read-only catalog of tool descriptors
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry, rejecting duplicate tool ids
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = ToolDescriptor>,
    ) -> Result<Self, CatalogError> {
        let mut tools = HashMap::new();
        for descriptor in descriptors {
            if tools.contains_key(&descriptor.tool_id) {
                return Err(CatalogError::Duplicate(descriptor.tool_id));
            }
            tools.insert(descriptor.tool_id.clone(), descriptor);
        }
        Ok(Self { tools })
    }

    /// Look up a descriptor by id
    pub fn describe(&self, tool_id: &str) -> Option<&ToolDescriptor> {
        self.tools.get(tool_id)
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.tools.contains_key(tool_id)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// All descriptors, numeric ids first in numeric order, then the rest by name
    pub fn list(&self) -> Vec<&ToolDescriptor> {
        let mut tools: Vec<&ToolDescriptor> = self.tools.values().collect();
        tools.sort_by(|a, b| {
            let key = |d: &ToolDescriptor| (d.tool_id.parse::<u64>().unwrap_or(u64::MAX), d.tool_id.clone());
            key(a).cmp(&key(b))
        });
        tools
    }

    /// Render the whole catalog for a planning prompt
    pub fn render_for_prompt(&self) -> String {
        self.list().iter().map(|d| d.render()).collect()
    }
}

/// Typed dispatch failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown tool: {tool_id}")]
    UnknownTool { tool_id: String },

    #[error("Missing required inputs for tool {tool_id}: {}", .missing.join(", "))]
    MissingInputs { tool_id: String, missing: Vec<String> },

    #[error("Tool {tool_id} failed: {message}")]
    ToolExecution { tool_id: String, message: String },

    #[error("Tool {tool_id} timed out after {timeout_ms}ms")]
    Timeout { tool_id: String, timeout_ms: u64 },
}

impl DispatchError {
    pub fn tool_id(&self) -> &str {
        match self {
            Self::UnknownTool { tool_id }
            | Self::MissingInputs { tool_id, .. }
            | Self::ToolExecution { tool_id, .. }
            | Self::Timeout { tool_id, .. } => tool_id,
        }
    }

    /// Short classification used in notes and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTool { .. } => "UnknownTool",
            Self::MissingInputs { .. } => "MissingInputs",
            Self::ToolExecution { .. } => "ToolExecutionError",
            Self::Timeout { .. } => "Timeout",
        }
    }
}

/// Type alias for tool handler function
pub type ToolHandler = Arc<
    dyn Fn(ToolInputs) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>
        + Send
        + Sync,
>;

/// Binds catalog entries to handlers and invokes them
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    bindings: HashMap<String, ToolHandler>,
    timeout: Duration,
    cache: Option<ToolResultCache>,
    notes: Option<Arc<AgentNotes>>,
    metrics: Option<Arc<OrchestrationMetrics>>,
}

impl ToolDispatcher {
    /// Create a dispatcher over a registry with no bindings
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            bindings: HashMap::new(),
            timeout: Duration::from_secs(30),
            cache: None,
            notes: None,
            metrics: None,
        }
    }

    /// Bound every invocation by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Serve repeated identical calls from a cache
    pub fn with_cache(mut self, cache: ToolResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Record executions and errors in a notes journal
    pub fn with_notes(mut self, notes: Arc<AgentNotes>) -> Self {
        self.notes = Some(notes);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<OrchestrationMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn describe(&self, tool_id: &str) -> Option<&ToolDescriptor> {
        self.registry.describe(tool_id)
    }

    /// Bind a handler to a catalog entry.
    ///
    /// Ids absent from the catalog are rejected so a typo surfaces at startup
    /// rather than as an `UnknownTool` in the middle of a plan.
    pub fn bind<F, Fut>(&mut self, tool_id: &str, handler: F) -> Result<(), DispatchError>
    where
        F: Fn(ToolInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if !self.registry.contains(tool_id) {
            return Err(DispatchError::UnknownTool {
                tool_id: tool_id.to_string(),
            });
        }

        let handler: ToolHandler = Arc::new(move |inputs| Box::pin(handler(inputs)));
        if self.bindings.insert(tool_id.to_string(), handler).is_some() {
            warn!("Rebound tool {}", tool_id);
        } else {
            debug!("Bound tool {}", tool_id);
        }
        Ok(())
    }

    pub fn is_bound(&self, tool_id: &str) -> bool {
        self.bindings.contains_key(tool_id)
    }

    /// Catalog entries without a handler
    pub fn unbound_tools(&self) -> Vec<&str> {
        self.registry
            .list()
            .into_iter()
            .filter(|d| !self.bindings.contains_key(&d.tool_id))
            .map(|d| d.tool_id.as_str())
            .collect()
    }

    /// Validate and invoke a tool.
    ///
    /// Extra keys in `inputs` are dropped; optional inputs pass through when
    /// present. Tool errors and timeouts come back as typed failures.
    pub async fn invoke(&self, tool_id: &str, inputs: &ToolInputs) -> DispatchOutcome {
        self.dispatch(tool_id, inputs, true).await
    }

    /// Like [`invoke`](Self::invoke), but always calls the tool. A retry of a
    /// result judged insufficient must not be answered from the cache; the
    /// fresh result still replaces the cached one.
    pub async fn invoke_fresh(&self, tool_id: &str, inputs: &ToolInputs) -> DispatchOutcome {
        self.dispatch(tool_id, inputs, false).await
    }

    async fn dispatch(&self, tool_id: &str, inputs: &ToolInputs, read_cache: bool) -> DispatchOutcome {
        let outcome = self.invoke_inner(tool_id, inputs, read_cache).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_dispatch(&outcome);
        }
        if let Some(notes) = &self.notes {
            match &outcome {
                Ok(result) => {
                    let name = self.describe(tool_id).map(|d| d.name.as_str()).unwrap_or("unknown");
                    notes.add(
                        NoteKind::ToolExecution,
                        serde_json::json!({
                            "tool_id": tool_id,
                            "tool_name": name,
                            "inputs": inputs,
                            "result": result,
                        }),
                    );
                }
                Err(e) => {
                    notes.add(
                        NoteKind::Error,
                        serde_json::json!({
                            "error_type": e.kind(),
                            "message": e.to_string(),
                            "details": { "tool_id": tool_id, "inputs": inputs },
                        }),
                    );
                }
            }
        }

        outcome
    }

    async fn invoke_inner(&self, tool_id: &str, inputs: &ToolInputs, read_cache: bool) -> DispatchOutcome {
        let descriptor = self.registry.describe(tool_id).ok_or_else(|| DispatchError::UnknownTool {
            tool_id: tool_id.to_string(),
        })?;

        let handler = self.bindings.get(tool_id).ok_or_else(|| DispatchError::UnknownTool {
            tool_id: tool_id.to_string(),
        })?;

        let missing = descriptor.missing_inputs(inputs);
        if !missing.is_empty() {
            return Err(DispatchError::MissingInputs {
                tool_id: tool_id.to_string(),
                missing,
            });
        }

        let selected = descriptor.select_inputs(inputs);

        let cache_key = self
            .cache
            .as_ref()
            .map(|_| ToolResultCache::compute_key(tool_id, &selected));
        if let (Some(cache), Some(key), true) = (&self.cache, &cache_key, read_cache) {
            if let Some(hit) = cache.get(key).await {
                if let Some(metrics) = &self.metrics {
                    metrics.record_cache_hit();
                }
                return Ok(hit);
            }
        }

        let start = Instant::now();
        info!("Dispatching tool {} ({})", tool_id, descriptor.name);

        let result = match tokio::time::timeout(self.timeout, handler(selected)).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!("Tool {} failed: {:#}", tool_id, e);
                return Err(DispatchError::ToolExecution {
                    tool_id: tool_id.to_string(),
                    message: format!("{:#}", e),
                });
            }
            Err(_) => {
                warn!("Tool {} timed out after {:?}", tool_id, self.timeout);
                return Err(DispatchError::Timeout {
                    tool_id: tool_id.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        debug!("Tool {} finished in {}ms", tool_id, start.elapsed().as_millis());

        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            cache.set(&key, result.clone()).await;
        }

        Ok(result)
    }
}
