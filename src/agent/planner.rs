//! Iterative Plan Construction
//!
//! A plan is grown one step at a time: each iteration asks a proposal source
//! for the single next step given the purpose and the plan so far, until the
//! source reports `finished` or the iteration ceiling is hit.
//!
//! Step ids are assigned here, never by the source, so every plan carries
//! ids `1..=N` with no gaps.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::notes::{AgentNotes, NoteKind};
use super::parse;
use super::tools::{ToolInputs, ToolRegistry};
use crate::llama_worker::TextGenerator;
use crate::metrics::OrchestrationMetrics;

/// One planned tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// 1-based, assigned by [`PlanBuilder`]
    pub step_id: u32,
    pub tool_id: String,
    /// Descriptor name at proposal time
    pub tool_name: String,
    pub description: String,
    pub inputs: ToolInputs,
    /// Advisory only
    pub expected_output: String,
}

impl PlanStep {
    pub fn new(step_id: u32, tool_id: &str, tool_name: &str) -> Self {
        Self {
            step_id,
            tool_id: tool_id.to_string(),
            tool_name: tool_name.to_string(),
            description: String::new(),
            inputs: ToolInputs::new(),
            expected_output: String::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_inputs(mut self, inputs: ToolInputs) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_expected_output(mut self, expected_output: &str) -> Self {
        self.expected_output = expected_output.to_string();
        self
    }
}

/// An ordered sequence of steps for one purpose
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub purpose: String,
    pub steps: Vec<PlanStep>,
    /// Rationale notes the proposal source attached, one per iteration that had any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Plan {
    pub fn new(purpose: &str) -> Self {
        Self {
            purpose: purpose.to_string(),
            steps: Vec::new(),
            notes: Vec::new(),
        }
    }

    /// Build a plan from steps as given, keeping their ids
    pub fn from_steps(purpose: &str, steps: Vec<PlanStep>) -> Self {
        Self {
            purpose: purpose.to_string(),
            steps,
            notes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// True when ids run `1..=N` in order
    pub fn has_sequential_ids(&self) -> bool {
        self.steps
            .iter()
            .enumerate()
            .all(|(i, step)| step.step_id as usize == i + 1)
    }
}

/// Accept `"5"` or `5` for a tool id
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ToolIdRepr {
    Text(String),
    Number(i64),
}

impl ToolIdRepr {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

/// Step as proposed, before the builder assigns its id
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedStep {
    pub tool_id: String,
    pub tool_name: Option<String>,
    pub description: String,
    pub inputs: ToolInputs,
    pub expected_output: String,
}

#[derive(Debug, Deserialize)]
struct ProposedStepRepr {
    tool_id: ToolIdRepr,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    inputs: ToolInputs,
    #[serde(default)]
    expected_output: String,
}

/// A validated proposal
#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    Finished {
        notes: Option<String>,
    },
    Next {
        step: ProposedStep,
        notes: Option<String>,
    },
}

impl Proposal {
    /// Validate a raw proposal object.
    ///
    /// `finished` must be present; when it is false, `next_step` must be a
    /// non-null object with a tool id. Any `step_id` inside it is ignored.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let map = value.as_object().ok_or("proposal is not a JSON object")?;

        let finished = match map.get("finished") {
            Some(Value::Bool(b)) => *b,
            Some(other) => return Err(format!("'finished' is not a boolean: {}", other)),
            None => return Err("proposal is missing the 'finished' flag".to_string()),
        };

        let notes = map
            .get("plan_notes")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        if finished {
            return Ok(Self::Finished { notes });
        }

        let next = match map.get("next_step") {
            None | Some(Value::Null) => {
                return Err("'finished' is false but 'next_step' is missing".to_string())
            }
            Some(next) => next,
        };
        if !next.is_object() {
            return Err("'next_step' is not an object".to_string());
        }

        let repr: ProposedStepRepr =
            serde_json::from_value(next.clone()).map_err(|e| format!("invalid 'next_step': {}", e))?;

        Ok(Self::Next {
            step: ProposedStep {
                tool_id: repr.tool_id.into_string(),
                tool_name: repr.tool_name,
                description: repr.description,
                inputs: repr.inputs,
                expected_output: repr.expected_output,
            },
            notes,
        })
    }
}

/// Plan construction failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("Malformed proposal: {0}")]
    MalformedProposal(String),

    #[error("Plan did not finish within {limit} iterations")]
    IterationCeilingExceeded { limit: u32 },

    #[error("Proposal generation failed: {0}")]
    Generation(String),

    #[error("Plan construction cancelled")]
    Cancelled,
}

/// Source of next-step proposals
#[async_trait]
pub trait ProposalSource: Send + Sync {
    /// Return the raw `{finished, next_step}` object for the plan so far
    async fn propose(&self, purpose: &str, plan: &Plan) -> Result<Value, BuildError>;
}

/// Proposal source backed by a text generator
pub struct LlmProposer {
    generator: Arc<dyn TextGenerator>,
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    notes: Option<Arc<AgentNotes>>,
}

impl LlmProposer {
    pub fn new(generator: Arc<dyn TextGenerator>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            generator,
            registry,
            timeout: Duration::from_secs(60),
            notes: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_notes(mut self, notes: Arc<AgentNotes>) -> Self {
        self.notes = Some(notes);
        self
    }

    /// Prompt for the next step
    pub fn build_prompt(&self, purpose: &str, plan: &Plan) -> String {
        let current_plan = serde_json::to_string_pretty(&plan.steps).unwrap_or_else(|_| "[]".to_string());

        format!(
            r#"You are an iterative planner. Given the PURPOSE and the CURRENT_PLAN, propose ONLY the single next step to run, or mark the plan finished when no more steps are needed.

Rules:
1. Pick the most suitable tool from AVAILABLE TOOLS for the next step.
2. If more steps are needed return "finished": false with a "next_step".
3. If the plan already serves the purpose return "finished": true and "next_step": null.
4. Explain your choice briefly in "plan_notes".

Person names: if the PURPOSE or CURRENT_PLAN mentions a person's name, first collect that person's photos and tags (tool 1 get_photos_by_person or tool 2 get_people_in_photo), then use the tags (food, places) to continue with place search (5, 6, 7) or web search (9).

AVAILABLE TOOLS:
{tools}
PURPOSE: {purpose}

CURRENT_PLAN:
{current_plan}

Respond with JSON only, in this shape:
{{"finished": false, "next_step": {{"tool_id": "5", "tool_name": "gp_search_text", "description": "...", "inputs": {{"text_query": "..."}}, "expected_output": "..."}}, "plan_notes": "..."}}"#,
            tools = self.registry.render_for_prompt(),
            purpose = purpose,
            current_plan = current_plan,
        )
    }
}

#[async_trait]
impl ProposalSource for LlmProposer {
    async fn propose(&self, purpose: &str, plan: &Plan) -> Result<Value, BuildError> {
        let prompt = self.build_prompt(purpose, plan);

        let reply = match tokio::time::timeout(self.timeout, self.generator.generate(&prompt)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => return Err(BuildError::Generation(format!("{:#}", e))),
            Err(_) => {
                return Err(BuildError::Generation(format!(
                    "generator timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };

        if let Some(notes) = &self.notes {
            notes.add(
                NoteKind::ModelResponse,
                json!({
                    "model_name": self.generator.name(),
                    "role": "proposer",
                    "response": reply,
                }),
            );
        }

        parse::parse_object(&reply)
            .map(Value::Object)
            .map_err(BuildError::MalformedProposal)
    }
}

/// Plan builder configuration
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Hard ceiling on proposal iterations
    pub max_iterations: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self { max_iterations: 50 }
    }
}

/// Resolves once the flag flips to `true`; never resolves if the sender is gone
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Grows a plan from proposals
pub struct PlanBuilder {
    source: Arc<dyn ProposalSource>,
    registry: Arc<ToolRegistry>,
    config: PlannerConfig,
    notes: Option<Arc<AgentNotes>>,
    metrics: Option<Arc<OrchestrationMetrics>>,
}

impl PlanBuilder {
    pub fn new(source: Arc<dyn ProposalSource>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            source,
            registry,
            config: PlannerConfig::default(),
            notes: None,
            metrics: None,
        }
    }

    pub fn with_config(mut self, config: PlannerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_notes(mut self, notes: Arc<AgentNotes>) -> Self {
        self.notes = Some(notes);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<OrchestrationMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build a complete plan for `purpose`
    pub async fn build(&self, purpose: &str) -> Result<Plan, BuildError> {
        let (_tx, rx) = watch::channel(false);
        self.build_with_cancel(purpose, rx).await
    }

    /// Build a plan, giving up when `cancel` flips to `true`
    pub async fn build_with_cancel(
        &self,
        purpose: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Plan, BuildError> {
        let result = self.build_inner(purpose, &mut cancel).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_plan_built(result.is_ok());
        }
        if let Some(notes) = &self.notes {
            match &result {
                Ok(plan) => {
                    notes.add(NoteKind::Plan, json!({ "purpose": purpose, "steps": plan.steps }));
                }
                Err(e) => {
                    notes.add(
                        NoteKind::Error,
                        json!({ "error_type": "PlanBuild", "message": e.to_string(), "details": { "purpose": purpose } }),
                    );
                }
            }
        }

        result
    }

    async fn build_inner(
        &self,
        purpose: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Plan, BuildError> {
        let mut plan = Plan::new(purpose);
        let mut next_id: u32 = 1;

        for iteration in 1..=self.config.max_iterations {
            if *cancel.borrow() {
                info!("Plan construction cancelled before iteration {}", iteration);
                return Err(BuildError::Cancelled);
            }

            let raw = tokio::select! {
                raw = self.source.propose(purpose, &plan) => raw?,
                _ = cancelled(cancel) => {
                    info!("Plan construction cancelled during iteration {}", iteration);
                    return Err(BuildError::Cancelled);
                }
            };
            if let Some(metrics) = &self.metrics {
                metrics.record_proposal();
            }

            let proposal = Proposal::from_value(&raw).map_err(|reason| {
                warn!("Iteration {}: malformed proposal: {}", iteration, reason);
                BuildError::MalformedProposal(reason)
            })?;

            match proposal {
                Proposal::Finished { notes } => {
                    plan.notes.extend(notes);
                    info!("Plan finished after {} iterations with {} steps", iteration, plan.len());
                    return Ok(plan);
                }
                Proposal::Next { step, notes } => {
                    let descriptor = self.registry.describe(&step.tool_id).ok_or_else(|| {
                        warn!("Iteration {}: proposal names unknown tool {}", iteration, step.tool_id);
                        BuildError::MalformedProposal(format!("unknown tool id '{}'", step.tool_id))
                    })?;

                    if let Some(proposed) = &step.tool_name {
                        if proposed != &descriptor.name {
                            debug!(
                                "Proposal named tool {} '{}', catalog says '{}'",
                                step.tool_id, proposed, descriptor.name
                            );
                        }
                    }

                    debug!("Iteration {}: step {} -> tool {}", iteration, next_id, step.tool_id);
                    plan.steps.push(PlanStep {
                        step_id: next_id,
                        tool_id: step.tool_id,
                        tool_name: descriptor.name.clone(),
                        description: step.description,
                        inputs: step.inputs,
                        expected_output: step.expected_output,
                    });
                    plan.notes.extend(notes);
                    next_id += 1;
                }
            }
        }

        warn!(
            "Plan for '{}' did not finish within {} iterations",
            purpose, self.config.max_iterations
        );
        Err(BuildError::IterationCeilingExceeded {
            limit: self.config.max_iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::ToolDescriptor;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> Arc<ToolRegistry> {
        Arc::new(
            ToolRegistry::from_descriptors(vec![
                ToolDescriptor::new("5", "gp_search_text", "Text place search")
                    .with_input("text_query", "str - required. Keywords"),
                ToolDescriptor::new("9", "search", "Web search").with_input("query", "str - required"),
            ])
            .unwrap(),
        )
    }

    /// Replays canned proposals; once drained, repeats the last one
    struct Scripted {
        replies: Mutex<VecDeque<Value>>,
        last: Mutex<Option<Value>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(replies: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProposalSource for Scripted {
        async fn propose(&self, _purpose: &str, _plan: &Plan) -> Result<Value, BuildError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.replies.lock().pop_front();
            match next {
                Some(v) => {
                    *self.last.lock() = Some(v.clone());
                    Ok(v)
                }
                None => Ok(self.last.lock().clone().unwrap_or(Value::Null)),
            }
        }
    }

    fn step(tool_id: &str, step_id: i64) -> Value {
        json!({
            "finished": false,
            "next_step": {
                "step_id": step_id,
                "tool_id": tool_id,
                "tool_name": "whatever",
                "description": "look it up",
                "inputs": {"text_query": "quiet cafe"},
                "expected_output": "places"
            }
        })
    }

    #[tokio::test]
    async fn test_ids_are_reassigned() {
        let source = Scripted::new(vec![step("5", 7), step("9", 7), step("5", 99), json!({"finished": true})]);
        let builder = PlanBuilder::new(source.clone(), registry());

        let plan = builder.build("recommend a quiet cafe").await.unwrap();
        let ids: Vec<u32> = plan.steps.iter().map(|s| s.step_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(plan.has_sequential_ids());
        assert_eq!(plan.steps[0].tool_name, "gp_search_text");
        assert_eq!(plan.steps[1].tool_name, "search");
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_numeric_tool_id_accepted() {
        let source = Scripted::new(vec![
            json!({"finished": false, "next_step": {"tool_id": 5, "inputs": {}}, "plan_notes": "start broad"}),
            json!({"finished": true, "next_step": null}),
        ]);
        let plan = PlanBuilder::new(source, registry()).build("x").await.unwrap();
        assert_eq!(plan.steps[0].tool_id, "5");
        assert_eq!(plan.notes, vec!["start broad".to_string()]);
    }

    #[tokio::test]
    async fn test_iteration_ceiling() {
        let source = Scripted::new(vec![step("5", 1)]);
        let metrics = Arc::new(OrchestrationMetrics::new());
        let builder = PlanBuilder::new(source.clone(), registry())
            .with_config(PlannerConfig { max_iterations: 50 })
            .with_metrics(metrics.clone());

        let err = builder.build("never ends").await.unwrap_err();
        assert_eq!(err, BuildError::IterationCeilingExceeded { limit: 50 });
        assert_eq!(source.calls.load(Ordering::SeqCst), 50);
        assert_eq!(metrics.snapshot().plan_build_failures, 1);
    }

    #[tokio::test]
    async fn test_malformed_proposals() {
        let cases = vec![
            json!({"next_step": null}),
            json!({"finished": false}),
            json!({"finished": false, "next_step": null}),
            json!({"finished": "no"}),
            json!({"finished": false, "next_step": {"description": "no tool"}}),
            json!({"finished": false, "next_step": {"tool_id": "404"}}),
            json!([1, 2]),
        ];

        for case in cases {
            let source = Scripted::new(vec![case.clone()]);
            let err = PlanBuilder::new(source, registry()).build("x").await.unwrap_err();
            assert!(matches!(err, BuildError::MalformedProposal(_)), "case {} gave {:?}", case, err);
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let source = Scripted::new(vec![step("5", 1)]);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let err = PlanBuilder::new(source.clone(), registry())
            .build_with_cancel("x", rx)
            .await
            .unwrap_err();
        assert_eq!(err, BuildError::Cancelled);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    struct Stalled;

    #[async_trait]
    impl ProposalSource for Stalled {
        async fn propose(&self, _purpose: &str, _plan: &Plan) -> Result<Value, BuildError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_proposal() {
        let (tx, rx) = watch::channel(false);
        let builder = PlanBuilder::new(Arc::new(Stalled), registry());

        let handle = tokio::spawn(async move { builder.build_with_cancel("x", rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        assert_eq!(handle.await.unwrap(), Err(BuildError::Cancelled));
    }

    struct Echo(String);

    #[async_trait]
    impl TextGenerator for Echo {
        async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_llm_proposer_parses_wrapped_json() {
        let reply = "Sure!\n```json\n{\"finished\": true, \"next_step\": null}\n```";
        let notes = Arc::new(AgentNotes::in_memory());
        let proposer = LlmProposer::new(Arc::new(Echo(reply.into())), registry()).with_notes(notes.clone());

        let value = proposer.propose("x", &Plan::new("x")).await.unwrap();
        assert_eq!(value["finished"], true);
        assert_eq!(notes.by_kind(NoteKind::ModelResponse).len(), 1);

        let garbage = LlmProposer::new(Arc::new(Echo("no idea".into())), registry());
        assert!(matches!(
            garbage.propose("x", &Plan::new("x")).await,
            Err(BuildError::MalformedProposal(_))
        ));
    }

    #[test]
    fn test_prompt_mentions_catalog_and_plan() {
        let proposer = LlmProposer::new(Arc::new(Echo(String::new())), registry());
        let plan = Plan::from_steps("x", vec![PlanStep::new(1, "5", "gp_search_text")]);
        let prompt = proposer.build_prompt("find Jimin's favourite food", &plan);

        assert!(prompt.contains("[5] gp_search_text"));
        assert!(prompt.contains("find Jimin's favourite food"));
        assert!(prompt.contains("\"step_id\": 1"));
        assert!(prompt.contains("Person names"));
    }
}
