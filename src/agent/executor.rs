//! Plan Execution
//!
//! [`StepExecutor`] runs one step: dispatch, sufficiency analysis, and
//! in-step retries with adjusted inputs. [`PlanExecutor`] drives the steps of
//! a plan in order and applies each final analysis's `next_action`.
//!
//! Two outcome channels are kept apart:
//! - a failed dispatch (or a failed analysis call) is fatal and aborts the plan
//! - an unparseable analysis is recovered as [`SufficiencyOutcome::Degraded`]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::notes::{AgentNotes, NoteKind};
use super::parse;
use super::planner::{cancelled, Plan, PlanStep};
use super::recovery::{PlanRetryBudget, RetryPolicy};
use super::tools::{DispatchError, ToolDispatcher, ToolInputs};
use crate::llama_worker::TextGenerator;
use crate::metrics::OrchestrationMetrics;

/// What to do after a step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NextAction {
    #[default]
    Continue,
    Retry,
    Stop,
}

impl NextAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Some(Self::Continue),
            "retry" => Some(Self::Retry),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Retry => "retry",
            Self::Stop => "stop",
        }
    }
}

/// Sufficiency judgment for one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub is_sufficient: bool,
    pub reason: String,
    pub retry_count: u32,
    pub next_action: NextAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_input: Option<ToolInputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Analysis {
    pub fn sufficient(reason: &str) -> Self {
        Self {
            is_sufficient: true,
            reason: reason.to_string(),
            retry_count: 0,
            next_action: NextAction::Continue,
            next_step_input: None,
            summary: None,
        }
    }

    pub fn insufficient(reason: &str) -> Self {
        Self {
            is_sufficient: false,
            ..Self::sufficient(reason)
        }
    }

    pub fn with_next_action(mut self, next_action: NextAction) -> Self {
        self.next_action = next_action;
        self
    }

    pub fn with_next_step_input(mut self, inputs: ToolInputs) -> Self {
        self.next_step_input = Some(inputs);
        self
    }

    pub fn with_summary(mut self, summary: &str) -> Self {
        self.summary = Some(summary.to_string());
        self
    }

    /// Stand-in when the analyzer's reply cannot be read
    pub fn fallback() -> Self {
        Self::sufficient("analysis unparseable; assuming sufficient")
    }

    /// Terminal analysis attached to a fatal step failure
    pub fn failure(message: &str) -> Self {
        Self::insufficient(message).with_next_action(NextAction::Stop)
    }

    /// Read an analyzer reply object.
    ///
    /// Fields may sit at the top level or under `analysis`; missing fields
    /// take their defaults. A wrongly typed `is_sufficient` or an unknown
    /// `next_action` is an error.
    pub fn from_reply(map: &Map<String, Value>) -> Result<Self, String> {
        let inner = match map.get("analysis") {
            Some(Value::Object(inner)) => inner,
            _ => map,
        };
        let field = |key: &str| inner.get(key).or_else(|| map.get(key)).filter(|v| !v.is_null());

        let is_sufficient = match field("is_sufficient") {
            None => true,
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => true,
            Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => false,
            Some(other) => return Err(format!("'is_sufficient' is not a boolean: {}", other)),
        };

        let reason = match field("reason") {
            None => "analysis complete".to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };

        let next_action = match field("next_action") {
            None => NextAction::Continue,
            Some(Value::String(s)) => {
                NextAction::parse(s).ok_or_else(|| format!("unknown next_action '{}'", s))?
            }
            Some(other) => return Err(format!("'next_action' is not a string: {}", other)),
        };

        Ok(Self {
            is_sufficient,
            reason,
            retry_count: field("retry_count").and_then(Value::as_u64).unwrap_or(0) as u32,
            next_action,
            next_step_input: field("next_step_input").and_then(Value::as_object).cloned(),
            summary: field("summary").and_then(Value::as_str).map(str::to_string),
        })
    }
}

/// Analyzer verdict, keeping the degraded path visible
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SufficiencyOutcome {
    Judged(Analysis),
    Degraded {
        fallback: Analysis,
        raw_response: String,
        parse_error: String,
    },
}

impl SufficiencyOutcome {
    pub fn degraded(raw_response: &str, parse_error: &str) -> Self {
        Self::Degraded {
            fallback: Analysis::fallback(),
            raw_response: raw_response.to_string(),
            parse_error: parse_error.to_string(),
        }
    }

    pub fn analysis(&self) -> &Analysis {
        match self {
            Self::Judged(analysis) => analysis,
            Self::Degraded { fallback, .. } => fallback,
        }
    }

    fn analysis_mut(&mut self) -> &mut Analysis {
        match self {
            Self::Judged(analysis) => analysis,
            Self::Degraded { fallback, .. } => fallback,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// The analysis call itself failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum AnalysisError {
    #[error("Sufficiency analysis failed: {0}")]
    Generation(String),

    #[error("Sufficiency analysis timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Fatal failure of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum StepError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

/// Judges whether a raw tool result serves the step
#[async_trait]
pub trait SufficiencyAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        previous_summaries: &[String],
        step: &PlanStep,
        raw_result: &Value,
    ) -> Result<SufficiencyOutcome, AnalysisError>;
}

/// Analyzer backed by a text generator
pub struct LlmAnalyzer {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
    notes: Option<Arc<AgentNotes>>,
}

impl LlmAnalyzer {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
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

    pub fn build_prompt(previous_summaries: &[String], step: &PlanStep, raw_result: &Value) -> String {
        let mut previous = String::new();
        if !previous_summaries.is_empty() {
            previous.push_str("Previous step results:\n");
            for (i, summary) in previous_summaries.iter().enumerate() {
                previous.push_str(&format!("Step {}: {}\n", i + 1, summary));
            }
        }

        let result = serde_json::to_string_pretty(raw_result).unwrap_or_else(|_| raw_result.to_string());

        format!(
            r#"You analyze the result of one step of an execution plan and decide what happens next.
{previous}
Current step:
- step id: {step_id}
- tool: {tool_name} ({tool_id})
- description: {description}
- expected output: {expected}
- inputs: {inputs}

Result:
{result}

Decide whether the result is sufficient for this step. If it is not, suggest adjusted inputs for a retry in "next_step_input".

Respond with JSON only:
{{"analysis": {{"is_sufficient": true, "reason": "...", "retry_count": 0, "next_action": "continue|retry|stop"}}, "summary": "what we know so far", "next_step_input": {{}}}}"#,
            previous = previous,
            step_id = step.step_id,
            tool_name = step.tool_name,
            tool_id = step.tool_id,
            description = step.description,
            expected = step.expected_output,
            inputs = Value::Object(step.inputs.clone()),
            result = result,
        )
    }

    /// Turn a reply into an outcome; never fails
    pub fn parse_reply(reply: &str) -> SufficiencyOutcome {
        match parse::parse_object(reply).and_then(|map| Analysis::from_reply(&map)) {
            Ok(analysis) => SufficiencyOutcome::Judged(analysis),
            Err(e) => {
                warn!("Degraded analysis: {}", e);
                SufficiencyOutcome::degraded(reply, &e)
            }
        }
    }
}

#[async_trait]
impl SufficiencyAnalyzer for LlmAnalyzer {
    async fn analyze(
        &self,
        previous_summaries: &[String],
        step: &PlanStep,
        raw_result: &Value,
    ) -> Result<SufficiencyOutcome, AnalysisError> {
        let prompt = Self::build_prompt(previous_summaries, step, raw_result);

        let reply = match tokio::time::timeout(self.timeout, self.generator.generate(&prompt)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => return Err(AnalysisError::Generation(format!("{:#}", e))),
            Err(_) => {
                return Err(AnalysisError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        };

        if let Some(notes) = &self.notes {
            notes.add(
                NoteKind::ModelResponse,
                json!({
                    "model_name": self.generator.name(),
                    "role": "analyzer",
                    "step_id": step.step_id,
                    "response": reply,
                }),
            );
        }

        Ok(Self::parse_reply(&reply))
    }
}

/// Outcome of one step run (its final attempt)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: u32,
    pub tool_id: String,
    pub tool_name: String,
    /// Inputs of the final attempt
    pub inputs: ToolInputs,
    /// Raw tool output, `None` when dispatch failed
    pub result: Option<Value>,
    pub sufficiency: SufficiencyOutcome,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Dispatch calls made for this run
    pub attempts: u32,
}

impl StepResult {
    pub fn analysis(&self) -> &Analysis {
        self.sufficiency.analysis()
    }

    pub fn is_fatal(&self) -> bool {
        self.error.is_some()
    }

    fn completed(step: &PlanStep, result: Value, mut sufficiency: SufficiencyOutcome, attempts: u32) -> Self {
        let analysis = sufficiency.analysis_mut();
        analysis.retry_count = attempts.saturating_sub(1);
        let summary = analysis.summary.clone().unwrap_or_else(|| analysis.reason.clone());

        Self {
            step_id: step.step_id,
            tool_id: step.tool_id.clone(),
            tool_name: step.tool_name.clone(),
            inputs: step.inputs.clone(),
            result: Some(result),
            sufficiency,
            summary,
            error: None,
            attempts,
        }
    }

    fn failed(step: &PlanStep, result: Option<Value>, error: StepError, attempts: u32) -> Self {
        let message = error.to_string();
        let mut analysis = Analysis::failure(&message);
        analysis.retry_count = attempts.saturating_sub(1);

        Self {
            step_id: step.step_id,
            tool_id: step.tool_id.clone(),
            tool_name: step.tool_name.clone(),
            inputs: step.inputs.clone(),
            result,
            sufficiency: SufficiencyOutcome::Judged(analysis),
            summary: format!("Error: {}", message),
            error: Some(error),
            attempts,
        }
    }
}

/// Runs one step with bounded in-step retries
pub struct StepExecutor {
    dispatcher: Arc<ToolDispatcher>,
    analyzer: Arc<dyn SufficiencyAnalyzer>,
    policy: RetryPolicy,
    metrics: Option<Arc<OrchestrationMetrics>>,
}

impl StepExecutor {
    pub fn new(dispatcher: Arc<ToolDispatcher>, analyzer: Arc<dyn SufficiencyAnalyzer>) -> Self {
        Self {
            dispatcher,
            analyzer,
            policy: RetryPolicy::default(),
            metrics: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<OrchestrationMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace the step's inputs with the analysis's suggestion, if any
    pub fn apply_next_input(step: &mut PlanStep, analysis: &Analysis) -> bool {
        match &analysis.next_step_input {
            Some(inputs) => {
                debug!("Step {}: inputs replaced for retry", step.step_id);
                step.inputs = inputs.clone();
                true
            }
            None => {
                warn!(
                    "Step {}: retry requested without next_step_input, reusing previous inputs",
                    step.step_id
                );
                false
            }
        }
    }

    /// Run `step`, retrying in place while the analysis says the result is
    /// insufficient. Only `step.inputs` is modified.
    pub async fn execute(&self, step: &mut PlanStep, previous_summaries: &[String]) -> StepResult {
        self.run(step, previous_summaries, false).await
    }

    /// `rerun` marks a plan-level retry; its first dispatch skips the cache too.
    async fn run(&self, step: &mut PlanStep, previous_summaries: &[String], rerun: bool) -> StepResult {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if let Some(metrics) = &self.metrics {
                metrics.record_step_attempt();
            }
            debug!("Step {} attempt {}/{}", step.step_id, attempt, self.policy.max_attempts);

            let dispatched = if attempt == 1 && !rerun {
                self.dispatcher.invoke(&step.tool_id, &step.inputs).await
            } else {
                self.dispatcher.invoke_fresh(&step.tool_id, &step.inputs).await
            };
            let raw = match dispatched {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Step {} dispatch failed: {}", step.step_id, e);
                    return StepResult::failed(step, None, e.into(), attempt);
                }
            };

            let outcome = match self.analyzer.analyze(previous_summaries, step, &raw).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Step {} analysis failed: {}", step.step_id, e);
                    return StepResult::failed(step, Some(raw), e.into(), attempt);
                }
            };

            if outcome.is_degraded() {
                if let Some(metrics) = &self.metrics {
                    metrics.record_degraded_analysis();
                }
            }

            let analysis = outcome.analysis();
            if analysis.is_sufficient || !self.policy.can_retry(attempt) {
                if !analysis.is_sufficient {
                    info!(
                        "Step {} still insufficient after {} attempts, accepting last result",
                        step.step_id, attempt
                    );
                }
                return StepResult::completed(step, raw, outcome, attempt);
            }

            info!("Step {} insufficient ({}), retrying", step.step_id, analysis.reason);
            if let Some(metrics) = &self.metrics {
                metrics.record_step_retry();
            }
            Self::apply_next_input(step, analysis);

            let delay = self.policy.delay_for_attempt(attempt - 1);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// How a plan run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Every step ran
    Completed,
    /// An analysis asked to stop early
    Stopped,
    /// A step failed fatally
    Failed,
    Cancelled,
}

/// Terminal artifact of a plan run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub purpose: String,
    pub status: ExecutionStatus,
    pub steps: Vec<StepResult>,
    pub final_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Completed | ExecutionStatus::Stopped)
    }

    pub fn sufficient_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.analysis().is_sufficient).count()
    }

    pub fn degraded_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.sufficiency.is_degraded()).count()
    }

    pub fn total_attempts(&self) -> u32 {
        self.steps.iter().map(|s| s.attempts).sum()
    }
}

/// Drives a plan through [`StepExecutor`]
pub struct PlanExecutor {
    step_executor: StepExecutor,
    max_plan_retries: u32,
    notes: Option<Arc<AgentNotes>>,
    metrics: Option<Arc<OrchestrationMetrics>>,
}

impl PlanExecutor {
    pub fn new(step_executor: StepExecutor) -> Self {
        Self {
            step_executor,
            max_plan_retries: 2,
            notes: None,
            metrics: None,
        }
    }

    /// Plan-level retries allowed per step index
    pub fn with_max_plan_retries(mut self, max: u32) -> Self {
        self.max_plan_retries = max;
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

    pub async fn execute(&self, plan: Plan) -> ExecutionReport {
        let (_tx, rx) = watch::channel(false);
        self.execute_with_cancel(plan, rx).await
    }

    /// Execute `plan`; flipping `cancel` to `true` ends the run at once,
    /// dropping any in-flight step.
    pub async fn execute_with_cancel(&self, mut plan: Plan, mut cancel: watch::Receiver<bool>) -> ExecutionReport {
        let start = Instant::now();
        let mut results: Vec<StepResult> = Vec::new();
        let mut budget = PlanRetryBudget::new(self.max_plan_retries);
        let mut index = 0usize;

        info!("Executing plan for '{}' ({} steps)", plan.purpose, plan.len());

        let status = loop {
            if index >= plan.steps.len() {
                break ExecutionStatus::Completed;
            }
            if *cancel.borrow() {
                break ExecutionStatus::Cancelled;
            }

            let summaries: Vec<String> = results.iter().map(|r| r.summary.clone()).collect();
            let rerun = budget.used(index) > 0;
            let step = &mut plan.steps[index];

            let run = tokio::select! {
                result = self.step_executor.run(step, &summaries, rerun) => Some(result),
                _ = cancelled(&mut cancel) => None,
            };
            let Some(result) = run else {
                info!("Plan cancelled during step {}", plan.steps[index].step_id);
                break ExecutionStatus::Cancelled;
            };

            if result.is_fatal() {
                warn!("Step {} failed, aborting plan", result.step_id);
                results.push(result);
                break ExecutionStatus::Failed;
            }

            let action = result.analysis().next_action;
            debug!("Step {} next_action={}", result.step_id, action.as_str());

            match action {
                NextAction::Continue => index += 1,
                NextAction::Stop => {
                    info!("Step {} requested stop", result.step_id);
                    results.push(result);
                    break ExecutionStatus::Stopped;
                }
                NextAction::Retry => {
                    if budget.try_consume(index) {
                        info!(
                            "Step {} plan-level retry {}/{}",
                            result.step_id,
                            budget.used(index),
                            self.max_plan_retries
                        );
                        if let Some(metrics) = &self.metrics {
                            metrics.record_plan_retry();
                        }
                        StepExecutor::apply_next_input(&mut plan.steps[index], result.analysis());
                    } else {
                        warn!(
                            "Step {} exhausted its plan-level retries, continuing",
                            result.step_id
                        );
                        index += 1;
                    }
                }
            }
            results.push(result);
        };

        let report = Self::build_report(plan.purpose, status, results, start.elapsed());
        info!(
            "Plan finished: {:?}, {} step results, {} dispatches in {}ms",
            report.status,
            report.steps.len(),
            report.total_attempts(),
            report.duration_ms
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_execution(
                report.status == ExecutionStatus::Failed,
                report.status == ExecutionStatus::Cancelled,
            );
        }
        if let Some(notes) = &self.notes {
            notes.add(
                NoteKind::Execution,
                json!({
                    "purpose": report.purpose,
                    "status": report.status,
                    "steps": report.steps.len(),
                    "final_summary": report.final_summary,
                    "error": report.error,
                }),
            );
        }

        report
    }

    fn build_report(
        purpose: String,
        status: ExecutionStatus,
        steps: Vec<StepResult>,
        elapsed: Duration,
    ) -> ExecutionReport {
        let joined = |results: &[StepResult]| {
            results
                .iter()
                .map(|r| r.summary.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        };

        let (final_summary, error) = match status {
            ExecutionStatus::Completed | ExecutionStatus::Stopped => (joined(&steps), None),
            ExecutionStatus::Failed => {
                let (before, failed) = steps.split_at(steps.len().saturating_sub(1));
                let (step_id, message) = failed
                    .first()
                    .and_then(|r| r.error.as_ref().map(|e| (r.step_id, e.to_string())))
                    .unwrap_or((0, "unknown error".to_string()));
                let mut summary = format!("Execution failed at step {}: {}", step_id, message);
                if !before.is_empty() {
                    summary.push('\n');
                    summary.push_str(&joined(before));
                }
                (summary, Some(message))
            }
            ExecutionStatus::Cancelled => {
                let mut summary = format!("Execution cancelled after {} step results", steps.len());
                if !steps.is_empty() {
                    summary.push('\n');
                    summary.push_str(&joined(&steps));
                }
                (summary, Some("cancelled".to_string()))
            }
        };

        ExecutionReport {
            purpose,
            status,
            steps,
            final_summary,
            error,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}
