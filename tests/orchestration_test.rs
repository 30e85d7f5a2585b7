//! Orchestration Integration Tests
//!
//! Drives plan construction and execution end to end through the public API,
//! with scripted generators and counting tools.

use async_trait::async_trait;
use parking_lot::Mutex;
use planbot::agent::{
    AgentNotes, AgentOrchestrator, Analysis, BuildError, DispatchError, ExecutionStatus, LlmAnalyzer, LlmProposer,
    NextAction, NoteKind, Plan, PlanBuilder, PlanExecutor, PlanStep, PlannerConfig, RetryPolicy, StepError,
    StepExecutor, SufficiencyAnalyzer, SufficiencyOutcome, ToolDescriptor, ToolDispatcher, ToolInputs, ToolRegistry,
};
use planbot::{OrchestrationMetrics, TextGenerator};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::watch;

fn registry() -> Arc<ToolRegistry> {
    Arc::new(
        ToolRegistry::from_descriptors(vec![
            ToolDescriptor::new("search_text", "search_text", "Text place search")
                .with_input("query", "str - required. Keywords")
                .with_output("places", "List[Dict] - places"),
            ToolDescriptor::new("details", "details", "Place details").with_input("place_id", "str - required"),
            ToolDescriptor::new("summarize", "summarize", "Summarize text").with_input("text", "str - required"),
        ])
        .expect("valid registry"),
    )
}

fn inputs(value: Value) -> ToolInputs {
    value.as_object().cloned().expect("object")
}

/// Generator that replays canned replies in order, then repeats the last one
struct ScriptedGenerator {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    prompts: AtomicUsize,
}

impl ScriptedGenerator {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            last: Mutex::new(String::new()),
            prompts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        let next = self.replies.lock().pop_front();
        match next {
            Some(reply) => {
                *self.last.lock() = reply.clone();
                Ok(reply)
            }
            None => Ok(self.last.lock().clone()),
        }
    }
}

/// Tool call counters
#[derive(Default)]
struct Calls {
    search: AtomicUsize,
    details: AtomicUsize,
    summarize: AtomicUsize,
}

fn dispatcher(calls: Arc<Calls>, search_fails: bool) -> ToolDispatcher {
    let mut dispatcher = ToolDispatcher::new(registry());

    let c = calls.clone();
    dispatcher
        .bind("search_text", move |inputs| {
            let c = c.clone();
            async move {
                c.search.fetch_add(1, Ordering::SeqCst);
                if search_fails {
                    anyhow::bail!("places backend unavailable");
                }
                Ok(json!({"places": [{"name": "Cafe Hush", "query": inputs["query"]}]}))
            }
        })
        .expect("bind search");

    let c = calls.clone();
    dispatcher
        .bind("details", move |_| {
            let c = c.clone();
            async move {
                c.details.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"place": {"rating": 4.7}}))
            }
        })
        .expect("bind details");

    dispatcher
        .bind("summarize", move |_| {
            let c = calls.clone();
            async move {
                c.summarize.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"summary": "done"}))
            }
        })
        .expect("bind summarize");

    dispatcher
}

fn search_step(id: u32, query: &str) -> PlanStep {
    PlanStep::new(id, "search_text", "search_text")
        .with_description("find candidate places")
        .with_inputs(inputs(json!({ "query": query })))
        .with_expected_output("a list of places")
}

fn executor(dispatcher: ToolDispatcher, analyzer: Arc<dyn SufficiencyAnalyzer>) -> PlanExecutor {
    PlanExecutor::new(StepExecutor::new(Arc::new(dispatcher), analyzer).with_policy(RetryPolicy::immediate(3)))
}

#[tokio::test]
async fn test_scenario_single_step_success() {
    let calls = Arc::new(Calls::default());
    let generator = ScriptedGenerator::new(&[
        r#"{"analysis": {"is_sufficient": true, "reason": "found places", "retry_count": 0, "next_action": "continue"}, "summary": "Cafe Hush is a quiet cafe"}"#,
    ]);
    let analyzer = Arc::new(LlmAnalyzer::new(generator));
    let plan = Plan::from_steps("recommend a quiet cafe", vec![search_step(1, "quiet cafe")]);

    let report = executor(dispatcher(calls.clone(), false), analyzer).execute(plan).await;

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.steps.len(), 1);
    assert!(report.error.is_none());
    assert!(!report.final_summary.is_empty());
    assert_eq!(report.final_summary, "Cafe Hush is a quiet cafe");
    assert_eq!(calls.search.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_scenario_tool_exception_halts_plan() {
    let calls = Arc::new(Calls::default());
    let generator = ScriptedGenerator::new(&[r#"{"is_sufficient": true}"#]);
    let plan = Plan::from_steps(
        "recommend a quiet cafe",
        vec![
            search_step(1, "quiet cafe"),
            PlanStep::new(2, "details", "details").with_inputs(inputs(json!({"place_id": "p1"}))),
            PlanStep::new(3, "summarize", "summarize").with_inputs(inputs(json!({"text": "x"}))),
        ],
    );

    let report = executor(dispatcher(calls.clone(), true), Arc::new(LlmAnalyzer::new(generator.clone())))
        .execute(plan)
        .await;

    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(report.steps.len(), 1);
    assert!(report.steps[0].error.is_some());
    assert!(matches!(
        report.steps[0].error,
        Some(StepError::Dispatch(DispatchError::ToolExecution { .. }))
    ));
    assert!(report.error.as_deref().unwrap_or_default().contains("places backend unavailable"));
    assert!(report.final_summary.starts_with("Execution failed at step 1"));

    // nothing ran after the fault, not even the analyzer
    assert_eq!(calls.search.load(Ordering::SeqCst), 1);
    assert_eq!(calls.details.load(Ordering::SeqCst), 0);
    assert_eq!(calls.summarize.load(Ordering::SeqCst), 0);
    assert_eq!(generator.prompts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_scenario_insufficient_twice_then_sufficient() {
    let calls = Arc::new(Calls::default());
    let generator = ScriptedGenerator::new(&[
        r#"{"is_sufficient": false, "reason": "too vague", "next_action": "retry", "next_step_input": {"query": "quiet cafe seoul"}}"#,
        r#"{"is_sufficient": false, "reason": "still vague", "next_action": "retry", "next_step_input": {"query": "quiet cafe mapo"}}"#,
        r#"{"is_sufficient": true, "reason": "good", "next_action": "continue", "summary": "three cafes in Mapo"}"#,
    ]);
    let plan = Plan::from_steps("recommend a quiet cafe", vec![search_step(1, "quiet cafe")]);

    let report = executor(dispatcher(calls.clone(), false), Arc::new(LlmAnalyzer::new(generator)))
        .execute(plan)
        .await;

    assert_eq!(calls.search.load(Ordering::SeqCst), 3);
    assert_eq!(report.steps.len(), 1);
    let step = &report.steps[0];
    assert_eq!(step.attempts, 3);
    assert_eq!(step.analysis().retry_count, 2);
    assert!(step.analysis().is_sufficient);
    assert_eq!(step.summary, "three cafes in Mapo");
    assert_eq!(step.inputs["query"], "quiet cafe mapo");
    assert_eq!(step.result.as_ref().map(|r| r["places"][0]["query"].clone()), Some(json!("quiet cafe mapo")));
}

#[tokio::test]
async fn test_scenario_iteration_ceiling() {
    let step = r#"{"finished": false, "next_step": {"step_id": 1, "tool_id": "search_text", "inputs": {"query": "cafe"}}}"#;
    let generator = ScriptedGenerator::new(&[step]);
    let proposer = LlmProposer::new(generator.clone(), registry());
    let builder = PlanBuilder::new(Arc::new(proposer), registry()).with_config(PlannerConfig { max_iterations: 50 });

    let calls = Arc::new(Calls::default());
    let orchestrator = AgentOrchestrator::new(
        builder,
        executor(dispatcher(calls.clone(), false), Arc::new(LlmAnalyzer::new(generator.clone()))),
    );

    let err = orchestrator.run("endless planning").await.unwrap_err();
    assert_eq!(err, BuildError::IterationCeilingExceeded { limit: 50 });
    assert_eq!(generator.prompts.load(Ordering::SeqCst), 50);
    // no partial plan was executed
    assert_eq!(calls.search.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_analysis_never_aborts() {
    let calls = Arc::new(Calls::default());
    let generator = ScriptedGenerator::new(&["I think it went fine!"]);
    let plan = Plan::from_steps("x", vec![search_step(1, "a"), search_step(2, "b"), search_step(3, "c")]);

    let report = executor(dispatcher(calls.clone(), false), Arc::new(LlmAnalyzer::new(generator)))
        .execute(plan)
        .await;

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.steps.len(), 3);
    assert_eq!(report.degraded_steps(), 3);
    for step in &report.steps {
        assert!(step.analysis().is_sufficient);
        assert_eq!(step.analysis().next_action, NextAction::Continue);
        assert!(matches!(step.sufficiency, SufficiencyOutcome::Degraded { .. }));
    }
    assert_eq!(calls.search.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_built_plans_have_gap_free_ids() {
    let generator = ScriptedGenerator::new(&[
        r#"{"finished": false, "next_step": {"step_id": 4, "tool_id": "search_text", "inputs": {"query": "cafe"}}}"#,
        r#"```json
{"finished": false, "next_step": {"step_id": 4, "tool_id": "details", "tool_name": "wrong", "inputs": {"place_id": "p1"}}}
```"#,
        r#"{"finished": false, "next_step": {"tool_id": "summarize", "inputs": {"text": "all of it"}}}"#,
        r#"{"finished": true, "next_step": null}"#,
    ]);
    let builder = PlanBuilder::new(Arc::new(LlmProposer::new(generator, registry())), registry());

    let plan = builder.build("recommend a quiet cafe").await.expect("plan");
    let ids: Vec<u32> = plan.steps.iter().map(|s| s.step_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(plan.steps[1].tool_name, "details");
}

#[tokio::test]
async fn test_full_run_with_notes_and_metrics() {
    let temp = TempDir::new().expect("temp dir");
    let notes = Arc::new(AgentNotes::persistent(temp.path()).expect("notes"));
    let metrics = Arc::new(OrchestrationMetrics::new());

    let generator = ScriptedGenerator::new(&[
        r#"{"finished": false, "next_step": {"tool_id": "search_text", "inputs": {"query": "quiet cafe"}}, "plan_notes": "start with search"}"#,
        r#"{"finished": true}"#,
        r#"{"is_sufficient": true, "reason": "ok", "summary": "Cafe Hush"}"#,
    ]);

    let calls = Arc::new(Calls::default());
    let dispatcher = dispatcher(calls, false).with_notes(notes.clone()).with_metrics(metrics.clone());
    let builder = PlanBuilder::new(
        Arc::new(LlmProposer::new(generator.clone(), registry()).with_notes(notes.clone())),
        registry(),
    )
    .with_notes(notes.clone())
    .with_metrics(metrics.clone());
    let executor = PlanExecutor::new(
        StepExecutor::new(Arc::new(dispatcher), Arc::new(LlmAnalyzer::new(generator).with_notes(notes.clone())))
            .with_metrics(metrics.clone()),
    )
    .with_notes(notes.clone())
    .with_metrics(metrics.clone());

    let report = AgentOrchestrator::new(builder, executor)
        .run("recommend a quiet cafe")
        .await
        .expect("report");
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.final_summary, "Cafe Hush");

    let summary = notes.session_summary();
    assert_eq!(summary.tool_executions["search_text"], 1);
    assert_eq!(summary.model_responses["scripted"], 3);
    assert_eq!(notes.by_kind(NoteKind::Plan).len(), 1);
    assert_eq!(notes.by_kind(NoteKind::Execution).len(), 1);

    let session_dir = notes.session_dir().expect("persisted").to_path_buf();
    assert!(session_dir.join("notes.json").exists());

    let snap = metrics.snapshot();
    assert_eq!(snap.plans_built, 1);
    assert_eq!(snap.proposals, 2);
    assert_eq!(snap.dispatches, 1);
    assert_eq!(snap.plans_executed, 1);
}

/// Analyzer that never answers, so a step stays in flight until cancelled
struct Hanging;

#[async_trait]
impl SufficiencyAnalyzer for Hanging {
    async fn analyze(
        &self,
        _previous: &[String],
        _step: &PlanStep,
        _raw: &Value,
    ) -> Result<SufficiencyOutcome, planbot::agent::AnalysisError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_cancellation_stops_in_flight_step() {
    let calls = Arc::new(Calls::default());
    let executor = executor(dispatcher(calls.clone(), false), Arc::new(Hanging));
    let plan = Plan::from_steps("x", vec![search_step(1, "a"), search_step(2, "b")]);
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(async move { executor.execute_with_cancel(plan, rx).await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    tx.send(true).expect("send");

    let report = handle.await.expect("join");
    assert_eq!(report.status, ExecutionStatus::Cancelled);
    assert!(report.steps.is_empty());
    assert!(report.error.is_some());
    assert_eq!(calls.search.load(Ordering::SeqCst), 1);
}

/// The first analysis is weak and stops its plan; every later one is strong
struct AlternatingAnalyzer {
    calls: AtomicUsize,
}

#[async_trait]
impl SufficiencyAnalyzer for AlternatingAnalyzer {
    async fn analyze(
        &self,
        _previous: &[String],
        _step: &PlanStep,
        _raw: &Value,
    ) -> Result<SufficiencyOutcome, planbot::agent::AnalysisError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let analysis = if n == 0 {
            Analysis::insufficient("weak").with_next_action(NextAction::Stop)
        } else {
            Analysis::sufficient("strong").with_summary("best")
        };
        Ok(SufficiencyOutcome::Judged(analysis))
    }
}

#[tokio::test]
async fn test_candidates_pick_best_report() {
    // one search step, then finished
    struct TwoStep;
    #[async_trait]
    impl planbot::agent::ProposalSource for TwoStep {
        async fn propose(&self, _purpose: &str, plan: &Plan) -> Result<Value, BuildError> {
            if plan.is_empty() {
                Ok(json!({"finished": false, "next_step": {"tool_id": "search_text", "inputs": {"query": "cafe"}}}))
            } else {
                Ok(json!({"finished": true}))
            }
        }
    }

    let calls = Arc::new(Calls::default());
    let analyzer = Arc::new(AlternatingAnalyzer {
        calls: AtomicUsize::new(0),
    });
    let executor = PlanExecutor::new(
        StepExecutor::new(Arc::new(dispatcher(calls.clone(), false)), analyzer).with_policy(RetryPolicy::immediate(1)),
    );
    let orchestrator = AgentOrchestrator::new(PlanBuilder::new(Arc::new(TwoStep), registry()), executor);

    let (_tx, rx) = watch::channel(false);
    let run = orchestrator.run_candidates("recommend a quiet cafe", 3, rx).await.expect("run");

    assert_eq!(run.candidates.len(), 3);
    assert!(run.failures.is_empty());
    let best = run.best().expect("best");
    assert_eq!(best.report.final_summary, "best");
    assert!(best.score > 1.0);
    assert_eq!(calls.search.load(Ordering::SeqCst), 3);
}

#[test]
fn test_plan_only_build_blocking() {
    struct Done;
    #[async_trait]
    impl planbot::agent::ProposalSource for Done {
        async fn propose(&self, _purpose: &str, _plan: &Plan) -> Result<Value, BuildError> {
            Ok(json!({"finished": true, "plan_notes": "nothing to do"}))
        }
    }

    let builder = PlanBuilder::new(Arc::new(Done), registry());
    let plan = tokio_test::block_on(builder.build("say hello")).expect("plan");
    assert!(plan.is_empty());
    assert_eq!(plan.notes, vec!["nothing to do".to_string()]);
}
