//! Plan Orchestration
//!
//! Ties plan construction and execution together for a purpose. Several
//! candidate plans for the same purpose can be built and executed in
//! parallel tasks; each owns its plan and results, and the best-scoring
//! report wins.

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use super::executor::{ExecutionReport, ExecutionStatus, PlanExecutor};
use super::notes::{AgentNotes, NoteKind};
use super::planner::{BuildError, Plan, PlanBuilder};
use crate::metrics::OrchestrationMetrics;

/// Penalty per degraded analysis when scoring
const DEGRADED_PENALTY: f64 = 0.1;
/// Bonus for running every step without an early stop
const COMPLETION_BONUS: f64 = 0.2;

/// Score a report; higher is better, failed and cancelled runs score 0
pub fn score_report(report: &ExecutionReport) -> f64 {
    match report.status {
        ExecutionStatus::Failed | ExecutionStatus::Cancelled => 0.0,
        ExecutionStatus::Completed | ExecutionStatus::Stopped => {
            let share = if report.steps.is_empty() {
                0.0
            } else {
                report.sufficient_steps() as f64 / report.steps.len() as f64
            };
            let bonus = if report.status == ExecutionStatus::Completed {
                COMPLETION_BONUS
            } else {
                0.0
            };
            (share - DEGRADED_PENALTY * report.degraded_steps() as f64 + bonus).max(0.0)
        }
    }
}

/// One executed candidate plan
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub index: usize,
    pub plan: Plan,
    pub report: ExecutionReport,
    pub score: f64,
}

/// Result of a candidate run
#[derive(Debug, Clone, Serialize)]
pub struct CandidateRun {
    pub candidates: Vec<Candidate>,
    /// Candidates whose plan could not be built: (index, error)
    pub failures: Vec<(usize, String)>,
    /// Position of the winner in `candidates`
    pub best: usize,
}

impl CandidateRun {
    pub fn best(&self) -> Option<&Candidate> {
        self.candidates.get(self.best)
    }
}

/// Builds and executes plans for a purpose
pub struct AgentOrchestrator {
    builder: Arc<PlanBuilder>,
    executor: Arc<PlanExecutor>,
    notes: Option<Arc<AgentNotes>>,
    metrics: Option<Arc<OrchestrationMetrics>>,
}

impl AgentOrchestrator {
    pub fn new(builder: PlanBuilder, executor: PlanExecutor) -> Self {
        Self {
            builder: Arc::new(builder),
            executor: Arc::new(executor),
            notes: None,
            metrics: None,
        }
    }

    pub fn with_notes(mut self, notes: Arc<AgentNotes>) -> Self {
        self.notes = Some(notes);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<OrchestrationMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build a plan without executing it
    pub async fn plan(&self, purpose: &str) -> Result<Plan, BuildError> {
        self.builder.build(purpose).await
    }

    /// Build and execute one plan
    pub async fn run(&self, purpose: &str) -> Result<ExecutionReport, BuildError> {
        let (_tx, rx) = watch::channel(false);
        self.run_with_cancel(purpose, rx).await
    }

    pub async fn run_with_cancel(
        &self,
        purpose: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<ExecutionReport, BuildError> {
        let plan = self.builder.build_with_cancel(purpose, cancel.clone()).await?;
        Ok(self.executor.execute_with_cancel(plan, cancel).await)
    }

    /// Build and execute `n` independent plans in parallel and pick the best.
    ///
    /// Fails only when no candidate produced a plan; the first build error is
    /// returned in that case.
    pub async fn run_candidates(
        &self,
        purpose: &str,
        n: usize,
        cancel: watch::Receiver<bool>,
    ) -> Result<CandidateRun, BuildError> {
        let n = n.max(1);
        info!("Running {} candidate plans for '{}'", n, purpose);

        let handles: Vec<_> = (0..n)
            .map(|index| {
                let builder = self.builder.clone();
                let executor = self.executor.clone();
                let purpose = purpose.to_string();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let plan = builder.build_with_cancel(&purpose, cancel.clone()).await?;
                    let report = executor.execute_with_cancel(plan.clone(), cancel).await;
                    Ok::<_, BuildError>((index, plan, report))
                })
            })
            .collect();

        let mut candidates = Vec::new();
        let mut failures = Vec::new();
        let mut first_error = None;

        for (index, joined) in join_all(handles).await.into_iter().enumerate() {
            let outcome = joined.unwrap_or_else(|e| {
                Err(BuildError::Generation(format!("candidate task {} aborted: {}", index, e)))
            });
            match outcome {
                Ok((index, plan, report)) => {
                    let score = score_report(&report);
                    info!("Candidate {} scored {:.2} ({:?})", index, score, report.status);
                    candidates.push(Candidate {
                        index,
                        plan,
                        report,
                        score,
                    });
                }
                Err(e) => {
                    warn!("Candidate {} produced no plan: {}", index, e);
                    failures.push((index, e.to_string()));
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if candidates.is_empty() {
            return Err(first_error.unwrap_or(BuildError::Cancelled));
        }

        let best = candidates
            .iter()
            .enumerate()
            .fold(0, |best, (i, c)| if c.score > candidates[best].score { i } else { best });

        if let Some(notes) = &self.notes {
            notes.add(
                NoteKind::Summary,
                json!({
                    "purpose": purpose,
                    "best_candidate": candidates[best].index,
                    "scores": candidates.iter().map(|c| json!({"index": c.index, "score": c.score})).collect::<Vec<_>>(),
                    "failures": failures.len(),
                }),
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.log_summary();
        }

        Ok(CandidateRun {
            candidates,
            failures,
            best,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::executor::{Analysis, SufficiencyOutcome, StepResult};
    use crate::agent::planner::PlanStep;
    use crate::agent::tools::ToolInputs;

    fn step_result(id: u32, outcome: SufficiencyOutcome) -> StepResult {
        StepResult {
            step_id: id,
            tool_id: "5".into(),
            tool_name: "gp_search_text".into(),
            inputs: ToolInputs::new(),
            result: Some(serde_json::json!([])),
            sufficiency: outcome,
            summary: String::new(),
            error: None,
            attempts: 1,
        }
    }

    fn report(status: ExecutionStatus, steps: Vec<StepResult>) -> ExecutionReport {
        ExecutionReport {
            purpose: "x".into(),
            status,
            steps,
            final_summary: String::new(),
            error: None,
            duration_ms: 0,
        }
    }

    #[test]
    fn test_score_report() {
        let good = SufficiencyOutcome::Judged(Analysis::sufficient("ok"));
        let bad = SufficiencyOutcome::Judged(Analysis::insufficient("meh"));
        let degraded = SufficiencyOutcome::degraded("??", "no JSON object in response");

        let complete = report(ExecutionStatus::Completed, vec![step_result(1, good.clone()), step_result(2, good.clone())]);
        assert!((score_report(&complete) - 1.2).abs() < 1e-9);

        let half = report(ExecutionStatus::Stopped, vec![step_result(1, good.clone()), step_result(2, bad)]);
        assert!((score_report(&half) - 0.5).abs() < 1e-9);

        let with_degraded = report(ExecutionStatus::Completed, vec![step_result(1, good.clone()), step_result(2, degraded)]);
        assert!((score_report(&with_degraded) - 1.1).abs() < 1e-9);

        let failed = report(ExecutionStatus::Failed, vec![step_result(1, good)]);
        assert_eq!(score_report(&failed), 0.0);
    }

    #[test]
    fn test_best_accessor() {
        let plan = Plan::from_steps("x", vec![PlanStep::new(1, "5", "gp_search_text")]);
        let run = CandidateRun {
            candidates: vec![Candidate {
                index: 3,
                plan,
                report: report(ExecutionStatus::Completed, vec![]),
                score: 0.2,
            }],
            failures: vec![(0, "Malformed proposal: x".into())],
            best: 0,
        };
        assert_eq!(run.best().unwrap().index, 3);
    }
}
