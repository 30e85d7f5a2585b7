//! Plan/Execute Orchestration
//!
//! Turns a free-form purpose into a bounded sequence of tool invocations:
//! - Tool catalog and typed dispatch (`tools`, `catalog`)
//! - Iterative plan construction (`planner`)
//! - Step execution with sufficiency analysis and retries (`executor`, `recovery`)
//! - Parallel candidate plans (`orchestrator`)
//! - Session journal (`notes`)
//!
//! Flow: purpose → PlanBuilder → Plan → PlanExecutor → StepExecutor → ToolDispatcher → tool

pub mod catalog;
pub mod executor;
pub mod notes;
pub mod orchestrator;
pub mod parse;
pub mod planner;
pub mod recovery;
pub mod tools;

pub use catalog::{default_registry, load_catalog, parse_catalog, CatalogError};
pub use executor::{
    Analysis, AnalysisError, ExecutionReport, ExecutionStatus, LlmAnalyzer, NextAction, PlanExecutor,
    StepError, StepExecutor, StepResult, SufficiencyAnalyzer, SufficiencyOutcome,
};
pub use notes::{AgentNotes, ExportFormat, Note, NoteKind, SessionSummary};
pub use orchestrator::{score_report, AgentOrchestrator, Candidate, CandidateRun};
pub use planner::{BuildError, LlmProposer, Plan, PlanBuilder, PlanStep, PlannerConfig, Proposal, ProposalSource};
pub use recovery::{PlanRetryBudget, RetryPolicy, MAX_RETRIES};
pub use tools::{
    DispatchError, DispatchOutcome, InputSpec, ToolDescriptor, ToolDispatcher, ToolHandler, ToolInputs,
    ToolRegistry,
};
