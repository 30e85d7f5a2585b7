//! Planbot
//!
//! Plan/execute orchestration engine for a conversational planning agent.
//!
//! # Features
//!
//! - **Tool Catalog**: static TOML catalog, shared read-only registry
//! - **Typed Dispatch**: input validation, timeouts, result caching
//! - **Iterative Planning**: one proposed step per iteration, gap-free step ids
//! - **Sufficiency Analysis**: bounded in-step retries with adjusted inputs
//! - **Fail-fast Execution**: tool faults abort the plan with a structured report
//! - **Candidate Plans**: parallel plans for one purpose, best report wins
//! - **Notes**: session journal with JSON/text export
//!
//! # Architecture
//!
//! ```text
//! purpose ──► PlanBuilder ──► Plan ──► PlanExecutor ──► ExecutionReport
//!                │                          │
//!                ├── ProposalSource         ├── StepExecutor
//!                │   (LlmProposer)          │     ├── ToolDispatcher ──► tools
//!                │                          │     └── SufficiencyAnalyzer (LlmAnalyzer)
//!                └── TextGenerator (Ollama) └── AgentNotes + Metrics
//! ```

pub mod agent;
pub mod cache;
pub mod config;
pub mod integrations;
pub mod llama_worker;
pub mod metrics;

pub use agent::{
    AgentNotes, AgentOrchestrator, Analysis, BuildError, DispatchError, ExecutionReport, ExecutionStatus,
    LlmAnalyzer, LlmProposer, NextAction, Plan, PlanBuilder, PlanExecutor, PlanStep, StepExecutor, StepResult,
    SufficiencyOutcome, ToolDescriptor, ToolDispatcher, ToolRegistry,
};
pub use cache::ToolResultCache;
pub use config::{Config, ConfigError};
pub use llama_worker::{LlamaWorker, LlamaWorkerConfig, TextGenerator};
pub use metrics::{MetricsSnapshot, OrchestrationMetrics};
