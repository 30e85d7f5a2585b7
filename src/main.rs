//! Planbot - Entry Point
//!
//! Builds a plan for the purpose given on the command line, executes it and
//! prints the execution report as JSON. Ctrl-C cancels at the next step
//! boundary.

use planbot::agent::{
    default_registry, load_catalog, AgentNotes, AgentOrchestrator, ExportFormat, LlmAnalyzer, LlmProposer,
    PlanBuilder, PlanExecutor, PlannerConfig, RetryPolicy, StepExecutor,
};
use planbot::{integrations, Config, LlamaWorker, OrchestrationMetrics, TextGenerator, ToolDispatcher, ToolResultCache};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

struct Args {
    purpose: String,
    candidates: Option<usize>,
    json_logs: bool,
    plan_only: bool,
    help: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        purpose: String::new(),
        candidates: None,
        json_logs: false,
        plan_only: false,
        help: false,
    };
    let mut words = Vec::new();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => args.help = true,
            "--json" => args.json_logs = true,
            "--plan-only" => args.plan_only = true,
            "--candidates" | "-n" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--candidates needs a value"))?;
                let n: usize = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid --candidates value: {}", value))?;
                args.candidates = Some(n.max(1));
            }
            _ => words.push(arg),
        }
    }

    args.purpose = words.join(" ");
    Ok(args)
}

fn print_help() {
    println!("Planbot v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: planbot [OPTIONS] <purpose...>");
    println!();
    println!("Options:");
    println!("  --candidates, -n N   Build and execute N candidate plans, keep the best");
    println!("  --plan-only          Print the plan without executing it");
    println!("  --json               Log as JSON lines on stderr");
    println!("  --help, -h           Show this help");
    println!();
    println!("Environment variables:");
    println!("  OLLAMA_URL                      Ollama server (default: http://localhost:11434)");
    println!("  PLANBOT_MODEL                   Generator model (default: llama3.2:3b)");
    println!("  PLANBOT_MAX_PLAN_ITERATIONS     Plan construction ceiling (default: 50)");
    println!("  PLANBOT_MAX_STEP_RETRIES        Attempts per step (default: 3)");
    println!("  PLANBOT_MAX_PLAN_RETRIES        Plan-level retries per step (default: 2)");
    println!("  PLANBOT_TOOL_TIMEOUT_SECS       Tool call timeout (default: 30)");
    println!("  PLANBOT_GENERATION_TIMEOUT_SECS Generator timeout (default: 60)");
    println!("  PLANBOT_CANDIDATES              Candidate plans (default: 1)");
    println!("  PLANBOT_CATALOG                 Custom tool catalog (TOML)");
    println!("  PLANBOT_NOTES_DIR               Persist session notes here");
    println!("  PLANBOT_CACHE_ENABLED / PLANBOT_CACHE_TTL");
    println!("  GOOGLE_API_KEY / GOOGLE_SEARCH_CX");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args = parse_args()?;
    if args.help || args.purpose.is_empty() {
        print_help();
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    // stdout carries the report; logs go to stderr
    if args.json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("Planbot v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let candidates = args.candidates.unwrap_or(config.candidates);

    let registry = match &config.catalog_path {
        Some(path) => Arc::new(load_catalog(path)?),
        None => default_registry()?,
    };

    let notes = Arc::new(match &config.notes_dir {
        Some(dir) => AgentNotes::persistent(dir)?,
        None => AgentNotes::in_memory(),
    });
    let metrics = Arc::new(OrchestrationMetrics::new());

    let worker = LlamaWorker::with_config(config.llama_worker_config())?;
    if !worker.is_available().await {
        warn!("Ollama not reachable at {}", config.ollama_url);
    }
    let generator: Arc<dyn TextGenerator> = Arc::new(worker);

    let mut dispatcher = ToolDispatcher::new(registry.clone())
        .with_timeout(config.tool_timeout)
        .with_notes(notes.clone())
        .with_metrics(metrics.clone());
    let cache = config
        .cache_enabled
        .then(|| ToolResultCache::new(1_000, config.cache_ttl_secs, true));
    if let Some(cache) = &cache {
        dispatcher = dispatcher.with_cache(cache.clone());
    }
    integrations::bind_defaults(&mut dispatcher, &config, generator.clone())?;
    let unbound = dispatcher.unbound_tools();
    if !unbound.is_empty() {
        info!("Tools without a binding: {}", unbound.join(", "));
    }

    let proposer = LlmProposer::new(generator.clone(), registry.clone())
        .with_timeout(config.generation_timeout)
        .with_notes(notes.clone());
    let builder = PlanBuilder::new(Arc::new(proposer), registry)
        .with_config(PlannerConfig {
            max_iterations: config.max_plan_iterations,
        })
        .with_notes(notes.clone())
        .with_metrics(metrics.clone());

    let analyzer = LlmAnalyzer::new(generator)
        .with_timeout(config.generation_timeout)
        .with_notes(notes.clone());
    let step_executor = StepExecutor::new(Arc::new(dispatcher), Arc::new(analyzer))
        .with_policy(RetryPolicy::default().with_max_attempts(config.max_step_retries))
        .with_metrics(metrics.clone());
    let executor = PlanExecutor::new(step_executor)
        .with_max_plan_retries(config.max_plan_retries)
        .with_notes(notes.clone())
        .with_metrics(metrics.clone());

    let orchestrator = AgentOrchestrator::new(builder, executor)
        .with_notes(notes.clone())
        .with_metrics(metrics.clone());

    if args.plan_only {
        let plan = orchestrator.plan(&args.purpose).await?;
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling");
            let _ = cancel_tx.send(true);
        }
    });

    let run = orchestrator
        .run_candidates(&args.purpose, candidates, cancel_rx)
        .await?;
    if let Some(best) = run.best() {
        if run.candidates.len() > 1 {
            info!("Candidate {} selected (score {:.2})", best.index, best.score);
        }
        println!("{}", serde_json::to_string_pretty(&best.report)?);
    }

    metrics.log_summary();
    if let Some(cache) = &cache {
        let stats = cache.stats();
        info!(
            "Tool cache: {} entries, {} hits, {} misses ({:.1}% hit rate)",
            stats.entries, stats.hits, stats.misses, stats.hit_rate_percent
        );
    }
    if notes.session_dir().is_some() {
        let path = notes.export(ExportFormat::Json)?;
        info!("Notes exported to {}", path.display());
    }

    Ok(())
}
