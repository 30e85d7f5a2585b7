//! Configuration management

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::llama_worker::LlamaWorkerConfig;

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Ollama URL for the text generator
    pub ollama_url: String,

    /// Model used for proposals and analyses
    pub model: String,

    /// Ceiling on plan construction iterations
    pub max_plan_iterations: u32,

    /// Dispatch attempts per step run
    pub max_step_retries: u32,

    /// Plan-level retries per step index
    pub max_plan_retries: u32,

    pub tool_timeout: Duration,

    pub generation_timeout: Duration,

    /// Candidate plans per purpose
    pub candidates: usize,

    /// Custom tool catalog (embedded catalog if unset)
    pub catalog_path: Option<PathBuf>,

    /// Notes directory (in-memory notes if unset)
    pub notes_dir: Option<PathBuf>,

    /// Enable tool result caching
    pub cache_enabled: bool,

    /// Cache TTL in seconds
    pub cache_ttl_secs: u64,

    /// Google API key for Places and Custom Search
    pub google_api_key: Option<String>,

    /// Custom Search engine id
    pub google_search_cx: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            max_plan_iterations: 50,
            max_step_retries: 3,
            max_plan_retries: 2,
            tool_timeout: Duration::from_secs(30),
            generation_timeout: Duration::from_secs(60),
            candidates: 1,
            catalog_path: None,
            notes_dir: None,
            cache_enabled: true,
            cache_ttl_secs: 600,
            google_api_key: None,
            google_search_cx: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let max_plan_iterations = parse_var(&var, "PLANBOT_MAX_PLAN_ITERATIONS", defaults.max_plan_iterations)?;
        let max_step_retries = parse_var(&var, "PLANBOT_MAX_STEP_RETRIES", defaults.max_step_retries)?;
        require_positive("PLANBOT_MAX_PLAN_ITERATIONS", u64::from(max_plan_iterations))?;
        require_positive("PLANBOT_MAX_STEP_RETRIES", u64::from(max_step_retries))?;

        let tool_timeout_secs = parse_var(&var, "PLANBOT_TOOL_TIMEOUT_SECS", defaults.tool_timeout.as_secs())?;
        let generation_timeout_secs =
            parse_var(&var, "PLANBOT_GENERATION_TIMEOUT_SECS", defaults.generation_timeout.as_secs())?;
        require_positive("PLANBOT_TOOL_TIMEOUT_SECS", tool_timeout_secs)?;
        require_positive("PLANBOT_GENERATION_TIMEOUT_SECS", generation_timeout_secs)?;

        let cache_enabled = match var("PLANBOT_CACHE_ENABLED") {
            None => defaults.cache_enabled,
            Some(v) => match v.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "PLANBOT_CACHE_ENABLED".to_string(),
                        value: v,
                    })
                }
            },
        };

        Ok(Self {
            ollama_url: var("OLLAMA_URL").unwrap_or(defaults.ollama_url),
            model: var("PLANBOT_MODEL").unwrap_or(defaults.model),
            max_plan_iterations,
            max_step_retries,
            max_plan_retries: parse_var(&var, "PLANBOT_MAX_PLAN_RETRIES", defaults.max_plan_retries)?,
            tool_timeout: Duration::from_secs(tool_timeout_secs),
            generation_timeout: Duration::from_secs(generation_timeout_secs),
            candidates: parse_var(&var, "PLANBOT_CANDIDATES", defaults.candidates)?.max(1),
            catalog_path: var("PLANBOT_CATALOG").map(PathBuf::from),
            notes_dir: var("PLANBOT_NOTES_DIR").map(PathBuf::from),
            cache_enabled,
            cache_ttl_secs: parse_var(&var, "PLANBOT_CACHE_TTL", defaults.cache_ttl_secs)?,
            google_api_key: var("GOOGLE_API_KEY"),
            google_search_cx: var("GOOGLE_SEARCH_CX"),
        })
    }

    /// Generator settings derived from this config
    pub fn llama_worker_config(&self) -> LlamaWorkerConfig {
        LlamaWorkerConfig {
            ollama_url: self.ollama_url.clone(),
            model: self.model.clone(),
            timeout: self.generation_timeout,
            ..LlamaWorkerConfig::default()
        }
    }
}

fn parse_var<T, F>(var: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        }),
    }
}

fn require_positive(key: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            value: "0".to_string(),
        });
    }
    Ok(())
}
