//! Llama Worker - text generation backend
//!
//! The orchestration core only sees the [`TextGenerator`] trait. The default
//! implementation talks to a local Ollama server; tests substitute scripted
//! generators.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Anything that turns a prompt into text
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Short name used in notes and logs
    fn name(&self) -> &str {
        "generator"
    }

    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Llama Worker configuration
#[derive(Debug, Clone)]
pub struct LlamaWorkerConfig {
    pub ollama_url: String,
    pub model: String,
    pub temperature: f32,
    pub num_predict: u32,
    pub timeout: Duration,
}

impl Default for LlamaWorkerConfig {
    fn default() -> Self {
        Self {
            ollama_url: std::env::var("OLLAMA_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            model: std::env::var("PLANBOT_MODEL")
                .unwrap_or_else(|_| "llama3.2:3b".to_string()),
            // planning replies must stay parseable; keep sampling tight
            temperature: 0.1,
            num_predict: 1024,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Ollama generate response
#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
    #[serde(default)]
    #[allow(dead_code)]
    done: bool,
}

/// Ollama-backed text generator
pub struct LlamaWorker {
    config: LlamaWorkerConfig,
    client: reqwest::Client,
}

impl LlamaWorker {
    /// Create with custom config
    pub fn with_config(config: LlamaWorkerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &LlamaWorkerConfig {
        &self.config
    }

    /// Check if Ollama is available
    pub async fn is_available(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/tags", self.config.ollama_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn request_body(&self, prompt: &str, system: Option<&str>) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.config.temperature,
                "num_predict": self.config.num_predict,
            }
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        body
    }

    /// Generate with an optional system prompt
    pub async fn generate_with_system(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        let url = format!("{}/api/generate", self.config.ollama_url);

        let response = self
            .client
            .post(&url)
            .json(&self.request_body(prompt, system))
            .send()
            .await
            .context("Failed to send request to Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama error {}: {}", status, body);
        }

        let result: OllamaGenerateResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        debug!("Ollama returned {} chars", result.response.len());
        Ok(result.response.trim().to_string())
    }
}

#[async_trait]
impl TextGenerator for LlamaWorker {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        self.generate_with_system(prompt, None).await
    }
}
