//! Concrete tools bound to the default catalog
//!
//! - Google Places: text search (5), place details (6), nearby search (7)
//! - Google Custom Search: search (9), total results (10)
//! - Page fetch (11)
//! - Generator-backed message tools: input check (19), query maker (20),
//!   filter words (21)
//! - Generator-backed text tools: summarize (24), generate (25, 26)
//!
//! Person and photo lookups need a document store and stay unbound, as does
//! the site mirror (12).

pub mod places;
pub mod search;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::agent::catalog::ids;
use crate::agent::parse;
use crate::agent::tools::{ToolDispatcher, ToolInputs};
use crate::config::Config;
use crate::llama_worker::TextGenerator;

pub use places::GooglePlaces;
pub use search::GoogleSearch;

pub(crate) fn required_str<'a>(inputs: &'a ToolInputs, key: &str) -> Result<&'a str> {
    match inputs.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => anyhow::bail!("input '{}' must be a string, got {}", key, other),
        None => anyhow::bail!("missing input '{}'", key),
    }
}

pub(crate) fn opt_str<'a>(inputs: &'a ToolInputs, key: &str) -> Result<Option<&'a str>> {
    match inputs.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => anyhow::bail!("input '{}' must be a string, got {}", key, other),
    }
}

/// Numbers may arrive as JSON numbers or numeric strings
fn as_f64(key: &str, value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n.as_f64().with_context(|| format!("input '{}' is not a finite number", key)),
        Value::String(s) => s
            .trim()
            .parse()
            .with_context(|| format!("input '{}' is not a number: {:?}", key, s)),
        other => anyhow::bail!("input '{}' must be a number, got {}", key, other),
    }
}

pub(crate) fn required_f64(inputs: &ToolInputs, key: &str) -> Result<f64> {
    let value = inputs.get(key).with_context(|| format!("missing input '{}'", key))?;
    as_f64(key, value)
}

pub(crate) fn opt_f64(inputs: &ToolInputs, key: &str) -> Result<Option<f64>> {
    match inputs.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => as_f64(key, value).map(Some),
    }
}

pub(crate) fn opt_u64(inputs: &ToolInputs, key: &str) -> Result<Option<u64>> {
    match opt_f64(inputs, key)? {
        None => Ok(None),
        Some(n) if n >= 0.0 => Ok(Some(n as u64)),
        Some(n) => anyhow::bail!("input '{}' must not be negative, got {}", key, n),
    }
}

fn with_system(prompt: &str, system: Option<&str>) -> String {
    match system {
        Some(system) => format!("{}\n\n{}", system, prompt),
        None => prompt.to_string(),
    }
}

const INPUT_CHECK_PROMPT: &str = "You screen messages for a travel assistant that recommends places, \
food, cafes, activities, regions and travel courses. Greetings are fine too. \
Decide whether the message fits that purpose.
Respond with JSON only: {\"is_valid\": true}";

const QUERY_MAKER_PROMPT: &str = "Write web search queries that cover the request below from as many \
angles as possible (places, food, cafes, activities).
Respond with JSON only: {\"queries\": [\"...\"]}";

const FILTER_PROMPT: &str = "Extract at most 3 filter words from the message below: the key terms that \
narrow a place search (region, kind of place, mood).
Respond with JSON only: {\"filter_words\": [\"...\"]}";

const MAX_FILTER_WORDS: usize = 3;

async fn ask_json(generator: &dyn TextGenerator, instruction: &str, message: &str) -> Result<Map<String, Value>> {
    let reply = generator
        .generate(&format!("{}\n\nMessage: {}", instruction, message))
        .await?;
    parse::parse_object(&reply).map_err(|e| anyhow::anyhow!("unusable reply from {}: {}", generator.name(), e))
}

fn string_list(reply: &Map<String, Value>, key: &str) -> Result<Vec<String>> {
    match reply.get(key) {
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(|item| item.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()),
        Some(other) => anyhow::bail!("'{}' must be a list, got {}", key, other),
        None => anyhow::bail!("reply has no '{}'", key),
    }
}

/// Tool 19: `{is_valid}`. An unusable reply counts as invalid.
pub async fn check_input(generator: &dyn TextGenerator, inputs: &ToolInputs) -> Result<Value> {
    let message = required_str(inputs, "user_message")?;
    let is_valid = match ask_json(generator, INPUT_CHECK_PROMPT, message).await {
        Ok(reply) => match reply.get("is_valid") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
            _ => false,
        },
        Err(e) => {
            warn!("Input check failed, treating message as invalid: {:#}", e);
            false
        }
    };
    Ok(json!({ "is_valid": is_valid }))
}

/// Tool 20: `{queries}`
pub async fn make_queries(generator: &dyn TextGenerator, inputs: &ToolInputs) -> Result<Value> {
    let message = required_str(inputs, "user_message")?;
    let reply = ask_json(generator, QUERY_MAKER_PROMPT, message).await?;
    Ok(json!({ "queries": string_list(&reply, "queries")? }))
}

/// Tool 21: `{filter_words}`, at most three
pub async fn filter_words(generator: &dyn TextGenerator, inputs: &ToolInputs) -> Result<Value> {
    let message = required_str(inputs, "user_message")?;
    let reply = ask_json(generator, FILTER_PROMPT, message).await?;
    let mut words = string_list(&reply, "filter_words")?;
    words.truncate(MAX_FILTER_WORDS);
    Ok(json!({ "filter_words": words }))
}

/// Tool 24
pub async fn summarize(generator: &dyn TextGenerator, inputs: &ToolInputs) -> Result<Value> {
    let text = required_str(inputs, "text")?;
    let prompt = format!("Summarize the following text concisely:\n\n{}", text);
    let summary = generator.generate(&prompt).await?;
    Ok(json!({ "summary": summary }))
}

/// Tools 25 and 26
pub async fn generate(generator: &dyn TextGenerator, inputs: &ToolInputs) -> Result<Value> {
    let prompt = required_str(inputs, "prompt")?;
    let system = opt_str(inputs, "system_prompt")?;
    let prompt = match opt_str(inputs, "context")? {
        Some(context) => format!("Context:\n{}\n\nQuestion:\n{}", context, prompt),
        None => prompt.to_string(),
    };
    let response = generator.generate(&with_system(&prompt, system)).await?;
    Ok(json!({ "response": response }))
}

/// Bind every tool that `config` has credentials for; returns the bound ids
pub fn bind_defaults(
    dispatcher: &mut ToolDispatcher,
    config: &Config,
    generator: Arc<dyn TextGenerator>,
) -> Result<Vec<&'static str>> {
    let client = reqwest::Client::builder()
        .timeout(config.tool_timeout)
        .build()
        .context("Failed to create HTTP client")?;
    let mut bound = Vec::new();

    match &config.google_api_key {
        Some(key) => {
            let places = Arc::new(GooglePlaces::new(client.clone(), key));

            let p = places.clone();
            dispatcher.bind(ids::PLACES_SEARCH_TEXT, move |inputs| {
                let p = p.clone();
                async move { p.search_text(&inputs).await }
            })?;
            let p = places.clone();
            dispatcher.bind(ids::PLACES_DETAILS, move |inputs| {
                let p = p.clone();
                async move { p.place_details(&inputs).await }
            })?;
            let p = places;
            dispatcher.bind(ids::PLACES_NEARBY, move |inputs| {
                let p = p.clone();
                async move { p.search_nearby(&inputs).await }
            })?;
            bound.extend([ids::PLACES_SEARCH_TEXT, ids::PLACES_DETAILS, ids::PLACES_NEARBY]);
        }
        None => warn!("GOOGLE_API_KEY not set, Google Places tools unbound"),
    }

    match (&config.google_api_key, &config.google_search_cx) {
        (Some(key), Some(cx)) => {
            let search = Arc::new(GoogleSearch::new(client.clone(), key, cx));

            let s = search.clone();
            dispatcher.bind(ids::WEB_SEARCH, move |inputs| {
                let s = s.clone();
                async move { s.search(&inputs).await }
            })?;
            let s = search;
            dispatcher.bind(ids::WEB_TOTAL_RESULTS, move |inputs| {
                let s = s.clone();
                async move { s.total_results(&inputs).await }
            })?;
            bound.extend([ids::WEB_SEARCH, ids::WEB_TOTAL_RESULTS]);
        }
        _ => warn!("GOOGLE_API_KEY or GOOGLE_SEARCH_CX not set, web search tools unbound"),
    }

    let c = client;
    dispatcher.bind(ids::PAGE_CONTENT, move |inputs| {
        let c = c.clone();
        async move { search::fetch_page(&c, &inputs).await }
    })?;
    bound.push(ids::PAGE_CONTENT);

    let g = generator.clone();
    dispatcher.bind(ids::INPUT_CHECKER, move |inputs| {
        let g = g.clone();
        async move { check_input(g.as_ref(), &inputs).await }
    })?;
    let g = generator.clone();
    dispatcher.bind(ids::QUERY_MAKER, move |inputs| {
        let g = g.clone();
        async move { make_queries(g.as_ref(), &inputs).await }
    })?;
    let g = generator.clone();
    dispatcher.bind(ids::FILTER_GENERATOR, move |inputs| {
        let g = g.clone();
        async move { filter_words(g.as_ref(), &inputs).await }
    })?;
    bound.extend([ids::INPUT_CHECKER, ids::QUERY_MAKER, ids::FILTER_GENERATOR]);

    let g = generator.clone();
    dispatcher.bind(ids::SUMMARIZE, move |inputs| {
        let g = g.clone();
        async move { summarize(g.as_ref(), &inputs).await }
    })?;
    for id in [ids::GENERATE, ids::GENERATE_WITH_CONTEXT] {
        let g = generator.clone();
        dispatcher.bind(id, move |inputs| {
            let g = g.clone();
            async move { generate(g.as_ref(), &inputs).await }
        })?;
    }
    bound.extend([ids::SUMMARIZE, ids::GENERATE, ids::GENERATE_WITH_CONTEXT]);

    info!("Bound {} tools", bound.len());
    Ok(bound)
}
