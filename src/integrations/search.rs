//! Google Custom Search tools and raw page fetch

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::debug;

use super::{opt_str, opt_u64, required_str};
use crate::agent::tools::ToolInputs;

const SEARCH_URL: &str = "https://www.googleapis.com/customsearch/v1";

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/113.0.0.0 Safari/537.36";

/// Google Custom Search JSON API client
pub struct GoogleSearch {
    client: reqwest::Client,
    api_key: String,
    cx: String,
    base_url: String,
}

impl GoogleSearch {
    pub fn new(client: reqwest::Client, api_key: &str, cx: &str) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            cx: cx.to_string(),
            base_url: SEARCH_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    /// Query parameters for a search, key and engine id excluded
    pub fn search_params(inputs: &ToolInputs) -> Result<Vec<(&'static str, String)>> {
        let num = opt_u64(inputs, "num")?.unwrap_or(10).clamp(1, 10);
        Ok(vec![
            ("q", required_str(inputs, "query")?.to_string()),
            ("num", num.to_string()),
            ("start", opt_u64(inputs, "start")?.unwrap_or(1).max(1).to_string()),
            ("safe", opt_str(inputs, "safe")?.unwrap_or("off").to_string()),
        ])
    }

    async fn query(&self, params: &[(&str, String)]) -> Result<Value> {
        debug!("GET {} q={:?}", self.base_url, params.first().map(|(_, v)| v));

        let response = self
            .client
            .get(&self.base_url)
            .query(&[("key", self.api_key.as_str()), ("cx", self.cx.as_str())])
            .query(params)
            .send()
            .await
            .context("Failed to reach Google Custom Search")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Google Custom Search error {}: {}", status, text);
        }

        response.json().await.context("Failed to parse Google Custom Search response")
    }

    /// Tool 9: `{items: [...]}`
    pub async fn search(&self, inputs: &ToolInputs) -> Result<Value> {
        let data = self.query(&Self::search_params(inputs)?).await?;
        Ok(json!({ "items": data.get("items").cloned().unwrap_or_else(|| json!([])) }))
    }

    /// Tool 10: `{total_results: n}`
    pub async fn total_results(&self, inputs: &ToolInputs) -> Result<Value> {
        let params = vec![
            ("q", required_str(inputs, "query")?.to_string()),
            ("num", "1".to_string()),
        ];
        let data = self.query(&params).await?;
        Ok(json!({ "total_results": total_from(&data) }))
    }
}

/// `searchInformation.totalResults` arrives as a string
fn total_from(data: &Value) -> u64 {
    match data.pointer("/searchInformation/totalResults") {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        _ => 0,
    }
}

/// Tool 11: `{url, html}`
pub async fn fetch_page(client: &reqwest::Client, inputs: &ToolInputs) -> Result<Value> {
    let url = required_str(inputs, "url")?;
    debug!("GET {}", url);

    let response = client
        .get(url)
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .send()
        .await
        .with_context(|| format!("Failed to fetch {}", url))?
        .error_for_status()
        .with_context(|| format!("Fetching {} failed", url))?;

    let html = response.text().await.context("Failed to read page body")?;
    Ok(json!({ "url": url, "html": html }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(value: Value) -> ToolInputs {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_search_params() {
        let params = GoogleSearch::search_params(&inputs(json!({"query": "seoul cafe", "num": 50}))).unwrap();
        assert_eq!(
            params,
            vec![
                ("q", "seoul cafe".to_string()),
                ("num", "10".to_string()),
                ("start", "1".to_string()),
                ("safe", "off".to_string()),
            ]
        );
        assert!(GoogleSearch::search_params(&ToolInputs::new()).is_err());
    }

    #[test]
    fn test_total_from() {
        assert_eq!(total_from(&json!({"searchInformation": {"totalResults": "12345"}})), 12345);
        assert_eq!(total_from(&json!({"searchInformation": {"totalResults": 7}})), 7);
        assert_eq!(total_from(&json!({})), 0);
    }

    #[tokio::test]
    async fn test_fetch_page_requires_url() {
        let err = fetch_page(&reqwest::Client::new(), &ToolInputs::new()).await.unwrap_err();
        assert!(err.to_string().contains("url"));
    }
}
