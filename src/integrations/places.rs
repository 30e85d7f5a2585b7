//! Google Places (v1) tools: text search, place details, nearby search

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::debug;

use super::{opt_f64, opt_str, opt_u64, required_f64, required_str};
use crate::agent::tools::ToolInputs;

const PLACES_URL: &str = "https://places.googleapis.com/v1";

const SEARCH_TEXT_FIELDS: &str = "places.displayName,places.formattedAddress,places.id,places.types";
const NEARBY_FIELDS: &str =
    "places.displayName,places.formattedAddress,places.id,places.types,places.generativeSummary,places.reviewSummary";
const DETAILS_FIELDS: &str =
    "displayName,formattedAddress,rating,reviews,generativeSummary,reviewSummary,neighborhoodSummary";

/// Google Places client
pub struct GooglePlaces {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GooglePlaces {
    pub fn new(client: reqwest::Client, api_key: &str) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            base_url: PLACES_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Request body for `places:searchText`
    pub fn search_text_body(inputs: &ToolInputs) -> Result<Value> {
        let mut body = json!({
            "textQuery": required_str(inputs, "text_query")?,
            "pageSize": opt_u64(inputs, "page_size")?.unwrap_or(10),
        });
        if let Some(bias) = inputs.get("location_bias").filter(|v| !v.is_null()) {
            body["locationBias"] = bias.clone();
        }
        if let Some(token) = opt_str(inputs, "session_token")? {
            body["sessionToken"] = json!(token);
        }
        Ok(body)
    }

    /// Request body for `places:searchNearby`
    pub fn nearby_body(inputs: &ToolInputs) -> Result<Value> {
        let mut body = json!({
            "locationRestriction": {
                "circle": {
                    "center": {
                        "latitude": required_f64(inputs, "latitude")?,
                        "longitude": required_f64(inputs, "longitude")?,
                    },
                    "radius": opt_f64(inputs, "radius")?.unwrap_or(1000.0),
                }
            },
            "maxResultCount": opt_u64(inputs, "page_size")?.unwrap_or(10),
        });
        if let Some(types) = inputs.get("types").filter(|v| v.is_array()) {
            body["includedTypes"] = types.clone();
        }
        Ok(body)
    }

    async fn post(&self, path: &str, field_mask: &str, body: &Value) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .header("X-Goog-Api-Key", &self.api_key)
            .header("X-Goog-FieldMask", field_mask)
            .json(body)
            .send()
            .await
            .context("Failed to reach Google Places")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Google Places error {}: {}", status, text);
        }

        response.json().await.context("Failed to parse Google Places response")
    }

    /// Tool 5: `{places: [...]}`
    pub async fn search_text(&self, inputs: &ToolInputs) -> Result<Value> {
        let body = Self::search_text_body(inputs)?;
        let data = self.post("places:searchText", SEARCH_TEXT_FIELDS, &body).await?;
        Ok(json!({ "places": data.get("places").cloned().unwrap_or_else(|| json!([])) }))
    }

    /// Tool 7: `{places: [...]}`
    pub async fn search_nearby(&self, inputs: &ToolInputs) -> Result<Value> {
        let body = Self::nearby_body(inputs)?;
        let data = self.post("places:searchNearby", NEARBY_FIELDS, &body).await?;
        Ok(json!({ "places": data.get("places").cloned().unwrap_or_else(|| json!([])) }))
    }

    /// Tool 6: `{place: {...}}`
    pub async fn place_details(&self, inputs: &ToolInputs) -> Result<Value> {
        let place_id = required_str(inputs, "place_id")?;
        let field_mask = opt_str(inputs, "field_mask")?.unwrap_or(DETAILS_FIELDS);
        let url = format!("{}/places/{}", self.base_url, place_id);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header("X-Goog-Api-Key", &self.api_key)
            .header("X-Goog-FieldMask", field_mask)
            .send()
            .await
            .context("Failed to reach Google Places")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Google Places error {}: {}", status, text);
        }

        let place: Value = response.json().await.context("Failed to parse Google Places response")?;
        Ok(json!({ "place": place }))
    }
}
