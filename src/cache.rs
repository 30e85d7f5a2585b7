//! Tool Result Cache
//!
//! Candidate plans for the same purpose tend to issue the same searches.
//! Results are cached under SHA256(tool_id + canonical inputs) with a TTL.

use moka::future::Cache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::agent::tools::ToolInputs;

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
}

/// Shared cache of raw tool outputs
#[derive(Clone)]
pub struct ToolResultCache {
    cache: Cache<String, Value>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    enabled: bool,
}

impl ToolResultCache {
    /// Create new cache with TTL
    pub fn new(max_entries: u64, ttl_secs: u64, enabled: bool) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self {
            cache,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            enabled,
        }
    }

    /// Key = SHA256(tool_id + "\n" + inputs as JSON).
    ///
    /// `ToolInputs` keeps keys sorted, so equal inputs always serialize the same.
    pub fn compute_key(tool_id: &str, inputs: &ToolInputs) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tool_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(Value::Object(inputs.clone()).to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }

        if let Some(value) = self.cache.get(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache HIT: {}", short_key(key));
            Some(value)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache MISS: {}", short_key(key));
            None
        }
    }

    pub async fn set(&self, key: &str, value: Value) {
        if !self.enabled {
            return;
        }

        self.cache.insert(key.to_string(), value).await;
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            entries: self.cache.entry_count(),
            hits,
            misses,
            hit_rate_percent: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }

}

fn short_key(key: &str) -> &str {
    key.get(..16).unwrap_or(key)
}
