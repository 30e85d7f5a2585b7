//! Static tool catalog
//!
//! The catalog is a TOML table of `[[tool]]` entries. The embedded default is
//! parsed once per process and shared as an immutable `Arc<ToolRegistry>`.

use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::tools::{InputSpec, ToolDescriptor, ToolRegistry};

/// The catalog shipped with the binary
pub const DEFAULT_CATALOG: &str = include_str!("catalog.toml");

/// Well-known ids in the default catalog
pub mod ids {
    pub const PHOTOS_BY_PERSON: &str = "1";
    pub const PEOPLE_IN_PHOTO: &str = "2";
    pub const PLACES_SEARCH_TEXT: &str = "5";
    pub const PLACES_DETAILS: &str = "6";
    pub const PLACES_NEARBY: &str = "7";
    pub const WEB_SEARCH: &str = "9";
    pub const WEB_TOTAL_RESULTS: &str = "10";
    pub const PAGE_CONTENT: &str = "11";
    pub const SITE_DOWNLOAD: &str = "12";
    pub const ALL_PEOPLE: &str = "17";
    pub const INPUT_CHECKER: &str = "19";
    pub const QUERY_MAKER: &str = "20";
    pub const FILTER_GENERATOR: &str = "21";
    pub const SUMMARIZE: &str = "24";
    pub const GENERATE: &str = "25";
    pub const GENERATE_WITH_CONTEXT: &str = "26";
}

static DEFAULT_REGISTRY: OnceCell<Arc<ToolRegistry>> = OnceCell::new();

/// Errors loading a catalog
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to read catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Duplicate tool id in catalog: {0}")]
    Duplicate(String),

    #[error("Catalog defines no tools")]
    Empty,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    tool: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    tool_id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    inputs: BTreeMap<String, String>,
    #[serde(default)]
    outputs: BTreeMap<String, String>,
}

impl From<CatalogEntry> for ToolDescriptor {
    fn from(entry: CatalogEntry) -> Self {
        Self {
            tool_id: entry.tool_id,
            name: entry.name,
            description: entry.description,
            inputs: entry
                .inputs
                .iter()
                .map(|(name, spec)| (name.clone(), InputSpec::parse(spec)))
                .collect(),
            outputs: entry.outputs,
        }
    }
}

/// Parse a catalog document
pub fn parse_catalog(text: &str) -> Result<ToolRegistry, CatalogError> {
    let file: CatalogFile = toml::from_str(text)?;
    if file.tool.is_empty() {
        return Err(CatalogError::Empty);
    }
    ToolRegistry::from_descriptors(file.tool.into_iter().map(ToolDescriptor::from))
}

/// Load a catalog from disk
pub fn load_catalog(path: &Path) -> Result<ToolRegistry, CatalogError> {
    let text = std::fs::read_to_string(path)?;
    let registry = parse_catalog(&text)?;
    info!("Loaded {} tools from {}", registry.len(), path.display());
    Ok(registry)
}

/// The process-wide snapshot of the embedded catalog
pub fn default_registry() -> Result<Arc<ToolRegistry>, CatalogError> {
    DEFAULT_REGISTRY
        .get_or_try_init(|| parse_catalog(DEFAULT_CATALOG).map(Arc::new))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_parses() {
        let registry = default_registry().unwrap();
        assert_eq!(registry.len(), 20);
        let listed: Vec<&str> = registry.list().iter().map(|d| d.tool_id.as_str()).collect();
        assert_eq!(
            listed,
            vec!["1", "2", "3", "4", "5", "6", "7", "9", "10", "11", "12", "16", "17", "18", "19", "20", "21", "24", "25", "26"]
        );
        assert_eq!(registry.describe(ids::QUERY_MAKER).unwrap().name, "query_maker");

        let search = registry.describe(ids::PLACES_SEARCH_TEXT).unwrap();
        assert_eq!(search.name, "gp_search_text");
        let required: Vec<&str> = search.required_inputs().collect();
        assert_eq!(required, vec!["text_query"]);

        let people = registry.describe(ids::ALL_PEOPLE).unwrap();
        assert!(people.inputs.is_empty());
    }

    #[test]
    fn test_default_registry_is_shared() {
        let a = default_registry().unwrap();
        let b = default_registry().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_empty_catalog_rejected() {
        assert!(matches!(parse_catalog(""), Err(CatalogError::Empty)));
    }

    #[test]
    fn test_duplicate_in_document() {
        let text = r#"
[[tool]]
tool_id = "1"
name = "a"

[[tool]]
tool_id = "1"
name = "b"
"#;
        assert!(matches!(parse_catalog(text), Err(CatalogError::Duplicate(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.toml");
        std::fs::write(
            &path,
            "[[tool]]\ntool_id = \"search_text\"\nname = \"search_text\"\n[tool.inputs]\nquery = \"str - keywords\"\n",
        )
        .unwrap();

        let registry = load_catalog(&path).unwrap();
        assert!(registry.describe("search_text").unwrap().inputs["query"].required);
    }
}
