//! Web search tools (mock implementation).
//!
//! Stands in for a real search/fetch integration: results are deterministic
//! placeholders so the tool path can be exercised end to end without
//! outbound network access.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tools::{ToolHandler, ToolPermission, ToolSpec};

use super::{loader::Plugin, registry::PluginRegistry};

const DEFAULT_MAX_RESULTS: u64 = 5;
const MAX_RESULTS_CAP: u64 = 10;

pub struct WebSearchPlugin;

impl Plugin for WebSearchPlugin {
    fn name(&self) -> &str {
        "web_search"
    }

    fn register(&self, registry: &mut PluginRegistry) -> Result<(), String> {
        registry
            .register_tool(
                ToolSpec::new(
                    "web.search",
                    "Search the web for information on any topic.",
                    ToolPermission::Read,
                    json!({
                        "type": "object",
                        "properties": {
                            "query": { "type": "string" },
                            "max_results": { "type": "integer", "default": DEFAULT_MAX_RESULTS }
                        },
                        "required": ["query"]
                    }),
                ),
                Arc::new(SearchTool),
            )
            .map_err(|e| e.to_string())?;

        registry
            .register_tool(
                ToolSpec::new(
                    "web.fetch",
                    "Fetch content from a specific URL.",
                    ToolPermission::Read,
                    json!({
                        "type": "object",
                        "properties": { "url": { "type": "string" } },
                        "required": ["url"]
                    }),
                ),
                Arc::new(FetchTool),
            )
            .map_err(|e| e.to_string())
    }
}

struct SearchTool;

#[async_trait]
impl ToolHandler for SearchTool {
    async fn invoke(&self, args: Value) -> Result<Value, String> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or("missing 'query'")?;
        let max_results = args
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_RESULTS)
            .clamp(1, MAX_RESULTS_CAP);

        let results: Vec<Value> = (1..=max_results)
            .map(|i| {
                json!({
                    "title": format!("Result {i} for: {query}"),
                    "url": format!("https://example.com/result/{i}"),
                    "snippet": format!("This is a search result snippet for query: {query}"),
                })
            })
            .collect();

        Ok(json!({
            "query": query,
            "total_results": results.len(),
            "results": results,
        }))
    }
}

struct FetchTool;

#[async_trait]
impl ToolHandler for FetchTool {
    async fn invoke(&self, args: Value) -> Result<Value, String> {
        let url = args
            .get("url")
            .and_then(Value::as_str)
            .ok_or("missing 'url'")?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(format!("unsupported url scheme: {url}"));
        }
        // Placeholder payload; a production build wires an HTTP client here.
        Ok(json!({
            "url": url,
            "status": 200,
            "content_preview": format!("[mock] fetched {url}"),
        }))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
