//! Built-in tools available before any plugin loads.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{
    registry::ToolRegistry,
    traits::{ToolHandler, ToolPermission, ToolSpec},
};

/// Echoes its arguments back (debug aid and smoke-test target).
struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    async fn invoke(&self, args: Value) -> Result<Value, String> {
        Ok(json!({ "echo": args }))
    }
}

/// Registry pre-populated with the built-in tool set.
pub fn builtins_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    // Registration of builtins is infallible: the registry is empty and the
    // names are static.
    let _ = registry.register(
        ToolSpec::new(
            "core.echo",
            "Echo args (debug).",
            ToolPermission::Read,
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
        ),
        Arc::new(EchoTool),
    );
    registry
}

// ─── Tests ────────────────────────────────────────────────────────────────────
