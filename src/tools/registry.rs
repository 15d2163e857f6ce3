use std::{collections::HashMap, sync::Arc};

use thiserror::Error;

use super::traits::{ToolHandler, ToolSpec};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool already registered: {0}")]
    DuplicateTool(String),
}

/// A registered tool: its advertised spec plus the handler that executes it.
#[derive(Clone)]
pub struct Tool {
    pub spec: ToolSpec,
    pub handler: Arc<dyn ToolHandler>,
}

/// Central name → tool mapping.
///
/// Registration happens once during startup (builtins, then plugins); after
/// that the registry is shared read-only as `Arc<ToolRegistry>`.
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.  Duplicate names fail loudly — silently shadowing a
    /// tool would let a plugin swap the handler behind an allowlisted name.
    pub fn register(
        &mut self,
        spec: ToolSpec,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), RegistryError> {
        if self.tools.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateTool(spec.name));
        }
        self.tools.insert(spec.name.clone(), Tool { spec, handler });
        Ok(())
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Tool> {
        self.tools.get(name).cloned()
    }

    /// Enumerate specs for the planner.
    pub fn list_specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::traits::ToolPermission;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    struct NoopTool;

    #[async_trait]
    impl ToolHandler for NoopTool {
        async fn invoke(&self, _args: Value) -> Result<Value, String> {
            Ok(json!({ "ok": true }))
        }
    }

    fn spec(name: &str) -> ToolSpec {
        ToolSpec::new(name, "a test tool", ToolPermission::Read, json!({"type": "object"}))
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(spec("ns.op"), Arc::new(NoopTool)).unwrap();
        assert!(reg.get("ns.op").is_some());
        assert!(reg.get("ns.other").is_none());
    }

    #[test]
    fn duplicate_registration_fails_loudly() {
        let mut reg = ToolRegistry::new();
        reg.register(spec("ns.op"), Arc::new(NoopTool)).unwrap();
        let err = reg.register(spec("ns.op"), Arc::new(NoopTool)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTool(name) if name == "ns.op"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn list_specs_is_sorted_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(spec("b.op"), Arc::new(NoopTool)).unwrap();
        reg.register(spec("a.op"), Arc::new(NoopTool)).unwrap();
        let names: Vec<String> = reg.list_specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a.op", "b.op"]);
    }

    #[tokio::test]
    async fn handler_is_invocable_through_registry() {
        let mut reg = ToolRegistry::new();
        reg.register(spec("ns.op"), Arc::new(NoopTool)).unwrap();
        let tool = reg.get("ns.op").unwrap();
        let out = tool.handler.invoke(json!({})).await.unwrap();
        assert_eq!(out["ok"], true);
    }
}
