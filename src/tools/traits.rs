use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Permission class of a tool.  Write tools may additionally require human
/// approval depending on gateway configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPermission {
    Read,
    Write,
}

impl ToolPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolPermission::Read => "read",
            ToolPermission::Write => "write",
        }
    }
}

/// Declarative description of a tool, advertised to the planner.
///
/// Names are unique and dotted (`"namespace.op"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub permission: ToolPermission,
    /// JSON Schema object describing accepted arguments.
    #[serde(default)]
    pub args_schema: Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        permission: ToolPermission,
        args_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            permission,
            args_schema,
        }
    }
}

/// A capability the agent engine can invoke.
///
/// Handlers carry opaque argument maps; parameter validation belongs inside
/// the handler.  Implementations must be `Send + Sync` so they can live in
/// a shared `Arc<dyn ToolHandler>` registry entry.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute with the given arguments, returning a JSON result or a
    /// human-readable error string.
    async fn invoke(&self, args: Value) -> Result<Value, String>;
}
