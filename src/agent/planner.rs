//! Planner contract.
//!
//! The planner is the external decision-maker: given the conversation so
//! far and the advertised tool specs, it returns either final content or a
//! tool call.  The gateway core treats it as an opaque capability — the
//! shipped [`MockPlanner`] is deterministic and exists for development and
//! tests; production deployments plug a model-backed implementation in
//! behind the same trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::tools::ToolSpec;

// ─── Conversation turns ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    /// Synthetic turn carrying a tool result back into the history.
    /// Planner adapters that cannot accept this role must rewrite the
    /// history on their side.
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
        }
    }
}

// ─── Planner outcome ──────────────────────────────────────────────────────────

/// A single requested tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// What the planner decided: final content, or tool calls to make.
/// The engine consumes only the first call per step.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Content(String),
    ToolCalls(Vec<ToolCallRequest>),
}

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planner backend unavailable: {0}")]
    Unavailable(String),

    #[error("planner returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("planner failed: {0}")]
    Other(String),
}

impl PlannerError {
    /// Stable kind tag used in `blocked_reason` codes.
    pub fn kind(&self) -> &'static str {
        match self {
            PlannerError::Unavailable(_) => "unavailable",
            PlannerError::InvalidResponse(_) => "invalid_response",
            PlannerError::Other(_) => "other",
        }
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, messages: &[ChatTurn], tools: &[ToolSpec]) -> Result<Plan, PlannerError>;
}

// ─── MockPlanner ──────────────────────────────────────────────────────────────

/// Deterministic development planner.
///
/// A last turn of the form `tool:<name> <json-args>` produces a call to
/// that tool; anything else produces a plain content reply echoing the
/// turn.
pub struct MockPlanner;

#[async_trait]
impl Planner for MockPlanner {
    async fn plan(&self, messages: &[ChatTurn], _tools: &[ToolSpec]) -> Result<Plan, PlannerError> {
        let last = messages.last().map(|t| t.content.trim()).unwrap_or("");

        if let Some(rest) = strip_tool_prefix(last) {
            let (name, raw_args) = match rest.split_once(char::is_whitespace) {
                Some((name, args)) => (name, args.trim()),
                None => (rest, ""),
            };
            let args = if raw_args.is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(raw_args)
                    .unwrap_or_else(|_| serde_json::json!({ "text": "invalid_json_args" }))
            };
            return Ok(Plan::ToolCalls(vec![ToolCallRequest {
                name: name.to_owned(),
                args,
            }]));
        }

        Ok(Plan::Content(format!("Mock planner reply: {last}")))
    }
}

fn strip_tool_prefix(text: &str) -> Option<&str> {
    let lower = text.to_lowercase();
    lower.starts_with("tool:").then(|| text["tool:".len()..].trim())
}

// ─── Tests ────────────────────────────────────────────────────────────────────
