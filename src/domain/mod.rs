//! Domain models shared across the gateway.
//!
//! Everything here is plain data: the [`Gateway`](crate::gateway::Gateway)
//! is the only component that persists these types, and the
//! [`AgentEngine`](crate::agent::AgentEngine) is the only component that
//! mutates an in-flight [`AgentRun`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── Id minting ───────────────────────────────────────────────────────────────

/// Mint a prefixed identifier, e.g. `gen_id("run")` → `"run_9f2c4a1b8d3e"`.
pub fn gen_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..12])
}

// ─── Channels ─────────────────────────────────────────────────────────────────

/// Transport family of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Webchat,
    Telegram,
    WhatsappBusiness,
    Slack,
    Discord,
}

/// Adapter-reported channel health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Offline,
    Ready,
    Error,
    RateLimited,
}

/// A registered chat channel.  Created at gateway start; status is mutated
/// by adapter heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub status: ChannelStatus,
    #[serde(default)]
    pub config: Value,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Channel {
    pub fn new(id: impl Into<String>, channel_type: ChannelType) -> Self {
        Self {
            id: id.into(),
            channel_type,
            status: ChannelStatus::Offline,
            config: Value::Object(Default::default()),
            last_seen: None,
        }
    }
}

// ─── Chats & messages ─────────────────────────────────────────────────────────

/// A conversation on a channel.  Created lazily on first inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub chat_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// An append-only chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub msg_id: String,
    pub chat_id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub metadata: Value,
}

// ─── Agent runs ───────────────────────────────────────────────────────────────

/// Lifecycle state of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    ApprovalPending,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RunStatus {
    /// String form matching the wire/database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::ApprovalPending => "approval_pending",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// One agent task instance, driven from a user prompt to a terminal status.
///
/// Created by the gateway with status [`RunStatus::Queued`]; mutated only by
/// the engine while running; persisted again by the gateway at terminal
/// state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub run_id: String,
    pub chat_id: String,
    pub channel_id: String,
    pub requested_by: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps_executed: u32,
    #[serde(default)]
    pub tools_called: Vec<String>,
    pub output_text: Option<String>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

impl AgentRun {
    /// A freshly queued run.
    pub fn queued(
        chat_id: impl Into<String>,
        channel_id: impl Into<String>,
        requested_by: impl Into<String>,
    ) -> Self {
        Self {
            run_id: gen_id("run"),
            chat_id: chat_id.into(),
            channel_id: channel_id.into(),
            requested_by: requested_by.into(),
            status: RunStatus::Queued,
            started_at: None,
            finished_at: None,
            steps_executed: 0,
            tools_called: Vec::new(),
            output_text: None,
            summary: None,
            error: None,
        }
    }
}

// ─── Events ───────────────────────────────────────────────────────────────────

/// Event families emitted on the bus and persisted to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "run.progress")]
    RunProgress,
    #[serde(rename = "run.tool_call")]
    RunToolCall,
    #[serde(rename = "run.output")]
    RunOutput,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "security.blocked")]
    SecurityBlocked,
    #[serde(rename = "message.inbound")]
    MessageInbound,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunProgress => "run.progress",
            EventType::RunToolCall => "run.tool_call",
            EventType::RunOutput => "run.output",
            EventType::RunCompleted => "run.completed",
            EventType::SecurityBlocked => "security.blocked",
            EventType::MessageInbound => "message.inbound",
        }
    }

    /// Parse the dotted wire/database form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "run.progress" => Some(EventType::RunProgress),
            "run.tool_call" => Some(EventType::RunToolCall),
            "run.output" => Some(EventType::RunOutput),
            "run.completed" => Some(EventType::RunCompleted),
            "security.blocked" => Some(EventType::SecurityBlocked),
            "message.inbound" => Some(EventType::MessageInbound),
            _ => None,
        }
    }
}

/// An ordered, append-only audit event.
///
/// `seq` is process-wide monotonic: no duplicates, no gaps within a single
/// process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub run_id: Option<String>,
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

// ─── Policy ───────────────────────────────────────────────────────────────────

/// DM / group admission stance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    Allow,
    Deny,
    AllowlistOnly,
}

/// The mutable security policy.  Deny-by-default: empty maps forbid
/// everything.  Mutated atomically via control-plane `config.set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// channel_id → allowed sender_ids.
    pub allowlist: HashMap<String, Vec<String>>,
    pub dm_policy: GatePolicy,
    pub group_policy: GatePolicy,
    /// tool name → required permission tag ("read" / "write").
    pub tool_allow: HashMap<String, String>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allowlist: HashMap::new(),
            dm_policy: GatePolicy::Allow,
            group_policy: GatePolicy::Deny,
            tool_allow: HashMap::new(),
        }
    }
}

impl Policy {
    pub fn is_allowed_sender(&self, channel_id: &str, sender_id: &str) -> bool {
        self.allowlist
            .get(channel_id)
            .is_some_and(|senders| senders.iter().any(|s| s == sender_id))
    }

    pub fn is_tool_allowed(&self, tool_name: &str) -> bool {
        self.tool_allow.contains_key(tool_name)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gen_id_has_prefix_and_length() {
        let id = gen_id("run");
        assert!(id.starts_with("run_"));
        assert_eq!(id.len(), "run_".len() + 12);
    }

    #[test]
    fn gen_id_is_unique() {
        assert_ne!(gen_id("msg"), gen_id("msg"));
    }

    #[test]
    fn event_type_round_trips() {
        for et in [
            EventType::RunProgress,
            EventType::RunToolCall,
            EventType::RunOutput,
            EventType::RunCompleted,
            EventType::SecurityBlocked,
            EventType::MessageInbound,
        ] {
            assert_eq!(EventType::parse(et.as_str()), Some(et));
        }
        assert_eq!(EventType::parse("bogus"), None);
    }

    #[test]
    fn run_status_serde_is_snake_case() {
        let s = serde_json::to_string(&RunStatus::ApprovalPending).unwrap();
        assert_eq!(s, "\"approval_pending\"");
    }

    #[test]
    fn default_policy_denies_everything() {
        let p = Policy::default();
        assert!(!p.is_allowed_sender("ch1", "u1"));
        assert!(!p.is_tool_allowed("core.echo"));
    }

    #[test]
    fn allowlisted_sender_is_allowed() {
        let mut p = Policy::default();
        p.allowlist.insert("ch1".into(), vec!["u1".into()]);
        assert!(p.is_allowed_sender("ch1", "u1"));
        assert!(!p.is_allowed_sender("ch1", "u2"));
        assert!(!p.is_allowed_sender("ch2", "u1"));
    }
}
