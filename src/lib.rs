//! Secure agent orchestration gateway.
//!
//! A single-authority process that receives user messages through chat
//! channels, drives a bounded tool-using agent loop per request, enforces
//! policy and human approval on tool calls, and streams ordered progress
//! events to subscribed clients over a WebSocket control plane.

pub mod agent;
pub mod bus;
pub mod channels;
pub mod config;
pub mod domain;
pub mod gateway;
pub mod observability;
pub mod persistence;
pub mod plugins;
pub mod security;
pub mod server;
pub mod tools;

/// Convenience re-exports for the most commonly used types.
///
/// ```rust
/// use agw::prelude::*;
/// ```
pub mod prelude {
    pub use crate::agent::{AgentEngine, ChatTurn, EngineConfig, MockPlanner, Plan, Planner};
    pub use crate::bus::{EventBus, Subscription};
    pub use crate::channels::{ChannelAdapter, InboundEnvelope};
    pub use crate::config::Settings;
    pub use crate::domain::{AgentRun, Event, EventType, Policy, RunStatus};
    pub use crate::gateway::Gateway;
    pub use crate::observability::{Metrics, init_logging};
    pub use crate::persistence::{Repository, SqliteRepository};
    pub use crate::security::{PolicyEngine, RateLimiter};
    pub use crate::tools::{ToolHandler, ToolRegistry, ToolSpec};
}
