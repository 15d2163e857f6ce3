//! Policy engine: sender admission, tool admission, approval requirement.
//!
//! Deny-by-default is the root invariant — an empty [`Policy`] forbids every
//! sender and every tool.  The engine holds the live policy behind a
//! `RwLock` so the gateway can swap it atomically on `config.set`.

use std::sync::RwLock;

use crate::{
    domain::{GatePolicy, Policy},
    security::rate_limit::RateLimiter,
    tools::{ToolPermission, ToolSpec},
};

/// Identity and context of an inbound sender.
#[derive(Debug, Clone, Copy)]
pub struct SenderContext<'a> {
    pub channel_id: &'a str,
    pub sender_id: &'a str,
    pub is_dm: bool,
    pub is_group: bool,
}

/// Outcome of a tool admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolDecision {
    /// The tool may execute; `needs_approval` gates write tools behind a
    /// human sign-off when configured.
    Allowed { needs_approval: bool },
    /// The tool is prohibited; the reason is a stable code.
    Denied { reason: &'static str },
}

/// Gates senders and tool invocations against the live [`Policy`].
pub struct PolicyEngine {
    policy: RwLock<Policy>,
    rate: RateLimiter,
    require_approvals_for_write_tools: bool,
}

impl PolicyEngine {
    pub fn new(
        policy: Policy,
        rate: RateLimiter,
        require_approvals_for_write_tools: bool,
    ) -> Self {
        Self {
            policy: RwLock::new(policy),
            rate,
            require_approvals_for_write_tools,
        }
    }

    /// Admit or reject an inbound sender.  On rejection the returned code is
    /// one of `sender_not_allowlisted`, `dm_blocked`, `group_blocked`,
    /// `rate_limited`.
    pub fn allow_sender(&self, ctx: SenderContext<'_>) -> Result<(), &'static str> {
        let policy = self.read_policy();
        if !policy.is_allowed_sender(ctx.channel_id, ctx.sender_id) {
            return Err("sender_not_allowlisted");
        }
        if ctx.is_dm && policy.dm_policy != GatePolicy::Allow {
            return Err("dm_blocked");
        }
        if ctx.is_group && policy.group_policy != GatePolicy::Allow {
            return Err("group_blocked");
        }
        drop(policy);
        let principal = format!("sender:{}:{}", ctx.channel_id, ctx.sender_id);
        if !self.rate.allow(&principal, 1.0) {
            return Err("rate_limited");
        }
        Ok(())
    }

    /// Admit or reject a tool invocation.  Write tools additionally require
    /// approval when `require_approvals_for_write_tools` is on.
    pub fn allow_tool(&self, spec: &ToolSpec) -> ToolDecision {
        let policy = self.read_policy();
        if !policy.is_tool_allowed(&spec.name) {
            return ToolDecision::Denied {
                reason: "tool_not_allowed",
            };
        }
        let needs_approval = spec.permission == ToolPermission::Write
            && self.require_approvals_for_write_tools;
        ToolDecision::Allowed { needs_approval }
    }

    /// Snapshot of the live policy.
    pub fn policy(&self) -> Policy {
        self.read_policy().clone()
    }

    /// Atomically mutate the live policy (control-plane `config.set`).
    pub fn update_policy(&self, f: impl FnOnce(&mut Policy)) {
        let mut guard = match self.policy.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }

    fn read_policy(&self) -> std::sync::RwLockReadGuard<'_, Policy> {
        match self.policy.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Policy;
    use serde_json::json;

    fn spec(name: &str, permission: ToolPermission) -> ToolSpec {
        ToolSpec {
            name: name.to_owned(),
            description: String::new(),
            permission,
            args_schema: json!({ "type": "object" }),
        }
    }

    fn dm(channel: &'static str, sender: &'static str) -> SenderContext<'static> {
        SenderContext {
            channel_id: channel,
            sender_id: sender,
            is_dm: true,
            is_group: false,
        }
    }

    fn engine(policy: Policy) -> PolicyEngine {
        PolicyEngine::new(policy, RateLimiter::new(10.0, 10), true)
    }

    #[test]
    fn sender_denied_by_default() {
        let pe = engine(Policy::default());
        assert_eq!(pe.allow_sender(dm("ch1", "u1")), Err("sender_not_allowlisted"));
    }

    #[test]
    fn allowlisted_dm_sender_passes() {
        let mut policy = Policy::default();
        policy.allowlist.insert("ch1".into(), vec!["u1".into()]);
        let pe = engine(policy);
        assert_eq!(pe.allow_sender(dm("ch1", "u1")), Ok(()));
    }

    #[test]
    fn dm_blocked_when_dm_policy_not_allow() {
        let mut policy = Policy::default();
        policy.allowlist.insert("ch1".into(), vec!["u1".into()]);
        policy.dm_policy = GatePolicy::Deny;
        let pe = engine(policy);
        assert_eq!(pe.allow_sender(dm("ch1", "u1")), Err("dm_blocked"));
    }

    #[test]
    fn group_blocked_by_default_policy() {
        let mut policy = Policy::default();
        policy.allowlist.insert("ch1".into(), vec!["u1".into()]);
        let pe = engine(policy);
        let ctx = SenderContext {
            channel_id: "ch1",
            sender_id: "u1",
            is_dm: false,
            is_group: true,
        };
        assert_eq!(pe.allow_sender(ctx), Err("group_blocked"));
    }

    #[test]
    fn sender_rate_limited_after_burst() {
        let mut policy = Policy::default();
        policy.allowlist.insert("ch1".into(), vec!["u1".into()]);
        let pe = PolicyEngine::new(policy, RateLimiter::new(0.001, 2), true);
        assert_eq!(pe.allow_sender(dm("ch1", "u1")), Ok(()));
        assert_eq!(pe.allow_sender(dm("ch1", "u1")), Ok(()));
        assert_eq!(pe.allow_sender(dm("ch1", "u1")), Err("rate_limited"));
    }

    #[test]
    fn tool_denied_by_default() {
        let pe = engine(Policy::default());
        assert_eq!(
            pe.allow_tool(&spec("t1", ToolPermission::Read)),
            ToolDecision::Denied {
                reason: "tool_not_allowed"
            }
        );
    }

    #[test]
    fn read_tool_allowed_without_approval() {
        let mut policy = Policy::default();
        policy.tool_allow.insert("t1".into(), "read".into());
        let pe = engine(policy);
        assert_eq!(
            pe.allow_tool(&spec("t1", ToolPermission::Read)),
            ToolDecision::Allowed {
                needs_approval: false
            }
        );
    }

    #[test]
    fn write_tool_needs_approval_when_configured() {
        let mut policy = Policy::default();
        policy.tool_allow.insert("t1".into(), "write".into());
        let pe = engine(policy);
        assert_eq!(
            pe.allow_tool(&spec("t1", ToolPermission::Write)),
            ToolDecision::Allowed {
                needs_approval: true
            }
        );
    }

    #[test]
    fn write_tool_skips_approval_when_disabled() {
        let mut policy = Policy::default();
        policy.tool_allow.insert("t1".into(), "write".into());
        let pe = PolicyEngine::new(policy, RateLimiter::new(10.0, 10), false);
        assert_eq!(
            pe.allow_tool(&spec("t1", ToolPermission::Write)),
            ToolDecision::Allowed {
                needs_approval: false
            }
        );
    }

    #[test]
    fn update_policy_is_idempotent() {
        let pe = engine(Policy::default());
        let apply = |pe: &PolicyEngine| {
            pe.update_policy(|p| {
                p.allowlist.insert("ch1".into(), vec!["u1".into()]);
                p.tool_allow.insert("t1".into(), "read".into());
                p.dm_policy = GatePolicy::Allow;
            })
        };
        apply(&pe);
        let first = pe.policy();
        apply(&pe);
        assert_eq!(first, pe.policy());
    }
}
