//! End-to-end run lifecycle tests through the public gateway surface:
//! ingest → policy → run → events → persistence.

use std::{collections::VecDeque, sync::Arc, sync::Mutex, time::Duration};

use async_trait::async_trait;
use serde_json::{Value, json};

use agw::{
    agent::{ChatTurn, Plan, Planner, PlannerError, ToolCallRequest},
    bus::Subscription,
    channels::InboundEnvelope,
    config::Settings,
    domain::{Event, EventType, RunStatus},
    gateway::Gateway,
    persistence::{Repository, SqliteRepository},
    plugins::{Plugin, PluginRegistry, builtin_plugins},
    tools::{ToolHandler, ToolPermission, ToolSpec},
};

// ─── Doubles ──────────────────────────────────────────────────────────────────

struct ScriptedPlanner {
    plans: Mutex<VecDeque<Plan>>,
}

impl ScriptedPlanner {
    fn new(plans: Vec<Plan>) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(plans.into()),
        })
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _messages: &[ChatTurn], _tools: &[ToolSpec]) -> Result<Plan, PlannerError> {
        let next = self.plans.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| Plan::Content("No more responses".to_owned())))
    }
}

fn tool_call(name: &str, args: Value) -> Plan {
    Plan::ToolCalls(vec![ToolCallRequest {
        name: name.to_owned(),
        args,
    }])
}

/// Publishes `notify.send`, a write tool, so approval flows are reachable.
struct NotifyPlugin;

struct NotifyTool;

#[async_trait]
impl ToolHandler for NotifyTool {
    async fn invoke(&self, args: Value) -> Result<Value, String> {
        Ok(json!({ "sent": true, "args": args }))
    }
}

impl Plugin for NotifyPlugin {
    fn name(&self) -> &str {
        "notify"
    }

    fn register(&self, registry: &mut PluginRegistry) -> Result<(), String> {
        registry
            .register_tool(
                ToolSpec::new(
                    "notify.send",
                    "Send a notification.",
                    ToolPermission::Write,
                    json!({ "type": "object" }),
                ),
                Arc::new(NotifyTool),
            )
            .map_err(|e| e.to_string())
    }
}

// ─── Harness ──────────────────────────────────────────────────────────────────

fn settings(run_timeout_s: u64) -> Settings {
    Settings {
        require_client_auth: false,
        run_timeout_s,
        ..Settings::default()
    }
}

fn gateway_with(planner: Arc<dyn Planner>, run_timeout_s: u64) -> Arc<Gateway> {
    let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::in_memory().unwrap());
    let mut plugins = builtin_plugins();
    plugins.push(Arc::new(NotifyPlugin));
    Gateway::with_extensions(settings(run_timeout_s), repo, planner, plugins)
}

async fn collect_until_completed(sub: &Subscription, run_id: &str) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), sub.recv())
            .await
            .expect("timed out waiting for run.completed")
            .expect("bus closed");
        let matches_run = event.run_id.as_deref() == Some(run_id);
        events.push(event.clone());
        if matches_run && event.event_type == EventType::RunCompleted {
            return events;
        }
    }
}

fn of_type<'a>(events: &'a [Event], event_type: EventType) -> Vec<&'a Event> {
    events
        .iter()
        .filter(|e| e.event_type == event_type)
        .collect()
}

// ─── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn echo_tool_run_emits_ordered_events_and_persists() {
    let gw = gateway_with(
        ScriptedPlanner::new(vec![
            tool_call("core.echo", json!({ "text": "hi" })),
            Plan::Content("echoed: hi".to_owned()),
        ]),
        30,
    );
    gw.apply_policy_update(&json!({ "tool_allow": { "core.echo": "read" } }));
    let sub = gw.bus().subscribe();

    let run = gw
        .start_run("chat1", "webchat-1", "u1", "please echo hi")
        .await
        .unwrap();
    let events = collect_until_completed(&sub, &run.run_id).await;

    // Exactly one tool call, no approval needed.
    let tool_calls = of_type(&events, EventType::RunToolCall);
    assert_eq!(tool_calls.len(), 1);
    assert_eq!(tool_calls[0].payload["tool"], "core.echo");
    assert_eq!(tool_calls[0].payload["approval_required"], false);

    // One output, one terminal event, output text made it through.
    assert_eq!(of_type(&events, EventType::RunOutput).len(), 1);
    let completed = of_type(&events, EventType::RunCompleted);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].payload["status"], "completed");
    assert!(
        completed[0].payload["output_text"]
            .as_str()
            .unwrap()
            .contains("hi")
    );

    // seq is strictly increasing across the stream.
    for pair in events.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
    }
    // The terminal event is the last event carrying this run id.
    let last_for_run = events
        .iter()
        .filter(|e| e.run_id.as_deref() == Some(run.run_id.as_str()))
        .next_back()
        .unwrap();
    assert_eq!(last_for_run.event_type, EventType::RunCompleted);

    // Final run state is persisted.
    let stored = gw.get_run(&run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert!(stored.finished_at.unwrap() >= stored.started_at.unwrap());
    assert_eq!(stored.tools_called, vec!["core.echo"]);
}

#[tokio::test]
async fn write_tool_approval_timeout_fails_the_run() {
    let gw = gateway_with(
        ScriptedPlanner::new(vec![tool_call("notify.send", json!({ "text": "deploy" }))]),
        1,
    );
    gw.apply_policy_update(&json!({ "tool_allow": { "notify.send": "write" } }));
    let sub = gw.bus().subscribe();

    let run = gw
        .start_run("chat1", "webchat-1", "u1", "notify the team")
        .await
        .unwrap();
    let events = collect_until_completed(&sub, &run.run_id).await;

    let tool_calls = of_type(&events, EventType::RunToolCall);
    assert_eq!(tool_calls.len(), 1);
    assert_eq!(tool_calls[0].payload["approval_required"], true);

    let blocked = of_type(&events, EventType::SecurityBlocked);
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].payload["reason"], "approval_timeout");

    let completed = of_type(&events, EventType::RunCompleted);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].payload["status"], "failed");
    assert!(
        completed[0].payload["summary"]
            .as_str()
            .unwrap()
            .to_lowercase()
            .contains("timeout")
    );
}

#[tokio::test]
async fn write_tool_approval_granted_completes_the_run() {
    let gw = gateway_with(
        ScriptedPlanner::new(vec![
            tool_call("notify.send", json!({ "text": "deploy" })),
            Plan::Content("Notification delivered.".to_owned()),
        ]),
        30,
    );
    gw.apply_policy_update(&json!({ "tool_allow": { "notify.send": "write" } }));
    let sub = gw.bus().subscribe();

    let run = gw
        .start_run("chat1", "webchat-1", "u1", "notify the team")
        .await
        .unwrap();
    let run_id = run.run_id.clone();

    // Approve ~100ms after the approval request is published.
    let granter = {
        let gw = Arc::clone(&gw);
        let approval_sub = gw.bus().subscribe();
        tokio::spawn(async move {
            loop {
                let event = approval_sub.recv().await.expect("bus closed");
                if event.event_type == EventType::RunToolCall
                    && event.payload["approval_required"] == true
                {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    assert!(gw.grant_approval(&run_id));
                    break;
                }
            }
        })
    };

    let events = collect_until_completed(&sub, &run.run_id).await;
    granter.await.unwrap();

    let tool_calls = of_type(&events, EventType::RunToolCall);
    assert_eq!(tool_calls.len(), 2);
    assert_eq!(tool_calls[0].payload["approval_required"], true);
    assert_eq!(tool_calls[1].payload["approval_required"], false);
    assert_eq!(of_type(&events, EventType::RunOutput).len(), 1);

    let completed = of_type(&events, EventType::RunCompleted);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].payload["status"], "completed");
}

#[tokio::test]
async fn denied_tool_falls_back_to_clarification() {
    // Empty tool allowlist: deny-by-default even for registered tools.
    let gw = gateway_with(
        ScriptedPlanner::new(vec![tool_call("web.search", json!({ "query": "x" }))]),
        30,
    );
    let sub = gw.bus().subscribe();

    let run = gw
        .start_run("chat1", "webchat-1", "u1", "search for x")
        .await
        .unwrap();
    let events = collect_until_completed(&sub, &run.run_id).await;

    let blocked = of_type(&events, EventType::SecurityBlocked);
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].payload["reason"], "tool_not_allowed");

    // No tool executed; the user still gets a reply.
    assert!(of_type(&events, EventType::RunToolCall).is_empty());
    let output = of_type(&events, EventType::RunOutput);
    assert_eq!(output.len(), 1);
    assert!(
        output[0].payload["text"]
            .as_str()
            .unwrap()
            .contains("tool_not_allowed")
    );

    let completed = of_type(&events, EventType::RunCompleted);
    assert_eq!(completed[0].payload["status"], "completed");
}

#[tokio::test]
async fn unlisted_sender_is_dropped_without_a_trace() {
    let gw = gateway_with(ScriptedPlanner::new(vec![]), 30);
    let sub = gw.bus().subscribe();

    gw.ingest_inbound(InboundEnvelope::dm("ch1", "chat1", "u1", "let me in"))
        .await
        .unwrap();

    let event = sub.try_recv().unwrap();
    assert_eq!(event.event_type, EventType::SecurityBlocked);
    assert_eq!(event.payload["reason"], "sender_not_allowlisted");
    assert_eq!(event.payload["channel_id"], "ch1");

    // No message.inbound, no chat, no run.
    assert!(sub.try_recv().is_none());
    assert!(gw.list_chats(None).await.unwrap().is_empty());
    assert!(gw.list_messages("chat1", 50).await.unwrap().is_empty());
}

#[tokio::test]
async fn tail_events_returns_full_run_audit_trail() {
    let gw = gateway_with(
        ScriptedPlanner::new(vec![Plan::Content("quick answer".to_owned())]),
        30,
    );
    let sub = gw.bus().subscribe();

    let run = gw
        .start_run("chat1", "webchat-1", "u1", "quick question")
        .await
        .unwrap();
    collect_until_completed(&sub, &run.run_id).await;

    let tail = gw.tail_events(Some(&run.run_id), None).await.unwrap();
    assert!(!tail.is_empty());
    // Persisted order matches seq order and ends with the terminal event.
    let seqs: Vec<u64> = tail.iter().map(|e| e.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);
    assert_eq!(tail.last().unwrap().event_type, EventType::RunCompleted);

    // after_seq narrows the window.
    let first_seq = tail[0].seq;
    let rest = gw.tail_events(Some(&run.run_id), Some(first_seq)).await.unwrap();
    assert_eq!(rest.len(), tail.len() - 1);
}
