//! `AgentEngine` — the per-run state machine.
//!
//! # State graph
//!
//! ```text
//! [entry] → build_context → plan
//! plan           → (tool_request)          → policy_check
//!                → (no tool_request)       → decide_next
//! policy_check   → (needs_approval)        → wait_approval → execute_tool
//!                → (blocked)               → decide_next
//!                → (allowed)               → execute_tool
//! execute_tool   → decide_next
//! decide_next    → (done)                  → finalize → [exit]
//!                → (blocked, no output)    → ask_clarification → finalize → [exit]
//!                → otherwise               → plan  (step += 1)
//! ```
//!
//! Planner calls, tool invocations and approval waits are each bounded by
//! the run's remaining time budget; the whole machine additionally sits
//! under an outer backstop timeout.  Errors become state-machine routing
//! (`blocked_reason` + clarification fallback) — never panics.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::{
    agent::planner::{ChatTurn, Plan, Planner, ToolCallRequest},
    config::Settings,
    domain::{AgentRun, EventType, RunStatus},
    gateway::sink::EventSink,
    security::{PolicyEngine, ToolDecision},
    tools::ToolRegistry,
};

/// Extra slack the outer backstop gets over the run deadline, so that
/// deadline-capped inner waits resolve first and report a precise
/// `blocked_reason` instead of a bare timeout.
const OUTER_GRACE: Duration = Duration::from_secs(1);

/// How much of an error string is carried into a `blocked_reason` code.
const REASON_DETAIL_LEN: usize = 80;

// ─── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum plan → tool → decide cycles per run.
    pub max_steps: u32,
    /// Global time budget per run; also caps each planner call, tool
    /// invocation and approval wait.
    pub timeout: Duration,
    /// Reserved retry budget.  The state machine performs no retries:
    /// transient failures route into the clarification fallback.
    pub retry: u32,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_steps: settings.run_max_steps,
            timeout: Duration::from_secs(settings.run_timeout_s),
            retry: settings.run_retry,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 6,
            timeout: Duration::from_secs(45),
            retry: 1,
        }
    }
}

// ─── Approvals ────────────────────────────────────────────────────────────────

/// In-memory record that a run is waiting for human sign-off.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub run_id: String,
    pub tool_name: String,
    pub tool_args: Value,
    pub requested_at: DateTime<Utc>,
}

// ─── Run state ────────────────────────────────────────────────────────────────

struct RunState {
    run_id: String,
    messages: Vec<ChatTurn>,
    step: u32,
    plan_note: Option<String>,
    tool_request: Option<ToolCallRequest>,
    tool_result: Option<Value>,
    output_chunks: Vec<String>,
    needs_approval: bool,
    blocked_reason: Option<String>,
    done: bool,
    tools_called: Vec<String>,
    max_steps: u32,
    deadline: Instant,
}

impl RunState {
    fn new(run: &AgentRun, messages: Vec<ChatTurn>, config: &EngineConfig) -> Self {
        Self {
            run_id: run.run_id.clone(),
            messages,
            step: 1,
            plan_note: None,
            tool_request: None,
            tool_result: None,
            output_chunks: Vec::new(),
            needs_approval: false,
            blocked_reason: None,
            done: false,
            tools_called: Vec::new(),
            max_steps: config.max_steps,
            deadline: Instant::now() + config.timeout,
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn deadline_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

#[derive(Debug, Clone, Copy)]
enum Node {
    BuildContext,
    Plan,
    PolicyCheck,
    WaitApproval,
    ExecuteTool,
    DecideNext,
    AskClarification,
    Finalize,
}

/// The time budget ran out on a path that has no more specific
/// `blocked_reason` to report.
struct DeadlineExceeded;

// ─── AgentEngine ──────────────────────────────────────────────────────────────

/// Drives one [`AgentRun`] at a time through the state graph, emitting an
/// event on every transition.  Tool execution always passes through the
/// policy engine; write tools park on a one-shot approval signal.
///
/// The engine mutates only the in-memory run object it receives — the
/// gateway persists it.
pub struct AgentEngine {
    sink: Arc<EventSink>,
    tools: Arc<ToolRegistry>,
    policy: Arc<PolicyEngine>,
    planner: Arc<dyn Planner>,
    config: EngineConfig,
    pending: Mutex<HashMap<String, PendingApproval>>,
    approval_signals: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl AgentEngine {
    pub fn new(
        sink: Arc<EventSink>,
        tools: Arc<ToolRegistry>,
        policy: Arc<PolicyEngine>,
        planner: Arc<dyn Planner>,
        config: EngineConfig,
    ) -> Self {
        Self {
            sink,
            tools,
            policy,
            planner,
            config,
            pending: Mutex::new(HashMap::new()),
            approval_signals: Mutex::new(HashMap::new()),
        }
    }

    // ── Approval API ──────────────────────────────────────────────────────────

    /// Fire the one-shot approval signal for `run_id`.  Returns whether a
    /// waiter was resumed.  Denials are modelled as absence: the approval
    /// wait simply times out.
    pub fn grant_approval(&self, run_id: &str) -> bool {
        let sender = lock(&self.approval_signals).remove(run_id);
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// The pending approval for `run_id`, if any.
    pub fn pending(&self, run_id: &str) -> Option<PendingApproval> {
        lock(&self.pending).get(run_id).cloned()
    }

    // ── Outer run procedure ───────────────────────────────────────────────────

    /// Execute the run to a terminal status.
    ///
    /// The run object is updated in place (status, output, summary, step
    /// and tool accounting).  The terminal `run.completed` event is the
    /// gateway's to emit, exactly once, after persisting the final run.
    pub async fn run(&self, run: &mut AgentRun, context_messages: Vec<ChatTurn>) {
        let started = Utc::now();
        run.started_at = Some(started);
        run.status = RunStatus::Running;

        self.emit(
            &run.run_id,
            EventType::RunProgress,
            json!({ "status": "started", "at": started.to_rfc3339(), "engine": "agent" }),
        )
        .await;

        let timer = self.sink.metrics().run_timer();
        let mut state = RunState::new(run, context_messages, &self.config);

        let outcome = tokio::time::timeout(
            self.config.timeout + OUTER_GRACE,
            self.drive(run, &mut state),
        )
        .await;

        run.steps_executed = state.step;
        run.tools_called = state.tools_called.clone();
        let output = state.output_chunks.join("\n");

        match outcome {
            Ok(Ok(())) => {
                run.output_text = Some(output);
                match state.blocked_reason.as_deref() {
                    Some("approval_timeout") => {
                        run.status = RunStatus::Failed;
                        run.summary = Some("Approval timeout".to_owned());
                    }
                    Some(reason) => {
                        run.status = RunStatus::Completed;
                        run.summary = Some(format!("Completed with issues: {reason}"));
                    }
                    None => {
                        run.status = RunStatus::Completed;
                        run.summary = Some("Completed successfully".to_owned());
                    }
                }
                tracing::info!(
                    run_id = %run.run_id,
                    status = run.status.as_str(),
                    steps = state.step,
                    "run finished"
                );
            }
            Ok(Err(DeadlineExceeded)) | Err(_) => {
                run.status = RunStatus::Failed;
                run.summary = Some("Timeout".to_owned());
                run.output_text = (!output.is_empty()).then_some(output);
                tracing::error!(run_id = %run.run_id, "run timed out");
            }
        }

        run.finished_at = Some(Utc::now());
        drop(timer);
    }

    // ── Graph dispatch ────────────────────────────────────────────────────────

    async fn drive(
        &self,
        run: &mut AgentRun,
        state: &mut RunState,
    ) -> Result<(), DeadlineExceeded> {
        let mut node = Node::BuildContext;
        loop {
            node = match node {
                Node::BuildContext => {
                    self.build_context(state).await;
                    Node::Plan
                }
                Node::Plan => {
                    self.plan(state).await;
                    if state.tool_request.is_some() {
                        Node::PolicyCheck
                    } else {
                        Node::DecideNext
                    }
                }
                Node::PolicyCheck => {
                    self.policy_check(state).await;
                    if state.needs_approval {
                        Node::WaitApproval
                    } else if state.blocked_reason.is_some() {
                        Node::DecideNext
                    } else {
                        Node::ExecuteTool
                    }
                }
                Node::WaitApproval => {
                    self.wait_approval(run, state).await;
                    Node::ExecuteTool
                }
                Node::ExecuteTool => {
                    self.execute_tool(state).await;
                    Node::DecideNext
                }
                Node::DecideNext => {
                    self.decide_next(state).await;
                    if state.done {
                        Node::Finalize
                    } else if state.blocked_reason.is_some() && state.output_chunks.is_empty() {
                        if state.deadline_expired() {
                            return Err(DeadlineExceeded);
                        }
                        Node::AskClarification
                    } else {
                        if state.deadline_expired() {
                            return Err(DeadlineExceeded);
                        }
                        Node::Plan
                    }
                }
                Node::AskClarification => {
                    self.ask_clarification(state).await;
                    Node::Finalize
                }
                Node::Finalize => {
                    self.finalize(state).await;
                    return Ok(());
                }
            };
        }
    }

    // ── Nodes ─────────────────────────────────────────────────────────────────

    async fn build_context(&self, state: &mut RunState) {
        self.progress(state, "build_context", "start", json!({})).await;
        tracing::debug!(
            run_id = %state.run_id,
            messages = state.messages.len(),
            "context assembled"
        );
        self.progress(state, "build_context", "end", json!({})).await;
    }

    async fn plan(&self, state: &mut RunState) {
        self.progress(state, "plan", "start", json!({})).await;

        let specs = self.tools.list_specs();
        let planned =
            tokio::time::timeout(state.remaining(), self.planner.plan(&state.messages, &specs))
                .await;

        match planned {
            Ok(Ok(Plan::ToolCalls(calls))) => {
                // Single-shot per step: only the first call is taken.
                match calls.into_iter().next() {
                    Some(call) => {
                        state.plan_note = Some(format!("Tool requested: {}", call.name));
                        tracing::debug!(run_id = %state.run_id, tool = %call.name, "plan: tool");
                        state.tool_request = Some(call);
                    }
                    None => {
                        state.tool_request = None;
                    }
                }
            }
            Ok(Ok(Plan::Content(content))) => {
                state.tool_request = None;
                if !content.is_empty() {
                    state.output_chunks.push(content.clone());
                }
                tracing::debug!(
                    run_id = %state.run_id,
                    output_len = content.len(),
                    "plan: content"
                );
                state.plan_note = Some(content);
            }
            Ok(Err(err)) => {
                tracing::error!(run_id = %state.run_id, error = %err, "planner failed");
                state.tool_request = None;
                state.blocked_reason = Some(format!("planning_error: {}", err.kind()));
            }
            Err(_) => {
                tracing::error!(run_id = %state.run_id, "planner call timed out");
                state.tool_request = None;
                state.blocked_reason = Some("planning_timeout".to_owned());
            }
        }

        self.progress(state, "plan", "end", json!({ "plan": state.plan_note })).await;
    }

    async fn policy_check(&self, state: &mut RunState) {
        self.progress(state, "policy_check", "start", json!({})).await;

        let Some(request) = state.tool_request.clone() else {
            return;
        };

        let Some(tool) = self.tools.get(&request.name) else {
            tracing::warn!(run_id = %state.run_id, tool = %request.name, "tool missing");
            self.blocked(state, "tool_missing", &request.name).await;
            state.blocked_reason = Some("tool_missing".to_owned());
            state.tool_request = None;
            return;
        };

        match self.policy.allow_tool(&tool.spec) {
            ToolDecision::Denied { reason } => {
                tracing::warn!(
                    run_id = %state.run_id,
                    tool = %request.name,
                    reason,
                    "tool denied by policy"
                );
                self.blocked(state, reason, &request.name).await;
                state.blocked_reason = Some(reason.to_owned());
                state.tool_request = None;
                return;
            }
            ToolDecision::Allowed { needs_approval } => {
                if needs_approval {
                    tracing::info!(run_id = %state.run_id, tool = %request.name, "approval required");
                }
                state.needs_approval = needs_approval;
            }
        }

        self.progress(
            state,
            "policy_check",
            "end",
            json!({ "allowed": true, "needs_approval": state.needs_approval }),
        )
        .await;
    }

    async fn wait_approval(&self, run: &mut AgentRun, state: &mut RunState) {
        let Some(request) = state.tool_request.clone() else {
            return;
        };
        let run_id = state.run_id.clone();

        tracing::info!(run_id = %run_id, tool = %request.name, "waiting for approval");
        run.status = RunStatus::ApprovalPending;

        // Register the pending record and the one-shot wake signal.
        lock(&self.pending).insert(
            run_id.clone(),
            PendingApproval {
                run_id: run_id.clone(),
                tool_name: request.name.clone(),
                tool_args: request.args.clone(),
                requested_at: Utc::now(),
            },
        );
        let (tx, rx) = oneshot::channel();
        lock(&self.approval_signals).insert(run_id.clone(), tx);

        self.emit(
            &run_id,
            EventType::RunToolCall,
            json!({ "tool": request.name, "args": request.args, "approval_required": true }),
        )
        .await;
        self.progress(state, "wait_approval", "waiting", json!({})).await;

        match tokio::time::timeout(state.remaining(), rx).await {
            Ok(Ok(())) => {
                tracing::info!(run_id = %run_id, tool = %request.name, "approval granted");
                state.needs_approval = false;
            }
            // Timeout, or the signal sender vanished without firing.
            Ok(Err(_)) | Err(_) => {
                tracing::error!(run_id = %run_id, tool = %request.name, "approval timed out");
                self.blocked(state, "approval_timeout", &request.name).await;
                state.blocked_reason = Some("approval_timeout".to_owned());
                state.tool_request = None;
                state.done = true;
            }
        }

        // Always deregister, on every path.
        lock(&self.pending).remove(&run_id);
        lock(&self.approval_signals).remove(&run_id);
        run.status = RunStatus::Running;
    }

    async fn execute_tool(&self, state: &mut RunState) {
        let Some(request) = state.tool_request.clone() else {
            return;
        };

        self.progress(state, "execute_tool", "start", json!({})).await;
        self.emit(
            &state.run_id,
            EventType::RunToolCall,
            json!({ "tool": request.name, "args": request.args, "approval_required": false }),
        )
        .await;

        let Some(tool) = self.tools.get(&request.name) else {
            tracing::error!(run_id = %state.run_id, tool = %request.name, "tool vanished");
            state.blocked_reason = Some("tool_missing".to_owned());
            state.tool_request = None;
            return;
        };

        let invoked = tokio::time::timeout(
            state.remaining(),
            tool.handler.invoke(request.args.clone()),
        )
        .await;

        match invoked {
            Ok(Ok(result)) => {
                tracing::debug!(run_id = %state.run_id, tool = %request.name, "tool executed");
                state
                    .messages
                    .push(ChatTurn::tool(format!("{} -> {result}", request.name)));
                state.tool_result = Some(json!({ "tool": request.name, "result": result }));
                state.tools_called.push(request.name.clone());
                self.progress(state, "execute_tool", "result", json!({ "tool": request.name }))
                    .await;
            }
            Ok(Err(err)) => {
                tracing::error!(run_id = %state.run_id, tool = %request.name, error = %err, "tool failed");
                state.blocked_reason = Some(format!("tool_error: {}", truncate(&err)));
            }
            Err(_) => {
                tracing::error!(run_id = %state.run_id, tool = %request.name, "tool timed out");
                state.blocked_reason = Some("tool_timeout".to_owned());
            }
        }

        state.tool_request = None;
    }

    async fn decide_next(&self, state: &mut RunState) {
        self.progress(state, "decide_next", "start", json!({})).await;

        if !state.output_chunks.is_empty() {
            state.done = true;
            self.emit(
                &state.run_id,
                EventType::RunOutput,
                json!({ "text": state.output_chunks.join("\n") }),
            )
            .await;
            return;
        }

        if state.blocked_reason.is_some() {
            tracing::warn!(
                run_id = %state.run_id,
                reason = state.blocked_reason.as_deref(),
                "blocked without output"
            );
            // The dispatch edge routes to ask_clarification.
            return;
        }

        if state.step >= state.max_steps {
            tracing::info!(run_id = %state.run_id, step = state.step, "max steps reached");
            state.done = true;
            state.output_chunks.push(
                "I've reached the maximum number of steps without completing the task."
                    .to_owned(),
            );
            return;
        }

        state.step += 1;
    }

    async fn ask_clarification(&self, state: &mut RunState) {
        self.progress(state, "ask_clarification", "start", json!({})).await;

        let reason = state.blocked_reason.as_deref().unwrap_or("unknown");
        let clarification = format!(
            "I encountered an issue ({reason}) and couldn't complete the task. \
             Could you provide more information or rephrase your request?"
        );

        state.output_chunks.push(clarification.clone());
        state.done = true;
        tracing::info!(run_id = %state.run_id, reason, "asking for clarification");

        self.emit(&state.run_id, EventType::RunOutput, json!({ "text": clarification }))
            .await;
    }

    async fn finalize(&self, state: &mut RunState) {
        self.progress(state, "finalize", "start", json!({})).await;
        tracing::info!(
            run_id = %state.run_id,
            output_chunks = state.output_chunks.len(),
            "finalize"
        );
    }

    // ── Emission helpers ──────────────────────────────────────────────────────

    async fn emit(&self, run_id: &str, event_type: EventType, payload: Value) {
        self.sink.emit(Some(run_id), event_type, payload).await;
    }

    async fn progress(&self, state: &RunState, node: &str, phase: &str, extra: Value) {
        let mut payload = json!({ "node": node, "phase": phase, "step": state.step });
        if let (Value::Object(target), Value::Object(extra)) = (&mut payload, extra) {
            target.extend(extra);
        }
        self.emit(&state.run_id, EventType::RunProgress, payload).await;
    }

    async fn blocked(&self, state: &RunState, reason: &str, tool: &str) {
        self.sink
            .metrics()
            .blocked_actions
            .with_label_values(&[reason])
            .inc();
        self.emit(
            &state.run_id,
            EventType::SecurityBlocked,
            json!({ "reason": reason, "tool": tool }),
        )
        .await;
    }
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(REASON_DETAIL_LEN) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
