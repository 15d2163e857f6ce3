//! The gateway: single authority over persisted state.
//!
//! Owns the event bus, tool and plugin registries, policy engine, agent
//! engine, repository, channel adapters and active run tasks.  Every other
//! component operates on in-memory objects or communicates through the
//! bus; only code in this module writes channels, chats, messages, runs
//! and events to storage.

pub mod sink;

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc},
    task::JoinHandle,
};

use crate::{
    agent::{AgentEngine, ChatTurn, EngineConfig, MockPlanner, Planner},
    bus::EventBus,
    channels::{
        ChannelAdapter, InboundEnvelope, TelegramChannel, WebChatChannel,
        WhatsAppBusinessChannel,
    },
    config::Settings,
    domain::{
        AgentRun, Channel, ChannelStatus, Chat, Event, EventType, GatePolicy, Message, Policy,
        gen_id,
    },
    observability::Metrics,
    persistence::{DEFAULT_EVENT_TAIL_LIMIT, Repository, RepositoryError},
    plugins::{LoadedPlugin, PluginRegistry, builtin_plugins, load_plugins},
    security::{PolicyEngine, RateLimiter, SenderContext, sanitize_text},
    tools::{ToolRegistry, builtins_registry},
};

use sink::EventSink;

/// Filesystem sentinel guarding against a second gateway on the same data
/// directory.
const LOCK_FILE_NAME: &str = "gateway.lock";

/// How long `stop` waits for in-flight runs before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("instance lock exists at {0}; another gateway may be running")]
    InstanceLockHeld(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("channel adapter error: {0}")]
    Channel(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// An active run: the driver task plus a shared view of the live run
/// object.  The driver mutates the run in place under the async mutex, so
/// shutdown can read the last known status of a task it has to abort.
struct RunTask {
    handle: JoinHandle<()>,
    run: Arc<AsyncMutex<AgentRun>>,
}

pub struct Gateway {
    settings: Settings,
    repo: Arc<dyn Repository>,
    bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
    sink: Arc<EventSink>,
    policy_engine: Arc<PolicyEngine>,
    tools: Arc<ToolRegistry>,
    plugins: Mutex<PluginRegistry>,
    loaded_plugins: Vec<LoadedPlugin>,
    engine: Arc<AgentEngine>,
    channels: Mutex<HashMap<String, Arc<dyn ChannelAdapter>>>,
    run_tasks: Mutex<HashMap<String, RunTask>>,
    ingest_task: Mutex<Option<JoinHandle<()>>>,
    inbound_tx: Mutex<Option<mpsc::Sender<InboundEnvelope>>>,
    lock_file: Mutex<Option<PathBuf>>,
}

impl Gateway {
    /// Assemble a gateway with the default (mock) planner.
    pub fn new(settings: Settings, repo: Arc<dyn Repository>) -> Arc<Self> {
        Self::with_planner(settings, repo, Arc::new(MockPlanner))
    }

    /// Assemble a gateway around an explicit planner implementation.
    pub fn with_planner(
        settings: Settings,
        repo: Arc<dyn Repository>,
        planner: Arc<dyn Planner>,
    ) -> Arc<Self> {
        Self::with_extensions(settings, repo, planner, builtin_plugins())
    }

    /// Assemble a gateway with an explicit plugin set (used by embedders
    /// and tests to publish additional tools, commands and hooks).
    pub fn with_extensions(
        settings: Settings,
        repo: Arc<dyn Repository>,
        planner: Arc<dyn Planner>,
        plugins: Vec<Arc<dyn crate::plugins::Plugin>>,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let metrics = Arc::new(Metrics::new());
        let sink = Arc::new(EventSink::new(
            Arc::clone(&bus),
            Arc::clone(&repo),
            Arc::clone(&metrics),
        ));

        // Builtins first, then plugins; the tool set is frozen afterwards.
        let mut plugin_registry = PluginRegistry::new(builtins_registry());
        let loaded_plugins = load_plugins(plugins, &mut plugin_registry);
        let tools = Arc::new(plugin_registry.take_tools());

        let policy_engine = Arc::new(PolicyEngine::new(
            Policy::default(),
            RateLimiter::new(settings.rate_limit_rps, settings.rate_limit_burst),
            settings.require_approvals_for_write_tools,
        ));

        let engine = Arc::new(AgentEngine::new(
            Arc::clone(&sink),
            Arc::clone(&tools),
            Arc::clone(&policy_engine),
            planner,
            EngineConfig::from_settings(&settings),
        ));

        Arc::new(Self {
            settings,
            repo,
            bus,
            metrics,
            sink,
            policy_engine,
            tools,
            plugins: Mutex::new(plugin_registry),
            loaded_plugins,
            engine,
            channels: Mutex::new(HashMap::new()),
            run_tasks: Mutex::new(HashMap::new()),
            ingest_task: Mutex::new(None),
            inbound_tx: Mutex::new(None),
            lock_file: Mutex::new(None),
        })
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn loaded_plugins(&self) -> &[LoadedPlugin] {
        &self.loaded_plugins
    }

    /// Sender half of the inbound pipeline, available once started.
    pub fn inbound_sender(&self) -> Option<mpsc::Sender<InboundEnvelope>> {
        lock(&self.inbound_tx).clone()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Acquire the instance lock, register the built-in channels, start the
    /// adapters and the inbound ingest task.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        fs::create_dir_all(&self.settings.data_dir)?;
        self.acquire_lock()?;

        for plugin in &self.loaded_plugins {
            tracing::info!(plugin = %plugin.name, "plugin active");
        }

        // Built-in channel set; plugin channels can be added on top.
        let adapters: Vec<Arc<dyn ChannelAdapter>> = vec![
            Arc::new(WebChatChannel::new("webchat-1")),
            Arc::new(TelegramChannel::new("telegram-1", None)),
            Arc::new(WhatsAppBusinessChannel::new("whatsapp-1")),
        ];

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundEnvelope>(64);

        for adapter in adapters {
            let channel_id = adapter.channel_id().to_owned();
            let mut channel = Channel::new(&channel_id, adapter.channel_type());
            self.repo.upsert_channel(&channel).await?;

            match adapter.start(inbound_tx.clone()).await {
                Ok(()) => {
                    channel.status = ChannelStatus::Ready;
                    channel.last_seen = Some(Utc::now());
                }
                Err(err) => {
                    tracing::error!(channel_id = %channel_id, error = %err, "adapter start failed");
                    channel.status = ChannelStatus::Error;
                }
            }
            self.repo.upsert_channel(&channel).await?;
            lock(&self.channels).insert(channel_id, adapter);
        }
        // Keep a sender so the ingest task outlives adapters that do not
        // retain theirs (and so embedders can feed envelopes in).
        *lock(&self.inbound_tx) = Some(inbound_tx);

        // Drain adapter envelopes into the ingest pipeline.
        let gateway = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(envelope) = inbound_rx.recv().await {
                if let Err(err) = gateway.ingest_inbound(envelope).await {
                    tracing::error!(error = %err, "inbound ingest failed");
                }
            }
        });
        *lock(&self.ingest_task) = Some(task);

        tracing::info!(
            instance_id = %self.settings.instance_id,
            tools = self.tools.len(),
            "gateway started"
        );
        Ok(())
    }

    /// Stop adapters first, then give in-flight runs a grace window before
    /// aborting them, and release the instance lock.
    pub async fn stop(&self) {
        let adapters: Vec<Arc<dyn ChannelAdapter>> =
            lock(&self.channels).values().cloned().collect();
        for adapter in adapters {
            adapter.stop().await;
        }

        // Dropping the retained sender lets the ingest task drain and exit.
        lock(&self.inbound_tx).take();
        if let Some(task) = lock(&self.ingest_task).take() {
            task.abort();
        }

        let tasks: Vec<(String, RunTask)> = lock(&self.run_tasks).drain().collect();
        for (run_id, task) in tasks {
            let RunTask { mut handle, run } = task;
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_ok() {
                continue;
            }
            // The run cannot finalize in time: abort it and persist its
            // last known in-memory status (running / approval_pending) so
            // the stored record stays truthful across the restart.
            handle.abort();
            let _ = handle.await;
            let snapshot = run.lock().await.clone();
            tracing::warn!(
                run_id = %run_id,
                status = snapshot.status.as_str(),
                "run aborted at shutdown; persisting last known status"
            );
            if let Err(err) = self.repo.upsert_run(&snapshot).await {
                tracing::error!(run_id = %run_id, error = %err, "failed to persist aborted run");
            }
        }

        self.release_lock();
        tracing::info!("gateway stopped");
    }

    fn acquire_lock(&self) -> Result<()> {
        let path = PathBuf::from(&self.settings.data_dir).join(LOCK_FILE_NAME);
        if path.exists() {
            return Err(GatewayError::InstanceLockHeld(path));
        }
        fs::write(&path, &self.settings.instance_id)?;
        *lock(&self.lock_file) = Some(path);
        Ok(())
    }

    fn release_lock(&self) {
        if let Some(path) = lock(&self.lock_file).take()
            && let Err(err) = fs::remove_file(&path)
        {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove lock file");
        }
    }

    // ── Inbound pipeline ──────────────────────────────────────────────────────

    /// Sanitize → admit → persist → announce one inbound envelope.
    pub async fn ingest_inbound(&self, envelope: InboundEnvelope) -> Result<()> {
        let (cleaned, issues) = sanitize_text(&envelope.text);

        let verdict = self.policy_engine.allow_sender(SenderContext {
            channel_id: &envelope.channel_id,
            sender_id: &envelope.sender_id,
            is_dm: envelope.is_dm,
            is_group: envelope.is_group,
        });
        if let Err(reason) = verdict {
            self.metrics
                .blocked_actions
                .with_label_values(&[reason])
                .inc();
            self.sink
                .emit(
                    None,
                    EventType::SecurityBlocked,
                    json!({
                        "reason": reason,
                        "channel_id": envelope.channel_id,
                        "sender_id": envelope.sender_id,
                    }),
                )
                .await;
            return Ok(());
        }

        let channel_type = lock(&self.channels)
            .get(&envelope.channel_id)
            .map(|a| a.channel_type());
        let channel_label = channel_type
            .and_then(|t| serde_json::to_value(t).ok())
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "unknown".to_owned());
        self.metrics
            .inbound_messages
            .with_label_values(&[&channel_label])
            .inc();

        let mut metadata = json!({ "sanitize_issues": issues });
        if let (Value::Object(target), Value::Object(extra)) =
            (&mut metadata, envelope.metadata.clone())
        {
            target.extend(extra);
        }

        let message = Message {
            msg_id: gen_id("msg"),
            chat_id: envelope.chat_id.clone(),
            channel_id: envelope.channel_id.clone(),
            sender_id: envelope.sender_id.clone(),
            text: cleaned,
            timestamp: Utc::now(),
            attachments: envelope.attachments.clone(),
            metadata,
        };

        self.repo
            .upsert_chat(&Chat {
                chat_id: envelope.chat_id.clone(),
                channel_id: envelope.channel_id.clone(),
                participants: vec![envelope.sender_id.clone()],
                metadata: envelope.metadata,
            })
            .await?;
        self.repo.add_message(&message).await?;

        let hooks: Vec<_> = lock(&self.plugins).pre_message_hooks().to_vec();
        for hook in hooks {
            hook.on_message(&message).await;
        }

        self.sink
            .emit(
                None,
                EventType::MessageInbound,
                json!({ "message": message }),
            )
            .await;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────────────

    /// Persist a queued run, assemble its bounded history, and launch it as
    /// an independent background task.
    pub async fn start_run(
        self: &Arc<Self>,
        chat_id: &str,
        channel_id: &str,
        requested_by: &str,
        prompt: &str,
    ) -> Result<AgentRun> {
        let run = AgentRun::queued(chat_id, channel_id, requested_by);
        self.repo.upsert_run(&run).await?;

        // Last N chat messages, chronological, with the explicit prompt as
        // the final user turn.
        let history = self
            .repo
            .list_messages(chat_id, self.settings.max_context_messages)
            .await?;
        let mut context: Vec<ChatTurn> =
            history.into_iter().map(|m| ChatTurn::user(m.text)).collect();
        context.push(ChatTurn::user(prompt));

        let gateway = Arc::clone(self);
        let shared = Arc::new(AsyncMutex::new(run.clone()));
        let run_id = run.run_id.clone();
        let handle = {
            let shared = Arc::clone(&shared);
            let run_id = run_id.clone();
            tokio::spawn(async move {
                // The driver holds the lock for the whole run; shutdown
                // reads the live object only after aborting the task.
                let mut live = shared.lock().await;
                gateway.drive_run(&mut live, context).await;
                drop(live);
                lock(&gateway.run_tasks).remove(&run_id);
            })
        };
        lock(&self.run_tasks).insert(run_id, RunTask { handle, run: shared });

        Ok(run)
    }

    /// Execute the engine, persist the final run, and emit the single
    /// authoritative `run.completed` event.
    async fn drive_run(&self, run: &mut AgentRun, context: Vec<ChatTurn>) {
        self.engine.run(run, context).await;

        if let Err(err) = self.repo.upsert_run(run).await {
            tracing::error!(run_id = %run.run_id, error = %err, "failed to persist final run");
        }

        self.sink
            .emit(
                Some(&run.run_id),
                EventType::RunCompleted,
                json!({
                    "status": run.status.as_str(),
                    "summary": run.summary,
                    "output_text": run.output_text,
                }),
            )
            .await;
        self.metrics
            .agent_runs
            .with_label_values(&[run.status.as_str()])
            .inc();

        let hooks: Vec<_> = lock(&self.plugins).post_run_hooks().to_vec();
        for hook in hooks {
            hook.on_run(run).await;
        }
    }

    /// Resume a run parked on a write-tool approval.
    pub fn grant_approval(&self, run_id: &str) -> bool {
        self.engine.grant_approval(run_id)
    }

    // ── Queries (repository passthrough) ──────────────────────────────────────

    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        Ok(self.repo.list_channels().await?)
    }

    pub async fn list_chats(&self, channel_id: Option<&str>) -> Result<Vec<Chat>> {
        Ok(self.repo.list_chats(channel_id).await?)
    }

    pub async fn list_messages(&self, chat_id: &str, limit: usize) -> Result<Vec<Message>> {
        Ok(self.repo.list_messages(chat_id, limit).await?)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<AgentRun>> {
        Ok(self.repo.get_run(run_id).await?)
    }

    pub async fn tail_events(
        &self,
        run_id: Option<&str>,
        after_seq: Option<u64>,
    ) -> Result<Vec<Event>> {
        Ok(self
            .repo
            .tail_events(run_id, after_seq, DEFAULT_EVENT_TAIL_LIMIT)
            .await?)
    }

    // ── Config surface ────────────────────────────────────────────────────────

    /// The live policy plus the advertised tool specs.
    pub fn config_snapshot(&self) -> Value {
        json!({
            "policy": self.policy_engine.policy(),
            "tools": self.tools.list_specs(),
        })
    }

    /// Apply a partial policy update atomically.  Repeating the same
    /// payload leaves the policy bit-identical.
    pub fn apply_policy_update(&self, update: &Value) {
        let allowlist: Option<HashMap<String, Vec<String>>> = update
            .get("allowlist")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let tool_allow: Option<HashMap<String, String>> = update
            .get("tool_allow")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let dm_policy: Option<GatePolicy> = update
            .get("dm_policy")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let group_policy: Option<GatePolicy> = update
            .get("group_policy")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        self.policy_engine.update_policy(|policy| {
            if let Some(allowlist) = allowlist {
                policy.allowlist = allowlist;
            }
            if let Some(tool_allow) = tool_allow {
                policy.tool_allow = tool_allow;
            }
            if let Some(dm) = dm_policy {
                policy.dm_policy = dm;
            }
            if let Some(group) = group_policy {
                policy.group_policy = group;
            }
        });
    }

    // ── Doctor ────────────────────────────────────────────────────────────────

    /// Configuration audit: highlights risky settings without crashing the
    /// server over them.
    pub fn doctor_audit(&self) -> Value {
        let mut findings = Vec::new();
        let settings = &self.settings;

        if settings.host == "0.0.0.0" && settings.require_client_auth {
            findings.push(json!({
                "severity": "high",
                "issue": "gateway_exposed",
                "detail": "host=0.0.0.0. Ensure firewall + TLS + auth.",
            }));
        }
        if settings.client_api_keys.is_empty() && settings.require_client_auth {
            findings.push(json!({
                "severity": "critical",
                "issue": "no_client_api_keys",
                "detail": "require_client_auth enabled but no keys configured.",
            }));
        }
        if self.policy_engine.policy().allowlist.is_empty() {
            findings.push(json!({
                "severity": "high",
                "issue": "allowlist_empty",
                "detail": "Deny-by-default means all inbound is blocked; if unintended configure allowlist.",
            }));
        }
        if !settings.require_approvals_for_write_tools {
            findings.push(json!({
                "severity": "high",
                "issue": "write_tools_no_approval",
                "detail": "Write tools can execute without approvals. Recommended ON.",
            }));
        }
        if !settings.json_logs {
            findings.push(json!({
                "severity": "medium",
                "issue": "non_json_logs",
                "detail": "Prefer JSON logs for 24/7 ops.",
            }));
        }
        if !self.loaded_plugins.is_empty() {
            findings.push(json!({
                "severity": "low",
                "issue": "plugins_unsigned",
                "detail": format!(
                    "Plugins are local code (plugin_dir={}). Consider signing/allowlisting plugin hashes.",
                    settings.plugin_dir
                ),
            }));
        }

        json!({
            "findings": findings,
            "suggestions": [
                "Terminate TLS at a reverse proxy and keep the WS behind auth.",
                "Use separate API keys for human operators vs automation clients.",
                "Run the gateway as a least-privilege OS user; restrict data_dir permissions.",
                "Rotate secrets and store them in a secret manager in prod.",
            ],
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
