//! Prometheus metric families for the gateway.
//!
//! One [`Metrics`] instance is created at startup and shared as
//! `Arc<Metrics>`; `GET /metrics` renders the registry in text exposition
//! format.

use prometheus::{
    Histogram, HistogramOpts, HistogramTimer, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    /// Active WebSocket control-plane connections.
    pub ws_connections: IntGauge,
    /// RPC requests total, by method.
    pub rpc_requests: IntCounterVec,
    /// RPC errors total, by method and code.
    pub rpc_errors: IntCounterVec,
    /// Agent runs total, by terminal status.
    pub agent_runs: IntCounterVec,
    /// Agent run latency in seconds.
    pub agent_run_latency: Histogram,
    /// Inbound channel messages, by channel type.
    pub inbound_messages: IntCounterVec,
    /// Blocked actions, by reason.
    pub blocked_actions: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
            let c = IntCounterVec::new(Opts::new(name, help), labels).expect("static metric");
            registry
                .register(Box::new(c.clone()))
                .expect("metric registration");
            c
        }

        let ws_connections = IntGauge::new(
            "agw_ws_connections",
            "Active WebSocket control-plane connections",
        )
        .expect("static metric");
        registry
            .register(Box::new(ws_connections.clone()))
            .expect("metric registration");

        let agent_run_latency = Histogram::with_opts(HistogramOpts::new(
            "agw_agent_run_latency_seconds",
            "Agent run latency seconds",
        ))
        .expect("static metric");
        registry
            .register(Box::new(agent_run_latency.clone()))
            .expect("metric registration");

        Self {
            ws_connections,
            rpc_requests: counter_vec(
                &registry,
                "agw_rpc_requests_total",
                "RPC requests total",
                &["method"],
            ),
            rpc_errors: counter_vec(
                &registry,
                "agw_rpc_errors_total",
                "RPC errors total",
                &["method", "code"],
            ),
            agent_runs: counter_vec(
                &registry,
                "agw_agent_runs_total",
                "Agent runs total",
                &["status"],
            ),
            agent_run_latency,
            inbound_messages: counter_vec(
                &registry,
                "agw_inbound_messages_total",
                "Inbound channel messages",
                &["channel_type"],
            ),
            blocked_actions: counter_vec(
                &registry,
                "agw_blocked_actions_total",
                "Blocked actions",
                &["reason"],
            ),
            registry,
        }
    }

    /// Start the run-latency timer; observes on drop.
    pub fn run_timer(&self) -> HistogramTimer {
        self.agent_run_latency.start_timer()
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
