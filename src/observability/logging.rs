//! Tracing subscriber initialisation.
//!
//! Verbosity comes from `RUST_LOG` when set, otherwise from the configured
//! `log_level`.  With `json_logs` on (the default for 24/7 operation) each
//! line is a single JSON object; otherwise the human-readable formatter is
//! used.

use tracing_subscriber::EnvFilter;

/// Initialise the global subscriber.  Safe to call more than once; later
/// calls are no-ops.
pub fn init_logging(log_level: &str, json_logs: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
            .ok();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .ok();
    }
}
