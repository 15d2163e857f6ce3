//! Gateway configuration.
//!
//! All fields have `#[serde(default)]` so a partially-filled `config.toml`
//! works correctly.  Every option can also be overridden through the
//! environment with an `AGW_` prefix (`AGW_PORT=9000`, `AGW_JSON_LOGS=false`,
//! `AGW_CLIENT_API_KEYS=key1,key2`).
//!
//! Example `config.toml`:
//! ```toml
//! host = "127.0.0.1"
//! port = 8787
//! require_client_auth = true
//! client_api_keys = ["s3cret"]
//! run_max_steps = 6
//! run_timeout_s = 45
//! ```

use std::{env, fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

/// Runtime settings for the gateway process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Unique instance id, recorded in the instance lock and traces.
    pub instance_id: String,
    pub data_dir: String,
    pub sqlite_path: String,
    pub plugin_dir: String,

    // Listener placement
    pub host: String,
    pub port: u16,
    pub ws_path: String,
    pub metrics_path: String,
    pub health_path: String,

    // Control-plane auth.  Deny-by-default: auth on, no keys configured
    // means no client is admitted (and `doctor.audit` flags it).
    pub require_client_auth: bool,
    pub client_api_keys: Vec<String>,

    // Approvals / rate limits
    pub require_approvals_for_write_tools: bool,
    pub rate_limit_rps: f64,
    pub rate_limit_burst: u32,

    // Engine bounds
    pub max_context_messages: usize,
    pub run_max_steps: u32,
    pub run_timeout_s: u64,
    /// Reserved retry budget; the engine currently routes transient
    /// failures into the clarification fallback instead of retrying.
    pub run_retry: u32,

    // Logging
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            instance_id: "agw-1".to_owned(),
            data_dir: "./data".to_owned(),
            sqlite_path: "./data/agent_gateway.sqlite".to_owned(),
            plugin_dir: "./plugins".to_owned(),
            host: "127.0.0.1".to_owned(),
            port: 8787,
            ws_path: "/ws".to_owned(),
            metrics_path: "/metrics".to_owned(),
            health_path: "/healthz".to_owned(),
            require_client_auth: true,
            client_api_keys: Vec::new(),
            require_approvals_for_write_tools: true,
            rate_limit_rps: 2.0,
            rate_limit_burst: 6,
            max_context_messages: 20,
            run_max_steps: 6,
            run_timeout_s: 45,
            run_retry: 1,
            log_level: "info".to_owned(),
            json_logs: true,
        }
    }
}

impl Settings {
    /// Load settings: defaults, then the TOML file at `path` (if present),
    /// then `AGW_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(p) if p.exists() => toml::from_str(&fs::read_to_string(p)?)?,
            _ => Settings::default(),
        };
        settings.apply_env()?;
        Ok(settings)
    }

    /// Apply `AGW_*` environment variable overrides in place.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        fn var(key: &str) -> Option<String> {
            env::var(key).ok().filter(|v| !v.is_empty())
        }

        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidEnv {
                key: key.to_owned(),
                value,
            })
        }

        macro_rules! override_str {
            ($field:ident, $key:literal) => {
                if let Some(v) = var($key) {
                    self.$field = v;
                }
            };
        }
        macro_rules! override_parsed {
            ($field:ident, $key:literal) => {
                if let Some(v) = var($key) {
                    self.$field = parse($key, v)?;
                }
            };
        }

        override_str!(instance_id, "AGW_INSTANCE_ID");
        override_str!(data_dir, "AGW_DATA_DIR");
        override_str!(sqlite_path, "AGW_SQLITE_PATH");
        override_str!(plugin_dir, "AGW_PLUGIN_DIR");
        override_str!(host, "AGW_HOST");
        override_parsed!(port, "AGW_PORT");
        override_str!(ws_path, "AGW_WS_PATH");
        override_str!(metrics_path, "AGW_METRICS_PATH");
        override_str!(health_path, "AGW_HEALTH_PATH");
        override_parsed!(require_client_auth, "AGW_REQUIRE_CLIENT_AUTH");
        if let Some(v) = var("AGW_CLIENT_API_KEYS") {
            self.client_api_keys = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }
        override_parsed!(
            require_approvals_for_write_tools,
            "AGW_REQUIRE_APPROVALS_FOR_WRITE_TOOLS"
        );
        override_parsed!(rate_limit_rps, "AGW_RATE_LIMIT_RPS");
        override_parsed!(rate_limit_burst, "AGW_RATE_LIMIT_BURST");
        override_parsed!(max_context_messages, "AGW_MAX_CONTEXT_MESSAGES");
        override_parsed!(run_max_steps, "AGW_RUN_MAX_STEPS");
        override_parsed!(run_timeout_s, "AGW_RUN_TIMEOUT_S");
        override_parsed!(run_retry, "AGW_RUN_RETRY");
        override_str!(log_level, "AGW_LOG_LEVEL");
        override_parsed!(json_logs, "AGW_JSON_LOGS");

        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.port, 8787);
        assert_eq!(s.ws_path, "/ws");
        assert!(s.require_client_auth);
        assert!(s.require_approvals_for_write_tools);
        assert_eq!(s.run_max_steps, 6);
        assert_eq!(s.run_timeout_s, 45);
        assert_eq!(s.max_context_messages, 20);
    }

    #[test]
    fn partial_toml_fills_missing_fields_with_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "port = 9999\ninstance_id = \"agw-test\"").unwrap();
        let s = Settings::load(Some(f.path())).unwrap();
        assert_eq!(s.port, 9999);
        assert_eq!(s.instance_id, "agw-test");
        // untouched fields keep defaults
        assert_eq!(s.host, "127.0.0.1");
        assert_eq!(s.run_max_steps, 6);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let s = Settings::load(Some(Path::new("/nonexistent/agw.toml"))).unwrap();
        let mut expected = Settings::default();
        expected.apply_env().unwrap();
        assert_eq!(s, expected);
    }

    #[test]
    fn api_key_list_splits_on_commas() {
        // Exercise the splitting logic directly rather than mutating the
        // process environment (tests run in parallel).
        let raw = "alpha, beta,,gamma ";
        let keys: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|x| !x.is_empty())
            .map(str::to_owned)
            .collect();
        assert_eq!(keys, vec!["alpha", "beta", "gamma"]);
    }
}
