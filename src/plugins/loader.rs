//! Static plugin loader.
//!
//! The built-in plugin set is iterated in sorted name order and each plugin
//! registers itself against the shared [`PluginRegistry`].  A failing plugin
//! is logged and skipped — it never aborts loading of the rest.

use std::sync::Arc;

use super::{
    math_tools::MathToolsPlugin,
    registry::PluginRegistry,
    web_search::WebSearchPlugin,
};

/// A statically linked extension.
pub trait Plugin: Send + Sync {
    /// Stable plugin name (also the sort key for load order).
    fn name(&self) -> &str;

    /// Publish tools / channels / commands / hooks.
    fn register(&self, registry: &mut PluginRegistry) -> Result<(), String>;
}

/// Record of a successfully loaded plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedPlugin {
    pub name: String,
}

/// The plugins compiled into this binary.
pub fn builtin_plugins() -> Vec<Arc<dyn Plugin>> {
    vec![Arc::new(MathToolsPlugin), Arc::new(WebSearchPlugin)]
}

/// Load `plugins` into `registry` in sorted name order, isolating failures.
pub fn load_plugins(
    plugins: Vec<Arc<dyn Plugin>>,
    registry: &mut PluginRegistry,
) -> Vec<LoadedPlugin> {
    let mut plugins = plugins;
    plugins.sort_by(|a, b| a.name().cmp(b.name()));

    let mut loaded = Vec::new();
    for plugin in plugins {
        let name = plugin.name().to_owned();
        match plugin.register(registry) {
            Ok(()) => {
                tracing::info!(plugin = %name, "plugin loaded");
                loaded.push(LoadedPlugin { name });
            }
            Err(err) => {
                tracing::warn!(plugin = %name, error = %err, "plugin load failed");
            }
        }
    }
    loaded
}

// ─── Tests ────────────────────────────────────────────────────────────────────
