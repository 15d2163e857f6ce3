use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    channels::ChannelAdapter,
    domain::{AgentRun, Message},
    tools::{RegistryError, ToolHandler, ToolRegistry, ToolSpec},
};

/// Builds a channel adapter for a given channel id.
pub type ChannelFactory = Arc<dyn Fn(&str) -> Arc<dyn ChannelAdapter> + Send + Sync>;

/// A named command published by a plugin, invocable by operators.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, args: Value) -> Result<Value, String>;
}

/// Runs after a message has been ingested and persisted.
#[async_trait]
pub trait MessageHook: Send + Sync {
    async fn on_message(&self, message: &Message);
}

/// Runs after an agent run reaches a terminal status.
#[async_trait]
pub trait RunHook: Send + Sync {
    async fn on_run(&self, run: &AgentRun);
}

/// Registration surface handed to each plugin.
///
/// Tools delegate to the shared [`ToolRegistry`] (duplicate names are still
/// rejected there); channels, commands and hooks are collected here and
/// consumed by the gateway after loading.
pub struct PluginRegistry {
    pub tools: ToolRegistry,
    channels: HashMap<String, ChannelFactory>,
    commands: HashMap<String, Arc<dyn CommandHandler>>,
    hooks_pre_message: Vec<Arc<dyn MessageHook>>,
    hooks_post_run: Vec<Arc<dyn RunHook>>,
}

impl PluginRegistry {
    pub fn new(tools: ToolRegistry) -> Self {
        Self {
            tools,
            channels: HashMap::new(),
            commands: HashMap::new(),
            hooks_pre_message: Vec::new(),
            hooks_post_run: Vec::new(),
        }
    }

    pub fn register_tool(
        &mut self,
        spec: ToolSpec,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), RegistryError> {
        self.tools.register(spec, handler)
    }

    /// Move the accumulated tool set out of the registry once loading is
    /// finished (the gateway freezes it behind an `Arc` afterwards).
    pub fn take_tools(&mut self) -> ToolRegistry {
        std::mem::take(&mut self.tools)
    }

    pub fn register_channel(&mut self, name: impl Into<String>, factory: ChannelFactory) {
        self.channels.insert(name.into(), factory);
    }

    pub fn register_command(&mut self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.commands.insert(name.into(), handler);
    }

    pub fn hook_pre_message(&mut self, hook: Arc<dyn MessageHook>) {
        self.hooks_pre_message.push(hook);
    }

    pub fn hook_post_run(&mut self, hook: Arc<dyn RunHook>) {
        self.hooks_post_run.push(hook);
    }

    pub fn channel_factory(&self, name: &str) -> Option<ChannelFactory> {
        self.channels.get(name).cloned()
    }

    pub fn command(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.commands.get(name).cloned()
    }

    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn pre_message_hooks(&self) -> &[Arc<dyn MessageHook>] {
        &self.hooks_pre_message
    }

    pub fn post_run_hooks(&self) -> &[Arc<dyn RunHook>] {
        &self.hooks_post_run
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
