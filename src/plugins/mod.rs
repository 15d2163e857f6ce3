//! Extension system.
//!
//! Plugins publish tools, channel adapter factories, named commands, and
//! message/run hooks through a [`PluginRegistry`].  Discovery is a static
//! built-in set registered at build time (the registry contract is the same
//! as a directory scan; Rust has no dynamic code loading).  Plugins are
//! trusted local code — no sandboxing.

pub mod loader;
pub mod math_tools;
pub mod registry;
pub mod web_search;

pub use loader::{LoadedPlugin, Plugin, builtin_plugins, load_plugins};
pub use registry::{ChannelFactory, CommandHandler, MessageHook, PluginRegistry, RunHook};
