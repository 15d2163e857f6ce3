//! Tool surface: the only door through which the agent reaches the
//! outside world.

pub mod builtin;
pub mod registry;
pub mod traits;

pub use builtin::builtins_registry;
pub use registry::{RegistryError, Tool, ToolRegistry};
pub use traits::{ToolHandler, ToolPermission, ToolSpec};
