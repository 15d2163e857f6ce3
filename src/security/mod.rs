//! Security layer: sender/tool admission, rate limiting, input
//! sanitization, and control-plane key verification.

pub mod auth;
pub mod policy;
pub mod rate_limit;
pub mod sanitize;

pub use auth::verify_client_key;
pub use policy::{PolicyEngine, SenderContext, ToolDecision};
pub use rate_limit::RateLimiter;
pub use sanitize::sanitize_text;
