use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::domain::ChannelType;

/// A raw inbound message as delivered by a channel adapter, before
/// sanitization and policy checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub channel_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub text: String,
    pub is_dm: bool,
    pub is_group: bool,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub metadata: Value,
}

impl InboundEnvelope {
    /// A direct message envelope with empty attachments/metadata.
    pub fn dm(
        channel_id: impl Into<String>,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            is_dm: true,
            is_group: false,
            attachments: Vec::new(),
            metadata: Value::Object(Default::default()),
        }
    }
}

/// Sender half through which adapters push envelopes into the gateway.
pub type InboundSender = mpsc::Sender<InboundEnvelope>;

/// Transport abstraction for a chat channel.
///
/// Implementations must be `Send + Sync` so they can be held as
/// `Arc<dyn ChannelAdapter>` by the gateway.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// The channel id this adapter serves (e.g. `"webchat-1"`).
    fn channel_id(&self) -> &str;

    /// Transport family.
    fn channel_type(&self) -> ChannelType;

    /// Begin receiving; inbound messages are forwarded on `inbound`.
    /// Returns once the adapter is ready (long-running work is spawned).
    async fn start(&self, inbound: InboundSender) -> Result<(), String>;

    /// Stop receiving and cancel background work.
    async fn stop(&self);

    /// Deliver an outbound message to a chat on this channel.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), String>;
}
