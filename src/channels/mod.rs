//! Chat-channel adapters.
//!
//! Adapters are owned by the gateway and forward inbound envelopes over an
//! `mpsc` sender handed to [`ChannelAdapter::start`].  The network-facing
//! integrations (Telegram, WhatsApp Business) are interface-level
//! placeholders: they hold the adapter contract and a keep-alive loop but
//! do not speak the vendor APIs.

pub mod telegram;
pub mod traits;
pub mod webchat;
pub mod whatsapp;

pub use telegram::TelegramChannel;
pub use traits::{ChannelAdapter, InboundEnvelope, InboundSender};
pub use webchat::WebChatChannel;
pub use whatsapp::WhatsAppBusinessChannel;
