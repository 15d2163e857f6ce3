//! Minimal in-process channel.
//!
//! WebChat inbound messages arrive through the control-plane RPC rather
//! than a network listener, and outbound replies are delivered as bus
//! events, so this adapter is mostly a keep-alive placeholder kept for
//! parity with the other channels.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::domain::ChannelType;

use super::traits::{ChannelAdapter, InboundSender};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

pub struct WebChatChannel {
    channel_id: String,
    stop: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebChatChannel {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            stop: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ChannelAdapter for WebChatChannel {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Webchat
    }

    async fn start(&self, _inbound: InboundSender) -> Result<(), String> {
        self.stop.store(false, Ordering::Release);
        let stop = Arc::clone(&self.stop);
        let handle = tokio::spawn(async move {
            // No polling; just keep the adapter alive.
            while !stop.load(Ordering::Acquire) {
                tokio::time::sleep(KEEPALIVE_INTERVAL).await;
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }

    async fn send_message(&self, _chat_id: &str, _text: &str) -> Result<(), String> {
        // WebChat outbound is emitted by the gateway as events.
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn start_and_stop_are_clean() {
        let ch = WebChatChannel::new("webchat-1");
        let (tx, _rx) = mpsc::channel(8);
        ch.start(tx).await.unwrap();
        assert_eq!(ch.channel_id(), "webchat-1");
        ch.stop().await;
    }

    #[tokio::test]
    async fn send_is_a_noop() {
        let ch = WebChatChannel::new("webchat-1");
        assert!(ch.send_message("chat1", "hello").await.is_ok());
    }
}
