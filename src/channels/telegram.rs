//! Telegram channel adapter (interface-level placeholder).
//!
//! Holds the adapter contract and a polling loop skeleton; the Bot API
//! integration lives outside this crate's scope.  Without a bot token the
//! adapter starts, idles, and reports sends as undeliverable.

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

const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct TelegramChannel {
    channel_id: String,
    bot_token: Option<String>,
    stop: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramChannel {
    pub fn new(channel_id: impl Into<String>, bot_token: Option<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            bot_token,
            stop: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ChannelAdapter for TelegramChannel {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Telegram
    }

    async fn start(&self, _inbound: InboundSender) -> Result<(), String> {
        if self.bot_token.is_none() {
            tracing::info!(channel_id = %self.channel_id, "telegram: no bot token, running idle");
        }
        self.stop.store(false, Ordering::Release);
        let stop = Arc::clone(&self.stop);
        let handle = tokio::spawn(async move {
            while !stop.load(Ordering::Acquire) {
                // Long-poll getUpdates would go here.
                tokio::time::sleep(POLL_INTERVAL).await;
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

    async fn send_message(&self, chat_id: &str, _text: &str) -> Result<(), String> {
        match &self.bot_token {
            Some(_) => Err("telegram: outbound delivery not wired".to_owned()),
            None => Err(format!(
                "telegram: cannot deliver to {chat_id}, no bot token configured"
            )),
        }
    }
}
