//! WhatsApp Business channel adapter (interface-level placeholder).
//!
//! The real integration is webhook-driven; this adapter keeps the contract
//! and a keep-alive loop so the gateway can manage its lifecycle uniformly.

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

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

pub struct WhatsAppBusinessChannel {
    channel_id: String,
    stop: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WhatsAppBusinessChannel {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            stop: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ChannelAdapter for WhatsAppBusinessChannel {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::WhatsappBusiness
    }

    async fn start(&self, _inbound: InboundSender) -> Result<(), String> {
        self.stop.store(false, Ordering::Release);
        let stop = Arc::clone(&self.stop);
        let handle = tokio::spawn(async move {
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

    async fn send_message(&self, chat_id: &str, _text: &str) -> Result<(), String> {
        Err(format!(
            "whatsapp_business: cannot deliver to {chat_id}, cloud API not configured"
        ))
    }
}
