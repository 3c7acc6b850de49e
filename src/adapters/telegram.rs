//! Telegram bot notifications
//!
//! Sends operator alerts to a single chat through the Bot API.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::TelegramConfig;
use crate::error::{FundwatchError, Result};
use crate::supervisor::{AlertLevel, Notifier};

/// Telegram message limit is 4096 characters
const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    endpoint: String,
    chat_id: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Arc<Self> {
        Arc::new(Self {
            client: Client::new(),
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.api_url.trim_end_matches('/'),
                config.bot_token
            ),
            chat_id: config.chat_id.clone(),
        })
    }

    /// Notifier when configured, `None` means alerts are only logged
    pub fn from_config(config: Option<&TelegramConfig>) -> Option<Arc<Self>> {
        config.map(|c| {
            info!("Telegram notifications enabled");
            Self::new(c)
        })
    }

    pub async fn send_message(&self, text: &str) -> Result<()> {
        let text = truncate(text);
        let message = SendMessage {
            chat_id: &self.chat_id,
            text: &text,
            disable_web_page_preview: true,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&message)
            .send()
            .await
            .map_err(|e| FundwatchError::Network(format!("Telegram request failed: {}", e)))?;

        if resp.status().is_success() {
            debug!("Telegram notification sent");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            error!("Telegram notification failed: {} - {}", status, body);
            Err(FundwatchError::Network(format!("HTTP {}: {}", status, body)))
        }
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_MESSAGE_CHARS).collect();
    out.push_str("\n…");
    out
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, title: &str, body: &str, _level: AlertLevel) -> Result<()> {
        self.send_message(&format!("{}\n\n{}", title, body)).await
    }
}
