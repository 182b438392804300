use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tracing::{info, warn};

/// Result of one delivery attempt. `Blocked` means the recipient refused the
/// bot and should be excluded until it comes back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Blocked,
    Failed(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// `target` is a chat id: a broadcast channel or a subscriber's private chat.
    async fn send(&self, target: i64, html: &str) -> DeliveryOutcome;
}

/// Telegram Bot API `sendMessage` with HTML parse mode.
pub struct TelegramTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl TelegramTransport {
    pub fn new(client: reqwest::Client, api_base: &str, token: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), token),
        }
    }
}

#[async_trait]
impl NotificationTransport for TelegramTransport {
    async fn send(&self, target: i64, html: &str) -> DeliveryOutcome {
        let payload = json!({
            "chat_id": target,
            "text": html,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        let response = match self.client.post(&self.endpoint).json(&payload).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(target, error = %err, "telegram request failed");
                return DeliveryOutcome::Failed(err.to_string());
            }
        };
        match response.status() {
            status if status.is_success() => DeliveryOutcome::Delivered,
            StatusCode::FORBIDDEN => {
                info!(target, "recipient blocked the bot");
                DeliveryOutcome::Blocked
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(target, %status, body = %body, "telegram rejected message");
                DeliveryOutcome::Failed(format!("http status {status}"))
            }
        }
    }
}

/// Dry-run transport: every message is logged and reported delivered.
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn send(&self, target: i64, html: &str) -> DeliveryOutcome {
        info!(target, chars = html.chars().count(), text = %html, "dry-run delivery");
        DeliveryOutcome::Delivered
    }
}

/// Keeps delivered messages in memory and answers with a scripted outcome
/// per target.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<(i64, String)>>,
    outcomes: Mutex<Vec<(i64, DeliveryOutcome)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All later sends to `target` answer with `outcome`.
    pub fn script(&self, target: i64, outcome: DeliveryOutcome) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.retain(|(t, _)| *t != target);
            outcomes.push((target, outcome));
        }
    }

    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, target: i64) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(t, _)| *t == target)
            .map(|(_, text)| text)
            .collect()
    }
}

#[async_trait]
impl NotificationTransport for MemoryTransport {
    async fn send(&self, target: i64, html: &str) -> DeliveryOutcome {
        let outcome = {
            let outcomes = self.outcomes.lock().ok();
            let scripted = outcomes.as_ref().and_then(|o| {
                o.iter()
                    .find(|(t, _)| *t == target)
                    .map(|(_, outcome)| outcome.clone())
            });
            scripted.unwrap_or(DeliveryOutcome::Delivered)
        };
        if outcome.is_delivered() {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push((target, html.to_string()));
            }
        }
        outcome
    }
}
