//! Telegram Bot API transport.
//!
//! Delivers messages with inline keyboards, answers callback queries and,
//! when no webhook is configured, long-polls `getUpdates` and hands every
//! update to the bot dispatcher as its own task.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::bot::BotDispatcher;
use crate::collaborators::ChatTransport;
use crate::error::ServiceError;
use crate::models::{ActionButton, ConversationId};

/// Telegram enforces a 4096-character limit per message.
const MAX_MESSAGE_CHARS: usize = 4096;

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub data: Option<String>,
    /// The message the pressed button belongs to.
    pub message: Option<TelegramMessage>,
}

// ─── Client ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TelegramClient {
    api_base: String,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(token: &str, client: reqwest::Client) -> Self {
        Self {
            api_base: format!("https://api.telegram.org/bot{}", token.trim()),
            client,
        }
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        payload: &serde_json::Value,
    ) -> Result<Option<T>, ServiceError> {
        let url = format!("{}/{}", self.api_base, method);
        let context = format!("telegram {}", method);
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| ServiceError::from_transport(&context, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                // Blocked bot, kicked from chat or a bad token. Nothing to re-authorize.
                401 | 403 => ServiceError::Permanent(format!("{} returned {}: {}", context, status, body)),
                _ => ServiceError::from_status(&context, status, &body),
            });
        }

        let body: TelegramResponse<T> = response
            .json()
            .await
            .map_err(|e| ServiceError::Permanent(format!("{} parse error: {}", context, e)))?;
        if !body.ok {
            return Err(ServiceError::Permanent(format!(
                "{} returned ok=false: {}",
                context,
                body.description.unwrap_or_default()
            )));
        }
        Ok(body.result)
    }

    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, ServiceError> {
        let params = serde_json::json!({
            "offset": offset,
            "timeout": 30,
            "allowed_updates": ["message", "callback_query"]
        });
        Ok(self
            .call::<Vec<Update>>("getUpdates", &params)
            .await?
            .unwrap_or_default())
    }

    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), ServiceError> {
        let mut params = serde_json::json!({
            "url": url,
            "allowed_updates": ["message", "callback_query"]
        });
        if let Some(secret) = secret {
            params["secret_token"] = serde_json::Value::String(secret.to_string());
        }
        self.call::<bool>("setWebhook", &params).await?;
        Ok(())
    }

    pub async fn delete_webhook(&self) -> Result<(), ServiceError> {
        self.call::<bool>("deleteWebhook", &serde_json::json!({}))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn deliver_message(
        &self,
        conversation_id: ConversationId,
        text: &str,
        actions: &[Vec<ActionButton>],
    ) -> Result<(), ServiceError> {
        let mut payload = serde_json::json!({
            "chat_id": conversation_id,
            "text": truncate_message(text),
        });
        if !actions.is_empty() {
            payload["reply_markup"] = inline_keyboard(actions);
        }
        self.call::<serde_json::Value>("sendMessage", &payload)
            .await?;
        tracing::debug!("Telegram: sent message to chat {}", conversation_id);
        Ok(())
    }

    async fn acknowledge_action(
        &self,
        action_id: &str,
        text: Option<&str>,
    ) -> Result<(), ServiceError> {
        let mut payload = serde_json::json!({ "callback_query_id": action_id });
        if let Some(text) = text {
            payload["text"] = serde_json::Value::String(text.to_string());
        }
        self.call::<bool>("answerCallbackQuery", &payload).await?;
        Ok(())
    }
}

// ─── Polling loop ────────────────────────────────────────────────────────────

/// Long-poll `getUpdates` forever. Used when no webhook is configured.
pub async fn run_polling(client: TelegramClient, dispatcher: Arc<BotDispatcher>) {
    if let Err(e) = client.delete_webhook().await {
        tracing::warn!("Telegram deleteWebhook failed: {}", e);
    }
    tracing::info!("Telegram bot polling for updates");

    let mut offset: i64 = 0;
    loop {
        let updates = match client.get_updates(offset).await {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!("Telegram getUpdates error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.handle_update(update).await;
            });
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn truncate_message(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        text.to_string()
    } else {
        text.chars().take(MAX_MESSAGE_CHARS).collect()
    }
}

fn inline_keyboard(rows: &[Vec<ActionButton>]) -> serde_json::Value {
    let keyboard: Vec<Vec<serde_json::Value>> = rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|button| match button {
                    ActionButton::Callback { label, data } => {
                        serde_json::json!({ "text": label, "callback_data": data })
                    }
                    ActionButton::Link { label, url } => {
                        serde_json::json!({ "text": label, "url": url })
                    }
                })
                .collect()
        })
        .collect();
    serde_json::json!({ "inline_keyboard": keyboard })
}
