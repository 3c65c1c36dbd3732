//! Minimal Telegram Bot API client: the update types the webhook receives and the
//! handful of methods the bot calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use soko_core::chat::{ChatClient, ChatError, Screen};

// ============================================================================
// Inbound updates
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    pub message: Option<Message>,
    pub data: Option<String>,
}

// ============================================================================
// Outbound
// ============================================================================

#[derive(Serialize)]
struct InlineKeyboardButton<'a> {
    text: &'a str,
    callback_data: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    description: Option<String>,
}

pub struct TelegramClient {
    http: reqwest::Client,
    /// `{api_url}/bot{token}`; never logged.
    endpoint: String,
}

impl TelegramClient {
    pub fn new(api_url: &str, bot_token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("{}/bot{}", api_url.trim_end_matches('/'), bot_token),
        }
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<(), ChatError> {
        let response = self
            .http
            .post(format!("{}/{}", self.endpoint, method))
            .json(&body)
            .send()
            .await
            // The URL carries the bot token
            .map_err(|e| ChatError::Transport(e.without_url().to_string()))?;

        let reply: ApiResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Transport(e.without_url().to_string()))?;

        if !reply.ok {
            return Err(ChatError::Rejected {
                method: method.to_string(),
                description: reply.description.unwrap_or_default(),
            });
        }
        debug!(method, "Telegram call succeeded");
        Ok(())
    }

    pub async fn set_webhook(&self, url: &str, secret_token: &str) -> Result<(), ChatError> {
        self.call(
            "setWebhook",
            json!({
                "url": url,
                "secret_token": secret_token,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await?;
        info!("Webhook registered at {}", url);
        Ok(())
    }

    pub async fn delete_webhook(&self) -> Result<(), ChatError> {
        self.call("deleteWebhook", json!({})).await?;
        info!("Webhook removed");
        Ok(())
    }
}

fn inline_keyboard(screen: &Screen) -> Vec<Vec<InlineKeyboardButton<'_>>> {
    screen
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| InlineKeyboardButton { text: &b.label, callback_data: &b.payload })
                .collect()
        })
        .collect()
}

#[async_trait]
impl ChatClient for TelegramClient {
    async fn send_screen(&self, chat_id: i64, screen: &Screen) -> Result<(), ChatError> {
        let mut body = json!({ "chat_id": chat_id, "text": screen.text });
        if !screen.rows.is_empty() {
            body["reply_markup"] = json!({ "inline_keyboard": inline_keyboard(screen) });
        }
        self.call("sendMessage", body).await
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), ChatError> {
        let mut body = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        self.call("answerCallbackQuery", body).await
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), ChatError> {
        self.call("deleteMessage", json!({ "chat_id": chat_id, "message_id": message_id })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soko_core::chat::Button;

    #[test]
    fn test_update_with_callback_deserializes() {
        let raw = r#"{
            "update_id": 10,
            "callback_query": {
                "id": "4382",
                "from": {"id": 42, "is_bot": false, "first_name": "Ana", "username": "ana"},
                "message": {"message_id": 7, "date": 0, "chat": {"id": 42, "type": "private"}},
                "chat_instance": "-1",
                "data": "iQAB"
            }
        }"#;
        let update: Update = serde_json::from_str(raw).unwrap();
        let query = update.callback_query.unwrap();
        assert_eq!(query.from.username.as_deref(), Some("ana"));
        assert_eq!(query.message.unwrap().chat.id, 42);
        assert!(update.message.is_none());
    }

    #[test]
    fn test_inline_keyboard_keeps_row_layout() {
        let screen = Screen::text("pick")
            .with_row(vec![Button::new("a", "A"), Button::new("b", "B")])
            .with_button(Button::new("c", "C"));
        let value = serde_json::to_value(inline_keyboard(&screen)).unwrap();
        assert_eq!(value[0][1]["callback_data"], "B");
        assert_eq!(value[1][0]["text"], "c");
    }
}
