use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Chat transport error: {0}")]
    Transport(String),
    #[error("Chat API rejected {method}: {description}")]
    Rejected { method: String, description: String },
}

/// An inline control. `payload` is always one callback token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Button {
    pub label: String,
    pub payload: String,
}

impl Button {
    pub fn new(label: impl Into<String>, payload: impl Into<String>) -> Self {
        Self { label: label.into(), payload: payload.into() }
    }
}

/// Outbound message: text plus rows of inline controls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Screen {
    pub text: String,
    pub rows: Vec<Vec<Button>>,
}

impl Screen {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), rows: Vec::new() }
    }

    pub fn with_row(mut self, row: Vec<Button>) -> Self {
        self.rows.push(row);
        self
    }

    pub fn with_button(self, button: Button) -> Self {
        self.with_row(vec![button])
    }

    pub fn buttons(&self) -> impl Iterator<Item = &Button> {
        self.rows.iter().flatten()
    }
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send_screen(&self, chat_id: i64, screen: &Screen) -> Result<(), ChatError>;

    /// Acknowledge an inline button press, optionally with a short toast.
    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), ChatError>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), ChatError>;
}
