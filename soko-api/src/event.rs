use soko_core::Passenger;

use crate::telegram::Update;

/// What the webhook received, resolved once at the entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(MessageEvent),
    Callback(CallbackEvent),
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub chat_id: i64,
    pub text: String,
}

/// An inline button press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEvent {
    pub id: String,
    /// Chat the pressed button lives in; the user's private chat when unknown.
    pub chat_id: i64,
    pub user_id: i64,
    pub message_id: Option<i64>,
    pub username: Option<String>,
    pub data: Option<String>,
}

impl CallbackEvent {
    /// The presser as a passenger. Users without a username cannot board.
    pub fn passenger(&self) -> Option<Passenger> {
        let username = self.username.as_deref()?;
        Passenger::new(username, self.user_id).ok()
    }

    pub fn handle(&self) -> Option<String> {
        self.passenger().map(|p| p.handle)
    }
}

impl From<Update> for InboundEvent {
    fn from(update: Update) -> Self {
        if let Some(query) = update.callback_query {
            let message = query.message.as_ref();
            return InboundEvent::Callback(CallbackEvent {
                id: query.id,
                chat_id: message.map_or(query.from.id, |m| m.chat.id),
                user_id: query.from.id,
                message_id: message.map(|m| m.message_id),
                username: query.from.username,
                data: query.data,
            });
        }

        match update.message {
            Some(message) => match message.text {
                Some(text) => InboundEvent::Message(MessageEvent { chat_id: message.chat.id, text }),
                None => InboundEvent::Ignored,
            },
            None => InboundEvent::Ignored,
        }
    }
}
