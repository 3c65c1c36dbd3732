//! Conversation engine.
//!
//! Each callback carries its full decision context, so handling one is a pure function of
//! the token, the store and the clock. The step to render is derived from which context
//! fields are set; see [`RequestContext::step`].

use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use soko_booking::windows::{search_windows, window_label};
use soko_booking::{BookingError, BookingService};
use soko_core::chat::{Button, ChatClient, ChatError, Screen};
use soko_core::codec::{self, CallbackToken};
use soko_core::time::{to_local, Clock};
use soko_core::{Direction, Passenger, RequestContext, SearchWindow, Slot, Step, TrainKey, TrainQuery};

use crate::event::{CallbackEvent, InboundEvent, MessageEvent};

pub const SOKO_MARKER: &str = "𓅃";

const USAGE: &str = "/start - find company for a train between Novi Sad and Belgrade\n\
/spectate - browse trains and passengers without joining";
const SPECTATE_NOTICE: &str = "Spectator mode: you can look around, but you will not join or leave any train.";

const NOTICE_CANCELLED: &str = "Cancelled";
const NOTICE_BOARDED: &str = "You are on the passenger list";
const NOTICE_LEFT: &str = "You left the train";
const NOTICE_NOT_FOUND: &str = "Train not found";
const NOTICE_NO_USERNAME: &str = "Set a Telegram username to join trains";
const NOTICE_FAILED: &str = "Something went wrong, please try again";

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error(transparent)]
    Booking(#[from] BookingError),
}

/// Toast shown when acknowledging a callback.
type Notice = Option<&'static str>;

pub struct ControlService {
    booking: Arc<BookingService>,
    chat: Arc<dyn ChatClient>,
    clock: Arc<dyn Clock>,
}

impl ControlService {
    pub fn new(booking: Arc<BookingService>, chat: Arc<dyn ChatClient>, clock: Arc<dyn Clock>) -> Self {
        Self { booking, chat, clock }
    }

    pub async fn handle(&self, event: InboundEvent) -> Result<(), ControlError> {
        match event {
            InboundEvent::Message(message) => self.on_message(message).await,
            InboundEvent::Callback(callback) => self.on_callback(callback).await,
            InboundEvent::Ignored => Ok(()),
        }
    }

    async fn on_message(&self, message: MessageEvent) -> Result<(), ControlError> {
        // "/start@SokoBot" in group chats
        let command = message
            .text
            .split_whitespace()
            .next()
            .map(|c| c.split_once('@').map_or(c, |(head, _)| head));

        let screen = match command {
            Some("/start") => direction_screen(RequestContext::empty()),
            Some("/spectate") => direction_screen(RequestContext::spectating()),
            _ => Screen::text(USAGE),
        };
        self.chat.send_screen(message.chat_id, &screen).await?;
        Ok(())
    }

    async fn on_callback(&self, callback: CallbackEvent) -> Result<(), ControlError> {
        let Some(token) = callback.data.as_deref().and_then(codec::decode) else {
            debug!(callback = %callback.id, "Ignoring callback without a valid token");
            self.chat.answer_callback(&callback.id, None).await?;
            return Ok(());
        };

        let result = match token {
            CallbackToken::Context(ctx) => self.on_context(&callback, ctx).await,
            CallbackToken::Query(query) => self.on_query(&callback, query).await,
        };

        let notice = match &result {
            Ok(notice) => *notice,
            Err(_) => Some(NOTICE_FAILED),
        };
        self.chat.answer_callback(&callback.id, notice).await?;

        if result.is_ok() {
            if let Some(message_id) = callback.message_id {
                if let Err(e) = self.chat.delete_message(callback.chat_id, message_id).await {
                    debug!(message_id, "Could not remove previous screen: {}", e);
                }
            }
        }

        result.map(|_| ())
    }

    async fn on_context(&self, callback: &CallbackEvent, ctx: RequestContext) -> Result<Notice, ControlError> {
        match ctx.step() {
            Step::Cancelled => Ok(Some(NOTICE_CANCELLED)),
            Step::ChooseDirection => {
                self.chat.send_screen(callback.chat_id, &direction_screen(ctx)).await?;
                Ok(None)
            }
            Step::ChooseWindow { direction } => {
                let windows = search_windows(self.clock.now());
                self.chat
                    .send_screen(callback.chat_id, &window_screen(ctx, direction, &windows))
                    .await?;
                Ok(None)
            }
            Step::ChooseTrain { direction, window } => {
                let slots = self.booking.find_trains(Some(direction), window.start, window.end).await?;
                let viewer = callback.handle();
                let screen = train_list_screen(ctx, direction, window, &slots, viewer.as_deref());
                self.chat.send_screen(callback.chat_id, &screen).await?;
                Ok(None)
            }
            Step::Act { key, leave } => self.act(callback, key, leave, ctx.is_spectating()).await,
        }
    }

    /// Join unless already aboard; leave when aboard and asked to. Anything else just
    /// shows the train.
    async fn act(&self, callback: &CallbackEvent, key: TrainKey, leave: bool, spectating: bool) -> Result<Notice, ControlError> {
        let Some(slot) = self.booking.find_train(&key).await? else {
            return Ok(Some(NOTICE_NOT_FOUND));
        };

        if spectating {
            self.send_tracker(callback.chat_id, &slot, None, true).await?;
            return Ok(None);
        }

        let Some(passenger) = callback.passenger() else {
            return Ok(Some(NOTICE_NO_USERNAME));
        };

        let aboard = slot.has_passenger(&passenger.handle);
        let (slot, notice, joined) = match (aboard, leave) {
            (false, false) => match self.booking.add_passenger(&key, &passenger).await {
                Ok(slot) => (slot, Some(NOTICE_BOARDED), true),
                Err(e) if e.is_not_found() => return Ok(Some(NOTICE_NOT_FOUND)),
                Err(e) => return Err(e.into()),
            },
            (true, true) => match self.booking.remove_passenger(&key, &passenger.handle).await {
                Ok(slot) => (slot, Some(NOTICE_LEFT), false),
                Err(e) if e.is_not_found() => return Ok(Some(NOTICE_NOT_FOUND)),
                Err(e) => return Err(e.into()),
            },
            _ => (slot, None, false),
        };

        if joined {
            self.notify_join(&slot, &passenger).await;
        }
        // A notice means the store changed; a lost tracker must not report that as failed.
        let tracker = self.send_tracker(callback.chat_id, &slot, Some(&passenger.handle), false).await;
        settle_tracker(tracker, notice, &key)
    }

    /// Refresh or leave from a previously sent tracker. Never joins.
    async fn on_query(&self, callback: &CallbackEvent, query: TrainQuery) -> Result<Notice, ControlError> {
        let Some(slot) = self.booking.find_train(&query.key).await? else {
            return Ok(Some(NOTICE_NOT_FOUND));
        };

        let viewer = callback.handle();
        let aboard = viewer.as_deref().is_some_and(|h| slot.has_passenger(h));

        let (slot, notice) = match viewer.as_deref() {
            Some(handle) if query.leave && aboard => {
                match self.booking.remove_passenger(&query.key, handle).await {
                    Ok(slot) => (slot, Some(NOTICE_LEFT)),
                    Err(e) if e.is_not_found() => return Ok(Some(NOTICE_NOT_FOUND)),
                    Err(e) => return Err(e.into()),
                }
            }
            _ => (slot, None),
        };

        let tracker = self.send_tracker(callback.chat_id, &slot, viewer.as_deref(), false).await;
        settle_tracker(tracker, notice, &query.key)
    }

    async fn send_tracker(&self, chat_id: i64, slot: &Slot, viewer: Option<&str>, spectating: bool) -> Result<(), ChatError> {
        self.chat.send_screen(chat_id, &tracker_screen(slot, viewer, spectating)).await
    }

    /// Best effort: every recipient is attempted, failures are only logged.
    async fn notify_join(&self, slot: &Slot, joined: &Passenger) {
        let key = slot.train.key();
        let screen = Screen::text(format!("{} joined {}", joined, describe_train(slot)))
            .with_button(Button::new("Show train", CallbackToken::Query(TrainQuery::refresh(key)).encode()));

        let recipients: Vec<&Passenger> = slot
            .passengers
            .iter()
            .filter(|p| p.handle != joined.handle)
            .collect();

        let results = join_all(recipients.iter().map(|p| self.chat.send_screen(p.chat_id, &screen))).await;

        let mut delivered = 0;
        for (recipient, result) in recipients.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => warn!(handle = %recipient.handle, train = key.number, "Join notification failed: {}", e),
            }
        }
        info!(train = key.number, delivered, total = recipients.len(), "Join notifications sent");
    }
}

fn settle_tracker(sent: Result<(), ChatError>, notice: Notice, key: &TrainKey) -> Result<Notice, ControlError> {
    match sent {
        Ok(()) => Ok(notice),
        Err(e) if notice.is_some() => {
            warn!(train = key.number, "Tracker not delivered after update: {}", e);
            Ok(notice)
        }
        Err(e) => Err(e.into()),
    }
}

// ===== Screens =====

fn context_button(label: impl Into<String>, ctx: RequestContext) -> Button {
    Button::new(label, CallbackToken::Context(ctx).encode())
}

fn cancel_row(ctx: RequestContext) -> Vec<Button> {
    vec![context_button("Cancel", ctx.with_cancel())]
}

fn route(direction: Direction) -> String {
    let to = match direction {
        Direction::NoviSadToBelgrade => Direction::BelgradeToNoviSad.departure_station(),
        Direction::BelgradeToNoviSad => Direction::NoviSadToBelgrade.departure_station(),
    };
    format!("{} → {}", direction.departure_station(), to)
}

fn hh_mm(instant: chrono::DateTime<chrono::Utc>) -> String {
    to_local(instant).format("%H:%M").to_string()
}

fn describe_train(slot: &Slot) -> String {
    let train = &slot.train;
    let marker = if train.is_soko() { format!("{} ", SOKO_MARKER) } else { String::new() };
    format!(
        "{}#{} {} {} ({})",
        marker,
        train.number,
        route(train.direction),
        hh_mm(train.departure),
        to_local(train.departure).format("%d.%m.")
    )
}

fn direction_screen(ctx: RequestContext) -> Screen {
    let prompt = "Which way are you going?";
    let text = if ctx.is_spectating() {
        format!("{}\n\n{}", SPECTATE_NOTICE, prompt)
    } else {
        prompt.to_string()
    };

    Direction::ALL
        .iter()
        .fold(Screen::text(text), |screen, &d| {
            screen.with_button(context_button(route(d), ctx.with_direction(d)))
        })
        .with_row(cancel_row(ctx))
}

fn window_screen(ctx: RequestContext, direction: Direction, windows: &[SearchWindow]) -> Screen {
    windows
        .iter()
        .fold(Screen::text(format!("{}\nWhen?", route(direction))), |screen, w| {
            screen.with_button(context_button(window_label(w), ctx.with_window(*w)))
        })
        .with_row(cancel_row(ctx))
}

fn train_list_screen(
    ctx: RequestContext,
    direction: Direction,
    window: SearchWindow,
    slots: &[Slot],
    viewer: Option<&str>,
) -> Screen {
    if slots.is_empty() {
        return Screen::text(format!("{}, {}\nNo trains in this window.", route(direction), window_label(&window)))
            .with_row(cancel_row(ctx));
    }

    let mut screen = Screen::text(format!(
        "{}, {}\nPick a train. The number shows who is already going.",
        route(direction),
        window_label(&window)
    ));

    for slot in slots {
        let key = slot.train.key();
        let marker = if slot.train.is_soko() { SOKO_MARKER } else { "" };
        let count = match slot.passengers.len() {
            0 => "-".to_string(),
            n => n.to_string(),
        };
        let label = format!("{}{} · {}", marker, hh_mm(slot.train.departure), count);

        let mut row = vec![context_button(label, ctx.with_train(key))];
        if !ctx.is_spectating() && viewer.is_some_and(|h| slot.has_passenger(h)) {
            row.push(context_button("Leave", ctx.with_train(key).with_leave()));
        }
        screen = screen.with_row(row);
    }

    screen.with_row(cancel_row(ctx))
}

fn tracker_screen(slot: &Slot, viewer: Option<&str>, spectating: bool) -> Screen {
    let key = slot.train.key();
    let mut text = format!(
        "{}\nArrives {}\n\nPassengers ({}):",
        describe_train(slot),
        hh_mm(slot.train.arrival),
        slot.passengers.len()
    );
    if slot.passengers.is_empty() {
        text.push_str("\nnobody yet");
    }
    for passenger in &slot.passengers {
        text.push('\n');
        text.push_str(&passenger.to_string());
    }
    if spectating {
        text.push_str("\n\n");
        text.push_str(SPECTATE_NOTICE);
    }

    let mut row = vec![Button::new("Refresh", CallbackToken::Query(TrainQuery::refresh(key)).encode())];
    if !spectating && viewer.is_some_and(|h| slot.has_passenger(h)) {
        row.push(Button::new("Leave", CallbackToken::Query(TrainQuery::leave(key)).encode()));
    }
    Screen::text(text).with_row(row)
}
