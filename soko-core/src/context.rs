use chrono::{DateTime, Utc};

use crate::train::{whole_seconds, Direction, TrainKey};

/// Half-open [start, end) search window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SearchWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start: whole_seconds(start), end: whole_seconds(end) }
    }
}

/// Accumulated state of one booking conversation.
///
/// There is no server-side session: every inline button carries the whole context,
/// and each step returns a copy with one more field set. Fields are private so a value
/// can only grow through the `with_*` constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestContext {
    pub(crate) cancel: bool,
    pub(crate) spectate: bool,
    pub(crate) direction: Option<Direction>,
    pub(crate) search_start: Option<DateTime<Utc>>,
    pub(crate) search_end: Option<DateTime<Utc>>,
    pub(crate) train_number: Option<i32>,
    pub(crate) departure: Option<DateTime<Utc>>,
    pub(crate) leave: bool,
}

/// Where a conversation stands, derived purely from which fields are populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Cancelled,
    ChooseDirection,
    ChooseWindow { direction: Direction },
    ChooseTrain { direction: Direction, window: SearchWindow },
    Act { key: TrainKey, leave: bool },
}

impl RequestContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn spectating() -> Self {
        Self { spectate: true, ..Self::default() }
    }

    pub fn with_direction(self, direction: Direction) -> Self {
        Self { direction: Some(direction), ..self }
    }

    pub fn with_window(self, window: SearchWindow) -> Self {
        Self {
            search_start: Some(window.start),
            search_end: Some(window.end),
            ..self
        }
    }

    pub fn with_train(self, key: TrainKey) -> Self {
        Self {
            train_number: Some(key.number),
            departure: Some(key.departure),
            ..self
        }
    }

    pub fn with_leave(self) -> Self {
        Self { leave: true, ..self }
    }

    pub fn with_cancel(self) -> Self {
        Self { cancel: true, ..self }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
    }

    pub fn is_spectating(&self) -> bool {
        self.spectate
    }

    pub fn wants_leave(&self) -> bool {
        self.leave
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn window(&self) -> Option<SearchWindow> {
        match (self.search_start, self.search_end) {
            (Some(start), Some(end)) => Some(SearchWindow::new(start, end)),
            _ => None,
        }
    }

    pub fn train(&self) -> Option<TrainKey> {
        match (self.train_number, self.departure) {
            (Some(number), Some(departure)) => Some(TrainKey::new(number, departure)),
            _ => None,
        }
    }

    /// Resolve the next step. Cancel overrides everything; otherwise the first missing
    /// field of direction, window and train decides, and only a complete context acts.
    pub fn step(&self) -> Step {
        if self.cancel {
            return Step::Cancelled;
        }
        match (self.direction, self.window(), self.train()) {
            (None, _, _) => Step::ChooseDirection,
            (Some(direction), None, _) => Step::ChooseWindow { direction },
            (Some(direction), Some(window), None) => Step::ChooseTrain { direction, window },
            (Some(_), Some(_), Some(key)) => Step::Act { key, leave: self.leave },
        }
    }
}

/// Lightweight token for "look again" and "leave" buttons sent outside the main flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainQuery {
    pub key: TrainKey,
    pub leave: bool,
}

impl TrainQuery {
    pub fn refresh(key: TrainKey) -> Self {
        Self { key, leave: false }
    }

    pub fn leave(key: TrainKey) -> Self {
        Self { key, leave: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> SearchWindow {
        SearchWindow::new(
            Utc.with_ymd_and_hms(2024, 5, 10, 2, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 10, 10, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_steps_advance_with_fields() {
        let ctx = RequestContext::empty();
        assert_eq!(ctx.step(), Step::ChooseDirection);

        let ctx = ctx.with_direction(Direction::NoviSadToBelgrade);
        assert_eq!(ctx.step(), Step::ChooseWindow { direction: Direction::NoviSadToBelgrade });

        let ctx = ctx.with_window(window());
        assert_eq!(
            ctx.step(),
            Step::ChooseTrain { direction: Direction::NoviSadToBelgrade, window: window() }
        );

        let key = TrainKey::new(7, window().start);
        let ctx = ctx.with_train(key);
        assert_eq!(ctx.step(), Step::Act { key, leave: false });
        assert_eq!(ctx.with_leave().step(), Step::Act { key, leave: true });
    }

    #[test]
    fn test_train_alone_does_not_act() {
        let key = TrainKey::new(7, window().start);
        assert_eq!(RequestContext::empty().with_train(key).step(), Step::ChooseDirection);

        let ctx = RequestContext::empty()
            .with_direction(Direction::NoviSadToBelgrade)
            .with_train(key)
            .with_leave();
        assert_eq!(ctx.step(), Step::ChooseWindow { direction: Direction::NoviSadToBelgrade });
    }

    #[test]
    fn test_cancel_overrides_everything() {
        let ctx = RequestContext::empty()
            .with_direction(Direction::BelgradeToNoviSad)
            .with_window(window())
            .with_train(TrainKey::new(7, window().start))
            .with_cancel();
        assert_eq!(ctx.step(), Step::Cancelled);
    }

    #[test]
    fn test_copy_constructors_keep_earlier_fields() {
        let base = RequestContext::spectating().with_direction(Direction::BelgradeToNoviSad);
        let next = base.with_window(window());
        assert!(next.is_spectating());
        assert_eq!(next.direction(), Some(Direction::BelgradeToNoviSad));
        // The earlier value is untouched.
        assert_eq!(base.window(), None);
    }
}
