use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::train::{Direction, Passenger, Slot, Train, TrainKey};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Constraint violated: {0}")]
    Constraint(String),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl RepositoryError {
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(err))
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// A stored train moved to a new schedule. Its memberships are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reschedule {
    pub previous: TrainKey,
    pub train: Train,
}

/// Only the service tag changed; passengers stay aboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retag {
    pub key: TrainKey,
    pub tag: Option<String>,
}

/// Writes produced by one reconciliation cycle. Applied as a single unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimetableChanges {
    pub cancelled: Vec<TrainKey>,
    pub rescheduled: Vec<Reschedule>,
    pub retagged: Vec<Retag>,
    pub inserted: Vec<Train>,
}

impl TimetableChanges {
    pub fn is_empty(&self) -> bool {
        self.cancelled.is_empty()
            && self.rescheduled.is_empty()
            && self.retagged.is_empty()
            && self.inserted.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub trains: Vec<TrainKey>,
    pub passengers: Vec<String>,
}

/// Repository for trains, passengers and the membership relation between them.
///
/// Trains are addressed by natural key only. Implementations enforce uniqueness of
/// passenger handles, of train natural keys and of membership edges, and refuse to
/// delete a train that still has memberships.
#[async_trait]
pub trait TrainRepository: Send + Sync {
    /// Point lookup with the resolved passenger list.
    async fn find_slot(&self, key: &TrainKey) -> RepositoryResult<Option<Slot>>;

    /// Trains with `arrival >= from` and `departure < to`, ordered by departure.
    async fn find_slots(
        &self,
        direction: Option<Direction>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RepositoryResult<Vec<Slot>>;

    /// Trains of one direction departing within `[from, to)`.
    async fn trains_departing(
        &self,
        direction: Direction,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RepositoryResult<Vec<Train>>;

    async fn find_passenger(&self, handle: &str) -> RepositoryResult<Option<Passenger>>;

    /// Creates the passenger, or refreshes the chat address of an existing one.
    async fn upsert_passenger(&self, passenger: &Passenger) -> RepositoryResult<()>;

    /// Insert-if-absent. Returns `false` when the edge already existed or either end is missing.
    async fn insert_membership(&self, key: &TrainKey, handle: &str) -> RepositoryResult<bool>;

    /// Returns `false` when there was no such edge.
    async fn delete_membership(&self, key: &TrainKey, handle: &str) -> RepositoryResult<bool>;

    /// Deletes the passenger only if it has no memberships left.
    async fn delete_passenger_if_unboarded(&self, handle: &str) -> RepositoryResult<bool>;

    /// Applies a reconciliation result atomically: all of it or none of it.
    async fn apply_timetable(&self, changes: &TimetableChanges) -> RepositoryResult<()>;

    /// Removes trains that arrived before `now` and passengers left without trains.
    async fn purge_arrived(&self, now: DateTime<Utc>) -> RepositoryResult<PurgeReport>;

    async fn count_trains(&self) -> RepositoryResult<i64>;
}
