use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::warn;

use soko_core::repository::{PurgeReport, RepositoryError, RepositoryResult, TimetableChanges, TrainRepository};
use soko_core::{Direction, Passenger, Slot, Train, TrainKey};

/// Process-local repository with the same constraints as the Postgres schema.
/// Used by tests and for running the bot without a database.
#[derive(Default)]
pub struct InMemoryTrainRepository {
    state: RwLock<State>,
}

#[derive(Debug, Clone, Default)]
struct State {
    next_id: i64,
    trains: BTreeMap<TrainKey, StoredTrain>,
    passengers: HashMap<String, Passenger>,
    /// (train id, passenger handle)
    memberships: BTreeSet<(i64, String)>,
}

#[derive(Debug, Clone)]
struct StoredTrain {
    id: i64,
    train: Train,
}

impl State {
    fn slot(&self, stored: &StoredTrain) -> Slot {
        let mut passengers: Vec<Passenger> = self
            .memberships
            .range((stored.id, String::new())..)
            .take_while(|(id, _)| *id == stored.id)
            .filter_map(|(_, handle)| self.passengers.get(handle).cloned())
            .collect();
        passengers.sort_by(|a, b| a.handle.cmp(&b.handle));
        Slot::new(stored.train.clone(), passengers)
    }

    fn clear_memberships(&mut self, train_id: i64) {
        self.memberships.retain(|(id, _)| *id != train_id);
    }

    fn insert(&mut self, train: Train) -> RepositoryResult<()> {
        let key = train.key();
        if self.trains.contains_key(&key) {
            return Err(RepositoryError::Constraint(format!("train {} already exists", key)));
        }
        self.next_id += 1;
        self.trains.insert(key, StoredTrain { id: self.next_id, train });
        Ok(())
    }

    fn delete_train(&mut self, key: &TrainKey) -> RepositoryResult<()> {
        let Some(stored) = self.trains.get(key) else {
            return Ok(());
        };
        let id = stored.id;
        if self.memberships.iter().any(|(train_id, _)| *train_id == id) {
            return Err(RepositoryError::Constraint(format!("train {} still has passengers", key)));
        }
        self.trains.remove(key);
        Ok(())
    }

    fn apply(&mut self, changes: &TimetableChanges) -> RepositoryResult<()> {
        for key in &changes.cancelled {
            if let Some(id) = self.trains.get(key).map(|s| s.id) {
                self.clear_memberships(id);
            }
            self.delete_train(key)?;
        }

        for reschedule in &changes.rescheduled {
            let Some(stored) = self.trains.remove(&reschedule.previous) else {
                warn!("Rescheduled train {} was no longer stored", reschedule.previous);
                continue;
            };
            self.clear_memberships(stored.id);
            let key = reschedule.train.key();
            if self.trains.contains_key(&key) {
                return Err(RepositoryError::Constraint(format!("train {} already exists", key)));
            }
            self.trains.insert(key, StoredTrain { id: stored.id, train: reschedule.train.clone() });
        }

        for retag in &changes.retagged {
            if let Some(stored) = self.trains.get_mut(&retag.key) {
                stored.train.tag = retag.tag.clone();
            }
        }

        for train in &changes.inserted {
            if self.trains.contains_key(&train.key()) {
                warn!("Train {} already stored, insert skipped", train.key());
                continue;
            }
            self.insert(train.clone())?;
        }

        Ok(())
    }
}

impl InMemoryTrainRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a train directly, bypassing reconciliation.
    pub async fn insert_train(&self, train: Train) -> RepositoryResult<()> {
        self.state.write().await.insert(train)
    }
}

#[async_trait]
impl TrainRepository for InMemoryTrainRepository {
    async fn find_slot(&self, key: &TrainKey) -> RepositoryResult<Option<Slot>> {
        let state = self.state.read().await;
        Ok(state.trains.get(key).map(|stored| state.slot(stored)))
    }

    async fn find_slots(
        &self,
        direction: Option<Direction>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RepositoryResult<Vec<Slot>> {
        let state = self.state.read().await;
        // BTreeMap order is (number, departure); re-sort by departure.
        let mut slots: Vec<Slot> = state
            .trains
            .values()
            .filter(|s| direction.map_or(true, |d| s.train.direction == d))
            .filter(|s| s.train.arrival >= from && s.train.departure < to)
            .map(|s| state.slot(s))
            .collect();
        slots.sort_by_key(|s| (s.train.departure, s.train.number));
        Ok(slots)
    }

    async fn trains_departing(
        &self,
        direction: Direction,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RepositoryResult<Vec<Train>> {
        let state = self.state.read().await;
        let mut trains: Vec<Train> = state
            .trains
            .values()
            .map(|s| &s.train)
            .filter(|t| t.direction == direction && t.departure >= from && t.departure < to)
            .cloned()
            .collect();
        trains.sort_by_key(|t| (t.departure, t.number));
        Ok(trains)
    }

    async fn find_passenger(&self, handle: &str) -> RepositoryResult<Option<Passenger>> {
        Ok(self.state.read().await.passengers.get(handle).cloned())
    }

    async fn upsert_passenger(&self, passenger: &Passenger) -> RepositoryResult<()> {
        if passenger.handle.is_empty() {
            return Err(RepositoryError::Constraint("passenger handle must not be empty".to_string()));
        }
        self.state
            .write()
            .await
            .passengers
            .insert(passenger.handle.clone(), passenger.clone());
        Ok(())
    }

    async fn insert_membership(&self, key: &TrainKey, handle: &str) -> RepositoryResult<bool> {
        let mut state = self.state.write().await;
        let Some(id) = state.trains.get(key).map(|s| s.id) else {
            return Ok(false);
        };
        if !state.passengers.contains_key(handle) {
            return Ok(false);
        }
        Ok(state.memberships.insert((id, handle.to_string())))
    }

    async fn delete_membership(&self, key: &TrainKey, handle: &str) -> RepositoryResult<bool> {
        let mut state = self.state.write().await;
        let Some(id) = state.trains.get(key).map(|s| s.id) else {
            return Ok(false);
        };
        Ok(state.memberships.remove(&(id, handle.to_string())))
    }

    async fn delete_passenger_if_unboarded(&self, handle: &str) -> RepositoryResult<bool> {
        let mut state = self.state.write().await;
        if state.memberships.iter().any(|(_, h)| h == handle) {
            return Ok(false);
        }
        Ok(state.passengers.remove(handle).is_some())
    }

    async fn apply_timetable(&self, changes: &TimetableChanges) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        // Work on a copy so a failed change leaves nothing half-applied.
        let mut next = state.clone();
        next.apply(changes)?;
        *state = next;
        Ok(())
    }

    async fn purge_arrived(&self, now: DateTime<Utc>) -> RepositoryResult<PurgeReport> {
        let mut state = self.state.write().await;

        let arrived: Vec<(TrainKey, i64)> = state
            .trains
            .values()
            .filter(|s| s.train.arrival < now)
            .map(|s| (s.train.key(), s.id))
            .collect();

        for (key, id) in &arrived {
            state.clear_memberships(*id);
            state.delete_train(key)?;
        }

        let boarded: BTreeSet<String> = state.memberships.iter().map(|(_, h)| h.clone()).collect();
        let mut passengers: Vec<String> = state
            .passengers
            .keys()
            .filter(|h| !boarded.contains(*h))
            .cloned()
            .collect();
        passengers.sort();
        for handle in &passengers {
            state.passengers.remove(handle);
        }

        Ok(PurgeReport {
            trains: arrived.into_iter().map(|(key, _)| key).collect(),
            passengers,
        })
    }

    async fn count_trains(&self) -> RepositoryResult<i64> {
        Ok(self.state.read().await.trains.len() as i64)
    }
}
