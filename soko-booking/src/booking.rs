use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use soko_core::repository::{RepositoryError, TrainRepository};
use soko_core::{Direction, Passenger, Slot, TrainKey};

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("Train {0} not found")]
    TrainNotFound(TrainKey),
    #[error("Passenger @{0} not found")]
    PassengerNotFound(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl BookingError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BookingError::TrainNotFound(_) | BookingError::PassengerNotFound(_))
    }
}

/// Membership operations on trains addressed by natural key.
pub struct BookingService {
    repo: Arc<dyn TrainRepository>,
}

impl BookingService {
    pub fn new(repo: Arc<dyn TrainRepository>) -> Self {
        Self { repo }
    }

    /// Boards `passenger` on the train. Joining twice is a no-op.
    pub async fn add_passenger(&self, key: &TrainKey, passenger: &Passenger) -> Result<Slot, BookingError> {
        // 1. Train must exist
        if self.repo.find_slot(key).await?.is_none() {
            return Err(BookingError::TrainNotFound(*key));
        }

        // 2. Create the passenger lazily, refreshing the chat address
        self.repo.upsert_passenger(passenger).await?;

        // 3. Insert-if-absent edge
        let inserted = self.repo.insert_membership(key, &passenger.handle).await?;
        if inserted {
            info!(train = key.number, departure = %key.departure, handle = %passenger.handle, "Passenger boarded");
        }

        // 4. Re-read; the timetable worker may have removed the train meanwhile
        match self.repo.find_slot(key).await? {
            Some(slot) => Ok(slot),
            None => {
                self.repo.delete_passenger_if_unboarded(&passenger.handle).await?;
                Err(BookingError::TrainNotFound(*key))
            }
        }
    }

    /// Removes `handle` from the train and deletes the passenger once it has no trains left.
    pub async fn remove_passenger(&self, key: &TrainKey, handle: &str) -> Result<Slot, BookingError> {
        if self.repo.find_slot(key).await?.is_none() {
            return Err(BookingError::TrainNotFound(*key));
        }
        if self.repo.find_passenger(handle).await?.is_none() {
            return Err(BookingError::PassengerNotFound(handle.to_string()));
        }

        if self.repo.delete_membership(key, handle).await? {
            info!(train = key.number, departure = %key.departure, handle = %handle, "Passenger left");
        } else {
            warn!(train = key.number, departure = %key.departure, handle = %handle, "Passenger was not aboard");
        }

        if self.repo.delete_passenger_if_unboarded(handle).await? {
            info!(handle = %handle, "Passenger has no trains left, removed");
        }

        self.repo
            .find_slot(key)
            .await?
            .ok_or(BookingError::TrainNotFound(*key))
    }

    pub async fn find_train(&self, key: &TrainKey) -> Result<Option<Slot>, BookingError> {
        Ok(self.repo.find_slot(key).await?)
    }

    /// Trains overlapping `[from, to)`: arrival at or after `from`, departure before `to`.
    pub async fn find_trains(
        &self,
        direction: Option<Direction>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Slot>, BookingError> {
        Ok(self.repo.find_slots(direction, from, to).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use soko_core::Train;
    use soko_store::InMemoryTrainRepository;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, hour, minute, 0).unwrap()
    }

    fn train(number: i32, direction: Direction, departure: DateTime<Utc>) -> Train {
        Train::new(number, direction, departure, departure + Duration::minutes(40), None).unwrap()
    }

    async fn setup() -> (Arc<InMemoryTrainRepository>, BookingService) {
        let repo = Arc::new(InMemoryTrainRepository::new());
        repo.insert_train(train(100, Direction::NoviSadToBelgrade, at(8, 0))).await.unwrap();
        repo.insert_train(train(200, Direction::NoviSadToBelgrade, at(10, 0))).await.unwrap();
        let service = BookingService::new(repo.clone());
        (repo, service)
    }

    fn ana() -> Passenger {
        Passenger::new("ana", 11).unwrap()
    }

    #[tokio::test]
    async fn test_add_then_remove_restores_roster() {
        let (repo, service) = setup().await;
        let key = TrainKey::new(100, at(8, 0));
        service.add_passenger(&key, &Passenger::new("bob", 12).unwrap()).await.unwrap();
        let before = service.find_train(&key).await.unwrap().unwrap().passengers;

        let joined = service.add_passenger(&key, &ana()).await.unwrap();
        assert!(joined.has_passenger("ana"));
        assert_eq!(joined.passengers.len(), 2);

        let left = service.remove_passenger(&key, "ana").await.unwrap();
        assert_eq!(left.passengers, before);
        assert!(repo.find_passenger("ana").await.unwrap().is_none());
        assert!(repo.find_passenger("bob").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_passenger_on_two_trains_survives_leaving_one() {
        let (repo, service) = setup().await;
        let first = TrainKey::new(100, at(8, 0));
        let second = TrainKey::new(200, at(10, 0));
        service.add_passenger(&first, &ana()).await.unwrap();
        service.add_passenger(&second, &ana()).await.unwrap();

        service.remove_passenger(&first, "ana").await.unwrap();
        assert!(repo.find_passenger("ana").await.unwrap().is_some());

        service.remove_passenger(&second, "ana").await.unwrap();
        assert!(repo.find_passenger("ana").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_double_join_keeps_single_membership() {
        let (_repo, service) = setup().await;
        let key = TrainKey::new(100, at(8, 0));
        service.add_passenger(&key, &ana()).await.unwrap();
        let slot = service.add_passenger(&key, &ana()).await.unwrap();
        assert_eq!(slot.passengers.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_train_is_not_found_and_creates_nothing() {
        let (repo, service) = setup().await;
        let key = TrainKey::new(999, at(8, 0));

        let err = service.add_passenger(&key, &ana()).await.unwrap_err();
        assert!(matches!(err, BookingError::TrainNotFound(k) if k == key));
        assert!(repo.find_passenger("ana").await.unwrap().is_none());

        let err = service.remove_passenger(&key, "ana").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_unknown_passenger_is_not_found() {
        let (_repo, service) = setup().await;
        let err = service
            .remove_passenger(&TrainKey::new(100, at(8, 0)), "nobody")
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::PassengerNotFound(ref h) if h == "nobody"));
    }

    #[tokio::test]
    async fn test_find_trains_uses_half_open_overlap() {
        let (repo, service) = setup().await;
        repo.insert_train(train(300, Direction::BelgradeToNoviSad, at(9, 0))).await.unwrap();

        // #100 arrives 08:40 < 09:00, #200 departs 10:00 >= 10:00
        let none = service
            .find_trains(Some(Direction::NoviSadToBelgrade), at(9, 0), at(10, 0))
            .await
            .unwrap();
        assert!(none.is_empty());

        let all = service.find_trains(None, at(8, 0), at(12, 0)).await.unwrap();
        let numbers: Vec<i32> = all.iter().map(|s| s.train.number).collect();
        assert_eq!(numbers, vec![100, 300, 200]);
    }
}
