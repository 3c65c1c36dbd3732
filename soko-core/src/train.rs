use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CoreError, CoreResult};

/// Tag the timetable feed assigns to the premium "Soko" service.
pub const SOKO_TAG: &str = "Soko";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    NoviSadToBelgrade,
    BelgradeToNoviSad,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::NoviSadToBelgrade, Direction::BelgradeToNoviSad];

    /// Wire and storage representation.
    pub fn as_byte(self) -> u8 {
        match self {
            Direction::NoviSadToBelgrade => 0,
            Direction::BelgradeToNoviSad => 1,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Direction::NoviSadToBelgrade),
            1 => Some(Direction::BelgradeToNoviSad),
            _ => None,
        }
    }

    pub fn departure_station(self) -> &'static str {
        match self {
            Direction::NoviSadToBelgrade => "Novi Sad",
            Direction::BelgradeToNoviSad => "Beograd Centar",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::NoviSadToBelgrade => write!(f, "NoviSad->Belgrade"),
            Direction::BelgradeToNoviSad => write!(f, "Belgrade->NoviSad"),
        }
    }
}

/// Natural key of a train. Surrogate ids are recreated across timetable cycles,
/// so this pair is the only stable way to address a train.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrainKey {
    pub number: i32,
    pub departure: DateTime<Utc>,
}

impl TrainKey {
    pub fn new(number: i32, departure: DateTime<Utc>) -> Self {
        Self { number, departure: whole_seconds(departure) }
    }
}

impl fmt::Display for TrainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} @ {}", self.number, self.departure.to_rfc3339())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Train {
    pub number: i32,
    pub direction: Direction,
    pub departure: DateTime<Utc>,
    pub arrival: DateTime<Utc>,
    pub tag: Option<String>,
}

impl Train {
    pub fn new(
        number: i32,
        direction: Direction,
        departure: DateTime<Utc>,
        arrival: DateTime<Utc>,
        tag: Option<String>,
    ) -> CoreResult<Self> {
        let (departure, arrival) = (whole_seconds(departure), whole_seconds(arrival));
        validate_schedule(number, departure, arrival)?;
        Ok(Self { number, direction, departure, arrival, tag })
    }

    pub fn key(&self) -> TrainKey {
        TrainKey::new(self.number, self.departure)
    }

    pub fn is_soko(&self) -> bool {
        self.tag.as_deref() == Some(SOKO_TAG)
    }
}

/// One row of the external timetable for a (direction, date) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimetableRecord {
    pub number: i32,
    pub departure: DateTime<Utc>,
    pub arrival: DateTime<Utc>,
    pub tag: Option<String>,
}

impl TimetableRecord {
    pub fn new(
        number: i32,
        departure: DateTime<Utc>,
        arrival: DateTime<Utc>,
        tag: Option<String>,
    ) -> CoreResult<Self> {
        let (departure, arrival) = (whole_seconds(departure), whole_seconds(arrival));
        validate_schedule(number, departure, arrival)?;
        Ok(Self { number, departure, arrival, tag })
    }

    pub fn to_train(&self, direction: Direction) -> Train {
        Train {
            number: self.number,
            direction,
            departure: self.departure,
            arrival: self.arrival,
            tag: self.tag.clone(),
        }
    }
}

/// Callback tokens carry instants in whole seconds, so keys never hold more.
pub(crate) fn whole_seconds(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant.trunc_subsecs(0)
}

fn validate_schedule(number: i32, departure: DateTime<Utc>, arrival: DateTime<Utc>) -> CoreResult<()> {
    if number <= 0 {
        return Err(CoreError::ValidationError(format!("Train number must be positive, got {}", number)));
    }
    if arrival <= departure {
        return Err(CoreError::ValidationError(format!(
            "Arrival must be after departure for train #{}",
            number
        )));
    }
    Ok(())
}

/// A chat user who has boarded at least one train.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passenger {
    /// Chat-system username, without the leading '@'.
    pub handle: String,
    /// Private chat used for direct notifications.
    pub chat_id: i64,
}

impl Passenger {
    pub fn new(handle: impl Into<String>, chat_id: i64) -> CoreResult<Self> {
        let handle = handle.into();
        let handle = handle.trim().trim_start_matches('@').to_string();
        if handle.is_empty() {
            return Err(CoreError::ValidationError("Passenger handle must not be empty".to_string()));
        }
        Ok(Self { handle, chat_id })
    }
}

impl fmt::Display for Passenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.handle)
    }
}

/// A train together with its current passengers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub train: Train,
    pub passengers: Vec<Passenger>,
}

impl Slot {
    pub fn new(train: Train, passengers: Vec<Passenger>) -> Self {
        Self { train, passengers }
    }

    pub fn has_passenger(&self, handle: &str) -> bool {
        self.passengers.iter().any(|p| p.handle == handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_train_requires_arrival_after_departure() {
        assert!(Train::new(100, Direction::NoviSadToBelgrade, at(8, 0), at(9, 0), None).is_ok());
        assert!(Train::new(100, Direction::NoviSadToBelgrade, at(8, 0), at(8, 0), None).is_err());
        assert!(Train::new(100, Direction::NoviSadToBelgrade, at(9, 0), at(8, 0), None).is_err());
    }

    #[test]
    fn test_instants_are_kept_in_whole_seconds() {
        let jitter = chrono::Duration::milliseconds(750);
        let train = Train::new(100, Direction::NoviSadToBelgrade, at(8, 0) + jitter, at(9, 0) + jitter, None).unwrap();
        assert_eq!(train.departure, at(8, 0));
        assert_eq!(train.arrival, at(9, 0));
        assert_eq!(train.key(), TrainKey::new(100, at(8, 0) + jitter));
    }

    #[test]
    fn test_train_number_must_be_positive() {
        assert!(TimetableRecord::new(0, at(8, 0), at(9, 0), None).is_err());
        assert!(TimetableRecord::new(-3, at(8, 0), at(9, 0), None).is_err());
    }

    #[test]
    fn test_passenger_handle_is_normalised() {
        let passenger = Passenger::new("@alice", 42).unwrap();
        assert_eq!(passenger.handle, "alice");
        assert_eq!(passenger.to_string(), "@alice");
        assert!(Passenger::new("  ", 42).is_err());
        assert!(Passenger::new("@", 42).is_err());
    }

    #[test]
    fn test_direction_byte_mapping() {
        for direction in Direction::ALL {
            assert_eq!(Direction::from_byte(direction.as_byte()), Some(direction));
        }
        assert_eq!(Direction::from_byte(2), None);
    }

    #[test]
    fn test_slot_membership_by_handle() {
        let train = Train::new(100, Direction::BelgradeToNoviSad, at(8, 0), at(9, 0), Some(SOKO_TAG.to_string())).unwrap();
        let slot = Slot::new(train, vec![Passenger::new("bob", 7).unwrap()]);
        assert!(slot.has_passenger("bob"));
        assert!(!slot.has_passenger("alice"));
        assert!(slot.train.is_soko());
    }
}
