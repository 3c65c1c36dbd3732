pub mod chat;
pub mod codec;
pub mod context;
pub mod repository;
pub mod time;
pub mod timetable;
pub mod train;

pub use context::{RequestContext, SearchWindow, Step, TrainQuery};
pub use train::{Direction, Passenger, Slot, TimetableRecord, Train, TrainKey};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
