pub mod app_config;
pub mod database;
pub mod memory_repo;
pub mod timetable_loader;
pub mod train_repo;

pub use database::DbClient;
pub use memory_repo::InMemoryTrainRepository;
pub use timetable_loader::SrbvozTimetableLoader;
pub use train_repo::PostgresTrainRepository;
