use std::sync::Arc;
use tracing::{debug, info};

use soko_core::repository::{PurgeReport, RepositoryResult, TrainRepository};
use soko_core::time::Clock;

/// Removes trains that already arrived, then passengers left without a train.
pub struct CleanupService {
    repo: Arc<dyn TrainRepository>,
    clock: Arc<dyn Clock>,
}

impl CleanupService {
    pub fn new(repo: Arc<dyn TrainRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub async fn run_once(&self) -> RepositoryResult<PurgeReport> {
        let report = self.repo.purge_arrived(self.clock.now()).await?;
        if report.trains.is_empty() && report.passengers.is_empty() {
            debug!("Cleanup found nothing to remove");
        } else {
            info!(
                trains = report.trains.len(),
                passengers = report.passengers.len(),
                "Removed arrived trains"
            );
        }
        Ok(report)
    }
}
