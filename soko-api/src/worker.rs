//! Background loops. Each owns a cancellation token and stops at the next await point
//! once it fires; an in-flight store transaction is dropped and rolled back.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use soko_booking::{CleanupService, TimetableReconciler};

#[derive(Debug, Clone, Copy)]
pub struct TimetableSchedule {
    pub horizon_days: u32,
    pub refresh_interval: Duration,
    pub retry_interval: Duration,
}

impl TimetableSchedule {
    /// Incomplete refreshes are retried on the shorter interval.
    pub fn next_delay(&self, complete: bool) -> Duration {
        if complete {
            self.refresh_interval
        } else {
            self.retry_interval
        }
    }
}

pub async fn start_timetable_worker(
    reconciler: Arc<TimetableReconciler>,
    schedule: TimetableSchedule,
    cancel: CancellationToken,
) {
    info!(horizon_days = schedule.horizon_days, "Timetable worker started");

    loop {
        let report = tokio::select! {
            _ = cancel.cancelled() => break,
            report = reconciler.refresh(schedule.horizon_days) => report,
        };

        let delay = schedule.next_delay(report.is_complete());
        if report.is_complete() {
            info!(pairs = report.succeeded, "Timetable refreshed, next run in {:?}", delay);
        } else {
            warn!(failed = report.failed, succeeded = report.succeeded, "Timetable refresh incomplete, retrying in {:?}", delay);
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }

    info!("Timetable worker stopped");
}

pub async fn start_cleanup_worker(cleanup: Arc<CleanupService>, interval: Duration, cancel: CancellationToken) {
    info!("Cleanup worker started, every {:?}", interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = cleanup.run_once() => {
                if let Err(e) = result {
                    error!("Cleanup failed: {}", e);
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }

    info!("Cleanup worker stopped");
}
