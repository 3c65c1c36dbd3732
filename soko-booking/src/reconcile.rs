//! Reconciliation of stored trains against the external timetable.
//!
//! One cycle handles one `(direction, local date)` pair: fetch, diff, then write the whole
//! diff in a single `apply_timetable` call. A failed fetch returns before anything is
//! written, and dropping the future mid-apply rolls the transaction back.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use soko_core::repository::{RepositoryError, Reschedule, Retag, TimetableChanges, TrainRepository};
use soko_core::time::{day_bounds, rolling_dates, Clock};
use soko_core::timetable::{SourceError, TimetableSource};
use soko_core::{Direction, TimetableRecord, Train};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Timetable fetch failed: {0}")]
    Fetch(#[from] SourceError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Counts of what one cycle changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub cancelled: usize,
    pub rescheduled: usize,
    pub retagged: usize,
    pub inserted: usize,
}

impl From<&TimetableChanges> for CycleSummary {
    fn from(changes: &TimetableChanges) -> Self {
        Self {
            cancelled: changes.cancelled.len(),
            rescheduled: changes.rescheduled.len(),
            retagged: changes.retagged.len(),
            inserted: changes.inserted.len(),
        }
    }
}

/// Outcome of refreshing every pair in the horizon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl RefreshReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

pub struct TimetableReconciler {
    repo: Arc<dyn TrainRepository>,
    source: Arc<dyn TimetableSource>,
    clock: Arc<dyn Clock>,
}

impl TimetableReconciler {
    pub fn new(repo: Arc<dyn TrainRepository>, source: Arc<dyn TimetableSource>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, source, clock }
    }

    /// Runs one cycle for every direction on each of the next `horizon_days` local dates.
    /// Pairs are independent: a failing pair is logged and the others still run.
    pub async fn refresh(&self, horizon_days: u32) -> RefreshReport {
        let mut report = RefreshReport::default();
        for date in rolling_dates(self.clock.now(), horizon_days) {
            for direction in Direction::ALL {
                match self.reconcile(direction, date).await {
                    Ok(_) => report.succeeded += 1,
                    Err(e) => {
                        error!(%direction, %date, "Timetable reconciliation failed: {}", e);
                        report.failed += 1;
                    }
                }
            }
        }
        report
    }

    pub async fn reconcile(&self, direction: Direction, date: NaiveDate) -> Result<CycleSummary, ReconcileError> {
        // 1. Fetch; nothing is touched when this fails
        let records = self.source.fetch(direction, date).await?;

        // 2. Stored trains of the same local day
        let (from, to) = day_bounds(date);
        let stored = self.repo.trains_departing(direction, from, to).await?;

        // 3. Diff
        let changes = plan_changes(direction, &records, &stored, self.clock.now());
        let summary = CycleSummary::from(&changes);

        // 4. Apply as one unit
        if !changes.is_empty() {
            self.repo.apply_timetable(&changes).await?;
        }

        info!(
            %direction,
            %date,
            fetched = records.len(),
            cancelled = summary.cancelled,
            rescheduled = summary.rescheduled,
            retagged = summary.retagged,
            inserted = summary.inserted,
            "Timetable reconciled"
        );
        Ok(summary)
    }
}

/// Computes the writes that bring `stored` in line with `records`.
///
/// Trains are matched by number. Records that already arrived before `now` are
/// ignored entirely, so they never insert or resurrect a train.
pub fn plan_changes(
    direction: Direction,
    records: &[TimetableRecord],
    stored: &[Train],
    now: DateTime<Utc>,
) -> TimetableChanges {
    let external = index_by_number(records.iter(), |r| r.number, "feed");
    let internal = index_by_number(stored.iter(), |t| t.number, "store");

    let mut changes = TimetableChanges::default();

    for (number, train) in &internal {
        if !external.contains_key(number) {
            changes.cancelled.push(train.key());
        }
    }

    for (number, record) in &external {
        if record.arrival < now {
            continue;
        }
        let fresh = record.to_train(direction);
        match internal.get(number) {
            None => changes.inserted.push(fresh),
            Some(current) => {
                let moved = current.departure != fresh.departure
                    || current.arrival != fresh.arrival
                    || current.direction != fresh.direction;
                if moved {
                    warn!(
                        train = *number,
                        from = %current.departure,
                        to = %fresh.departure,
                        "Train rescheduled, passengers released"
                    );
                    changes.rescheduled.push(Reschedule { previous: current.key(), train: fresh });
                } else if current.tag != fresh.tag {
                    changes.retagged.push(Retag { key: current.key(), tag: fresh.tag });
                }
            }
        }
    }

    changes
}

fn index_by_number<'a, T>(
    items: impl Iterator<Item = &'a T>,
    number: impl Fn(&T) -> i32,
    origin: &str,
) -> BTreeMap<i32, &'a T>
where
    T: 'a,
{
    let mut map = BTreeMap::new();
    for item in items {
        match map.entry(number(item)) {
            Entry::Vacant(slot) => {
                slot.insert(item);
            }
            Entry::Occupied(slot) => {
                error!(train = *slot.key(), origin, "Duplicate train number, skipping");
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use soko_core::time::FixedClock;
    use soko_core::{Passenger, TrainKey};
    use soko_store::InMemoryTrainRepository;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned records per pair, or fails when none are configured.
    #[derive(Default)]
    struct FakeSource {
        records: Mutex<HashMap<(Direction, NaiveDate), Vec<TimetableRecord>>>,
    }

    impl FakeSource {
        fn set(&self, direction: Direction, date: NaiveDate, records: Vec<TimetableRecord>) {
            self.records.lock().unwrap().insert((direction, date), records);
        }
    }

    #[async_trait]
    impl TimetableSource for FakeSource {
        async fn fetch(&self, direction: Direction, date: NaiveDate) -> Result<Vec<TimetableRecord>, SourceError> {
            self.records
                .lock()
                .unwrap()
                .get(&(direction, date))
                .cloned()
                .ok_or(SourceError::Status(503))
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 10).unwrap()
    }

    // Local 2024-05-10 is UTC+2
    fn local(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, hour, minute, 0).unwrap() - Duration::hours(2)
    }

    fn record(number: i32, dep: DateTime<Utc>, arr: DateTime<Utc>, tag: Option<&str>) -> TimetableRecord {
        TimetableRecord::new(number, dep, arr, tag.map(str::to_string)).unwrap()
    }

    fn stored(number: i32, dep: DateTime<Utc>, arr: DateTime<Utc>, tag: Option<&str>) -> Train {
        record(number, dep, arr, tag).to_train(Direction::NoviSadToBelgrade)
    }

    fn setup(now: DateTime<Utc>) -> (Arc<InMemoryTrainRepository>, Arc<FakeSource>, TimetableReconciler) {
        let repo = Arc::new(InMemoryTrainRepository::new());
        let source = Arc::new(FakeSource::default());
        let reconciler = TimetableReconciler::new(repo.clone(), source.clone(), Arc::new(FixedClock(now)));
        (repo, source, reconciler)
    }

    async fn board(repo: &InMemoryTrainRepository, key: &TrainKey, handle: &str) {
        repo.upsert_passenger(&Passenger::new(handle, 1).unwrap()).await.unwrap();
        repo.insert_membership(key, handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_reschedule_cancel_and_insert() {
        let (repo, source, reconciler) = setup(local(6, 0));
        let t100 = stored(100, local(8, 0), local(9, 0), Some("Soko"));
        let t200 = stored(200, local(10, 0), local(11, 0), None);
        repo.insert_train(t100.clone()).await.unwrap();
        repo.insert_train(t200.clone()).await.unwrap();
        board(&repo, &t100.key(), "ana").await;
        board(&repo, &t100.key(), "bob").await;
        board(&repo, &t200.key(), "cid").await;

        source.set(
            Direction::NoviSadToBelgrade,
            date(),
            vec![
                record(100, local(8, 15), local(9, 10), Some("Soko")),
                record(300, local(12, 0), local(13, 0), None),
            ],
        );

        let summary = reconciler.reconcile(Direction::NoviSadToBelgrade, date()).await.unwrap();
        assert_eq!(summary, CycleSummary { cancelled: 1, rescheduled: 1, retagged: 0, inserted: 1 });

        let moved = repo.find_slot(&TrainKey::new(100, local(8, 15))).await.unwrap().unwrap();
        assert_eq!(moved.train.arrival, local(9, 10));
        assert!(moved.passengers.is_empty());

        assert!(repo.find_slot(&t200.key()).await.unwrap().is_none());

        let fresh = repo.find_slot(&TrainKey::new(300, local(12, 0))).await.unwrap().unwrap();
        assert!(fresh.passengers.is_empty());
        assert_eq!(repo.count_trains().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_arrived_records_are_never_inserted() {
        let (repo, source, reconciler) = setup(local(12, 0));
        source.set(
            Direction::NoviSadToBelgrade,
            date(),
            vec![
                record(100, local(8, 0), local(9, 0), None),
                record(200, local(11, 30), local(12, 30), None),
            ],
        );

        reconciler.reconcile(Direction::NoviSadToBelgrade, date()).await.unwrap();

        assert!(repo.find_slot(&TrainKey::new(100, local(8, 0))).await.unwrap().is_none());
        assert!(repo.find_slot(&TrainKey::new(200, local(11, 30))).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fetch_failure_leaves_store_untouched() {
        let (repo, _source, reconciler) = setup(local(6, 0));
        let t100 = stored(100, local(8, 0), local(9, 0), None);
        repo.insert_train(t100.clone()).await.unwrap();

        let err = reconciler.reconcile(Direction::NoviSadToBelgrade, date()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Fetch(SourceError::Status(503))));
        assert!(repo.find_slot(&t100.key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unchanged_feed_is_a_no_op() {
        let (repo, source, reconciler) = setup(local(6, 0));
        let t100 = stored(100, local(8, 0), local(9, 0), Some("Soko"));
        repo.insert_train(t100.clone()).await.unwrap();
        board(&repo, &t100.key(), "ana").await;
        source.set(
            Direction::NoviSadToBelgrade,
            date(),
            vec![record(100, local(8, 0), local(9, 0), Some("Soko"))],
        );

        let summary = reconciler.reconcile(Direction::NoviSadToBelgrade, date()).await.unwrap();
        assert_eq!(summary, CycleSummary::default());
        assert!(repo.find_slot(&t100.key()).await.unwrap().unwrap().has_passenger("ana"));
    }

    #[tokio::test]
    async fn test_refresh_counts_failed_pairs() {
        let now = local(6, 0);
        let (_repo, source, reconciler) = setup(now);
        source.set(Direction::NoviSadToBelgrade, date(), vec![]);
        source.set(Direction::BelgradeToNoviSad, date(), vec![]);
        source.set(Direction::NoviSadToBelgrade, date().succ_opt().unwrap(), vec![]);

        let report = reconciler.refresh(2).await;
        assert_eq!(report, RefreshReport { succeeded: 3, failed: 1 });
        assert!(!report.is_complete());
    }

    #[test]
    fn test_tag_only_change_is_a_retag() {
        let current = stored(100, local(8, 0), local(9, 0), None);
        let changes = plan_changes(
            Direction::NoviSadToBelgrade,
            &[record(100, local(8, 0), local(9, 0), Some("Soko"))],
            &[current.clone()],
            local(6, 0),
        );
        assert_eq!(changes.retagged, vec![Retag { key: current.key(), tag: Some("Soko".to_string()) }]);
        assert!(changes.rescheduled.is_empty());
    }

    #[test]
    fn test_duplicate_numbers_keep_first_occurrence() {
        let changes = plan_changes(
            Direction::NoviSadToBelgrade,
            &[
                record(100, local(8, 0), local(9, 0), None),
                record(100, local(18, 0), local(19, 0), None),
            ],
            &[],
            local(6, 0),
        );
        assert_eq!(changes.inserted.len(), 1);
        assert_eq!(changes.inserted[0].departure, local(8, 0));
    }

    #[test]
    fn test_duplicate_stored_numbers_compare_first_row_only() {
        let first = stored(100, local(8, 0), local(9, 0), None);
        let second = stored(100, local(18, 0), local(19, 0), None);
        let rows = [first.clone(), second.clone()];

        // Feed matches the first row: nothing to do, the second row is left alone.
        let same = plan_changes(
            Direction::NoviSadToBelgrade,
            &[record(100, local(8, 0), local(9, 0), None)],
            &rows,
            local(6, 0),
        );
        assert_eq!(same, TimetableChanges::default());

        // Feed moved the train: only the first row is rescheduled.
        let moved = plan_changes(
            Direction::NoviSadToBelgrade,
            &[record(100, local(10, 0), local(11, 0), None)],
            &rows,
            local(6, 0),
        );
        assert_eq!(moved.rescheduled.len(), 1);
        assert_eq!(moved.rescheduled[0].previous, first.key());
        assert!(moved.cancelled.is_empty());

        // Feed dropped the number: only the first row is cancelled.
        let dropped = plan_changes(Direction::NoviSadToBelgrade, &[], &rows, local(6, 0));
        assert_eq!(dropped.cancelled, vec![first.key()]);
        assert!(!dropped.cancelled.contains(&second.key()));
    }

    #[test]
    fn test_stored_train_missing_from_feed_is_cancelled_even_if_arrived() {
        let gone = stored(100, local(5, 0), local(5, 40), None);
        let changes = plan_changes(Direction::NoviSadToBelgrade, &[], &[gone.clone()], local(12, 0));
        assert_eq!(changes.cancelled, vec![gone.key()]);
    }
}
