//! Target time zone helpers.
//!
//! Calendar days and cutoff boundaries are computed in the zone the trains run in,
//! then converted to absolute instants before they reach storage or tokens.

use chrono::{DateTime, Days, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

pub const TARGET_TZ: Tz = chrono_tz::Europe::Belgrade;

pub fn to_local(instant: DateTime<Utc>) -> DateTime<Tz> {
    instant.with_timezone(&TARGET_TZ)
}

pub fn local_date(instant: DateTime<Utc>) -> NaiveDate {
    to_local(instant).date_naive()
}

/// Absolute instant of a wall-clock time in the target zone.
pub fn local_instant(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    match TARGET_TZ.from_local_datetime(&naive) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        // Spring-forward gap: the wall-clock time does not exist, take the first instant after it.
        LocalResult::None => TARGET_TZ
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
    }
}

/// Half-open [start, end) range covering one local calendar day.
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = local_instant(date, NaiveTime::MIN);
    let end = local_instant(date + Days::new(1), NaiveTime::MIN);
    (start, end)
}

/// Local dates from today onwards, `days` of them.
pub fn rolling_dates(now: DateTime<Utc>, days: u32) -> Vec<NaiveDate> {
    let today = local_date(now);
    (0..days as u64).map(|offset| today + Days::new(offset)).collect()
}

/// Source of "now". Injected so time-dependent logic can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
