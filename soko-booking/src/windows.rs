use chrono::{DateTime, Days, NaiveTime, Utc};

use soko_core::time::{local_instant, to_local};
use soko_core::SearchWindow;

/// Daily boundaries in the target zone, ascending.
pub const CUTOFF_HOURS: [u32; 3] = [4, 12, 20];

fn cutoff(index: usize) -> NaiveTime {
    NaiveTime::from_hms_opt(CUTOFF_HOURS[index], 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Consecutive windows covering the next full day, starting at the first cutoff at or
/// after the current local time. Past the last cutoff it starts at tomorrow's first one.
pub fn search_windows(now: DateTime<Utc>) -> Vec<SearchWindow> {
    let local = to_local(now);
    let time_of_day = local.time();
    let count = CUTOFF_HOURS.len();

    let mut date = local.date_naive();
    let start = match (0..count).find(|&i| cutoff(i) >= time_of_day) {
        Some(index) => index,
        None => {
            date = date + Days::new(1);
            0
        }
    };

    let mut boundaries = Vec::with_capacity(count + 1);
    for step in 0..=count {
        let index = (start + step) % count;
        if step > 0 && index == 0 {
            date = date + Days::new(1);
        }
        boundaries.push(local_instant(date, cutoff(index)));
    }

    boundaries
        .windows(2)
        .map(|pair| SearchWindow::new(pair[0], pair[1]))
        .collect()
}

/// Button caption, e.g. `12:00 - 20:00`.
pub fn window_label(window: &SearchWindow) -> String {
    format!(
        "{} - {}",
        to_local(window.start).format("%H:%M"),
        to_local(window.end).format("%H:%M")
    )
}
