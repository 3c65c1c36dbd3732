//! Srbvoz direct-connection timetable scraper.
//!
//! The site has no API. Results are rendered as `div#rezultati > table.tabela` with one
//! `tr.tsmall` per train, the first of which repeats the header.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use scraper::{ElementRef, Html, Selector};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use soko_core::time::local_instant;
use soko_core::timetable::{SourceError, TimetableSource};
use soko_core::train::SOKO_TAG;
use soko_core::{Direction, TimetableRecord};

use crate::app_config::TimetableConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SrbvozTimetableLoader {
    client: reqwest::Client,
    base_url: String,
    novi_sad_station_id: u32,
    belgrade_centre_station_id: u32,
}

impl SrbvozTimetableLoader {
    pub fn new(config: &TimetableConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            novi_sad_station_id: config.novi_sad_station_id,
            belgrade_centre_station_id: config.belgrade_centre_station_id,
        })
    }

    fn url(&self, direction: Direction, date: NaiveDate) -> String {
        let (from, to) = match direction {
            Direction::NoviSadToBelgrade => (self.novi_sad_station_id, self.belgrade_centre_station_id),
            Direction::BelgradeToNoviSad => (self.belgrade_centre_station_id, self.novi_sad_station_id),
        };
        // Trailing segment is the earliest departure time of day, HHMM.
        format!("{}/_/{}/_/{}/{}/0000", self.base_url, from, to, date.format("%d.%m.%Y"))
    }
}

#[async_trait]
impl TimetableSource for SrbvozTimetableLoader {
    async fn fetch(&self, direction: Direction, date: NaiveDate) -> Result<Vec<TimetableRecord>, SourceError> {
        let url = self.url(direction, date);
        debug!("Fetching timetable {} {} from {}", direction, date, url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }

        let html = response.text().await.map_err(|e| SourceError::Transport(e.to_string()))?;
        parse_timetable(&html)
    }
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Parse(format!("selector {}: {}", css, e)))
}

/// Extracts timetable rows from a results page. A page without the results table, or with
/// any row that does not parse, is rejected as a whole so a layout change cannot be
/// mistaken for an empty timetable.
pub fn parse_timetable(html: &str) -> Result<Vec<TimetableRecord>, SourceError> {
    let document = Html::parse_document(html);
    let table = selector("div#rezultati table.tabela")?;
    let rows = selector("tr.tsmall")?;
    let cells = selector("td")?;

    let table = document
        .select(&table)
        .next()
        .ok_or_else(|| SourceError::Parse("results table not found".to_string()))?;

    table
        .select(&rows)
        .skip(1)
        .enumerate()
        .map(|(index, row)| {
            let tds: Vec<ElementRef> = row.select(&cells).collect();
            parse_row(&tds).map_err(|reason| SourceError::Parse(format!("row {}: {}", index + 1, reason)))
        })
        .collect()
}

fn parse_row(tds: &[ElementRef]) -> Result<TimetableRecord, String> {
    if tds.len() < 8 {
        return Err(format!("expected at least 8 cells, found {}", tds.len()));
    }

    let number = cell_text(&tds[0])
        .parse::<i32>()
        .map_err(|e| format!("train number: {}", e))?;
    let departure = local_instant(parse_date(&tds[2])?, parse_time(&tds[1])?);
    let arrival = local_instant(parse_date(&tds[4])?, parse_time(&tds[3])?);
    let tag = parse_tag(&tds[7]);

    TimetableRecord::new(number, departure, arrival, tag).map_err(|e| e.to_string())
}

fn cell_text(td: &ElementRef) -> String {
    td.text().collect::<String>().trim().to_string()
}

fn parse_time(td: &ElementRef) -> Result<NaiveTime, String> {
    let text = cell_text(td);
    NaiveTime::parse_from_str(&text, "%H:%M").map_err(|e| format!("time {:?}: {}", text, e))
}

fn parse_date(td: &ElementRef) -> Result<NaiveDate, String> {
    let text = cell_text(td);
    NaiveDate::parse_from_str(&text, "%d.%m.%Y").map_err(|e| format!("date {:?}: {}", text, e))
}

/// The service type is only shown as an icon.
fn parse_tag(td: &ElementRef) -> Option<String> {
    let img = Selector::parse("img").ok()?;
    let src = td.select(&img).next()?.value().attr("src")?;
    let stem = Path::new(src).file_stem()?.to_str()?;
    let tag = match stem {
        "RE" => "Regio Voz",
        "soko" => SOKO_TAG,
        "REx" => "Regio Voz X",
        _ => return None,
    };
    Some(tag.to_string())
}
