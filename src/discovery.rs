//! Datetime-in-filename parsing and STAC item drafting for discovered objects.
//!
//! Files carry their dates after an underscore: `nightlights_2012.tif`,
//! `nightlights_201201_201205.tif`, `no2_20210315.tif`, `fire_2021-08-14.tif`.
//! The most precise format present wins: `yyyy-mm-dd`, then `yyyymmdd`,
//! `yyyymm`, `yyyy`.

use chrono::{DateTime, Datelike, Duration, NaiveDate, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::stac::STAC_VERSION;

pub const COG_MEDIA_TYPE: &str = "image/tiff; application=geotiff; profile=cloud-optimized";

static DASHED_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_([0-9]{4})-([0-9]{2})-([0-9]{2})").expect("static regex"));
static DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"_([0-9]+)").expect("static regex"));

/// Granularity a single filename date stands for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatetimeRange {
    Year,
    Month,
    Day,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDates {
    Single(DateTime<Utc>),
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateParseError {
    #[error("no dates found in {0}; at least one date (yyyy, yyyymm, yyyymmdd or yyyy-mm-dd) is required")]
    NoDates(String),
    #[error("{raw} in {filename} is not a calendar date")]
    Invalid { filename: String, raw: String },
    #[error("found {count} dates in {filename}; expected one or two")]
    TooMany { filename: String, count: usize },
}

fn found_dates(filename: &str) -> Result<Vec<NaiveDate>, DateParseError> {
    let invalid = |raw: &str| DateParseError::Invalid {
        filename: filename.to_string(),
        raw: raw.to_string(),
    };

    let dashed: Vec<_> = DASHED_DATE.captures_iter(filename).collect();
    if !dashed.is_empty() {
        return dashed
            .iter()
            .map(|cap| {
                let num = |i: usize| cap[i].parse::<u32>().unwrap_or(0);
                NaiveDate::from_ymd_opt(num(1) as i32, num(2), num(3))
                    .ok_or_else(|| invalid(&cap[0][1..]))
            })
            .collect();
    }

    let runs: Vec<&str> = DIGIT_RUN
        .captures_iter(filename)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str()))
        .collect();
    for len in [8, 6, 4] {
        let matching: Vec<&str> = runs.iter().copied().filter(|r| r.len() == len).collect();
        if matching.is_empty() {
            continue;
        }
        return matching
            .into_iter()
            .map(|raw| {
                let year = raw[..4].parse::<i32>().unwrap_or(0);
                let month = raw.get(4..6).map_or(Some(1), |m| m.parse().ok());
                let day = raw.get(6..8).map_or(Some(1), |d| d.parse().ok());
                month
                    .zip(day)
                    .and_then(|(m, d)| NaiveDate::from_ymd_opt(year, m, d))
                    .ok_or_else(|| invalid(raw))
            })
            .collect();
    }
    Ok(Vec::new())
}

fn start_of(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or_default()
}

/// Last second of the period `date` falls in.
fn end_of(date: NaiveDate, range: DatetimeRange) -> DateTime<Utc> {
    let last_day = match range {
        DatetimeRange::Day => Some(date),
        DatetimeRange::Month => {
            let (y, m) = if date.month() == 12 {
                (date.year() + 1, 1)
            } else {
                (date.year(), date.month() + 1)
            };
            NaiveDate::from_ymd_opt(y, m, 1).map(|d| d - Duration::days(1))
        }
        DatetimeRange::Year => NaiveDate::from_ymd_opt(date.year(), 12, 31),
    };
    last_day
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|dt| dt.and_utc())
        .unwrap_or_default()
}

fn period_start(date: NaiveDate, range: DatetimeRange) -> NaiveDate {
    match range {
        DatetimeRange::Day => date,
        DatetimeRange::Month => date.with_day(1).unwrap_or(date),
        DatetimeRange::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
    }
}

/// Extract the date or date range a filename describes.
///
/// One date with a `range` expands to the whole year/month/day; one date
/// without it is a single instant. Two dates form a range; with a `range`
/// the end is pushed to the end of its period so `_201201_201205` covers
/// January through May.
pub fn extract_dates(filename: &str, range: Option<DatetimeRange>) -> Result<FileDates, DateParseError> {
    let mut dates = found_dates(filename)?;
    match dates.len() {
        0 => Err(DateParseError::NoDates(filename.to_string())),
        1 => {
            let date = dates[0];
            Ok(match range {
                Some(range) => FileDates::Range {
                    start: start_of(period_start(date, range)),
                    end: end_of(date, range),
                },
                None => FileDates::Single(start_of(date)),
            })
        }
        2 => {
            dates.sort();
            let (first, last) = (dates[0], dates[1]);
            let end = match range {
                Some(range) => end_of(last, range),
                None => start_of(last),
            };
            Ok(FileDates::Range {
                start: start_of(first),
                end,
            })
        }
        count => Err(DateParseError::TooMany {
            filename: filename.to_string(),
            count,
        }),
    }
}

fn stamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl FileDates {
    /// STAC `properties` datetime fields for these dates.
    pub fn to_properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        match self {
            FileDates::Single(dt) => {
                props.insert("datetime".into(), Value::String(stamp(*dt)));
            }
            FileDates::Range { start, end } => {
                props.insert("datetime".into(), Value::Null);
                props.insert("start_datetime".into(), Value::String(stamp(*start)));
                props.insert("end_datetime".into(), Value::String(stamp(*end)));
            }
        }
        props
    }
}

/// File name part of an object key.
pub fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// STAC item draft for one discovered COG. Geometry is left null; extents
/// come from reading the raster, which happens downstream.
pub fn draft_item(
    collection: &str,
    bucket: &str,
    key: &str,
    range: Option<DatetimeRange>,
) -> Result<Value, DateParseError> {
    let name = file_name(key);
    let id = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    let dates = extract_dates(name, range)?;
    Ok(json!({
        "type": "Feature",
        "stac_version": STAC_VERSION,
        "id": id,
        "collection": collection,
        "geometry": null,
        "properties": Value::Object(dates.to_properties()),
        "links": [],
        "assets": {
            "cog_default": {
                "href": format!("s3://{}/{}", bucket, key.trim_start_matches('/')),
                "type": COG_MEDIA_TYPE,
                "roles": ["data", "layer"],
                "title": "Default COG Layer"
            }
        }
    }))
}
