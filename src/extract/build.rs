//! Tier-1 batch builders.
//!
//! Turn raw NeoWs objects into flat frames. Nested objects are flattened
//! into `.`-joined column names and column types are inferred from the
//! values (bool, integer, float, otherwise string). A column with no
//! value in the batch stays untyped and takes the target table's type.

use crate::error::Result;
use crate::schema::{ASTEROID_DATA, CLOSE_APPROACH_DATA};
use crate::state::DATE_FORMAT;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use polars::prelude::*;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

pub const EXTRACTION_DATE: &str = "extraction_date";
pub const NEO_REFERENCE_ID: &str = "neo_reference_id";
pub const APPROACH_DATETIME: &str = "approach_datetime";

const APPROACHES: &str = "close_approach_data";
const EPOCH_COLUMN: &str = "epoch_date_close_approach";

const ASTEROID_FIELDS: [&str; 4] = [
    "name",
    "nasa_jpl_url",
    "is_potentially_hazardous_asteroid",
    "absolute_magnitude_h",
];

type Row = BTreeMap<String, Value>;

/// Week of the month, counting the partial first week as week 1.
pub fn week_of_month(date: NaiveDate) -> u32 {
    let first_weekday = date.with_day(1).unwrap_or(date).weekday().num_days_from_monday();
    (date.day() + first_weekday + 6) / 7
}

/// One row per close approach of every NEO in `entries`.
pub fn build_close_approach_data(entries: &[Value], extraction_date: NaiveDate) -> Result<DataFrame> {
    let mut rows = Vec::new();
    let mut datetimes = Vec::new();

    for entry in entries {
        let id = entry.get(NEO_REFERENCE_ID).cloned().unwrap_or(Value::Null);
        let approaches = match entry.get(APPROACHES) {
            Some(Value::Array(items)) => items,
            _ => {
                warn!("NEO {} has no close approach data", id);
                continue;
            }
        };

        for approach in approaches {
            let epoch = approach.get(EPOCH_COLUMN).and_then(Value::as_i64);
            let datetime = match epoch.and_then(DateTime::<Utc>::from_timestamp_millis) {
                Some(dt) => dt,
                None => {
                    warn!("Skipping approach of NEO {} without a valid {}", id, EPOCH_COLUMN);
                    continue;
                }
            };

            let mut row = Row::new();
            if let Value::Object(fields) = approach {
                flatten_into(&mut row, None, fields);
            }
            row.insert(NEO_REFERENCE_ID.to_string(), id.clone());
            rows.push(row);
            datetimes.push(datetime);
        }
    }

    if rows.is_empty() {
        return Ok(DataFrame::empty());
    }

    let mut df = rows_to_frame(&rows)?;
    let millis: Vec<i64> = datetimes.iter().map(|dt| dt.timestamp_millis()).collect();
    let approach = Int64Chunked::from_vec(APPROACH_DATETIME, millis)
        .into_datetime(TimeUnit::Milliseconds, None)
        .into_series();
    df.with_column(approach)?;

    let years: Vec<i32> = datetimes.iter().map(|dt| dt.year()).collect();
    let months: Vec<i32> = datetimes.iter().map(|dt| dt.month() as i32).collect();
    let weeks: Vec<i32> = datetimes.iter().map(|dt| week_of_month(dt.date_naive()) as i32).collect();
    df.with_column(Series::new("year", years))?;
    df.with_column(Series::new("month", months))?;
    df.with_column(Series::new("week", weeks))?;
    with_extraction_date(&mut df, extraction_date)?;

    debug!("Built {} with {} rows", CLOSE_APPROACH_DATA, df.height());
    Ok(df)
}

/// One summary row per asteroid lookup in `entries`.
pub fn build_asteroid_data(entries: &[Value], extraction_date: NaiveDate) -> Result<DataFrame> {
    let mut rows = Vec::new();

    for entry in entries {
        let fields = match entry {
            Value::Object(fields) => fields,
            _ => continue,
        };

        let mut row = Row::new();
        row.insert(
            NEO_REFERENCE_ID.to_string(),
            fields.get(NEO_REFERENCE_ID).cloned().unwrap_or(Value::Null),
        );
        for name in ASTEROID_FIELDS {
            if let Some(value) = fields.get(name) {
                row.insert(name.to_string(), value.clone());
            }
        }
        if let Some(Value::Object(diameter)) = fields.get("estimated_diameter") {
            flatten_into(&mut row, Some("estimated_diameter"), diameter);
        }

        let earth_approaches = match fields.get(APPROACHES) {
            Some(Value::Array(items)) => items
                .iter()
                .filter(|a| a.get("orbiting_body").and_then(Value::as_str) == Some("Earth"))
                .count(),
            _ => 0,
        };
        row.insert("approaches_to_earth".to_string(), Value::from(earth_approaches as i64));
        rows.push(row);
    }

    if rows.is_empty() {
        return Ok(DataFrame::empty());
    }

    let mut df = rows_to_frame(&rows)?;
    with_extraction_date(&mut df, extraction_date)?;
    debug!("Built {} with {} rows", ASTEROID_DATA, df.height());
    Ok(df)
}

fn with_extraction_date(df: &mut DataFrame, extraction_date: NaiveDate) -> Result<()> {
    let marker = extraction_date.format(DATE_FORMAT).to_string();
    let column = Series::new(EXTRACTION_DATE, vec![marker; df.height()]);
    df.with_column(column)?;
    Ok(())
}

fn flatten_into(row: &mut Row, prefix: Option<&str>, fields: &Map<String, Value>) {
    for (key, value) in fields {
        let name = match prefix {
            Some(prefix) => format!("{}.{}", prefix, key),
            None => key.clone(),
        };
        match value {
            Value::Object(nested) => flatten_into(row, Some(&name), nested),
            other => {
                row.insert(name, other.clone());
            }
        }
    }
}

/// Columns in first-seen order; absent keys are null.
fn rows_to_frame(rows: &[Row]) -> Result<DataFrame> {
    let mut names = Vec::new();
    let mut seen = HashSet::new();
    for row in rows {
        for key in row.keys() {
            if seen.insert(key.as_str()) {
                names.push(key.as_str());
            }
        }
    }

    let columns = names
        .into_iter()
        .map(|name| {
            let values: Vec<Option<&Value>> = rows.iter().map(|r| r.get(name).filter(|v| !v.is_null())).collect();
            infer_series(name, &values)
        })
        .collect::<Vec<_>>();

    Ok(DataFrame::new(columns)?)
}

fn infer_series(name: &str, values: &[Option<&Value>]) -> Series {
    let present = || values.iter().flatten();

    // no value to infer from: the target table decides the type
    if present().next().is_none() {
        return Series::new_null(name, values.len());
    }

    if present().all(|v| v.is_boolean()) {
        let data: Vec<Option<bool>> = values.iter().map(|v| v.and_then(Value::as_bool)).collect();
        return Series::new(name, data);
    }
    if present().all(|v| v.is_i64()) {
        let data: Vec<Option<i64>> = values.iter().map(|v| v.and_then(Value::as_i64)).collect();
        return Series::new(name, data);
    }
    if present().all(|v| v.is_number()) {
        let data: Vec<Option<f64>> = values.iter().map(|v| v.and_then(Value::as_f64)).collect();
        return Series::new(name, data);
    }

    let data: Vec<Option<String>> = values
        .iter()
        .map(|v| {
            v.map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })
        .collect();
    Series::new(name, data)
}
