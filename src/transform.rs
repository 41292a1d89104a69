//! Schema-driven cleaning and analytic derivations.
//!
//! Cleaning keeps the schema's columns in position order, casts them and
//! renames them by the table's naming rule. The analytic side derives
//! asteroid metrics, splits the approach timestamp and joins both
//! entities into `near_earth_approaches`.

use crate::error::{LakeError, Result};
use crate::extract::build::{APPROACH_DATETIME, NEO_REFERENCE_ID};
use crate::schema::TableSchema;
use polars::prelude::*;
use std::collections::HashSet;
use tracing::{debug, warn};

pub const APPROACH_DATE: &str = "approach_date";
pub const APPROACH_TIME: &str = "approach_time";
pub const COUNT_PER_DATE: &str = "count_per_date";
pub const DIAMETER_AVG: &str = "estimated_diameter_avg";
pub const ALBEDO: &str = "albedo";

const DIAMETER_MIN: &str = "estimated_diameter_min";
const DIAMETER_MAX: &str = "estimated_diameter_max";
const MAGNITUDE: &str = "absolute_magnitude_h";

/// Select, cast and rename `df` to `schema`.
///
/// Columns the schema names but `df` lacks are added as typed nulls.
pub fn clean_table(df: &DataFrame, schema: &TableSchema) -> Result<DataFrame> {
    if df.width() == 0 {
        return Ok(DataFrame::empty());
    }

    let rule = schema.naming_rule();
    let mut renamed = HashSet::new();
    let mut exprs = Vec::with_capacity(schema.columns.len());

    for column in &schema.columns {
        let source = column.column_name.as_str();
        let target = rule.apply(source);
        if !renamed.insert(target.clone()) {
            return Err(LakeError::Schema(format!(
                "Columns of '{}' collide on '{}' after renaming",
                schema.name, target
            )));
        }

        let dtype = column.column_type.to_polars();
        let expr = if df.column(source).is_ok() {
            col(source).strict_cast(dtype)
        } else {
            warn!("Column '{}' missing from {}, filling with nulls", source, schema.name);
            lit(NULL).cast(dtype)
        };
        exprs.push(expr.alias(&target));
    }

    let cleaned = df.clone().lazy().select(exprs).collect()?;
    debug!("Cleaned {}: {} rows, {} columns", schema.name, cleaned.height(), cleaned.width());
    Ok(cleaned)
}

/// Add `estimated_diameter_avg` and `albedo` to cleaned asteroid rows.
///
/// `albedo = 10^(-2 * log10(avg) + 6.2472 - 0.4 * H)`
pub fn add_asteroid_metrics(asteroids: &DataFrame) -> Result<DataFrame> {
    let min = float_column(asteroids, DIAMETER_MIN)?;
    let max = float_column(asteroids, DIAMETER_MAX)?;
    let magnitude = float_column(asteroids, MAGNITUDE)?;

    let avg: Vec<Option<f64>> = min
        .iter()
        .zip(max.iter())
        .map(|(lo, hi)| Some((lo? + hi?) / 2.0))
        .collect();
    let albedo: Vec<Option<f64>> = avg
        .iter()
        .zip(magnitude.iter())
        .map(|(d, h)| {
            let d = (*d)?;
            if d <= 0.0 {
                return None;
            }
            Some(10f64.powf(-2.0 * d.log10() + 6.2472 - 0.4 * h?))
        })
        .collect();

    let mut out = asteroids.clone();
    out.with_column(Series::new(DIAMETER_AVG, avg))?;
    out.with_column(Series::new(ALBEDO, albedo))?;
    Ok(out)
}

fn float_column(df: &DataFrame, name: &str) -> Result<Float64Chunked> {
    let series = df
        .column(name)
        .map_err(|_| LakeError::Schema(format!("Column '{}' required for asteroid metrics", name)))?
        .cast(&DataType::Float64)?;
    Ok(series.f64()?.clone())
}

/// Split `approach_datetime` into `approach_date` and `approach_time`
/// and count approaches per date.
pub fn split_approach_datetime(events: &DataFrame) -> Result<DataFrame> {
    if events.column(APPROACH_DATETIME).is_err() {
        return Err(LakeError::Schema(format!("Column '{}' missing from events", APPROACH_DATETIME)));
    }

    let split = events
        .clone()
        .lazy()
        .with_columns([
            col(APPROACH_DATETIME).dt().date().alias(APPROACH_DATE),
            col(APPROACH_DATETIME).dt().strftime("%H:%M:%S").alias(APPROACH_TIME),
        ]);

    let counts = split
        .clone()
        .group_by([col(APPROACH_DATE)])
        .agg([col(NEO_REFERENCE_ID).count().cast(DataType::Int16).alias(COUNT_PER_DATE)]);

    Ok(split
        .join(
            counts,
            [col(APPROACH_DATE)],
            [col(APPROACH_DATE)],
            JoinArgs::new(JoinType::Left),
        )
        .collect()?)
}

/// Inner join of events and asteroids on `neo_reference_id`, shaped to `schema`.
///
/// Columns present on both sides are taken from the events.
pub fn join_near_earth_approaches(events: &DataFrame, asteroids: &DataFrame, schema: &TableSchema) -> Result<DataFrame> {
    let event_columns: HashSet<&str> = events.get_column_names().into_iter().collect();
    let asteroid_columns: Vec<Expr> = asteroids
        .get_column_names()
        .into_iter()
        .filter(|name| *name == NEO_REFERENCE_ID || !event_columns.contains(name))
        .map(col)
        .collect();

    let joined = events
        .clone()
        .lazy()
        .join(
            asteroids.clone().lazy().select(asteroid_columns),
            [col(NEO_REFERENCE_ID)],
            [col(NEO_REFERENCE_ID)],
            JoinArgs::new(JoinType::Inner),
        )
        .collect()?;

    debug!(
        "Joined {} events with {} asteroids into {} rows",
        events.height(),
        asteroids.height(),
        joined.height()
    );
    clean_table(&joined, schema)
}
