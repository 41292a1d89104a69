//! Extraction - raw records from the NeoWs API and the tier-1 batches built from them

pub mod build;
pub mod client;

pub use build::{build_asteroid_data, build_close_approach_data, week_of_month};
pub use client::NeoWsClient;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

/// Query parameters as ordered key/value pairs.
pub type QueryParams = Vec<(String, String)>;

/// Source of raw JSON records.
///
/// `fetch` and `fetch_each` have partial-success semantics: failures are
/// logged and yield fewer (or no) records. `try_fetch` reports a failed
/// single call so callers can tell it apart from an empty response.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// One request to `endpoint`. When `field` is given the records are read
    /// from that member of the response; an object of lists is flattened.
    async fn try_fetch(&self, endpoint: &str, params: &QueryParams, field: Option<&str>) -> Result<Vec<Value>>;

    /// `try_fetch` with a failure logged and read as no records.
    async fn fetch(&self, endpoint: &str, params: &QueryParams, field: Option<&str>) -> Vec<Value> {
        match self.try_fetch(endpoint, params, field).await {
            Ok(records) => records,
            Err(e) => {
                warn!("{}", e);
                Vec::new()
            }
        }
    }

    /// One request per identifier to `endpoint/<id>`, gathered in `ids` order.
    /// Items that fail are dropped.
    async fn fetch_each(&self, endpoint: &str, params: &QueryParams, ids: &[String]) -> Vec<Value>;
}

/// Records under `field` of a response body.
///
/// `{"2024-01-01": [a, b], "2024-01-02": [c]}` becomes `[a, b, c]`.
pub fn records_from_payload(payload: Value, field: Option<&str>) -> Vec<Value> {
    let data = match field {
        Some(field) => match payload {
            Value::Object(mut map) => map.remove(field).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        None => payload,
    };

    match data {
        Value::Array(items) => items,
        Value::Object(groups) => groups
            .into_iter()
            .flat_map(|(_, group)| match group {
                Value::Array(items) => items,
                other => vec![other],
            })
            .collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Drop repeated identifiers, keeping first-occurrence order.
pub fn unique_ids<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(Into::into)
        .filter(|id| seen.insert(id.clone()))
        .collect()
}
