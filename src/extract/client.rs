//! NeoWs HTTP client
//!
//! `try_fetch` is a single GET; `fetch_each` fans out one GET per identifier as
//! independent tokio tasks and gathers whatever succeeded.

use crate::error::{LakeError, Result};
use crate::extract::{records_from_payload, QueryParams, RecordSource};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct NeoWsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    max_concurrency: Option<usize>,
}

impl NeoWsClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            max_concurrency: None,
        }
    }

    /// Cap the number of in-flight per-identifier requests.
    pub fn with_max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.max_concurrency = limit.filter(|n| *n > 0);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn query(&self, params: &QueryParams) -> QueryParams {
        let mut query = params.clone();
        if !self.api_key.is_empty() {
            query.push(("api_key".to_string(), self.api_key.clone()));
        }
        query
    }
}

async fn get_json(http: &reqwest::Client, url: &str, query: &QueryParams) -> Result<Value> {
    let response = http
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|e| LakeError::Extraction(format!("Request to {} failed: {}", url, e)))?
        .error_for_status()
        .map_err(|e| LakeError::Extraction(format!("Request to {} failed: {}", url, e)))?;

    response
        .json::<Value>()
        .await
        .map_err(|e| LakeError::Extraction(format!("Invalid JSON from {}: {}", url, e)))
}

#[async_trait]
impl RecordSource for NeoWsClient {
    async fn try_fetch(&self, endpoint: &str, params: &QueryParams, field: Option<&str>) -> Result<Vec<Value>> {
        let url = self.url(endpoint);
        let payload = get_json(&self.http, &url, &self.query(params)).await?;
        let records = records_from_payload(payload, field);
        debug!("Fetched {} records from {}", records.len(), url);
        Ok(records)
    }

    async fn fetch_each(&self, endpoint: &str, params: &QueryParams, ids: &[String]) -> Vec<Value> {
        let query = Arc::new(self.query(params));
        let limiter = self.max_concurrency.map(|n| Arc::new(Semaphore::new(n)));
        let mut tasks = JoinSet::new();

        for (idx, id) in ids.iter().enumerate() {
            let http = self.http.clone();
            let url = self.url(&format!("{}/{}", endpoint.trim_end_matches('/'), id));
            let query = Arc::clone(&query);
            let limiter = limiter.clone();

            tasks.spawn(async move {
                let _permit = match limiter {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                (idx, get_json(&http, &url, &query).await)
            });
        }

        let mut gathered = Vec::with_capacity(ids.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, Ok(record))) => gathered.push((idx, record)),
                Ok((idx, Err(e))) => warn!("Dropping {} {}: {}", endpoint, ids[idx], e),
                Err(e) => warn!("Fetch task for {} failed: {}", endpoint, e),
            }
        }

        gathered.sort_by_key(|(idx, _)| *idx);
        debug!("Fetched {}/{} {} records", gathered.len(), ids.len(), endpoint);
        gathered.into_iter().map(|(_, record)| record).collect()
    }
}
