//! Merge/Upsert Engine - idempotent landing of batches into tier tables
//!
//! Two load policies, both expressed as branch selections over
//! [`TableStore::merge`]:
//! - append-new (`save_new_data`): matched keys are left alone, new keys inserted
//! - upsert (`upsert_data`): matched keys are overwritten, new keys inserted
//!
//! A table that was never written is created by a full overwrite write.

use crate::error::{LakeError, Result};
use crate::table::{
    MatchedAction, MergeClauses, MergeMetrics, MergePredicate, NotMatchedAction, SaveMode, TableStore,
};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// What to do with a batch that repeats a natural key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep the first occurrence of each key and drop the rest.
    #[default]
    KeepFirst,
    /// Fail the load.
    Reject,
}

impl FromStr for DuplicatePolicy {
    type Err = LakeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "keep_first" | "first" => Ok(DuplicatePolicy::KeepFirst),
            "reject" => Ok(DuplicatePolicy::Reject),
            other => Err(LakeError::Config(format!(
                "Unknown duplicate policy '{}', expected keep-first or reject",
                other
            ))),
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicatePolicy::KeepFirst => write!(f, "keep-first"),
            DuplicatePolicy::Reject => write!(f, "reject"),
        }
    }
}

/// What a single load did to its target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LoadOutcome {
    /// The table did not exist and was written in full.
    Created { version: Option<i64>, rows: usize },
    Merged(MergeMetrics),
    /// Empty batch, nothing to do.
    Skipped,
}

impl LoadOutcome {
    /// Rows that became new or changed in the target.
    pub fn rows_written(&self) -> usize {
        match self {
            LoadOutcome::Created { rows, .. } => *rows,
            LoadOutcome::Merged(m) => m.num_target_rows_inserted + m.num_target_rows_updated,
            LoadOutcome::Skipped => 0,
        }
    }
}

pub struct MergeEngine {
    store: Arc<dyn TableStore>,
    duplicates: DuplicatePolicy,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self {
            store,
            duplicates: DuplicatePolicy::default(),
        }
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicates = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    /// Append rows whose natural key is not yet present; never alter landed rows.
    ///
    /// First run falls back to a partitioned overwrite write.
    pub async fn save_new_data(
        &self,
        batch: &DataFrame,
        table: &Path,
        predicate: &MergePredicate,
        partition_by: &[String],
    ) -> Result<LoadOutcome> {
        let clauses = MergeClauses {
            predicate: predicate.clone(),
            when_matched: MatchedAction::DoNothing,
            when_not_matched: NotMatchedAction::InsertAll,
        };
        self.load(batch, table, &clauses, partition_by).await
    }

    /// Update rows whose natural key is present, insert the rest.
    ///
    /// First run falls back to an unpartitioned overwrite write.
    pub async fn upsert_data(&self, batch: &DataFrame, table: &Path, predicate: &MergePredicate) -> Result<LoadOutcome> {
        let clauses = MergeClauses {
            predicate: predicate.clone(),
            when_matched: MatchedAction::UpdateAll,
            when_not_matched: NotMatchedAction::InsertAll,
        };
        self.load(batch, table, &clauses, &[]).await
    }

    async fn load(&self, batch: &DataFrame, table: &Path, clauses: &MergeClauses, partition_by: &[String]) -> Result<LoadOutcome> {
        if batch.height() == 0 {
            info!("Empty batch for {}, nothing to load", table.display());
            return Ok(LoadOutcome::Skipped);
        }

        let batch = self
            .deduplicate(batch, clauses.predicate.keys())
            .map_err(|e| load_failure(table, e))?;

        match self.store.merge(table, &batch, clauses).await {
            Ok(metrics) => {
                info!(
                    "Merged into {}: {} inserted, {} updated, {} skipped",
                    table.display(),
                    metrics.num_target_rows_inserted,
                    metrics.num_target_rows_updated,
                    metrics.num_source_rows_skipped
                );
                Ok(LoadOutcome::Merged(metrics))
            }
            Err(e) if e.is_not_found() => {
                info!("Table {} not found, creating it", table.display());
                let version = self
                    .store
                    .write(table, &batch, SaveMode::Overwrite, partition_by)
                    .await
                    .map_err(|e| load_failure(table, e))?;
                Ok(LoadOutcome::Created {
                    version,
                    rows: batch.height(),
                })
            }
            Err(e) => Err(load_failure(table, e)),
        }
    }

    fn deduplicate(&self, batch: &DataFrame, keys: &[String]) -> Result<DataFrame> {
        for key in keys {
            if batch.column(key).is_err() {
                return Err(LakeError::Schema(format!("Natural key column '{}' missing from batch", key)));
            }
        }

        let unique = batch.unique_stable(Some(keys), UniqueKeepStrategy::First, None)?;
        let dropped = batch.height() - unique.height();
        if dropped == 0 {
            return Ok(batch.clone());
        }

        match self.duplicates {
            DuplicatePolicy::KeepFirst => {
                warn!("Dropped {} rows repeating a natural key ({})", dropped, keys.join(", "));
                Ok(unique)
            }
            DuplicatePolicy::Reject => Err(LakeError::Schema(format!(
                "Batch repeats {} natural keys ({})",
                dropped,
                keys.join(", ")
            ))),
        }
    }
}

fn load_failure(table: &Path, err: LakeError) -> LakeError {
    LakeError::Load(format!("{}: {}", table.display(), err))
}
