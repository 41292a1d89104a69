//! Table Store - partitioned, versioned, columnar tables
//!
//! The [`TableStore`] trait is the capability the load layer depends on:
//! snapshot reads, conditional merge-writes and file-level maintenance.
//! Every mutating call commits exactly one new table version or leaves the
//! table untouched.
//!
//! [`DeltaTableStore`] implements it over Delta Lake tables on the local
//! filesystem.

mod convert;
pub mod delta;
pub mod predicate;

pub use delta::DeltaTableStore;
pub use predicate::MergePredicate;

use crate::error::Result;
use async_trait::async_trait;
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How `write` treats an existing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    Overwrite,
    Append,
    ErrorIfExists,
    Ignore,
}

/// What happens to a target row whose natural key matches a source row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedAction {
    UpdateAll,
    DoNothing,
}

/// What happens to a source row with no matching target row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotMatchedAction {
    InsertAll,
    DoNothing,
}

/// Predicate plus the two branch actions of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeClauses {
    pub predicate: MergePredicate,
    pub when_matched: MatchedAction,
    pub when_not_matched: NotMatchedAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeMetrics {
    pub num_source_rows: usize,
    pub num_target_rows_inserted: usize,
    pub num_target_rows_updated: usize,
    /// Target rows rewritten unchanged because they shared a file with an update.
    pub num_target_rows_copied: usize,
    /// Source rows that hit a `DoNothing` branch.
    pub num_source_rows_skipped: usize,
    pub num_target_files_added: usize,
    pub num_target_files_removed: usize,
    /// Committed version, `None` when the merge changed nothing.
    pub version: Option<i64>,
}

/// Result of `compact` and `reorder`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeMetrics {
    pub partitions_optimized: usize,
    pub num_files_added: usize,
    pub num_files_removed: usize,
    pub version: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VacuumOptions {
    pub retention_days: u32,
    /// Reject retentions shorter than the table's deleted-file retention.
    pub enforce_retention: bool,
    pub dry_run: bool,
}

impl VacuumOptions {
    /// Zero days vacuums immediately and turns the retention check off.
    pub fn days(days: u32) -> Self {
        Self {
            retention_days: days,
            enforce_retention: days != 0,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VacuumMetrics {
    /// Paths deleted (or that would be, on a dry run).
    pub files_deleted: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub version: i64,
    pub timestamp: Option<i64>,
    pub operation: Option<String>,
}

/// Capability interface over a partitioned, versioned table abstraction.
#[async_trait]
pub trait TableStore: Send + Sync {
    fn exists(&self, table: &Path) -> bool;

    /// Latest committed version. `NotFound` if the table was never written.
    async fn read_snapshot(&self, table: &Path) -> Result<DataFrame>;

    /// Content as of `version`.
    async fn read_version(&self, table: &Path, version: i64) -> Result<DataFrame>;

    /// Create or rewrite a table. Returns the committed version, if any.
    async fn write(
        &self,
        table: &Path,
        batch: &DataFrame,
        mode: SaveMode,
        partition_by: &[String],
    ) -> Result<Option<i64>>;

    /// Conditional merge of `batch` into an existing table.
    /// `NotFound` if the table was never written.
    async fn merge(&self, table: &Path, batch: &DataFrame, clauses: &MergeClauses) -> Result<MergeMetrics>;

    /// Merge small files without changing logical content.
    async fn compact(&self, table: &Path) -> Result<OptimizeMetrics>;

    /// Physically delete unreferenced files older than the retention.
    async fn vacuum(&self, table: &Path, options: &VacuumOptions) -> Result<VacuumMetrics>;

    /// Re-cluster file layout by `columns`.
    async fn reorder(&self, table: &Path, columns: &[String]) -> Result<OptimizeMetrics>;

    /// Commits, newest first.
    async fn history(&self, table: &Path) -> Result<Vec<CommitSummary>>;
}
