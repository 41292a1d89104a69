//! Delta Lake table store on the local filesystem.
//!
//! Each table is a directory holding parquet data files in hive-style
//! partition directories and a `_delta_log/` of JSON commits. Reads scan
//! the latest (or a pinned) snapshot, merges and maintenance go through
//! [`DeltaOps`].

use super::convert::{to_data_frame, to_record_batches};
use super::{
    CommitSummary, MatchedAction, MergeClauses, MergeMetrics, NotMatchedAction, OptimizeMetrics, SaveMode,
    TableStore, VacuumMetrics, VacuumOptions,
};
use crate::error::{LakeError, Result};
use async_trait::async_trait;
use deltalake::datafusion::common::Column;
use deltalake::datafusion::logical_expr::Expr;
use deltalake::datafusion::physical_plan::common::collect;
use deltalake::datafusion::prelude::SessionContext;
use deltalake::operations::optimize::{Metrics, OptimizeType};
use deltalake::protocol::SaveMode as DeltaSaveMode;
use deltalake::{DeltaOps, DeltaTable, DeltaTableBuilder};
use polars::prelude::DataFrame;
use std::path::Path;
use tracing::{debug, info};
use url::Url;

pub const LOG_DIR: &str = "_delta_log";

const SOURCE_ALIAS: &str = "source";
const TARGET_ALIAS: &str = "target";

/// Table properties set when a table is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub log_retention_days: u32,
    pub deleted_file_retention_days: u32,
    pub checkpoint_interval: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            log_retention_days: 7,
            deleted_file_retention_days: 7,
            checkpoint_interval: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeltaTableStore {
    options: StoreOptions,
}

impl DeltaTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: StoreOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn configuration(&self) -> Vec<(String, Option<String>)> {
        vec![
            (
                "delta.logRetentionDuration".to_string(),
                Some(format!("interval {} days", self.options.log_retention_days)),
            ),
            (
                "delta.deletedFileRetentionDuration".to_string(),
                Some(format!("interval {} days", self.options.deleted_file_retention_days)),
            ),
            (
                "delta.checkpointInterval".to_string(),
                Some(self.options.checkpoint_interval.to_string()),
            ),
        ]
    }

    async fn open(&self, table: &Path, version: Option<i64>) -> Result<DeltaTable> {
        if !self.exists(table) {
            return Err(LakeError::NotFound(table.display().to_string()));
        }
        let mut builder = DeltaTableBuilder::from_uri(table_url(table)?)?;
        if let Some(version) = version {
            builder = builder.with_version(version);
        }
        Ok(builder.load().await?)
    }
}

fn table_url(table: &Path) -> Result<Url> {
    let absolute = std::path::absolute(table)?;
    Url::from_directory_path(&absolute)
        .map_err(|_| LakeError::Config(format!("Invalid table path: {}", table.display())))
}

async fn scan(table: DeltaTable) -> Result<DataFrame> {
    let (_, stream) = DeltaOps(table).load().await?;
    let schema = stream.schema();
    let batches = collect(stream).await?;
    to_data_frame(&schema, &batches)
}

fn delta_save_mode(mode: SaveMode) -> DeltaSaveMode {
    match mode {
        SaveMode::Overwrite => DeltaSaveMode::Overwrite,
        SaveMode::Append => DeltaSaveMode::Append,
        SaveMode::ErrorIfExists => DeltaSaveMode::ErrorIfExists,
        SaveMode::Ignore => DeltaSaveMode::Ignore,
    }
}

fn source_column(name: &str) -> Expr {
    Expr::Column(Column::new(Some(SOURCE_ALIAS), name))
}

fn optimize_metrics(table: &DeltaTable, metrics: &Metrics) -> OptimizeMetrics {
    OptimizeMetrics {
        partitions_optimized: metrics.partitions_optimized as usize,
        num_files_added: metrics.num_files_added as usize,
        num_files_removed: metrics.num_files_removed as usize,
        version: if metrics.num_files_added > 0 { table.version() } else { None },
    }
}

#[async_trait]
impl TableStore for DeltaTableStore {
    fn exists(&self, table: &Path) -> bool {
        table.join(LOG_DIR).is_dir()
    }

    async fn read_snapshot(&self, table: &Path) -> Result<DataFrame> {
        scan(self.open(table, None).await?).await
    }

    async fn read_version(&self, table: &Path, version: i64) -> Result<DataFrame> {
        scan(self.open(table, Some(version)).await?).await
    }

    async fn write(&self, table: &Path, batch: &DataFrame, mode: SaveMode, partition_by: &[String]) -> Result<Option<i64>> {
        let exists = self.exists(table);
        match (mode, exists) {
            (SaveMode::ErrorIfExists, true) => return Err(LakeError::AlreadyExists(table.display().to_string())),
            (SaveMode::Ignore, true) => {
                debug!("Table {} exists, write ignored", table.display());
                return Ok(None);
            }
            _ => {}
        }

        let (delta, target) = if exists {
            let delta = self.open(table, None).await?;
            let target = match mode {
                SaveMode::Append => Some(delta.snapshot()?.snapshot().arrow_schema()),
                _ => None,
            };
            (delta, target)
        } else {
            std::fs::create_dir_all(table)?;
            (DeltaTableBuilder::from_uri(table_url(table)?)?.build()?, None)
        };

        let batches = to_record_batches(batch, target.as_deref())?;
        let mut builder = DeltaOps(delta).write(batches).with_save_mode(delta_save_mode(mode));
        if !exists {
            builder = builder
                .with_partition_columns(partition_by.to_vec())
                .with_configuration(self.configuration());
        }
        let written = builder.await?;

        info!("Wrote {} rows to {} ({:?})", batch.height(), table.display(), mode);
        Ok(written.version())
    }

    async fn merge(&self, table: &Path, batch: &DataFrame, clauses: &MergeClauses) -> Result<MergeMetrics> {
        let delta = self.open(table, None).await?;
        let target = delta.snapshot()?.snapshot().arrow_schema();
        let batches = to_record_batches(batch, Some(&target))?;
        let columns: Vec<String> = batch.get_column_names().iter().map(|c| c.to_string()).collect();
        let keys = clauses.predicate.keys();

        let source = SessionContext::new().read_batches(batches)?;
        let mut builder = DeltaOps(delta)
            .merge(source, clauses.predicate.to_string())
            .with_source_alias(SOURCE_ALIAS)
            .with_target_alias(TARGET_ALIAS)
            .with_merge_schema(true);

        if clauses.when_matched == MatchedAction::UpdateAll {
            builder = builder.when_matched_update(|update| {
                columns
                    .iter()
                    .filter(|c| !keys.contains(c))
                    .fold(update, |update, c| update.update(Column::new_unqualified(c), source_column(c)))
            })?;
        }
        if clauses.when_not_matched == NotMatchedAction::InsertAll {
            builder = builder.when_not_matched_insert(|insert| {
                columns
                    .iter()
                    .fold(insert, |insert, c| insert.set(Column::new_unqualified(c), source_column(c)))
            })?;
        }

        let (delta, metrics) = builder.await?;
        let changed = metrics.num_target_rows_inserted + metrics.num_target_rows_updated;
        debug!("Merge into {} changed {} rows", table.display(), changed);

        Ok(MergeMetrics {
            num_source_rows: metrics.num_source_rows,
            num_target_rows_inserted: metrics.num_target_rows_inserted,
            num_target_rows_updated: metrics.num_target_rows_updated,
            num_target_rows_copied: metrics.num_target_rows_copied,
            num_source_rows_skipped: metrics.num_source_rows.saturating_sub(changed),
            num_target_files_added: metrics.num_target_files_added,
            num_target_files_removed: metrics.num_target_files_removed,
            version: if changed > 0 { delta.version() } else { None },
        })
    }

    async fn compact(&self, table: &Path) -> Result<OptimizeMetrics> {
        let delta = self.open(table, None).await?;
        let (delta, metrics) = DeltaOps(delta).optimize().await?;
        Ok(optimize_metrics(&delta, &metrics))
    }

    async fn vacuum(&self, table: &Path, options: &VacuumOptions) -> Result<VacuumMetrics> {
        let delta = self.open(table, None).await?;
        let (_, metrics) = DeltaOps(delta)
            .vacuum()
            .with_retention_period(chrono::Duration::days(i64::from(options.retention_days)))
            .with_enforce_retention_duration(options.enforce_retention)
            .with_dry_run(options.dry_run)
            .await?;

        Ok(VacuumMetrics {
            files_deleted: metrics.files_deleted,
            dry_run: metrics.dry_run,
        })
    }

    async fn reorder(&self, table: &Path, columns: &[String]) -> Result<OptimizeMetrics> {
        let delta = self.open(table, None).await?;
        let schema = delta.snapshot()?.snapshot().arrow_schema();
        if columns.is_empty() {
            return Err(LakeError::Schema("Z-order needs at least one column".to_string()));
        }
        if let Some(unknown) = columns.iter().find(|c| schema.field_with_name(c).is_err()) {
            return Err(LakeError::Schema(format!(
                "Cannot z-order {} by unknown column '{}'",
                table.display(),
                unknown
            )));
        }

        let (delta, metrics) = DeltaOps(delta)
            .optimize()
            .with_type(OptimizeType::ZOrder(columns.to_vec()))
            .await?;
        Ok(optimize_metrics(&delta, &metrics))
    }

    async fn history(&self, table: &Path) -> Result<Vec<CommitSummary>> {
        let delta = self.open(table, None).await?;
        let latest = delta.version().unwrap_or_default();
        let commits = delta.history(None).await?;

        Ok(commits
            .into_iter()
            .enumerate()
            .map(|(i, commit)| CommitSummary {
                version: latest - i as i64,
                timestamp: commit.timestamp,
                operation: commit.operation,
            })
            .collect())
    }
}
