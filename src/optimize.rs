//! Storage Optimizer - best-effort table maintenance
//!
//! Compaction, retention vacuum and clustering never change logical
//! content. Failures are logged and swallowed: they cost read efficiency,
//! never correctness.

use crate::table::{OptimizeMetrics, TableStore, VacuumMetrics, VacuumOptions};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of one `compact_and_retain` pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub table: PathBuf,
    pub files_compacted: usize,
    pub files_vacuumed: usize,
    pub errors: Vec<String>,
}

impl MaintenanceReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct StorageOptimizer {
    store: Arc<dyn TableStore>,
}

impl StorageOptimizer {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    /// Compact small files, then vacuum files superseded more than
    /// `retention_days` ago. Zero days vacuums immediately without the
    /// retention safety check.
    pub async fn compact_and_retain(&self, table: &Path, retention_days: u32) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            table: table.to_path_buf(),
            ..Default::default()
        };

        match self.store.compact(table).await {
            Ok(OptimizeMetrics { num_files_removed, .. }) => report.files_compacted = num_files_removed,
            Err(e) => {
                error!("Compaction of {} failed: {}", table.display(), e);
                report.errors.push(format!("compact: {}", e));
            }
        }

        match self.store.vacuum(table, &VacuumOptions::days(retention_days)).await {
            Ok(VacuumMetrics { files_deleted, .. }) => report.files_vacuumed = files_deleted.len(),
            Err(e) => {
                error!("Vacuum of {} failed: {}", table.display(), e);
                report.errors.push(format!("vacuum: {}", e));
            }
        }

        info!(
            "Maintenance of {}: {} files compacted, {} files vacuumed",
            table.display(),
            report.files_compacted,
            report.files_vacuumed
        );
        report
    }

    /// Re-cluster `table` by `columns`. Returns whether a new layout was committed.
    pub async fn cluster(&self, table: &Path, columns: &[String]) -> bool {
        match self.store.reorder(table, columns).await {
            Ok(metrics) => {
                debug!(
                    "Clustered {} by {:?}: {} partitions rewritten",
                    table.display(),
                    columns,
                    metrics.partitions_optimized
                );
                metrics.version.is_some()
            }
            Err(e) => {
                warn!("Z-order of {} by {:?} failed: {}", table.display(), columns, e);
                false
            }
        }
    }

    /// `compact_and_retain` every table directory found under each tier.
    pub async fn optimize_tiers(&self, tiers: &[PathBuf], retention_days: u32) -> Vec<MaintenanceReport> {
        let mut reports = Vec::new();
        for tier in tiers {
            let entries = match std::fs::read_dir(tier) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Skipping tier {}: {}", tier.display(), e);
                    continue;
                }
            };

            let mut tables: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_dir() && self.store.exists(path))
                .collect();
            tables.sort();

            for table in tables {
                reports.push(self.compact_and_retain(&table, retention_days).await);
            }
        }
        reports
    }
}
