//! Pipeline Orchestrator - bronze -> silver -> gold
//!
//! One run walks a strictly sequential state machine:
//!
//! ```text
//! ExtractLoad -> CleanTransform -> AnalyticTransform -> Done
//!       \______________\_________________\____________-> Failed
//! ```
//!
//! Each stage finishes its table commits before the next one starts. The
//! extraction boundary is advanced only after all three stages succeed, so
//! a failed run leaves the window to be retried. Rows are stamped with an
//! `extraction_date` marker naming the window they were extracted for (its
//! start date). Stages 2 and 3 pick up the window's rows by that marker, so
//! a retry on a later day still finds the events an earlier attempt landed,
//! and the merge policies make re-running a window safe.

use crate::config::PipelineConfig;
use crate::error::{LakeError, Result};
use crate::extract::build::{APPROACH_DATETIME, EXTRACTION_DATE, NEO_REFERENCE_ID};
use crate::extract::{build_asteroid_data, build_close_approach_data, unique_ids, NeoWsClient, QueryParams, RecordSource};
use crate::merge::{LoadOutcome, MergeEngine};
use crate::optimize::{MaintenanceReport, StorageOptimizer};
use crate::schema::{SchemaCatalog, ASTEROID_DATA, CLOSE_APPROACH_DATA, NEAR_EARTH_APPROACHES};
use crate::state::{StateTracker, DATE_FORMAT, LAST_VALUE_KEY};
use crate::table::{DeltaTableStore, MergePredicate, TableStore};
use crate::transform::{
    add_asteroid_metrics, clean_table, join_near_earth_approaches, split_approach_datetime, APPROACH_DATE,
};
use chrono::{Duration, Local, NaiveDate};
use polars::prelude::*;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

const FEED_ENDPOINT: &str = "feed";
const FEED_FIELD: &str = "near_earth_objects";
const LOOKUP_ENDPOINT: &str = "neo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    ExtractLoad,
    CleanTransform,
    AnalyticTransform,
    Done,
    Failed,
}

impl Stage {
    fn next(self) -> Stage {
        match self {
            Stage::ExtractLoad => Stage::CleanTransform,
            Stage::CleanTransform => Stage::AnalyticTransform,
            Stage::AnalyticTransform => Stage::Done,
            Stage::Done => Stage::Done,
            Stage::Failed => Stage::Failed,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ExtractLoad => "EXTRACT_LOAD",
            Stage::CleanTransform => "CLEAN_TRANSFORM",
            Stage::AnalyticTransform => "ANALYTIC_TRANSFORM",
            Stage::Done => "DONE",
            Stage::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// Half-open extraction window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtractionWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ExtractionWindow {
    pub fn starting_at(start: NaiveDate, days: u32) -> Self {
        Self {
            start,
            end: start + Duration::days(i64::from(days)),
        }
    }

    /// Value of the extraction marker for rows of this window.
    pub fn marker(&self) -> String {
        self.start.format(DATE_FORMAT).to_string()
    }

    fn query(&self) -> QueryParams {
        vec![
            ("start_date".to_string(), self.start.format(DATE_FORMAT).to_string()),
            ("end_date".to_string(), self.end.format(DATE_FORMAT).to_string()),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// The feed answered with no events; nothing written, boundary advanced.
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableLoad {
    pub stage: Stage,
    pub table: PathBuf,
    pub outcome: LoadOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub window: ExtractionWindow,
    pub run_date: NaiveDate,
    pub status: RunStatus,
    /// Last stage reached.
    pub stage: Stage,
    pub loads: Vec<TableLoad>,
    /// Persisted boundary after the run, when it advanced.
    pub boundary: Option<NaiveDate>,
    pub maintenance: Vec<MaintenanceReport>,
}

pub struct Orchestrator {
    config: PipelineConfig,
    source: Arc<dyn RecordSource>,
    store: Arc<dyn TableStore>,
    engine: MergeEngine,
    optimizer: StorageOptimizer,
    state: StateTracker,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, source: Arc<dyn RecordSource>, store: Arc<dyn TableStore>) -> Self {
        let engine = MergeEngine::new(Arc::clone(&store)).with_duplicate_policy(config.duplicate_policy);
        let optimizer = StorageOptimizer::new(Arc::clone(&store));
        let state = StateTracker::new(config.state_path.clone());
        Self {
            config,
            source,
            store,
            engine,
            optimizer,
            state,
        }
    }

    /// NeoWs client and local table store from a validated config.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let client = NeoWsClient::new(config.api.base_url.clone(), config.api.token.clone())
            .with_max_concurrency(config.api.max_concurrency);
        Ok(Self::new(config, Arc::new(client), Arc::new(DeltaTableStore::new())))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> &StateTracker {
        &self.state
    }

    pub async fn run(&self) -> Result<RunReport> {
        self.run_at(Local::now().date_naive()).await
    }

    /// Run once with `today` as the run date and the default boundary.
    pub async fn run_at(&self, today: NaiveDate) -> Result<RunReport> {
        let boundary = self.state.get_boundary_at(CLOSE_APPROACH_DATA, LAST_VALUE_KEY, today)?;
        let window = ExtractionWindow::starting_at(boundary, self.config.window_days);
        let mut report = RunReport {
            window,
            run_date: today,
            status: RunStatus::Completed,
            stage: Stage::ExtractLoad,
            loads: Vec::new(),
            boundary: None,
            maintenance: Vec::new(),
        };
        info!("Pipeline run {} for window [{}, {})", today, window.start, window.end);

        let catalog = SchemaCatalog::load(&self.config.schema_path).map_err(|e| fail(Stage::ExtractLoad, e))?;

        while !matches!(report.stage, Stage::Done | Stage::Failed) {
            let stage = report.stage;
            let result = match stage {
                Stage::ExtractLoad => self.extract_and_load(&window, &mut report).await,
                Stage::CleanTransform => self.cleaning_transform(&catalog, &window, &mut report).await,
                Stage::AnalyticTransform => self.analytic_transform(&catalog, &window, &mut report).await,
                Stage::Done | Stage::Failed => Ok(()),
            };

            if let Err(e) = result {
                return Err(fail(stage, e));
            }
            report.stage = match report.status {
                RunStatus::Empty => {
                    warn!("No close approaches in [{}, {}), nothing to load", window.start, window.end);
                    Stage::Done
                }
                RunStatus::Completed => stage.next(),
            };
        }

        self.state
            .set_boundary(CLOSE_APPROACH_DATA, LAST_VALUE_KEY, window.end)
            .map_err(|e| fail(Stage::Done, e))?;
        report.boundary = Some(window.end);
        info!("Pipeline run {} complete, boundary advanced to {}", today, window.end);

        if self.config.optimize_after_run {
            report.maintenance = self.optimize().await;
        }
        Ok(report)
    }

    /// Compact and vacuum every table of every tier.
    pub async fn optimize(&self) -> Vec<MaintenanceReport> {
        self.optimizer
            .optimize_tiers(&self.config.tiers.all(), self.config.retention_days)
            .await
    }

    async fn extract_and_load(&self, window: &ExtractionWindow, report: &mut RunReport) -> Result<()> {
        let records = self
            .source
            .try_fetch(FEED_ENDPOINT, &window.query(), Some(FEED_FIELD))
            .await?;
        let events = build_close_approach_data(&records, window.start)?;
        if events.height() == 0 {
            report.status = RunStatus::Empty;
            return Ok(());
        }

        let ids = unique_ids(
            events
                .column(NEO_REFERENCE_ID)?
                .cast(&DataType::String)?
                .str()?
                .into_iter()
                .flatten(),
        );
        let lookups = self.source.fetch_each(LOOKUP_ENDPOINT, &Vec::new(), &ids).await;
        let asteroids = build_asteroid_data(&lookups, window.start)?;
        info!("Extracted {} close approaches of {} asteroids", events.height(), asteroids.height());

        let tier = &self.config.tiers.bronze;
        self.load_tier(tier, Stage::ExtractLoad, &events, &asteroids, report).await
    }

    async fn cleaning_transform(&self, catalog: &SchemaCatalog, window: &ExtractionWindow, report: &mut RunReport) -> Result<()> {
        let bronze = &self.config.tiers.bronze;
        let events = self.read_marked(&bronze.join(CLOSE_APPROACH_DATA), window).await?;
        let asteroids = self.read_marked(&bronze.join(ASTEROID_DATA), window).await?;

        let events = clean_table(&events, catalog.get(CLOSE_APPROACH_DATA)?)?;
        let asteroids = clean_table(&asteroids, catalog.get(ASTEROID_DATA)?)?;

        let tier = &self.config.tiers.silver;
        self.load_tier(tier, Stage::CleanTransform, &events, &asteroids, report).await
    }

    async fn analytic_transform(&self, catalog: &SchemaCatalog, window: &ExtractionWindow, report: &mut RunReport) -> Result<()> {
        let silver = &self.config.tiers.silver;
        let events = self.read_marked(&silver.join(CLOSE_APPROACH_DATA), window).await?;
        let asteroids = self.read_marked(&silver.join(ASTEROID_DATA), window).await?;

        let approaches = if events.height() == 0 || asteroids.height() == 0 {
            DataFrame::empty()
        } else {
            let asteroids = add_asteroid_metrics(&asteroids)?;
            let events = split_approach_datetime(&events)?;
            join_near_earth_approaches(&events, &asteroids, catalog.get(NEAR_EARTH_APPROACHES)?)?
        };

        let table = self.config.tiers.gold.join(NEAR_EARTH_APPROACHES);
        let predicate = MergePredicate::on([APPROACH_DATE, NEO_REFERENCE_ID])?;
        let outcome = self
            .engine
            .save_new_data(&approaches, &table, &predicate, &partition_columns())
            .await?;
        report.loads.push(TableLoad {
            stage: Stage::AnalyticTransform,
            table,
            outcome,
        });
        Ok(())
    }

    /// Upsert asteroids, append new events, then cluster events by recency.
    async fn load_tier(
        &self,
        tier: &Path,
        stage: Stage,
        events: &DataFrame,
        asteroids: &DataFrame,
        report: &mut RunReport,
    ) -> Result<()> {
        let asteroid_table = tier.join(ASTEROID_DATA);
        let outcome = self
            .engine
            .upsert_data(asteroids, &asteroid_table, &MergePredicate::on([NEO_REFERENCE_ID])?)
            .await?;
        report.loads.push(TableLoad {
            stage,
            table: asteroid_table,
            outcome,
        });

        let event_table = tier.join(CLOSE_APPROACH_DATA);
        let predicate = MergePredicate::on([APPROACH_DATETIME, NEO_REFERENCE_ID])?;
        let outcome = self
            .engine
            .save_new_data(events, &event_table, &predicate, &partition_columns())
            .await?;
        let changed = outcome.rows_written() > 0;
        report.loads.push(TableLoad {
            stage,
            table: event_table.clone(),
            outcome,
        });

        if changed {
            self.optimizer
                .cluster(&event_table, &[EXTRACTION_DATE.to_string()])
                .await;
        }
        Ok(())
    }

    /// Latest snapshot rows carrying the window's extraction marker.
    /// A table that was never written reads as empty.
    async fn read_marked(&self, table: &Path, window: &ExtractionWindow) -> Result<DataFrame> {
        let df = match self.store.read_snapshot(table).await {
            Ok(df) => df,
            Err(e) if e.is_not_found() => {
                warn!("Table {} not found, reading it as empty", table.display());
                return Ok(DataFrame::empty());
            }
            Err(e) => return Err(e),
        };
        if df.column(EXTRACTION_DATE).is_err() {
            return Ok(df);
        }

        let marker = window.marker();
        Ok(df
            .lazy()
            .filter(col(EXTRACTION_DATE).cast(DataType::String).eq(lit(marker)))
            .collect()?)
    }
}

fn partition_columns() -> Vec<String> {
    vec!["year".to_string(), "month".to_string(), "week".to_string()]
}

fn fail(stage: Stage, source: LakeError) -> LakeError {
    error!("Stage {} failed: {}", stage, source);
    LakeError::StageFailed {
        stage: stage.to_string(),
        source: Box::new(source),
    }
}
