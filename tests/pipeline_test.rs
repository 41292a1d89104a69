use async_trait::async_trait;
use neo_lakehouse::config::{ApiConfig, PipelineConfig, TierPaths};
use neo_lakehouse::extract::{records_from_payload, QueryParams, RecordSource};
use neo_lakehouse::table::TableStore;
use neo_lakehouse::{DeltaTableStore, LakeError, Orchestrator, RunStatus, Stage};
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// In-process stand-in for the NeoWs API.
struct FakeNeoWs {
    /// `None` answers the feed request with a transport error.
    feed: Option<Value>,
    lookups: HashMap<String, Value>,
    feed_queries: Mutex<Vec<QueryParams>>,
}

#[async_trait]
impl RecordSource for FakeNeoWs {
    async fn try_fetch(&self, endpoint: &str, params: &QueryParams, field: Option<&str>) -> neo_lakehouse::Result<Vec<Value>> {
        self.feed_queries.lock().unwrap().push(params.clone());
        match &self.feed {
            Some(feed) => Ok(records_from_payload(feed.clone(), field)),
            None => Err(LakeError::Extraction(format!("Request to {} failed: connection refused", endpoint))),
        }
    }

    async fn fetch_each(&self, _endpoint: &str, _params: &QueryParams, ids: &[String]) -> Vec<Value> {
        ids.iter().filter_map(|id| self.lookups.get(id).cloned()).collect()
    }
}

fn approach(epoch: i64, date: &str) -> Value {
    json!({
        "close_approach_date": date,
        "epoch_date_close_approach": epoch,
        "relative_velocity": {"kilometers_per_second": "12.5", "kilometers_per_hour": "45000.0"},
        "miss_distance": {"kilometers": "4000000.5", "astronomical": "0.0267"},
        "orbiting_body": "Earth"
    })
}

fn feed_neo(id: &str, epoch: i64, date: &str) -> Value {
    json!({"neo_reference_id": id, "name": id, "close_approach_data": [approach(epoch, date)]})
}

fn lookup(id: &str, magnitude: Option<f64>) -> Value {
    json!({
        "neo_reference_id": id,
        "name": format!("({})", id),
        "nasa_jpl_url": format!("https://ssd.jpl.nasa.gov/tools/sbdb_lookup.html#/?sstr={}", id),
        "is_potentially_hazardous_asteroid": false,
        "absolute_magnitude_h": magnitude,
        "estimated_diameter": {
            "kilometers": {"estimated_diameter_min": 0.1, "estimated_diameter_max": 0.3}
        },
        "close_approach_data": [
            {"orbiting_body": "Earth"},
            {"orbiting_body": "Venus"}
        ]
    })
}

/// A and B have lookups, C does not; A approaches on two dates.
fn fake_source() -> FakeNeoWs {
    let feed = json!({
        "element_count": 4,
        "near_earth_objects": {
            // 2024-01-10 12:00 and 13:00 UTC
            "2024-01-10": [feed_neo("A", 1_704_888_000_000, "2024-01-10"), feed_neo("B", 1_704_891_600_000, "2024-01-10")],
            // 2024-01-11 13:00 UTC
            "2024-01-11": [feed_neo("A", 1_704_978_000_000, "2024-01-11"), feed_neo("C", 1_704_978_000_000, "2024-01-11")]
        }
    });
    let lookups = [("A", Some(20.0)), ("B", Some(22.5))]
        .iter()
        .map(|(id, h)| (id.to_string(), lookup(id, *h)))
        .collect();

    FakeNeoWs {
        feed: Some(feed),
        lookups,
        feed_queries: Mutex::new(Vec::new()),
    }
}

fn empty_source() -> FakeNeoWs {
    FakeNeoWs {
        feed: Some(json!({"element_count": 0, "near_earth_objects": {}})),
        lookups: HashMap::new(),
        feed_queries: Mutex::new(Vec::new()),
    }
}

fn unreachable_source() -> FakeNeoWs {
    FakeNeoWs {
        feed: None,
        ..empty_source()
    }
}

struct Lake {
    _dir: TempDir,
    root: PathBuf,
    config: PipelineConfig,
}

impl Lake {
    fn new(last_value: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();

        let metadata = root.join("metadata");
        std::fs::create_dir_all(&metadata).unwrap();
        std::fs::write(metadata.join("schemas.json"), include_str!("../metadata/schemas.json")).unwrap();
        write_state(&metadata.join("stateful.json"), last_value);

        let mut config = PipelineConfig::new(
            ApiConfig {
                base_url: "http://localhost".to_string(),
                token: "test".to_string(),
                max_concurrency: None,
            },
            TierPaths::under(root.join("lake")),
        );
        config.schema_path = metadata.join("schemas.json");
        config.state_path = metadata.join("stateful.json");

        Self { _dir: dir, root, config }
    }

    fn orchestrator(&self, source: FakeNeoWs) -> Orchestrator {
        Orchestrator::new(self.config.clone(), Arc::new(source), Arc::new(DeltaTableStore::new()))
    }

    fn last_value(&self) -> String {
        let raw = std::fs::read_to_string(&self.config.state_path).unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        doc["close_approach_data"]["last_value"].as_str().unwrap().to_string()
    }

    async fn rows(&self, tier: &Path, table: &str) -> usize {
        DeltaTableStore::new()
            .read_snapshot(&tier.join(table))
            .await
            .unwrap()
            .height()
    }

    /// Row counts of bronze events, bronze asteroids, silver events,
    /// silver asteroids and gold, in that order.
    async fn counts(&self) -> [usize; 5] {
        let tiers = &self.config.tiers;
        [
            self.rows(&tiers.bronze, "close_approach_data").await,
            self.rows(&tiers.bronze, "asteroid_data").await,
            self.rows(&tiers.silver, "close_approach_data").await,
            self.rows(&tiers.silver, "asteroid_data").await,
            self.rows(&tiers.gold, "near_earth_approaches").await,
        ]
    }
}

fn write_state(path: &Path, last_value: &str) {
    let doc = json!({"close_approach_data": {"last_value": last_value}});
    std::fs::write(path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[tokio::test]
async fn test_first_run_starts_today_and_persists_window_end() {
    let lake = Lake::new("");
    let source = fake_source();
    let orchestrator = lake.orchestrator(source);

    let report = orchestrator.run_at(day(2024, 1, 10)).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stage, Stage::Done);
    assert_eq!(report.window.start, day(2024, 1, 10));
    assert_eq!(report.boundary, Some(day(2024, 1, 17)));
    assert_eq!(lake.last_value(), "2024-01-17");

    let tiers = &lake.config.tiers;
    assert_eq!(lake.rows(&tiers.bronze, "close_approach_data").await, 4);
    assert_eq!(lake.rows(&tiers.bronze, "asteroid_data").await, 2);
    assert_eq!(lake.rows(&tiers.silver, "close_approach_data").await, 4);
    assert_eq!(lake.rows(&tiers.silver, "asteroid_data").await, 2);
    // C has no asteroid lookup and drops out of the inner join
    assert_eq!(lake.rows(&tiers.gold, "near_earth_approaches").await, 3);

    assert!(tiers.bronze.join("close_approach_data").join("year=2024").join("month=1").join("week=2").is_dir());
    assert!(tiers.gold.join("near_earth_approaches").join("year=2024").is_dir());
}

#[tokio::test]
async fn test_feed_is_queried_with_window_bounds() {
    let lake = Lake::new("2024-03-01");
    let source = Arc::new(fake_source());
    let orchestrator = Orchestrator::new(lake.config.clone(), source.clone(), Arc::new(DeltaTableStore::new()));

    orchestrator.run_at(day(2024, 3, 20)).await.unwrap();

    let queries = source.feed_queries.lock().unwrap();
    assert_eq!(
        queries[0],
        vec![
            ("start_date".to_string(), "2024-03-01".to_string()),
            ("end_date".to_string(), "2024-03-08".to_string())
        ]
    );
}

#[tokio::test]
async fn test_successive_runs_advance_boundary_by_window() {
    let lake = Lake::new("2024-01-01");
    let orchestrator = lake.orchestrator(fake_source());

    orchestrator.run_at(day(2024, 1, 10)).await.unwrap();
    assert_eq!(lake.last_value(), "2024-01-08");

    let second = orchestrator.run_at(day(2024, 1, 11)).await.unwrap();
    assert_eq!(second.window.start, day(2024, 1, 8));
    assert_eq!(lake.last_value(), "2024-01-15");

    // the same events were not landed twice
    assert_eq!(lake.rows(&lake.config.tiers.bronze, "close_approach_data").await, 4);
    assert_eq!(lake.rows(&lake.config.tiers.gold, "near_earth_approaches").await, 3);
}

#[tokio::test]
async fn test_rerunning_a_window_is_idempotent() {
    let lake = Lake::new("2024-01-01");
    let orchestrator = lake.orchestrator(fake_source());

    orchestrator.run_at(day(2024, 1, 10)).await.unwrap();
    let first = lake.counts().await;

    write_state(&lake.config.state_path, "2024-01-01");
    let report = orchestrator.run_at(day(2024, 1, 10)).await.unwrap();

    assert_eq!(lake.counts().await, first);
    assert_eq!(report.window.start, day(2024, 1, 1));
    assert!(report.loads.iter().all(|load| match &load.outcome {
        neo_lakehouse::LoadOutcome::Merged(m) => m.num_target_rows_inserted == 0,
        _ => true,
    }));
}

#[tokio::test]
async fn test_failed_load_keeps_boundary() {
    let lake = Lake::new("2024-01-01");
    std::fs::create_dir_all(lake.root.join("lake")).unwrap();
    std::fs::write(&lake.config.tiers.gold, "not a directory").unwrap();

    let err = lake.orchestrator(fake_source()).run_at(day(2024, 1, 10)).await.unwrap_err();

    match err {
        LakeError::StageFailed { stage, .. } => assert_eq!(stage, "ANALYTIC_TRANSFORM"),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(lake.last_value(), "2024-01-01");
    // tiers committed before the failure stay intact
    assert_eq!(lake.rows(&lake.config.tiers.silver, "close_approach_data").await, 4);
}

#[tokio::test]
async fn test_retry_on_a_later_day_finishes_the_failed_window() {
    let lake = Lake::new("2024-01-01");
    std::fs::create_dir_all(lake.root.join("lake")).unwrap();
    std::fs::write(&lake.config.tiers.gold, "not a directory").unwrap();
    let orchestrator = lake.orchestrator(fake_source());

    let err = orchestrator.run_at(day(2024, 1, 10)).await.unwrap_err();
    assert!(matches!(err, LakeError::StageFailed { ref stage, .. } if stage == "ANALYTIC_TRANSFORM"));

    std::fs::remove_file(&lake.config.tiers.gold).unwrap();
    let report = orchestrator.run_at(day(2024, 1, 11)).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.window.start, day(2024, 1, 1));
    assert_eq!(lake.last_value(), "2024-01-08");
    // bronze and silver were already landed, gold picks the window's rows up again
    assert_eq!(lake.counts().await, [4, 2, 4, 2, 3]);
}

#[tokio::test]
async fn test_lookups_without_magnitude_update_typed_tables() {
    let lake = Lake::new("2024-01-01");
    lake.orchestrator(fake_source()).run_at(day(2024, 1, 10)).await.unwrap();

    let mut source = fake_source();
    source.lookups = [("A", None), ("B", None)]
        .iter()
        .map(|(id, h)| (id.to_string(), lookup(id, *h)))
        .collect();
    let report = lake.orchestrator(source).run_at(day(2024, 1, 10)).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(lake.last_value(), "2024-01-15");

    let asteroids = DeltaTableStore::new()
        .read_snapshot(&lake.config.tiers.bronze.join("asteroid_data"))
        .await
        .unwrap();
    let magnitude = asteroids.column("absolute_magnitude_h").unwrap();
    assert_eq!(magnitude.dtype(), &polars::prelude::DataType::Float64);
    assert_eq!(magnitude.null_count(), 2);
}

#[tokio::test]
async fn test_empty_feed_advances_boundary_without_writing() {
    let lake = Lake::new("2024-01-01");
    let report = lake.orchestrator(empty_source()).run_at(day(2024, 1, 10)).await.unwrap();

    assert_eq!(report.status, RunStatus::Empty);
    assert_eq!(report.stage, Stage::Done);
    assert_eq!(report.boundary, Some(day(2024, 1, 8)));
    assert_eq!(lake.last_value(), "2024-01-08");
    assert!(!DeltaTableStore::new().exists(&lake.config.tiers.bronze.join("close_approach_data")));
}

#[tokio::test]
async fn test_unreachable_feed_fails_without_advancing() {
    let lake = Lake::new("2024-01-01");
    let err = lake
        .orchestrator(unreachable_source())
        .run_at(day(2024, 1, 10))
        .await
        .unwrap_err();

    match err {
        LakeError::StageFailed { stage, .. } => assert_eq!(stage, "EXTRACT_LOAD"),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(lake.last_value(), "2024-01-01");
    assert!(!lake.config.tiers.bronze.exists());
}

#[tokio::test]
async fn test_missing_schema_document_fails_before_writing() {
    let mut lake = Lake::new("2024-01-01");
    lake.config.schema_path = lake.root.join("metadata").join("missing.json");

    let err = lake.orchestrator(fake_source()).run_at(day(2024, 1, 10)).await.unwrap_err();

    assert!(matches!(err, LakeError::StageFailed { .. }));
    assert!(!lake.config.tiers.bronze.exists());
    assert_eq!(lake.last_value(), "2024-01-01");
}

#[tokio::test]
async fn test_optimize_after_run_with_zero_retention() {
    let mut lake = Lake::new("2024-01-01");
    lake.config.optimize_after_run = true;
    lake.config.retention_days = 0;

    let report = lake.orchestrator(fake_source()).run_at(day(2024, 1, 10)).await.unwrap();

    assert_eq!(report.maintenance.len(), 5);
    assert!(report.maintenance.iter().all(|m| m.is_clean()));
    // clustering superseded the first event files, zero retention removed them
    assert!(report.maintenance.iter().any(|m| m.files_vacuumed > 0));
    assert_eq!(lake.rows(&lake.config.tiers.gold, "near_earth_approaches").await, 3);
}
