//! Pipeline configuration, built once by the caller and passed by reference.

use crate::error::{LakeError, Result};
use crate::merge::DuplicatePolicy;
use std::path::PathBuf;

pub const DEFAULT_BASE_URL: &str = "https://api.nasa.gov/neo/rest/v1";
pub const DEFAULT_RETENTION_DAYS: u32 = 7;
pub const DEFAULT_WINDOW_DAYS: u32 = 7;

/// NeoWs endpoint settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: String,
    /// Cap on concurrent per-asteroid lookups; unbounded when `None`.
    pub max_concurrency: Option<usize>,
}

/// Root directories of the three storage tiers.
#[derive(Debug, Clone)]
pub struct TierPaths {
    pub bronze: PathBuf,
    pub silver: PathBuf,
    pub gold: PathBuf,
}

impl TierPaths {
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            bronze: root.join("bronze"),
            silver: root.join("silver"),
            gold: root.join("gold"),
        }
    }

    pub fn all(&self) -> Vec<PathBuf> {
        vec![self.bronze.clone(), self.silver.clone(), self.gold.clone()]
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api: ApiConfig,
    pub tiers: TierPaths,
    pub schema_path: PathBuf,
    pub state_path: PathBuf,
    pub retention_days: u32,
    pub window_days: u32,
    pub duplicate_policy: DuplicatePolicy,
    /// Run compaction and vacuum over every tier after a successful run.
    pub optimize_after_run: bool,
}

impl PipelineConfig {
    pub fn new(api: ApiConfig, tiers: TierPaths) -> Self {
        Self {
            api,
            tiers,
            schema_path: PathBuf::from("metadata/schemas.json"),
            state_path: PathBuf::from("metadata/stateful.json"),
            retention_days: DEFAULT_RETENTION_DAYS,
            window_days: DEFAULT_WINDOW_DAYS,
            duplicate_policy: DuplicatePolicy::default(),
            optimize_after_run: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.token.trim().is_empty() {
            return Err(LakeError::Config("Add a valid API token (NEO_API_TOKEN)".to_string()));
        }
        if self.api.base_url.trim().is_empty() {
            return Err(LakeError::Config("API base URL is empty".to_string()));
        }
        if self.window_days == 0 {
            return Err(LakeError::Config("Extraction window must span at least one day".to_string()));
        }
        Ok(())
    }
}
