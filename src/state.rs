//! Extraction state tracker.
//!
//! Persists the last successfully processed extraction boundary per logical
//! table in a small JSON document shaped like:
//!
//! ```json
//! { "close_approach_data": { "last_value": "2024-01-08" } }
//! ```
//!
//! The document is always rewritten as a whole through a temp file and an
//! atomic rename, so a crash mid-write leaves the previous document intact.

use crate::error::{LakeError, Result};
use chrono::{Local, NaiveDate};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Date format used for boundaries in the state document.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Key holding the boundary inside each table entry.
pub const LAST_VALUE_KEY: &str = "last_value";

/// In-memory copy of the state document: table -> key -> value.
pub type StateDocument = BTreeMap<String, BTreeMap<String, Value>>;

pub struct StateTracker {
    path: PathBuf,
}

impl StateTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. A missing file or malformed JSON is empty state.
    pub fn load(&self) -> StateDocument {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("State document {} not readable ({}), starting empty", self.path.display(), e);
                return StateDocument::new();
            }
        };

        match serde_json::from_str::<StateDocument>(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Could not parse state document {}: {}", self.path.display(), e);
                StateDocument::new()
            }
        }
    }

    /// Boundary for `table`/`key`, or today's date when unset.
    pub fn get_boundary(&self, table: &str, key: &str) -> Result<NaiveDate> {
        self.get_boundary_at(table, key, Local::now().date_naive())
    }

    /// Same as [`get_boundary`](Self::get_boundary) with an explicit "today".
    pub fn get_boundary_at(&self, table: &str, key: &str, today: NaiveDate) -> Result<NaiveDate> {
        let doc = self.load();

        let value = match doc.get(table).and_then(|entry| entry.get(key)) {
            Some(value) => value,
            None => {
                warn!("Could not find state key {}.{}, using {}", table, key, today);
                return Ok(today);
            }
        };

        match value {
            Value::Null => Ok(today),
            Value::String(s) if s.trim().is_empty() => Ok(today),
            Value::String(s) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).map_err(|e| {
                LakeError::State(format!("Invalid boundary '{}' for {}.{}: {}", s, table, key, e))
            }),
            other => Err(LakeError::State(format!(
                "Boundary for {}.{} must be a date string, found {}",
                table, key, other
            ))),
        }
    }

    /// Overwrite the boundary and persist the whole document atomically.
    ///
    /// Boundaries never move backwards.
    pub fn set_boundary(&self, table: &str, key: &str, value: NaiveDate) -> Result<()> {
        let mut doc = self.load();

        if let Some(Value::String(current)) = doc.get(table).and_then(|entry| entry.get(key)) {
            if let Ok(current) = NaiveDate::parse_from_str(current.trim(), DATE_FORMAT) {
                if value < current {
                    return Err(LakeError::State(format!(
                        "Refusing to move {}.{} back from {} to {}",
                        table, key, current, value
                    )));
                }
            }
        }

        doc.entry(table.to_string())
            .or_default()
            .insert(key.to_string(), Value::String(value.format(DATE_FORMAT).to_string()));

        self.write_document(&doc)?;
        debug!("State {}.{} advanced to {}", table, key, value);
        Ok(())
    }

    fn write_document(&self, doc: &StateDocument) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, doc)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| LakeError::Io(e.error))?;
        Ok(())
    }
}
