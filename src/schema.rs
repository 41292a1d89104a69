//! Schema document: per logical table, an ordered list of column descriptors.
//!
//! ```json
//! {
//!   "asteroid_data": [
//!     {"column_name": "neo_reference_id", "column_type": "string", "column_position": 1}
//!   ]
//! }
//! ```
//!
//! Types use the dtype names of the source data (`float64`, `int16`,
//! `datetime64[ns]`, ...) and are validated when the document is loaded.

use crate::error::{LakeError, Result};
use lazy_static::lazy_static;
use polars::prelude::{DataType, TimeUnit};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

pub const CLOSE_APPROACH_DATA: &str = "close_approach_data";
pub const ASTEROID_DATA: &str = "asteroid_data";
pub const NEAR_EARTH_APPROACHES: &str = "near_earth_approaches";

lazy_static! {
    static ref BEFORE_FIRST_DOT: Regex = Regex::new(r"^[^.]+").unwrap();
    static ref AFTER_LAST_DOT: Regex = Regex::new(r"[^.]+$").unwrap();
}

/// Logical column type of a cleaned table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    String,
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Date,
    Datetime,
}

impl ColumnType {
    pub fn to_polars(self) -> DataType {
        match self {
            ColumnType::String => DataType::String,
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::Int8 => DataType::Int8,
            ColumnType::Int16 => DataType::Int16,
            ColumnType::Int32 => DataType::Int32,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float32 => DataType::Float32,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Date => DataType::Date,
            ColumnType::Datetime => DataType::Datetime(TimeUnit::Nanoseconds, None),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Boolean => "bool",
            ColumnType::Int8 => "int8",
            ColumnType::Int16 => "int16",
            ColumnType::Int32 => "int32",
            ColumnType::Int64 => "int64",
            ColumnType::Float32 => "float32",
            ColumnType::Float64 => "float64",
            ColumnType::Date => "date",
            ColumnType::Datetime => "datetime64[ns]",
        }
    }
}

impl TryFrom<String> for ColumnType {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, Self::Error> {
        let ty = match raw.trim().to_lowercase().as_str() {
            "string" | "str" | "object" | "utf8" => ColumnType::String,
            "bool" | "boolean" => ColumnType::Boolean,
            "int8" => ColumnType::Int8,
            "int16" => ColumnType::Int16,
            "int32" => ColumnType::Int32,
            "int64" | "int" => ColumnType::Int64,
            "float32" => ColumnType::Float32,
            "float64" | "float" | "double" => ColumnType::Float64,
            "date" => ColumnType::Date,
            "datetime" | "datetime64" | "datetime64[ns]" | "datetime64[us]" | "datetime64[ms]"
            | "timestamp" => ColumnType::Datetime,
            other => return Err(format!("unknown column type '{}'", other)),
        };
        Ok(ty)
    }
}

impl From<ColumnType> for String {
    fn from(ty: ColumnType) -> Self {
        ty.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub column_name: String,
    pub column_type: ColumnType,
    pub column_position: u32,
}

/// How source column names map to cleaned column names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingRule {
    /// `relative_velocity.kilometers_per_hour` -> `relative_velocity`
    BeforeFirstDot,
    /// `estimated_diameter.kilometers.estimated_diameter_min` -> `estimated_diameter_min`
    AfterLastDot,
    Keep,
}

impl NamingRule {
    pub fn for_table(table: &str) -> Self {
        match table {
            CLOSE_APPROACH_DATA => NamingRule::BeforeFirstDot,
            ASTEROID_DATA => NamingRule::AfterLastDot,
            _ => NamingRule::Keep,
        }
    }

    pub fn apply(self, column: &str) -> String {
        let pattern: &Regex = match self {
            NamingRule::BeforeFirstDot => &BEFORE_FIRST_DOT,
            NamingRule::AfterLastDot => &AFTER_LAST_DOT,
            NamingRule::Keep => return column.to_string(),
        };
        pattern
            .find(column)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| column.to_string())
    }
}

/// Validated schema of one logical table, columns sorted by position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, mut columns: Vec<ColumnDescriptor>) -> Result<Self> {
        let name = name.into();
        if columns.is_empty() {
            return Err(LakeError::Schema(format!("Table '{}' has no columns", name)));
        }

        let mut names = HashSet::new();
        let mut positions = HashSet::new();
        for column in &columns {
            if !names.insert(column.column_name.as_str()) {
                return Err(LakeError::Schema(format!(
                    "Duplicate column '{}' in table '{}'",
                    column.column_name, name
                )));
            }
            if !positions.insert(column.column_position) {
                return Err(LakeError::Schema(format!(
                    "Duplicate position {} in table '{}'",
                    column.column_position, name
                )));
            }
        }

        columns.sort_by_key(|c| c.column_position);
        Ok(Self { name, columns })
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.column_name.clone()).collect()
    }

    pub fn naming_rule(&self) -> NamingRule {
        NamingRule::for_table(&self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaCatalog {
    /// Load and validate the schema document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            LakeError::Config(format!("Schema document {} not readable: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let parsed: BTreeMap<String, Vec<ColumnDescriptor>> = serde_json::from_str(raw)
            .map_err(|e| LakeError::Schema(format!("Invalid schema document: {}", e)))?;

        let mut tables = BTreeMap::new();
        for (name, columns) in parsed {
            let schema = TableSchema::new(name.clone(), columns)?;
            tables.insert(name, schema);
        }
        Ok(Self { tables })
    }

    /// Schema for `table`; unknown names are rejected.
    pub fn get(&self, table: &str) -> Result<&TableSchema> {
        self.tables
            .get(table)
            .ok_or_else(|| LakeError::Schema(format!("No schema defined for table '{}'", table)))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "asteroid_data": [
            {"column_name": "name", "column_type": "string", "column_position": 2},
            {"column_name": "neo_reference_id", "column_type": "string", "column_position": 1},
            {"column_name": "estimated_diameter.kilometers.estimated_diameter_min", "column_type": "float64", "column_position": 3}
        ],
        "close_approach_data": [
            {"column_name": "approach_datetime", "column_type": "datetime64[ns]", "column_position": 1},
            {"column_name": "week", "column_type": "int8", "column_position": 2}
        ]
    }"#;

    #[test]
    fn test_load_sorts_by_position() {
        let catalog = SchemaCatalog::from_json_str(DOC).unwrap();
        let asteroid = catalog.get(ASTEROID_DATA).unwrap();
        assert_eq!(
            asteroid.column_names(),
            vec![
                "neo_reference_id".to_string(),
                "name".to_string(),
                "estimated_diameter.kilometers.estimated_diameter_min".to_string(),
            ]
        );
        let approaches = catalog.get(CLOSE_APPROACH_DATA).unwrap();
        assert_eq!(approaches.columns[0].column_type, ColumnType::Datetime);
        assert_eq!(approaches.columns[1].column_type, ColumnType::Int8);
    }

    #[test]
    fn test_unknown_table_is_rejected() {
        let catalog = SchemaCatalog::from_json_str(DOC).unwrap();
        assert!(matches!(catalog.get("comets"), Err(LakeError::Schema(_))));
    }

    #[test]
    fn test_unknown_type_and_duplicate_positions_fail_validation() {
        let bad_type = r#"{"t": [{"column_name": "a", "column_type": "decimal128", "column_position": 1}]}"#;
        assert!(SchemaCatalog::from_json_str(bad_type).is_err());

        let dup_position = r#"{"t": [
            {"column_name": "a", "column_type": "int64", "column_position": 1},
            {"column_name": "b", "column_type": "int64", "column_position": 1}
        ]}"#;
        assert!(matches!(SchemaCatalog::from_json_str(dup_position), Err(LakeError::Schema(_))));
    }

    #[test]
    fn test_naming_rules() {
        assert_eq!(
            NamingRule::for_table(CLOSE_APPROACH_DATA).apply("relative_velocity.kilometers_per_hour"),
            "relative_velocity"
        );
        assert_eq!(
            NamingRule::for_table(ASTEROID_DATA).apply("estimated_diameter.kilometers.estimated_diameter_max"),
            "estimated_diameter_max"
        );
        assert_eq!(NamingRule::for_table(CLOSE_APPROACH_DATA).apply("neo_reference_id"), "neo_reference_id");
        assert_eq!(NamingRule::for_table(NEAR_EARTH_APPROACHES).apply("a.b"), "a.b");
    }
}
