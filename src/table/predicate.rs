//! Merge predicate: an equality conjunction over natural-key columns.

use crate::error::{LakeError, Result};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

lazy_static! {
    static ref AND_SPLIT: Regex = Regex::new(r"(?i)\s+and\s+").unwrap();
    static ref EQUALITY: Regex = Regex::new(
        r"^\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\s*=\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\s*$"
    )
    .unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePredicate {
    keys: Vec<String>,
}

impl MergePredicate {
    /// Match target and source rows on equality of every key column.
    pub fn on<I, S>(keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Err(LakeError::Schema("Merge predicate needs at least one key".to_string()));
        }
        let mut seen = HashSet::new();
        for key in &keys {
            if !seen.insert(key.as_str()) {
                return Err(LakeError::Schema(format!("Key '{}' repeated in merge predicate", key)));
            }
        }
        Ok(Self { keys })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl fmt::Display for MergePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clauses = self
            .keys
            .iter()
            .map(|k| format!("target.{} = source.{}", k, k))
            .join(" AND ");
        write!(f, "{}", clauses)
    }
}

fn side(alias: &str) -> Option<bool> {
    match alias.to_lowercase().as_str() {
        "target" | "tgt" => Some(true),
        "source" | "src" => Some(false),
        _ => None,
    }
}

impl FromStr for MergePredicate {
    type Err = LakeError;

    /// Parses `tgt.a = src.a AND target.b = source.b`.
    fn from_str(raw: &str) -> Result<Self> {
        let mut keys = Vec::new();
        for clause in AND_SPLIT.split(raw.trim()) {
            let caps = EQUALITY.captures(clause).ok_or_else(|| {
                LakeError::Schema(format!("Unsupported merge predicate clause '{}'", clause.trim()))
            })?;

            let (left_alias, left_col, right_alias, right_col) = (&caps[1], &caps[2], &caps[3], &caps[4]);
            let (left_side, right_side) = match (side(left_alias), side(right_alias)) {
                (Some(l), Some(r)) => (l, r),
                _ => {
                    return Err(LakeError::Schema(format!(
                        "Unknown alias in '{}', expected target/tgt and source/src",
                        clause.trim()
                    )))
                }
            };
            if left_side == right_side {
                return Err(LakeError::Schema(format!(
                    "Clause '{}' must compare target with source",
                    clause.trim()
                )));
            }
            if left_col != right_col {
                return Err(LakeError::Schema(format!(
                    "Clause '{}' must compare the same column on both sides",
                    clause.trim()
                )));
            }
            keys.push(left_col.to_string());
        }
        MergePredicate::on(keys)
    }
}
