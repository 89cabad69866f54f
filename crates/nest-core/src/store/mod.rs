//! Record Store - CRUD surface over named tables
//!
//! Features:
//! - Object-safe async trait, injected wherever rows are read or written
//! - Equality filters (select / fetch_one)
//! - Versioned rows: every update bumps `version`, and an update can be
//!   made conditional on the version the caller last read
//!
//! Backends:
//! - `RestStore`   - hosted Postgres behind a PostgREST-style API
//! - `SledStore`   - local embedded snapshot
//! - `MemoryStore` - in-process, for tests and experiments

pub mod memory;
pub mod rest;
pub mod sled_store;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use thiserror::Error;

pub use memory::MemoryStore;
pub use rest::RestStore;
pub use sled_store::SledStore;

/// A single table row as a JSON object
pub type Row = Map<String, Value>;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row {id} not found in {table}")]
    NotFound { table: String, id: String },

    #[error("row {id} already exists in {table}")]
    Duplicate { table: String, id: String },

    #[error("row {id} in {table} changed since it was read (expected version {expected})")]
    Conflict {
        table: String,
        id: String,
        expected: u64,
    },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{table}: server returned {status}: {body}")]
    Status {
        table: String,
        status: u16,
        body: String,
    },

    #[error("invalid row data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("local store error: {0}")]
    Backend(#[from] sled::Error),

    #[error("invalid store configuration: {0}")]
    Config(String),
}

/// Equality filter (all conditions must match)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `column = value` condition
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Check a row against every condition.
    ///
    /// Comparison is on the text form, so `"7"` matches `7`.
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|(column, expected)| {
            row.get(column)
                .map(|actual| value_text(actual) == value_text(expected))
                .unwrap_or(false)
        })
    }
}

/// Text form of a JSON value (strings unquoted)
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Row id as text, if present
pub fn row_id(row: &Row) -> Option<String> {
    match row.get("id") {
        None | Some(Value::Null) => None,
        Some(v) => Some(value_text(v)),
    }
}

/// Row version (missing or null = 0)
pub fn row_version(row: &Row) -> u64 {
    row.get("version").and_then(Value::as_u64).unwrap_or(0)
}

/// Order two ids: numerically when both are integers, as text otherwise
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Sort rows the way `order=id.asc` would on the server
pub(crate) fn sort_by_id(rows: &mut [Row]) {
    rows.sort_by(|a, b| {
        compare_ids(
            &row_id(a).unwrap_or_default(),
            &row_id(b).unwrap_or_default(),
        )
    });
}

/// Apply a patch on top of a row and bump its version.
/// The `id` and `version` columns of the patch are ignored.
pub(crate) fn merge_patch(current: &Row, patch: Row) -> Row {
    let next_version = row_version(current) + 1;
    let mut merged = current.clone();

    for (column, value) in patch {
        if column == "id" || column == "version" {
            continue;
        }
        merged.insert(column, value);
    }

    merged.insert("version".into(), Value::from(next_version));
    merged
}

/// Generic record store client
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Backend name (for logs)
    fn name(&self) -> &'static str;

    /// All rows of `table` matching `filter`, ordered by id
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError>;

    /// First row matching `filter`, in id order
    async fn fetch_one(&self, table: &str, filter: &Filter) -> Result<Option<Row>, StoreError>;

    /// Insert a row, returning it as stored
    async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError>;

    /// Merge `patch` into row `id` and bump its version.
    ///
    /// With `expected_version`, the write only lands if the stored version
    /// still equals it; otherwise `StoreError::Conflict`.
    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: Row,
        expected_version: Option<u64>,
    ) -> Result<Row, StoreError>;

    /// Delete row `id`; false if it did not exist
    async fn delete(&self, table: &str, id: &str) -> Result<bool, StoreError>;
}
