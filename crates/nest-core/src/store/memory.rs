//! In-memory record store

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::{
    compare_ids, merge_patch, row_id, row_version, sort_by_id, Filter, RecordStore, Row,
    StoreError,
};

/// Tables held in RAM: table -> id -> row
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, BTreeMap<String, Row>>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert many rows at once
    pub async fn seed(&self, table: &str, rows: Vec<Row>) -> Result<(), StoreError> {
        for row in rows {
            self.insert(table, row).await?;
        }
        Ok(())
    }

    /// Number of rows in a table
    pub async fn len(&self, table: &str) -> usize {
        self.tables
            .read()
            .await
            .get(table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    /// Read a row by id
    pub async fn get(&self, table: &str, id: &str) -> Option<Row> {
        self.tables
            .read()
            .await
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Row> = tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| filter.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        sort_by_id(&mut rows);
        Ok(rows)
    }

    async fn fetch_one(&self, table: &str, filter: &Filter) -> Result<Option<Row>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .and_then(|rows| {
                rows.iter()
                    .filter(|(_, row)| filter.matches(row))
                    .min_by(|(a, _), (b, _)| compare_ids(a, b))
                    .map(|(_, row)| row)
            })
            .cloned())
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, StoreError> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();

        let id = match row_id(&row) {
            Some(id) => id,
            None => {
                // Skip ids already taken by caller-supplied rows
                let id = loop {
                    let candidate = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
                    if !rows.contains_key(&candidate) {
                        break candidate;
                    }
                };
                row.insert("id".into(), Value::String(id.clone()));
                id
            }
        };
        row.insert("version".into(), Value::from(row_version(&row)));

        if rows.contains_key(&id) {
            return Err(StoreError::Duplicate {
                table: table.to_string(),
                id,
            });
        }
        rows.insert(id, row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: Row,
        expected_version: Option<u64>,
    ) -> Result<Row, StoreError> {
        let mut tables = self.tables.write().await;
        let current = tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            })?;

        if let Some(expected) = expected_version {
            if row_version(current) != expected {
                return Err(StoreError::Conflict {
                    table: table.to_string(),
                    id: id.to_string(),
                    expected,
                });
            }
        }

        let merged = merge_patch(current, patch);
        *current = merged.clone();
        Ok(merged)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .get_mut(table)
            .map(|rows| rows.remove(id).is_some())
            .unwrap_or(false))
    }
}
