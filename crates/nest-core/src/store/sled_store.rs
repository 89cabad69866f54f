//! Local Record Store - sled-backed table snapshot
//!
//! One sled tree per table, keyed by row id, values are JSON rows.
//! Conditional updates use sled compare-and-swap, so a row that changed
//! between read and write is never overwritten.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

use super::{merge_patch, row_id, row_version, sort_by_id, Filter, RecordStore, Row, StoreError};

/// Persistent local store
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Config(format!("{}: {}", parent.display(), e)))?;
        }

        let db = sled::open(path.as_ref())?;
        debug!("Opened local store at {:?}", path.as_ref());
        Ok(Self { db })
    }

    /// Table names present in the store
    pub fn tables(&self) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .map(|name| String::from_utf8_lossy(&name).to_string())
            .filter(|name| name != "__sled__default")
            .collect()
    }

    /// Total row count and bytes on disk
    pub fn stats(&self) -> Result<(usize, u64), StoreError> {
        let rows = self
            .tables()
            .iter()
            .map(|t| self.db.open_tree(t).map(|tree| tree.len()))
            .sum::<Result<usize, sled::Error>>()?;
        Ok((rows, self.db.size_on_disk()?))
    }

    fn decode(bytes: &[u8]) -> Result<Row, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Next generated id not already used in `tree`.
    /// Imported snapshots carry their own serial ids, so these can overlap.
    fn free_id(&self, tree: &sled::Tree) -> Result<String, StoreError> {
        loop {
            let id = self.db.generate_id()?.to_string();
            if !tree.contains_key(id.as_bytes())? {
                return Ok(id);
            }
        }
    }
}

#[async_trait]
impl RecordStore for SledStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError> {
        let tree = self.db.open_tree(table)?;
        let mut rows = Vec::new();

        for item in tree.iter() {
            let (_, value) = item?;
            let row = Self::decode(&value)?;
            if filter.matches(&row) {
                rows.push(row);
            }
        }

        // Tree keys are bytes, so "10" would come before "9"
        sort_by_id(&mut rows);
        Ok(rows)
    }

    async fn fetch_one(&self, table: &str, filter: &Filter) -> Result<Option<Row>, StoreError> {
        Ok(self.select(table, filter).await?.into_iter().next())
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, StoreError> {
        let tree = self.db.open_tree(table)?;
        let supplied = row_id(&row);

        loop {
            let id = match &supplied {
                Some(id) => id.clone(),
                None => {
                    let id = self.free_id(&tree)?;
                    row.insert("id".into(), Value::String(id.clone()));
                    id
                }
            };
            row.insert("version".into(), Value::from(row_version(&row)));

            let data = serde_json::to_vec(&row)?;
            if tree
                .compare_and_swap(id.as_bytes(), None::<&[u8]>, Some(data))?
                .is_ok()
            {
                tree.flush()?;
                return Ok(row);
            }

            // A generated id taken between the check and the swap: pick another
            if supplied.is_some() {
                return Err(StoreError::Duplicate {
                    table: table.to_string(),
                    id,
                });
            }
        }
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: Row,
        expected_version: Option<u64>,
    ) -> Result<Row, StoreError> {
        let tree = self.db.open_tree(table)?;
        let not_found = || StoreError::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        };

        let old_bytes = tree.get(id.as_bytes())?.ok_or_else(not_found)?;
        let current = Self::decode(&old_bytes)?;
        let seen_version = row_version(&current);

        if let Some(expected) = expected_version {
            if seen_version != expected {
                return Err(StoreError::Conflict {
                    table: table.to_string(),
                    id: id.to_string(),
                    expected,
                });
            }
        }

        let merged = merge_patch(&current, patch);
        let new_bytes = serde_json::to_vec(&merged)?;

        // Lost a race with another writer after the read above
        if tree
            .compare_and_swap(id.as_bytes(), Some(old_bytes), Some(new_bytes))?
            .is_err()
        {
            return Err(StoreError::Conflict {
                table: table.to_string(),
                id: id.to_string(),
                expected: expected_version.unwrap_or(seen_version),
            });
        }
        tree.flush()?;

        Ok(merged)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<bool, StoreError> {
        let tree = self.db.open_tree(table)?;
        let removed = tree.remove(id.as_bytes())?.is_some();
        tree.flush()?;
        Ok(removed)
    }
}
