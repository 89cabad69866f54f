//! Profile Metadata Reconciler
//!
//! Copies missing identity fields (first name, last name, phone) from the
//! nurse/client profile tables into `user_metadata`.
//!
//! Features:
//! - Linear scan per profile table, best-effort per record
//! - Per-record failures are collected as strings, the scan keeps going
//! - Versioned updates: a row edited between fetch and write is reported
//!   as a conflict instead of being overwritten
//! - Nurse and client scans run concurrently in `reconcile_all`
//! - Dry-run / audit mode (no writes)

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::records::{MetadataRecord, ProfileKind, ProfileRecord, Repair, METADATA_TABLE};
use crate::store::{row_id, Filter, RecordStore, Row, StoreError};

/// Failure for a single record
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("{kind} user {user_id}: fetch failed: {source}")]
    Fetch {
        kind: ProfileKind,
        user_id: String,
        source: StoreError,
    },

    #[error("{kind} profile row {row_id}: could not decode: {source}")]
    Decode {
        kind: ProfileKind,
        row_id: String,
        source: StoreError,
    },

    #[error("{kind} user {user_id}: no metadata record")]
    MissingMetadata { kind: ProfileKind, user_id: String },

    #[error("{kind} user {user_id}: no {kind} profile")]
    MissingProfile { kind: ProfileKind, user_id: String },

    #[error("{kind} user {user_id}: update of metadata {metadata_id} failed: {source}")]
    Update {
        kind: ProfileKind,
        user_id: String,
        metadata_id: String,
        source: StoreError,
    },

    #[error("{kind} user {user_id}: metadata {metadata_id} was modified concurrently, left for the next run")]
    Conflict {
        kind: ProfileKind,
        user_id: String,
        metadata_id: String,
    },
}

/// Outcome of one profile table scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub kind: ProfileKind,
    pub dry_run: bool,
    pub scanned: usize,
    /// Records updated (or that would be, in a dry run)
    pub patched: usize,
    /// Records with gaps the profile could not fill
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    fn new(kind: ProfileKind, dry_run: bool) -> Self {
        Self {
            kind,
            dry_run,
            scanned: 0,
            patched: 0,
            skipped: 0,
            errors: Vec::new(),
        }
    }
}

/// Merged outcome of several scans
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSummary {
    /// False only when a profile listing query failed
    pub success: bool,
    pub patched: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub nurses: Option<ReconcileReport>,
    pub clients: Option<ReconcileReport>,
}

impl Default for SyncSummary {
    fn default() -> Self {
        Self {
            success: true,
            patched: 0,
            skipped: 0,
            errors: Vec::new(),
            nurses: None,
            clients: None,
        }
    }
}

impl SyncSummary {
    /// Merge per-kind results
    pub fn collect(
        results: impl IntoIterator<Item = (ProfileKind, Result<ReconcileReport, StoreError>)>,
    ) -> Self {
        let mut summary = Self::default();

        for (kind, result) in results {
            match result {
                Ok(report) => {
                    summary.patched += report.patched;
                    summary.skipped += report.skipped;
                    summary.errors.extend(report.errors.iter().cloned());
                    match kind {
                        ProfileKind::Nurse => summary.nurses = Some(report),
                        ProfileKind::Client => summary.clients = Some(report),
                    }
                }
                Err(e) => {
                    error!("❌ Failed to list {}: {}", kind.table(), e);
                    summary.success = false;
                    summary.errors.push(format!("failed to list {}: {}", kind.table(), e));
                }
            }
        }

        summary
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Outcome {
    UpToDate,
    Patched,
    MissingSource,
}

/// Metadata reconciler over an injected store
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    dry_run: bool,
    create_missing: bool,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            dry_run: false,
            create_missing: false,
        }
    }

    /// Count what would change without writing
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Insert a metadata row when a profile has none
    pub fn create_missing(mut self, enabled: bool) -> Self {
        self.create_missing = enabled;
        self
    }

    /// Scan one profile table and patch its metadata records.
    ///
    /// Only the listing query can fail the call; per-record problems end up
    /// in `ReconcileReport::errors`.
    pub async fn reconcile(&self, kind: ProfileKind) -> Result<ReconcileReport, StoreError> {
        self.run(kind, self.dry_run).await
    }

    /// Same scan as `reconcile`, never writing
    pub async fn audit(&self, kind: ProfileKind) -> Result<ReconcileReport, StoreError> {
        self.run(kind, true).await
    }

    /// Reconcile nurses and clients concurrently and merge the results
    pub async fn reconcile_all(&self) -> SyncSummary {
        let start = Instant::now();
        let (nurses, clients) = tokio::join!(
            self.reconcile(ProfileKind::Nurse),
            self.reconcile(ProfileKind::Client)
        );

        let summary = SyncSummary::collect([
            (ProfileKind::Nurse, nurses),
            (ProfileKind::Client, clients),
        ]);

        info!(
            "Sync finished in {:?}: {} patched, {} errors, success={}",
            start.elapsed(),
            summary.patched,
            summary.errors.len(),
            summary.success
        );
        summary
    }

    /// Repair the metadata of a single user.
    ///
    /// Returns true when a patch was applied.
    pub async fn reconcile_user(&self, kind: ProfileKind, user_id: &str) -> Result<bool, RecordError> {
        let filter = Filter::new().eq("user_id", user_id);
        let row = self
            .store
            .fetch_one(kind.table(), &filter)
            .await
            .map_err(|source| RecordError::Fetch {
                kind,
                user_id: user_id.to_string(),
                source,
            })?
            .ok_or_else(|| RecordError::MissingProfile {
                kind,
                user_id: user_id.to_string(),
            })?;

        let outcome = self.reconcile_row(kind, row, self.dry_run).await?;
        Ok(outcome == Outcome::Patched)
    }

    async fn run(&self, kind: ProfileKind, dry_run: bool) -> Result<ReconcileReport, StoreError> {
        let start = Instant::now();
        let rows = self.store.select(kind.table(), &Filter::new()).await?;
        info!(
            "🔍 Scanning {} {} profiles ({} store{})",
            rows.len(),
            kind,
            self.store.name(),
            if dry_run { ", dry run" } else { "" }
        );

        let mut report = ReconcileReport::new(kind, dry_run);

        for row in rows {
            report.scanned += 1;
            match self.reconcile_row(kind, row, dry_run).await {
                Ok(Outcome::Patched) => report.patched += 1,
                Ok(Outcome::MissingSource) => report.skipped += 1,
                Ok(Outcome::UpToDate) => {}
                Err(e) => {
                    warn!("⚠️  {}", e);
                    report.errors.push(e.to_string());
                }
            }
        }

        info!(
            "✓ {}: {} scanned, {} patched, {} skipped, {} errors in {:?}",
            kind.table(),
            report.scanned,
            report.patched,
            report.skipped,
            report.errors.len(),
            start.elapsed()
        );
        Ok(report)
    }

    async fn reconcile_row(
        &self,
        kind: ProfileKind,
        row: Row,
        dry_run: bool,
    ) -> Result<Outcome, RecordError> {
        let row_id = row_id(&row).unwrap_or_default();
        let profile = ProfileRecord::from_row(row)
            .map_err(|source| RecordError::Decode { kind, row_id, source })?;

        let filter = Filter::new().eq("user_id", profile.user_id.as_str());
        let found = self
            .store
            .fetch_one(METADATA_TABLE, &filter)
            .await
            .map_err(|source| RecordError::Fetch {
                kind,
                user_id: profile.user_id.clone(),
                source,
            })?;

        let Some(meta_row) = found else {
            return self.insert_missing(kind, &profile, dry_run).await;
        };

        let metadata = MetadataRecord::from_row(meta_row).map_err(|source| RecordError::Fetch {
            kind,
            user_id: profile.user_id.clone(),
            source,
        })?;

        let patch = match metadata.repair_from(&profile) {
            Repair::UpToDate => return Ok(Outcome::UpToDate),
            Repair::MissingSource => {
                debug!(
                    "{} user {}: metadata incomplete, profile has nothing to copy{}",
                    kind,
                    profile.user_id,
                    if profile.has_no_identity() { " (empty profile)" } else { "" }
                );
                return Ok(Outcome::MissingSource);
            }
            Repair::Patch(patch) => patch,
        };

        if dry_run {
            debug!("{} user {}: would patch {:?}", kind, profile.user_id, patch.keys());
            return Ok(Outcome::Patched);
        }

        match self
            .store
            .update(METADATA_TABLE, &metadata.id, patch, Some(metadata.version))
            .await
        {
            Ok(_) => {
                debug!("{} user {}: metadata {} patched", kind, profile.user_id, metadata.id);
                Ok(Outcome::Patched)
            }
            Err(StoreError::Conflict { .. }) => Err(RecordError::Conflict {
                kind,
                user_id: profile.user_id,
                metadata_id: metadata.id,
            }),
            Err(source) => Err(RecordError::Update {
                kind,
                user_id: profile.user_id,
                metadata_id: metadata.id,
                source,
            }),
        }
    }

    async fn insert_missing(
        &self,
        kind: ProfileKind,
        profile: &ProfileRecord,
        dry_run: bool,
    ) -> Result<Outcome, RecordError> {
        if !self.create_missing {
            return Err(RecordError::MissingMetadata {
                kind,
                user_id: profile.user_id.clone(),
            });
        }
        if dry_run {
            return Ok(Outcome::Patched);
        }

        self.store
            .insert(METADATA_TABLE, MetadataRecord::row_from_profile(kind, profile))
            .await
            .map_err(|source| RecordError::Update {
                kind,
                user_id: profile.user_id.clone(),
                metadata_id: "(new)".into(),
                source,
            })?;

        debug!("{} user {}: metadata created", kind, profile.user_id);
        Ok(Outcome::Patched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashSet;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn nurse(id: &str, user: &str, first: &str, last: &str, phone: &str) -> Row {
        row(json!({
            "id": id,
            "user_id": user,
            "first_name": first,
            "last_name": last,
            "phone_number": phone,
            "onboarding_completed": true
        }))
    }

    fn meta(id: &str, user: &str, first: &str, last: &str, phone: &str) -> Row {
        row(json!({
            "id": id,
            "user_id": user,
            "user_type": "nurse",
            "first_name": first,
            "last_name": last,
            "phone": phone,
            "onboarding_completed": false
        }))
    }

    async fn metadata_of(store: &MemoryStore, id: &str) -> MetadataRecord {
        MetadataRecord::from_row(store.get(METADATA_TABLE, id).await.unwrap()).unwrap()
    }

    /// Fails fetches for chosen users, listings for chosen tables
    /// and updates of chosen row ids
    struct FailingStore {
        inner: MemoryStore,
        failing_users: HashSet<String>,
        failing_tables: HashSet<String>,
        failing_updates: HashSet<String>,
    }

    impl FailingStore {
        fn new(inner: MemoryStore) -> Self {
            Self {
                inner,
                failing_users: HashSet::new(),
                failing_tables: HashSet::new(),
                failing_updates: HashSet::new(),
            }
        }

        fn fail_user(mut self, user: &str) -> Self {
            self.failing_users.insert(user.into());
            self
        }

        fn fail_table(mut self, table: &str) -> Self {
            self.failing_tables.insert(table.into());
            self
        }

        fn fail_update(mut self, id: &str) -> Self {
            self.failing_updates.insert(id.into());
            self
        }

        fn injected(what: &str) -> StoreError {
            StoreError::Status {
                table: what.into(),
                status: 503,
                body: "injected failure".into(),
            }
        }
    }

    #[async_trait]
    impl RecordStore for FailingStore {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError> {
            if self.failing_tables.contains(table) {
                return Err(Self::injected(table));
            }
            self.inner.select(table, filter).await
        }

        async fn fetch_one(&self, table: &str, filter: &Filter) -> Result<Option<Row>, StoreError> {
            let hit = self
                .failing_users
                .iter()
                .any(|user| Filter::new().eq("user_id", user.as_str()) == *filter);
            if hit {
                return Err(Self::injected(table));
            }
            self.inner.fetch_one(table, filter).await
        }

        async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError> {
            self.inner.insert(table, row).await
        }

        async fn update(
            &self,
            table: &str,
            id: &str,
            patch: Row,
            expected_version: Option<u64>,
        ) -> Result<Row, StoreError> {
            if self.failing_updates.contains(id) {
                return Err(Self::injected(table));
            }
            self.inner.update(table, id, patch, expected_version).await
        }

        async fn delete(&self, table: &str, id: &str) -> Result<bool, StoreError> {
            self.inner.delete(table, id).await
        }
    }

    /// Simulates the owning user editing their metadata right after it is read
    struct ConcurrentEditStore {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl RecordStore for ConcurrentEditStore {
        fn name(&self) -> &'static str {
            "racing"
        }

        async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError> {
            self.inner.select(table, filter).await
        }

        async fn fetch_one(&self, table: &str, filter: &Filter) -> Result<Option<Row>, StoreError> {
            let found = self.inner.fetch_one(table, filter).await?;
            if table == METADATA_TABLE {
                if let Some(id) = found.as_ref().and_then(row_id) {
                    let edit = row(json!({"first_name": "Edited"}));
                    self.inner.update(table, &id, edit, None).await?;
                }
            }
            Ok(found)
        }

        async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError> {
            self.inner.insert(table, row).await
        }

        async fn update(
            &self,
            table: &str,
            id: &str,
            patch: Row,
            expected_version: Option<u64>,
        ) -> Result<Row, StoreError> {
            self.inner.update(table, id, patch, expected_version).await
        }

        async fn delete(&self, table: &str, id: &str) -> Result<bool, StoreError> {
            self.inner.delete(table, id).await
        }
    }

    #[tokio::test]
    async fn test_fills_empty_metadata() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed("nurse_profiles", vec![nurse("p1", "u1", "Amy", "Lee", "555-1234")])
            .await
            .unwrap();
        store
            .seed(METADATA_TABLE, vec![meta("m1", "u1", "", "", "")])
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone());
        let report = reconciler.reconcile(ProfileKind::Nurse).await.unwrap();

        assert_eq!(report.patched, 1);
        assert!(report.errors.is_empty());

        let m = metadata_of(&store, "m1").await;
        assert_eq!(m.first_name, "Amy");
        assert_eq!(m.last_name, "Lee");
        assert_eq!(m.phone, "555-1234");
        assert!(m.onboarding_completed);
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed(
                "nurse_profiles",
                vec![
                    nurse("p1", "u1", "Amy", "Lee", "555-1234"),
                    nurse("p2", "u2", "Bo", "", "555-9999"),
                ],
            )
            .await
            .unwrap();
        store
            .seed(
                METADATA_TABLE,
                vec![meta("m1", "u1", "", "", ""), meta("m2", "u2", "", "", "")],
            )
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone());
        let first = reconciler.reconcile(ProfileKind::Nurse).await.unwrap();
        let after_first = store.select(METADATA_TABLE, &Filter::new()).await.unwrap();

        let second = reconciler.reconcile(ProfileKind::Nurse).await.unwrap();
        let after_second = store.select(METADATA_TABLE, &Filter::new()).await.unwrap();

        assert_eq!(first.patched, 2);
        assert_eq!(second.patched, 0);
        // u2 still lacks a last name the profile cannot provide
        assert_eq!(second.skipped, 1);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn test_matching_client_is_noop() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed("client_profiles", vec![nurse("c1", "u9", "Dee", "Park", "555-0000")])
            .await
            .unwrap();
        store
            .seed(METADATA_TABLE, vec![meta("m9", "u9", "Dee", "Park", "555-0000")])
            .await
            .unwrap();

        let report = Reconciler::new(store.clone())
            .reconcile(ProfileKind::Client)
            .await
            .unwrap();

        assert_eq!(report.patched, 0);
        assert!(report.errors.is_empty());
        assert_eq!(metadata_of(&store, "m9").await.version, 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_record_and_continues() {
        let inner = MemoryStore::new();
        inner
            .seed(
                "nurse_profiles",
                vec![
                    nurse("p1", "u1", "Amy", "Lee", "1"),
                    nurse("p2", "u2", "Bo", "Ray", "2"),
                    nurse("p3", "u3", "Cy", "Fox", "3"),
                ],
            )
            .await
            .unwrap();
        inner
            .seed(
                METADATA_TABLE,
                vec![
                    meta("m1", "u1", "", "", ""),
                    meta("m2", "u2", "", "", ""),
                    meta("m3", "u3", "", "", ""),
                ],
            )
            .await
            .unwrap();

        let store = Arc::new(FailingStore::new(inner).fail_user("u2"));
        let report = Reconciler::new(store.clone())
            .reconcile(ProfileKind::Nurse)
            .await
            .unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.patched, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("u2"));
        assert!(report.errors[0].contains("fetch failed"));

        assert_eq!(metadata_of(&store.inner, "m2").await.first_name, "");
        assert_eq!(metadata_of(&store.inner, "m3").await.first_name, "Cy");
    }

    #[tokio::test]
    async fn test_update_failure_skips_record_and_continues() {
        let inner = MemoryStore::new();
        inner
            .seed(
                "nurse_profiles",
                vec![
                    nurse("p1", "u1", "Amy", "Lee", "1"),
                    nurse("p2", "u2", "Bo", "Ray", "2"),
                    nurse("p3", "u3", "Cy", "Fox", "3"),
                ],
            )
            .await
            .unwrap();
        inner
            .seed(
                METADATA_TABLE,
                vec![
                    meta("m1", "u1", "", "", ""),
                    meta("m2", "u2", "", "", ""),
                    meta("m3", "u3", "", "", ""),
                ],
            )
            .await
            .unwrap();

        let store = Arc::new(FailingStore::new(inner).fail_update("m2"));
        let report = Reconciler::new(store.clone())
            .reconcile(ProfileKind::Nurse)
            .await
            .unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.patched, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("u2"));
        assert!(report.errors[0].contains("update of metadata"));

        assert_eq!(metadata_of(&store.inner, "m1").await.first_name, "Amy");
        assert_eq!(metadata_of(&store.inner, "m2").await.first_name, "");
        assert_eq!(metadata_of(&store.inner, "m3").await.first_name, "Cy");
    }

    #[tokio::test]
    async fn test_reconcile_all_success_ignores_record_errors() {
        let inner = MemoryStore::new();
        inner
            .seed("nurse_profiles", vec![nurse("p1", "u1", "Amy", "Lee", "1")])
            .await
            .unwrap();
        inner
            .seed("client_profiles", vec![nurse("c1", "u2", "Bo", "Ray", "2")])
            .await
            .unwrap();
        inner
            .seed(METADATA_TABLE, vec![meta("m2", "u2", "", "", "")])
            .await
            .unwrap();

        // u1 has no metadata row at all
        let summary = Reconciler::new(Arc::new(inner)).reconcile_all().await;

        assert!(summary.success);
        assert_eq!(summary.patched, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].contains("no metadata record"));
        assert_eq!(summary.nurses.as_ref().unwrap().errors.len(), 1);
        assert_eq!(summary.clients.as_ref().unwrap().patched, 1);
    }

    #[tokio::test]
    async fn test_reconcile_all_fails_when_listing_fails() {
        let inner = MemoryStore::new();
        inner
            .seed("client_profiles", vec![nurse("c1", "u2", "Bo", "Ray", "2")])
            .await
            .unwrap();
        inner
            .seed(METADATA_TABLE, vec![meta("m2", "u2", "", "", "")])
            .await
            .unwrap();

        let store = Arc::new(FailingStore::new(inner).fail_table("nurse_profiles"));
        let summary = Reconciler::new(store.clone()).reconcile_all().await;

        assert!(!summary.success);
        assert!(summary.nurses.is_none());
        assert_eq!(summary.patched, 1);
        assert!(summary.errors[0].contains("failed to list nurse_profiles"));
        assert_eq!(metadata_of(&store.inner, "m2").await.first_name, "Bo");
    }

    #[tokio::test]
    async fn test_profile_without_data_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed("nurse_profiles", vec![nurse("p1", "u1", "", "", "")])
            .await
            .unwrap();
        store
            .seed(METADATA_TABLE, vec![meta("m1", "u1", "", "", "")])
            .await
            .unwrap();

        let report = Reconciler::new(store.clone())
            .reconcile(ProfileKind::Nurse)
            .await
            .unwrap();

        assert_eq!(report.patched, 0);
        assert_eq!(report.skipped, 1);
        assert!(report.errors.is_empty());
        assert_eq!(metadata_of(&store, "m1").await.version, 0);
    }

    #[tokio::test]
    async fn test_partial_profile_does_not_blank_metadata() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed("nurse_profiles", vec![nurse("p1", "u1", "Amy", "", "555")])
            .await
            .unwrap();
        store
            .seed(METADATA_TABLE, vec![meta("m1", "u1", "", "Keep", "")])
            .await
            .unwrap();

        Reconciler::new(store.clone())
            .reconcile(ProfileKind::Nurse)
            .await
            .unwrap();

        let m = metadata_of(&store, "m1").await;
        assert_eq!(m.first_name, "Amy");
        assert_eq!(m.last_name, "Keep");
        assert_eq!(m.phone, "555");
    }

    #[tokio::test]
    async fn test_concurrent_edit_reports_conflict() {
        let inner = Arc::new(MemoryStore::new());
        inner
            .seed("nurse_profiles", vec![nurse("p1", "u1", "Amy", "Lee", "1")])
            .await
            .unwrap();
        inner
            .seed(METADATA_TABLE, vec![meta("m1", "u1", "", "", "")])
            .await
            .unwrap();

        let store = Arc::new(ConcurrentEditStore {
            inner: inner.clone(),
        });
        let report = Reconciler::new(store)
            .reconcile(ProfileKind::Nurse)
            .await
            .unwrap();

        assert_eq!(report.patched, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("modified concurrently"));

        // The newer value survives
        let m = metadata_of(&inner, "m1").await;
        assert_eq!(m.first_name, "Edited");
        assert_eq!(m.last_name, "");
    }

    #[tokio::test]
    async fn test_dry_run_leaves_store_unchanged() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed("nurse_profiles", vec![nurse("p1", "u1", "Amy", "Lee", "1")])
            .await
            .unwrap();
        store
            .seed(METADATA_TABLE, vec![meta("m1", "u1", "", "", "")])
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone());
        let audit = reconciler.audit(ProfileKind::Nurse).await.unwrap();
        assert!(audit.dry_run);
        assert_eq!(audit.patched, 1);
        assert_eq!(metadata_of(&store, "m1").await.first_name, "");

        let dry = Reconciler::new(store.clone())
            .dry_run(true)
            .reconcile_all()
            .await;
        assert_eq!(dry.patched, 1);
        assert_eq!(metadata_of(&store, "m1").await.version, 0);

        let real = reconciler.reconcile(ProfileKind::Nurse).await.unwrap();
        assert_eq!(real.patched, audit.patched);
    }

    #[tokio::test]
    async fn test_create_missing_inserts_metadata() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed("client_profiles", vec![nurse("c1", "u5", "Eve", "Ng", "7")])
            .await
            .unwrap();

        let report = Reconciler::new(store.clone())
            .create_missing(true)
            .reconcile(ProfileKind::Client)
            .await
            .unwrap();

        assert_eq!(report.patched, 1);
        let created = store
            .fetch_one(METADATA_TABLE, &Filter::new().eq("user_id", "u5"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created["user_type"], "client");
        assert_eq!(created["first_name"], "Eve");
    }

    #[tokio::test]
    async fn test_create_missing_next_to_existing_ids() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed(
                "client_profiles",
                vec![
                    nurse("1", "u1", "Amy", "Lee", "1"),
                    nurse("2", "u2", "Bo", "Ray", "2"),
                ],
            )
            .await
            .unwrap();
        // Imported row already holds id "1"
        store
            .seed(METADATA_TABLE, vec![meta("1", "u1", "Amy", "Lee", "1")])
            .await
            .unwrap();

        let report = Reconciler::new(store.clone())
            .create_missing(true)
            .reconcile(ProfileKind::Client)
            .await
            .unwrap();

        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.patched, 1);
        assert_eq!(store.len(METADATA_TABLE).await, 2);
        assert_eq!(metadata_of(&store, "1").await.user_id, "u1");
    }

    #[tokio::test]
    async fn test_reconcile_user() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed("nurse_profiles", vec![nurse("p1", "u1", "Amy", "Lee", "1")])
            .await
            .unwrap();
        store
            .seed(METADATA_TABLE, vec![meta("m1", "u1", "", "Lee", "1")])
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone());
        assert!(reconciler.reconcile_user(ProfileKind::Nurse, "u1").await.unwrap());
        assert!(!reconciler.reconcile_user(ProfileKind::Nurse, "u1").await.unwrap());

        let err = reconciler
            .reconcile_user(ProfileKind::Nurse, "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, RecordError::MissingProfile { .. }));
    }
}
