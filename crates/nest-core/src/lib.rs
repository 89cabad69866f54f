//! Nest Core - Profile Metadata Sync for Nurse Nest
//!
//! Features:
//! - Reconciles `user_metadata` against nurse/client profiles
//! - Nurse and client scans run concurrently
//! - Versioned updates (no stale overwrites)
//! - Pluggable record store: hosted REST, local sled snapshot, in-memory
//! - Config in ~/.nurse-nest/config.json with env overrides

pub mod config;
pub mod records;
pub mod reconcile;
pub mod store;

pub use config::{load_config, open_store, save_config, Backend, NestConfig, StoreConfig};
pub use records::{MetadataRecord, ProfileKind, ProfileRecord, Repair, METADATA_TABLE};
pub use reconcile::{Reconciler, RecordError, ReconcileReport, SyncSummary};
pub use store::{Filter, MemoryStore, RecordStore, RestStore, Row, SledStore, StoreError};
