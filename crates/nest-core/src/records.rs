//! Profile & Metadata Records
//!
//! Typed views over store rows:
//! - `ProfileRecord`  - authoritative nurse/client profile
//! - `MetadataRecord` - denormalized identity fields in `user_metadata`
//!
//! NULL or missing text columns decode as empty strings; a value made only
//! of whitespace counts as empty.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::store::{Row, StoreError};

/// Table holding the denormalized projection
pub const METADATA_TABLE: &str = "user_metadata";

/// Which profile table a user lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    Nurse,
    Client,
}

impl ProfileKind {
    pub const ALL: [ProfileKind; 2] = [ProfileKind::Nurse, ProfileKind::Client];

    /// Authoritative profile table
    pub fn table(&self) -> &'static str {
        match self {
            ProfileKind::Nurse => "nurse_profiles",
            ProfileKind::Client => "client_profiles",
        }
    }

    /// Value stored in `user_metadata.user_type`
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileKind::Nurse => "nurse",
            ProfileKind::Client => "client",
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nurse" | "nurses" => Ok(ProfileKind::Nurse),
            "client" | "clients" => Ok(ProfileKind::Client),
            other => Err(format!("unknown profile kind '{}' (expected nurse or client)", other)),
        }
    }
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

fn text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    })
}

fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(d)?.unwrap_or(false))
}

fn version<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    Ok(Option::<u64>::deserialize(d)?.unwrap_or(0))
}

/// Nurse or client profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    #[serde(default, deserialize_with = "text")]
    pub id: String,
    #[serde(default, deserialize_with = "text")]
    pub user_id: String,
    #[serde(default, deserialize_with = "text")]
    pub first_name: String,
    #[serde(default, deserialize_with = "text")]
    pub last_name: String,
    #[serde(default, alias = "phone", deserialize_with = "text")]
    pub phone_number: String,
    #[serde(default, deserialize_with = "flag")]
    pub onboarding_completed: bool,
}

impl ProfileRecord {
    pub fn from_row(row: Row) -> Result<Self, StoreError> {
        Ok(serde_json::from_value(Value::Object(row))?)
    }

    /// True when the profile has none of the copyable fields
    pub fn has_no_identity(&self) -> bool {
        is_blank(&self.first_name) && is_blank(&self.last_name) && is_blank(&self.phone_number)
    }
}

/// Denormalized identity projection keyed by user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(default, deserialize_with = "text")]
    pub id: String,
    #[serde(default, deserialize_with = "text")]
    pub user_id: String,
    #[serde(default, deserialize_with = "text")]
    pub user_type: String,
    #[serde(default, deserialize_with = "text")]
    pub first_name: String,
    #[serde(default, deserialize_with = "text")]
    pub last_name: String,
    #[serde(default, deserialize_with = "text")]
    pub phone: String,
    #[serde(default, deserialize_with = "flag")]
    pub onboarding_completed: bool,
    #[serde(default, deserialize_with = "version")]
    pub version: u64,
}

/// What a metadata record needs to match its profile
#[derive(Debug, Clone, PartialEq)]
pub enum Repair {
    /// No empty fields on the metadata side
    UpToDate,
    /// Columns to write
    Patch(Row),
    /// Metadata has gaps, but the profile has nothing to fill them with
    MissingSource,
}

impl MetadataRecord {
    pub fn from_row(row: Row) -> Result<Self, StoreError> {
        Ok(serde_json::from_value(Value::Object(row))?)
    }

    /// Fresh metadata row mirroring `profile`
    pub fn row_from_profile(kind: ProfileKind, profile: &ProfileRecord) -> Row {
        let mut row = Row::new();
        row.insert("user_id".into(), Value::String(profile.user_id.clone()));
        row.insert("user_type".into(), Value::String(kind.as_str().into()));
        row.insert("first_name".into(), Value::String(profile.first_name.clone()));
        row.insert("last_name".into(), Value::String(profile.last_name.clone()));
        row.insert("phone".into(), Value::String(profile.phone_number.clone()));
        row.insert(
            "onboarding_completed".into(),
            Value::Bool(profile.onboarding_completed),
        );
        row
    }

    /// Decide how to bring this record in line with `profile`.
    ///
    /// A patch is due when some metadata field is empty while the profile
    /// has a value for it. The patch then carries every non-empty profile
    /// field plus the onboarding flag; empty profile values are never
    /// written.
    pub fn repair_from(&self, profile: &ProfileRecord) -> Repair {
        let fields = [
            ("first_name", &self.first_name, &profile.first_name),
            ("last_name", &self.last_name, &profile.last_name),
            ("phone", &self.phone, &profile.phone_number),
        ];

        if !fields.iter().any(|(_, meta, _)| is_blank(meta)) {
            return Repair::UpToDate;
        }

        if !fields
            .iter()
            .any(|(_, meta, source)| is_blank(meta) && !is_blank(source))
        {
            return Repair::MissingSource;
        }

        let mut patch = Row::new();
        for (column, _, source) in fields {
            if !is_blank(source) {
                patch.insert(column.into(), Value::String(source.to_string()));
            }
        }
        patch.insert(
            "onboarding_completed".into(),
            Value::Bool(profile.onboarding_completed),
        );

        Repair::Patch(patch)
    }
}
