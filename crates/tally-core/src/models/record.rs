//! Record model and validation

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::sync_status::{SyncStatus, SyncStatusKind};
use crate::util::{collapse_whitespace, unix_timestamp_ms};

const MAX_NAME_LENGTH: usize = 100;

/// Identifier for a record.
///
/// Backend-assigned ids are UUID v4. Until the backend acknowledges a create,
/// a record lives under a locally generated temporary id of the form
/// `temp-{timestamp}-{random}` so the interactive surface has something to
/// render immediately.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    /// Create a new permanent ID using UUID v4
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a temporary local ID for an unacknowledged create
    #[must_use]
    pub fn temporary() -> Self {
        let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
        Self(format!("temp-{}-{suffix:06}", unix_timestamp_ms()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True while the backend has not yet assigned a permanent id
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with("temp-")
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A named record in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier
    pub id: RecordId,
    /// Display name, sanitized and validated
    pub name: String,
    /// Owning account id; `None` means the anonymous scope
    pub owner_id: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
    /// Tombstone flag; physical removal waits for the delete to sync
    pub deleted: bool,
    /// Embedded sync bookkeeping
    pub sync: SyncStatus,
}

/// A partial edit to a record. Empty patches are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub name: Option<String>,
    pub deleted: Option<bool>,
    /// Compare-and-set guard: when present, the backend rejects the update
    /// with a conflict if the stored `updated_at` no longer matches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_updated_at: Option<i64>,
}

impl RecordPatch {
    pub const fn is_empty(&self) -> bool {
        self.name.is_none() && self.deleted.is_none()
    }

    /// Patch that renames the record.
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Patch that sets the tombstone flag.
    #[must_use]
    pub fn tombstone() -> Self {
        Self {
            deleted: Some(true),
            ..Self::default()
        }
    }
}

impl Record {
    /// Create a new record with a sanitized, validated name.
    ///
    /// The record starts `pending` with `updated_at == created_at`.
    pub fn create(name: &str, owner_id: Option<String>) -> Result<Self> {
        let name = sanitize_name(name)?;
        let now = unix_timestamp_ms();
        Ok(Self {
            id: RecordId::temporary(),
            name,
            owner_id,
            created_at: now,
            updated_at: now,
            deleted: false,
            sync: SyncStatus::pending(),
        })
    }

    /// Apply a patch, returning the updated record.
    ///
    /// A patch whose sanitized values are byte-identical to the current ones
    /// is a no-op: the record is returned unchanged with no timestamp or
    /// status churn. A genuinely empty patch is rejected.
    pub fn apply(&self, patch: &RecordPatch) -> Result<Self> {
        if patch.is_empty() {
            return Err(Error::validation("patch", "no fields to update"));
        }

        let target_name = match &patch.name {
            Some(raw) => sanitize_name(raw)?,
            None => self.name.clone(),
        };
        let target_deleted = patch.deleted.unwrap_or(self.deleted);

        if target_name == self.name && target_deleted == self.deleted {
            return Ok(self.clone());
        }

        let mut updated = self.clone();
        updated.name = target_name;
        updated.deleted = target_deleted;
        updated.updated_at = unix_timestamp_ms().max(self.updated_at + 1);
        updated.sync = match self.sync.status {
            // An in-flight attempt keeps its status; the reconciliation
            // settle step re-queues the newer content afterwards.
            SyncStatusKind::Pending | SyncStatusKind::Syncing => self.sync.clone(),
            _ => self.sync.transition(SyncStatusKind::Pending)?,
        };
        Ok(updated)
    }

    /// Set the tombstone flag; the record stays visible until the delete syncs.
    pub fn mark_deleted(&self) -> Result<Self> {
        self.apply(&RecordPatch::tombstone())
    }

    /// Convert to the persisted row format shared by both backends.
    #[must_use]
    pub fn to_storage_format(&self) -> StoredRecord {
        StoredRecord {
            id: self.id.as_str().to_string(),
            name: self.name.clone(),
            owner_id: self.owner_id.clone(),
            created_at: format_timestamp(self.created_at),
            updated_at: format_timestamp(self.updated_at),
            sync_status: match self.sync.status {
                SyncStatusKind::Synced => StoredSyncStatus::Synced,
                SyncStatusKind::Failed => StoredSyncStatus::Error,
                _ => StoredSyncStatus::Pending,
            },
        }
    }

    /// Rebuild a record from a persisted row. Optional fields default
    /// consistently: no tombstone, no error message, zero retries.
    pub fn from_storage_format(row: &StoredRecord) -> Result<Self> {
        let created_at = parse_timestamp(&row.created_at)?;
        let updated_at = parse_timestamp(&row.updated_at)?;
        let mut sync = SyncStatus::pending();
        match row.sync_status {
            StoredSyncStatus::Pending => {}
            StoredSyncStatus::Synced => {
                sync.status = SyncStatusKind::Synced;
            }
            StoredSyncStatus::Error => {
                sync.status = SyncStatusKind::Failed;
            }
        }
        Ok(Self {
            id: RecordId::from(row.id.clone()),
            name: row.name.clone(),
            owner_id: row.owner_id.clone(),
            created_at,
            updated_at,
            deleted: false,
            sync,
        })
    }
}

/// Persisted record row, RFC3339 timestamps, reduced sync status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub name: String,
    pub owner_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub sync_status: StoredSyncStatus,
}

/// Reduced three-state sync status carried by the persisted row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoredSyncStatus {
    Pending,
    Synced,
    Error,
}

impl StoredSyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for StoredSyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "error" => Ok(Self::Error),
            other => Err(Error::validation(
                "sync_status",
                format!("unknown value: {other}"),
            )),
        }
    }
}

fn name_whitelist() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9 ().-]+$").expect("Invalid regex"))
}

/// Trim, collapse whitespace runs, and validate a record name.
///
/// Rejects empty names, names over 100 characters, and any character outside
/// the whitelist (letters, digits, space, hyphen, parentheses, period) so
/// markup and SQL metacharacters never reach a backend.
pub fn sanitize_name(raw: &str) -> Result<String> {
    let name = collapse_whitespace(raw);
    if name.is_empty() {
        return Err(Error::validation("name", "must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(Error::validation(
            "name",
            format!("must be at most {MAX_NAME_LENGTH} characters"),
        ));
    }
    if !name_whitelist().is_match(&name) {
        return Err(Error::validation(
            "name",
            "may only contain letters, digits, spaces, hyphens, parentheses, and periods",
        ));
    }
    Ok(name)
}

fn format_timestamp(unix_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(unix_ms)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<i64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| Error::validation("timestamp", format!("{value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn create_starts_pending_with_equal_timestamps() {
        let record = Record::create("Push-ups", None).unwrap();
        assert_eq!(record.name, "Push-ups");
        assert_eq!(record.sync.status, SyncStatusKind::Pending);
        assert_eq!(record.created_at, record.updated_at);
        assert!(!record.deleted);
        assert!(record.id.is_temporary());
    }

    #[test]
    fn create_sanitizes_whitespace() {
        let record = Record::create("  Bench   Press  ", None).unwrap();
        assert_eq!(record.name, "Bench Press");
    }

    #[test]
    fn create_rejects_empty_name() {
        let err = Record::create("   ", None).unwrap_err();
        assert!(matches!(err, Error::Validation { field: "name", .. }));
    }

    #[test]
    fn create_rejects_markup_characters() {
        assert!(Record::create("<script>alert(1)</script>", None).is_err());
        assert!(Record::create("Robert'); DROP TABLE records;--", None).is_err());
        assert!(Record::create("Push-ups (weighted) v2.1", None).is_ok());
    }

    #[test]
    fn create_rejects_overlong_name() {
        let long = "a".repeat(MAX_NAME_LENGTH + 1);
        assert!(Record::create(&long, None).is_err());
        let just_fits = "a".repeat(MAX_NAME_LENGTH);
        assert!(Record::create(&just_fits, None).is_ok());
    }

    #[test]
    fn apply_empty_patch_is_rejected() {
        let record = Record::create("Squats", None).unwrap();
        let err = record.apply(&RecordPatch::default()).unwrap_err();
        assert!(matches!(err, Error::Validation { field: "patch", .. }));
    }

    #[test]
    fn apply_noop_patch_changes_nothing() {
        let record = Record::create("Squats", None).unwrap();
        // Same value modulo sanitization
        let unchanged = record.apply(&RecordPatch::rename("  Squats ")).unwrap();
        assert_eq!(unchanged, record);
    }

    #[test]
    fn apply_real_edit_bumps_updated_at_and_resets_to_pending() {
        let record = Record::create("Pushups", None).unwrap();
        let synced = Record {
            sync: record
                .sync
                .transition(SyncStatusKind::Syncing)
                .unwrap()
                .transition(SyncStatusKind::Synced)
                .unwrap(),
            ..record
        };
        let renamed = synced.apply(&RecordPatch::rename("Push-ups")).unwrap();
        assert_eq!(renamed.name, "Push-ups");
        assert!(renamed.updated_at > synced.updated_at);
        assert_eq!(renamed.sync.status, SyncStatusKind::Pending);
    }

    #[test]
    fn apply_during_in_flight_attempt_keeps_syncing_status() {
        let record = Record::create("Pushups", None).unwrap();
        let in_flight = Record {
            sync: record.sync.transition(SyncStatusKind::Syncing).unwrap(),
            ..record
        };
        let renamed = in_flight.apply(&RecordPatch::rename("Push-ups")).unwrap();
        assert_eq!(renamed.sync.status, SyncStatusKind::Syncing);
        assert!(renamed.updated_at > in_flight.updated_at);
    }

    #[test]
    fn mark_deleted_sets_tombstone_only() {
        let record = Record::create("Lunges", None).unwrap();
        let deleted = record.mark_deleted().unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.name, record.name);
        assert_eq!(deleted.sync.status, SyncStatusKind::Pending);
    }

    #[test]
    fn storage_round_trip_preserves_row_fields() {
        let mut record = Record::create("Deadlift (heavy)", Some("owner-1".to_string())).unwrap();
        record.id = RecordId::new();
        let row = record.to_storage_format();
        let restored = Record::from_storage_format(&row).unwrap();
        assert_eq!(restored.id, record.id);
        assert_eq!(restored.name, record.name);
        assert_eq!(restored.owner_id, record.owner_id);
        assert_eq!(restored.created_at, record.created_at);
        assert_eq!(restored.updated_at, record.updated_at);
        assert_eq!(restored.sync.status, record.sync.status);
    }

    #[test]
    fn storage_format_reduces_status_to_three_states() {
        let record = Record::create("Rows", None).unwrap();
        let syncing = Record {
            sync: record.sync.transition(SyncStatusKind::Syncing).unwrap(),
            ..record
        };
        assert_eq!(
            syncing.to_storage_format().sync_status,
            StoredSyncStatus::Pending
        );
    }

    #[test]
    fn temporary_ids_are_recognizable() {
        assert!(RecordId::temporary().is_temporary());
        assert!(!RecordId::new().is_temporary());
        let temp = RecordId::temporary();
        assert!(temp.as_str().starts_with("temp-"));
    }
}
