//! Local SQLite backend
//!
//! The development/offline provider: records, the durable sync queue, and
//! accounts all live in one SQLite database. Plays the provider role for the
//! reconciliation engine exactly like the REST backend does, which keeps the
//! two substitutable and the consistency checker meaningful.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use blake2::{Blake2b512, Digest};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::backend::{
    AuthCallback, AuthSubscribers, Backend, RecordSubscribers, RecordsCallback, Subscription,
};
use crate::error::{Error, Result};
use crate::models::{
    select_ready_work, Account, Record, RecordId, RecordPatch, StoredQueueEntry, StoredRecord,
    StoredSyncStatus, SyncOperation, SyncQueueEntry,
};
use crate::util::unix_timestamp_ms;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// SQLite-backed provider implementation
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    record_subscribers: RecordSubscribers,
    auth_subscribers: AuthSubscribers,
}

impl SqliteBackend {
    /// Open (or create) a database at the given path and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (tests, previews).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            record_subscribers: RecordSubscribers::default(),
            auth_subscribers: AuthSubscribers::default(),
        })
    }

    fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRecord> {
        Ok(StoredRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            owner_id: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            sync_status: StoredSyncStatus::from_str(&row.get::<_, String>(5)?)
                .unwrap_or(StoredSyncStatus::Pending),
        })
    }

    fn parse_queue_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredQueueEntry> {
        Ok(StoredQueueEntry {
            record_id: row.get(0)?,
            record_type: row.get(1)?,
            operation: row.get(2)?,
            pending_since: row.get(3)?,
            attempts: row.get(4)?,
            last_error: row.get(5)?,
            next_retry_at: row.get(6)?,
            payload: row.get(7)?,
        })
    }

    fn fetch_record(conn: &Connection, id: &str) -> Result<Option<Record>> {
        let row = conn
            .query_row(
                "SELECT id, name, owner_id, created_at, updated_at, sync_status
                 FROM records WHERE id = ?",
                params![id],
                Self::parse_record,
            )
            .optional()?;
        row.as_ref().map(Record::from_storage_format).transpose()
    }

    fn list_scope(conn: &Connection, owner_id: Option<&str>) -> Result<Vec<Record>> {
        let mut statement = conn.prepare(
            "SELECT id, name, owner_id, created_at, updated_at, sync_status
             FROM records
             WHERE (?1 IS NULL AND owner_id IS NULL) OR owner_id = ?1
             ORDER BY updated_at DESC",
        )?;
        let rows = statement
            .query_map(params![owner_id], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter().map(Record::from_storage_format).collect()
    }

    fn load_queue(conn: &Connection) -> Result<Vec<SyncQueueEntry>> {
        let mut statement = conn.prepare(
            "SELECT record_id, record_type, operation, pending_since, attempts,
                    last_error, next_retry_at, payload
             FROM sync_queue
             ORDER BY pending_since ASC",
        )?;
        let rows = statement
            .query_map([], Self::parse_queue_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter().map(queue_entry_from_row).collect()
    }

    fn store_queue_entry(conn: &Connection, entry: &SyncQueueEntry) -> Result<()> {
        let row = entry.to_storage_format();
        conn.execute(
            "INSERT INTO sync_queue
                 (record_id, record_type, operation, pending_since, attempts,
                  last_error, next_retry_at, payload)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(record_id) DO UPDATE SET
                 record_type = excluded.record_type,
                 operation = excluded.operation,
                 pending_since = excluded.pending_since,
                 attempts = excluded.attempts,
                 last_error = excluded.last_error,
                 next_retry_at = excluded.next_retry_at,
                 payload = excluded.payload",
            params![
                row.record_id,
                row.record_type,
                row.operation,
                row.pending_since,
                row.attempts,
                row.last_error,
                row.next_retry_at,
                row.payload,
            ],
        )?;
        Ok(())
    }

    fn session_account(conn: &Connection) -> Result<Option<Account>> {
        let row = conn
            .query_row(
                "SELECT a.id, a.email, a.is_anonymous, a.created_at
                 FROM session s JOIN accounts a ON a.id = s.account_id
                 WHERE s.id = 1",
                [],
                |row| {
                    Ok(Account {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        is_anonymous: row.get::<_, i32>(2)? != 0,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn set_session(conn: &Connection, account_id: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO session (id, account_id) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET account_id = excluded.account_id",
            params![account_id],
        )?;
        Ok(())
    }

    async fn notify_scope(&self, owner_id: Option<&str>) {
        let records = {
            let conn = self.conn.lock().await;
            Self::list_scope(&conn, owner_id)
        };
        match records {
            Ok(records) => self.record_subscribers.notify(owner_id, &records),
            Err(error) => tracing::warn!("Failed to load scope for subscribers: {error}"),
        }
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn create_record(&self, record: &Record) -> Result<Record> {
        let mut acknowledged = record.clone();
        if acknowledged.id.is_temporary() {
            acknowledged.id = RecordId::new();
        }
        let mut row = acknowledged.to_storage_format();
        row.sync_status = StoredSyncStatus::Synced;

        {
            let conn = self.conn.lock().await;
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO records
                         (id, name, owner_id, created_at, updated_at, sync_status)
                     VALUES (?, ?, ?, ?, ?, ?)",
                    params![
                        row.id,
                        row.name,
                        row.owner_id,
                        row.created_at,
                        row.updated_at,
                        row.sync_status.as_str(),
                    ],
                )
                .map_err(|e| Error::from(e).during("create record"))?;
            if inserted == 0 {
                return Err(Error::AlreadyExists(row.id));
            }
        }

        self.notify_scope(record.owner_id.as_deref()).await;
        Record::from_storage_format(&row)
    }

    async fn list_records(&self, owner_id: Option<&str>) -> Result<Vec<Record>> {
        let conn = self.conn.lock().await;
        Self::list_scope(&conn, owner_id).map_err(|e| e.during("list records"))
    }

    async fn update_record(&self, id: &str, patch: &RecordPatch) -> Result<Record> {
        if patch.is_empty() {
            return Err(Error::validation("patch", "no fields to update"));
        }
        if patch.deleted == Some(true) {
            return Err(Error::validation(
                "deleted",
                "deletions go through delete_record",
            ));
        }

        let (updated, owner) = {
            let conn = self.conn.lock().await;
            let existing = Self::fetch_record(&conn, id)
                .map_err(|e| e.during("update record"))?
                .ok_or_else(|| Error::NotFound(id.to_string()))?;

            if let Some(expected) = patch.expected_updated_at {
                if existing.updated_at != expected {
                    return Err(Error::Conflict {
                        record_id: id.to_string(),
                        remote: serde_json::to_value(existing.to_storage_format())?,
                    });
                }
            }

            let name = match &patch.name {
                Some(raw) => crate::models::sanitize_name(raw)?,
                None => existing.name.clone(),
            };
            let now = unix_timestamp_ms().max(existing.updated_at + 1);
            let mut row = existing.to_storage_format();
            row.name = name;
            row.updated_at = chrono::DateTime::from_timestamp_millis(now)
                .unwrap_or_default()
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            row.sync_status = StoredSyncStatus::Synced;

            conn.execute(
                "UPDATE records SET name = ?, updated_at = ?, sync_status = ? WHERE id = ?",
                params![row.name, row.updated_at, row.sync_status.as_str(), id],
            )
            .map_err(|e| Error::from(e).during("update record"))?;
            (Record::from_storage_format(&row)?, existing.owner_id)
        };

        self.notify_scope(owner.as_deref()).await;
        Ok(updated)
    }

    async fn delete_record(&self, id: &str) -> Result<()> {
        let owner = {
            let conn = self.conn.lock().await;
            let existing = Self::fetch_record(&conn, id)
                .map_err(|e| e.during("delete record"))?
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            conn.execute("DELETE FROM records WHERE id = ?", params![id])
                .map_err(|e| Error::from(e).during("delete record"))?;
            existing.owner_id
        };
        self.notify_scope(owner.as_deref()).await;
        Ok(())
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Account> {
        let email = validate_email(email)?;
        validate_password(password)?;

        let account = {
            let conn = self.conn.lock().await;
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM accounts WHERE email = ?",
                    params![email],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            if exists {
                return Err(Error::AlreadyExists(email));
            }

            let account = Account::registered(uuid::Uuid::new_v4().to_string(), email);
            let salt = generate_salt();
            let digest = digest_password(password, &salt);
            conn.execute(
                "INSERT INTO accounts (id, email, password_digest, salt, is_anonymous, created_at)
                 VALUES (?, ?, ?, ?, 0, ?)",
                params![account.id, account.email, digest, salt, account.created_at],
            )?;
            Self::set_session(&conn, &account.id)?;
            account
        };

        self.auth_subscribers.notify(Some(&account));
        Ok(account)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Account> {
        let email = validate_email(email)?;
        validate_password(password)?;

        let account = {
            let conn = self.conn.lock().await;
            let row = conn
                .query_row(
                    "SELECT id, password_digest, salt, created_at
                     FROM accounts WHERE email = ? AND is_anonymous = 0",
                    params![email],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?;

            let Some((id, stored_digest, salt, created_at)) = row else {
                return Err(Error::validation("credentials", "invalid email or password"));
            };
            if digest_password(password, &salt) != stored_digest {
                return Err(Error::validation("credentials", "invalid email or password"));
            }

            Self::set_session(&conn, &id)?;
            Account {
                id,
                email: Some(email),
                is_anonymous: false,
                created_at,
            }
        };

        self.auth_subscribers.notify(Some(&account));
        Ok(account)
    }

    async fn sign_in_anonymously(&self) -> Result<Account> {
        // The local backend is itself the offline fallback; no remote attempt
        // or timeout applies here.
        let account = Account::anonymous(uuid::Uuid::new_v4().to_string());
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "INSERT INTO accounts (id, email, password_digest, salt, is_anonymous, created_at)
                 VALUES (?, NULL, NULL, NULL, 1, ?)",
                params![account.id, account.created_at],
            )?;
            Self::set_session(&conn, &account.id)?;
        }
        self.auth_subscribers.notify(Some(&account));
        Ok(account)
    }

    async fn current_account(&self) -> Result<Option<Account>> {
        let conn = self.conn.lock().await;
        Self::session_account(&conn)
    }

    async fn sign_out(&self) -> Result<()> {
        {
            let conn = self.conn.lock().await;
            conn.execute("DELETE FROM session WHERE id = 1", [])?;
        }
        self.auth_subscribers.notify(None);
        Ok(())
    }

    async fn put_queue_entry(&self, entry: &SyncQueueEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::store_queue_entry(&conn, entry)
    }

    async fn pending_queue_entries(&self) -> Result<Vec<SyncQueueEntry>> {
        let entries = {
            let conn = self.conn.lock().await;
            Self::load_queue(&conn)?
        };
        Ok(select_ready_work(&entries, unix_timestamp_ms()))
    }

    async fn all_queue_entries(&self) -> Result<Vec<SyncQueueEntry>> {
        let conn = self.conn.lock().await;
        Self::load_queue(&conn)
    }

    async fn mark_complete(&self, record_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM sync_queue WHERE record_id = ?",
            params![record_id],
        )?;
        Ok(())
    }

    async fn mark_error(&self, record_id: &str, message: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let existing = Self::load_queue(&conn)?
            .into_iter()
            .find(|entry| entry.record_id == record_id);

        let entry = match existing {
            Some(entry) if entry.is_permanently_failed() => {
                // Retained for diagnostics; only refresh the message.
                SyncQueueEntry {
                    last_error: Some(message.to_string()),
                    ..entry
                }
            }
            Some(entry) => entry.record_failure(message, unix_timestamp_ms())?,
            None => SyncQueueEntry::enqueue(record_id, "record", SyncOperation::Update, None)?
                .record_failure(message, unix_timestamp_ms())?,
        };
        Self::store_queue_entry(&conn, &entry)
    }

    async fn reset_queue_entry(&self, record_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let entry = Self::load_queue(&conn)?
            .into_iter()
            .find(|entry| entry.record_id == record_id)
            .ok_or_else(|| Error::NotFound(record_id.to_string()))?;
        Self::store_queue_entry(&conn, &entry.reset())
    }

    fn subscribe_to_records(
        &self,
        owner_id: Option<&str>,
        callback: RecordsCallback,
    ) -> Subscription {
        self.record_subscribers.subscribe(owner_id, callback)
    }

    fn subscribe_to_auth_state(&self, callback: AuthCallback) -> Subscription {
        self.auth_subscribers.subscribe(callback)
    }
}

fn queue_entry_from_row(row: &StoredQueueEntry) -> Result<SyncQueueEntry> {
    Ok(SyncQueueEntry {
        record_id: row.record_id.clone(),
        record_type: row.record_type.clone(),
        operation: SyncOperation::from_str(&row.operation)?,
        pending_since: parse_rfc3339_ms(&row.pending_since)?,
        attempts: row.attempts,
        last_error: row.last_error.clone(),
        next_retry_at: row.next_retry_at.as_deref().map(parse_rfc3339_ms).transpose()?,
        payload: row.payload.clone(),
    })
}

fn parse_rfc3339_ms(value: &str) -> Result<i64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| Error::validation("timestamp", format!("{value}: {e}")))
}

fn validate_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(Error::validation("email", "must be a valid email address"));
    }
    Ok(email)
}

fn validate_password(password: &str) -> Result<()> {
    if password.trim().is_empty() {
        return Err(Error::validation("password", "must not be empty"));
    }
    Ok(())
}

fn generate_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn digest_password(password: &str, salt: &str) -> String {
    let mut hasher = Blake2b512::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

mod migrations {
    //! Versioned schema migrations

    use rusqlite::Connection;

    use super::CURRENT_VERSION;
    use crate::error::Result;

    /// Run all pending migrations
    pub fn run(conn: &Connection) -> Result<()> {
        let version = get_version(conn)?;
        if version < 1 {
            migrate_v1(conn)?;
        }
        if version < 2 {
            migrate_v2(conn)?;
        }
        Ok(())
    }

    /// Get the current schema version
    pub fn get_version(conn: &Connection) -> Result<i32> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            [],
            |row| row.get::<_, i32>(0).map(|v| v != 0),
        )?;
        if !exists {
            return Ok(0);
        }
        let version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// Migration to version 1: records and sync queue
    fn migrate_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "BEGIN;
             CREATE TABLE IF NOT EXISTS schema_version (
                 version INTEGER PRIMARY KEY
             );
             CREATE TABLE IF NOT EXISTS records (
                 id TEXT PRIMARY KEY,
                 name TEXT NOT NULL,
                 owner_id TEXT,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL,
                 sync_status TEXT NOT NULL DEFAULT 'pending'
             );
             CREATE INDEX IF NOT EXISTS idx_records_owner ON records(owner_id);
             CREATE INDEX IF NOT EXISTS idx_records_updated ON records(updated_at DESC);
             CREATE TABLE IF NOT EXISTS sync_queue (
                 record_id TEXT PRIMARY KEY,
                 record_type TEXT NOT NULL,
                 operation TEXT NOT NULL,
                 pending_since TEXT NOT NULL,
                 attempts INTEGER NOT NULL DEFAULT 0,
                 last_error TEXT,
                 next_retry_at TEXT,
                 payload TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_sync_queue_pending ON sync_queue(pending_since ASC);
             INSERT INTO schema_version (version) VALUES (1);
             COMMIT;",
        )?;
        tracing::info!("Migrated database to version 1");
        Ok(())
    }

    /// Migration to version 2: local accounts and session
    fn migrate_v2(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "BEGIN;
             CREATE TABLE IF NOT EXISTS accounts (
                 id TEXT PRIMARY KEY,
                 email TEXT UNIQUE,
                 password_digest TEXT,
                 salt TEXT,
                 is_anonymous INTEGER NOT NULL DEFAULT 0,
                 created_at INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS session (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 account_id TEXT NOT NULL REFERENCES accounts(id)
             );
             INSERT INTO schema_version (version) VALUES (2);
             COMMIT;",
        )?;
        tracing::info!("Migrated database to version {CURRENT_VERSION}");
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncStatusKind;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn setup() -> SqliteBackend {
        SqliteBackend::open_in_memory().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_assigns_permanent_id() {
        let backend = setup().await;
        let local = Record::create("Push-ups", None).unwrap();
        assert!(local.id.is_temporary());

        let acknowledged = backend.create_record(&local).await.unwrap();
        assert!(!acknowledged.id.is_temporary());
        assert_eq!(acknowledged.name, "Push-ups");
        assert_eq!(acknowledged.sync.status, SyncStatusKind::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_preserves_permanent_ids_and_rejects_duplicates() {
        let backend = setup().await;
        let mut record = Record::create("Squats", None).unwrap();
        record.id = RecordId::new();

        let stored = backend.create_record(&record).await.unwrap();
        assert_eq!(stored.id, record.id);

        let err = backend.create_record(&record).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn list_partitions_scopes_disjointly() {
        let backend = setup().await;
        let anon = Record::create("Anonymous work", None).unwrap();
        let owned = Record::create("Owned work", Some("owner-1".to_string())).unwrap();
        backend.create_record(&anon).await.unwrap();
        backend.create_record(&owned).await.unwrap();

        let anon_scope = backend.list_records(None).await.unwrap();
        let owner_scope = backend.list_records(Some("owner-1")).await.unwrap();

        assert_eq!(anon_scope.len(), 1);
        assert_eq!(anon_scope[0].name, "Anonymous work");
        assert_eq!(owner_scope.len(), 1);
        assert_eq!(owner_scope[0].name, "Owned work");

        // No record appears in both partitions
        let anon_ids: Vec<_> = anon_scope.iter().map(|r| r.id.clone()).collect();
        assert!(owner_scope.iter().all(|r| !anon_ids.contains(&r.id)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_missing_record_is_not_found() {
        let backend = setup().await;
        let err = backend
            .update_record("missing", &RecordPatch::rename("New name"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_with_stale_guard_is_a_conflict() {
        let backend = setup().await;
        let stored = backend
            .create_record(&Record::create("Rows", None).unwrap())
            .await
            .unwrap();

        let stale = RecordPatch {
            name: Some("Cable rows".to_string()),
            expected_updated_at: Some(stored.updated_at - 1),
            ..RecordPatch::default()
        };
        let err = backend
            .update_record(stored.id.as_str(), &stale)
            .await
            .unwrap_err();
        match err {
            Error::Conflict { record_id, remote } => {
                assert_eq!(record_id, stored.id.as_str());
                assert_eq!(remote["name"], "Rows");
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        let fresh = RecordPatch {
            name: Some("Cable rows".to_string()),
            expected_updated_at: Some(stored.updated_at),
            ..RecordPatch::default()
        };
        let updated = backend.update_record(stored.id.as_str(), &fresh).await.unwrap();
        assert_eq!(updated.name, "Cable rows");
        assert!(updated.updated_at > stored.updated_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_rejects_tombstone_patches() {
        let backend = setup().await;
        let stored = backend
            .create_record(&Record::create("Shrugs", None).unwrap())
            .await
            .unwrap();

        let err = backend
            .update_record(stored.id.as_str(), &RecordPatch::tombstone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "deleted", .. }));

        // The record is untouched; removal goes through delete_record
        let listed = backend.list_records(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].updated_at, stored.updated_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_distinguishes_not_found() {
        let backend = setup().await;
        let stored = backend
            .create_record(&Record::create("Dips", None).unwrap())
            .await
            .unwrap();

        backend.delete_record(stored.id.as_str()).await.unwrap();
        let err = backend.delete_record(stored.id.as_str()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sign_up_and_sign_in_roundtrip() {
        let backend = setup().await;
        let created = backend.sign_up("user@example.com", "hunter2").await.unwrap();
        assert!(!created.is_anonymous);

        let session = backend.current_account().await.unwrap().unwrap();
        assert_eq!(session.id, created.id);

        backend.sign_out().await.unwrap();
        assert!(backend.current_account().await.unwrap().is_none());

        let signed_in = backend.sign_in("user@example.com", "hunter2").await.unwrap();
        assert_eq!(signed_in.id, created.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sign_in_rejects_bad_password() {
        let backend = setup().await;
        backend.sign_up("user@example.com", "hunter2").await.unwrap();
        let err = backend.sign_in("user@example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, Error::Validation { field: "credentials", .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_sign_up_is_rejected() {
        let backend = setup().await;
        backend.sign_up("user@example.com", "hunter2").await.unwrap();
        let err = backend.sign_up("user@example.com", "other").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn anonymous_sign_in_creates_session() {
        let backend = setup().await;
        let account = backend.sign_in_anonymously().await.unwrap();
        assert!(account.is_anonymous);
        assert!(account.email.is_none());

        let session = backend.current_account().await.unwrap().unwrap();
        assert_eq!(session.id, account.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mark_error_creates_missing_entry() {
        let backend = setup().await;
        backend.mark_error("record-1", "connection reset").await.unwrap();

        let entries = backend.all_queue_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record_id, "record-1");
        assert_eq!(entries[0].attempts, 1);
        assert_eq!(entries[0].last_error.as_deref(), Some("connection reset"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mark_complete_removes_entry() {
        let backend = setup().await;
        let entry =
            SyncQueueEntry::enqueue("record-1", "record", SyncOperation::Create, None).unwrap();
        backend.put_queue_entry(&entry).await.unwrap();
        assert_eq!(backend.all_queue_entries().await.unwrap().len(), 1);

        backend.mark_complete("record-1").await.unwrap();
        assert!(backend.all_queue_entries().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_entries_exclude_backed_off_work() {
        let backend = setup().await;
        let fresh =
            SyncQueueEntry::enqueue("record-1", "record", SyncOperation::Create, None).unwrap();
        let mut waiting =
            SyncQueueEntry::enqueue("record-2", "record", SyncOperation::Update, None).unwrap();
        waiting = waiting
            .record_failure("boom", unix_timestamp_ms() + 600_000)
            .unwrap();

        backend.put_queue_entry(&fresh).await.unwrap();
        backend.put_queue_entry(&waiting).await.unwrap();

        let pending = backend.pending_queue_entries().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record_id, "record-1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reset_queue_entry_restarts_cycle() {
        let backend = setup().await;
        let mut entry =
            SyncQueueEntry::enqueue("record-1", "record", SyncOperation::Update, None).unwrap();
        for _ in 0..crate::models::MAX_ATTEMPTS {
            entry = entry.record_failure("boom", 0).unwrap();
        }
        backend.put_queue_entry(&entry).await.unwrap();
        assert!(backend.pending_queue_entries().await.unwrap().is_empty());

        backend.reset_queue_entry("record-1").await.unwrap();
        let pending = backend.pending_queue_entries().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn record_subscribers_receive_full_scope_set() {
        let backend = setup().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let subscription = backend.subscribe_to_records(
            None,
            Arc::new(move |records| {
                assert!(records.iter().all(|r| r.owner_id.is_none()));
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        backend
            .create_record(&Record::create("Push-ups", None).unwrap())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        subscription.unsubscribe();
        backend
            .create_record(&Record::create("Squats", None).unwrap())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
