//! Optimistic-mutation reconciliation engine
//!
//! Every mutation lands in the in-memory store first and is visible to the
//! interactive surface immediately; a queue entry describes the work still
//! owed to the backend. The background drain executes ready entries one at a
//! time, gated by the connectivity signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::models::{
    Record, RecordId, RecordPatch, StoredRecord, SyncOperation, SyncQueueEntry, SyncStatus,
    SyncStatusKind,
};
use crate::sync::connectivity::ConnectionState;
use crate::sync::merge::{MergeOutcome, MergeStrategy};

const RECORD_TYPE: &str = "record";

/// In-memory arena keyed by a stable local id.
///
/// When the backend acknowledges a create, the record's id is updated in
/// place and the backend-assigned id is recorded as an alias; the map is
/// never re-keyed, so references held by subscribers stay valid throughout.
#[derive(Default)]
struct RecordStore {
    records: HashMap<String, Record>,
    /// backend-assigned id -> local key
    aliases: HashMap<String, String>,
}

impl RecordStore {
    fn resolve(&self, id: &str) -> Option<String> {
        if self.records.contains_key(id) {
            return Some(id.to_string());
        }
        self.aliases.get(id).cloned()
    }

    fn get(&self, id: &str) -> Option<&Record> {
        let key = self.resolve(id)?;
        self.records.get(&key)
    }

    fn insert(&mut self, record: Record) {
        let key = record.id.as_str().to_string();
        self.put(&key, record);
    }

    /// Write a record under its stable local key, keeping the alias map in
    /// step when the record carries a backend-assigned id.
    fn put(&mut self, key: &str, record: Record) {
        if !record.id.is_temporary() && record.id.as_str() != key {
            self.aliases
                .insert(record.id.as_str().to_string(), key.to_string());
        }
        self.records.insert(key.to_string(), record);
    }

    fn remove(&mut self, id: &str) -> Option<Record> {
        let key = self.resolve(id)?;
        self.aliases.retain(|_, local| *local != key);
        self.records.remove(&key)
    }

    fn scope(&self, owner_id: Option<&str>) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .records
            .values()
            .filter(|record| record.owner_id.as_deref() == owner_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records
    }

    fn clear(&mut self) {
        self.records.clear();
        self.aliases.clear();
    }
}

/// Outcome of one background drain cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCycleReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub conflicts: usize,
    /// True when the cycle was skipped because the device is offline
    pub skipped_offline: bool,
}

/// Coordinates the in-memory store, the sync queue, and the active backend
pub struct SyncEngine {
    backend: Arc<dyn Backend>,
    store: Mutex<RecordStore>,
    /// Held for the whole of a drain cycle so cycles never interleave
    drain: Mutex<()>,
    connectivity: watch::Receiver<ConnectionState>,
    merge_strategy: MergeStrategy,
    /// Monotonic count of queue submissions; basis for progress indicators
    enqueued: AtomicU64,
    completed: AtomicU64,
}

impl SyncEngine {
    pub fn new(
        backend: Arc<dyn Backend>,
        connectivity: watch::Receiver<ConnectionState>,
        merge_strategy: MergeStrategy,
    ) -> Self {
        Self {
            backend,
            store: Mutex::new(RecordStore::default()),
            drain: Mutex::new(()),
            connectivity,
            merge_strategy,
            enqueued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Mutations enqueued but not yet acknowledged.
    pub fn pending_changes(&self) -> u64 {
        self.enqueued
            .load(Ordering::SeqCst)
            .saturating_sub(self.completed.load(Ordering::SeqCst))
    }

    /// Create a record optimistically and owe the backend a create.
    pub async fn create_record(&self, name: &str, owner_id: Option<String>) -> Result<Record> {
        let record = Record::create(name, owner_id)?;

        // Pre-assign the permanent id in the payload so a replayed create
        // after a lost acknowledgment is recognized as a duplicate instead
        // of inserting a second copy.
        let mut row = record.to_storage_format();
        row.id = RecordId::new().as_str().to_string();
        let entry = SyncQueueEntry::enqueue(
            record.id.as_str(),
            RECORD_TYPE,
            SyncOperation::Create,
            Some(serde_json::to_string(&row)?),
        )?;

        // Queue first: a record must never sit in the store without the
        // queue entry that will eventually push it.
        let mut store = self.store.lock().await;
        self.backend.put_queue_entry(&entry).await?;
        store.insert(record.clone());
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    /// Apply a patch optimistically. A no-op patch changes nothing and owes
    /// the backend nothing.
    pub async fn update_record(&self, id: &str, patch: &RecordPatch) -> Result<Record> {
        let mut store = self.store.lock().await;
        let key = store
            .resolve(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let current = store
            .records
            .get(&key)
            .ok_or_else(|| Error::NotFound(id.to_string()))?
            .clone();
        if current.deleted {
            return Err(Error::NotFound(id.to_string()));
        }

        let updated = current.apply(patch)?;
        if updated == current {
            return Ok(updated);
        }

        // The compare-and-set base is the remote version this client last
        // saw; only meaningful once the record has synced at least once.
        let base_updated_at = match current.sync.status {
            SyncStatusKind::Synced => Some(current.updated_at),
            _ => None,
        };

        // A patch that sets the tombstone is a deletion; the backends
        // reject it on the update path.
        let operation = if updated.deleted {
            SyncOperation::Delete
        } else {
            SyncOperation::Update
        };

        self.enqueue_coalesced(&updated, operation, base_updated_at)
            .await?;
        store.put(&key, updated.clone());
        Ok(updated)
    }

    /// Tombstone a record. The entry leaves the store only after the delete
    /// is acknowledged; a never-synced record cancels out immediately.
    pub async fn delete_record(&self, id: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        let key = store
            .resolve(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let current = store
            .records
            .get(&key)
            .ok_or_else(|| Error::NotFound(id.to_string()))?
            .clone();

        let pending_create = self
            .find_queue_entry(current.id.as_str())
            .await?
            .is_some_and(|entry| entry.operation == SyncOperation::Create);
        if pending_create {
            // Never reached the backend; nothing to delete remotely.
            self.backend.mark_complete(current.id.as_str()).await?;
            store.remove(&key);
            self.completed.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let tombstoned = current.mark_deleted()?;
        self.enqueue_coalesced(&tombstoned, SyncOperation::Delete, None)
            .await?;
        store.put(&key, tombstoned);
        Ok(())
    }

    /// The current result set for one owner scope, tombstones included
    /// until their deletion is acknowledged.
    pub async fn list_records(&self, owner_id: Option<&str>) -> Vec<Record> {
        self.store.lock().await.scope(owner_id)
    }

    pub async fn get_record(&self, id: &str) -> Option<Record> {
        self.store.lock().await.get(id).cloned()
    }

    /// Replace the local snapshot for a scope with a remotely pushed one.
    ///
    /// Locally pending mutations are resolved only through the retry path,
    /// never here: records still owing the backend work keep their local
    /// state, everything else in the scope is replaced wholesale.
    pub async fn apply_remote_snapshot(&self, owner_id: Option<&str>, remote: Vec<Record>) {
        let mut store = self.store.lock().await;

        // Records still owing backend work survive under their stable keys
        let retained: Vec<(String, Record)> = store
            .records
            .iter()
            .filter(|(_, record)| {
                record.owner_id.as_deref() == owner_id
                    && record.sync.status != SyncStatusKind::Synced
            })
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();

        for record in store.scope(owner_id) {
            store.remove(record.id.as_str());
        }
        for record in remote {
            if !retained.iter().any(|(_, kept)| kept.id == record.id) {
                store.insert(record);
            }
        }
        for (key, record) in retained {
            store.put(&key, record);
        }
    }

    /// Drain ready queue entries serially against the backend.
    ///
    /// Transport failures never escape to the caller; they are captured into
    /// the record's sync status and the queue entry's error field.
    pub async fn run_sync_cycle(&self) -> Result<SyncCycleReport> {
        let _cycle = self.drain.lock().await;
        let mut report = SyncCycleReport::default();
        if !self.connectivity.borrow().allows_sync() {
            tracing::debug!("Skipping sync cycle: offline");
            report.skipped_offline = true;
            return Ok(report);
        }

        let entries = self.backend.pending_queue_entries().await?;
        for entry in entries {
            report.processed += 1;
            match self.process_entry(&entry).await? {
                EntryOutcome::Succeeded => report.succeeded += 1,
                EntryOutcome::Failed => report.failed += 1,
                EntryOutcome::Conflicted => report.conflicts += 1,
                EntryOutcome::Skipped => {}
            }
        }
        if report.processed > 0 {
            tracing::info!(
                "Sync cycle: {} processed, {} succeeded, {} failed, {} conflicts",
                report.processed,
                report.succeeded,
                report.failed,
                report.conflicts
            );
        }
        Ok(report)
    }

    /// Resolve a record in conflict using the configured strategy.
    ///
    /// `ManualResolution` leaves the record untouched and reports that an
    /// explicit caller decision is needed.
    pub async fn resolve_conflict(&self, id: &str) -> Result<MergeOutcome> {
        let mut store = self.store.lock().await;
        let key = store
            .resolve(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let local = store
            .records
            .get(&key)
            .ok_or_else(|| Error::NotFound(id.to_string()))?
            .clone();
        if local.sync.status != SyncStatusKind::Conflict {
            return Err(Error::validation("status", "record is not in conflict"));
        }

        let snapshot = local.sync.conflict_version.clone().ok_or_else(|| {
            Error::validation("conflict_version", "conflict without a remote snapshot")
        })?;
        let remote_row: StoredRecord = serde_json::from_value(snapshot)?;
        let remote = Record::from_storage_format(&remote_row)?;

        match self.merge_strategy.resolve(&local, &remote)? {
            MergeOutcome::Resolved(merged) => {
                let mut resolved = merged;
                resolved.sync = local.sync.transition(SyncStatusKind::Pending)?;
                store.put(&key, resolved.clone());
                self.enqueue_coalesced(&resolved, SyncOperation::Update, Some(remote.updated_at))
                    .await?;
                Ok(MergeOutcome::Resolved(resolved))
            }
            MergeOutcome::NeedsManual => Ok(MergeOutcome::NeedsManual),
        }
    }

    /// Caller-initiated retry of a permanently failed record.
    pub async fn retry_failed(&self, id: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        let key = store
            .resolve(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let record = store
            .records
            .get(&key)
            .ok_or_else(|| Error::NotFound(id.to_string()))?
            .clone();

        self.backend.reset_queue_entry(record.id.as_str()).await?;
        let mut reset = record;
        reset.sync = reset.sync.reset()?;
        store.put(&key, reset);
        Ok(())
    }

    /// Sign out and drop every trace of the previous identity: the store,
    /// the counters, and all accumulated error state.
    pub async fn sign_out(&self) -> Result<()> {
        self.backend.sign_out().await?;
        let mut store = self.store.lock().await;
        store.clear();
        self.enqueued.store(0, Ordering::SeqCst);
        self.completed.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn find_queue_entry(&self, record_id: &str) -> Result<Option<SyncQueueEntry>> {
        Ok(self
            .backend
            .all_queue_entries()
            .await?
            .into_iter()
            .find(|entry| entry.record_id == record_id))
    }

    /// Keep at most one queue entry per record id while preserving
    /// same-record submission order.
    ///
    /// The pending counter tracks outstanding queue entries, so replacing
    /// an existing entry does not increment it.
    async fn enqueue_coalesced(
        &self,
        record: &Record,
        operation: SyncOperation,
        base_updated_at: Option<i64>,
    ) -> Result<()> {
        let existing = self.find_queue_entry(record.id.as_str()).await?;
        let replaces_existing = existing.is_some();

        let entry = match (existing, operation) {
            // An unacknowledged create absorbs later edits: refresh the
            // payload row, keep the pre-assigned permanent id.
            (Some(prior), SyncOperation::Update)
                if prior.operation == SyncOperation::Create =>
            {
                let mut row: StoredRecord = prior
                    .payload
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?
                    .unwrap_or_else(|| record.to_storage_format());
                let fresh = record.to_storage_format();
                row.name = fresh.name;
                row.updated_at = fresh.updated_at;
                SyncQueueEntry {
                    payload: Some(serde_json::to_string(&row)?),
                    ..prior.reset()
                }
            }
            (_, SyncOperation::Update) => {
                let patch = RecordPatch {
                    name: Some(record.name.clone()),
                    deleted: Some(record.deleted),
                    expected_updated_at: base_updated_at,
                };
                SyncQueueEntry::enqueue(
                    record.id.as_str(),
                    RECORD_TYPE,
                    SyncOperation::Update,
                    Some(serde_json::to_string(&patch)?),
                )?
            }
            (_, SyncOperation::Delete) => SyncQueueEntry::enqueue(
                record.id.as_str(),
                RECORD_TYPE,
                SyncOperation::Delete,
                None,
            )?,
            (_, SyncOperation::Create) => SyncQueueEntry::enqueue(
                record.id.as_str(),
                RECORD_TYPE,
                SyncOperation::Create,
                Some(serde_json::to_string(&record.to_storage_format())?),
            )?,
        };

        self.backend.put_queue_entry(&entry).await?;
        if !replaces_existing {
            self.enqueued.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn process_entry(&self, entry: &SyncQueueEntry) -> Result<EntryOutcome> {
        // Mark the attempt under the lock, then release it for the network
        // round trip so interactive mutations never wait on the backend.
        let (key, syncing) = {
            let mut store = self.store.lock().await;
            let Some(key) = store.resolve(&entry.record_id) else {
                // Orphaned entry; nothing local to reconcile.
                tracing::warn!("Dropping queue entry for unknown record {}", entry.record_id);
                self.backend.mark_complete(&entry.record_id).await?;
                return Ok(EntryOutcome::Skipped);
            };
            let record = store
                .records
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::NotFound(entry.record_id.clone()))?;

            // Conflicted records wait for an explicit merge.
            if record.sync.status == SyncStatusKind::Conflict {
                return Ok(EntryOutcome::Skipped);
            }

            let mut syncing = record.clone();
            syncing.sync = match record.sync.status {
                SyncStatusKind::Pending => record.sync.transition(SyncStatusKind::Syncing)?,
                // Retry path: failed -> pending -> syncing
                SyncStatusKind::Failed => record
                    .sync
                    .transition(SyncStatusKind::Pending)?
                    .transition(SyncStatusKind::Syncing)?,
                _ => record.sync.transition(SyncStatusKind::Syncing)?,
            };
            store.put(&key, syncing.clone());
            (key, syncing)
        };

        let result = self.execute_operation(entry, &syncing).await;

        // Settle under a fresh lock hold. The record may have been edited or
        // deleted while the request was in flight; reconcile against what is
        // in the store now, not the snapshot that was sent.
        let mut store = self.store.lock().await;
        let current = store.records.get(&key).cloned();
        match result {
            Ok(OperationOutcome::Acknowledged(acknowledged)) => match current {
                Some(current) if current.updated_at == syncing.updated_at => {
                    // The id swap and the status change land under one lock
                    // hold: the record is never observable under neither id.
                    let mut settled = current;
                    settled.id = acknowledged.id;
                    settled.name = acknowledged.name;
                    settled.updated_at = acknowledged.updated_at;
                    settled.sync = settled.sync.transition(SyncStatusKind::Synced)?;
                    store.put(&key, settled);
                    self.backend.mark_complete(&entry.record_id).await?;
                    self.completed.fetch_add(1, Ordering::SeqCst);
                    Ok(EntryOutcome::Succeeded)
                }
                Some(current) => {
                    // Edited mid-flight: the acknowledgment is already stale.
                    // Keep the local content under the backend-assigned id
                    // and owe the backend a follow-up.
                    let mut superseded = current;
                    superseded.id = acknowledged.id;
                    superseded.sync = superseded
                        .sync
                        .transition(SyncStatusKind::Synced)?
                        .transition(SyncStatusKind::Pending)?;
                    self.backend.mark_complete(&entry.record_id).await?;
                    self.completed.fetch_add(1, Ordering::SeqCst);
                    if superseded.deleted {
                        self.enqueue_coalesced(&superseded, SyncOperation::Delete, None)
                            .await?;
                    } else {
                        self.enqueue_coalesced(
                            &superseded,
                            SyncOperation::Update,
                            Some(acknowledged.updated_at),
                        )
                        .await?;
                    }
                    store.put(&key, superseded);
                    Ok(EntryOutcome::Succeeded)
                }
                None => {
                    // Deleted locally mid-flight. The cancellation path may
                    // already have dropped the queue entry; either way the
                    // backend now holds a copy nobody wants, so tombstone it
                    // and queue the delete.
                    if self.find_queue_entry(&entry.record_id).await?.is_some() {
                        self.backend.mark_complete(&entry.record_id).await?;
                        self.completed.fetch_add(1, Ordering::SeqCst);
                    }
                    let mut orphan = acknowledged;
                    orphan.deleted = true;
                    orphan.sync = SyncStatus::pending();
                    self.enqueue_coalesced(&orphan, SyncOperation::Delete, None)
                        .await?;
                    store.insert(orphan);
                    Ok(EntryOutcome::Succeeded)
                }
            },
            Ok(OperationOutcome::Removed) => {
                store.remove(&key);
                self.backend.mark_complete(&entry.record_id).await?;
                self.completed.fetch_add(1, Ordering::SeqCst);
                Ok(EntryOutcome::Succeeded)
            }
            Err(Error::Conflict { remote, .. }) => match current {
                Some(current) => {
                    let mut conflicted = current.clone();
                    conflicted.sync = current.sync.conflict(remote)?;
                    store.put(&key, conflicted);
                    self.backend.mark_complete(&entry.record_id).await?;
                    self.completed.fetch_add(1, Ordering::SeqCst);
                    Ok(EntryOutcome::Conflicted)
                }
                None => self.settle_vanished(&entry.record_id).await,
            },
            Err(Error::NotFound(_)) => match current {
                Some(current) => {
                    // Not retryable; surface on the record and drop the entry.
                    let mut missing = current.clone();
                    missing.sync = current.sync.fail("record not found at backend")?;
                    store.put(&key, missing);
                    self.backend.mark_complete(&entry.record_id).await?;
                    self.completed.fetch_add(1, Ordering::SeqCst);
                    Ok(EntryOutcome::Failed)
                }
                None => self.settle_vanished(&entry.record_id).await,
            },
            Err(error) if error.is_retryable() => match current {
                Some(current) => {
                    let message = error.to_string();
                    tracing::warn!(
                        "Sync attempt failed for record {}: {message}",
                        entry.record_id
                    );
                    let mut failed = current.clone();
                    failed.sync = current.sync.fail(&message)?;
                    store.put(&key, failed);
                    self.backend.mark_error(&entry.record_id, &message).await?;
                    Ok(EntryOutcome::Failed)
                }
                None => self.settle_vanished(&entry.record_id).await,
            },
            Err(error) => Err(error),
        }
    }

    /// Tidy up after a record that was removed locally while its attempt was
    /// in flight and the attempt left nothing behind at the backend.
    async fn settle_vanished(&self, record_id: &str) -> Result<EntryOutcome> {
        if self.find_queue_entry(record_id).await?.is_some() {
            self.backend.mark_complete(record_id).await?;
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(EntryOutcome::Skipped)
    }

    async fn execute_operation(
        &self,
        entry: &SyncQueueEntry,
        record: &Record,
    ) -> Result<OperationOutcome> {
        match entry.operation {
            SyncOperation::Create => {
                let row: StoredRecord = entry
                    .payload
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?
                    .unwrap_or_else(|| record.to_storage_format());
                let mut outgoing = Record::from_storage_format(&row)?;
                outgoing.owner_id = record.owner_id.clone();
                match self.backend.create_record(&outgoing).await {
                    Ok(acknowledged) => Ok(OperationOutcome::Acknowledged(acknowledged)),
                    // Replay after a lost acknowledgment: the backend already
                    // holds this exact record.
                    Err(Error::AlreadyExists(_)) => Ok(OperationOutcome::Acknowledged(outgoing)),
                    Err(error) => Err(error),
                }
            }
            SyncOperation::Update => {
                let patch: RecordPatch = entry
                    .payload
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?
                    .unwrap_or_else(|| RecordPatch::rename(record.name.clone()));
                let acknowledged = self
                    .backend
                    .update_record(entry.record_id.as_str(), &patch)
                    .await?;
                Ok(OperationOutcome::Acknowledged(acknowledged))
            }
            SyncOperation::Delete => {
                match self.backend.delete_record(entry.record_id.as_str()).await {
                    // Already gone remotely counts as acknowledged.
                    Ok(()) | Err(Error::NotFound(_)) => Ok(OperationOutcome::Removed),
                    Err(error) => Err(error),
                }
            }
        }
    }
}

enum OperationOutcome {
    Acknowledged(Record),
    Removed,
}

enum EntryOutcome {
    Succeeded,
    Failed,
    Conflicted,
    Skipped,
}
