//! Backend capability contract and concrete providers
//!
//! A backend is one interchangeable persistence/authentication provider:
//! record CRUD with strict owner-scope partitioning, credentialed and
//! anonymous auth, sync-queue introspection, and change subscriptions.
//! Exactly one concrete backend is selected at startup by
//! [`selector::BackendService`].

pub mod rest;
pub mod selector;
pub mod sqlite;

pub use rest::RestBackend;
pub use selector::BackendService;
pub use sqlite::SqliteBackend;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Account, Record, RecordPatch, SyncQueueEntry};

/// Callback invoked with the full current result set for its scope
pub type RecordsCallback = Arc<dyn Fn(Vec<Record>) + Send + Sync>;

/// Callback invoked with the current account on every auth-state change
pub type AuthCallback = Arc<dyn Fn(Option<Account>) + Send + Sync>;

/// Capability contract every concrete provider implements.
///
/// CRUD errors carry the operation name in their message (`Failed to create
/// record: ...`); `update`/`delete` fetch first so a missing record surfaces
/// as `NotFound` rather than a transport error.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Persist a new record. A duplicate id surfaces as `AlreadyExists`.
    async fn create_record(&self, record: &Record) -> Result<Record>;

    /// List records in one owner scope.
    ///
    /// The partition is strict: `None` returns only anonymous-scoped records
    /// (never a union of all records), `Some(owner)` only that owner's.
    async fn list_records(&self, owner_id: Option<&str>) -> Result<Vec<Record>>;

    /// Fetch-then-update; `patch.expected_updated_at` acts as a
    /// compare-and-set guard and a mismatch surfaces as `Conflict`. A patch
    /// requesting deletion is rejected with `Validation`; deletions go
    /// through [`Self::delete_record`].
    async fn update_record(&self, id: &str, patch: &RecordPatch) -> Result<Record>;

    /// Fetch-then-delete (physical removal of an acknowledged tombstone).
    async fn delete_record(&self, id: &str) -> Result<()>;

    async fn sign_up(&self, email: &str, password: &str) -> Result<Account>;
    async fn sign_in(&self, email: &str, password: &str) -> Result<Account>;

    /// Obtain an anonymous session.
    ///
    /// Remote providers attempt a real anonymous session under a 10 second
    /// bound and fall back to a locally synthesized identity on timeout or
    /// transport failure; see [`Account::local_fallback`] for the
    /// reconciliation caveat.
    async fn sign_in_anonymously(&self) -> Result<Account>;

    async fn current_account(&self) -> Result<Option<Account>>;
    async fn sign_out(&self) -> Result<()>;

    /// Upsert a queue entry (keyed by record id).
    async fn put_queue_entry(&self, entry: &SyncQueueEntry) -> Result<()>;

    /// Retry-eligible entries, priority-sorted for the drain loop.
    async fn pending_queue_entries(&self) -> Result<Vec<SyncQueueEntry>>;

    /// Every retained entry, including permanently failed ones (diagnostics).
    async fn all_queue_entries(&self) -> Result<Vec<SyncQueueEntry>>;

    /// Remove the entry for a record whose operation was acknowledged.
    async fn mark_complete(&self, record_id: &str) -> Result<()>;

    /// Record a failed attempt, creating the entry if none exists yet.
    async fn mark_error(&self, record_id: &str, message: &str) -> Result<()>;

    /// Caller-initiated manual retry of a (possibly permanently) failed entry.
    async fn reset_queue_entry(&self, record_id: &str) -> Result<()>;

    /// Subscribe to the record set of one owner scope. The callback receives
    /// the full current result set on every change in scope.
    fn subscribe_to_records(&self, owner_id: Option<&str>, callback: RecordsCallback)
        -> Subscription;

    /// Subscribe to auth-state changes.
    fn subscribe_to_auth_state(&self, callback: AuthCallback) -> Subscription;
}

/// Handle returned by `subscribe_*`; dropping it does NOT unsubscribe.
///
/// `unsubscribe` is idempotent and safe to call more than once.
pub struct Subscription {
    active: Arc<AtomicBool>,
    remove: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
    fn new(remove: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            active: Arc::new(AtomicBool::new(true)),
            remove: Box::new(remove),
        }
    }

    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            (self.remove)();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish()
    }
}

/// Record-change subscribers, keyed by subscription id, filtered by scope
#[derive(Default, Clone)]
pub(crate) struct RecordSubscribers {
    inner: Arc<Mutex<HashMap<u64, (Option<String>, RecordsCallback)>>>,
    next_id: Arc<AtomicU64>,
}

impl RecordSubscribers {
    pub(crate) fn subscribe(
        &self,
        owner_id: Option<&str>,
        callback: RecordsCallback,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .expect("record subscriber registry poisoned")
            .insert(id, (owner_id.map(str::to_string), callback));
        let registry = Arc::clone(&self.inner);
        Subscription::new(move || {
            registry
                .lock()
                .expect("record subscriber registry poisoned")
                .remove(&id);
        })
    }

    /// Invoke every subscriber whose scope matches, with the full set.
    pub(crate) fn notify(&self, owner_id: Option<&str>, records: &[Record]) {
        let callbacks: Vec<RecordsCallback> = self
            .inner
            .lock()
            .expect("record subscriber registry poisoned")
            .values()
            .filter(|(scope, _)| scope.as_deref() == owner_id)
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(records.to_vec());
        }
    }

    /// Scopes with at least one live subscriber.
    pub(crate) fn active_scopes(&self) -> Vec<Option<String>> {
        let mut scopes: Vec<Option<String>> = self
            .inner
            .lock()
            .expect("record subscriber registry poisoned")
            .values()
            .map(|(scope, _)| scope.clone())
            .collect();
        scopes.sort();
        scopes.dedup();
        scopes
    }
}

/// Auth-state subscribers
#[derive(Default, Clone)]
pub(crate) struct AuthSubscribers {
    inner: Arc<Mutex<HashMap<u64, AuthCallback>>>,
    next_id: Arc<AtomicU64>,
}

impl AuthSubscribers {
    pub(crate) fn subscribe(&self, callback: AuthCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .expect("auth subscriber registry poisoned")
            .insert(id, callback);
        let registry = Arc::clone(&self.inner);
        Subscription::new(move || {
            registry
                .lock()
                .expect("auth subscriber registry poisoned")
                .remove(&id);
        })
    }

    pub(crate) fn notify(&self, account: Option<&Account>) {
        let callbacks: Vec<AuthCallback> = self
            .inner
            .lock()
            .expect("auth subscriber registry poisoned")
            .values()
            .map(Arc::clone)
            .collect();
        for callback in callbacks {
            callback(account.cloned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Record;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn unsubscribe_is_idempotent() {
        let subscribers = RecordSubscribers::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let subscription = subscribers.subscribe(
            None,
            Arc::new(move |_records| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        subscribers.notify(None, &[]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        subscription.unsubscribe();
        subscription.unsubscribe(); // second call must be a no-op
        subscribers.notify(None, &[]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notify_filters_by_scope() {
        let subscribers = RecordSubscribers::default();
        let anon_calls = Arc::new(AtomicUsize::new(0));
        let owned_calls = Arc::new(AtomicUsize::new(0));

        let anon_seen = Arc::clone(&anon_calls);
        let _anon = subscribers.subscribe(
            None,
            Arc::new(move |_| {
                anon_seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let owned_seen = Arc::clone(&owned_calls);
        let _owned = subscribers.subscribe(
            Some("owner-1"),
            Arc::new(move |_| {
                owned_seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let record = Record::create("Push-ups", Some("owner-1".to_string())).unwrap();
        subscribers.notify(Some("owner-1"), &[record]);
        assert_eq!(anon_calls.load(Ordering::SeqCst), 0);
        assert_eq!(owned_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn active_scopes_deduplicates() {
        let subscribers = RecordSubscribers::default();
        let _a = subscribers.subscribe(None, Arc::new(|_| {}));
        let _b = subscribers.subscribe(None, Arc::new(|_| {}));
        let _c = subscribers.subscribe(Some("owner-1"), Arc::new(|_| {}));
        let scopes = subscribers.active_scopes();
        assert_eq!(scopes.len(), 2);
    }
}
