//! Data models for Tally

mod account;
mod queue;
mod record;
mod sync_status;

pub use account::Account;
pub use queue::{
    select_ready_work, StoredQueueEntry, SyncOperation, SyncQueueEntry, MAX_ATTEMPTS,
    RETRY_DELAYS_MS,
};
pub use record::{
    sanitize_name, Record, RecordId, RecordPatch, StoredRecord, StoredSyncStatus,
};
pub use sync_status::{SyncStatus, SyncStatusKind, MAX_RETRY_COUNT};
