//! Per-record sync state machine

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Maximum retry attempts before a record is considered permanently failed
pub const MAX_RETRY_COUNT: u8 = 5;

/// Where a record sits in its sync lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatusKind {
    Pending,
    Syncing,
    Synced,
    Failed,
    Conflict,
}

impl SyncStatusKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
            Self::Conflict => "conflict",
        }
    }

    /// Forward transitions allowed by the lifecycle. Anything else is a
    /// programming error and is rejected loudly by [`SyncStatus::transition`].
    const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Syncing)
                | (Self::Syncing, Self::Synced | Self::Failed | Self::Conflict)
                | (Self::Synced | Self::Failed | Self::Conflict, Self::Pending)
        )
    }
}

impl fmt::Display for SyncStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync bookkeeping embedded in every record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub status: SyncStatusKind,
    /// Unix ms of the last sync attempt, successful or not
    pub last_sync_attempt: Option<i64>,
    /// Unix ms of the last successful sync
    pub last_sync_success: Option<i64>,
    /// Consecutive failed attempts, 0..=5
    pub retry_count: u8,
    pub error_message: Option<String>,
    /// Snapshot of the divergent remote value; present iff status is Conflict
    pub conflict_version: Option<serde_json::Value>,
}

impl SyncStatus {
    /// A freshly created, never-synced status.
    #[must_use]
    pub const fn pending() -> Self {
        Self {
            status: SyncStatusKind::Pending,
            last_sync_attempt: None,
            last_sync_success: None,
            retry_count: 0,
            error_message: None,
            conflict_version: None,
        }
    }

    /// Move to `next`, enforcing the transition table.
    ///
    /// Entering `Conflict` requires the divergent remote snapshot; leaving it
    /// clears the snapshot. Returning to `Pending` keeps the failure
    /// bookkeeping; only success or an explicit `reset` clears it.
    pub fn transition(&self, next: SyncStatusKind) -> Result<Self> {
        if !self.status.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        if next == SyncStatusKind::Conflict {
            return Err(Error::IllegalTransition {
                from: self.status.as_str(),
                to: "conflict without a remote snapshot",
            });
        }

        let mut updated = self.clone();
        updated.status = next;
        updated.conflict_version = None;
        match next {
            // Retry bookkeeping survives the failed -> pending -> syncing
            // cycle; it only clears on success or an explicit reset().
            SyncStatusKind::Pending => {}
            SyncStatusKind::Synced => {
                updated.retry_count = 0;
                updated.error_message = None;
                updated.last_sync_success = Some(crate::util::unix_timestamp_ms());
            }
            SyncStatusKind::Syncing => {
                updated.last_sync_attempt = Some(crate::util::unix_timestamp_ms());
            }
            SyncStatusKind::Failed | SyncStatusKind::Conflict => {}
        }
        Ok(updated)
    }

    /// Record a failed attempt: `Syncing -> Failed` with the error retained.
    pub fn fail(&self, message: impl Into<String>) -> Result<Self> {
        if !self.status.can_transition_to(SyncStatusKind::Failed) {
            return Err(Error::IllegalTransition {
                from: self.status.as_str(),
                to: SyncStatusKind::Failed.as_str(),
            });
        }
        let mut updated = self.clone();
        updated.status = SyncStatusKind::Failed;
        updated.retry_count = updated.retry_count.saturating_add(1).min(MAX_RETRY_COUNT);
        updated.error_message = Some(message.into());
        updated.conflict_version = None;
        Ok(updated)
    }

    /// Record a detected divergence: `Syncing -> Conflict` with the remote
    /// snapshot retained for the merge step.
    pub fn conflict(&self, remote_snapshot: serde_json::Value) -> Result<Self> {
        if !self.status.can_transition_to(SyncStatusKind::Conflict) {
            return Err(Error::IllegalTransition {
                from: self.status.as_str(),
                to: SyncStatusKind::Conflict.as_str(),
            });
        }
        let mut updated = self.clone();
        updated.status = SyncStatusKind::Conflict;
        updated.conflict_version = Some(remote_snapshot);
        Ok(updated)
    }

    /// True once the retry budget is exhausted.
    pub const fn is_permanently_failed(&self) -> bool {
        matches!(self.status, SyncStatusKind::Failed) && self.retry_count >= MAX_RETRY_COUNT
    }

    /// Caller-initiated manual retry: restart the cycle from scratch.
    pub fn reset(&self) -> Result<Self> {
        let mut updated = self.transition(SyncStatusKind::Pending)?;
        updated.retry_count = 0;
        updated.error_message = None;
        Ok(updated)
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::pending()
    }
}
