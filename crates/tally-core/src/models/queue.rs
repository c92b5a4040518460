//! Durable sync queue entries and retry scheduling
//!
//! All scheduling functions take `now` explicitly so tests can drive the
//! clock; callers pass [`crate::util::unix_timestamp_ms`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::unix_timestamp_ms;

/// Attempt budget; entries at or past this are permanently failed
pub const MAX_ATTEMPTS: u8 = 5;

/// Backoff delays in milliseconds, indexed by attempts-so-far and clamped
/// to the last entry. No jitter: `next_retry_at` is the only scheduling
/// delay in the system.
pub const RETRY_DELAYS_MS: [i64; 5] = [1_000, 5_000, 30_000, 120_000, 600_000];

/// The operation a queue entry will replay against the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for SyncOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::validation(
                "operation",
                format!("unknown value: {other}"),
            )),
        }
    }
}

/// One pending create/update/delete awaiting execution against the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub record_id: String,
    pub record_type: String,
    pub operation: SyncOperation,
    /// Unix ms when the entry was first enqueued
    pub pending_since: i64,
    /// Failed attempts so far, 0..=5
    pub attempts: u8,
    pub last_error: Option<String>,
    /// Unix ms before which the entry is not retry-eligible
    pub next_retry_at: Option<i64>,
    /// JSON payload replayed by the operation, if any
    pub payload: Option<String>,
}

impl SyncQueueEntry {
    /// Validate identifying fields and build a fresh entry at attempts=0.
    pub fn enqueue(
        record_id: &str,
        record_type: &str,
        operation: SyncOperation,
        payload: Option<String>,
    ) -> Result<Self> {
        if record_id.trim().is_empty() {
            return Err(Error::validation("record_id", "must not be empty"));
        }
        if record_type.trim().is_empty() {
            return Err(Error::validation("record_type", "must not be empty"));
        }
        Ok(Self {
            record_id: record_id.to_string(),
            record_type: record_type.to_string(),
            operation,
            pending_since: unix_timestamp_ms(),
            attempts: 0,
            last_error: None,
            next_retry_at: None,
            payload,
        })
    }

    /// Record a failed attempt and schedule the next retry.
    ///
    /// Hard caller contract: an entry that is already permanently failed must
    /// not be passed back in; callers classify with [`Self::is_permanently_failed`]
    /// and stop retrying. A sixth failure is a bug, not an internal retry.
    pub fn record_failure(&self, error_message: &str, now: i64) -> Result<Self> {
        if self.is_permanently_failed() {
            return Err(Error::validation(
                "attempts",
                format!(
                    "entry for record {} already failed permanently ({} attempts)",
                    self.record_id, self.attempts
                ),
            ));
        }
        let attempts = self.attempts + 1;
        let delay_index = usize::from(self.attempts).min(RETRY_DELAYS_MS.len() - 1);
        Ok(Self {
            attempts,
            last_error: Some(error_message.to_string()),
            next_retry_at: Some(now + RETRY_DELAYS_MS[delay_index]),
            ..self.clone()
        })
    }

    /// Eligible now? Fresh entries always are; permanently failed never are;
    /// otherwise the backoff deadline decides.
    pub fn is_ready_for_retry(&self, now: i64) -> bool {
        if self.attempts == 0 {
            return true;
        }
        if self.is_permanently_failed() {
            return false;
        }
        self.next_retry_at.map_or(true, |at| now >= at)
    }

    pub const fn is_permanently_failed(&self) -> bool {
        self.attempts >= MAX_ATTEMPTS
    }

    /// Scheduling band: fresh work first (100), chronic failures last (10)
    /// without starving them, everything else in between (50).
    pub const fn priority(&self) -> u8 {
        if self.attempts == 0 {
            100
        } else if self.attempts >= 3 {
            10
        } else {
            50
        }
    }

    /// Caller-initiated manual retry: clear the failure bookkeeping and
    /// restart the cycle from attempts=0.
    #[must_use]
    pub fn reset(&self) -> Self {
        Self {
            attempts: 0,
            last_error: None,
            next_retry_at: None,
            ..self.clone()
        }
    }

    /// Convert to the persisted row format.
    #[must_use]
    pub fn to_storage_format(&self) -> StoredQueueEntry {
        StoredQueueEntry {
            record_id: self.record_id.clone(),
            record_type: self.record_type.clone(),
            operation: self.operation.as_str().to_string(),
            pending_since: format_timestamp(self.pending_since),
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            next_retry_at: self.next_retry_at.map(format_timestamp),
            payload: self.payload.clone(),
        }
    }
}

/// Persisted sync queue row, RFC3339 timestamps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredQueueEntry {
    pub record_id: String,
    pub record_type: String,
    pub operation: String,
    pub pending_since: String,
    pub attempts: u8,
    pub last_error: Option<String>,
    pub next_retry_at: Option<String>,
    pub payload: Option<String>,
}

/// Filter to retry-eligible entries and order them for the drain loop:
/// priority descending, stable on ties by `pending_since` ascending.
#[must_use]
pub fn select_ready_work(entries: &[SyncQueueEntry], now: i64) -> Vec<SyncQueueEntry> {
    let mut ready: Vec<SyncQueueEntry> = entries
        .iter()
        .filter(|entry| entry.is_ready_for_retry(now) && !entry.is_permanently_failed())
        .cloned()
        .collect();
    ready.sort_by(|a, b| {
        b.priority()
            .cmp(&a.priority())
            .then(a.pending_since.cmp(&b.pending_since))
    });
    ready
}

fn format_timestamp(unix_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(unix_ms)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(attempts: u8, pending_since: i64, next_retry_at: Option<i64>) -> SyncQueueEntry {
        SyncQueueEntry {
            record_id: format!("record-{pending_since}"),
            record_type: "record".to_string(),
            operation: SyncOperation::Update,
            pending_since,
            attempts,
            last_error: None,
            next_retry_at,
            payload: None,
        }
    }

    #[test]
    fn enqueue_validates_identifying_fields() {
        assert!(SyncQueueEntry::enqueue("", "record", SyncOperation::Create, None).is_err());
        assert!(SyncQueueEntry::enqueue("id", "  ", SyncOperation::Create, None).is_err());

        let entry = SyncQueueEntry::enqueue("id", "record", SyncOperation::Create, None).unwrap();
        assert_eq!(entry.attempts, 0);
        assert!(entry.next_retry_at.is_none());
        assert!(entry.pending_since > 0);
    }

    #[test]
    fn record_failure_walks_the_backoff_table() {
        let now = 1_000_000;
        let mut e = entry(0, now, None);
        for (i, delay) in RETRY_DELAYS_MS.iter().enumerate() {
            e = e.record_failure("boom", now).unwrap();
            assert_eq!(e.attempts, u8::try_from(i + 1).unwrap());
            assert_eq!(e.next_retry_at, Some(now + delay));
            assert_eq!(e.last_error.as_deref(), Some("boom"));
        }
        assert!(e.is_permanently_failed());
    }

    #[test]
    fn sixth_failure_is_a_contract_violation() {
        let exhausted = entry(MAX_ATTEMPTS, 0, Some(0));
        let err = exhausted.record_failure("boom", 0).unwrap_err();
        assert!(matches!(err, Error::Validation { field: "attempts", .. }));
    }

    #[test]
    fn fresh_entries_are_immediately_eligible() {
        assert!(entry(0, 0, None).is_ready_for_retry(0));
        // Even with a bogus future deadline, attempts==0 wins
        assert!(entry(0, 0, Some(i64::MAX)).is_ready_for_retry(0));
    }

    #[test]
    fn permanently_failed_entries_are_never_eligible() {
        assert!(!entry(MAX_ATTEMPTS, 0, Some(0)).is_ready_for_retry(i64::MAX));
    }

    #[test]
    fn backoff_deadline_gates_eligibility() {
        let e = entry(2, 0, Some(5_000));
        assert!(!e.is_ready_for_retry(4_999));
        assert!(e.is_ready_for_retry(5_000));
        assert!(e.is_ready_for_retry(5_001));
    }

    #[test]
    fn priority_bands() {
        assert_eq!(entry(0, 0, None).priority(), 100);
        assert_eq!(entry(1, 0, None).priority(), 50);
        assert_eq!(entry(2, 0, None).priority(), 50);
        assert_eq!(entry(3, 0, None).priority(), 10);
        assert_eq!(entry(4, 0, None).priority(), 10);
    }

    #[test]
    fn select_ready_work_orders_fresh_work_first() {
        // Scenario B: attempts=0 entry vs attempts=2 with expired deadline
        let fresh = entry(0, 200, None);
        let retrying = entry(2, 100, Some(50));
        let selected = select_ready_work(&[retrying.clone(), fresh.clone()], 1_000);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0], fresh);
        assert_eq!(selected[1], retrying);
    }

    #[test]
    fn select_ready_work_excludes_ineligible_entries() {
        let waiting = entry(1, 0, Some(10_000));
        let exhausted = entry(MAX_ATTEMPTS, 0, Some(0));
        let ready = entry(1, 0, Some(100));
        let selected = select_ready_work(&[waiting, exhausted, ready.clone()], 1_000);
        assert_eq!(selected, vec![ready]);
    }

    #[test]
    fn select_ready_work_breaks_ties_by_age() {
        let older = entry(0, 100, None);
        let newer = entry(0, 200, None);
        let selected = select_ready_work(&[newer.clone(), older.clone()], 1_000);
        assert_eq!(selected, vec![older, newer]);
    }

    #[test]
    fn reset_restarts_the_cycle() {
        let exhausted = entry(MAX_ATTEMPTS, 0, Some(123)).reset();
        assert_eq!(exhausted.attempts, 0);
        assert!(exhausted.next_retry_at.is_none());
        assert!(exhausted.last_error.is_none());
        assert!(exhausted.is_ready_for_retry(0));
    }

    #[test]
    fn storage_format_uses_rfc3339() {
        let e = entry(1, 1_700_000_000_000, Some(1_700_000_001_000));
        let row = e.to_storage_format();
        assert!(row.pending_since.starts_with("2023-11-14T"));
        assert_eq!(row.operation, "update");
        assert_eq!(row.attempts, 1);
    }
}
