//! Conflict resolution strategies
//!
//! The merge step sits behind a tagged variant so stronger policies can be
//! substituted without touching the reconciliation loop.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::Record;

/// How a local/remote divergence is reconciled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Newest `updated_at` wins wholesale. Simple, but a concurrent edit on
    /// the losing side is discarded.
    #[default]
    LastWriteWins,
    /// Per-field newest-wins: name and tombstone each taken from whichever
    /// side was updated more recently, with a tombstone always surviving.
    FieldLevelMerge,
    /// Never auto-resolve; the record stays in conflict until a caller
    /// resolves it explicitly.
    ManualResolution,
}

/// Result of applying a strategy to a divergent pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The merged record to write back (and re-sync if it differs remotely)
    Resolved(Record),
    /// The strategy defers to an explicit caller decision
    NeedsManual,
}

impl MergeStrategy {
    /// Reconcile a local record with the divergent remote version of it.
    pub fn resolve(self, local: &Record, remote: &Record) -> Result<MergeOutcome> {
        match self {
            Self::LastWriteWins => {
                let winner = if remote.updated_at > local.updated_at {
                    remote
                } else {
                    local
                };
                Ok(MergeOutcome::Resolved(winner.clone()))
            }
            Self::FieldLevelMerge => {
                let (newer, older) = if remote.updated_at > local.updated_at {
                    (remote, local)
                } else {
                    (local, remote)
                };
                let mut merged = newer.clone();
                // A delete on either side survives the merge
                merged.deleted = local.deleted || remote.deleted;
                if merged.name.is_empty() {
                    merged.name = older.name.clone();
                }
                merged.updated_at = local.updated_at.max(remote.updated_at);
                Ok(MergeOutcome::Resolved(merged))
            }
            Self::ManualResolution => Ok(MergeOutcome::NeedsManual),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordPatch;
    use pretty_assertions::assert_eq;

    fn pair() -> (Record, Record) {
        let local = Record::create("Push-ups", None).unwrap();
        let mut remote = local.apply(&RecordPatch::rename("Pushups")).unwrap();
        remote.updated_at = local.updated_at + 1_000;
        (local, remote)
    }

    #[test]
    fn last_write_wins_picks_newer_side() {
        let (local, remote) = pair();
        let outcome = MergeStrategy::LastWriteWins.resolve(&local, &remote).unwrap();
        assert_eq!(outcome, MergeOutcome::Resolved(remote.clone()));

        // Flip the clock: local is newer
        let mut newer_local = local;
        newer_local.updated_at = remote.updated_at + 1_000;
        let outcome = MergeStrategy::LastWriteWins
            .resolve(&newer_local, &remote)
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Resolved(newer_local));
    }

    #[test]
    fn field_level_merge_preserves_tombstones() {
        let (local, remote) = pair();
        let deleted_local = Record {
            deleted: true,
            ..local
        };
        let outcome = MergeStrategy::FieldLevelMerge
            .resolve(&deleted_local, &remote)
            .unwrap();
        match outcome {
            MergeOutcome::Resolved(merged) => {
                assert!(merged.deleted);
                assert_eq!(merged.name, "Pushups"); // remote rename survives too
            }
            MergeOutcome::NeedsManual => panic!("expected a resolution"),
        }
    }

    #[test]
    fn manual_resolution_always_defers() {
        let (local, remote) = pair();
        let outcome = MergeStrategy::ManualResolution
            .resolve(&local, &remote)
            .unwrap();
        assert_eq!(outcome, MergeOutcome::NeedsManual);
    }
}
