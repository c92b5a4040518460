//! Backend selection and development utilities
//!
//! `BackendService` is constructed explicitly and passed by reference to
//! consumers; there is no module-level state. The concrete backend is
//! resolved once from [`BackendConfig`] at `init` and never swapped at
//! runtime in production.

use std::sync::Arc;

use crate::backend::rest::RestBackend;
use crate::backend::sqlite::SqliteBackend;
use crate::backend::Backend;
use crate::config::{BackendConfig, BackendKind};
use crate::error::{Error, Result};

/// Owns the single active backend for the process
pub struct BackendService {
    kind: BackendKind,
    backend: Arc<dyn Backend>,
}

impl BackendService {
    /// Resolve and construct the configured backend.
    ///
    /// Configuration problems are fatal here; nothing retries a bad setup.
    pub fn init(config: BackendConfig) -> Result<Self> {
        let config = config.validated()?;
        let backend: Arc<dyn Backend> = match config.kind {
            BackendKind::Sqlite => match &config.sqlite_path {
                Some(path) => Arc::new(SqliteBackend::open(path)?),
                None => Arc::new(SqliteBackend::open_in_memory()?),
            },
            BackendKind::Rest => {
                // validated() guarantees both are present for Rest
                let url = config
                    .api_url
                    .as_deref()
                    .ok_or_else(|| Error::Configuration("missing api_url".to_string()))?;
                let key = config
                    .api_key
                    .as_deref()
                    .ok_or_else(|| Error::Configuration("missing api_key".to_string()))?;
                Arc::new(RestBackend::new(url, key)?)
            }
        };
        tracing::debug!("Backend service initialized with {:?} backend", config.kind);
        Ok(Self {
            kind: config.kind,
            backend,
        })
    }

    pub const fn kind(&self) -> BackendKind {
        self.kind
    }

    /// The backend serving record CRUD and sync.
    pub fn active_backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.backend)
    }

    /// The backend serving authentication.
    ///
    /// Identical to [`Self::active_backend`] today; kept as a separate
    /// accessor so the two concerns can diverge later.
    pub fn auth_backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.backend)
    }

    /// Tear down the service. Subscriptions on the backend outlive this only
    /// as long as other `Arc` holders do.
    pub fn dispose(self) {
        tracing::debug!("Backend service disposed");
        drop(self);
    }
}

/// One observed difference between two backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discrepancy {
    /// The two backends report different signed-in identities
    IdentityMismatch {
        left: Option<String>,
        right: Option<String>,
    },
    /// The scopes hold differing record counts
    RecordCountMismatch { left: usize, right: usize },
    /// A record name present on the left side only
    MissingFromRight(String),
    /// A record name present on the right side only
    MissingFromLeft(String),
}

/// Development-only: compare identity and record set between two backends
/// for one owner scope. Reports every discrepancy found rather than a single
/// boolean; an empty list means the scopes agree.
pub async fn check_consistency(
    left: &dyn Backend,
    right: &dyn Backend,
    owner_id: Option<&str>,
) -> Result<Vec<Discrepancy>> {
    let mut discrepancies = Vec::new();

    let left_identity = left.current_account().await?.map(|a| a.id);
    let right_identity = right.current_account().await?.map(|a| a.id);
    if left_identity != right_identity {
        discrepancies.push(Discrepancy::IdentityMismatch {
            left: left_identity,
            right: right_identity,
        });
    }

    let left_records = left.list_records(owner_id).await?;
    let right_records = right.list_records(owner_id).await?;
    if left_records.len() != right_records.len() {
        discrepancies.push(Discrepancy::RecordCountMismatch {
            left: left_records.len(),
            right: right_records.len(),
        });
    }

    let left_names: Vec<&str> = left_records.iter().map(|r| r.name.as_str()).collect();
    let right_names: Vec<&str> = right_records.iter().map(|r| r.name.as_str()).collect();
    for name in &left_names {
        if !right_names.contains(name) {
            discrepancies.push(Discrepancy::MissingFromRight((*name).to_string()));
        }
    }
    for name in &right_names {
        if !left_names.contains(name) {
            discrepancies.push(Discrepancy::MissingFromLeft((*name).to_string()));
        }
    }

    Ok(discrepancies)
}

/// Outcome of a one-way record migration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub copied: usize,
    /// Records already present at the destination (uniqueness violation)
    pub skipped: usize,
    /// Ids that failed for other reasons
    pub failed: Vec<String>,
}

/// Development-only: copy every record in one owner scope from `source` to
/// `destination`. Idempotent: records already present at the destination are
/// skipped via the uniqueness-violation response. The source is never
/// mutated.
pub async fn migrate_records(
    source: &dyn Backend,
    destination: &dyn Backend,
    owner_id: Option<&str>,
) -> Result<MigrationReport> {
    let records = source.list_records(owner_id).await?;
    let mut report = MigrationReport::default();

    for record in records {
        match destination.create_record(&record).await {
            Ok(_) => report.copied += 1,
            Err(Error::AlreadyExists(_)) => report.skipped += 1,
            Err(error) => {
                tracing::warn!("Failed to migrate record {}: {error}", record.id);
                report.failed.push(record.id.to_string());
            }
        }
    }

    tracing::info!(
        "Migration finished: {} copied, {} skipped, {} failed",
        report.copied,
        report.skipped,
        report.failed.len()
    );
    Ok(report)
}
