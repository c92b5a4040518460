//! tally-core - Core library for Tally
//!
//! Local-first workout record keeping: records, the optimistic sync queue,
//! the interchangeable storage backends, and the reconciliation engine that
//! ties them together.

pub mod backend;
pub mod config;
pub mod error;
pub mod models;
pub mod sync;
pub mod util;

pub use backend::{Backend, BackendService, Subscription};
pub use config::{BackendConfig, BackendKind};
pub use error::{Error, Result};
pub use models::{Record, RecordId, RecordPatch, SyncQueueEntry, SyncStatus};
pub use sync::{ConnectivityMonitor, MergeStrategy, SyncEngine};
