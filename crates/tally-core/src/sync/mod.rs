//! Background reconciliation: connectivity signal, merge strategies, and the
//! engine that drains the sync queue against the active backend.

pub mod connectivity;
pub mod engine;
pub mod merge;

pub use connectivity::{ConnectionState, ConnectivityMonitor};
pub use engine::{SyncCycleReport, SyncEngine};
pub use merge::{MergeOutcome, MergeStrategy};
