//! Connectivity signal
//!
//! Platform integrations push state changes in; the reconciliation engine
//! and any interested UI subscribe to the watch channel instead of polling.

use tokio::sync::watch;

/// Observed network condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Online,
    /// Reachable but degraded (metered, high latency, flaky)
    Limited,
    Offline,
}

impl ConnectionState {
    /// Whether the reconciliation engine should attempt network work.
    pub const fn allows_sync(self) -> bool {
        !matches!(self, Self::Offline)
    }
}

/// Source of truth for the current connection state
#[derive(Debug)]
pub struct ConnectivityMonitor {
    sender: watch::Sender<ConnectionState>,
}

impl ConnectivityMonitor {
    #[must_use]
    pub fn new(initial: ConnectionState) -> Self {
        let (sender, _receiver) = watch::channel(initial);
        Self { sender }
    }

    pub fn current(&self) -> ConnectionState {
        *self.sender.borrow()
    }

    /// Push a new observation; subscribers wake only on actual changes.
    pub fn set_state(&self, state: ConnectionState) {
        self.sender.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!("Connection state changed: {current:?} -> {state:?}");
                *current = state;
                true
            }
        });
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.sender.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectionState::Online)
    }
}
