//! Shared sync state types.

/// Coordinator state. A cycle is either running or it is not; cancellation
/// is cooperative, so there is no paused or stopped state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Idle,
    Running,
}

/// External input that may start a reconciliation cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncSignal {
    /// Network became reachable.
    ConnectivityRestored,
    /// Network went away. Never starts a cycle.
    ConnectivityLost,
    /// Explicit wake, e.g. a background-sync notification.
    Wake,
    /// Process start-up with the connectivity observed at that moment.
    Startup { online: bool },
}
