//! Error types shared by the store, queue and clock layers.
//!
//! Command text errors live next to the parser in [`crate::command`].

use thiserror::Error;

/// Failures of a [`TrackedStore`](crate::store::TrackedStore) operation.
///
/// Ids are rendered with their `Debug` form so the store stays generic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("record {0} already tracked")]
    Duplicate(String),

    #[error("record {0} not found")]
    NotFound(String),

    #[error("visitor failed on record {0}")]
    CallbackFailed(String),
}

/// Failures of a [`CommandQueue`](crate::queue::CommandQueue) operation.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Shut down and drained; expected while stopping
    #[error("command queue closed")]
    Closed,

    #[error("command queue full ({0} items)")]
    Full(usize),
}

/// Failures setting the system clock for `time-sync`.
#[derive(Debug, Error)]
pub enum TimeUpdateError {
    #[error("not permitted to set the system clock (run as root or grant CAP_SYS_TIME)")]
    PermissionDenied,

    #[error("time {0} cannot be represented as a system time")]
    OutOfRange(String),

    #[error("setting the system clock failed: {0}")]
    Os(#[from] std::io::Error),
}
