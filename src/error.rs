//! Error types for lock waiters.
//!
//! A waiter can fail in three ways: the deadline passed before the lock
//! was handed to it, an external deadlock checker cancelled it, or it
//! observed a request that was already released. The first two are
//! terminal outcomes of the request state machine; the last one surfaces
//! API misuse (waiting on a promise after `release` retired it).

use core::fmt;

/// Error returned when waiting on a lock request fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline passed before the request was promoted to holder.
    Timeout,
    /// The deadlock checker reported a cycle and cancelled the request.
    Deadlock,
    /// The request was already released; there is nothing to wait for.
    AlreadyReleased,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout waiting for lock"),
            Self::Deadlock => write!(f, "deadlock detected while waiting for lock"),
            Self::AlreadyReleased => write!(f, "lock request already released"),
        }
    }
}

impl std::error::Error for WaitError {}
