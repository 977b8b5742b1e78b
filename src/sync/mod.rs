//! Owner-keyed locking primitives.
//!
//! The single primitive here is [`OwnerLock`], an asynchronous mutual
//! exclusion object whose holder is an opaque caller-supplied identity
//! rather than a thread. Acquisition returns a [`LockRequest`] promise;
//! ownership moves between requests through a lock-free CAS handoff on
//! the lock's `current` slot.
//!
//! # Pieces
//!
//! - [`OwnerLock`]: public API — acquire, release, query, deadlock scan
//! - [`LockRequest`]: per-attempt state machine, deadline, notifier
//! - [`Acquisition`]: future form of waiting on a request
//! - [`DeadlockChecker`]: external wait-for-graph predicate

mod lock;
mod notifier;
mod request;

pub use lock::{DeadlockChecker, OwnerLock};
pub use request::{Acquisition, CancelReason, LockRequest, LockState, Owner};
