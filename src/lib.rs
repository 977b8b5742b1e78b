//! Owner-keyed asynchronous lock for transactional data grids.
//!
//! `gridlock` provides [`OwnerLock`], the per-key mutual-exclusion
//! primitive of a data grid's transactional locking layer. Unlike a
//! thread mutex, the lock is held by an arbitrary caller-supplied
//! *owner* value — typically a transaction id or remote request handle —
//! so acquisition and release may happen on different threads.
//!
//! Acquisition is asynchronous: [`OwnerLock::acquire`] never blocks and
//! returns a [`LockRequest`] promise. The caller then chooses how to
//! consume it:
//!
//! - poll with [`LockRequest::is_available`],
//! - block with [`LockRequest::wait`] (bounded by the request deadline),
//! - await [`LockRequest::acquisition`],
//! - or register a callback with [`LockRequest::add_listener`].
//!
//! Pending requests queue in FIFO order and can be cancelled by timeout
//! or by an external [`DeadlockChecker`]; ownership moves between
//! requests through a single-word CAS handoff, so release, cancel,
//! timeout, and deadlock scans interleave without a coarse lock.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use gridlock::{MonotonicClock, OwnerLock};
//!
//! let lock: OwnerLock<u64> = OwnerLock::new(Arc::new(MonotonicClock::new()));
//!
//! // Transaction 1 takes the lock; transaction 2 queues behind it.
//! let first = lock.acquire(1, Duration::from_secs(1));
//! let second = lock.acquire(2, Duration::from_secs(1));
//! assert!(first.is_available());
//! assert!(!second.is_available());
//!
//! // Releasing hands the lock to the next waiter in arrival order.
//! lock.release(&1);
//! second.wait().expect("handed off");
//! assert_eq!(lock.lock_owner(), Some(2));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod error;
pub mod sync;
pub mod time;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::WaitError;
pub use sync::{Acquisition, CancelReason, DeadlockChecker, LockRequest, LockState, Owner, OwnerLock};
pub use time::{ManualClock, MonotonicClock, TimeService};
