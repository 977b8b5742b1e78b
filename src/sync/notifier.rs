//! Single-shot completion signal for lock requests.
//!
//! Each lock request carries one [`Notifier`]. It fires exactly once,
//! when the request's state leaves `Waiting`, and supports three kinds of
//! consumers at the same time:
//!
//! - blocking waiters parked on the condvar (`wait_for`),
//! - futures that registered a waker (`poll_register` / `deregister`),
//! - listener callbacks drained on fire and invoked by the caller.
//!
//! The notifier carries no value; waiters re-inspect the request state
//! after waking.
//!
//! # Lost wakeups
//!
//! The `fired` flag is written under the same mutex that guards waiter
//! registration, so a consumer can never observe "not fired", register,
//! and then miss the fire.

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;
use std::time::Duration;

use super::request::LockState;

/// Callback invoked once with the state observed after the fire.
pub(crate) type Listener = Box<dyn FnOnce(LockState) + Send + 'static>;

/// A single-shot event with waker, condvar, and listener support.
pub(crate) struct Notifier {
    /// Fast-path flag mirroring `Inner::fired`.
    fired: AtomicBool,
    inner: Mutex<Inner>,
    condvar: Condvar,
}

struct Inner {
    fired: bool,
    /// Registered wakers, keyed so a dropped future removes only its own.
    wakers: SmallVec<[(u64, Waker); 2]>,
    listeners: SmallVec<[Listener; 1]>,
    next_waker_id: u64,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                fired: false,
                wakers: SmallVec::new(),
                listeners: SmallVec::new(),
                next_waker_id: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Returns `true` iff the notifier has fired.
    pub(crate) fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Fires the notifier.
    ///
    /// The first call wakes every parked thread and registered waker and
    /// returns the pending listeners for the caller to invoke; later
    /// calls are no-ops returning an empty list.
    pub(crate) fn fire(&self) -> SmallVec<[Listener; 1]> {
        let mut inner = self.inner.lock();
        if inner.fired {
            return SmallVec::new();
        }
        inner.fired = true;
        self.fired.store(true, Ordering::Release);
        let wakers = std::mem::take(&mut inner.wakers);
        let listeners = std::mem::take(&mut inner.listeners);
        self.condvar.notify_all();
        drop(inner);

        for (_, waker) in wakers {
            waker.wake();
        }
        listeners
    }

    /// Registers a listener to be invoked after the fire.
    ///
    /// Returns the listener back when the notifier has already fired; the
    /// caller must invoke it itself.
    pub(crate) fn register_listener(&self, listener: Listener) -> Option<Listener> {
        let mut inner = self.inner.lock();
        if inner.fired {
            return Some(listener);
        }
        inner.listeners.push(listener);
        None
    }

    /// Parks the calling thread for up to `timeout` or until the fire.
    ///
    /// Returns `true` iff the notifier has fired. Spurious and timed-out
    /// wakeups return `false`; callers loop and recompute the timeout.
    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        if self.fired.load(Ordering::Acquire) {
            return true;
        }
        let mut inner = self.inner.lock();
        if inner.fired {
            return true;
        }
        let _ = self.condvar.wait_for(&mut inner, timeout);
        inner.fired
    }

    /// Registers (or refreshes) a future's waker.
    ///
    /// `slot` is the future's registration id, assigned on first use.
    /// Returns `true` when the notifier has already fired, in which case
    /// nothing is registered and the slot is cleared.
    pub(crate) fn poll_register(&self, waker: &Waker, slot: &mut Option<u64>) -> bool {
        let mut inner = self.inner.lock();
        if inner.fired {
            *slot = None;
            return true;
        }
        match *slot {
            Some(id) => {
                if let Some((_, registered)) = inner.wakers.iter_mut().find(|(i, _)| *i == id) {
                    if !registered.will_wake(waker) {
                        registered.clone_from(waker);
                    }
                } else {
                    inner.wakers.push((id, waker.clone()));
                }
            }
            None => {
                let id = inner.next_waker_id;
                inner.next_waker_id += 1;
                inner.wakers.push((id, waker.clone()));
                *slot = Some(id);
            }
        }
        false
    }

    /// Removes a future's waker registration. No-op after the fire.
    pub(crate) fn deregister(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.wakers.iter().position(|(i, _)| *i == id) {
            inner.wakers.swap_remove(pos);
        }
    }

    #[cfg(test)]
    pub(crate) fn waker_count(&self) -> usize {
        self.inner.lock().wakers.len()
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("fired", &self.has_fired())
            .finish_non_exhaustive()
    }
}
