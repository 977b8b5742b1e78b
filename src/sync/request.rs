//! Per-acquisition lock promise and its state machine.
//!
//! Every call to [`OwnerLock::acquire`](super::lock::OwnerLock::acquire)
//! yields one [`LockRequest`]: a promise that the caller can poll
//! ([`is_available`](LockRequest::is_available)), block on
//! ([`wait`](LockRequest::wait)), await
//! ([`acquisition`](LockRequest::acquisition)), attach a callback to
//! ([`add_listener`](LockRequest::add_listener)), or cancel.
//!
//! The state cell is a single atomic; every transition is a CAS out of
//! `Waiting`, after which the state is terminal except for the
//! `Acquired → Released` and `TimedOut`/`Deadlocked → Released` edges
//! driven by release and cleanup:
//!
//! ```text
//!              ┌──────────► Acquired ───────┐
//!              │                            ▼
//!  Waiting ────┼──────────► TimedOut ────► Released
//!              │                            ▲
//!              └──────────► Deadlocked ─────┘
//! ```
//!
//! The notifier fires exactly once, on the first transition out of
//! `Waiting`. Cancellation of an *awaiting caller* (dropping the
//! [`Acquisition`] future) never changes the request state; only
//! timeout, deadlock, and release do.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Instant;

use tracing::trace;

use super::lock::LockCore;
use super::notifier::{Listener, Notifier};
use crate::error::WaitError;
use crate::time::TimeService;

/// Identity a lock holder must provide.
///
/// Owners are opaque to the lock: any hashable, comparable, cloneable
/// value works — a transaction id, a remote request handle, a thread id.
/// Blanket-implemented; never implement it by hand.
pub trait Owner: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static> Owner for T {}

/// State of a [`LockRequest`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockState {
    /// Queued, not yet promoted to holder.
    Waiting = 0,
    /// Currently holds the lock.
    Acquired = 1,
    /// Retired: released by its owner after (or instead of) holding.
    Released = 2,
    /// Cancelled: the deadline passed before promotion.
    TimedOut = 3,
    /// Cancelled: the deadlock checker reported a cycle.
    Deadlocked = 4,
}

impl LockState {
    const fn as_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Waiting,
            1 => Self::Acquired,
            2 => Self::Released,
            3 => Self::TimedOut,
            4 => Self::Deadlocked,
            _ => unreachable!("invalid lock state encoding: {raw}"),
        }
    }
}

/// Reason a pending request is being cancelled.
///
/// Only the two cancellation outcomes are representable, so an invalid
/// cancel target is a compile error rather than a runtime check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The request's deadline passed.
    TimedOut,
    /// The deadlock checker reported a cycle involving the request.
    Deadlocked,
}

impl CancelReason {
    fn as_state(self) -> LockState {
        match self {
            Self::TimedOut => LockState::TimedOut,
            Self::Deadlocked => LockState::Deadlocked,
        }
    }
}

/// A pending, held, or retired lock acquisition.
///
/// Obtained from [`OwnerLock::acquire`](super::lock::OwnerLock::acquire);
/// repeated acquires by the same owner return the *same* request until it
/// reaches a terminal state and is cleaned up.
pub struct LockRequest<O: Owner> {
    id: u64,
    owner: O,
    deadline: Instant,
    state: AtomicU8,
    notifier: Notifier,
    time: Arc<dyn TimeService>,
    lock: Weak<LockCore<O>>,
}

impl<O: Owner> LockRequest<O> {
    pub(crate) fn new(
        id: u64,
        owner: O,
        deadline: Instant,
        time: Arc<dyn TimeService>,
        lock: Weak<LockCore<O>>,
    ) -> Self {
        Self {
            id,
            owner,
            deadline,
            state: AtomicU8::new(LockState::Waiting.as_raw()),
            notifier: Notifier::new(),
            time,
            lock,
        }
    }

    /// The owner that requested the lock.
    pub fn owner(&self) -> &O {
        &self.owner
    }

    /// The absolute deadline computed at acquire time.
    ///
    /// Fixed for the lifetime of the request; idempotent re-acquire does
    /// not refresh it.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Snapshot of the request state.
    ///
    /// Listeners observing `Acquired` may want to know whether the lock
    /// is *still* held when their callback runs; this is the re-inspection
    /// hook for that.
    #[must_use]
    pub fn state(&self) -> LockState {
        LockState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// The owner currently holding the lock this request belongs to.
    #[must_use]
    pub fn holder(&self) -> Option<O> {
        self.lock.upgrade().and_then(|core| core.lock_owner())
    }

    /// Returns `true` once the request has left `Waiting`.
    ///
    /// Runs a timeout check first, so polling alone is enough to drive a
    /// pending request to `TimedOut` after its deadline.
    pub fn is_available(&self) -> bool {
        self.check_timeout();
        self.state() != LockState::Waiting
    }

    /// Blocks until the request leaves `Waiting`, then reports the outcome.
    ///
    /// Parks on the request notifier for at most the remaining time per
    /// iteration; wakeups (including spurious ones) re-inspect the state.
    ///
    /// # Errors
    ///
    /// - [`WaitError::Timeout`] — deadline passed before promotion.
    /// - [`WaitError::Deadlock`] — cancelled by the deadlock checker.
    /// - [`WaitError::AlreadyReleased`] — the request was released; waiting
    ///   on a retired promise is a caller bug.
    pub fn wait(&self) -> Result<(), WaitError> {
        loop {
            match self.state() {
                LockState::Waiting => {
                    self.check_timeout();
                    if self.state() == LockState::Waiting {
                        self.notifier.wait_for(self.time.remaining(self.deadline));
                    }
                }
                LockState::Acquired => return Ok(()),
                LockState::Released => return Err(WaitError::AlreadyReleased),
                LockState::TimedOut => {
                    self.cleanup();
                    return Err(WaitError::Timeout);
                }
                LockState::Deadlocked => {
                    self.cleanup();
                    return Err(WaitError::Deadlock);
                }
            }
        }
    }

    /// Returns a future resolving when the request leaves `Waiting`.
    ///
    /// Resolves to the same classification as [`wait`](Self::wait).
    /// Dropping the future deregisters its waker and leaves the request
    /// state untouched — that is the cooperative-cancellation path for
    /// async callers. Each poll runs a timeout check, but the future does
    /// not schedule its own wakeup at the deadline; pair it with a runtime
    /// timer when a hard async deadline is needed.
    pub fn acquisition(&self) -> Acquisition<'_, O> {
        Acquisition {
            request: self,
            waker_id: None,
        }
    }

    /// Registers a callback invoked once, after the notifier fires.
    ///
    /// The callback receives the state observed at invocation time, with
    /// one mapping: `Released` is delivered as [`LockState::Acquired`],
    /// because from the waiter's perspective the critical section was
    /// reached and the holder has since moved on. If the notifier already
    /// fired, the callback runs immediately on the registering thread.
    ///
    /// # Panics
    ///
    /// Panics if invoked while the request is still `Waiting`; the
    /// notifier fires only after the state has left `Waiting`, so this
    /// indicates an implementation bug.
    pub fn add_listener(&self, listener: impl FnOnce(LockState) + Send + 'static) {
        if let Some(listener) = self.notifier.register_listener(Box::new(listener)) {
            self.invoke_listener(listener);
        }
    }

    /// Cancels a pending request.
    ///
    /// CAS `Waiting → reason`; a request that already left `Waiting`
    /// (acquired, released, or cancelled by a concurrent observer) is
    /// left untouched. On success the notifier fires and the lock elects
    /// the next holder.
    pub fn cancel(&self, reason: CancelReason) {
        if self.cas_state(LockState::Waiting, reason.as_state()) {
            self.fire_notifier();
            self.cancelled_handoff();
        }
    }

    /// Promotes the request to holder after it won the `current` CAS.
    ///
    /// Returns `true` iff the request is now `Acquired`. `false` means it
    /// left `Waiting` before the handoff reached it; the caller passes
    /// ownership on to the next queued request.
    pub(crate) fn set_acquire(&self) -> bool {
        if self.cas_state(LockState::Waiting, LockState::Acquired) {
            self.fire_notifier();
        }
        self.state() == LockState::Acquired
    }

    /// Drives the request to `Released`, running cleanup.
    ///
    /// From `Waiting` or `Acquired` the notifier also fires; from
    /// `TimedOut`/`Deadlocked` it already has. Returns `true` on the
    /// transition, `false` if the request was already `Released`.
    pub(crate) fn set_released(&self) -> bool {
        loop {
            let state = self.state();
            match state {
                LockState::Waiting | LockState::Acquired => {
                    if self.cas_state(state, LockState::Released) {
                        self.cleanup();
                        self.fire_notifier();
                        return true;
                    }
                }
                LockState::TimedOut | LockState::Deadlocked => {
                    if self.cas_state(state, LockState::Released) {
                        self.cleanup();
                        return true;
                    }
                }
                LockState::Released => return false,
            }
        }
    }

    /// Moves an expired pending request to `TimedOut`.
    ///
    /// Timeout checks are more frequent and cheaper than deadlock checks,
    /// so every polling surface calls this first.
    pub(crate) fn check_timeout(&self) {
        if self.state() == LockState::Waiting
            && self.time.expired(self.deadline)
            && self.cas_state(LockState::Waiting, LockState::TimedOut)
        {
            self.fire_notifier();
            self.cancelled_handoff();
        }
    }

    /// Deadlock probe, run by the owning lock's scan.
    ///
    /// `holder` is the owner currently holding the lock. The timeout check
    /// runs first; a request that is still `Waiting`, belongs to a
    /// different owner, and is reported by the checker moves to
    /// `Deadlocked`.
    pub(crate) fn check_deadlock<C>(&self, checker: &C, holder: &O)
    where
        C: super::lock::DeadlockChecker<O> + ?Sized,
    {
        self.check_timeout();
        if self.state() == LockState::Waiting
            && self.owner != *holder
            && checker.deadlock_detected(&self.owner, holder)
            && self.cas_state(LockState::Waiting, LockState::Deadlocked)
        {
            self.cancelled_handoff();
            self.fire_notifier();
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Removes the request from the owner index and runs the release hook.
    ///
    /// Identity-checked: only this request's own entry is removed, so a
    /// late cleanup cannot evict a successor request for the same owner.
    /// At most one call performs the removal, which bounds the release
    /// hook to once per request.
    pub(crate) fn cleanup(&self) {
        if let Some(core) = self.lock.upgrade() {
            core.remove_owner(&self.owner, self.id);
        }
    }

    /// Hands the lock onward after this request was cancelled.
    ///
    /// If this request never held the `current` slot the CAS inside the
    /// handoff fails and the routine returns; that is the expected outcome
    /// for cancelling a queued (non-holding) request.
    fn cancelled_handoff(&self) {
        if let Some(core) = self.lock.upgrade() {
            core.handoff(self.id);
        }
    }

    fn cas_state(&self, from: LockState, to: LockState) -> bool {
        let swapped = self
            .state
            .compare_exchange(
                from.as_raw(),
                to.as_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if swapped {
            trace!(request = self.id, owner = ?self.owner, from = ?from, to = ?to, "state changed");
        }
        swapped
    }

    /// Fires the notifier and invokes any pending listeners.
    fn fire_notifier(&self) {
        if self.state() != LockState::Waiting {
            for listener in self.notifier.fire() {
                self.invoke_listener(listener);
            }
        }
    }

    fn invoke_listener(&self, listener: Listener) {
        let delivered = match self.state() {
            LockState::Waiting => {
                panic!("lock listener invoked while the request is still waiting")
            }
            // The waiter reached the critical section; that the holder
            // has since released does not change that.
            LockState::Acquired | LockState::Released => LockState::Acquired,
            cancelled => cancelled,
        };
        listener(delivered);
    }

    #[cfg(test)]
    pub(crate) fn notifier_has_fired(&self) -> bool {
        self.notifier.has_fired()
    }
}

impl<O: Owner> fmt::Debug for LockRequest<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRequest")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Future returned by [`LockRequest::acquisition`].
///
/// Resolves once the request leaves `Waiting`. Dropping it cancels only
/// the *wait*, never the request.
#[derive(Debug)]
pub struct Acquisition<'a, O: Owner> {
    request: &'a LockRequest<O>,
    waker_id: Option<u64>,
}

impl<O: Owner> Future for Acquisition<'_, O> {
    type Output = Result<(), WaitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        loop {
            match this.request.state() {
                LockState::Waiting => {
                    this.request.check_timeout();
                    if this.request.state() != LockState::Waiting {
                        continue;
                    }
                    if this
                        .request
                        .notifier
                        .poll_register(cx.waker(), &mut this.waker_id)
                    {
                        // Fired between the state read and registration.
                        continue;
                    }
                    return Poll::Pending;
                }
                LockState::Acquired => return Poll::Ready(Ok(())),
                LockState::Released => return Poll::Ready(Err(WaitError::AlreadyReleased)),
                LockState::TimedOut => {
                    this.request.cleanup();
                    return Poll::Ready(Err(WaitError::Timeout));
                }
                LockState::Deadlocked => {
                    this.request.cleanup();
                    return Poll::Ready(Err(WaitError::Deadlock));
                }
            }
        }
    }
}

impl<O: Owner> Drop for Acquisition<'_, O> {
    fn drop(&mut self) {
        if let Some(id) = self.waker_id.take() {
            self.request.notifier.deregister(id);
        }
    }
}
