//! Owner-keyed asynchronous lock with CAS-based handoff.
//!
//! [`OwnerLock`] differs from a thread mutex in two ways: the holder is
//! an arbitrary caller-supplied value (an *owner*, typically a
//! transaction id), and acquisition is asynchronous — `acquire` never
//! blocks, it returns a [`LockRequest`] promise that the caller inspects,
//! waits on, or cancels at its leisure. Release may happen from any
//! thread, keyed by the owner alone.
//!
//! # Handoff
//!
//! The `current` slot (the id of the holding request, `0` when free) is
//! the only arbitration point. Every path that vacates or fills the lock
//! — acquire, release, timeout, deadlock cancellation — converges on
//! [`LockCore::handoff`], a loop around a single compare-and-swap:
//!
//! 1. peek the queue head;
//! 2. empty queue: clear the slot if the releaser still holds it, done;
//! 3. otherwise CAS `current: releaser → head`; the winner removes the
//!    head from the queue and promotes it; a loser leaves — whoever beat
//!    it has taken over the election;
//! 4. a head that left `Waiting` before promotion (timed out, deadlocked,
//!    released in queue) fails its promotion; the loop re-runs with that
//!    request as the releaser, passing the lock over the corpse.
//!
//! Queue removal strictly follows a won CAS, so two concurrent releasers
//! can never both elect the same candidate. No mutex guards the handoff;
//! the queue mutex protects only the `VecDeque` structure itself.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use gridlock::{MonotonicClock, OwnerLock};
//!
//! let lock: OwnerLock<&str> = OwnerLock::new(Arc::new(MonotonicClock::new()));
//!
//! let request = lock.acquire("tx-1", Duration::from_secs(1));
//! assert!(request.is_available());
//! request.wait().expect("free lock is acquired immediately");
//!
//! lock.release(&"tx-1");
//! assert!(!lock.is_locked());
//! ```

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::request::{LockRequest, Owner};
use crate::time::TimeService;

/// `current` value when no request holds the lock.
const NO_HOLDER: u64 = 0;

/// External predicate over the global wait-for graph.
///
/// The lock consults the checker for its own queue only and treats the
/// call as pure and idempotent; walking the graph is the container's
/// problem.
pub trait DeadlockChecker<O> {
    /// Returns `true` iff `waiter` waiting while `holder` holds the lock
    /// closes a cycle in the wait-for graph.
    fn deadlock_detected(&self, waiter: &O, holder: &O) -> bool;
}

impl<O, F> DeadlockChecker<O> for F
where
    F: Fn(&O, &O) -> bool,
{
    fn deadlock_detected(&self, waiter: &O, holder: &O) -> bool {
        self(waiter, holder)
    }
}

/// Shared state behind an [`OwnerLock`] and the weak back-references of
/// its requests.
pub(crate) struct LockCore<O: Owner> {
    /// Id of the holding request; the single CAS word of the handoff.
    current: AtomicU64,
    /// Request id source. Starts at 1; `0` is reserved for [`NO_HOLDER`].
    next_request_id: AtomicU64,
    /// Pending requests in arrival order.
    queue: Mutex<VecDeque<Arc<LockRequest<O>>>>,
    /// Owner → outstanding request. One entry per owner until cleanup.
    owners: DashMap<O, Arc<LockRequest<O>>>,
    time: Arc<dyn TimeService>,
    /// Invoked once per request cleanup.
    release_hook: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<O: Owner> LockCore<O> {
    /// Elects the next holder. `releaser` is the id of the vacating
    /// request, or [`NO_HOLDER`] when the caller only wants to promote a
    /// waiter into a free lock.
    pub(crate) fn handoff(&self, releaser: u64) {
        let mut to_release = releaser;
        loop {
            let candidate = self.queue.lock().front().cloned();
            let Some(candidate) = candidate else {
                if to_release != NO_HOLDER {
                    // Queue drained: clear the slot if the releaser still
                    // holds it. A concurrent handoff may have already done
                    // so; either outcome is fine.
                    let _ = self.current.compare_exchange(
                        to_release,
                        NO_HOLDER,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
                return;
            };

            trace!(candidate = candidate.id(), releaser = to_release, "handoff attempt");
            if self
                .current
                .compare_exchange(
                    to_release,
                    candidate.id(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // The slot names the candidate now, so it is no longer
                // pending; removal after the CAS is what keeps two
                // releasers from electing the same head twice.
                self.remove_queued(candidate.id());
                if candidate.set_acquire() {
                    trace!(request = candidate.id(), "lock acquired");
                    return;
                }
                // The candidate left Waiting before the handoff reached
                // it. Pass the lock over it to the next in line.
                trace!(request = candidate.id(), "stale candidate, retrying");
                to_release = candidate.id();
            } else {
                // Another actor changed `current`; the election is theirs.
                return;
            }
        }
    }

    pub(crate) fn lock_owner(&self) -> Option<O> {
        self.current_request()
            .map(|request| request.owner().clone())
    }

    /// Resolves the `current` id back to its request.
    ///
    /// Walks the owner index, which holds at most a handful of entries
    /// for a key-level lock. `None` either means the lock is free or the
    /// holder is mid-release and already cleaned up.
    fn current_request(&self) -> Option<Arc<LockRequest<O>>> {
        let id = self.current.load(Ordering::Acquire);
        if id == NO_HOLDER {
            return None;
        }
        self.owners
            .iter()
            .find(|entry| entry.value().id() == id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Removes `owner`'s entry iff it still maps to request `id`, firing
    /// the release hook on removal.
    pub(crate) fn remove_owner(&self, owner: &O, id: u64) {
        let removed = self
            .owners
            .remove_if(owner, |_, request| request.id() == id)
            .is_some();
        if removed {
            trace!(?owner, request = id, "owner retired");
            if let Some(hook) = &self.release_hook {
                hook();
            }
        }
    }

    fn remove_queued(&self, id: u64) {
        let mut queue = self.queue.lock();
        if let Some(position) = queue.iter().position(|request| request.id() == id) {
            queue.remove(position);
        }
    }
}

/// An asynchronous mutual-exclusion primitive keyed by owner identity.
///
/// Cloning the handle shares the lock; all clones observe the same
/// holder, queue, and owner index.
pub struct OwnerLock<O: Owner> {
    core: Arc<LockCore<O>>,
}

impl<O: Owner> OwnerLock<O> {
    /// Creates a free lock using `time` for all deadline arithmetic.
    ///
    /// The time service is fixed for the lifetime of the lock.
    #[must_use]
    pub fn new(time: Arc<dyn TimeService>) -> Self {
        Self::build(time, None)
    }

    /// Creates a free lock whose `hook` runs once per request cleanup —
    /// i.e. every time a request reaches a terminal state and leaves the
    /// owner index.
    #[must_use]
    pub fn with_release_hook(
        time: Arc<dyn TimeService>,
        hook: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self::build(time, Some(Arc::new(hook)))
    }

    fn build(
        time: Arc<dyn TimeService>,
        release_hook: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Self {
        Self {
            core: Arc::new(LockCore {
                current: AtomicU64::new(NO_HOLDER),
                next_request_id: AtomicU64::new(1),
                queue: Mutex::new(VecDeque::new()),
                owners: DashMap::new(),
                time,
                release_hook,
            }),
        }
    }

    /// Requests the lock for `owner`, returning its promise.
    ///
    /// Never blocks. If the lock is free the request is promoted before
    /// this returns; otherwise it queues in arrival order. Re-acquiring
    /// while a request for `owner` is outstanding returns that *same*
    /// request — same promise, same deadline; `timeout` is ignored in
    /// that case.
    pub fn acquire(&self, owner: O, timeout: Duration) -> Arc<LockRequest<O>> {
        trace!(?owner, ?timeout, "acquire");

        if let Some(existing) = self.core.owners.get(&owner) {
            trace!(request = ?*existing.value(), "owner already outstanding");
            return Arc::clone(existing.value());
        }

        let deadline = self.core.time.expected_end(timeout);
        let id = self.core.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = Arc::new(LockRequest::new(
            id,
            owner.clone(),
            deadline,
            Arc::clone(&self.core.time),
            Arc::downgrade(&self.core),
        ));

        match self.core.owners.entry(owner) {
            Entry::Occupied(entry) => {
                // A concurrent acquire for the same owner won the race;
                // its request is the outstanding one.
                trace!(request = ?*entry.get(), "lost acquire race");
                return Arc::clone(entry.get());
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&request));
            }
        }

        trace!(request = ?*request, "queued new request");
        self.core.queue.lock().push_back(Arc::clone(&request));
        self.core.handoff(NO_HOLDER);
        request
    }

    /// Releases `owner`'s outstanding request.
    ///
    /// A holding request vacates the lock and the next eligible waiter is
    /// elected; a queued request is retired in place; an owner with no
    /// outstanding request is a no-op.
    pub fn release(&self, owner: &O) {
        trace!(?owner, "release");

        let Some(request) = self
            .core
            .owners
            .get(owner)
            .map(|entry| Arc::clone(entry.value()))
        else {
            trace!(?owner, "nothing to release");
            return;
        };

        let released = request.set_released();
        trace!(request = ?*request, released, "release outcome");

        if self.core.current.load(Ordering::Acquire) == request.id() {
            self.core.handoff(request.id());
        }
    }

    /// The owner currently holding the lock, or `None` when free.
    #[must_use]
    pub fn lock_owner(&self) -> Option<O> {
        self.core.lock_owner()
    }

    /// Returns `true` iff some request holds the lock.
    ///
    /// `false` does not imply an empty queue — a waiter may simply not
    /// have been promoted yet.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.core.current.load(Ordering::Acquire) != NO_HOLDER
    }

    /// Runs a deadlock scan over the pending queue.
    ///
    /// For each pending request, a timeout check runs first (timeouts
    /// preempt the more expensive detection); surviving waiters are
    /// tested against the current holder and cancelled as
    /// [`Deadlocked`](super::request::LockState::Deadlocked) when the
    /// checker reports a cycle. A free lock is a no-op.
    pub fn deadlock_check<C>(&self, checker: &C)
    where
        C: DeadlockChecker<O> + ?Sized,
    {
        let Some(holder) = self.core.current_request() else {
            return;
        };
        let pending: Vec<Arc<LockRequest<O>>> =
            self.core.queue.lock().iter().map(Arc::clone).collect();
        for request in pending {
            request.check_deadlock(checker, holder.owner());
        }
    }

    /// Returns `true` iff `owner` has an outstanding request (holding or
    /// queued, including terminal requests whose cleanup has not run).
    #[must_use]
    pub fn contains_owner(&self, owner: &O) -> bool {
        self.core.owners.contains_key(owner)
    }

    #[cfg(test)]
    pub(crate) fn queued_requests(&self, owner: &O) -> usize {
        self.core
            .queue
            .lock()
            .iter()
            .filter(|request| request.owner() == owner)
            .count()
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.core.queue.lock().len()
    }
}

impl<O: Owner> Clone for OwnerLock<O> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<O: Owner> fmt::Debug for OwnerLock<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerLock")
            .field("owner", &self.lock_owner())
            .field("pending", &self.core.queue.lock().len())
            .finish_non_exhaustive()
    }
}
