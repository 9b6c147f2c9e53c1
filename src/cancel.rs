// Copyright 2025 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::{
    done::WakerSet,
    scope::Scope,
    util::{Compact, TimeUntil},
    Cause,
};
use fnv::FnvHashMap;
use futures::future::{AbortHandle, Abortable};
use std::{
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    task::{Poll, Waker},
    time::SystemTime,
};
use tracing::trace;

/// Source of process-unique scope ids, used to key child registrations.
static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(0);

/// The shared state of one cancelable scope.
///
/// A core is `Active` until its cause is set, and `Canceled` forever after.
/// The cause transitions at most once; whichever caller wins the lock in
/// [`cancel`](CancelCore::cancel) performs the transition, and everyone else
/// no-ops. All mutable state is guarded by the core's own lock, so unrelated
/// subtrees never contend.
#[derive(Debug)]
pub(crate) struct CancelCore {
    id: u64,
    /// Set only for scopes armed with their own deadline. Immutable.
    pub(crate) deadline: Option<SystemTime>,
    /// The core of the nearest cancelable ancestor, used to deregister on
    /// cancellation. Weak: a child never keeps its parent core alive.
    parent: Option<Weak<CancelCore>>,
    state: Mutex<CoreState>,
}

#[derive(Debug, Default)]
struct CoreState {
    cause: Option<Cause>,
    /// The done-signal. Created on first observation, fired at most once.
    waiters: Option<WakerSet>,
    /// Directly-registered cancelable descendants. Cleared by cancellation;
    /// individual entries removed when a child cancels first.
    children: FnvHashMap<u64, Arc<CancelCore>>,
    /// Aborts the deadline timer task, when one is armed.
    timer: Option<AbortHandle>,
}

/// Builds a new core and registers it with the nearest cancelable ancestor of
/// `parent`, walking past value scopes.
///
/// The ancestor's prior-cancellation check and the child insertion happen
/// under one lock hold: either the ancestor was already canceled, in which
/// case the new core is canceled immediately instead of registered, or the
/// new core is reachable by the ancestor's propagation from here on.
///
/// A core built with a deadline already in the past is canceled synchronously
/// with [`Cause::DeadlineExceeded`]; otherwise its timer task is spawned on
/// the ambient tokio runtime.
pub(crate) fn build(parent: &Scope, deadline: Option<SystemTime>) -> Arc<CancelCore> {
    let anchor = parent.cancel_core();
    let core = Arc::new(CancelCore {
        id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
        deadline,
        parent: anchor.map(Arc::downgrade),
        state: Mutex::default(),
    });

    if let Some(anchor) = anchor {
        if !anchor.adopt(&core) {
            // Propagation already ran and would never reach this core.
            core.cancel(Cause::Canceled);
            return core;
        }
    }

    if let Some(deadline) = deadline {
        if deadline <= SystemTime::now() {
            core.cancel(Cause::DeadlineExceeded);
        } else {
            core.arm(deadline);
        }
    }

    core
}

impl CancelCore {
    /// Cancels this core with `cause` and propagates to all registered
    /// descendants. Idempotent: only the first effective call transitions the
    /// state, and later calls (including a late deadline fire) are no-ops.
    pub(crate) fn cancel(&self, cause: Cause) {
        let (waiters, children, timer) = {
            let mut state = self.lock();
            if state.cause.is_some() {
                return;
            }
            state.cause = Some(cause);
            (
                state.waiters.take(),
                mem::take(&mut state.children),
                state.timer.take(),
            )
        };
        trace!("[{}] Scope canceled: {}.", self.id, cause);

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(waiters) = waiters {
            waiters.wake_all();
        }

        // Children always receive Canceled: from their perspective an
        // ancestor stopped them, whatever that ancestor's own cause was. The
        // lock is not held across these calls; locks are only ever taken
        // top-down.
        if !children.is_empty() {
            trace!("[{}] Canceling {} child scopes.", self.id, children.len());
            for child in children.into_values() {
                child.cancel(Cause::Canceled);
            }
        }

        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.disown(self.id);
        }
    }

    /// The cause this core was canceled with, if it has been.
    pub(crate) fn err(&self) -> Option<Cause> {
        self.lock().cause
    }

    /// Checks for cancellation, registering `waker` to be woken at
    /// cancellation otherwise. `slot` carries the waiter's registration
    /// between polls; the done-signal is created on the first observation.
    pub(crate) fn poll_done(&self, waker: &Waker, slot: &mut Option<usize>) -> Poll<Cause> {
        let mut state = self.lock();
        if let Some(cause) = state.cause {
            // The firing of the done-signal already consumed any registered
            // slot.
            *slot = None;
            return Poll::Ready(cause);
        }
        let waiters = state.waiters.get_or_insert_with(WakerSet::default);
        match *slot {
            Some(slot) => waiters.update(slot, waker),
            None => *slot = Some(waiters.register(waker)),
        }
        Poll::Pending
    }

    /// Releases a waiter registration made by [`poll_done`](Self::poll_done).
    /// A no-op if the done-signal already fired.
    pub(crate) fn release_waiter(&self, slot: usize) {
        if let Some(waiters) = self.lock().waiters.as_mut() {
            waiters.release(slot);
        }
    }

    /// Atomically checks for prior cancellation and registers `child`.
    /// Returns false, registering nothing, if this core is already canceled.
    fn adopt(&self, child: &Arc<CancelCore>) -> bool {
        let mut state = self.lock();
        if state.cause.is_some() {
            return false;
        }
        state.children.insert(child.id, Arc::clone(child));
        true
    }

    /// Removes a canceled child from the children map. Best-effort: if this
    /// core's own cancellation already cleared the map, there is nothing to
    /// remove.
    fn disown(&self, child_id: u64) {
        let mut state = self.lock();
        if state.children.remove(&child_id).is_some() {
            state.children.compact(0.1);
        }
    }

    /// Spawns the deadline timer task. The task holds the core weakly, so an
    /// otherwise-released scope can be collected with its timer still
    /// pending; the stored [`AbortHandle`] stops the timer when the scope is
    /// canceled manually first.
    fn arm(self: &Arc<Self>, deadline: SystemTime) {
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        {
            let mut state = self.lock();
            // A parent may have propagated between registration and here;
            // the timer would only ever fire into a no-op.
            if state.cause.is_some() {
                return;
            }
            state.timer = Some(abort_handle);
        }

        let timeout = deadline.time_until();
        trace!("[{}] Arming deadline timer with timeout {:?}.", self.id, timeout);
        let core = Arc::downgrade(self);
        tokio::spawn(Abortable::new(
            async move {
                tokio::time::sleep(timeout).await;
                if let Some(core) = core.upgrade() {
                    trace!("[{}] Deadline expired.", core.id);
                    core.cancel(Cause::DeadlineExceeded);
                }
            },
            abort_registration,
        ));
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().expect("scope state lock poisoned")
    }
}

#[cfg(test)]
impl CancelCore {
    pub(crate) fn num_children(&self) -> usize {
        self.lock().children.len()
    }
}

/// Cancels its scope, releasing it from the scope tree.
///
/// Returned alongside every cancelable scope. The holder must call
/// [`cancel`](CancelHandle::cancel) when the guarded work finishes, whether
/// or not the work succeeded: until then the scope stays registered with its
/// parent, which is a leak for parents that outlive many children. Calling
/// `cancel` more than once, from any number of threads, is safe; only the
/// first effective call transitions the scope.
///
/// Dropping the handle does *not* cancel the scope.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    core: Arc<CancelCore>,
}

impl CancelHandle {
    pub(crate) fn new(core: Arc<CancelCore>) -> Self {
        CancelHandle { core }
    }

    /// Cancels the scope with [`Cause::Canceled`], waking all done-waiters
    /// and canceling every descendant scope.
    pub fn cancel(&self) {
        self.core.cancel(Cause::Canceled);
    }
}

#[test]
fn cancel_is_idempotent() {
    let (scope, handle) = Scope::background().with_cancel();
    handle.cancel();
    handle.cancel();
    assert_eq!(scope.err(), Some(Cause::Canceled));
}

#[test]
fn canceling_parent_empties_its_children() {
    let root = Scope::background();
    let (parent, parent_handle) = root.with_cancel();
    let (child, _child_handle) = parent.with_cancel();

    let parent_core = parent.cancel_core().unwrap();
    assert_eq!(parent_core.num_children(), 1);

    parent_handle.cancel();
    assert_eq!(parent_core.num_children(), 0);
    assert_eq!(child.err(), Some(Cause::Canceled));
}

#[test]
fn canceling_child_detaches_it_from_parent() {
    let root = Scope::background();
    let (parent, _parent_handle) = root.with_cancel();
    let (_child, child_handle) = parent.with_cancel();

    let parent_core = parent.cancel_core().unwrap();
    assert_eq!(parent_core.num_children(), 1);

    child_handle.cancel();
    assert_eq!(parent_core.num_children(), 0);
    assert_eq!(parent.err(), None);
}

#[test]
fn building_under_canceled_parent_registers_nothing() {
    let (parent, handle) = Scope::background().with_cancel();
    handle.cancel();

    let (child, _child_handle) = parent.with_cancel();
    assert_eq!(child.err(), Some(Cause::Canceled));
    assert_eq!(parent.cancel_core().unwrap().num_children(), 0);
}
