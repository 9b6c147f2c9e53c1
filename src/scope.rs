// Copyright 2025 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::{
    cancel::{self, CancelCore, CancelHandle},
    done::Done,
    Cause,
};
use static_assertions::assert_impl_all;
use std::{
    any::Any,
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

/// A handle to one node in a tree of cancellation scopes.
///
/// A scope bounds the lifetime of some unit of work. New scopes are derived
/// from existing ones: [`with_cancel`](Scope::with_cancel) and
/// [`with_deadline`](Scope::with_deadline) add a cancellation point,
/// [`with_value`](Scope::with_value) attaches a request-scoped value, and
/// canceling any scope cancels everything derived from it. `Scope` is a cheap
/// reference: cloning it observes the same node.
///
/// The scope should not be stored in long-lived state, because the scope will
/// be different for each unit of work in flight; pass it along with the work
/// it bounds.
#[derive(Clone, Debug)]
pub struct Scope {
    inner: Inner,
}

#[derive(Clone, Debug)]
enum Inner {
    Root(RootKind),
    Value(Arc<ValueScope>),
    Cancel(Arc<CancelScope>),
}

#[derive(Clone, Copy, Debug)]
enum RootKind {
    Background,
    Todo,
}

/// A scope carrying one type-keyed value. Transparent to cancellation.
struct ValueScope {
    parent: Scope,
    value: Box<dyn Any + Send + Sync>,
}

#[derive(Debug)]
struct CancelScope {
    /// Kept for value and deadline delegation; the cancellation tree itself
    /// links core to core.
    parent: Scope,
    core: Arc<CancelCore>,
}

assert_impl_all!(Scope: Send, Sync, Clone);

impl Scope {
    /// Returns the root scope for work that outlives any one request: never
    /// canceled, no deadline, no values.
    pub fn background() -> Self {
        Scope {
            inner: Inner::Root(RootKind::Background),
        }
    }

    /// Returns a root scope for call sites that have not yet decided which
    /// scope to thread through. Behaves exactly like
    /// [`background`](Scope::background); the distinct constructor marks the
    /// call site as unfinished.
    pub fn todo() -> Self {
        Scope {
            inner: Inner::Root(RootKind::Todo),
        }
    }

    /// Derives a scope carrying `value`, keyed by its type.
    ///
    /// The value is visible to this scope and all scopes derived from it via
    /// [`value`](Scope::value); the nearest ancestor's value wins when the
    /// same type is attached more than once. Use a dedicated newtype per
    /// use-case so unrelated code cannot collide on a key.
    ///
    /// ```
    /// use taskscope::Scope;
    ///
    /// #[derive(Debug, PartialEq)]
    /// struct RequestId(u64);
    ///
    /// let root = Scope::background();
    /// let scope = root.with_value(RequestId(42));
    /// assert_eq!(scope.value::<RequestId>(), Some(&RequestId(42)));
    /// assert_eq!(root.value::<RequestId>(), None);
    /// ```
    pub fn with_value<V: Any + Send + Sync>(&self, value: V) -> Scope {
        Scope {
            inner: Inner::Value(Arc::new(ValueScope {
                parent: self.clone(),
                value: Box::new(value),
            })),
        }
    }

    /// Derives a cancelable scope.
    ///
    /// The new scope is canceled by the returned [`CancelHandle`] or by
    /// cancellation of any ancestor, whichever happens first. The holder must
    /// call [`CancelHandle::cancel`] once the guarded work finishes.
    pub fn with_cancel(&self) -> (Scope, CancelHandle) {
        self.adopt_core(cancel::build(self, None))
    }

    /// Derives a cancelable scope that is automatically canceled with
    /// [`Cause::DeadlineExceeded`] when `deadline` passes.
    ///
    /// A deadline already in the past cancels the scope before this returns.
    /// If an ancestor's deadline is already earlier than `deadline`, the new
    /// deadline is redundant (the ancestor's expiry reaches the new scope as
    /// ordinary propagation), so no timer is armed and the scope behaves like
    /// [`with_cancel`](Scope::with_cancel).
    ///
    /// The timer runs on the ambient tokio runtime, so this must be called
    /// from within one unless the deadline is redundant or already past.
    pub fn with_deadline(&self, deadline: SystemTime) -> (Scope, CancelHandle) {
        if matches!(self.deadline(), Some(current) if current <= deadline) {
            return self.with_cancel();
        }
        self.adopt_core(cancel::build(self, Some(deadline)))
    }

    /// Derives a cancelable scope that is automatically canceled once
    /// `timeout` elapses. Sugar for [`with_deadline`](Scope::with_deadline)
    /// at `SystemTime::now() + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> (Scope, CancelHandle) {
        self.with_deadline(SystemTime::now() + timeout)
    }

    /// Returns a future that resolves with the cancellation [`Cause`] once
    /// this scope is canceled.
    ///
    /// Observation is the only way cancellation reaches running work:
    /// cooperating tasks select between their next unit of work and `done()`.
    /// For a scope with no cancelable ancestor the future never resolves.
    pub fn done(&self) -> Done {
        match self.cancel_core() {
            Some(core) => Done::new(Arc::clone(core)),
            None => Done::never(),
        }
    }

    /// Returns the cause this scope was canceled with, or `None` while it is
    /// still active. Once `Some`, the cause never changes.
    pub fn err(&self) -> Option<Cause> {
        self.cancel_core().and_then(|core| core.err())
    }

    /// Returns the deadline this scope's work must complete by, if any
    /// ancestor (or this scope itself) carries one.
    pub fn deadline(&self) -> Option<SystemTime> {
        let mut scope = self;
        loop {
            match &scope.inner {
                Inner::Root(_) => return None,
                Inner::Value(value) => scope = &value.parent,
                Inner::Cancel(cancel) => match cancel.core.deadline {
                    Some(deadline) => return Some(deadline),
                    None => scope = &cancel.parent,
                },
            }
        }
    }

    /// Looks up the value of type `T` attached to the nearest ancestor
    /// (including this scope), or `None` if no ancestor attached one.
    pub fn value<T: Any>(&self) -> Option<&T> {
        let mut scope = self;
        loop {
            match &scope.inner {
                Inner::Root(_) => return None,
                Inner::Value(value_scope) => match value_scope.value.downcast_ref() {
                    Some(value) => return Some(value),
                    None => scope = &value_scope.parent,
                },
                Inner::Cancel(cancel) => scope = &cancel.parent,
            }
        }
    }

    /// The core of the nearest cancelable scope, skipping value scopes.
    pub(crate) fn cancel_core(&self) -> Option<&Arc<CancelCore>> {
        let mut scope = self;
        loop {
            match &scope.inner {
                Inner::Root(_) => return None,
                Inner::Value(value) => scope = &value.parent,
                Inner::Cancel(cancel) => return Some(&cancel.core),
            }
        }
    }

    fn adopt_core(&self, core: Arc<CancelCore>) -> (Scope, CancelHandle) {
        let handle = CancelHandle::new(Arc::clone(&core));
        let scope = Scope {
            inner: Inner::Cancel(Arc::new(CancelScope {
                parent: self.clone(),
                core,
            })),
        };
        (scope, handle)
    }
}

impl fmt::Debug for ValueScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueScope")
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
use assert_matches::assert_matches;

#[test]
fn roots_are_inert() {
    for root in [Scope::background(), Scope::todo()] {
        assert_eq!(root.err(), None);
        assert_eq!(root.deadline(), None);
        assert_eq!(root.value::<u32>(), None);
    }
}

#[test]
fn nearest_value_wins() {
    #[derive(Debug, PartialEq)]
    struct UserId(u32);
    #[derive(Debug, PartialEq)]
    struct PageSize(u32);

    let root = Scope::background();
    let outer = root.with_value(UserId(1));
    let inner = outer.with_value(UserId(2));
    let deepest = inner.with_value(PageSize(3));

    assert_eq!(deepest.value::<UserId>(), Some(&UserId(2)));
    assert_eq!(deepest.value::<PageSize>(), Some(&PageSize(3)));
    assert_eq!(deepest.value::<String>(), None);
    assert_eq!(outer.value::<UserId>(), Some(&UserId(1)));
}

#[test]
fn values_are_visible_through_cancel_scopes() {
    #[derive(Debug, PartialEq)]
    struct UserId(u32);

    let scope = Scope::background().with_value(UserId(7));
    let (scope, _handle) = scope.with_cancel();
    assert_eq!(scope.value::<UserId>(), Some(&UserId(7)));
}

#[tokio::test]
async fn plain_cancel_scope_reports_ancestor_deadline() {
    let root = Scope::background();
    let (timed, _timed_handle) = root.with_timeout(Duration::from_secs(10));
    let (child, _child_handle) = timed.with_cancel();

    assert_matches!(child.deadline(), Some(deadline) if deadline == timed.deadline().unwrap());
    assert_eq!(root.deadline(), None);
}

#[tokio::test]
async fn redundant_deadline_arms_no_timer() {
    let root = Scope::background();
    let (timed, _timed_handle) = root.with_timeout(Duration::from_millis(50));
    let earlier = timed.deadline().unwrap();

    let (child, _child_handle) = timed.with_deadline(earlier + Duration::from_secs(10));
    assert_eq!(child.deadline(), Some(earlier));
}
