use crate::{cancel::CancelCore, Cause};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

/// A future that resolves with the [`Cause`] of cancellation once its scope is
/// canceled.
///
/// Returned by [`Scope::done`](crate::Scope::done). Any number of `Done`
/// futures can observe the same scope concurrently; each is woken exactly once
/// when the scope is canceled. A `Done` for a scope with no cancelable
/// ancestor never resolves.
#[derive(Debug)]
pub struct Done {
    core: Option<Arc<CancelCore>>,
    slot: Option<usize>,
}

impl Done {
    pub(crate) fn new(core: Arc<CancelCore>) -> Self {
        Done {
            core: Some(core),
            slot: None,
        }
    }

    /// A `Done` with nothing to observe. Always pending.
    pub(crate) fn never() -> Self {
        Done {
            core: None,
            slot: None,
        }
    }
}

impl Future for Done {
    type Output = Cause;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Cause> {
        let this = &mut *self;
        match &this.core {
            Some(core) => core.poll_done(cx.waker(), &mut this.slot),
            None => Poll::Pending,
        }
    }
}

/// Releases this observer's waker slot so the scope doesn't accumulate wakers
/// for observers that gave up waiting.
impl Drop for Done {
    fn drop(&mut self) {
        if let (Some(core), Some(slot)) = (&self.core, self.slot) {
            core.release_waiter(slot);
        }
    }
}

/// The wakers of all tasks currently waiting on one scope's done-signal.
///
/// Slot-addressed so that a waiter can update its waker in place across polls
/// and release its entry on drop. The whole set is taken out of the scope's
/// state and woken exactly once, at cancellation.
#[derive(Debug, Default)]
pub(crate) struct WakerSet {
    wakers: Vec<Option<Waker>>,
    vacant: Vec<usize>,
}

impl WakerSet {
    /// Adds a waker, returning the slot to update or release it with.
    pub(crate) fn register(&mut self, waker: &Waker) -> usize {
        let waker = Some(waker.clone());
        match self.vacant.pop() {
            Some(slot) => {
                self.wakers[slot] = waker;
                slot
            }
            None => {
                self.wakers.push(waker);
                self.wakers.len() - 1
            }
        }
    }

    /// Replaces the waker in `slot`, unless the existing one would already
    /// wake the same task.
    pub(crate) fn update(&mut self, slot: usize, waker: &Waker) {
        match &mut self.wakers[slot] {
            Some(existing) if existing.will_wake(waker) => {}
            registered => *registered = Some(waker.clone()),
        }
    }

    /// Empties `slot` and marks it for reuse.
    pub(crate) fn release(&mut self, slot: usize) {
        self.wakers[slot] = None;
        self.vacant.push(slot);
    }

    /// Wakes every registered waiter. Consumes the set: a done-signal fires
    /// only once.
    pub(crate) fn wake_all(self) {
        for waker in self.wakers.into_iter().flatten() {
            waker.wake();
        }
    }
}

#[cfg(test)]
use futures_test::task::{new_count_waker, noop_waker};

#[test]
fn released_slots_are_reused() {
    let mut wakers = WakerSet::default();
    let waker = noop_waker();

    let first = wakers.register(&waker);
    let second = wakers.register(&waker);
    assert_ne!(first, second);

    wakers.release(first);
    assert_eq!(wakers.register(&waker), first);
}

#[test]
fn wake_all_skips_released_slots() {
    let mut wakers = WakerSet::default();
    let (woken, count) = new_count_waker();
    let (released, released_count) = new_count_waker();

    wakers.register(&woken);
    let slot = wakers.register(&released);
    wakers.release(slot);

    wakers.wake_all();
    assert_eq!(count, 1);
    assert_eq!(released_count, 0);
}
