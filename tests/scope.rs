use assert_matches::assert_matches;
use futures::{future::join_all, prelude::*};
use futures_test::task::noop_context;
use std::{
    task::Poll,
    time::{Duration, SystemTime},
};
use taskscope::{Cause, Scope};
use tokio::time;

/// Lets already-woken tasks (timer fires, propagation observers) run to
/// completion on the current-thread test runtime.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn canceling_a_subtree_spares_everything_outside_it() {
    let root = Scope::background();
    let (c1, c1_handle) = root.with_cancel();
    let (c2, _c2_handle) = c1.with_cancel();
    let (sibling, _sibling_handle) = root.with_cancel();

    c1_handle.cancel();

    assert_eq!(c1.err(), Some(Cause::Canceled));
    assert_eq!(c2.err(), Some(Cause::Canceled));
    assert_eq!(sibling.err(), None);
    assert_eq!(root.err(), None);
}

#[test]
fn concurrent_cancels_race_to_a_single_transition() {
    let (scope, handle) = Scope::background().with_cancel();

    std::thread::scope(|threads| {
        for _ in 0..8 {
            let handle = handle.clone();
            threads.spawn(move || handle.cancel());
        }
    });

    assert_eq!(scope.err(), Some(Cause::Canceled));
}

#[tokio::test(start_paused = true)]
async fn canceling_a_child_never_propagates_upward() {
    let root = Scope::background();
    let (parent, _parent_handle) = root.with_cancel();
    let (child, child_handle) = parent.with_cancel();
    let (sibling, _sibling_handle) = parent.with_cancel();

    child_handle.cancel();

    assert_eq!(child.err(), Some(Cause::Canceled));
    assert_eq!(parent.err(), None);
    assert_eq!(sibling.err(), None);
}

#[tokio::test(start_paused = true)]
async fn deadline_fires_without_an_explicit_cancel() {
    let root = Scope::background();
    let (scope, _handle) = root.with_timeout(Duration::from_millis(50));

    assert_eq!(scope.err(), None);

    time::advance(Duration::from_millis(60)).await;
    assert_eq!(scope.done().await, Cause::DeadlineExceeded);
    assert_eq!(scope.err(), Some(Cause::DeadlineExceeded));
}

#[tokio::test(start_paused = true)]
async fn manual_cancel_before_the_deadline_wins_permanently() {
    let root = Scope::background();
    let (scope, handle) = root.with_timeout(Duration::from_millis(50));

    time::advance(Duration::from_millis(10)).await;
    handle.cancel();
    assert_eq!(scope.err(), Some(Cause::Canceled));

    // The timer must not overwrite the cause when its deadline passes.
    time::advance(Duration::from_millis(60)).await;
    settle().await;
    assert_eq!(scope.err(), Some(Cause::Canceled));
}

#[tokio::test(start_paused = true)]
async fn deriving_from_a_canceled_parent_cancels_immediately() {
    let root = Scope::background();
    let (parent, handle) = root.with_cancel();
    handle.cancel();

    let (child, _child_handle) = parent.with_cancel();
    assert_eq!(child.err(), Some(Cause::Canceled));

    let (timed, _timed_handle) = parent.with_timeout(Duration::from_secs(10));
    assert_eq!(timed.err(), Some(Cause::Canceled));
}

#[tokio::test(start_paused = true)]
async fn cancellation_reaches_through_value_scopes() {
    #[derive(Debug, PartialEq)]
    struct Attempt(u32);

    let root = Scope::background();
    let (c1, c1_handle) = root.with_cancel();
    let valued = c1.with_value(Attempt(1)).with_value(Attempt(2));
    let (c2, _c2_handle) = valued.with_cancel();

    assert_eq!(c2.value::<Attempt>(), Some(&Attempt(2)));

    c1_handle.cancel();
    assert_eq!(c2.err(), Some(Cause::Canceled));
    assert_eq!(valued.err(), Some(Cause::Canceled));
}

#[tokio::test(start_paused = true)]
async fn past_deadline_cancels_synchronously() {
    let root = Scope::background();
    let deadline = SystemTime::now() - Duration::from_secs(1);
    let (scope, _handle) = root.with_deadline(deadline);

    assert_eq!(scope.err(), Some(Cause::DeadlineExceeded));
    assert_eq!(scope.done().await, Cause::DeadlineExceeded);
}

#[tokio::test(start_paused = true)]
async fn later_deadline_defers_to_the_ancestor() {
    let root = Scope::background();
    let (outer, _outer_handle) = root.with_timeout(Duration::from_millis(50));
    let (inner, _inner_handle) = outer.with_timeout(Duration::from_secs(10));

    assert_eq!(inner.deadline(), outer.deadline());

    time::advance(Duration::from_millis(60)).await;
    assert_eq!(outer.done().await, Cause::DeadlineExceeded);
    assert_eq!(inner.done().await, Cause::Canceled);
}

#[tokio::test(start_paused = true)]
async fn end_to_end_subtree_cancellation() {
    let root = Scope::background();
    let (c1, c1_handle) = root.with_cancel();
    let (c2, _c2_handle) = c1.with_cancel();
    let (d1, _d1_handle) = c1.with_timeout(Duration::from_millis(200));

    time::advance(Duration::from_millis(50)).await;
    c1_handle.cancel();

    assert_eq!(c1.err(), Some(Cause::Canceled));
    assert_eq!(c2.err(), Some(Cause::Canceled));
    // D1 was canceled well before its own timer would have fired.
    assert_eq!(d1.err(), Some(Cause::Canceled));

    time::advance(Duration::from_millis(200)).await;
    settle().await;
    assert_eq!(d1.err(), Some(Cause::Canceled));
}

#[tokio::test(start_paused = true)]
async fn done_wakes_every_waiter() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("trace").try_init();

    let root = Scope::background();
    let (scope, handle) = root.with_cancel();

    let waiters = (0..16)
        .map(|_| {
            let scope = scope.clone();
            tokio::spawn(async move { scope.done().await })
        })
        .collect::<Vec<_>>();
    // Let every waiter register before the cancellation fires.
    settle().await;

    handle.cancel();
    for cause in join_all(waiters).await {
        assert_eq!(cause?, Cause::Canceled);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn done_resolves_for_waiters_that_arrive_late() {
    let root = Scope::background();
    let (scope, handle) = root.with_cancel();
    handle.cancel();

    assert_eq!(scope.done().await, Cause::Canceled);
}

#[test]
fn root_done_never_resolves() {
    let root = Scope::background();
    let mut done = root.done();
    assert_matches!(done.poll_unpin(&mut noop_context()), Poll::Pending);

    // A chain of pure value scopes has no cancellation point either.
    let valued = root.with_value(1u32);
    let mut done = valued.done();
    assert_matches!(done.poll_unpin(&mut noop_context()), Poll::Pending);
}

#[test]
fn dropping_a_done_future_does_not_disturb_other_waiters() {
    let (scope, handle) = Scope::background().with_cancel();

    let mut abandoned = scope.done();
    let mut kept = scope.done();
    assert_matches!(abandoned.poll_unpin(&mut noop_context()), Poll::Pending);
    assert_matches!(kept.poll_unpin(&mut noop_context()), Poll::Pending);

    drop(abandoned);
    handle.cancel();
    assert_matches!(
        kept.poll_unpin(&mut noop_context()),
        Poll::Ready(Cause::Canceled)
    );
}

#[test]
fn causes_render_for_reporting() {
    assert_eq!(Cause::Canceled.to_string(), "the scope was canceled");
    assert_eq!(
        Cause::DeadlineExceeded.to_string(),
        "the scope deadline was exceeded"
    );
}
