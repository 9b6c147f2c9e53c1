// Copyright 2025 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! *Disclaimer*: This is not an official Google product.
//!
//! taskscope is a hierarchical cancellation primitive: a tree of scopes in
//! which cancelling or timing out a scope propagates cancellation, exactly
//! once, to every scope derived from it, while values attached to a scope are
//! visible to all descendants.
//!
//! Some features of taskscope:
//! - Cascading cancellation: cancelling a scope cancels its entire subtree.
//!   Scopes outside the subtree, including the canceled scope's ancestors and
//!   siblings, are unaffected.
//! - Deadlines and timeouts: a scope built with a deadline cancels itself
//!   when the deadline passes, and inherits any earlier ancestor deadline.
//!   A manual cancel beats a pending deadline permanently.
//! - Request-scoped values: type-keyed values with chained,
//!   nearest-ancestor-wins lookup.
//!
//! Cancellation is cooperative and advisory. A canceled scope only records
//! its [`Cause`] and wakes every task waiting on [`Scope::done`]; the work
//! holding the scope is responsible for noticing and stopping. Nothing is
//! retried, scheduled, or preempted here.
//!
//! ## Usage
//!
//! A worker selects between its next unit of work and the scope's
//! done-signal:
//!
//! ```rust
//! use std::time::Duration;
//! use taskscope::{Cause, Scope};
//!
//! async fn drain<W: Unpin + futures::Stream<Item = u64>>(
//!     scope: Scope,
//!     mut work: W,
//! ) -> Option<Cause> {
//!     use futures::StreamExt;
//!     loop {
//!         tokio::select! {
//!             cause = scope.done() => return Some(cause),
//!             unit = work.next() => match unit {
//!                 Some(unit) => { /* process `unit` */ }
//!                 None => return None,
//!             },
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let root = Scope::background();
//!     let (scope, handle) = root.with_timeout(Duration::from_millis(50));
//!
//!     let outcome = drain(scope, futures::stream::pending()).await;
//!     assert_eq!(outcome, Some(Cause::DeadlineExceeded));
//!
//!     // Cancel even after the deadline fired: it is a no-op then, but the
//!     // habit releases scopes that finish early.
//!     handle.cancel();
//! }
//! ```
//!
//! A request handler derives one scope per request from a long-lived root and
//! cancels it when the request completes, regardless of outcome:
//!
//! ```rust
//! use std::time::Duration;
//! use taskscope::Scope;
//!
//! # async fn query_backend(_scope: &Scope) -> Result<String, String> { Ok("ok".into()) }
//! async fn handle_request(server_scope: &Scope, deadline: Duration) -> Result<String, String> {
//!     let (scope, handle) = server_scope.with_timeout(deadline);
//!     let result = tokio::select! {
//!         cause = scope.done() => Err(cause.to_string()),
//!         result = query_backend(&scope) => result,
//!     };
//!     handle.cancel();
//!     result
//! }
//! #
//! # #[tokio::main]
//! # async fn main() {
//! #     let root = Scope::background();
//! #     assert!(handle_request(&root, Duration::from_secs(1)).await.is_ok());
//! # }
//! ```
//!
//! ## Obligations
//!
//! Every cancelable scope stays registered with its nearest cancelable
//! ancestor until it is canceled. Forgetting to cancel a scope is not a
//! fault, but the scope (and its subtree) remains reachable from the parent
//! for the parent's entire lifetime, which is a leak under parents that
//! outlive many children. Always call [`CancelHandle::cancel`] when the
//! guarded work is over.

#![deny(missing_docs)]

mod cancel;
mod done;
mod scope;
mod util;

pub use cancel::CancelHandle;
pub use done::Done;
pub use scope::Scope;

/// The terminal reason a scope stopped being active.
///
/// Exactly two causes exist. Causes only flow from parent to child: a scope
/// canceled by an ancestor's propagation always reports
/// [`Canceled`](Cause::Canceled), even when the ancestor itself timed out.
/// Only the scope whose own timer fired reports
/// [`DeadlineExceeded`](Cause::DeadlineExceeded).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cause {
    /// The scope was canceled, explicitly via its [`CancelHandle`] or by an
    /// ancestor's cancellation.
    #[error("the scope was canceled")]
    Canceled,
    /// The scope's own deadline passed.
    #[error("the scope deadline was exceeded")]
    DeadlineExceeded,
}
