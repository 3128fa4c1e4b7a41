//! Single-assignment result boxes and cooperative cancellation for chained
//! asynchronous work.
//!
//! (if you're looking for `async`/`await` futures, use an async runtime
//! instead; this library is for callback-style chains driven by plain
//! threads, where the caller decides what executes where by injecting a
//! [`Dispatcher`])
//!
//! # Overview
//!
//! Two primitives carry the whole library:
//!
//! ## Resolution boxes
//!
//! A [`ResolutionBox`] represents a result that is not known yet. It starts
//! pending, transitions to resolved exactly once ("sealing"; later seals are
//! no-ops, not errors), and fans the result out to any number of subscribed
//! continuations: handlers attached before resolution fire once, in
//! attachment order, after resolution; handlers attached later fire
//! immediately in the attaching thread. The box never blocks and never runs
//! user code while its lock is held. [`promise`] wraps a box into the
//! [`Resolver`] / [`Promise`] pair that the chaining combinators
//! ([`Promise::then_on`], [`Promise::map_on`], [`Promise::recover_on`],
//! [`Promise::catch_on`]) are built on.
//!
//! ## Cancellation contexts
//!
//! A [`CancelContext`] tracks every cancellable unit of work in one chain (or
//! in several chains cross-linked into one graph). Cancelling it records an
//! error, asks every registered task to stop, rejects every promise that is
//! still pending, and recurses into linked child contexts; an explicit
//! visited set keeps that terminating even when two contexts link each other.
//! Cancellation is cooperative: code that is already running is never
//! interrupted. [`CancellablePromise`] wires a promise chain into a context.
//!
//! # Usage
//!
//! Chaining steps, with continuations executed by a worker thread:
//!
//! ```
//! use std::sync::Arc;
//! use sealbox::{promise, Dispatcher, WorkerDispatcher};
//!
//! let on: Arc<dyn Dispatcher> =
//!     Arc::new(WorkerDispatcher::builder().name("continuations").spawn().unwrap());
//!
//! let (resolver, answer) = promise::<u32>();
//! let doubled = answer.map_on(&on, |n| n * 2);
//! resolver.fulfill(21);
//! assert_eq!(doubled.wait().value(), Some(&42));
//! ```
//!
//! Cancelling a chain rejects its pending promises:
//!
//! ```
//! use sealbox::{promise, CancellablePromise};
//!
//! let (resolver, pending) = promise::<()>();
//! let work = CancellablePromise::new(pending);
//! work.register(None, &resolver);
//!
//! work.cancel();
//!
//! let settled = work.wait();
//! assert!(settled.rejection().unwrap().is_cancellation());
//! ```

mod cancel;
mod cancellable;
mod chain;
mod dispatch;
mod error;
mod resolution;
pub mod sync;

pub use cancel::{CancelContext, CancelItemList, CancellableTask, RejectFn};
pub use cancellable::CancellablePromise;
pub use chain::{promise, Promise, Resolver};
pub use dispatch::{Dispatcher, InlineDispatcher, WorkerDispatcher, WorkerDispatcherBuilder};
pub use error::{Cancelled, CatchPolicy, ChainError, Rejection, TimedOut};
pub use resolution::{ResolutionBox, Settled};
