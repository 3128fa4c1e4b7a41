//! The single-assignment concurrent resolution primitive.
//!
//! A [`ResolutionBox`] starts out pending, transitions to resolved exactly
//! once, and fans the resolved value out to any number of waiting
//! continuations. Everything else in this crate (chaining, cancellation
//! wiring, blocking retrieval) is built on top of the three operations
//! [`seal`][ResolutionBox::seal], [`subscribe`][ResolutionBox::subscribe] and
//! [`peek`][ResolutionBox::peek].
//!
//! The box never blocks and never runs user code while its lock is held:
//! the pending handler queue is captured under the lock and drained after the
//! guard is released, so a handler may freely re-enter the box (for example
//! to attach another handler from inside a callback).

use std::{mem, sync::Arc};

use crate::error::Rejection;

/// The settled outcome of one chain step.
#[derive(Debug, Clone)]
pub enum Settled<T> {
    /// The step produced a value.
    Fulfilled(T),
    /// The step failed, or was cancelled (see
    /// [`ChainError::is_cancellation`][crate::ChainError::is_cancellation]).
    Rejected(Rejection),
}

impl<T> Settled<T> {
    /// The fulfilled value, if there is one.
    pub fn value(&self) -> Option<&T> {
        match self {
            Settled::Fulfilled(value) => Some(value),
            Settled::Rejected(_) => None,
        }
    }

    /// The rejection error, if there is one.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Settled::Fulfilled(_) => None,
            Settled::Rejected(error) => Some(error),
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Settled::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Settled::Rejected(_))
    }
}

type Handler<R> = Box<dyn FnOnce(Arc<R>) + Send>;

/// Continuations waiting on a pending box, in attachment order.
struct HandlerQueue<R> {
    bodies: Vec<Handler<R>>,
}

impl<R> HandlerQueue<R> {
    fn new() -> Self {
        Self { bodies: Vec::new() }
    }

    fn append(&mut self, body: Handler<R>) {
        self.bodies.push(body);
    }
}

enum Sealant<R> {
    Pending(HandlerQueue<R>),
    Resolved(Arc<R>),
}

/// A thread-safe container that holds either a queue of waiting continuations
/// or, once [`seal`][Self::seal]ed, a result that never changes again.
///
/// Boxes are usually not touched directly; [`promise`][crate::promise] wraps
/// a `ResolutionBox<Settled<T>>` into the [`Resolver`][crate::Resolver] /
/// [`Promise`][crate::Promise] pair. The box is generic over the resolved
/// type so that already-known values can be boxed just as well.
pub struct ResolutionBox<R> {
    sealant: crate::sync::Mutex<Sealant<R>>,
}

impl<R> ResolutionBox<R> {
    /// Creates a pending box with an empty handler queue.
    pub fn pending() -> Self {
        Self {
            sealant: crate::sync::Mutex::new(Sealant::Pending(HandlerQueue::new())),
        }
    }

    /// Creates a box that is already resolved to `value`.
    pub fn resolved(value: R) -> Self {
        Self {
            sealant: crate::sync::Mutex::new(Sealant::Resolved(Arc::new(value))),
        }
    }

    /// Resolves the box with `value`.
    ///
    /// A result settles once: if the box is already resolved this is a no-op,
    /// not an error. On the pending-to-resolved transition, the handler queue
    /// is captured and emptied under the lock, and every captured handler is
    /// then invoked with the result, in attachment order, strictly after the
    /// lock is released.
    pub fn seal(&self, value: R) {
        let value = Arc::new(value);
        let queue = {
            let mut sealant = self.sealant.lock();
            if matches!(&*sealant, Sealant::Resolved(_)) {
                drop(sealant);
                log::debug!("discarding seal of an already-resolved box");
                return;
            }
            match mem::replace(&mut *sealant, Sealant::Resolved(value.clone())) {
                Sealant::Pending(queue) => queue,
                Sealant::Resolved(_) => unreachable!(),
            }
        };
        // Handlers run after the guard is gone; a body that re-enters the box
        // cannot deadlock against us.
        for body in queue.bodies {
            body(value.clone());
        }
    }

    /// Attaches a continuation to this box.
    ///
    /// If the box is pending, `body` is queued and will fire exactly once,
    /// after resolution, in attachment order. If the box is already resolved,
    /// `body` is invoked immediately and synchronously in the calling thread,
    /// outside the lock.
    pub fn subscribe<F>(&self, body: F)
    where
        F: FnOnce(Arc<R>) + Send + 'static,
    {
        let resolved = {
            let mut sealant = self.sealant.lock();
            match &mut *sealant {
                Sealant::Pending(queue) => {
                    queue.append(Box::new(body));
                    return;
                }
                Sealant::Resolved(value) => value.clone(),
            }
        };
        body(resolved);
    }

    /// Non-blocking peek at the current result.
    ///
    /// Never invokes user code.
    pub fn peek(&self) -> Option<Arc<R>> {
        match &*self.sealant.lock() {
            Sealant::Pending(_) => None,
            Sealant::Resolved(value) => Some(value.clone()),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(&*self.sealant.lock(), Sealant::Resolved(_))
    }
}

impl<R> Drop for ResolutionBox<R> {
    fn drop(&mut self) {
        // Dropping a box that never resolved usually means a resolver was
        // leaked or forgotten. Not an error (the invariant "settles at most
        // once" still holds), but worth surfacing.
        if let Sealant::Pending(queue) = self.sealant.get_mut() {
            log::warn!(
                "resolution box dropped while still pending ({} handler(s) never fired)",
                queue.bodies.len()
            );
        }
    }
}
