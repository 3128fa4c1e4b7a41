//! Chaining of asynchronous steps.
//!
//! [`promise`] creates a connected [`Resolver`] / [`Promise`] pair around one
//! [`ResolutionBox`]. The combinators on [`Promise`] are deliberately thin:
//! every one of them is expressed purely in terms of
//! [`subscribe`][Promise::subscribe], [`peek`][Promise::peek] and sealing the
//! next box, and every continuation body is executed through a caller-chosen
//! [`Dispatcher`].
//!
//! Blocking retrieval ([`Promise::wait`]) is built *outside* the box, from a
//! condition variable that a subscribed handler signals; the box itself never
//! blocks.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    dispatch::Dispatcher,
    error::{CatchPolicy, ChainError, Rejection},
    resolution::{ResolutionBox, Settled},
    sync::{Condvar, Mutex},
};

/// Creates a connected pair of [`Resolver`] and [`Promise`].
pub fn promise<T>() -> (Resolver<T>, Promise<T>) {
    let inner = Arc::new(ResolutionBox::pending());
    (
        Resolver {
            inner: inner.clone(),
        },
        Promise { inner },
    )
}

/// The write half: seals the shared box with a result.
///
/// Cloneable so that completion and rejection hooks can live in different
/// places; whichever seals first wins, the rest become no-ops.
pub struct Resolver<T> {
    inner: Arc<ResolutionBox<Settled<T>>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Resolver<T> {
    /// Fulfills the promise with a value.
    pub fn fulfill(&self, value: T) {
        self.inner.seal(Settled::Fulfilled(value));
    }

    /// Rejects the promise with an error.
    pub fn reject(&self, error: Rejection) {
        self.inner.seal(Settled::Rejected(error));
    }

    /// Rejects the promise with a concrete error value.
    pub fn reject_with<E: ChainError + 'static>(&self, error: E) {
        self.reject(Arc::new(error));
    }

    /// Resolves the promise with an already-built result.
    pub fn resolve(&self, settled: Settled<T>) {
        self.inner.seal(settled);
    }
}

/// The read half: a result that is not known yet, or already settled.
///
/// Cloneable; every clone observes the same settlement.
pub struct Promise<T> {
    inner: Arc<ResolutionBox<Settled<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Promise<T> {
    /// Creates a promise and hands its resolver to `body`.
    pub fn new(body: impl FnOnce(Resolver<T>)) -> Self {
        let (resolver, promise) = promise();
        body(resolver);
        promise
    }

    /// Creates a promise that is already fulfilled.
    pub fn fulfilled(value: T) -> Self {
        Self {
            inner: Arc::new(ResolutionBox::resolved(Settled::Fulfilled(value))),
        }
    }

    /// Creates a promise that is already rejected.
    pub fn rejected(error: Rejection) -> Self {
        Self {
            inner: Arc::new(ResolutionBox::resolved(Settled::Rejected(error))),
        }
    }

    /// Attaches a continuation.
    ///
    /// Pending: `body` fires exactly once, after settlement, in attachment
    /// order relative to other subscribers. Already settled: `body` runs
    /// immediately, synchronously, in the calling thread.
    pub fn subscribe<F>(&self, body: F)
    where
        F: FnOnce(Arc<Settled<T>>) + Send + 'static,
    {
        self.inner.subscribe(body);
    }

    /// Non-blocking peek at the result. Never invokes user code.
    pub fn peek(&self) -> Option<Arc<Settled<T>>> {
        self.inner.peek()
    }

    pub fn is_settled(&self) -> bool {
        self.inner.is_resolved()
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// Blocks the calling thread until the promise settles.
    pub fn wait(&self) -> Arc<Settled<T>> {
        if let Some(settled) = self.peek() {
            return settled;
        }
        let gate = Arc::new((Mutex::new(None), Condvar::new()));
        let signal = gate.clone();
        self.subscribe(move |settled| {
            *signal.0.lock() = Some(settled);
            signal.1.notify_all();
        });

        let (slot, condvar) = &*gate;
        let mut guard = slot.lock();
        loop {
            if let Some(settled) = guard.take() {
                return settled;
            }
            guard = condvar.wait(guard);
        }
    }

    /// Blocks until the promise settles or `timeout` elapses; `None` on
    /// timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Arc<Settled<T>>> {
        if let Some(settled) = self.peek() {
            return Some(settled);
        }
        let gate = Arc::new((Mutex::new(None), Condvar::new()));
        let signal = gate.clone();
        self.subscribe(move |settled| {
            *signal.0.lock() = Some(settled);
            signal.1.notify_all();
        });

        let (slot, condvar) = &*gate;
        let deadline = Instant::now() + timeout;
        let mut guard = slot.lock();
        loop {
            if let Some(settled) = guard.take() {
                return Some(settled);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = condvar.wait_timeout(guard, deadline - now);
            guard = next;
        }
    }

    /// Seals `resolver` with this promise's eventual result.
    pub(crate) fn pipe(&self, resolver: Resolver<T>)
    where
        T: Clone,
    {
        self.subscribe(move |settled| resolver.resolve((*settled).clone()));
    }

    /// Chains an asynchronous step: when this promise fulfills, `body` runs
    /// on `on` and the promise it returns feeds the result.
    ///
    /// A rejection bypasses `body` and flows through unchanged.
    pub fn then_on<U, F>(&self, on: &Arc<dyn Dispatcher>, body: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> Promise<U> + Send + 'static,
    {
        let (resolver, next) = promise();
        let on = Arc::clone(on);
        self.subscribe(move |settled| {
            if let Settled::Rejected(error) = &*settled {
                resolver.reject(error.clone());
                return;
            }
            on.run(Box::new(move || {
                if let Settled::Fulfilled(value) = &*settled {
                    body(value).pipe(resolver);
                }
            }));
        });
        next
    }

    /// Chains a synchronous transformation of the fulfilled value, run on
    /// `on`. A rejection flows through unchanged.
    pub fn map_on<U, F>(&self, on: &Arc<dyn Dispatcher>, body: F) -> Promise<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let (resolver, next) = promise();
        let on = Arc::clone(on);
        self.subscribe(move |settled| {
            if let Settled::Rejected(error) = &*settled {
                resolver.reject(error.clone());
                return;
            }
            on.run(Box::new(move || {
                if let Settled::Fulfilled(value) = &*settled {
                    resolver.fulfill(body(value));
                }
            }));
        });
        next
    }

    /// Chains a recovery step: a rejection the policy admits runs `body` on
    /// `on`, and the promise it returns replaces the failed chain. Fulfilled
    /// results, and rejections the policy skips, flow through unchanged.
    pub fn recover_on<F>(&self, on: &Arc<dyn Dispatcher>, policy: CatchPolicy, body: F) -> Promise<T>
    where
        T: Clone,
        F: FnOnce(&Rejection) -> Promise<T> + Send + 'static,
    {
        let (resolver, next) = promise();
        let on = Arc::clone(on);
        self.subscribe(move |settled| {
            let recoverable = match &*settled {
                Settled::Rejected(error) => policy.handles(error),
                Settled::Fulfilled(_) => false,
            };
            if !recoverable {
                resolver.resolve((*settled).clone());
                return;
            }
            on.run(Box::new(move || {
                if let Settled::Rejected(error) = &*settled {
                    body(error).pipe(resolver);
                }
            }));
        });
        next
    }

    /// Terminal rejection handler, run on `on` for rejections the policy
    /// admits. With the default policy, cancellation-classified errors are
    /// skipped (a cancelled chain has nothing to report); pass
    /// [`CatchPolicy::AllErrors`] to see those too.
    pub fn catch_on<F>(&self, on: &Arc<dyn Dispatcher>, policy: CatchPolicy, body: F)
    where
        F: FnOnce(&Rejection) + Send + 'static,
    {
        let on = Arc::clone(on);
        self.subscribe(move |settled| {
            let wants = match &*settled {
                Settled::Rejected(error) => policy.handles(error),
                Settled::Fulfilled(_) => false,
            };
            if !wants {
                return;
            }
            on.run(Box::new(move || {
                if let Settled::Rejected(error) = &*settled {
                    body(error);
                }
            }));
        });
    }
}
