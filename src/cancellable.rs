//! Promises wired into a cancellation context.
//!
//! A [`CancellablePromise`] pairs a [`Promise`] with the shared
//! [`CancelContext`] of its chain and with the node-local
//! [`CancelItemList`] recording what this particular node registered.
//! Chaining keeps all three in step: a node that settles normally removes
//! exactly its own registrations from the context, a node that produces a
//! nested chain cross-links that chain's context, and a `cancel` anywhere in
//! the chain rejects every promise that is still pending.

use std::sync::Arc;

use crate::{
    cancel::{CancelContext, CancelItemList, CancellableTask},
    chain::{promise, Promise, Resolver},
    dispatch::Dispatcher,
    error::Rejection,
    resolution::Settled,
};

/// A failable, cancellable asynchronous result.
///
/// All promises chained from one `CancellablePromise` share a single
/// [`CancelContext`]; cancelling any of them tears the whole chain down.
pub struct CancellablePromise<T> {
    promise: Promise<T>,
    context: Arc<CancelContext>,
    items: Arc<CancelItemList>,
}

impl<T: Send + Sync + 'static> CancellablePromise<T> {
    /// Wraps a promise in a fresh cancellation context.
    pub fn new(promise: Promise<T>) -> Self {
        Self::with_context(promise, CancelContext::new())
    }

    /// Wraps a promise into an existing context, joining that chain.
    pub fn with_context(promise: Promise<T>, context: Arc<CancelContext>) -> Self {
        Self {
            promise,
            context,
            items: Arc::new(CancelItemList::new()),
        }
    }

    /// Creates a cancellable promise around a cancellable operation.
    ///
    /// `body` receives the resolver for the new promise. When the chain is
    /// cancelled, `task` is asked to stop and the promise, if still pending,
    /// is rejected with the cancellation error.
    pub fn from_task(task: Arc<dyn CancellableTask>, body: impl FnOnce(Resolver<T>)) -> Self {
        let (resolver, promise) = promise();
        let this = Self::new(promise);
        this.register(Some(task), &resolver);
        body(resolver);
        this
    }

    /// Registers a task and/or this node's reject hook with the chain's
    /// context.
    ///
    /// If the context is already cancelled, the task is stopped and the
    /// resolver rejected before this returns.
    pub fn register(&self, task: Option<Arc<dyn CancellableTask>>, resolver: &Resolver<T>) {
        let resolver = resolver.clone();
        self.context.append_task(
            task,
            Some(Box::new(move |error| resolver.reject(error))),
            &self.items,
        );
    }

    /// The underlying promise.
    pub fn promise(&self) -> &Promise<T> {
        &self.promise
    }

    /// The chain's shared cancellation context.
    pub fn context(&self) -> &Arc<CancelContext> {
        &self.context
    }

    /// Cancels the whole chain with the default cancellation error.
    pub fn cancel(&self) {
        self.context.cancel();
    }

    /// Cancels the whole chain with an explicit error.
    pub fn cancel_with(&self, error: Rejection) {
        self.context.cancel_with(error);
    }

    /// True iff every registered unit of work in the chain reports cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.context.is_cancelled()
    }

    /// True once `cancel` has been requested anywhere in the chain.
    pub fn cancel_attempted(&self) -> bool {
        self.context.cancel_attempted()
    }

    /// The chain's recorded cancellation error, if any.
    pub fn cancelled_error(&self) -> Option<Rejection> {
        self.context.cancelled_error()
    }

    /// Blocks until this node settles.
    pub fn wait(&self) -> Arc<Settled<T>> {
        self.promise.wait()
    }

    /// Chains a cancellable step onto this one, sharing the cancellation
    /// context.
    ///
    /// When this node fulfills, its own registrations are removed from the
    /// context first; if a cancellation already raced in, the next node is
    /// rejected with the recorded error and `body` never runs. Otherwise
    /// `body` runs on `on`, and the chain it returns is cross-linked into
    /// this context so a later `cancel` reaches it too.
    pub fn then_cancellable_on<U, F>(
        &self,
        on: &Arc<dyn Dispatcher>,
        body: F,
    ) -> CancellablePromise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> CancellablePromise<U> + Send + 'static,
    {
        let (resolver, next) = promise();
        let node_items = Arc::new(CancelItemList::new());
        let context = self.context.clone();
        let parent_items = self.items.clone();
        let link_items = node_items.clone();
        let on = Arc::clone(on);

        self.promise.subscribe(move |settled| {
            if let Settled::Rejected(error) = &*settled {
                resolver.reject(error.clone());
                return;
            }
            on.run(Box::new(move || {
                if let Some(error) = context.remove_items(&parent_items, true) {
                    resolver.reject(error);
                    return;
                }
                if let Settled::Fulfilled(value) = &*settled {
                    let child = body(value);
                    context.append_child(child.context(), &link_items);
                    child.promise.pipe(resolver);
                }
            }));
        });

        CancellablePromise {
            promise: next,
            context: self.context.clone(),
            items: node_items,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex as StdMutex,
    };

    use crate::error::Cancelled;

    use super::*;

    /// Queues dispatched bodies until released, to pin down orderings that
    /// would otherwise be timing-dependent.
    #[derive(Default)]
    struct GateDispatcher {
        held: StdMutex<Vec<Box<dyn FnOnce() + Send>>>,
    }

    impl GateDispatcher {
        fn release(&self) {
            let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
            for body in held {
                body();
            }
        }
    }

    impl Dispatcher for GateDispatcher {
        fn run(&self, body: Box<dyn FnOnce() + Send>) {
            self.held.lock().unwrap().push(body);
        }
    }

    fn inline() -> Arc<dyn Dispatcher> {
        Arc::new(crate::dispatch::InlineDispatcher)
    }

    #[test]
    fn cancel_rejects_a_pending_node() {
        let (resolver, pending) = promise::<i32>();
        let work = CancellablePromise::new(pending);
        work.register(None, &resolver);

        work.cancel();

        let settled = work.wait();
        assert!(settled.rejection().unwrap().is_cancellation());
        assert!(work.cancel_attempted());
    }

    #[test]
    fn from_task_stops_the_underlying_work() {
        struct Flag(AtomicBool);

        impl CancellableTask for Flag {
            fn cancel(&self) {
                self.0.store(true, Ordering::Release);
            }

            fn is_cancelled(&self) -> bool {
                self.0.load(Ordering::Acquire)
            }
        }

        let task = Arc::new(Flag(AtomicBool::new(false)));
        let work: CancellablePromise<i32> =
            CancellablePromise::from_task(task.clone(), |_resolver| {});

        work.cancel();

        assert!(task.is_cancelled());
        assert!(work.is_cancelled());
        assert!(work.wait().rejection().unwrap().is_cancellation());
    }

    #[test]
    fn chained_nodes_share_the_context() {
        let on = inline();
        let (resolver, head) = promise::<i32>();
        let first = CancellablePromise::new(head);
        let second =
            first.then_cancellable_on(&on, |n| CancellablePromise::new(Promise::fulfilled(n + 1)));
        assert!(Arc::ptr_eq(first.context(), second.context()));
        resolver.fulfill(1);
        assert_eq!(second.wait().value(), Some(&2));
    }

    #[test]
    fn chain_settles_through() {
        let on = inline();
        let (resolver, head) = promise::<i32>();
        let first = CancellablePromise::new(head);
        let second =
            first.then_cancellable_on(&on, |n| CancellablePromise::new(Promise::fulfilled(n * 10)));
        resolver.fulfill(4);
        assert_eq!(second.wait().value(), Some(&40));
    }

    #[test]
    fn cancel_between_nodes_stops_the_chain() {
        // P1 -> P2 -> P3 share one context. Cancellation lands after P1
        // resolves but before P2's body runs: P2's resolver is rejected with
        // the cancellation error, and P3's body never executes.
        let gate = Arc::new(GateDispatcher::default());
        let on: Arc<dyn Dispatcher> = gate.clone();

        let p3_ran = Arc::new(StdMutex::new(false));
        let p3_ran2 = p3_ran.clone();

        let (resolver, p1) = promise::<i32>();
        let first = CancellablePromise::new(p1);
        let second = first.then_cancellable_on(&on, |n| {
            CancellablePromise::new(Promise::fulfilled(n + 1))
        });
        let third = second.then_cancellable_on(&on, move |n| {
            *p3_ran2.lock().unwrap() = true;
            CancellablePromise::new(Promise::fulfilled(n + 1))
        });

        resolver.fulfill(1);
        // P2's continuation is parked in the gate; cancel before it runs.
        first.cancel();
        gate.release();

        let settled = third.wait();
        assert!(settled.rejection().unwrap().is_cancellation());
        assert!(!*p3_ran.lock().unwrap());
    }

    #[test]
    fn cancelling_the_tail_reaches_a_nested_chain() {
        let on = inline();
        let (head_resolver, head) = promise::<i32>();
        let first = CancellablePromise::new(head);

        // The nested chain produced by the body stays pending; cancelling
        // the outer chain must reach it through the cross-link.
        let nested_resolver: Arc<StdMutex<Option<Resolver<i32>>>> =
            Arc::new(StdMutex::new(None));
        let nested_resolver2 = nested_resolver.clone();
        let second = first.then_cancellable_on(&on, move |_| {
            let (resolver, nested) = promise::<i32>();
            let nested = CancellablePromise::new(nested);
            nested.register(None, &resolver);
            *nested_resolver2.lock().unwrap() = Some(resolver);
            nested
        });

        head_resolver.fulfill(1);
        assert!(second.promise().peek().is_none());

        second.cancel_with(Arc::new(Cancelled));
        let settled = second.wait();
        assert!(settled.rejection().unwrap().is_cancellation());
    }

    #[test]
    fn settled_nodes_leave_no_registrations_behind() {
        let on = inline();
        let (resolver, head) = promise::<i32>();
        let first = CancellablePromise::new(head);
        first.register(None, &resolver);
        let second =
            first.then_cancellable_on(&on, |n| CancellablePromise::new(Promise::fulfilled(n + 1)));

        resolver.fulfill(1);
        assert_eq!(second.wait().value(), Some(&2));

        // The settled node's own registration is gone; a late cancel finds
        // only the link to the (already settled) nested chain.
        second.cancel();
        assert!(second.is_cancelled());
    }
}
