//! The cancellation-propagation graph.
//!
//! A [`CancelContext`] is the shared, chain-wide registry of everything that
//! has to be torn down when one chain (or a cross-linked set of chains) is
//! cancelled: cooperatively-cancellable tasks, reject hooks for promises that
//! are still pending, and links to the contexts of nested sub-chains. Each
//! chain node keeps its own [`CancelItemList`] so that, when the node settles
//! normally, exactly its registrations are removed from the shared context.
//!
//! Cancellation is cooperative only. Cancelling never interrupts code that is
//! already running; it records the error, asks every registered task to stop,
//! rejects every registered promise, and recurses into child contexts. An
//! explicit visited set bounds that recursion, so two contexts that link each
//! other are torn down without looping.
//!
//! Like the resolution boxes, a context never runs user code while its lock
//! is held: the item list is captured under the lock and walked after the
//! guard is released.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread,
    time::Duration,
};

use crate::{
    dispatch::Dispatcher,
    error::{Cancelled, Rejection, TimedOut},
    sync::{Mutex, RwLock},
};

/// Cooperative-cancellation hook for whatever underlying operation (I/O,
/// timer, computation) a chain step wraps.
pub trait CancellableTask: Send + Sync {
    /// Asks the operation to stop. May be called more than once.
    fn cancel(&self);

    /// Whether the operation has been cancelled.
    fn is_cancelled(&self) -> bool;
}

/// Reject hook registered alongside a task; receives the cancellation error.
pub type RejectFn = Box<dyn Fn(Rejection) + Send + Sync>;

fn next_id() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// One registered unit of cancellable work: either a task/reject pair, or a
/// link to the context of a nested chain.
struct CancelItem {
    id: usize,
    task: Option<Arc<dyn CancellableTask>>,
    reject: Option<RejectFn>,
    /// Held weakly: a child chain that nobody references anymore has nothing
    /// left to cancel.
    child: Option<Weak<CancelContext>>,
    cancel_attempted: AtomicBool,
}

impl CancelItem {
    fn for_task(task: Option<Arc<dyn CancellableTask>>, reject: Option<RejectFn>) -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            task,
            reject,
            child: None,
            cancel_attempted: AtomicBool::new(false),
        })
    }

    fn for_child(child: &Arc<CancelContext>) -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            task: None,
            reject: None,
            child: Some(Arc::downgrade(child)),
            cancel_attempted: AtomicBool::new(false),
        })
    }

    fn cancel(&self, error: &Rejection, visited: &mut HashSet<usize>) {
        self.cancel_attempted.store(true, Ordering::Release);
        if let Some(task) = &self.task {
            task.cancel();
        }
        if let Some(reject) = &self.reject {
            reject(error.clone());
        }
        if let Some(child) = &self.child {
            if let Some(child) = child.upgrade() {
                child.cancel_visited(error.clone(), visited);
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        match &self.task {
            Some(task) => task.is_cancelled(),
            None => self.cancel_attempted.load(Ordering::Acquire),
        }
    }
}

/// Per-chain-node ledger of the items that node registered with the shared
/// context.
///
/// When the node settles normally, the context removes exactly the items
/// recorded here (see [`CancelContext::remove_items`]); sibling nodes'
/// registrations are untouched.
#[derive(Default)]
pub struct CancelItemList {
    items: Mutex<Vec<Arc<CancelItem>>>,
}

impl CancelItemList {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&self, item: Arc<CancelItem>) {
        self.items.lock().push(item);
    }

    fn snapshot(&self) -> Vec<Arc<CancelItem>> {
        self.items.lock().clone()
    }

    fn clear(&self) {
        self.items.lock().clear();
    }
}

/// Handle to an armed timeout. Disarming makes the deferred cancel a no-op.
struct ArmedTimeout {
    disarmed: AtomicBool,
}

impl ArmedTimeout {
    fn disarm(&self) {
        self.disarmed.store(true, Ordering::Release);
    }

    fn is_disarmed(&self) -> bool {
        self.disarmed.load(Ordering::Acquire)
    }
}

struct ContextInner {
    /// Registration order is preserved; cancellation walks items in this
    /// order.
    items: Vec<Arc<CancelItem>>,
    /// Identity set mirroring `items`, for O(1) membership during removal.
    item_set: HashSet<usize>,
    cancelled_error: Option<Rejection>,
    timeout: Option<Arc<ArmedTimeout>>,
}

/// The shared cancellation registry for one chain, or one cross-linked set of
/// chains.
///
/// A context is not single-shot: [`recover`][Self::recover] clears the
/// recorded error, so a recovery handler can continue past a cancellation
/// with a replacement chain, and a later [`cancel`][Self::cancel] starts a
/// fresh teardown.
pub struct CancelContext {
    id: usize,
    /// Self-reference handed to timer bodies, so an armed timeout does not
    /// keep an otherwise-abandoned chain alive.
    weak_self: Weak<CancelContext>,
    inner: RwLock<ContextInner>,
}

impl CancelContext {
    /// Creates an empty context.
    pub fn new() -> Arc<CancelContext> {
        Arc::new_cyclic(|weak_self| CancelContext {
            id: next_id(),
            weak_self: weak_self.clone(),
            inner: RwLock::new(ContextInner {
                items: Vec::new(),
                item_set: HashSet::new(),
                cancelled_error: None,
                timeout: None,
            }),
        })
    }

    /// Registers a cancellable task and/or reject hook with this context, on
    /// behalf of the chain node owning `list`.
    ///
    /// If the context is already cancelled there is no window for the
    /// registration to escape: the new item is cancelled synchronously, with
    /// the recorded error, before this returns. Registering neither a task
    /// nor a reject hook is a no-op.
    pub fn append_task(
        &self,
        task: Option<Arc<dyn CancellableTask>>,
        reject: Option<RejectFn>,
        list: &CancelItemList,
    ) {
        if task.is_none() && reject.is_none() {
            return;
        }
        let item = CancelItem::for_task(task, reject);
        let error = {
            let mut inner = self.inner.write();
            inner.item_set.insert(item.id);
            inner.items.push(item.clone());
            list.append(item.clone());
            inner.cancelled_error.clone()
        };
        if let Some(error) = error {
            item.cancel(&error, &mut HashSet::new());
        }
    }

    /// Cross-links the context of a nested chain produced by a chained
    /// sub-step.
    ///
    /// Performs a one-time reconciliation: if exactly one of the two contexts
    /// already carries an error, it is pushed into the other. If both or
    /// neither do, nothing happens now; later `cancel` calls on either side
    /// propagate through the stored link. Linking a context to itself is a
    /// no-op.
    pub fn append_child(&self, child: &Arc<CancelContext>, list: &CancelItemList) {
        if self.id == child.id {
            return;
        }
        let item = CancelItem::for_child(child);
        let parent_error = {
            let mut inner = self.inner.write();
            inner.item_set.insert(item.id);
            inner.items.push(item.clone());
            list.append(item);
            inner.cancelled_error.clone()
        };

        let child_error = child.cancelled_error();
        match (parent_error, child_error) {
            (Some(parent_error), None) => child.cancel_with(parent_error),
            (None, Some(child_error)) => self.cancel_with(child_error),
            _ => {}
        }
    }

    /// Cancels every registered item with the default [`Cancelled`] error.
    pub fn cancel(&self) {
        self.cancel_with(Arc::new(Cancelled));
    }

    /// Cancels every registered item.
    ///
    /// The first recorded error wins: racing calls agree on whichever error
    /// was recorded first, and that recorded error is what every item
    /// observes. Any armed timeout is disarmed. Items are processed in
    /// registration order, outside the lock; linked child contexts are
    /// entered at most once per top-level `cancel` call, so cross-linked
    /// contexts tear down without looping.
    pub fn cancel_with(&self, error: Rejection) {
        self.cancel_visited(error, &mut HashSet::new());
    }

    fn cancel_visited(&self, error: Rejection, visited: &mut HashSet<usize>) {
        if !visited.insert(self.id) {
            return;
        }
        let (effective, items, timeout) = {
            let mut inner = self.inner.write();
            let effective = match &inner.cancelled_error {
                Some(existing) => existing.clone(),
                None => {
                    inner.cancelled_error = Some(error.clone());
                    error
                }
            };
            (effective, inner.items.clone(), inner.timeout.take())
        };
        if let Some(timeout) = timeout {
            timeout.disarm();
        }
        for item in items {
            item.cancel(&effective, visited);
        }
    }

    /// True iff every registered item reports cancelled.
    pub fn is_cancelled(&self) -> bool {
        let items = self.inner.read().items.clone();
        items.iter().all(|item| item.is_cancelled())
    }

    /// True once `cancel` has been requested and not `recover`ed.
    pub fn cancel_attempted(&self) -> bool {
        self.cancelled_error().is_some()
    }

    /// The error recorded by `cancel`, if any.
    pub fn cancelled_error(&self) -> Option<Rejection> {
        self.inner.read().cancelled_error.clone()
    }

    /// Clears the recorded cancellation error, making the context reusable.
    ///
    /// Cancellation is terminal for each already-settled promise, not for the
    /// context: a recovery handler may continue past a cancellation with a
    /// replacement chain, and a later `cancel` records a fresh error.
    pub fn recover(&self) {
        self.inner.write().cancelled_error = None;
    }

    /// Arms a deferred [`cancel`][Self::cancel] with a [`TimedOut`] error,
    /// scheduled through `dispatcher`.
    ///
    /// Re-arming replaces the previous timeout, so only the most recently
    /// requested one can fire; cancelling the context disarms it. The timer
    /// body sleeps for `after` before firing, so `dispatcher` should execute
    /// bodies off the calling thread. The context is captured weakly: a chain
    /// that is dropped before the timer fires is not kept alive by it.
    pub fn timeout(&self, after: Duration, dispatcher: &dyn Dispatcher) {
        let armed = Arc::new(ArmedTimeout {
            disarmed: AtomicBool::new(false),
        });
        let previous = self.inner.write().timeout.replace(armed.clone());
        if let Some(previous) = previous {
            previous.disarm();
        }

        let context = self.weak_self.clone();
        dispatcher.run(Box::new(move || {
            thread::sleep(after);
            if armed.is_disarmed() {
                return;
            }
            if let Some(context) = context.upgrade() {
                context.cancel_with(Arc::new(TimedOut));
            }
        }));
    }

    /// Removes precisely the items owned by one chain node; called when that
    /// node settles normally.
    ///
    /// One node's items are normally appended contiguously, so the common
    /// case removes a single contiguous run in one operation; items that
    /// interleaved with sibling appends are removed by a fallback scan.
    /// Returns the error recorded at the time of the call, so the caller can
    /// propagate a late cancellation instead of its own success; nothing is
    /// removed in that case.
    pub fn remove_items(&self, list: &CancelItemList, clear_list: bool) -> Option<Rejection> {
        let mut inner = self.inner.write();
        let error = inner.cancelled_error.clone();
        if error.is_some() {
            return error;
        }

        let owned = list.snapshot();
        if owned.is_empty() {
            return None;
        }

        let mut current = 1;
        if inner.item_set.remove(&owned[0].id) {
            if let Some(start) = inner.items.iter().position(|item| item.id == owned[0].id) {
                while current < owned.len() {
                    let next = inner.items.get(start + current).map(|item| item.id);
                    if next != Some(owned[current].id) {
                        break;
                    }
                    inner.item_set.remove(&owned[current].id);
                    current += 1;
                }
                inner.items.drain(start..start + current);
            }
        }

        // Whatever falls outside the contiguous run.
        while current < owned.len() {
            let id = owned[current].id;
            if inner.item_set.remove(&id) {
                if let Some(position) = inner.items.iter().position(|item| item.id == id) {
                    inner.items.remove(position);
                }
            }
            current += 1;
        }

        if clear_list {
            list.clear();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Barrier, Mutex as StdMutex},
        thread,
        time::Duration,
    };

    use super::*;

    fn assert_send<T: Send>() {}

    struct FlagTask {
        cancelled: AtomicBool,
    }

    impl FlagTask {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                cancelled: AtomicBool::new(false),
            })
        }
    }

    impl CancellableTask for FlagTask {
        fn cancel(&self) {
            self.cancelled.store(true, Ordering::Release);
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::Acquire)
        }
    }

    /// Runs every body on its own thread; timers need this.
    struct SpawnDispatcher;

    impl Dispatcher for SpawnDispatcher {
        fn run(&self, body: Box<dyn FnOnce() + Send>) {
            thread::spawn(body);
        }
    }

    fn recording_reject(log: &Arc<StdMutex<Vec<String>>>, label: &str) -> RejectFn {
        let log = log.clone();
        let label = label.to_string();
        Box::new(move |error| log.lock().unwrap().push(format!("{label}: {error}")))
    }

    #[test]
    fn cancel_cancels_tasks_and_rejects() {
        let context = CancelContext::new();
        let list = CancelItemList::new();
        let task = FlagTask::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        context.append_task(Some(task.clone()), Some(recording_reject(&log, "a")), &list);

        assert!(!context.cancel_attempted());
        context.cancel();

        assert!(context.cancel_attempted());
        assert!(context.is_cancelled());
        assert!(task.is_cancelled());
        assert_eq!(*log.lock().unwrap(), vec!["a: the chain was cancelled"]);
        assert!(context.cancelled_error().unwrap().is_cancellation());
    }

    #[test]
    fn late_registration_is_cancelled_before_append_returns() {
        let context = CancelContext::new();
        context.cancel();

        let list = CancelItemList::new();
        let task = FlagTask::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        context.append_task(Some(task.clone()), Some(recording_reject(&log, "late")), &list);

        // Synchronous: both effects are visible immediately after append.
        assert!(task.is_cancelled());
        assert_eq!(*log.lock().unwrap(), vec!["late: the chain was cancelled"]);
    }

    #[test]
    fn cross_linked_contexts_terminate() {
        let a = CancelContext::new();
        let b = CancelContext::new();
        let list_a = CancelItemList::new();
        let list_b = CancelItemList::new();
        a.append_child(&b, &list_a);
        b.append_child(&a, &list_b);

        let error: Rejection = Arc::new(TimedOut);
        a.cancel_with(error);

        assert_eq!(
            a.cancelled_error().unwrap().to_string(),
            "the chain timed out"
        );
        assert_eq!(
            b.cancelled_error().unwrap().to_string(),
            "the chain timed out"
        );
    }

    #[test]
    fn linking_to_self_is_a_no_op() {
        let a = CancelContext::new();
        let list = CancelItemList::new();
        a.append_child(&a, &list);
        a.cancel();
        assert!(a.cancel_attempted());
    }

    #[test]
    fn cross_link_reconciles_existing_error() {
        // Parent already cancelled: the error is pushed into the child.
        let parent = CancelContext::new();
        let child = CancelContext::new();
        parent.cancel();
        parent.append_child(&child, &CancelItemList::new());
        assert!(child.cancel_attempted());

        // Child already cancelled: the error is pulled into the parent.
        let parent = CancelContext::new();
        let child = CancelContext::new();
        child.cancel_with(Arc::new(TimedOut));
        parent.append_child(&child, &CancelItemList::new());
        assert_eq!(
            parent.cancelled_error().unwrap().to_string(),
            "the chain timed out"
        );
    }

    #[test]
    fn remove_items_is_precise_under_interleaving() {
        let context = CancelContext::new();
        let node_a = CancelItemList::new();
        let node_b = CancelItemList::new();
        let node_c = CancelItemList::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        // Interleave appends from three sibling nodes, so node B's items do
        // not form one contiguous run.
        context.append_task(None, Some(recording_reject(&log, "a1")), &node_a);
        context.append_task(None, Some(recording_reject(&log, "b1")), &node_b);
        context.append_task(None, Some(recording_reject(&log, "a2")), &node_a);
        context.append_task(None, Some(recording_reject(&log, "b2")), &node_b);
        context.append_task(None, Some(recording_reject(&log, "c1")), &node_c);
        context.append_task(None, Some(recording_reject(&log, "c2")), &node_c);

        assert!(context.remove_items(&node_b, true).is_none());

        // Only nodes A and C remain, in their original registration order.
        context.cancel();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "a1: the chain was cancelled",
                "a2: the chain was cancelled",
                "c1: the chain was cancelled",
                "c2: the chain was cancelled",
            ]
        );
    }

    #[test]
    fn remove_items_reports_late_cancellation_and_keeps_items() {
        let context = CancelContext::new();
        let node = CancelItemList::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        context.append_task(None, Some(recording_reject(&log, "n")), &node);

        context.cancel();
        let error = context.remove_items(&node, true);
        assert!(error.unwrap().is_cancellation());
    }

    #[test]
    fn racing_cancels_agree_on_first_recorded_error() {
        for _ in 0..16 {
            let context = CancelContext::new();
            let list = CancelItemList::new();
            let log = Arc::new(StdMutex::new(Vec::new()));
            context.append_task(None, Some(recording_reject(&log, "x")), &list);

            let barrier = Arc::new(Barrier::new(2));
            let first: Rejection = Arc::new(Cancelled);
            let second: Rejection = Arc::new(TimedOut);
            let handles: Vec<_> = [first, second]
                .into_iter()
                .map(|error| {
                    let context = context.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        context.cancel_with(error);
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            // Whatever was recorded is what every reject observed.
            let recorded = context.cancelled_error().unwrap().to_string();
            for line in log.lock().unwrap().iter() {
                assert_eq!(*line, format!("x: {recorded}"));
            }
        }
    }

    #[test]
    fn recover_makes_the_context_reusable() {
        let context = CancelContext::new();
        context.cancel();
        assert!(context.cancel_attempted());

        context.recover();
        assert!(!context.cancel_attempted());
        assert!(context.cancelled_error().is_none());

        context.cancel_with(Arc::new(TimedOut));
        assert_eq!(
            context.cancelled_error().unwrap().to_string(),
            "the chain timed out"
        );
    }

    #[test]
    fn only_the_latest_timeout_fires() {
        let context = CancelContext::new();
        let list = CancelItemList::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        context.append_task(None, Some(recording_reject(&log, "t")), &list);

        context.timeout(Duration::from_millis(100), &SpawnDispatcher);
        context.timeout(Duration::from_millis(30), &SpawnDispatcher);

        // Well past both deadlines: the replaced timer must not have fired.
        thread::sleep(Duration::from_millis(250));
        assert_eq!(*log.lock().unwrap(), vec!["t: the chain timed out"]);
        assert!(!context.cancelled_error().unwrap().is_cancellation());
    }

    #[test]
    fn cancel_disarms_a_pending_timeout() {
        let context = CancelContext::new();
        context.timeout(Duration::from_millis(30), &SpawnDispatcher);
        context.cancel();

        thread::sleep(Duration::from_millis(100));
        // The recorded error is still the explicit cancellation.
        assert!(context.cancelled_error().unwrap().is_cancellation());
    }

    #[test]
    fn is_cancelled_tracks_every_item() {
        let context = CancelContext::new();
        let list = CancelItemList::new();
        let stubborn = FlagTask::new();
        context.append_task(Some(stubborn.clone()), None, &list);
        context.append_task(None, Some(Box::new(|_| {})), &list);

        context.cancel();
        // Both items were asked to stop, and both report cancelled.
        assert!(context.is_cancelled());
    }

    #[test]
    fn context_is_send() {
        assert_send::<Arc<CancelContext>>();
        assert_send::<CancelItemList>();
    }
}
