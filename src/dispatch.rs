//! Execution capability for continuations.
//!
//! The core owns no threads. Whenever a continuation, recovery body or timer
//! has to run somewhere, it is handed to a [`Dispatcher`], and the dispatcher
//! decides on which thread and at what time the closure executes. This keeps
//! the resolution and cancellation machinery agnostic of the scheduling
//! model: a caller may drive chains from worker threads, from a single event
//! loop, or synchronously from the current thread.

use std::{
    io,
    panic::resume_unwind,
    thread::{self, JoinHandle},
};

use crossbeam_channel::Sender;

type Job = Box<dyn FnOnce() + Send>;

/// "Run this closure, maybe asynchronously."
///
/// Implementations make no ordering or threading promises beyond their own
/// documentation; the core never assumes synchronous or asynchronous
/// execution.
pub trait Dispatcher: Send + Sync {
    /// Executes `body`, on whatever thread and at whatever time the
    /// implementation chooses.
    fn run(&self, body: Box<dyn FnOnce() + Send>);
}

/// Runs every body synchronously, in the calling thread.
///
/// Useful for tests and for chains that are driven entirely from one thread
/// anyway. Note that timers degrade with this dispatcher: an armed timeout
/// blocks the caller for its whole delay.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn run(&self, body: Box<dyn FnOnce() + Send>) {
        body();
    }
}

/// A builder object that can be used to configure and spawn a
/// [`WorkerDispatcher`].
#[derive(Clone)]
pub struct WorkerDispatcherBuilder {
    name: Option<String>,
    capacity: usize,
}

impl WorkerDispatcherBuilder {
    /// Sets the name of the dispatcher thread.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the channel capacity of the dispatcher.
    ///
    /// By default, a capacity of 0 is used, which means that
    /// [`Dispatcher::run`] will block until the dispatcher thread has
    /// finished any preceding body.
    #[inline]
    pub fn capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    /// Spawns the dispatcher thread.
    pub fn spawn(self) -> io::Result<WorkerDispatcher> {
        let (sender, recv) = crossbeam_channel::bounded::<Job>(self.capacity);
        let mut builder = thread::Builder::new();
        if let Some(name) = self.name.clone() {
            builder = builder.name(name);
        }
        let handle = builder.spawn(move || {
            if let Some(name) = &self.name {
                log::trace!("dispatcher '{name}' starting");
            }
            for job in recv {
                job();
            }
            if let Some(name) = &self.name {
                log::trace!("dispatcher '{name}' exiting");
            }
        })?;

        Ok(WorkerDispatcher {
            sender: Some(sender),
            handle: Some(handle),
        })
    }
}

/// An owned thread that executes dispatched bodies one at a time, in
/// submission order.
///
/// This type enforces structured concurrency: when it's dropped, the thread
/// is signaled to exit and joined. If a dispatched body has panicked, the
/// panic is forwarded to the thread dropping the [`WorkerDispatcher`].
pub struct WorkerDispatcher {
    sender: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerDispatcher {
    /// Returns a builder that can be used to configure and spawn a
    /// [`WorkerDispatcher`].
    #[inline]
    pub fn builder() -> WorkerDispatcherBuilder {
        WorkerDispatcherBuilder {
            name: None,
            capacity: 0,
        }
    }

    fn wait_for_exit(&mut self) {
        // Wait for the thread to exit and propagate its panic if it panicked.
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(()) => {}
                Err(payload) => {
                    if !thread::panicking() {
                        resume_unwind(payload);
                    }
                }
            }
        }
    }
}

impl Dispatcher for WorkerDispatcher {
    fn run(&self, body: Box<dyn FnOnce() + Send>) {
        if let Some(sender) = &self.sender {
            if sender.send(body).is_err() {
                // The thread is gone, which means a previous body panicked.
                // The panic itself is surfaced when the dispatcher is
                // dropped.
                log::warn!("dispatcher thread has exited; discarding body");
            }
        }
    }
}

impl Drop for WorkerDispatcher {
    fn drop(&mut self) {
        // Close the channel to signal the thread to exit.
        drop(self.sender.take());

        self.wait_for_exit();
    }
}
