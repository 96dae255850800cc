//! Single-threaded task queue fed from background threads.
//!
//! Network work runs on tokio worker threads, but everything the caller
//! observes (promise reactions, stream listeners) runs on the one thread that
//! drives [`EventLoop::run`]. Background code reserves a slot with
//! [`EventLoop::register_callback`] before it starts; the loop keeps waiting
//! while reservations are outstanding and exits once the queue is empty and
//! nothing is pending.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{BoxError, ClientError};

/// A unit of work executed on the loop thread.
pub type Task = Box<dyn FnOnce() -> Result<(), BoxError> + Send + 'static>;

type ErrorHandler = Arc<dyn Fn(BoxError) + Send + Sync + 'static>;

/// Handle to the cooperative task queue. Cheap to clone.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<LoopState>,
    wakeup: Condvar,
    on_error: Mutex<ErrorHandler>,
}

#[derive(Default)]
struct LoopState {
    tasks: VecDeque<Task>,
    reserved: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, task: Task, release: bool) {
        let mut state = self.lock();
        state.tasks.push_back(task);
        if release {
            state.reserved -= 1;
        }
        drop(state);
        self.wakeup.notify_all();
    }

    fn release(&self) {
        let mut state = self.lock();
        state.reserved -= 1;
        drop(state);
        self.wakeup.notify_all();
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("EventLoop")
            .field("queued", &state.tasks.len())
            .field("reserved", &state.reserved)
            .finish()
    }
}

impl EventLoop {
    /// Create an empty loop whose unhandled errors are logged.
    pub fn new() -> Self {
        let handler: ErrorHandler = Arc::new(|err: BoxError| {
            tracing::error!(error = %err, "unhandled error in event loop task");
        });
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LoopState::default()),
                wakeup: Condvar::new(),
                on_error: Mutex::new(handler),
            }),
        }
    }

    /// Replace the handler that receives errors returned by tasks.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(BoxError) + Send + Sync + 'static,
    {
        *self
            .shared
            .on_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    /// Reserve a slot for one task to be delivered later.
    ///
    /// The loop does not exit while the returned [`Callback`] is alive.
    pub fn register_callback(&self) -> Callback {
        self.shared.lock().reserved += 1;
        Callback {
            shared: Some(self.shared.clone()),
        }
    }

    /// Run tasks on the current thread until the queue is empty and no
    /// reservations remain.
    pub fn run(&self) {
        while let Some(task) = self.next_task(None) {
            self.execute(task);
        }
    }

    /// Like [`run`](Self::run) but gives up after `timeout`.
    ///
    /// Returns `true` if the loop drained completely.
    pub fn run_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            match self.next_task(Some(deadline)) {
                Some(task) => self.execute(task),
                None => return self.is_idle(),
            }
        }
    }

    /// Run only the tasks that are already queued. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let tasks: Vec<Task> = self.shared.lock().tasks.drain(..).collect();
        let count = tasks.len();
        for task in tasks {
            self.execute(task);
        }
        count
    }

    /// Whether nothing is queued and nothing is reserved.
    pub fn is_idle(&self) -> bool {
        let state = self.shared.lock();
        state.tasks.is_empty() && state.reserved == 0
    }

    fn next_task(&self, deadline: Option<Instant>) -> Option<Task> {
        let mut state = self.shared.lock();
        loop {
            if let Some(task) = state.tasks.pop_front() {
                return Some(task);
            }
            if state.reserved == 0 {
                return None;
            }
            state = match deadline {
                None => self
                    .shared
                    .wakeup
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.shared
                        .wakeup
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn execute(&self, task: Task) {
        if let Err(err) = task() {
            let handler = self
                .shared
                .on_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            handler(err);
        }
    }
}

/// A reserved slot on the loop.
///
/// [`call`](Callback::call) enqueues the final task and releases the slot.
/// Dropping the callback releases the slot without running anything.
pub struct Callback {
    shared: Option<Arc<Shared>>,
}

impl Callback {
    /// Deliver the task and release the reservation.
    pub fn call<F>(mut self, task: F)
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        if let Some(shared) = self.shared.take() {
            shared.push(Box::new(task), true);
        }
    }

    fn enqueue(&self, task: Task) {
        if let Some(shared) = &self.shared {
            shared.push(task, false);
        }
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("pending", &self.shared.is_some())
            .finish()
    }
}

/// Ordered queue of tasks from one producer, holding a single reservation
/// until [`close`](TaskQueue::close).
pub struct TaskQueue {
    callback: Mutex<Option<Callback>>,
}

impl TaskQueue {
    pub fn new(event_loop: &EventLoop) -> Self {
        Self {
            callback: Mutex::new(Some(event_loop.register_callback())),
        }
    }

    /// Queue a task. Ignored after `close`.
    pub fn queue<F>(&self, task: F)
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        let guard = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(callback) = guard.as_ref() {
            callback.enqueue(Box::new(task));
        }
    }

    /// Release the reservation. Tasks already queued still run.
    pub fn close(&self) {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

type Reaction<T> = Box<dyn FnOnce(Result<T, ClientError>) + Send + 'static>;

enum PromiseState<T> {
    Pending(Vec<Reaction<T>>),
    Settled(Result<T, ClientError>),
}

/// Result of an asynchronous call, settled on the loop thread.
pub struct Promise<T> {
    state: Arc<Mutex<PromiseState<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let settled = matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            PromiseState::Settled(_)
        );
        f.debug_struct("Promise").field("settled", &settled).finish()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Create a pending promise and the resolver that settles it through
    /// `event_loop`.
    pub fn new(event_loop: &EventLoop) -> (Promise<T>, Resolver<T>) {
        let state = Arc::new(Mutex::new(PromiseState::Pending(Vec::new())));
        let promise = Promise {
            state: state.clone(),
        };
        let resolver = Resolver {
            state,
            callback: event_loop.register_callback(),
        };
        (promise, resolver)
    }

    /// Whether the promise has been settled.
    pub fn is_settled(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            PromiseState::Settled(_)
        )
    }

    /// The settled value, if any.
    pub fn result(&self) -> Option<Result<T, ClientError>> {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            PromiseState::Settled(result) => Some(result.clone()),
            PromiseState::Pending(_) => None,
        }
    }

    /// Register a reaction. Runs on the loop thread once settled, or
    /// immediately if the promise already is.
    pub fn then<F>(&self, reaction: F)
    where
        F: FnOnce(Result<T, ClientError>) + Send + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *state {
            PromiseState::Pending(reactions) => reactions.push(Box::new(reaction)),
            PromiseState::Settled(result) => {
                let result = result.clone();
                drop(state);
                reaction(result);
            }
        }
    }
}

/// Settles a [`Promise`] by scheduling the settlement on the loop.
pub struct Resolver<T> {
    state: Arc<Mutex<PromiseState<T>>>,
    callback: Callback,
}

impl<T: Clone + Send + 'static> Resolver<T> {
    /// Settle the promise. Reactions run on the loop thread.
    pub fn settle(self, result: Result<T, ClientError>) {
        let state = self.state;
        self.callback.call(move || {
            let reactions = {
                let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                match std::mem::replace(&mut *guard, PromiseState::Settled(result.clone())) {
                    PromiseState::Pending(reactions) => reactions,
                    PromiseState::Settled(_) => Vec::new(),
                }
            };
            for reaction in reactions {
                reaction(result.clone());
            }
            Ok(())
        });
    }
}
