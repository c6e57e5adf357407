//! Result observation for submitted tasks.
//!
//! A [`TaskFuture`] is the caller's half of a future-bearing submission. The
//! worker's half ([`FutureCell`]) runs the work once, records the result or
//! the captured panic under the future's lock, and signals waiters. Result
//! visibility is established entirely through that lock.
//!
//! Cancellation succeeds only while the work has not started; already-running
//! work is never interrupted.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, ErrorKind};
use crate::task::Task;

/// Object-safe view of a [`FutureCell`] as carried inside a task wrapper.
pub(crate) trait ErasedFutureTask: Send + Sync {
    /// Runs the work and publishes the outcome.
    fn run_future(&self);
    /// Propagates a wrapper-level cancellation (removal, shutdown) to the
    /// future so blocked waiters observe it.
    fn cancel_task(&self);
    /// Whether this future was submitted with the given action.
    fn matches_action(&self, action: &Arc<dyn Task>) -> bool;
}

struct FutureInner<T> {
    started: bool,
    done: bool,
    canceled: bool,
    result: Option<T>,
    failure: Option<Error>,
}

pub(crate) struct FutureState<T> {
    inner: Mutex<FutureInner<T>>,
    done_cond: Condvar,
}

impl<T> FutureState<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(FutureInner {
                started: false,
                done: false,
                canceled: false,
                result: None,
                failure: None,
            }),
            done_cond: Condvar::new(),
        }
    }
}

type Work<T> = Box<dyn FnOnce() -> T + Send>;

/// The executing half of a future-bearing submission.
pub(crate) struct FutureCell<T> {
    state: Arc<FutureState<T>>,
    /// Identity of the submitted action, when there is one, so
    /// [`remove`](crate::scheduler::PriorityScheduler::remove) can match it.
    action: Option<Arc<dyn Task>>,
    work: Mutex<Option<Work<T>>>,
}

/// Builds the worker/caller pair for an action submission.
pub(crate) fn action_future(action: Arc<dyn Task>) -> (Arc<FutureCell<()>>, TaskFuture<()>) {
    let run = {
        let action = Arc::clone(&action);
        Box::new(move || action.run()) as Work<()>
    };
    build(Some(action), run)
}

/// Builds the worker/caller pair for a value-producing submission.
pub(crate) fn compute_future<T, F>(compute: F) -> (Arc<FutureCell<T>>, TaskFuture<T>)
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    build(None, Box::new(compute))
}

fn build<T>(action: Option<Arc<dyn Task>>, work: Work<T>) -> (Arc<FutureCell<T>>, TaskFuture<T>) {
    let state = Arc::new(FutureState::new());
    let cell = Arc::new(FutureCell {
        state: Arc::clone(&state),
        action,
        work: Mutex::new(Some(work)),
    });
    (cell, TaskFuture { state })
}

impl<T: Send + 'static> ErasedFutureTask for FutureCell<T> {
    fn run_future(&self) {
        let should_run = {
            let mut inner = self.state.inner.lock();
            if inner.canceled {
                inner.done = true;
                self.state.done_cond.notify_all();
                false
            } else {
                inner.started = true;
                true
            }
        };
        if !should_run {
            return;
        }

        let Some(work) = self.work.lock().take() else {
            return;
        };
        let outcome = catch_unwind(AssertUnwindSafe(work));

        let mut inner = self.state.inner.lock();
        match outcome {
            Ok(value) => inner.result = Some(value),
            Err(payload) => inner.failure = Some(Error::from_panic(payload.as_ref())),
        }
        inner.done = true;
        self.state.done_cond.notify_all();
    }

    fn cancel_task(&self) {
        let mut inner = self.state.inner.lock();
        inner.canceled = true;
        self.state.done_cond.notify_all();
    }

    fn matches_action(&self, action: &Arc<dyn Task>) -> bool {
        self.action
            .as_ref()
            .is_some_and(|own| Arc::ptr_eq(own, action))
    }
}

/// Handle to observe, await, or cancel a future-bearing submission.
pub struct TaskFuture<T> {
    state: Arc<FutureState<T>>,
}

impl<T> TaskFuture<T> {
    /// Attempts to cancel the task. Returns `true` iff the work had not
    /// started; already-running work is never interrupted, regardless.
    pub fn cancel(&self) -> bool {
        let mut inner = self.state.inner.lock();
        inner.canceled = true;
        self.state.done_cond.notify_all();
        !inner.started
    }

    /// Whether the work has finished (successfully, by panic, or by being
    /// skipped after cancellation).
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.inner.lock().done
    }

    /// Whether the task was cancelled before it started.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        let inner = self.state.inner.lock();
        inner.canceled && !inner.started
    }

    /// Blocks until the work completes or `timeout` elapses, without
    /// consuming the handle.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::ResultTimeout`] when the timeout elapses,
    /// [`ErrorKind::Cancelled`] when the task was cancelled before starting.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.state.inner.lock();
        loop {
            if inner.done {
                return Ok(());
            }
            if inner.canceled && !inner.started {
                return Err(Error::new(ErrorKind::Cancelled));
            }
            match deadline {
                None => self.state.done_cond.wait(&mut inner),
                Some(deadline) => {
                    if self
                        .state
                        .done_cond
                        .wait_until(&mut inner, deadline)
                        .timed_out()
                        && !inner.done
                    {
                        return Err(Error::new(ErrorKind::ResultTimeout));
                    }
                }
            }
        }
    }

    /// Blocks until the work completes and returns its result.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::ExecutionFailed`] when the work panicked,
    /// [`ErrorKind::Cancelled`] when the task was cancelled before starting.
    pub fn get(self) -> Result<T, Error> {
        self.take_result(None)
    }

    /// Blocks up to `timeout` for the work to complete and returns its
    /// result.
    ///
    /// # Errors
    ///
    /// As [`TaskFuture::get`], plus [`ErrorKind::ResultTimeout`] when the
    /// timeout elapses first.
    pub fn get_timeout(self, timeout: Duration) -> Result<T, Error> {
        self.take_result(Some(timeout))
    }

    fn take_result(self, timeout: Option<Duration>) -> Result<T, Error> {
        // A timeout large enough to overflow the deadline is treated as
        // infinite.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut inner = self.state.inner.lock();
        loop {
            if inner.done {
                break;
            }
            if inner.canceled && !inner.started {
                return Err(Error::new(ErrorKind::Cancelled));
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .state
                        .done_cond
                        .wait_until(&mut inner, deadline)
                        .timed_out()
                        && !inner.done
                    {
                        return Err(Error::new(ErrorKind::ResultTimeout));
                    }
                }
                None => self.state.done_cond.wait(&mut inner),
            }
        }
        if let Some(failure) = inner.failure.take() {
            return Err(failure);
        }
        match inner.result.take() {
            Some(value) => Ok(value),
            // Done without result or failure: cancelled before the work ran.
            None => Err(Error::new(ErrorKind::Cancelled)),
        }
    }
}

impl<T> std::fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.state.inner.lock();
        f.debug_struct("TaskFuture")
            .field("started", &inner.started)
            .field("done", &inner.done)
            .field("canceled", &inner.canceled)
            .finish()
    }
}
