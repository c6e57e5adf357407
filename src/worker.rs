//! Worker threads and the parking primitive that idles them.
//!
//! A [`Worker`] owns one OS thread and a single-slot `next_task` handoff.
//! Lifecycle: created, runs its first task, then alternates between parked
//! and running until killed. The thread is woken by writing the slot and
//! unparking; violations of the handoff protocol (handing a task to a killed
//! or occupied worker) are state errors, not panics on the caller's thread.
//!
//! Parked workers wake periodically to run pool housekeeping, so idle
//! expiration proceeds even when no further tasks arrive.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use crate::clock::Clock;
use crate::error::{Error, ErrorKind};
use crate::pool::PoolShared;
use crate::task::TaskWrapper;

/// A mechanism for parking and unparking one worker thread.
///
/// Permit model: `unpark` publishes a permit; `park_timeout` consumes it,
/// returning immediately when one is already available. An unpark that
/// arrives before the park is therefore never lost.
#[derive(Debug)]
pub(crate) struct Parker {
    notified: AtomicBool,
    mutex: Mutex<()>,
    cvar: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            notified: AtomicBool::new(false),
            mutex: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    #[inline]
    fn try_consume_permit(&self) -> bool {
        self.notified
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Parks the current thread until a permit arrives or the timeout
    /// elapses.
    pub(crate) fn park_timeout(&self, duration: Duration) {
        if self.try_consume_permit() {
            return;
        }
        let Some(deadline) = Instant::now().checked_add(duration) else {
            return self.park_until_notified();
        };
        let mut guard = self.mutex.lock();
        while !self.try_consume_permit() {
            if self.cvar.wait_until(&mut guard, deadline).timed_out() {
                // Best-effort consumption of a permit racing the deadline.
                let _ = self.try_consume_permit();
                return;
            }
        }
    }

    fn park_until_notified(&self) {
        let mut guard = self.mutex.lock();
        while !self.try_consume_permit() {
            self.cvar.wait(&mut guard);
        }
    }

    /// Publishes a permit and wakes the parked thread, if any.
    ///
    /// Fast path: when a permit is already pending, the swap fails and the
    /// mutex and condvar are skipped entirely. The mutex is acquired before
    /// notifying so a thread between its permit check and its wait cannot
    /// miss the signal.
    pub(crate) fn unpark(&self) {
        if self
            .notified
            .compare_exchange(false, true, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let _guard = self.mutex.lock();
        self.cvar.notify_one();
    }
}

struct WorkerInner {
    id: usize,
    parker: Parker,
    slot: Mutex<Option<Arc<TaskWrapper>>>,
    running: AtomicBool,
    started: AtomicBool,
    last_run_time: AtomicU64,
}

/// Handle to one pool thread. Cheap to clone; all clones share the thread.
#[derive(Clone)]
pub(crate) struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub(crate) fn new(id: usize, clock: &Clock) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                id,
                parker: Parker::new(),
                slot: Mutex::new(None),
                running: AtomicBool::new(true),
                started: AtomicBool::new(false),
                last_run_time: AtomicU64::new(clock.last_known_time()),
            }),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.inner.id
    }

    /// Launches the worker thread. Idempotent: only the first call spawns.
    pub(crate) fn start(
        &self,
        pool: Weak<PoolShared>,
        clock: Arc<Clock>,
        thread_name: String,
    ) -> Result<(), Error> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_loop(&inner, &pool, &clock));
        match spawned {
            Ok(_handle) => Ok(()),
            Err(io) => {
                self.inner.started.store(false, Ordering::Release);
                Err(Error::with_message(ErrorKind::ThreadSpawnFailed, io.to_string()))
            }
        }
    }

    /// Hands the worker its next task and wakes it.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::WorkerKilled`] when the worker has been stopped,
    /// [`ErrorKind::WorkerOccupied`] when it already holds a task.
    pub(crate) fn next_task(&self, task: Arc<TaskWrapper>) -> Result<(), Error> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(Error::with_message(
                ErrorKind::WorkerKilled,
                format!("worker {}", self.inner.id),
            ));
        }
        {
            let mut slot = self.inner.slot.lock();
            if slot.is_some() {
                return Err(Error::with_message(
                    ErrorKind::WorkerOccupied,
                    format!("worker {}", self.inner.id),
                ));
            }
            *slot = Some(task);
        }
        self.inner.parker.unpark();
        Ok(())
    }

    /// Stops the worker. The thread observes the flag at its next wake and
    /// exits without returning itself to the pool.
    pub(crate) fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.parker.unpark();
    }

    /// Clock milliseconds when this worker last finished a task; its
    /// construction time before the first task.
    pub(crate) fn last_run_time(&self) -> u64 {
        self.inner.last_run_time.load(Ordering::Acquire)
    }
}

/// Interval between housekeeping wakes for an idle worker. Follows the
/// pool's keep-alive so expiration lags it by at most one interval.
fn park_interval(pool: &PoolShared) -> Duration {
    Duration::from_millis(pool.keep_alive_ms().clamp(10, 1_000))
}

fn run_loop(inner: &Arc<WorkerInner>, pool: &Weak<PoolShared>, clock: &Arc<Clock>) {
    trace!(worker_id = inner.id, "worker thread started");
    while inner.running.load(Ordering::Acquire) {
        let Some(pool_now) = pool.upgrade() else {
            break;
        };
        let interval = park_interval(&pool_now);
        drop(pool_now);

        inner.parker.park_timeout(interval);
        if !inner.running.load(Ordering::Acquire) {
            break;
        }

        let taken = inner.slot.lock().take();
        let Some(task) = taken else {
            // Idle wake: let keep-alive expiration make progress even when
            // no further tasks arrive.
            match pool.upgrade() {
                Some(pool) => pool.expire_old_workers(),
                None => break,
            }
            continue;
        };

        trace!(worker_id = inner.id, priority = ?task.priority(), "running task");
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.run())) {
            let failure = Error::from_panic(payload.as_ref());
            error!(worker_id = inner.id, %failure, "task panicked on worker thread");
        }

        if inner.running.load(Ordering::Acquire) {
            inner
                .last_run_time
                .store(clock.accurate_time(), Ordering::Release);
            match pool.upgrade() {
                Some(pool) => pool.worker_done(Worker {
                    inner: Arc::clone(inner),
                }),
                None => break,
            }
        }
    }
    trace!(worker_id = inner.id, "worker thread exiting");
}
