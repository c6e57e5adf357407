//! Worker pool lifecycle: creation, lending, idle expiration, shutdown.
//!
//! All pool state lives behind one lock. Idle workers sit in a deque with the
//! newest at the front: acquisition pops the front (cache-warm reuse),
//! expiration kills from the back (the oldest idle worker ages out first).
//!
//! The two acceptors differ only in how they wait. A high-priority task never
//! waits while the pool can still grow; a low-priority task first spends up
//! to `max_wait_for_low_priority` hoping to reuse an existing worker, and
//! only then is allowed to grow the pool. Both wait without bound once the
//! pool is at its maximum size.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{Error, ErrorKind};
use crate::task::TaskWrapper;
use crate::worker::Worker;

struct PoolState {
    /// Total live workers, idle or running.
    current_pool_size: usize,
    /// Idle workers, newest at the front. A worker is here iff it is parked
    /// waiting for its next task.
    available_workers: VecDeque<Worker>,
}

/// Shared pool manager state. The scheduler owns one; workers and
/// dispatchers hold references.
pub(crate) struct PoolShared {
    /// Self-reference handed to workers so they can report back without
    /// keeping the pool alive.
    weak_self: Weak<PoolShared>,
    state: Mutex<PoolState>,
    worker_available: Condvar,
    running: AtomicBool,
    core_pool_size: AtomicUsize,
    max_pool_size: AtomicUsize,
    keep_alive_ms: AtomicU64,
    max_wait_for_low_priority_ms: AtomicU64,
    allow_core_timeout: AtomicBool,
    next_worker_id: AtomicUsize,
    thread_name_prefix: String,
    clock: Arc<Clock>,
}

impl PoolShared {
    pub(crate) fn new(config: &SchedulerConfig, clock: Arc<Clock>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            state: Mutex::new(PoolState {
                current_pool_size: 0,
                available_workers: VecDeque::with_capacity(config.max_pool_size),
            }),
            worker_available: Condvar::new(),
            running: AtomicBool::new(true),
            core_pool_size: AtomicUsize::new(config.core_pool_size),
            max_pool_size: AtomicUsize::new(config.max_pool_size),
            keep_alive_ms: AtomicU64::new(duration_ms(config.keep_alive)),
            max_wait_for_low_priority_ms: AtomicU64::new(duration_ms(
                config.max_wait_for_low_priority,
            )),
            allow_core_timeout: AtomicBool::new(config.allow_core_timeout),
            next_worker_id: AtomicUsize::new(0),
            thread_name_prefix: config.thread_name_prefix.clone(),
            clock,
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn core_pool_size(&self) -> usize {
        self.core_pool_size.load(Ordering::Acquire)
    }

    pub(crate) fn max_pool_size(&self) -> usize {
        self.max_pool_size.load(Ordering::Acquire)
    }

    pub(crate) fn keep_alive_ms(&self) -> u64 {
        self.keep_alive_ms.load(Ordering::Acquire)
    }

    pub(crate) fn max_wait_for_low_priority_ms(&self) -> u64 {
        self.max_wait_for_low_priority_ms.load(Ordering::Acquire)
    }

    pub(crate) fn current_pool_size(&self) -> usize {
        self.state.lock().current_pool_size
    }

    #[cfg(test)]
    pub(crate) fn available_worker_count(&self) -> usize {
        self.state.lock().available_workers.len()
    }

    // ===== live configuration =====

    pub(crate) fn set_core_pool_size(&self, core_pool_size: usize) -> Result<(), Error> {
        if core_pool_size < 1 {
            return Err(Error::with_message(
                ErrorKind::InvalidConfiguration,
                "core_pool_size must be >= 1",
            ));
        }
        if self.max_pool_size() < core_pool_size {
            return Err(Error::with_message(
                ErrorKind::InvalidConfiguration,
                "core_pool_size must be <= max_pool_size",
            ));
        }
        self.core_pool_size.store(core_pool_size, Ordering::Release);
        self.expire_old_workers();
        Ok(())
    }

    pub(crate) fn set_max_pool_size(&self, max_pool_size: usize) -> Result<(), Error> {
        if max_pool_size < 1 {
            return Err(Error::with_message(
                ErrorKind::InvalidConfiguration,
                "max_pool_size must be >= 1",
            ));
        }
        if max_pool_size < self.core_pool_size() {
            return Err(Error::with_message(
                ErrorKind::InvalidConfiguration,
                "max_pool_size must be >= core_pool_size",
            ));
        }
        self.max_pool_size.store(max_pool_size, Ordering::Release);
        self.expire_old_workers();
        Ok(())
    }

    pub(crate) fn set_keep_alive(&self, keep_alive: Duration) {
        self.keep_alive_ms
            .store(duration_ms(keep_alive), Ordering::Release);
        self.expire_old_workers();
    }

    pub(crate) fn set_max_wait_for_low_priority(&self, max_wait: Duration) {
        self.max_wait_for_low_priority_ms
            .store(duration_ms(max_wait), Ordering::Release);
    }

    pub(crate) fn allow_core_thread_timeout(&self, value: bool) {
        self.allow_core_timeout.store(value, Ordering::Release);
        if value {
            self.expire_old_workers();
        }
    }

    // ===== task acceptors =====

    /// Finds a worker for a high-priority task. Prefers an idle worker,
    /// creates one while the pool has room, and waits without bound only at
    /// the maximum size. Drops the task when the pool has shut down.
    pub(crate) fn run_high_priority_task(&self, task: Arc<TaskWrapper>) {
        let worker = {
            let mut state = self.state.lock();
            if !self.is_running() {
                None
            } else if state.current_pool_size >= self.max_pool_size() {
                self.get_existing_worker_locked(&mut state, None)
            } else if let Some(worker) = state.available_workers.pop_front() {
                Some(worker)
            } else {
                self.make_new_worker_locked(&mut state)
            }
        };
        self.hand_off(worker, task);
    }

    /// Finds a worker for a low-priority task: waits a bounded time for an
    /// existing worker before growing the pool, trading latency for thread
    /// reuse. Waits without bound at the maximum size.
    pub(crate) fn run_low_priority_task(&self, task: Arc<TaskWrapper>) {
        let worker = {
            let mut state = self.state.lock();
            if !self.is_running() {
                None
            } else {
                let max_wait = if state.current_pool_size >= self.max_pool_size() {
                    None
                } else {
                    Some(Duration::from_millis(self.max_wait_for_low_priority_ms()))
                };
                match self.get_existing_worker_locked(&mut state, max_wait) {
                    Some(worker) => Some(worker),
                    None if !self.is_running() => None,
                    None => {
                        // Wait budget spent. Other activity may have grown
                        // the pool to its maximum in the meantime.
                        if state.current_pool_size >= self.max_pool_size() {
                            self.get_existing_worker_locked(&mut state, None)
                        } else {
                            self.make_new_worker_locked(&mut state)
                        }
                    }
                }
            }
        };
        self.hand_off(worker, task);
    }

    fn hand_off(&self, worker: Option<Worker>, task: Arc<TaskWrapper>) {
        // No worker means shutdown raced the dispatch; the queue drain has
        // cancelled (or will cancel) the task.
        let Some(worker) = worker else {
            return;
        };
        if let Err(err) = worker.next_task(task) {
            error!(worker_id = worker.id(), %err, "task handoff failed");
        }
    }

    /// Waits until an idle worker exists and pops the front, which holds
    /// the newest worker; the oldest ages out at the back.
    /// `None` budget waits without bound. Returns `None` when the budget is
    /// exhausted or the pool stops running.
    fn get_existing_worker_locked(
        &self,
        state: &mut MutexGuard<'_, PoolState>,
        max_wait: Option<Duration>,
    ) -> Option<Worker> {
        // An unrepresentable deadline is treated as unbounded.
        let deadline = max_wait.and_then(|wait| Instant::now().checked_add(wait));
        let bounded = max_wait.is_some() && deadline.is_some();
        loop {
            if !self.is_running() {
                return None;
            }
            if let Some(worker) = state.available_workers.pop_front() {
                return Some(worker);
            }
            if bounded {
                let deadline = deadline.unwrap_or_else(Instant::now);
                if self
                    .worker_available
                    .wait_until(state, deadline)
                    .timed_out()
                {
                    // One final attempt in case a worker arrived with the
                    // timeout.
                    return state.available_workers.pop_front();
                }
            } else {
                self.worker_available.wait(state);
            }
        }
    }

    /// Creates and starts a worker, growing the pool. The worker is not
    /// placed in `available_workers`: its first task is already inbound.
    fn make_new_worker_locked(&self, state: &mut PoolState) -> Option<Worker> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let worker = Worker::new(id, &self.clock);
        let name = format!("{}-worker-{id}", self.thread_name_prefix);
        match worker.start(self.weak_self.clone(), Arc::clone(&self.clock), name) {
            Ok(()) => {
                state.current_pool_size += 1;
                trace!(
                    worker_id = id,
                    pool_size = state.current_pool_size,
                    "worker created"
                );
                Some(worker)
            }
            Err(err) => {
                error!(%err, "worker thread could not be started");
                None
            }
        }
    }

    /// Returns a worker to the idle deque after it finished a task, expires
    /// aged-out workers, and wakes waiters. Kills the worker instead when the
    /// pool has shut down.
    pub(crate) fn worker_done(&self, worker: Worker) {
        let mut state = self.state.lock();
        if self.is_running() {
            state.available_workers.push_front(worker);
            self.expire_locked(&mut state);
            self.worker_available.notify_all();
        } else {
            Self::kill_locked(&mut state, &worker);
        }
    }

    /// Kills idle workers whose idle time exceeds the keep-alive, oldest
    /// first, down to the core size, or below it when core timeout is
    /// allowed.
    pub(crate) fn expire_old_workers(&self) {
        let mut state = self.state.lock();
        self.expire_locked(&mut state);
    }

    fn expire_locked(&self, state: &mut PoolState) {
        let now = self.clock.accurate_time();
        let keep_alive = self.keep_alive_ms();
        while (state.current_pool_size > self.core_pool_size()
            || self.allow_core_timeout.load(Ordering::Acquire))
            && state
                .available_workers
                .back()
                .is_some_and(|worker| now.saturating_sub(worker.last_run_time()) > keep_alive)
        {
            if let Some(worker) = state.available_workers.pop_back() {
                trace!(worker_id = worker.id(), "idle worker expired");
                Self::kill_locked(state, &worker);
            }
        }
    }

    fn kill_locked(state: &mut PoolState, worker: &Worker) {
        worker.stop();
        state.current_pool_size = state.current_pool_size.saturating_sub(1);
    }

    /// Synthesizes idle workers until the core size is reached. A no-op
    /// once the pool has shut down.
    pub(crate) fn prestart_all_core_threads(&self) {
        let mut state = self.state.lock();
        if !self.is_running() {
            return;
        }
        let mut started = false;
        while state.current_pool_size < self.core_pool_size() {
            let Some(worker) = self.make_new_worker_locked(&mut state) else {
                break;
            };
            state.available_workers.push_front(worker);
            started = true;
        }
        if started {
            self.worker_available.notify_all();
        }
    }

    /// Flips the pool out of the running state. Returns whether this call
    /// won the transition; only the winner proceeds to tear down queues and
    /// workers.
    pub(crate) fn start_shutdown(&self) -> bool {
        let won = self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            // Taking the state lock orders this wakeup after any in-flight
            // worker wait has begun, so none of them can miss it.
            let _state = self.state.lock();
            self.worker_available.notify_all();
        }
        won
    }

    /// Kills every idle worker. Running workers discover the stopped pool in
    /// `worker_done` and terminate themselves.
    pub(crate) fn shutdown_all_workers(&self) {
        let mut state = self.state.lock();
        while let Some(worker) = state.available_workers.pop_front() {
            Self::kill_locked(&mut state, &worker);
        }
        debug!(
            still_running = state.current_pool_size,
            "idle workers killed"
        );
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
