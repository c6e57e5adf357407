//! The scheduler's public surface.
//!
//! [`PriorityScheduler`] ties the pieces together: two delay queues, two
//! lazily-started dispatchers, and one worker pool. Submissions validate
//! their arguments, wrap the action, enqueue it on the queue for its
//! priority, and nudge that queue's dispatcher to life.
//!
//! Data flow: submit → enqueue → dispatcher takes when due → pool lends a
//! worker → worker runs the task → worker returns to the pool → (recurring)
//! the task re-sorts itself back into its queue.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::dispatcher::{TaskAcceptor, TaskDispatcher};
use crate::error::{Error, ErrorKind};
use crate::future::{action_future, compute_future, TaskFuture};
use crate::pool::PoolShared;
use crate::queue::DelayQueue;
use crate::task::{Task, TaskCell, TaskPriority, TaskWrapper};

/// Two-priority, dynamically sized task scheduler.
///
/// The pool grows and shrinks with usage between a core and a maximum size.
/// High-priority tasks never wait behind low-priority tasks for worker
/// acquisition; low-priority tasks spend a bounded wait trying to reuse an
/// existing worker before growing the pool.
///
/// Clones share the same scheduler; see
/// [`make_with_default_priority`](PriorityScheduler::make_with_default_priority)
/// for a clone that applies a different default priority.
///
/// # Example
///
/// ```
/// use priopool::{PriorityScheduler, SchedulerConfig, Task};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # fn main() -> Result<(), priopool::Error> {
/// let scheduler = PriorityScheduler::new(SchedulerConfig::new(1, 4, Duration::from_secs(1)))?;
///
/// let heartbeat: Arc<dyn Task> = Arc::new(|| println!("tick"));
/// scheduler.schedule_with_fixed_delay(
///     Arc::clone(&heartbeat),
///     Duration::ZERO,
///     Duration::from_millis(100),
/// )?;
///
/// let answer = scheduler.submit_fn(|| 6 * 7)?;
/// assert_eq!(answer.get()?, 42);
///
/// scheduler.remove(&heartbeat);
/// scheduler.shutdown();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PriorityScheduler {
    core: Arc<SchedulerCore>,
    default_priority: TaskPriority,
}

struct SchedulerCore {
    clock: Arc<Clock>,
    pool: Arc<PoolShared>,
    high_queue: Arc<DelayQueue>,
    low_queue: Arc<DelayQueue>,
    high_dispatcher: TaskDispatcher,
    low_dispatcher: TaskDispatcher,
    reschedule_on_panic: bool,
}

impl PriorityScheduler {
    /// Builds a scheduler from a validated configuration. No thread starts
    /// until the first submission (or an explicit
    /// [`prestart_all_core_threads`](PriorityScheduler::prestart_all_core_threads)).
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidConfiguration`] when the configuration fails
    /// validation.
    pub fn new(config: SchedulerConfig) -> Result<Self, Error> {
        config.validate()?;

        let clock = Arc::new(Clock::new());
        let pool = PoolShared::new(&config, Arc::clone(&clock));
        let high_queue = Arc::new(DelayQueue::new("high", Arc::clone(&clock)));
        let low_queue = Arc::new(DelayQueue::new("low", Arc::clone(&clock)));

        let high_acceptor: TaskAcceptor = {
            let pool = Arc::clone(&pool);
            Arc::new(move |task| pool.run_high_priority_task(task))
        };
        let low_acceptor: TaskAcceptor = {
            let pool = Arc::clone(&pool);
            Arc::new(move |task| pool.run_low_priority_task(task))
        };
        let high_dispatcher = TaskDispatcher::new(
            "high-priority",
            Arc::clone(&high_queue),
            high_acceptor,
            format!("{}-high-dispatcher", config.thread_name_prefix),
        );
        let low_dispatcher = TaskDispatcher::new(
            "low-priority",
            Arc::clone(&low_queue),
            low_acceptor,
            format!("{}-low-dispatcher", config.thread_name_prefix),
        );

        Ok(Self {
            core: Arc::new(SchedulerCore {
                clock,
                pool,
                high_queue,
                low_queue,
                high_dispatcher,
                low_dispatcher,
                reschedule_on_panic: config.reschedule_on_panic,
            }),
            default_priority: config.default_priority,
        })
    }

    /// A view of this scheduler whose submissions default to `priority`.
    /// The view shares queues, workers, and shutdown state with the
    /// original.
    #[must_use]
    pub fn make_with_default_priority(&self, priority: TaskPriority) -> Self {
        Self {
            core: Arc::clone(&self.core),
            default_priority: priority,
        }
    }

    // ===== submission =====

    /// Runs the task as soon as a worker is available, at the default
    /// priority.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] after [`shutdown`](PriorityScheduler::shutdown).
    pub fn execute(&self, task: Arc<dyn Task>) -> Result<(), Error> {
        self.schedule_with_priority(task, Duration::ZERO, self.default_priority)
    }

    /// Runs the task as soon as a worker is available, at the given
    /// priority.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] after [`shutdown`](PriorityScheduler::shutdown).
    pub fn execute_with_priority(
        &self,
        task: Arc<dyn Task>,
        priority: TaskPriority,
    ) -> Result<(), Error> {
        self.schedule_with_priority(task, Duration::ZERO, priority)
    }

    /// Runs the task once `delay` has elapsed, at the default priority.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] after [`shutdown`](PriorityScheduler::shutdown).
    pub fn schedule(&self, task: Arc<dyn Task>, delay: Duration) -> Result<(), Error> {
        self.schedule_with_priority(task, delay, self.default_priority)
    }

    /// Runs the task once `delay` has elapsed, at the given priority.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] after [`shutdown`](PriorityScheduler::shutdown).
    pub fn schedule_with_priority(
        &self,
        task: Arc<dyn Task>,
        delay: Duration,
        priority: TaskPriority,
    ) -> Result<(), Error> {
        let wrapper = Arc::new(TaskWrapper::one_time(
            TaskCell::Action(task),
            priority,
            delay,
            Arc::clone(&self.core.clock),
        ));
        self.core.add_to_queue(wrapper, priority)
    }

    /// Like [`execute`](PriorityScheduler::execute), returning a future to
    /// observe completion or cancel before start.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] after [`shutdown`](PriorityScheduler::shutdown).
    pub fn submit(&self, task: Arc<dyn Task>) -> Result<TaskFuture<()>, Error> {
        self.submit_scheduled_with_priority(task, Duration::ZERO, self.default_priority)
    }

    /// Like [`submit`](PriorityScheduler::submit) with an explicit priority.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] after [`shutdown`](PriorityScheduler::shutdown).
    pub fn submit_with_priority(
        &self,
        task: Arc<dyn Task>,
        priority: TaskPriority,
    ) -> Result<TaskFuture<()>, Error> {
        self.submit_scheduled_with_priority(task, Duration::ZERO, priority)
    }

    /// Like [`schedule`](PriorityScheduler::schedule), returning a future.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] after [`shutdown`](PriorityScheduler::shutdown).
    pub fn submit_scheduled(
        &self,
        task: Arc<dyn Task>,
        delay: Duration,
    ) -> Result<TaskFuture<()>, Error> {
        self.submit_scheduled_with_priority(task, delay, self.default_priority)
    }

    /// Like [`submit_scheduled`](PriorityScheduler::submit_scheduled) with
    /// an explicit priority.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] after [`shutdown`](PriorityScheduler::shutdown).
    pub fn submit_scheduled_with_priority(
        &self,
        task: Arc<dyn Task>,
        delay: Duration,
        priority: TaskPriority,
    ) -> Result<TaskFuture<()>, Error> {
        let (cell, future) = action_future(task);
        let wrapper = Arc::new(TaskWrapper::one_time(
            TaskCell::Future(cell),
            priority,
            delay,
            Arc::clone(&self.core.clock),
        ));
        self.core.add_to_queue(wrapper, priority)?;
        Ok(future)
    }

    /// Submits a value-producing computation at the default priority.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] after [`shutdown`](PriorityScheduler::shutdown).
    pub fn submit_fn<T, F>(&self, compute: F) -> Result<TaskFuture<T>, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit_fn_scheduled_with_priority(compute, Duration::ZERO, self.default_priority)
    }

    /// Submits a value-producing computation at the given priority.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] after [`shutdown`](PriorityScheduler::shutdown).
    pub fn submit_fn_with_priority<T, F>(
        &self,
        compute: F,
        priority: TaskPriority,
    ) -> Result<TaskFuture<T>, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit_fn_scheduled_with_priority(compute, Duration::ZERO, priority)
    }

    /// Submits a delayed value-producing computation at the default
    /// priority.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] after [`shutdown`](PriorityScheduler::shutdown).
    pub fn submit_fn_scheduled<T, F>(
        &self,
        compute: F,
        delay: Duration,
    ) -> Result<TaskFuture<T>, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit_fn_scheduled_with_priority(compute, delay, self.default_priority)
    }

    /// Submits a delayed value-producing computation at the given priority.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] after [`shutdown`](PriorityScheduler::shutdown).
    pub fn submit_fn_scheduled_with_priority<T, F>(
        &self,
        compute: F,
        delay: Duration,
        priority: TaskPriority,
    ) -> Result<TaskFuture<T>, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (cell, future) = compute_future(compute);
        let wrapper = Arc::new(TaskWrapper::one_time(
            TaskCell::Future(cell),
            priority,
            delay,
            Arc::clone(&self.core.clock),
        ));
        self.core.add_to_queue(wrapper, priority)?;
        Ok(future)
    }

    /// Schedules a recurring task at the default priority: first run after
    /// `initial_delay`, then `recurring_delay` after the *end* of each run.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] after [`shutdown`](PriorityScheduler::shutdown).
    pub fn schedule_with_fixed_delay(
        &self,
        task: Arc<dyn Task>,
        initial_delay: Duration,
        recurring_delay: Duration,
    ) -> Result<(), Error> {
        self.schedule_with_fixed_delay_and_priority(
            task,
            initial_delay,
            recurring_delay,
            self.default_priority,
        )
    }

    /// Schedules a recurring task at the given priority.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Shutdown`] after [`shutdown`](PriorityScheduler::shutdown).
    pub fn schedule_with_fixed_delay_and_priority(
        &self,
        task: Arc<dyn Task>,
        initial_delay: Duration,
        recurring_delay: Duration,
        priority: TaskPriority,
    ) -> Result<(), Error> {
        let queue = self.core.queue_for(priority);
        let wrapper = Arc::new(TaskWrapper::recurring(
            task,
            priority,
            initial_delay,
            recurring_delay,
            Arc::clone(&self.core.clock),
            Arc::downgrade(queue),
            self.core.reschedule_on_panic,
        ));
        self.core.add_to_queue(wrapper, priority)
    }

    // ===== removal and shutdown =====

    /// Cancels and removes the first queued occurrence of `task`, scanning
    /// the high-priority queue before the low. Returns whether one was
    /// found. A task already running finishes its current execution; a
    /// removed recurring task never runs again.
    pub fn remove(&self, task: &Arc<dyn Task>) -> bool {
        self.core.high_queue.remove(task) || self.core.low_queue.remove(task)
    }

    /// Shuts the scheduler down: queued tasks are cancelled, both
    /// dispatchers stop, idle workers are killed, and running workers
    /// terminate after their current task. Idempotent.
    pub fn shutdown(&self) {
        self.core.shutdown_now();
    }

    /// Whether [`shutdown`](PriorityScheduler::shutdown) has been invoked.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        !self.core.pool.is_running()
    }

    // ===== introspection =====

    /// Total live workers, idle or running.
    #[must_use]
    pub fn current_pool_size(&self) -> usize {
        self.core.pool.current_pool_size()
    }

    /// The configured core pool size.
    #[must_use]
    pub fn core_pool_size(&self) -> usize {
        self.core.pool.core_pool_size()
    }

    /// The configured maximum pool size.
    #[must_use]
    pub fn max_pool_size(&self) -> usize {
        self.core.pool.max_pool_size()
    }

    /// The configured idle keep-alive.
    #[must_use]
    pub fn keep_alive_time(&self) -> Duration {
        Duration::from_millis(self.core.pool.keep_alive_ms())
    }

    /// The configured bound on a low-priority task's wait for an existing
    /// worker.
    #[must_use]
    pub fn max_wait_for_low_priority(&self) -> Duration {
        Duration::from_millis(self.core.pool.max_wait_for_low_priority_ms())
    }

    /// The priority applied to submissions that do not specify one.
    #[must_use]
    pub fn default_priority(&self) -> TaskPriority {
        self.default_priority
    }

    // ===== live configuration =====

    /// Changes the core pool size.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidConfiguration`] when below 1 or above the max
    /// pool size.
    pub fn set_core_pool_size(&self, core_pool_size: usize) -> Result<(), Error> {
        self.core.pool.set_core_pool_size(core_pool_size)
    }

    /// Changes the maximum pool size.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidConfiguration`] when below 1 or below the core
    /// pool size.
    pub fn set_max_pool_size(&self, max_pool_size: usize) -> Result<(), Error> {
        self.core.pool.set_max_pool_size(max_pool_size)
    }

    /// Changes the idle keep-alive; shrinking takes effect at the next
    /// expiration pass.
    pub fn set_keep_alive_time(&self, keep_alive: Duration) {
        self.core.pool.set_keep_alive(keep_alive);
    }

    /// Changes the low-priority worker wait. Applies to future submissions
    /// only.
    pub fn set_max_wait_for_low_priority(&self, max_wait: Duration) {
        self.core.pool.set_max_wait_for_low_priority(max_wait);
    }

    /// Whether idle expiration may kill workers below the core size.
    pub fn allow_core_thread_timeout(&self, value: bool) {
        self.core.pool.allow_core_thread_timeout(value);
    }

    /// Starts idle workers until the core size is reached, so future tasks
    /// find a warm pool.
    pub fn prestart_all_core_threads(&self) {
        self.core.pool.prestart_all_core_threads();
    }
}

impl std::fmt::Debug for PriorityScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityScheduler")
            .field("default_priority", &self.default_priority)
            .field("core_pool_size", &self.core_pool_size())
            .field("max_pool_size", &self.max_pool_size())
            .field("current_pool_size", &self.current_pool_size())
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}

impl SchedulerCore {
    fn queue_for(&self, priority: TaskPriority) -> &Arc<DelayQueue> {
        match priority {
            TaskPriority::High => &self.high_queue,
            TaskPriority::Low => &self.low_queue,
        }
    }

    fn dispatcher_for(&self, priority: TaskPriority) -> &TaskDispatcher {
        match priority {
            TaskPriority::High => &self.high_dispatcher,
            TaskPriority::Low => &self.low_dispatcher,
        }
    }

    fn add_to_queue(&self, wrapper: Arc<TaskWrapper>, priority: TaskPriority) -> Result<(), Error> {
        if !self.pool.is_running() {
            return Err(Error::new(ErrorKind::Shutdown));
        }
        self.queue_for(priority).add(wrapper)?;
        self.dispatcher_for(priority).maybe_start();
        Ok(())
    }

    /// Winner-takes-all teardown: stop-and-drain each queue under its own
    /// lock (high first), then kill idle workers. Running workers observe
    /// the stopped pool when they finish.
    fn shutdown_now(&self) {
        if !self.pool.start_shutdown() {
            return;
        }
        info!("scheduler shutting down");
        self.high_queue.shutdown();
        self.low_queue.shutdown();
        self.pool.shutdown_all_workers();
    }
}

impl Drop for SchedulerCore {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}
