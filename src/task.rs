//! Task wrappers carried through the queues and handed to workers.
//!
//! A [`TaskWrapper`] pins down everything the scheduler needs to know about a
//! submission: its priority, its absolute due time, whether it recurs, and a
//! monotonic cancellation flag. Recurring wrappers additionally own the
//! re-entry protocol described on [`TaskWrapper::mark_executing`]: while the
//! user action runs, the wrapper stays in its queue at the tail with an
//! infinite reported delay, so [`remove`](crate::queue::DelayQueue::remove)
//! can still find it, and repositions itself once the run finishes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::clock::Clock;
use crate::future::ErasedFutureTask;
use crate::queue::{DelayQueue, DelayedUpdater};

/// The two static priority classes. Each has an independent queue and
/// dispatcher; a High submission never waits behind a Low submission for
/// worker acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskPriority {
    /// Latency-sensitive work. May create a new worker immediately when no
    /// idle worker exists and the pool has room.
    High,
    /// Best-effort work. Waits a bounded time for an existing idle worker
    /// before being allowed to grow the pool.
    Low,
}

/// A user-provided action, runnable any number of times.
///
/// Blanket-implemented for closures, so `Arc::new(|| { .. })` coerces to
/// `Arc<dyn Task>`. Submissions take `Arc<dyn Task>` rather than a bare
/// closure so the same handle can later be passed to
/// [`remove`](crate::scheduler::PriorityScheduler::remove).
pub trait Task: Send + Sync {
    /// Runs the action.
    fn run(&self);
}

impl<F> Task for F
where
    F: Fn() + Send + Sync,
{
    fn run(&self) {
        self();
    }
}

/// Whether a task executes once or repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    OneTime,
    Recurring,
}

/// The work a wrapper carries: either a plain action or a future-bearing
/// task whose result is observed through a [`TaskFuture`](crate::future::TaskFuture).
pub(crate) enum TaskCell {
    Action(Arc<dyn Task>),
    Future(Arc<dyn ErasedFutureTask>),
}

impl TaskCell {
    fn run(&self) {
        match self {
            Self::Action(action) => action.run(),
            Self::Future(future) => future.run_future(),
        }
    }

    fn matches(&self, action: &Arc<dyn Task>) -> bool {
        match self {
            Self::Action(a) => Arc::ptr_eq(a, action),
            Self::Future(future) => future.matches_action(action),
        }
    }

    fn on_cancel(&self) {
        if let Self::Future(future) = self {
            future.cancel_task();
        }
    }
}

/// A scheduled unit of work, keyed by absolute due time.
pub(crate) struct TaskWrapper {
    priority: TaskPriority,
    kind: TaskKind,
    recurring_delay_ms: u64,
    canceled: AtomicBool,
    /// Recurring only: set while the action runs, making the reported delay
    /// infinite so the queue cannot hand the task out a second time.
    executing: AtomicBool,
    /// Absolute due time in clock milliseconds. For recurring tasks this is
    /// the next run time, rewritten on every reschedule.
    run_time_ms: AtomicU64,
    cell: TaskCell,
    clock: Arc<Clock>,
    /// Re-entry target for recurring tasks; dangling for one-time tasks.
    queue: Weak<DelayQueue>,
    reschedule_on_panic: bool,
}

impl TaskWrapper {
    pub(crate) fn one_time(
        cell: TaskCell,
        priority: TaskPriority,
        delay: Duration,
        clock: Arc<Clock>,
    ) -> Self {
        let run_time = clock.accurate_time().saturating_add(duration_ms(delay));
        Self {
            priority,
            kind: TaskKind::OneTime,
            recurring_delay_ms: 0,
            canceled: AtomicBool::new(false),
            executing: AtomicBool::new(false),
            run_time_ms: AtomicU64::new(run_time),
            cell,
            clock,
            queue: Weak::new(),
            reschedule_on_panic: false,
        }
    }

    pub(crate) fn recurring(
        action: Arc<dyn Task>,
        priority: TaskPriority,
        initial_delay: Duration,
        recurring_delay: Duration,
        clock: Arc<Clock>,
        queue: Weak<DelayQueue>,
        reschedule_on_panic: bool,
    ) -> Self {
        let run_time = clock.accurate_time().saturating_add(duration_ms(initial_delay));
        Self {
            priority,
            kind: TaskKind::Recurring,
            recurring_delay_ms: duration_ms(recurring_delay),
            canceled: AtomicBool::new(false),
            executing: AtomicBool::new(false),
            run_time_ms: AtomicU64::new(run_time),
            cell: TaskCell::Action(action),
            clock,
            queue,
            reschedule_on_panic,
        }
    }

    pub(crate) fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Cancels the task. Monotonic: once set, `run` is a no-op and a
    /// recurring task will not re-enqueue.
    pub(crate) fn cancel(&self) {
        if !self.canceled.swap(true, Ordering::AcqRel) {
            self.cell.on_cancel();
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Remaining delay in milliseconds relative to `now`, negative when
    /// overdue. A recurring task that is currently executing reports
    /// `i64::MAX` so it cannot be taken again while it runs.
    pub(crate) fn delay_ms(&self, now: u64) -> i64 {
        if self.executing.load(Ordering::Acquire) {
            return i64::MAX;
        }
        let run_time = self.run_time_ms.load(Ordering::Acquire);
        i64::try_from(run_time).unwrap_or(i64::MAX) - i64::try_from(now).unwrap_or(i64::MAX)
    }

    /// Called by the queue, under the queue lock, at the instant the task is
    /// taken. Returns whether the wrapper must be re-inserted at the tail:
    /// true for a live recurring task (which from now on reports an infinite
    /// delay), false for one-time and cancelled tasks.
    pub(crate) fn mark_executing(&self) -> bool {
        if self.is_canceled() || self.kind != TaskKind::Recurring {
            return false;
        }
        self.executing.store(true, Ordering::Release);
        true
    }

    /// Whether the provided action is the one this wrapper carries.
    pub(crate) fn matches_action(&self, action: &Arc<dyn Task>) -> bool {
        self.cell.matches(action)
    }

    /// Runs the task on a worker thread. Cancelled tasks are a no-op. For a
    /// recurring task the reschedule happens in a drop guard, so it runs even
    /// when the user action panics (when so configured); the panic then
    /// continues to unwind into the worker's handler.
    pub(crate) fn run(self: Arc<Self>) {
        if self.is_canceled() {
            return;
        }
        match self.kind {
            TaskKind::OneTime => self.cell.run(),
            TaskKind::Recurring => {
                let mut guard = RescheduleGuard {
                    task: Arc::clone(&self),
                    armed: self.reschedule_on_panic,
                };
                self.cell.run();
                guard.armed = true;
            }
        }
    }

    /// Commits the next run time and re-sorts the wrapper inside its queue.
    /// Skipped when the queue is gone or shut down.
    fn reschedule(task: &Arc<TaskWrapper>) {
        let Some(queue) = task.queue.upgrade() else {
            return;
        };
        let next = task
            .clock
            .accurate_time()
            .saturating_add(task.recurring_delay_ms);
        task.run_time_ms.store(next, Ordering::Release);
        queue.reposition(task, task.as_ref());
    }

    #[cfg(test)]
    pub(crate) fn set_run_time(&self, run_time_ms: u64) {
        self.run_time_ms.store(run_time_ms, Ordering::Release);
    }
}

impl DelayedUpdater for TaskWrapper {
    /// Clears the executing flag so the queue can read the true new delay.
    /// Called by the queue between removal and re-insertion, under the queue
    /// lock.
    fn allow_delay_update(&self) {
        self.executing.store(false, Ordering::Release);
    }
}

struct RescheduleGuard {
    task: Arc<TaskWrapper>,
    armed: bool,
}

impl Drop for RescheduleGuard {
    fn drop(&mut self) {
        if self.armed && !self.task.is_canceled() {
            TaskWrapper::reschedule(&self.task);
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_action(counter: &Arc<AtomicUsize>) -> Arc<dyn Task> {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn cancelled_task_does_not_run() {
        let clock = Arc::new(Clock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let wrapper = Arc::new(TaskWrapper::one_time(
            TaskCell::Action(counting_action(&counter)),
            TaskPriority::High,
            Duration::ZERO,
            clock,
        ));
        wrapper.cancel();
        Arc::clone(&wrapper).run();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_is_idempotent() {
        let clock = Arc::new(Clock::new());
        let wrapper = TaskWrapper::one_time(
            TaskCell::Action(Arc::new(|| {})),
            TaskPriority::Low,
            Duration::ZERO,
            clock,
        );
        wrapper.cancel();
        wrapper.cancel();
        assert!(wrapper.is_canceled());
    }

    #[test]
    fn delay_tracks_run_time() {
        let clock = Arc::new(Clock::new());
        let wrapper = TaskWrapper::one_time(
            TaskCell::Action(Arc::new(|| {})),
            TaskPriority::High,
            Duration::from_millis(100),
            Arc::clone(&clock),
        );
        let now = clock.accurate_time();
        let delay = wrapper.delay_ms(now);
        assert!((90..=110).contains(&delay), "delay was {delay}");
        assert!(wrapper.delay_ms(now + 200) < 0);
    }

    #[test]
    fn executing_recurring_task_reports_infinite_delay() {
        let clock = Arc::new(Clock::new());
        let wrapper = TaskWrapper::recurring(
            Arc::new(|| {}),
            TaskPriority::High,
            Duration::ZERO,
            Duration::from_millis(50),
            Arc::clone(&clock),
            Weak::new(),
            true,
        );
        assert!(wrapper.mark_executing());
        assert_eq!(wrapper.delay_ms(clock.accurate_time()), i64::MAX);
        wrapper.allow_delay_update();
        assert!(wrapper.delay_ms(clock.accurate_time()) < i64::MAX);
    }

    #[test]
    fn mark_executing_declines_one_time_and_cancelled_tasks() {
        let clock = Arc::new(Clock::new());
        let one_time = TaskWrapper::one_time(
            TaskCell::Action(Arc::new(|| {})),
            TaskPriority::High,
            Duration::ZERO,
            Arc::clone(&clock),
        );
        assert!(!one_time.mark_executing());

        let recurring = TaskWrapper::recurring(
            Arc::new(|| {}),
            TaskPriority::High,
            Duration::ZERO,
            Duration::ZERO,
            clock,
            Weak::new(),
            true,
        );
        recurring.cancel();
        assert!(!recurring.mark_executing());
    }

    #[test]
    fn recurring_run_without_queue_still_runs_action() {
        let clock = Arc::new(Clock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let wrapper = Arc::new(TaskWrapper::recurring(
            counting_action(&counter),
            TaskPriority::Low,
            Duration::ZERO,
            Duration::from_millis(10),
            clock,
            Weak::new(),
            true,
        ));
        wrapper.run();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn matches_action_by_identity() {
        let clock = Arc::new(Clock::new());
        let action: Arc<dyn Task> = Arc::new(|| {});
        let other: Arc<dyn Task> = Arc::new(|| {});
        let wrapper = TaskWrapper::one_time(
            TaskCell::Action(Arc::clone(&action)),
            TaskPriority::High,
            Duration::ZERO,
            clock,
        );
        assert!(wrapper.matches_action(&action));
        assert!(!wrapper.matches_action(&other));
    }
}
