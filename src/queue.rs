//! Dynamic delay queue: an ordered-by-due-time sequence with blocking take.
//!
//! Deliberately not a heap. The entries form a stable ordered sequence so
//! that tasks with identical due times run in insertion order, and so a
//! recurring task can be repositioned mid-sequence after committing a new due
//! time. One lock guards structural mutation; the take path marks a recurring
//! task as executing and re-inserts it at the tail in the same critical
//! section, so there is no window in which the task is neither queued nor
//! marked executing; [`DelayQueue::remove`] relies on that.
//!
//! Every reorder runs under a frozen clock (see [`Clock::freeze`]): the delay
//! of the inserted entry and the delays of the entries it is compared against
//! are all computed from the same instant, keeping the ordering decision
//! internally consistent.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::clock::Clock;
use crate::error::{Error, ErrorKind};
use crate::task::{Task, TaskWrapper};

/// Head delays beyond this are treated as "not schedulable" and waited on
/// without a timeout; any insert or reposition wakes the waiter anyway.
const MAX_TIMED_WAIT_MS: i64 = 86_400_000;

/// Callback used by [`DelayQueue::reposition`]. The queue invokes it between
/// removing the entry and re-reading its delay, letting the task clear its
/// executing flag at exactly the right instant.
pub(crate) trait DelayedUpdater {
    fn allow_delay_update(&self);
}

struct QueueState {
    entries: VecDeque<Arc<TaskWrapper>>,
    shutdown: bool,
}

/// One priority class's queue of pending task wrappers.
pub(crate) struct DelayQueue {
    name: &'static str,
    state: Mutex<QueueState>,
    available: Condvar,
    clock: Arc<Clock>,
}

impl DelayQueue {
    pub(crate) fn new(name: &'static str, clock: Arc<Clock>) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            clock,
        }
    }

    /// Inserts the task at the position implied by its current delay and
    /// wakes the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Shutdown`] once the queue has been shut down.
    pub(crate) fn add(&self, task: Arc<TaskWrapper>) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(Error::new(ErrorKind::Shutdown));
        }
        let _frozen = self.clock.freeze();
        let now = self.clock.last_known_time();
        Self::insert_sorted(&mut state, task, now);
        self.available.notify_all();
        Ok(())
    }

    /// Blocks until the head is due, then removes and returns it. A live
    /// recurring task is marked executing and re-inserted at the tail in the
    /// same critical section. Returns `None` once the queue is shut down.
    pub(crate) fn take(&self) -> Option<Arc<TaskWrapper>> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            let wait = match state.entries.front() {
                None => None,
                Some(head) => {
                    let now = self.clock.accurate_time();
                    let delay = head.delay_ms(now);
                    if delay <= 0 {
                        break;
                    }
                    if delay > MAX_TIMED_WAIT_MS {
                        None
                    } else {
                        Some(Duration::from_millis(delay.unsigned_abs()))
                    }
                }
            };
            match wait {
                None => self.available.wait(&mut state),
                Some(timeout) => {
                    let _ = self.available.wait_for(&mut state, timeout);
                }
            }
        }
        let task = state.entries.pop_front()?;
        if task.mark_executing() {
            state.entries.push_back(Arc::clone(&task));
        }
        Some(task)
    }

    /// Re-sorts a task that has announced a new due time. The entry is
    /// removed, `updater.allow_delay_update()` is invoked so the true new
    /// delay becomes readable, and the entry is re-inserted at the position
    /// that delay implies, all under the queue lock with the clock frozen.
    /// A task no longer present (cancelled and removed concurrently) is left
    /// alone, as is a queue that has shut down.
    pub(crate) fn reposition(&self, task: &Arc<TaskWrapper>, updater: &dyn DelayedUpdater) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        let Some(pos) = state.entries.iter().position(|e| Arc::ptr_eq(e, task)) else {
            return;
        };
        let Some(entry) = state.entries.remove(pos) else {
            return;
        };
        let _frozen = self.clock.freeze();
        let now = self.clock.last_known_time();
        updater.allow_delay_update();
        Self::insert_sorted(&mut state, entry, now);
        self.available.notify_all();
    }

    /// Cancels and removes the first entry carrying the given action.
    /// Returns whether one was found. O(n) scan by action identity.
    pub(crate) fn remove(&self, action: &Arc<dyn Task>) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state.entries.iter().position(|e| e.matches_action(action)) else {
            return false;
        };
        if let Some(task) = state.entries.remove(pos) {
            task.cancel();
        }
        true
    }

    /// Shuts the queue down: cancels every queued task, drops the entries,
    /// and wakes the dispatcher so its take observes the shutdown. Only this
    /// queue's lock is involved.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        for task in &state.entries {
            task.cancel();
        }
        let dropped = state.entries.len();
        state.entries.clear();
        self.available.notify_all();
        debug!(queue = self.name, dropped, "delay queue shut down");
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn insert_sorted(state: &mut QueueState, task: Arc<TaskWrapper>, now: u64) {
        let delay = task.delay_ms(now);
        let idx = state
            .entries
            .partition_point(|e| e.delay_ms(now) <= delay);
        state.entries.insert(idx, task);
    }

    #[cfg(test)]
    fn entries_snapshot(&self) -> Vec<Arc<TaskWrapper>> {
        self.state.lock().entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskCell, TaskPriority};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    fn noop_wrapper(clock: &Arc<Clock>, delay: Duration) -> Arc<TaskWrapper> {
        Arc::new(TaskWrapper::one_time(
            TaskCell::Action(Arc::new(|| {})),
            TaskPriority::High,
            delay,
            Arc::clone(clock),
        ))
    }

    #[test]
    fn take_returns_due_head_immediately() {
        let clock = Arc::new(Clock::new());
        let queue = DelayQueue::new("test", Arc::clone(&clock));
        let task = noop_wrapper(&clock, Duration::ZERO);
        queue.add(Arc::clone(&task)).expect("queue is open");

        let taken = queue.take().expect("queue not shut down");
        assert!(Arc::ptr_eq(&taken, &task));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn take_blocks_until_head_is_due() {
        let clock = Arc::new(Clock::new());
        let queue = Arc::new(DelayQueue::new("test", Arc::clone(&clock)));
        queue
            .add(noop_wrapper(&clock, Duration::from_millis(60)))
            .expect("queue is open");

        let q = Arc::clone(&queue);
        let start = Instant::now();
        let handle = std::thread::spawn(move || q.take());
        let taken = handle.join().expect("take thread");
        assert!(taken.is_some());
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(45),
            "take returned after {elapsed:?}, before the head was due"
        );
    }

    #[test]
    fn earlier_insert_wakes_blocked_take() {
        let clock = Arc::new(Clock::new());
        let queue = Arc::new(DelayQueue::new("test", Arc::clone(&clock)));
        queue
            .add(noop_wrapper(&clock, Duration::from_secs(30)))
            .expect("queue is open");

        let q = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            q.take();
            start.elapsed()
        });

        std::thread::sleep(Duration::from_millis(30));
        queue
            .add(noop_wrapper(&clock, Duration::ZERO))
            .expect("queue is open");

        let elapsed = handle.join().expect("take thread");
        assert!(
            elapsed < Duration::from_secs(5),
            "blocked take not woken by earlier head, waited {elapsed:?}"
        );
    }

    #[test]
    fn shutdown_wakes_take_with_none() {
        let clock = Arc::new(Clock::new());
        let queue = Arc::new(DelayQueue::new("test", clock));

        let q = Arc::clone(&queue);
        let handle = std::thread::spawn(move || q.take());
        std::thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert!(handle.join().expect("take thread").is_none());
    }

    #[test]
    fn shutdown_cancels_queued_tasks() {
        let clock = Arc::new(Clock::new());
        let queue = DelayQueue::new("test", Arc::clone(&clock));
        let task = noop_wrapper(&clock, Duration::from_secs(1));
        queue.add(Arc::clone(&task)).expect("queue is open");

        queue.shutdown();
        assert!(task.is_canceled());
        assert_eq!(queue.len(), 0);
        assert!(queue.add(noop_wrapper(&clock, Duration::ZERO)).is_err());
    }

    #[test]
    fn taken_recurring_task_stays_at_tail_for_removal() {
        let clock = Arc::new(Clock::new());
        let queue = Arc::new(DelayQueue::new("test", Arc::clone(&clock)));
        let action: Arc<dyn Task> = Arc::new(|| {});
        let task = Arc::new(TaskWrapper::recurring(
            Arc::clone(&action),
            TaskPriority::High,
            Duration::ZERO,
            Duration::from_millis(100),
            Arc::clone(&clock),
            Arc::downgrade(&queue),
            true,
        ));
        queue.add(Arc::clone(&task)).expect("queue is open");

        let taken = queue.take().expect("due recurring task");
        assert!(Arc::ptr_eq(&taken, &task));
        // Still present (at the tail, ineligible) so remove can find it.
        assert_eq!(queue.len(), 1);
        assert!(queue.remove(&action));
        assert!(task.is_canceled());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn reposition_restores_eligibility_and_order() {
        let clock = Arc::new(Clock::new());
        let queue = Arc::new(DelayQueue::new("test", Arc::clone(&clock)));
        let recurring = Arc::new(TaskWrapper::recurring(
            Arc::new(|| {}),
            TaskPriority::High,
            Duration::ZERO,
            Duration::ZERO,
            Arc::clone(&clock),
            Arc::downgrade(&queue),
            true,
        ));
        queue.add(Arc::clone(&recurring)).expect("queue is open");
        let _taken = queue.take().expect("due recurring task");

        // Another pending entry behind which the recurring task must sort.
        let later = noop_wrapper(&clock, Duration::from_secs(5));
        queue.add(Arc::clone(&later)).expect("queue is open");

        queue.reposition(&recurring, recurring.as_ref());
        let snapshot = queue.entries_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(
            Arc::ptr_eq(&snapshot[0], &recurring),
            "repositioned task with zero recurring delay should lead the queue"
        );
    }

    #[test]
    fn remove_misses_unknown_action() {
        let clock = Arc::new(Clock::new());
        let queue = DelayQueue::new("test", Arc::clone(&clock));
        queue
            .add(noop_wrapper(&clock, Duration::ZERO))
            .expect("queue is open");
        let unknown: Arc<dyn Task> = Arc::new(|| {});
        assert!(!queue.remove(&unknown));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn take_ignores_cancelled_flag_but_run_is_noop() {
        // Cancelling does not remove from the queue; the wrapper's run
        // short-circuits instead.
        let clock = Arc::new(Clock::new());
        let queue = DelayQueue::new("test", Arc::clone(&clock));
        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_task = Arc::clone(&ran);
        let task = Arc::new(TaskWrapper::one_time(
            TaskCell::Action(Arc::new(move || ran_in_task.store(true, Ordering::SeqCst))),
            TaskPriority::High,
            Duration::ZERO,
            Arc::clone(&clock),
        ));
        queue.add(Arc::clone(&task)).expect("queue is open");
        task.cancel();
        let taken = queue.take().expect("cancelled task is still taken");
        taken.run();
        assert!(!ran.load(Ordering::SeqCst));
    }

    proptest! {
        #[test]
        fn insertion_is_sorted_and_stable(delays in proptest::collection::vec(0u64..4, 1..32)) {
            let clock = Arc::new(Clock::new());
            let queue = DelayQueue::new("prop", Arc::clone(&clock));
            let base = clock.accurate_time() + 10_000;

            let mut added = Vec::new();
            for delay in &delays {
                let task = Arc::new(TaskWrapper::one_time(
                    TaskCell::Action(Arc::new(|| {})),
                    TaskPriority::High,
                    Duration::ZERO,
                    Arc::clone(&clock),
                ));
                task.set_run_time(base + delay);
                queue.add(Arc::clone(&task)).expect("queue is open");
                added.push((base + delay, task));
            }

            let now = clock.last_known_time();
            let snapshot = queue.entries_snapshot();
            prop_assert_eq!(snapshot.len(), added.len());

            // Non-decreasing by delay.
            for pair in snapshot.windows(2) {
                prop_assert!(pair[0].delay_ms(now) <= pair[1].delay_ms(now));
            }

            // FIFO within equal due times: per due-time bucket, queue order
            // equals insertion order.
            for bucket in 0u64..4 {
                let run_time = base + bucket;
                let expected: Vec<_> = added
                    .iter()
                    .filter(|(rt, _)| *rt == run_time)
                    .map(|(_, task)| Arc::as_ptr(task))
                    .collect();
                let actual: Vec<_> = snapshot
                    .iter()
                    .filter(|task| task.delay_ms(now) == run_time as i64 - now as i64)
                    .map(Arc::as_ptr)
                    .collect();
                prop_assert_eq!(expected, actual);
            }
        }
    }
}
