//! Per-priority dispatcher threads.
//!
//! One dispatcher drains one delay queue into the pool's acceptor for that
//! priority. It is started lazily on the first enqueue; the start flag is
//! monotonic and the locked recheck makes the unlocked fast-path read safe.
//!
//! The queue's take atomically marks a recurring task as executing and
//! re-inserts it at the tail, so by the time the acceptor runs (outside any
//! queue lock) the task is already findable for removal. Acceptor failures
//! never terminate the dispatcher; they are logged and the loop continues.
//! The dispatcher stops when its queue shuts down.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::Error;
use crate::queue::DelayQueue;
use crate::task::TaskWrapper;

/// Hands a dequeued task to the worker pool. Bound to
/// `run_high_priority_task` or `run_low_priority_task`.
pub(crate) type TaskAcceptor = Arc<dyn Fn(Arc<TaskWrapper>) + Send + Sync>;

struct DispatcherShared {
    name: &'static str,
    queue: Arc<DelayQueue>,
    acceptor: TaskAcceptor,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// Lazily-started drain thread for one priority queue.
pub(crate) struct TaskDispatcher {
    shared: Arc<DispatcherShared>,
    thread_name: String,
    start_lock: Mutex<()>,
}

impl TaskDispatcher {
    pub(crate) fn new(
        name: &'static str,
        queue: Arc<DelayQueue>,
        acceptor: TaskAcceptor,
        thread_name: String,
    ) -> Self {
        Self {
            shared: Arc::new(DispatcherShared {
                name,
                queue,
                acceptor,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
            thread_name,
            start_lock: Mutex::new(()),
        }
    }

    /// Starts the dispatcher thread unless it is already running.
    /// Double-checked: the flag only ever flips false to true, so the
    /// unlocked fast path cannot start a second thread past the locked
    /// recheck.
    pub(crate) fn maybe_start(&self) {
        if self.shared.started.load(Ordering::Acquire) {
            return;
        }
        let _guard = self.start_lock.lock();
        if self.shared.started.load(Ordering::Acquire) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run_loop(&shared));
        match spawned {
            Ok(_handle) => self.shared.started.store(true, Ordering::Release),
            // Left unstarted so a later enqueue can retry.
            Err(io) => error!(dispatcher = self.shared.name, %io, "dispatcher thread spawn failed"),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.shared.started.load(Ordering::Acquire) && !self.shared.stopped.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

fn run_loop(shared: &DispatcherShared) {
    debug!(dispatcher = shared.name, "dispatcher started");
    loop {
        // take() blocks until the head is due; None means the queue shut
        // down and everything in it was cancelled.
        let Some(task) = shared.queue.take() else {
            break;
        };
        let accepted = catch_unwind(AssertUnwindSafe(|| (shared.acceptor)(task)));
        if let Err(payload) = accepted {
            let failure = Error::from_panic(payload.as_ref());
            error!(dispatcher = shared.name, %failure, "acceptor failed, dispatcher continues");
        }
    }
    shared.stopped.store(true, Ordering::Release);
    debug!(dispatcher = shared.name, "dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::task::{TaskCell, TaskPriority};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn dispatcher_over(
        queue: &Arc<DelayQueue>,
        accepted: &Arc<AtomicUsize>,
    ) -> TaskDispatcher {
        let accepted = Arc::clone(accepted);
        TaskDispatcher::new(
            "test",
            Arc::clone(queue),
            Arc::new(move |_task| {
                accepted.fetch_add(1, Ordering::SeqCst);
            }),
            "priopool-test-dispatcher".to_string(),
        )
    }

    #[test]
    fn drains_due_tasks_into_acceptor() {
        let clock = Arc::new(Clock::new());
        let queue = Arc::new(DelayQueue::new("test", Arc::clone(&clock)));
        let accepted = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_over(&queue, &accepted);

        for _ in 0..3 {
            queue
                .add(Arc::new(TaskWrapper::one_time(
                    TaskCell::Action(Arc::new(|| {})),
                    TaskPriority::High,
                    Duration::ZERO,
                    Arc::clone(&clock),
                )))
                .expect("queue is open");
            dispatcher.maybe_start();
        }

        assert!(
            wait_until(Duration::from_secs(2), || accepted.load(Ordering::SeqCst) == 3),
            "dispatcher accepted {} of 3 tasks",
            accepted.load(Ordering::SeqCst)
        );
        assert!(dispatcher.is_running());
    }

    #[test]
    fn maybe_start_is_idempotent() {
        let clock = Arc::new(Clock::new());
        let queue = Arc::new(DelayQueue::new("test", clock));
        let accepted = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_over(&queue, &accepted);
        dispatcher.maybe_start();
        dispatcher.maybe_start();
        dispatcher.maybe_start();
        assert!(dispatcher.is_running());
    }

    #[test]
    fn queue_shutdown_stops_dispatcher() {
        let clock = Arc::new(Clock::new());
        let queue = Arc::new(DelayQueue::new("test", clock));
        let accepted = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_over(&queue, &accepted);
        dispatcher.maybe_start();
        assert!(wait_until(Duration::from_secs(2), || dispatcher.is_running()));

        queue.shutdown();
        assert!(
            wait_until(Duration::from_secs(2), || dispatcher.is_stopped()),
            "dispatcher did not observe queue shutdown"
        );
        assert!(!dispatcher.is_running());
    }

    #[test]
    fn acceptor_panic_does_not_stop_the_loop() {
        let clock = Arc::new(Clock::new());
        let queue = Arc::new(DelayQueue::new("test", Arc::clone(&clock)));
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        let dispatcher = TaskDispatcher::new(
            "test",
            Arc::clone(&queue),
            Arc::new(move |_task| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                assert!(n != 0, "first acceptance panics");
            }),
            "priopool-test-dispatcher".to_string(),
        );

        for _ in 0..2 {
            queue
                .add(Arc::new(TaskWrapper::one_time(
                    TaskCell::Action(Arc::new(|| {})),
                    TaskPriority::Low,
                    Duration::ZERO,
                    Arc::clone(&clock),
                )))
                .expect("queue is open");
        }
        dispatcher.maybe_start();

        assert!(
            wait_until(Duration::from_secs(2), || accepted.load(Ordering::SeqCst) == 2),
            "dispatcher stopped after acceptor panic"
        );
        assert!(dispatcher.is_running());
    }
}
