//! Two-priority, dynamically sized task scheduler.
//!
//! `priopool` runs in-process workloads that mix latency-sensitive work with
//! best-effort background work. Tasks are submitted as
//! [`High`](TaskPriority::High) or [`Low`](TaskPriority::Low) priority,
//! optionally with a submission delay or a fixed inter-execution delay for
//! recurring work. The worker pool grows and shrinks with usage between a
//! core and a maximum size.
//!
//! The guarantees, in one paragraph: within one priority, tasks with
//! distinct due times start in due-time order, and tasks with identical due
//! times start in submission order. A high-priority task never waits behind
//! a low-priority task for worker acquisition: the priorities have
//! independent queues and dispatchers, and the low dispatcher voluntarily
//! caps its wait for an idle worker at
//! [`max_wait_for_low_priority`](SchedulerConfig::max_wait_for_low_priority)
//! before growing the pool. Idle workers are reused newest-first and expire
//! oldest-first after
//! [`keep_alive`](SchedulerConfig::keep_alive).
//!
//! # Example
//!
//! ```
//! use priopool::{PriorityScheduler, SchedulerConfig, TaskPriority};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), priopool::Error> {
//! let scheduler = PriorityScheduler::new(SchedulerConfig::new(1, 4, Duration::from_secs(1)))?;
//!
//! // Fire-and-forget, latency-sensitive.
//! scheduler.execute(Arc::new(|| { /* handle request */ }))?;
//!
//! // Background maintenance: reuses an idle worker when one frees up within
//! // the configured wait, rather than spawning a thread immediately.
//! scheduler.execute_with_priority(Arc::new(|| { /* compact logs */ }), TaskPriority::Low)?;
//!
//! // Value-producing, with a result future.
//! let sum = scheduler.submit_fn(|| (1..=10).sum::<u32>())?;
//! assert_eq!(sum.get()?, 55);
//!
//! scheduler.shutdown();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
mod dispatcher;
pub mod error;
pub mod future;
mod pool;
mod queue;
pub mod scheduler;
pub mod task;
mod worker;

pub use clock::Clock;
pub use config::SchedulerConfig;
pub use error::{Error, ErrorKind};
pub use future::TaskFuture;
pub use scheduler::PriorityScheduler;
pub use task::{Task, TaskPriority};
