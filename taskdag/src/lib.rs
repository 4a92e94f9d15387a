//! A task-DAG scheduler for heterogeneous parallel workloads.
//!
//! User computations are packaged as *tasks* forming a dynamically built
//! directed acyclic graph: a spawn may name a dependency [`Future`], a
//! [`when_all`](TaskScheduler::when_all) aggregate synchronizes on a whole
//! set of them, and a running task may *respawn* itself with a new
//! dependency. Task records live in a bounded [memory pool](pool), ready
//! tasks sit in priority-ordered intrusive queues, and execution is pulled
//! by workers that run bodies either solo or as cooperating *teams* with
//! barriers and shared scratch.
//!
//! ```
//! use taskdag::{TaskPolicy, TaskPriority, TaskScheduler};
//!
//! let sched = TaskScheduler::builder().try_build().unwrap();
//!
//! let one = sched.spawn(TaskPriority::Regular, |_m| 1i32);
//! let dep = one.clone();
//! let two = taskdag::spawn(TaskPolicy::after(&one, TaskPriority::Regular), move |_m| {
//!     *dep.get() * 2
//! });
//!
//! sched.wait();
//! assert_eq!(*two.get(), 2);
//! ```

mod error;

mod exec;

mod policy;

pub mod pool;

mod queue;

mod task;

#[cfg(test)]
mod test_utils;

pub use error::FaultKind;
pub use exec::team::TeamMember;
pub use policy::{TaskPolicy, TaskPriority};
pub use queue::scheduler::{Builder, TaskScheduler, spawn, spawn_team};
pub use task::future::Future;
