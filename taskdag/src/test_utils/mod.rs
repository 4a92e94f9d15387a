//! Shared helpers for the in-crate test suites.

use crate::pool::SuperblockPool;
use crate::queue::scheduler::TaskScheduler;

/// A scheduler with the default pool and the given execution shape.
pub(crate) fn scheduler(workers: usize, team_size: usize) -> TaskScheduler {
    TaskScheduler::builder()
        .workers(workers)
        .team_size(team_size)
        .team_scratch_size(4096)
        .try_build()
        .expect("test scheduler")
}

/// A caller-driven scheduler whose pool fits exactly `records` blocks of
/// `charged` bytes each.
pub(crate) fn bounded_scheduler(records: usize, charged: usize) -> TaskScheduler {
    TaskScheduler::builder()
        .pool(SuperblockPool::new(records * charged))
        .try_build()
        .expect("bounded test scheduler")
}
