//! The public scheduler handle, its builder, and the spawn entry points.

use crate::error::{self, FaultKind};
use crate::exec::team::TeamMember;
use crate::exec::workers;
use crate::policy::{TaskPolicy, TaskPriority};
use crate::pool::{self, MemoryPool, SuperblockPool};
use crate::queue::core::{Scheduler, SchedulerConfig};
use crate::task::future::Future;
use crate::task::header::{Header, TaskKind, Vtable};
use crate::task::layout;
use crate::task::raw::RawTask;
use anyhow::{Result, bail};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;

const DEFAULT_POOL_CAPACITY: usize = 1 << 20;
const DEFAULT_TEAM_SCRATCH: usize = 1024;

/// Configures and creates a [`TaskScheduler`].
pub struct Builder {
    workers: usize,
    team_size: usize,
    team_scratch_size: usize,
    pool: Option<Box<dyn MemoryPool>>,
    pool_capacity: usize,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            workers: 0,
            team_size: 1,
            team_scratch_size: DEFAULT_TEAM_SCRATCH,
            pool: None,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }

    /// Number of dedicated worker threads. Zero (the default) keeps all
    /// execution on the calling thread: spawns drain ready tasks in place
    /// and `wait` runs the queue to completion itself.
    pub fn workers(mut self, val: usize) -> Builder {
        self.workers = val;
        self
    }

    /// Workers cooperating on a single team task. Must divide the worker
    /// count; a caller-driven scheduler only supports teams of one.
    pub fn team_size(mut self, val: usize) -> Builder {
        self.team_size = val;
        self
    }

    /// Bytes of scratch shared by one team, used by the team collectives.
    pub fn team_scratch_size(mut self, val: usize) -> Builder {
        self.team_scratch_size = val;
        self
    }

    /// Installs a custom memory pool for task records.
    pub fn pool(mut self, pool: impl MemoryPool + 'static) -> Builder {
        self.pool = Some(Box::new(pool));
        self
    }

    /// Capacity of the default [`SuperblockPool`], ignored when a custom
    /// pool is installed.
    pub fn pool_capacity(mut self, bytes: usize) -> Builder {
        self.pool_capacity = bytes;
        self
    }

    /// Creates the configured scheduler. Workers are started before this
    /// returns; the scheduler is ready to accept spawns.
    pub fn try_build(self) -> Result<TaskScheduler> {
        let cfg = SchedulerConfig {
            workers: self.workers,
            team_size: self.team_size,
            team_scratch_size: self.team_scratch_size,
        };
        validate(&cfg)?;

        let pool = self
            .pool
            .unwrap_or_else(|| Box::new(SuperblockPool::new(self.pool_capacity)));

        let shared = Arc::new(Scheduler::new(cfg, pool));
        if cfg.workers > 0 {
            let _ = shared.threads.set(workers::start_workers(&shared));
        }

        tracing::debug!(
            workers = cfg.workers,
            team_size = cfg.team_size,
            "scheduler ready"
        );

        Ok(TaskScheduler {
            shared: Arc::clone(&shared),
            _guard: Arc::new(ShutdownGuard { shared }),
        })
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

fn validate(cfg: &SchedulerConfig) -> Result<()> {
    if cfg.team_size == 0 {
        bail!("team_size must be greater than 0");
    }
    if cfg.workers == 0 && cfg.team_size != 1 {
        bail!("a caller-driven scheduler only supports teams of one");
    }
    if cfg.workers > 0 && cfg.workers % cfg.team_size != 0 {
        bail!(
            "worker count ({}) must be a multiple of team_size ({})",
            cfg.workers,
            cfg.team_size
        );
    }
    if cfg.team_size > 1 && cfg.team_scratch_size == 0 {
        bail!("team execution requires a non-zero team_scratch_size");
    }
    Ok(())
}

/// Handle to a scheduler instance.
///
/// Handles are cheap to clone and safe to share across threads. When the
/// last handle drops, the scheduler drains every admitted task and stops
/// its workers; futures may outlive the handles and keep their records
/// alive independently.
///
/// Task bodies may capture handle clones (to spawn more work), but the
/// last handle must be dropped from outside task bodies: teardown blocks
/// until the queue drains, which a worker thread cannot do for itself.
#[derive(Clone)]
pub struct TaskScheduler {
    pub(crate) shared: Arc<Scheduler>,
    _guard: Arc<ShutdownGuard>,
}

struct ShutdownGuard {
    shared: Arc<Scheduler>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.shared.quiesce();
        self.shared.begin_shutdown();
        if let Some(threads) = self.shared.threads.get() {
            threads.join_all();
        }
    }
}

impl TaskScheduler {
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Spawns a single-worker task on this scheduler. Shorthand for the
    /// free [`spawn`] with a scheduler-anchored policy.
    pub fn spawn<V, B>(&self, priority: TaskPriority, body: B) -> Future<V>
    where
        V: Send + 'static,
        B: FnMut(&mut TeamMember<'_>) -> V + Send + 'static,
    {
        spawn(TaskPolicy::on(self, priority), body)
    }

    /// Spawns a team task on this scheduler. Shorthand for the free
    /// [`spawn_team`] with a scheduler-anchored policy.
    pub fn spawn_team<V, B>(&self, priority: TaskPriority, body: B) -> Future<V>
    where
        V: Send + 'static,
        B: Fn(&mut TeamMember<'_>) -> V + Send + Sync + 'static,
    {
        spawn_team(TaskPolicy::on(self, priority), body)
    }

    /// Builds an aggregate that completes when every given future has
    /// completed. Null entries are treated as already complete. An empty
    /// slice returns a null future and allocates nothing.
    pub fn when_all<V: 'static>(&self, deps: &[Future<V>]) -> Future<()> {
        if deps.is_empty() {
            return Future::null();
        }

        let sched = &self.shared;
        let size = layout::aggregate_size(deps.len());
        let ptr = sched.allocate_record(size);
        if ptr.is_null() {
            return Future::null();
        }

        let header_ptr = ptr.cast::<Header>();
        let sched_ptr = Arc::into_raw(Arc::clone(sched));
        // Safety: freshly allocated record of the exact aggregate size; the
        // task is not published until `schedule`.
        unsafe {
            header_ptr.write(Header::new(
                sched_ptr,
                layout::aggregate_vtable(),
                TaskKind::Aggregate,
                TaskPriority::Regular,
                size as u32,
                deps.len() as u32,
            ));
            let raw = RawTask::from_nonnull(NonNull::new_unchecked(header_ptr));
            for (i, dep) in deps.iter().enumerate() {
                let slot = raw.agg_slot(i);
                match dep.raw() {
                    Some(d) => {
                        // The trailer keeps its dependencies alive even if
                        // the caller drops the futures right away.
                        d.ref_inc();
                        slot.write(d.as_ptr());
                    }
                    None => slot.write(std::ptr::null_mut()),
                }
            }
            sched.task_admitted();
            sched.schedule(raw);
        }
        Future::from_header(header_ptr)
    }

    /// Blocks until every admitted task has completed. With no dedicated
    /// workers the calling thread executes the queue itself, so this is
    /// safe to call recursively only on a caller-driven scheduler.
    pub fn wait(&self) {
        self.shared.quiesce();
    }

    /// As [`wait`](TaskScheduler::wait), bounded by a wall-clock budget.
    /// On timeout the task graph is left intact and keeps executing.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        if self.shared.quiesce_for(timeout) {
            Ok(())
        } else {
            bail!("wait timed out after {timeout:?} with tasks outstanding");
        }
    }

    // ===== allocation introspection =====

    /// Bytes the record pool may have outstanding at once.
    pub fn allocation_capacity(&self) -> usize {
        self.shared.pool_capacity()
    }

    /// Task records currently outstanding.
    pub fn allocated_task_count(&self) -> usize {
        self.shared.allocated()
    }

    /// High-water mark of outstanding task records.
    pub fn allocated_task_count_max(&self) -> usize {
        self.shared.allocated_max()
    }

    /// Task records ever allocated.
    pub fn allocated_task_count_accum(&self) -> u64 {
        self.shared.allocated_accum()
    }

    /// Pool bytes charged for one spawned task with the given body.
    pub fn spawn_allocation_size<V, B>(&self, _body: &B) -> usize
    where
        B: FnMut(&mut TeamMember<'_>) -> V,
    {
        self.shared.pool_block_size(layout::record_size::<V, B>())
    }

    /// Pool bytes charged for a `when_all` over `n` futures.
    pub fn when_all_allocation_size(&self, n: usize) -> usize {
        self.shared.pool_block_size(layout::aggregate_size(n))
    }
}

/// Spawns a single-worker task.
///
/// The governing scheduler is resolved from the policy: the explicit one,
/// or the owner of the dependency future. With neither, this aborts with
/// *missing scheduler*. Returns a null future when the record pool is
/// exhausted.
pub fn spawn<V, B>(policy: TaskPolicy, body: B) -> Future<V>
where
    V: Send + 'static,
    B: FnMut(&mut TeamMember<'_>) -> V + Send + 'static,
{
    spawn_impl(policy, TaskKind::Single, layout::single_vtable::<V, B>(), body)
}

/// Spawns a task executed cooperatively by a full worker team.
///
/// The body is entered by every team member concurrently, hence the
/// `Fn + Sync` bound; rank 0's return value becomes the task's result.
/// On a scheduler with teams of one the body runs on a single worker.
pub fn spawn_team<V, B>(policy: TaskPolicy, body: B) -> Future<V>
where
    V: Send + 'static,
    B: Fn(&mut TeamMember<'_>) -> V + Send + Sync + 'static,
{
    spawn_impl(policy, TaskKind::Team, layout::team_vtable::<V, B>(), body)
}

fn spawn_impl<V, B>(
    policy: TaskPolicy,
    kind: TaskKind,
    vtable: &'static Vtable,
    body: B,
) -> Future<V>
where
    V: Send + 'static,
    B: Send + 'static,
{
    let Some(sched) = policy.resolve_scheduler() else {
        error::fatal(
            FaultKind::MissingScheduler,
            "spawn without a scheduler or dependency future",
        );
    };
    let TaskPolicy { dep, priority, .. } = policy;

    // Give a caller-driven scheduler the chance to clear ready tasks before
    // taking more pool space.
    sched.drain_if_single_threaded();

    if layout::record_align::<V, B>() > pool::POOL_ALIGN {
        error::fatal(
            FaultKind::ProtocolViolation,
            "task body alignment exceeds the pool's block alignment",
        );
    }

    let size = layout::record_size::<V, B>();
    let ptr = sched.allocate_record(size);
    if ptr.is_null() {
        return Future::null();
    }

    let header_ptr = ptr.cast::<Header>();
    let sched_ptr = Arc::into_raw(Arc::clone(&sched));
    // Safety: freshly allocated record of exactly `size` bytes; nothing
    // observes it until `schedule` publishes it.
    unsafe {
        header_ptr.write(Header::new(
            sched_ptr,
            vtable,
            kind,
            priority,
            size as u32,
            0,
        ));
        let raw = RawTask::from_nonnull(NonNull::new_unchecked(header_ptr));
        raw.value_ptr::<V>().write(None);
        raw.body_ptr::<V, B>().write(body);

        // The policy's dependency reference becomes the wait-list link's
        // reference, consumed by `schedule`.
        raw.header().dep.store(dep.into_raw(), Relaxed);

        tracing::trace!(task = ?header_ptr, ?kind, "spawn");
        sched.task_admitted();
        sched.schedule(raw);
        // The task may run, respawn, or complete at any moment from here
        // on; it is only reachable through the returned future.
    }
    Future::from_header(header_ptr)
}
