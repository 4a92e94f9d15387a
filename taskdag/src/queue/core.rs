//! The queue core: admission, ready queues, wait lists, the completion
//! cascade, and termination detection.

use crate::exec;
use crate::exec::workers::ThreadPool;
use crate::policy::TaskPriority;
use crate::pool::MemoryPool;
use crate::task::header::{Header, TaskKind};
use crate::task::raw::RawTask;
use crate::task::state::{END_TAG, LOCK_TAG};
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::ptr::NonNull;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Validated scheduler configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SchedulerConfig {
    /// Dedicated worker threads. With zero workers the scheduler executes
    /// on the calling thread: spawns opportunistically drain ready tasks in
    /// place and `wait` drains to completion.
    pub(crate) workers: usize,

    /// Workers cooperating on one team task. Workers are partitioned into
    /// `workers / team_size` static teams.
    pub(crate) team_size: usize,

    /// Bytes of scratch shared by the members of one team.
    pub(crate) team_scratch_size: usize,
}

/// Outcome of an attempt to park a task on a dependency's wait list.
enum Attach {
    /// Linked; the dependency's completion drain will readmit the waiter.
    Linked,
    /// The list is closed: the dependency already completed.
    Closed,
}

/// Scheduler state shared by every handle, worker, and task record.
pub(crate) struct Scheduler {
    pub(crate) cfg: SchedulerConfig,

    pool: Box<dyn MemoryPool>,

    /// Ready stacks indexed by (execution shape, priority). Intrusive LIFO:
    /// an empty stack holds `END_TAG`, a head mid-pop holds `LOCK_TAG`.
    ready: [[CachePadded<AtomicPtr<Header>>; 3]; 2],

    /// Admitted tasks that have not yet completed. Termination is this
    /// reaching zero.
    pending: AtomicUsize,

    // Allocation counters: outstanding, high-water, lifetime.
    count_alloc: AtomicUsize,
    max_alloc: AtomicUsize,
    accum_alloc: AtomicU64,

    /// Workers currently blocked waiting for work.
    sleepers: AtomicUsize,

    shutdown: AtomicBool,

    idle: Mutex<()>,
    work_cv: Condvar,
    done_cv: Condvar,

    /// Worker threads; empty for a caller-driven scheduler.
    pub(crate) threads: OnceLock<ThreadPool>,
}

impl Scheduler {
    pub(crate) fn new(cfg: SchedulerConfig, pool: Box<dyn MemoryPool>) -> Scheduler {
        Scheduler {
            cfg,
            pool,
            ready: std::array::from_fn(|_| {
                std::array::from_fn(|_| CachePadded::new(AtomicPtr::new(END_TAG)))
            }),
            pending: AtomicUsize::new(0),
            count_alloc: AtomicUsize::new(0),
            max_alloc: AtomicUsize::new(0),
            accum_alloc: AtomicU64::new(0),
            sleepers: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            idle: Mutex::new(()),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
            threads: OnceLock::new(),
        }
    }

    // ===== allocation =====

    /// Allocates an exact-size record from the pool, updating the counters.
    /// Returns null on exhaustion.
    pub(crate) fn allocate_record(&self, size: usize) -> *mut u8 {
        let ptr = self.pool.allocate(size);
        if ptr.is_null() {
            tracing::debug!(size, "task pool exhausted");
            return ptr;
        }
        let outstanding = self.count_alloc.fetch_add(1, Relaxed) + 1;
        self.max_alloc.fetch_max(outstanding, Relaxed);
        self.accum_alloc.fetch_add(1, Relaxed);
        ptr
    }

    /// Destroys the record's body and value and returns the storage to the
    /// pool. Called by the thread whose decrement observed zero.
    fn release_record(&self, task: RawTask) {
        let size = task.header().alloc_size as usize;
        let ptr = task.as_ptr();
        // Safety: we are the unique owner of the record.
        unsafe { (task.header().vtable.destroy)(task.nonnull()) };
        self.pool.deallocate(ptr.cast(), size);
        self.count_alloc.fetch_sub(1, Relaxed);
    }

    /// Drops one reference; exactly one caller observes zero and frees the
    /// record, releasing its hold on the scheduler with it.
    pub(crate) fn drop_ref(task: RawTask) {
        if !task.ref_dec() {
            return;
        }
        // Safety: the record owns one strong count on its scheduler, which
        // we adopt here and release after the storage is back in the pool.
        let sched = unsafe { Arc::from_raw(task.header().sched) };
        sched.release_record(task);
    }

    pub(crate) fn pool_block_size(&self, n: usize) -> usize {
        self.pool.block_size(n)
    }

    pub(crate) fn pool_capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub(crate) fn allocated(&self) -> usize {
        self.count_alloc.load(Relaxed)
    }

    pub(crate) fn allocated_max(&self) -> usize {
        self.max_alloc.load(Relaxed)
    }

    pub(crate) fn allocated_accum(&self) -> u64 {
        self.accum_alloc.load(Relaxed)
    }

    // ===== admission =====

    /// Accounts a freshly spawned task towards termination detection. Must
    /// precede its first `schedule` call.
    pub(crate) fn task_admitted(&self) {
        self.pending.fetch_add(1, Relaxed);
    }

    /// Admits a task: parks it on its dependency or pushes it to a ready
    /// queue. Also the readmission path after a respawn.
    pub(crate) fn schedule(&self, task: RawTask) {
        match task.header().kind {
            TaskKind::Aggregate => self.schedule_aggregate(task),
            _ => self.schedule_runnable(task),
        }
    }

    fn schedule_runnable(&self, task: RawTask) {
        // Consume the pending dependency, if any. The reference it carries
        // becomes the wait-list link's reference, or is returned here if
        // the dependency already completed.
        let dep = task.header().dep.swap(std::ptr::null_mut(), AcqRel);
        if let Some(dep) = RawTask::from_ptr(dep) {
            match self.attach(dep, task) {
                Attach::Linked => return,
                Attach::Closed => Self::drop_ref(dep),
            }
        }
        self.push_ready(task);
    }

    /// Walks the aggregate's trailer and parks it on the first incomplete
    /// dependency. Null slots count as complete. When no dependency is
    /// left incomplete the aggregate itself completes.
    fn schedule_aggregate(&self, task: RawTask) {
        let n = task.header().dep_count as usize;
        for i in 0..n {
            // Safety: trailer slots were written before admission.
            let Some(dep) = RawTask::from_ptr(unsafe { task.agg_dep(i) }) else {
                continue;
            };
            // The link needs its own reference, taken before the CAS so the
            // drain can never decrement past us.
            dep.ref_inc();
            match self.attach(dep, task) {
                Attach::Linked => return,
                Attach::Closed => Self::drop_ref(dep),
            }
        }
        self.complete(task);
    }

    /// CAS-pushes `waiter` onto `dep`'s wait list. Spins while the list is
    /// momentarily locked; reports `Closed` once the list ended with
    /// completion.
    fn attach(&self, dep: RawTask, waiter: RawTask) -> Attach {
        let head = &dep.header().wait;
        loop {
            let observed = head.load(Acquire);
            if observed == LOCK_TAG {
                std::hint::spin_loop();
                continue;
            }
            if observed == END_TAG {
                return Attach::Closed;
            }
            waiter.store_next(observed);
            if head
                .compare_exchange_weak(observed, waiter.as_ptr(), Release, Relaxed)
                .is_ok()
            {
                return Attach::Linked;
            }
        }
    }

    // ===== completion cascade =====

    /// Marks `task` complete, drains its wait list, and releases the
    /// references: one per drained dependant plus the scheduler's own
    /// completion hold. For aggregates the trailer references are released
    /// first.
    pub(crate) fn complete(&self, task: RawTask) {
        let header = task.header();

        if header.kind == TaskKind::Aggregate {
            for i in 0..header.dep_count as usize {
                // Safety: trailer written before admission.
                if let Some(dep) = RawTask::from_ptr(unsafe { task.agg_dep(i) }) {
                    Self::drop_ref(dep);
                }
            }
        }

        // A dependency left behind by an abandoned respawn request (a body
        // that panicked after calling respawn_after) still holds its link
        // reference.
        if let Some(stale) = RawTask::from_ptr(header.dep.swap(std::ptr::null_mut(), AcqRel)) {
            Self::drop_ref(stale);
        }

        task.mark_complete();

        // Closing the wait list publishes the result: late arrivals observe
        // END_TAG and admit themselves straight to a ready queue.
        let mut cursor = header.wait.swap(END_TAG, AcqRel);
        let mut drained = 0usize;
        while let Some(waiter) = RawTask::from_ptr(cursor) {
            cursor = waiter.load_next();
            match waiter.header().kind {
                TaskKind::Aggregate => self.schedule_aggregate(waiter),
                _ => self.push_ready(waiter),
            }
            drained += 1;
        }

        tracing::trace!(task = ?task.as_ptr(), drained, "task complete");

        self.task_completed();

        // Link references for the drained dependants. The completion hold
        // released below keeps the count above zero throughout this loop.
        for _ in 0..drained {
            Self::drop_ref(task);
        }
        Self::drop_ref(task);
    }

    fn task_completed(&self) {
        if self.pending.fetch_sub(1, AcqRel) == 1 {
            let _guard = self.idle.lock();
            self.done_cv.notify_all();
        }
    }

    // ===== ready queues =====

    /// Pushes a task whose dependencies are all complete. LIFO: the task
    /// becomes the new head with its link pointing at the old one.
    fn push_ready(&self, task: RawTask) {
        let header = task.header();
        let priority = TaskPriority::from_u8(header.priority.load(Relaxed));
        let slot = &self.ready[header.kind.queue_row()][priority as usize];
        loop {
            let head = slot.load(Acquire);
            if head == LOCK_TAG {
                std::hint::spin_loop();
                continue;
            }
            task.store_next(head);
            if slot
                .compare_exchange_weak(head, task.as_ptr(), SeqCst, Relaxed)
                .is_ok()
            {
                break;
            }
        }
        self.notify_work();
    }

    /// Pops the next ready task, scanning High, Regular, Low and preferring
    /// the given execution shape within each priority.
    pub(crate) fn pop_ready(&self, prefer_team: bool) -> Option<RawTask> {
        let rows: [usize; 2] = if prefer_team { [1, 0] } else { [0, 1] };
        for priority in 0..3 {
            for &row in &rows {
                if let Some(task) = self.pop_slot(&self.ready[row][priority]) {
                    return Some(task);
                }
            }
        }
        None
    }

    /// Treiber-style pop with a locked head: the head is swung to `LOCK_TAG`
    /// while the popped task's link is read, then released to the successor.
    /// The popped task leaves in the Executing state.
    fn pop_slot(&self, slot: &AtomicPtr<Header>) -> Option<RawTask> {
        loop {
            let head = slot.load(Acquire);
            if head == END_TAG {
                return None;
            }
            if head == LOCK_TAG {
                std::hint::spin_loop();
                continue;
            }
            if slot
                .compare_exchange_weak(head, LOCK_TAG, AcqRel, Relaxed)
                .is_ok()
            {
                // Safety: a real task pointer, checked against the sentinels.
                let task = RawTask::from_nonnull(unsafe { NonNull::new_unchecked(head) });
                slot.store(task.load_next(), Release);
                task.store_next(LOCK_TAG);
                return Some(task);
            }
        }
    }

    fn any_ready(&self) -> bool {
        self.ready
            .iter()
            .flatten()
            .any(|slot| slot.load(SeqCst) != END_TAG)
    }

    // ===== parking and termination =====

    fn notify_work(&self) {
        if self.sleepers.load(SeqCst) > 0 {
            let _guard = self.idle.lock();
            self.work_cv.notify_all();
        }
    }

    /// Blocks the calling worker until new work may exist or shutdown is
    /// requested. Spurious wakeups are fine; the caller loops.
    pub(crate) fn park_worker(&self) {
        self.sleepers.fetch_add(1, SeqCst);
        let mut guard = self.idle.lock();
        if !self.shutdown.load(SeqCst) && !self.any_ready() {
            self.work_cv.wait(&mut guard);
        }
        drop(guard);
        self.sleepers.fetch_sub(1, SeqCst);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(SeqCst)
    }

    pub(crate) fn begin_shutdown(&self) {
        tracing::debug!("scheduler shutting down");
        self.shutdown.store(true, SeqCst);
        let _guard = self.idle.lock();
        self.work_cv.notify_all();
    }

    /// Opportunistic in-place drain: with no dedicated workers the calling
    /// thread pops and runs ready tasks until the queues are empty. Spawns
    /// call this before allocating, which keeps deep recursive spawning
    /// from exhausting the pool.
    pub(crate) fn drain_if_single_threaded(&self) {
        if self.cfg.workers != 0 {
            return;
        }
        while let Some(task) = self.pop_ready(false) {
            exec::run_inline(self, task);
        }
    }

    /// Blocks until every admitted task has completed. On a caller-driven
    /// scheduler the calling thread executes the work itself.
    pub(crate) fn quiesce(&self) {
        if self.cfg.workers == 0 {
            while self.pending.load(Acquire) > 0 {
                match self.pop_ready(false) {
                    Some(task) => exec::run_inline(self, task),
                    // Another caller thread may be mid-execution; its
                    // completion cascade will surface more work.
                    None => std::thread::yield_now(),
                }
            }
        } else {
            let mut guard = self.idle.lock();
            while self.pending.load(SeqCst) > 0 {
                self.done_cv.wait(&mut guard);
            }
        }
    }

    /// As `quiesce`, bounded by a wall-clock budget. On timeout the graph
    /// is left intact and keeps executing.
    pub(crate) fn quiesce_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if self.cfg.workers == 0 {
            while self.pending.load(Acquire) > 0 {
                if Instant::now() >= deadline {
                    return false;
                }
                match self.pop_ready(false) {
                    Some(task) => exec::run_inline(self, task),
                    None => std::thread::yield_now(),
                }
            }
            true
        } else {
            let mut guard = self.idle.lock();
            while self.pending.load(SeqCst) > 0 {
                if self.done_cv.wait_until(&mut guard, deadline).timed_out() {
                    return self.pending.load(SeqCst) == 0;
                }
            }
            true
        }
    }
}
