use crate::error::{self, FaultKind};
use crate::policy::TaskPriority;
use crate::queue::core::Scheduler;
use crate::task::future::Future;
use crate::task::raw::RawTask;
use std::ops::{Add, Range};
use std::sync::Barrier;
use std::sync::atomic::Ordering::{AcqRel, Relaxed, Release};

/// Execution context handed to every task body.
///
/// For a single-worker task this is a team of one. For a team task each
/// cooperating worker enters the body with its own member carrying its
/// rank, the shared team scratch, and the team barrier. The collectives
/// ([`parallel_for`], [`parallel_reduce`], [`parallel_scan`]) partition an
/// index range across the members with stride `team_size` and combine the
/// results through the scratch buffer.
///
/// [`parallel_for`]: TeamMember::parallel_for
/// [`parallel_reduce`]: TeamMember::parallel_reduce
/// [`parallel_scan`]: TeamMember::parallel_scan
pub struct TeamMember<'a> {
    task: RawTask,
    rank: usize,
    size: usize,
    barrier: Option<&'a Barrier>,
    scratch: *mut u8,
    scratch_len: usize,
}

impl<'a> TeamMember<'a> {
    pub(crate) fn new(
        task: RawTask,
        rank: usize,
        size: usize,
        barrier: Option<&'a Barrier>,
        scratch: *mut u8,
        scratch_len: usize,
    ) -> TeamMember<'a> {
        TeamMember {
            task,
            rank,
            size,
            barrier,
            scratch,
            scratch_len,
        }
    }

    /// A team of one, for single-worker and caller-driven execution.
    pub(crate) fn solo(task: RawTask) -> TeamMember<'a> {
        TeamMember::new(task, 0, 1, None, std::ptr::null_mut(), 0)
    }

    /// This member's rank within the team, in `0..team_size()`.
    pub fn team_rank(&self) -> usize {
        self.rank
    }

    pub fn team_size(&self) -> usize {
        self.size
    }

    /// Whole team enters before any member returns. A no-op for a team of
    /// one.
    pub fn team_barrier(&self) {
        if self.size > 1 {
            if let Some(barrier) = self.barrier {
                barrier.wait();
            }
        }
    }

    /// The team-shared scratch buffer. Empty for a team of one.
    pub fn team_shared(&self) -> (*mut u8, usize) {
        (self.scratch, self.scratch_len)
    }

    // ===== respawn =====

    /// Requeues the current task for another execution once the body
    /// returns, at the given priority. Storage, identity, and the task's
    /// references are preserved; with no dependency the task becomes ready
    /// as soon as a worker can pop it.
    ///
    /// In a team body only rank 0 may request a respawn.
    pub fn respawn(&mut self, priority: TaskPriority) {
        if self.rank != 0 {
            error::fatal(
                FaultKind::WrongContext,
                "respawn must be requested by team rank 0",
            );
        }
        let header = self.task.header();
        header.priority.store(priority as u8, Relaxed);
        header.respawn.store(true, Release);
    }

    /// As [`respawn`](TeamMember::respawn), with a dependency the task
    /// waits on before re-executing. A null future is accepted and behaves
    /// like the dependency-free form.
    pub fn respawn_after<V>(&mut self, dep: &Future<V>, priority: TaskPriority) {
        self.respawn(priority);
        if let Some(d) = dep.raw() {
            // The link's reference on the new dependency, consumed on
            // readmission.
            d.ref_inc();
            let old = self.task.header().dep.swap(d.as_ptr(), AcqRel);
            if let Some(old) = RawTask::from_ptr(old) {
                // A repeated respawn_after replaces the previous request.
                Scheduler::drop_ref(old);
            }
        }
    }

    // ===== collectives =====

    /// Runs `f(i)` for every `i` in `range`, partitioned across the team
    /// with stride `team_size`.
    pub fn parallel_for<F>(&self, range: Range<usize>, mut f: F)
    where
        F: FnMut(usize),
    {
        let mut i = range.start + self.rank;
        while i < range.end {
            f(i);
            i += self.size;
        }
    }

    /// Team reduction with addition as the join. Every member receives the
    /// final value.
    pub fn parallel_reduce<T, F>(&self, range: Range<usize>, init: T, f: F) -> T
    where
        T: Copy + Add<Output = T> + 'static,
        F: FnMut(usize, &mut T),
    {
        self.parallel_reduce_join(range, init, f, |acc, v| *acc = *acc + *v)
    }

    /// Team reduction with a user-supplied join. Each member accumulates
    /// its strided slice locally, the partials meet in the team scratch,
    /// rank 0 joins them, and the result is broadcast to every member.
    /// Barriers bracket both the reduction and the broadcast.
    pub fn parallel_reduce_join<T, F, J>(&self, range: Range<usize>, init: T, mut f: F, join: J) -> T
    where
        T: Copy + 'static,
        F: FnMut(usize, &mut T),
        J: Fn(&mut T, &T),
    {
        let mut local = init;
        let mut i = range.start + self.rank;
        while i < range.end {
            f(i, &mut local);
            i += self.size;
        }

        if self.size == 1 {
            return local;
        }

        let shared = self.shared_slots::<T>();
        self.team_barrier();
        // Safety: each member writes only its own slot between barriers.
        unsafe { shared.add(self.rank).write(local) };
        self.team_barrier();
        if self.rank == 0 {
            for r in 1..self.size {
                // Safety: rank 0 has exclusive access between barriers.
                unsafe {
                    let v = shared.add(r).read();
                    join(&mut *shared, &v);
                }
            }
        }
        self.team_barrier();
        // Safety: slot 0 is stable until the next collective begins.
        unsafe { shared.read() }
    }

    /// Team exclusive scan. `f(i, value, is_final)` must add element `i`'s
    /// contribution to `value`; on the final pass `value` arrives holding
    /// the prefix for `i` (over rank-major, strided order) before the call.
    pub fn parallel_scan<T, F>(&self, range: Range<usize>, mut f: F)
    where
        T: Copy + Default + Add<Output = T> + 'static,
        F: FnMut(usize, &mut T, bool),
    {
        // First pass: each member totals its strided slice.
        let mut accum = T::default();
        let mut i = range.start + self.rank;
        while i < range.end {
            let mut local = T::default();
            f(i, &mut local, false);
            accum = accum + local;
            i += self.size;
        }

        // Rank 0 turns the member totals into member offsets.
        if self.size > 1 {
            let shared = self.shared_slots::<T>();
            self.team_barrier();
            // Safety: slot ownership as in parallel_reduce_join.
            unsafe { shared.add(self.rank).write(accum) };
            self.team_barrier();
            if self.rank == 0 {
                for r in 1..self.size {
                    // Safety: rank 0 exclusive between barriers.
                    unsafe {
                        let sum = shared.add(r - 1).read() + shared.add(r).read();
                        shared.add(r).write(sum);
                    }
                }
            }
            self.team_barrier();
            accum = if self.rank == 0 {
                T::default()
            } else {
                // Safety: totals are stable after the barrier.
                unsafe { shared.add(self.rank - 1).read() }
            };
        } else {
            accum = T::default();
        }

        // Final pass with the inter-member offset applied.
        let mut i = range.start + self.rank;
        while i < range.end {
            let mut local = T::default();
            f(i, &mut local, false);
            let mut value = accum;
            f(i, &mut value, true);
            accum = accum + local;
            i += self.size;
        }
    }

    /// The scratch viewed as one `T` slot per member.
    fn shared_slots<T: 'static>(&self) -> *mut T {
        let needed = std::mem::size_of::<T>() * self.size;
        if needed > self.scratch_len || std::mem::align_of::<T>() > crate::pool::POOL_ALIGN {
            error::fatal(
                FaultKind::ProtocolViolation,
                "team scratch too small for this collective",
            );
        }
        self.scratch.cast::<T>()
    }
}
