use crate::exec::team::TeamMember;
use crate::policy::TaskPriority;
use crate::queue::core::Scheduler;
use std::any::TypeId;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU32};

/// Execution shape of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    /// Runs on exactly one worker.
    Single = 0,
    /// Runs cooperatively on a full team of workers.
    Team = 1,
    /// Bodyless when-all node; resolves purely through reference counting
    /// and never enters a ready queue.
    Aggregate = 2,
}

impl TaskKind {
    /// Row in the ready-queue matrix. Aggregates are never queued.
    pub(crate) fn queue_row(self) -> usize {
        debug_assert!(self != TaskKind::Aggregate);
        self as usize
    }
}

/// Per-record function table, one instance per (value, body) pair.
///
/// This is the only dynamic dispatch site in the crate: the executor calls
/// `apply` through it, and the final reference drop calls `destroy`.
pub(crate) struct Vtable {
    /// Body trampoline; null for aggregates.
    pub(crate) apply: Option<unsafe fn(NonNull<Header>, &mut TeamMember<'_>)>,

    /// Drops the body and result in place before the storage returns to the
    /// pool.
    pub(crate) destroy: unsafe fn(NonNull<Header>),

    /// Value type recorded at spawn, checked when a future reads the result.
    pub(crate) value_type: fn() -> TypeId,
}

/// The per-task control block, placed at offset zero of every record.
///
/// `next` is the sole field mutated under contention (see the state module);
/// everything else is written at construction or while the task is held in
/// the Executing state.
#[repr(C)]
pub(crate) struct Header {
    /// Owning scheduler. The record carries one strong count on it, released
    /// when the record is freed.
    pub(crate) sched: *const Scheduler,

    /// Intrusive link doubling as the encoded lifecycle state.
    pub(crate) next: AtomicPtr<Header>,

    /// Head of the list of tasks blocked on this one.
    pub(crate) wait: AtomicPtr<Header>,

    /// Pending dependency; consumed on admission.
    pub(crate) dep: AtomicPtr<Header>,

    /// Live references: futures, wait-list links, and the scheduler's
    /// completion hold. Born at 2.
    pub(crate) refs: AtomicU32,

    /// Exact allocation size, passed back verbatim on free.
    pub(crate) alloc_size: u32,

    /// Aggregate only: number of pointers in the trailer.
    pub(crate) dep_count: u32,

    pub(crate) vtable: &'static Vtable,

    pub(crate) kind: TaskKind,

    /// May be rewritten by a respawn while Executing.
    pub(crate) priority: AtomicU8,

    /// Set by a respawn request; observed by the executor after the body
    /// returns.
    pub(crate) respawn: AtomicBool,
}

impl Header {
    pub(crate) fn new(
        sched: *const Scheduler,
        vtable: &'static Vtable,
        kind: TaskKind,
        priority: TaskPriority,
        alloc_size: u32,
        dep_count: u32,
    ) -> Header {
        Header {
            sched,
            next: AtomicPtr::new(std::ptr::null_mut()),
            wait: AtomicPtr::new(std::ptr::null_mut()),
            dep: AtomicPtr::new(std::ptr::null_mut()),
            refs: AtomicU32::new(2),
            alloc_size,
            dep_count,
            vtable,
            kind,
            priority: AtomicU8::new(priority as u8),
            respawn: AtomicBool::new(false),
        }
    }
}
