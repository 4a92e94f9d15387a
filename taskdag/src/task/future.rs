use crate::error::{self, FaultKind};
use crate::queue::core::Scheduler;
use crate::task::header::{Header, TaskKind};
use crate::task::raw::RawTask;
use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// A reference-counted handle to a task's output.
///
/// A `Future` is the only user-facing synchronization point: dependency
/// policies are built from it, `when_all` combines them, and [`get`]
/// reads the result once the producing task completed. Cloning increments
/// the task's reference count and dropping decrements it; the task's
/// storage returns to the pool when the last reference is gone and the
/// scheduler has released its completion hold.
///
/// A *null* future carries no task. Spawns return one when the memory pool
/// is exhausted, which callers may treat as backpressure.
///
/// [`get`]: Future::get
pub struct Future<V = ()> {
    task: *mut Header,
    _marker: PhantomData<V>,
}

// Safety: the record is shared state guarded by atomics; the value is only
// handed out (`&V`) after the completion edge established by the scheduler.
unsafe impl<V: Send> Send for Future<V> {}
unsafe impl<V: Sync> Sync for Future<V> {}

impl<V> Future<V> {
    /// A future with no target task.
    pub const fn null() -> Future<V> {
        Future {
            task: std::ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    /// Takes ownership of one existing reference on `task`.
    pub(crate) fn from_header(task: *mut Header) -> Future<V> {
        Future {
            task,
            _marker: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> Option<RawTask> {
        NonNull::new(self.task).map(RawTask::from_nonnull)
    }

    /// Transfers this handle's reference to the caller and returns the raw
    /// record pointer (null for a null future).
    pub(crate) fn into_raw(self) -> *mut Header {
        let ptr = self.task;
        std::mem::forget(self);
        ptr
    }

    pub fn is_null(&self) -> bool {
        self.task.is_null()
    }

    /// Current reference count of the target task; 0 for a null future.
    pub fn reference_count(&self) -> u32 {
        match self.raw() {
            Some(raw) => raw.header().refs.load(std::sync::atomic::Ordering::Relaxed),
            None => 0,
        }
    }

    /// Drops the reference and leaves this future null.
    pub fn clear(&mut self) {
        if let Some(raw) = self.raw() {
            Scheduler::drop_ref(raw);
        }
        self.task = std::ptr::null_mut();
    }

    /// A view of the same task with the value type erased.
    ///
    /// Any future converts to the void kind; no other cross-conversion is
    /// permitted.
    pub fn as_void(&self) -> Future<()> {
        if let Some(raw) = self.raw() {
            raw.ref_inc();
        }
        Future {
            task: self.task,
            _marker: PhantomData,
        }
    }
}

impl<V: 'static> Future<V> {
    /// Reads the task's result.
    ///
    /// Aborts on a null future, on a future whose value type does not match
    /// the task, and when the task has not reached completion. Completion
    /// is guaranteed for the dependencies of the currently running task and
    /// for everything after [`TaskScheduler::wait`](crate::TaskScheduler::wait).
    pub fn get(&self) -> &V {
        let Some(raw) = self.raw() else {
            error::fatal(FaultKind::NullFutureGet, "Future::get on a null future");
        };
        if !raw.is_complete() {
            error::fatal(
                FaultKind::ProtocolViolation,
                "Future::get before the task completed",
            );
        }
        if TypeId::of::<V>() == TypeId::of::<()>() {
            // The void view is valid for every task, aggregates included;
            // a zero-sized value needs no storage to read from.
            return unsafe { NonNull::<V>::dangling().as_ref() };
        }
        if raw.header().kind == TaskKind::Aggregate
            || (raw.header().vtable.value_type)() != TypeId::of::<V>()
        {
            error::fatal(
                FaultKind::ProtocolViolation,
                "Future::get with a mismatched value type",
            );
        }
        // Safety: value type verified above; the task is complete, so the
        // slot was written and will not be touched again.
        match unsafe { (*raw.value_ptr::<V>()).as_ref() } {
            Some(value) => value,
            None => error::fatal(
                FaultKind::ProtocolViolation,
                "completed task carries no value",
            ),
        }
    }
}

impl<V> Clone for Future<V> {
    fn clone(&self) -> Future<V> {
        if let Some(raw) = self.raw() {
            raw.ref_inc();
        }
        Future {
            task: self.task,
            _marker: PhantomData,
        }
    }
}

impl<V> Drop for Future<V> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw() {
            Scheduler::drop_ref(raw);
        }
    }
}

impl<V> Default for Future<V> {
    fn default() -> Future<V> {
        Future::null()
    }
}

impl<V> fmt::Debug for Future<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("task", &self.task)
            .field("refs", &self.reference_count())
            .finish()
    }
}
