#![allow(unsafe_op_in_unsafe_fn)]

use crate::task::header::Header;
use crate::task::layout;
use crate::task::state::{END_TAG, is_sentinel};
use std::ptr::NonNull;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

/// Thin typed handle over a task record. Copying it does not touch the
/// reference count; ownership of references is tracked by the callers.
#[derive(Clone, Copy)]
pub(crate) struct RawTask {
    ptr: NonNull<Header>,
}

impl RawTask {
    pub(crate) fn from_nonnull(ptr: NonNull<Header>) -> RawTask {
        RawTask { ptr }
    }

    /// Null and sentinel pointers resolve to `None`.
    pub(crate) fn from_ptr(ptr: *mut Header) -> Option<RawTask> {
        if ptr.is_null() || is_sentinel(ptr) {
            return None;
        }
        // Safety: checked non-null above.
        Some(RawTask {
            ptr: unsafe { NonNull::new_unchecked(ptr) },
        })
    }

    pub(crate) fn as_ptr(self) -> *mut Header {
        self.ptr.as_ptr()
    }

    pub(crate) fn nonnull(self) -> NonNull<Header> {
        self.ptr
    }

    pub(crate) fn header(&self) -> &Header {
        // Safety: a RawTask only exists while some reference keeps the
        // record alive.
        unsafe { self.ptr.as_ref() }
    }

    /// A task is complete exactly when its wait list is closed.
    pub(crate) fn is_complete(&self) -> bool {
        self.header().wait.load(Acquire) == END_TAG
    }

    pub(crate) fn ref_inc(&self) {
        self.header().refs.fetch_add(1, Relaxed);
    }

    /// Drops one reference; returns true when this was the last one, in
    /// which case the caller owns the record and must free it.
    #[must_use]
    pub(crate) fn ref_dec(&self) -> bool {
        if self.header().refs.fetch_sub(1, Release) != 1 {
            return false;
        }
        std::sync::atomic::fence(Acquire);
        true
    }

    /// Result slot of a runnable record.
    ///
    /// Safety: the record must have been spawned with value type `V`, and
    /// the caller must hold either the Executing state or a completed task.
    pub(crate) unsafe fn value_ptr<V>(&self) -> *mut Option<V> {
        self.ptr
            .as_ptr()
            .cast::<u8>()
            .add(layout::value_offset::<V>())
            .cast::<Option<V>>()
    }

    /// Body slot of a runnable record.
    ///
    /// Safety: the record must have been spawned with body type `B` and
    /// value type `V`.
    pub(crate) unsafe fn body_ptr<V, B>(&self) -> *mut B {
        self.ptr
            .as_ptr()
            .cast::<u8>()
            .add(layout::body_offset::<V, B>())
            .cast::<B>()
    }

    /// One slot of an aggregate's dependency trailer.
    ///
    /// Safety: the record must be an aggregate and `i < dep_count`.
    pub(crate) unsafe fn agg_slot(&self, i: usize) -> *mut *mut Header {
        debug_assert!(i < self.header().dep_count as usize);
        self.ptr
            .as_ptr()
            .cast::<u8>()
            .add(layout::aggregate_offset())
            .cast::<*mut Header>()
            .add(i)
    }

    /// Loads one trailer dependency. Slots are written before admission and
    /// only read afterwards.
    ///
    /// Safety: as for `agg_slot`.
    pub(crate) unsafe fn agg_dep(&self, i: usize) -> *mut Header {
        *self.agg_slot(i)
    }
}

// Small helpers over the encoded-state link.
impl RawTask {
    pub(crate) fn store_next(&self, ptr: *mut Header) {
        self.header().next.store(ptr, Relaxed);
    }

    pub(crate) fn load_next(&self) -> *mut Header {
        self.header().next.load(Relaxed)
    }

    pub(crate) fn mark_complete(&self) {
        self.header().next.store(END_TAG, Release);
    }
}
