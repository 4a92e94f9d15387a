//! Record layout and the monomorphized trampolines behind the vtable.
//!
//! A runnable record is laid out as `[Header][Option<V>][B]` so that the
//! value slot sits at an offset computable from the value type alone; a
//! future can then read the result without knowing the body type. An
//! aggregate record is `[Header][*mut Header; dep_count]`.

#![allow(unsafe_op_in_unsafe_fn)]

use crate::exec::team::TeamMember;
use crate::task::header::{Header, Vtable};
use crate::task::raw::RawTask;
use std::any::TypeId;
use std::mem;
use std::ptr::NonNull;

const fn max_usize(a: usize, b: usize) -> usize {
    if a > b { a } else { b }
}

pub(crate) const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Offset of the `Option<V>` result slot within a runnable record.
pub(crate) const fn value_offset<V>() -> usize {
    align_up(mem::size_of::<Header>(), mem::align_of::<Option<V>>())
}

/// Offset of the body within a runnable record.
pub(crate) const fn body_offset<V, B>() -> usize {
    align_up(
        value_offset::<V>() + mem::size_of::<Option<V>>(),
        mem::align_of::<B>(),
    )
}

/// Exact allocation size of a runnable record.
pub(crate) const fn record_size<V, B>() -> usize {
    body_offset::<V, B>() + mem::size_of::<B>()
}

/// Strictest alignment a runnable record needs from the pool.
pub(crate) const fn record_align<V, B>() -> usize {
    max_usize(
        mem::align_of::<Header>(),
        max_usize(mem::align_of::<Option<V>>(), mem::align_of::<B>()),
    )
}

/// Offset of the dependency pointer trailer within an aggregate record.
pub(crate) const fn aggregate_offset() -> usize {
    align_up(mem::size_of::<Header>(), mem::align_of::<*mut Header>())
}

/// Exact allocation size of an aggregate record with `n` dependencies.
pub(crate) const fn aggregate_size(n: usize) -> usize {
    aggregate_offset() + n * mem::size_of::<*mut Header>()
}

/// Vtable for a single-worker body.
pub(crate) fn single_vtable<V, B>() -> &'static Vtable
where
    V: Send + 'static,
    B: FnMut(&mut TeamMember<'_>) -> V + Send + 'static,
{
    &Vtable {
        apply: Some(apply_single::<V, B>),
        destroy: destroy_record::<V, B>,
        value_type: TypeId::of::<V>,
    }
}

/// Vtable for a team body, entered concurrently by every team member.
pub(crate) fn team_vtable<V, B>() -> &'static Vtable
where
    V: Send + 'static,
    B: Fn(&mut TeamMember<'_>) -> V + Send + Sync + 'static,
{
    &Vtable {
        apply: Some(apply_team::<V, B>),
        destroy: destroy_record::<V, B>,
        value_type: TypeId::of::<V>,
    }
}

/// Vtable for an aggregate: no body, nothing to destroy but the header.
pub(crate) fn aggregate_vtable() -> &'static Vtable {
    &Vtable {
        apply: None,
        destroy: destroy_aggregate,
        value_type: TypeId::of::<()>,
    }
}

/// Safety: the caller holds the task in the Executing state, which grants
/// exclusive access to the body and (for the writing rank) the value slot.
unsafe fn apply_single<V, B>(task: NonNull<Header>, member: &mut TeamMember<'_>)
where
    V: Send + 'static,
    B: FnMut(&mut TeamMember<'_>) -> V + Send + 'static,
{
    let raw = RawTask::from_nonnull(task);
    let body = &mut *raw.body_ptr::<V, B>();
    let value = body(member);
    // A respawned task writes again on its next invocation; replacing
    // through a reference drops the previous value.
    *raw.value_ptr::<V>() = Some(value);
}

/// Safety: as for `apply_single`; additionally the body is shared, so only
/// `Fn` access is taken and only rank 0 touches the value slot.
unsafe fn apply_team<V, B>(task: NonNull<Header>, member: &mut TeamMember<'_>)
where
    V: Send + 'static,
    B: Fn(&mut TeamMember<'_>) -> V + Send + Sync + 'static,
{
    let raw = RawTask::from_nonnull(task);
    let body = &*raw.body_ptr::<V, B>();
    let value = body(member);
    if member.team_rank() == 0 {
        *raw.value_ptr::<V>() = Some(value);
    }
}

/// Safety: called exactly once, by the releaser whose decrement observed a
/// reference count of zero.
unsafe fn destroy_record<V, B>(task: NonNull<Header>)
where
    V: Send + 'static,
    B: FnMut(&mut TeamMember<'_>) -> V + Send + 'static,
{
    let raw = RawTask::from_nonnull(task);
    std::ptr::drop_in_place(raw.body_ptr::<V, B>());
    std::ptr::drop_in_place(raw.value_ptr::<V>());
}

unsafe fn destroy_aggregate(_task: NonNull<Header>) {
    // The trailer is plain pointers; the references they held were released
    // when the aggregate completed.
}
