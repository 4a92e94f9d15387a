//! Executors: glue between the ready queues and user task bodies.

use crate::error::{self, FaultKind};
use crate::queue::core::Scheduler;
use crate::task::raw::RawTask;
use std::sync::atomic::Ordering::AcqRel;

pub mod team;

pub(crate) mod workers;

#[cfg(test)]
mod tests;

/// Runs a popped task on the current thread as a team of one and settles
/// its outcome. Used by solo workers and the caller-driven drain paths.
///
/// A panicking body still completes its task, so dependants and waiters
/// are released before the panic resumes on the caller.
pub(crate) fn run_inline(sched: &Scheduler, task: RawTask) {
    let mut member = team::TeamMember::solo(task);
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        apply(task, &mut member);
    }));
    match outcome {
        Ok(()) => finalize(sched, task),
        Err(payload) => {
            task.header()
                .respawn
                .store(false, std::sync::atomic::Ordering::Relaxed);
            sched.complete(task);
            std::panic::resume_unwind(payload);
        }
    }
}

/// Invokes the task's body trampoline.
pub(crate) fn apply(task: RawTask, member: &mut team::TeamMember<'_>) {
    match task.header().vtable.apply {
        // Safety: the task was popped in the Executing state, granting the
        // team exclusive access to its body.
        Some(apply) => unsafe { apply(task.nonnull(), member) },
        None => error::fatal(
            FaultKind::ProtocolViolation,
            "aggregate task reached an executor",
        ),
    }
}

/// Settles a task after its body returned: a pending respawn readmits it,
/// otherwise it completes and cascades.
pub(crate) fn finalize(sched: &Scheduler, task: RawTask) {
    if task.header().respawn.swap(false, AcqRel) {
        tracing::trace!(task = ?task.as_ptr(), "respawn readmission");
        sched.schedule(task);
    } else {
        sched.complete(task);
    }
}
