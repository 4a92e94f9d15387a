use crate::queue::core::Scheduler;
use crate::queue::scheduler::TaskScheduler;
use crate::task::future::Future;
use std::sync::Arc;

/// Scheduling priority of a task.
///
/// Executors scan the ready queues from `High` down to `Low` for every pop
/// decision. Within one priority bucket recency wins; no global ordering is
/// asserted under contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskPriority {
    High = 0,
    Regular = 1,
    Low = 2,
}

impl TaskPriority {
    pub(crate) fn from_u8(v: u8) -> TaskPriority {
        match v {
            0 => TaskPriority::High,
            2 => TaskPriority::Low,
            _ => TaskPriority::Regular,
        }
    }
}

/// Spawn policy: where a task is admitted, what it waits on, and at which
/// priority it runs.
///
/// A policy is anchored either on a scheduler ([`TaskPolicy::on`]) or on a
/// dependency future ([`TaskPolicy::after`]), from which the governing
/// scheduler is resolved at spawn time. The execution shape is chosen by
/// the spawn entry point ([`spawn`](crate::spawn) vs
/// [`spawn_team`](crate::spawn_team)).
#[derive(Clone)]
pub struct TaskPolicy {
    pub(crate) sched: Option<TaskScheduler>,
    pub(crate) dep: Future<()>,
    pub(crate) priority: TaskPriority,
}

impl TaskPolicy {
    /// Policy anchored on a scheduler, with no dependency.
    pub fn on(sched: &TaskScheduler, priority: TaskPriority) -> TaskPolicy {
        TaskPolicy {
            sched: Some(sched.clone()),
            dep: Future::null(),
            priority,
        }
    }

    /// Policy anchored on a dependency future. The spawned task is admitted
    /// to the dependency's scheduler and runs only after it completes.
    ///
    /// Spawning through a policy whose dependency is null aborts with
    /// *missing scheduler*, since there is nothing to resolve one from.
    pub fn after<V>(dep: &Future<V>, priority: TaskPriority) -> TaskPolicy {
        TaskPolicy {
            sched: None,
            dep: dep.as_void(),
            priority,
        }
    }

    /// Adds a dependency to a scheduler-anchored policy.
    ///
    /// A null future is accepted and ignored, so this is equivalent to the
    /// plain scheduler policy in that case.
    pub fn depends_on<V>(mut self, dep: &Future<V>) -> TaskPolicy {
        if !dep.is_null() {
            self.dep = dep.as_void();
        }
        self
    }

    /// Governing scheduler: the explicit one, or the owner of the
    /// dependency task.
    pub(crate) fn resolve_scheduler(&self) -> Option<Arc<Scheduler>> {
        if let Some(s) = &self.sched {
            return Some(Arc::clone(&s.shared));
        }
        self.dep.raw().map(|raw| {
            let ptr = raw.header().sched;
            // Safety: the record holds one strong count on its scheduler for
            // its whole lifetime, so the pointer is valid and incrementing
            // is sound.
            unsafe {
                Arc::increment_strong_count(ptr);
                Arc::from_raw(ptr)
            }
        })
    }
}
