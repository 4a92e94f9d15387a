//! Dedicated worker threads, organized into static teams.
//!
//! Workers are partitioned into `workers / team_size` teams. Each team's
//! rank-0 worker (the leader) runs the pop loop: single tasks execute on
//! the leader alone, team tasks are broadcast through the team slot and
//! entered by every member between two barriers. Non-leader members spend
//! their idle time parked at the rendezvous barrier.

use crate::exec;
use crate::queue::core::Scheduler;
use crate::task::header::{Header, TaskKind};
use crate::task::raw::RawTask;
use crate::task::state::END_TAG;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::{Arc, Barrier};
use std::thread;

/// Worker thread handles, joined at shutdown.
pub(crate) struct ThreadPool {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    pub(crate) fn join_all(&self) {
        let current = thread::current().id();
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            // Shutdown may be triggered from a worker when a task body held
            // the last scheduler handle; that thread detaches instead of
            // joining itself and exits with its loop.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked during shutdown");
            }
        }
    }
}

/// Rendezvous state shared by the members of one team.
struct TeamShared {
    /// The task being broadcast, or `END_TAG` to release the members for
    /// shutdown.
    slot: AtomicPtr<Header>,
    barrier: Barrier,
    scratch: Scratch,
    size: usize,
}

/// Team scratch, 16-byte aligned through its element type.
struct Scratch {
    buf: Box<[UnsafeCell<u128>]>,
}

// Safety: members access the scratch only between team barriers, each rank
// writing its own slots; the barriers order every access.
unsafe impl Sync for Scratch {}

impl Scratch {
    fn new(bytes: usize) -> Scratch {
        let words = bytes.div_ceil(std::mem::size_of::<u128>());
        Scratch {
            buf: (0..words).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    fn ptr(&self) -> *mut u8 {
        self.buf.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.buf.len() * std::mem::size_of::<u128>()
    }
}

pub(crate) fn start_workers(sched: &Arc<Scheduler>) -> ThreadPool {
    let cfg = sched.cfg;
    let teams = cfg.workers / cfg.team_size;
    let mut handles = Vec::with_capacity(cfg.workers);

    for team_idx in 0..teams {
        let shared = Arc::new(TeamShared {
            slot: AtomicPtr::new(END_TAG),
            barrier: Barrier::new(cfg.team_size),
            scratch: Scratch::new(cfg.team_scratch_size),
            size: cfg.team_size,
        });

        for rank in 0..cfg.team_size {
            let sched = Arc::clone(sched);
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("taskdag-{team_idx}-{rank}"))
                .spawn(move || {
                    if rank == 0 {
                        leader_loop(&sched, &shared);
                    } else {
                        member_loop(&shared, rank);
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
    }

    ThreadPool {
        handles: Mutex::new(handles),
    }
}

fn leader_loop(sched: &Scheduler, team: &TeamShared) {
    let prefer_team = team.size > 1;
    loop {
        if sched.is_shutdown() {
            break;
        }
        match sched.pop_ready(prefer_team) {
            Some(task) => {
                // A panicking body has already completed its task; the
                // worker keeps serving the queue.
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    run_popped(sched, team, task);
                }));
                if outcome.is_err() {
                    tracing::warn!("task body panicked on a worker");
                }
            }
            None => sched.park_worker(),
        }
    }
    if team.size > 1 {
        team.slot.store(END_TAG, Release);
        team.barrier.wait();
    }
}

fn run_popped(sched: &Scheduler, team: &TeamShared, task: RawTask) {
    if task.header().kind == TaskKind::Team && team.size > 1 {
        team.slot.store(task.as_ptr(), Release);
        team.barrier.wait();
        run_body(team, task, 0);
        team.barrier.wait();
        exec::finalize(sched, task);
    } else {
        // A single task, or a team task on a team-of-one backend, runs on
        // this worker alone.
        exec::run_inline(sched, task);
    }
}

fn member_loop(team: &TeamShared, rank: usize) {
    loop {
        team.barrier.wait();
        let Some(task) = RawTask::from_ptr(team.slot.load(Acquire)) else {
            // END_TAG: the leader is releasing the team for shutdown.
            break;
        };
        run_body(team, task, rank);
        team.barrier.wait();
    }
}

fn run_body(team: &TeamShared, task: RawTask, rank: usize) {
    let mut member = exec::team::TeamMember::new(
        task,
        rank,
        team.size,
        Some(&team.barrier),
        team.scratch.ptr(),
        team.scratch.len(),
    );
    // Contain per-member panics so every rank still reaches the closing
    // barrier. A panic between collective barriers cannot be recovered.
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        exec::apply(task, &mut member);
    }));
    if outcome.is_err() {
        tracing::warn!(rank, "team body panicked");
    }
}
