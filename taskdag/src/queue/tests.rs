use crate::policy::{TaskPolicy, TaskPriority};
use crate::queue::scheduler::TaskScheduler;
use crate::spawn;
use crate::task::future::Future;
use crate::test_utils::*;
use crate::TeamMember;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicU32, AtomicUsize};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

assert_impl_all!(TaskScheduler: Send, Sync, Clone);

#[rstest]
#[case::caller_driven(0)]
#[case::with_workers(2)]
fn wait_on_empty_scheduler_returns_immediately(#[case] workers: usize) {
    let sched = scheduler(workers, 1);
    sched.wait();
    assert_eq!(sched.allocated_task_count(), 0);
}

#[rstest]
#[case::caller_driven(0)]
#[case::with_workers(2)]
fn fan_in_reduce(#[case] workers: usize) {
    let sched = scheduler(workers, 1);

    let parts: Vec<Future<i32>> = (0..16)
        .map(|i| sched.spawn(TaskPriority::Regular, move |_m| i as i32))
        .collect();
    let all = sched.when_all(&parts);
    assert!(!all.is_null());

    let inputs = parts.clone();
    let total = spawn(TaskPolicy::after(&all, TaskPriority::Regular), move |_m| {
        inputs.iter().map(|f| *f.get()).sum::<i32>()
    });

    sched.wait();
    assert_eq!(*total.get(), 120);
}

#[test]
fn chain_of_dependent_tasks() {
    let sched = scheduler(0, 1);

    let t0 = sched.spawn(TaskPriority::Regular, |_m| 1i32);
    let d0 = t0.clone();
    let t1 = spawn(TaskPolicy::after(&t0, TaskPriority::Regular), move |_m| {
        *d0.get() * 2
    });
    let d1 = t1.clone();
    let t2 = spawn(TaskPolicy::after(&t1, TaskPriority::Regular), move |_m| {
        *d1.get() + 3
    });

    sched.wait();
    assert_eq!(*t2.get(), 5);
}

#[rstest]
#[case::caller_driven(0)]
#[case::one_worker(1)]
#[case::four_workers(4)]
fn deep_chain_completes(#[case] workers: usize) {
    let sched = scheduler(workers, 1);

    let mut prev: Future<u64> = sched.spawn(TaskPriority::Regular, |_m| 0u64);
    for _ in 0..64 {
        let dep = prev.clone();
        prev = spawn(TaskPolicy::after(&prev, TaskPriority::Regular), move |_m| {
            *dep.get() + 1
        });
    }

    sched.wait();
    assert_eq!(*prev.get(), 64);
}

#[rstest]
#[case::one_worker(1)]
#[case::two_workers(2)]
#[case::four_workers(4)]
fn fan_out_completes(#[case] workers: usize) {
    let sched = scheduler(workers, 1);
    let hits = Arc::new(AtomicUsize::new(0));

    let futures: Vec<Future<()>> = (0..200)
        .map(|_| {
            let hits = Arc::clone(&hits);
            sched.spawn(TaskPriority::Regular, move |_m| {
                hits.fetch_add(1, SeqCst);
            })
        })
        .collect();

    sched.wait();
    assert_eq!(hits.load(SeqCst), 200);
    assert!(futures.iter().all(|f| !f.is_null()));
}

#[test]
fn respawn_runs_the_body_twice() {
    let sched = scheduler(0, 1);
    let calls = Arc::new(AtomicU32::new(0));

    let seen = Arc::clone(&calls);
    let f = sched.spawn(TaskPriority::Regular, move |m: &mut TeamMember<'_>| {
        if seen.fetch_add(1, SeqCst) == 0 {
            m.respawn(TaskPriority::Regular);
            0
        } else {
            42
        }
    });

    sched.wait();
    assert_eq!(*f.get(), 42);
    assert_eq!(calls.load(SeqCst), 2);
}

#[test]
fn pool_pressure_fails_exactly_one_spawn() {
    fn body() -> impl FnMut(&mut TeamMember<'_>) -> usize + Send + 'static {
        |_m| 7
    }

    let probe = scheduler(0, 1);
    let charged = probe.spawn_allocation_size(&body());
    drop(probe);

    // Room for exactly 8 task records.
    let sched = bounded_scheduler(8, charged);
    let futures: Vec<Future<usize>> = (0..9)
        .map(|_| sched.spawn(TaskPriority::Regular, body()))
        .collect();

    assert_eq!(futures.iter().filter(|f| f.is_null()).count(), 1);

    sched.wait();
    for f in futures.iter().filter(|f| !f.is_null()) {
        assert_eq!(*f.get(), 7);
    }
    drop(futures);
    assert_eq!(sched.allocated_task_count(), 0);
}

#[test]
fn when_all_after_prior_completion() {
    let sched = scheduler(0, 1);

    let a = sched.spawn(TaskPriority::Regular, |_m| 1i32);
    sched.wait();

    let b = sched.when_all(std::slice::from_ref(&a));
    sched.wait();

    assert!(!b.is_null());
    let () = *b.get();
}

#[test]
fn when_all_of_nothing_is_null_and_allocates_nothing() {
    let sched = scheduler(0, 1);
    let before = sched.allocated_task_count_accum();

    let none: [Future<i32>; 0] = [];
    let f = sched.when_all(&none);

    assert!(f.is_null());
    assert_eq!(sched.allocated_task_count_accum(), before);
}

#[test]
fn when_all_skips_null_entries() {
    let sched = scheduler(0, 1);

    let a = sched.spawn(TaskPriority::Regular, |_m| 1i32);
    let deps = [a.as_void(), Future::<i32>::null().as_void()];
    let all = sched.when_all(&deps);

    sched.wait();
    assert!(!all.is_null());
    let () = *all.get();
}

#[test]
fn when_all_keeps_dependencies_alive() {
    let sched = scheduler(0, 1);

    let a = sched.spawn(TaskPriority::Regular, |_m| 1i32);
    let all = sched.when_all(std::slice::from_ref(&a));
    drop(a);

    sched.wait();
    let () = *all.get();

    // Only the aggregate is still held, through `all`.
    assert_eq!(sched.allocated_task_count(), 1);
    drop(all);
    assert_eq!(sched.allocated_task_count(), 0);
}

#[test]
fn null_dependency_behaves_like_scheduler_only_policy() {
    let sched = scheduler(0, 1);

    let null: Future<i32> = Future::null();
    let f = spawn(
        TaskPolicy::on(&sched, TaskPriority::Regular).depends_on(&null),
        |_m| 5i32,
    );

    sched.wait();
    assert_eq!(*f.get(), 5);
}

#[test]
#[should_panic(expected = "missing scheduler")]
fn spawn_without_scheduler_aborts() {
    let null: Future<i32> = Future::null();
    let _ = spawn(TaskPolicy::after(&null, TaskPriority::Regular), |_m| 1i32);
}

#[test]
fn priority_and_lifo_order_on_a_single_worker() {
    let sched = scheduler(1, 1);

    // Park the worker inside a gate task so the ready queues can fill up.
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let gate = sched.spawn(TaskPriority::High, move |_m| {
        entered_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    });
    entered_rx.recv().unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let record = |tag: &'static str| {
        let order = Arc::clone(&order);
        move |_m: &mut TeamMember<'_>| {
            order.lock().unwrap().push(tag);
        }
    };

    let _low = sched.spawn(TaskPriority::Low, record("low"));
    let _r1 = sched.spawn(TaskPriority::Regular, record("r1"));
    let _r2 = sched.spawn(TaskPriority::Regular, record("r2"));
    let _high = sched.spawn(TaskPriority::High, record("high"));

    release_tx.send(()).unwrap();
    sched.wait();
    assert!(!gate.is_null());

    // High before Regular before Low; recency wins within a bucket.
    assert_eq!(*order.lock().unwrap(), vec!["high", "r2", "r1", "low"]);
}

#[test]
fn wait_timeout_leaves_the_graph_intact() {
    let sched = scheduler(1, 1);

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let ran = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&ran);
    let f = sched.spawn(TaskPriority::Regular, move |_m| {
        release_rx.recv().unwrap();
        seen.fetch_add(1, SeqCst);
    });

    assert!(sched.wait_timeout(Duration::from_millis(20)).is_err());

    release_tx.send(()).unwrap();
    sched.wait();
    assert!(!f.is_null());
    assert_eq!(ran.load(SeqCst), 1);
}

#[test]
fn allocation_counters_track_records() {
    let sched = scheduler(0, 1);
    assert_eq!(sched.allocated_task_count(), 0);

    let a = sched.spawn(TaskPriority::Regular, |_m| 1i32);
    let b = sched.spawn(TaskPriority::Regular, |_m| 2i32);

    assert_eq!(sched.allocated_task_count(), 2);
    assert_eq!(sched.allocated_task_count_accum(), 2);
    assert!(sched.allocated_task_count_max() >= 2);
    assert!(sched.allocation_capacity() > 0);

    sched.wait();
    drop(a);
    drop(b);
    assert_eq!(sched.allocated_task_count(), 0);
}

#[test]
fn spawning_from_inside_a_body_extends_the_graph() {
    let sched = scheduler(0, 1);
    let inner = Arc::new(AtomicU32::new(0));

    let handle = sched.clone();
    let seen = Arc::clone(&inner);
    let f = sched.spawn(TaskPriority::Regular, move |_m| {
        let seen = Arc::clone(&seen);
        let child = handle.spawn(TaskPriority::High, move |_m| {
            seen.fetch_add(1, SeqCst);
        });
        assert!(!child.is_null());
    });

    sched.wait();
    assert!(!f.is_null());
    assert_eq!(inner.load(SeqCst), 1);
}
