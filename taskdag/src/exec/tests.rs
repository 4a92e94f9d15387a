use crate::policy::TaskPriority;
use crate::test_utils::*;
use crate::TeamMember;
use rstest::rstest;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize};
use std::sync::Arc;

#[test]
fn team_reduce_over_a_range() {
    let sched = scheduler(4, 4);

    let f = sched.spawn_team(TaskPriority::Regular, |m: &mut TeamMember<'_>| {
        m.parallel_reduce(0..100, 0i64, |i, acc| *acc = *acc + i as i64)
    });

    sched.wait();
    assert_eq!(*f.get(), 4950);
}

#[rstest]
#[case::caller_driven(0, 1)]
#[case::solo_worker(1, 1)]
fn team_reduce_on_a_team_of_one(#[case] workers: usize, #[case] team_size: usize) {
    let sched = scheduler(workers, team_size);

    let f = sched.spawn_team(TaskPriority::Regular, |m: &mut TeamMember<'_>| {
        m.parallel_reduce(0..100, 0i64, |i, acc| *acc = *acc + i as i64)
    });

    sched.wait();
    assert_eq!(*f.get(), 4950);
}

#[test]
fn team_reduce_with_a_custom_join() {
    let sched = scheduler(4, 4);

    let f = sched.spawn_team(TaskPriority::Regular, |m: &mut TeamMember<'_>| {
        m.parallel_reduce_join(
            0..64,
            i64::MIN,
            |i, acc| *acc = (*acc).max((i as i64) * 3 - 100),
            |acc, v| *acc = (*acc).max(*v),
        )
    });

    sched.wait();
    assert_eq!(*f.get(), 63 * 3 - 100);
}

#[test]
fn parallel_for_covers_every_index_once() {
    let sched = scheduler(4, 4);
    let hits: Arc<Vec<AtomicU32>> = Arc::new((0..103).map(|_| AtomicU32::new(0)).collect());

    let seen = Arc::clone(&hits);
    let f = sched.spawn_team(TaskPriority::Regular, move |m: &mut TeamMember<'_>| {
        m.parallel_for(0..103, |i| {
            seen[i].fetch_add(1, SeqCst);
        });
    });

    sched.wait();
    assert!(!f.is_null());
    assert!(hits.iter().all(|h| h.load(SeqCst) == 1));
}

#[test]
fn every_rank_enters_a_team_body_once() {
    let sched = scheduler(4, 4);
    let entered: Arc<Vec<AtomicU32>> = Arc::new((0..4).map(|_| AtomicU32::new(0)).collect());

    let seen = Arc::clone(&entered);
    let f = sched.spawn_team(TaskPriority::Regular, move |m: &mut TeamMember<'_>| {
        assert_eq!(m.team_size(), 4);
        assert!(m.team_rank() < 4);
        seen[m.team_rank()].fetch_add(1, SeqCst);
        m.team_barrier();
    });

    sched.wait();
    assert!(!f.is_null());
    assert!(entered.iter().all(|e| e.load(SeqCst) == 1));
}

#[test]
fn team_scan_produces_rank_major_prefixes() {
    let sched = scheduler(2, 2);
    let out: Arc<Vec<AtomicI64>> = Arc::new((0..8).map(|_| AtomicI64::new(0)).collect());

    let sink = Arc::clone(&out);
    let f = sched.spawn_team(TaskPriority::Regular, move |m: &mut TeamMember<'_>| {
        m.parallel_scan(0..8, |i, acc: &mut i64, is_final| {
            *acc += i as i64;
            if is_final {
                sink[i].store(*acc, SeqCst);
            }
        });
    });

    sched.wait();
    assert!(!f.is_null());

    // Rank 0 owns 0,2,4,6 and rank 1 owns 1,3,5,7 with offset 12.
    let got: Vec<i64> = out.iter().map(|v| v.load(SeqCst)).collect();
    assert_eq!(got, vec![0, 13, 2, 16, 6, 21, 12, 28]);
}

#[test]
fn team_shared_is_empty_for_a_team_of_one() {
    let sched = scheduler(0, 1);
    let f = sched.spawn_team(TaskPriority::Regular, |m: &mut TeamMember<'_>| {
        let (_, len) = m.team_shared();
        len
    });
    sched.wait();
    assert_eq!(*f.get(), 0);
}

#[test]
fn respawn_with_a_dependency_spawned_mid_body() {
    let sched = scheduler(0, 1);

    let handle = sched.clone();
    let mut pending: Option<crate::Future<i32>> = None;
    let f = sched.spawn(TaskPriority::Regular, move |m: &mut TeamMember<'_>| {
        match pending.take() {
            None => {
                let dep = handle.spawn(TaskPriority::High, |_m| 21i32);
                m.respawn_after(&dep, TaskPriority::Regular);
                pending = Some(dep);
                0
            }
            Some(dep) => *dep.get() * 2,
        }
    });

    sched.wait();
    assert_eq!(*f.get(), 42);
}

#[test]
fn respawn_with_a_null_dependency_reruns_immediately() {
    let sched = scheduler(0, 1);
    let calls = Arc::new(AtomicU32::new(0));

    let seen = Arc::clone(&calls);
    let f = sched.spawn(TaskPriority::Low, move |m: &mut TeamMember<'_>| {
        let null: crate::Future<i32> = crate::Future::null();
        if seen.fetch_add(1, SeqCst) == 0 {
            m.respawn_after(&null, TaskPriority::High);
            0
        } else {
            9
        }
    });

    sched.wait();
    assert_eq!(*f.get(), 9);
    assert_eq!(calls.load(SeqCst), 2);
}

#[test]
fn in_place_drain_bounds_pool_usage() {
    fn body(counter: &Arc<AtomicUsize>) -> impl FnMut(&mut TeamMember<'_>) + Send + 'static {
        let counter = Arc::clone(counter);
        move |_m| {
            counter.fetch_add(1, SeqCst);
        }
    }

    let count = Arc::new(AtomicUsize::new(0));
    let probe = scheduler(0, 1);
    let charged = probe.spawn_allocation_size(&body(&count));
    drop(probe);

    // A single record of space: the in-place drain before each allocation
    // retires the previous task, so sequential spawning never exhausts it.
    let sched = bounded_scheduler(1, charged);
    for _ in 0..100 {
        let f = sched.spawn(TaskPriority::Regular, body(&count));
        assert!(!f.is_null());
    }

    sched.wait();
    assert_eq!(count.load(SeqCst), 100);
}
