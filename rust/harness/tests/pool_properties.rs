//! Property tests for the accelerator pool.
//!
//! Random allocate/release sequences are checked against a model set of busy
//! ids, and threads hammer one pool to check no id is handed out twice.

use std::{
    collections::BTreeSet,
    sync::{Arc, Barrier, Mutex},
    thread,
};

use edge_harness::pool::{AcceleratorPool, PoolError};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Allocate(u32),
    /// Release the `n`th outstanding allocation, if any.
    Release(usize),
    /// Release ids regardless of whether they are held.
    ReleaseRaw(Vec<u32>),
}

fn arb_op(total: u32) -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..=total + 1).prop_map(Op::Allocate),
        (0usize..8).prop_map(Op::Release),
        proptest::collection::vec(0..total + 2, 0..4).prop_map(Op::ReleaseRaw),
    ]
}

fn arb_scenario() -> impl Strategy<Value = (u32, Vec<Op>)> {
    (1u32..12).prop_flat_map(|total| (Just(total), proptest::collection::vec(arb_op(total), 1..60)))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: busy ids always match the model and never exceed the total
    #[test]
    fn prop_allocation_matches_model((total, ops) in arb_scenario()) {
        let pool = AcceleratorPool::new(total);
        let mut busy: BTreeSet<u32> = BTreeSet::new();
        let mut held: Vec<Vec<u32>> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate(n) => {
                    let free_before = pool.free_count();
                    match pool.allocate(n) {
                        Ok(ids) => {
                            prop_assert_eq!(ids.len(), n as usize);
                            for id in &ids {
                                prop_assert!(*id < total);
                                prop_assert!(busy.insert(*id), "id {} handed out twice", id);
                            }
                            // lowest free ids first
                            let expected: Vec<u32> = (0..total)
                                .filter(|id| !busy.contains(id) || ids.contains(id))
                                .take(n as usize)
                                .collect();
                            prop_assert_eq!(&ids, &expected);
                            held.push(ids);
                        }
                        Err(PoolError::ZeroRequest) => prop_assert_eq!(n, 0),
                        Err(PoolError::Insufficient { requested, available }) => {
                            prop_assert_eq!(requested, n);
                            prop_assert_eq!(available, free_before);
                            prop_assert!(free_before < n as usize);
                            prop_assert_eq!(pool.free_count(), free_before);
                        }
                    }
                }
                Op::Release(i) => {
                    if i < held.len() {
                        let ids = held.remove(i);
                        pool.release(&ids);
                        for id in &ids {
                            busy.remove(id);
                        }
                    }
                }
                Op::ReleaseRaw(ids) => {
                    pool.release(&ids);
                    for id in &ids {
                        busy.remove(id);
                    }
                    for allocation in &mut held {
                        allocation.retain(|id| !ids.contains(id));
                    }
                }
            }

            let snapshot = pool.snapshot();
            prop_assert_eq!(snapshot.total, total as usize);
            prop_assert_eq!(snapshot.free, total as usize - busy.len());
            let observed: BTreeSet<u32> =
                snapshot.devices.iter().filter(|d| d.busy).map(|d| d.id).collect();
            prop_assert_eq!(&observed, &busy);
        }
    }

    /// Property: releasing free ids changes nothing
    #[test]
    fn prop_release_of_free_ids_is_noop(
        total in 1u32..10,
        taken in 0u32..10,
        extra in proptest::collection::vec(0u32..20, 0..6),
    ) {
        let pool = AcceleratorPool::new(total);
        let taken = taken.min(total);
        let ids = if taken > 0 { pool.allocate(taken).unwrap() } else { Vec::new() };
        let free: Vec<u32> = extra.into_iter().filter(|id| !ids.contains(id)).collect();

        let before = pool.free_count();
        pool.release(&free);
        pool.release(&free);
        prop_assert_eq!(pool.free_count(), before);
    }
}

#[test]
fn test_concurrent_allocations_never_overlap() {
    const TOTAL: u32 = 8;
    const THREADS: usize = 16;
    const ROUNDS: usize = 200;

    let pool = Arc::new(AcceleratorPool::new(TOTAL));
    let in_use = Arc::new(Mutex::new(BTreeSet::new()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let want = (t as u32 % 3) + 1;
                for _ in 0..ROUNDS {
                    let Ok(ids) = pool.allocate(want) else {
                        continue;
                    };
                    {
                        let mut in_use = in_use.lock().unwrap();
                        for id in &ids {
                            assert!(in_use.insert(*id), "device {id} allocated twice");
                        }
                        assert!(in_use.len() <= TOTAL as usize);
                    }
                    thread::yield_now();
                    {
                        let mut in_use = in_use.lock().unwrap();
                        for id in &ids {
                            in_use.remove(id);
                        }
                    }
                    pool.release(&ids);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(pool.free_count(), TOTAL as usize);
}
