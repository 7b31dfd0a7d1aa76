//! Multi-rank collective tests
//!
//! Each test runs a full world as one thread per rank over the in-process
//! transport, so every property is exercised end to end through the real
//! schedules and the real per-channel buffering, not a simulation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use lattice::collectives::ring::RingReduce;
use lattice::collectives::tree::TreeReduce;
use lattice::collectives::CollectiveOp;
use lattice::transport::memory::LocalCluster;
use lattice::transport::Transport;
use lattice::{derive_groups, Communicator, LatticeError, WorldConfig};

/// Route runtime logs through the test harness when RUST_LOG is set.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Run `body` once per rank, each on its own thread, and collect results
/// in rank order.
fn run_ranks<T: Send>(
    world_size: usize,
    body: impl Fn(usize, &LocalCluster) -> T + Sync,
) -> Vec<T> {
    let cluster = LocalCluster::new(world_size);
    thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let cluster = &cluster;
                let body = &body;
                scope.spawn(move || body(rank, cluster))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("rank thread panicked"))
            .collect()
    })
}

/// The communicator for the group spanning the whole world (tp = 1).
fn world_communicator(rank: usize, cluster: &LocalCluster) -> Communicator {
    let config = WorldConfig::new(cluster.world_size(), 1).unwrap();
    let (dp, _) = derive_groups(rank, &config).unwrap();
    let transport: Arc<dyn Transport> = Arc::new(cluster.transport(rank).unwrap());
    Communicator::new(dp, transport).unwrap()
}

fn reference_sum(inputs: &[Vec<f32>]) -> Vec<f32> {
    let mut total = vec![0.0; inputs[0].len()];
    for input in inputs {
        for (t, v) in total.iter_mut().zip(input) {
            *t += v;
        }
    }
    total
}

fn rank_input(rank: usize, len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| (rank + 1) as f32 * 0.25 + i as f32 * 0.5)
        .collect()
}

#[test]
fn global_sum_matches_reference_on_both_schedules() {
    for world_size in [2, 3, 4, 8] {
        // Small (latency-bound) and large (bandwidth-bound) payloads, both
        // run through both schedules regardless of what selection would pick.
        for len in [1, 7, 4096] {
            let inputs: Vec<Vec<f32>> = (0..world_size).map(|r| rank_input(r, len)).collect();
            let expected = reference_sum(&inputs);

            let results = run_ranks(world_size, |rank, cluster| {
                let comm = world_communicator(rank, cluster);
                let input = rank_input(rank, len);
                let ring = comm.global_sum_with(&input, &RingReduce).unwrap();
                let tree = comm.global_sum_with(&input, &TreeReduce).unwrap();
                let auto = comm.global_sum(&input).unwrap();
                (ring, tree, auto)
            });

            for (rank, (ring, tree, auto)) in results.iter().enumerate() {
                for i in 0..len {
                    assert!(
                        (ring[i] - expected[i]).abs() < 1e-3,
                        "ring mismatch: n={world_size} len={len} rank={rank} i={i}"
                    );
                    assert!(
                        (tree[i] - expected[i]).abs() < 1e-3,
                        "tree mismatch: n={world_size} len={len} rank={rank} i={i}"
                    );
                }
                // Selection must agree bit-for-bit with whichever schedule
                // it picked.
                assert!(auto == ring || auto == tree);
            }

            // Every member holds the identical result.
            for (ring, tree, _) in &results[1..] {
                assert_eq!(ring, &results[0].0);
                assert_eq!(tree, &results[0].1);
            }
        }
    }
}

#[test]
fn global_sum_is_deterministic_across_runs() {
    let run = || {
        run_ranks(4, |rank, cluster| {
            let comm = world_communicator(rank, cluster);
            let input = rank_input(rank, 513);
            (
                comm.global_sum_with(&input, &RingReduce).unwrap(),
                comm.global_sum_with(&input, &TreeReduce).unwrap(),
            )
        })
    };

    let first = run();
    let second = run();
    // Bitwise identical rounding, run to run.
    assert_eq!(first, second);
}

#[test]
fn gather_all_round_trip() {
    for world_size in [2, 3, 5] {
        let block = 4;
        let results = run_ranks(world_size, |rank, cluster| {
            let comm = world_communicator(rank, cluster);
            let input = rank_input(rank, block);
            comm.gather_all(&input).unwrap()
        });

        for (rank, gathered) in results.iter().enumerate() {
            assert_eq!(gathered.len(), world_size * block);
            // Extracting any member's segment reproduces that member's
            // original input exactly.
            for source in 0..world_size {
                assert_eq!(
                    &gathered[source * block..(source + 1) * block],
                    &rank_input(source, block)[..],
                    "rank {rank} sees wrong segment for source {source}"
                );
            }
        }
    }
}

#[test]
fn scatter_sum_covers_buffer_exactly_once() {
    for world_size in [2, 4] {
        let segment = 3;
        let len = world_size * segment;
        let inputs: Vec<Vec<f32>> = (0..world_size).map(|r| rank_input(r, len)).collect();
        let expected = reference_sum(&inputs);

        let results = run_ranks(world_size, |rank, cluster| {
            let comm = world_communicator(rank, cluster);
            comm.scatter_sum(&rank_input(rank, len)).unwrap()
        });

        // Concatenating every member's owned segment reproduces the full
        // summed buffer with no gaps or overlaps.
        let mut reassembled = Vec::new();
        for owned in &results {
            assert_eq!(owned.len(), segment);
            reassembled.extend_from_slice(owned);
        }
        assert_eq!(reassembled.len(), expected.len());
        for i in 0..len {
            assert!(
                (reassembled[i] - expected[i]).abs() < 1e-3,
                "n={world_size} i={i}: {} vs {}",
                reassembled[i],
                expected[i]
            );
        }
    }
}

#[test]
fn peer_exchange_visits_every_ordered_pair_exactly_once() {
    for world_size in [2, 3, 4, 8] {
        let results = run_ranks(world_size, |rank, cluster| {
            let comm = world_communicator(rank, cluster);
            // Distinct payload per ordered (sender, receiver) pair.
            let outgoing: Vec<Vec<f32>> = (0..world_size)
                .map(|dest| vec![rank as f32 * 100.0 + dest as f32, rank as f32])
                .collect();
            comm.peer_exchange(&outgoing).unwrap()
        });

        for (receiver, incoming) in results.iter().enumerate() {
            assert_eq!(incoming.len(), world_size);
            for (sender, buffer) in incoming.iter().enumerate() {
                // Exactly the buffer `sender` addressed to `receiver`: had
                // any ordered pair been visited twice or not at all, some
                // slot would hold the wrong pair's payload.
                assert_eq!(
                    buffer,
                    &vec![sender as f32 * 100.0 + receiver as f32, sender as f32],
                    "n={world_size} pair ({sender} -> {receiver})"
                );
            }
        }
    }
}

#[test]
fn barrier_waits_for_every_member() {
    let arrived = AtomicUsize::new(0);
    let world_size = 4;

    run_ranks(world_size, |rank, cluster| {
        let comm = world_communicator(rank, cluster);
        // Stagger arrival so early ranks genuinely wait.
        std::thread::sleep(std::time::Duration::from_millis(rank as u64 * 10));
        arrived.fetch_add(1, Ordering::SeqCst);
        comm.barrier().unwrap();
        assert_eq!(arrived.load(Ordering::SeqCst), world_size);
    });
}

#[test]
fn collectives_on_concurrent_groups_do_not_interfere() {
    // tp = 2 over 4 ranks: tp groups [0,1] and [2,3], dp groups [0,2] and
    // [1,3]. Each rank runs a tensor-parallel gather followed by a
    // data-parallel sum; the channels must stay disjoint.
    let results = run_ranks(4, |rank, cluster| {
        let config = WorldConfig::new(4, 2).unwrap();
        let (dp, tp) = derive_groups(rank, &config).unwrap();
        let transport: Arc<dyn Transport> = Arc::new(cluster.transport(rank).unwrap());
        let dp_comm = Communicator::new(dp, Arc::clone(&transport)).unwrap();
        let tp_comm = Communicator::new(tp, transport).unwrap();

        let gathered = tp_comm.gather_all(&[rank as f32]).unwrap();
        let summed = dp_comm.global_sum(&[rank as f32]).unwrap();
        (gathered, summed)
    });

    assert_eq!(results[0].0, vec![0.0, 1.0]);
    assert_eq!(results[1].0, vec![0.0, 1.0]);
    assert_eq!(results[2].0, vec![2.0, 3.0]);
    assert_eq!(results[3].0, vec![2.0, 3.0]);

    assert_eq!(results[0].1, vec![2.0]); // 0 + 2
    assert_eq!(results[1].1, vec![4.0]); // 1 + 3
    assert_eq!(results[2].1, vec![2.0]);
    assert_eq!(results[3].1, vec![4.0]);
}

#[test]
fn transport_failure_surfaces_collective_error_on_all_reachable_members() {
    init_tracing();
    let failed_rank = 2;
    let world_size = 4;

    let cluster = LocalCluster::new(world_size);
    cluster.fail(failed_rank);

    let errors: Vec<LatticeError> = thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .filter(|&rank| rank != failed_rank)
            .map(|rank| {
                let cluster = &cluster;
                scope.spawn(move || {
                    let comm = world_communicator(rank, cluster);
                    comm.global_sum_with(&rank_input(rank, 64), &RingReduce)
                        .expect_err("collective must not report false success")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("rank thread panicked"))
            .collect()
    });

    // Every still-reachable member reports the same unreachable peer.
    assert_eq!(errors.len(), world_size - 1);
    for error in errors {
        match error {
            LatticeError::Collective { op, peer } => {
                assert_eq!(op, CollectiveOp::GlobalSum);
                assert_eq!(peer, failed_rank);
            }
            other => panic!("expected collective error, got {other}"),
        }
    }
}

#[test]
fn transport_failure_mid_tree_reduce_also_aborts() {
    init_tracing();
    let failed_rank = 1;
    let world_size = 4;

    let cluster = LocalCluster::new(world_size);
    cluster.fail(failed_rank);

    let errors: Vec<LatticeError> = thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .filter(|&rank| rank != failed_rank)
            .map(|rank| {
                let cluster = &cluster;
                scope.spawn(move || {
                    let comm = world_communicator(rank, cluster);
                    comm.global_sum_with(&rank_input(rank, 8), &TreeReduce)
                        .expect_err("collective must not report false success")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("rank thread panicked"))
            .collect()
    });

    for error in errors {
        match error {
            LatticeError::Collective { peer, .. } => assert_eq!(peer, failed_rank),
            other => panic!("expected collective error, got {other}"),
        }
    }
}
