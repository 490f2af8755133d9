mod common;

use common::*;
use std::thread;
use tiled_qr::{
    ChannelCommunicator, Communicator, DistributedMatrix, QrMode, QrOptions, Split, qr,
};

#[test]
fn test_calc_q_false_gives_identical_r() {
    let a = random_matrix(11, 5, 61);
    for split in [Split::Rows, Split::Cols] {
        let with_q = factorize(&a, split, 3, &QrOptions::default());
        let without_q = factorize(&a, split, 3, &QrOptions::default().with_calc_q(false));
        for (x, y) in with_q.iter().zip(&without_q) {
            assert!(y.q.is_none());
            assert_eq!(x.r, y.r);
        }
    }
}

#[test]
fn test_overwrite_a() {
    let global = random_matrix(8, 4, 71);
    for split in [Split::Rows, Split::Cols] {
        let results = ChannelCommunicator::spawn_group_with_config(2, config(), |comm| {
            let options = QrOptions::default().with_mode(QrMode::Complete);

            let mut kept = DistributedMatrix::from_global(&global, split, &comm).unwrap();
            qr(&mut kept, &comm, &options).unwrap();
            let kept = kept.gather(&comm).unwrap();

            let mut overwritten = DistributedMatrix::from_global(&global, split, &comm).unwrap();
            let result = qr(&mut overwritten, &comm, &options.with_overwrite_a(true)).unwrap();
            let overwritten = overwritten.gather(&comm).unwrap();
            let r = result.r.gather(&comm).unwrap();
            (kept, overwritten, r)
        });
        for (kept, overwritten, r) in results {
            assert_eq!(kept, global);
            assert_eq!(overwritten, r);
        }
    }
}

#[test]
fn test_overwrite_a_reduced_keeps_full_r() {
    let global = random_matrix(9, 3, 73);
    let results = ChannelCommunicator::spawn_group_with_config(3, config(), |comm| {
        let mut a = DistributedMatrix::from_global(&global, Split::Rows, &comm).unwrap();
        let options = QrOptions::default().with_overwrite_a(true);
        let result = qr(&mut a, &comm, &options).unwrap();
        (a.gather(&comm).unwrap(), result.r.gather(&comm).unwrap())
    });
    for (a, r) in results {
        assert_eq!(a.shape(), &[9, 3]);
        assert_eq!(a.slice(0..3, 0..3).unwrap(), r);
        assert!(a.slice(3..9, 0..3).unwrap().max_abs() < 1e-12);
    }
}

#[test]
fn test_rebalance_is_idempotent() {
    let global = random_matrix(13, 4, 81);
    let results = ChannelCommunicator::spawn_group_with_config(4, config(), |comm| {
        let mut a = DistributedMatrix::from_global(&global, Split::Rows, &comm).unwrap();
        let result = qr(&mut a, &comm, &QrOptions::default()).unwrap();
        let mut r = result.r;
        let mut q = result.q.unwrap();
        let (r_before, q_before) = (r.local().clone(), q.local().clone());
        r.balance(&comm).unwrap();
        q.balance(&comm).unwrap();
        r_before == *r.local() && q_before == *q.local()
    });
    assert!(results.into_iter().all(|same| same));
}

#[test]
fn test_ranks_on_plain_threads() {
    let world_size = 3;
    let global = random_matrix(7, 3, 91);
    let mut handles = vec![];

    for comm in ChannelCommunicator::group_with_config(world_size, config()) {
        let global = global.clone();
        let handle = thread::spawn(move || {
            let rank = comm.rank();
            let mut a = DistributedMatrix::from_global(&global, Split::Rows, &comm).unwrap();
            let result = qr(&mut a, &comm, &QrOptions::default()).unwrap();
            let q = result.q.unwrap().gather(&comm).unwrap();
            let r = result.r.gather(&comm).unwrap();

            let err = max_abs_diff(&q.matmul(&r).unwrap(), &global);
            assert!(err < 1e-10, "Rank {}: reconstruction error {}", rank, err);
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_invalid_options_fail_on_every_rank() {
    let global = random_matrix(4, 4, 1);
    let results = ChannelCommunicator::spawn_group_with_config(2, config(), |comm| {
        let mut a = DistributedMatrix::from_global(&global, Split::Cols, &comm).unwrap();
        let options = QrOptions::default().with_tiles_per_proc(0);
        qr(&mut a, &comm, &options).is_err()
    });
    assert_eq!(results, vec![true, true]);
}
