#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tiled_qr::{
    ChannelCommunicator, CommConfig, DistributedMatrix, QrOptions, Split, Tensor, qr,
};

/// Receives that take longer than this fail the test instead of hanging it.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(20);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn random_matrix(m: usize, n: usize, seed: u64) -> Tensor<f64, 2> {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..m * n).map(|_| rng.random_range(-1.0..1.0)).collect();
    Tensor::new(data, [m, n]).unwrap()
}

/// Gathered factors as seen by one rank, plus the shares of the distributed results.
#[derive(Debug)]
pub struct Factors {
    pub q: Option<Tensor<f64, 2>>,
    pub r: Tensor<f64, 2>,
    pub q_counts: Option<Vec<usize>>,
    pub r_counts: Vec<usize>,
    pub r_split: Split,
}

pub fn config() -> CommConfig {
    CommConfig::default().with_recv_timeout(RECV_TIMEOUT)
}

/// Distributes `global` over `ranks` workers, factorizes it and gathers the results.
pub fn factorize(
    global: &Tensor<f64, 2>,
    split: Split,
    ranks: usize,
    options: &QrOptions,
) -> Vec<Factors> {
    init_tracing();
    ChannelCommunicator::spawn_group_with_config(ranks, config(), |comm| {
        let mut a = DistributedMatrix::from_global(global, split, &comm).unwrap();
        let result = qr(&mut a, &comm, options).unwrap();
        Factors {
            q: result.q.as_ref().map(|q| q.gather(&comm).unwrap()),
            q_counts: result.q.as_ref().map(|q| q.counts().to_vec()),
            r: result.r.gather(&comm).unwrap(),
            r_counts: result.r.counts().to_vec(),
            r_split: result.r.split(),
        }
    })
}

pub fn max_abs_diff(a: &Tensor<f64, 2>, b: &Tensor<f64, 2>) -> f64 {
    (a - b).unwrap().max_abs()
}

pub fn assert_upper_triangular(r: &Tensor<f64, 2>, tol: f64) {
    let [m, n] = *r.shape();
    for i in 0..m {
        for j in 0..i.min(n) {
            let v = r.get(i, j).unwrap();
            assert!(v.abs() < tol, "R[{}, {}] = {} below the diagonal", i, j, v);
        }
    }
}

pub fn assert_orthonormal_columns(q: &Tensor<f64, 2>, tol: f64) {
    let qtq = q.transpose().unwrap().matmul(q).unwrap();
    let k = q.cols();
    let diff = max_abs_diff(&qtq, &Tensor::eye(k));
    assert!(diff < tol, "Q^T Q deviates from I by {}", diff);
}

/// Full check of `A = Q * R` for the factors of one rank.
pub fn assert_factorization(a: &Tensor<f64, 2>, f: &Factors, tol: f64) {
    assert_upper_triangular(&f.r, tol);
    let q = f.q.as_ref().expect("Q was requested");
    assert_orthonormal_columns(q, tol);
    let back = q.matmul(&f.r).unwrap();
    let err = max_abs_diff(&back, a) / a.max_abs().max(1.0);
    assert!(err < tol, "||QR - A|| / ||A|| = {}", err);
}

/// `R` of the single-worker dense factorization, truncated to `k = min(m, n)` rows.
pub fn reference_r(a: &Tensor<f64, 2>) -> Tensor<f64, 2> {
    let [m, n] = *a.shape();
    let (_, r) = a.qr().unwrap();
    r.slice(0..m.min(n), 0..n).unwrap()
}

/// Compares two `R` factors up to the sign of each row.
pub fn assert_same_up_to_row_sign(r1: &Tensor<f64, 2>, r2: &Tensor<f64, 2>, tol: f64) {
    assert_eq!(r1.shape(), r2.shape());
    let diff = max_abs_diff(&r1.map(f64::abs), &r2.map(f64::abs));
    assert!(diff < tol, "|R| differs by {}", diff);
}

/// Signs `s_j` with `R1[j, :] = s_j * R2[j, :]`.
pub fn row_signs(r1: &Tensor<f64, 2>, r2: &Tensor<f64, 2>) -> Vec<f64> {
    let k = r1.rows().min(r1.cols());
    (0..k)
        .map(|j| {
            let s = r1.get(j, j).unwrap() * r2.get(j, j).unwrap();
            if s < 0.0 { -1.0 } else { 1.0 }
        })
        .collect()
}
