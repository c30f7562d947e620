//! QR decomposition and eigensolver properties.
//!
//! Covers the §-by-§ numeric contracts of the PCA pipeline: QR
//! round-trip and orthonormality, exact sub-diagonal zeros in R, the
//! trivial identity-covariance decomposition, eigenpair residuals
//! against the original covariance, sign/order normalization, and
//! projection shape.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use strata::{Device, Pca};

fn matmul(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * k];
    for i in 0..m {
        for j in 0..k {
            for l in 0..n {
                out[i * k + j] += a[i * n + l] * b[l * k + j];
            }
        }
    }
    out
}

fn identity(n: usize) -> Vec<f32> {
    let mut id = vec![0.0f32; n * n];
    for i in 0..n {
        id[i * n + i] = 1.0;
    }
    id
}

#[test]
fn qr_round_trip_reproduces_input() {
    let device = Device::reference();
    let n = 4;
    let mut rng = SmallRng::seed_from_u64(5);
    let a: Vec<f32> = (0..n * n).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let (q, r) = Pca::qr(&device, &a, n).unwrap();
    let recomposed = matmul(&q, &r, n, n, n);
    for (got, want) in recomposed.iter().zip(a.iter()) {
        assert!(
            (got - want).abs() < 1e-3,
            "Q*R drifted from A: {got} vs {want}"
        );
    }
}

#[test]
fn qr_r_is_exactly_upper_triangular() {
    let device = Device::reference();
    let n = 5;
    let mut rng = SmallRng::seed_from_u64(6);
    let a: Vec<f32> = (0..n * n).map(|_| rng.gen_range(-2.0..2.0)).collect();

    let (_, r) = Pca::qr(&device, &a, n).unwrap();
    for i in 0..n {
        for j in 0..i {
            assert_eq!(
                r[i * n + j],
                0.0,
                "sub-diagonal entry ({i},{j}) must be clamped to exactly zero"
            );
        }
    }
}

#[test]
fn qr_q_columns_are_orthonormal() {
    let device = Device::reference();
    let n = 4;
    let mut rng = SmallRng::seed_from_u64(7);
    let a: Vec<f32> = (0..n * n).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let (q, _) = Pca::qr(&device, &a, n).unwrap();
    for c1 in 0..n {
        for c2 in 0..n {
            let dot: f32 = (0..n).map(|r| q[r * n + c1] * q[r * n + c2]).sum();
            let expected = if c1 == c2 { 1.0 } else { 0.0 };
            assert!(
                (dot - expected).abs() < 1e-3,
                "q[:,{c1}] . q[:,{c2}] = {dot}, expected {expected}"
            );
        }
    }
}

/// Data whose columns are exactly uncorrelated, so the correlation
/// matrix is the identity: the eigensolver's trivial fixed point.
#[test]
fn eigensolver_on_identity_covariance_is_immediate() {
    let device = Device::reference();
    // Column 0 is symmetric around its mean, column 1 is even-symmetric;
    // their z-score dot product is exactly zero.
    let data = [
        1.0, 1.0, //
        2.0, -1.0, //
        3.0, -1.0, //
        4.0, 1.0,
    ];
    let mut pca = Pca::covariance(&device, &data, 4, 2).unwrap();
    let cov = pca.covariance_matrix().to_vec();
    assert!((cov[0] - 1.0).abs() < 1e-5);
    assert!((cov[3] - 1.0).abs() < 1e-5);
    assert!(cov[1].abs() < 1e-5 && cov[2].abs() < 1e-5);

    let ev = pca.eigenvectors(&identity(2), 1e-6, 50).unwrap().to_vec();
    // A (near-)identity covariance keeps standard-basis eigenvectors;
    // with a degenerate spectrum their order is arbitrary, so each
    // column is only required to be one-hot.
    for j in 0..2 {
        let column = [ev[j].abs(), ev[2 + j].abs()];
        let max = column[0].max(column[1]);
        let min = column[0].min(column[1]);
        assert!(
            max > 0.999 && min < 1e-3,
            "column {j} of {ev:?} is not a basis vector"
        );
    }
    for value in pca.eigenvalues() {
        assert!((value - 1.0).abs() < 1e-4, "eigenvalues of I are 1, got {value}");
    }
}

#[test]
fn eigenpairs_satisfy_the_eigen_equation() {
    let device = Device::reference();
    let rows = 12;
    let cols = 3;
    let mut rng = SmallRng::seed_from_u64(21);

    // Correlated columns give a non-trivial spectrum.
    let mut data = vec![0.0f32; rows * cols];
    for r in 0..rows {
        let base: f32 = rng.gen_range(-1.0..1.0);
        data[r * cols] = base;
        data[r * cols + 1] = 0.8 * base + 0.2 * rng.gen_range(-1.0..1.0);
        data[r * cols + 2] = rng.gen_range(-1.0..1.0);
    }

    let mut pca = Pca::covariance(&device, &data, rows, cols).unwrap();
    let cov = pca.covariance_matrix().to_vec();
    let ev = pca.eigenvectors(&identity(cols), 1e-6, 500).unwrap().to_vec();
    let values = pca.eigenvalues().to_vec();
    assert_eq!(values.len(), cols);

    // Descending order, and the trace of a correlation matrix is its
    // dimension.
    for pair in values.windows(2) {
        assert!(pair[0] >= pair[1], "eigenvalues must be sorted descending: {values:?}");
    }
    let trace: f32 = values.iter().sum();
    assert!(
        (trace - cols as f32).abs() < 1e-2,
        "eigenvalue sum {trace} must match the trace {cols}"
    );

    // C v = lambda v against the pre-iteration covariance.
    for (j, &lambda) in values.iter().enumerate() {
        let v: Vec<f32> = (0..cols).map(|r| ev[r * cols + j]).collect();
        let cv = matmul(&cov, &v, cols, cols, 1);
        for r in 0..cols {
            assert!(
                (cv[r] - lambda * v[r]).abs() < 5e-3,
                "eigenpair {j}: (Cv)[{r}] = {}, lambda*v = {}",
                cv[r],
                lambda * v[r]
            );
        }
    }

    // Sign normalization: no surviving column sums negative.
    for j in 0..cols {
        let sum: f32 = (0..cols).map(|r| ev[r * cols + j]).sum();
        assert!(sum > -1e-4, "column {j} should have been sign-flipped (sum {sum})");
    }
}

#[test]
fn projection_has_rows_by_k_shape() {
    let device = Device::reference();
    let rows = 6;
    let cols = 3;
    let mut rng = SmallRng::seed_from_u64(33);
    let data: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-2.0..2.0)).collect();

    let mut pca = Pca::covariance(&device, &data, rows, cols).unwrap();
    pca.eigenvectors(&identity(cols), 1e-5, 500).unwrap();

    for k in 1..=cols {
        let projected = pca.project(k).unwrap();
        assert_eq!(projected.len(), rows * k, "project({k}) must return {rows}x{k}");
        assert!(projected.iter().all(|v| v.is_finite()));
    }
}

#[test]
fn projection_concentrates_variance_in_leading_component() {
    let device = Device::reference();
    let rows = 16;
    let mut rng = SmallRng::seed_from_u64(44);

    // Two almost-perfectly correlated features: nearly all variance
    // belongs to the first principal direction.
    let mut data = vec![0.0f32; rows * 2];
    for r in 0..rows {
        let base: f32 = rng.gen_range(-1.0..1.0);
        data[r * 2] = base;
        data[r * 2 + 1] = base + 0.05 * rng.gen_range(-1.0..1.0);
    }

    let mut pca = Pca::covariance(&device, &data, rows, 2).unwrap();
    pca.eigenvectors(&identity(2), 1e-6, 500).unwrap();
    let values = pca.eigenvalues();
    assert!(
        values[0] > 10.0 * values[1].max(1e-6),
        "leading eigenvalue should dominate: {values:?}"
    );

    let projected = pca.project(1).unwrap();
    let energy: f32 = projected.iter().map(|v| v * v).sum();
    assert!(energy > 0.0);
}
