//! Principal-component analysis over accelerator buffers.
//!
//! [`Pca`] is an explicit context owned by the caller: covariance first,
//! then (on request) an iterative QR eigen-decomposition, then a
//! low-rank projection of the retained z-scored data. The QR and eigen
//! working sets live only for the duration of the call that needs them.
//!
//! # Example
//!
//! ```rust
//! use strata::{Device, Pca};
//!
//! let device = Device::reference();
//! // Three observations of two features.
//! let data = [1.0, 10.0, 2.0, 20.0, 3.0, 30.0];
//! let mut pca = Pca::covariance(&device, &data, 3, 2).unwrap();
//!
//! let identity = [1.0, 0.0, 0.0, 1.0];
//! pca.eigenvectors(&identity, 1e-6, 100).unwrap();
//! let reduced = pca.project(1).unwrap();
//! assert_eq!(reduced.len(), 3);
//! ```

use crate::buffer::{format_matrix, BufferPair};
use crate::device::{BufferId, Device};
use crate::error::{StrataError, StrataResult};

/// Scratch buffers for one QR decomposition.
///
/// Created when a decomposition is needed and dropped with the call that
/// created it; nothing here survives between decompositions.
struct QrWorkspace {
    q: BufferPair,
    r: BufferPair,
    /// Q transposed, input to the `R = Qᵗ·A` recomposition.
    qt: BufferPair,
    /// Per-column projection dot products.
    dot: BufferPair,
    /// One-element L2 norm scratch.
    norm: BufferPair,
}

impl QrWorkspace {
    fn new(device: &Device, n: usize) -> StrataResult<Self> {
        Ok(Self {
            q: BufferPair::new(device, n, n)?,
            r: BufferPair::new(device, n, n)?,
            qt: BufferPair::new(device, n, n)?,
            dot: BufferPair::new(device, 1, n)?,
            norm: BufferPair::new(device, 1, 1)?,
        })
    }
}

/// Decomposes the `n × n` matrix in `a` into `ws.q` and `ws.r`.
///
/// Columns must be orthogonalized left to right; each depends on every
/// previously completed column of Q, so there is no safe parallelism
/// across columns within one call.
fn qr_into(device: &Device, a: BufferId, ws: &QrWorkspace, n: usize) -> StrataResult<()> {
    let backend = device.backend();
    let q = ws.q.device().id();
    for col in 0..n {
        backend.qr_project_column(a, q, ws.dot.device().id(), n, n, col)?;
        backend.qr_subtract_column(a, q, ws.dot.device().id(), n, n, col)?;
        backend.qr_normalize_column(q, ws.norm.device().id(), n, n, col)?;
    }
    backend.transpose(q, ws.qt.device().id(), n, n)?;
    backend.matmul(ws.qt.device().id(), a, ws.r.device().id(), n, n, n)?;
    // Rounding error leaves near-zero trash under the diagonal; later
    // stages treat R as exactly upper-triangular.
    backend.clamp_below_diagonal(ws.r.device().id(), n, n)?;
    Ok(())
}

/// PCA context: covariance state plus, after
/// [`eigenvectors`](Pca::eigenvectors), the eigen basis.
pub struct Pca {
    device: Device,
    rows: usize,
    cols: usize,
    /// Retained z-scored data, consumed by [`project`](Pca::project).
    z: BufferPair,
    /// The covariance matrix; the eigen iteration evolves it in place,
    /// leaving eigenvalues on its diagonal.
    cov: BufferPair,
    eigenvectors: Option<BufferPair>,
    eigenvalues: Vec<f32>,
}

impl Pca {
    /// Standardizes `data` (`rows × cols`, row-major observations) and
    /// computes its `cols × cols` covariance matrix.
    ///
    /// Columns are z-scored with per-column mean and sample standard
    /// deviation; constant columns standardize to zero (the stddev floor
    /// policy). The z-scored matrix is retained for the projection step.
    pub fn covariance(device: &Device, data: &[f32], rows: usize, cols: usize) -> StrataResult<Self> {
        if rows == 0 {
            return Err(StrataError::InvalidDimension("rows"));
        }
        if cols == 0 {
            return Err(StrataError::InvalidDimension("cols"));
        }
        if data.len() != rows * cols {
            return Err(StrataError::shape_mismatch(&[rows, cols], &[data.len()]));
        }

        let backend = device.backend();
        let raw = BufferPair::from_slice(device, data, rows, cols)?;
        let mut means = BufferPair::new(device, 1, cols)?;
        let mut stddev = BufferPair::new(device, 1, cols)?;
        let mut z = BufferPair::new(device, rows, cols)?;
        let mut cov = BufferPair::new(device, cols, cols)?;

        backend.column_means(raw.device().id(), means.device().id(), rows, cols)?;
        backend.column_stddev(
            raw.device().id(),
            means.device().id(),
            stddev.device().id(),
            rows,
            cols,
        )?;
        backend.z_scores(
            raw.device().id(),
            means.device().id(),
            stddev.device().id(),
            z.device().id(),
            rows,
            cols,
        )?;
        z.mark_host_stale();
        backend.covariance(z.device().id(), cov.device().id(), rows, cols)?;
        cov.mark_host_stale();
        cov.pull()?;

        if log::log_enabled!(log::Level::Trace) {
            means.mark_host_stale();
            stddev.mark_host_stale();
            log::trace!("means:\n{}", format_matrix(means.pull()?, 1, cols));
            log::trace!("stddev:\n{}", format_matrix(stddev.pull()?, 1, cols));
            log::trace!("covariance:\n{}", format_matrix(cov.host(), cols, cols));
        }

        // The raw data and column statistics have served their purpose;
        // only z and the covariance participate in later stages.
        Ok(Self {
            device: device.clone(),
            rows,
            cols,
            z,
            cov,
            eigenvectors: None,
            eigenvalues: Vec::new(),
        })
    }

    /// Observation count of the source data.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Feature count of the source data.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// The covariance matrix as last refreshed, row-major
    /// `cols × cols`. After [`eigenvectors`](Pca::eigenvectors) runs,
    /// this is the iterated matrix carrying eigenvalues on its diagonal.
    pub fn covariance_matrix(&self) -> &[f32] {
        self.cov.host()
    }

    /// Sorted eigenvalues (descending), empty before
    /// [`eigenvectors`](Pca::eigenvectors) has run.
    pub fn eigenvalues(&self) -> &[f32] {
        &self.eigenvalues
    }

    /// One-shot QR decomposition of an arbitrary square matrix.
    ///
    /// Returns `(q, r)` with `q` column-orthonormal and `r` exactly
    /// upper-triangular. This is the same routine the eigensolver
    /// iterates.
    pub fn qr(device: &Device, a: &[f32], n: usize) -> StrataResult<(Vec<f32>, Vec<f32>)> {
        if n == 0 {
            return Err(StrataError::InvalidDimension("n"));
        }
        if a.len() != n * n {
            return Err(StrataError::shape_mismatch(&[n, n], &[a.len()]));
        }
        let input = BufferPair::from_slice(device, a, n, n)?;
        let mut ws = QrWorkspace::new(device, n)?;
        qr_into(device, input.device().id(), &ws, n)?;
        ws.q.mark_host_stale();
        ws.r.mark_host_stale();
        let q = ws.q.pull()?.to_vec();
        let r = ws.r.pull()?.to_vec();
        Ok((q, r))
    }

    /// Runs the QR-iteration eigensolver on the covariance matrix.
    ///
    /// `initial` seeds the running eigenvector estimate (`cols × cols`,
    /// normally the identity). Iteration stops when successive
    /// covariance estimates agree within `epsilon` elementwise, or at
    /// `max_iterations` — in which case the current estimate is still
    /// returned, with a warning, and the caller decides whether it is
    /// usable.
    ///
    /// On return the eigenvector columns are sign-normalized (a column
    /// summing negative is flipped) and ordered by descending
    /// eigenvalue; the matching eigenvalues are available through
    /// [`eigenvalues`](Pca::eigenvalues).
    pub fn eigenvectors(
        &mut self,
        initial: &[f32],
        epsilon: f32,
        max_iterations: usize,
    ) -> StrataResult<&[f32]> {
        let n = self.cols;
        if initial.len() != n * n {
            return Err(StrataError::shape_mismatch(&[n, n], &[initial.len()]));
        }

        let device = self.device.clone();
        let backend = device.backend();
        let mut pq = BufferPair::from_slice(&device, initial, n, n)?;
        let pq2 = BufferPair::new(&device, n, n)?;
        let mut sums = BufferPair::new(&device, 1, n)?;
        let ws = QrWorkspace::new(&device, n)?;

        let mut iterations = 0;
        let mut converged = false;
        while !converged && iterations < max_iterations {
            qr_into(&device, self.cov.device().id(), &ws, n)?;
            backend.matmul(
                pq.device().id(),
                ws.q.device().id(),
                pq2.device().id(),
                n,
                n,
                n,
            )?;
            pq.device().copy_from(pq2.device(), n * n)?;
            converged = backend.matmul_converged(
                ws.r.device().id(),
                ws.q.device().id(),
                self.cov.device().id(),
                epsilon,
                n,
                n,
                n,
            )?;
            iterations += 1;
        }
        if converged {
            log::debug!("eigensolver converged in {iterations} iterations");
        } else {
            log::warn!(
                "eigensolver stopped unconverged at the {max_iterations}-iteration cap; \
                 returning the current estimate"
            );
        }

        // Sign pass: flip columns whose entry-sum is negative so every
        // component has a deterministic orientation.
        backend.eigenvector_signs(pq.device().id(), sums.device().id(), n, n)?;
        sums.mark_host_stale();
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("eigenvector column sums: {:?}", sums.pull()?);
        }

        // Eigenvalues sit on the iterated matrix's diagonal; order the
        // columns (and values) by descending eigenvalue so project(k)
        // takes the principal prefix.
        self.cov.mark_host_stale();
        let diag: Vec<f32> = {
            let cov = self.cov.pull()?;
            (0..n).map(|i| cov[i * n + i]).collect()
        };
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| diag[b].total_cmp(&diag[a]));

        let indices: Vec<i32> = order.iter().map(|&i| i as i32).collect();
        let index_buf = device.alloc_i32(n)?;
        index_buf.write_i32(&indices)?;
        backend.gather_columns(pq.device().id(), pq2.device().id(), index_buf.id(), n, n)?;
        pq.device().copy_from(pq2.device(), n * n)?;

        self.eigenvalues = order.iter().map(|&i| diag[i]).collect();
        pq.mark_host_stale();
        pq.pull()?;
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("eigenvalues: {:?}", self.eigenvalues);
            log::trace!("eigenvectors:\n{}", format_matrix(pq.host(), n, n));
        }
        let pair = self.eigenvectors.insert(pq);
        Ok(pair.host())
    }

    /// Projects the retained z-scored data onto the first `k` principal
    /// directions, returning a row-major `rows × k` matrix.
    pub fn project(&mut self, k: usize) -> StrataResult<Vec<f32>> {
        if k == 0 {
            return Err(StrataError::InvalidDimension("k"));
        }
        if k > self.cols {
            return Err(StrataError::shape_mismatch(&[self.cols], &[k]));
        }
        let pq = self
            .eigenvectors
            .as_ref()
            .ok_or_else(|| StrataError::invalid_state("eigenvectors have not been computed"))?;

        let device = self.device.clone();
        let mut out = BufferPair::new(&device, self.rows, k)?;
        device.backend().matmul_partial(
            self.z.device().id(),
            pq.device().id(),
            out.device().id(),
            self.rows,
            self.cols,
            self.cols,
            k,
        )?;
        out.mark_host_stale();
        Ok(out.pull()?.to_vec())
    }
}

impl std::fmt::Debug for Pca {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pca")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("eigen_ready", &self.eigenvectors.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covariance_rejects_bad_shape() {
        let device = Device::reference();
        assert!(Pca::covariance(&device, &[1.0, 2.0, 3.0], 2, 2).is_err());
        assert!(Pca::covariance(&device, &[], 0, 2).is_err());
    }

    #[test]
    fn test_covariance_of_perfectly_correlated_columns() {
        let device = Device::reference();
        // Second column is twice the first: correlation exactly 1.
        let data = [1.0, 2.0, 2.0, 4.0, 3.0, 6.0];
        let pca = Pca::covariance(&device, &data, 3, 2).unwrap();
        let cov = pca.covariance_matrix();
        for v in cov.iter().take(4) {
            assert!((v - 1.0).abs() < 1e-5, "covariance was {cov:?}");
        }
    }

    #[test]
    fn test_project_requires_eigenvectors() {
        let device = Device::reference();
        let data = [1.0, 2.0, 2.0, 4.0, 3.0, 6.0];
        let mut pca = Pca::covariance(&device, &data, 3, 2).unwrap();
        assert!(matches!(pca.project(1), Err(StrataError::InvalidState(_))));
    }

    #[test]
    fn test_project_rejects_k_out_of_range() {
        let device = Device::reference();
        let data = [1.0, 2.0, 2.0, 4.1, 3.0, 5.9];
        let mut pca = Pca::covariance(&device, &data, 3, 2).unwrap();
        let identity = [1.0, 0.0, 0.0, 1.0];
        pca.eigenvectors(&identity, 1e-6, 200).unwrap();
        assert!(pca.project(0).is_err());
        assert!(pca.project(3).is_err());
    }
}
