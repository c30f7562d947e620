//! In-process reference implementation of the kernel contract.
//!
//! [`CpuBackend`] models the accelerator with id-addressed word storage
//! behind a mutex and implements every kernel as a straightforward loop.
//! It is the correctness reference the test suite runs against, standing
//! in the position a real device backend occupies in production; it makes
//! no attempt at device-class throughput.
//!
//! Layout conventions match the contract: row-major matrices, statistics
//! vectors indexed by column, a feature-major activation layout for the
//! linear kernel.

use crate::config::{Loss, MIN_STDDEV};
use crate::device::{Backend, BufferId};
use crate::error::{StrataError, StrataResult};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use wide::f32x8;

/// Probability clamp for the cross-entropy logarithms.
const LN_CLAMP: f32 = 1e-7;

#[derive(Default)]
struct Store {
    next_id: u64,
    buffers: HashMap<u64, Vec<f32>>,
}

impl Store {
    fn cloned(&self, id: BufferId) -> StrataResult<Vec<f32>> {
        self.buffers
            .get(&id.0)
            .cloned()
            .ok_or_else(|| StrataError::buffer(format!("unknown buffer id {}", id.0)))
    }

    fn get_mut(&mut self, id: BufferId) -> StrataResult<&mut Vec<f32>> {
        self.buffers
            .get_mut(&id.0)
            .ok_or_else(|| StrataError::buffer(format!("unknown buffer id {}", id.0)))
    }
}

/// Reference CPU backend.
///
/// # Example
///
/// ```rust
/// use strata::device::{Backend, CpuBackend};
///
/// let backend = CpuBackend::new();
/// let id = backend.alloc(16).unwrap();
/// backend.write(id, bytemuck::cast_slice(&[1.0f32; 4])).unwrap();
/// ```
#[derive(Default)]
pub struct CpuBackend {
    store: Mutex<Store>,
}

impl CpuBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of live allocations, for leak assertions in tests.
    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }
}

fn require(buf: &[f32], needed: usize, what: &str) -> StrataResult<()> {
    if buf.len() < needed {
        return Err(StrataError::backend(format!(
            "{what} buffer holds {} elements, kernel shape needs {needed}",
            buf.len()
        )));
    }
    Ok(())
}

fn sigmoid_scalar(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Backend for CpuBackend {
    fn alloc(&self, size_bytes: usize) -> StrataResult<BufferId> {
        let words = size_bytes.div_ceil(std::mem::size_of::<f32>());
        let mut store = self.lock();
        store.next_id += 1;
        let id = store.next_id;
        store.buffers.insert(id, vec![0.0; words]);
        Ok(BufferId(id))
    }

    fn free(&self, id: BufferId) {
        self.lock().buffers.remove(&id.0);
    }

    fn write(&self, dst: BufferId, data: &[u8]) -> StrataResult<()> {
        let mut store = self.lock();
        let buf = store.get_mut(dst)?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(buf.as_mut_slice());
        if data.len() > bytes.len() {
            return Err(StrataError::buffer(format!(
                "write of {} bytes into {}-byte buffer",
                data.len(),
                bytes.len()
            )));
        }
        bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, src: BufferId, out: &mut [u8]) -> StrataResult<()> {
        let store = self.lock();
        let buf = store
            .buffers
            .get(&src.0)
            .ok_or_else(|| StrataError::buffer(format!("unknown buffer id {}", src.0)))?;
        let bytes: &[u8] = bytemuck::cast_slice(buf.as_slice());
        if out.len() > bytes.len() {
            return Err(StrataError::buffer(format!(
                "read of {} bytes from {}-byte buffer",
                out.len(),
                bytes.len()
            )));
        }
        out.copy_from_slice(&bytes[..out.len()]);
        Ok(())
    }

    fn copy(&self, src: BufferId, dst: BufferId, size_bytes: usize) -> StrataResult<()> {
        let mut store = self.lock();
        let from = store.cloned(src)?;
        let to = store.get_mut(dst)?;
        let words = size_bytes / std::mem::size_of::<f32>();
        require(&from, words, "copy source")?;
        require(to, words, "copy destination")?;
        to[..words].copy_from_slice(&from[..words]);
        Ok(())
    }

    fn linear(
        &self,
        activation: BufferId,
        weights: BufferId,
        bias: BufferId,
        output: BufferId,
        out_size: usize,
        in_size: usize,
        batch: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let act = store.cloned(activation)?;
        let w = store.cloned(weights)?;
        let b = store.cloned(bias)?;
        let out = store.get_mut(output)?;
        require(&act, in_size * batch, "activation")?;
        require(&w, out_size * in_size, "weights")?;
        require(&b, out_size, "bias")?;
        require(out, out_size * batch, "output")?;
        for o in 0..out_size {
            for j in 0..batch {
                let mut acc = b[o];
                for i in 0..in_size {
                    acc += w[o * in_size + i] * act[i * batch + j];
                }
                out[o * batch + j] = acc;
            }
        }
        Ok(())
    }

    fn matmul(
        &self,
        a: BufferId,
        b: BufferId,
        out: BufferId,
        m: usize,
        n: usize,
        k: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let av = store.cloned(a)?;
        let bv = store.cloned(b)?;
        let o = store.get_mut(out)?;
        require(&av, m * n, "matmul lhs")?;
        require(&bv, n * k, "matmul rhs")?;
        require(o, m * k, "matmul out")?;
        for i in 0..m {
            for j in 0..k {
                let mut acc = 0.0;
                for l in 0..n {
                    acc += av[i * n + l] * bv[l * k + j];
                }
                o[i * k + j] = acc;
            }
        }
        Ok(())
    }

    fn matmul_partial(
        &self,
        a: BufferId,
        b: BufferId,
        out: BufferId,
        m: usize,
        n: usize,
        k: usize,
        max_cols: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let av = store.cloned(a)?;
        let bv = store.cloned(b)?;
        let o = store.get_mut(out)?;
        require(&av, m * n, "partial matmul lhs")?;
        require(&bv, n * k, "partial matmul rhs")?;
        require(o, m * max_cols, "partial matmul out")?;
        for i in 0..m {
            for j in 0..max_cols {
                let mut acc = 0.0;
                for l in 0..n {
                    acc += av[i * n + l] * bv[l * k + j];
                }
                o[i * max_cols + j] = acc;
            }
        }
        Ok(())
    }

    fn matmul_converged(
        &self,
        a: BufferId,
        b: BufferId,
        out: BufferId,
        epsilon: f32,
        m: usize,
        n: usize,
        k: usize,
    ) -> StrataResult<bool> {
        let mut store = self.lock();
        let av = store.cloned(a)?;
        let bv = store.cloned(b)?;
        let o = store.get_mut(out)?;
        require(&av, m * n, "matmul lhs")?;
        require(&bv, n * k, "matmul rhs")?;
        require(o, m * k, "matmul out")?;
        let mut converged = true;
        for i in 0..m {
            for j in 0..k {
                let mut acc = 0.0;
                for l in 0..n {
                    acc += av[i * n + l] * bv[l * k + j];
                }
                let prev = o[i * k + j];
                if (acc - prev).abs() > epsilon {
                    converged = false;
                }
                o[i * k + j] = acc;
            }
        }
        Ok(converged)
    }

    fn transpose(
        &self,
        src: BufferId,
        dst: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let s = store.cloned(src)?;
        let d = store.get_mut(dst)?;
        require(&s, rows * cols, "transpose source")?;
        require(d, rows * cols, "transpose destination")?;
        for i in 0..rows {
            for j in 0..cols {
                d[j * rows + i] = s[i * cols + j];
            }
        }
        Ok(())
    }

    fn sigmoid(&self, src: BufferId, dst: BufferId, rows: usize, cols: usize) -> StrataResult<()> {
        let mut store = self.lock();
        let s = store.cloned(src)?;
        let d = store.get_mut(dst)?;
        require(&s, rows * cols, "sigmoid source")?;
        require(d, rows * cols, "sigmoid destination")?;
        for i in 0..rows * cols {
            d[i] = sigmoid_scalar(s[i]);
        }
        Ok(())
    }

    fn sigmoid_prime(
        &self,
        activated: BufferId,
        dst: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let a = store.cloned(activated)?;
        let d = store.get_mut(dst)?;
        require(&a, rows * cols, "sigmoid-prime source")?;
        require(d, rows * cols, "sigmoid-prime destination")?;
        for i in 0..rows * cols {
            d[i] = a[i] * (1.0 - a[i]);
        }
        Ok(())
    }

    fn loss(
        &self,
        prediction: BufferId,
        target: BufferId,
        out: BufferId,
        rows: usize,
        cols: usize,
        loss: Loss,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let p = store.cloned(prediction)?;
        let t = store.cloned(target)?;
        let o = store.get_mut(out)?;
        require(&p, rows * cols, "loss prediction")?;
        require(&t, rows * cols, "loss target")?;
        require(o, rows * cols, "loss out")?;
        match loss {
            Loss::Quadratic => {
                for i in 0..rows * cols {
                    let diff = p[i] - t[i];
                    o[i] = 0.5 * diff * diff;
                }
            }
            Loss::CrossEntropy => {
                for i in 0..rows * cols {
                    let a = p[i].clamp(LN_CLAMP, 1.0 - LN_CLAMP);
                    o[i] = -(t[i] * a.ln() + (1.0 - t[i]) * (1.0 - a).ln());
                }
            }
        }
        Ok(())
    }

    fn loss_derivative(
        &self,
        prediction: BufferId,
        target: BufferId,
        out: BufferId,
        rows: usize,
        cols: usize,
        loss: Loss,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let p = store.cloned(prediction)?;
        let t = store.cloned(target)?;
        let o = store.get_mut(out)?;
        require(&p, rows * cols, "loss-derivative prediction")?;
        require(&t, rows * cols, "loss-derivative target")?;
        require(o, rows * cols, "loss-derivative out")?;
        // Both losses reduce to a - y against a sigmoid output layer;
        // the quadratic case is the documented simplification that lets
        // the last layer's delta skip its sigma' factor.
        let _ = loss;
        for i in 0..rows * cols {
            o[i] = p[i] - t[i];
        }
        Ok(())
    }

    fn backprop_delta(
        &self,
        weights_t: BufferId,
        delta_next: BufferId,
        sp: BufferId,
        delta_out: BufferId,
        rows: usize,
        mid: usize,
        batch: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let wt = store.cloned(weights_t)?;
        let dn = store.cloned(delta_next)?;
        let s = store.cloned(sp)?;
        let d = store.get_mut(delta_out)?;
        require(&wt, rows * mid, "transposed weights")?;
        require(&dn, mid * batch, "next delta")?;
        require(&s, rows * batch, "sigmoid prime")?;
        require(d, rows * batch, "delta out")?;
        for i in 0..rows {
            for j in 0..batch {
                let mut acc = 0.0;
                for l in 0..mid {
                    acc += wt[i * mid + l] * dn[l * batch + j];
                }
                d[i * batch + j] = acc * s[i * batch + j];
            }
        }
        Ok(())
    }

    fn weight_gradient(
        &self,
        delta: BufferId,
        activation_t: BufferId,
        grad: BufferId,
        out_size: usize,
        batch: usize,
        in_size: usize,
    ) -> StrataResult<()> {
        self.matmul(delta, activation_t, grad, out_size, batch, in_size)
    }

    fn update_weights(
        &self,
        lr: f32,
        decay: f32,
        weights: BufferId,
        gradient: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let g = store.cloned(gradient)?;
        let w = store.get_mut(weights)?;
        require(&g, rows * cols, "weight gradient")?;
        require(w, rows * cols, "weights")?;
        for i in 0..rows * cols {
            w[i] -= lr * g[i] + lr * decay * w[i];
        }
        Ok(())
    }

    fn update_biases(
        &self,
        lr: f32,
        bias: BufferId,
        gradient: BufferId,
        rows: usize,
        batch: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let g = store.cloned(gradient)?;
        let b = store.get_mut(bias)?;
        require(&g, rows * batch, "bias gradient")?;
        require(b, rows, "bias")?;
        let denom = batch.max(1) as f32;
        for i in 0..rows {
            let mut acc = 0.0;
            for j in 0..batch {
                acc += g[i * batch + j];
            }
            b[i] -= lr * acc / denom;
        }
        Ok(())
    }

    fn column_means(
        &self,
        data: BufferId,
        means: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let d = store.cloned(data)?;
        let m = store.get_mut(means)?;
        require(&d, rows * cols, "data")?;
        require(m, cols, "means")?;
        for j in 0..cols {
            let mut acc = 0.0;
            for i in 0..rows {
                acc += d[i * cols + j];
            }
            m[j] = acc / rows.max(1) as f32;
        }
        Ok(())
    }

    fn column_stddev(
        &self,
        data: BufferId,
        means: BufferId,
        stddev: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let d = store.cloned(data)?;
        let m = store.cloned(means)?;
        let s = store.get_mut(stddev)?;
        require(&d, rows * cols, "data")?;
        require(&m, cols, "means")?;
        require(s, cols, "stddev")?;
        let denom = rows.saturating_sub(1).max(1) as f32;
        for j in 0..cols {
            let mut acc = 0.0;
            for i in 0..rows {
                let diff = d[i * cols + j] - m[j];
                acc += diff * diff;
            }
            s[j] = (acc / denom).sqrt();
        }
        Ok(())
    }

    fn z_scores(
        &self,
        data: BufferId,
        means: BufferId,
        stddev: BufferId,
        z: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let d = store.cloned(data)?;
        let m = store.cloned(means)?;
        let s = store.cloned(stddev)?;
        let zb = store.get_mut(z)?;
        require(&d, rows * cols, "data")?;
        require(&m, cols, "means")?;
        require(&s, cols, "stddev")?;
        require(zb, rows * cols, "z")?;
        for j in 0..cols {
            let mean = f32x8::splat(m[j]);
            let std = f32x8::splat(s[j].max(MIN_STDDEV));

            // Eight rows at a time down the column.
            let mut r = 0;
            while r + 8 <= rows {
                let x = f32x8::new([
                    d[r * cols + j],
                    d[(r + 1) * cols + j],
                    d[(r + 2) * cols + j],
                    d[(r + 3) * cols + j],
                    d[(r + 4) * cols + j],
                    d[(r + 5) * cols + j],
                    d[(r + 6) * cols + j],
                    d[(r + 7) * cols + j],
                ]);
                let scored = (x - mean) / std;
                let arr: [f32; 8] = scored.into();
                for (t, v) in arr.iter().enumerate() {
                    zb[(r + t) * cols + j] = *v;
                }
                r += 8;
            }
            while r < rows {
                zb[r * cols + j] = (d[r * cols + j] - m[j]) / s[j].max(MIN_STDDEV);
                r += 1;
            }
        }
        Ok(())
    }

    fn covariance(
        &self,
        z: BufferId,
        cov: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let zv = store.cloned(z)?;
        let c = store.get_mut(cov)?;
        require(&zv, rows * cols, "z")?;
        require(c, cols * cols, "covariance")?;
        let denom = rows.saturating_sub(1).max(1) as f32;
        for a in 0..cols {
            for b in a..cols {
                let mut acc = 0.0;
                for i in 0..rows {
                    acc += zv[i * cols + a] * zv[i * cols + b];
                }
                let v = acc / denom;
                c[a * cols + b] = v;
                c[b * cols + a] = v;
            }
        }
        Ok(())
    }

    fn qr_project_column(
        &self,
        a: BufferId,
        q: BufferId,
        dot: BufferId,
        rows: usize,
        cols: usize,
        col: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let av = store.cloned(a)?;
        let qv = store.cloned(q)?;
        let d = store.get_mut(dot)?;
        require(&av, rows * cols, "qr input")?;
        require(&qv, rows * cols, "qr q")?;
        require(d, cols, "qr dot")?;
        for j in 0..col {
            let mut acc = 0.0;
            for r in 0..rows {
                acc += qv[r * cols + j] * av[r * cols + col];
            }
            d[j] = acc;
        }
        Ok(())
    }

    fn qr_subtract_column(
        &self,
        a: BufferId,
        q: BufferId,
        dot: BufferId,
        rows: usize,
        cols: usize,
        col: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let av = store.cloned(a)?;
        let d = store.cloned(dot)?;
        let qv = store.get_mut(q)?;
        require(&av, rows * cols, "qr input")?;
        require(&d, cols, "qr dot")?;
        require(qv, rows * cols, "qr q")?;
        for r in 0..rows {
            let mut v = av[r * cols + col];
            for j in 0..col {
                v -= d[j] * qv[r * cols + j];
            }
            qv[r * cols + col] = v;
        }
        Ok(())
    }

    fn qr_normalize_column(
        &self,
        q: BufferId,
        norm: BufferId,
        rows: usize,
        cols: usize,
        col: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let qv = store.get_mut(q)?;
        require(qv, rows * cols, "qr q")?;
        let mut acc = 0.0;
        for r in 0..rows {
            let v = qv[r * cols + col];
            acc += v * v;
        }
        let l2 = acc.sqrt();
        if l2 > 0.0 {
            for r in 0..rows {
                qv[r * cols + col] /= l2;
            }
        }
        let n = store.get_mut(norm)?;
        require(n, 1, "qr norm")?;
        n[0] = l2;
        Ok(())
    }

    fn clamp_below_diagonal(&self, r: BufferId, rows: usize, cols: usize) -> StrataResult<()> {
        let mut store = self.lock();
        let rv = store.get_mut(r)?;
        require(rv, rows * cols, "r")?;
        for i in 0..rows {
            for j in 0..cols.min(i) {
                rv[i * cols + j] = 0.0;
            }
        }
        Ok(())
    }

    fn eigenvector_signs(
        &self,
        vectors: BufferId,
        sums: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let mut column_sums = vec![0.0f32; cols];
        {
            let v = store.get_mut(vectors)?;
            require(v, rows * cols, "eigenvectors")?;
            for (j, sum) in column_sums.iter_mut().enumerate() {
                for r in 0..rows {
                    *sum += v[r * cols + j];
                }
            }
            for (j, sum) in column_sums.iter().enumerate() {
                if *sum < 0.0 {
                    for r in 0..rows {
                        v[r * cols + j] = -v[r * cols + j];
                    }
                }
            }
        }
        let s = store.get_mut(sums)?;
        require(s, cols, "sums")?;
        s[..cols].copy_from_slice(&column_sums);
        Ok(())
    }

    fn gather_columns(
        &self,
        src: BufferId,
        dst: BufferId,
        indices: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()> {
        let mut store = self.lock();
        let s = store.cloned(src)?;
        let idx_raw = store.cloned(indices)?;
        let d = store.get_mut(dst)?;
        require(&s, rows * cols, "gather source")?;
        require(&idx_raw, cols, "gather indices")?;
        require(d, rows * cols, "gather destination")?;
        let idx: &[i32] = bytemuck::cast_slice(&idx_raw[..cols]);
        for (j, &source_col) in idx.iter().enumerate() {
            let source_col = source_col as usize;
            if source_col >= cols {
                return Err(StrataError::backend(format!(
                    "gather index {source_col} out of range for {cols} columns"
                )));
            }
            for r in 0..rows {
                d[r * cols + j] = s[r * cols + source_col];
            }
        }
        Ok(())
    }
}
