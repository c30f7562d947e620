//! Accelerator abstraction: the kernel contract and buffer handles.
//!
//! The numeric kernels are an external collaborator. This module pins
//! down the contract the engines depend on:
//!
//! - [`Backend`] — one method per kernel, plus raw allocate/copy/free.
//!   Every call is synchronous: when it returns, its result is visible on
//!   the device. A failure is fatal to the enclosing host operation.
//! - [`Device`] — a cloneable handle (shared backend) the engines hold,
//!   mirroring how the GPU path elsewhere carries `Arc`'d device/queue
//!   handles.
//! - [`DeviceBuffer`] — an owned device allocation, released on drop.
//!
//! # Memory model
//!
//! Allocation is byte-granular, as on the real device; typed access goes
//! through `bytemuck` reinterpretation at the transfer boundary. All
//! matrices are row-major `f32`; the one integer buffer in the system is
//! the eigenvector reorder index list.

mod reference;

pub use reference::CpuBackend;

use crate::config::Loss;
use crate::error::{StrataError, StrataResult};
use std::sync::Arc;

/// Opaque identifier of one device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// The accelerator kernel contract.
///
/// Matrix arguments are row-major unless a name says otherwise. Shape
/// parameters describe the *logical* operation; buffers may be larger.
/// Implementations must not retain buffer ids across calls.
pub trait Backend: Send + Sync {
    // ---- raw memory ----------------------------------------------------

    /// Allocates `size_bytes` of device memory.
    fn alloc(&self, size_bytes: usize) -> StrataResult<BufferId>;

    /// Releases an allocation. Double-free is a backend-defined no-op.
    fn free(&self, id: BufferId);

    /// Copies host bytes into a device allocation, from offset zero.
    fn write(&self, dst: BufferId, data: &[u8]) -> StrataResult<()>;

    /// Copies device bytes back to the host, from offset zero.
    fn read(&self, src: BufferId, out: &mut [u8]) -> StrataResult<()>;

    /// Device-to-device copy of `size_bytes`.
    fn copy(&self, src: BufferId, dst: BufferId, size_bytes: usize) -> StrataResult<()>;

    // ---- dense math ----------------------------------------------------

    /// `output = weights · activation + bias` (broadcast per column).
    ///
    /// `weights` is `out_size × in_size`, `activation` is feature-major
    /// `in_size × batch`, `bias` is `out_size × 1`, `output` is
    /// `out_size × batch`.
    fn linear(
        &self,
        activation: BufferId,
        weights: BufferId,
        bias: BufferId,
        output: BufferId,
        out_size: usize,
        in_size: usize,
        batch: usize,
    ) -> StrataResult<()>;

    /// `out = a · b` with `a: m×n`, `b: n×k`, `out: m×k`.
    fn matmul(
        &self,
        a: BufferId,
        b: BufferId,
        out: BufferId,
        m: usize,
        n: usize,
        k: usize,
    ) -> StrataResult<()>;

    /// Like [`matmul`](Backend::matmul) but only the first `max_cols`
    /// columns of `b` participate; `out` is `m × max_cols`.
    #[allow(clippy::too_many_arguments)]
    fn matmul_partial(
        &self,
        a: BufferId,
        b: BufferId,
        out: BufferId,
        m: usize,
        n: usize,
        k: usize,
        max_cols: usize,
    ) -> StrataResult<()>;

    /// `out = a · b`, and reports convergence: `true` iff no element of
    /// the product differs from the previous contents of `out` by more
    /// than `epsilon`.
    #[allow(clippy::too_many_arguments)]
    fn matmul_converged(
        &self,
        a: BufferId,
        b: BufferId,
        out: BufferId,
        epsilon: f32,
        m: usize,
        n: usize,
        k: usize,
    ) -> StrataResult<bool>;

    /// Out-of-place transpose of a `rows × cols` matrix.
    fn transpose(&self, src: BufferId, dst: BufferId, rows: usize, cols: usize)
        -> StrataResult<()>;

    // ---- elementwise ---------------------------------------------------

    /// Elementwise logistic sigmoid over a `rows × cols` matrix.
    fn sigmoid(&self, src: BufferId, dst: BufferId, rows: usize, cols: usize) -> StrataResult<()>;

    /// Elementwise `a * (1 - a)` where `a` is an already-activated value.
    fn sigmoid_prime(
        &self,
        activated: BufferId,
        dst: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()>;

    /// Per-element loss between prediction and target.
    #[allow(clippy::too_many_arguments)]
    fn loss(
        &self,
        prediction: BufferId,
        target: BufferId,
        out: BufferId,
        rows: usize,
        cols: usize,
        loss: Loss,
    ) -> StrataResult<()>;

    /// Per-element loss derivative with respect to the prediction.
    ///
    /// For both supported losses combined with a sigmoid output layer
    /// this is `a - y`, which is what lets the last layer's delta be
    /// seeded directly from this buffer.
    #[allow(clippy::too_many_arguments)]
    fn loss_derivative(
        &self,
        prediction: BufferId,
        target: BufferId,
        out: BufferId,
        rows: usize,
        cols: usize,
        loss: Loss,
    ) -> StrataResult<()>;

    /// `delta_out = (weights_t · delta_next) ⊙ sp`.
    ///
    /// `weights_t: rows×mid`, `delta_next: mid×batch`, `sp` and
    /// `delta_out: rows×batch`. The Hadamard product is fused into the
    /// kernel.
    #[allow(clippy::too_many_arguments)]
    fn backprop_delta(
        &self,
        weights_t: BufferId,
        delta_next: BufferId,
        sp: BufferId,
        delta_out: BufferId,
        rows: usize,
        mid: usize,
        batch: usize,
    ) -> StrataResult<()>;

    /// `grad = delta · activation_t`, summing over the batch dimension.
    ///
    /// `delta: out_size×batch`, `activation_t: batch×in_size`,
    /// `grad: out_size×in_size`.
    #[allow(clippy::too_many_arguments)]
    fn weight_gradient(
        &self,
        delta: BufferId,
        activation_t: BufferId,
        grad: BufferId,
        out_size: usize,
        batch: usize,
        in_size: usize,
    ) -> StrataResult<()>;

    // ---- parameter update ----------------------------------------------

    /// `weights -= lr · grad + lr · decay · weights` over `rows × cols`.
    #[allow(clippy::too_many_arguments)]
    fn update_weights(
        &self,
        lr: f32,
        decay: f32,
        weights: BufferId,
        gradient: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()>;

    /// `bias[r] -= lr · mean_b(gradient[r][b])`.
    ///
    /// The batch-mean reduction happens inside the kernel; `gradient` is
    /// `rows × batch`, `bias` is `rows × 1`.
    fn update_biases(
        &self,
        lr: f32,
        bias: BufferId,
        gradient: BufferId,
        rows: usize,
        batch: usize,
    ) -> StrataResult<()>;

    // ---- column statistics ---------------------------------------------

    /// Per-column means of a `rows × cols` matrix into a length-`cols`
    /// buffer.
    fn column_means(
        &self,
        data: BufferId,
        means: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()>;

    /// Per-column sample standard deviations (`n - 1` denominator).
    fn column_stddev(
        &self,
        data: BufferId,
        means: BufferId,
        stddev: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()>;

    /// Per-element z-score `(x - mean) / max(stddev, MIN_STDDEV)`.
    ///
    /// The floor is the zero-variance policy: constant columns
    /// standardize to zero rather than dividing by zero.
    #[allow(clippy::too_many_arguments)]
    fn z_scores(
        &self,
        data: BufferId,
        means: BufferId,
        stddev: BufferId,
        z: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()>;

    /// `cov = zᵗ · z / (rows - 1)`, a `cols × cols` result.
    fn covariance(&self, z: BufferId, cov: BufferId, rows: usize, cols: usize)
        -> StrataResult<()>;

    // ---- QR column operations ------------------------------------------

    /// `dot[j] = q[:,j] · a[:,col]` for every `j < col`.
    fn qr_project_column(
        &self,
        a: BufferId,
        q: BufferId,
        dot: BufferId,
        rows: usize,
        cols: usize,
        col: usize,
    ) -> StrataResult<()>;

    /// `q[:,col] = a[:,col] - Σ_{j<col} dot[j] · q[:,j]`.
    fn qr_subtract_column(
        &self,
        a: BufferId,
        q: BufferId,
        dot: BufferId,
        rows: usize,
        cols: usize,
        col: usize,
    ) -> StrataResult<()>;

    /// Divides `q[:,col]` by its L2 norm; `norm` is a one-element
    /// scratch the kernel reduces into.
    fn qr_normalize_column(
        &self,
        q: BufferId,
        norm: BufferId,
        rows: usize,
        cols: usize,
        col: usize,
    ) -> StrataResult<()>;

    /// Sets every entry strictly below the diagonal of a `rows × cols`
    /// matrix to exactly zero.
    fn clamp_below_diagonal(&self, r: BufferId, rows: usize, cols: usize) -> StrataResult<()>;

    // ---- eigenvector post-processing -----------------------------------

    /// Writes each column's entry-sum into `sums` and negates any column
    /// whose sum is negative. The recorded sums are the pre-flip values.
    fn eigenvector_signs(
        &self,
        vectors: BufferId,
        sums: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()>;

    /// `dst[:,j] = src[:, indices[j]]` for a `rows × cols` matrix;
    /// `indices` holds `cols` i32 values.
    fn gather_columns(
        &self,
        src: BufferId,
        dst: BufferId,
        indices: BufferId,
        rows: usize,
        cols: usize,
    ) -> StrataResult<()>;
}

/// Shared handle to a [`Backend`].
///
/// Cheap to clone; every engine and buffer in one pipeline holds the same
/// underlying backend.
#[derive(Clone)]
pub struct Device {
    backend: Arc<dyn Backend>,
}

impl Device {
    /// Wraps a backend implementation.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Convenience constructor for the in-process reference backend.
    pub fn reference() -> Self {
        Self::new(Arc::new(CpuBackend::new()))
    }

    /// Allocates a device buffer holding `len` f32 elements.
    pub fn alloc_f32(&self, len: usize) -> StrataResult<DeviceBuffer> {
        let size_bytes = len
            .checked_mul(std::mem::size_of::<f32>())
            .ok_or_else(|| StrataError::buffer("buffer size overflows usize"))?;
        let id = self.backend.alloc(size_bytes)?;
        Ok(DeviceBuffer {
            id,
            len,
            backend: Arc::clone(&self.backend),
        })
    }

    /// Allocates a device buffer holding `len` i32 elements.
    ///
    /// i32 and f32 are the same width, so the handle is shared; the
    /// element type is a convention of the kernel consuming it.
    pub fn alloc_i32(&self, len: usize) -> StrataResult<DeviceBuffer> {
        self.alloc_f32(len)
    }

    /// Direct access to the kernel contract.
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").finish_non_exhaustive()
    }
}

/// An owned device allocation, released when dropped.
///
/// The handle carries its element count so transfers can be
/// length-checked, and a shared backend reference so the allocation's
/// lifetime is tied to the handle rather than to a manual free call.
pub struct DeviceBuffer {
    id: BufferId,
    len: usize,
    backend: Arc<dyn Backend>,
}

impl DeviceBuffer {
    /// The raw id kernels are invoked with.
    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Element count (f32-sized words).
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the buffer holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size in bytes.
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<f32>()
    }

    /// Uploads `data`, which must not exceed the buffer's capacity.
    pub fn write_f32(&self, data: &[f32]) -> StrataResult<()> {
        if data.len() > self.len {
            return Err(StrataError::shape_mismatch(&[self.len], &[data.len()]));
        }
        self.backend.write(self.id, bytemuck::cast_slice(data))
    }

    /// Uploads reorder indices (or any i32 payload).
    pub fn write_i32(&self, data: &[i32]) -> StrataResult<()> {
        if data.len() > self.len {
            return Err(StrataError::shape_mismatch(&[self.len], &[data.len()]));
        }
        self.backend.write(self.id, bytemuck::cast_slice(data))
    }

    /// Downloads exactly `out.len()` elements from the front of the
    /// buffer.
    pub fn read_f32(&self, out: &mut [f32]) -> StrataResult<()> {
        if out.len() > self.len {
            return Err(StrataError::shape_mismatch(&[self.len], &[out.len()]));
        }
        self.backend.read(self.id, bytemuck::cast_slice_mut(out))
    }

    /// Device-to-device copy of `len` elements from `src` into this
    /// buffer.
    pub fn copy_from(&self, src: &DeviceBuffer, len: usize) -> StrataResult<()> {
        if len > self.len || len > src.len {
            return Err(StrataError::buffer(format!(
                "intra-device copy of {} elements exceeds capacity (src {}, dst {})",
                len, src.len, self.len
            )));
        }
        self.backend
            .copy(src.id, self.id, len * std::mem::size_of::<f32>())
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.backend.free(self.id);
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_write_read_round_trip() {
        let device = Device::reference();
        let buf = device.alloc_f32(4).unwrap();
        buf.write_f32(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut out = [0.0f32; 4];
        buf.read_f32(&mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_write_rejects_oversized_payload() {
        let device = Device::reference();
        let buf = device.alloc_f32(2).unwrap();
        assert!(buf.write_f32(&[0.0; 3]).is_err());
    }

    #[test]
    fn test_intra_device_copy() {
        let device = Device::reference();
        let a = device.alloc_f32(3).unwrap();
        let b = device.alloc_f32(3).unwrap();
        a.write_f32(&[5.0, 6.0, 7.0]).unwrap();
        b.copy_from(&a, 3).unwrap();
        let mut out = [0.0f32; 3];
        b.read_f32(&mut out).unwrap();
        assert_eq!(out, [5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_buffers_are_independent() {
        let device = Device::reference();
        let a = device.alloc_f32(2).unwrap();
        let b = device.alloc_f32(2).unwrap();
        a.write_f32(&[1.0, 1.0]).unwrap();
        b.write_f32(&[2.0, 2.0]).unwrap();
        let mut out = [0.0f32; 2];
        a.read_f32(&mut out).unwrap();
        assert_eq!(out, [1.0, 1.0]);
    }
}
