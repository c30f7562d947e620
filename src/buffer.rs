//! Host/device mirrored buffers.
//!
//! Every matrix the engines own lives as a [`BufferPair`]: a host staging
//! `Vec<f32>` mirrored with a device allocation of identical byte size,
//! tagged with its row-major shape and a per-pair staleness flag. Keeping
//! both sides and the shape in one value rules out the classic
//! mismatched-allocate/copy/free sequences that paired raw pointers
//! invite, and per-pair staleness lets any number of buffers be tracked
//! independently.
//!
//! The mirror discipline is explicit: the device side is authoritative
//! once kernels have run; the host side is stale until [`pull`]
//! refreshes it. Nothing refreshes implicitly.
//!
//! [`pull`]: BufferPair::pull

use crate::device::{Device, DeviceBuffer};
use crate::error::{StrataError, StrataResult};

/// A host staging region mirrored with a device allocation.
///
/// # Example
///
/// ```rust
/// use strata::{BufferPair, Device};
///
/// let device = Device::reference();
/// let mut pair = BufferPair::from_slice(&device, &[1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
/// assert_eq!(pair.rows(), 2);
/// assert_eq!(pair.pull().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
/// ```
pub struct BufferPair {
    host: Vec<f32>,
    device: DeviceBuffer,
    rows: usize,
    cols: usize,
    host_stale: bool,
}

impl BufferPair {
    /// Allocates a zero-filled `rows × cols` pair.
    pub fn new(device: &Device, rows: usize, cols: usize) -> StrataResult<Self> {
        let len = rows
            .checked_mul(cols)
            .ok_or_else(|| StrataError::buffer("buffer shape overflows usize"))?;
        let dev = device.alloc_f32(len)?;
        let host = vec![0.0; len];
        dev.write_f32(&host)?;
        Ok(Self {
            host,
            device: dev,
            rows,
            cols,
            host_stale: false,
        })
    }

    /// Allocates a pair initialized from `data`, pushed to the device.
    ///
    /// `data` must be exactly `rows × cols` elements, row-major.
    pub fn from_slice(
        device: &Device,
        data: &[f32],
        rows: usize,
        cols: usize,
    ) -> StrataResult<Self> {
        if data.len() != rows * cols {
            return Err(StrataError::shape_mismatch(&[rows, cols], &[data.len()]));
        }
        let dev = device.alloc_f32(data.len())?;
        dev.write_f32(data)?;
        Ok(Self {
            host: data.to_vec(),
            device: dev,
            rows,
            cols,
            host_stale: false,
        })
    }

    /// Row count of the logical matrix.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Column count of the logical matrix.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Element count.
    #[inline]
    pub fn len(&self) -> usize {
        self.host.len()
    }

    /// True for a zero-element pair.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    /// The device side of the pair.
    #[inline]
    pub fn device(&self) -> &DeviceBuffer {
        &self.device
    }

    /// True when the host mirror is known stale relative to the device.
    #[inline]
    pub fn host_stale(&self) -> bool {
        self.host_stale
    }

    /// Marks the host mirror stale. Called after a kernel writes the
    /// device side.
    #[inline]
    pub fn mark_host_stale(&mut self) {
        self.host_stale = true;
    }

    /// The host mirror as last refreshed. Callers that need the current
    /// device contents must [`pull`](Self::pull) first.
    #[inline]
    pub fn host(&self) -> &[f32] {
        &self.host
    }

    /// Mutable host mirror, for staging data before a push.
    #[inline]
    pub fn host_mut(&mut self) -> &mut [f32] {
        &mut self.host
    }

    /// Pushes the host mirror to the device.
    pub fn push(&mut self) -> StrataResult<()> {
        self.device.write_f32(&self.host)?;
        self.host_stale = false;
        Ok(())
    }

    /// Stages `data` into the host mirror and pushes it.
    ///
    /// `data` may be shorter than the pair when only the leading batch
    /// columns are in use; the remainder keeps its previous contents.
    pub fn push_slice(&mut self, data: &[f32]) -> StrataResult<()> {
        if data.len() > self.host.len() {
            return Err(StrataError::shape_mismatch(
                &[self.host.len()],
                &[data.len()],
            ));
        }
        self.host[..data.len()].copy_from_slice(data);
        self.push()
    }

    /// Refreshes the host mirror from the device and returns it. Clears
    /// the staleness flag.
    pub fn pull(&mut self) -> StrataResult<&[f32]> {
        self.device.read_f32(&mut self.host)?;
        self.host_stale = false;
        Ok(&self.host)
    }

    /// Zeroes the host mirror and pushes.
    pub fn zero(&mut self) -> StrataResult<()> {
        self.host.fill(0.0);
        self.push()
    }
}

/// Renders the leading `rows × cols` of a packed row-major slice for
/// trace-level dumps.
pub(crate) fn format_matrix(data: &[f32], rows: usize, cols: usize) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(rows * cols * 10);
    for r in 0..rows {
        for c in 0..cols {
            let _ = write!(out, "{:+.5}\t", data[r * cols + c]);
        }
        out.push('\n');
    }
    out
}

impl std::fmt::Debug for BufferPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPair")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("host_stale", &self.host_stale)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_rejects_wrong_shape() {
        let device = Device::reference();
        assert!(BufferPair::from_slice(&device, &[1.0, 2.0, 3.0], 2, 2).is_err());
    }

    #[test]
    fn test_push_pull_round_trip() {
        let device = Device::reference();
        let mut pair = BufferPair::new(&device, 2, 2).unwrap();
        pair.host_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        pair.push().unwrap();
        pair.host_mut().fill(0.0);
        assert_eq!(pair.pull().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_staleness_cleared_by_pull() {
        let device = Device::reference();
        let mut pair = BufferPair::from_slice(&device, &[1.0], 1, 1).unwrap();
        pair.mark_host_stale();
        assert!(pair.host_stale());
        pair.pull().unwrap();
        assert!(!pair.host_stale());
    }

    #[test]
    fn test_zero() {
        let device = Device::reference();
        let mut pair = BufferPair::from_slice(&device, &[7.0, 8.0], 1, 2).unwrap();
        pair.zero().unwrap();
        assert_eq!(pair.pull().unwrap(), &[0.0, 0.0]);
    }
}
