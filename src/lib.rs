//! # strata - Accelerator-Orchestrated Dense Training and PCA
//!
//! Host-side orchestration for accelerator-resident dense numeric work:
//! mini-batch training of a sigmoid feed-forward network (forward,
//! backward, update) and principal-component analysis (covariance,
//! QR-iteration eigensolver, low-rank projection).
//!
//! The numeric kernels are external: they sit behind the
//! [`Backend`](device::Backend) trait and are invoked as opaque,
//! synchronous operations. The crate's job is everything around them —
//! buffer lifecycles, host/device mirroring, data layout, and kernel
//! ordering. A pure-Rust reference backend
//! ([`CpuBackend`](device::CpuBackend)) ships for testing and
//! development.
//!
//! ## Architecture
//! - Row-major `f32` matrices; activations feature-major on device
//! - Every matrix is a [`BufferPair`]: host mirror + device allocation
//!   + per-pair staleness flag
//! - One [`Network`] or [`Pca`] value is one pipeline context; no
//!   process-global state, no internal locking — callers serialize
//!
//! ## Usage
//! ```rust,ignore
//! use strata::{Device, Loss, Network};
//!
//! let device = Device::reference();
//! let mut net = Network::new(device);
//! net.set_loss(Loss::Quadratic);
//! net.append_layer(2, 3, &w1, &b1)?;
//! net.append_layer(3, 1, &w2, &b2)?;
//! net.reserve_batch(32)?;
//!
//! // One training step; the batch/epoch loop belongs to the caller.
//! net.load_input(&inputs, 32)?;
//! net.load_target(&targets)?;
//! net.reset_gradients()?;
//! net.forward()?;
//! net.cost_derivative()?;
//! net.backward()?;
//! net.update(0.1, 0.0)?;
//! ```

pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod layer;
pub mod network;
pub mod pca;

// Re-exports
pub use buffer::BufferPair;
pub use config::{Loss, DEFAULT_EPSILON, DEFAULT_MAX_ITERATIONS, MIN_STDDEV};
pub use device::{Backend, BufferId, CpuBackend, Device, DeviceBuffer};
pub use error::{StrataError, StrataResult};
pub use layer::Layer;
pub use network::Network;
pub use pca::Pca;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
