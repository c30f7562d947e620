//! Unified error types for strata.
//!
//! This module provides [`StrataError`], the single error type surfaced by
//! the network and PCA engines as well as the device layer. It uses the
//! `thiserror` crate for ergonomic error handling.
//!
//! # Example
//!
//! ```rust
//! use strata::StrataError;
//!
//! fn validate_shape(expected: &[usize], got: &[usize]) -> Result<(), StrataError> {
//!     if expected != got {
//!         return Err(StrataError::shape_mismatch(expected, got));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Unified error type for strata operations.
///
/// Covers caller contract violations (shapes, batch bounds, sequencing),
/// device memory exhaustion, and kernel failures reported by the backend.
/// Kernel failures are fatal to the enclosing call and are never retried.
#[derive(Error, Debug)]
pub enum StrataError {
    /// Accelerator kernel reported a failure.
    ///
    /// Fatal to the enclosing host call; the operation is aborted and
    /// intermediate device state is unspecified.
    #[error("backend error: {0}")]
    Backend(String),

    /// Shape mismatch between caller-supplied data and a declared size.
    ///
    /// This is the common error when layer weights, biases, or batches
    /// do not match the dimensions declared at construction.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Shape actually received.
        got: Vec<usize>,
    },

    /// Loaded batch width exceeds the reserved capacity.
    ///
    /// `reserve_batch` fixes the capacity; loading a wider batch would
    /// write past the staging buffers and is rejected.
    #[error("batch size {0} exceeds reserved capacity {1}")]
    BatchTooLarge(usize, usize),

    /// Device or staging memory allocation failed.
    #[error("allocation of {0} bytes failed")]
    AllocationFailed(usize),

    /// Host/device transfer or buffer bookkeeping failed.
    #[error("buffer operation failed: {0}")]
    Buffer(String),

    /// An operation was invoked out of sequence.
    ///
    /// For example a forward pass before `reserve_batch`, or a
    /// projection before the eigen-decomposition it depends on.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Layer index past the end of the network.
    #[error("layer index {index} out of bounds (network has {layers} layers)")]
    LayerIndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Number of layers in the network.
        layers: usize,
    },

    /// A dimension that must be non-zero was zero.
    #[error("invalid dimension: {0} must be non-zero")]
    InvalidDimension(&'static str),
}

/// Result type alias for strata operations.
pub type StrataResult<T> = Result<T, StrataError>;

impl StrataError {
    /// Creates a backend error with the given message.
    pub fn backend<S: Into<String>>(msg: S) -> Self {
        StrataError::Backend(msg.into())
    }

    /// Creates a shape mismatch error.
    pub fn shape_mismatch(expected: &[usize], got: &[usize]) -> Self {
        StrataError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// Creates a batch too large error.
    pub fn batch_too_large(requested: usize, capacity: usize) -> Self {
        StrataError::BatchTooLarge(requested, capacity)
    }

    /// Creates a buffer error.
    pub fn buffer<S: Into<String>>(msg: S) -> Self {
        StrataError::Buffer(msg.into())
    }

    /// Creates an invalid state error.
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        StrataError::InvalidState(msg.into())
    }

    /// Creates a layer index error.
    pub fn layer_index(index: usize, layers: usize) -> Self {
        StrataError::LayerIndexOutOfBounds { index, layers }
    }
}
