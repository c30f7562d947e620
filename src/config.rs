//! Loss selection and numeric policies.
//!
//! The loss selector is a [`Loss`] value owned by each
//! [`Network`](crate::Network) rather than process-wide state, so
//! independent networks can train against different losses in one
//! process. The kernel layer receives it as a small integer code.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Minimum standard deviation used during z-scoring.
///
/// Zero-variance columns would divide by zero when standardized; flooring
/// the stddev here makes a constant column standardize to zero instead.
pub const MIN_STDDEV: f32 = 1e-6;

/// Default convergence threshold for the QR eigensolver.
pub const DEFAULT_EPSILON: f32 = 1e-5;

/// Default iteration cap for the QR eigensolver.
pub const DEFAULT_MAX_ITERATIONS: usize = 500;

/// Loss function applied by the cost and cost-derivative kernels.
///
/// The numeric forms live in the backend; the engine only selects which
/// one runs. Discriminants are wire-stable and match the selector codes
/// the kernel layer accepts.
///
/// # Example
///
/// ```rust
/// use strata::Loss;
///
/// assert_eq!(Loss::CrossEntropy as u32, 1);
/// assert_eq!(Loss::default(), Loss::CrossEntropy);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum Loss {
    /// Quadratic loss, `0.5 * (a - y)^2` per element.
    Quadratic = 0,
    /// Binary cross-entropy, `-(y ln a + (1-y) ln (1-a))` per element.
    ///
    /// Combined with a sigmoid output layer its derivative reduces to
    /// `a - y`, which is what lets the backward pass seed the last
    /// layer's delta directly from the cost derivative.
    #[default]
    CrossEntropy = 1,
}

impl Loss {
    /// Selector code understood by the kernel layer.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Parses a kernel selector code. Unknown codes map to `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Loss::Quadratic),
            1 => Some(Loss::CrossEntropy),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_codes_round_trip() {
        for loss in [Loss::Quadratic, Loss::CrossEntropy] {
            assert_eq!(Loss::from_code(loss.code()), Some(loss));
        }
        assert_eq!(Loss::from_code(7), None);
    }

    #[test]
    fn test_min_stddev_positive() {
        assert!(MIN_STDDEV > 0.0);
    }
}
