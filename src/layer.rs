//! One dense transformation stage.
//!
//! A [`Layer`] owns every buffer its forward and backward kernels touch:
//! weights and bias with their gradients, the transposed-weights scratch
//! the backward pass needs, and the batch-width activation set. Weight-
//! shaped pairs are allocated at construction and never resized;
//! batch-shaped pairs are allocated when the owning network reserves a
//! batch width and grow (never shrink) on re-reservation.

use crate::buffer::BufferPair;
use crate::device::Device;
use crate::error::{StrataError, StrataResult};

/// Batch-width buffers of one layer, all `output_size × batch`.
///
/// Allocated by [`Layer::reserve_batch`]; absent until the network has
/// reserved a batch width.
pub(crate) struct LayerBatch {
    /// Pre-activation output of the linear kernel.
    pub output: BufferPair,
    /// Sigmoid of `output`; the layer's forward product.
    pub activated: BufferPair,
    /// Elementwise sigmoid derivative of `activated`.
    pub activated_prime: BufferPair,
    /// `activated` transposed (`batch × output_size`), consumed by the
    /// successor's weight-gradient kernel.
    pub activated_t: BufferPair,
    /// Backward error signal.
    pub delta: BufferPair,
    /// Per-example bias gradient; reduced over the batch by the update
    /// kernel.
    pub bias_grad: BufferPair,
    /// Batch capacity these pairs were allocated for.
    pub capacity: usize,
}

impl LayerBatch {
    fn new(device: &Device, output_size: usize, capacity: usize) -> StrataResult<Self> {
        Ok(Self {
            output: BufferPair::new(device, output_size, capacity)?,
            activated: BufferPair::new(device, output_size, capacity)?,
            activated_prime: BufferPair::new(device, output_size, capacity)?,
            activated_t: BufferPair::new(device, capacity, output_size)?,
            delta: BufferPair::new(device, output_size, capacity)?,
            bias_grad: BufferPair::new(device, output_size, capacity)?,
            capacity,
        })
    }
}

/// One dense layer: `activated = sigmoid(weights · input + bias)`.
///
/// Layers are owned exclusively by their network and identified by
/// position in its sequence; neighbours interact only through read-only
/// references the network routes during the passes.
pub struct Layer {
    input_size: usize,
    output_size: usize,
    pub(crate) weights: BufferPair,
    pub(crate) bias: BufferPair,
    pub(crate) weight_grad: BufferPair,
    pub(crate) weights_t: BufferPair,
    pub(crate) batch: Option<LayerBatch>,
}

impl Layer {
    /// Builds a layer from externally supplied parameters.
    ///
    /// `weights` must be row-major `output_size × input_size`, `bias`
    /// length `output_size`. Both are copied into paired buffers and
    /// pushed to the device. On any validation or allocation failure
    /// nothing is retained.
    pub fn new(
        device: &Device,
        weights: &[f32],
        bias: &[f32],
        input_size: usize,
        output_size: usize,
    ) -> StrataResult<Self> {
        if input_size == 0 {
            return Err(StrataError::InvalidDimension("input_size"));
        }
        if output_size == 0 {
            return Err(StrataError::InvalidDimension("output_size"));
        }
        if weights.len() != output_size * input_size {
            return Err(StrataError::shape_mismatch(
                &[output_size, input_size],
                &[weights.len()],
            ));
        }
        if bias.len() != output_size {
            return Err(StrataError::shape_mismatch(&[output_size, 1], &[bias.len()]));
        }

        Ok(Self {
            input_size,
            output_size,
            weights: BufferPair::from_slice(device, weights, output_size, input_size)?,
            bias: BufferPair::from_slice(device, bias, output_size, 1)?,
            weight_grad: BufferPair::new(device, output_size, input_size)?,
            weights_t: BufferPair::new(device, input_size, output_size)?,
            batch: None,
        })
    }

    /// Fan-in of the layer.
    #[inline]
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Fan-out of the layer.
    #[inline]
    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Allocates (or grows) the batch-width buffer set.
    pub(crate) fn reserve_batch(&mut self, device: &Device, capacity: usize) -> StrataResult<()> {
        let needs_alloc = match &self.batch {
            Some(batch) => batch.capacity < capacity,
            None => true,
        };
        if needs_alloc {
            self.batch = Some(LayerBatch::new(device, self.output_size, capacity)?);
        }
        Ok(())
    }

    /// The batch buffer set, or the sequencing error if none is
    /// reserved yet.
    pub(crate) fn batch(&self) -> StrataResult<&LayerBatch> {
        self.batch
            .as_ref()
            .ok_or_else(|| StrataError::invalid_state("reserve_batch has not been called"))
    }

    pub(crate) fn batch_mut(&mut self) -> StrataResult<&mut LayerBatch> {
        self.batch
            .as_mut()
            .ok_or_else(|| StrataError::invalid_state("reserve_batch has not been called"))
    }

    /// Zeroes both gradient buffers and pushes them.
    pub(crate) fn reset_gradients(&mut self) -> StrataResult<()> {
        self.weight_grad.zero()?;
        if let Some(batch) = self.batch.as_mut() {
            batch.bias_grad.zero()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("input_size", &self.input_size)
            .field("output_size", &self.output_size)
            .field(
                "batch_capacity",
                &self.batch.as_ref().map(|b| b.capacity),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero_dimensions() {
        let device = Device::reference();
        assert!(Layer::new(&device, &[], &[], 0, 1).is_err());
        assert!(Layer::new(&device, &[], &[], 1, 0).is_err());
    }

    #[test]
    fn test_rejects_wrong_weight_shape() {
        let device = Device::reference();
        let err = Layer::new(&device, &[1.0, 2.0, 3.0], &[0.0, 0.0], 2, 2).unwrap_err();
        assert!(matches!(err, StrataError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_rejects_wrong_bias_shape() {
        let device = Device::reference();
        let err = Layer::new(&device, &[1.0; 4], &[0.0; 3], 2, 2).unwrap_err();
        assert!(matches!(err, StrataError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_reserve_batch_grow_only() {
        let device = Device::reference();
        let mut layer = Layer::new(&device, &[1.0; 6], &[0.0; 3], 2, 3).unwrap();
        assert!(layer.batch().is_err());

        layer.reserve_batch(&device, 8).unwrap();
        assert_eq!(layer.batch().unwrap().capacity, 8);

        // Smaller reservation keeps the existing allocation.
        layer.reserve_batch(&device, 4).unwrap();
        assert_eq!(layer.batch().unwrap().capacity, 8);

        layer.reserve_batch(&device, 16).unwrap();
        assert_eq!(layer.batch().unwrap().capacity, 16);
    }
}
