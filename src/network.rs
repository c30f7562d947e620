//! The layer-graph network engine.
//!
//! [`Network`] owns the ordered layer sequence plus the shared
//! input/target/cost buffers, and sequences the accelerator kernels for
//! the four training phases: forward pass, cost evaluation, backward
//! pass, parameter update. The repetition loop over batches and epochs
//! belongs to the caller; one `Network` value is one training context and
//! many can coexist in a process.
//!
//! # Buffer choreography
//!
//! Batches arrive example-major and are staged into the transposed
//! pair, pushed, then transposed on-device into the feature-major layout
//! the linear kernel consumes. All batch-width buffers are allocated at
//! the reserved capacity and used packed at the current batch width, so
//! a narrower batch never needs a reallocation.
//!
//! # Example
//!
//! ```rust
//! use strata::{Device, Network};
//!
//! let device = Device::reference();
//! let mut net = Network::new(device);
//! net.append_layer(2, 3, &[0.1; 6], &[0.0; 3]).unwrap();
//! net.append_layer(3, 1, &[0.1; 3], &[0.0; 1]).unwrap();
//! net.reserve_batch(4).unwrap();
//!
//! net.load_input(&[1.0, 0.5], 1).unwrap();
//! net.load_target(&[1.0]).unwrap();
//! net.forward().unwrap();
//! let cost = net.cost().unwrap();
//! assert!(cost.is_finite());
//! ```

use crate::buffer::{format_matrix, BufferPair};
use crate::config::Loss;
use crate::device::Device;
use crate::error::{StrataError, StrataResult};
use crate::layer::Layer;
use wide::f32x8;

/// Shared input/target/cost buffers, allocated by `reserve_batch`.
struct IoBuffers {
    /// Feature-major input, `input_size × capacity`.
    x: BufferPair,
    /// Example-major staging for the input, `capacity × input_size`.
    /// Doubles as the transposed input activation in the backward pass.
    x_t: BufferPair,
    /// Feature-major target, `output_size × capacity`.
    y: BufferPair,
    /// Example-major staging for the target.
    y_t: BufferPair,
    /// Per-element loss values.
    cost: BufferPair,
    /// Per-element loss derivative; seeds the backward pass.
    cost_derivative: BufferPair,
    input_size: usize,
    output_size: usize,
    capacity: usize,
}

impl IoBuffers {
    fn new(
        device: &Device,
        input_size: usize,
        output_size: usize,
        capacity: usize,
    ) -> StrataResult<Self> {
        Ok(Self {
            x: BufferPair::new(device, input_size, capacity)?,
            x_t: BufferPair::new(device, capacity, input_size)?,
            y: BufferPair::new(device, output_size, capacity)?,
            y_t: BufferPair::new(device, capacity, output_size)?,
            cost: BufferPair::new(device, output_size, capacity)?,
            cost_derivative: BufferPair::new(device, output_size, capacity)?,
            input_size,
            output_size,
            capacity,
        })
    }
}

/// Feed-forward network with accelerator-resident parameters.
pub struct Network {
    device: Device,
    layers: Vec<Layer>,
    loss: Loss,
    io: Option<IoBuffers>,
    mini_batch: usize,
}

impl Network {
    /// Creates an empty network on `device` with the default loss.
    pub fn new(device: Device) -> Self {
        Self {
            device,
            layers: Vec::new(),
            loss: Loss::default(),
            io: None,
            mini_batch: 0,
        }
    }

    /// Selects the loss applied by [`cost`](Self::cost) and
    /// [`cost_derivative`](Self::cost_derivative).
    pub fn set_loss(&mut self, loss: Loss) {
        self.loss = loss;
    }

    /// The configured loss.
    pub fn loss(&self) -> Loss {
        self.loss
    }

    /// The layer sequence, head first.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Batch width of the most recently loaded input.
    pub fn mini_batch_size(&self) -> usize {
        self.mini_batch
    }

    /// Constructs a layer and links it at the tail of the sequence.
    ///
    /// The new layer's `input_size` must equal the current tail's
    /// `output_size`; `weights` is row-major `output_size × input_size`
    /// and `bias` has `output_size` elements. The full sequence must be
    /// assembled before `reserve_batch`: the shared target and cost
    /// buffers are shaped by the tail layer, so a later append is a
    /// sequencing error. On failure the network is unchanged.
    pub fn append_layer(
        &mut self,
        input_size: usize,
        output_size: usize,
        weights: &[f32],
        bias: &[f32],
    ) -> StrataResult<()> {
        if self.io.is_some() {
            return Err(StrataError::invalid_state(
                "append_layer after reserve_batch",
            ));
        }
        if let Some(tail) = self.layers.last() {
            if tail.output_size() != input_size {
                return Err(StrataError::shape_mismatch(
                    &[tail.output_size()],
                    &[input_size],
                ));
            }
        }
        let layer = Layer::new(&self.device, weights, bias, input_size, output_size)?;
        self.layers.push(layer);
        log::debug!(
            "appended layer {} ({input_size} -> {output_size})",
            self.layers.len() - 1
        );
        Ok(())
    }

    /// Allocates the shared input/target/cost buffers and every layer's
    /// batch-width set for `batch_size` examples.
    ///
    /// Must be called after the full layer sequence is assembled and
    /// before any load or pass. Calling it again changes the batch width
    /// between training runs; allocations only grow.
    pub fn reserve_batch(&mut self, batch_size: usize) -> StrataResult<()> {
        if batch_size == 0 {
            return Err(StrataError::InvalidDimension("batch_size"));
        }
        let (input_size, output_size) = match (self.layers.first(), self.layers.last()) {
            (Some(first), Some(last)) => (first.input_size(), last.output_size()),
            _ => {
                return Err(StrataError::invalid_state(
                    "reserve_batch requires at least one layer",
                ))
            }
        };

        let needs_alloc = match &self.io {
            Some(io) => io.capacity < batch_size,
            None => true,
        };
        if needs_alloc {
            self.io = Some(IoBuffers::new(
                &self.device,
                input_size,
                output_size,
                batch_size,
            )?);
            for layer in &mut self.layers {
                layer.reserve_batch(&self.device, batch_size)?;
            }
        }
        self.mini_batch = batch_size;
        Ok(())
    }

    fn io(&self) -> StrataResult<&IoBuffers> {
        self.io
            .as_ref()
            .ok_or_else(|| StrataError::invalid_state("reserve_batch has not been called"))
    }

    fn io_mut(&mut self) -> StrataResult<&mut IoBuffers> {
        self.io
            .as_mut()
            .ok_or_else(|| StrataError::invalid_state("reserve_batch has not been called"))
    }

    /// Loads a batch of `count` examples, example-major
    /// (`count × input_size`), and sets the batch width to `count`.
    ///
    /// `count` may vary call-to-call but never past the reserved
    /// capacity.
    pub fn load_input(&mut self, batch: &[f32], count: usize) -> StrataResult<()> {
        let device = self.device.clone();
        let io = self.io_mut()?;
        if count == 0 {
            return Err(StrataError::InvalidDimension("count"));
        }
        if count > io.capacity {
            return Err(StrataError::batch_too_large(count, io.capacity));
        }
        if batch.len() != count * io.input_size {
            return Err(StrataError::shape_mismatch(
                &[count, io.input_size],
                &[batch.len()],
            ));
        }
        io.x_t.push_slice(batch)?;
        device
            .backend()
            .transpose(io.x_t.device().id(), io.x.device().id(), count, io.input_size)?;
        io.x.mark_host_stale();
        self.mini_batch = count;
        if log::log_enabled!(log::Level::Trace) {
            let io = self.io_mut()?;
            let in_size = io.input_size;
            let data = io.x.pull()?;
            log::trace!(
                "input x ({in_size}x{count}):\n{}",
                format_matrix(data, in_size, count)
            );
        }
        Ok(())
    }

    /// Loads the target batch for the current batch width, example-major
    /// (`mini_batch × output_size`).
    pub fn load_target(&mut self, batch: &[f32]) -> StrataResult<()> {
        let device = self.device.clone();
        let count = self.mini_batch;
        let io = self.io_mut()?;
        if batch.len() != count * io.output_size {
            return Err(StrataError::shape_mismatch(
                &[count, io.output_size],
                &[batch.len()],
            ));
        }
        io.y_t.push_slice(batch)?;
        device.backend().transpose(
            io.y_t.device().id(),
            io.y.device().id(),
            count,
            io.output_size,
        )?;
        io.y.mark_host_stale();
        if log::log_enabled!(log::Level::Trace) {
            let io = self.io_mut()?;
            let out_size = io.output_size;
            let data = io.y.pull()?;
            log::trace!(
                "target y ({out_size}x{count}):\n{}",
                format_matrix(data, out_size, count)
            );
        }
        Ok(())
    }

    /// Runs the forward pass over the loaded batch.
    ///
    /// After it returns, the last layer's activated output holds the
    /// prediction. A kernel failure aborts the pass; intermediate layer
    /// state is then unspecified.
    pub fn forward(&mut self) -> StrataResult<()> {
        let device = self.device.clone();
        let batch = self.mini_batch;
        let mut activation = self.io()?.x.device().id();

        for i in 0..self.layers.len() {
            let (weights, bias, out_size, in_size) = {
                let layer = &self.layers[i];
                (
                    layer.weights.device().id(),
                    layer.bias.device().id(),
                    layer.output_size(),
                    layer.input_size(),
                )
            };
            let (output, activated) = {
                let lb = self.layers[i].batch()?;
                (lb.output.device().id(), lb.activated.device().id())
            };

            device
                .backend()
                .linear(activation, weights, bias, output, out_size, in_size, batch)?;
            device.backend().sigmoid(output, activated, out_size, batch)?;

            let lb = self.layers[i].batch_mut()?;
            lb.output.mark_host_stale();
            lb.activated.mark_host_stale();
            if log::log_enabled!(log::Level::Trace) {
                let data = lb.activated.pull()?;
                log::trace!(
                    "layer {i} activated ({out_size}x{batch}):\n{}",
                    format_matrix(data, out_size, batch)
                );
            }

            activation = self.layers[i].batch()?.activated.device().id();
        }
        Ok(())
    }

    /// Applies the configured loss elementwise between the prediction
    /// and the loaded target and returns the scalar sum over batch and
    /// output dimensions.
    pub fn cost(&mut self) -> StrataResult<f32> {
        let device = self.device.clone();
        let batch = self.mini_batch;
        let loss = self.loss;
        let last = self
            .layers
            .last()
            .ok_or_else(|| StrataError::invalid_state("network has no layers"))?;
        let out_size = last.output_size();
        let prediction = last.batch()?.activated.device().id();
        let io = self.io_mut()?;

        device.backend().loss(
            prediction,
            io.y.device().id(),
            io.cost.device().id(),
            out_size,
            batch,
            loss,
        )?;
        io.cost.mark_host_stale();
        let values = io.cost.pull()?;
        let total = values[..out_size * batch].iter().sum();
        log::debug!("batch cost {total}");
        Ok(total)
    }

    /// Computes the elementwise loss derivative into the shared
    /// cost-derivative buffer, left on the device. Seeds
    /// [`backward`](Self::backward).
    pub fn cost_derivative(&mut self) -> StrataResult<()> {
        let device = self.device.clone();
        let batch = self.mini_batch;
        let loss = self.loss;
        let last = self
            .layers
            .last()
            .ok_or_else(|| StrataError::invalid_state("network has no layers"))?;
        let out_size = last.output_size();
        let prediction = last.batch()?.activated.device().id();
        let io = self.io_mut()?;

        device.backend().loss_derivative(
            prediction,
            io.y.device().id(),
            io.cost_derivative.device().id(),
            out_size,
            batch,
            loss,
        )?;
        io.cost_derivative.mark_host_stale();
        Ok(())
    }

    /// Runs the backward pass, traversing layers tail to head.
    ///
    /// Requires [`cost_derivative`](Self::cost_derivative) for the
    /// current batch. Gradients are overwritten, not accumulated.
    pub fn backward(&mut self) -> StrataResult<()> {
        let device = self.device.clone();
        let batch = self.mini_batch;
        let last = match self.layers.len().checked_sub(1) {
            Some(last) => last,
            None => return Err(StrataError::invalid_state("network has no layers")),
        };
        // Last layer: its delta is the cost derivative itself (the
        // loss/sigmoid combination folds the sigma' factor away), bias
        // gradient is the delta, weight gradient multiplies against the
        // transposed input activation.
        {
            let out_size = self.layers[last].output_size();
            let in_size = self.layers[last].input_size();
            let elems = out_size * batch;
            {
                let lb = self.layers[last].batch()?;
                lb.delta.device().copy_from(self.io()?.cost_derivative.device(), elems)?;
                lb.bias_grad.device().copy_from(lb.delta.device(), elems)?;
            }
            let act_t = self.input_activation_transposed(last, batch)?;
            let (delta, weight_grad) = {
                let lb = self.layers[last].batch()?;
                (lb.delta.device().id(), self.layers[last].weight_grad.device().id())
            };
            device
                .backend()
                .weight_gradient(delta, act_t, weight_grad, out_size, batch, in_size)?;
            let layer = &mut self.layers[last];
            layer.weight_grad.mark_host_stale();
            let lb = layer.batch_mut()?;
            lb.delta.mark_host_stale();
            lb.bias_grad.mark_host_stale();
        }

        // Earlier layers, walking toward the head. Each consumes its
        // successor's weights and delta, both already final.
        for i in (0..last).rev() {
            let out_size = self.layers[i].output_size();
            let in_size = self.layers[i].input_size();
            let next_out = self.layers[i + 1].output_size();
            let next_in = self.layers[i + 1].input_size();

            let (activated, sp) = {
                let lb = self.layers[i].batch()?;
                (lb.activated.device().id(), lb.activated_prime.device().id())
            };
            device.backend().sigmoid_prime(activated, sp, out_size, batch)?;

            let (next_weights, next_weights_t, next_delta) = {
                let next = &self.layers[i + 1];
                (
                    next.weights.device().id(),
                    next.weights_t.device().id(),
                    next.batch()?.delta.device().id(),
                )
            };
            device
                .backend()
                .transpose(next_weights, next_weights_t, next_out, next_in)?;

            let delta = self.layers[i].batch()?.delta.device().id();
            device
                .backend()
                .backprop_delta(next_weights_t, next_delta, sp, delta, out_size, next_out, batch)?;

            {
                let lb = self.layers[i].batch()?;
                lb.bias_grad.device().copy_from(lb.delta.device(), out_size * batch)?;
            }

            let act_t = self.input_activation_transposed(i, batch)?;
            let weight_grad = self.layers[i].weight_grad.device().id();
            device
                .backend()
                .weight_gradient(delta, act_t, weight_grad, out_size, batch, in_size)?;

            self.layers[i + 1].weights_t.mark_host_stale();
            let layer = &mut self.layers[i];
            layer.weight_grad.mark_host_stale();
            let lb = layer.batch_mut()?;
            lb.activated_prime.mark_host_stale();
            lb.delta.mark_host_stale();
            lb.bias_grad.mark_host_stale();
        }
        Ok(())
    }

    /// Device id of layer `i`'s input activation, transposed to
    /// `batch × input_size`.
    ///
    /// The head layer's input is the network's external input buffer,
    /// whose example-major staging is already that transpose; every
    /// other layer transposes its predecessor's activated output here.
    fn input_activation_transposed(
        &mut self,
        i: usize,
        batch: usize,
    ) -> StrataResult<crate::device::BufferId> {
        if i == 0 {
            return Ok(self.io()?.x_t.device().id());
        }
        let device = self.device.clone();
        let prev_out = self.layers[i - 1].output_size();
        let (activated, activated_t) = {
            let lb = self.layers[i - 1].batch()?;
            (lb.activated.device().id(), lb.activated_t.device().id())
        };
        device.backend().transpose(activated, activated_t, prev_out, batch)?;
        self.layers[i - 1].batch_mut()?.activated_t.mark_host_stale();
        Ok(activated_t)
    }

    /// Applies one SGD step with weight decay across every layer.
    ///
    /// `weights -= lr · grad + lr · decay · weights`; the bias kernel
    /// reduces its per-example gradient over the batch internally. Marks
    /// the weight host mirrors stale for
    /// [`weight_penalty`](Self::weight_penalty).
    pub fn update(&mut self, learning_rate: f32, weight_decay: f32) -> StrataResult<()> {
        let device = self.device.clone();
        let batch = self.mini_batch;
        for layer in &mut self.layers {
            let rows = layer.output_size();
            let cols = layer.input_size();
            device.backend().update_weights(
                learning_rate,
                weight_decay,
                layer.weights.device().id(),
                layer.weight_grad.device().id(),
                rows,
                cols,
            )?;
            let bias_grad = layer.batch()?.bias_grad.device().id();
            device
                .backend()
                .update_biases(learning_rate, layer.bias.device().id(), bias_grad, rows, batch)?;
            layer.weights.mark_host_stale();
            layer.bias.mark_host_stale();
        }
        Ok(())
    }

    /// Zeroes every layer's weight and bias gradient buffers.
    ///
    /// Gradients are overwritten within one backward pass; the reset
    /// guarantees no stale values survive a batch-width change.
    pub fn reset_gradients(&mut self) -> StrataResult<()> {
        for layer in &mut self.layers {
            layer.reset_gradients()?;
        }
        Ok(())
    }

    /// Sum of squared weights across all layers.
    ///
    /// A layer's host mirror is refreshed only when its staleness flag
    /// says the device copy has moved since the last read.
    pub fn weight_penalty(&mut self) -> StrataResult<f32> {
        let mut total = 0.0;
        for layer in &mut self.layers {
            if layer.weights.host_stale() {
                layer.weights.pull()?;
            }
            total += sum_of_squares(layer.weights.host());
        }
        Ok(total)
    }

    /// Row-major copy of a layer's weights (`output_size × input_size`).
    pub fn layer_weights(&mut self, index: usize) -> StrataResult<Vec<f32>> {
        let layers = self.layers.len();
        let layer = self
            .layers
            .get_mut(index)
            .ok_or_else(|| StrataError::layer_index(index, layers))?;
        if layer.weights.host_stale() {
            layer.weights.pull()?;
        }
        Ok(layer.weights.host().to_vec())
    }

    /// Copy of a layer's bias vector (`output_size` elements).
    pub fn layer_biases(&mut self, index: usize) -> StrataResult<Vec<f32>> {
        let layers = self.layers.len();
        let layer = self
            .layers
            .get_mut(index)
            .ok_or_else(|| StrataError::layer_index(index, layers))?;
        if layer.bias.host_stale() {
            layer.bias.pull()?;
        }
        Ok(layer.bias.host().to_vec())
    }

    /// The last layer's activated output for the current batch,
    /// feature-major (`output_size × mini_batch`).
    pub fn last_output(&mut self) -> StrataResult<Vec<f32>> {
        let batch = self.mini_batch;
        let last = self
            .layers
            .last_mut()
            .ok_or_else(|| StrataError::invalid_state("network has no layers"))?;
        let out_size = last.output_size();
        let data = last.batch_mut()?.activated.pull()?;
        Ok(data[..out_size * batch].to_vec())
    }

}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("layers", &self.layers.len())
            .field("loss", &self.loss)
            .field("mini_batch", &self.mini_batch)
            .field("reserved", &self.io.as_ref().map(|io| io.capacity))
            .finish()
    }
}

/// Σ v² with eight-lane accumulation.
fn sum_of_squares(v: &[f32]) -> f32 {
    let mut acc = f32x8::splat(0.0);
    let mut chunks = v.chunks_exact(8);
    for chunk in chunks.by_ref() {
        let x = f32x8::new([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
        ]);
        acc += x * x;
    }
    let lanes: [f32; 8] = acc.into();
    let mut total: f32 = lanes.iter().sum();
    for v in chunks.remainder() {
        total += v * v;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_layer_network() -> Network {
        let mut net = Network::new(Device::reference());
        net.append_layer(2, 3, &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], &[0.0; 3])
            .unwrap();
        net.append_layer(3, 1, &[0.5, -0.5, 0.25], &[0.1]).unwrap();
        net
    }

    #[test]
    fn test_append_rejects_chain_mismatch() {
        let mut net = Network::new(Device::reference());
        net.append_layer(2, 3, &[0.0; 6], &[0.0; 3]).unwrap();
        let err = net.append_layer(4, 1, &[0.0; 4], &[0.0; 1]).unwrap_err();
        assert!(matches!(err, StrataError::ShapeMismatch { .. }));
        assert_eq!(net.num_layers(), 1);
    }

    #[test]
    fn test_append_rejected_after_reserve() {
        let mut net = two_layer_network();
        net.reserve_batch(2).unwrap();
        let err = net.append_layer(1, 1, &[0.0], &[0.0]).unwrap_err();
        assert!(matches!(err, StrataError::InvalidState(_)));
    }

    #[test]
    fn test_forward_requires_reserve() {
        let mut net = two_layer_network();
        assert!(matches!(net.forward(), Err(StrataError::InvalidState(_))));
    }

    #[test]
    fn test_load_input_bounds_check() {
        let mut net = two_layer_network();
        net.reserve_batch(2).unwrap();
        let err = net.load_input(&[0.0; 6], 3).unwrap_err();
        assert!(matches!(err, StrataError::BatchTooLarge(3, 2)));
    }

    #[test]
    fn test_load_input_shape_check() {
        let mut net = two_layer_network();
        net.reserve_batch(2).unwrap();
        assert!(net.load_input(&[0.0; 3], 2).is_err());
    }

    #[test]
    fn test_batch_width_can_shrink_within_capacity() {
        let mut net = two_layer_network();
        net.reserve_batch(4).unwrap();
        net.load_input(&[0.1, 0.2, 0.3, 0.4], 2).unwrap();
        assert_eq!(net.mini_batch_size(), 2);
        net.load_input(&[0.5, 0.6], 1).unwrap();
        assert_eq!(net.mini_batch_size(), 1);
    }

    #[test]
    fn test_weight_penalty_uses_staleness() {
        let mut net = two_layer_network();
        net.reserve_batch(1).unwrap();
        let before = net.weight_penalty().unwrap();
        let expected: f32 = [0.1f32, 0.2, 0.3, 0.4, 0.5, 0.6, 0.5, -0.5, 0.25]
            .iter()
            .map(|w| w * w)
            .sum();
        assert!((before - expected).abs() < 1e-6);

        net.load_input(&[1.0, 0.5], 1).unwrap();
        net.load_target(&[1.0]).unwrap();
        net.forward().unwrap();
        net.cost_derivative().unwrap();
        net.backward().unwrap();
        net.update(0.5, 0.0).unwrap();
        let after = net.weight_penalty().unwrap();
        assert_ne!(before, after, "update must be visible through the pull");
    }

    #[test]
    fn test_layer_weights_index_bounds() {
        let mut net = two_layer_network();
        assert!(matches!(
            net.layer_weights(2),
            Err(StrataError::LayerIndexOutOfBounds { index: 2, layers: 2 })
        ));
    }

    #[test]
    fn test_sum_of_squares_matches_scalar() {
        let v: Vec<f32> = (0..19).map(|i| i as f32 * 0.25).collect();
        let scalar: f32 = v.iter().map(|x| x * x).sum();
        assert!((sum_of_squares(&v) - scalar).abs() < 1e-4);
    }
}
