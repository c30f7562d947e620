//! Numerical gradient checking for the backward pass.
//!
//! For every weight position in every layer, the analytical gradient the
//! backward pass produces is compared against a central-difference
//! estimate: `grad_num = (C(w+h) - C(w-h)) / (2h)`.
//!
//! The cross-entropy loss is used throughout because, against a sigmoid
//! output layer, its derivative with respect to the pre-activation is
//! exactly `a - y` — which is the identity the backward pass seeds its
//! last-layer delta with. The analytical gradients are therefore exact,
//! and the comparison is limited only by f32 arithmetic.
//!
//! The analytical gradients are observed through the public API: one
//! update step with `learning_rate = 1` and no decay turns each weight's
//! gradient into `w_before - w_after`.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use strata::{Device, Loss, Network};

/// Central-difference step. 1e-2 keeps the cost difference well above
/// f32 rounding noise for these problem sizes.
const FD_STEP: f32 = 1e-2;

/// Maximum relative error for gradients of meaningful magnitude.
const MAX_RELATIVE_ERROR: f32 = 5e-2;

/// Below this magnitude, relative error is noise; absolute error is
/// checked instead.
const SMALL_GRAD_THRESHOLD: f32 = 1e-3;

/// Maximum absolute error for small gradients.
const MAX_ABSOLUTE_ERROR: f32 = 2e-4;

struct Setup {
    dims: Vec<(usize, usize)>,
    weights: Vec<Vec<f32>>,
    biases: Vec<Vec<f32>>,
    x: Vec<f32>,
    y: Vec<f32>,
    batch: usize,
}

fn make_setup(dims: &[(usize, usize)], batch: usize, seed: u64) -> Setup {
    let mut rng = SmallRng::seed_from_u64(seed);
    let weights = dims
        .iter()
        .map(|&(i, o)| (0..i * o).map(|_| rng.gen_range(-0.8..0.8)).collect())
        .collect();
    let biases = dims
        .iter()
        .map(|&(_, o)| (0..o).map(|_| rng.gen_range(-0.3..0.3)).collect())
        .collect();
    let input_size = dims[0].0;
    let output_size = dims[dims.len() - 1].1;
    let x = (0..batch * input_size).map(|_| rng.gen_range(-1.0..1.0)).collect();
    // Targets strictly inside (0, 1) keep the cross-entropy logs tame.
    let y = (0..batch * output_size).map(|_| rng.gen_range(0.1..0.9)).collect();
    Setup {
        dims: dims.to_vec(),
        weights,
        biases,
        x,
        y,
        batch,
    }
}

/// Builds the network for `setup`, optionally nudging one weight.
fn build(setup: &Setup, perturb: Option<(usize, usize, f32)>) -> Network {
    let mut net = Network::new(Device::reference());
    net.set_loss(Loss::CrossEntropy);
    for (layer, &(input_size, output_size)) in setup.dims.iter().enumerate() {
        let mut weights = setup.weights[layer].clone();
        if let Some((l, index, delta)) = perturb {
            if l == layer {
                weights[index] += delta;
            }
        }
        net.append_layer(input_size, output_size, &weights, &setup.biases[layer])
            .unwrap();
    }
    net.reserve_batch(setup.batch).unwrap();
    net.load_input(&setup.x, setup.batch).unwrap();
    net.load_target(&setup.y).unwrap();
    net
}

fn cost_of(setup: &Setup, perturb: Option<(usize, usize, f32)>) -> f32 {
    let mut net = build(setup, perturb);
    net.forward().unwrap();
    net.cost().unwrap()
}

/// Analytical weight gradients for every layer, extracted via a
/// unit-learning-rate update.
fn analytic_weight_gradients(setup: &Setup) -> Vec<Vec<f32>> {
    let mut net = build(setup, None);
    net.reset_gradients().unwrap();
    net.forward().unwrap();
    net.cost_derivative().unwrap();
    net.backward().unwrap();

    let before: Vec<Vec<f32>> = (0..setup.dims.len())
        .map(|l| net.layer_weights(l).unwrap())
        .collect();
    net.update(1.0, 0.0).unwrap();
    (0..setup.dims.len())
        .map(|l| {
            let after = net.layer_weights(l).unwrap();
            before[l]
                .iter()
                .zip(after.iter())
                .map(|(b, a)| b - a)
                .collect()
        })
        .collect()
}

fn gradient_check_passes(ana: f32, num: f32) -> bool {
    let abs_err = (ana - num).abs();
    let max_abs = ana.abs().max(num.abs());
    if max_abs < SMALL_GRAD_THRESHOLD {
        abs_err < MAX_ABSOLUTE_ERROR
    } else {
        abs_err / (ana.abs() + num.abs()) < MAX_RELATIVE_ERROR
    }
}

fn run_gradient_check(dims: &[(usize, usize)], batch: usize, seed: u64, label: &str) {
    let setup = make_setup(dims, batch, seed);
    let analytic = analytic_weight_gradients(&setup);

    for (layer, grads) in analytic.iter().enumerate() {
        for (index, &ana) in grads.iter().enumerate() {
            let up = cost_of(&setup, Some((layer, index, FD_STEP)));
            let down = cost_of(&setup, Some((layer, index, -FD_STEP)));
            let num = (up - down) / (2.0 * FD_STEP);
            assert!(
                gradient_check_passes(ana, num),
                "{label}: layer {layer} weight {index}: analytical {ana}, numerical {num}"
            );
        }
    }
}

#[test]
fn gradient_check_two_layer() {
    run_gradient_check(&[(2, 3), (3, 2)], 2, 42, "2-3-2");
}

#[test]
fn gradient_check_three_layer() {
    run_gradient_check(&[(2, 4), (4, 3), (3, 1)], 3, 7, "2-4-3-1");
}

#[test]
fn gradient_check_single_layer() {
    // The head layer is also the tail: its input activation is the
    // network input buffer, the substitution the backward pass makes
    // explicitly.
    run_gradient_check(&[(3, 2)], 2, 99, "3-2");
}
