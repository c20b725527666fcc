//! Trainable building blocks with explicit forward and backward passes.
//!
//! Rows are nodes, columns are channels. Every layer caches what its backward
//! pass needs in a plain struct returned from `forward_train`; gradients are
//! accumulated into [`Param::grad`] and cleared with `zero_grad`.

use crate::aggregate::{build_aggregator, Adjacency, AggregationCache, NeighborAggregator};
use crate::config::AggregatorKind;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::Rng;

/// A trainable tensor and its accumulated gradient
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub value: DMatrix<f32>,
    pub grad: DMatrix<f32>,
}

impl Param {
    pub fn new(value: DMatrix<f32>) -> Self {
        let grad = DMatrix::zeros(value.nrows(), value.ncols());
        Self { value, grad }
    }

    /// Uniform in `[-bound, bound]`
    pub fn uniform(rows: usize, cols: usize, bound: f32, rng: &mut StdRng) -> Self {
        let value = DMatrix::from_fn(rows, cols, |_, _| rng.gen_range(-bound..=bound));
        Self::new(value)
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Adds a `1 x C` row to every row of `m`
fn add_row(m: &mut DMatrix<f32>, row: &DMatrix<f32>) {
    for (c, mut column) in m.column_iter_mut().enumerate() {
        let b = row[(0, c)];
        for v in column.iter_mut() {
            *v += b;
        }
    }
}

/// Accumulates column sums of `m` into a `1 x C` gradient
fn accumulate_column_sums(target: &mut DMatrix<f32>, m: &DMatrix<f32>) {
    for (c, column) in m.column_iter().enumerate() {
        target[(0, c)] += column.sum();
    }
}

// ============================================================================
// Linear
// ============================================================================

/// `y = x W + b`, `W` is `in x out`
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Param,
    pub bias: Option<Param>,
}

impl Linear {
    /// Weights and bias drawn from `U(-1/sqrt(in), 1/sqrt(in))`
    pub fn new(in_dim: usize, out_dim: usize, with_bias: bool, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (in_dim.max(1) as f32).sqrt();
        let weight = Param::uniform(in_dim, out_dim, bound, rng);
        let bias = with_bias.then(|| Param::uniform(1, out_dim, bound, rng));
        Self { weight, bias }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.value.nrows()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.value.ncols()
    }

    pub fn forward(&self, x: &DMatrix<f32>) -> DMatrix<f32> {
        let mut out = x * &self.weight.value;
        if let Some(bias) = &self.bias {
            add_row(&mut out, &bias.value);
        }
        out
    }

    /// Accumulate parameter gradients for input `x`; returns the gradient w.r.t. `x`
    pub fn backward(&mut self, x: &DMatrix<f32>, grad_out: &DMatrix<f32>) -> DMatrix<f32> {
        self.weight.grad += x.tr_mul(grad_out);
        if let Some(bias) = &mut self.bias {
            accumulate_column_sums(&mut bias.grad, grad_out);
        }
        grad_out * self.weight.value.transpose()
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = vec![&mut self.weight];
        if let Some(bias) = &mut self.bias {
            params.push(bias);
        }
        params
    }
}

// ============================================================================
// Message passing
// ============================================================================

/// One neighborhood-aggregation layer:
/// `y_i = W_self x_i + W_neigh AGG({x_j : j -> i}) + b`
#[derive(Debug)]
pub struct SageConv {
    pub lin_self: Linear,
    pub lin_neigh: Linear,
    aggregator: Box<dyn NeighborAggregator>,
}

#[derive(Debug, Clone)]
pub struct SageCache {
    input: DMatrix<f32>,
    aggregated: DMatrix<f32>,
    aggregation: AggregationCache,
}

impl SageConv {
    pub fn new(in_dim: usize, out_dim: usize, kind: AggregatorKind, rng: &mut StdRng) -> Self {
        Self {
            lin_neigh: Linear::new(in_dim, out_dim, true, rng),
            lin_self: Linear::new(in_dim, out_dim, false, rng),
            aggregator: build_aggregator(kind),
        }
    }

    pub fn aggregator_kind(&self) -> AggregatorKind {
        self.aggregator.kind()
    }

    pub fn forward(&self, adjacency: &Adjacency, x: &DMatrix<f32>) -> DMatrix<f32> {
        self.forward_train(adjacency, x).0
    }

    pub fn forward_train(&self, adjacency: &Adjacency, x: &DMatrix<f32>) -> (DMatrix<f32>, SageCache) {
        let (aggregated, aggregation) = self.aggregator.forward(adjacency, x);
        let out = self.lin_neigh.forward(&aggregated) + self.lin_self.forward(x);
        let cache = SageCache {
            input: x.clone(),
            aggregated,
            aggregation,
        };
        (out, cache)
    }

    pub fn backward(&mut self, adjacency: &Adjacency, cache: &SageCache, grad_out: &DMatrix<f32>) -> DMatrix<f32> {
        let grad_aggregated = self.lin_neigh.backward(&cache.aggregated, grad_out);
        let grad_self = self.lin_self.backward(&cache.input, grad_out);
        grad_self + self.aggregator.backward(adjacency, &grad_aggregated, &cache.aggregation)
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.lin_self.params_mut();
        params.extend(self.lin_neigh.params_mut());
        params
    }
}

// ============================================================================
// Batch normalization
// ============================================================================

/// Per-channel normalization over all nodes with learned scale and shift.
/// Running statistics are tracked in training and used in inference.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub gamma: Param,
    pub beta: Param,
    pub running_mean: DMatrix<f32>,
    pub running_var: DMatrix<f32>,
    momentum: f32,
    eps: f32,
}

#[derive(Debug, Clone)]
pub struct BatchNormCache {
    normalized: DMatrix<f32>,
    inv_std: Vec<f32>,
}

impl BatchNorm {
    pub fn new(channels: usize) -> Self {
        Self {
            gamma: Param::new(DMatrix::from_element(1, channels, 1.0)),
            beta: Param::new(DMatrix::zeros(1, channels)),
            running_mean: DMatrix::zeros(1, channels),
            running_var: DMatrix::from_element(1, channels, 1.0),
            momentum: 0.1,
            eps: 1e-5,
        }
    }

    pub fn channels(&self) -> usize {
        self.gamma.value.ncols()
    }

    /// Normalize with batch statistics and update the running estimates
    pub fn forward_train(&mut self, x: &DMatrix<f32>) -> (DMatrix<f32>, BatchNormCache) {
        let n = x.nrows();
        let mut normalized = x.clone();
        let mut inv_std = vec![0.0; x.ncols()];
        if n == 0 {
            return (normalized, BatchNormCache { normalized: x.clone(), inv_std });
        }

        for (c, mut column) in normalized.column_iter_mut().enumerate() {
            let mean = column.sum() / n as f32;
            let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n as f32;
            let istd = 1.0 / (var + self.eps).sqrt();
            for v in column.iter_mut() {
                *v = (*v - mean) * istd;
            }
            inv_std[c] = istd;

            let unbiased = if n > 1 { var * n as f32 / (n - 1) as f32 } else { var };
            self.running_mean[(0, c)] = (1.0 - self.momentum) * self.running_mean[(0, c)] + self.momentum * mean;
            self.running_var[(0, c)] = (1.0 - self.momentum) * self.running_var[(0, c)] + self.momentum * unbiased;
        }

        let out = self.scale_shift(&normalized);
        (out, BatchNormCache { normalized, inv_std })
    }

    /// Normalize with the running statistics
    pub fn forward(&self, x: &DMatrix<f32>) -> DMatrix<f32> {
        let mut normalized = x.clone();
        for (c, mut column) in normalized.column_iter_mut().enumerate() {
            let mean = self.running_mean[(0, c)];
            let istd = 1.0 / (self.running_var[(0, c)] + self.eps).sqrt();
            for v in column.iter_mut() {
                *v = (*v - mean) * istd;
            }
        }
        self.scale_shift(&normalized)
    }

    fn scale_shift(&self, normalized: &DMatrix<f32>) -> DMatrix<f32> {
        let mut out = normalized.clone();
        for (c, mut column) in out.column_iter_mut().enumerate() {
            let g = self.gamma.value[(0, c)];
            let b = self.beta.value[(0, c)];
            for v in column.iter_mut() {
                *v = *v * g + b;
            }
        }
        out
    }

    pub fn backward(&mut self, cache: &BatchNormCache, grad_out: &DMatrix<f32>) -> DMatrix<f32> {
        let n = grad_out.nrows();
        let mut grad_in = DMatrix::<f32>::zeros(n, grad_out.ncols());
        if n == 0 {
            return grad_in;
        }
        let nf = n as f32;

        for c in 0..grad_out.ncols() {
            let dy = grad_out.column(c);
            let xhat = cache.normalized.column(c);
            let g = self.gamma.value[(0, c)];

            let sum_dy: f32 = dy.sum();
            let sum_dy_xhat: f32 = dy.iter().zip(xhat.iter()).map(|(d, x)| d * x).sum();
            self.gamma.grad[(0, c)] += sum_dy_xhat;
            self.beta.grad[(0, c)] += sum_dy;

            // dxhat = dy * gamma, so the sums scale by gamma as well
            let scale = g * cache.inv_std[c] / nf;
            let mut dx = grad_in.column_mut(c);
            for r in 0..n {
                dx[r] = scale * (nf * dy[r] - sum_dy - xhat[r] * sum_dy_xhat);
            }
        }
        grad_in
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

// ============================================================================
// Activations
// ============================================================================

pub fn relu(x: &DMatrix<f32>) -> DMatrix<f32> {
    x.map(|v| v.max(0.0))
}

/// Gradient through ReLU given the activation's output
pub fn relu_backward(output: &DMatrix<f32>, grad_out: &DMatrix<f32>) -> DMatrix<f32> {
    grad_out.zip_map(output, |g, y| if y > 0.0 { g } else { 0.0 })
}

/// Inverted dropout: kept units are scaled by `1 / (1 - p)`. Returns the output
/// and the multiplicative mask for the backward pass.
pub fn dropout(x: &DMatrix<f32>, p: f32, rng: &mut StdRng) -> (DMatrix<f32>, DMatrix<f32>) {
    if p <= 0.0 {
        return (x.clone(), DMatrix::from_element(x.nrows(), x.ncols(), 1.0));
    }
    let keep = 1.0 / (1.0 - p);
    let mask = DMatrix::from_fn(x.nrows(), x.ncols(), |_, _| {
        if rng.gen::<f32>() < p {
            0.0
        } else {
            keep
        }
    });
    (x.component_mul(&mask), mask)
}

/// Row-wise softmax, shifted by the row max for stability
pub fn softmax_rows(logits: &DMatrix<f32>) -> DMatrix<f32> {
    let mut probs = logits.clone();
    for r in 0..probs.nrows() {
        let mut row = probs.row_mut(r);
        let max = row.max();
        row.apply(|v| *v = (*v - max).exp());
        let total = row.sum();
        row.apply(|v| *v /= total);
    }
    probs
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_linear_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut linear = Linear::new(3, 2, true, &mut rng);
        let x = DMatrix::from_row_slice(2, 3, &[0.5, -1.0, 2.0, 1.5, 0.0, -0.5]);
        // loss = sum(y)
        let ones = DMatrix::from_element(2, 2, 1.0);
        linear.backward(&x, &ones);

        let h = 1e-2;
        let base = linear.forward(&x).sum();
        linear.weight.value[(1, 0)] += h;
        let bumped = linear.forward(&x).sum();
        let numeric = (bumped - base) / h;
        assert!((numeric - linear.weight.grad[(1, 0)]).abs() < 1e-2);
        assert!((linear.bias.as_ref().unwrap().grad[(0, 1)] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_batchnorm_train_output_is_standardized() {
        let mut bn = BatchNorm::new(2);
        let x = DMatrix::from_row_slice(4, 2, &[1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0]);
        let (y, _) = bn.forward_train(&x);
        for c in 0..2 {
            let col = y.column(c);
            let mean = col.sum() / 4.0;
            let var = col.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
        // running mean moved 10% toward the batch mean
        assert!((bn.running_mean[(0, 0)] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_batchnorm_backward_matches_finite_difference() {
        let mut bn = BatchNorm::new(1);
        bn.gamma.value[(0, 0)] = 1.7;
        let x = DMatrix::from_row_slice(4, 1, &[0.3, -1.2, 2.5, 0.9]);
        let w = DMatrix::from_row_slice(4, 1, &[1.0, -2.0, 0.5, 3.0]);
        let loss = |bn: &BatchNorm, x: &DMatrix<f32>| bn.clone().forward_train(x).0.component_mul(&w).sum();

        let (_, cache) = bn.forward_train(&x);
        let grad = bn.backward(&cache, &w);

        let h = 1e-2;
        for r in 0..4 {
            let mut xp = x.clone();
            xp[(r, 0)] += h;
            let mut xm = x.clone();
            xm[(r, 0)] -= h;
            let numeric = (loss(&bn, &xp) - loss(&bn, &xm)) / (2.0 * h);
            assert!((numeric - grad[(r, 0)]).abs() < 2e-2, "row {}: {} vs {}", r, numeric, grad[(r, 0)]);
        }
    }

    #[test]
    fn test_dropout_scales_kept_units() {
        let mut rng = StdRng::seed_from_u64(9);
        let x = DMatrix::from_element(50, 4, 1.0);
        let (y, mask) = dropout(&x, 0.5, &mut rng);
        for (v, m) in y.iter().zip(mask.iter()) {
            assert!(*v == 0.0 || (*v - 2.0).abs() < 1e-6);
            assert_eq!(v, m);
        }
        let (same, _) = dropout(&x, 0.0, &mut rng);
        assert_eq!(same, x);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let logits = DMatrix::from_row_slice(2, 2, &[1000.0, 1000.0, -3.0, 2.0]);
        let probs = softmax_rows(&logits);
        for r in 0..2 {
            assert!((probs.row(r).sum() - 1.0).abs() < 1e-6);
        }
        assert!((probs[(0, 0)] - 0.5).abs() < 1e-6);
        assert!(probs[(1, 1)] > probs[(1, 0)]);
    }

    #[test]
    fn test_sage_conv_shapes() {
        let mut rng = StdRng::seed_from_u64(1);
        let conv = SageConv::new(3, 5, AggregatorKind::Mean, &mut rng);
        let adjacency = Adjacency::from_edges(4, &[(0, 1), (1, 2)]);
        let x = DMatrix::from_element(4, 3, 0.5);
        let y = conv.forward(&adjacency, &x);
        assert_eq!(y.shape(), (4, 5));
    }
}
