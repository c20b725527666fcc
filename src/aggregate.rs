//! Neighborhood aggregation strategies for message passing.
//!
//! A node's neighborhood is its set of direct in-neighbors (`j -> i` edges carry
//! `j`'s representation to `i`). The aggregation choice encodes a domain
//! hypothesis: mean keeps fan-out/fan-in structure visible without letting hub
//! wallets dominate, sum and max are kept for experiments.

use crate::config::AggregatorKind;
use nalgebra::DMatrix;

/// Incoming edge lists in compressed form.
///
/// In-neighbors of node `i` are `in_sources[in_offsets[i]..in_offsets[i + 1]]`.
/// Multi-edges and self-loops are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Adjacency {
    num_nodes: usize,
    in_offsets: Vec<usize>,
    in_sources: Vec<usize>,
}

impl Adjacency {
    /// Build from `(source, target)` pairs. Every endpoint must be `< num_nodes`.
    pub fn from_edges(num_nodes: usize, edges: &[(usize, usize)]) -> Self {
        let (in_offsets, in_sources) = compress(num_nodes, edges.iter().map(|&(s, t)| (t, s)));
        Self {
            num_nodes,
            in_offsets,
            in_sources,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.in_sources.len()
    }

    pub fn in_neighbors(&self, node: usize) -> &[usize] {
        &self.in_sources[self.in_offsets[node]..self.in_offsets[node + 1]]
    }

    pub fn in_degree(&self, node: usize) -> usize {
        self.in_offsets[node + 1] - self.in_offsets[node]
    }
}

/// Group `(key, value)` pairs by key, preserving input order within a key
fn compress(num_nodes: usize, pairs: impl Iterator<Item = (usize, usize)> + Clone) -> (Vec<usize>, Vec<usize>) {
    let mut offsets = vec![0usize; num_nodes + 1];
    for (key, _) in pairs.clone() {
        offsets[key + 1] += 1;
    }
    for i in 0..num_nodes {
        offsets[i + 1] += offsets[i];
    }
    let mut cursor = offsets.clone();
    let mut values = vec![0usize; offsets[num_nodes]];
    for (key, value) in pairs {
        values[cursor[key]] = value;
        cursor[key] += 1;
    }
    (offsets, values)
}

/// State kept from the forward pass that the backward pass needs
#[derive(Debug, Clone, Default)]
pub struct AggregationCache {
    /// For max aggregation: winning in-neighbor per `(node, column)`, column-major
    argmax: Option<Vec<Option<usize>>>,
}

/// Uniform interface over aggregation strategies
pub trait NeighborAggregator: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> AggregatorKind;

    /// Summarize each node's in-neighbors. Nodes without in-neighbors get zeros.
    fn forward(&self, adjacency: &Adjacency, x: &DMatrix<f32>) -> (DMatrix<f32>, AggregationCache);

    /// Route the gradient w.r.t. the aggregate back to the input rows
    fn backward(&self, adjacency: &Adjacency, grad: &DMatrix<f32>, cache: &AggregationCache) -> DMatrix<f32>;
}

/// Instantiate the aggregator for a configured kind
pub fn build_aggregator(kind: AggregatorKind) -> Box<dyn NeighborAggregator> {
    match kind {
        AggregatorKind::Mean => Box::new(MeanAggregator),
        AggregatorKind::Sum => Box::new(SumAggregator),
        AggregatorKind::Max => Box::new(MaxAggregator),
    }
}

/// Scatter-add rows along edges: `out[i] = scale(i) * sum_{j -> i} x[j]`
fn scatter_in(adjacency: &Adjacency, x: &DMatrix<f32>, scale: impl Fn(usize) -> f32) -> DMatrix<f32> {
    let n = adjacency.num_nodes();
    let mut out = DMatrix::<f32>::zeros(n, x.ncols());
    for c in 0..x.ncols() {
        let src = x.column(c);
        let mut dst = out.column_mut(c);
        for i in 0..n {
            let neighbors = adjacency.in_neighbors(i);
            if neighbors.is_empty() {
                continue;
            }
            let total: f32 = neighbors.iter().map(|&j| src[j]).sum();
            dst[i] = total * scale(i);
        }
    }
    out
}

/// Transpose of [`scatter_in`]: `grad_x[j] += scale(i) * grad[i]` for each `j -> i`
fn gather_back(adjacency: &Adjacency, grad: &DMatrix<f32>, scale: impl Fn(usize) -> f32) -> DMatrix<f32> {
    let n = adjacency.num_nodes();
    let mut out = DMatrix::<f32>::zeros(n, grad.ncols());
    for c in 0..grad.ncols() {
        let g = grad.column(c);
        let mut dst = out.column_mut(c);
        for i in 0..n {
            let neighbors = adjacency.in_neighbors(i);
            if neighbors.is_empty() {
                continue;
            }
            let share = g[i] * scale(i);
            for &j in neighbors {
                dst[j] += share;
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanAggregator;

impl NeighborAggregator for MeanAggregator {
    fn kind(&self) -> AggregatorKind {
        AggregatorKind::Mean
    }

    fn forward(&self, adjacency: &Adjacency, x: &DMatrix<f32>) -> (DMatrix<f32>, AggregationCache) {
        let out = scatter_in(adjacency, x, |i| 1.0 / adjacency.in_degree(i) as f32);
        (out, AggregationCache::default())
    }

    fn backward(&self, adjacency: &Adjacency, grad: &DMatrix<f32>, _cache: &AggregationCache) -> DMatrix<f32> {
        gather_back(adjacency, grad, |i| 1.0 / adjacency.in_degree(i) as f32)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SumAggregator;

impl NeighborAggregator for SumAggregator {
    fn kind(&self) -> AggregatorKind {
        AggregatorKind::Sum
    }

    fn forward(&self, adjacency: &Adjacency, x: &DMatrix<f32>) -> (DMatrix<f32>, AggregationCache) {
        (scatter_in(adjacency, x, |_| 1.0), AggregationCache::default())
    }

    fn backward(&self, adjacency: &Adjacency, grad: &DMatrix<f32>, _cache: &AggregationCache) -> DMatrix<f32> {
        gather_back(adjacency, grad, |_| 1.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MaxAggregator;

impl NeighborAggregator for MaxAggregator {
    fn kind(&self) -> AggregatorKind {
        AggregatorKind::Max
    }

    fn forward(&self, adjacency: &Adjacency, x: &DMatrix<f32>) -> (DMatrix<f32>, AggregationCache) {
        let n = adjacency.num_nodes();
        let mut out = DMatrix::<f32>::zeros(n, x.ncols());
        let mut argmax = vec![None; n * x.ncols()];
        for c in 0..x.ncols() {
            for i in 0..n {
                let mut best: Option<(usize, f32)> = None;
                for &j in adjacency.in_neighbors(i) {
                    let v = x[(j, c)];
                    if best.map_or(true, |(_, b)| v > b) {
                        best = Some((j, v));
                    }
                }
                if let Some((j, v)) = best {
                    out[(i, c)] = v;
                    argmax[c * n + i] = Some(j);
                }
            }
        }
        (
            out,
            AggregationCache {
                argmax: Some(argmax),
            },
        )
    }

    fn backward(&self, adjacency: &Adjacency, grad: &DMatrix<f32>, cache: &AggregationCache) -> DMatrix<f32> {
        let n = adjacency.num_nodes();
        let mut out = DMatrix::<f32>::zeros(n, grad.ncols());
        let Some(argmax) = cache.argmax.as_ref() else {
            return out;
        };
        for c in 0..grad.ncols() {
            for i in 0..n {
                if let Some(j) = argmax[c * n + i] {
                    out[(j, c)] += grad[(i, c)];
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 0 -> 2, 1 -> 2, 2 -> 3, 3 -> 3
    fn sample() -> (Adjacency, DMatrix<f32>) {
        let adjacency = Adjacency::from_edges(4, &[(0, 2), (1, 2), (2, 3), (3, 3)]);
        let x = DMatrix::from_row_slice(4, 2, &[1.0, -1.0, 3.0, 5.0, 10.0, 0.0, -2.0, 4.0]);
        (adjacency, x)
    }

    #[test]
    fn test_adjacency_in_lists() {
        let (adjacency, _) = sample();
        assert_eq!(adjacency.num_edges(), 4);
        assert_eq!(adjacency.in_neighbors(2), &[0, 1]);
        assert_eq!(adjacency.in_degree(2), 2);
        assert_eq!(adjacency.in_neighbors(3), &[2, 3]);
        assert!(adjacency.in_neighbors(0).is_empty());
    }

    #[test]
    fn test_mean_aggregation() {
        let (adjacency, x) = sample();
        let (agg, _) = MeanAggregator.forward(&adjacency, &x);
        assert_eq!(agg[(0, 0)], 0.0);
        assert_eq!(agg[(2, 0)], 2.0);
        assert_eq!(agg[(2, 1)], 2.0);
        assert_eq!(agg[(3, 0)], 4.0);
    }

    #[test]
    fn test_sum_and_max_aggregation() {
        let (adjacency, x) = sample();
        let (sum, _) = SumAggregator.forward(&adjacency, &x);
        assert_eq!(sum[(2, 1)], 4.0);
        let (max, _) = MaxAggregator.forward(&adjacency, &x);
        assert_eq!(max[(2, 0)], 3.0);
        assert_eq!(max[(3, 1)], 4.0);
    }

    /// <backward(g), x> must equal <g, forward(x)> for the linear aggregators
    #[test]
    fn test_backward_is_adjoint() {
        let (adjacency, x) = sample();
        let g = DMatrix::from_row_slice(4, 2, &[0.5, 1.0, -1.0, 2.0, 0.25, -0.5, 3.0, 1.5]);
        for agg in [build_aggregator(AggregatorKind::Mean), build_aggregator(AggregatorKind::Sum)] {
            let (fx, cache) = agg.forward(&adjacency, &x);
            let bg = agg.backward(&adjacency, &g, &cache);
            let lhs: f32 = g.component_mul(&fx).sum();
            let rhs: f32 = bg.component_mul(&x).sum();
            assert!((lhs - rhs).abs() < 1e-4, "{:?}: {} vs {}", agg.kind(), lhs, rhs);
        }
    }

    #[test]
    fn test_max_backward_routes_to_winner() {
        let (adjacency, x) = sample();
        let (_, cache) = MaxAggregator.forward(&adjacency, &x);
        let g = DMatrix::from_element(4, 2, 1.0);
        let back = MaxAggregator.backward(&adjacency, &g, &cache);
        // node 2 column 0: winner is node 1 (3.0 > 1.0)
        assert_eq!(back[(1, 0)], 1.0);
        assert_eq!(back[(0, 0)], 0.0);
    }
}
