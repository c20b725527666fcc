//! Per-wallet feature engineering.
//!
//! Six anti-obfuscation features are derived from the raw edge list:
//! - Degree (in/out): fan-in collectors and fan-out splitters stand out
//! - Inter-transaction time gaps: smurfing bursts are tightly clustered with low variance
//! - Outgoing amounts: split funds tend to be similar-sized chunks
//!
//! Statistics are accumulated in `f64`; the normalized matrix handed to the
//! classifier is `f32`.

use nalgebra::DMatrix;
use rayon::prelude::*;

/// Width of the feature matrix
pub const NUM_FEATURES: usize = 6;

/// Column order of the feature matrix
pub const FEATURE_NAMES: [&str; NUM_FEATURES] = [
    "in_degree",
    "out_degree",
    "time_delta_mean_hours",
    "time_delta_std_hours",
    "amount_mean",
    "amount_std",
];

/// Divisor floor for column normalization
const STD_EPS: f64 = 1e-8;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Directed transfer between two indexed wallets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransactionEdge {
    pub source: usize,
    pub target: usize,
    pub amount: f64,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
}

/// Raw (un-normalized) feature columns, one entry per wallet index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeFeatures {
    pub in_degree: Vec<f64>,
    pub out_degree: Vec<f64>,
    pub time_delta_mean: Vec<f64>,
    pub time_delta_std: Vec<f64>,
    pub amount_mean: Vec<f64>,
    pub amount_std: Vec<f64>,
}

impl NodeFeatures {
    pub fn num_nodes(&self) -> usize {
        self.in_degree.len()
    }

    /// Columns in [`FEATURE_NAMES`] order
    pub fn columns(&self) -> [&[f64]; NUM_FEATURES] {
        [
            &self.in_degree,
            &self.out_degree,
            &self.time_delta_mean,
            &self.time_delta_std,
            &self.amount_mean,
            &self.amount_std,
        ]
    }

    /// `in_degree + out_degree` per wallet
    pub fn combined_degree(&self) -> Vec<f64> {
        self.in_degree
            .iter()
            .zip(&self.out_degree)
            .map(|(i, o)| i + o)
            .collect()
    }

    /// Assemble the `num_nodes x 6` matrix, optionally z-scored column-wise
    pub fn to_matrix(&self, normalize: bool) -> DMatrix<f32> {
        let n = self.num_nodes();
        let mut matrix = DMatrix::<f64>::zeros(n, NUM_FEATURES);
        for (c, column) in self.columns().iter().enumerate() {
            matrix.column_mut(c).copy_from_slice(column);
        }
        if normalize {
            normalize_features(&mut matrix);
        }
        matrix.map(|v| v as f32)
    }
}

/// Count edges leaving and entering each wallet. Returns `(in_degree, out_degree)`.
pub fn calculate_degree_features(edges: &[TransactionEdge], num_nodes: usize) -> (Vec<f64>, Vec<f64>) {
    let mut in_degree = vec![0.0; num_nodes];
    let mut out_degree = vec![0.0; num_nodes];
    for edge in edges {
        out_degree[edge.source] += 1.0;
        in_degree[edge.target] += 1.0;
    }
    (in_degree, out_degree)
}

/// Edge indices grouped by source wallet, CSR layout: the outgoing edges of
/// wallet `w` are `order[offsets[w]..offsets[w + 1]]`.
fn group_outgoing(edges: &[TransactionEdge], num_nodes: usize) -> (Vec<usize>, Vec<usize>) {
    let mut offsets = vec![0usize; num_nodes + 1];
    for edge in edges {
        offsets[edge.source + 1] += 1;
    }
    for w in 0..num_nodes {
        offsets[w + 1] += offsets[w];
    }
    let mut cursor = offsets.clone();
    let mut order = vec![0usize; edges.len()];
    for (i, edge) in edges.iter().enumerate() {
        order[cursor[edge.source]] = i;
        cursor[edge.source] += 1;
    }
    (offsets, order)
}

/// Mean and population standard deviation. Empty input yields `(0, 0)`.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() == 1 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Gap statistics (hours) over each wallet's outgoing transactions sorted by time.
/// Returns `(mean, std)`; wallets with fewer than two outgoing transactions get zeros.
pub fn calculate_time_delta_features(edges: &[TransactionEdge], num_nodes: usize) -> (Vec<f64>, Vec<f64>) {
    let (offsets, order) = group_outgoing(edges, num_nodes);

    let stats: Vec<(f64, f64)> = (0..num_nodes)
        .into_par_iter()
        .map(|w| {
            let group = &order[offsets[w]..offsets[w + 1]];
            if group.len() < 2 {
                return (0.0, 0.0);
            }
            let mut timestamps: Vec<i64> = group.iter().map(|&i| edges[i].timestamp_ms).collect();
            timestamps.sort_unstable();
            let gaps: Vec<f64> = timestamps
                .windows(2)
                .map(|pair| (pair[1] - pair[0]) as f64 / MS_PER_HOUR)
                .collect();
            mean_std(&gaps)
        })
        .collect();

    stats.into_iter().unzip()
}

/// Outgoing amount statistics per wallet. Returns `(mean, std)`.
pub fn calculate_amount_features(edges: &[TransactionEdge], num_nodes: usize) -> (Vec<f64>, Vec<f64>) {
    let (offsets, order) = group_outgoing(edges, num_nodes);

    let stats: Vec<(f64, f64)> = (0..num_nodes)
        .into_par_iter()
        .map(|w| {
            let amounts: Vec<f64> = order[offsets[w]..offsets[w + 1]]
                .iter()
                .map(|&i| edges[i].amount)
                .collect();
            mean_std(&amounts)
        })
        .collect();

    stats.into_iter().unzip()
}

/// Compute all six raw feature columns
pub fn compute_node_features(edges: &[TransactionEdge], num_nodes: usize) -> NodeFeatures {
    let (in_degree, out_degree) = calculate_degree_features(edges, num_nodes);
    let (time_delta_mean, time_delta_std) = calculate_time_delta_features(edges, num_nodes);
    let (amount_mean, amount_std) = calculate_amount_features(edges, num_nodes);

    NodeFeatures {
        in_degree,
        out_degree,
        time_delta_mean,
        time_delta_std,
        amount_mean,
        amount_std,
    }
}

/// Column-wise z-score in place. Uses the sample standard deviation; a column whose
/// deviation is below [`STD_EPS`] is only centered (divisor floored to 1).
pub fn normalize_features(matrix: &mut DMatrix<f64>) {
    let n = matrix.nrows();
    if n == 0 {
        return;
    }
    for mut column in matrix.column_iter_mut() {
        let mean = column.iter().sum::<f64>() / n as f64;
        let std = if n > 1 {
            (column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
        } else {
            0.0
        };
        let divisor = if std < STD_EPS { 1.0 } else { std };
        for v in column.iter_mut() {
            *v = (*v - mean) / divisor;
        }
    }
}
