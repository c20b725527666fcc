//! Post-hoc suspicion scoring and k-hop forensic drill-down.

use crate::config::ScoringConfig;
use crate::graph::TransactionGraph;
use crate::model::{ModelError, WalletClassifier};
use crate::schemas::{SuspicionRecord, COL_PREDICTED, COL_SCORE, COL_TRUE, COL_WALLET};
use petgraph::stable_graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::Direction::{Incoming, Outgoing};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Keeps the degree-anomaly ratio finite on edgeless graphs
const DEGREE_EPS: f64 = 1e-8;

#[derive(Error, Debug)]
pub enum ScoringError {
    #[error("Unknown wallet: {0}")]
    UnknownWallet(String),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Unsupported output format: {0:?}")]
    UnsupportedFormat(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Scores
// ============================================================================

/// Combined degree of each wallet over the graph's maximum combined degree, in [0, 1]
pub fn degree_anomaly(in_degree: &[f64], out_degree: &[f64]) -> Vec<f64> {
    let combined: Vec<f64> = in_degree.iter().zip(out_degree).map(|(i, o)| i + o).collect();
    let max = combined.iter().copied().fold(0.0, f64::max);
    combined.iter().map(|d| d / (max + DEGREE_EPS)).collect()
}

/// Raw probability plus a weighted anomaly term, clamped to [0, 1]
pub fn composite_score(probability: f32, anomaly: f64, weight: f32) -> f32 {
    (probability as f64 + weight as f64 * anomaly).clamp(0.0, 1.0) as f32
}

/// Suspicion score for every wallet. Without degree vectors this is the clamped
/// class-1 probability.
pub fn calculate_suspicion_score(
    probabilities: &[f32],
    degrees: Option<(&[f64], &[f64])>,
    weight: f32,
) -> Vec<f32> {
    match degrees {
        Some((in_degree, out_degree)) => probabilities
            .iter()
            .zip(degree_anomaly(in_degree, out_degree))
            .map(|(&p, anomaly)| composite_score(p, anomaly, weight))
            .collect(),
        None => probabilities.iter().map(|&p| p.clamp(0.0, 1.0)).collect(),
    }
}

/// One inference pass over the whole graph. Rows are sorted by descending score.
pub fn compute_suspicion_scores(
    model: &WalletClassifier,
    graph: &TransactionGraph,
    config: &ScoringConfig,
) -> Result<Vec<SuspicionRecord>, ScoringError> {
    let probs = model.predict_proba(graph.features(), graph.adjacency())?;
    let illicit: Vec<f32> = probs.column(1).iter().copied().collect();

    let raw = graph.raw_features();
    let degrees = config
        .use_degree_boost
        .then(|| (raw.in_degree.as_slice(), raw.out_degree.as_slice()));
    let scores = calculate_suspicion_score(&illicit, degrees, config.degree_weight);

    let mut records: Vec<SuspicionRecord> = graph
        .wallets()
        .ids()
        .iter()
        .zip(scores)
        .zip(graph.labels())
        .map(|((wallet_id, score), &label)| SuspicionRecord {
            wallet_id: wallet_id.clone(),
            suspicion_score: score,
            predicted_label: (score > config.threshold) as u8,
            true_label: label,
        })
        .collect();
    records.sort_by(|a, b| b.suspicion_score.total_cmp(&a.suspicion_score));

    let flagged = records.iter().filter(|r| r.predicted_label == 1).count();
    info!("Scored {} wallets, {} above threshold {}", records.len(), flagged, config.threshold);
    Ok(records)
}

/// Score a single wallet; unknown identities yield `None`
pub fn score_wallet(
    model: &WalletClassifier,
    graph: &TransactionGraph,
    config: &ScoringConfig,
    wallet_id: &str,
) -> Result<Option<SuspicionRecord>, ScoringError> {
    if graph.wallets().get(wallet_id).is_none() {
        warn!("{}", ScoringError::UnknownWallet(wallet_id.to_string()));
        return Ok(None);
    }
    let records = compute_suspicion_scores(model, graph, config)?;
    Ok(records.into_iter().find(|r| r.wallet_id == wallet_id))
}

pub fn scores_to_dataframe(records: &[SuspicionRecord]) -> PolarsResult<DataFrame> {
    let wallets: Vec<&str> = records.iter().map(|r| r.wallet_id.as_str()).collect();
    let scores: Vec<f32> = records.iter().map(|r| r.suspicion_score).collect();
    let predicted: Vec<i32> = records.iter().map(|r| r.predicted_label as i32).collect();
    let truth: Vec<i32> = records.iter().map(|r| r.true_label as i32).collect();

    DataFrame::new(vec![
        Column::new(COL_WALLET.into(), wallets),
        Column::new(COL_SCORE.into(), scores),
        Column::new(COL_PREDICTED.into(), predicted),
        Column::new(COL_TRUE.into(), truth),
    ])
}

/// Write the score table as CSV or Parquet, chosen by extension. Returns the row count.
pub fn write_scores(records: &[SuspicionRecord], path: &Path) -> Result<usize, ScoringError> {
    let mut df = scores_to_dataframe(records)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    match extension.as_deref() {
        Some("csv") => {
            let file = std::fs::File::create(path)?;
            CsvWriter::new(file).include_header(true).finish(&mut df)?;
        }
        Some("parquet") => {
            let file = std::fs::File::create(path)?;
            ParquetWriter::new(file)
                .with_compression(ParquetCompression::Zstd(None))
                .finish(&mut df)?;
        }
        _ => return Err(ScoringError::UnsupportedFormat(path.to_path_buf())),
    }

    info!("Wrote {} suspicion scores to {:?}", df.height(), path);
    Ok(df.height())
}

// ============================================================================
// k-hop subgraph
// ============================================================================

/// Induced neighborhood of a wallet, relabeled to a local index space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subgraph {
    pub center: String,
    pub hops: usize,
    /// Wallet ids in ascending global index order, center included
    pub nodes: Vec<String>,
    /// `(source, target)` pairs indexing into `nodes`
    pub local_edges: Vec<(usize, usize)>,
    /// Same edges by wallet id
    pub edges: Vec<(String, String)>,
    pub labels: BTreeMap<String, u8>,
}

impl Subgraph {
    pub fn empty(center: impl Into<String>) -> Self {
        Self {
            center: center.into(),
            hops: 0,
            nodes: Vec::new(),
            local_edges: Vec::new(),
            edges: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.local_edges.len()
    }

    /// Save as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ScoringError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ScoringError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Like [`extract_k_hop_subgraph`], but reports an unknown wallet as an error
pub fn try_extract_k_hop_subgraph(
    graph: &TransactionGraph,
    wallet_id: &str,
    hops: usize,
) -> Result<Subgraph, ScoringError> {
    let center = graph
        .wallets()
        .get(wallet_id)
        .ok_or_else(|| ScoringError::UnknownWallet(wallet_id.to_string()))?;
    let flow = graph.flow_graph();
    let n = graph.num_nodes();

    // breadth-first over both edge directions, one frontier per hop
    let mut visited = vec![false; n];
    visited[center] = true;
    let mut frontier = vec![NodeIndex::new(center)];
    let mut depth = 0;
    while depth < hops && !frontier.is_empty() {
        let mut next = Vec::new();
        for &node in &frontier {
            let neighbors = flow
                .neighbors_directed(node, Outgoing)
                .chain(flow.neighbors_directed(node, Incoming));
            for neighbor in neighbors {
                if !visited[neighbor.index()] {
                    visited[neighbor.index()] = true;
                    next.push(neighbor);
                }
            }
        }
        frontier = next;
        depth += 1;
    }

    let members: Vec<usize> = (0..n).filter(|&i| visited[i]).collect();
    let mut local = vec![None; n];
    for (l, &g) in members.iter().enumerate() {
        local[g] = Some(l);
    }

    let mut local_edges = Vec::new();
    for &source in &members {
        for edge in flow.edges_directed(NodeIndex::new(source), Outgoing) {
            if let (Some(s), Some(t)) = (local[source], local[edge.target().index()]) {
                local_edges.push((s, t));
            }
        }
    }
    local_edges.sort_unstable();

    let wallets = graph.wallets();
    let id = |i: usize| wallets.wallet(i).unwrap_or_default().to_string();
    let nodes: Vec<String> = members.iter().map(|&g| id(g)).collect();
    let edges = local_edges
        .iter()
        .map(|&(s, t)| (nodes[s].clone(), nodes[t].clone()))
        .collect();
    let labels = members
        .iter()
        .zip(&nodes)
        .map(|(&g, wallet)| (wallet.clone(), graph.labels()[g]))
        .collect();

    debug!(
        "{}-hop subgraph around {}: {} nodes, {} edges",
        hops,
        wallet_id,
        nodes.len(),
        local_edges.len()
    );

    Ok(Subgraph {
        center: wallet_id.to_string(),
        hops,
        nodes,
        local_edges,
        edges,
        labels,
    })
}

/// Nodes within `hops` edge traversals of `wallet_id` in either direction, with
/// every edge among them. An unknown wallet yields an empty subgraph.
pub fn extract_k_hop_subgraph(graph: &TransactionGraph, wallet_id: &str, hops: usize) -> Subgraph {
    match try_extract_k_hop_subgraph(graph, wallet_id, hops) {
        Ok(subgraph) => subgraph,
        Err(e) => {
            warn!("Subgraph extraction failed: {}", e);
            Subgraph::empty(wallet_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::graph::GraphBuilder;
    use crate::schemas::{LabelRecord, TransactionRecord};
    use chrono::{TimeZone, Utc};

    // a -> b -> c -> d, e -> b, c -> c, plus an unrelated pair x -> y
    fn sample_graph() -> TransactionGraph {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let txs = vec![
            TransactionRecord::new("a", "b", 10.0, t),
            TransactionRecord::new("b", "c", 9.0, t),
            TransactionRecord::new("c", "d", 8.0, t),
            TransactionRecord::new("e", "b", 5.0, t),
            TransactionRecord::new("c", "c", 1.0, t),
            TransactionRecord::new("x", "y", 3.0, t),
        ];
        let labels = vec![LabelRecord::new("c", 1), LabelRecord::new("a", 0)];
        GraphBuilder::default().build_from_records(&txs, &labels).unwrap()
    }

    #[test]
    fn test_zero_hops_is_center_only() {
        let graph = sample_graph();
        let sub = extract_k_hop_subgraph(&graph, "b", 0);
        assert_eq!(sub.nodes, vec!["b".to_string()]);
        assert!(sub.local_edges.is_empty());
        assert_eq!(sub.labels.get("b"), Some(&0));
    }

    #[test]
    fn test_one_hop_follows_both_directions() {
        let graph = sample_graph();
        let sub = extract_k_hop_subgraph(&graph, "b", 1);
        assert_eq!(sub.nodes, vec!["a", "b", "c", "e"]);
        // a->b, b->c, e->b, c->c
        assert_eq!(sub.num_edges(), 4);
        assert!(sub.edges.contains(&("c".to_string(), "c".to_string())));
        for &(s, t) in &sub.local_edges {
            assert!(s < sub.num_nodes() && t < sub.num_nodes());
        }
    }

    #[test]
    fn test_parallel_edges_are_kept_in_order() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let txs = vec![
            TransactionRecord::new("q", "p", 2.0, t),
            TransactionRecord::new("p", "q", 1.0, t),
            TransactionRecord::new("p", "q", 1.0, t),
        ];
        let graph = GraphBuilder::default().build_from_records(&txs, &[]).unwrap();
        let sub = extract_k_hop_subgraph(&graph, "p", 1);
        assert_eq!(sub.nodes, vec!["p", "q"]);
        assert_eq!(sub.local_edges, vec![(0, 1), (0, 1), (1, 0)]);
    }

    #[test]
    fn test_subgraph_saved_as_json() {
        let graph = sample_graph();
        let sub = extract_k_hop_subgraph(&graph, "c", 1);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("subgraph_c.json");
        sub.save(&path).unwrap();
        assert_eq!(Subgraph::load(&path).unwrap(), sub);
    }

    #[test]
    fn test_unbounded_hops_returns_component() {
        let graph = sample_graph();
        let sub = extract_k_hop_subgraph(&graph, "a", usize::MAX);
        assert_eq!(sub.nodes, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(sub.num_edges(), 5);
        assert_eq!(sub.labels.get("c"), Some(&1));

        let other = extract_k_hop_subgraph(&graph, "y", usize::MAX);
        assert_eq!(other.nodes, vec!["x", "y"]);
    }

    #[test]
    fn test_unknown_wallet_is_empty() {
        let graph = sample_graph();
        let sub = extract_k_hop_subgraph(&graph, "nobody", 2);
        assert!(sub.is_empty());
        assert_eq!(sub.center, "nobody");
        assert!(matches!(
            try_extract_k_hop_subgraph(&graph, "nobody", 2),
            Err(ScoringError::UnknownWallet(_))
        ));
    }

    #[test]
    fn test_composite_score_monotonic_and_clamped() {
        for &p in &[0.0f32, 0.3, 0.95, 1.0] {
            let mut previous = composite_score(p, 0.0, 0.1);
            for step in 1..=10 {
                let score = composite_score(p, step as f64 / 10.0, 0.1);
                assert!(score >= previous);
                assert!((0.0..=1.0).contains(&score));
                previous = score;
            }
        }
        assert_eq!(composite_score(0.99, 1.0, 0.5), 1.0);
    }

    #[test]
    fn test_degree_boost_ranks_hub_higher() {
        let in_degree = [0.0, 4.0, 1.0];
        let out_degree = [1.0, 4.0, 0.0];
        let anomaly = degree_anomaly(&in_degree, &out_degree);
        assert!((anomaly[1] - 1.0).abs() < 1e-6);

        let scores = calculate_suspicion_score(&[0.4, 0.4, 0.4], Some((&in_degree, &out_degree)), 0.1);
        assert!(scores[1] > scores[0]);
        assert_eq!(scores[0], scores[2]);
        assert_eq!(calculate_suspicion_score(&[0.4], None, 0.1), vec![0.4]);
    }

    #[test]
    fn test_scores_sorted_and_written() {
        let graph = sample_graph();
        let model = WalletClassifier::new(
            graph.num_features(),
            &ModelConfig {
                hidden_dim: 8,
                ..ModelConfig::default()
            },
        );
        let config = ScoringConfig::default();
        let records = compute_suspicion_scores(&model, &graph, &config).unwrap();
        assert_eq!(records.len(), graph.num_nodes());
        for pair in records.windows(2) {
            assert!(pair[0].suspicion_score >= pair[1].suspicion_score);
        }
        for r in &records {
            assert_eq!(r.predicted_label, (r.suspicion_score > 0.5) as u8);
        }

        let c = score_wallet(&model, &graph, &config, "c").unwrap().unwrap();
        assert_eq!(c.true_label, 1);
        assert!(score_wallet(&model, &graph, &config, "nobody").unwrap().is_none());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scores.csv");
        assert_eq!(write_scores(&records, &path).unwrap(), records.len());
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("Wallet_ID,Suspicion_Score,Predicted_Label,True_Label"));
        assert!(matches!(
            write_scores(&records, &dir.path().join("scores.txt")),
            Err(ScoringError::UnsupportedFormat(_))
        ));
    }
}
