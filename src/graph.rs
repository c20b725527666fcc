//! Transaction graph construction.
//!
//! Turns a transactions table and a labels table into an immutable
//! [`TransactionGraph`]: a dense wallet index, the directed edge list, engineered
//! node features, labels and stratified split masks. Inputs arrive either as polars
//! frames (CSV or Parquet on disk) or as typed records.

use crate::aggregate::Adjacency;
use crate::config::{GraphConfig, HunterConfig, SplitConfig, UnlabeledPolicy};
use crate::features::{compute_node_features, NodeFeatures, TransactionEdge};
use crate::schemas::{
    LabelRecord, RecordCounts, TransactionRecord, COL_AMOUNT, COL_DEST, COL_LABEL, COL_SOURCE,
    COL_TIMESTAMP, COL_WALLET, TRANSACTION_COLUMNS,
};
use crate::split::{create_stratified_masks, SplitKind, SplitMasks};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use nalgebra::DMatrix;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use polars::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),
}

fn malformed(msg: impl Into<String>) -> GraphError {
    GraphError::MalformedInput(msg.into())
}

// ============================================================================
// Wallet vocabulary
// ============================================================================

/// Bijective wallet identity <-> dense index map, fixed for one graph build.
///
/// Indices follow the lexicographic order of the identities, so identical
/// identity sets always produce identical indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletIndex {
    ids: Vec<String>,
    lookup: HashMap<String, usize>,
}

impl WalletIndex {
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let unique: BTreeSet<String> = ids.into_iter().map(|s| s.as_ref().to_string()).collect();
        let ids: Vec<String> = unique.into_iter().collect();
        let lookup = ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        Self { ids, lookup }
    }

    pub fn get(&self, wallet_id: &str) -> Option<usize> {
        self.lookup.get(wallet_id).copied()
    }

    pub fn wallet(&self, index: usize) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// ============================================================================
// Graph instance
// ============================================================================

/// Read-only graph snapshot handed to training and scoring
#[derive(Debug, Clone)]
pub struct TransactionGraph {
    wallets: WalletIndex,
    edges: Vec<TransactionEdge>,
    raw_features: NodeFeatures,
    features: DMatrix<f32>,
    labels: Vec<u8>,
    labeled: Vec<bool>,
    masks: SplitMasks,
    adjacency: Adjacency,
    /// Node weight is the dense wallet index, edge weight the amount
    flow: StableGraph<usize, f64>,
    unlabeled_policy: UnlabeledPolicy,
}

impl TransactionGraph {
    pub fn num_nodes(&self) -> usize {
        self.wallets.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn num_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn wallets(&self) -> &WalletIndex {
        &self.wallets
    }

    pub fn edges(&self) -> &[TransactionEdge] {
        &self.edges
    }

    /// Feature columns before normalization
    pub fn raw_features(&self) -> &NodeFeatures {
        &self.raw_features
    }

    /// Feature matrix fed to the classifier, `[num_nodes, 6]`
    pub fn features(&self) -> &DMatrix<f32> {
        &self.features
    }

    /// Ground-truth label per node; unlabeled wallets carry 0
    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    /// Whether a node appeared in the labels table
    pub fn labeled(&self) -> &[bool] {
        &self.labeled
    }

    pub fn masks(&self) -> &SplitMasks {
        &self.masks
    }

    pub fn adjacency(&self) -> &Adjacency {
        &self.adjacency
    }

    /// Transaction flow graph used for neighborhood walks. `NodeIndex::new(i)`
    /// is wallet `i`.
    pub fn flow_graph(&self) -> &StableGraph<usize, f64> {
        &self.flow
    }

    pub fn unlabeled_policy(&self) -> UnlabeledPolicy {
        self.unlabeled_policy
    }

    /// Whether a node contributes to loss and metrics under the configured policy
    pub fn is_supervised(&self, node: usize) -> bool {
        match self.unlabeled_policy {
            UnlabeledPolicy::TreatAsClean => true,
            UnlabeledPolicy::ExcludeFromLoss => self.labeled[node],
        }
    }

    /// Nodes of a split that carry a usable label, ascending
    pub fn supervised_indices(&self, kind: SplitKind) -> Vec<usize> {
        self.masks
            .indices(kind)
            .into_iter()
            .filter(|&i| self.is_supervised(i))
            .collect()
    }

    pub fn num_illicit(&self) -> usize {
        self.labels.iter().filter(|&&l| l == LabelRecord::ILLICIT).count()
    }

    pub fn record_counts(&self) -> RecordCounts {
        RecordCounts {
            wallets: self.num_nodes(),
            transactions: self.num_edges(),
            labeled_wallets: self.labeled.iter().filter(|&&l| l).count(),
            illicit_wallets: self.num_illicit(),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    graph: GraphConfig,
    split: SplitConfig,
}

impl GraphBuilder {
    pub fn new(graph: GraphConfig, split: SplitConfig) -> Self {
        Self { graph, split }
    }

    pub fn from_config(config: &HunterConfig) -> Self {
        Self::new(config.graph.clone(), config.split.clone())
    }

    /// Build from polars frames with the standard column names
    pub fn build(&self, transactions: &DataFrame, labels: &DataFrame) -> Result<TransactionGraph, GraphError> {
        let transactions = parse_transactions(transactions)?;
        let labels = parse_labels(labels)?;
        self.build_from_records(&transactions, &labels)
    }

    /// Read both tables from disk (CSV or Parquet) and build
    pub fn build_from_paths(&self, transactions: &Path, labels: &Path) -> Result<TransactionGraph, GraphError> {
        let tx_df = read_table(transactions)?;
        info!("Loaded {} transactions from {:?}", tx_df.height(), transactions);
        let label_df = read_table(labels)?;
        info!("Loaded {} labels from {:?}", label_df.height(), labels);
        self.build(&tx_df, &label_df)
    }

    pub fn build_from_records(
        &self,
        transactions: &[TransactionRecord],
        labels: &[LabelRecord],
    ) -> Result<TransactionGraph, GraphError> {
        for (row, tx) in transactions.iter().enumerate() {
            if !tx.amount.is_finite() || tx.amount < 0.0 {
                return Err(malformed(format!(
                    "{} at row {} must be a non-negative number, got {}",
                    COL_AMOUNT, row, tx.amount
                )));
            }
        }
        for (row, label) in labels.iter().enumerate() {
            if label.label > LabelRecord::ILLICIT {
                return Err(malformed(format!(
                    "{} at row {} must be 0 or 1, got {}",
                    COL_LABEL, row, label.label
                )));
            }
        }

        let wallets = WalletIndex::from_ids(
            transactions
                .iter()
                .flat_map(|tx| [tx.source.as_str(), tx.dest.as_str()])
                .chain(labels.iter().map(|l| l.wallet_id.as_str())),
        );
        let num_nodes = wallets.len();
        info!("Wallet vocabulary: {} wallets", num_nodes);

        let edges: Vec<TransactionEdge> = transactions
            .iter()
            .filter_map(|tx| {
                Some(TransactionEdge {
                    source: wallets.get(&tx.source)?,
                    target: wallets.get(&tx.dest)?,
                    amount: tx.amount,
                    timestamp_ms: tx.timestamp.timestamp_millis(),
                })
            })
            .collect();
        info!("Built {} directed edges", edges.len());

        let raw_features = compute_node_features(&edges, num_nodes);
        let features = raw_features.to_matrix(self.graph.normalize_features);
        debug!("Feature matrix: {}x{}", features.nrows(), features.ncols());

        // later rows win when a wallet is labeled twice
        let mut node_labels = vec![LabelRecord::CLEAN; num_nodes];
        let mut labeled = vec![false; num_nodes];
        for record in labels {
            if let Some(i) = wallets.get(&record.wallet_id) {
                node_labels[i] = record.label;
                labeled[i] = true;
            }
        }

        let masks = create_stratified_masks(&node_labels, &self.split);
        let adjacency = Adjacency::from_edges(
            num_nodes,
            &edges.iter().map(|e| (e.source, e.target)).collect::<Vec<_>>(),
        );

        let mut flow = StableGraph::with_capacity(num_nodes, edges.len());
        for i in 0..num_nodes {
            flow.add_node(i);
        }
        for edge in &edges {
            flow.add_edge(NodeIndex::new(edge.source), NodeIndex::new(edge.target), edge.amount);
        }

        let graph = TransactionGraph {
            wallets,
            edges,
            raw_features,
            features,
            labels: node_labels,
            labeled,
            masks,
            adjacency,
            flow,
            unlabeled_policy: self.graph.unlabeled_policy,
        };

        info!(
            "Graph ready: {} illicit of {} wallets ({} labeled), split train/val/test = {}/{}/{}",
            graph.num_illicit(),
            graph.num_nodes(),
            graph.record_counts().labeled_wallets,
            graph.masks.count(SplitKind::Train),
            graph.masks.count(SplitKind::Val),
            graph.masks.count(SplitKind::Test)
        );
        Ok(graph)
    }
}

// ============================================================================
// Table parsing
// ============================================================================

/// Read a CSV (with header) or Parquet table, chosen by file extension.
///
/// CSV columns are all read as strings so wallet identities such as `007` and `7`
/// stay distinct; amounts, labels and timestamps are converted when parsed.
pub fn read_table(path: &Path) -> Result<DataFrame, GraphError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("csv") => {
            let df = CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(Some(0))
                .try_into_reader_with_file_path(Some(path.to_path_buf()))?
                .finish()?;
            Ok(df)
        }
        Some("parquet") => {
            let file = std::fs::File::open(path)?;
            Ok(ParquetReader::new(file).finish()?)
        }
        _ => Err(malformed(format!(
            "unsupported table format {:?}, expected .csv or .parquet",
            path
        ))),
    }
}

fn require_columns(df: &DataFrame, required: &[&str], table: &str) -> Result<(), GraphError> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|name| df.column(name).is_err())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(malformed(format!(
            "{} table is missing required columns: {}",
            table,
            missing.join(", ")
        )))
    }
}

/// Extract and validate transaction rows. Extra columns are ignored.
pub fn parse_transactions(df: &DataFrame) -> Result<Vec<TransactionRecord>, GraphError> {
    require_columns(df, &TRANSACTION_COLUMNS, "transactions")?;

    let sources = string_values(df, COL_SOURCE)?;
    let dests = string_values(df, COL_DEST)?;
    let amounts = amount_values(df)?;
    let timestamps = timestamp_values(df)?;

    Ok(sources
        .into_iter()
        .zip(dests)
        .zip(amounts.into_iter().zip(timestamps))
        .map(|((source, dest), (amount, timestamp))| TransactionRecord {
            source,
            dest,
            timestamp,
            amount,
        })
        .collect())
}

/// Extract and validate label rows
pub fn parse_labels(df: &DataFrame) -> Result<Vec<LabelRecord>, GraphError> {
    require_columns(df, &[COL_WALLET, COL_LABEL], "labels")?;

    let wallets = string_values(df, COL_WALLET)?;
    let column = df.column(COL_LABEL)?;
    if !(column.dtype().is_integer() || column.dtype().is_float() || column.dtype() == &DataType::String) {
        return Err(malformed(format!(
            "{} must be a numeric column, got {}",
            COL_LABEL,
            column.dtype()
        )));
    }
    // float first so fractional labels are rejected rather than truncated
    let cast = column.cast(&DataType::Float64)?;
    let values = cast.f64()?;

    wallets
        .into_iter()
        .zip(values.into_iter())
        .enumerate()
        .map(|(row, (wallet_id, label))| match label {
            Some(l) if l == 0.0 || l == 1.0 => Ok(LabelRecord::new(wallet_id, l as u8)),
            Some(other) => Err(malformed(format!(
                "{} at row {} must be 0 or 1, got {}",
                COL_LABEL, row, other
            ))),
            None => Err(malformed(format!("{} at row {} is not a number", COL_LABEL, row))),
        })
        .collect()
}

fn string_values(df: &DataFrame, name: &str) -> Result<Vec<String>, GraphError> {
    let column = df.column(name)?.cast(&DataType::String)?;
    let values = column.str()?;
    values
        .into_iter()
        .enumerate()
        .map(|(row, v)| {
            v.map(str::to_string)
                .ok_or_else(|| malformed(format!("{} at row {} is null", name, row)))
        })
        .collect()
}

fn amount_values(df: &DataFrame) -> Result<Vec<f64>, GraphError> {
    let column = df.column(COL_AMOUNT)?;
    let dtype = column.dtype();
    if !(dtype.is_integer() || dtype.is_float() || dtype == &DataType::String) {
        return Err(malformed(format!("{} must be numeric, got {}", COL_AMOUNT, dtype)));
    }
    // non-numeric strings become null here
    let cast = column.cast(&DataType::Float64)?;
    let values = cast.f64()?;
    values
        .into_iter()
        .enumerate()
        .map(|(row, v)| match v {
            Some(a) if a.is_finite() && a >= 0.0 => Ok(a),
            Some(a) => Err(malformed(format!(
                "{} at row {} must be a non-negative number, got {}",
                COL_AMOUNT, row, a
            ))),
            None => Err(malformed(format!("{} at row {} is not numeric", COL_AMOUNT, row))),
        })
        .collect()
}

fn timestamp_values(df: &DataFrame) -> Result<Vec<DateTime<Utc>>, GraphError> {
    let column = df.column(COL_TIMESTAMP)?;
    let bad_row = |row: usize| malformed(format!("{} at row {} is not a valid timestamp", COL_TIMESTAMP, row));

    match column.dtype() {
        DataType::Datetime(unit, _) => {
            let per_milli = match unit {
                TimeUnit::Nanoseconds => 1_000_000,
                TimeUnit::Microseconds => 1_000,
                TimeUnit::Milliseconds => 1,
            };
            let raw = column.cast(&DataType::Int64)?;
            raw.i64()?
                .into_iter()
                .enumerate()
                .map(|(row, v)| {
                    v.and_then(|v| from_millis(v.div_euclid(per_milli)))
                        .ok_or_else(|| bad_row(row))
                })
                .collect()
        }
        dtype if dtype.is_integer() || dtype.is_float() => {
            let raw = column.cast(&DataType::Float64)?;
            raw.f64()?
                .into_iter()
                .enumerate()
                .map(|(row, v)| {
                    v.filter(|s| s.is_finite())
                        .and_then(|s| from_millis((s * 1000.0).round() as i64))
                        .ok_or_else(|| bad_row(row))
                })
                .collect()
        }
        _ => {
            let raw = column.cast(&DataType::String)?;
            raw.str()?
                .into_iter()
                .enumerate()
                .map(|(row, v)| v.and_then(parse_timestamp).ok_or_else(|| bad_row(row)))
                .collect()
        }
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ms.div_euclid(1000), (ms.rem_euclid(1000) * 1_000_000) as u32)
}

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// Parse a timestamp string. Naive datetimes are taken as UTC; a bare number is
/// read as seconds since the Unix epoch.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite())
        .and_then(|s| from_millis((s * 1000.0).round() as i64))
}
