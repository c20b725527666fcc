//! Smurfing Hunter
//!
//! Detects fan-out/fan-in money laundering ("smurfing") in wallet transaction
//! graphs with a two-layer neighborhood-aggregation classifier.
//!
//! # Pipeline Stages
//!
//! 1. **Graph Construction** ([`graph`]): builds the wallet index, edge list, labels and split masks
//! 2. **Feature Engineering** ([`features`]): degree, inter-transaction gap and amount statistics
//! 3. **Stratified Split** ([`split`]): per-class train/validation/test masks
//! 4. **Training** ([`train`]): full-graph optimization with validation-AUC checkpointing
//! 5. **Scoring** ([`scoring`]): suspicion score table and k-hop forensic subgraphs
//!
//! # Inputs
//!
//! - Transactions table: `Source_Wallet_ID`, `Dest_Wallet_ID`, `Timestamp`, `Amount`
//! - Labels table: `Wallet_ID`, `Label` (0 = clean, 1 = illicit)
//!
//! # Example
//!
//! ```no_run
//! use smurfing_hunter::config::HunterConfig;
//! use smurfing_hunter::graph::GraphBuilder;
//! use smurfing_hunter::model::WalletClassifier;
//! use smurfing_hunter::scoring::compute_suspicion_scores;
//! use smurfing_hunter::train::Trainer;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = HunterConfig::load()?;
//!     let graph = GraphBuilder::from_config(&config)
//!         .build_from_paths(&config.paths.transactions, &config.paths.labels)?;
//!     let mut model = WalletClassifier::new(graph.num_features(), &config.model);
//!     let report = Trainer::from_config(&config).train(&mut model, &graph)?;
//!     let scores = compute_suspicion_scores(&model, &graph, &config.scoring)?;
//!     println!("test AUC {:.4}, top wallet {:?}", report.test.auc, scores.first());
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod config;
pub mod features;
pub mod graph;
pub mod layers;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod schemas;
pub mod scoring;
pub mod split;
pub mod train;

// Re-export commonly used types
pub use config::HunterConfig;
pub use graph::{GraphBuilder, TransactionGraph, WalletIndex};
pub use model::{ModelCheckpoint, WalletClassifier};
pub use schemas::{LabelRecord, RunMetadata, SuspicionRecord, TransactionRecord};
pub use scoring::Subgraph;
pub use train::{Trainer, TrainingReport};
