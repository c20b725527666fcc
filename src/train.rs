//! Full-graph training loop and evaluation.
//!
//! Every epoch runs one training-mode forward pass over the whole graph, takes the
//! cross-entropy loss on the supervised train nodes only, backpropagates and steps
//! Adam once. Validation ROC-AUC drives both checkpoint selection and the plateau
//! learning-rate schedule. The best weights are restored before the test report.

use crate::config::{HunterConfig, TrainingConfig};
use crate::graph::TransactionGraph;
use crate::layers::softmax_rows;
use crate::metrics::{accuracy, roc_auc, ClassificationReport};
use crate::model::{ModelCheckpoint, ModelError, WalletClassifier};
use crate::optimizer::{Adam, PlateauScheduler};
use crate::split::SplitKind;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Training split has no supervised nodes")]
    EmptyTrainingSet,
}

/// Metrics recorded after each optimizer step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub train_acc: f64,
    pub val_acc: f64,
    /// 0.0 when undefined for the validation split
    pub val_auc: f64,
    pub learning_rate: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub split: SplitKind,
    pub accuracy: f64,
    /// 0.0 when undefined (single class or empty split)
    pub auc: f64,
    pub report: ClassificationReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub history: Vec<EpochMetrics>,
    /// Epoch whose weights were restored; None if validation AUC never improved
    pub best_epoch: Option<usize>,
    pub best_val_auc: f64,
    pub test: EvaluationReport,
}

/// Mean cross-entropy over `nodes` and its gradient w.r.t. the logits.
/// Rows outside `nodes` get a zero gradient.
pub fn cross_entropy(logits: &DMatrix<f32>, labels: &[u8], nodes: &[usize]) -> (f64, DMatrix<f32>) {
    let mut grad = DMatrix::<f32>::zeros(logits.nrows(), logits.ncols());
    if nodes.is_empty() {
        return (0.0, grad);
    }
    let probs = softmax_rows(logits);
    let scale = 1.0 / nodes.len() as f32;
    let mut loss = 0.0f64;
    for &i in nodes {
        let target = labels[i] as usize;
        loss -= (probs[(i, target)].max(f32::MIN_POSITIVE) as f64).ln();
        for c in 0..logits.ncols() {
            let onehot = if c == target { 1.0 } else { 0.0 };
            grad[(i, c)] = (probs[(i, c)] - onehot) * scale;
        }
    }
    (loss / nodes.len() as f64, grad)
}

/// Arg-max class per selected row
fn predicted_classes(scores: &DMatrix<f32>, nodes: &[usize]) -> Vec<u8> {
    nodes
        .iter()
        .map(|&i| {
            let row = scores.row(i);
            let (best, _) = row
                .iter()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |acc, (c, &v)| if v > acc.1 { (c, v) } else { acc });
            best as u8
        })
        .collect()
}

fn auc_or_zero(labels: &[u8], scores: &[f32], split: SplitKind) -> f64 {
    match roc_auc(labels, scores) {
        Ok(auc) => auc,
        Err(e) => {
            debug!("{} AUC unavailable ({}), using 0.0", split, e);
            0.0
        }
    }
}

/// Evaluate inference-mode predictions on the supervised nodes of one split
pub fn evaluate(
    model: &WalletClassifier,
    graph: &TransactionGraph,
    split: SplitKind,
) -> Result<EvaluationReport, TrainError> {
    let probs = model.predict_proba(graph.features(), graph.adjacency())?;
    Ok(evaluate_probs(&probs, graph, split, model.num_classes()))
}

fn evaluate_probs(
    probs: &DMatrix<f32>,
    graph: &TransactionGraph,
    split: SplitKind,
    num_classes: usize,
) -> EvaluationReport {
    let nodes = graph.supervised_indices(split);
    let truth: Vec<u8> = nodes.iter().map(|&i| graph.labels()[i]).collect();
    let predicted = predicted_classes(probs, &nodes);
    let positive: Vec<f32> = nodes.iter().map(|&i| probs[(i, 1)]).collect();

    EvaluationReport {
        split,
        accuracy: accuracy(&truth, &predicted),
        auc: auc_or_zero(&truth, &positive, split),
        report: ClassificationReport::new(&truth, &predicted, num_classes),
    }
}

#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainingConfig,
    /// Best checkpoint is written here on every improvement when set
    checkpoint_path: Option<PathBuf>,
}

impl Trainer {
    pub fn new(config: TrainingConfig, checkpoint_path: Option<PathBuf>) -> Self {
        Self {
            config,
            checkpoint_path,
        }
    }

    pub fn from_config(config: &HunterConfig) -> Self {
        let path = config
            .training
            .persist_checkpoints
            .then(|| config.paths.checkpoint.clone());
        Self::new(config.training.clone(), path)
    }

    pub fn train(&self, model: &mut WalletClassifier, graph: &TransactionGraph) -> Result<TrainingReport, TrainError> {
        let train_nodes = graph.supervised_indices(SplitKind::Train);
        if train_nodes.is_empty() {
            return Err(TrainError::EmptyTrainingSet);
        }
        let num_classes = model.num_classes();
        let features = graph.features();
        let adjacency = graph.adjacency();
        let labels = graph.labels();
        let train_truth: Vec<u8> = train_nodes.iter().map(|&i| labels[i]).collect();

        let mut optimizer = Adam::new(self.config.learning_rate, self.config.weight_decay);
        let mut scheduler = PlateauScheduler::new(self.config.lr_factor, self.config.lr_patience);
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let mut history = Vec::with_capacity(self.config.epochs);
        let mut best: Option<ModelCheckpoint> = None;
        let mut best_epoch = None;
        let mut best_val_auc = 0.0f64;

        info!(
            "Training for {} epochs on {} nodes ({} supervised train)",
            self.config.epochs,
            graph.num_nodes(),
            train_nodes.len()
        );

        for epoch in 1..=self.config.epochs {
            model.zero_grad();
            let (logits, cache) = model.forward_train(features, adjacency, &mut rng)?;
            let (loss, grad) = cross_entropy(&logits, labels, &train_nodes);
            model.backward(adjacency, &cache, &grad);
            optimizer.step(model.parameters_mut());

            let train_acc = accuracy(&train_truth, &predicted_classes(&logits, &train_nodes));
            let probs = model.predict_proba(features, adjacency)?;
            let val = evaluate_probs(&probs, graph, SplitKind::Val, num_classes);

            let metrics = EpochMetrics {
                epoch,
                loss,
                train_acc,
                val_acc: val.accuracy,
                val_auc: val.auc,
                learning_rate: optimizer.learning_rate(),
            };

            if val.auc > best_val_auc {
                best_val_auc = val.auc;
                best_epoch = Some(epoch);
                let checkpoint = model.to_checkpoint();
                if let Some(path) = &self.checkpoint_path {
                    checkpoint.save(path)?;
                }
                best = Some(checkpoint);
                debug!("Epoch {}: new best validation AUC {:.4}", epoch, best_val_auc);
            }

            scheduler.step(val.auc, &mut optimizer);

            if epoch == 1 || (self.config.log_every > 0 && epoch % self.config.log_every == 0) {
                info!(
                    "Epoch {:03} | Loss: {:.4} | Train Acc: {:.4} | Val Acc: {:.4} | Val AUC: {:.4} | LR: {:.2e}",
                    epoch, metrics.loss, metrics.train_acc, metrics.val_acc, metrics.val_auc, metrics.learning_rate
                );
            }
            history.push(metrics);
        }

        match &best {
            Some(checkpoint) => {
                model.load_checkpoint(checkpoint)?;
                info!(
                    "Restored best weights from epoch {} (val AUC {:.4})",
                    best_epoch.unwrap_or_default(),
                    best_val_auc
                );
                if let Some(path) = &self.checkpoint_path {
                    info!("Best checkpoint saved to {:?}", path);
                }
            }
            None => {
                warn!("Validation AUC never improved above 0.0, keeping final weights");
                if let Some(path) = &self.checkpoint_path {
                    model.to_checkpoint().save(path)?;
                }
            }
        }

        let test = evaluate(model, graph, SplitKind::Test)?;
        info!("Test accuracy: {:.4} | Test AUC: {:.4}", test.accuracy, test.auc);
        debug!("Test classification report:\n{}", test.report);

        Ok(TrainingReport {
            history,
            best_epoch,
            best_val_auc,
            test,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GraphConfig, ModelConfig, SplitConfig, UnlabeledPolicy};
    use crate::graph::GraphBuilder;
    use crate::schemas::{LabelRecord, TransactionRecord};
    use chrono::{Duration, TimeZone, Utc};

    fn small_model_config() -> ModelConfig {
        ModelConfig {
            hidden_dim: 16,
            ..ModelConfig::default()
        }
    }

    fn training_config(epochs: usize) -> TrainingConfig {
        TrainingConfig {
            epochs,
            persist_checkpoints: false,
            ..TrainingConfig::default()
        }
    }

    /// Hubs fan out to many fresh wallets; illicit hubs do it in tight bursts of equal chunks
    fn fan_out_graph() -> TransactionGraph {
        fan_out_graph_with(GraphConfig::default())
    }

    fn fan_out_graph_with(graph_config: GraphConfig) -> TransactionGraph {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut txs = Vec::new();
        let mut labels = Vec::new();
        for hub in 0..20 {
            let illicit = hub % 4 == 0;
            let hub_id = format!("hub_{:02}", hub);
            let fanout = if illicit { 8 } else { 2 };
            for k in 0..fanout {
                let gap = if illicit { Duration::minutes(5 * k) } else { Duration::hours(30 * k) };
                let amount = if illicit { 99.0 } else { 10.0 + 37.0 * k as f64 };
                txs.push(TransactionRecord::new(
                    hub_id.clone(),
                    format!("leaf_{:02}_{}", hub, k),
                    amount,
                    t0 + gap,
                ));
            }
            labels.push(LabelRecord::new(hub_id, illicit as u8));
        }
        let split = SplitConfig {
            min_train_per_class: 1,
            ..SplitConfig::default()
        };
        GraphBuilder::new(graph_config, split)
            .build_from_records(&txs, &labels)
            .unwrap()
    }

    #[test]
    fn test_cross_entropy_gradient_matches_finite_difference() {
        let logits = DMatrix::from_row_slice(3, 2, &[0.3, -0.2, 1.5, 0.1, -0.7, 0.4]);
        let labels = [1u8, 0, 1];
        let nodes = [0usize, 2];
        let (_, grad) = cross_entropy(&logits, &labels, &nodes);
        let eps = 1e-3;
        for r in 0..3 {
            for c in 0..2 {
                let mut plus = logits.clone();
                plus[(r, c)] += eps;
                let mut minus = logits.clone();
                minus[(r, c)] -= eps;
                let numeric = (cross_entropy(&plus, &labels, &nodes).0 - cross_entropy(&minus, &labels, &nodes).0)
                    / (2.0 * eps as f64);
                assert!((numeric - grad[(r, c)] as f64).abs() < 1e-3, "({}, {})", r, c);
            }
        }
        // row 1 is outside the loss
        assert_eq!(grad[(1, 0)], 0.0);
    }

    #[test]
    fn test_training_reduces_loss_and_restores_best() {
        let graph = fan_out_graph();
        let mut model = WalletClassifier::new(graph.num_features(), &small_model_config());
        let report = Trainer::new(training_config(30), None)
            .train(&mut model, &graph)
            .unwrap();

        assert_eq!(report.history.len(), 30);
        let first = report.history[0].loss;
        let last = report.history[29].loss;
        assert!(last < first, "loss {} -> {}", first, last);
        if let Some(epoch) = report.best_epoch {
            assert!((report.history[epoch - 1].val_auc - report.best_val_auc).abs() < 1e-12);
        }
        assert!((0.0..=1.0).contains(&report.test.auc));
    }

    #[test]
    fn test_checkpoint_written_on_improvement() {
        let graph = fan_out_graph();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("best.json");
        let mut model = WalletClassifier::new(graph.num_features(), &small_model_config());
        let report = Trainer::new(training_config(5), Some(path.clone()))
            .train(&mut model, &graph)
            .unwrap();
        assert!(path.exists());

        let restored = WalletClassifier::from_checkpoint(&ModelCheckpoint::load(&path).unwrap(), 6).unwrap();
        let expected = evaluate(&model, &graph, SplitKind::Test).unwrap();
        let actual = evaluate(&restored, &graph, SplitKind::Test).unwrap();
        assert_eq!(expected, actual);
        assert_eq!(report.test, expected);
    }

    #[test]
    fn test_empty_training_split_is_error() {
        let mut config = HunterConfig::default();
        config.training = training_config(1);
        config.split.train_ratio = 0.0;
        let graph = GraphBuilder::from_config(&config)
            .build_from_records(
                &[TransactionRecord::new("A", "B", 1.0, Utc::now())],
                &[LabelRecord::new("A", 1)],
            )
            .unwrap();
        let mut model = WalletClassifier::new(graph.num_features(), &small_model_config());
        assert!(matches!(
            Trainer::from_config(&config).train(&mut model, &graph),
            Err(TrainError::EmptyTrainingSet)
        ));
    }

    #[test]
    fn test_single_class_validation_uses_zero_auc() {
        // every wallet is clean: AUC is undefined everywhere
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let txs: Vec<TransactionRecord> = (0..10)
            .map(|i| TransactionRecord::new(format!("w{}", i), format!("w{}", i + 1), 5.0, t0))
            .collect();
        let graph = GraphBuilder::default().build_from_records(&txs, &[]).unwrap();
        let mut model = WalletClassifier::new(6, &small_model_config());
        let report = Trainer::new(training_config(3), None).train(&mut model, &graph).unwrap();
        assert!(report.history.iter().all(|m| m.val_auc == 0.0));
        assert_eq!(report.best_epoch, None);
        assert_eq!(report.test.auc, 0.0);
    }

    #[test]
    fn test_excluding_unlabeled_wallets_changes_supervised_set() {
        let excluded = fan_out_graph_with(GraphConfig {
            unlabeled_policy: UnlabeledPolicy::ExcludeFromLoss,
            ..GraphConfig::default()
        });
        let clean = fan_out_graph();

        // leaves carry no label: only hubs are supervised when they are excluded
        let train = excluded.supervised_indices(SplitKind::Train);
        assert!(train.iter().all(|&i| excluded.labeled()[i]));
        assert!(train.len() < clean.supervised_indices(SplitKind::Train).len());

        let run = |graph: &TransactionGraph| {
            let mut model = WalletClassifier::new(graph.num_features(), &small_model_config());
            Trainer::new(training_config(1), None).train(&mut model, graph).unwrap()
        };
        let excluded_report = run(&excluded);
        let clean_report = run(&clean);
        // same weights and dropout draws, different loss nodes
        assert_ne!(excluded_report.history[0].loss, clean_report.history[0].loss);

        let test_support: usize = excluded_report.test.report.classes.iter().map(|c| c.support).sum();
        assert_eq!(test_support, excluded.supervised_indices(SplitKind::Test).len());
    }

    #[test]
    fn test_unlabeled_only_graph_depends_on_policy() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let txs: Vec<TransactionRecord> = (0..10)
            .map(|i| TransactionRecord::new(format!("w{}", i), format!("w{}", i + 1), 5.0, t0))
            .collect();
        let build = |policy| {
            let graph_config = GraphConfig {
                unlabeled_policy: policy,
                ..GraphConfig::default()
            };
            GraphBuilder::new(graph_config, SplitConfig::default())
                .build_from_records(&txs, &[])
                .unwrap()
        };

        let graph = build(UnlabeledPolicy::ExcludeFromLoss);
        let mut model = WalletClassifier::new(6, &small_model_config());
        assert!(matches!(
            Trainer::new(training_config(1), None).train(&mut model, &graph),
            Err(TrainError::EmptyTrainingSet)
        ));

        let graph = build(UnlabeledPolicy::TreatAsClean);
        let mut model = WalletClassifier::new(6, &small_model_config());
        assert!(Trainer::new(training_config(1), None).train(&mut model, &graph).is_ok());
    }
}
