//! Two-layer neighborhood-aggregation classifier for wallet nodes.
//!
//! Architecture:
//! - Layer 1: aggregate in-neighbors, `input_dim -> hidden_dim`, batch norm, ReLU, dropout
//! - Layer 2: same pattern, `hidden_dim -> hidden_dim / 2`
//! - Head: linear `hidden_dim / 2 -> num_classes` logits
//!
//! Checkpoints are JSON with every tensor stored by name. A checkpoint is tied to
//! the feature width it was trained on, not to wallet identities.

use crate::aggregate::Adjacency;
use crate::config::{AggregatorKind, ModelConfig};
use crate::layers::{
    dropout, relu, relu_backward, softmax_rows, BatchNorm, BatchNormCache, Linear, Param, SageCache,
    SageConv,
};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Bumped whenever tensor names or layout change
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Feature dimension mismatch: model expects {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Feature matrix has {features} rows but the graph has {nodes} nodes")]
    NodeCountMismatch { features: usize, nodes: usize },

    #[error("Invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Intermediate activations from a training forward pass
#[derive(Debug, Clone)]
pub struct ForwardCache {
    conv1: SageCache,
    bn1: BatchNormCache,
    act1: DMatrix<f32>,
    drop1: DMatrix<f32>,
    conv2: SageCache,
    bn2: BatchNormCache,
    act2: DMatrix<f32>,
    drop2: DMatrix<f32>,
    head_input: DMatrix<f32>,
}

/// Wallet classifier: two message-passing blocks and a linear head
#[derive(Debug)]
pub struct WalletClassifier {
    input_dim: usize,
    hidden_dim: usize,
    num_classes: usize,
    dropout: f32,
    conv1: SageConv,
    bn1: BatchNorm,
    conv2: SageConv,
    bn2: BatchNorm,
    classifier: Linear,
}

impl WalletClassifier {
    pub fn new(input_dim: usize, config: &ModelConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.init_seed);
        let hidden = config.hidden_dim;
        let embed = (hidden / 2).max(1);

        let model = Self {
            input_dim,
            hidden_dim: hidden,
            num_classes: config.num_classes,
            dropout: config.dropout,
            conv1: SageConv::new(input_dim, hidden, config.aggregator, &mut rng),
            bn1: BatchNorm::new(hidden),
            conv2: SageConv::new(hidden, embed, config.aggregator, &mut rng),
            bn2: BatchNorm::new(embed),
            classifier: Linear::new(embed, config.num_classes, true, &mut rng),
        };

        info!(
            "Built classifier: {} -> {} -> {} -> {} ({} aggregation, {} parameters)",
            input_dim,
            hidden,
            embed,
            config.num_classes,
            config.aggregator,
            model.parameter_count()
        );
        model
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn embedding_dim(&self) -> usize {
        self.bn2.channels()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn aggregator(&self) -> AggregatorKind {
        self.conv1.aggregator_kind()
    }

    pub fn parameter_count(&self) -> usize {
        let linear = |l: &Linear| l.weight.len() + l.bias.as_ref().map_or(0, Param::len);
        let conv = |c: &SageConv| linear(&c.lin_self) + linear(&c.lin_neigh);
        conv(&self.conv1)
            + conv(&self.conv2)
            + 2 * (self.bn1.channels() + self.bn2.channels())
            + linear(&self.classifier)
    }

    fn check_inputs(&self, x: &DMatrix<f32>, adjacency: &Adjacency) -> Result<(), ModelError> {
        if x.ncols() != self.input_dim {
            return Err(ModelError::DimensionMismatch {
                expected: self.input_dim,
                found: x.ncols(),
            });
        }
        if x.nrows() != adjacency.num_nodes() {
            return Err(ModelError::NodeCountMismatch {
                features: x.nrows(),
                nodes: adjacency.num_nodes(),
            });
        }
        Ok(())
    }

    /// Inference-mode forward pass returning logits `[num_nodes, num_classes]`
    pub fn forward(&self, x: &DMatrix<f32>, adjacency: &Adjacency) -> Result<DMatrix<f32>, ModelError> {
        let embeddings = self.get_embeddings(x, adjacency)?;
        Ok(self.classifier.forward(&embeddings))
    }

    /// Training-mode forward pass: batch statistics, dropout, cached activations
    pub fn forward_train(
        &mut self,
        x: &DMatrix<f32>,
        adjacency: &Adjacency,
        rng: &mut StdRng,
    ) -> Result<(DMatrix<f32>, ForwardCache), ModelError> {
        self.check_inputs(x, adjacency)?;

        let (h, conv1) = self.conv1.forward_train(adjacency, x);
        let (h, bn1) = self.bn1.forward_train(&h);
        let act1 = relu(&h);
        let (h, drop1) = dropout(&act1, self.dropout, rng);

        let (h, conv2) = self.conv2.forward_train(adjacency, &h);
        let (h, bn2) = self.bn2.forward_train(&h);
        let act2 = relu(&h);
        let (head_input, drop2) = dropout(&act2, self.dropout, rng);

        let logits = self.classifier.forward(&head_input);
        let cache = ForwardCache {
            conv1,
            bn1,
            act1,
            drop1,
            conv2,
            bn2,
            act2,
            drop2,
            head_input,
        };
        Ok((logits, cache))
    }

    /// Accumulate parameter gradients given `d loss / d logits`
    pub fn backward(&mut self, adjacency: &Adjacency, cache: &ForwardCache, grad_logits: &DMatrix<f32>) {
        let g = self.classifier.backward(&cache.head_input, grad_logits);
        let g = g.component_mul(&cache.drop2);
        let g = relu_backward(&cache.act2, &g);
        let g = self.bn2.backward(&cache.bn2, &g);
        let g = self.conv2.backward(adjacency, &cache.conv2, &g);

        let g = g.component_mul(&cache.drop1);
        let g = relu_backward(&cache.act1, &g);
        let g = self.bn1.backward(&cache.bn1, &g);
        // input features are not trainable; the gradient w.r.t. x is dropped
        let _ = self.conv1.backward(adjacency, &cache.conv1, &g);
    }

    /// Parameters in a fixed order shared with the optimizer state
    pub fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.conv1.params_mut();
        params.extend(self.bn1.params_mut());
        params.extend(self.conv2.params_mut());
        params.extend(self.bn2.params_mut());
        params.extend(self.classifier.params_mut());
        params
    }

    pub fn zero_grad(&mut self) {
        for param in self.parameters_mut() {
            param.zero_grad();
        }
    }

    /// Node embeddings after both message-passing blocks, inference mode, no head
    pub fn get_embeddings(&self, x: &DMatrix<f32>, adjacency: &Adjacency) -> Result<DMatrix<f32>, ModelError> {
        self.check_inputs(x, adjacency)?;
        let h = self.conv1.forward(adjacency, x);
        let h = relu(&self.bn1.forward(&h));
        let h = self.conv2.forward(adjacency, &h);
        Ok(relu(&self.bn2.forward(&h)))
    }

    /// Per-class probabilities `[num_nodes, num_classes]`, inference mode
    pub fn predict_proba(&self, x: &DMatrix<f32>, adjacency: &Adjacency) -> Result<DMatrix<f32>, ModelError> {
        Ok(softmax_rows(&self.forward(x, adjacency)?))
    }

    // === Checkpoint persistence ===

    fn named_tensors(&self) -> Vec<(&'static str, &DMatrix<f32>)> {
        let mut tensors = vec![
            ("conv1.lin_self.weight", &self.conv1.lin_self.weight.value),
            ("conv1.lin_neigh.weight", &self.conv1.lin_neigh.weight.value),
            ("bn1.weight", &self.bn1.gamma.value),
            ("bn1.bias", &self.bn1.beta.value),
            ("bn1.running_mean", &self.bn1.running_mean),
            ("bn1.running_var", &self.bn1.running_var),
            ("conv2.lin_self.weight", &self.conv2.lin_self.weight.value),
            ("conv2.lin_neigh.weight", &self.conv2.lin_neigh.weight.value),
            ("bn2.weight", &self.bn2.gamma.value),
            ("bn2.bias", &self.bn2.beta.value),
            ("bn2.running_mean", &self.bn2.running_mean),
            ("bn2.running_var", &self.bn2.running_var),
            ("classifier.weight", &self.classifier.weight.value),
        ];
        for (name, linear) in [
            ("conv1.lin_neigh.bias", &self.conv1.lin_neigh),
            ("conv2.lin_neigh.bias", &self.conv2.lin_neigh),
            ("classifier.bias", &self.classifier),
        ] {
            if let Some(bias) = &linear.bias {
                tensors.push((name, &bias.value));
            }
        }
        tensors
    }

    fn named_tensors_mut(&mut self) -> Vec<(&'static str, &mut DMatrix<f32>)> {
        let mut tensors = vec![
            ("conv1.lin_self.weight", &mut self.conv1.lin_self.weight.value),
            ("conv1.lin_neigh.weight", &mut self.conv1.lin_neigh.weight.value),
            ("bn1.weight", &mut self.bn1.gamma.value),
            ("bn1.bias", &mut self.bn1.beta.value),
            ("bn1.running_mean", &mut self.bn1.running_mean),
            ("bn1.running_var", &mut self.bn1.running_var),
            ("conv2.lin_self.weight", &mut self.conv2.lin_self.weight.value),
            ("conv2.lin_neigh.weight", &mut self.conv2.lin_neigh.weight.value),
            ("bn2.weight", &mut self.bn2.gamma.value),
            ("bn2.bias", &mut self.bn2.beta.value),
            ("bn2.running_mean", &mut self.bn2.running_mean),
            ("bn2.running_var", &mut self.bn2.running_var),
            ("classifier.weight", &mut self.classifier.weight.value),
        ];
        if let Some(bias) = &mut self.conv1.lin_neigh.bias {
            tensors.push(("conv1.lin_neigh.bias", &mut bias.value));
        }
        if let Some(bias) = &mut self.conv2.lin_neigh.bias {
            tensors.push(("conv2.lin_neigh.bias", &mut bias.value));
        }
        if let Some(bias) = &mut self.classifier.bias {
            tensors.push(("classifier.bias", &mut bias.value));
        }
        tensors
    }

    /// Snapshot of architecture and weights
    pub fn to_checkpoint(&self) -> ModelCheckpoint {
        let tensors = self
            .named_tensors()
            .into_iter()
            .map(|(name, m)| (name.to_string(), TensorState::from_matrix(m)))
            .collect();
        ModelCheckpoint {
            format_version: CHECKPOINT_FORMAT_VERSION,
            input_dim: self.input_dim,
            hidden_dim: self.hidden_dim,
            num_classes: self.num_classes,
            dropout: self.dropout,
            aggregator: self.aggregator(),
            tensors,
        }
    }

    /// Rebuild a model from a checkpoint for a graph with `input_dim` feature columns.
    /// A width mismatch is fatal: weights are never truncated or padded.
    pub fn from_checkpoint(checkpoint: &ModelCheckpoint, input_dim: usize) -> Result<Self, ModelError> {
        if checkpoint.input_dim != input_dim {
            return Err(ModelError::DimensionMismatch {
                expected: checkpoint.input_dim,
                found: input_dim,
            });
        }
        let config = ModelConfig {
            hidden_dim: checkpoint.hidden_dim,
            num_classes: checkpoint.num_classes,
            dropout: checkpoint.dropout,
            aggregator: checkpoint.aggregator,
            ..ModelConfig::default()
        };
        let mut model = Self::new(input_dim, &config);
        model.load_checkpoint(checkpoint)?;
        Ok(model)
    }

    /// Overwrite this model's weights from a checkpoint of the same architecture
    pub fn load_checkpoint(&mut self, checkpoint: &ModelCheckpoint) -> Result<(), ModelError> {
        if checkpoint.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(ModelError::InvalidCheckpoint(format!(
                "unsupported format version {}",
                checkpoint.format_version
            )));
        }
        if checkpoint.input_dim != self.input_dim {
            return Err(ModelError::DimensionMismatch {
                expected: self.input_dim,
                found: checkpoint.input_dim,
            });
        }
        if checkpoint.aggregator != self.aggregator() {
            return Err(ModelError::InvalidCheckpoint(format!(
                "checkpoint uses {} aggregation, model uses {}",
                checkpoint.aggregator,
                self.aggregator()
            )));
        }

        for (name, target) in self.named_tensors_mut() {
            let state = checkpoint
                .tensors
                .get(name)
                .ok_or_else(|| ModelError::InvalidCheckpoint(format!("missing tensor {}", name)))?;
            if (state.rows, state.cols) != target.shape() || state.data.len() != state.rows * state.cols {
                return Err(ModelError::InvalidCheckpoint(format!(
                    "tensor {} has shape {}x{}, expected {}x{}",
                    name,
                    state.rows,
                    state.cols,
                    target.nrows(),
                    target.ncols()
                )));
            }
            target.copy_from_slice(&state.data);
        }
        self.dropout = checkpoint.dropout;
        debug!("Loaded {} tensors from checkpoint", checkpoint.tensors.len());
        Ok(())
    }
}

/// Dense tensor stored column-major, matching the in-memory layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorState {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl TensorState {
    pub fn from_matrix(m: &DMatrix<f32>) -> Self {
        Self {
            rows: m.nrows(),
            cols: m.ncols(),
            data: m.as_slice().to_vec(),
        }
    }
}

/// Persisted model: architecture plus named weight tensors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    pub format_version: u32,
    /// Feature width the weights were trained against
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub num_classes: usize,
    pub dropout: f32,
    pub aggregator: AggregatorKind,
    pub tensors: BTreeMap<String, TensorState>,
}

impl ModelCheckpoint {
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        debug!("Saved checkpoint to {:?}", path);
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let file = std::fs::File::open(path)?;
        let checkpoint = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ModelConfig {
        ModelConfig {
            hidden_dim: 8,
            num_classes: 2,
            dropout: 0.3,
            aggregator: AggregatorKind::Mean,
            init_seed: 3,
        }
    }

    fn chain_graph() -> (DMatrix<f32>, Adjacency) {
        let adjacency = Adjacency::from_edges(4, &[(0, 1), (1, 2), (2, 3), (0, 3)]);
        let x = DMatrix::from_fn(4, 6, |r, c| ((r * 6 + c) as f32 * 0.37).sin());
        (x, adjacency)
    }

    #[test]
    fn test_output_shapes() {
        let model = WalletClassifier::new(6, &small_config());
        let (x, adjacency) = chain_graph();
        assert_eq!(model.forward(&x, &adjacency).unwrap().shape(), (4, 2));
        assert_eq!(model.get_embeddings(&x, &adjacency).unwrap().shape(), (4, 4));
        let probs = model.predict_proba(&x, &adjacency).unwrap();
        for r in 0..4 {
            assert!((probs.row(r).sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rejects_wrong_feature_width() {
        let model = WalletClassifier::new(6, &small_config());
        let adjacency = Adjacency::from_edges(4, &[]);
        let x = DMatrix::zeros(4, 5);
        assert!(matches!(
            model.forward(&x, &adjacency),
            Err(ModelError::DimensionMismatch { expected: 6, found: 5 })
        ));
    }

    #[test]
    fn test_parameter_count() {
        let model = WalletClassifier::new(6, &small_config());
        // conv1: 6*8*2 + 8, bn1: 16, conv2: 8*4*2 + 4, bn2: 8, head: 4*2 + 2
        assert_eq!(model.parameter_count(), 104 + 16 + 68 + 8 + 10);
        let mut model = model;
        let total: usize = model.parameters_mut().iter().map(|p| p.len()).sum();
        assert_eq!(total, model.parameter_count());
    }

    #[test]
    fn test_inference_is_deterministic() {
        let model = WalletClassifier::new(6, &small_config());
        let (x, adjacency) = chain_graph();
        let a = model.predict_proba(&x, &adjacency).unwrap();
        let b = model.predict_proba(&x, &adjacency).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_backward_populates_gradients() {
        let mut model = WalletClassifier::new(6, &small_config());
        let (x, adjacency) = chain_graph();
        let mut rng = StdRng::seed_from_u64(0);
        let (logits, cache) = model.forward_train(&x, &adjacency, &mut rng).unwrap();
        let grad = DMatrix::from_fn(logits.nrows(), logits.ncols(), |r, c| if c == r % 2 { 1.0 } else { -1.0 });
        model.zero_grad();
        model.backward(&adjacency, &cache, &grad);
        let head_grad = model.classifier.weight.grad.abs().sum();
        let first_layer_grad = model.conv1.lin_self.weight.grad.abs().sum();
        assert!(head_grad > 0.0);
        assert!(first_layer_grad > 0.0);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let mut model = WalletClassifier::new(6, &small_config());
        let (x, adjacency) = chain_graph();
        // move running stats away from their defaults
        let mut rng = StdRng::seed_from_u64(1);
        model.forward_train(&x, &adjacency, &mut rng).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        model.to_checkpoint().save(&path).unwrap();

        let loaded = ModelCheckpoint::load(&path).unwrap();
        let restored = WalletClassifier::from_checkpoint(&loaded, 6).unwrap();
        assert_eq!(
            model.predict_proba(&x, &adjacency).unwrap(),
            restored.predict_proba(&x, &adjacency).unwrap()
        );
    }

    #[test]
    fn test_checkpoint_dimension_mismatch_is_fatal() {
        let model = WalletClassifier::new(6, &small_config());
        let checkpoint = model.to_checkpoint();
        assert!(matches!(
            WalletClassifier::from_checkpoint(&checkpoint, 7),
            Err(ModelError::DimensionMismatch { expected: 6, found: 7 })
        ));

        let mut other = WalletClassifier::new(7, &small_config());
        assert!(other.load_checkpoint(&checkpoint).is_err());
    }

    #[test]
    fn test_checkpoint_missing_tensor() {
        let model = WalletClassifier::new(6, &small_config());
        let mut checkpoint = model.to_checkpoint();
        checkpoint.tensors.remove("bn2.running_var");
        assert!(matches!(
            WalletClassifier::from_checkpoint(&checkpoint, 6),
            Err(ModelError::InvalidCheckpoint(_))
        ));
    }
}
