//! Configuration management for the detection pipeline.
//!
//! Supports loading from environment variables, TOML config files, and CLI overrides.
//! Every random draw in the pipeline is seeded from values carried here, so a run is
//! reproducible from its config alone.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HunterConfig {
    /// Input/output paths
    #[serde(default)]
    pub paths: PathConfig,

    /// Graph construction settings
    #[serde(default)]
    pub graph: GraphConfig,

    /// Stratified split settings
    #[serde(default)]
    pub split: SplitConfig,

    /// Classifier architecture
    #[serde(default)]
    pub model: ModelConfig,

    /// Optimizer and schedule
    #[serde(default)]
    pub training: TrainingConfig,

    /// Post-hoc scoring and drill-down
    #[serde(default)]
    pub scoring: ScoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Transactions table (CSV or Parquet)
    #[serde(default = "default_transactions")]
    pub transactions: PathBuf,

    /// Labels table (CSV or Parquet)
    #[serde(default = "default_labels")]
    pub labels: PathBuf,

    /// Where the best checkpoint is written during training
    #[serde(default = "default_checkpoint")]
    pub checkpoint: PathBuf,

    /// Suspicion score table output
    #[serde(default = "default_scores")]
    pub scores: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            transactions: default_transactions(),
            labels: default_labels(),
            checkpoint: default_checkpoint(),
            scores: default_scores(),
        }
    }
}

/// How wallets that never appear in the labels table are treated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnlabeledPolicy {
    /// Unlabeled wallets get label 0 and take part in loss and metrics
    #[default]
    TreatAsClean,
    /// Unlabeled wallets get label 0 for reporting but are skipped by loss and metrics
    ExcludeFromLoss,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub unlabeled_policy: UnlabeledPolicy,

    /// Z-score normalize the feature matrix column-wise
    #[serde(default = "default_true")]
    pub normalize_features: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            unlabeled_policy: UnlabeledPolicy::default(),
            normalize_features: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    #[serde(default = "default_train_ratio")]
    pub train_ratio: f64,

    #[serde(default = "default_val_ratio")]
    pub val_ratio: f64,

    /// Seed for the per-class shuffle
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Raise each class's train share to at least this many members (0 = pure floor)
    #[serde(default)]
    pub min_train_per_class: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train_ratio: default_train_ratio(),
            val_ratio: default_val_ratio(),
            seed: default_seed(),
            min_train_per_class: 0,
        }
    }
}

impl SplitConfig {
    pub fn test_ratio(&self) -> f64 {
        (1.0 - self.train_ratio - self.val_ratio).max(0.0)
    }
}

/// Neighborhood aggregation strategy used by both message-passing layers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AggregatorKind {
    #[default]
    Mean,
    Sum,
    Max,
}

impl std::fmt::Display for AggregatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregatorKind::Mean => write!(f, "mean"),
            AggregatorKind::Sum => write!(f, "sum"),
            AggregatorKind::Max => write!(f, "max"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,

    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    /// Dropout probability, active only in training mode
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    #[serde(default)]
    pub aggregator: AggregatorKind,

    /// Seed for weight initialization
    #[serde(default = "default_seed")]
    pub init_seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_dim: default_hidden_dim(),
            num_classes: default_num_classes(),
            dropout: default_dropout(),
            aggregator: AggregatorKind::default(),
            init_seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    /// L2 penalty folded into the Adam gradient
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,

    /// Epochs without validation AUC improvement before the learning rate is cut
    #[serde(default = "default_patience")]
    pub lr_patience: usize,

    /// Multiplier applied to the learning rate on plateau
    #[serde(default = "default_lr_factor")]
    pub lr_factor: f32,

    /// Seed for dropout masks
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Log a progress line every N epochs (epoch 1 is always logged)
    #[serde(default = "default_log_every")]
    pub log_every: usize,

    /// Persist the best checkpoint to `paths.checkpoint` whenever it improves
    #[serde(default = "default_true")]
    pub persist_checkpoints: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            lr_patience: default_patience(),
            lr_factor: default_lr_factor(),
            seed: default_seed(),
            log_every: default_log_every(),
            persist_checkpoints: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Probability above which a wallet is predicted illicit
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Weight of the degree-anomaly boost in the composite score
    #[serde(default = "default_degree_weight")]
    pub degree_weight: f32,

    /// Blend the degree-anomaly term into the score table
    #[serde(default)]
    pub use_degree_boost: bool,

    /// Hops for forensic drill-down
    #[serde(default = "default_hops")]
    pub subgraph_hops: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            degree_weight: default_degree_weight(),
            use_degree_boost: false,
            subgraph_hops: default_hops(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_transactions() -> PathBuf {
    PathBuf::from("data/transactions.csv")
}

fn default_labels() -> PathBuf {
    PathBuf::from("data/labels.csv")
}

fn default_checkpoint() -> PathBuf {
    PathBuf::from("data/models/best_model.json")
}

fn default_scores() -> PathBuf {
    PathBuf::from("data/suspicion_scores.csv")
}

fn default_train_ratio() -> f64 {
    0.6
}

fn default_val_ratio() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

fn default_hidden_dim() -> usize {
    128
}

fn default_num_classes() -> usize {
    2
}

fn default_dropout() -> f32 {
    0.3
}

fn default_epochs() -> usize {
    50
}

fn default_learning_rate() -> f32 {
    0.01
}

fn default_weight_decay() -> f32 {
    1e-5
}

fn default_patience() -> usize {
    5
}

fn default_lr_factor() -> f32 {
    0.5
}

fn default_log_every() -> usize {
    5
}

fn default_threshold() -> f32 {
    0.5
}

fn default_degree_weight() -> f32 {
    0.1
}

fn default_hops() -> usize {
    2
}

impl HunterConfig {
    /// Load configuration from defaults with environment overrides
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML config file with environment overrides
    pub fn load_from_file(path: &PathBuf) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = ::toml::from_str(&contents)?;

        // Environment variables override file settings
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(seed) = std::env::var("SMURF_SEED") {
            let seed: u64 = seed
                .parse()
                .map_err(|_| anyhow::anyhow!("SMURF_SEED must be an unsigned integer"))?;
            self.split.seed = seed;
            self.training.seed = seed;
            self.model.init_seed = seed;
        }
        if let Ok(epochs) = std::env::var("SMURF_EPOCHS") {
            self.training.epochs = epochs
                .parse()
                .map_err(|_| anyhow::anyhow!("SMURF_EPOCHS must be an unsigned integer"))?;
        }
        if let Ok(lr) = std::env::var("SMURF_LEARNING_RATE") {
            self.training.learning_rate = lr
                .parse()
                .map_err(|_| anyhow::anyhow!("SMURF_LEARNING_RATE must be a number"))?;
        }
        if let Ok(dir) = std::env::var("SMURF_DATA_DIR") {
            self.set_data_dir(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Re-root every default path under a new data directory
    pub fn set_data_dir(&mut self, dir: PathBuf) {
        self.paths.transactions = dir.join("transactions.csv");
        self.paths.labels = dir.join("labels.csv");
        self.paths.checkpoint = dir.join("models").join("best_model.json");
        self.paths.scores = dir.join("suspicion_scores.csv");
        self.paths.data_dir = dir;
    }

    /// Validate ranges that would otherwise surface as numeric garbage mid-run
    pub fn validate(&self) -> anyhow::Result<()> {
        let split = &self.split;
        if !(0.0..=1.0).contains(&split.train_ratio) || !(0.0..=1.0).contains(&split.val_ratio) {
            anyhow::bail!("split ratios must be within [0, 1]");
        }
        if split.train_ratio + split.val_ratio > 1.0 + 1e-9 {
            anyhow::bail!("train_ratio + val_ratio must not exceed 1");
        }
        if self.model.hidden_dim < 2 {
            anyhow::bail!("hidden_dim must be >= 2");
        }
        if self.model.num_classes < 2 {
            anyhow::bail!("num_classes must be >= 2");
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            anyhow::bail!("dropout must be within [0, 1)");
        }
        if self.training.epochs == 0 {
            anyhow::bail!("epochs must be > 0");
        }
        if self.training.learning_rate <= 0.0 {
            anyhow::bail!("learning_rate must be > 0");
        }
        if !(self.training.lr_factor > 0.0 && self.training.lr_factor < 1.0) {
            anyhow::bail!("lr_factor must be within (0, 1)");
        }
        if !(0.0..=1.0).contains(&self.scoring.threshold) {
            anyhow::bail!("scoring threshold must be within [0, 1]");
        }
        Ok(())
    }

    /// Ensure all output directories exist
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.paths.data_dir)?;
        for path in [&self.paths.checkpoint, &self.paths.scores] {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HunterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.hidden_dim, 128);
        assert_eq!(config.training.lr_patience, 5);
        assert!((config.split.test_ratio() - 0.2).abs() < 1e-9);
        assert_eq!(config.graph.unlabeled_policy, UnlabeledPolicy::TreatAsClean);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml = r#"
            [split]
            train_ratio = 0.8
            val_ratio = 0.1

            [model]
            aggregator = "max"

            [graph]
            unlabeled_policy = "exclude_from_loss"
        "#;
        let config: HunterConfig = ::toml::from_str(toml).unwrap();
        assert!((config.split.train_ratio - 0.8).abs() < 1e-12);
        assert_eq!(config.split.seed, 42);
        assert_eq!(config.model.aggregator, AggregatorKind::Max);
        assert_eq!(config.model.hidden_dim, 128);
        assert_eq!(config.graph.unlabeled_policy, UnlabeledPolicy::ExcludeFromLoss);
        assert!(config.graph.normalize_features);
    }

    #[test]
    fn test_rejects_oversized_ratios() {
        let mut config = HunterConfig::default();
        config.split.train_ratio = 0.9;
        config.split.val_ratio = 0.3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_set_data_dir_reroots_paths() {
        let mut config = HunterConfig::default();
        config.set_data_dir(PathBuf::from("/tmp/run1"));
        assert_eq!(config.paths.labels, PathBuf::from("/tmp/run1/labels.csv"));
        assert_eq!(
            config.paths.checkpoint,
            PathBuf::from("/tmp/run1/models/best_model.json")
        );
    }
}
