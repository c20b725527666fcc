//! Smurfing Hunter CLI
//!
//! Trains the wallet classifier, writes suspicion score tables and extracts
//! k-hop neighborhoods for investigation.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use smurfing_hunter::config::HunterConfig;
use smurfing_hunter::graph::{GraphBuilder, TransactionGraph};
use smurfing_hunter::model::{ModelCheckpoint, WalletClassifier};
use smurfing_hunter::schemas::{RunMetadata, SuspicionRecord};
use smurfing_hunter::scoring::{compute_suspicion_scores, extract_k_hop_subgraph, write_scores, Subgraph};
use smurfing_hunter::train::Trainer;

#[derive(Parser)]
#[command(name = "smurfing-hunter")]
#[command(version)]
#[command(about = "Graph-based detection of fan-out/fan-in money laundering", long_about = None)]
struct Cli {
    /// Path to configuration file (optional, uses env vars if not provided)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory; re-roots the default input and output paths
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the graph, train, keep the best checkpoint and write the score table
    Train {
        /// Transactions table (CSV or Parquet)
        #[arg(short, long)]
        transactions: Option<PathBuf>,

        /// Labels table (CSV or Parquet)
        #[arg(short, long)]
        labels: Option<PathBuf>,

        #[arg(long)]
        epochs: Option<usize>,

        #[arg(long)]
        learning_rate: Option<f32>,

        #[arg(long)]
        hidden_dim: Option<usize>,

        /// Seed for the split, weight init and dropout
        #[arg(long)]
        seed: Option<u64>,

        /// Save the k-hop subgraph of this wallet next to the score table
        #[arg(long)]
        extract_subgraph: Option<String>,
    },

    /// Score every wallet with a saved checkpoint
    Score {
        #[arg(short, long)]
        transactions: Option<PathBuf>,

        #[arg(short, long)]
        labels: Option<PathBuf>,

        /// Checkpoint to load (defaults to the configured path)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Output table, .csv or .parquet
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Blend the degree-anomaly term into the score
        #[arg(long)]
        degree_boost: bool,
    },

    /// Print the k-hop neighborhood of a wallet as JSON
    Subgraph {
        /// Wallet identity at the center
        wallet: String,

        #[arg(long)]
        hops: Option<usize>,

        #[arg(short, long)]
        transactions: Option<PathBuf>,

        #[arg(short, long)]
        labels: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => HunterConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => HunterConfig::load().context("Failed to load config from environment")?,
    };

    if let Some(dir) = cli.data_dir {
        config.set_data_dir(dir);
    }

    match cli.command {
        Commands::Train {
            transactions,
            labels,
            epochs,
            learning_rate,
            hidden_dim,
            seed,
            extract_subgraph,
        } => {
            override_inputs(&mut config, transactions, labels);
            if let Some(epochs) = epochs {
                config.training.epochs = epochs;
            }
            if let Some(lr) = learning_rate {
                config.training.learning_rate = lr;
            }
            if let Some(hidden) = hidden_dim {
                config.model.hidden_dim = hidden;
            }
            if let Some(seed) = seed {
                config.split.seed = seed;
                config.training.seed = seed;
                config.model.init_seed = seed;
            }
            config.validate()?;
            config.ensure_directories()?;
            cmd_train(&config, extract_subgraph.as_deref())?;
        }
        Commands::Score {
            transactions,
            labels,
            checkpoint,
            output,
            degree_boost,
        } => {
            override_inputs(&mut config, transactions, labels);
            if let Some(path) = checkpoint {
                config.paths.checkpoint = path;
            }
            if let Some(path) = output {
                config.paths.scores = path;
            }
            config.scoring.use_degree_boost |= degree_boost;
            config.ensure_directories()?;
            cmd_score(&config)?;
        }
        Commands::Subgraph {
            wallet,
            hops,
            transactions,
            labels,
        } => {
            override_inputs(&mut config, transactions, labels);
            let hops = hops.unwrap_or(config.scoring.subgraph_hops);
            cmd_subgraph(&config, &wallet, hops)?;
        }
    }

    Ok(())
}

fn override_inputs(config: &mut HunterConfig, transactions: Option<PathBuf>, labels: Option<PathBuf>) {
    if let Some(path) = transactions {
        config.paths.transactions = path;
    }
    if let Some(path) = labels {
        config.paths.labels = path;
    }
}

fn load_graph(config: &HunterConfig) -> Result<TransactionGraph> {
    for path in [&config.paths.transactions, &config.paths.labels] {
        if !path.exists() {
            anyhow::bail!("Input table not found: {:?}", path);
        }
    }
    GraphBuilder::from_config(config)
        .build_from_paths(&config.paths.transactions, &config.paths.labels)
        .context("Failed to build transaction graph")
}

fn cmd_train(config: &HunterConfig, extract_wallet: Option<&str>) -> Result<()> {
    info!("=== Training ===");

    let graph = load_graph(config)?;
    let mut model = WalletClassifier::new(graph.num_features(), &config.model);
    let report = Trainer::from_config(config)
        .train(&mut model, &graph)
        .context("Training failed")?;

    info!("Test classification report:\n{}", report.test.report);

    // Write metadata
    let mut metadata = RunMetadata::new(graph.record_counts());
    metadata.best_epoch = report.best_epoch;
    metadata.best_val_auc = report.best_val_auc;
    metadata.test_auc = report.test.auc;
    let metadata_path = metadata_path(&config.paths.checkpoint);
    metadata.save(&metadata_path)?;
    info!("Metadata saved to {:?}", metadata_path);

    let records = compute_suspicion_scores(&model, &graph, &config.scoring)?;
    log_top_scores(&records);
    write_scores(&records, &config.paths.scores).context("Failed to write score table")?;

    if let Some(wallet) = extract_wallet {
        let subgraph = extract_k_hop_subgraph(&graph, wallet, config.scoring.subgraph_hops);
        log_subgraph(&subgraph);
        let path = subgraph_path(&config.paths.scores, wallet);
        subgraph
            .save(&path)
            .with_context(|| format!("Failed to write subgraph to {:?}", path))?;
        info!("Subgraph saved to {:?}", path);
    }
    Ok(())
}

fn cmd_score(config: &HunterConfig) -> Result<()> {
    info!("=== Scoring ===");

    let graph = load_graph(config)?;
    let checkpoint = ModelCheckpoint::load(&config.paths.checkpoint)
        .with_context(|| format!("Failed to load checkpoint {:?}", config.paths.checkpoint))?;
    let model = WalletClassifier::from_checkpoint(&checkpoint, graph.num_features())
        .context("Checkpoint does not fit this graph")?;

    let records = compute_suspicion_scores(&model, &graph, &config.scoring)?;
    log_top_scores(&records);
    write_scores(&records, &config.paths.scores).context("Failed to write score table")?;
    Ok(())
}

fn cmd_subgraph(config: &HunterConfig, wallet: &str, hops: usize) -> Result<()> {
    let graph = load_graph(config)?;
    print_subgraph(&graph, wallet, hops)
}

fn print_subgraph(graph: &TransactionGraph, wallet: &str, hops: usize) -> Result<()> {
    let subgraph = extract_k_hop_subgraph(graph, wallet, hops);
    log_subgraph(&subgraph);
    println!("{}", serde_json::to_string_pretty(&subgraph)?);
    Ok(())
}

fn log_subgraph(subgraph: &Subgraph) {
    if subgraph.is_empty() {
        warn!("No subgraph for {}", subgraph.center);
    } else {
        info!(
            "{}-hop subgraph of {}: {} nodes, {} edges",
            subgraph.hops,
            subgraph.center,
            subgraph.num_nodes(),
            subgraph.num_edges()
        );
    }
}

fn log_top_scores(records: &[SuspicionRecord]) {
    info!("Top suspicious wallets:");
    for record in records.iter().take(10) {
        info!(
            "  {:<44} {:.4} (predicted {}, true {})",
            record.wallet_id, record.suspicion_score, record.predicted_label, record.true_label
        );
    }
}

fn subgraph_path(scores: &Path, wallet: &str) -> PathBuf {
    scores.with_file_name(format!("subgraph_{}.json", wallet))
}

fn metadata_path(checkpoint: &Path) -> PathBuf {
    checkpoint.with_file_name("run_metadata.json")
}
