//! Data schemas for the detection pipeline.
//!
//! Column names of the input tables and the score table, the row-level record
//! types, and run metadata live here so every stage agrees on one definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version for tracking changes
pub const SCHEMA_VERSION: &str = "1.0.0";

// ============================================================================
// PART A: Transactions table
// ============================================================================

pub const COL_SOURCE: &str = "Source_Wallet_ID";
pub const COL_DEST: &str = "Dest_Wallet_ID";
pub const COL_TIMESTAMP: &str = "Timestamp";
pub const COL_AMOUNT: &str = "Amount";

/// Columns every transactions table must carry. Anything else passes through untouched.
pub const TRANSACTION_COLUMNS: [&str; 4] = [COL_SOURCE, COL_DEST, COL_TIMESTAMP, COL_AMOUNT];

/// One transfer between two wallets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub source: String,
    pub dest: String,
    pub timestamp: DateTime<Utc>,
    /// Non-negative amount in the chain's display unit
    pub amount: f64,
}

impl TransactionRecord {
    pub fn new(
        source: impl Into<String>,
        dest: impl Into<String>,
        amount: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            timestamp,
            amount,
        }
    }
}

// ============================================================================
// PART B: Labels table
// ============================================================================

pub const COL_WALLET: &str = "Wallet_ID";
pub const COL_LABEL: &str = "Label";

/// Ground-truth label for a wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRecord {
    pub wallet_id: String,
    /// 0 = clean, 1 = illicit
    pub label: u8,
}

impl LabelRecord {
    pub const CLEAN: u8 = 0;
    pub const ILLICIT: u8 = 1;

    pub fn new(wallet_id: impl Into<String>, label: u8) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            label,
        }
    }
}

// ============================================================================
// PART C: Suspicion score table
// ============================================================================

pub const COL_SCORE: &str = "Suspicion_Score";
pub const COL_PREDICTED: &str = "Predicted_Label";
pub const COL_TRUE: &str = "True_Label";

/// One row of the suspicion score table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspicionRecord {
    pub wallet_id: String,
    /// In [0, 1]
    pub suspicion_score: f32,
    pub predicted_label: u8,
    pub true_label: u8,
}

// ============================================================================
// Metadata Schema
// ============================================================================

/// Run metadata for reproducibility and auditing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Schema version used
    pub schema_version: String,

    /// Pipeline run timestamp
    pub run_timestamp: DateTime<Utc>,

    /// Record counts by type
    pub record_counts: RecordCounts,

    /// Epoch whose weights were kept (None when no epoch improved validation AUC)
    pub best_epoch: Option<usize>,

    pub best_val_auc: f64,

    pub test_auc: f64,

    /// Git commit hash (if available)
    pub git_commit: Option<String>,

    /// Pipeline version
    pub pipeline_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecordCounts {
    pub wallets: usize,
    pub transactions: usize,
    pub labeled_wallets: usize,
    pub illicit_wallets: usize,
}

impl RunMetadata {
    pub fn new(record_counts: RecordCounts) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_timestamp: Utc::now(),
            record_counts,
            best_epoch: None,
            best_val_auc: 0.0,
            test_auc: 0.0,
            git_commit: get_git_commit(),
            pipeline_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn get_git_commit() -> Option<String> {
    std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                String::from_utf8(output.stdout)
                    .ok()
                    .map(|s| s.trim().to_string())
            } else {
                None
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_version() {
        assert!(!SCHEMA_VERSION.is_empty());
    }

    #[test]
    fn test_metadata_serializes() {
        let meta = RunMetadata::new(RecordCounts {
            wallets: 3,
            transactions: 2,
            labeled_wallets: 1,
            illicit_wallets: 1,
        });
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"wallets\":3"));
        assert!(json.contains(SCHEMA_VERSION));
    }
}
