//! Stratified train/validation/test partitioning.
//!
//! Each label class is shuffled and cut independently so every split keeps the
//! class balance of the whole graph. The seed comes from [`SplitConfig`]; there is
//! no process-wide RNG.

use crate::config::SplitConfig;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SplitKind {
    Train,
    Val,
    Test,
}

impl std::fmt::Display for SplitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SplitKind::Train => write!(f, "train"),
            SplitKind::Val => write!(f, "val"),
            SplitKind::Test => write!(f, "test"),
        }
    }
}

/// Three mutually exclusive boolean masks covering every node
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SplitMasks {
    pub train: Vec<bool>,
    pub val: Vec<bool>,
    pub test: Vec<bool>,
}

impl SplitMasks {
    pub fn len(&self) -> usize {
        self.train.len()
    }

    pub fn is_empty(&self) -> bool {
        self.train.is_empty()
    }

    pub fn mask(&self, kind: SplitKind) -> &[bool] {
        match kind {
            SplitKind::Train => &self.train,
            SplitKind::Val => &self.val,
            SplitKind::Test => &self.test,
        }
    }

    /// Node indices in the given split, ascending
    pub fn indices(&self, kind: SplitKind) -> Vec<usize> {
        self.mask(kind)
            .iter()
            .enumerate()
            .filter_map(|(i, &m)| m.then_some(i))
            .collect()
    }

    pub fn count(&self, kind: SplitKind) -> usize {
        self.mask(kind).iter().filter(|&&m| m).count()
    }

    /// Which split a node belongs to
    pub fn assignment(&self, node: usize) -> Option<SplitKind> {
        if *self.train.get(node)? {
            Some(SplitKind::Train)
        } else if self.val[node] {
            Some(SplitKind::Val)
        } else if self.test[node] {
            Some(SplitKind::Test)
        } else {
            None
        }
    }
}

/// Build stratified masks for a label vector.
///
/// Per class of size `n`: `floor(n * train_ratio)` nodes go to train (raised to
/// `min(n, min_train_per_class)` when configured), `floor(n * val_ratio)` to
/// validation, and the remainder to test.
pub fn create_stratified_masks(labels: &[u8], config: &SplitConfig) -> SplitMasks {
    let num_nodes = labels.len();
    let mut masks = SplitMasks {
        train: vec![false; num_nodes],
        val: vec![false; num_nodes],
        test: vec![false; num_nodes],
    };

    // BTreeMap keeps class iteration order fixed, so one seeded RNG is reproducible
    let mut by_class: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(i);
    }

    let mut rng = StdRng::seed_from_u64(config.seed);

    for (_, mut indices) in by_class {
        let n = indices.len();
        indices.shuffle(&mut rng);

        let mut n_train = (n as f64 * config.train_ratio).floor() as usize;
        let mut n_val = (n as f64 * config.val_ratio).floor() as usize;
        if n_train < config.min_train_per_class {
            n_train = config.min_train_per_class.min(n);
        }
        n_train = n_train.min(n);
        n_val = n_val.min(n - n_train);

        for &i in &indices[..n_train] {
            masks.train[i] = true;
        }
        for &i in &indices[n_train..n_train + n_val] {
            masks.val[i] = true;
        }
        for &i in &indices[n_train + n_val..] {
            masks.test[i] = true;
        }
    }

    masks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_config(train: f64, val: f64, seed: u64) -> SplitConfig {
        SplitConfig {
            train_ratio: train,
            val_ratio: val,
            seed,
            min_train_per_class: 0,
        }
    }

    fn assert_partition(masks: &SplitMasks, n: usize) {
        assert_eq!(masks.len(), n);
        for i in 0..n {
            let hits = [masks.train[i], masks.val[i], masks.test[i]]
                .iter()
                .filter(|&&m| m)
                .count();
            assert_eq!(hits, 1, "node {} is in {} splits", i, hits);
        }
    }

    #[test]
    fn test_masks_partition_nodes() {
        let distributions: Vec<Vec<u8>> = vec![
            vec![],
            vec![1],
            vec![0, 0, 0],
            (0..97).map(|i| (i % 7 == 0) as u8).collect(),
            (0..10).map(|i| (i % 2) as u8).collect(),
        ];
        for labels in distributions {
            for (train, val) in [(0.6, 0.2), (0.0, 0.0), (1.0, 0.0), (0.5, 0.5), (0.33, 0.33)] {
                let masks = create_stratified_masks(&labels, &split_config(train, val, 7));
                assert_partition(&masks, labels.len());
            }
        }
    }

    #[test]
    fn test_stratified_counts() {
        // 50 clean, 10 illicit
        let labels: Vec<u8> = (0..60).map(|i| (i >= 50) as u8).collect();
        let masks = create_stratified_masks(&labels, &split_config(0.6, 0.2, 42));

        let illicit_in = |kind| {
            masks
                .indices(kind)
                .into_iter()
                .filter(|&i| labels[i] == 1)
                .count()
        };
        assert_eq!(masks.count(SplitKind::Train), 30 + 6);
        assert_eq!(masks.count(SplitKind::Val), 10 + 2);
        assert_eq!(masks.count(SplitKind::Test), 10 + 2);
        assert_eq!(illicit_in(SplitKind::Train), 6);
        assert_eq!(illicit_in(SplitKind::Val), 2);
        assert_eq!(illicit_in(SplitKind::Test), 2);
    }

    #[test]
    fn test_same_seed_same_split() {
        let labels: Vec<u8> = (0..200).map(|i| (i % 5 == 0) as u8).collect();
        let a = create_stratified_masks(&labels, &split_config(0.6, 0.2, 11));
        let b = create_stratified_masks(&labels, &split_config(0.6, 0.2, 11));
        assert_eq!(a, b);
    }

    #[test]
    fn test_small_class_floor_and_minimum() {
        // One illicit wallet: floor(1 * 0.6) = 0 in train
        let labels = vec![0, 0, 1];
        let masks = create_stratified_masks(&labels, &split_config(0.6, 0.2, 1));
        assert!(!masks.train[2]);
        assert!(masks.test[2]);

        let mut config = split_config(0.6, 0.2, 1);
        config.min_train_per_class = 1;
        let masks = create_stratified_masks(&labels, &config);
        assert!(masks.train[2]);
        assert_partition(&masks, 3);
    }

    #[test]
    fn test_assignment_lookup() {
        let labels = vec![0; 10];
        let masks = create_stratified_masks(&labels, &split_config(0.6, 0.2, 3));
        for i in 0..10 {
            let kind = masks.assignment(i).unwrap();
            assert!(masks.mask(kind)[i]);
        }
        assert_eq!(masks.assignment(10), None);
    }
}
