//! Evaluation metrics for binary wallet classification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricError {
    #[error("AUC is undefined: only one class present in the evaluation set")]
    SingleClass,

    #[error("No samples to evaluate")]
    Empty,

    #[error("Length mismatch: {labels} labels vs {scores} scores")]
    LengthMismatch { labels: usize, scores: usize },
}

/// Area under the ROC curve for the positive class (label 1).
///
/// Computed from the Mann-Whitney rank statistic; tied scores share their average rank.
pub fn roc_auc(labels: &[u8], scores: &[f32]) -> Result<f64, MetricError> {
    if labels.len() != scores.len() {
        return Err(MetricError::LengthMismatch {
            labels: labels.len(),
            scores: scores.len(),
        });
    }
    if labels.is_empty() {
        return Err(MetricError::Empty);
    }
    let n_pos = labels.iter().filter(|&&l| l == 1).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return Err(MetricError::SingleClass);
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut pos_rank_sum = 0.0f64;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // ranks are 1-based: the tie group occupies ranks start+1..=end
        let avg_rank = (start + 1 + end) as f64 / 2.0;
        for &i in &order[start..end] {
            if labels[i] == 1 {
                pos_rank_sum += avg_rank;
            }
        }
        start = end;
    }

    let n_pos = n_pos as f64;
    let n_neg = n_neg as f64;
    Ok((pos_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

/// Fraction of predictions equal to the true label. Empty input yields 0.
pub fn accuracy(labels: &[u8], predictions: &[u8]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = labels
        .iter()
        .zip(predictions)
        .filter(|(l, p)| l == p)
        .count();
    correct as f64 / labels.len() as f64
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Per-class precision/recall/F1 with macro and support-weighted averages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    /// Indexed by class label
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
}

impl ClassificationReport {
    /// Build a report over `num_classes` labels. Undefined ratios (0/0) are reported as 0.
    pub fn new(labels: &[u8], predictions: &[u8], num_classes: usize) -> Self {
        let mut tp = vec![0usize; num_classes];
        let mut predicted = vec![0usize; num_classes];
        let mut support = vec![0usize; num_classes];
        for (&l, &p) in labels.iter().zip(predictions) {
            let (l, p) = (l as usize, p as usize);
            if l < num_classes {
                support[l] += 1;
            }
            if p < num_classes {
                predicted[p] += 1;
            }
            if l == p && l < num_classes {
                tp[l] += 1;
            }
        }

        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let classes: Vec<ClassMetrics> = (0..num_classes)
            .map(|c| {
                let precision = ratio(tp[c], predicted[c]);
                let recall = ratio(tp[c], support[c]);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    precision,
                    recall,
                    f1,
                    support: support[c],
                }
            })
            .collect();

        let total: usize = support.iter().sum();
        let average = |weight: &dyn Fn(&ClassMetrics) -> f64, norm: f64| {
            let mut avg = ClassMetrics {
                support: total,
                ..ClassMetrics::default()
            };
            if norm == 0.0 {
                return avg;
            }
            for m in &classes {
                let w = weight(m);
                avg.precision += w * m.precision / norm;
                avg.recall += w * m.recall / norm;
                avg.f1 += w * m.f1 / norm;
            }
            avg
        };
        let macro_avg = average(&|_: &ClassMetrics| 1.0, num_classes as f64);
        let weighted_avg = average(&|m: &ClassMetrics| m.support as f64, total as f64);

        Self {
            accuracy: accuracy(labels, predictions),
            classes,
            macro_avg,
            weighted_avg,
        }
    }
}

impl std::fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:>14} {:>9} {:>9} {:>9} {:>9}", "", "precision", "recall", "f1-score", "support")?;
        let row = |f: &mut std::fmt::Formatter<'_>, name: &str, m: &ClassMetrics| {
            writeln!(
                f,
                "{:>14} {:>9.4} {:>9.4} {:>9.4} {:>9}",
                name, m.precision, m.recall, m.f1, m.support
            )
        };
        for (c, m) in self.classes.iter().enumerate() {
            let name = match c {
                0 => "clean".to_string(),
                1 => "illicit".to_string(),
                other => format!("class {}", other),
            };
            row(f, &name, m)?;
        }
        writeln!(f, "{:>14} {:>9} {:>9} {:>9.4} {:>9}", "accuracy", "", "", self.accuracy, self.macro_avg.support)?;
        row(f, "macro avg", &self.macro_avg)?;
        row(f, "weighted avg", &self.weighted_avg)
    }
}
