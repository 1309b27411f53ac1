//! # Calibration Scoring
//!
//! Scores predicted next-state distributions against one-hot truth. Every
//! metric keeps its per-class breakdown next to the aggregate.
//!
//! - Mean true-class probability (MTP): per class, the average probability
//!   assigned to that class over the rows that truly belong to it. Classes
//!   without true rows are undefined and excluded from the overall mean.
//! - Brier score: squared error per cell, averaged over rows for each class,
//!   summed over classes.
//! - Distance-weighted Brier score: as above, but in a row whose true class is
//!   `c` the error of class `j` is weighted by `(|j - c| + 1)^p`, normalized to
//!   sum to one across the row. Confusing distant states costs more than
//!   confusing adjacent ones.
//! - Accuracy of the arg-max prediction and one-vs-rest ROC AUC per class.

use ndarray::{Array1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Settings for the `[scoring]` section of the pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringSettings {
    /// Exponent `p` of the distance weights.
    pub distance_power: f64,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            distance_power: 1.0,
        }
    }
}

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Predictions have shape {predicted:?} but the truth matrix has shape {truth:?}.")]
    ShapeMismatch {
        predicted: (usize, usize),
        truth: (usize, usize),
    },
    #[error("Cannot score zero rows.")]
    EmptyInput,
    #[error("Expected {expected} state labels, got {found}.")]
    LabelCount { expected: usize, found: usize },
}

fn check_shapes(predicted: ArrayView2<f64>, truth: ArrayView2<f64>) -> Result<(), MetricsError> {
    if predicted.dim() != truth.dim() {
        return Err(MetricsError::ShapeMismatch {
            predicted: predicted.dim(),
            truth: truth.dim(),
        });
    }
    if predicted.nrows() == 0 {
        return Err(MetricsError::EmptyInput);
    }
    Ok(())
}

/// Column index of the largest entry in every row (first one on ties).
fn row_argmax(matrix: ArrayView2<f64>) -> Vec<usize> {
    matrix
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |(best, max), (i, &v)| {
                    if v > max { (i, v) } else { (best, max) }
                })
                .0
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeanTrueProbability {
    /// `None` for classes with no true rows.
    pub per_class: Vec<Option<f64>>,
    /// Mean over defined classes; `None` only if no class is defined.
    pub overall: Option<f64>,
}

pub fn mean_true_probability(
    predicted: ArrayView2<f64>,
    truth: ArrayView2<f64>,
) -> Result<MeanTrueProbability, MetricsError> {
    check_shapes(predicted, truth)?;
    let per_class: Vec<Option<f64>> = (0..predicted.ncols())
        .map(|c| {
            let (sum, count) = predicted
                .column(c)
                .iter()
                .zip(truth.column(c).iter())
                .filter(|&(_, &t)| t == 1.0)
                .fold((0.0, 0usize), |(s, n), (&p, _)| (s + p, n + 1));
            (count > 0).then(|| sum / count as f64)
        })
        .collect();

    let defined: Vec<f64> = per_class.iter().flatten().copied().collect();
    let overall = (!defined.is_empty()).then(|| defined.iter().sum::<f64>() / defined.len() as f64);
    Ok(MeanTrueProbability { per_class, overall })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrierScore {
    pub per_class: Vec<f64>,
    pub total: f64,
}

impl BrierScore {
    fn from_per_class(per_class: Array1<f64>) -> Self {
        let total = per_class.sum();
        Self {
            per_class: per_class.to_vec(),
            total,
        }
    }
}

pub fn brier_score(
    predicted: ArrayView2<f64>,
    truth: ArrayView2<f64>,
) -> Result<BrierScore, MetricsError> {
    check_shapes(predicted, truth)?;
    let squared = (&predicted - &truth).mapv(|d| d * d);
    let per_class = squared
        .mean_axis(Axis(0))
        .ok_or(MetricsError::EmptyInput)?;
    Ok(BrierScore::from_per_class(per_class))
}

pub fn weighted_brier_score(
    predicted: ArrayView2<f64>,
    truth: ArrayView2<f64>,
    distance_power: f64,
) -> Result<BrierScore, MetricsError> {
    check_shapes(predicted, truth)?;
    let classes = predicted.ncols();
    let mut weighted = (&predicted - &truth).mapv(|d| d * d);

    for (mut row, true_class) in weighted.rows_mut().into_iter().zip(row_argmax(truth)) {
        let weights: Vec<f64> = (0..classes)
            .map(|j| ((j.abs_diff(true_class) + 1) as f64).powf(distance_power))
            .collect();
        let norm: f64 = weights.iter().sum();
        for (cell, w) in row.iter_mut().zip(weights) {
            *cell *= w / norm;
        }
    }

    let per_class = weighted
        .mean_axis(Axis(0))
        .ok_or(MetricsError::EmptyInput)?;
    Ok(BrierScore::from_per_class(per_class))
}

/// Fraction of rows whose arg-max prediction is the true class.
pub fn accuracy(predicted: ArrayView2<f64>, truth: ArrayView2<f64>) -> Result<f64, MetricsError> {
    check_shapes(predicted, truth)?;
    let hits = row_argmax(predicted)
        .into_iter()
        .zip(row_argmax(truth))
        .filter(|(p, t)| p == t)
        .count();
    Ok(hits as f64 / predicted.nrows() as f64)
}

/// One-vs-rest ROC AUC per class from the Mann-Whitney rank statistic. Tied
/// scores share their average rank. `None` when a class lacks positives or
/// negatives.
pub fn roc_auc_per_class(
    predicted: ArrayView2<f64>,
    truth: ArrayView2<f64>,
) -> Result<Vec<Option<f64>>, MetricsError> {
    check_shapes(predicted, truth)?;
    let n = predicted.nrows();

    Ok((0..predicted.ncols())
        .map(|c| {
            let scores = predicted.column(c);
            let labels = truth.column(c);
            let positives = labels.iter().filter(|&&t| t == 1.0).count();
            let negatives = n - positives;
            if positives == 0 || negatives == 0 {
                return None;
            }

            let mut order: Vec<usize> = (0..n).collect();
            order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

            let mut positive_rank_sum = 0.0;
            let mut start = 0;
            while start < n {
                let mut end = start + 1;
                while end < n && scores[order[end]] == scores[order[start]] {
                    end += 1;
                }
                // Ranks are 1-based; the tie group spans ranks start+1..=end.
                let average_rank = (start + 1 + end) as f64 / 2.0;
                let tied_positives = order[start..end]
                    .iter()
                    .filter(|&&i| labels[i] == 1.0)
                    .count();
                positive_rank_sum += average_rank * tied_positives as f64;
                start = end;
            }

            let p = positives as f64;
            Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
        })
        .collect())
}

/// Per-class line of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    pub state: u32,
    /// Test rows whose true next state is this class.
    pub support: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_true_probability: Option<f64>,
    pub brier: f64,
    pub weighted_brier: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roc_auc: Option<f64>,
}

/// All metrics for one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_true_probability: Option<f64>,
    pub brier: f64,
    pub weighted_brier: f64,
    pub distance_power: f64,
    pub accuracy: f64,
    pub classes: Vec<ClassScore>,
}

impl CalibrationReport {
    /// Scores `predicted` against `truth`. `states` labels each column.
    pub fn evaluate(
        predicted: ArrayView2<f64>,
        truth: ArrayView2<f64>,
        states: &[u32],
        settings: &ScoringSettings,
    ) -> Result<Self, MetricsError> {
        check_shapes(predicted, truth)?;
        if states.len() != predicted.ncols() {
            return Err(MetricsError::LabelCount {
                expected: predicted.ncols(),
                found: states.len(),
            });
        }

        let mtp = mean_true_probability(predicted, truth)?;
        let brier = brier_score(predicted, truth)?;
        let weighted = weighted_brier_score(predicted, truth, settings.distance_power)?;
        let auc = roc_auc_per_class(predicted, truth)?;
        let accuracy = accuracy(predicted, truth)?;

        let classes = states
            .iter()
            .enumerate()
            .map(|(c, &state)| ClassScore {
                state,
                support: truth.column(c).iter().filter(|&&t| t == 1.0).count(),
                mean_true_probability: mtp.per_class[c],
                brier: brier.per_class[c],
                weighted_brier: weighted.per_class[c],
                roc_auc: auc[c],
            })
            .collect();

        Ok(Self {
            rows: predicted.nrows(),
            mean_true_probability: mtp.overall,
            brier: brier.total,
            weighted_brier: weighted.total,
            distance_power: settings.distance_power,
            accuracy,
            classes,
        })
    }
}

fn fmt_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "undefined".to_string(), |v| format!("{v:.6}"))
}

impl fmt::Display for CalibrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Mean true-class probability")?;
        for class in &self.classes {
            writeln!(
                f,
                "  state {:<3} (n = {:<7}) {}",
                class.state,
                class.support,
                fmt_optional(class.mean_true_probability)
            )?;
        }
        writeln!(f, "  overall: {}", fmt_optional(self.mean_true_probability))?;

        writeln!(f, "Brier score")?;
        for class in &self.classes {
            writeln!(f, "  state {:<3} {:.6}", class.state, class.brier)?;
        }
        writeln!(f, "  total: {:.6}", self.brier)?;

        writeln!(f, "Distance-weighted Brier score (p = {})", self.distance_power)?;
        for class in &self.classes {
            writeln!(f, "  state {:<3} {:.6}", class.state, class.weighted_brier)?;
        }
        writeln!(f, "  total: {:.6}", self.weighted_brier)?;

        writeln!(f, "One-vs-rest ROC AUC")?;
        for class in &self.classes {
            writeln!(f, "  state {:<3} {}", class.state, fmt_optional(class.roc_auc))?;
        }
        write!(f, "Accuracy: {:.6}", self.accuracy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    /// Truth for the chain 0 -> 1 -> 2 -> 1.
    fn chain_truth() -> Array2<f64> {
        array![[0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]]
    }

    #[test]
    fn uniform_predictions_on_three_state_chain() {
        let truth = chain_truth();
        let uniform = Array2::from_elem((3, 3), 1.0 / 3.0);

        let brier = brier_score(uniform.view(), truth.view()).unwrap();
        let miss = (1.0_f64 / 3.0).powi(2);
        let hit = (2.0_f64 / 3.0).powi(2);
        assert_abs_diff_eq!(brier.per_class[0], miss, epsilon = 1e-12);
        assert_abs_diff_eq!(brier.per_class[1], (2.0 * hit + miss) / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(brier.per_class[2], (hit + 2.0 * miss) / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(brier.total, brier.per_class.iter().sum::<f64>(), epsilon = 1e-12);

        let mtp = mean_true_probability(uniform.view(), truth.view()).unwrap();
        assert_eq!(mtp.per_class[0], None);
        assert_abs_diff_eq!(mtp.per_class[1].unwrap(), 1.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(mtp.per_class[2].unwrap(), 1.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(mtp.overall.unwrap(), 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn perfect_predictions_score_zero_brier_and_unit_mtp() {
        let truth = chain_truth();
        let brier = brier_score(truth.view(), truth.view()).unwrap();
        let weighted = weighted_brier_score(truth.view(), truth.view(), 2.0).unwrap();
        let mtp = mean_true_probability(truth.view(), truth.view()).unwrap();
        assert_eq!(brier.total, 0.0);
        assert_eq!(weighted.total, 0.0);
        assert_eq!(mtp.overall, Some(1.0));
        assert_eq!(accuracy(truth.view(), truth.view()).unwrap(), 1.0);
    }

    #[test]
    fn any_miss_makes_brier_positive_and_mtp_below_one() {
        let truth = chain_truth();
        let mut predicted = truth.clone();
        predicted[[1, 2]] = 0.9;
        predicted[[1, 0]] = 0.1;
        assert!(brier_score(predicted.view(), truth.view()).unwrap().total > 0.0);
        assert!(mean_true_probability(predicted.view(), truth.view()).unwrap().overall.unwrap() < 1.0);
    }

    #[test]
    fn distant_confusion_costs_more_than_adjacent() {
        let truth = array![[1.0, 0.0, 0.0]];
        let adjacent = array![[0.5, 0.5, 0.0]];
        let distant = array![[0.5, 0.0, 0.5]];

        let near = weighted_brier_score(adjacent.view(), truth.view(), 1.0).unwrap();
        let far = weighted_brier_score(distant.view(), truth.view(), 1.0).unwrap();
        // Weights for true class 0 are [1, 2, 3] / 6.
        assert_abs_diff_eq!(near.total, 0.25 * 1.0 / 6.0 + 0.25 * 2.0 / 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(far.total, 0.25 * 1.0 / 6.0 + 0.25 * 3.0 / 6.0, epsilon = 1e-12);
        assert!(far.total > near.total);

        // Plain Brier cannot tell them apart.
        let plain_near = brier_score(adjacent.view(), truth.view()).unwrap();
        let plain_far = brier_score(distant.view(), truth.view()).unwrap();
        assert_abs_diff_eq!(plain_near.total, plain_far.total, epsilon = 1e-12);
    }

    #[test]
    fn zero_power_weights_are_uniform() {
        let truth = chain_truth();
        let predicted = Array2::from_elem((3, 3), 1.0 / 3.0);
        let plain = brier_score(predicted.view(), truth.view()).unwrap();
        let weighted = weighted_brier_score(predicted.view(), truth.view(), 0.0).unwrap();
        assert_abs_diff_eq!(weighted.total, plain.total / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn roc_auc_handles_ties_and_degenerate_classes() {
        let truth = array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]];
        let separable = array![[0.9, 0.1], [0.8, 0.2], [0.3, 0.7], [0.2, 0.8]];
        let auc = roc_auc_per_class(separable.view(), truth.view()).unwrap();
        assert_eq!(auc, vec![Some(1.0), Some(1.0)]);

        let tied = Array2::from_elem((4, 2), 0.5);
        let auc = roc_auc_per_class(tied.view(), truth.view()).unwrap();
        assert_eq!(auc, vec![Some(0.5), Some(0.5)]);

        let one_sided = array![[1.0, 0.0], [1.0, 0.0]];
        let auc = roc_auc_per_class(one_sided.view(), one_sided.view()).unwrap();
        assert_eq!(auc, vec![None, None]);
    }

    #[test]
    fn report_collects_breakdowns_and_renders() {
        let truth = chain_truth();
        let uniform = Array2::from_elem((3, 3), 1.0 / 3.0);
        let report = CalibrationReport::evaluate(
            uniform.view(),
            truth.view(),
            &[0, 1, 2],
            &ScoringSettings::default(),
        )
        .unwrap();

        assert_eq!(report.rows, 3);
        assert_eq!(report.classes[0].support, 0);
        assert_eq!(report.classes[1].support, 2);
        assert_eq!(report.classes[0].mean_true_probability, None);
        assert_eq!(report.classes[0].roc_auc, None);

        let text = report.to_string();
        assert!(text.contains("undefined"));
        assert!(text.contains("Distance-weighted Brier score (p = 1)"));
        assert!(text.contains("Accuracy:"));
    }

    #[test]
    fn shape_errors_are_reported() {
        let a = Array2::<f64>::zeros((2, 3));
        let b = Array2::<f64>::zeros((2, 2));
        assert!(matches!(
            brier_score(a.view(), b.view()),
            Err(MetricsError::ShapeMismatch { .. })
        ));
        let empty = Array2::<f64>::zeros((0, 3));
        assert!(matches!(
            mean_true_probability(empty.view(), empty.view()),
            Err(MetricsError::EmptyInput)
        ));
        assert!(matches!(
            CalibrationReport::evaluate(a.view(), a.view(), &[0, 1], &ScoringSettings::default()),
            Err(MetricsError::LabelCount { expected: 3, found: 2 })
        ));
    }
}
