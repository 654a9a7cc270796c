//! Statistics used by the rolling engine.
//!
//! | Function | Measures |
//! |----------|----------|
//! | [`ks_statistic`] | Two-sample Kolmogorov-Smirnov distance |
//! | [`kl_divergence`] | Binned KL divergence of probability histograms |
//! | [`drift_auc`] | Held-out ROC-AUC of a reference-vs-window classifier |
//! | [`IsotonicCalibrator`] + [`estimate_performance`] | CBPE accuracy and F1 |
//! | [`invalid_fraction`] | Share of non-finite feature values |

// Allow cast_precision_loss for sample counts in means and ranks.
#![allow(clippy::cast_precision_loss)]
// Allow cast_possible_truncation and cast_sign_loss for rounded split sizes.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use super::model::Classifier;
use crate::{Error, Result};
use ndarray::{Array1, Array2, Axis};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

// ============================================================================
// Distribution Distances
// ============================================================================

/// Two-sample Kolmogorov-Smirnov statistic: the largest gap between the
/// empirical CDFs of `a` and `b`.
///
/// Returns `None` if either sample is empty. Non-finite values are ignored.
#[must_use]
pub fn ks_statistic(a: &[f64], b: &[f64]) -> Option<f64> {
    let mut a: Vec<f64> = a.iter().copied().filter(|v| v.is_finite()).collect();
    let mut b: Vec<f64> = b.iter().copied().filter(|v| v.is_finite()).collect();
    if a.is_empty() || b.is_empty() {
        return None;
    }
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);

    let (n, m) = (a.len() as f64, b.len() as f64);
    let (mut i, mut j) = (0, 0);
    let mut max_gap = 0.0_f64;
    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        max_gap = max_gap.max((i as f64 / n - j as f64 / m).abs());
    }
    Some(max_gap)
}

/// KL divergence `D(reference || current)` of probability histograms.
///
/// Both samples are binned into `bins` equal-width bins over `[0, 1]`,
/// normalized, and smoothed by `epsilon`. Returns `None` if either sample
/// is empty.
#[must_use]
pub fn kl_divergence(reference: &[f64], current: &[f64], bins: usize, epsilon: f64) -> Option<f64> {
    let bins = bins.max(1);
    let p = histogram(reference, bins)?;
    let q = histogram(current, bins)?;

    let smooth = |h: Vec<f64>| {
        let h: Vec<f64> = h.into_iter().map(|v| v + epsilon).collect();
        let total: f64 = h.iter().sum();
        h.into_iter().map(|v| v / total).collect::<Vec<_>>()
    };
    let (p, q) = (smooth(p), smooth(q));
    Some(
        p.iter()
            .zip(&q)
            .filter(|(pi, _)| **pi > 0.0)
            .map(|(pi, qi)| pi * (pi / qi).ln())
            .sum(),
    )
}

fn histogram(values: &[f64], bins: usize) -> Option<Vec<f64>> {
    let mut counts = vec![0.0; bins];
    let mut total = 0usize;
    for value in values.iter().filter(|v| v.is_finite()) {
        let bin = ((value.clamp(0.0, 1.0) * bins as f64) as usize).min(bins - 1);
        counts[bin] += 1.0;
        total += 1;
    }
    if total == 0 {
        return None;
    }
    Some(counts.into_iter().map(|c| c / total as f64).collect())
}

// ============================================================================
// ROC-AUC
// ============================================================================

/// ROC-AUC via the Mann-Whitney U statistic, with average ranks for ties.
///
/// Returns `None` unless both classes are present.
#[must_use]
pub fn roc_auc(scores: &[f64], labels: &[bool]) -> Option<f64> {
    let positives = labels.iter().filter(|l| **l).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 || scores.len() != labels.len() {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*a].total_cmp(&scores[*b]));

    let mut rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && scores[order[end + 1]] == scores[order[start]] {
            end += 1;
        }
        // Ranks are 1-based; tied scores share the mean rank.
        let rank = (start + end) as f64 / 2.0 + 1.0;
        rank_sum += rank * order[start..=end].iter().filter(|i| labels[**i]).count() as f64;
        start = end + 1;
    }

    let (p, n) = (positives as f64, negatives as f64);
    Some((rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

// ============================================================================
// Logistic Regression
// ============================================================================

/// Training parameters for [`LogisticRegression::fit`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogisticConfig {
    /// Gradient descent steps.
    pub iterations: usize,
    /// Step size.
    pub learning_rate: f64,
    /// L2 penalty on the weights.
    pub l2: f64,
}

impl Default for LogisticConfig {
    fn default() -> Self {
        Self {
            iterations: 300,
            learning_rate: 0.5,
            l2: 1e-3,
        }
    }
}

/// Binary logistic regression over optionally standardized features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    /// Feature weights.
    pub weights: Vec<f64>,
    /// Intercept.
    pub bias: f64,
    /// Per-feature means subtracted before scoring; empty for raw features.
    #[serde(default)]
    pub mean: Vec<f64>,
    /// Per-feature scales divided out before scoring; empty for raw features.
    #[serde(default)]
    pub scale: Vec<f64>,
}

impl LogisticRegression {
    /// Fits a standardized model by batch gradient descent.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if there are no rows or labels do not align
    /// - [`Error::DimensionMismatch`] if rows differ in length
    pub fn fit(features: &[Vec<f64>], labels: &[bool], config: LogisticConfig) -> Result<Self> {
        if features.is_empty() || features.len() != labels.len() {
            return Err(Error::InvalidInput(format!(
                "cannot fit on {} rows with {} labels",
                features.len(),
                labels.len()
            )));
        }
        let x = to_matrix(features)?;
        let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
        let scale = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 1e-12 { s } else { 1.0 });
        let x = (&x - &mean) / &scale;
        let y = Array1::from_iter(labels.iter().map(|l| if *l { 1.0 } else { 0.0 }));

        let n = x.nrows() as f64;
        let mut w = Array1::<f64>::zeros(x.ncols());
        let mut b = 0.0;
        for _ in 0..config.iterations {
            let p = (x.dot(&w) + b).mapv(sigmoid);
            let residual = &p - &y;
            let grad_w = x.t().dot(&residual) / n + &w * config.l2;
            let grad_b = residual.sum() / n;
            w = w - grad_w * config.learning_rate;
            b -= grad_b * config.learning_rate;
        }

        Ok(Self {
            weights: w.to_vec(),
            bias: b,
            mean: mean.to_vec(),
            scale: scale.to_vec(),
        })
    }

    fn score(&self, row: &[f64]) -> Result<f64> {
        if row.len() != self.weights.len() {
            return Err(Error::DimensionMismatch {
                expected: self.weights.len(),
                actual: row.len(),
            });
        }
        let z: f64 = row
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mean = self.mean.get(i).copied().unwrap_or(0.0);
                let scale = self.scale.get(i).copied().unwrap_or(1.0);
                (v - mean) / scale * self.weights[i]
            })
            .sum();
        Ok(sigmoid(z + self.bias))
    }
}

impl Classifier for LogisticRegression {
    fn predict_proba(&self, features: &[Vec<f64>]) -> Result<Vec<f64>> {
        features.iter().map(|row| self.score(row)).collect()
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn to_matrix(rows: &[Vec<f64>]) -> Result<Array2<f64>> {
    let dim = rows.first().map_or(0, Vec::len);
    let mut flat = Vec::with_capacity(rows.len() * dim);
    for row in rows {
        if row.len() != dim {
            return Err(Error::DimensionMismatch {
                expected: dim,
                actual: row.len(),
            });
        }
        flat.extend_from_slice(row);
    }
    Array2::from_shape_vec((rows.len(), dim), flat).map_err(|e| Error::OperationFailed {
        operation: "build_feature_matrix".to_string(),
        cause: e.to_string(),
    })
}

/// Feature drift as the held-out ROC-AUC of a reference-vs-current classifier.
///
/// Reference rows are labelled 0 and current rows 1. Each class is shuffled
/// with `seed` and `test_fraction` of it is held out. Rows with non-finite
/// values are dropped. An AUC near 0.5 means no detectable drift.
///
/// Returns `None` if either class is missing from the training or test split.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] if the two sets disagree on dimension.
pub fn drift_auc(
    reference: &[Vec<f64>],
    current: &[Vec<f64>],
    test_fraction: f64,
    seed: u64,
) -> Result<Option<f64>> {
    let finite = |rows: &[Vec<f64>]| -> Vec<Vec<f64>> {
        rows.iter()
            .filter(|row| row.iter().all(|v| v.is_finite()))
            .cloned()
            .collect()
    };
    let reference = finite(reference);
    let current = finite(current);
    if let (Some(r), Some(c)) = (reference.first(), current.first())
        && r.len() != c.len()
    {
        return Err(Error::DimensionMismatch {
            expected: r.len(),
            actual: c.len(),
        });
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut train = (Vec::new(), Vec::new());
    let mut test = (Vec::new(), Vec::new());
    for (rows, label) in [(reference, false), (current, true)] {
        let mut rows = rows;
        rows.shuffle(&mut rng);
        let n_test = ((rows.len() as f64) * test_fraction.clamp(0.0, 1.0)).round() as usize;
        for (i, row) in rows.into_iter().enumerate() {
            let split = if i < n_test { &mut test } else { &mut train };
            split.0.push(row);
            split.1.push(label);
        }
    }

    let has_both = |labels: &[bool]| labels.contains(&true) && labels.contains(&false);
    if !has_both(&train.1) || !has_both(&test.1) {
        return Ok(None);
    }

    let model = LogisticRegression::fit(&train.0, &train.1, LogisticConfig::default())?;
    let scores = model.predict_proba(&test.0)?;
    Ok(roc_auc(&scores, &test.1))
}

// ============================================================================
// Confidence-Based Performance Estimation
// ============================================================================

/// Monotone map from predicted probability to observed positive rate.
///
/// Fitted with pool-adjacent-violators; predictions interpolate linearly
/// between fitted points and clamp outside the fitted range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IsotonicCalibrator {
    points: Vec<(f64, f64)>,
}

impl IsotonicCalibrator {
    /// Fits the calibrator on `(probability, label)` pairs.
    ///
    /// Returns `None` if there are no finite probabilities.
    #[must_use]
    pub fn fit(probabilities: &[f64], labels: &[bool]) -> Option<Self> {
        let mut pairs: Vec<(f64, f64)> = probabilities
            .iter()
            .zip(labels)
            .filter(|(p, _)| p.is_finite())
            .map(|(p, l)| (*p, if *l { 1.0 } else { 0.0 }))
            .collect();
        if pairs.is_empty() {
            return None;
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        // Blocks of (x sum, y sum, weight), merged while decreasing.
        let mut blocks: Vec<(f64, f64, f64)> = Vec::new();
        for (x, y) in pairs {
            blocks.push((x, y, 1.0));
            while blocks.len() > 1 {
                let last = blocks[blocks.len() - 1];
                let prev = blocks[blocks.len() - 2];
                if prev.1 / prev.2 <= last.1 / last.2 {
                    break;
                }
                blocks.pop();
                if let Some(merged) = blocks.last_mut() {
                    *merged = (merged.0 + last.0, merged.1 + last.1, merged.2 + last.2);
                }
            }
        }

        let mut points: Vec<(f64, f64)> = blocks
            .into_iter()
            .map(|(xs, ys, w)| (xs / w, ys / w))
            .collect();
        points.dedup_by(|a, b| (a.0 - b.0).abs() < f64::EPSILON);
        Some(Self { points })
    }

    /// Calibrated probability for `p`.
    #[must_use]
    pub fn predict(&self, p: f64) -> f64 {
        let Some((first, last)) = self.points.first().zip(self.points.last()) else {
            return p;
        };
        if p <= first.0 {
            return first.1;
        }
        if p >= last.0 {
            return last.1;
        }
        let upper = self.points.partition_point(|(x, _)| *x < p);
        let (x0, y0) = self.points[upper - 1];
        let (x1, y1) = self.points[upper];
        if (x1 - x0).abs() < f64::EPSILON {
            return y1;
        }
        y0 + (y1 - y0) * (p - x0) / (x1 - x0)
    }
}

/// Estimated accuracy and F1 of unlabelled predictions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceEstimate {
    /// Mean expected correctness.
    pub accuracy: f64,
    /// F1 from expected confusion counts; `None` when undefined.
    pub f1: Option<f64>,
}

/// Confidence-based performance estimation.
///
/// Each prediction is calibrated to `c = P(y = 1)`. A positive call
/// (`p >= threshold`) is expected correct with probability `c`, a negative
/// call with `1 - c`. Expected TP, FP and FN give the F1 estimate.
///
/// Returns `None` for an empty window.
#[must_use]
pub fn estimate_performance(
    calibrator: &IsotonicCalibrator,
    predictions: &[f64],
    threshold: f64,
) -> Option<PerformanceEstimate> {
    let predictions: Vec<f64> = predictions.iter().copied().filter(|p| p.is_finite()).collect();
    if predictions.is_empty() {
        return None;
    }

    let (mut correct, mut tp, mut fp, mut fn_) = (0.0, 0.0, 0.0, 0.0);
    for p in &predictions {
        let c = calibrator.predict(*p).clamp(0.0, 1.0);
        if *p >= threshold {
            correct += c;
            tp += c;
            fp += 1.0 - c;
        } else {
            correct += 1.0 - c;
            fn_ += c;
        }
    }

    let denominator = 2.0 * tp + fp + fn_;
    Some(PerformanceEstimate {
        accuracy: correct / predictions.len() as f64,
        f1: (denominator > 0.0).then(|| 2.0 * tp / denominator),
    })
}

// ============================================================================
// Data Quality
// ============================================================================

/// Fraction of non-finite values across all rows.
///
/// Returns `None` if there are no values.
#[must_use]
pub fn invalid_fraction<'a>(rows: impl IntoIterator<Item = &'a [f64]>) -> Option<f64> {
    let (mut invalid, mut total) = (0usize, 0usize);
    for row in rows {
        total += row.len();
        invalid += row.iter().filter(|v| !v.is_finite()).count();
    }
    (total > 0).then(|| invalid as f64 / total as f64)
}
