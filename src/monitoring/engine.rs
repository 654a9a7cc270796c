//! Rolling per-day statistics over an inference log.
//!
//! # Windows
//!
//! Every date between the earliest and the latest record gets a row per
//! model. Windowed metrics use the trailing window `[d - w + 1, d]` clipped
//! to the first date, so the first day is computed from exactly one day of
//! data.
//!
//! | Metric | Scope |
//! |--------|-------|
//! | count, user eval, invalid features | the day itself |
//! | prediction drift, data drift, estimated performance | trailing window |

// Allow cast_precision_loss for counts and means.
#![allow(clippy::cast_precision_loss)]

use super::frame::{Metric, StatsFrame, StatsRow};
use super::model::{InferenceRecord, ModelKey, ReferenceSet};
use super::stats::{
    IsotonicCalibrator, drift_auc, estimate_performance, invalid_fraction, kl_divergence,
    ks_statistic,
};
use crate::{Error, Result};
use chrono::{Days, NaiveDate};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;
use std::time::Instant;
use tracing::instrument;

// ============================================================================
// Flags
// ============================================================================

/// Set of statistic groups to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatFlags(u8);

impl StatFlags {
    /// Events per day.
    pub const COUNT: Self = Self(1);
    /// KS and KL drift of predictions.
    pub const PREDICTION_DRIFT: Self = Self(1 << 1);
    /// Classifier-based feature drift.
    pub const DATA_DRIFT: Self = Self(1 << 2);
    /// CBPE accuracy and F1.
    pub const ESTIMATED_PERFORMANCE: Self = Self(1 << 3);
    /// Error against user feedback.
    pub const USER_EVAL: Self = Self(1 << 4);
    /// Non-finite feature values.
    pub const DATA_QUALITY: Self = Self(1 << 5);
    /// Every group.
    pub const ALL: Self = Self(0b11_1111);
    /// No group.
    pub const NONE: Self = Self(0);

    const NAMES: [(&'static str, Self); 6] = [
        ("count", Self::COUNT),
        ("prediction_drift", Self::PREDICTION_DRIFT),
        ("data_drift", Self::DATA_DRIFT),
        ("estimated_performance", Self::ESTIMATED_PERFORMANCE),
        ("user_eval", Self::USER_EVAL),
        ("data_quality", Self::DATA_QUALITY),
    ];

    /// Returns `true` if every group of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Metric columns produced by the set groups, in column order.
    #[must_use]
    pub fn metrics(self) -> Vec<Metric> {
        let mut metrics = Vec::new();
        if self.contains(Self::COUNT) {
            metrics.push(Metric::Count);
        }
        if self.contains(Self::PREDICTION_DRIFT) {
            metrics.extend([Metric::PredictionDriftKs, Metric::PredictionDriftKl]);
        }
        if self.contains(Self::DATA_DRIFT) {
            metrics.push(Metric::DataDriftAuc);
        }
        if self.contains(Self::ESTIMATED_PERFORMANCE) {
            metrics.extend([Metric::EstimatedAccuracy, Metric::EstimatedF1]);
        }
        if self.contains(Self::USER_EVAL) {
            metrics.push(Metric::UserEvalMse);
        }
        if self.contains(Self::DATA_QUALITY) {
            metrics.push(Metric::InvalidFeatureFraction);
        }
        metrics
    }
}

impl Default for StatFlags {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for StatFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for StatFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect();
        write!(f, "{}", names.join(","))
    }
}

impl FromStr for StatFlags {
    type Err = Error;

    /// Parses a comma-separated list of group names, or `all`.
    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .try_fold(Self::NONE, |flags, name| {
                if name.eq_ignore_ascii_case("all") {
                    return Ok(Self::ALL);
                }
                Self::NAMES
                    .iter()
                    .find(|(known, _)| known.eq_ignore_ascii_case(name))
                    .map(|(_, flag)| flags | *flag)
                    .ok_or_else(|| Error::InvalidInput(format!("unknown statistic: '{name}'")))
            })
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Rolling engine parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringConfig {
    /// Trailing window length in days.
    pub window_size: usize,
    /// Decision threshold on predicted probabilities.
    pub threshold: f64,
    /// Held-out share of each class in the drift classifier.
    pub test_fraction: f64,
    /// Seed of the drift classifier split.
    pub seed: u64,
    /// Histogram bins for KL drift.
    pub kl_bins: usize,
    /// Groups to compute.
    pub flags: StatFlags,
    /// Ignore records before this date.
    pub since: Option<NaiveDate>,
    /// Ignore records after this date.
    pub until: Option<NaiveDate>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            window_size: 7,
            threshold: 0.5,
            test_fraction: 0.3,
            seed: 42,
            kl_bins: 20,
            flags: StatFlags::ALL,
            since: None,
            until: None,
        }
    }
}

impl MonitoringConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the window length.
    #[must_use]
    pub const fn with_window_size(mut self, days: usize) -> Self {
        self.window_size = days;
        self
    }

    /// Sets the decision threshold.
    #[must_use]
    pub const fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Sets the computed groups.
    #[must_use]
    pub const fn with_flags(mut self, flags: StatFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the seed of the drift split.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Restricts records to `[since, until]`.
    #[must_use]
    pub const fn with_range(mut self, since: Option<NaiveDate>, until: Option<NaiveDate>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    /// Loads configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Overrides fields set in `LAKEGRAPH_*` environment variables.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        let mut config = self;

        if let Ok(val) = std::env::var("LAKEGRAPH_MONITORING_WINDOW_SIZE")
            && let Ok(days) = val.parse()
        {
            config.window_size = days;
        }
        if let Ok(val) = std::env::var("LAKEGRAPH_MONITORING_THRESHOLD")
            && let Ok(threshold) = val.parse()
        {
            config.threshold = threshold;
        }
        if let Ok(val) = std::env::var("LAKEGRAPH_MONITORING_STATS")
            && let Ok(flags) = val.parse()
        {
            config.flags = flags;
        }

        config
    }

    /// Checks parameter ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a zero window, a threshold outside
    /// `[0, 1]`, or a test fraction outside `(0, 1)`.
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::InvalidInput("window size must be at least 1 day".to_string()));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::InvalidInput(format!(
                "threshold {} is outside [0, 1]",
                self.threshold
            )));
        }
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(Error::InvalidInput(format!(
                "test fraction {} is outside (0, 1)",
                self.test_fraction
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Computes a [`StatsFrame`] from a reference set and an inference log.
pub struct RollingStatsEngine {
    config: MonitoringConfig,
}

impl RollingStatsEngine {
    /// Creates an engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the configuration is invalid.
    pub fn new(config: MonitoringConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Computes statistics for `models`, or for every model in the log if
    /// `models` is empty.
    ///
    /// Models are processed in parallel; rows are sorted by date, then model.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if prediction or performance statistics are
    ///   requested for a model without reference predictions
    /// - [`Error::DimensionMismatch`] if live features disagree with the
    ///   reference dimension
    #[instrument(skip_all, fields(records = records.len(), models = models.len()))]
    pub fn compute(
        &self,
        reference: &ReferenceSet,
        records: &[InferenceRecord],
        models: &[ModelKey],
    ) -> Result<StatsFrame> {
        let start = Instant::now();
        let metrics = self.config.flags.metrics();

        let records: Vec<&InferenceRecord> = records
            .iter()
            .filter(|r| self.config.since.is_none_or(|since| r.date() >= since))
            .filter(|r| self.config.until.is_none_or(|until| r.date() <= until))
            .collect();
        let mut frame = StatsFrame::new(metrics.clone());
        let (Some(first), Some(last)) = (
            records.iter().map(|r| r.date()).min(),
            records.iter().map(|r| r.date()).max(),
        ) else {
            tracing::warn!("No inference records in range");
            return Ok(frame);
        };

        let models: Vec<ModelKey> = if models.is_empty() {
            records
                .iter()
                .map(|r| r.model())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        } else {
            models.to_vec()
        };
        let dates: Vec<NaiveDate> = first.iter_days().take_while(|d| *d <= last).collect();

        let rows = models
            .par_iter()
            .map(|model| {
                let by_date = group_by_date(&records, model);
                self.model_rows(reference, model, &by_date, &dates, first, &metrics)
            })
            .collect::<Result<Vec<_>>>()?;

        for row in rows.into_iter().flatten() {
            frame.push(row)?;
        }
        frame.sort();

        metrics::histogram!("monitoring_compute_duration_ms")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        metrics::counter!("monitoring_rows_total").increment(frame.len() as u64);
        tracing::info!(
            dates = dates.len(),
            models = models.len(),
            rows = frame.len(),
            "Computed rolling statistics"
        );
        Ok(frame)
    }

    fn model_rows(
        &self,
        reference: &ReferenceSet,
        model: &ModelKey,
        by_date: &BTreeMap<NaiveDate, Vec<&InferenceRecord>>,
        dates: &[NaiveDate],
        first: NaiveDate,
        metrics: &[Metric],
    ) -> Result<Vec<StatsRow>> {
        let flags = self.config.flags;
        let needs_predictions = flags.contains(StatFlags::PREDICTION_DRIFT)
            || flags.contains(StatFlags::ESTIMATED_PERFORMANCE);
        let reference_predictions = if needs_predictions {
            Some(reference.predictions(model).ok_or_else(|| {
                Error::NotFound(format!("reference predictions for {model}"))
            })?)
        } else {
            None
        };
        let calibrator = match reference_predictions {
            Some(p) if flags.contains(StatFlags::ESTIMATED_PERFORMANCE) => {
                IsotonicCalibrator::fit(p, &reference.labels)
            },
            _ => None,
        };

        let mut rows = Vec::with_capacity(dates.len());
        for date in dates {
            let day = by_date.get(date).map_or(&[][..], Vec::as_slice);
            let window_start = date
                .checked_sub_days(Days::new(self.config.window_size as u64 - 1))
                .map_or(first, |d| d.max(first));
            let window: Vec<&InferenceRecord> = by_date
                .range(window_start..=*date)
                .flat_map(|(_, records)| records.iter().copied())
                .collect();
            let window_predictions: Vec<f64> = window.iter().map(|r| r.prediction).collect();

            let mut values = Vec::with_capacity(metrics.len());
            for metric in metrics {
                let value = match metric {
                    Metric::Count => Some(day.len() as f64),
                    Metric::PredictionDriftKs => reference_predictions
                        .and_then(|p| ks_statistic(p, &window_predictions)),
                    Metric::PredictionDriftKl => reference_predictions.and_then(|p| {
                        kl_divergence(p, &window_predictions, self.config.kl_bins, 1e-8)
                    }),
                    Metric::DataDriftAuc => {
                        let current: Vec<Vec<f64>> =
                            window.iter().map(|r| r.features.clone()).collect();
                        drift_auc(
                            &reference.features,
                            &current,
                            self.config.test_fraction,
                            self.config.seed,
                        )?
                    },
                    Metric::EstimatedAccuracy => calibrator.as_ref().and_then(|c| {
                        estimate_performance(c, &window_predictions, self.config.threshold)
                            .map(|e| e.accuracy)
                    }),
                    Metric::EstimatedF1 => calibrator.as_ref().and_then(|c| {
                        estimate_performance(c, &window_predictions, self.config.threshold)
                            .and_then(|e| e.f1)
                    }),
                    Metric::UserEvalMse => user_eval(day),
                    Metric::InvalidFeatureFraction => {
                        invalid_fraction(day.iter().map(|r| r.features.as_slice()))
                    },
                };
                values.push(value);
            }

            rows.push(StatsRow {
                date: *date,
                model: model.clone(),
                values,
            });
        }
        Ok(rows)
    }
}

fn group_by_date<'a>(
    records: &[&'a InferenceRecord],
    model: &ModelKey,
) -> BTreeMap<NaiveDate, Vec<&'a InferenceRecord>> {
    let mut by_date: BTreeMap<NaiveDate, Vec<&InferenceRecord>> = BTreeMap::new();
    for record in records
        .iter()
        .copied()
        .filter(|r| r.model_name == model.name && r.model_version == model.version)
    {
        by_date.entry(record.date()).or_default().push(record);
    }
    by_date
}

/// Mean of `(prediction - mean feedback)^2` over records with feedback.
fn user_eval(records: &[&InferenceRecord]) -> Option<f64> {
    let errors: Vec<f64> = records
        .iter()
        .filter_map(|r| r.mean_feedback().map(|f| (r.prediction - f).powi(2)))
        .collect();
    (!errors.is_empty()).then(|| errors.iter().sum::<f64>() / errors.len() as f64)
}
