//! Inference monitoring.
//!
//! Reads an inference log and a labeled reference set from Parquet, computes
//! per-day, per-model statistics with [`RollingStatsEngine`] and persists them
//! as a [`StatsFrame`].
//!
//! # Statistics
//!
//! | Group | Metrics |
//! |-------|---------|
//! | count | events per day |
//! | prediction drift | KS and KL against reference predictions |
//! | data drift | held-out AUC of a reference-vs-live classifier |
//! | estimated performance | CBPE accuracy and F1 from calibrated confidence |
//! | user eval | MSE of predictions against mean user feedback |
//! | data quality | fraction of non-finite feature values |
//!
//! Reference predictions are produced once per model by a [`ModelLoader`]
//! and cached in the [`ReferenceSet`] under the model slug.

mod dataset;
mod engine;
mod frame;
mod model;
mod stats;

pub use dataset::{read_inferences, read_reference, write_inferences, write_reference};
pub use engine::{MonitoringConfig, RollingStatsEngine, StatFlags};
pub use frame::{Metric, StatsFrame, StatsRow};
pub use model::{
    CachedModelLoader, Classifier, InferenceRecord, JsonModelLoader, ModelKey, ModelLoader,
    ReferenceSet, ensure_predictions,
};
pub use stats::{
    IsotonicCalibrator, LogisticConfig, LogisticRegression, PerformanceEstimate, drift_auc,
    estimate_performance, invalid_fraction, kl_divergence, ks_statistic, roc_auc,
};
