//! Day-bucketed statistics table.
//!
//! A [`StatsFrame`] has one row per `(date, model)` and one nullable column per
//! [`Metric`]. It persists to Parquet and renders one CSV per metric with a
//! column per model, ready for charting.

// Allow cast_possible_truncation for Date32 day offsets.
#![allow(clippy::cast_possible_truncation)]

use super::model::ModelKey;
use crate::{Error, Result};
use arrow::array::{Array, ArrayRef, Date32Array, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

/// A computed statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    /// Inference events on the day.
    Count,
    /// KS distance of window predictions from reference predictions.
    PredictionDriftKs,
    /// KL divergence of the binned prediction distributions.
    PredictionDriftKl,
    /// Held-out ROC-AUC of the reference-vs-window classifier.
    DataDriftAuc,
    /// CBPE estimated accuracy over the window.
    EstimatedAccuracy,
    /// CBPE estimated F1 over the window.
    EstimatedF1,
    /// Mean squared error of predictions against mean user feedback.
    UserEvalMse,
    /// Fraction of non-finite feature values on the day.
    InvalidFeatureFraction,
}

impl Metric {
    /// Every metric in column order.
    pub const ALL: [Self; 8] = [
        Self::Count,
        Self::PredictionDriftKs,
        Self::PredictionDriftKl,
        Self::DataDriftAuc,
        Self::EstimatedAccuracy,
        Self::EstimatedF1,
        Self::UserEvalMse,
        Self::InvalidFeatureFraction,
    ];

    /// Column name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::PredictionDriftKs => "prediction_drift_ks",
            Self::PredictionDriftKl => "prediction_drift_kl",
            Self::DataDriftAuc => "data_drift_auc",
            Self::EstimatedAccuracy => "estimated_accuracy",
            Self::EstimatedF1 => "estimated_f1",
            Self::UserEvalMse => "user_eval_mse",
            Self::InvalidFeatureFraction => "invalid_feature_fraction",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown metric: '{s}'")))
    }
}

/// One `(date, model)` row.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsRow {
    /// Calendar day.
    pub date: NaiveDate,
    /// Model the row describes.
    pub model: ModelKey,
    /// Values aligned with [`StatsFrame::metrics`].
    pub values: Vec<Option<f64>>,
}

/// Statistics table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsFrame {
    metrics: Vec<Metric>,
    rows: Vec<StatsRow>,
}

impl StatsFrame {
    /// Creates an empty frame with the given columns.
    #[must_use]
    pub fn new(metrics: Vec<Metric>) -> Self {
        Self {
            metrics,
            rows: Vec::new(),
        }
    }

    /// Appends a row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the value count does not match the
    /// metric count.
    pub fn push(&mut self, row: StatsRow) -> Result<()> {
        if row.values.len() != self.metrics.len() {
            return Err(Error::InvalidInput(format!(
                "row has {} values, frame has {} metrics",
                row.values.len(),
                self.metrics.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Sorts rows by date, then model.
    pub fn sort(&mut self) {
        self.rows
            .sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.model.cmp(&b.model)));
    }

    /// Metric columns.
    #[must_use]
    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// Rows in stored order.
    #[must_use]
    pub fn rows(&self) -> &[StatsRow] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct dates, ascending.
    #[must_use]
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.rows
            .iter()
            .map(|r| r.date)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Distinct models, ascending.
    #[must_use]
    pub fn models(&self) -> Vec<ModelKey> {
        self.rows
            .iter()
            .map(|r| r.model.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Value of `metric` for `(date, model)`.
    #[must_use]
    pub fn get(&self, date: NaiveDate, model: &ModelKey, metric: Metric) -> Option<f64> {
        let column = self.metrics.iter().position(|m| *m == metric)?;
        self.rows
            .iter()
            .find(|r| r.date == date && &r.model == model)
            .and_then(|r| r.values[column])
    }

    /// Series of `metric` for one model, by date.
    #[must_use]
    pub fn series(&self, model: &ModelKey, metric: Metric) -> Vec<(NaiveDate, Option<f64>)> {
        let Some(column) = self.metrics.iter().position(|m| *m == metric) else {
            return Vec::new();
        };
        let mut series: Vec<_> = self
            .rows
            .iter()
            .filter(|r| &r.model == model)
            .map(|r| (r.date, r.values[column]))
            .collect();
        series.sort_by_key(|(date, _)| *date);
        series
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Writes the frame to a Snappy-compressed Parquet file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the file cannot be written.
    #[instrument(skip_all, fields(rows = self.rows.len(), path = %path.display()))]
    pub fn store(&self, path: &Path) -> Result<()> {
        let mut fields = vec![
            Field::new("date", DataType::Date32, false),
            Field::new("model_name", DataType::Utf8, false),
            Field::new("model_version", DataType::Utf8, false),
        ];
        fields.extend(
            self.metrics
                .iter()
                .map(|m| Field::new(m.as_str(), DataType::Float64, true)),
        );
        let schema = Arc::new(Schema::new(fields));

        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(Date32Array::from(
                self.rows.iter().map(|r| to_days(r.date)).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from_iter_values(
                self.rows.iter().map(|r| r.model.name.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                self.rows.iter().map(|r| r.model.version.as_str()),
            )),
        ];
        for column in 0..self.metrics.len() {
            columns.push(Arc::new(Float64Array::from(
                self.rows.iter().map(|r| r.values[column]).collect::<Vec<_>>(),
            )));
        }

        let batch = RecordBatch::try_new(Arc::clone(&schema), columns).map_err(write_error)?;
        let properties = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let file = File::create(path).map_err(|e| Error::OperationFailed {
            operation: "create_stats_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;
        let mut writer = ArrowWriter::try_new(file, schema, Some(properties)).map_err(write_error)?;
        writer.write(&batch).map_err(write_error)?;
        writer.close().map_err(write_error)?;

        tracing::info!(rows = self.rows.len(), "Stored stats frame");
        Ok(())
    }

    /// Reads a frame written by [`StatsFrame::store`].
    ///
    /// # Errors
    ///
    /// - [`Error::OperationFailed`] if the file cannot be read
    /// - [`Error::InvalidInput`] if a column is missing or has an unknown name
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::OperationFailed {
            operation: "open_stats_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(read_error)?;
        let metrics = builder
            .schema()
            .fields()
            .iter()
            .skip(3)
            .map(|f| f.name().parse::<Metric>())
            .collect::<Result<Vec<_>>>()?;
        let reader = builder.build().map_err(read_error)?;

        let mut frame = Self::new(metrics);
        for batch in reader {
            let batch = batch.map_err(read_error)?;
            let dates: &Date32Array = downcast(&batch, 0, "date")?;
            let names: &StringArray = downcast(&batch, 1, "model_name")?;
            let versions: &StringArray = downcast(&batch, 2, "model_version")?;
            let values = (0..frame.metrics.len())
                .map(|i| downcast::<Float64Array>(&batch, i + 3, frame.metrics[i].as_str()))
                .collect::<Result<Vec<_>>>()?;

            for row in 0..batch.num_rows() {
                let date = from_days(dates.value(row)).ok_or_else(|| {
                    Error::InvalidInput(format!("date out of range in row {row}"))
                })?;
                let values = values
                    .iter()
                    .map(|col| (!col.is_null(row)).then(|| col.value(row)))
                    .collect();
                frame.rows.push(StatsRow {
                    date,
                    model: ModelKey::new(names.value(row), versions.value(row)),
                    values,
                });
            }
        }
        Ok(frame)
    }

    /// Writes `{dir}/{metric}.csv` for each requested metric.
    ///
    /// Each file has a `date` column and one column per model slug. Empty
    /// cells mark missing values. Returns the written paths.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if a metric is not in the frame
    /// - [`Error::OperationFailed`] if a file cannot be written
    #[instrument(skip_all, fields(dir = %dir.display(), metrics = metrics.len()))]
    pub fn render(&self, dir: &Path, metrics: &[Metric]) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir).map_err(|e| Error::OperationFailed {
            operation: "create_render_dir".to_string(),
            cause: format!("{}: {e}", dir.display()),
        })?;

        let dates = self.dates();
        let models = self.models();
        let mut written = Vec::with_capacity(metrics.len());
        for metric in metrics {
            if !self.metrics.contains(metric) {
                return Err(Error::InvalidInput(format!(
                    "metric '{metric}' is not in the frame"
                )));
            }

            let path = dir.join(format!("{metric}.csv"));
            let mut writer = csv::Writer::from_path(&path).map_err(csv_error)?;
            let mut header = vec!["date".to_string()];
            header.extend(models.iter().map(ModelKey::slug));
            writer.write_record(&header).map_err(csv_error)?;

            for date in &dates {
                let mut record = vec![date.to_string()];
                record.extend(models.iter().map(|model| {
                    self.get(*date, model, *metric)
                        .map(|v| v.to_string())
                        .unwrap_or_default()
                }));
                writer.write_record(&record).map_err(csv_error)?;
            }
            writer.flush().map_err(|e| csv_error(e.into()))?;
            written.push(path);
        }

        tracing::info!(files = written.len(), "Rendered stats frame");
        Ok(written)
    }
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn to_days(date: NaiveDate) -> i32 {
    date.signed_duration_since(epoch()).num_days() as i32
}

fn from_days(days: i32) -> Option<NaiveDate> {
    epoch().checked_add_signed(chrono::Duration::days(i64::from(days)))
}

fn downcast<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    index: usize,
    name: &str,
) -> Result<&'a T> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::InvalidInput(format!("stats column '{name}' has an unexpected type")))
}

fn write_error(e: impl ToString) -> Error {
    Error::OperationFailed {
        operation: "write_stats_frame".to_string(),
        cause: e.to_string(),
    }
}

fn read_error(e: impl ToString) -> Error {
    Error::OperationFailed {
        operation: "read_stats_frame".to_string(),
        cause: e.to_string(),
    }
}

fn csv_error(e: csv::Error) -> Error {
    Error::OperationFailed {
        operation: "render_stats_csv".to_string(),
        cause: e.to_string(),
    }
}
