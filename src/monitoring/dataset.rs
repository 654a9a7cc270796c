//! Parquet inference logs and reference sets.
//!
//! Inference log columns:
//!
//! | Column | Type |
//! |--------|------|
//! | `inference_uuid` | `Utf8` |
//! | `model_name`, `model_version` | `Utf8` |
//! | `features` | `List<Float64>` |
//! | `prediction` | `Float64` |
//! | `created_at` | `Timestamp(µs, UTC)` or RFC 3339 `Utf8` |
//! | `feedback` | `List<Float64>`, optional |
//!
//! Reference sets carry `features` (`List<Float64>`), `label` (`Boolean` or
//! integer) and one `Float64` prediction column per model slug.

use super::model::{InferenceRecord, ReferenceSet};
use crate::{Error, Result};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, ListArray,
    StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Float64Type, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Reads an inference log.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a required column is
/// missing or mistyped.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn read_inferences(path: &Path) -> Result<Vec<InferenceRecord>> {
    let mut records = Vec::new();
    for batch in read_batches(path)? {
        let uuids: &StringArray = column(&batch, "inference_uuid")?;
        let names: &StringArray = column(&batch, "model_name")?;
        let versions: &StringArray = column(&batch, "model_version")?;
        let features: &ListArray = column(&batch, "features")?;
        let predictions: &Float64Array = column(&batch, "prediction")?;
        let feedback = batch
            .column_by_name("feedback")
            .and_then(|c| c.as_any().downcast_ref::<ListArray>());
        let created = batch
            .column_by_name("created_at")
            .ok_or_else(|| missing("created_at"))?;

        for row in 0..batch.num_rows() {
            let inference_uuid = Uuid::parse_str(uuids.value(row)).map_err(|e| {
                Error::InvalidInput(format!("row {row}: bad inference_uuid: {e}"))
            })?;
            records.push(InferenceRecord {
                inference_uuid,
                model_name: names.value(row).to_string(),
                model_version: versions.value(row).to_string(),
                features: list_values(features, row)?,
                prediction: if predictions.is_null(row) {
                    f64::NAN
                } else {
                    predictions.value(row)
                },
                created_at: timestamp(created, row)?,
                feedback: match feedback {
                    Some(list) => list_values(list, row)?,
                    None => Vec::new(),
                },
            });
        }
    }

    metrics::counter!("monitoring_records_read_total").increment(records.len() as u64);
    Ok(records)
}

/// Writes an inference log.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the file cannot be written.
#[instrument(skip_all, fields(path = %path.display(), records = records.len()))]
pub fn write_inferences(path: &Path, records: &[InferenceRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("inference_uuid", DataType::Utf8, false),
        Field::new("model_name", DataType::Utf8, false),
        Field::new("model_version", DataType::Utf8, false),
        list_field("features"),
        Field::new("prediction", DataType::Float64, false),
        Field::new(
            "created_at",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        list_field("feedback"),
    ]));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.inference_uuid.to_string()),
        )),
        Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.model_name.as_str()))),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.model_version.as_str()),
        )),
        Arc::new(list_array(records.iter().map(|r| r.features.as_slice()))),
        Arc::new(Float64Array::from_iter_values(records.iter().map(|r| r.prediction))),
        Arc::new(
            TimestampMicrosecondArray::from_iter_values(
                records.iter().map(|r| r.created_at.timestamp_micros()),
            )
            .with_timezone("UTC"),
        ),
        Arc::new(list_array(records.iter().map(|r| r.feedback.as_slice()))),
    ];
    write_batch(path, schema, columns)
}

/// Reads a reference set.
///
/// # Errors
///
/// Returns an error if the file cannot be read or `features`/`label` is
/// missing or mistyped.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn read_reference(path: &Path) -> Result<ReferenceSet> {
    let mut reference = ReferenceSet::default();
    for batch in read_batches(path)? {
        let features: &ListArray = column(&batch, "features")?;
        let labels = batch.column_by_name("label").ok_or_else(|| missing("label"))?;
        let prediction_columns: Vec<(String, &Float64Array)> = batch
            .schema()
            .fields()
            .iter()
            .zip(batch.columns())
            .filter(|(field, _)| field.name() != "label")
            .filter_map(|(field, array)| {
                array
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .map(|a| (field.name().clone(), a))
            })
            .collect();

        for row in 0..batch.num_rows() {
            reference.features.push(list_values(features, row)?);
            reference.labels.push(label(labels, row)?);
            for (slug, array) in &prediction_columns {
                let value = if array.is_null(row) { f64::NAN } else { array.value(row) };
                reference.predictions.entry(slug.clone()).or_default().push(value);
            }
        }
    }
    Ok(reference)
}

/// Writes a reference set with its predictions.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the file cannot be written.
#[instrument(skip_all, fields(path = %path.display(), rows = reference.len()))]
pub fn write_reference(path: &Path, reference: &ReferenceSet) -> Result<()> {
    let mut fields = vec![list_field("features"), Field::new("label", DataType::Boolean, false)];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(list_array(reference.features.iter().map(Vec::as_slice))),
        Arc::new(BooleanArray::from(reference.labels.clone())),
    ];
    for (slug, predictions) in &reference.predictions {
        fields.push(Field::new(slug, DataType::Float64, false));
        columns.push(Arc::new(Float64Array::from(predictions.clone())));
    }
    write_batch(path, Arc::new(Schema::new(fields)), columns)
}

// ============================================================================
// Helpers
// ============================================================================

fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path).map_err(|e| Error::OperationFailed {
        operation: "open_dataset".to_string(),
        cause: format!("{}: {e}", path.display()),
    })?;
    ParquetRecordBatchReaderBuilder::try_new(file)
        .and_then(ParquetRecordBatchReaderBuilder::build)
        .map_err(|e| read_error(&e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| read_error(&e))
}

fn write_batch(path: &Path, schema: Arc<Schema>, columns: Vec<ArrayRef>) -> Result<()> {
    let write_error = |e: &dyn std::fmt::Display| Error::OperationFailed {
        operation: "write_dataset".to_string(),
        cause: e.to_string(),
    };
    let batch = RecordBatch::try_new(Arc::clone(&schema), columns).map_err(|e| write_error(&e))?;
    let file = File::create(path).map_err(|e| write_error(&e))?;
    let properties = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer =
        ArrowWriter::try_new(file, schema, Some(properties)).map_err(|e| write_error(&e))?;
    writer.write(&batch).map_err(|e| write_error(&e))?;
    writer.close().map_err(|e| write_error(&e))?;
    Ok(())
}

fn read_error(e: &dyn std::fmt::Display) -> Error {
    Error::OperationFailed {
        operation: "read_dataset".to_string(),
        cause: e.to_string(),
    }
}

fn missing(name: &str) -> Error {
    Error::InvalidInput(format!("dataset has no '{name}' column"))
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| missing(name))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::InvalidInput(format!("column '{name}' has an unexpected type")))
}

fn list_field(name: &str) -> Field {
    Field::new(
        name,
        DataType::List(Arc::new(Field::new("item", DataType::Float64, true))),
        true,
    )
}

fn list_array<'a>(rows: impl Iterator<Item = &'a [f64]>) -> ListArray {
    ListArray::from_iter_primitive::<Float64Type, _, _>(
        rows.map(|row| Some(row.iter().copied().map(Some).collect::<Vec<_>>())),
    )
}

/// Values of a list cell; nulls become NaN and a null list is empty.
fn list_values(list: &ListArray, row: usize) -> Result<Vec<f64>> {
    if list.is_null(row) {
        return Ok(Vec::new());
    }
    let values = list.value(row);
    let values = values
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| Error::InvalidInput("list values must be Float64".to_string()))?;
    Ok((0..values.len())
        .map(|i| if values.is_null(i) { f64::NAN } else { values.value(i) })
        .collect())
}

fn timestamp(array: &ArrayRef, row: usize) -> Result<DateTime<Utc>> {
    let parsed = match array.data_type() {
        DataType::Timestamp(TimeUnit::Microsecond, _) => array
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .and_then(|a| DateTime::from_timestamp_micros(a.value(row))),
        DataType::Utf8 => array
            .as_any()
            .downcast_ref::<StringArray>()
            .and_then(|a| DateTime::parse_from_rfc3339(a.value(row)).ok())
            .map(|t| t.with_timezone(&Utc)),
        other => {
            return Err(Error::InvalidInput(format!(
                "created_at has unsupported type {other}"
            )));
        },
    };
    parsed.ok_or_else(|| Error::InvalidInput(format!("row {row}: invalid created_at")))
}

fn label(array: &ArrayRef, row: usize) -> Result<bool> {
    let any = array.as_any();
    if let Some(a) = any.downcast_ref::<BooleanArray>() {
        return Ok(a.value(row));
    }
    if let Some(a) = any.downcast_ref::<Int64Array>() {
        return Ok(a.value(row) != 0);
    }
    if let Some(a) = any.downcast_ref::<Int32Array>() {
        return Ok(a.value(row) != 0);
    }
    Err(Error::InvalidInput(format!(
        "label has unsupported type {}",
        array.data_type()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::ModelKey;
    use chrono::TimeZone;

    #[test]
    fn test_inferences_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("inferences.parquet");
        let model = ModelKey::new("churn", "3");
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let records = vec![
            InferenceRecord::new(&model, vec![1.0, 2.0], 0.8, at).with_feedback(vec![1.0]),
            InferenceRecord::new(&model, vec![f64::NAN, 0.5], 0.1, at),
        ];
        write_inferences(&path, &records).unwrap();

        let read = read_inferences(&path).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0], records[0]);
        assert!(read[1].features[0].is_nan());
        assert!(read[1].feedback.is_empty());
    }

    #[test]
    fn test_reference_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("reference.parquet");
        let reference = ReferenceSet::new(vec![vec![1.0], vec![2.0]], vec![false, true])
            .unwrap()
            .with_predictions(&ModelKey::new("churn", "3"), vec![0.2, 0.9])
            .unwrap();
        write_reference(&path, &reference).unwrap();
        assert_eq!(read_reference(&path).unwrap(), reference);
    }

    #[test]
    fn test_missing_column() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.parquet");
        write_batch(
            &path,
            Arc::new(Schema::new(vec![Field::new("x", DataType::Float64, false)])),
            vec![Arc::new(Float64Array::from(vec![1.0]))],
        )
        .unwrap();
        assert!(matches!(read_reference(&path), Err(Error::InvalidInput(_))));
    }
}
