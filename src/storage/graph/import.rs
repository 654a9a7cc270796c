//! Parquet bulk import.
//!
//! Node files carry one column per declared node column, matched by name.
//! Relationship files carry the source and target node ids in their first two
//! columns followed by edge properties matched by name. A column map replaces
//! name matching with an explicit list of file columns in declared order.

// Allow cast_possible_truncation and cast_sign_loss for row counts.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
// Allow cast_possible_wrap for unsigned Arrow integers that fit in i64.
#![allow(clippy::cast_possible_wrap)]
// Allow cast_precision_loss for integer columns declared as DOUBLE.
#![allow(clippy::cast_precision_loss)]

use super::sqlite::{
    GraphStore, acquire_lock, node_sql, read_columns, read_rel_tables, rel_sql, table_kind,
};
use crate::models::schema::NODE_ID_COLUMN;
use crate::models::{ColumnDef, ColumnType, PropertyValue};
use crate::{Error, Result};
use arrow::array::{
    Array, BooleanArray, Float32Array, Float64Array, Int8Array, Int16Array, Int32Array,
    Int64Array, LargeStringArray, StringArray, StringViewArray, UInt8Array, UInt16Array,
    UInt32Array, UInt64Array,
};
use arrow::datatypes::{DataType, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::instrument;

/// One file to import into one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    /// Target node or relationship table.
    pub table: String,
    /// Parquet file.
    pub path: PathBuf,
    /// File columns in declared column order, replacing name matching.
    ///
    /// For relationship tables the list starts with the source and target
    /// columns.
    pub columns: Option<Vec<String>>,
}

impl ImportEntry {
    /// Creates an entry that matches columns by name.
    #[must_use]
    pub fn new(table: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            table: table.into(),
            path: path.into(),
            columns: None,
        }
    }

    /// Sets an explicit column map.
    #[must_use]
    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }
}

impl GraphStore {
    /// Imports a Parquet file into a node or relationship table.
    ///
    /// Returns the number of rows written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Import`] if the file cannot be read, a value cannot be
    /// coerced, a node id is already taken, a relationship endpoint is missing
    /// or has the wrong type, or a cardinality constraint is violated. No rows
    /// of the table are kept on failure.
    pub fn bulk_import(&self, table: &str, path: &Path) -> Result<usize> {
        self.bulk_import_entry(&ImportEntry::new(table, path))
    }

    /// Imports a single entry in its own transaction.
    ///
    /// # Errors
    ///
    /// See [`GraphStore::bulk_import`].
    #[instrument(skip(self, entry), fields(table = %entry.table, path = %entry.path.display()))]
    pub fn bulk_import_entry(&self, entry: &ImportEntry) -> Result<usize> {
        let rows = {
            let mut conn = acquire_lock(&self.conn);
            let tx = conn
                .transaction()
                .map_err(|e| import_error(&entry.table, e))?;
            let rows = import_into(&tx, entry)?;
            tx.commit().map_err(|e| import_error(&entry.table, e))?;
            rows
        };

        self.invalidate_counts();
        self.evict_table_indexes(&entry.table);
        tracing::info!(table = %entry.table, rows, "Imported table");
        Ok(rows)
    }

    /// Imports every entry in one transaction.
    ///
    /// Either all tables are imported or none is.
    ///
    /// # Errors
    ///
    /// Returns the [`Error::Import`] of the first failing entry.
    #[instrument(skip(self, entries), fields(entries = entries.len()))]
    pub fn bulk_import_all(&self, entries: &[ImportEntry]) -> Result<usize> {
        let total = {
            let mut conn = acquire_lock(&self.conn);
            let tx = conn
                .transaction()
                .map_err(|e| import_error("*", e))?;
            let mut total = 0;
            for entry in entries {
                total += import_into(&tx, entry)?;
            }
            tx.commit().map_err(|e| import_error("*", e))?;
            total
        };

        self.invalidate_counts();
        for entry in entries {
            self.evict_table_indexes(&entry.table);
        }
        Ok(total)
    }
}

fn import_error(table: &str, cause: impl ToString) -> Error {
    Error::Import {
        table: table.to_string(),
        cause: cause.to_string(),
    }
}

fn import_into(conn: &Connection, entry: &ImportEntry) -> Result<usize> {
    let result = table_kind(conn, &entry.table).and_then(|kind| match kind.as_deref() {
        Some("node") => import_nodes(conn, entry),
        Some(_) => import_rels(conn, entry),
        None => Err(Error::NotFound(format!("table '{}'", entry.table))),
    });

    match result {
        Ok(rows) => {
            metrics::counter!("graph_store_import_rows_total", "table" => entry.table.clone())
                .increment(rows as u64);
            Ok(rows)
        },
        Err(e @ Error::Import { .. }) => Err(e),
        Err(e) => {
            metrics::counter!("graph_store_import_failures_total").increment(1);
            Err(import_error(&entry.table, e))
        },
    }
}

fn read_parquet(path: &Path) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let file = File::open(path).map_err(|e| Error::OperationFailed {
        operation: "open_parquet".to_string(),
        cause: format!("{}: {e}", path.display()),
    })?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| Error::OperationFailed {
            operation: "read_parquet_metadata".to_string(),
            cause: e.to_string(),
        })?;
    let schema = builder.schema().clone();
    let reader = builder.build().map_err(|e| Error::OperationFailed {
        operation: "build_parquet_reader".to_string(),
        cause: e.to_string(),
    })?;

    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::OperationFailed {
            operation: "read_parquet_batch".to_string(),
            cause: e.to_string(),
        })?;
    Ok((schema, batches))
}

/// Resolves declared columns to file column positions.
///
/// `positional` pins `(declared, file)` positions ahead of name matching.
fn resolve_columns(
    schema: &SchemaRef,
    declared: &[&str],
    map: Option<&[String]>,
    positional: &[(usize, usize)],
) -> Result<Vec<Option<usize>>> {
    if let Some(map) = map {
        if map.len() != declared.len() {
            return Err(Error::InvalidInput(format!(
                "column map has {} entries, table expects {}",
                map.len(),
                declared.len()
            )));
        }
        return map
            .iter()
            .map(|name| {
                schema
                    .index_of(name)
                    .map(Some)
                    .map_err(|_| Error::InvalidInput(format!("file has no column '{name}'")))
            })
            .collect();
    }

    Ok(declared
        .iter()
        .enumerate()
        .map(|(i, name)| {
            positional
                .iter()
                .find(|(declared_pos, _)| *declared_pos == i)
                .map(|(_, file_pos)| *file_pos)
                .filter(|pos| *pos < schema.fields().len())
                .or_else(|| schema.index_of(name).ok())
        })
        .collect())
}

fn import_nodes(conn: &Connection, entry: &ImportEntry) -> Result<usize> {
    let columns = read_columns(conn, &entry.table)?;
    let (schema, batches) = read_parquet(&entry.path)?;

    let declared: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    let sources = resolve_columns(&schema, &declared, entry.columns.as_deref(), &[])?;
    let id_pos = declared
        .iter()
        .position(|name| *name == NODE_ID_COLUMN)
        .and_then(|i| sources[i])
        .ok_or_else(|| Error::InvalidInput(format!("file has no '{NODE_ID_COLUMN}' column")))?;

    let present: Vec<(&ColumnDef, usize)> = columns
        .iter()
        .zip(&sources)
        .filter_map(|(column, source)| source.map(|s| (column, s)))
        .collect();
    let names = present
        .iter()
        .map(|(c, _)| format!("\"{}\"", c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; present.len()].join(", ");

    let insert_sql = format!(
        "INSERT INTO {} ({names}) VALUES ({placeholders})",
        node_sql(&entry.table)
    );
    let mut insert = conn
        .prepare(&insert_sql)
        .map_err(|e| import_error(&entry.table, e))?;
    let mut register = conn
        .prepare_cached("INSERT INTO _node_registry (node_id, table_name) VALUES (?1, ?2)")
        .map_err(|e| import_error(&entry.table, e))?;

    let mut rows = 0;
    for batch in &batches {
        for row in 0..batch.num_rows() {
            let Value::Integer(node_id) =
                coerce(cell_value(batch.column(id_pos).as_ref(), row)?, ColumnType::Int64)?
            else {
                return Err(import_error(
                    &entry.table,
                    format!("row {rows}: {NODE_ID_COLUMN} is null"),
                ));
            };

            register
                .execute(params![node_id, entry.table])
                .map_err(|e| import_error(&entry.table, format!("node {node_id}: {e}")))?;

            let values = present
                .iter()
                .map(|(column, source)| {
                    coerce(
                        cell_value(batch.column(*source).as_ref(), row)?,
                        column.column_type,
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            insert
                .execute(params_from_iter(values.iter()))
                .map_err(|e| import_error(&entry.table, format!("node {node_id}: {e}")))?;
            rows += 1;
        }
    }

    Ok(rows)
}

fn import_rels(conn: &Connection, entry: &ImportEntry) -> Result<usize> {
    let rel = read_rel_tables(conn)?
        .into_iter()
        .find(|r| r.name == entry.table)
        .ok_or_else(|| Error::NotFound(format!("relationship table '{}'", entry.table)))?;
    let (schema, batches) = read_parquet(&entry.path)?;

    let mut declared = vec!["source_id", "target_id"];
    declared.extend(rel.properties.iter().map(|c| c.name.as_str()));
    let sources = resolve_columns(
        &schema,
        &declared,
        entry.columns.as_deref(),
        &[(0, 0), (1, 1)],
    )?;
    let (Some(source_pos), Some(target_pos)) = (sources[0], sources[1]) else {
        return Err(Error::InvalidInput(
            "relationship file needs source and target columns".to_string(),
        ));
    };

    let present: Vec<(&ColumnDef, usize)> = rel
        .properties
        .iter()
        .zip(&sources[2..])
        .filter_map(|(column, source)| source.map(|s| (column, s)))
        .collect();
    let mut names = vec!["source_id".to_string(), "target_id".to_string()];
    names.extend(present.iter().map(|(c, _)| format!("\"{}\"", c.name)));
    let placeholders = vec!["?"; names.len()].join(", ");

    let insert_sql = format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        rel_sql(&entry.table),
        names.join(", ")
    );
    let mut insert = conn
        .prepare(&insert_sql)
        .map_err(|e| import_error(&entry.table, e))?;
    let mut lookup = conn
        .prepare_cached("SELECT table_name FROM _node_registry WHERE node_id = ?1")
        .map_err(|e| import_error(&entry.table, e))?;

    let mut check_endpoint = |id: i64, expected: &str| -> Result<()> {
        let table: Option<String> = lookup
            .query_row(params![id], |row| row.get(0))
            .optional()
            .map_err(|e| import_error(&entry.table, e))?;
        match table {
            Some(table) if table == expected => Ok(()),
            Some(table) => Err(import_error(
                &entry.table,
                format!("node {id} is a {table}, expected {expected}"),
            )),
            None => Err(import_error(
                &entry.table,
                format!("endpoint node {id} does not exist"),
            )),
        }
    };

    let mut rows = 0;
    for batch in &batches {
        for row in 0..batch.num_rows() {
            let endpoint = |pos: usize| -> Result<i64> {
                match coerce(cell_value(batch.column(pos).as_ref(), row)?, ColumnType::Int64)? {
                    Value::Integer(id) => Ok(id),
                    _ => Err(import_error(
                        &entry.table,
                        format!("row {row}: endpoint is null"),
                    )),
                }
            };
            let source = endpoint(source_pos)?;
            let target = endpoint(target_pos)?;
            check_endpoint(source, &rel.from)?;
            check_endpoint(target, &rel.to)?;

            let mut values = vec![Value::Integer(source), Value::Integer(target)];
            for (column, pos) in &present {
                values.push(coerce(
                    cell_value(batch.column(*pos).as_ref(), row)?,
                    column.column_type,
                )?);
            }
            insert
                .execute(params_from_iter(values.iter()))
                .map_err(|e| import_error(&entry.table, format!("edge {source}->{target}: {e}")))?;
            rows += 1;
        }
    }

    Ok(rows)
}

fn downcast<T: 'static>(array: &dyn Array) -> Result<&T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::InvalidInput(format!("unexpected array type {}", array.data_type())))
}

/// Reads one Arrow cell.
pub(super) fn cell_value(array: &dyn Array, row: usize) -> Result<PropertyValue> {
    if array.is_null(row) {
        return Ok(PropertyValue::Null);
    }

    let value = match array.data_type() {
        DataType::Int8 => PropertyValue::Int(i64::from(downcast::<Int8Array>(array)?.value(row))),
        DataType::Int16 => {
            PropertyValue::Int(i64::from(downcast::<Int16Array>(array)?.value(row)))
        },
        DataType::Int32 => {
            PropertyValue::Int(i64::from(downcast::<Int32Array>(array)?.value(row)))
        },
        DataType::Int64 => PropertyValue::Int(downcast::<Int64Array>(array)?.value(row)),
        DataType::UInt8 => {
            PropertyValue::Int(i64::from(downcast::<UInt8Array>(array)?.value(row)))
        },
        DataType::UInt16 => {
            PropertyValue::Int(i64::from(downcast::<UInt16Array>(array)?.value(row)))
        },
        DataType::UInt32 => {
            PropertyValue::Int(i64::from(downcast::<UInt32Array>(array)?.value(row)))
        },
        DataType::UInt64 => {
            let value = downcast::<UInt64Array>(array)?.value(row);
            PropertyValue::Int(i64::try_from(value).map_err(|_| {
                Error::InvalidInput(format!("value {value} does not fit in INT64"))
            })?)
        },
        DataType::Float32 => {
            PropertyValue::Float(f64::from(downcast::<Float32Array>(array)?.value(row)))
        },
        DataType::Float64 => PropertyValue::Float(downcast::<Float64Array>(array)?.value(row)),
        DataType::Boolean => PropertyValue::Bool(downcast::<BooleanArray>(array)?.value(row)),
        DataType::Utf8 => PropertyValue::Text(downcast::<StringArray>(array)?.value(row).to_string()),
        DataType::LargeUtf8 => {
            PropertyValue::Text(downcast::<LargeStringArray>(array)?.value(row).to_string())
        },
        DataType::Utf8View => {
            PropertyValue::Text(downcast::<StringViewArray>(array)?.value(row).to_string())
        },
        other => {
            return Err(Error::InvalidInput(format!(
                "unsupported Parquet column type {other}"
            )));
        },
    };
    Ok(value)
}

/// Coerces a cell to the storage value for a declared column type.
pub(super) fn coerce(value: PropertyValue, column_type: ColumnType) -> Result<Value> {
    let mismatch = |value: &PropertyValue| {
        Error::InvalidInput(format!("cannot store {value} as {column_type}"))
    };

    let coerced = match (value, column_type) {
        (PropertyValue::Null, _) => Value::Null,
        (PropertyValue::Int(v), ColumnType::Int64 | ColumnType::Int32 | ColumnType::Int16) => {
            Value::Integer(v)
        },
        (PropertyValue::Float(v), ColumnType::Int64 | ColumnType::Int32 | ColumnType::Int16)
            if v.fract() == 0.0 && v.is_finite() =>
        {
            Value::Integer(v as i64)
        },
        (PropertyValue::Text(v), t) if t.is_integer() => v
            .trim()
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| mismatch(&PropertyValue::Text(v.clone())))?,
        (PropertyValue::Bool(v), t) if t.is_integer() => Value::Integer(i64::from(v)),
        (PropertyValue::Int(v), ColumnType::Double | ColumnType::Float) => Value::Real(v as f64),
        (PropertyValue::Float(v), ColumnType::Double | ColumnType::Float) => Value::Real(v),
        (PropertyValue::Text(v), ColumnType::Double | ColumnType::Float) => v
            .trim()
            .parse::<f64>()
            .map(Value::Real)
            .map_err(|_| mismatch(&PropertyValue::Text(v.clone())))?,
        (PropertyValue::Text(v), ColumnType::String) => Value::Text(v),
        (PropertyValue::Int(v), ColumnType::String) => Value::Text(v.to_string()),
        (PropertyValue::Float(v), ColumnType::String) => Value::Text(v.to_string()),
        (PropertyValue::Bool(v), ColumnType::String) => Value::Text(v.to_string()),
        (PropertyValue::Bool(v), ColumnType::Bool) => Value::Integer(i64::from(v)),
        (PropertyValue::Int(v), ColumnType::Bool) => Value::Integer(i64::from(v != 0)),
        (other, _) => return Err(mismatch(&other)),
    };
    Ok(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeId, NodeTableDef, RelTableDef, SchemaDefinition};
    use arrow::array::ArrayRef;
    use arrow::datatypes::{Field, Schema};
    use parquet::arrow::ArrowWriter;
    use std::sync::Arc;
    use tempfile::TempDir;
    use test_case::test_case;

    fn ints(values: Vec<i64>) -> ArrayRef {
        Arc::new(Int64Array::from(values))
    }

    fn strs(values: Vec<&str>) -> ArrayRef {
        Arc::new(StringArray::from(values))
    }

    fn write_parquet(path: &Path, columns: Vec<(&str, ArrayRef)>) {
        let fields: Vec<Field> = columns
            .iter()
            .map(|(name, array)| Field::new(*name, array.data_type().clone(), true))
            .collect();
        let schema = Arc::new(Schema::new(fields));
        let batch =
            RecordBatch::try_new(schema.clone(), columns.into_iter().map(|(_, a)| a).collect())
                .unwrap();
        let file = File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    fn store() -> GraphStore {
        let schema = SchemaDefinition::new()
            .with_node_table(NodeTableDef::new("User").with_column("user_id", ColumnType::String))
            .with_node_table(NodeTableDef::new("Genre").with_column("genre", ColumnType::String))
            .with_rel_table(
                RelTableDef::new("Likes", "User", "Genre").with_property("weight", ColumnType::Double),
            );
        let store = GraphStore::in_memory().unwrap();
        store.create_schema(&schema).unwrap();
        store
    }

    #[test]
    fn test_import_nodes_and_edges() {
        let dir = TempDir::new().unwrap();
        let users = dir.path().join("users.parquet");
        let genres = dir.path().join("genres.parquet");
        let likes = dir.path().join("likes.parquet");
        write_parquet(
            &users,
            vec![
                ("node_id", ints(vec![1, 2])),
                ("user_id", strs(vec!["a", "b"])),
            ],
        );
        write_parquet(
            &genres,
            vec![
                ("node_id", Arc::new(Int32Array::from(vec![10])) as ArrayRef),
                ("genre", strs(vec!["rock"])),
            ],
        );
        write_parquet(
            &likes,
            vec![
                ("src", ints(vec![1, 2])),
                ("dst", ints(vec![10, 10])),
                ("weight", ints(vec![3, 4])),
            ],
        );

        let store = store();
        assert_eq!(store.bulk_import("User", &users).unwrap(), 2);
        assert_eq!(store.count_nodes().unwrap(), 2);
        assert_eq!(store.bulk_import("Genre", &genres).unwrap(), 1);
        assert_eq!(store.count_nodes().unwrap(), 3);
        assert_eq!(store.bulk_import("Likes", &likes).unwrap(), 2);

        let edges = store.query_neighbors(&[NodeId::new(2)]).unwrap();
        assert_eq!(edges, vec![(NodeId::new(2), NodeId::new(10))]);
    }

    #[test]
    fn test_import_rejects_missing_endpoint() {
        let dir = TempDir::new().unwrap();
        let users = dir.path().join("users.parquet");
        let likes = dir.path().join("likes.parquet");
        write_parquet(
            &users,
            vec![
                ("node_id", ints(vec![1])),
                ("user_id", strs(vec!["a"])),
            ],
        );
        write_parquet(
            &likes,
            vec![
                ("source", ints(vec![1])),
                ("target", ints(vec![99])),
            ],
        );

        let store = store();
        store.bulk_import("User", &users).unwrap();
        let err = store.bulk_import("Likes", &likes).unwrap_err();
        assert!(matches!(err, Error::Import { ref table, .. } if table == "Likes"));
        assert!(store.query_neighbors(&[NodeId::new(1)]).unwrap().is_empty());
    }

    #[test]
    fn test_import_rolls_back_duplicate_ids() {
        let dir = TempDir::new().unwrap();
        let users = dir.path().join("users.parquet");
        write_parquet(
            &users,
            vec![
                ("node_id", ints(vec![1, 2, 1])),
                ("user_id", strs(vec!["a", "b", "c"])),
            ],
        );

        let store = store();
        assert!(matches!(
            store.bulk_import("User", &users),
            Err(Error::Import { .. })
        ));
        assert_eq!(store.count_nodes().unwrap(), 0);
    }

    #[test]
    fn test_import_all_is_atomic() {
        let dir = TempDir::new().unwrap();
        let users = dir.path().join("users.parquet");
        write_parquet(
            &users,
            vec![
                ("node_id", ints(vec![1])),
                ("user_id", strs(vec!["a"])),
            ],
        );

        let store = store();
        let entries = vec![
            ImportEntry::new("User", &users),
            ImportEntry::new("Genre", dir.path().join("missing.parquet")),
        ];
        assert!(store.bulk_import_all(&entries).is_err());
        assert_eq!(store.count_nodes().unwrap(), 0);
    }

    #[test]
    fn test_import_with_column_map() {
        let dir = TempDir::new().unwrap();
        let users = dir.path().join("users.parquet");
        write_parquet(
            &users,
            vec![
                ("name", strs(vec!["a"])),
                ("id", ints(vec![7])),
            ],
        );

        let store = store();
        let entry = ImportEntry::new("User", &users)
            .with_columns(vec!["id".to_string(), "name".to_string()]);
        assert_eq!(store.bulk_import_entry(&entry).unwrap(), 1);
        let node = store.get_node(NodeId::new(7)).unwrap();
        assert_eq!(node.property("user_id"), Some(&PropertyValue::Text("a".to_string())));
    }

    #[test_case(PropertyValue::Int(3), ColumnType::Double, Value::Real(3.0); "int to double")]
    #[test_case(PropertyValue::Float(4.0), ColumnType::Int16, Value::Integer(4); "whole float to int")]
    #[test_case(PropertyValue::Text("12".to_string()), ColumnType::Int64, Value::Integer(12); "text to int")]
    #[test_case(PropertyValue::Int(5), ColumnType::String, Value::Text("5".to_string()); "int to text")]
    #[test_case(PropertyValue::Bool(true), ColumnType::Bool, Value::Integer(1); "bool")]
    #[test_case(PropertyValue::Null, ColumnType::String, Value::Null; "null")]
    fn test_coerce(value: PropertyValue, column_type: ColumnType, expected: Value) {
        assert_eq!(coerce(value, column_type).unwrap(), expected);
    }

    #[test]
    fn test_coerce_rejects_fractional_int() {
        assert!(coerce(PropertyValue::Float(1.5), ColumnType::Int64).is_err());
        assert!(coerce(PropertyValue::Text("x".to_string()), ColumnType::Double).is_err());
    }
}
