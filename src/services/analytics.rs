//! Graph analytics written back as node properties.

use crate::storage::GraphStore;
use crate::{Error, Result};
use tracing::instrument;

/// Default property receiving CON scores.
pub const DEFAULT_CON_COLUMN: &str = "con_score";

/// Computes connection (CON) scores and stores them on `node_table`.
///
/// For each node `a` with out-edges in `rel_table`, the score is the sum over
/// every other node `b` and every target `c` shared by `a` and `b` of
/// `min(w(a→c), w(b→c))`, where `w` is the `weight` edge property. Nodes
/// without shared targets keep the column default of `0.0`.
///
/// The relationship must connect `node_table` to itself. Returns the number
/// of nodes with a non-default score.
///
/// # Errors
///
/// - [`Error::NotFound`] if a table or the weight property does not exist
/// - [`Error::InvalidInput`] if the relationship does not connect
///   `node_table` to itself
/// - [`Error::SchemaConflict`] if `column` exists with a non-`DOUBLE` type
#[instrument(skip(store))]
pub fn compute_con_scores(
    store: &GraphStore,
    node_table: &str,
    rel_table: &str,
    weight: &str,
    column: &str,
) -> Result<usize> {
    let rel = store
        .rel_tables()?
        .into_iter()
        .find(|r| r.name == rel_table)
        .ok_or_else(|| Error::NotFound(format!("relationship table '{rel_table}'")))?;
    if rel.from != node_table || rel.to != node_table {
        return Err(Error::InvalidInput(format!(
            "relationship '{rel_table}' connects {} to {}, expected {node_table} to {node_table}",
            rel.from, rel.to
        )));
    }

    let scores = store.shared_target_weights(rel_table, weight)?;
    let updated = store.set_scalar_column(node_table, column, &scores)?;

    metrics::counter!("graph_analytics_con_scores_total").increment(scores.len() as u64);
    tracing::info!(
        node_table,
        rel_table,
        column,
        scored = scores.len(),
        "Computed CON scores"
    );
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ColumnType, NodeId, NodeTableDef, PropertyValue, RelTableDef, SchemaDefinition,
    };
    use arrow::array::{ArrayRef, Float64Array, Int64Array};
    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;
    use std::path::Path;
    use std::sync::Arc;

    fn write(path: &Path, columns: Vec<(&str, ArrayRef)>) {
        let fields: Vec<Field> = columns
            .iter()
            .map(|(name, array)| Field::new(*name, array.data_type().clone(), true))
            .collect();
        let schema = Arc::new(Schema::new(fields));
        let arrays = columns.into_iter().map(|(_, array)| array).collect();
        let batch = RecordBatch::try_new(schema.clone(), arrays).unwrap();
        let mut writer =
            ArrowWriter::try_new(std::fs::File::create(path).unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    fn ints(values: &[i64]) -> ArrayRef {
        Arc::new(Int64Array::from(values.to_vec()))
    }

    fn store() -> GraphStore {
        let dir = tempfile::TempDir::new().unwrap();
        let store = GraphStore::in_memory().unwrap();
        store
            .create_schema(
                &SchemaDefinition::new()
                    .with_node_table(NodeTableDef::new("Person"))
                    .with_node_table(NodeTableDef::new("Genre"))
                    .with_rel_table(
                        RelTableDef::new("Knows", "Person", "Person")
                            .with_property("esi", ColumnType::Double),
                    )
                    .with_rel_table(RelTableDef::new("Likes", "Person", "Genre")),
            )
            .unwrap();

        let nodes = dir.path().join("people.parquet");
        write(&nodes, vec![("node_id", ints(&[1, 2, 3, 4]))]);
        store.bulk_import("Person", &nodes).unwrap();

        // 1 and 2 both point at 3 and 4; 3 points at 4 alone.
        let edges = dir.path().join("knows.parquet");
        let weights: ArrayRef = Arc::new(Float64Array::from(vec![0.5, 1.0, 0.25, 2.0, 1.5]));
        write(
            &edges,
            vec![
                ("source_id", ints(&[1, 1, 2, 2, 3])),
                ("target_id", ints(&[3, 4, 3, 4, 4])),
                ("esi", weights),
            ],
        );
        store.bulk_import("Knows", &edges).unwrap();
        store
    }

    fn score(store: &GraphStore, id: i64) -> f64 {
        store
            .get_node(NodeId::new(id))
            .unwrap()
            .property(DEFAULT_CON_COLUMN)
            .and_then(PropertyValue::as_float)
            .unwrap()
    }

    #[test]
    fn test_con_scores() {
        let store = store();
        let updated =
            compute_con_scores(&store, "Person", "Knows", "esi", DEFAULT_CON_COLUMN).unwrap();
        assert_eq!(updated, 3);

        // a=1: b=2 shares 3 and 4 (0.25 + 1.0); b=3 shares 4 (1.0)
        assert!((score(&store, 1) - 2.25).abs() < 1e-9);
        // a=2: b=1 gives 0.25 + 1.0; b=3 gives min(2.0, 1.5)
        assert!((score(&store, 2) - 2.75).abs() < 1e-9);
        // a=3: shares 4 with 1 and 2
        assert!((score(&store, 3) - 2.5).abs() < 1e-9);
        // a=4 has no out-edges
        assert!(score(&store, 4).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_heterogeneous_relationship() {
        let store = store();
        assert!(matches!(
            compute_con_scores(&store, "Person", "Likes", "esi", DEFAULT_CON_COLUMN),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            compute_con_scores(&store, "Person", "Follows", "esi", DEFAULT_CON_COLUMN),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            compute_con_scores(&store, "Person", "Knows", "weight", DEFAULT_CON_COLUMN),
            Err(Error::NotFound(_))
        ));
    }
}
