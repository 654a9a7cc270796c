//! Property-based tests for batching, nearest-neighbor search, walks and
//! rolling windows.
//!
//! Uses proptest to verify invariants across random inputs:
//! - Every node is a canonical batch member exactly once
//! - knn results respect `max_k`, `max_distance` and exclusions
//! - Shrinking `max_distance` never grows the result
//! - Random walks stay within hop bounds and never step straight back
//! - The first day of a series is computed from that day alone

// Property tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{NaiveDate, TimeZone, Utc};
use lakegraph::monitoring::{Metric, MonitoringConfig, StatFlags, ks_statistic};
use lakegraph::services::aggregate_neighbors;
use lakegraph::{
    BatchOptions, GraphStore, InferenceRecord, ModelKey, NodeBatchIterator, NodeId, NodeTableDef,
    PathBounds, ReferenceSet, RelTableDef, RollingStatsEngine, SchemaDefinition,
};
use ndarray::Array2;
use parquet::arrow::ArrowWriter;
use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

fn write_ids(path: &std::path::Path, columns: Vec<(&str, Vec<i64>)>) {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, _)| Field::new(*name, arrow::datatypes::DataType::Int64, false))
        .collect();
    let schema = Arc::new(Schema::new(fields));
    let arrays: Vec<ArrayRef> = columns
        .into_iter()
        .map(|(_, values)| Arc::new(Int64Array::from(values)) as ArrayRef)
        .collect();
    let batch = RecordBatch::try_new(schema.clone(), arrays).unwrap();
    let mut writer = ArrowWriter::try_new(File::create(path).unwrap(), schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

/// In-memory store with `Item` nodes `1..=n` and directed `Link` edges.
fn graph(n: i64, edges: &[(i64, i64)]) -> GraphStore {
    let dir = TempDir::new().unwrap();
    let store = GraphStore::in_memory().unwrap();
    store
        .create_schema(
            &SchemaDefinition::new()
                .with_node_table(NodeTableDef::new("Item"))
                .with_rel_table(RelTableDef::new("Link", "Item", "Item")),
        )
        .unwrap();

    let nodes = dir.path().join("nodes.parquet");
    write_ids(&nodes, vec![("node_id", (1..=n).collect())]);
    store.bulk_import("Item", &nodes).unwrap();

    if !edges.is_empty() {
        let links = dir.path().join("links.parquet");
        let (sources, targets) = edges.iter().copied().unzip();
        write_ids(&links, vec![("source", sources), ("target", targets)]);
        store.bulk_import("Link", &links).unwrap();
    }
    store
}

fn with_vectors(vectors: &[(f32, f32)]) -> GraphStore {
    let store = graph(i64::try_from(vectors.len()).unwrap(), &[]);
    let map: BTreeMap<NodeId, Vec<f32>> = vectors
        .iter()
        .enumerate()
        .map(|(i, (a, b))| (NodeId::new(i64::try_from(i).unwrap() + 1), vec![*a, *b]))
        .collect();
    store.update_embeddings(&map, 2, "embedding").unwrap();
    store.create_vector_index("Item", "embedding").unwrap();
    store
}

fn vector_strategy() -> impl Strategy<Value = Vec<(f32, f32)>> {
    prop::collection::vec((0.1f32..1.0, -1.0f32..1.0), 3..10)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: canonical batch members cover every node exactly once in
    /// `ceil(N / B)` batches.
    #[test]
    fn prop_batch_coverage(n in 1i64..40, batch_size in 1usize..9, with_edges in any::<bool>()) {
        let edges: Vec<(i64, i64)> = (1..n).map(|i| (i, i + 1)).collect();
        let store = Arc::new(graph(n, &edges));
        let options = BatchOptions::new(batch_size).with_edges(with_edges);

        let mut seen = Vec::new();
        let mut batches = 0;
        for batch in NodeBatchIterator::new(store, options) {
            let batch = batch.unwrap();
            batches += 1;
            prop_assert!(batch.nodes.len() <= batch_size);
            prop_assert!(batch.index.len() >= batch.nodes.len());
            prop_assert!(batch.index.ids().windows(2).all(|w| w[0] < w[1]));
            for (position, id) in batch.index.ids().iter().enumerate() {
                prop_assert_eq!(batch.index.local(*id), Some(position));
            }
            seen.extend(batch.nodes);
        }

        let expected: Vec<NodeId> = (1..=n).map(NodeId::new).collect();
        prop_assert_eq!(seen, expected);
        prop_assert_eq!(batches, usize::try_from(n).unwrap().div_ceil(batch_size));
    }

    /// Property: knn never exceeds `max_k` or `max_distance` and never returns
    /// an excluded node.
    #[test]
    fn prop_knn_bounds(
        vectors in vector_strategy(),
        max_k in 1usize..6,
        max_distance in 0.0f32..2.0,
        excluded in prop::collection::vec(1i64..10, 0..3),
    ) {
        let store = with_vectors(&vectors);
        let exclude: HashSet<NodeId> = excluded.into_iter().map(NodeId::new).collect();

        let hits = store.knn(NodeId::new(1), "embedding", max_k, max_distance, &exclude).unwrap();

        prop_assert!(hits.len() <= max_k);
        for hit in &hits {
            prop_assert!(hit.distance <= max_distance);
            prop_assert!(!exclude.contains(&hit.node_id));
        }
        prop_assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    /// Property: shrinking `max_distance` never increases the result count.
    #[test]
    fn prop_knn_monotonic(
        vectors in vector_strategy(),
        max_k in 1usize..6,
        tight in 0.0f32..1.0,
        slack in 0.0f32..1.0,
    ) {
        let store = with_vectors(&vectors);
        let exclude = HashSet::new();

        let narrow = store.knn(NodeId::new(1), "embedding", max_k, tight, &exclude).unwrap();
        let wide = store
            .knn(NodeId::new(1), "embedding", max_k, tight + slack, &exclude)
            .unwrap();
        prop_assert!(narrow.len() <= wide.len());
    }

    /// Property: walks stay within bounds, never backtrack, and stop short of
    /// `min_len` only at a dead end.
    #[test]
    fn prop_walk_bounds(
        edges in prop::collection::vec((1i64..8, 1i64..8), 1..16),
        min_len in 0usize..3,
        extra in 0usize..3,
        seed in any::<u64>(),
    ) {
        let edges: Vec<(i64, i64)> = edges.into_iter().filter(|(a, b)| a != b).collect();
        let store = graph(7, &edges);
        let bounds = PathBounds::new(min_len, min_len + extra).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let walks = store.random_walk(NodeId::new(1), 4, bounds, &mut rng).unwrap();
        prop_assert_eq!(walks.len(), 4);

        for walk in walks {
            prop_assert_eq!(walk.nodes[0], NodeId::new(1));
            prop_assert_eq!(walk.nodes.len(), walk.hops() + 1);
            prop_assert!(walk.hops() <= bounds.max_len);
            prop_assert!(walk.nodes.windows(3).all(|w| w[0] != w[2]));

            if walk.hops() < bounds.min_len {
                let last = walk.nodes[walk.nodes.len() - 1];
                let previous = walk.nodes.len().checked_sub(2).map(|i| walk.nodes[i]);
                let eligible = store
                    .neighbors_undirected(last)
                    .unwrap()
                    .into_iter()
                    .filter(|(n, _)| Some(*n) != previous)
                    .count();
                prop_assert_eq!(eligible, 0);
            }
        }
    }

    /// Property: the first day's drift uses exactly that day's predictions,
    /// whatever the window size.
    #[test]
    fn prop_window_minimum(
        first_day in prop::collection::vec(0.0f64..1.0, 1..12),
        later in prop::collection::vec(0.0f64..1.0, 0..12),
        window in 1usize..10,
    ) {
        let model = ModelKey::new("m", "1");
        let reference_predictions: Vec<f64> = (0..20).map(|i| f64::from(i) / 20.0).collect();
        let reference = ReferenceSet::new(vec![vec![0.0]; 20], vec![false; 20])
            .unwrap()
            .with_predictions(&model, reference_predictions.clone())
            .unwrap();

        let at = |day: u32| Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap();
        let records: Vec<InferenceRecord> = first_day
            .iter()
            .map(|p| InferenceRecord::new(&model, vec![*p], *p, at(1)))
            .chain(later.iter().map(|p| InferenceRecord::new(&model, vec![*p], *p, at(2))))
            .collect();

        let engine = RollingStatsEngine::new(
            MonitoringConfig::new()
                .with_flags(StatFlags::PREDICTION_DRIFT)
                .with_window_size(window),
        )
        .unwrap();
        let frame = engine.compute(&reference, &records, &[]).unwrap();

        let day_one = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let expected = ks_statistic(&reference_predictions, &first_day);
        prop_assert_eq!(frame.get(day_one, &model, Metric::PredictionDriftKs), expected);
    }

    /// Property: nodes without in-batch edges aggregate to zeros.
    #[test]
    fn prop_aggregation_without_edges_is_zero(
        values in prop::collection::vec(-10.0f32..10.0, 12),
    ) {
        let x = Array2::from_shape_vec((4, 3), values).unwrap();
        let aggregated = aggregate_neighbors(&x, &[(0, 1)]);
        for row in 1..4 {
            prop_assert!(aggregated.row(row).iter().all(|v| *v == 0.0));
        }
        prop_assert!(aggregated.iter().all(|v| v.is_finite()));
    }

    /// Property: writing the same embeddings twice stores the same vectors.
    #[test]
    fn prop_embedding_write_idempotent(vectors in vector_strategy()) {
        let store = graph(i64::try_from(vectors.len()).unwrap(), &[]);
        let map: BTreeMap<NodeId, Vec<f32>> = vectors
            .iter()
            .enumerate()
            .map(|(i, (a, b))| (NodeId::new(i64::try_from(i).unwrap() + 1), vec![*a, *b]))
            .collect();

        store.update_embeddings(&map, 2, "embedding").unwrap();
        store.update_embeddings(&map, 2, "embedding").unwrap();
        for (id, vector) in &map {
            prop_assert_eq!(&store.node_vector(*id, "embedding").unwrap(), vector);
        }
    }
}
