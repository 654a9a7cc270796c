//! Benchmarks for graph operations.
//!
//! Covers the hot paths of training and retrieval:
//! - Node batching with and without edge spillover
//! - Neighbor aggregation over a batch
//! - Nearest-neighbor search over a vector index

// Criterion macros generate items without docs - this is expected for benchmarks
// Benchmarks use expect/unwrap for simplicity - panics are acceptable in benchmarks
#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{ArrayRef, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use lakegraph::services::aggregate_neighbors;
use lakegraph::{
    BatchOptions, GraphStore, NodeBatchIterator, NodeId, NodeTableDef, RelTableDef,
    SchemaDefinition,
};
use ndarray::Array2;
use parquet::arrow::ArrowWriter;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

const DIM: usize = 32;

// ============================================================================
// Helper Functions
// ============================================================================

fn write_ids(path: &std::path::Path, columns: Vec<(&str, Vec<i64>)>) {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, _)| Field::new(*name, DataType::Int64, false))
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

/// Builds a store with `n` items, four random out-links each, and random
/// embeddings behind a vector index.
fn create_store(n: i64) -> Arc<GraphStore> {
    let dir = TempDir::new().unwrap();
    let store = GraphStore::in_memory().unwrap();
    store
        .create_schema(
            &SchemaDefinition::new()
                .with_node_table(NodeTableDef::new("Item"))
                .with_rel_table(RelTableDef::new("Link", "Item", "Item")),
        )
        .unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let nodes = dir.path().join("items.parquet");
    write_ids(&nodes, vec![("node_id", (1..=n).collect())]);
    store.bulk_import("Item", &nodes).unwrap();

    let (sources, targets): (Vec<i64>, Vec<i64>) = (1..=n)
        .flat_map(|s| (0..4).map(move |_| s))
        .map(|s| (s, rng.gen_range(1..=n)))
        .unzip();
    let links = dir.path().join("links.parquet");
    write_ids(&links, vec![("source", sources), ("target", targets)]);
    store.bulk_import("Link", &links).unwrap();

    let vectors: BTreeMap<NodeId, Vec<f32>> = (1..=n)
        .map(|id| {
            let v: Vec<f32> = (0..DIM).map(|_| rng.r#gen::<f32>() - 0.5).collect();
            (NodeId::new(id), v)
        })
        .collect();
    store.update_embeddings(&vectors, DIM, "embedding").unwrap();
    store.create_vector_index("Item", "embedding").unwrap();
    Arc::new(store)
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_batching(c: &mut Criterion) {
    let store = create_store(5_000);

    let mut group = c.benchmark_group("batching_5000_nodes");
    group.measurement_time(Duration::from_secs(10));

    for with_edges in [false, true] {
        group.bench_with_input(
            BenchmarkId::new("batch_500", if with_edges { "edges" } else { "nodes" }),
            &with_edges,
            |b, &with_edges| {
                b.iter(|| {
                    let options = BatchOptions::new(500).with_edges(with_edges);
                    let count = NodeBatchIterator::new(Arc::clone(&store), options)
                        .map(Result::unwrap)
                        .count();
                    black_box(count)
                });
            },
        );
    }
    group.finish();
}

fn bench_aggregation(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let x = Array2::from_shape_fn((2_000, DIM), |_| rng.r#gen::<f32>());
    let edges: Vec<(usize, usize)> = (0..8_000)
        .map(|_| (rng.gen_range(0..2_000), rng.gen_range(0..2_000)))
        .collect();

    c.bench_function("aggregate_neighbors_2000x32", |b| {
        b.iter(|| black_box(aggregate_neighbors(&x, &edges)));
    });
}

fn bench_knn(c: &mut Criterion) {
    let mut group = c.benchmark_group("knn");
    group.measurement_time(Duration::from_secs(10));

    for size in [1_000_i64, 10_000] {
        let store = create_store(size);
        let exclude = HashSet::new();
        group.bench_with_input(BenchmarkId::new("k10", size), &size, |b, &size| {
            let mut rng = ChaCha8Rng::seed_from_u64(3);
            b.iter(|| {
                let node = NodeId::new(rng.gen_range(1..=size));
                black_box(store.knn(node, "embedding", 10, 1.0, &exclude).unwrap())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_batching, bench_aggregation, bench_knn);
criterion_main!(benches);
