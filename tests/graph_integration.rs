//! Graph integration tests.
//!
//! Exercises the Parquet import → batching → embedding → index → retrieval
//! path against file-backed stores.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use lakegraph::services::{GraphDefinition, VectorIndexManager};
use lakegraph::{
    BatchOptions, CancellationToken, ColumnType, EmbeddingTrainer, Error, GraphLoader,
    GraphRetriever, GraphStore, ImportPolicy, NodeBatchIterator, NodeId, NodeTableDef, OpenMode,
    PathBounds, RelTableDef, RetrievalConfig, SchemaDefinition, TrainingConfig,
};
use parquet::arrow::ArrowWriter;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

fn ints(values: &[i64]) -> ArrayRef {
    Arc::new(Int64Array::from(values.to_vec()))
}

fn strs(values: &[&str]) -> ArrayRef {
    Arc::new(StringArray::from(values.to_vec()))
}

/// Writes a single-batch Parquet file.
fn write_parquet(path: &Path, columns: Vec<(&str, ArrayRef)>) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, array)| Field::new(*name, array.data_type().clone(), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), columns.into_iter().map(|(_, a)| a).collect())
        .unwrap();
    let mut writer = ArrowWriter::try_new(File::create(path).unwrap(), schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

/// One node table `Item(name)` and one relationship `Link` between items.
fn item_store(dir: &TempDir, ids: &[i64], edges: &[(i64, i64)]) -> GraphStore {
    let store = GraphStore::open(dir.path().join("items.graph.db"), OpenMode::CreateNew).unwrap();
    store
        .create_schema(
            &SchemaDefinition::new()
                .with_node_table(NodeTableDef::new("Item").with_column("name", ColumnType::String))
                .with_rel_table(RelTableDef::new("Link", "Item", "Item")),
        )
        .unwrap();

    let names: Vec<String> = ids.iter().map(|id| format!("item-{id}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let nodes = dir.path().join("items.parquet");
    write_parquet(&nodes, vec![("node_id", ints(ids)), ("name", strs(&names))]);
    store.bulk_import("Item", &nodes).unwrap();

    if !edges.is_empty() {
        let (sources, targets): (Vec<i64>, Vec<i64>) = edges.iter().copied().unzip();
        let links = dir.path().join("links.parquet");
        write_parquet(&links, vec![("from", ints(&sources)), ("to", ints(&targets))]);
        store.bulk_import("Link", &links).unwrap();
    }
    store
}

#[test]
fn test_import_counts_nodes_not_edges() {
    let dir = TempDir::new().unwrap();
    let store = GraphStore::open(dir.path().join("music.graph.db"), OpenMode::CreateNew).unwrap();
    store
        .create_schema(
            &SchemaDefinition::new()
                .with_node_table(NodeTableDef::new("User").with_column("user_id", ColumnType::String))
                .with_node_table(NodeTableDef::new("Genre").with_column("genre", ColumnType::String))
                .with_rel_table(RelTableDef::new("Likes", "User", "Genre")),
        )
        .unwrap();

    let users = dir.path().join("users.parquet");
    let genres = dir.path().join("genres.parquet");
    let likes = dir.path().join("likes.parquet");
    write_parquet(&users, vec![("node_id", ints(&[1, 2])), ("user_id", strs(&["u1", "u2"]))]);
    write_parquet(&genres, vec![("node_id", ints(&[10, 11])), ("genre", strs(&["rock", "jazz"]))]);
    write_parquet(&likes, vec![("user", ints(&[1, 2])), ("genre", ints(&[10, 11]))]);

    assert_eq!(store.bulk_import("User", &users).unwrap(), 2);
    assert_eq!(store.count_nodes().unwrap(), 2);

    store.bulk_import("Genre", &genres).unwrap();
    let before_edges = store.count_nodes().unwrap();
    assert_eq!(store.bulk_import("Likes", &likes).unwrap(), 2);
    assert_eq!(store.count_nodes().unwrap(), before_edges);

    assert_eq!(
        store.query_neighbors(&[NodeId::new(1)]).unwrap(),
        vec![(NodeId::new(1), NodeId::new(10))]
    );
}

#[test]
fn test_existing_database_requires_overwrite() {
    let dir = TempDir::new().unwrap();
    drop(item_store(&dir, &[1], &[]));

    let existing = dir.path().join("items.graph.db");
    assert!(matches!(
        GraphStore::open(&existing, OpenMode::CreateNew),
        Err(Error::AlreadyExists(_))
    ));
    let reopened = GraphStore::open(&existing, OpenMode::Existing).unwrap();
    assert_eq!(reopened.count_nodes().unwrap(), 1);
    drop(reopened);

    let fresh = GraphStore::open(&existing, OpenMode::Overwrite).unwrap();
    assert!(fresh.node_tables().unwrap().is_empty());
}

#[test]
fn test_batches_with_edge_spillover() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(item_store(&dir, &[1, 2, 3], &[(1, 2), (2, 3)]));

    let batches: Vec<_> =
        NodeBatchIterator::new(store, BatchOptions::new(1).with_edges(true))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

    assert_eq!(batches.len(), 3);
    assert_eq!(batches[0].nodes, vec![NodeId::new(1)]);
    assert_eq!(batches[0].index.ids(), &[NodeId::new(1), NodeId::new(2)]);
    assert!(batches[0].is_canonical(NodeId::new(1)));
    assert!(!batches[0].is_canonical(NodeId::new(2)));
    assert_eq!(batches[2].index.ids(), &[NodeId::new(3)]);
}

#[test]
fn test_knn_excludes_closest_neighbor() {
    let dir = TempDir::new().unwrap();
    let store = item_store(&dir, &[1, 2, 3, 4, 5], &[]);

    let vectors: BTreeMap<NodeId, Vec<f32>> = [
        (1, vec![1.0, 0.0]),
        (2, vec![1.0, 0.05]),
        (3, vec![1.0, 0.3]),
        (4, vec![1.0, 0.7]),
        (5, vec![0.0, 1.0]),
    ]
    .into_iter()
    .map(|(id, v)| (NodeId::new(id), v))
    .collect();
    store.update_embeddings(&vectors, 2, "embedding").unwrap();
    store.create_vector_index("Item", "embedding").unwrap();

    let exclude: HashSet<NodeId> = [NodeId::new(2)].into_iter().collect();
    let hits = store
        .knn(NodeId::new(1), "embedding", 2, 0.25, &exclude)
        .unwrap();

    assert!(hits.len() <= 2);
    assert!(hits.iter().all(|h| h.node_id != NodeId::new(2)));
    assert!(hits.iter().all(|h| h.distance <= 0.25));
    let ids: Vec<NodeId> = hits.iter().map(|h| h.node_id).collect();
    assert!(ids.contains(&NodeId::new(3)));
    assert!(!ids.contains(&NodeId::new(5)));
}

#[test]
fn test_shortest_paths_never_padded() {
    let dir = TempDir::new().unwrap();
    let store = item_store(&dir, &[1, 2, 3, 4], &[(1, 2), (2, 4)]);
    let mut rng = ChaCha8Rng::seed_from_u64(3);

    let paths = store
        .sample_shortest_paths(
            &[NodeId::new(1)],
            &[NodeId::new(4)],
            3,
            PathBounds::new(1, 3).unwrap(),
            &mut rng,
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(paths.len(), 1);
    assert_eq!(
        paths[0].nodes,
        vec![NodeId::new(1), NodeId::new(2), NodeId::new(4)]
    );
    assert_eq!(paths[0].hops(), 2);

    let none = store
        .sample_shortest_paths(
            &[NodeId::new(1)],
            &[NodeId::new(4)],
            3,
            PathBounds::new(1, 1).unwrap(),
            &mut rng,
            &CancellationToken::new(),
        )
        .unwrap();
    assert!(none.is_empty());
}

#[test]
fn test_cancelled_path_sampling() {
    let dir = TempDir::new().unwrap();
    let store = item_store(&dir, &[1, 2], &[(1, 2)]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = store.sample_shortest_paths(
        &[NodeId::new(1)],
        &[NodeId::new(2)],
        1,
        PathBounds::new(1, 2).unwrap(),
        &mut ChaCha8Rng::seed_from_u64(0),
        &cancel,
    );
    assert!(matches!(result, Err(Error::Cancelled)));
}

const MINI_MUSIC: &str = r#"
[[node_tables]]
name = "User"
columns = [
    { name = "node_id", type = "INT64" },
    { name = "user_id", type = "STRING" },
]

[[node_tables]]
name = "Genre"
columns = [
    { name = "node_id", type = "INT64" },
    { name = "genre", type = "STRING" },
]

[[rel_tables]]
name = "Likes"
from = "User"
to = "Genre"

[[import]]
table = "User"
file = "nodes/users.parquet"

[[import]]
table = "Genre"
file = "nodes/genres.parquet"

[[import]]
table = "Likes"
file = "edges/likes.parquet"
"#;

fn write_mini_export(root: &Path) {
    write_parquet(
        &root.join("nodes/users.parquet"),
        vec![
            ("node_id", ints(&[1, 2, 3, 4])),
            ("user_id", strs(&["ana", "ben", "cy", "dee"])),
        ],
    );
    write_parquet(
        &root.join("nodes/genres.parquet"),
        vec![
            ("node_id", ints(&[10, 11])),
            ("genre", strs(&["rock", "jazz"])),
        ],
    );
    write_parquet(
        &root.join("edges/likes.parquet"),
        vec![
            ("user", ints(&[1, 2, 3, 4, 1])),
            ("genre", ints(&[10, 10, 11, 11, 11])),
        ],
    );
}

#[test]
fn test_load_embed_index_retrieve() {
    let dir = TempDir::new().unwrap();
    let export = dir.path().join("export");
    write_mini_export(&export);

    let definition = GraphDefinition::from_toml(MINI_MUSIC).unwrap();
    let store = Arc::new(
        GraphStore::open(dir.path().join("mini.graph.db"), OpenMode::CreateNew).unwrap(),
    );
    let report = GraphLoader::new(Arc::clone(&store), ImportPolicy::AllOrNothing)
        .load(&definition, &export)
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.total_rows(), 11);

    let training = TrainingConfig::default()
        .with_dim(8)
        .with_batch_size(2)
        .with_epochs(2);
    let trained = EmbeddingTrainer::new(Arc::clone(&store), training)
        .train(&CancellationToken::new())
        .unwrap();
    assert_eq!(trained.nodes, 6);

    let rebuilt = VectorIndexManager::new(Arc::clone(&store))
        .reindex("embedding", &CancellationToken::new())
        .unwrap();
    assert_eq!(rebuilt, vec!["genre_embedding_idx", "user_embedding_idx"]);

    let retriever = GraphRetriever::new(
        store,
        RetrievalConfig::new().with_max_distance(2.0).with_seed(11),
    );
    let context = retriever
        .retrieve("what is rock", &CancellationToken::new())
        .unwrap();
    assert_eq!(context.seeds, vec![NodeId::new(10)]);
    assert!(!context.neighbors.is_empty());
    assert!(context.text.starts_with("Nodes:\n"));
    assert!(context.text.contains("(:Genre {genre: \"rock\"})"));
    assert!(context.text.contains("\n\nRelationships:\n"));
}

#[test]
fn test_retrieval_without_entities_fails() {
    let dir = TempDir::new().unwrap();
    let export = dir.path().join("export");
    write_mini_export(&export);
    let store = Arc::new(
        GraphStore::open(dir.path().join("mini.graph.db"), OpenMode::CreateNew).unwrap(),
    );
    GraphLoader::new(Arc::clone(&store), ImportPolicy::BestEffort)
        .load(&GraphDefinition::from_toml(MINI_MUSIC).unwrap(), &export)
        .unwrap();

    let retriever = GraphRetriever::new(store, RetrievalConfig::new());
    let err = retriever
        .retrieve("nothing matches here", &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, Error::ContextAssembly(_)));
}

#[test]
fn test_best_effort_keeps_sibling_tables() {
    let dir = TempDir::new().unwrap();
    let export = dir.path().join("export");
    write_mini_export(&export);
    std::fs::remove_file(export.join("nodes/genres.parquet")).unwrap();

    let store = Arc::new(
        GraphStore::open(dir.path().join("partial.graph.db"), OpenMode::CreateNew).unwrap(),
    );
    let report = GraphLoader::new(Arc::clone(&store), ImportPolicy::BestEffort)
        .load(&GraphDefinition::from_toml(MINI_MUSIC).unwrap(), &export)
        .unwrap();

    assert!(!report.is_complete());
    let failed: Vec<&str> = report.failed.iter().map(|f| f.entry.table.as_str()).collect();
    // Likes fails too: its genre endpoints were never imported
    assert_eq!(failed, vec!["Genre", "Likes"]);
    assert_eq!(store.count_nodes().unwrap(), 4);
}

#[test]
fn test_all_or_nothing_rolls_back() {
    let dir = TempDir::new().unwrap();
    let export = dir.path().join("export");
    write_mini_export(&export);
    std::fs::remove_file(export.join("edges/likes.parquet")).unwrap();

    let store = Arc::new(
        GraphStore::open(dir.path().join("atomic.graph.db"), OpenMode::CreateNew).unwrap(),
    );
    let result = GraphLoader::new(Arc::clone(&store), ImportPolicy::AllOrNothing)
        .load(&GraphDefinition::from_toml(MINI_MUSIC).unwrap(), &export);

    assert!(result.is_err());
    store.invalidate_counts();
    assert_eq!(store.count_nodes().unwrap(), 0);
}
