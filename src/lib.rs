//! # Lakegraph
//!
//! Batched property-graph embedding, retrieval and inference monitoring.
//!
//! Lakegraph loads columnar exports of a lakehouse into an embedded property
//! graph, trains node embeddings by neighbor aggregation over paged node
//! batches, indexes the embeddings for constrained nearest-neighbor search and
//! assembles textual graph context from sampled paths. A separate monitoring
//! engine computes day-bucketed drift and estimated-performance statistics over
//! inference logs.
//!
//! ## Architecture
//!
//! ```text
//! Parquet export ──▶ GraphLoader ──▶ GraphStore (SQLite)
//!                                      │
//!              NodeBatchIterator ◀─────┤
//!                     │                │
//!              EmbeddingTrainer ──────▶│ update_embeddings
//!                                      │
//!            VectorIndexManager ──────▶│ vector indexes
//!                                      │
//!               GraphRetriever ◀───────┘ knn / paths / walks
//!
//! InferenceRecord log ──▶ RollingStatsEngine ──▶ StatsFrame (Parquet)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use lakegraph::{GraphStore, OpenMode, NodeBatchIterator, BatchOptions};
//!
//! let store = std::sync::Arc::new(GraphStore::open("music.graph.db", OpenMode::Existing)?);
//! for batch in NodeBatchIterator::new(store, BatchOptions::new(1000).with_edges(true)) {
//!     let batch = batch?;
//!     println!("batch {} has {} nodes", batch.number, batch.nodes.len());
//! }
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
// multiple_crate_versions is inherently crate-level (detects duplicate transitive dependencies).
// Current duplicates come from arrow/parquet and ndarray transitive deps.
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod cancel;
pub mod config;
pub mod models;
pub mod monitoring;
pub mod observability;
pub mod services;
pub mod storage;

// Re-exports for convenience
pub use cancel::CancellationToken;
pub use config::LakegraphConfig;
pub use models::{
    Cardinality, ColumnDef, ColumnType, Edge, EdgeRef, Node, NodeId, NodeTableDef, Path,
    PathBounds, PropertyValue, RelTableDef, SchemaDefinition,
};
pub use monitoring::{InferenceRecord, ModelKey, ReferenceSet, RollingStatsEngine, StatsFrame};
pub use services::{
    Batch, BatchEdges, BatchOptions, EmbeddingAlgorithm, EmbeddingTrainer,
    GraphLoader, GraphRetriever, ImportPolicy, LocalIndex, NodeBatchIterator, RetrievalConfig,
    TrainingConfig, VectorIndexManager,
};
pub use storage::{GraphStore, OpenMode, StoreConfig, VectorIndex};

/// Error type for lakegraph operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Bad identifiers, empty parameters, malformed config values |
/// | `OperationFailed` | I/O errors, `SQLite` failures, Parquet/Arrow failures |
/// | `AlreadyExists` | Creating a database or index that already exists |
/// | `NotFound` | Missing database, table, column, node or index |
/// | `SchemaConflict` | Declaring tables against a populated schema |
/// | `Import` | A table's bulk import failed and was rolled back |
/// | `DimensionMismatch` | Vectors disagree with the declared embedding dimension |
/// | `Query` | A generated graph query failed to execute |
/// | `GraphRetrieval` | Path sampling failed during retrieval |
/// | `ContextAssembly` | Retrieval found no entities or no neighbors |
/// | `UnsupportedAlgorithm` | An unknown embedding algorithm name was selected |
/// | `Cancelled` | A cancellation token fired during a long-running operation |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    ///
    /// Raised when:
    /// - `SQLite` database operations fail
    /// - Filesystem I/O errors occur
    /// - Parquet files cannot be read or written
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// A database or index already exists and reuse was not requested.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A database, table, column, node or index does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Schema declaration collided with existing tables.
    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    /// Bulk import of a single table failed.
    ///
    /// The table's rows are rolled back; sibling tables imported earlier
    /// remain in place unless the caller used an all-or-nothing load.
    #[error("import into '{table}' failed: {cause}")]
    Import {
        /// Target table.
        table: String,
        /// The underlying cause.
        cause: String,
    },

    /// Vector dimension disagreement.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Declared dimension.
        expected: usize,
        /// Offending dimension.
        actual: usize,
    },

    /// A generated query failed.
    #[error("query failed: {cause} (query: {query})")]
    Query {
        /// Query text.
        query: String,
        /// The underlying cause.
        cause: String,
    },

    /// Path sampling failed during retrieval.
    #[error("graph retrieval failed: {cause} (query: {query})")]
    GraphRetrieval {
        /// Query or traversal that failed.
        query: String,
        /// The underlying cause.
        cause: String,
    },

    /// Retrieval could not assemble a context.
    ///
    /// Raised when no entities were resolved or no neighbors were found.
    #[error("context assembly failed: {0}")]
    ContextAssembly(String),

    /// An unknown embedding algorithm was selected.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type alias for lakegraph operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("test error".to_string());
        assert_eq!(err.to_string(), "invalid input: test error");

        let err = Error::OperationFailed {
            operation: "test".to_string(),
            cause: "failed".to_string(),
        };
        assert_eq!(err.to_string(), "operation 'test' failed: failed");

        let err = Error::DimensionMismatch {
            expected: 64,
            actual: 32,
        };
        assert_eq!(err.to_string(), "dimension mismatch: expected 64, got 32");

        let err = Error::Import {
            table: "User".to_string(),
            cause: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "import into 'User' failed: boom");
    }
}
