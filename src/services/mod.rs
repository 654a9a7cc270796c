//! Graph services.
//!
//! Services orchestrate the [`GraphStore`](crate::storage::GraphStore) and
//! provide the high-level operations exposed by the CLI.
//!
//! | Service | Purpose |
//! |---------|---------|
//! | [`GraphLoader`] | Declare a schema and import a Parquet export |
//! | [`NodeBatchIterator`] | Page nodes with incident edges |
//! | [`EmbeddingTrainer`] | Train node embeddings batch by batch |
//! | [`VectorIndexManager`] | Rebuild vector indexes over an embedding column |
//! | [`GraphRetriever`] | Assemble textual graph context for a query |
//! | [`compute_con_scores`] | Write connection scores onto nodes |

mod analytics;
mod batch;
mod embedding;
mod loader;
mod retrieval;
mod vector_index;

pub use analytics::{DEFAULT_CON_COLUMN, compute_con_scores};
pub use batch::{Batch, BatchEdges, BatchOptions, LocalIndex, NodeBatchIterator};
pub use embedding::{
    EmbeddingAlgorithm, EmbeddingTrainer, Projection, TrainingConfig, TrainingReport,
    aggregate_neighbors,
};
pub use loader::{
    FailedTable, GraphDefinition, GraphLoader, ImportPlan, ImportPolicy, ImportedTable,
    LoadReport, MUSIC_TASTE, PlanEntry, music_taste,
};
pub use retrieval::{
    EntityResolver, GraphRetriever, PropertyMatchResolver, RetrievalConfig, RetrievalContext,
};
pub use vector_index::VectorIndexManager;
