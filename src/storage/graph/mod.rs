//! Property graph storage.
//!
//! [`GraphStore`] owns an embedded `SQLite` database holding a typed property
//! graph. Node tables and relationship tables are declared through a
//! [`SchemaDefinition`](crate::models::SchemaDefinition) and recorded in catalog
//! tables, so the store can introspect its own schema after reopening.
//!
//! # Layout
//!
//! | Table | Contents |
//! |-------|----------|
//! | `_catalog_tables` | Declared node and relationship tables |
//! | `_catalog_columns` | Declared columns, including embedding columns |
//! | `_catalog_indexes` | Vector indexes by canonical name |
//! | `_node_registry` | Graph-wide `node_id` uniqueness and table lookup |
//! | `n_<Table>` | Rows of a node table |
//! | `r_<Table>` | Rows of a relationship table (`source_id`, `target_id`, properties) |
//!
//! # Example
//!
//! ```rust,ignore
//! use lakegraph::storage::{GraphStore, OpenMode};
//! use lakegraph::models::{NodeTableDef, ColumnType, SchemaDefinition};
//!
//! let store = GraphStore::open("music.graph.db", OpenMode::Overwrite)?;
//! store.create_schema(&SchemaDefinition::new().with_node_table(
//!     NodeTableDef::new("Genre").with_column("genre", ColumnType::String),
//! ))?;
//! store.bulk_import("Genre", std::path::Path::new("export/nodes/nodes_genres.parquet"))?;
//! assert!(store.count_nodes()? > 0);
//! ```

mod embeddings;
mod import;
mod sqlite;
mod traversal;

pub use embeddings::{VectorIndexInfo, index_name};
pub use import::ImportEntry;
pub use sqlite::{GraphStore, OpenMode, StoreConfig};
