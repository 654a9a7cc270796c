//! Vector index maintenance.

use crate::cancel::CancellationToken;
use crate::storage::{GraphStore, index_name};
use crate::Result;
use std::sync::Arc;
use tracing::instrument;

/// Rebuilds the vector indexes over an embedding column.
pub struct VectorIndexManager {
    store: Arc<GraphStore>,
}

impl VectorIndexManager {
    /// Creates a manager for a store.
    #[must_use]
    pub const fn new(store: Arc<GraphStore>) -> Self {
        Self { store }
    }

    /// Rebuilds the index of every node table carrying `column`.
    ///
    /// Tables are processed in name order. Existing indexes are always
    /// rebuilt, and each one is only replaced once its successor is built,
    /// so a failure or cancellation leaves every table indexed. Returns the
    /// names of the rebuilt indexes.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`](crate::Error::Cancelled) if `cancel` fires between tables
    /// - any store error raised while building an index
    #[instrument(skip(self, cancel))]
    pub fn reindex(&self, column: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        let mut tables = Vec::new();
        for table in self.store.node_tables()? {
            if self.store.table_has_column(&table, column)? {
                tables.push(table);
            }
        }
        tables.sort();
        tracing::info!(column, tables = ?tables, "Node tables with embedding column");

        let mut rebuilt = Vec::with_capacity(tables.len());
        for table in &tables {
            cancel.check()?;
            let name = index_name(table, column);

            if self.store.vector_index_exists(&name)? {
                tracing::warn!(index = %name, "Replacing existing index");
            }

            tracing::info!(index = %name, "Building index");
            rebuilt.push(self.store.rebuild_vector_index(table, column)?);
        }

        metrics::counter!("vector_index_rebuilds_total").increment(rebuilt.len() as u64);
        Ok(rebuilt)
    }
}
