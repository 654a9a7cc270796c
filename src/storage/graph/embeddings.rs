//! Embedding columns, vector indexes and nearest-neighbor search.
//!
//! Embeddings are stored as little-endian `f32` blobs in a `FLOAT[dim]`
//! column that every node table shares. Vector indexes are recorded in
//! `_catalog_indexes` and materialized in memory on first use. Writing
//! embeddings evicts the in-memory copies, so a search always reflects the
//! stored column.

// Allow cast_possible_truncation and cast_sign_loss for SQLite i64 dimensions.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

use super::sqlite::{
    CachedIndex, GraphStore, acquire_lock, insert_column, node_sql, query_error, read_columns,
    read_node_tables, registry_table, sql_error, table_kind,
};
use crate::models::schema::{NODE_ID_COLUMN, validate_identifier};
use crate::models::{ColumnDef, ColumnType, Neighbor, NodeId};
use crate::storage::traits::VectorIndex;
use crate::storage::vector::UsearchIndex;
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError};
use tracing::instrument;

/// Name of the vector index over `table.column`.
///
/// The same name is used when creating, dropping and searching indexes.
#[must_use]
pub fn index_name(table: &str, column: &str) -> String {
    format!("{table}_{column}_idx").to_lowercase()
}

/// A vector index recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorIndexInfo {
    /// Index name.
    pub name: String,
    /// Indexed node table.
    pub table: String,
    /// Indexed column.
    pub column: String,
    /// Vector dimension.
    pub dim: usize,
}

pub(super) fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(super) fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    bytes
        .chunks_exact(4)
        .map(|chunk| <[u8; 4]>::try_from(chunk).ok().map(f32::from_le_bytes))
        .collect()
}

impl GraphStore {
    // ========================================================================
    // Embedding columns
    // ========================================================================

    /// Writes embeddings, chunked by the configured write batch size.
    ///
    /// # Errors
    ///
    /// See [`GraphStore::update_embeddings_chunked`].
    pub fn update_embeddings(
        &self,
        embeddings: &BTreeMap<NodeId, Vec<f32>>,
        dim: usize,
        column: &str,
    ) -> Result<usize> {
        self.update_embeddings_chunked(embeddings, dim, column, self.config.write_batch_size)
    }

    /// Writes embeddings into `column` of each node's table.
    ///
    /// Every node table gets the column if it does not have it yet, zero-filled.
    /// Rows are then written `chunk_size` at a time, one transaction per chunk.
    /// Writing the same map twice leaves the store unchanged. Returns the
    /// number of vectors written.
    ///
    /// # Errors
    ///
    /// - [`Error::DimensionMismatch`] if a vector is not `dim` long, or the
    ///   column already exists with another dimension
    /// - [`Error::NotFound`] if a node id does not exist
    /// - [`Error::SchemaConflict`] if the column exists with a non-vector type
    #[instrument(skip(self, embeddings), fields(vectors = embeddings.len()))]
    pub fn update_embeddings_chunked(
        &self,
        embeddings: &BTreeMap<NodeId, Vec<f32>>,
        dim: usize,
        column: &str,
        chunk_size: usize,
    ) -> Result<usize> {
        validate_identifier(column)?;
        if column == NODE_ID_COLUMN {
            return Err(Error::InvalidInput(format!(
                "cannot store embeddings in '{NODE_ID_COLUMN}'"
            )));
        }
        if dim == 0 {
            return Err(Error::InvalidInput(
                "embedding dimension must be positive".to_string(),
            ));
        }
        if let Some(vector) = embeddings.values().find(|v| v.len() != dim) {
            return Err(Error::DimensionMismatch {
                expected: dim,
                actual: vector.len(),
            });
        }

        let mut conn = acquire_lock(&self.conn);

        let mut targets = Vec::with_capacity(embeddings.len());
        for (id, vector) in embeddings {
            let table = registry_table(&conn, *id)?
                .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
            targets.push((table, *id, vector));
        }

        {
            let tx = conn
                .transaction()
                .map_err(sql_error("begin_embedding_columns"))?;
            for table in read_node_tables(&tx)? {
                ensure_vector_column(&tx, &table, column, dim)?;
            }
            tx.commit().map_err(sql_error("commit_embedding_columns"))?;
        }

        for chunk in targets.chunks(chunk_size.max(1)) {
            let tx = conn
                .transaction()
                .map_err(sql_error("begin_update_embeddings"))?;
            for (table, id, vector) in chunk {
                let sql = format!(
                    "UPDATE {} SET \"{column}\" = ?1 WHERE node_id = ?2",
                    node_sql(table)
                );
                tx.prepare_cached(&sql)
                    .and_then(|mut stmt| stmt.execute(params![encode_vector(vector), id.get()]))
                    .map_err(query_error(&sql))?;
            }
            tx.commit().map_err(sql_error("commit_update_embeddings"))?;
            metrics::counter!("embedding_vectors_written_total").increment(chunk.len() as u64);
        }
        drop(conn);

        self.evict_column_indexes(column);
        tracing::debug!(vectors = targets.len(), column, "Updated embeddings");
        Ok(targets.len())
    }

    /// Reads a node's stored vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the node does not exist or has no vector
    /// in `column`.
    pub fn node_vector(&self, id: NodeId, column: &str) -> Result<Vec<f32>> {
        let conn = acquire_lock(&self.conn);
        let table =
            registry_table(&conn, id)?.ok_or_else(|| Error::NotFound(format!("node {id}")))?;
        if !read_columns(&conn, &table)?.iter().any(|c| c.name == column) {
            return Err(Error::NotFound(format!("column '{table}.{column}'")));
        }

        let sql = format!(
            "SELECT \"{column}\" FROM {} WHERE node_id = ?1",
            node_sql(&table)
        );
        let bytes: Option<Vec<u8>> = conn
            .query_row(&sql, params![id.get()], |row| row.get(0))
            .optional()
            .map_err(query_error(&sql))?
            .flatten();

        bytes
            .as_deref()
            .and_then(decode_vector)
            .ok_or_else(|| Error::NotFound(format!("vector for node {id} in '{column}'")))
    }

    // ========================================================================
    // Vector indexes
    // ========================================================================

    /// Creates a vector index over a `FLOAT[dim]` column of a node table.
    ///
    /// Returns the index name.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the table or vector column does not exist
    /// - [`Error::AlreadyExists`] if the index exists
    #[instrument(skip(self))]
    pub fn create_vector_index(&self, table: &str, column: &str) -> Result<String> {
        let name = index_name(table, column);
        let conn = acquire_lock(&self.conn);

        let dim = vector_column_dim(&conn, table, column)?;
        if index_exists(&conn, &name)? {
            return Err(Error::AlreadyExists(format!("vector index '{name}'")));
        }

        let index = build_index(&conn, table, column, dim)?;
        conn.execute(
            "INSERT INTO _catalog_indexes (name, table_name, column_name, dim) VALUES (?1, ?2, ?3, ?4)",
            params![name, table, column, dim as i64],
        )
        .map_err(sql_error("catalog_vector_index"))?;
        drop(conn);

        tracing::info!(index = %name, vectors = index.len(), "Created vector index");
        metrics::counter!("graph_store_vector_index_builds_total").increment(1);
        self.indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.clone(),
                CachedIndex {
                    column: column.to_string(),
                    index: Arc::new(index),
                },
            );
        Ok(name)
    }

    /// Drops a vector index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the index does not exist.
    #[instrument(skip(self))]
    pub fn drop_vector_index(&self, name: &str) -> Result<()> {
        let removed = {
            let conn = acquire_lock(&self.conn);
            conn.execute("DELETE FROM _catalog_indexes WHERE name = ?1", params![name])
                .map_err(sql_error("drop_vector_index"))?
        };
        self.indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);

        if removed == 0 {
            return Err(Error::NotFound(format!("vector index '{name}'")));
        }
        Ok(())
    }

    /// Builds the index over `table.column` and swaps it in for any existing
    /// one.
    ///
    /// The new index is built before the catalog changes, and the catalog
    /// row is replaced in one transaction. A failed build leaves the
    /// previous index in place. Returns the index name.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the table or vector column does not exist
    /// - [`Error::OperationFailed`] if the catalog cannot be updated
    #[instrument(skip(self))]
    pub fn rebuild_vector_index(&self, table: &str, column: &str) -> Result<String> {
        let name = index_name(table, column);
        let mut conn = acquire_lock(&self.conn);

        let dim = vector_column_dim(&conn, table, column)?;
        let index = build_index(&conn, table, column, dim)?;

        let tx = conn
            .transaction()
            .map_err(sql_error("begin_rebuild_vector_index"))?;
        tx.execute("DELETE FROM _catalog_indexes WHERE name = ?1", params![name])
            .map_err(sql_error("rebuild_vector_index_delete"))?;
        tx.execute(
            "INSERT INTO _catalog_indexes (name, table_name, column_name, dim) VALUES (?1, ?2, ?3, ?4)",
            params![name, table, column, dim as i64],
        )
        .map_err(sql_error("rebuild_vector_index_insert"))?;
        tx.commit().map_err(sql_error("commit_rebuild_vector_index"))?;
        drop(conn);

        tracing::info!(index = %name, vectors = index.len(), "Rebuilt vector index");
        metrics::counter!("graph_store_vector_index_builds_total").increment(1);
        self.indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.clone(),
                CachedIndex {
                    column: column.to_string(),
                    index: Arc::new(index),
                },
            );
        Ok(name)
    }

    /// Returns `true` if the named index exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    pub fn vector_index_exists(&self, name: &str) -> Result<bool> {
        let conn = acquire_lock(&self.conn);
        index_exists(&conn, name)
    }

    /// Lists vector indexes, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    pub fn vector_indexes(&self) -> Result<Vec<VectorIndexInfo>> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn
            .prepare_cached(
                "SELECT name, table_name, column_name, dim FROM _catalog_indexes ORDER BY name",
            )
            .map_err(sql_error("list_vector_indexes_prepare"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(VectorIndexInfo {
                    name: row.get(0)?,
                    table: row.get(1)?,
                    column: row.get(2)?,
                    dim: row.get::<_, i64>(3)? as usize,
                })
            })
            .map_err(sql_error("list_vector_indexes"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_error("list_vector_indexes_row"))
    }

    /// Searches an index, returning `(node, distance)` in ascending distance.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the index does not exist
    /// - [`Error::DimensionMismatch`] if the query has the wrong length
    pub fn query_vector_index(
        &self,
        name: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(NodeId, f32)>> {
        self.cached_index(name)?.search(query, k)
    }

    /// Finds the nearest neighbors of a node by cosine distance.
    ///
    /// Every index over `column` is searched for `max_k + exclude.len()`
    /// candidates. Excluded nodes and hits farther than `max_distance` are
    /// dropped, the tables are merged, and the `max_k` closest are returned
    /// ordered by distance, then table, then node id. The query node itself
    /// is only dropped when it is in `exclude`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if no index covers `column`, or the node has no vector
    #[instrument(skip(self, exclude), fields(excluded = exclude.len()))]
    pub fn knn(
        &self,
        node_id: NodeId,
        column: &str,
        max_k: usize,
        max_distance: f32,
        exclude: &HashSet<NodeId>,
    ) -> Result<Vec<Neighbor>> {
        let indexes: Vec<VectorIndexInfo> = self
            .vector_indexes()?
            .into_iter()
            .filter(|info| info.column == column)
            .collect();
        if indexes.is_empty() {
            return Err(Error::NotFound(format!(
                "vector index on column '{column}'"
            )));
        }
        if max_k == 0 {
            return Ok(Vec::new());
        }

        let query = self.node_vector(node_id, column)?;
        let fetch = max_k + exclude.len();
        let mut neighbors = Vec::new();

        for info in &indexes {
            let index = self.cached_index(&info.name)?;
            for (id, distance) in index.search(&query, fetch)? {
                if exclude.contains(&id) || distance > max_distance {
                    continue;
                }
                neighbors.push(Neighbor {
                    table: info.table.clone(),
                    node_id: id,
                    distance,
                });
            }
        }

        neighbors.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.table.cmp(&b.table))
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        neighbors.truncate(max_k);
        metrics::counter!("graph_store_knn_queries_total").increment(1);
        Ok(neighbors)
    }

    /// Returns the in-memory index, building it from the stored column if needed.
    fn cached_index(&self, name: &str) -> Result<Arc<dyn VectorIndex>> {
        if let Some(cached) = self
            .indexes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(Arc::clone(&cached.index));
        }

        let (column, index) = {
            let conn = acquire_lock(&self.conn);
            let (table, column, dim): (String, String, i64) = conn
                .query_row(
                    "SELECT table_name, column_name, dim FROM _catalog_indexes WHERE name = ?1",
                    params![name],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(sql_error("read_vector_index"))?
                .ok_or_else(|| Error::NotFound(format!("vector index '{name}'")))?;
            let index: Arc<dyn VectorIndex> =
                Arc::new(build_index(&conn, &table, &column, dim as usize)?);
            (column, index)
        };

        metrics::counter!("graph_store_vector_index_builds_total").increment(1);
        self.indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.to_string(),
                CachedIndex {
                    column,
                    index: Arc::clone(&index),
                },
            );
        Ok(index)
    }

    /// Evicts in-memory indexes over `column`.
    pub(super) fn evict_column_indexes(&self, column: &str) {
        self.indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, cached| cached.column != column);
    }

    /// Evicts in-memory indexes over any column of `table`.
    pub(super) fn evict_table_indexes(&self, table: &str) {
        let prefix = format!("{table}_").to_lowercase();
        self.indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|name, _| !name.starts_with(&prefix));
    }
}

/// Returns the dimension of a node table's vector column.
fn vector_column_dim(conn: &Connection, table: &str, column: &str) -> Result<usize> {
    if table_kind(conn, table)?.as_deref() != Some("node") {
        return Err(Error::NotFound(format!("node table '{table}'")));
    }
    read_columns(conn, table)?
        .iter()
        .find(|c| c.name == column)
        .and_then(|c| c.column_type.vector_dim())
        .ok_or_else(|| Error::NotFound(format!("vector column '{table}.{column}'")))
}

fn index_exists(conn: &Connection, name: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM _catalog_indexes WHERE name = ?1",
        params![name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(sql_error("read_vector_index"))
}

/// Adds a zero-filled `FLOAT[dim]` column, or checks the existing one.
fn ensure_vector_column(conn: &Connection, table: &str, column: &str, dim: usize) -> Result<()> {
    let existing = read_columns(conn, table)?
        .into_iter()
        .find(|c| c.name == column)
        .map(|c| c.column_type);

    match existing {
        Some(ColumnType::FloatArray(existing)) if existing == dim => Ok(()),
        Some(ColumnType::FloatArray(existing)) => Err(Error::DimensionMismatch {
            expected: existing,
            actual: dim,
        }),
        Some(other) => Err(Error::SchemaConflict(format!(
            "column '{table}.{column}' already exists as {other}"
        ))),
        None => {
            conn.execute(
                &format!("ALTER TABLE {} ADD COLUMN \"{column}\" BLOB", node_sql(table)),
                [],
            )
            .map_err(sql_error("add_embedding_column"))?;
            conn.execute(
                &format!("UPDATE {} SET \"{column}\" = zeroblob(?1)", node_sql(table)),
                params![(dim * 4) as i64],
            )
            .map_err(sql_error("zero_fill_embedding_column"))?;
            insert_column(conn, table, &ColumnDef::new(column, ColumnType::FloatArray(dim)))
        },
    }
}

fn build_index(conn: &Connection, table: &str, column: &str, dim: usize) -> Result<UsearchIndex> {
    let mut index = UsearchIndex::new(dim)?;
    let sql = format!(
        "SELECT node_id, \"{column}\" FROM {} WHERE \"{column}\" IS NOT NULL ORDER BY node_id",
        node_sql(table)
    );
    let mut stmt = conn.prepare(&sql).map_err(query_error(&sql))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)))
        .map_err(query_error(&sql))?;

    for row in rows {
        let (id, bytes) = row.map_err(query_error(&sql))?;
        if let Some(vector) = decode_vector(&bytes).filter(|v| v.len() == dim) {
            index.insert(NodeId::new(id), &vector)?;
        }
    }
    Ok(index)
}
