//! `SQLite` property graph store.
//!
//! Provides schema declaration, catalog introspection, node paging, neighbor
//! queries and hydration. Bulk import, embeddings and traversal live in
//! sibling modules as further `impl GraphStore` blocks.

// Allow cast_possible_truncation and cast_sign_loss for SQLite i64 to usize conversions.
// SQLite returns i64, but counts and offsets are inherently non-negative.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
// Allow cast_possible_wrap - usize to i64 casts for SQLite parameters won't wrap for row counts.
#![allow(clippy::cast_possible_wrap)]
// Allow redundant_closure_for_method_calls - closures needed due to rusqlite's Error type.
#![allow(clippy::redundant_closure_for_method_calls)]

use crate::models::schema::{NODE_ID_COLUMN, validate_identifier};
use crate::models::{
    Cardinality, ColumnDef, ColumnType, Edge, EdgeRef, Node, NodeId, NodeTableDef, PropertyValue,
    RelTableDef, SchemaDefinition,
};
use crate::storage::traits::VectorIndex;
use crate::{Error, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::instrument;

/// Helper to acquire mutex lock with poison recovery.
pub(super) fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Graph store mutex was poisoned, recovering");
            metrics::counter!("graph_store_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Maps a rusqlite error into [`Error::OperationFailed`].
pub(super) fn sql_error(operation: &'static str) -> impl Fn(rusqlite::Error) -> Error {
    move |e| Error::OperationFailed {
        operation: operation.to_string(),
        cause: e.to_string(),
    }
}

/// Maps a rusqlite error into [`Error::Query`] carrying the statement text.
pub(super) fn query_error(sql: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| Error::Query {
        query: sql.to_string(),
        cause: e.to_string(),
    }
}

/// Physical table holding the rows of node table `name`.
pub(super) fn node_sql(name: &str) -> String {
    format!("\"n_{name}\"")
}

/// Physical table holding the rows of relationship table `name`.
pub(super) fn rel_sql(name: &str) -> String {
    format!("\"r_{name}\"")
}

/// How [`GraphStore::open`] treats an existing database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create a fresh database; fail with [`Error::AlreadyExists`] if one exists.
    CreateNew,
    /// Destroy any existing database at the path, then create a fresh one.
    Overwrite,
    /// Open an existing database; fail with [`Error::NotFound`] if missing.
    Existing,
}

/// Tuning knobs for the graph store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Rows written per transaction by embedding and score updates.
    pub write_batch_size: usize,
    /// Upper bound on shortest paths enumerated before sampling.
    pub max_path_candidates: usize,
    /// Maximum ids bound into a single `IN (...)` clause.
    pub query_chunk_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_batch_size: 10_000,
            max_path_candidates: 10_000,
            query_chunk_size: 500,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the write batch size.
    #[must_use]
    pub const fn with_write_batch_size(mut self, size: usize) -> Self {
        self.write_batch_size = size;
        self
    }

    /// Sets the shortest-path candidate cap.
    #[must_use]
    pub const fn with_max_path_candidates(mut self, max: usize) -> Self {
        self.max_path_candidates = max;
        self
    }

    /// Sets the `IN` clause chunk size.
    #[must_use]
    pub const fn with_query_chunk_size(mut self, size: usize) -> Self {
        self.query_chunk_size = size;
        self
    }

    /// Loads configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Overrides fields set in `LAKEGRAPH_*` environment variables.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        let mut config = self;

        if let Ok(val) = std::env::var("LAKEGRAPH_WRITE_BATCH_SIZE")
            && let Ok(size) = val.parse()
        {
            config.write_batch_size = size;
        }
        if let Ok(val) = std::env::var("LAKEGRAPH_MAX_PATH_CANDIDATES")
            && let Ok(max) = val.parse()
        {
            config.max_path_candidates = max;
        }

        config
    }
}

/// An in-memory vector index together with what it covers.
pub(super) struct CachedIndex {
    pub(super) column: String,
    pub(super) index: Arc<dyn VectorIndex>,
}

/// Embedded property graph store.
///
/// # Concurrency Model
///
/// Uses a `Mutex<Connection>` for thread-safe access, so a single store can be
/// shared behind an `Arc` by the retrieval pipeline's parallel stages. All
/// mutating operations run inside explicit transactions and roll back on
/// failure. Vector indexes are held in memory behind an `RwLock` and searched
/// without holding the connection lock.
pub struct GraphStore {
    pub(super) conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    pub(super) config: StoreConfig,
    node_count: Mutex<Option<usize>>,
    pub(super) indexes: RwLock<HashMap<String, CachedIndex>>,
}

impl GraphStore {
    /// Opens a graph database at `path`.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyExists`] for [`OpenMode::CreateNew`] when a database exists
    /// - [`Error::NotFound`] for [`OpenMode::Existing`] when it does not
    /// - [`Error::OperationFailed`] if the database cannot be opened or initialized
    pub fn open(path: impl Into<PathBuf>, mode: OpenMode) -> Result<Self> {
        Self::open_with_config(path, mode, StoreConfig::default())
    }

    /// Opens a graph database with explicit tuning.
    ///
    /// # Errors
    ///
    /// See [`GraphStore::open`].
    #[instrument(skip(path, config), fields(mode = ?mode))]
    pub fn open_with_config(
        path: impl Into<PathBuf>,
        mode: OpenMode,
        config: StoreConfig,
    ) -> Result<Self> {
        let db_path = path.into();
        let exists = db_path.exists();

        match mode {
            OpenMode::CreateNew if exists => {
                return Err(Error::AlreadyExists(db_path.display().to_string()));
            },
            OpenMode::Existing if !exists => {
                return Err(Error::NotFound(db_path.display().to_string()));
            },
            OpenMode::Overwrite if exists => {
                tracing::warn!(path = %db_path.display(), "Overwriting existing graph database");
                remove_database(&db_path)?;
            },
            _ => {},
        }

        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| Error::OperationFailed {
                operation: "create_graph_dir".to_string(),
                cause: e.to_string(),
            })?;
        }

        let conn = Connection::open(&db_path).map_err(sql_error("open_graph_store"))?;
        let store = Self::from_connection(conn, Some(db_path), config);
        store.initialize()?;
        Ok(store)
    }

    /// Creates an in-memory store (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with_config(StoreConfig::default())
    }

    /// Creates an in-memory store with explicit tuning.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory_with_config(config: StoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_error("open_graph_store_memory"))?;
        let store = Self::from_connection(conn, None, config);
        store.initialize()?;
        Ok(store)
    }

    fn from_connection(conn: Connection, db_path: Option<PathBuf>, config: StoreConfig) -> Self {
        Self {
            conn: Mutex::new(conn),
            db_path,
            config,
            node_count: Mutex::new(None),
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Returns the store configuration.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Initializes pragmas and catalog tables.
    fn initialize(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn);

        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        let _ = conn.pragma_update(None, "busy_timeout", "5000");

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _catalog_tables (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL CHECK (kind IN ('node', 'rel')),
                source_table TEXT,
                target_table TEXT,
                cardinality TEXT,
                ordinal INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS _catalog_columns (
                table_name TEXT NOT NULL,
                column_name TEXT NOT NULL,
                column_type TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                PRIMARY KEY (table_name, column_name)
            );
            CREATE TABLE IF NOT EXISTS _catalog_indexes (
                name TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                column_name TEXT NOT NULL,
                dim INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS _node_registry (
                node_id INTEGER PRIMARY KEY,
                table_name TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_node_registry_table ON _node_registry(table_name);",
        )
        .map_err(sql_error("create_catalog_tables"))?;

        Ok(())
    }

    // ========================================================================
    // Schema
    // ========================================================================

    /// Declares node and relationship tables.
    ///
    /// Runs in a single transaction: either every table is created or none is.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if the definition fails validation
    /// - [`Error::SchemaConflict`] if any declared table already exists
    #[instrument(skip(self, definition), fields(
        node_tables = definition.node_tables.len(),
        rel_tables = definition.rel_tables.len()
    ))]
    pub fn create_schema(&self, definition: &SchemaDefinition) -> Result<()> {
        definition.validate()?;

        let mut conn = acquire_lock(&self.conn);
        let tx = conn
            .transaction()
            .map_err(sql_error("begin_create_schema"))?;

        let declared = definition
            .node_tables
            .iter()
            .map(|t| t.name.as_str())
            .chain(definition.rel_tables.iter().map(|t| t.name.as_str()));
        for name in declared {
            if table_kind(&tx, name)?.is_some() {
                return Err(Error::SchemaConflict(format!(
                    "table '{name}' already exists"
                )));
            }
        }

        let mut ordinal: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(ordinal) + 1, 0) FROM _catalog_tables",
                [],
                |row| row.get(0),
            )
            .map_err(sql_error("read_catalog_ordinal"))?;

        for table in &definition.node_tables {
            create_node_table(&tx, table, ordinal)?;
            ordinal += 1;
        }
        for rel in &definition.rel_tables {
            create_rel_table(&tx, rel, ordinal)?;
            ordinal += 1;
        }

        tx.commit().map_err(sql_error("commit_create_schema"))?;

        tracing::info!(
            node_tables = definition.node_tables.len(),
            rel_tables = definition.rel_tables.len(),
            "Created graph schema"
        );
        metrics::counter!("graph_store_schema_tables_total")
            .increment((definition.node_tables.len() + definition.rel_tables.len()) as u64);
        Ok(())
    }

    /// Reads the declared schema back from the catalog.
    ///
    /// Embedding columns added by [`GraphStore::update_embeddings`] appear as
    /// `FLOAT[dim]` columns.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    pub fn schema(&self) -> Result<SchemaDefinition> {
        let conn = acquire_lock(&self.conn);
        let mut schema = SchemaDefinition::new();
        for name in read_node_tables(&conn)? {
            let columns = read_columns(&conn, &name)?;
            schema.node_tables.push(NodeTableDef {
                name,
                columns,
                primary_key: NODE_ID_COLUMN.to_string(),
            });
        }
        schema.rel_tables = read_rel_tables(&conn)?;
        Ok(schema)
    }

    /// Lists node tables in declaration order.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    pub fn node_tables(&self) -> Result<Vec<String>> {
        let conn = acquire_lock(&self.conn);
        read_node_tables(&conn)
    }

    /// Lists relationship tables in declaration order.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    pub fn rel_tables(&self) -> Result<Vec<RelTableDef>> {
        let conn = acquire_lock(&self.conn);
        read_rel_tables(&conn)
    }

    /// Lists the columns of a node table, or the properties of a relationship table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the table is not declared.
    pub fn table_columns(&self, table: &str) -> Result<Vec<ColumnDef>> {
        let conn = acquire_lock(&self.conn);
        if table_kind(&conn, table)?.is_none() {
            return Err(Error::NotFound(format!("table '{table}'")));
        }
        read_columns(&conn, table)
    }

    /// Returns `true` if `table` declares `column`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the table is not declared.
    pub fn table_has_column(&self, table: &str, column: &str) -> Result<bool> {
        Ok(self
            .table_columns(table)?
            .iter()
            .any(|c| c.name == column))
    }

    /// Describes node tables as `Table(col TYPE, ...)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    pub fn nodes_schema(&self) -> Result<Vec<String>> {
        let schema = self.schema()?;
        Ok(schema
            .node_tables
            .iter()
            .map(|table| {
                let columns = table
                    .columns
                    .iter()
                    .map(|c| format!("{} {}", c.name, c.column_type))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{}({columns})", table.name)
            })
            .collect())
    }

    /// Describes relationship tables as `(Src)-[:Rel]->(Dst)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    pub fn rels_schema(&self) -> Result<Vec<String>> {
        Ok(self
            .rel_tables()?
            .iter()
            .map(|rel| format!("({})-[:{}]->({})", rel.from, rel.name, rel.to))
            .collect())
    }

    // ========================================================================
    // Node paging and neighbors
    // ========================================================================

    /// Counts nodes across all node tables.
    ///
    /// The count is cached after the first call. Imports through this store
    /// invalidate it; other writers must call [`GraphStore::invalidate_counts`].
    ///
    /// # Errors
    ///
    /// Returns an error if the count query fails.
    #[instrument(skip(self))]
    pub fn count_nodes(&self) -> Result<usize> {
        let mut cached = acquire_lock(&self.node_count);
        if let Some(count) = *cached {
            return Ok(count);
        }

        let conn = acquire_lock(&self.conn);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM _node_registry", [], |row| row.get(0))
            .map_err(sql_error("count_nodes"))?;
        let count = count as usize;
        *cached = Some(count);
        Ok(count)
    }

    /// Drops the cached node count.
    pub fn invalidate_counts(&self) {
        *acquire_lock(&self.node_count) = None;
    }

    /// Returns up to `limit` node ids in ascending order, starting at `offset`.
    ///
    /// Returns an empty list once `offset` reaches the node count.
    ///
    /// # Errors
    ///
    /// Returns an error if the page query fails.
    #[instrument(skip(self))]
    pub fn query_node_batch(&self, offset: usize, limit: usize) -> Result<Vec<NodeId>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = acquire_lock(&self.conn);
        let mut stmt = conn
            .prepare_cached("SELECT node_id FROM _node_registry ORDER BY node_id LIMIT ?1 OFFSET ?2")
            .map_err(sql_error("query_node_batch_prepare"))?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], |row| {
                row.get::<_, i64>(0).map(NodeId::new)
            })
            .map_err(sql_error("query_node_batch"))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_error("query_node_batch_row"))
    }

    /// Returns the directed out-edges of `node_ids` across all relationship
    /// tables, as `(source, target)` ordered by source then target.
    ///
    /// Self-loops and parallel edges are preserved.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`] if a neighbor query fails.
    #[instrument(skip(self, node_ids), fields(nodes = node_ids.len()))]
    pub fn query_neighbors(&self, node_ids: &[NodeId]) -> Result<Vec<(NodeId, NodeId)>> {
        let mut ids: Vec<i64> = node_ids.iter().map(|id| id.get()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = acquire_lock(&self.conn);
        let rels = read_rel_tables(&conn)?;
        let mut edges = Vec::new();

        for rel in &rels {
            for chunk in ids.chunks(self.config.query_chunk_size.max(1)) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let sql = format!(
                    "SELECT source_id, target_id FROM {} WHERE source_id IN ({placeholders})",
                    rel_sql(&rel.name)
                );
                let mut stmt = conn.prepare(&sql).map_err(query_error(&sql))?;
                let rows = stmt
                    .query_map(params_from_iter(chunk.iter()), |row| {
                        Ok((NodeId::new(row.get(0)?), NodeId::new(row.get(1)?)))
                    })
                    .map_err(query_error(&sql))?;
                for row in rows {
                    edges.push(row.map_err(query_error(&sql))?);
                }
            }
        }

        edges.sort_unstable();
        metrics::counter!("graph_store_neighbor_edges_total").increment(edges.len() as u64);
        Ok(edges)
    }

    // ========================================================================
    // Hydration
    // ========================================================================

    /// Returns the node table a node belongs to.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lookup fails.
    pub fn node_table_of(&self, id: NodeId) -> Result<Option<String>> {
        let conn = acquire_lock(&self.conn);
        registry_table(&conn, id)
    }

    /// Loads a node with all its properties.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the node does not exist.
    pub fn get_node(&self, id: NodeId) -> Result<Node> {
        let conn = acquire_lock(&self.conn);
        let table = registry_table(&conn, id)?
            .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
        let columns = read_columns(&conn, &table)?;

        let select = columns
            .iter()
            .map(|c| format!("\"{}\"", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {select} FROM {} WHERE node_id = ?1",
            node_sql(&table)
        );

        let properties = conn
            .query_row(&sql, params![id.get()], |row| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| Ok((c.name.clone(), read_value(row.get_ref(i)?, c.column_type))))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .optional()
            .map_err(query_error(&sql))?
            .ok_or_else(|| Error::NotFound(format!("node {id}")))?;

        Ok(Node {
            id,
            table,
            properties,
        })
    }

    /// Loads an edge with its properties.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the relationship table or row does not exist.
    pub fn get_edge(&self, edge: &EdgeRef) -> Result<Edge> {
        let conn = acquire_lock(&self.conn);
        if table_kind(&conn, &edge.table)?.as_deref() != Some("rel") {
            return Err(Error::NotFound(format!(
                "relationship table '{}'",
                edge.table
            )));
        }
        let properties = read_columns(&conn, &edge.table)?;

        let mut select = vec!["source_id".to_string(), "target_id".to_string()];
        select.extend(properties.iter().map(|c| format!("\"{}\"", c.name)));
        let sql = format!(
            "SELECT {} FROM {} WHERE rowid = ?1",
            select.join(", "),
            rel_sql(&edge.table)
        );

        conn.query_row(&sql, params![edge.row_id], |row| {
            let source = NodeId::new(row.get(0)?);
            let target = NodeId::new(row.get(1)?);
            let props = properties
                .iter()
                .enumerate()
                .map(|(i, c)| Ok((c.name.clone(), read_value(row.get_ref(i + 2)?, c.column_type))))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(Edge {
                label: edge.table.clone(),
                source,
                target,
                properties: props,
            })
        })
        .optional()
        .map_err(query_error(&sql))?
        .ok_or_else(|| Error::NotFound(format!("edge {}#{}", edge.table, edge.row_id)))
    }

    /// Finds nodes whose text properties equal `value`, ignoring case.
    ///
    /// Returns at most `limit` ids in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`] if a lookup fails.
    pub fn find_nodes_by_text(&self, value: &str, limit: usize) -> Result<Vec<NodeId>> {
        let conn = acquire_lock(&self.conn);
        let mut found = Vec::new();

        for table in read_node_tables(&conn)? {
            for column in read_columns(&conn, &table)?
                .iter()
                .filter(|c| c.column_type == ColumnType::String)
            {
                let sql = format!(
                    "SELECT node_id FROM {} WHERE lower(\"{}\") = lower(?1) ORDER BY node_id LIMIT ?2",
                    node_sql(&table),
                    column.name
                );
                let mut stmt = conn.prepare_cached(&sql).map_err(query_error(&sql))?;
                let rows = stmt
                    .query_map(params![value, limit as i64], |row| {
                        row.get::<_, i64>(0).map(NodeId::new)
                    })
                    .map_err(query_error(&sql))?;
                for row in rows {
                    found.push(row.map_err(query_error(&sql))?);
                }
            }
        }

        found.sort_unstable();
        found.dedup();
        found.truncate(limit);
        Ok(found)
    }

    // ========================================================================
    // Scalar scores
    // ========================================================================

    /// Sums, per source node, the pairwise minimum of `weight` over targets
    /// shared with every other source of relationship table `rel`.
    ///
    /// For sources `a != b` sharing a target `c`, each pair contributes
    /// `min(w(a→c), w(b→c))` to `a`'s total. Sources without a shared target
    /// are omitted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the table or weight property does not exist.
    #[instrument(skip(self))]
    pub fn shared_target_weights(&self, rel: &str, weight: &str) -> Result<Vec<(NodeId, f64)>> {
        let conn = acquire_lock(&self.conn);
        if table_kind(&conn, rel)?.as_deref() != Some("rel") {
            return Err(Error::NotFound(format!("relationship table '{rel}'")));
        }
        if !read_columns(&conn, rel)?.iter().any(|c| c.name == weight) {
            return Err(Error::NotFound(format!("property '{weight}' on '{rel}'")));
        }

        let table = rel_sql(rel);
        let sql = format!(
            "SELECT a, SUM(con_pair) FROM (
                SELECT ac.source_id AS a, bc.source_id AS b,
                       SUM(MIN(ac.\"{weight}\", bc.\"{weight}\")) AS con_pair
                FROM {table} ac
                JOIN {table} bc ON ac.target_id = bc.target_id
                WHERE ac.source_id <> bc.source_id
                GROUP BY ac.source_id, bc.source_id
            )
            GROUP BY a
            ORDER BY a"
        );

        let mut stmt = conn.prepare(&sql).map_err(query_error(&sql))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    NodeId::new(row.get(0)?),
                    row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                ))
            })
            .map_err(query_error(&sql))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(query_error(&sql))
    }

    /// Writes a `DOUBLE` column on a node table, adding it (default `0.0`) if missing.
    ///
    /// Writes are chunked by the configured write batch size, one transaction
    /// per chunk. Returns the number of rows updated.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the node table does not exist
    /// - [`Error::SchemaConflict`] if the column exists with another type
    #[instrument(skip(self, values), fields(values = values.len()))]
    pub fn set_scalar_column(
        &self,
        table: &str,
        column: &str,
        values: &[(NodeId, f64)],
    ) -> Result<usize> {
        validate_identifier(column)?;
        let mut conn = acquire_lock(&self.conn);

        if table_kind(&conn, table)?.as_deref() != Some("node") {
            return Err(Error::NotFound(format!("node table '{table}'")));
        }
        match read_columns(&conn, table)?
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.column_type)
        {
            Some(ColumnType::Double) => {},
            Some(other) => {
                return Err(Error::SchemaConflict(format!(
                    "column '{table}.{column}' already exists as {other}"
                )));
            },
            None => {
                let tx = conn
                    .transaction()
                    .map_err(sql_error("begin_add_scalar_column"))?;
                tx.execute(
                    &format!(
                        "ALTER TABLE {} ADD COLUMN \"{column}\" REAL DEFAULT 0.0",
                        node_sql(table)
                    ),
                    [],
                )
                .map_err(sql_error("add_scalar_column"))?;
                insert_column(&tx, table, &ColumnDef::new(column, ColumnType::Double))?;
                tx.commit().map_err(sql_error("commit_add_scalar_column"))?;
            },
        }

        let sql = format!(
            "UPDATE {} SET \"{column}\" = ?1 WHERE node_id = ?2",
            node_sql(table)
        );
        let mut updated = 0;
        for chunk in values.chunks(self.config.write_batch_size.max(1)) {
            let tx = conn
                .transaction()
                .map_err(sql_error("begin_set_scalar_column"))?;
            {
                let mut stmt = tx.prepare_cached(&sql).map_err(query_error(&sql))?;
                for (id, value) in chunk {
                    updated += stmt
                        .execute(params![value, id.get()])
                        .map_err(query_error(&sql))?;
                }
            }
            tx.commit().map_err(sql_error("commit_set_scalar_column"))?;
        }

        Ok(updated)
    }
}

// ============================================================================
// Catalog helpers
// ============================================================================

/// Removes a database file (and its WAL side files) or directory.
fn remove_database(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| Error::OperationFailed {
        operation: "remove_graph_database".to_string(),
        cause: e.to_string(),
    })?;

    for suffix in ["-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        let side = PathBuf::from(side);
        if side.exists() {
            let _ = fs::remove_file(side);
        }
    }
    Ok(())
}

fn create_node_table(conn: &Connection, table: &NodeTableDef, ordinal: i64) -> Result<()> {
    let columns = table
        .columns
        .iter()
        .map(|c| {
            if c.name == NODE_ID_COLUMN {
                format!("\"{NODE_ID_COLUMN}\" INTEGER PRIMARY KEY")
            } else {
                format!("\"{}\" {}", c.name, c.column_type.sql_type())
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    conn.execute(
        &format!("CREATE TABLE {} ({columns})", node_sql(&table.name)),
        [],
    )
    .map_err(sql_error("create_node_table"))?;

    conn.execute(
        "INSERT INTO _catalog_tables (name, kind, source_table, target_table, cardinality, ordinal)
         VALUES (?1, 'node', NULL, NULL, NULL, ?2)",
        params![table.name, ordinal],
    )
    .map_err(sql_error("catalog_node_table"))?;

    for column in &table.columns {
        insert_column(conn, &table.name, column)?;
    }
    Ok(())
}

fn create_rel_table(conn: &Connection, rel: &RelTableDef, ordinal: i64) -> Result<()> {
    let mut columns = vec![
        "source_id INTEGER NOT NULL".to_string(),
        "target_id INTEGER NOT NULL".to_string(),
    ];
    columns.extend(
        rel.properties
            .iter()
            .map(|c| format!("\"{}\" {}", c.name, c.column_type.sql_type())),
    );

    let table = rel_sql(&rel.name);
    let name = &rel.name;
    let mut statements = vec![
        format!("CREATE TABLE {table} ({})", columns.join(", ")),
        format!("CREATE INDEX \"r_{name}_source\" ON {table}(source_id, target_id)"),
        format!("CREATE INDEX \"r_{name}_target\" ON {table}(target_id, source_id)"),
    ];
    if rel.cardinality.unique_source() {
        statements.push(format!(
            "CREATE UNIQUE INDEX \"r_{name}_source_unique\" ON {table}(source_id)"
        ));
    }
    if rel.cardinality.unique_target() {
        statements.push(format!(
            "CREATE UNIQUE INDEX \"r_{name}_target_unique\" ON {table}(target_id)"
        ));
    }
    for statement in &statements {
        conn.execute(statement, [])
            .map_err(sql_error("create_rel_table"))?;
    }

    conn.execute(
        "INSERT INTO _catalog_tables (name, kind, source_table, target_table, cardinality, ordinal)
         VALUES (?1, 'rel', ?2, ?3, ?4, ?5)",
        params![
            rel.name,
            rel.from,
            rel.to,
            rel.cardinality.to_string(),
            ordinal
        ],
    )
    .map_err(sql_error("catalog_rel_table"))?;

    for column in &rel.properties {
        insert_column(conn, &rel.name, column)?;
    }
    Ok(())
}

/// Appends a column to a table's catalog entry.
pub(super) fn insert_column(conn: &Connection, table: &str, column: &ColumnDef) -> Result<()> {
    conn.execute(
        "INSERT INTO _catalog_columns (table_name, column_name, column_type, ordinal)
         VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(ordinal) + 1, 0) FROM _catalog_columns WHERE table_name = ?1))",
        params![table, column.name, column.column_type.to_string()],
    )
    .map_err(sql_error("catalog_column"))?;
    Ok(())
}

/// Returns `"node"`, `"rel"`, or `None` for an undeclared table.
pub(super) fn table_kind(conn: &Connection, name: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT kind FROM _catalog_tables WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )
    .optional()
    .map_err(sql_error("read_table_kind"))
}

pub(super) fn read_node_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare_cached("SELECT name FROM _catalog_tables WHERE kind = 'node' ORDER BY ordinal")
        .map_err(sql_error("read_node_tables_prepare"))?;
    let rows = stmt
        .query_map([], |row| row.get(0))
        .map_err(sql_error("read_node_tables"))?;
    rows.collect::<rusqlite::Result<Vec<String>>>()
        .map_err(sql_error("read_node_tables_row"))
}

pub(super) fn read_rel_tables(conn: &Connection) -> Result<Vec<RelTableDef>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT name, source_table, target_table, cardinality FROM _catalog_tables
             WHERE kind = 'rel' ORDER BY ordinal",
        )
        .map_err(sql_error("read_rel_tables_prepare"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .map_err(sql_error("read_rel_tables"))?;

    let mut rels = Vec::new();
    for row in rows {
        let (name, from, to, cardinality) = row.map_err(sql_error("read_rel_tables_row"))?;
        let properties = read_columns(conn, &name)?;
        rels.push(RelTableDef {
            name,
            from,
            to,
            cardinality: cardinality.parse().unwrap_or(Cardinality::ManyMany),
            properties,
        });
    }
    Ok(rels)
}

pub(super) fn read_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnDef>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT column_name, column_type FROM _catalog_columns
             WHERE table_name = ?1 ORDER BY ordinal",
        )
        .map_err(sql_error("read_columns_prepare"))?;
    let rows = stmt
        .query_map(params![table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(sql_error("read_columns"))?;

    let mut columns = Vec::new();
    for row in rows {
        let (name, column_type) = row.map_err(sql_error("read_columns_row"))?;
        columns.push(ColumnDef::new(name, column_type.parse()?));
    }
    Ok(columns)
}

pub(super) fn registry_table(conn: &Connection, id: NodeId) -> Result<Option<String>> {
    conn.prepare_cached("SELECT table_name FROM _node_registry WHERE node_id = ?1")
        .and_then(|mut stmt| stmt.query_row(params![id.get()], |row| row.get(0)).optional())
        .map_err(sql_error("read_node_registry"))
}

/// Converts a stored value according to its declared column type.
pub(super) fn read_value(value: ValueRef<'_>, column_type: ColumnType) -> PropertyValue {
    match (value, column_type) {
        (ValueRef::Null, _) => PropertyValue::Null,
        (ValueRef::Integer(v), ColumnType::Bool) => PropertyValue::Bool(v != 0),
        (ValueRef::Integer(v), ColumnType::Double | ColumnType::Float) => {
            PropertyValue::Float(v as f64)
        },
        (ValueRef::Integer(v), _) => PropertyValue::Int(v),
        (ValueRef::Real(v), _) => PropertyValue::Float(v),
        (ValueRef::Text(bytes), _) => {
            PropertyValue::Text(String::from_utf8_lossy(bytes).into_owned())
        },
        (ValueRef::Blob(bytes), _) => {
            super::embeddings::decode_vector(bytes).map_or(PropertyValue::Null, PropertyValue::Vector)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn music_schema() -> SchemaDefinition {
        SchemaDefinition::new()
            .with_node_table(
                NodeTableDef::new("User")
                    .with_column("user_id", ColumnType::String)
                    .with_column("country", ColumnType::String),
            )
            .with_node_table(NodeTableDef::new("Genre").with_column("genre", ColumnType::String))
            .with_rel_table(RelTableDef::new("Likes", "User", "Genre"))
            .with_rel_table(
                RelTableDef::new("Friend", "User", "User").with_property("since", ColumnType::Int16),
            )
    }

    fn insert_node(store: &GraphStore, table: &str, id: i64, text: &str) {
        let conn = acquire_lock(&store.conn);
        let column = if table == "User" { "user_id" } else { "genre" };
        conn.execute(
            &format!(
                "INSERT INTO {} (node_id, \"{column}\") VALUES (?1, ?2)",
                node_sql(table)
            ),
            params![id, text],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO _node_registry (node_id, table_name) VALUES (?1, ?2)",
            params![id, table],
        )
        .unwrap();
        drop(conn);
        store.invalidate_counts();
    }

    fn insert_edge(store: &GraphStore, rel: &str, source: i64, target: i64) {
        let conn = acquire_lock(&store.conn);
        conn.execute(
            &format!(
                "INSERT INTO {} (source_id, target_id) VALUES (?1, ?2)",
                rel_sql(rel)
            ),
            params![source, target],
        )
        .unwrap();
    }

    #[test]
    fn test_open_modes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.db");

        assert!(matches!(
            GraphStore::open(&path, OpenMode::Existing),
            Err(Error::NotFound(_))
        ));

        let store = GraphStore::open(&path, OpenMode::CreateNew).unwrap();
        store.create_schema(&music_schema()).unwrap();
        drop(store);

        assert!(matches!(
            GraphStore::open(&path, OpenMode::CreateNew),
            Err(Error::AlreadyExists(_))
        ));

        let reopened = GraphStore::open(&path, OpenMode::Existing).unwrap();
        assert_eq!(reopened.node_tables().unwrap(), vec!["User", "Genre"]);
        drop(reopened);

        let overwritten = GraphStore::open(&path, OpenMode::Overwrite).unwrap();
        assert!(overwritten.node_tables().unwrap().is_empty());
    }

    #[test]
    fn test_create_schema_conflict() {
        let store = GraphStore::in_memory().unwrap();
        store.create_schema(&music_schema()).unwrap();

        let again = store.create_schema(&music_schema());
        assert!(matches!(again, Err(Error::SchemaConflict(_))));

        // Nothing from the failed call leaked into the catalog
        assert_eq!(store.rel_tables().unwrap().len(), 2);
    }

    #[test]
    fn test_schema_strings() {
        let store = GraphStore::in_memory().unwrap();
        store.create_schema(&music_schema()).unwrap();

        assert_eq!(
            store.nodes_schema().unwrap(),
            vec![
                "User(node_id INT64, user_id STRING, country STRING)",
                "Genre(node_id INT64, genre STRING)",
            ]
        );
        assert_eq!(
            store.rels_schema().unwrap(),
            vec!["(User)-[:Likes]->(Genre)", "(User)-[:Friend]->(User)"]
        );
    }

    #[test]
    fn test_count_and_paging() {
        let store = GraphStore::in_memory().unwrap();
        store.create_schema(&music_schema()).unwrap();
        insert_node(&store, "User", 3, "c");
        insert_node(&store, "User", 1, "a");
        insert_node(&store, "Genre", 2, "rock");

        assert_eq!(store.count_nodes().unwrap(), 3);
        assert_eq!(
            store.query_node_batch(0, 2).unwrap(),
            vec![NodeId::new(1), NodeId::new(2)]
        );
        assert_eq!(store.query_node_batch(2, 2).unwrap(), vec![NodeId::new(3)]);
        assert!(store.query_node_batch(3, 2).unwrap().is_empty());
        assert!(store.query_node_batch(10, 2).unwrap().is_empty());
    }

    #[test]
    fn test_count_is_cached_until_invalidated() {
        let store = GraphStore::in_memory().unwrap();
        store.create_schema(&music_schema()).unwrap();
        insert_node(&store, "User", 1, "a");
        assert_eq!(store.count_nodes().unwrap(), 1);

        {
            let conn = acquire_lock(&store.conn);
            conn.execute(
                "INSERT INTO _node_registry (node_id, table_name) VALUES (9, 'User')",
                [],
            )
            .unwrap();
        }
        assert_eq!(store.count_nodes().unwrap(), 1);
        store.invalidate_counts();
        assert_eq!(store.count_nodes().unwrap(), 2);
    }

    #[test]
    fn test_query_neighbors_preserves_loops_and_multi_edges() {
        let store = GraphStore::in_memory().unwrap();
        store.create_schema(&music_schema()).unwrap();
        insert_node(&store, "User", 1, "a");
        insert_node(&store, "User", 2, "b");
        insert_node(&store, "Genre", 10, "rock");
        insert_edge(&store, "Friend", 2, 1);
        insert_edge(&store, "Friend", 1, 1);
        insert_edge(&store, "Likes", 1, 10);
        insert_edge(&store, "Friend", 1, 2);
        insert_edge(&store, "Friend", 1, 2);

        let edges = store
            .query_neighbors(&[NodeId::new(1), NodeId::new(1)])
            .unwrap();
        let pairs: Vec<(i64, i64)> = edges.iter().map(|(s, t)| (s.get(), t.get())).collect();
        assert_eq!(pairs, vec![(1, 1), (1, 2), (1, 2), (1, 10)]);
    }

    #[test]
    fn test_get_node_and_edge() {
        let store = GraphStore::in_memory().unwrap();
        store.create_schema(&music_schema()).unwrap();
        insert_node(&store, "User", 1, "alice");
        insert_node(&store, "Genre", 10, "jazz");
        insert_edge(&store, "Likes", 1, 10);

        let node = store.get_node(NodeId::new(1)).unwrap();
        assert_eq!(node.table, "User");
        assert_eq!(
            node.property("user_id"),
            Some(&PropertyValue::Text("alice".to_string()))
        );
        assert_eq!(node.describe(), "(:User {node_id: 1, user_id: \"alice\"})");

        let edge = store
            .get_edge(&EdgeRef {
                table: "Likes".to_string(),
                row_id: 1,
                forward: true,
            })
            .unwrap();
        assert_eq!(edge.describe(), "(1)-[:Likes]->(10)");

        assert!(matches!(
            store.get_node(NodeId::new(99)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_find_nodes_by_text() {
        let store = GraphStore::in_memory().unwrap();
        store.create_schema(&music_schema()).unwrap();
        insert_node(&store, "User", 1, "alice");
        insert_node(&store, "Genre", 10, "Jazz");

        assert_eq!(
            store.find_nodes_by_text("jazz", 5).unwrap(),
            vec![NodeId::new(10)]
        );
        assert!(store.find_nodes_by_text("metal", 5).unwrap().is_empty());
    }

    #[test]
    fn test_shared_target_weights_and_scalar_column() {
        let schema = SchemaDefinition::new()
            .with_node_table(NodeTableDef::new("User").with_column("user_id", ColumnType::String))
            .with_rel_table(
                RelTableDef::new("Similar", "User", "User").with_property("esi", ColumnType::Double),
            );
        let store = GraphStore::in_memory().unwrap();
        store.create_schema(&schema).unwrap();
        for id in 1..=3 {
            insert_node(&store, "User", id, "u");
        }
        {
            let conn = acquire_lock(&store.conn);
            for (s, t, w) in [(1, 3, 0.5), (2, 3, 0.2), (1, 2, 0.9)] {
                conn.execute(
                    "INSERT INTO \"r_Similar\" (source_id, target_id, esi) VALUES (?1, ?2, ?3)",
                    params![s, t, w],
                )
                .unwrap();
            }
        }

        let scores = store.shared_target_weights("Similar", "esi").unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].0, NodeId::new(1));
        assert!((scores[0].1 - 0.2).abs() < 1e-9);
        assert_eq!(scores[1].0, NodeId::new(2));
        assert!((scores[1].1 - 0.2).abs() < 1e-9);

        let updated = store.set_scalar_column("User", "con_score", &scores).unwrap();
        assert_eq!(updated, 2);
        let node = store.get_node(NodeId::new(3)).unwrap();
        assert_eq!(node.property("con_score"), Some(&PropertyValue::Float(0.0)));
        assert!(store.table_has_column("User", "con_score").unwrap());
    }
}
