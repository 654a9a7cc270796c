//! Graph loading from Parquet exports.
//!
//! An export directory holds one Parquet file per source dataset and table,
//! split into `nodes/` and `edges/`:
//!
//! ```text
//! export/
//! ├── nodes/
//! │   ├── dsn_nodes_users.parquet
//! │   └── msdsl_nodes_tracks.parquet
//! └── edges/
//!     └── dsn_edges_friendships.parquet
//! ```
//!
//! A [`GraphDefinition`] pairs a [`SchemaDefinition`] with the [`ImportPlan`]
//! mapping those files onto tables. [`GraphLoader`] declares the schema and
//! imports the plan under an explicit [`ImportPolicy`].

use crate::models::{ColumnType, NodeTableDef, RelTableDef, SchemaDefinition};
use crate::storage::{GraphStore, ImportEntry};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

/// Name of the built-in music graph.
pub const MUSIC_TASTE: &str = "music_taste";

// ============================================================================
// Import Policy
// ============================================================================

/// What happens when one table of a plan fails to import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportPolicy {
    /// Log the failure and continue with the next entry. Entries imported
    /// before the failure stay in place.
    #[default]
    BestEffort,
    /// Import every entry in one transaction and stop at the first failure.
    AllOrNothing,
}

impl ImportPolicy {
    /// Returns the policy name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BestEffort => "best-effort",
            Self::AllOrNothing => "all-or-nothing",
        }
    }
}

impl fmt::Display for ImportPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ImportPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "best-effort" => Ok(Self::BestEffort),
            "all-or-nothing" | "atomic" => Ok(Self::AllOrNothing),
            other => Err(Error::InvalidInput(format!("unknown import policy: '{other}'"))),
        }
    }
}

// ============================================================================
// Import Plan
// ============================================================================

/// One file of an import plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    /// Target table.
    pub table: String,
    /// File path relative to the export directory.
    pub file: PathBuf,
    /// Explicit file columns in declared order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
}

impl PlanEntry {
    /// Creates an entry that matches columns by name.
    #[must_use]
    pub fn new(table: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            table: table.into(),
            file: file.into(),
            columns: None,
        }
    }

    /// Sets an explicit column map.
    #[must_use]
    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(ToString::to_string).collect());
        self
    }

    fn resolve(&self, export_dir: &Path) -> ImportEntry {
        let entry = ImportEntry::new(&self.table, export_dir.join(&self.file));
        match &self.columns {
            Some(columns) => entry.with_columns(columns.clone()),
            None => entry,
        }
    }
}

/// Ordered list of files to import.
///
/// Node files must come before the relationship files that reference them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportPlan {
    /// Entries in import order.
    pub entries: Vec<PlanEntry>,
}

impl ImportPlan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    #[must_use]
    pub fn with_entry(mut self, entry: PlanEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Resolves entries against an export directory.
    #[must_use]
    pub fn resolve(&self, export_dir: &Path) -> Vec<ImportEntry> {
        self.entries.iter().map(|e| e.resolve(export_dir)).collect()
    }

    /// Checks that every entry targets a table of `schema`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the first unknown table.
    pub fn validate(&self, schema: &SchemaDefinition) -> Result<()> {
        for entry in &self.entries {
            if schema.node_table(&entry.table).is_none() && schema.rel_table(&entry.table).is_none()
            {
                return Err(Error::InvalidInput(format!(
                    "import plan targets unknown table '{}'",
                    entry.table
                )));
            }
        }
        Ok(())
    }
}

/// Schema plus import plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDefinition {
    /// Table declarations.
    #[serde(flatten)]
    pub schema: SchemaDefinition,
    /// Files to import.
    #[serde(default, rename = "import")]
    pub plan: ImportPlan,
}

impl GraphDefinition {
    /// Parses a definition from TOML.
    ///
    /// ```toml
    /// [[node_tables]]
    /// name = "User"
    /// columns = [{ name = "node_id", type = "INT64" }]
    ///
    /// [[import]]
    /// table = "User"
    /// file = "nodes/users.parquet"
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed, the schema is
    /// invalid, or the plan targets an undeclared table.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let definition: Self = toml::from_str(contents).map_err(|e| Error::OperationFailed {
            operation: "parse_graph_definition".to_string(),
            cause: e.to_string(),
        })?;
        definition.schema.validate()?;
        definition.plan.validate(&definition.schema)?;
        Ok(definition)
    }

    /// Reads a definition file.
    ///
    /// # Errors
    ///
    /// See [`GraphDefinition::from_toml`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_graph_definition".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;
        Self::from_toml(&contents)
    }

    /// Returns a built-in definition by name.
    #[must_use]
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            MUSIC_TASTE => Some(music_taste()),
            _ => None,
        }
    }
}

/// The built-in music graph: users, genres and tracks from two datasets.
#[must_use]
pub fn music_taste() -> GraphDefinition {
    let schema = SchemaDefinition::new()
        .with_node_table(
            NodeTableDef::new("User")
                .with_column("user_id", ColumnType::String)
                .with_column("source", ColumnType::String)
                .with_column("country", ColumnType::String),
        )
        .with_node_table(NodeTableDef::new("Genre").with_column("genre", ColumnType::String))
        .with_node_table(
            NodeTableDef::new("Track")
                .with_column("track_id", ColumnType::String)
                .with_column("name", ColumnType::String)
                .with_column("artist", ColumnType::String)
                .with_column("year", ColumnType::Int16),
        )
        .with_rel_table(RelTableDef::new("Friend", "User", "User"))
        .with_rel_table(RelTableDef::new("Likes", "User", "Genre"))
        .with_rel_table(
            RelTableDef::new("ListenedTo", "User", "Track")
                .with_property("play_count", ColumnType::Int64),
        )
        .with_rel_table(RelTableDef::new("Tagged", "Track", "Genre"));

    let plan = ImportPlan::new()
        .with_entry(PlanEntry::new("User", "nodes/dsn_nodes_users.parquet"))
        .with_entry(PlanEntry::new("User", "nodes/msdsl_nodes_users.parquet"))
        .with_entry(PlanEntry::new("Genre", "nodes/dsn_nodes_genres.parquet"))
        .with_entry(
            PlanEntry::new("Genre", "nodes/msdsl_nodes_tags.parquet")
                .with_columns(&["node_id", "tag"]),
        )
        .with_entry(PlanEntry::new("Track", "nodes/msdsl_nodes_tracks.parquet"))
        .with_entry(PlanEntry::new("Friend", "edges/dsn_edges_friendships.parquet"))
        .with_entry(PlanEntry::new("Likes", "edges/dsn_edges_user_genres.parquet"))
        .with_entry(PlanEntry::new("ListenedTo", "edges/msdsl_edges_user_tracks.parquet"))
        .with_entry(PlanEntry::new("Tagged", "edges/msdsl_edges_track_tags.parquet"));

    GraphDefinition { schema, plan }
}

// ============================================================================
// Loader
// ============================================================================

/// An entry that was imported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedTable {
    /// Imported entry.
    pub entry: ImportEntry,
    /// Rows written.
    pub rows: usize,
}

/// An entry that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTable {
    /// Failed entry.
    pub entry: ImportEntry,
    /// Error message.
    pub cause: String,
}

/// Outcome of a load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Entries imported.
    pub imported: Vec<ImportedTable>,
    /// Entries that failed under [`ImportPolicy::BestEffort`].
    pub failed: Vec<FailedTable>,
}

impl LoadReport {
    /// Total rows written.
    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.imported.iter().map(|t| t.rows).sum()
    }

    /// Returns `true` if nothing failed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Declares a schema and imports its plan.
pub struct GraphLoader {
    store: Arc<GraphStore>,
    policy: ImportPolicy,
}

impl GraphLoader {
    /// Creates a loader.
    #[must_use]
    pub const fn new(store: Arc<GraphStore>, policy: ImportPolicy) -> Self {
        Self { store, policy }
    }

    /// Returns the import policy.
    #[must_use]
    pub const fn policy(&self) -> ImportPolicy {
        self.policy
    }

    /// Creates the schema and imports every plan entry from `export_dir`.
    ///
    /// # Errors
    ///
    /// - [`Error::SchemaConflict`] if a declared table already exists
    /// - [`Error::Import`] for the first failing entry under
    ///   [`ImportPolicy::AllOrNothing`]
    #[instrument(skip(self, definition), fields(policy = %self.policy, export_dir = %export_dir.display()))]
    pub fn load(&self, definition: &GraphDefinition, export_dir: &Path) -> Result<LoadReport> {
        let start = Instant::now();
        definition.plan.validate(&definition.schema)?;
        self.store.create_schema(&definition.schema)?;

        let entries = definition.plan.resolve(export_dir);
        let report = match self.policy {
            ImportPolicy::BestEffort => self.import_best_effort(entries),
            ImportPolicy::AllOrNothing => self.import_atomic(entries)?,
        };

        metrics::histogram!("graph_load_duration_ms")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        tracing::info!(
            imported = report.imported.len(),
            failed = report.failed.len(),
            rows = report.total_rows(),
            "Loaded graph"
        );
        Ok(report)
    }

    fn import_best_effort(&self, entries: Vec<ImportEntry>) -> LoadReport {
        let mut report = LoadReport::default();
        for entry in entries {
            match self.store.bulk_import_entry(&entry) {
                Ok(rows) => report.imported.push(ImportedTable { entry, rows }),
                Err(e) => {
                    tracing::error!(
                        table = %entry.table,
                        path = %entry.path.display(),
                        error = %e,
                        "Import failed, continuing"
                    );
                    report.failed.push(FailedTable {
                        entry,
                        cause: e.to_string(),
                    });
                },
            }
        }
        report
    }

    fn import_atomic(&self, entries: Vec<ImportEntry>) -> Result<LoadReport> {
        self.store.bulk_import_all(&entries)?;

        // Per-entry counts come from the file row counts of the committed load.
        let imported = entries
            .into_iter()
            .map(|entry| {
                let rows = parquet_rows(&entry.path)?;
                Ok(ImportedTable { entry, rows })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(LoadReport {
            imported,
            failed: Vec::new(),
        })
    }
}

fn parquet_rows(path: &Path) -> Result<usize> {
    use parquet::file::reader::{FileReader, SerializedFileReader};

    let file = std::fs::File::open(path).map_err(|e| Error::OperationFailed {
        operation: "open_parquet".to_string(),
        cause: format!("{}: {e}", path.display()),
    })?;
    let reader = SerializedFileReader::new(file).map_err(|e| Error::OperationFailed {
        operation: "read_parquet_metadata".to_string(),
        cause: e.to_string(),
    })?;
    usize::try_from(reader.metadata().file_metadata().num_rows()).map_err(|e| {
        Error::OperationFailed {
            operation: "read_parquet_metadata".to_string(),
            cause: e.to_string(),
        }
    })
}
