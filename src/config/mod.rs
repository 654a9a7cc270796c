//! Configuration management.
//!
//! Values are layered: defaults, then the TOML file, then `LAKEGRAPH_*`
//! environment variables. A `.env` file in the working directory is loaded
//! before the environment is read.
//!
//! ```toml
//! data_dir = "/var/lib/lakegraph"
//!
//! [graph]
//! import_policy = "all-or-nothing"
//! export_dir = "/exports/music"
//!
//! [graph.databases]
//! music_taste = "/fast/music.graph.db"
//!
//! [embedding]
//! dim = 64
//!
//! [observability.logging]
//! format = "json"
//! ```

use crate::monitoring::MonitoringConfig;
use crate::services::{GraphDefinition, ImportPolicy, RetrievalConfig, TrainingConfig};
use crate::storage::StoreConfig;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Application directory name under the platform config and data dirs.
const APP_DIR: &str = "lakegraph";

/// Main configuration for lakegraph.
#[derive(Debug, Clone)]
pub struct LakegraphConfig {
    /// Directory holding graph databases and computed artifacts.
    pub data_dir: PathBuf,
    /// Graph loading settings.
    pub graph: GraphConfig,
    /// Graph store tuning.
    pub store: StoreConfig,
    /// Embedding training parameters.
    pub embedding: TrainingConfig,
    /// Retrieval parameters.
    pub retrieval: RetrievalConfig,
    /// Rolling statistics parameters.
    pub monitoring: MonitoringConfig,
    /// Logging and metrics settings.
    pub observability: ObservabilitySettings,
    /// File the configuration was read from, if any.
    pub source: Option<PathBuf>,
}

/// Graph loading settings.
#[derive(Debug, Clone, Default)]
pub struct GraphConfig {
    /// Failure handling during bulk import.
    pub import_policy: ImportPolicy,
    /// Root of the Parquet export.
    pub export_dir: PathBuf,
    /// Explicit database paths by schema name.
    pub databases: BTreeMap<String, PathBuf>,
    /// TOML graph definitions by schema name.
    pub definitions: BTreeMap<String, PathBuf>,
}

// ============================================================================
// File Sections
// ============================================================================

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Data directory.
    pub data_dir: Option<String>,
    /// Graph section.
    pub graph: Option<GraphSection>,
    /// Store section.
    pub store: Option<StoreSection>,
    /// Embedding section.
    pub embedding: Option<EmbeddingSection>,
    /// Retrieval section.
    pub retrieval: Option<RetrievalSection>,
    /// Monitoring section.
    pub monitoring: Option<MonitoringSection>,
    /// Observability section.
    pub observability: Option<ObservabilitySettings>,
}

/// Graph section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct GraphSection {
    /// Import policy name.
    pub import_policy: Option<ImportPolicy>,
    /// Export root.
    pub export_dir: Option<String>,
    /// Database paths by schema.
    #[serde(default)]
    pub databases: BTreeMap<String, String>,
    /// Definition files by schema.
    #[serde(default)]
    pub definitions: BTreeMap<String, String>,
}

/// Store section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct StoreSection {
    /// Rows per write transaction.
    pub write_batch_size: Option<usize>,
    /// Shortest path enumeration cap.
    pub max_path_candidates: Option<usize>,
    /// Ids per `IN (...)` clause.
    pub query_chunk_size: Option<usize>,
}

/// Embedding section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct EmbeddingSection {
    /// Embedding dimension.
    pub dim: Option<usize>,
    /// Nodes per batch.
    pub batch_size: Option<usize>,
    /// Propagation epochs.
    pub epochs: Option<usize>,
    /// Vectors per write transaction.
    pub write_batch_size: Option<usize>,
    /// Initialization seed.
    pub seed: Option<u64>,
    /// Target column.
    pub column: Option<String>,
}

/// Retrieval section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct RetrievalSection {
    /// Neighbors per seed.
    pub max_k: Option<usize>,
    /// Distance ceiling.
    pub max_distance: Option<f32>,
    /// Neighbors kept.
    pub k: Option<usize>,
    /// Shortest paths sampled.
    pub num_paths: Option<usize>,
    /// Minimum hops.
    pub min_length: Option<usize>,
    /// Maximum hops.
    pub max_length: Option<usize>,
    /// Walks per neighbor.
    pub num_walks: Option<usize>,
    /// Embedding column.
    pub column: Option<String>,
    /// Sampling seed.
    pub seed: Option<u64>,
}

/// Monitoring section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct MonitoringSection {
    /// Window length in days.
    pub window_size: Option<usize>,
    /// Decision threshold.
    pub threshold: Option<f64>,
    /// Drift classifier test share.
    pub test_fraction: Option<f64>,
    /// Drift classifier seed.
    pub seed: Option<u64>,
    /// KL histogram bins.
    pub kl_bins: Option<usize>,
    /// Comma-separated statistic groups.
    pub stats: Option<String>,
}

/// Observability section in config file.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ObservabilitySettings {
    /// Logging settings.
    pub logging: Option<LoggingSettings>,
    /// Metrics settings.
    pub metrics: Option<MetricsSettings>,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingSettings {
    /// `pretty` or `json`.
    pub format: Option<String>,
    /// `EnvFilter` directive.
    pub filter: Option<String>,
    /// Log file path; stderr when absent.
    pub file: Option<String>,
}

/// Metrics settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetricsSettings {
    /// Install the Prometheus recorder.
    pub enabled: Option<bool>,
    /// Port of the scrape endpoint.
    pub port: Option<u16>,
}

// ============================================================================
// Loading
// ============================================================================

impl Default for LakegraphConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            graph: GraphConfig::default(),
            store: StoreConfig::default(),
            embedding: TrainingConfig::default(),
            retrieval: RetrievalConfig::default(),
            monitoring: MonitoringConfig::default(),
            observability: ObservabilitySettings::default(),
            source: None,
        }
    }
}

impl LakegraphConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration for a process.
    ///
    /// The file is `explicit` if given, else `LAKEGRAPH_CONFIG_PATH`, else
    /// `config.toml` in the platform config dir when it exists. Environment
    /// overrides are applied last.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named file cannot be read or parsed.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        // A missing .env is normal
        let _ = dotenvy::dotenv();

        let named = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("LAKEGRAPH_CONFIG_PATH").map(PathBuf::from));
        let config = match named {
            Some(path) => Self::load_from_file(&path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::load_from_file(&path).unwrap_or_else(|e| {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable config");
                    Self::default()
                }),
                None => Self::default(),
            },
        };

        Ok(config.with_env_overrides())
    }

    /// Loads configuration from a file path without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_config_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents).map_err(|e| Error::OperationFailed {
            operation: "parse_config_file".to_string(),
            cause: e.to_string(),
        })?;
        Self::from_config_file(file)
    }

    /// Converts a `ConfigFile` to `LakegraphConfig`.
    fn from_config_file(file: ConfigFile) -> Result<Self> {
        let mut config = Self::default();

        if let Some(data_dir) = file.data_dir {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Some(graph) = file.graph {
            if let Some(policy) = graph.import_policy {
                config.graph.import_policy = policy;
            }
            if let Some(dir) = graph.export_dir {
                config.graph.export_dir = PathBuf::from(dir);
            }
            config.graph.databases = into_paths(graph.databases);
            config.graph.definitions = into_paths(graph.definitions);
        }
        if let Some(store) = file.store {
            let target = &mut config.store;
            set(&mut target.write_batch_size, store.write_batch_size);
            set(&mut target.max_path_candidates, store.max_path_candidates);
            set(&mut target.query_chunk_size, store.query_chunk_size);
        }
        if let Some(embedding) = file.embedding {
            let target = &mut config.embedding;
            set(&mut target.dim, embedding.dim);
            set(&mut target.batch_size, embedding.batch_size);
            set(&mut target.epochs, embedding.epochs);
            set(&mut target.write_batch_size, embedding.write_batch_size);
            set(&mut target.seed, embedding.seed);
            set(&mut target.column, embedding.column);
        }
        if let Some(retrieval) = file.retrieval {
            let target = &mut config.retrieval;
            set(&mut target.max_k, retrieval.max_k);
            set(&mut target.max_distance, retrieval.max_distance);
            set(&mut target.k, retrieval.k);
            set(&mut target.num_paths, retrieval.num_paths);
            set(&mut target.min_length, retrieval.min_length);
            set(&mut target.max_length, retrieval.max_length);
            set(&mut target.num_walks, retrieval.num_walks);
            set(&mut target.column, retrieval.column);
            if retrieval.seed.is_some() {
                target.seed = retrieval.seed;
            }
        }
        if let Some(monitoring) = file.monitoring {
            let target = &mut config.monitoring;
            set(&mut target.window_size, monitoring.window_size);
            set(&mut target.threshold, monitoring.threshold);
            set(&mut target.test_fraction, monitoring.test_fraction);
            set(&mut target.seed, monitoring.seed);
            set(&mut target.kl_bins, monitoring.kl_bins);
            if let Some(stats) = monitoring.stats {
                target.flags = stats.parse()?;
            }
        }
        if let Some(observability) = file.observability {
            config.observability = observability;
        }

        Ok(config)
    }

    /// Applies `LAKEGRAPH_*` environment overrides to every section.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(dir) = std::env::var_os("LAKEGRAPH_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = std::env::var_os("LAKEGRAPH_EXPORT_DIR") {
            self.graph.export_dir = PathBuf::from(dir);
        }
        if let Ok(val) = std::env::var("LAKEGRAPH_IMPORT_POLICY")
            && let Ok(policy) = val.parse()
        {
            self.graph.import_policy = policy;
        }
        self.store = self.store.with_env_overrides();
        self.embedding = self.embedding.with_env_overrides();
        self.retrieval = self.retrieval.with_env_overrides();
        self.monitoring = self.monitoring.with_env_overrides();
        self
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Database path for a schema.
    ///
    /// `LAKEGRAPH_{SCHEMA}_GRAPH_DB` wins, then `[graph.databases]`, then
    /// `{data_dir}/{schema}.graph.db`.
    #[must_use]
    pub fn graph_db_path(&self, schema: &str) -> PathBuf {
        if let Some(path) = std::env::var_os(graph_db_env_var(schema)) {
            return PathBuf::from(path);
        }
        self.graph
            .databases
            .get(schema)
            .cloned()
            .unwrap_or_else(|| self.data_dir.join(format!("{schema}.graph.db")))
    }

    /// Resolves a graph definition by schema name.
    ///
    /// Definitions listed in `[graph.definitions]` take precedence over the
    /// built-in schemas.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the schema is neither configured nor
    /// built in, or the file error if the definition cannot be read.
    pub fn graph_definition(&self, schema: &str) -> Result<GraphDefinition> {
        if let Some(path) = self.graph.definitions.get(schema) {
            return GraphDefinition::from_file(path);
        }
        GraphDefinition::builtin(schema)
            .ok_or_else(|| Error::NotFound(format!("graph schema '{schema}'")))
    }
}

/// Environment variable naming the database of `schema`.
#[must_use]
pub fn graph_db_env_var(schema: &str) -> String {
    let upper: String = schema
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("LAKEGRAPH_{upper}_GRAPH_DB")
}

/// Platform config file location.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new()
        .map(|dirs| dirs.config_dir().join(APP_DIR).join("config.toml"))
}

fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".lakegraph"),
        |dirs| dirs.data_dir().join(APP_DIR),
    )
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn into_paths(map: BTreeMap<String, String>) -> BTreeMap<String, PathBuf> {
    map.into_iter().map(|(k, v)| (k, PathBuf::from(v))).collect()
}
