//! Graph CLI commands.
//!
//! - `load`: create a graph database and bulk import its Parquet export
//! - `embed`: train node embeddings
//! - `reindex`: rebuild vector indexes
//! - `query`: assemble graph context for text, once or interactively
//! - `schema`: show tables, columns and counts
//! - `con-score`: compute co-neighbor scores

use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use lakegraph::config::LakegraphConfig;
use lakegraph::services::{
    DEFAULT_CON_COLUMN, EmbeddingTrainer, GraphLoader, GraphRetriever, ImportPolicy,
    VectorIndexManager, compute_con_scores,
};
use lakegraph::storage::{GraphStore, OpenMode};
use lakegraph::CancellationToken;

/// Graph action subcommands.
#[derive(clap::Subcommand)]
pub enum GraphAction {
    /// Create a graph database from a Parquet export.
    Load {
        /// Schema name (built in or listed under `[graph.definitions]`).
        schema: String,

        /// Replace an existing database.
        #[arg(long)]
        overwrite: bool,

        /// Root of the export; defaults to `graph.export_dir`.
        #[arg(short, long)]
        export_dir: Option<PathBuf>,

        /// Failure handling: best-effort or all-or-nothing.
        #[arg(short, long)]
        policy: Option<ImportPolicy>,
    },

    /// Train node embeddings.
    Embed {
        /// Schema name.
        schema: String,

        /// Embedding dimension.
        #[arg(long)]
        dim: Option<usize>,

        /// Propagation epochs.
        #[arg(long)]
        epochs: Option<usize>,

        /// Nodes per training batch.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Vectors per write transaction.
        #[arg(long)]
        write_batch_size: Option<usize>,

        /// Embedding algorithm.
        #[arg(short, long, default_value = "frp")]
        algorithm: String,
    },

    /// Rebuild the vector indexes over an embedding column.
    Reindex {
        /// Schema name.
        schema: String,

        /// Embedding column; defaults to `embedding.column`.
        #[arg(short, long)]
        column: Option<String>,
    },

    /// Assemble graph context for a piece of text.
    Query {
        /// Text to resolve; required unless `--interactive`.
        text: Option<String>,

        /// Schema name.
        #[arg(short, long, default_value = "music_taste")]
        schema: String,

        /// Read queries from stdin until EOF.
        #[arg(short, long)]
        interactive: bool,

        /// Sampling seed for reproducible paths.
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Show the stored schema.
    Schema {
        /// Schema name.
        schema: String,
    },

    /// Compute co-neighbor scores over a relationship.
    ConScore {
        /// Schema name.
        schema: String,

        /// Node table scored.
        node: String,

        /// Relationship from `node` to `node`.
        rel: String,

        /// Edge weight property.
        #[arg(short, long, default_value = "weight")]
        weight: String,

        /// Target column.
        #[arg(short, long, default_value = DEFAULT_CON_COLUMN)]
        column: String,
    },
}

/// Execute a graph command.
///
/// # Errors
///
/// Returns an error if the graph database cannot be opened or the operation fails.
pub fn cmd_graph(config: &LakegraphConfig, action: GraphAction) -> Result<(), Box<dyn Error>> {
    match action {
        GraphAction::Load {
            schema,
            overwrite,
            export_dir,
            policy,
        } => cmd_load(config, &schema, overwrite, export_dir, policy),
        GraphAction::Embed {
            schema,
            dim,
            epochs,
            batch_size,
            write_batch_size,
            algorithm,
        } => {
            let mut training = config.embedding.clone();
            if let Some(dim) = dim {
                training.dim = dim;
            }
            if let Some(epochs) = epochs {
                training.epochs = epochs;
            }
            if let Some(size) = batch_size {
                training.batch_size = size;
            }
            if let Some(size) = write_batch_size {
                training.write_batch_size = size;
            }
            let store = open_existing(config, &schema)?;
            let trainer = EmbeddingTrainer::with_algorithm(store, training, &algorithm)?;
            let report = trainer.train(&CancellationToken::new())?;
            println!(
                "Embedded {} nodes into '{}' (dim {}, {} epochs, {} batches)",
                report.nodes, report.column, report.dim, report.epochs, report.batches
            );
            Ok(())
        },
        GraphAction::Reindex { schema, column } => {
            let column = column.unwrap_or_else(|| config.embedding.column.clone());
            let store = open_existing(config, &schema)?;
            let rebuilt = VectorIndexManager::new(store).reindex(&column, &CancellationToken::new())?;
            if rebuilt.is_empty() {
                println!("No node table has column '{column}'.");
            }
            for name in rebuilt {
                println!("Rebuilt {name}");
            }
            Ok(())
        },
        GraphAction::Query {
            text,
            schema,
            interactive,
            seed,
        } => cmd_query(config, &schema, text, interactive, seed),
        GraphAction::Schema { schema } => cmd_schema(config, &schema),
        GraphAction::ConScore {
            schema,
            node,
            rel,
            weight,
            column,
        } => {
            let store = open_existing(config, &schema)?;
            let updated = compute_con_scores(&store, &node, &rel, &weight, &column)?;
            println!("Wrote '{column}' for {updated} {node} nodes");
            Ok(())
        },
    }
}

fn open_existing(config: &LakegraphConfig, schema: &str) -> Result<Arc<GraphStore>, Box<dyn Error>> {
    let path = config.graph_db_path(schema);
    let store = GraphStore::open_with_config(&path, OpenMode::Existing, config.store.clone())
        .map_err(|e| format!("Failed to open graph '{schema}' at {}: {e}", path.display()))?;
    Ok(Arc::new(store))
}

fn cmd_load(
    config: &LakegraphConfig,
    schema: &str,
    overwrite: bool,
    export_dir: Option<PathBuf>,
    policy: Option<ImportPolicy>,
) -> Result<(), Box<dyn Error>> {
    let definition = config.graph_definition(schema)?;
    let export_dir = export_dir.unwrap_or_else(|| config.graph.export_dir.clone());
    let policy = policy.unwrap_or(config.graph.import_policy);
    let path = config.graph_db_path(schema);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mode = if overwrite {
        OpenMode::Overwrite
    } else {
        OpenMode::CreateNew
    };
    let store = Arc::new(GraphStore::open_with_config(&path, mode, config.store.clone())?);
    let report = GraphLoader::new(store, policy).load(&definition, &export_dir)?;

    for imported in &report.imported {
        println!("{:<24} {:>10} rows", imported.entry.table, imported.rows);
    }
    for failed in &report.failed {
        println!("{:<24} FAILED: {}", failed.entry.table, failed.cause);
    }
    println!(
        "Loaded {} rows into {} ({policy})",
        report.total_rows(),
        path.display()
    );
    Ok(())
}

fn cmd_query(
    config: &LakegraphConfig,
    schema: &str,
    text: Option<String>,
    interactive: bool,
    seed: Option<u64>,
) -> Result<(), Box<dyn Error>> {
    let mut retrieval = config.retrieval.clone();
    if seed.is_some() {
        retrieval.seed = seed;
    }
    let retriever = GraphRetriever::new(open_existing(config, schema)?, retrieval);
    let cancel = CancellationToken::new();

    if !interactive {
        let text = text.ok_or("query text is required without --interactive")?;
        let context = retriever.retrieve(&text, &cancel)?;
        println!("{}", context.text);
        return Ok(());
    }

    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())?;

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if matches!(query, "exit" | "quit") {
            break;
        }

        cancel.reset();
        match retriever.retrieve(query, &cancel) {
            Ok(context) => println!("{}\n", context.text),
            Err(lakegraph::Error::Cancelled) => println!("Cancelled."),
            Err(e) => println!("Error: {e}"),
        }
    }
    Ok(())
}

fn cmd_schema(config: &LakegraphConfig, schema: &str) -> Result<(), Box<dyn Error>> {
    let store = open_existing(config, schema)?;
    let definition = store.schema()?;

    for table in &definition.node_tables {
        println!("NODE {} (primary key {})", table.name, table.primary_key);
        for column in &table.columns {
            println!("  {:<20} {}", column.name, column.column_type);
        }
    }
    for rel in &definition.rel_tables {
        println!("REL {} ({} -> {}, {})", rel.name, rel.from, rel.to, rel.cardinality);
        for column in &rel.properties {
            println!("  {:<20} {}", column.name, column.column_type);
        }
    }
    println!("{} nodes", store.count_nodes()?);
    Ok(())
}
