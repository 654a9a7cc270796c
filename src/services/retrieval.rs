//! Graph retrieval for prompt context.
//!
//! Turns free text into a bounded textual description of the relevant part
//! of the graph.
//!
//! # Architecture
//!
//! ```text
//! Query text: "friends who like jazz"
//!     │
//!     ▼
//! resolve()        EntityResolver → seed node ids
//!     │
//!     ▼
//! expand()         knn per seed (parallel), seeds excluded
//!     │            merge by (table, node), average distance, top k
//!     ▼
//! sample_paths()   ┌─ shortest paths seeds → neighbors
//!     │            └─ random walks from each neighbor      (rayon::join)
//!     ▼
//! hydrate()        "Nodes:\n...\n\nRelationships:\n..."
//! ```
//!
//! Each stage is a public method so it can be exercised on its own. The
//! cancellation token is checked between stages.

// Allow cast_possible_truncation for the per-neighbor seed offsets.
#![allow(clippy::cast_possible_truncation)]
// Allow cast_precision_loss for averaging distances over seed counts.
#![allow(clippy::cast_precision_loss)]

use crate::cancel::CancellationToken;
use crate::models::{Neighbor, NodeId, Path, PathBounds};
use crate::storage::GraphStore;
use crate::{Error, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

// ============================================================================
// Configuration
// ============================================================================

/// Retrieval parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalConfig {
    /// Neighbors requested per seed.
    pub max_k: usize,
    /// Cosine distance ceiling for neighbors.
    pub max_distance: f32,
    /// Neighbors kept after merging.
    pub k: usize,
    /// Shortest paths sampled.
    pub num_paths: usize,
    /// Minimum path and walk length in hops.
    pub min_length: usize,
    /// Maximum path and walk length in hops.
    pub max_length: usize,
    /// Random walks per neighbor.
    pub num_walks: usize,
    /// Embedding column searched.
    pub column: String,
    /// Seed for path sampling; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_k: 10,
            max_distance: 0.5,
            k: 10,
            num_paths: 10,
            min_length: 1,
            max_length: 3,
            num_walks: 5,
            column: "embedding".to_string(),
            seed: None,
        }
    }
}

impl RetrievalConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-seed neighbor count.
    #[must_use]
    pub const fn with_max_k(mut self, max_k: usize) -> Self {
        self.max_k = max_k;
        self
    }

    /// Sets the distance ceiling.
    #[must_use]
    pub const fn with_max_distance(mut self, max_distance: f32) -> Self {
        self.max_distance = max_distance;
        self
    }

    /// Sets the merged neighbor count.
    #[must_use]
    pub const fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Sets the number of sampled paths.
    #[must_use]
    pub const fn with_num_paths(mut self, num_paths: usize) -> Self {
        self.num_paths = num_paths;
        self
    }

    /// Sets the path length bounds.
    #[must_use]
    pub const fn with_lengths(mut self, min_length: usize, max_length: usize) -> Self {
        self.min_length = min_length;
        self.max_length = max_length;
        self
    }

    /// Sets the walks per neighbor.
    #[must_use]
    pub const fn with_num_walks(mut self, num_walks: usize) -> Self {
        self.num_walks = num_walks;
        self
    }

    /// Sets the embedding column.
    #[must_use]
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Fixes the sampling seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
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

        if let Ok(val) = std::env::var("LAKEGRAPH_RETRIEVAL_MAX_K")
            && let Ok(max_k) = val.parse()
        {
            config.max_k = max_k;
        }
        if let Ok(val) = std::env::var("LAKEGRAPH_RETRIEVAL_MAX_DISTANCE")
            && let Ok(distance) = val.parse()
        {
            config.max_distance = distance;
        }
        if let Ok(val) = std::env::var("LAKEGRAPH_RETRIEVAL_K")
            && let Ok(k) = val.parse()
        {
            config.k = k;
        }
        if let Ok(val) = std::env::var("LAKEGRAPH_RETRIEVAL_MAX_LENGTH")
            && let Ok(max_length) = val.parse()
        {
            config.max_length = max_length;
        }

        config
    }

    fn bounds(&self) -> Result<PathBounds> {
        PathBounds::new(self.min_length, self.max_length)
    }
}

// ============================================================================
// Entity Resolution
// ============================================================================

/// Maps free text to seed nodes.
pub trait EntityResolver: Send + Sync {
    /// Returns the nodes mentioned by `text`, ascending and without duplicates.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn resolve(&self, store: &GraphStore, text: &str) -> Result<Vec<NodeId>>;
}

/// Matches query phrases against text properties.
///
/// Every run of one to three consecutive words is compared, ignoring case,
/// with the text properties of all node tables. Single words shorter than
/// `min_word_len` are skipped.
#[derive(Debug, Clone)]
pub struct PropertyMatchResolver {
    /// Maximum nodes matched per phrase.
    pub max_matches: usize,
    /// Minimum length of single-word phrases.
    pub min_word_len: usize,
}

impl Default for PropertyMatchResolver {
    fn default() -> Self {
        Self {
            max_matches: 5,
            min_word_len: 3,
        }
    }
}

impl PropertyMatchResolver {
    fn phrases(&self, text: &str) -> Vec<String> {
        let words: Vec<&str> = text
            .split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '-'))
            .filter(|w| !w.is_empty())
            .collect();

        let mut phrases = BTreeSet::new();
        for width in 1..=3 {
            for window in words.windows(width) {
                if width == 1 && window[0].chars().count() < self.min_word_len {
                    continue;
                }
                phrases.insert(window.join(" "));
            }
        }
        phrases.into_iter().collect()
    }
}

impl EntityResolver for PropertyMatchResolver {
    fn resolve(&self, store: &GraphStore, text: &str) -> Result<Vec<NodeId>> {
        let mut found = BTreeSet::new();
        for phrase in self.phrases(text) {
            found.extend(store.find_nodes_by_text(&phrase, self.max_matches)?);
        }
        Ok(found.into_iter().collect())
    }
}

// ============================================================================
// Retrieval
// ============================================================================

/// Assembled retrieval context.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalContext {
    /// Resolved seed nodes.
    pub seeds: Vec<NodeId>,
    /// Merged nearest neighbors, closest first.
    pub neighbors: Vec<Neighbor>,
    /// Sampled shortest paths followed by random walks.
    pub paths: Vec<Path>,
    /// Rendered description.
    pub text: String,
}

/// Retrieval pipeline over a graph store.
pub struct GraphRetriever {
    store: Arc<GraphStore>,
    resolver: Box<dyn EntityResolver>,
    config: RetrievalConfig,
}

impl GraphRetriever {
    /// Creates a retriever using [`PropertyMatchResolver`].
    #[must_use]
    pub fn new(store: Arc<GraphStore>, config: RetrievalConfig) -> Self {
        Self {
            store,
            resolver: Box::new(PropertyMatchResolver::default()),
            config,
        }
    }

    /// Replaces the entity resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Box<dyn EntityResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Runs the full pipeline on free text.
    ///
    /// # Errors
    ///
    /// - [`Error::ContextAssembly`] if no entity or no neighbor is found
    /// - [`Error::GraphRetrieval`] if path sampling fails
    /// - [`Error::Cancelled`] if `cancel` fires between stages
    #[instrument(skip(self, cancel), fields(query_len = text.len()))]
    pub fn retrieve(&self, text: &str, cancel: &CancellationToken) -> Result<RetrievalContext> {
        let start = Instant::now();
        cancel.check()?;
        let seeds = self.resolve(text)?;
        let context = self.retrieve_from_seeds(&seeds, cancel);

        metrics::histogram!("retrieval_duration_ms")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        match &context {
            Ok(_) => metrics::counter!("retrieval_requests_total", "status" => "success").increment(1),
            Err(_) => metrics::counter!("retrieval_requests_total", "status" => "error").increment(1),
        }
        context
    }

    /// Runs the pipeline from already resolved seeds.
    ///
    /// # Errors
    ///
    /// See [`GraphRetriever::retrieve`].
    pub fn retrieve_from_seeds(
        &self,
        seeds: &[NodeId],
        cancel: &CancellationToken,
    ) -> Result<RetrievalContext> {
        let seeds: Vec<NodeId> = seeds
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if seeds.is_empty() {
            return Err(Error::ContextAssembly(
                "no entities matched the query".to_string(),
            ));
        }

        cancel.check()?;
        let neighbors = self.expand(&seeds)?;

        cancel.check()?;
        let paths = self.sample_paths(&seeds, &neighbors, cancel)?;

        cancel.check()?;
        let text = self.hydrate(&seeds, &neighbors, &paths)?;

        tracing::info!(
            seeds = seeds.len(),
            neighbors = neighbors.len(),
            paths = paths.len(),
            "Assembled retrieval context"
        );
        Ok(RetrievalContext {
            seeds,
            neighbors,
            paths,
            text,
        })
    }

    /// Stage 1: resolves seed nodes.
    ///
    /// # Errors
    ///
    /// - [`Error::ContextAssembly`] if nothing matches
    pub fn resolve(&self, text: &str) -> Result<Vec<NodeId>> {
        let seeds = self.resolver.resolve(&self.store, text)?;
        if seeds.is_empty() {
            return Err(Error::ContextAssembly(format!(
                "no entities matched the query '{text}'"
            )));
        }
        tracing::debug!(seeds = seeds.len(), "Resolved entities");
        Ok(seeds)
    }

    /// Stage 2: finds the nearest neighbors of the seeds.
    ///
    /// Seeds are searched in parallel with all seeds excluded. Hits found
    /// from several seeds are merged by `(table, node)` with their distances
    /// averaged, then the `k` closest are kept.
    ///
    /// # Errors
    ///
    /// - [`Error::ContextAssembly`] if no neighbor is found
    /// - any error raised by the nearest-neighbor search
    #[instrument(skip(self, seeds), fields(seeds = seeds.len()))]
    pub fn expand(&self, seeds: &[NodeId]) -> Result<Vec<Neighbor>> {
        let exclude: HashSet<NodeId> = seeds.iter().copied().collect();

        let per_seed = seeds
            .par_iter()
            .map(|seed| {
                self.store.knn(
                    *seed,
                    &self.config.column,
                    self.config.max_k,
                    self.config.max_distance,
                    &exclude,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let neighbors = merge_neighbors(per_seed, self.config.k);
        if neighbors.is_empty() {
            return Err(Error::ContextAssembly(format!(
                "no neighbors within distance {} of {} seeds",
                self.config.max_distance,
                seeds.len()
            )));
        }
        Ok(neighbors)
    }

    /// Stage 3: samples shortest paths and random walks.
    ///
    /// Shortest paths run from the seeds to the neighbors; walks start at
    /// each neighbor. Both run concurrently. Paths come first in the result.
    ///
    /// # Errors
    ///
    /// - [`Error::GraphRetrieval`] if a traversal query fails
    /// - [`Error::InvalidInput`] for inverted length bounds
    /// - [`Error::Cancelled`] if `cancel` fires during the search or before a walk
    #[instrument(skip(self, seeds, neighbors, cancel), fields(seeds = seeds.len(), neighbors = neighbors.len()))]
    pub fn sample_paths(
        &self,
        seeds: &[NodeId],
        neighbors: &[Neighbor],
        cancel: &CancellationToken,
    ) -> Result<Vec<Path>> {
        let bounds = self.config.bounds()?;
        let targets: Vec<NodeId> = neighbors.iter().map(|n| n.node_id).collect();

        let mut rng = self
            .config
            .seed
            .map_or_else(ChaCha8Rng::from_entropy, ChaCha8Rng::seed_from_u64);
        let path_seed: u64 = rng.r#gen();
        let walk_seed: u64 = rng.r#gen();

        let (shortest, walks) = rayon::join(
            || {
                let mut rng = ChaCha8Rng::seed_from_u64(path_seed);
                self.store.sample_shortest_paths(
                    seeds,
                    &targets,
                    self.config.num_paths,
                    bounds,
                    &mut rng,
                    cancel,
                )
            },
            || {
                targets
                    .par_iter()
                    .enumerate()
                    .map(|(i, start)| {
                        cancel.check()?;
                        let mut rng = ChaCha8Rng::seed_from_u64(walk_seed.wrapping_add(i as u64));
                        self.store
                            .random_walk(*start, self.config.num_walks, bounds, &mut rng)
                    })
                    .collect::<Result<Vec<_>>>()
            },
        );

        let mut paths = shortest.map_err(|e| retrieval_error("sample_shortest_paths", e))?;
        paths.extend(
            walks
                .map_err(|e| retrieval_error("random_walk", e))?
                .into_iter()
                .flatten(),
        );
        metrics::histogram!("retrieval_paths_sampled").record(paths.len() as f64);
        Ok(paths)
    }

    /// Stage 4: renders seeds, neighbors and paths as text.
    ///
    /// Node and relationship descriptions are deduplicated and sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if a node or edge cannot be loaded.
    pub fn hydrate(
        &self,
        seeds: &[NodeId],
        neighbors: &[Neighbor],
        paths: &[Path],
    ) -> Result<String> {
        let node_ids: BTreeSet<NodeId> = seeds
            .iter()
            .copied()
            .chain(neighbors.iter().map(|n| n.node_id))
            .chain(paths.iter().flat_map(|p| p.nodes.iter().copied()))
            .collect();
        let edge_refs: BTreeSet<(&str, i64)> = paths
            .iter()
            .flat_map(|p| p.edges.iter())
            .map(|e| (e.table.as_str(), e.row_id))
            .collect();

        let mut nodes = BTreeSet::new();
        for id in node_ids {
            nodes.insert(self.store.get_node(id)?.describe());
        }

        let mut relationships = BTreeSet::new();
        for (table, row_id) in edge_refs {
            let edge = self.store.get_edge(&crate::models::EdgeRef {
                table: table.to_string(),
                row_id,
                forward: true,
            })?;
            relationships.insert(edge.describe());
        }

        Ok(render_context(&nodes, &relationships))
    }
}

fn render_context(nodes: &BTreeSet<String>, relationships: &BTreeSet<String>) -> String {
    let nodes = nodes.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
    let relationships = relationships
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n");
    format!("Nodes:\n{nodes}\n\nRelationships:\n{relationships}")
}

/// Merges per-seed hits by `(table, node)`, averaging distances.
fn merge_neighbors(per_seed: Vec<Vec<Neighbor>>, k: usize) -> Vec<Neighbor> {
    let mut merged: HashMap<(String, NodeId), (f32, usize)> = HashMap::new();
    for neighbor in per_seed.into_iter().flatten() {
        let entry = merged
            .entry((neighbor.table, neighbor.node_id))
            .or_insert((0.0, 0));
        entry.0 += neighbor.distance;
        entry.1 += 1;
    }

    let mut neighbors: Vec<Neighbor> = merged
        .into_iter()
        .map(|((table, node_id), (sum, count))| Neighbor {
            table,
            node_id,
            distance: sum / count as f32,
        })
        .collect();
    neighbors.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.table.cmp(&b.table))
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    neighbors.truncate(k);
    neighbors
}

fn retrieval_error(stage: &str, error: Error) -> Error {
    match error {
        Error::Query { query, cause } => Error::GraphRetrieval { query, cause },
        Error::Cancelled => Error::Cancelled,
        other => Error::GraphRetrieval {
            query: stage.to_string(),
            cause: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbor(table: &str, id: i64, distance: f32) -> Neighbor {
        Neighbor {
            table: table.to_string(),
            node_id: NodeId::new(id),
            distance,
        }
    }

    #[test]
    fn test_merge_averages_and_truncates() {
        let merged = merge_neighbors(
            vec![
                vec![neighbor("User", 2, 0.1), neighbor("Genre", 9, 0.4)],
                vec![neighbor("User", 2, 0.3), neighbor("User", 5, 0.15)],
            ],
            2,
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].node_id, NodeId::new(5));
        assert_eq!(merged[1].node_id, NodeId::new(2));
        assert!((merged[1].distance - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_phrases() {
        let resolver = PropertyMatchResolver::default();
        let phrases = resolver.phrases("Who likes hip-hop, or jazz?");
        assert!(phrases.contains(&"hip-hop".to_string()));
        assert!(phrases.contains(&"jazz".to_string()));
        assert!(phrases.contains(&"likes hip-hop or".to_string()));
        assert!(!phrases.contains(&"or".to_string()));
    }

    #[test]
    fn test_render_context() {
        let nodes: BTreeSet<String> = ["(:User {user_id: \"a\"})".to_string()].into();
        let rels: BTreeSet<String> = ["(1)-[:Likes]->(2)".to_string()].into();
        assert_eq!(
            render_context(&nodes, &rels),
            "Nodes:\n(:User {user_id: \"a\"})\n\nRelationships:\n(1)-[:Likes]->(2)"
        );
    }

    #[test]
    fn test_retrieval_error_keeps_query() {
        let err = retrieval_error(
            "sample_shortest_paths",
            Error::Query {
                query: "SELECT 1".to_string(),
                cause: "boom".to_string(),
            },
        );
        assert!(matches!(err, Error::GraphRetrieval { ref query, .. } if query == "SELECT 1"));
    }

    #[test]
    fn test_sample_paths_observes_cancellation() {
        let store = GraphStore::in_memory().unwrap();
        store
            .create_schema(
                &crate::models::SchemaDefinition::new()
                    .with_node_table(crate::models::NodeTableDef::new("User"))
                    .with_rel_table(crate::models::RelTableDef::new("Friend", "User", "User")),
            )
            .unwrap();
        let retriever = GraphRetriever::new(Arc::new(store), RetrievalConfig::default());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = retriever.sample_paths(
            &[NodeId::new(1)],
            &[neighbor("User", 2, 0.1)],
            &cancel,
        );
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_empty_seeds_fail() {
        let store = Arc::new(GraphStore::in_memory().unwrap());
        let retriever = GraphRetriever::new(store, RetrievalConfig::default());
        assert!(matches!(
            retriever.retrieve_from_seeds(&[], &CancellationToken::new()),
            Err(Error::ContextAssembly(_))
        ));
        assert!(matches!(
            retriever.retrieve("nothing here", &CancellationToken::new()),
            Err(Error::ContextAssembly(_))
        ));
    }
}
