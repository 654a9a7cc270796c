//! Node embedding training.
//!
//! Fast random projection: every node starts from a standard-normal feature
//! vector, averages the features of its out-neighbors, and passes the average
//! through a fixed two-layer projection. Each epoch feeds the previous epoch's
//! outputs back in as features, so `epochs` is the number of propagation
//! hops.
//!
//! Training pages through the graph with [`NodeBatchIterator`]. Only a batch's
//! canonical nodes receive outputs; edge endpoints from other pages contribute
//! their current features.
//!
//! # Example
//!
//! ```rust,ignore
//! use lakegraph::services::{EmbeddingTrainer, TrainingConfig};
//!
//! let trainer = EmbeddingTrainer::new(store, TrainingConfig::default().with_dim(64));
//! let report = trainer.train(&CancellationToken::new())?;
//! println!("embedded {} nodes", report.nodes);
//! ```

// Allow cast_precision_loss for degree counts and the uniform bound.
#![allow(clippy::cast_precision_loss)]

use crate::cancel::CancellationToken;
use crate::models::NodeId;
use crate::services::batch::{BatchEdges, BatchOptions, NodeBatchIterator};
use crate::storage::GraphStore;
use crate::{Error, Result};
use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use rand::SeedableRng;
use rand::distributions::Uniform;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

/// Embedding algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingAlgorithm {
    /// Fast random projection over averaged neighbor features.
    #[default]
    FastRandomProjection,
}

impl fmt::Display for EmbeddingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FastRandomProjection => write!(f, "frp"),
        }
    }
}

impl FromStr for EmbeddingAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "frp" | "fastrp" | "fast_random_projection" => Ok(Self::FastRandomProjection),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "'{other}' (options: frp)"
            ))),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Training parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingConfig {
    /// Embedding dimension.
    pub dim: usize,
    /// Canonical nodes per training batch.
    pub batch_size: usize,
    /// Propagation epochs.
    pub epochs: usize,
    /// Vectors per write transaction when flushing.
    pub write_batch_size: usize,
    /// Seed for feature and weight initialization.
    pub seed: u64,
    /// Node property receiving the embeddings.
    pub column: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            dim: 128,
            batch_size: 512,
            epochs: 1,
            write_batch_size: 10_000,
            seed: 42,
            column: "embedding".to_string(),
        }
    }
}

impl TrainingConfig {
    /// Sets the embedding dimension.
    #[must_use]
    pub const fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the number of epochs.
    #[must_use]
    pub const fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Sets the write batch size.
    #[must_use]
    pub const fn with_write_batch_size(mut self, size: usize) -> Self {
        self.write_batch_size = size;
        self
    }

    /// Sets the seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the target column.
    #[must_use]
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
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

        if let Ok(val) = std::env::var("LAKEGRAPH_EMBEDDING_DIM")
            && let Ok(dim) = val.parse()
        {
            config.dim = dim;
        }
        if let Ok(val) = std::env::var("LAKEGRAPH_EMBEDDING_BATCH_SIZE")
            && let Ok(size) = val.parse()
        {
            config.batch_size = size;
        }
        if let Ok(val) = std::env::var("LAKEGRAPH_EMBEDDING_EPOCHS")
            && let Ok(epochs) = val.parse()
        {
            config.epochs = epochs;
        }
        if let Ok(val) = std::env::var("LAKEGRAPH_EMBEDDING_SEED")
            && let Ok(seed) = val.parse()
        {
            config.seed = seed;
        }

        config
    }

    fn validate(&self) -> Result<()> {
        if self.dim == 0 || self.batch_size == 0 || self.epochs == 0 || self.write_batch_size == 0
        {
            return Err(Error::InvalidInput(format!(
                "training parameters must be positive: dim={}, batch_size={}, epochs={}, write_batch_size={}",
                self.dim, self.batch_size, self.epochs, self.write_batch_size
            )));
        }
        Ok(())
    }
}

/// Outcome of a training run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingReport {
    /// Nodes that received an embedding.
    pub nodes: usize,
    /// Batches processed across all epochs.
    pub batches: usize,
    /// Epochs run.
    pub epochs: usize,
    /// Embedding dimension.
    pub dim: usize,
    /// Column written.
    pub column: String,
}

// ============================================================================
// Aggregation and projection
// ============================================================================

/// Averages neighbor features.
///
/// Row `r` of the result is the mean of `x[c]` over every edge `(r, c)`;
/// rows without edges stay zero.
#[must_use]
pub fn aggregate_neighbors(x: &Array2<f32>, edges: &[(usize, usize)]) -> Array2<f32> {
    let mut aggregated = Array2::<f32>::zeros(x.raw_dim());
    let mut degree = vec![0_usize; x.nrows()];

    for &(row, col) in edges {
        let mut target = aggregated.row_mut(row);
        target += &x.row(col);
        degree[row] += 1;
    }

    for (mut row, deg) in aggregated.axis_iter_mut(Axis(0)).zip(degree) {
        row /= deg.max(1) as f32;
    }
    aggregated
}

/// Two-layer projection `W2 · relu(W1 · a + b1) + b2` shared by all batches.
#[derive(Debug, Clone)]
pub struct Projection {
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
}

impl Projection {
    /// Initializes weights uniformly in `±1/√dim`.
    pub fn new<R: Rng>(dim: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (dim.max(1) as f32).sqrt();
        let uniform = Uniform::new_inclusive(-bound, bound);
        let mut sample =
            |shape: (usize, usize)| Array2::from_shape_simple_fn(shape, || rng.sample(&uniform));

        let w1 = sample((dim, dim));
        let b1 = sample((1, dim)).remove_axis(Axis(0));
        let w2 = sample((dim, dim));
        let b2 = sample((1, dim)).remove_axis(Axis(0));
        Self { w1, b1, w2, b2 }
    }

    /// Applies the projection to each row.
    #[must_use]
    pub fn forward(&self, input: &Array2<f32>) -> Array2<f32> {
        let mut hidden = input.dot(&self.w1.t()) + &self.b1;
        hidden.mapv_inplace(|v| v.max(0.0));
        hidden.dot(&self.w2.t()) + &self.b2
    }
}

// ============================================================================
// Trainer
// ============================================================================

/// Trains node embeddings and writes them to the store.
pub struct EmbeddingTrainer {
    store: Arc<GraphStore>,
    config: TrainingConfig,
    algorithm: EmbeddingAlgorithm,
}

impl EmbeddingTrainer {
    /// Creates a fast random projection trainer.
    #[must_use]
    pub const fn new(store: Arc<GraphStore>, config: TrainingConfig) -> Self {
        Self {
            store,
            config,
            algorithm: EmbeddingAlgorithm::FastRandomProjection,
        }
    }

    /// Creates a trainer for a named algorithm.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedAlgorithm`] for unknown names.
    pub fn with_algorithm(
        store: Arc<GraphStore>,
        config: TrainingConfig,
        algorithm: &str,
    ) -> Result<Self> {
        Ok(Self {
            store,
            config,
            algorithm: algorithm.parse()?,
        })
    }

    /// Returns the configured algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> EmbeddingAlgorithm {
        self.algorithm
    }

    /// Trains and writes embeddings.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for non-positive parameters
    /// - [`Error::Cancelled`] if `cancel` fires between batches
    /// - any store error raised while paging or writing
    #[instrument(skip(self, cancel), fields(algorithm = %self.algorithm, dim = self.config.dim))]
    pub fn train(&self, cancel: &CancellationToken) -> Result<TrainingReport> {
        self.config.validate()?;
        let start = Instant::now();

        let report = match self.algorithm {
            EmbeddingAlgorithm::FastRandomProjection => self.train_frp(cancel)?,
        };

        metrics::histogram!("embedding_training_duration_ms")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        tracing::info!(
            nodes = report.nodes,
            batches = report.batches,
            column = %report.column,
            "Embedding training complete"
        );
        Ok(report)
    }

    fn train_frp(&self, cancel: &CancellationToken) -> Result<TrainingReport> {
        let dim = self.config.dim;
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let projection = Projection::new(dim, &mut rng);

        let mut features: HashMap<NodeId, Array1<f32>> = HashMap::new();
        let mut outputs: BTreeMap<NodeId, Vec<f32>> = BTreeMap::new();
        let mut batches = 0;

        for epoch in 1..=self.config.epochs {
            let options = BatchOptions::new(self.config.batch_size)
                .with_edges(true)
                .with_reindex(true);

            for batch in NodeBatchIterator::new(Arc::clone(&self.store), options) {
                cancel.check()?;
                let batch = batch?;
                tracing::debug!(batch = batch.number, epoch, "Training batch");

                let mut x = Array2::<f32>::zeros((batch.index.len(), dim));
                for (position, id) in batch.index.ids().iter().enumerate() {
                    let feature = features.entry(*id).or_insert_with(|| {
                        Array1::from_shape_simple_fn(dim, || rng.sample(StandardNormal))
                    });
                    x.row_mut(position).assign(feature);
                }

                let edges = match &batch.edges {
                    Some(BatchEdges::Local(edges)) => edges.as_slice(),
                    _ => &[],
                };
                let updated = projection.forward(&aggregate_neighbors(&x, edges));

                for id in &batch.nodes {
                    if let Some(position) = batch.index.local(*id) {
                        outputs.insert(*id, updated.row(position).to_vec());
                    }
                }
                batches += 1;
                metrics::counter!("embedding_batches_total").increment(1);
            }

            features = outputs
                .iter()
                .map(|(id, vector)| (*id, Array1::from_vec(vector.clone())))
                .collect();
        }

        cancel.check()?;
        let nodes = self.store.update_embeddings_chunked(
            &outputs,
            dim,
            &self.config.column,
            self.config.write_batch_size,
        )?;

        Ok(TrainingReport {
            nodes,
            batches,
            epochs: self.config.epochs,
            dim,
            column: self.config.column.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use test_case::test_case;

    #[test_case("frp"; "short")]
    #[test_case("FastRP"; "mixed case")]
    #[test_case("fast_random_projection"; "long")]
    fn test_parse_algorithm(name: &str) {
        assert_eq!(
            name.parse::<EmbeddingAlgorithm>().unwrap(),
            EmbeddingAlgorithm::FastRandomProjection
        );
    }

    #[test]
    fn test_unknown_algorithm_is_rejected() {
        let store = Arc::new(GraphStore::in_memory().unwrap());
        let result = EmbeddingTrainer::with_algorithm(store, TrainingConfig::default(), "node2vec");
        assert!(matches!(result, Err(Error::UnsupportedAlgorithm(_))));
    }

    #[test]
    fn test_aggregate_neighbors_averages() {
        let x = array![[1.0_f32, 0.0], [0.0, 2.0], [4.0, 4.0]];
        let agg = aggregate_neighbors(&x, &[(0, 1), (0, 2), (2, 2)]);
        assert_eq!(agg.row(0).to_vec(), vec![2.0, 3.0]);
        assert_eq!(agg.row(1).to_vec(), vec![0.0, 0.0]);
        assert_eq!(agg.row(2).to_vec(), vec![4.0, 4.0]);
    }

    #[test]
    fn test_projection_shape_and_determinism() {
        let mut a = ChaCha8Rng::seed_from_u64(1);
        let mut b = ChaCha8Rng::seed_from_u64(1);
        let p = Projection::new(4, &mut a);
        let q = Projection::new(4, &mut b);

        let input = Array2::<f32>::ones((3, 4));
        let out = p.forward(&input);
        assert_eq!(out.dim(), (3, 4));
        assert_eq!(out, q.forward(&input));
    }

    #[test]
    fn test_invalid_config() {
        let store = Arc::new(GraphStore::in_memory().unwrap());
        let trainer = EmbeddingTrainer::new(store, TrainingConfig::default().with_dim(0));
        assert!(matches!(
            trainer.train(&CancellationToken::new()),
            Err(Error::InvalidInput(_))
        ));
    }
}
