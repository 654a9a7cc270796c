//! Paged node batches with incident edges.
//!
//! [`NodeBatchIterator`] pages through all nodes of a [`GraphStore`] in
//! ascending id order. Each [`Batch`] carries the page's canonical nodes,
//! optionally the out-edges of those nodes, and a [`LocalIndex`] over every
//! node the batch touches (canonical nodes plus edge endpoints).
//!
//! # Example
//!
//! ```rust,ignore
//! use lakegraph::services::{BatchOptions, NodeBatchIterator};
//!
//! let batches = NodeBatchIterator::new(store, BatchOptions::new(2).with_edges(true));
//! for batch in batches {
//!     let batch = batch?;
//!     println!("{} nodes, {} involved", batch.nodes.len(), batch.index.len());
//! }
//! ```

use crate::models::NodeId;
use crate::storage::GraphStore;
use crate::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::instrument;

// ============================================================================
// Local Index
// ============================================================================

/// Bijection between global node ids and dense local positions.
///
/// Positions follow ascending global id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalIndex {
    globals: Vec<NodeId>,
    locals: HashMap<NodeId, usize>,
}

impl LocalIndex {
    /// Builds an index from strictly ascending ids.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the ids are not strictly ascending,
    /// which also rules out duplicates.
    pub fn new(ids: Vec<NodeId>) -> Result<Self> {
        if let Some(pair) = ids.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(Error::InvalidInput(format!(
                "local index ids must be strictly ascending: {} then {}",
                pair[0], pair[1]
            )));
        }

        let locals = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        Ok(Self {
            globals: ids,
            locals,
        })
    }

    /// Builds an index from ids in any order, dropping duplicates.
    ///
    /// The deduplicated ids go through [`LocalIndex::new`], so the same
    /// bijection check applies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the ordered ids fail that check.
    pub fn from_unsorted(ids: impl IntoIterator<Item = NodeId>) -> Result<Self> {
        let sorted: BTreeSet<NodeId> = ids.into_iter().collect();
        Self::new(sorted.into_iter().collect())
    }

    /// Local position of a global id.
    #[must_use]
    pub fn local(&self, id: NodeId) -> Option<usize> {
        self.locals.get(&id).copied()
    }

    /// Global id at a local position.
    #[must_use]
    pub fn global(&self, position: usize) -> Option<NodeId> {
        self.globals.get(position).copied()
    }

    /// Global ids in local order.
    #[must_use]
    pub fn ids(&self) -> &[NodeId] {
        &self.globals
    }

    /// Number of indexed nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.globals.len()
    }

    /// Returns `true` if the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
    }
}

// ============================================================================
// Batches
// ============================================================================

/// Options for [`NodeBatchIterator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Canonical nodes per batch.
    pub batch_size: usize,
    /// Whether to fetch out-edges of the canonical nodes.
    pub include_edges: bool,
    /// Whether to rewrite edges into local positions.
    pub reindex_edges: bool,
}

impl BatchOptions {
    /// Creates options without edges.
    #[must_use]
    pub const fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            include_edges: false,
            reindex_edges: false,
        }
    }

    /// Sets whether edges are fetched.
    #[must_use]
    pub const fn with_edges(mut self, include_edges: bool) -> Self {
        self.include_edges = include_edges;
        self
    }

    /// Sets whether edges are rewritten into local positions.
    #[must_use]
    pub const fn with_reindex(mut self, reindex_edges: bool) -> Self {
        self.reindex_edges = reindex_edges;
        self
    }
}

/// Edges of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEdges {
    /// `(source, target)` as global node ids.
    Global(Vec<(NodeId, NodeId)>),
    /// `(source, target)` as positions in the batch's [`LocalIndex`].
    Local(Vec<(usize, usize)>),
}

impl BatchEdges {
    /// Number of edges.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Global(edges) => edges.len(),
            Self::Local(edges) => edges.len(),
        }
    }

    /// Returns `true` if there are no edges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One page of nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Zero-based batch number.
    pub number: usize,
    /// Canonical nodes in ascending order.
    pub nodes: Vec<NodeId>,
    /// Out-edges of the canonical nodes, when requested.
    pub edges: Option<BatchEdges>,
    /// Index over canonical nodes and edge endpoints.
    pub index: LocalIndex,
}

impl Batch {
    /// Rewrites global edges into local positions, in place.
    ///
    /// Does nothing if the edges are already local or absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if an endpoint is missing from the index.
    pub fn reindex(&mut self) -> Result<()> {
        let Some(BatchEdges::Global(edges)) = &self.edges else {
            return Ok(());
        };

        let local = edges
            .iter()
            .map(|(source, target)| {
                let position = |id: NodeId| {
                    self.index.local(id).ok_or_else(|| {
                        Error::InvalidInput(format!("node {id} is not in the batch index"))
                    })
                };
                Ok((position(*source)?, position(*target)?))
            })
            .collect::<Result<Vec<_>>>()?;

        self.edges = Some(BatchEdges::Local(local));
        Ok(())
    }

    /// Returns `true` if `id` is one of the batch's canonical nodes.
    #[must_use]
    pub fn is_canonical(&self, id: NodeId) -> bool {
        self.nodes.binary_search(&id).is_ok()
    }
}

/// Iterator over node batches.
///
/// Yields `Result<Batch>`. The iterator is fused: after the first empty page
/// or the first error it returns `None`.
pub struct NodeBatchIterator {
    store: Arc<GraphStore>,
    options: BatchOptions,
    offset: usize,
    number: usize,
    done: bool,
}

impl NodeBatchIterator {
    /// Creates an iterator starting at the first node.
    #[must_use]
    pub fn new(store: Arc<GraphStore>, options: BatchOptions) -> Self {
        Self {
            store,
            options,
            offset: 0,
            number: 0,
            done: false,
        }
    }

    /// Number of batches the store currently yields.
    ///
    /// # Errors
    ///
    /// Returns an error if the node count cannot be read.
    pub fn batch_count(&self) -> Result<usize> {
        let size = self.options.batch_size.max(1);
        Ok(self.store.count_nodes()?.div_ceil(size))
    }

    #[instrument(skip(self), fields(batch = self.number, offset = self.offset))]
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.options.batch_size == 0 {
            return Err(Error::InvalidInput(
                "batch size must be positive".to_string(),
            ));
        }

        let nodes = self
            .store
            .query_node_batch(self.offset, self.options.batch_size)?;
        if nodes.is_empty() {
            return Ok(None);
        }

        let edges = if self.options.include_edges {
            Some(self.store.query_neighbors(&nodes)?)
        } else {
            None
        };

        let index = LocalIndex::from_unsorted(
            nodes.iter().copied().chain(
                edges
                    .iter()
                    .flatten()
                    .flat_map(|(source, target)| [*source, *target]),
            ),
        )?;

        let mut batch = Batch {
            number: self.number,
            nodes,
            edges: edges.map(BatchEdges::Global),
            index,
        };
        if self.options.reindex_edges {
            batch.reindex()?;
        }

        self.offset += self.options.batch_size;
        self.number += 1;
        metrics::counter!("batch_iterator_batches_total").increment(1);
        Ok(Some(batch))
    }
}

impl Iterator for NodeBatchIterator {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}

impl std::iter::FusedIterator for NodeBatchIterator {}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[i64]) -> Vec<NodeId> {
        raw.iter().copied().map(NodeId::new).collect()
    }

    #[test]
    fn test_local_index_bijection() {
        let index = LocalIndex::new(ids(&[3, 7, 9])).unwrap();
        assert_eq!(index.local(NodeId::new(7)), Some(1));
        assert_eq!(index.global(2), Some(NodeId::new(9)));
        assert_eq!(index.local(NodeId::new(4)), None);
        for position in 0..index.len() {
            let id = index.global(position).unwrap();
            assert_eq!(index.local(id), Some(position));
        }
    }

    #[test]
    fn test_local_index_rejects_unsorted_and_duplicates() {
        assert!(LocalIndex::new(ids(&[3, 1])).is_err());
        assert!(LocalIndex::new(ids(&[1, 1])).is_err());
        assert!(LocalIndex::new(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn test_from_unsorted_dedups() {
        let index = LocalIndex::from_unsorted(ids(&[5, 1, 5, 3])).unwrap();
        assert_eq!(index.ids(), ids(&[1, 3, 5]).as_slice());
        for (position, id) in index.ids().iter().enumerate() {
            assert_eq!(index.local(*id), Some(position));
            assert_eq!(index.global(position), Some(*id));
        }
    }

    #[test]
    fn test_reindex_edges() {
        let mut batch = Batch {
            number: 0,
            nodes: ids(&[1, 2]),
            edges: Some(BatchEdges::Global(vec![
                (NodeId::new(1), NodeId::new(10)),
                (NodeId::new(2), NodeId::new(1)),
            ])),
            index: LocalIndex::from_unsorted(ids(&[1, 2, 10])).unwrap(),
        };
        batch.reindex().unwrap();
        assert_eq!(batch.edges, Some(BatchEdges::Local(vec![(0, 2), (1, 0)])));

        // Already local: no change
        batch.reindex().unwrap();
        assert_eq!(batch.edges.as_ref().map(BatchEdges::len), Some(2));
    }

    #[test]
    fn test_reindex_rejects_missing_endpoint() {
        let mut batch = Batch {
            number: 0,
            nodes: ids(&[1]),
            edges: Some(BatchEdges::Global(vec![(NodeId::new(1), NodeId::new(4))])),
            index: LocalIndex::from_unsorted(ids(&[1])).unwrap(),
        };
        assert!(batch.reindex().is_err());
    }

    #[test]
    fn test_empty_store_yields_nothing() {
        let store = Arc::new(GraphStore::in_memory().unwrap());
        let mut batches = NodeBatchIterator::new(store, BatchOptions::new(4));
        assert!(batches.next().is_none());
        assert!(batches.next().is_none());
    }

    #[test]
    fn test_zero_batch_size_errors_once() {
        let store = Arc::new(GraphStore::in_memory().unwrap());
        let mut batches = NodeBatchIterator::new(store, BatchOptions::new(0));
        assert!(matches!(batches.next(), Some(Err(Error::InvalidInput(_)))));
        assert!(batches.next().is_none());
    }
}
