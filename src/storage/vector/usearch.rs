//! usearch HNSW vector index.
//!
//! Provides approximate nearest neighbor search using a Hierarchical
//! Navigable Small World (HNSW) graph structure.
//!
//! When the `usearch-hnsw` feature is enabled, this uses the native usearch
//! library. Otherwise, an exact brute-force fallback is used.

use crate::models::NodeId;
use crate::storage::traits::VectorIndex;
use crate::{Error, Result};
use std::collections::HashMap;

/// HNSW connectivity parameter (M).
/// Higher values improve recall but use more memory.
#[cfg(feature = "usearch-hnsw")]
const HNSW_CONNECTIVITY: usize = 16;

/// HNSW expansion factor for construction (`ef_construction`).
#[cfg(feature = "usearch-hnsw")]
const HNSW_EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search (`ef`).
#[cfg(feature = "usearch-hnsw")]
const HNSW_EXPANSION_SEARCH: usize = 64;

/// Initial capacity reserved for new indexes.
#[cfg(feature = "usearch-hnsw")]
const INITIAL_CAPACITY: usize = 1024;

fn validate_dimensions(expected: usize, vector: &[f32]) -> Result<()> {
    if vector.len() != expected {
        return Err(Error::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

// ============================================================================
// Native usearch Implementation (with feature)
// ============================================================================

#[cfg(feature = "usearch-hnsw")]
mod native {
    use super::{
        Error, HNSW_CONNECTIVITY, HNSW_EXPANSION_ADD, HNSW_EXPANSION_SEARCH, HashMap,
        INITIAL_CAPACITY, NodeId, Result, VectorIndex, validate_dimensions,
    };
    use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

    /// Native usearch-based index using HNSW.
    pub struct UsearchIndex {
        dimensions: usize,
        index: Index,
        /// Mapping from node ID to usearch key.
        id_to_key: HashMap<NodeId, u64>,
        /// Mapping from usearch key to node ID.
        key_to_id: HashMap<u64, NodeId>,
        next_key: u64,
    }

    impl UsearchIndex {
        /// Creates an empty index.
        ///
        /// # Errors
        ///
        /// Returns an error if the index cannot be created.
        pub fn new(dimensions: usize) -> Result<Self> {
            let options = IndexOptions {
                dimensions,
                metric: MetricKind::Cos,
                quantization: ScalarKind::F32,
                connectivity: HNSW_CONNECTIVITY,
                expansion_add: HNSW_EXPANSION_ADD,
                expansion_search: HNSW_EXPANSION_SEARCH,
                multi: false,
            };

            let index = Index::new(&options).map_err(|e| Error::OperationFailed {
                operation: "create_usearch_index".to_string(),
                cause: e.to_string(),
            })?;

            index
                .reserve(INITIAL_CAPACITY)
                .map_err(|e| Error::OperationFailed {
                    operation: "reserve_usearch_capacity".to_string(),
                    cause: e.to_string(),
                })?;

            Ok(Self {
                dimensions,
                index,
                id_to_key: HashMap::new(),
                key_to_id: HashMap::new(),
                next_key: 1,
            })
        }

        fn get_or_create_key(&mut self, id: NodeId) -> u64 {
            if let Some(&key) = self.id_to_key.get(&id) {
                return key;
            }

            let key = self.next_key;
            self.next_key += 1;
            self.id_to_key.insert(id, key);
            self.key_to_id.insert(key, id);
            key
        }

        fn ensure_capacity(&self) -> Result<()> {
            if self.index.size() < self.index.capacity() {
                return Ok(());
            }
            let target = (self.index.capacity() * 2).max(INITIAL_CAPACITY);
            self.index
                .reserve(target)
                .map_err(|e| Error::OperationFailed {
                    operation: "reserve_usearch_capacity".to_string(),
                    cause: e.to_string(),
                })
        }
    }

    impl VectorIndex for UsearchIndex {
        fn dimensions(&self) -> usize {
            self.dimensions
        }

        fn insert(&mut self, id: NodeId, vector: &[f32]) -> Result<()> {
            validate_dimensions(self.dimensions, vector)?;

            let key = self.get_or_create_key(id);

            // usearch doesn't allow duplicate keys, so remove first if exists
            if self.index.contains(key) {
                let _ = self.index.remove(key);
            }

            self.ensure_capacity()?;
            self.index
                .add(key, vector)
                .map_err(|e| Error::OperationFailed {
                    operation: "usearch_add".to_string(),
                    cause: e.to_string(),
                })
        }

        fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(NodeId, f32)>> {
            validate_dimensions(self.dimensions, query)?;

            if self.index.size() == 0 || limit == 0 {
                return Ok(Vec::new());
            }

            let matches = self
                .index
                .search(query, limit)
                .map_err(|e| Error::OperationFailed {
                    operation: "usearch_search".to_string(),
                    cause: e.to_string(),
                })?;

            let results = matches
                .keys
                .iter()
                .zip(matches.distances.iter())
                .filter_map(|(key, &distance)| {
                    let id = self.key_to_id.get(key)?;
                    // Zero-norm vectors produce NaN under the cosine metric
                    let distance = if distance.is_finite() {
                        distance.clamp(0.0, 2.0)
                    } else {
                        1.0
                    };
                    Some((*id, distance))
                })
                .collect();

            Ok(results)
        }

        fn len(&self) -> usize {
            self.index.size()
        }
    }
}

// ============================================================================
// Fallback Implementation (without feature)
// ============================================================================

#[cfg(not(feature = "usearch-hnsw"))]
mod fallback {
    use super::{HashMap, NodeId, Result, VectorIndex, validate_dimensions};
    use crate::storage::traits::cosine_distance;

    /// Exact brute-force index.
    ///
    /// Used when the `usearch-hnsw` feature is not enabled. Search is O(n) per
    /// query, which is fine for the table sizes this crate targets without the
    /// native index.
    pub struct UsearchIndex {
        dimensions: usize,
        ids: Vec<NodeId>,
        vectors: Vec<Vec<f32>>,
        positions: HashMap<NodeId, usize>,
    }

    impl UsearchIndex {
        /// Creates an empty index.
        ///
        /// # Errors
        ///
        /// Never fails; the signature matches the native index.
        #[allow(clippy::unnecessary_wraps)]
        pub fn new(dimensions: usize) -> Result<Self> {
            Ok(Self {
                dimensions,
                ids: Vec::new(),
                vectors: Vec::new(),
                positions: HashMap::new(),
            })
        }
    }

    impl VectorIndex for UsearchIndex {
        fn dimensions(&self) -> usize {
            self.dimensions
        }

        fn insert(&mut self, id: NodeId, vector: &[f32]) -> Result<()> {
            validate_dimensions(self.dimensions, vector)?;

            if let Some(&pos) = self.positions.get(&id) {
                self.vectors[pos] = vector.to_vec();
            } else {
                self.positions.insert(id, self.ids.len());
                self.ids.push(id);
                self.vectors.push(vector.to_vec());
            }
            Ok(())
        }

        fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(NodeId, f32)>> {
            validate_dimensions(self.dimensions, query)?;

            let mut scored: Vec<(NodeId, f32)> = self
                .ids
                .iter()
                .zip(self.vectors.iter())
                .map(|(id, vector)| (*id, cosine_distance(query, vector)))
                .collect();

            scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            scored.truncate(limit);
            Ok(scored)
        }

        fn len(&self) -> usize {
            self.ids.len()
        }
    }
}

// ============================================================================
// Public Re-exports
// ============================================================================

#[cfg(feature = "usearch-hnsw")]
pub use native::UsearchIndex;

#[cfg(not(feature = "usearch-hnsw"))]
pub use fallback::UsearchIndex;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(angle: f32) -> Vec<f32> {
        vec![angle.cos(), angle.sin()]
    }

    #[test]
    fn test_search_orders_by_distance() {
        let mut index = UsearchIndex::new(2).unwrap();
        index.insert(NodeId::new(1), &unit(0.0)).unwrap();
        index.insert(NodeId::new(2), &unit(0.5)).unwrap();
        index.insert(NodeId::new(3), &unit(1.5)).unwrap();

        let results = index.search(&unit(0.1), 3).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, NodeId::new(1));
        assert_eq!(results[1].0, NodeId::new(2));
        assert_eq!(results[2].0, NodeId::new(3));
        assert!(results.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn test_search_limit() {
        let mut index = UsearchIndex::new(2).unwrap();
        for i in 0..10 {
            #[allow(clippy::cast_precision_loss)]
            let angle = i as f32 * 0.1;
            index.insert(NodeId::new(i), &unit(angle)).unwrap();
        }
        assert_eq!(index.len(), 10);
        assert_eq!(index.search(&unit(0.0), 4).unwrap().len(), 4);
    }

    #[test]
    fn test_insert_replaces_existing() {
        let mut index = UsearchIndex::new(2).unwrap();
        index.insert(NodeId::new(1), &[1.0, 0.0]).unwrap();
        index.insert(NodeId::new(1), &[0.0, 1.0]).unwrap();
        assert_eq!(index.len(), 1);

        let results = index.search(&[0.0, 1.0], 1).unwrap();
        assert!(results[0].1 < 1e-3);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = UsearchIndex::new(3).unwrap();
        let err = index.insert(NodeId::new(1), &[1.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn test_empty_index() {
        let index = UsearchIndex::new(2).unwrap();
        assert!(index.is_empty());
        assert!(index.search(&[1.0, 0.0], 5).unwrap().is_empty());
    }
}
