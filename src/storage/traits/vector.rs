//! Vector index trait.
//!
//! Provides the abstraction layer for similarity indexes over one embedding
//! column of one node table.
//!
//! # Available Implementations
//!
//! | Index | Use Case | Configuration |
//! |-------|----------|---------------|
//! | `UsearchIndex` (flat) | Default; exact brute-force search | No extra deps |
//! | `UsearchIndex` (HNSW) | Large tables; approximate search | `usearch-hnsw` feature |
//!
//! # Distances
//!
//! All indexes report cosine distance `1 - cos(a, b)` in `[0, 2]`, ordered
//! ascending. A zero vector has distance `1.0` to everything.
//!
//! # Usage Example
//!
//! ```rust,ignore
//! use lakegraph::storage::vector::UsearchIndex;
//! use lakegraph::storage::traits::VectorIndex;
//! use lakegraph::NodeId;
//!
//! let mut index = UsearchIndex::new(3)?;
//! index.insert(NodeId::new(1), &[1.0, 0.0, 0.0])?;
//! index.insert(NodeId::new(2), &[0.0, 1.0, 0.0])?;
//!
//! let hits = index.search(&[1.0, 0.1, 0.0], 1)?;
//! assert_eq!(hits[0].0, NodeId::new(1));
//! ```

use crate::Result;
use crate::models::NodeId;

/// Trait for vector similarity indexes.
///
/// Indexes are filled once with [`insert`](VectorIndex::insert) and then
/// shared read-only across threads, so implementations must be
/// `Send + Sync`.
pub trait VectorIndex: Send + Sync {
    /// The dimensionality of indexed vectors.
    fn dimensions(&self) -> usize;

    /// Inserts or replaces the vector for a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the vector has the wrong dimension or the
    /// underlying index rejects it.
    fn insert(&mut self, id: NodeId, vector: &[f32]) -> Result<()>;

    /// Returns up to `limit` nodes ordered by ascending cosine distance.
    ///
    /// # Errors
    ///
    /// Returns an error if the query has the wrong dimension or the search
    /// fails.
    fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(NodeId, f32)>>;

    /// Returns the number of indexed vectors.
    fn len(&self) -> usize;

    /// Returns `true` if nothing is indexed.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cosine distance between two equally sized vectors.
///
/// Returns `1.0` when either vector has zero norm.
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }

    (1.0 - dot / (norm_a * norm_b)).clamp(0.0, 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_distance() {
        let v1 = [1.0, 0.0, 0.0];
        assert!(cosine_distance(&v1, &v1).abs() < 1e-6);

        let v2 = [0.0, 1.0, 0.0];
        assert!((cosine_distance(&v1, &v2) - 1.0).abs() < 1e-6);

        let v3 = [-1.0, 0.0, 0.0];
        assert!((cosine_distance(&v1, &v3) - 2.0).abs() < 1e-6);

        let zero = [0.0, 0.0, 0.0];
        assert!((cosine_distance(&v1, &zero) - 1.0).abs() < 1e-6);
    }
}
