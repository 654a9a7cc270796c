//! Storage layer.
//!
//! This module provides the two storage concerns of the engine:
//! - **Graph**: the property graph itself (`SQLite`), including schema catalog,
//!   bulk import, embeddings and traversal
//! - **Vector**: similarity indexes over embedding columns (usearch or flat)

// Allow cast precision loss for distance calculations where exact precision is not critical.
#![allow(clippy::cast_precision_loss)]
// Allow significant_drop_tightening - dropping database connections slightly early
// provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]
// Allow match_same_arms for explicit enum handling.
#![allow(clippy::match_same_arms)]

pub mod graph;
pub mod traits;
pub mod vector;

pub use graph::{GraphStore, ImportEntry, OpenMode, StoreConfig, VectorIndexInfo, index_name};
pub use traits::VectorIndex;
pub use vector::UsearchIndex;
