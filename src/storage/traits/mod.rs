//! Storage backend traits.

mod vector;

pub use vector::{VectorIndex, cosine_distance};
