//! Vector index implementations.

mod usearch;

pub use usearch::UsearchIndex;
