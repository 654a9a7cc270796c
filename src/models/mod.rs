//! Data models for lakegraph.
//!
//! This module contains the graph data structures shared by storage and services.

pub mod graph;
pub mod schema;

pub use graph::{Edge, EdgeRef, Neighbor, Node, NodeId, Path, PathBounds, PropertyValue};
pub use schema::{Cardinality, ColumnDef, ColumnType, NodeTableDef, RelTableDef, SchemaDefinition};
