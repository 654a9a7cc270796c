// Allow non-const functions that use f32 formatting (not const-stable yet)
#![allow(clippy::missing_const_for_fn)]

//! Property graph types.
//!
//! Nodes are typed records identified by a graph-wide unique integer id.
//! Edges are directed, labelled relations between two node ids and may carry
//! scalar properties.
//!
//! # Example
//!
//! ```rust
//! use lakegraph::models::graph::{Node, NodeId, PropertyValue};
//!
//! let node = Node::new(NodeId::new(7), "User")
//!     .with_property("user_id", PropertyValue::Text("u-7".to_string()))
//!     .with_property("country", PropertyValue::Null);
//!
//! assert_eq!(node.describe(), "(:User {user_id: \"u-7\"})");
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Graph-wide unique node identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct NodeId(i64);

impl NodeId {
    /// Creates a node ID from its raw value.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for NodeId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A scalar or vector property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Missing value.
    Null,
    /// Integer of any declared width.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Boolean.
    Bool(bool),
    /// Fixed-dimension vector (embeddings).
    Vector(Vec<f32>),
}

impl PropertyValue {
    /// Returns `true` for [`PropertyValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the value as an integer, if it is one.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as a float, widening integers.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Returns the value as text, if it is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Vector(v) => write!(f, "<vector[{}]>", v.len()),
        }
    }
}

/// A hydrated node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Node ID.
    pub id: NodeId,
    /// Node table (type label).
    pub table: String,
    /// Properties in declared column order.
    pub properties: Vec<(String, PropertyValue)>,
}

impl Node {
    /// Creates a node with no properties.
    #[must_use]
    pub fn new(id: NodeId, table: impl Into<String>) -> Self {
        Self {
            id,
            table: table.into(),
            properties: Vec::new(),
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.push((name.into(), value));
        self
    }

    /// Looks up a property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Renders the node for prompt context.
    ///
    /// Null and vector properties are omitted.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("(:{} {{{}}})", self.table, render_properties(&self.properties))
    }
}

/// Reference to a stored edge, including the direction it was traversed in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeRef {
    /// Relationship table.
    pub table: String,
    /// Row ID within the relationship table.
    pub row_id: i64,
    /// `true` when traversed from source to target.
    pub forward: bool,
}

/// A hydrated edge.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    /// Relationship table (label).
    pub label: String,
    /// Source node.
    pub source: NodeId,
    /// Target node.
    pub target: NodeId,
    /// Edge properties in declared column order.
    pub properties: Vec<(String, PropertyValue)>,
}

impl Edge {
    /// Renders the edge for prompt context.
    #[must_use]
    pub fn describe(&self) -> String {
        let props = render_properties(&self.properties);
        if props.is_empty() {
            format!("({})-[:{}]->({})", self.source, self.label, self.target)
        } else {
            format!(
                "({})-[:{} {{{props}}}]->({})",
                self.source, self.label, self.target
            )
        }
    }
}

fn render_properties(properties: &[(String, PropertyValue)]) -> String {
    properties
        .iter()
        .filter(|(_, value)| !value.is_null() && !matches!(value, PropertyValue::Vector(_)))
        .map(|(key, value)| format!("{key}: {value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A nearest-neighbor hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Node table the hit came from.
    pub table: String,
    /// Neighbor node.
    pub node_id: NodeId,
    /// Cosine distance to the query, in `[0, 2]`.
    pub distance: f32,
}

/// A path through the graph.
///
/// `nodes` has exactly one more element than `edges`; `edges[i]` connects
/// `nodes[i]` and `nodes[i + 1]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path {
    /// Visited nodes, starting node first.
    pub nodes: Vec<NodeId>,
    /// Traversed edges.
    pub edges: Vec<EdgeRef>,
}

impl Path {
    /// Creates a zero-hop path at `start`.
    #[must_use]
    pub fn start(start: NodeId) -> Self {
        Self {
            nodes: vec![start],
            edges: Vec::new(),
        }
    }

    /// Number of hops.
    #[must_use]
    pub fn hops(&self) -> usize {
        self.edges.len()
    }

    /// First node.
    #[must_use]
    pub fn source(&self) -> Option<NodeId> {
        self.nodes.first().copied()
    }

    /// Last node.
    #[must_use]
    pub fn target(&self) -> Option<NodeId> {
        self.nodes.last().copied()
    }
}

/// Inclusive hop-count bounds for path sampling and walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathBounds {
    /// Minimum hops.
    pub min_len: usize,
    /// Maximum hops.
    pub max_len: usize,
}

impl PathBounds {
    /// Creates validated bounds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `min_len > max_len`.
    pub fn new(min_len: usize, max_len: usize) -> Result<Self> {
        if min_len > max_len {
            return Err(Error::InvalidInput(format!(
                "path bounds: min length {min_len} exceeds max length {max_len}"
            )));
        }
        Ok(Self { min_len, max_len })
    }

    /// Returns `true` if `hops` is within bounds.
    #[must_use]
    pub const fn contains(&self, hops: usize) -> bool {
        hops >= self.min_len && hops <= self.max_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_describe_skips_null_and_vectors() {
        let node = Node::new(NodeId::new(3), "Track")
            .with_property("name", PropertyValue::Text("Song".to_string()))
            .with_property("year", PropertyValue::Int(1999))
            .with_property("artist", PropertyValue::Null)
            .with_property("embedding", PropertyValue::Vector(vec![0.1, 0.2]));

        assert_eq!(node.describe(), "(:Track {name: \"Song\", year: 1999})");
    }

    #[test]
    fn test_edge_describe() {
        let edge = Edge {
            label: "ListenedTo".to_string(),
            source: NodeId::new(1),
            target: NodeId::new(9),
            properties: vec![("play_count".to_string(), PropertyValue::Int(4))],
        };
        assert_eq!(edge.describe(), "(1)-[:ListenedTo {play_count: 4}]->(9)");

        let bare = Edge {
            properties: Vec::new(),
            ..edge
        };
        assert_eq!(bare.describe(), "(1)-[:ListenedTo]->(9)");
    }

    #[test]
    fn test_path_bounds() {
        assert!(PathBounds::new(3, 1).is_err());
        let bounds = PathBounds::new(1, 3).unwrap();
        assert!(!bounds.contains(0));
        assert!(bounds.contains(1));
        assert!(bounds.contains(3));
        assert!(!bounds.contains(4));
    }

    #[test]
    fn test_property_value_accessors() {
        assert_eq!(PropertyValue::Int(2).as_float(), Some(2.0));
        assert_eq!(PropertyValue::Text("x".to_string()).as_text(), Some("x"));
        assert!(PropertyValue::Null.is_null());
        assert_eq!(PropertyValue::Float(1.5).as_int(), None);
    }
}
