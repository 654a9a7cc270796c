//! Command handlers module.
//!
//! - `graph.rs`: graph loading, embedding, indexing and retrieval
//! - `monitor.rs`: rolling inference statistics

mod graph;
mod monitor;

pub use graph::{GraphAction, cmd_graph};
pub use monitor::{MonitorAction, cmd_monitor};
