//! Shortest-path sampling and random walks.
//!
//! Both traverse relationships in either direction. Edge references keep the
//! direction each edge was traversed in.

// Allow cast_precision_loss for candidate counts recorded as histogram samples.
#![allow(clippy::cast_precision_loss)]

use super::sqlite::{
    GraphStore, acquire_lock, query_error, read_rel_tables, registry_table, rel_sql,
};
use crate::cancel::CancellationToken;
use crate::models::{EdgeRef, NodeId, Path, PathBounds, RelTableDef};
use crate::{Error, Result};
use rand::Rng;
use rand::seq::SliceRandom;
use rusqlite::{Connection, params};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::instrument;

type Parents = HashMap<NodeId, Vec<(NodeId, EdgeRef)>>;

impl GraphStore {
    /// Lists `(neighbor, edge)` pairs of a node, treating edges as undirected.
    ///
    /// Ordered by neighbor, then relationship table, then row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`] if a lookup fails.
    pub fn neighbors_undirected(&self, node: NodeId) -> Result<Vec<(NodeId, EdgeRef)>> {
        let conn = acquire_lock(&self.conn);
        let rels = read_rel_tables(&conn)?;
        undirected_neighbors(&conn, &rels, node)
    }

    /// Samples shortest paths from `sources` to `targets`.
    ///
    /// For every source a breadth-first search up to `bounds.max_len` hops
    /// enumerates all shortest paths to each target other than the source
    /// whose hop count lies within `bounds`. Enumeration stops after the
    /// configured `max_path_candidates`. `n` paths are then drawn uniformly
    /// without replacement; fewer are returned when fewer exist.
    ///
    /// # Errors
    ///
    /// - [`Error::Query`] if a neighbor lookup fails
    /// - [`Error::Cancelled`] if `cancel` fires between sources or search levels
    #[instrument(skip(self, sources, targets, rng, cancel), fields(
        sources = sources.len(),
        targets = targets.len(),
        min_len = bounds.min_len,
        max_len = bounds.max_len
    ))]
    pub fn sample_shortest_paths<R: Rng>(
        &self,
        sources: &[NodeId],
        targets: &[NodeId],
        n: usize,
        bounds: PathBounds,
        rng: &mut R,
        cancel: &CancellationToken,
    ) -> Result<Vec<Path>> {
        let sources: BTreeSet<NodeId> = sources.iter().copied().collect();
        let targets: BTreeSet<NodeId> = targets.iter().copied().collect();
        if n == 0 || sources.is_empty() || targets.is_empty() {
            return Ok(Vec::new());
        }

        let cap = self.config.max_path_candidates;
        let mut candidates = Vec::new();
        {
            let conn = acquire_lock(&self.conn);
            let rels = read_rel_tables(&conn)?;

            'sources: for &source in &sources {
                cancel.check()?;
                let (depth, parents) = bfs(&conn, &rels, source, bounds.max_len, cancel)?;

                for &target in &targets {
                    if target == source {
                        continue;
                    }
                    let Some(&hops) = depth.get(&target) else {
                        continue;
                    };
                    if !bounds.contains(hops) {
                        continue;
                    }
                    collect_paths(
                        target,
                        source,
                        &parents,
                        &mut Vec::new(),
                        &mut Vec::new(),
                        &mut candidates,
                        cap,
                    );
                    if candidates.len() >= cap {
                        tracing::warn!(cap, "Shortest path enumeration hit the candidate cap");
                        break 'sources;
                    }
                }
            }
        }

        let available = candidates.len();
        let sampled: Vec<Path> = candidates
            .choose_multiple(rng, n.min(available))
            .cloned()
            .collect();
        tracing::debug!(available, sampled = sampled.len(), "Sampled shortest paths");
        metrics::histogram!("graph_store_path_candidates").record(available as f64);
        Ok(sampled)
    }

    /// Takes `n` random walks from `source`.
    ///
    /// Each walk draws its length uniformly from `bounds`. A step picks
    /// uniformly among distinct neighbors other than the node it just came
    /// from, then records one of the edges reaching it. The walk ends early
    /// when no such neighbor is available.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if `source` does not exist
    /// - [`Error::Query`] if a neighbor lookup fails
    #[instrument(skip(self, rng), fields(min_len = bounds.min_len, max_len = bounds.max_len))]
    pub fn random_walk<R: Rng>(
        &self,
        source: NodeId,
        n: usize,
        bounds: PathBounds,
        rng: &mut R,
    ) -> Result<Vec<Path>> {
        let conn = acquire_lock(&self.conn);
        if registry_table(&conn, source)?.is_none() {
            return Err(Error::NotFound(format!("node {source}")));
        }
        let rels = read_rel_tables(&conn)?;

        let mut walks = Vec::with_capacity(n);
        for _ in 0..n {
            let length = rng.gen_range(bounds.min_len..=bounds.max_len);
            let mut path = Path::start(source);
            let mut previous: Option<NodeId> = None;
            let mut current = source;

            for _ in 0..length {
                let options = step_options(undirected_neighbors(&conn, &rels, current)?, previous);
                let Some((next, edges)) = options.choose(rng) else {
                    break;
                };
                let Some(edge) = edges.choose(rng).cloned() else {
                    break;
                };
                let next = *next;
                path.nodes.push(next);
                path.edges.push(edge);
                previous = Some(current);
                current = next;
            }
            walks.push(path);
        }

        Ok(walks)
    }
}

fn undirected_neighbors(
    conn: &Connection,
    rels: &[RelTableDef],
    node: NodeId,
) -> Result<Vec<(NodeId, EdgeRef)>> {
    let mut neighbors = Vec::new();

    for rel in rels {
        for (forward, near, far) in [
            (true, "source_id", "target_id"),
            (false, "target_id", "source_id"),
        ] {
            let sql = format!(
                "SELECT rowid, {far} FROM {} WHERE {near} = ?1",
                rel_sql(&rel.name)
            );
            let mut stmt = conn.prepare_cached(&sql).map_err(query_error(&sql))?;
            let rows = stmt
                .query_map(params![node.get()], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(query_error(&sql))?;
            for row in rows {
                let (row_id, other) = row.map_err(query_error(&sql))?;
                neighbors.push((
                    NodeId::new(other),
                    EdgeRef {
                        table: rel.name.clone(),
                        row_id,
                        forward,
                    },
                ));
            }
        }
    }

    neighbors.sort();
    Ok(neighbors)
}

/// Groups neighbors other than `previous` with the edges reaching them.
///
/// A walk step draws from the groups, so a neighbor reached over several
/// edges is no more likely than any other.
fn step_options(
    neighbors: Vec<(NodeId, EdgeRef)>,
    previous: Option<NodeId>,
) -> Vec<(NodeId, Vec<EdgeRef>)> {
    let mut grouped: BTreeMap<NodeId, Vec<EdgeRef>> = BTreeMap::new();
    for (next, edge) in neighbors {
        if Some(next) != previous {
            grouped.entry(next).or_default().push(edge);
        }
    }
    grouped.into_iter().collect()
}

/// Breadth-first search recording every shortest-path predecessor.
fn bfs(
    conn: &Connection,
    rels: &[RelTableDef],
    source: NodeId,
    max_len: usize,
    cancel: &CancellationToken,
) -> Result<(HashMap<NodeId, usize>, Parents)> {
    let mut depth = HashMap::from([(source, 0)]);
    let mut parents = Parents::new();
    let mut frontier = vec![source];

    for level in 1..=max_len {
        cancel.check()?;
        let mut next = Vec::new();
        for &node in &frontier {
            for (neighbor, edge) in undirected_neighbors(conn, rels, node)? {
                match depth.get(&neighbor) {
                    None => {
                        depth.insert(neighbor, level);
                        parents.insert(neighbor, vec![(node, edge)]);
                        next.push(neighbor);
                    },
                    Some(&d) if d == level => {
                        parents.entry(neighbor).or_default().push((node, edge));
                    },
                    Some(_) => {},
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }

    Ok((depth, parents))
}

/// Walks predecessor lists back from `node` to `source`, emitting each path.
fn collect_paths(
    node: NodeId,
    source: NodeId,
    parents: &Parents,
    nodes: &mut Vec<NodeId>,
    edges: &mut Vec<EdgeRef>,
    out: &mut Vec<Path>,
    cap: usize,
) {
    if out.len() >= cap {
        return;
    }
    nodes.push(node);
    if node == source {
        out.push(Path {
            nodes: nodes.iter().rev().copied().collect(),
            edges: edges.iter().rev().cloned().collect(),
        });
    } else if let Some(predecessors) = parents.get(&node) {
        for (predecessor, edge) in predecessors {
            edges.push(edge.clone());
            collect_paths(*predecessor, source, parents, nodes, edges, out, cap);
            edges.pop();
        }
    }
    nodes.pop();
}
