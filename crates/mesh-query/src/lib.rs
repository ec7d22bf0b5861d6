// SPDX-License-Identifier: Apache-2.0
//! Read-only graph traversal (spec.md §4.5): path finding, depth-bounded
//! BFS/DFS with a stop-early visitor, neighbor rings, subgraph extraction,
//! and connected components. Pure computation over a [`GraphStore`]; no
//! writes, no substrate access of its own.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use mesh_graph::{Edge, GraphError, GraphStore, Node};
use mesh_substrate::Substrate;

/// Options shared by the single-target traversal operations.
#[derive(Debug, Clone)]
pub struct TraversalOptions {
    /// Maximum number of hops from the start node.
    pub max_depth: usize,
    /// Restrict traversal to these edge types. `None` allows any type.
    pub edge_types: Option<Vec<String>>,
    /// `true` follows edges only in their stored direction (`from -> to`).
    /// `false` treats the graph as undirected.
    pub directed: bool,
}

impl Default for TraversalOptions {
    fn default() -> Self {
        Self {
            max_depth: 10,
            edge_types: None,
            directed: true,
        }
    }
}

/// Options for [`QueryEngine::find_paths`].
#[derive(Debug, Clone)]
pub struct PathOptions {
    /// Maximum path length in edges.
    pub max_depth: usize,
    /// Stop once this many paths have been found.
    pub max_paths: usize,
    /// Restrict traversal to these edge types. `None` allows any type.
    pub edge_types: Option<Vec<String>>,
    /// `true` follows edges only in their stored direction.
    pub directed: bool,
}

impl Default for PathOptions {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_paths: 10,
            edge_types: None,
            directed: true,
        }
    }
}

/// Options for [`QueryEngine::extract_subgraph`].
#[derive(Debug, Clone)]
pub struct SubgraphOptions {
    /// Maximum BFS depth from the center node.
    pub max_depth: usize,
    /// Restrict included nodes to these types. `None` allows any type.
    pub node_types: Option<Vec<String>>,
    /// Restrict included edges to these types. `None` allows any type.
    pub edge_types: Option<Vec<String>>,
    /// `true` expands the frontier only along outgoing edges.
    pub directed: bool,
}

impl Default for SubgraphOptions {
    fn default() -> Self {
        Self {
            max_depth: 2,
            node_types: None,
            edge_types: None,
            directed: true,
        }
    }
}

/// An ordered walk through the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    /// Nodes visited, in order, including the start and end node.
    pub nodes: Vec<Node>,
    /// Edges traversed, in order. `edges.len() == nodes.len() - 1`.
    pub edges: Vec<Edge>,
    /// Sum of `edges[*].weight`.
    pub weight: f64,
    /// `edges.len()`.
    pub length: usize,
}

/// The result of [`QueryEngine::extract_subgraph`].
#[derive(Debug, Clone, PartialEq)]
pub struct Subgraph {
    /// Nodes within the requested depth and type filter.
    pub nodes: Vec<Node>,
    /// Edges with both endpoints in `nodes`, matching the type filter.
    pub edges: Vec<Edge>,
}

/// Errors surfaced by [`QueryEngine`] operations.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The underlying graph store failed to answer a read.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Read-only traversal engine over a [`GraphStore`].
pub struct QueryEngine<S> {
    graph: Arc<GraphStore<S>>,
}

impl<S: Substrate> QueryEngine<S> {
    /// Build an engine over a shared graph store handle.
    pub fn new(graph: Arc<GraphStore<S>>) -> Self {
        Self { graph }
    }

    /// Enumerate simple paths (no repeated nodes within a path) from `from`
    /// to `to` via DFS, returning up to `opts.max_paths` in discovery order.
    ///
    /// # Errors
    /// Returns [`QueryError`] on a graph store read failure.
    pub async fn find_paths(&self, from: &str, to: &str, opts: &PathOptions) -> Result<Vec<Path>, QueryError> {
        let mut results = Vec::new();
        let Some(start_node) = self.graph.get_node(from).await? else {
            return Ok(results);
        };
        if opts.max_paths == 0 {
            return Ok(results);
        }

        let mut visited: HashSet<String> = HashSet::from([from.to_string()]);
        let mut node_path = vec![start_node];
        let mut edge_path: Vec<Edge> = Vec::new();
        let mut id_path = vec![from.to_string()];

        struct Frame {
            neighbors: Vec<(Edge, String)>,
            idx: usize,
        }

        let root_neighbors = self.adjacent(from, opts.edge_types.as_deref(), opts.directed).await?;
        let mut stack = vec![Frame {
            neighbors: root_neighbors,
            idx: 0,
        }];

        while let Some(frame) = stack.last_mut() {
            if results.len() >= opts.max_paths {
                break;
            }
            if frame.idx >= frame.neighbors.len() {
                stack.pop();
                if stack.is_empty() {
                    break;
                }
                node_path.pop();
                edge_path.pop();
                if let Some(popped_id) = id_path.pop() {
                    visited.remove(&popped_id);
                }
                continue;
            }
            let (edge, next_id) = frame.neighbors[frame.idx].clone();
            frame.idx += 1;

            if visited.contains(&next_id) || edge_path.len() + 1 > opts.max_depth {
                continue;
            }

            let Some(next_node) = self.graph.get_node(&next_id).await? else {
                continue;
            };

            if next_id == to {
                let mut nodes = node_path.clone();
                nodes.push(next_node);
                let mut edges = edge_path.clone();
                edges.push(edge);
                results.push(build_path(nodes, edges));
                continue; // target reached; a simple path stops here
            }

            visited.insert(next_id.clone());
            node_path.push(next_node);
            edge_path.push(edge);
            id_path.push(next_id.clone());

            let next_neighbors = self.adjacent(&next_id, opts.edge_types.as_deref(), opts.directed).await?;
            stack.push(Frame {
                neighbors: next_neighbors,
                idx: 0,
            });
        }

        Ok(results)
    }

    /// BFS for the first (unit-weight-shortest) path from `from` to `to`.
    ///
    /// # Errors
    /// Returns [`QueryError`] on a graph store read failure.
    pub async fn find_shortest_path(
        &self,
        from: &str,
        to: &str,
        opts: &TraversalOptions,
    ) -> Result<Option<Path>, QueryError> {
        let Some(start_node) = self.graph.get_node(from).await? else {
            return Ok(None);
        };
        if from == to {
            return Ok(Some(Path {
                nodes: vec![start_node],
                edges: Vec::new(),
                weight: 0.0,
                length: 0,
            }));
        }

        let mut visited: HashSet<String> = HashSet::from([from.to_string()]);
        let mut queue: VecDeque<(String, Vec<Node>, Vec<Edge>, usize)> = VecDeque::new();
        queue.push_back((from.to_string(), vec![start_node], Vec::new(), 0));

        while let Some((current, nodes_path, edges_path, depth)) = queue.pop_front() {
            if depth >= opts.max_depth {
                continue;
            }
            let neighbors = self.adjacent(&current, opts.edge_types.as_deref(), opts.directed).await?;
            for (edge, next_id) in neighbors {
                if visited.contains(&next_id) {
                    continue;
                }
                let Some(next_node) = self.graph.get_node(&next_id).await? else {
                    continue;
                };
                let mut nodes = nodes_path.clone();
                nodes.push(next_node);
                let mut edges = edges_path.clone();
                edges.push(edge);
                if next_id == to {
                    return Ok(Some(build_path(nodes, edges)));
                }
                visited.insert(next_id.clone());
                queue.push_back((next_id, nodes, edges, depth + 1));
            }
        }
        Ok(None)
    }

    /// Depth-first traversal from `start`. `visitor(node, depth)` runs for
    /// each newly visited node; returning `true` stops the traversal early.
    ///
    /// # Errors
    /// Returns [`QueryError`] on a graph store read failure.
    pub async fn traverse_dfs<F>(&self, start: &str, mut visitor: F, opts: &TraversalOptions) -> Result<(), QueryError>
    where
        F: FnMut(&Node, usize) -> bool,
    {
        let Some(start_node) = self.graph.get_node(start).await? else {
            return Ok(());
        };
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<(String, Node, usize)> = vec![(start.to_string(), start_node, 0)];

        while let Some((id, node, depth)) = stack.pop() {
            if visited.contains(&id) {
                continue;
            }
            visited.insert(id.clone());
            if visitor(&node, depth) {
                return Ok(());
            }
            if depth >= opts.max_depth {
                continue;
            }
            let neighbors = self.adjacent(&id, opts.edge_types.as_deref(), opts.directed).await?;
            for (_, next_id) in neighbors {
                if visited.contains(&next_id) {
                    continue;
                }
                if let Some(next_node) = self.graph.get_node(&next_id).await? {
                    stack.push((next_id, next_node, depth + 1));
                }
            }
        }
        Ok(())
    }

    /// Breadth-first traversal from `start`. `visitor(node, depth)` runs for
    /// each newly visited node; returning `true` stops the traversal early.
    ///
    /// # Errors
    /// Returns [`QueryError`] on a graph store read failure.
    pub async fn traverse_bfs<F>(&self, start: &str, mut visitor: F, opts: &TraversalOptions) -> Result<(), QueryError>
    where
        F: FnMut(&Node, usize) -> bool,
    {
        let Some(start_node) = self.graph.get_node(start).await? else {
            return Ok(());
        };
        let mut visited: HashSet<String> = HashSet::from([start.to_string()]);
        let mut queue: VecDeque<(String, Node, usize)> = VecDeque::from([(start.to_string(), start_node, 0)]);

        while let Some((id, node, depth)) = queue.pop_front() {
            if visitor(&node, depth) {
                return Ok(());
            }
            if depth >= opts.max_depth {
                continue;
            }
            let neighbors = self.adjacent(&id, opts.edge_types.as_deref(), opts.directed).await?;
            for (_, next_id) in neighbors {
                if visited.contains(&next_id) {
                    continue;
                }
                visited.insert(next_id.clone());
                if let Some(next_node) = self.graph.get_node(&next_id).await? {
                    queue.push_back((next_id, next_node, depth + 1));
                }
            }
        }
        Ok(())
    }

    /// Nodes whose shortest unweighted distance from `node_id` is exactly
    /// `depth` (`depth == 1` is direct neighbors).
    ///
    /// # Errors
    /// Returns [`QueryError`] on a graph store read failure.
    pub async fn get_neighbors(&self, node_id: &str, depth: usize, opts: &TraversalOptions) -> Result<Vec<Node>, QueryError> {
        if depth == 0 || self.graph.get_node(node_id).await?.is_none() {
            return Ok(Vec::new());
        }

        let mut visited: HashSet<String> = HashSet::from([node_id.to_string()]);
        let mut frontier: Vec<String> = vec![node_id.to_string()];
        let mut result = Vec::new();

        for current_depth in 1..=depth {
            let mut next_frontier = Vec::new();
            for id in &frontier {
                let neighbors = self.adjacent(id, opts.edge_types.as_deref(), opts.directed).await?;
                for (_, next_id) in neighbors {
                    if visited.insert(next_id.clone()) {
                        next_frontier.push(next_id);
                    }
                }
            }
            if current_depth == depth {
                for id in &next_frontier {
                    if let Some(node) = self.graph.get_node(id).await? {
                        result.push(node);
                    }
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }
        Ok(result)
    }

    /// Nodes within BFS depth `<= opts.max_depth` of `center_id`, filtered
    /// by `opts.node_types`, plus the edges between them matching
    /// `opts.edge_types`.
    ///
    /// # Errors
    /// Returns [`QueryError`] on a graph store read failure.
    pub async fn extract_subgraph(&self, center_id: &str, opts: &SubgraphOptions) -> Result<Subgraph, QueryError> {
        let Some(center) = self.graph.get_node(center_id).await? else {
            return Ok(Subgraph {
                nodes: Vec::new(),
                edges: Vec::new(),
            });
        };

        let mut visited: HashSet<String> = HashSet::from([center_id.to_string()]);
        let mut frontier = vec![center_id.to_string()];
        let mut all_nodes = vec![center];

        for _ in 0..opts.max_depth {
            let mut next_frontier = Vec::new();
            for id in &frontier {
                let neighbors = self.adjacent(id, opts.edge_types.as_deref(), opts.directed).await?;
                for (_, next_id) in neighbors {
                    if !visited.insert(next_id.clone()) {
                        continue;
                    }
                    if let Some(node) = self.graph.get_node(&next_id).await? {
                        all_nodes.push(node);
                    }
                    next_frontier.push(next_id);
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }

        let nodes: Vec<Node> = all_nodes
            .into_iter()
            .filter(|n| type_allowed(opts.node_types.as_deref(), &n.node_type))
            .collect();
        let node_ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();

        let mut edges = Vec::new();
        let mut seen_edges: HashSet<String> = HashSet::new();
        for node in &nodes {
            let outgoing = self.graph.get_outgoing_edges(&node.id, None).await?;
            for edge in outgoing {
                if type_allowed(opts.edge_types.as_deref(), &edge.edge_type)
                    && node_ids.contains(edge.to.as_str())
                    && seen_edges.insert(edge.id.clone())
                {
                    edges.push(edge);
                }
            }
        }

        Ok(Subgraph { nodes, edges })
    }

    /// Undirected DFS from `node_id`, ignoring edge direction.
    ///
    /// # Errors
    /// Returns [`QueryError`] on a graph store read failure.
    pub async fn find_connected_component(
        &self,
        node_id: &str,
        edge_types: Option<&[String]>,
    ) -> Result<Vec<Node>, QueryError> {
        let Some(start_node) = self.graph.get_node(node_id).await? else {
            return Ok(Vec::new());
        };
        let mut visited: HashSet<String> = HashSet::from([node_id.to_string()]);
        let mut stack = vec![node_id.to_string()];
        let mut nodes = vec![start_node];

        while let Some(id) = stack.pop() {
            let neighbors = self.adjacent(&id, edge_types, false).await?;
            for (_, next_id) in neighbors {
                if !visited.insert(next_id.clone()) {
                    continue;
                }
                if let Some(node) = self.graph.get_node(&next_id).await? {
                    nodes.push(node);
                }
                stack.push(next_id);
            }
        }
        Ok(nodes)
    }

    /// Edges incident to `node_id` paired with the id at the other end.
    /// `directed == true` returns only outgoing edges; `false` returns both
    /// outgoing and incoming.
    async fn adjacent(
        &self,
        node_id: &str,
        edge_types: Option<&[String]>,
        directed: bool,
    ) -> Result<Vec<(Edge, String)>, QueryError> {
        let mut result = Vec::new();
        for edge in self.graph.get_outgoing_edges(node_id, None).await? {
            if type_allowed(edge_types, &edge.edge_type) {
                let other = edge.to.clone();
                result.push((edge, other));
            }
        }
        if !directed {
            for edge in self.graph.get_incoming_edges(node_id, None).await? {
                if type_allowed(edge_types, &edge.edge_type) {
                    let other = edge.from.clone();
                    result.push((edge, other));
                }
            }
        }
        Ok(result)
    }
}

fn type_allowed(allowed: Option<&[String]>, candidate: &str) -> bool {
    allowed.is_none_or(|types| types.iter().any(|t| t == candidate))
}

fn build_path(nodes: Vec<Node>, edges: Vec<Edge>) -> Path {
    let weight = edges.iter().map(|e| e.weight).sum();
    let length = edges.len();
    Path {
        nodes,
        edges,
        weight,
        length,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_substrate::InMemorySubstrate;

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            node_type: "widget".to_string(),
            properties: Default::default(),
            metadata: Default::default(),
        }
    }

    fn edge(id: &str, from: &str, to: &str, weight: f64) -> Edge {
        Edge {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            edge_type: "knows".to_string(),
            properties: Default::default(),
            weight,
            directed: true,
            metadata: Default::default(),
        }
    }

    async fn line_graph() -> QueryEngine<InMemorySubstrate> {
        let substrate = Arc::new(InMemorySubstrate::new());
        let graph = Arc::new(GraphStore::new(substrate));
        for id in ["a", "b", "c", "d"] {
            graph.put_node(node(id), 1).await.unwrap();
        }
        graph.put_edge(edge("ab", "a", "b", 1.0), 1).await.unwrap();
        graph.put_edge(edge("bc", "b", "c", 2.0), 1).await.unwrap();
        graph.put_edge(edge("cd", "c", "d", 1.0), 1).await.unwrap();
        QueryEngine::new(graph)
    }

    #[tokio::test]
    async fn find_shortest_path_walks_the_line() {
        let engine = line_graph().await;
        let path = engine
            .find_shortest_path("a", "d", &TraversalOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path.length, 3);
        assert_eq!(path.weight, 4.0);
    }

    #[tokio::test]
    async fn find_shortest_path_unknown_target_returns_none() {
        let engine = line_graph().await;
        let path = engine
            .find_shortest_path("a", "nowhere", &TraversalOptions::default())
            .await
            .unwrap();
        assert!(path.is_none());
    }

    #[tokio::test]
    async fn find_paths_respects_max_paths_and_reports_simple_paths() {
        let engine = line_graph().await;
        let paths = engine
            .find_paths(
                "a",
                "d",
                &PathOptions {
                    max_paths: 1,
                    ..PathOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].nodes.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn get_neighbors_at_depth_two_skips_direct_neighbor() {
        let engine = line_graph().await;
        let neighbors = engine.get_neighbors("a", 2, &TraversalOptions::default()).await.unwrap();
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].id, "c");
    }

    #[tokio::test]
    async fn traverse_dfs_stops_early_when_visitor_returns_true() {
        let engine = line_graph().await;
        let mut visited = Vec::new();
        engine
            .traverse_dfs(
                "a",
                |node, _depth| {
                    visited.push(node.id.clone());
                    node.id == "b"
                },
                &TraversalOptions::default(),
            )
            .await
            .unwrap();
        assert!(visited.contains(&"b".to_string()));
        assert!(!visited.contains(&"d".to_string()));
    }

    #[tokio::test]
    async fn extract_subgraph_includes_only_nodes_within_depth() {
        let engine = line_graph().await;
        let sub = engine
            .extract_subgraph(
                "a",
                &SubgraphOptions {
                    max_depth: 1,
                    ..SubgraphOptions::default()
                },
            )
            .await
            .unwrap();
        let ids: HashSet<&str> = sub.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, HashSet::from(["a", "b"]));
        assert_eq!(sub.edges.len(), 1);
    }

    #[tokio::test]
    async fn find_connected_component_ignores_edge_direction() {
        let engine = line_graph().await;
        let component = engine.find_connected_component("d", None).await.unwrap();
        let ids: HashSet<&str> = component.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, HashSet::from(["a", "b", "c", "d"]));
    }

    #[tokio::test]
    async fn unknown_start_node_yields_empty_results() {
        let engine = line_graph().await;
        assert!(engine
            .find_paths("ghost", "a", &PathOptions::default())
            .await
            .unwrap()
            .is_empty());
        assert!(engine.find_connected_component("ghost", None).await.unwrap().is_empty());
    }
}
