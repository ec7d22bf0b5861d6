// SPDX-License-Identifier: Apache-2.0
//! The knowledge-graph store: nodes, edges, and the six secondary indexes
//! that make traversal and filtering cheap (spec.md §3, §4.2).
//!
//! Nodes and edges are schemaless documents (`serde_json::Value` bags for
//! `properties`); each is persisted as a single JSON-string leaf under its
//! canonical [`mesh_substrate::keys`] path, with index entries as marker
//! writes alongside it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use mesh_substrate::{encode_nested, keys, Scalar, Substrate, SubstrateError, Value};

/// A node's free-form metadata: labels plus bookkeeping timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeMetadata {
    /// Arbitrary labels attached to the node (secondary-indexed).
    #[serde(default)]
    pub labels: Vec<String>,
    /// Set on first `put_node`, never changed thereafter.
    pub created_at: Option<i64>,
    /// Stamped on every `put_node`.
    pub updated_at: Option<i64>,
}

/// A graph node (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// Stable, caller-assigned identifier.
    pub id: String,
    /// Free-form type tag, secondary-indexed.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Schemaless property bag.
    #[serde(default)]
    pub properties: BTreeMap<String, Json>,
    /// Labels and timestamps.
    #[serde(default)]
    pub metadata: NodeMetadata,
}

/// An edge's free-form metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EdgeMetadata {
    /// Arbitrary labels attached to the edge.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Set on first `put_edge`.
    pub created_at: Option<i64>,
    /// Stamped on every `put_edge`.
    pub updated_at: Option<i64>,
}

/// A graph edge (spec.md §3). Self-loops and parallel edges (distinct ids
/// between the same endpoints) are both legal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    /// Stable, caller-assigned identifier.
    pub id: String,
    /// Source node id. Not required to reference an existing node; dangling
    /// edges are legal and are skipped by traversal.
    pub from: String,
    /// Destination node id.
    pub to: String,
    /// Free-form type tag, secondary-indexed.
    #[serde(rename = "type")]
    pub edge_type: String,
    /// Schemaless property bag.
    #[serde(default)]
    pub properties: BTreeMap<String, Json>,
    /// Edge weight used by the query engine's path-weight calculations.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Whether the edge is directed. Defaults to `true`.
    #[serde(default = "default_directed")]
    pub directed: bool,
    /// Labels and timestamps.
    #[serde(default)]
    pub metadata: EdgeMetadata,
}

fn default_weight() -> f64 {
    1.0
}

fn default_directed() -> bool {
    true
}

/// A single observed mutation, as surfaced to the synchronizer for
/// broadcasting and to remote observers as an applied change (spec.md
/// §4.3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum GraphChange {
    /// A node was created.
    NodeCreated(Node),
    /// A node was updated in place.
    NodeUpdated(Node),
    /// A node (and its incident edges) was removed.
    NodeDeleted {
        /// The removed node's id.
        id: String,
    },
    /// An edge was created.
    EdgeCreated(Edge),
    /// An edge was updated in place.
    EdgeUpdated(Edge),
    /// An edge was removed.
    EdgeDeleted {
        /// The removed edge's id.
        id: String,
    },
}

/// Filter options for [`GraphStore::query_nodes`].
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    /// Restrict to this node type.
    pub node_type: Option<String>,
    /// Any-match against the node's labels.
    pub labels: Vec<String>,
    /// All-equal match against the node's properties.
    pub properties: BTreeMap<String, Json>,
    /// Only nodes created at or after this timestamp.
    pub created_after: Option<i64>,
    /// Only nodes created at or before this timestamp.
    pub created_before: Option<i64>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Number of matching results to skip before collecting.
    pub offset: Option<usize>,
}

/// Filter options for [`GraphStore::query_edges`].
#[derive(Debug, Clone, Default)]
pub struct EdgeFilter {
    /// Restrict to this edge type.
    pub edge_type: Option<String>,
    /// Restrict to edges with this source.
    pub from: Option<String>,
    /// Restrict to edges with this destination.
    pub to: Option<String>,
    /// Any-match against the edge's labels.
    pub labels: Vec<String>,
    /// Minimum (inclusive) weight.
    pub min_weight: Option<f64>,
    /// Maximum (inclusive) weight.
    pub max_weight: Option<f64>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Number of matching results to skip before collecting.
    pub offset: Option<usize>,
}

/// Errors raised by [`GraphStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Underlying substrate failure.
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
    /// A node or edge failed validation (missing/blank required field).
    #[error("invalid {kind}: {reason}")]
    Invalid {
        /// `"node"` or `"edge"`.
        kind: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

/// The knowledge-graph store (spec.md §4.2), generic over any
/// [`Substrate`] implementation.
pub struct GraphStore<S> {
    substrate: Arc<S>,
}

impl<S: Substrate> GraphStore<S> {
    /// Wrap a substrate handle.
    pub fn new(substrate: Arc<S>) -> Self {
        Self { substrate }
    }

    /// Create or overwrite a node, updating its type/label indexes.
    /// Idempotent: writing the same node again is a no-op on the indexes
    /// and only refreshes `metadata.updated_at`.
    ///
    /// # Errors
    /// Returns [`GraphError::Invalid`] if `id` or `node_type` is blank, or
    /// [`GraphError::Substrate`] on a replication failure.
    pub async fn put_node(&self, mut node: Node, now: i64) -> Result<Node, GraphError> {
        if node.id.trim().is_empty() {
            return Err(invalid("node", "id must not be blank"));
        }
        if node.node_type.trim().is_empty() {
            return Err(invalid("node", "type must not be blank"));
        }

        let existing = self.get_node(&node.id).await?;
        node.metadata.created_at = Some(existing.as_ref().map_or(now, |n| n.metadata.created_at.unwrap_or(now)));
        node.metadata.updated_at = Some(now);

        self.substrate
            .put(keys::node(&node.id), encode_doc(&node)?)
            .await?;
        self.substrate
            .put(keys::node_type_index(&node.node_type, &node.id), marker())
            .await?;
        for label in &node.metadata.labels {
            self.substrate
                .put(keys::node_label_index(label, &node.id), marker())
                .await?;
        }

        tracing::debug!(node_id = %node.id, node_type = %node.node_type, "put_node");
        Ok(node)
    }

    /// Fetch a node by id.
    ///
    /// # Errors
    /// Returns [`GraphError::Substrate`] on a replication or corruption
    /// failure.
    pub async fn get_node(&self, id: &str) -> Result<Option<Node>, GraphError> {
        decode_doc(self.substrate.get(&keys::node(id)).await?, &keys::node(id))
    }

    /// Remove a node and cascade-delete every edge touching it. Cascade is
    /// atomic from this caller's perspective only (spec.md §4.2, §9 open
    /// question 1): replication to other nodes is not coordinated.
    ///
    /// # Errors
    /// Returns [`GraphError::Substrate`] on a replication failure.
    pub async fn delete_node(&self, id: &str) -> Result<bool, GraphError> {
        let Some(node) = self.get_node(id).await? else {
            return Ok(false);
        };

        self.substrate.delete(&keys::node(id)).await?;
        self.substrate
            .delete(&keys::node_type_index(&node.node_type, id))
            .await?;
        for label in &node.metadata.labels {
            self.substrate
                .delete(&keys::node_label_index(label, id))
                .await?;
        }

        let outgoing = self.get_outgoing_edges(id, None).await?;
        let incoming = self.get_incoming_edges(id, None).await?;
        for edge in outgoing.into_iter().chain(incoming) {
            self.delete_edge(&edge.id).await?;
        }

        tracing::debug!(node_id = %id, "delete_node (cascade)");
        Ok(true)
    }

    /// Create or overwrite an edge, updating all six index entries.
    /// Edges may reference non-existent nodes (dangling); traversal skips
    /// them silently.
    ///
    /// # Errors
    /// Returns [`GraphError::Invalid`] if `id`, `from`, `to`, or `edge_type`
    /// is blank, or [`GraphError::Substrate`] on a replication failure.
    pub async fn put_edge(&self, mut edge: Edge, now: i64) -> Result<Edge, GraphError> {
        if edge.id.trim().is_empty() {
            return Err(invalid("edge", "id must not be blank"));
        }
        if edge.from.trim().is_empty() || edge.to.trim().is_empty() {
            return Err(invalid("edge", "from/to must not be blank"));
        }
        if edge.edge_type.trim().is_empty() {
            return Err(invalid("edge", "type must not be blank"));
        }

        let existing = self.get_edge(&edge.id).await?;
        edge.metadata.created_at = Some(existing.as_ref().map_or(now, |e| e.metadata.created_at.unwrap_or(now)));
        edge.metadata.updated_at = Some(now);

        self.substrate
            .put(keys::edge(&edge.id), encode_doc(&edge)?)
            .await?;
        self.substrate
            .put(keys::edge_outgoing_index(&edge.from, &edge.id), marker())
            .await?;
        self.substrate
            .put(
                keys::edge_outgoing_typed_index(&edge.from, &edge.edge_type, &edge.id),
                marker(),
            )
            .await?;
        self.substrate
            .put(keys::edge_incoming_index(&edge.to, &edge.id), marker())
            .await?;
        self.substrate
            .put(
                keys::edge_incoming_typed_index(&edge.to, &edge.edge_type, &edge.id),
                marker(),
            )
            .await?;
        self.substrate
            .put(keys::edge_type_index(&edge.edge_type, &edge.id), marker())
            .await?;

        tracing::debug!(edge_id = %edge.id, from = %edge.from, to = %edge.to, "put_edge");
        Ok(edge)
    }

    /// Fetch an edge by id.
    ///
    /// # Errors
    /// Returns [`GraphError::Substrate`] on a replication or corruption
    /// failure.
    pub async fn get_edge(&self, id: &str) -> Result<Option<Edge>, GraphError> {
        decode_doc(self.substrate.get(&keys::edge(id)).await?, &keys::edge(id))
    }

    /// Remove an edge and its index entries.
    ///
    /// # Errors
    /// Returns [`GraphError::Substrate`] on a replication failure.
    pub async fn delete_edge(&self, id: &str) -> Result<bool, GraphError> {
        let Some(edge) = self.get_edge(id).await? else {
            return Ok(false);
        };

        self.substrate.delete(&keys::edge(id)).await?;
        self.substrate
            .delete(&keys::edge_outgoing_index(&edge.from, id))
            .await?;
        self.substrate
            .delete(&keys::edge_outgoing_typed_index(&edge.from, &edge.edge_type, id))
            .await?;
        self.substrate
            .delete(&keys::edge_incoming_index(&edge.to, id))
            .await?;
        self.substrate
            .delete(&keys::edge_incoming_typed_index(&edge.to, &edge.edge_type, id))
            .await?;
        self.substrate
            .delete(&keys::edge_type_index(&edge.edge_type, id))
            .await?;

        tracing::debug!(edge_id = %id, "delete_edge");
        Ok(true)
    }

    /// Outgoing edges from `node_id`, optionally restricted to `edge_type`.
    /// Index entries whose edge has since been deleted (a racing delete) are
    /// silently skipped rather than surfaced as an error.
    ///
    /// # Errors
    /// Returns [`GraphError::Substrate`] on a replication failure.
    pub async fn get_outgoing_edges(
        &self,
        node_id: &str,
        edge_type: Option<&str>,
    ) -> Result<Vec<Edge>, GraphError> {
        let prefix = match edge_type {
            Some(t) => keys::edge_outgoing_typed_root(node_id, t),
            None => keys::edge_outgoing_root(node_id),
        };
        self.fetch_edges_from_index(&prefix).await
    }

    /// Incoming edges into `node_id`, optionally restricted to `edge_type`.
    ///
    /// # Errors
    /// Returns [`GraphError::Substrate`] on a replication failure.
    pub async fn get_incoming_edges(
        &self,
        node_id: &str,
        edge_type: Option<&str>,
    ) -> Result<Vec<Edge>, GraphError> {
        let prefix = match edge_type {
            Some(t) => keys::edge_incoming_typed_root(node_id, t),
            None => keys::edge_incoming_root(node_id),
        };
        self.fetch_edges_from_index(&prefix).await
    }

    async fn fetch_edges_from_index(
        &self,
        prefix: &mesh_substrate::Path,
    ) -> Result<Vec<Edge>, GraphError> {
        let ids = self.substrate.list(prefix).await?;
        let mut edges = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(edge) = self.get_edge(&id).await? {
                edges.push(edge);
            }
        }
        Ok(edges)
    }

    /// Filtered node query. Uses the type index when `filter.node_type` is
    /// set; otherwise falls back to a full scan of `nodes/`.
    ///
    /// # Errors
    /// Returns [`GraphError::Substrate`] on a replication failure.
    pub async fn query_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>, GraphError> {
        let candidates: Vec<Node> = if let Some(node_type) = &filter.node_type {
            let ids = self.substrate.list(&keys::node_type_root(node_type)).await?;
            let mut nodes = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(node) = self.get_node(&id).await? {
                    nodes.push(node);
                }
            }
            nodes
        } else {
            let ids = self.substrate.list(&keys::nodes_root()).await?;
            let mut nodes = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(node) = self.get_node(&id).await? {
                    nodes.push(node);
                }
            }
            nodes
        };

        let matched = candidates.into_iter().filter(|node| node_matches(node, filter));
        Ok(paginate(matched, filter.offset, filter.limit))
    }

    /// Filtered edge query. Uses the most selective index available
    /// (`from`/`to` restricted by `type` when possible); otherwise falls
    /// back to a full scan of `edges/`.
    ///
    /// # Errors
    /// Returns [`GraphError::Substrate`] on a replication failure.
    pub async fn query_edges(&self, filter: &EdgeFilter) -> Result<Vec<Edge>, GraphError> {
        let candidates: Vec<Edge> = if let Some(from) = &filter.from {
            self.get_outgoing_edges(from, filter.edge_type.as_deref()).await?
        } else if let Some(to) = &filter.to {
            self.get_incoming_edges(to, filter.edge_type.as_deref()).await?
        } else if let Some(edge_type) = &filter.edge_type {
            let ids = self.substrate.list(&keys::edge_type_root(edge_type)).await?;
            let mut edges = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(edge) = self.get_edge(&id).await? {
                    edges.push(edge);
                }
            }
            edges
        } else {
            let ids = self.substrate.list(&keys::edges_root()).await?;
            let mut edges = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(edge) = self.get_edge(&id).await? {
                    edges.push(edge);
                }
            }
            edges
        };

        let matched = candidates.into_iter().filter(|edge| edge_matches(edge, filter));
        Ok(paginate(matched, filter.offset, filter.limit))
    }
}

fn invalid(kind: &'static str, reason: impl Into<String>) -> GraphError {
    GraphError::Invalid {
        kind,
        reason: reason.into(),
    }
}

fn marker() -> Value {
    Value::Scalar(Scalar::Bool(true))
}

fn encode_doc<T: Serialize>(doc: &T) -> Result<Value, GraphError> {
    Ok(Value::Scalar(Scalar::String(encode_nested(doc)?)))
}

fn decode_doc<T: serde::de::DeserializeOwned>(
    value: Option<Value>,
    path: &mesh_substrate::Path,
) -> Result<Option<T>, GraphError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let Some(raw) = value.field_or_scalar_string() else {
        return Err(GraphError::Substrate(SubstrateError::Corrupt {
            path: path.clone(),
            source: serde::de::Error::custom("expected a JSON-string document leaf"),
        }));
    };
    Ok(Some(mesh_substrate::decode_nested(raw)?))
}

trait ScalarStringExt {
    fn field_or_scalar_string(&self) -> Option<&str>;
}

impl ScalarStringExt for Value {
    fn field_or_scalar_string(&self) -> Option<&str> {
        match self {
            Value::Scalar(Scalar::String(s)) => Some(s),
            Value::Map(_) => None,
        }
    }
}

fn node_matches(node: &Node, filter: &NodeFilter) -> bool {
    if let Some(node_type) = &filter.node_type {
        if &node.node_type != node_type {
            return false;
        }
    }
    if !filter.labels.is_empty() && !filter.labels.iter().any(|l| node.metadata.labels.contains(l)) {
        return false;
    }
    if !filter
        .properties
        .iter()
        .all(|(k, v)| node.properties.get(k) == Some(v))
    {
        return false;
    }
    if let Some(after) = filter.created_after {
        if node.metadata.created_at.unwrap_or(0) < after {
            return false;
        }
    }
    if let Some(before) = filter.created_before {
        if node.metadata.created_at.unwrap_or(0) > before {
            return false;
        }
    }
    true
}

fn edge_matches(edge: &Edge, filter: &EdgeFilter) -> bool {
    if let Some(edge_type) = &filter.edge_type {
        if &edge.edge_type != edge_type {
            return false;
        }
    }
    if let Some(from) = &filter.from {
        if &edge.from != from {
            return false;
        }
    }
    if let Some(to) = &filter.to {
        if &edge.to != to {
            return false;
        }
    }
    if !filter.labels.is_empty() && !filter.labels.iter().any(|l| edge.metadata.labels.contains(l)) {
        return false;
    }
    if let Some(min) = filter.min_weight {
        if edge.weight < min {
            return false;
        }
    }
    if let Some(max) = filter.max_weight {
        if edge.weight > max {
            return false;
        }
    }
    true
}

fn paginate<T>(iter: impl Iterator<Item = T>, offset: Option<usize>, limit: Option<usize>) -> Vec<T> {
    let skipped = iter.skip(offset.unwrap_or(0));
    match limit {
        Some(n) => skipped.take(n).collect(),
        None => skipped.collect(),
    }
}
