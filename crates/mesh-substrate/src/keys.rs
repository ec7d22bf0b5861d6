// SPDX-License-Identifier: Apache-2.0
//! Logical keyspace layout (spec.md §6). Centralizing these here keeps the
//! higher-level stores from hand-building path segments ad hoc.

use crate::Path;

/// `actors/{actor_id}` — snapshot document.
pub fn actor(actor_id: &str) -> Path {
    Path::new(["actors", actor_id])
}

/// `actors/` prefix, for listing/watching every actor.
pub fn actors_root() -> Path {
    Path::new(["actors"])
}

/// `patches/{actor_id}/{version}` — a single patch entry.
pub fn patch(actor_id: &str, version: u64) -> Path {
    Path::new(["patches", actor_id, &version.to_string()])
}

/// `patches/{actor_id}/` prefix, for replaying an actor's patch log.
pub fn patches_root(actor_id: &str) -> Path {
    Path::new(["patches", actor_id])
}

/// `actorTypes/{type}/{actor_id}` — type index entry.
pub fn actor_type_index(actor_type: &str, actor_id: &str) -> Path {
    Path::new(["actorTypes", actor_type, actor_id])
}

/// `actorTypes/{type}/` prefix.
pub fn actor_type_root(actor_type: &str) -> Path {
    Path::new(["actorTypes", actor_type])
}

/// `index/actors/all/{actor_id}` — global actor index entry.
pub fn actor_all_index(actor_id: &str) -> Path {
    Path::new(["index", "actors", "all", actor_id])
}

/// `index/actors/all/` prefix.
pub fn actor_all_root() -> Path {
    Path::new(["index", "actors", "all"])
}

/// `loomdb/nodes/{id}` — node document.
pub fn node(id: &str) -> Path {
    Path::new(["loomdb", "nodes", id])
}

/// `loomdb/edges/{id}` — edge document.
pub fn edge(id: &str) -> Path {
    Path::new(["loomdb", "edges", id])
}

/// `loomdb/index/nodes/type/{t}/{id}`.
pub fn node_type_index(node_type: &str, id: &str) -> Path {
    Path::new(["loomdb", "index", "nodes", "type", node_type, id])
}

/// `loomdb/index/nodes/type/{t}/` prefix.
pub fn node_type_root(node_type: &str) -> Path {
    Path::new(["loomdb", "index", "nodes", "type", node_type])
}

/// `loomdb/index/nodes/label/{l}/{id}`.
pub fn node_label_index(label: &str, id: &str) -> Path {
    Path::new(["loomdb", "index", "nodes", "label", label, id])
}

/// `loomdb/index/edges/outgoing/{from}/{id}`.
pub fn edge_outgoing_index(from: &str, id: &str) -> Path {
    Path::new(["loomdb", "index", "edges", "outgoing", from, id])
}

/// `loomdb/index/edges/outgoing/{from}/` prefix.
pub fn edge_outgoing_root(from: &str) -> Path {
    Path::new(["loomdb", "index", "edges", "outgoing", from])
}

/// `loomdb/index/edges/outgoing/{from}/{type}/{id}`.
pub fn edge_outgoing_typed_index(from: &str, edge_type: &str, id: &str) -> Path {
    Path::new(["loomdb", "index", "edges", "outgoing", from, edge_type, id])
}

/// `loomdb/index/edges/outgoing/{from}/{type}/` prefix.
pub fn edge_outgoing_typed_root(from: &str, edge_type: &str) -> Path {
    Path::new(["loomdb", "index", "edges", "outgoing", from, edge_type])
}

/// `loomdb/index/edges/incoming/{to}/{id}`.
pub fn edge_incoming_index(to: &str, id: &str) -> Path {
    Path::new(["loomdb", "index", "edges", "incoming", to, id])
}

/// `loomdb/index/edges/incoming/{to}/` prefix.
pub fn edge_incoming_root(to: &str) -> Path {
    Path::new(["loomdb", "index", "edges", "incoming", to])
}

/// `loomdb/index/edges/incoming/{to}/{type}/{id}`.
pub fn edge_incoming_typed_index(to: &str, edge_type: &str, id: &str) -> Path {
    Path::new(["loomdb", "index", "edges", "incoming", to, edge_type, id])
}

/// `loomdb/index/edges/incoming/{to}/{type}/` prefix.
pub fn edge_incoming_typed_root(to: &str, edge_type: &str) -> Path {
    Path::new(["loomdb", "index", "edges", "incoming", to, edge_type])
}

/// `loomdb/index/edges/type/{type}/{id}`.
pub fn edge_type_index(edge_type: &str, id: &str) -> Path {
    Path::new(["loomdb", "index", "edges", "type", edge_type, id])
}

/// `loomdb/index/edges/type/{type}/` prefix.
pub fn edge_type_root(edge_type: &str) -> Path {
    Path::new(["loomdb", "index", "edges", "type", edge_type])
}

/// `loomdb/nodes/` prefix, for full scans.
pub fn nodes_root() -> Path {
    Path::new(["loomdb", "nodes"])
}

/// `loomdb/edges/` prefix, for full scans.
pub fn edges_root() -> Path {
    Path::new(["loomdb", "edges"])
}
