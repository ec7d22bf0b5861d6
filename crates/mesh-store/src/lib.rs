// SPDX-License-Identifier: Apache-2.0
//! The event-sourced actor state store (spec.md §3, §4.1): a snapshot plus
//! an append-only log of structural patches, with time-travel replay.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use mesh_substrate::{encode_nested, keys, Path, Scalar, Substrate, SubstrateError, Value};

/// A single structural edit against a JSON document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Insert a new value at `path` (the path did not previously exist).
    Add {
        /// JSON-pointer-style path, one key per tree level.
        path: Vec<String>,
        /// The inserted value.
        value: Json,
    },
    /// Overwrite the value already present at `path`.
    Replace {
        /// JSON-pointer-style path.
        path: Vec<String>,
        /// The replacement value.
        value: Json,
    },
    /// Remove the value at `path`.
    Remove {
        /// JSON-pointer-style path.
        path: Vec<String>,
    },
}

/// A versioned, timestamped batch of patches for one actor (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchEntry {
    /// The actor this entry belongs to.
    pub actor_id: String,
    /// Unique per actor; the set of versions on an actor's entries is a
    /// contiguous range `[base_version + 1, version]`.
    pub version: u64,
    /// Wall-clock time the patch was recorded.
    pub timestamp: i64,
    /// The structural edits, in application order.
    pub patches: Vec<PatchOp>,
}

/// An actor's reconstructed state (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActorState {
    /// Stable, caller-assigned identifier.
    pub actor_id: String,
    /// Free-form type tag, secondary-indexed.
    pub actor_type: String,
    /// Current reconstructed document.
    pub state: Json,
    /// Monotonically increasing; bumped by every successful write.
    pub version: u64,
    /// The version at which `base_state` was recorded by the last
    /// `snapshot()` (or 0, for a never-snapshotted actor).
    pub base_version: u64,
    /// The full document as of `base_version`, kept so `get_state_at` can
    /// replay forward without needing every patch since genesis.
    #[serde(default)]
    pub base_state: Json,
    /// Set on first `set`, never changed thereafter.
    pub created_at: i64,
    /// Stamped on every successful write.
    pub last_modified: i64,
    /// Free-form bag, not interpreted by the store.
    #[serde(default)]
    pub metadata: BTreeMap<String, Json>,
}

/// Sort key for [`QueryOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    /// Sort by `created_at`.
    #[default]
    CreatedAt,
    /// Sort by `last_modified`.
    LastModified,
    /// Sort by `actor_id`.
    ActorId,
}

/// Options for [`ActorStore::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Restrict to this actor type.
    pub actor_type: Option<String>,
    /// Number of matching results to skip.
    pub offset: Option<usize>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Field to sort by.
    pub sort_key: SortKey,
    /// Sort in descending order instead of ascending.
    pub descending: bool,
}

/// Errors raised by [`ActorStore`] operations (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `update` was called against an actor id with no existing record.
    #[error("actor not found: {0}")]
    NotFound(String),
    /// `get_state_at` targeted a version older than the actor's current
    /// `base_version`; the needed patches have been garbage-collected.
    #[error("history compacted past version {target} (base is {base})")]
    HistoryCompacted {
        /// The version that was requested.
        target: u64,
        /// The actor's current base version.
        base: u64,
    },
    /// Underlying substrate failure.
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

/// The event-sourced actor state store (spec.md §4.1), generic over any
/// [`Substrate`] implementation.
pub struct ActorStore<S> {
    substrate: Arc<S>,
}

impl<S: Substrate> ActorStore<S> {
    /// Wrap a substrate handle.
    pub fn new(substrate: Arc<S>) -> Self {
        Self { substrate }
    }

    /// Current reconstructed state, or `None` if the actor has never been
    /// written (or was deleted).
    ///
    /// # Errors
    /// Returns [`StoreError::Substrate`] on a replication or corruption
    /// failure.
    pub async fn get(&self, actor_id: &str) -> Result<Option<ActorState>, StoreError> {
        self.load(actor_id).await
    }

    /// Merge `partial` over the prior state (creating the actor at version
    /// 1 if it did not exist), append the resulting patch, and persist.
    ///
    /// # Errors
    /// Returns [`StoreError::Substrate`] if the substrate does not
    /// acknowledge the write within its deadline.
    pub async fn set(
        &self,
        actor_id: &str,
        actor_type: &str,
        partial: Json,
        now: i64,
    ) -> Result<ActorState, StoreError> {
        let existing = self.load(actor_id).await?;
        let is_new = existing.is_none();
        let mut actor = existing.unwrap_or_else(|| ActorState {
            actor_id: actor_id.to_string(),
            actor_type: actor_type.to_string(),
            state: Json::Null,
            version: 0,
            base_version: 0,
            base_state: Json::Null,
            created_at: now,
            last_modified: now,
            metadata: BTreeMap::new(),
        });

        let merged = merge(&actor.state, &partial);
        let patches = diff(&actor.state, &merged, &mut Vec::new());
        actor.version += 1;
        actor.state = merged;
        actor.last_modified = now;

        self.write_patch(actor_id, actor.version, now, patches).await?;
        self.persist(&actor).await?;
        if is_new {
            self.substrate
                .put(keys::actor_type_index(&actor.actor_type, actor_id), marker())
                .await?;
            self.substrate
                .put(keys::actor_all_index(actor_id), marker())
                .await?;
        }

        tracing::debug!(actor_id, version = actor.version, "set");
        Ok(actor)
    }

    /// Identical merge semantics to [`Self::set`], but requires the actor
    /// to already exist.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if no record exists for `actor_id`.
    pub async fn update(&self, actor_id: &str, partial: Json, now: i64) -> Result<ActorState, StoreError> {
        let Some(existing) = self.load(actor_id).await? else {
            return Err(StoreError::NotFound(actor_id.to_string()));
        };
        self.set(actor_id, &existing.actor_type, partial, now).await
    }

    /// Write a tombstone: remove the primary document and indexes. The
    /// patch log is left intact so `get_state_at` can still answer for
    /// versions at or below the last recorded one.
    ///
    /// # Errors
    /// Returns [`StoreError::Substrate`] on a replication failure.
    pub async fn delete(&self, actor_id: &str) -> Result<bool, StoreError> {
        let Some(actor) = self.load(actor_id).await? else {
            return Ok(false);
        };
        self.substrate.delete(&keys::actor(actor_id)).await?;
        self.substrate
            .delete(&keys::actor_type_index(&actor.actor_type, actor_id))
            .await?;
        self.substrate.delete(&keys::actor_all_index(actor_id)).await?;
        Ok(true)
    }

    /// List every known actor id, optionally restricted to those whose id
    /// starts with `prefix`.
    ///
    /// # Errors
    /// Returns [`StoreError::Substrate`] on a replication failure.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>, StoreError> {
        let ids = self.substrate.list(&keys::actors_root()).await?;
        Ok(match prefix {
            Some(p) => ids.into_iter().filter(|id| id.starts_with(p)).collect(),
            None => ids,
        })
    }

    /// Every actor of a given type.
    ///
    /// # Errors
    /// Returns [`StoreError::Substrate`] on a replication failure.
    pub async fn get_by_type(&self, actor_type: &str) -> Result<Vec<ActorState>, StoreError> {
        let ids = self.substrate.list(&keys::actor_type_root(actor_type)).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(actor) = self.load(&id).await? {
                out.push(actor);
            }
        }
        Ok(out)
    }

    /// Filtered, sorted, paginated actor query.
    ///
    /// # Errors
    /// Returns [`StoreError::Substrate`] on a replication failure.
    pub async fn query(&self, options: &QueryOptions) -> Result<Vec<ActorState>, StoreError> {
        let mut actors = match &options.actor_type {
            Some(t) => self.get_by_type(t).await?,
            None => {
                let ids = self.substrate.list(&keys::actors_root()).await?;
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(actor) = self.load(&id).await? {
                        out.push(actor);
                    }
                }
                out
            }
        };

        actors.sort_by(|a, b| {
            let ord = match options.sort_key {
                SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
                SortKey::LastModified => a.last_modified.cmp(&b.last_modified),
                SortKey::ActorId => a.actor_id.cmp(&b.actor_id),
            };
            if options.descending {
                ord.reverse()
            } else {
                ord
            }
        });

        let skipped = actors.into_iter().skip(options.offset.unwrap_or(0));
        Ok(match options.limit {
            Some(n) => skipped.take(n).collect(),
            None => skipped.collect(),
        })
    }

    /// Append an externally supplied patch list at the given (or next)
    /// version, applying it to the live document. Used by replay, import,
    /// and test harnesses.
    ///
    /// # Errors
    /// Returns [`StoreError::Substrate`] on a replication failure.
    pub async fn append_patches(
        &self,
        actor_id: &str,
        actor_type: &str,
        patches: Vec<PatchOp>,
        version: Option<u64>,
        now: i64,
    ) -> Result<ActorState, StoreError> {
        let existing = self.load(actor_id).await?;
        let is_new = existing.is_none();
        let mut actor = existing.unwrap_or_else(|| ActorState {
            actor_id: actor_id.to_string(),
            actor_type: actor_type.to_string(),
            state: Json::Null,
            version: 0,
            base_version: 0,
            base_state: Json::Null,
            created_at: now,
            last_modified: now,
            metadata: BTreeMap::new(),
        });

        let next_version = version.unwrap_or(actor.version + 1);
        apply(&mut actor.state, &patches);
        actor.version = next_version;
        actor.last_modified = now;

        self.write_patch(actor_id, next_version, now, patches).await?;
        self.persist(&actor).await?;
        if is_new {
            self.substrate
                .put(keys::actor_type_index(&actor.actor_type, actor_id), marker())
                .await?;
            self.substrate
                .put(keys::actor_all_index(actor_id), marker())
                .await?;
        }
        Ok(actor)
    }

    /// Every patch entry with `version > since_version`, ascending.
    ///
    /// # Errors
    /// Returns [`StoreError::Substrate`] on a replication failure.
    pub async fn get_patches(&self, actor_id: &str, since_version: u64) -> Result<Vec<PatchEntry>, StoreError> {
        let versions = self.substrate.list(&keys::patches_root(actor_id)).await?;
        let mut parsed: Vec<u64> = versions
            .into_iter()
            .filter_map(|v| v.parse::<u64>().ok())
            .filter(|v| *v > since_version)
            .collect();
        parsed.sort_unstable();

        let mut out = Vec::with_capacity(parsed.len());
        for version in parsed {
            if let Some(entry) = self.load_patch(actor_id, version).await? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Reconstruct state as of `target_version`. Returns current state if
    /// `target_version >= current version`.
    ///
    /// # Errors
    /// Returns [`StoreError::HistoryCompacted`] if the patches needed to
    /// replay back to `target_version` have been garbage-collected.
    pub async fn get_state_at(&self, actor_id: &str, target_version: u64) -> Result<Option<ActorState>, StoreError> {
        let Some(actor) = self.load(actor_id).await? else {
            return Ok(None);
        };
        if target_version >= actor.version {
            return Ok(Some(actor));
        }
        if actor.base_version > target_version {
            return Err(StoreError::HistoryCompacted {
                target: target_version,
                base: actor.base_version,
            });
        }

        let mut state = actor.base_state.clone();
        let patches = self.get_patches(actor_id, actor.base_version).await?;
        for entry in patches.into_iter().filter(|p| p.version <= target_version) {
            apply(&mut state, &entry.patches);
        }

        Ok(Some(ActorState {
            state,
            version: target_version,
            ..actor
        }))
    }

    /// Upsert `actor` verbatim: `version`, `base_version`, `base_state`,
    /// `created_at`, and `metadata` are taken exactly as given rather than
    /// derived from the existing record. The record becomes its own replay
    /// base (`base_version := version`, `base_state := state`), since the
    /// patches that produced it may not be known locally (e.g. it was
    /// computed by resolving a conflict against a remote writer's record).
    ///
    /// # Errors
    /// Returns [`StoreError::Substrate`] on a replication failure.
    pub async fn replace(&self, mut actor: ActorState) -> Result<ActorState, StoreError> {
        let is_new = self.load(&actor.actor_id).await?.is_none();
        actor.base_version = actor.version;
        actor.base_state = actor.state.clone();
        self.persist(&actor).await?;
        if is_new {
            self.substrate
                .put(keys::actor_type_index(&actor.actor_type, &actor.actor_id), marker())
                .await?;
            self.substrate.put(keys::actor_all_index(&actor.actor_id), marker()).await?;
        }
        tracing::debug!(actor_id = %actor.actor_id, version = actor.version, "replace");
        Ok(actor)
    }

    /// Raise `base_version` to the current version, recording the current
    /// state as the new replay base. When `compact` is set, patch entries
    /// at or below the new base are physically removed (spec.md §9 open
    /// question 3); otherwise they are left in place.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if no record exists for `actor_id`.
    pub async fn snapshot(&self, actor_id: &str, compact: bool) -> Result<(), StoreError> {
        let Some(mut actor) = self.load(actor_id).await? else {
            return Err(StoreError::NotFound(actor_id.to_string()));
        };
        actor.base_version = actor.version;
        actor.base_state = actor.state.clone();
        self.persist(&actor).await?;

        if compact {
            let versions = self.substrate.list(&keys::patches_root(actor_id)).await?;
            for raw in versions {
                if let Ok(v) = raw.parse::<u64>() {
                    if v <= actor.base_version {
                        self.substrate.delete(&keys::patch(actor_id, v)).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn load(&self, actor_id: &str) -> Result<Option<ActorState>, StoreError> {
        let path = keys::actor(actor_id);
        let Some(value) = self.substrate.get(&path).await? else {
            return Ok(None);
        };
        let raw = scalar_string(&value, &path)?;
        Ok(Some(mesh_substrate::decode_nested(raw)?))
    }

    async fn load_patch(&self, actor_id: &str, version: u64) -> Result<Option<PatchEntry>, StoreError> {
        let path = keys::patch(actor_id, version);
        let Some(value) = self.substrate.get(&path).await? else {
            return Ok(None);
        };
        let raw = scalar_string(&value, &path)?;
        Ok(Some(mesh_substrate::decode_nested(raw)?))
    }

    async fn persist(&self, actor: &ActorState) -> Result<(), StoreError> {
        self.substrate
            .put(
                keys::actor(&actor.actor_id),
                Value::Scalar(Scalar::String(encode_nested(actor)?)),
            )
            .await?;
        Ok(())
    }

    async fn write_patch(
        &self,
        actor_id: &str,
        version: u64,
        timestamp: i64,
        patches: Vec<PatchOp>,
    ) -> Result<(), StoreError> {
        let entry = PatchEntry {
            actor_id: actor_id.to_string(),
            version,
            timestamp,
            patches,
        };
        self.substrate
            .put(
                keys::patch(actor_id, version),
                Value::Scalar(Scalar::String(encode_nested(&entry)?)),
            )
            .await?;
        Ok(())
    }
}

fn marker() -> Value {
    Value::Scalar(Scalar::Bool(true))
}

fn scalar_string<'a>(value: &'a Value, path: &Path) -> Result<&'a str, StoreError> {
    match value {
        Value::Scalar(Scalar::String(s)) => Ok(s),
        _ => Err(StoreError::Substrate(SubstrateError::Corrupt {
            path: path.clone(),
            source: serde::de::Error::custom("expected a JSON-string document leaf"),
        })),
    }
}

/// Deep-merge `partial` over `base`: objects merge key-by-key recursively;
/// any other value (scalar, array, or a type mismatch) is replaced wholesale.
pub fn merge(base: &Json, partial: &Json) -> Json {
    match (base, partial) {
        (Json::Object(base_map), Json::Object(partial_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in partial_map {
                let next = match merged.get(key) {
                    Some(existing) => merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Json::Object(merged)
        }
        _ => partial.clone(),
    }
}

/// Structural diff between `old` and `new`, as JSON-pointer-style
/// add/replace/remove operations. Arrays are compared wholesale (a changed
/// array produces a single `replace` at its path) rather than diffed
/// element-by-element.
pub fn diff(old: &Json, new: &Json, path: &mut Vec<String>) -> Vec<PatchOp> {
    match (old, new) {
        (Json::Object(old_map), Json::Object(new_map)) => {
            let mut ops = Vec::new();
            for (key, new_value) in new_map {
                path.push(key.clone());
                match old_map.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value) => ops.extend(diff(old_value, new_value, path)),
                    None => ops.push(PatchOp::Add {
                        path: path.clone(),
                        value: new_value.clone(),
                    }),
                }
                path.pop();
            }
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    path.push(key.clone());
                    ops.push(PatchOp::Remove { path: path.clone() });
                    path.pop();
                }
            }
            ops
        }
        _ if old == new => Vec::new(),
        (Json::Null, _) => vec![PatchOp::Add {
            path: path.clone(),
            value: new.clone(),
        }],
        _ => vec![PatchOp::Replace {
            path: path.clone(),
            value: new.clone(),
        }],
    }
}

/// Apply a list of patch operations to `state` in order.
pub fn apply(state: &mut Json, patches: &[PatchOp]) {
    for patch in patches {
        match patch {
            PatchOp::Add { path, value } | PatchOp::Replace { path, value } => {
                set_at(state, path, value.clone());
            }
            PatchOp::Remove { path } => {
                remove_at(state, path);
            }
        }
    }
}

fn set_at(state: &mut Json, path: &[String], value: Json) {
    if path.is_empty() {
        *state = value;
        return;
    }
    if !state.is_object() {
        *state = Json::Object(serde_json::Map::new());
    }
    if let Json::Object(map) = state {
        let (head, rest) = (&path[0], &path[1..]);
        if rest.is_empty() {
            map.insert(head.clone(), value);
        } else {
            let entry = map
                .entry(head.clone())
                .or_insert_with(|| Json::Object(serde_json::Map::new()));
            set_at(entry, rest, value);
        }
    }
}

fn remove_at(state: &mut Json, path: &[String]) {
    let Json::Object(map) = state else { return };
    if path.len() == 1 {
        map.remove(&path[0]);
        return;
    }
    if let Some(child) = map.get_mut(&path[0]) {
        remove_at(child, &path[1..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_substrate::InMemorySubstrate;
    use serde_json::json;

    fn store() -> ActorStore<InMemorySubstrate> {
        ActorStore::new(Arc::new(InMemorySubstrate::new()))
    }

    #[tokio::test]
    async fn set_creates_actor_at_version_one() {
        let store = store();
        let actor = store
            .set("a1", "widget", json!({"color": "red"}), 100)
            .await
            .expect("set");
        assert_eq!(actor.version, 1);
        assert_eq!(actor.state, json!({"color": "red"}));
    }

    #[tokio::test]
    async fn set_merges_over_prior_state() {
        let store = store();
        store.set("a1", "widget", json!({"color": "red", "size": 3}), 1).await.expect("set 1");
        let actor = store.set("a1", "widget", json!({"color": "blue"}), 2).await.expect("set 2");
        assert_eq!(actor.state, json!({"color": "blue", "size": 3}));
        assert_eq!(actor.version, 2);
    }

    #[tokio::test]
    async fn update_unknown_actor_fails_not_found() {
        let store = store();
        let err = store.update("missing", json!({}), 1).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn get_state_at_replays_history() {
        let store = store();
        store.set("a1", "widget", json!({"n": 1}), 1).await.expect("v1");
        store.set("a1", "widget", json!({"n": 2}), 2).await.expect("v2");
        store.set("a1", "widget", json!({"n": 3}), 3).await.expect("v3");

        let at_v2 = store.get_state_at("a1", 2).await.expect("replay").expect("present");
        assert_eq!(at_v2.state, json!({"n": 2}));
        assert_eq!(at_v2.version, 2);
    }

    #[tokio::test]
    async fn get_state_at_current_or_future_version_returns_current() {
        let store = store();
        store.set("a1", "widget", json!({"n": 1}), 1).await.expect("v1");
        let at_v9 = store.get_state_at("a1", 9).await.expect("replay").expect("present");
        assert_eq!(at_v9.version, 1);
    }

    #[tokio::test]
    async fn snapshot_without_compact_keeps_old_patches_queryable() {
        let store = store();
        store.set("a1", "widget", json!({"n": 1}), 1).await.expect("v1");
        store.set("a1", "widget", json!({"n": 2}), 2).await.expect("v2");
        store.snapshot("a1", false).await.expect("snapshot");
        store.set("a1", "widget", json!({"n": 3}), 3).await.expect("v3");

        let at_v2 = store.get_state_at("a1", 2).await.expect("replay").expect("present");
        assert_eq!(at_v2.state, json!({"n": 2}));
    }

    #[tokio::test]
    async fn snapshot_with_compact_raises_history_compacted() {
        let store = store();
        store.set("a1", "widget", json!({"n": 1}), 1).await.expect("v1");
        store.set("a1", "widget", json!({"n": 2}), 2).await.expect("v2");
        store.snapshot("a1", true).await.expect("snapshot");
        store.set("a1", "widget", json!({"n": 3}), 3).await.expect("v3");

        let err = store.get_state_at("a1", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::HistoryCompacted { .. }));
    }

    #[tokio::test]
    async fn delete_leaves_patch_log_intact() {
        let store = store();
        store.set("a1", "widget", json!({"n": 1}), 1).await.expect("v1");
        assert!(store.delete("a1").await.expect("delete"));
        assert!(store.get("a1").await.expect("get").is_none());
        let patches = store.get_patches("a1", 0).await.expect("patches");
        assert_eq!(patches.len(), 1);
    }

    #[tokio::test]
    async fn replace_preserves_caller_supplied_version_on_existing_actor() {
        let actors = store();
        actors.set("a1", "widget", json!({"n": 1}), 1_000).await.unwrap();
        let local = actors.get("a1").await.unwrap().unwrap();

        let winner = ActorState {
            version: 5,
            last_modified: 2_000,
            state: json!({"n": 9}),
            ..local
        };
        let replaced = actors.replace(winner.clone()).await.unwrap();
        assert_eq!(replaced.version, 5);

        let stored = actors.get("a1").await.unwrap().unwrap();
        assert_eq!(stored.version, 5, "replace must not recompute version as local + 1");
        assert_eq!(stored.state, json!({"n": 9}));
        assert_eq!(stored.base_version, 5, "replace makes the record its own replay base");
        assert_eq!(stored.base_state, json!({"n": 9}));
    }

    #[tokio::test]
    async fn replace_creates_a_brand_new_actor_verbatim() {
        let actors = store();
        let winner = ActorState {
            actor_id: "new1".to_string(),
            actor_type: "widget".to_string(),
            version: 7,
            base_version: 0,
            base_state: json!(null),
            state: json!({"n": 1}),
            created_at: 500,
            last_modified: 500,
            metadata: std::collections::BTreeMap::new(),
        };
        actors.replace(winner).await.unwrap();

        let stored = actors.get("new1").await.unwrap().unwrap();
        assert_eq!(stored.version, 7);
        assert_eq!(stored.created_at, 500);
        assert_eq!(stored.base_version, 7);
    }

    #[test]
    fn diff_produces_add_replace_remove() {
        let old = json!({"a": 1, "b": 2});
        let new = json!({"a": 1, "b": 3, "c": 4});
        let ops = diff(&old, &new, &mut Vec::new());
        assert!(ops.iter().any(|op| matches!(op, PatchOp::Replace { path, .. } if path == &["b".to_string()])));
        assert!(ops.iter().any(|op| matches!(op, PatchOp::Add { path, .. } if path == &["c".to_string()])));
    }
}
