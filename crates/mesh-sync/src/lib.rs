// SPDX-License-Identifier: Apache-2.0
//! The synchronizer: wires the local graph/actor stores to the replication
//! substrate (spec.md §4.3). Owns three things a plain store does not:
//! debounced broadcast, a per-key circuit breaker, and conflict
//! detection/resolution for actor records arriving from remote writers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::Value as Json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use mesh_graph::{Edge, GraphChange, GraphStore, Node};
use mesh_store::{ActorState, ActorStore};
use mesh_substrate::{keys, Scalar, Substrate, Value};

/// How conflicting actor records are resolved (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictResolution {
    /// Keep the record with the greater `last_modified`.
    #[default]
    LastWriteWins,
    /// Keep the record with the greater `version`.
    HighestVersion,
    /// Shallow-merge `state`; `version := max(local, remote) + 1`.
    Merge,
}

/// Tunables for a [`Synchronizer`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Coalescing window for `broadcast_state_change`.
    pub debounce: Duration,
    /// Consecutive failures before a key's breaker opens.
    pub breaker_threshold: u32,
    /// How long a breaker stays open before allowing a half-open probe.
    pub breaker_reset: Duration,
    /// Strategy used to pick a winner when a conflict is detected.
    pub resolution: ConflictResolution,
    /// Whether the resolved winner is written back as the new authoritative
    /// record.
    pub auto_resolve: bool,
    /// Ring-buffer capacity for `get_change_history`.
    pub history_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
            breaker_threshold: 5,
            breaker_reset: Duration::from_secs(30),
            resolution: ConflictResolution::LastWriteWins,
            auto_resolve: true,
            history_capacity: 1000,
        }
    }
}

/// Events emitted by a running [`Synchronizer`].
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// `start_sync` brought the synchronizer up.
    Connected,
    /// `stop_sync` brought it down.
    Disconnected,
    /// A remote write to the graph store was observed and applied locally.
    RemoteChange(GraphChange),
    /// A remote actor write landed more than one version ahead of local and
    /// arrived with a newer timestamp.
    ConflictDetected {
        /// The actor whose record conflicted.
        actor_id: String,
        /// The locally held record, if any.
        local: Option<ActorState>,
        /// The incoming remote record.
        remote: ActorState,
        /// The record chosen by the configured resolution strategy.
        resolved: Option<ActorState>,
    },
    /// A wrapped write operation failed.
    SyncError(String),
    /// A key's circuit breaker opened.
    CircuitOpen(String),
    /// A key's circuit breaker closed again.
    CircuitClosed(String),
}

/// Errors surfaced directly by [`Synchronizer`] wrapped operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The key's breaker is open; the call failed fast without being tried.
    #[error("circuit open for {0}")]
    CircuitOpen(String),
    /// The wrapped operation itself failed.
    #[error("{0}")]
    Upstream(String),
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed,
    Open(Instant),
    HalfOpen,
}

struct Breaker {
    state: BreakerState,
    failures: u32,
}

impl Default for Breaker {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
        }
    }
}

struct SyncState {
    running: bool,
    breakers: HashMap<String, Breaker>,
    history: VecDeque<GraphChange>,
    local_actor_versions: HashMap<String, (u64, i64)>,
    known_node_ids: HashSet<String>,
    known_edge_ids: HashSet<String>,
    debounce_tasks: HashMap<String, tokio::task::JoinHandle<()>>,
    watch_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            running: false,
            breakers: HashMap::new(),
            history: VecDeque::new(),
            local_actor_versions: HashMap::new(),
            known_node_ids: HashSet::new(),
            known_edge_ids: HashSet::new(),
            debounce_tasks: HashMap::new(),
            watch_tasks: Vec::new(),
        }
    }
}

/// The synchronizer (spec.md §4.3), generic over any [`Substrate`]
/// implementation.
pub struct Synchronizer<S> {
    substrate: Arc<S>,
    graph: Arc<GraphStore<S>>,
    actors: Arc<ActorStore<S>>,
    config: SyncConfig,
    state: Arc<Mutex<SyncState>>,
    events_tx: mpsc::UnboundedSender<SyncEvent>,
}

impl<S: Substrate + 'static> Synchronizer<S> {
    /// Build a synchronizer over shared store handles, returning it along
    /// with the event receiver callers should drain.
    pub fn new(
        substrate: Arc<S>,
        graph: Arc<GraphStore<S>>,
        actors: Arc<ActorStore<S>>,
        config: SyncConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                substrate,
                graph,
                actors,
                config,
                state: Arc::new(Mutex::new(SyncState::default())),
                events_tx,
            },
            events_rx,
        )
    }

    /// Start the remote-change watch loops. Idempotent.
    pub async fn start_sync(&self) {
        let mut guard = self.state.lock().await;
        if guard.running {
            return;
        }
        guard.running = true;

        guard.watch_tasks.push(tokio::spawn(watch_nodes(
            self.substrate.clone(),
            self.state.clone(),
            self.events_tx.clone(),
        )));
        guard.watch_tasks.push(tokio::spawn(watch_edges(
            self.substrate.clone(),
            self.state.clone(),
            self.events_tx.clone(),
        )));
        guard.watch_tasks.push(tokio::spawn(watch_actors(
            self.substrate.clone(),
            self.actors.clone(),
            self.state.clone(),
            self.events_tx.clone(),
            self.config.clone(),
        )));
        drop(guard);

        let _ = self.events_tx.send(SyncEvent::Connected);
    }

    /// Stop the watch loops and cancel any pending debounce timers.
    /// Idempotent.
    pub async fn stop_sync(&self) {
        let mut guard = self.state.lock().await;
        if !guard.running {
            return;
        }
        guard.running = false;
        for task in guard.watch_tasks.drain(..) {
            task.abort();
        }
        for (_, task) in guard.debounce_tasks.drain() {
            task.abort();
        }
        drop(guard);

        let _ = self.events_tx.send(SyncEvent::Disconnected);
    }

    /// Circuit-breaker-wrapped [`GraphStore::put_node`].
    ///
    /// # Errors
    /// Returns [`SyncError::CircuitOpen`] if the node's key has tripped the
    /// breaker, or [`SyncError::Upstream`] if the write itself failed.
    pub async fn put_node(&self, node: Node, now: i64) -> Result<Node, SyncError> {
        let key = format!("node:{}", node.id);
        self.guarded(&key, self.graph.put_node(node, now)).await
    }

    /// Circuit-breaker-wrapped [`GraphStore::delete_node`].
    ///
    /// # Errors
    /// Returns [`SyncError::CircuitOpen`] or [`SyncError::Upstream`].
    pub async fn delete_node(&self, id: &str) -> Result<bool, SyncError> {
        let key = format!("node:{id}");
        self.guarded(&key, self.graph.delete_node(id)).await
    }

    /// Circuit-breaker-wrapped [`GraphStore::put_edge`].
    ///
    /// # Errors
    /// Returns [`SyncError::CircuitOpen`] or [`SyncError::Upstream`].
    pub async fn put_edge(&self, edge: Edge, now: i64) -> Result<Edge, SyncError> {
        let key = format!("edge:{}", edge.id);
        self.guarded(&key, self.graph.put_edge(edge, now)).await
    }

    /// Circuit-breaker-wrapped [`GraphStore::delete_edge`].
    ///
    /// # Errors
    /// Returns [`SyncError::CircuitOpen`] or [`SyncError::Upstream`].
    pub async fn delete_edge(&self, id: &str) -> Result<bool, SyncError> {
        let key = format!("edge:{id}");
        self.guarded(&key, self.graph.delete_edge(id)).await
    }

    /// Debounced actor-state broadcast: a second call for the same
    /// `actor_id` within the debounce window cancels the pending write and
    /// replaces it with this one.
    pub async fn broadcast_state_change(&self, actor_id: String, actor_type: String, state: Json) {
        let mut guard = self.state.lock().await;
        if let Some(handle) = guard.debounce_tasks.remove(&actor_id) {
            handle.abort();
        }
        drop(guard);

        let actors = self.actors.clone();
        let sync_state = self.state.clone();
        let debounce = self.config.debounce;
        let task_id = actor_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Err(err) = actors.set(&task_id, &actor_type, state, now_millis()).await {
                warn!(actor_id = %task_id, %err, "debounced broadcast failed");
            }
            sync_state.lock().await.debounce_tasks.remove(&task_id);
        });
        self.state.lock().await.debounce_tasks.insert(actor_id, handle);
    }

    /// Bypass the debounce window and write immediately, cancelling any
    /// pending debounced write for the same actor.
    ///
    /// # Errors
    /// Returns [`SyncError::CircuitOpen`] or [`SyncError::Upstream`].
    pub async fn broadcast_immediate(
        &self,
        actor_id: &str,
        actor_type: &str,
        state: Json,
    ) -> Result<ActorState, SyncError> {
        if let Some(handle) = self.state.lock().await.debounce_tasks.remove(actor_id) {
            handle.abort();
        }
        let key = format!("actor:{actor_id}");
        self.guarded(&key, self.actors.set(actor_id, actor_type, state, now_millis()))
            .await
    }

    /// The last `history_capacity` applied remote changes, oldest first.
    pub async fn get_change_history(&self) -> Vec<GraphChange> {
        self.state.lock().await.history.iter().cloned().collect()
    }

    /// Clear the change history ring buffer.
    pub async fn clear_change_history(&self) {
        self.state.lock().await.history.clear();
    }

    async fn guarded<T, E, Fut>(&self, key: &str, fut: Fut) -> Result<T, SyncError>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if !self.breaker_allows(key).await {
            return Err(SyncError::CircuitOpen(key.to_string()));
        }
        match fut.await {
            Ok(value) => {
                self.breaker_record_success(key).await;
                Ok(value)
            }
            Err(err) => {
                self.breaker_record_failure(key).await;
                let message = err.to_string();
                let _ = self.events_tx.send(SyncEvent::SyncError(message.clone()));
                Err(SyncError::Upstream(message))
            }
        }
    }

    async fn breaker_allows(&self, key: &str) -> bool {
        let mut guard = self.state.lock().await;
        let breaker = guard.breakers.entry(key.to_string()).or_default();
        match breaker.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open(opened_at) => {
                if opened_at.elapsed() >= self.config.breaker_reset {
                    breaker.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn breaker_record_success(&self, key: &str) {
        let mut guard = self.state.lock().await;
        let breaker = guard.breakers.entry(key.to_string()).or_default();
        let was_open = !matches!(breaker.state, BreakerState::Closed);
        breaker.state = BreakerState::Closed;
        breaker.failures = 0;
        drop(guard);
        if was_open {
            let _ = self.events_tx.send(SyncEvent::CircuitClosed(key.to_string()));
        }
    }

    async fn breaker_record_failure(&self, key: &str) {
        let mut guard = self.state.lock().await;
        let breaker = guard.breakers.entry(key.to_string()).or_default();
        let newly_opened = match breaker.state {
            BreakerState::HalfOpen => {
                breaker.state = BreakerState::Open(Instant::now());
                true
            }
            BreakerState::Closed => {
                breaker.failures += 1;
                if breaker.failures >= self.config.breaker_threshold {
                    breaker.state = BreakerState::Open(Instant::now());
                    true
                } else {
                    false
                }
            }
            BreakerState::Open(_) => false,
        };
        drop(guard);
        if newly_opened {
            let _ = self.events_tx.send(SyncEvent::CircuitOpen(key.to_string()));
        }
    }
}

fn now_millis() -> i64 {
    #[allow(clippy::cast_possible_wrap)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

async fn push_history(state: &Arc<Mutex<SyncState>>, capacity: usize, change: GraphChange) {
    let mut guard = state.lock().await;
    guard.history.push_back(change);
    while guard.history.len() > capacity {
        guard.history.pop_front();
    }
}

async fn watch_nodes<S: Substrate>(
    substrate: Arc<S>,
    state: Arc<Mutex<SyncState>>,
    events_tx: mpsc::UnboundedSender<SyncEvent>,
) {
    let mut sub = substrate.watch(keys::nodes_root()).await;
    while let Some(event) = sub.recv().await {
        let change = match event.value {
            None => {
                let id = last_segment(&event.path);
                let mut guard = state.lock().await;
                guard.known_node_ids.remove(&id);
                drop(guard);
                GraphChange::NodeDeleted { id }
            }
            Some(value) => {
                let Some(node) = decode_entity::<Node>(&value) else {
                    continue;
                };
                let mut guard = state.lock().await;
                let is_new = guard.known_node_ids.insert(node.id.clone());
                drop(guard);
                if is_new {
                    GraphChange::NodeCreated(node)
                } else {
                    GraphChange::NodeUpdated(node)
                }
            }
        };
        debug!(?change, "observed remote node change");
        push_history(&state, 1000, change.clone()).await;
        let _ = events_tx.send(SyncEvent::RemoteChange(change));
    }
}

async fn watch_edges<S: Substrate>(
    substrate: Arc<S>,
    state: Arc<Mutex<SyncState>>,
    events_tx: mpsc::UnboundedSender<SyncEvent>,
) {
    let mut sub = substrate.watch(keys::edges_root()).await;
    while let Some(event) = sub.recv().await {
        let change = match event.value {
            None => {
                let id = last_segment(&event.path);
                let mut guard = state.lock().await;
                guard.known_edge_ids.remove(&id);
                drop(guard);
                GraphChange::EdgeDeleted { id }
            }
            Some(value) => {
                let Some(edge) = decode_entity::<Edge>(&value) else {
                    continue;
                };
                let mut guard = state.lock().await;
                let is_new = guard.known_edge_ids.insert(edge.id.clone());
                drop(guard);
                if is_new {
                    GraphChange::EdgeCreated(edge)
                } else {
                    GraphChange::EdgeUpdated(edge)
                }
            }
        };
        debug!(?change, "observed remote edge change");
        push_history(&state, 1000, change.clone()).await;
        let _ = events_tx.send(SyncEvent::RemoteChange(change));
    }
}

async fn watch_actors<S: Substrate>(
    substrate: Arc<S>,
    actors: Arc<ActorStore<S>>,
    state: Arc<Mutex<SyncState>>,
    events_tx: mpsc::UnboundedSender<SyncEvent>,
    config: SyncConfig,
) {
    let mut sub = substrate.watch(keys::actors_root()).await;
    while let Some(event) = sub.recv().await {
        let Some(value) = event.value else { continue };
        let Some(remote) = decode_entity::<ActorState>(&value) else {
            continue;
        };

        let mut guard = state.lock().await;
        let local_entry = guard.local_actor_versions.get(&remote.actor_id).copied();

        let Some((local_version, local_last_modified)) = local_entry else {
            guard
                .local_actor_versions
                .insert(remote.actor_id.clone(), (remote.version, remote.last_modified));
            continue;
        };

        if remote.version <= local_version {
            continue; // stale, ignore
        }

        if remote.version == local_version + 1 {
            guard
                .local_actor_versions
                .insert(remote.actor_id.clone(), (remote.version, remote.last_modified));
            continue;
        }

        drop(guard);

        if remote.last_modified <= local_last_modified {
            // Forward jump without a newer timestamp: not flagged as a
            // conflict by spec.md §4.3's third rule; accept it.
            state
                .lock()
                .await
                .local_actor_versions
                .insert(remote.actor_id.clone(), (remote.version, remote.last_modified));
            continue;
        }

        let local_actor = actors.get(&remote.actor_id).await.ok().flatten();
        let resolved = resolve_conflict(&config, local_actor.clone(), remote.clone());
        if config.auto_resolve {
            if let Some(winner) = &resolved {
                if let Err(err) = actors.replace(winner.clone()).await {
                    warn!(actor_id = %winner.actor_id, %err, "failed to write back resolved conflict");
                }
            }
        }
        if let Some(winner) = &resolved {
            state
                .lock()
                .await
                .local_actor_versions
                .insert(winner.actor_id.clone(), (winner.version, winner.last_modified));
        }

        let _ = events_tx.send(SyncEvent::ConflictDetected {
            actor_id: remote.actor_id.clone(),
            local: local_actor,
            remote,
            resolved,
        });
    }
}

fn resolve_conflict(config: &SyncConfig, local: Option<ActorState>, remote: ActorState) -> Option<ActorState> {
    let Some(local) = local else {
        return Some(remote);
    };
    Some(match config.resolution {
        ConflictResolution::LastWriteWins => {
            if remote.last_modified >= local.last_modified {
                remote
            } else {
                local
            }
        }
        ConflictResolution::HighestVersion => {
            if remote.version >= local.version {
                remote
            } else {
                local
            }
        }
        ConflictResolution::Merge => {
            let merged_state = mesh_store::merge(&local.state, &remote.state);
            ActorState {
                actor_id: remote.actor_id,
                actor_type: remote.actor_type,
                state: merged_state,
                version: local.version.max(remote.version) + 1,
                base_version: local.base_version,
                base_state: local.base_state,
                created_at: local.created_at.min(remote.created_at),
                last_modified: now_millis(),
                metadata: remote.metadata,
            }
        }
    })
}

fn decode_entity<T: serde::de::DeserializeOwned>(value: &Value) -> Option<T> {
    let raw = match value {
        Value::Scalar(Scalar::String(s)) => s,
        _ => return None,
    };
    mesh_substrate::decode_nested(raw).ok()
}

fn last_segment(path: &mesh_substrate::Path) -> String {
    path.segments().last().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_substrate::InMemorySubstrate;
    use serde_json::json;
    use tokio::time::{timeout, Duration as TokioDuration};

    fn build() -> (
        Synchronizer<InMemorySubstrate>,
        mpsc::UnboundedReceiver<SyncEvent>,
        Arc<ActorStore<InMemorySubstrate>>,
    ) {
        let substrate = Arc::new(InMemorySubstrate::new());
        let graph = Arc::new(GraphStore::new(substrate.clone()));
        let actors = Arc::new(ActorStore::new(substrate.clone()));
        let (sync, rx) = Synchronizer::new(substrate, graph, actors.clone(), SyncConfig::default());
        (sync, rx, actors)
    }

    #[tokio::test]
    async fn start_sync_is_idempotent_and_emits_connected_once() {
        let (sync, mut rx, _actors) = build();
        sync.start_sync().await;
        sync.start_sync().await;
        let first = timeout(TokioDuration::from_millis(200), rx.recv()).await.unwrap();
        assert!(matches!(first, Some(SyncEvent::Connected)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn put_node_wrapped_through_breaker_succeeds() {
        let (sync, _rx, _actors) = build();
        let node = Node {
            id: "a".to_string(),
            node_type: "widget".to_string(),
            properties: Default::default(),
            metadata: Default::default(),
        };
        let result = sync.put_node(node, 1).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn broadcast_state_change_coalesces_rapid_writes() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let graph = Arc::new(GraphStore::new(substrate.clone()));
        let actors = Arc::new(ActorStore::new(substrate.clone()));
        let config = SyncConfig {
            debounce: Duration::from_millis(30),
            ..SyncConfig::default()
        };
        let (sync, _rx, actors) = {
            let (s, r) = Synchronizer::new(substrate, graph, actors.clone(), config);
            (s, r, actors)
        };
        sync.broadcast_state_change("a1".to_string(), "widget".to_string(), json!({"n": 1}))
            .await;
        sync.broadcast_state_change("a1".to_string(), "widget".to_string(), json!({"n": 2}))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let actor = actors.get("a1").await.expect("get").expect("present");
        assert_eq!(actor.state, json!({"n": 2}));
        assert_eq!(actor.version, 1, "only one write should have landed");
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_threshold_failures() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let graph = Arc::new(GraphStore::new(substrate.clone()));
        let actors = Arc::new(ActorStore::new(substrate.clone()));
        let config = SyncConfig {
            breaker_threshold: 2,
            ..SyncConfig::default()
        };
        let (sync, mut rx, _actors) = Synchronizer::new(substrate, graph, actors, config);

        for _ in 0..2 {
            let bad_edge = Edge {
                id: String::new(),
                from: "a".to_string(),
                to: "b".to_string(),
                edge_type: "knows".to_string(),
                properties: Default::default(),
                weight: 1.0,
                directed: true,
                metadata: Default::default(),
            };
            let _ = sync.put_edge(bad_edge, 1).await;
        }

        let mut saw_open = false;
        while let Ok(Some(event)) = timeout(TokioDuration::from_millis(200), rx.recv()).await {
            if matches!(event, SyncEvent::CircuitOpen(_)) {
                saw_open = true;
                break;
            }
        }
        assert!(saw_open, "breaker should have opened after repeated failures");
    }

    fn actor_at(version: u64, last_modified: i64) -> ActorState {
        ActorState {
            actor_id: "a1".to_string(),
            actor_type: "widget".to_string(),
            state: json!({"version": version}),
            version,
            base_version: 0,
            base_state: Json::Null,
            created_at: 0,
            last_modified,
            metadata: std::collections::BTreeMap::new(),
        }
    }

    #[test]
    fn resolve_conflict_highest_version_ignores_timestamps() {
        let config = SyncConfig {
            resolution: ConflictResolution::HighestVersion,
            ..SyncConfig::default()
        };
        let local = actor_at(5, 1_000);
        let remote = actor_at(7, 500);
        let winner = resolve_conflict(&config, Some(local), remote.clone()).unwrap();
        assert_eq!(winner.version, remote.version);
    }

    #[test]
    fn resolve_conflict_merge_bumps_version_past_both() {
        let config = SyncConfig {
            resolution: ConflictResolution::Merge,
            ..SyncConfig::default()
        };
        let local = actor_at(3, 1_000);
        let remote = actor_at(5, 2_000);
        let winner = resolve_conflict(&config, Some(local), remote).unwrap();
        assert_eq!(winner.version, 6);
    }

    #[tokio::test]
    async fn auto_resolve_write_back_preserves_winner_version() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let actors = Arc::new(ActorStore::new(substrate));
        actors.set("a1", "widget", json!({"n": 1}), 1_000).await.unwrap();

        let config = SyncConfig {
            resolution: ConflictResolution::HighestVersion,
            ..SyncConfig::default()
        };
        let local = actors.get("a1").await.unwrap().unwrap();
        let remote = actor_at(5, 2_000);
        let winner = resolve_conflict(&config, Some(local), remote).unwrap();

        actors.replace(winner).await.unwrap();

        let stored = actors.get("a1").await.unwrap().unwrap();
        assert_eq!(stored.version, 5, "write-back must keep the resolved winner's version, not local + 1");
    }
}
