// SPDX-License-Identifier: Apache-2.0
//! The service shell (spec.md §4.6): owns `start`/`stop`/`getHealth`/
//! `getMetrics`, wiring the substrate, graph store, actor store,
//! synchronizer, transaction manager, and query engine into one lifecycle
//! object. Peer connectivity is dialed through an injectable [`PeerDialer`]
//! since the actual transport is a non-core surface (spec.md §1, §6).

pub mod backoff;
pub mod config;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use mesh_graph::GraphStore;
use mesh_query::QueryEngine;
use mesh_store::ActorStore;
use mesh_substrate::{Path as SubstratePath, Scalar, Substrate, Value};
use mesh_sync::{SyncConfig, Synchronizer};
use mesh_txn::TransactionManager;

pub use config::{MeshConfig, PeersConfig, StorageConfig, StorageKind, WebSocketConfig};

/// Outcome of a single dial attempt to a peer endpoint.
#[async_trait::async_trait]
pub trait PeerDialer: Send + Sync {
    /// Attempt to connect to `endpoint`, bounded by `timeout`.
    ///
    /// # Errors
    /// Returns a human-readable cause on failure; the caller retries with
    /// backoff.
    async fn dial(&self, endpoint: &str, timeout: Duration) -> Result<(), String>;
}

/// Dialer used when no real transport is wired in: every endpoint is
/// reported connected immediately. Standing in for the non-core transport
/// layer (spec.md §1 excludes the wire protocol from this crate's scope).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDialer;

#[async_trait::async_trait]
impl PeerDialer for NoopDialer {
    async fn dial(&self, _endpoint: &str, _timeout: Duration) -> Result<(), String> {
        Ok(())
    }
}

/// The service's lifecycle state (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Constructed but `start` has not been called.
    Idle,
    /// `start` is running.
    Starting,
    /// `start` completed successfully.
    Running,
    /// `stop` is running.
    Stopping,
    /// `stop` completed.
    Stopped,
    /// `start` failed; cleanup handlers have run.
    Error,
}

/// Aggregate health derived from peer connectivity (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// No peers configured, or a majority of configured peers connected.
    Healthy,
    /// Some peers connected but short of a majority.
    Degraded,
    /// Peers configured but none connected.
    Unhealthy,
}

/// A point-in-time metrics snapshot (spec.md §4.6, expanded into a
/// concrete, serializable type rather than loose getters).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceMetrics {
    /// Count of peers currently marked connected.
    pub connected_peers: usize,
    /// Count of configured peer endpoints.
    pub total_peers: usize,
    /// `"memory"`, `"disk"`, or the custom adapter name.
    pub storage_type: String,
    /// Bytes used under the storage path, when backed by disk.
    pub disk_usage: Option<u64>,
    /// Milliseconds since `start` completed, or `0` if not running.
    pub uptime_ms: u64,
    /// Current lifecycle state.
    pub state: ServiceState,
    /// Count of failed `start` attempts plus dial failures since creation.
    pub error_count: u64,
}

/// Errors raised directly by the service shell (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// `storage.path` could not be created or is not writable.
    #[error("storage init failed: {0}")]
    Storage(String),
    /// The substrate did not answer a start-time reachability probe.
    #[error("substrate unreachable: {0}")]
    Substrate(String),
    /// An operation was invoked before `start()` completed.
    #[error("service not ready")]
    NotReady,
}

struct PeerState {
    connected: bool,
}

/// The service shell: owns every component crate's handle and exposes the
/// spec's lifecycle surface over them.
pub struct Service<S, D = NoopDialer> {
    config: MeshConfig,
    substrate: Arc<S>,
    dialer: Arc<D>,
    pub graph: Arc<GraphStore<S>>,
    pub actors: Arc<ActorStore<S>>,
    pub sync: Arc<Synchronizer<S>>,
    pub txn: Arc<TransactionManager<S>>,
    pub query: Arc<QueryEngine<S>>,
    state: Arc<Mutex<ServiceState>>,
    peers: Arc<Mutex<HashMap<String, PeerState>>>,
    started_at: Arc<Mutex<Option<Instant>>>,
    error_count: Arc<AtomicU64>,
    cleanup_handlers: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>>,
}

impl<S: Substrate + 'static> Service<S, NoopDialer> {
    /// Build a service with the default no-op peer dialer.
    pub fn new(config: MeshConfig, substrate: Arc<S>) -> Self {
        Self::with_dialer(config, substrate, Arc::new(NoopDialer))
    }
}

impl<S: Substrate + 'static, D: PeerDialer + 'static> Service<S, D> {
    /// Build a service over an injected peer dialer, for tests that need to
    /// exercise retry/backoff or connection failure paths.
    pub fn with_dialer(config: MeshConfig, substrate: Arc<S>, dialer: Arc<D>) -> Self {
        let graph = Arc::new(GraphStore::new(substrate.clone()));
        let actors = Arc::new(ActorStore::new(substrate.clone()));
        let (sync, mut sync_events) = Synchronizer::new(
            substrate.clone(),
            graph.clone(),
            actors.clone(),
            SyncConfig {
                debounce: Duration::from_millis(250),
                ..SyncConfig::default()
            },
        );
        let sync = Arc::new(sync);
        tokio::spawn(async move { while sync_events.recv().await.is_some() {} });

        let txn = Arc::new(TransactionManager::new(graph.clone()));
        let query = Arc::new(QueryEngine::new(graph.clone()));

        let peers = config
            .peers
            .endpoints
            .iter()
            .map(|endpoint| (endpoint.clone(), PeerState { connected: false }))
            .collect();

        Self {
            config,
            substrate,
            dialer,
            graph,
            actors,
            sync,
            txn,
            query,
            state: Arc::new(Mutex::new(ServiceState::Idle)),
            peers: Arc::new(Mutex::new(peers)),
            started_at: Arc::new(Mutex::new(None)),
            error_count: Arc::new(AtomicU64::new(0)),
            cleanup_handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a handler to run if `start` fails. Handlers run in
    /// registration order and are cleared after running once.
    pub async fn on_cleanup<F: FnOnce() + Send + 'static>(&self, handler: F) {
        self.cleanup_handlers.lock().await.push(Box::new(handler));
    }

    /// Bring the service up: probe the substrate, dial configured peers
    /// (peer failures never fail the service), then prepare storage.
    ///
    /// # Errors
    /// Returns [`ServiceError::Substrate`] or [`ServiceError::Storage`] on
    /// failure, after running every registered cleanup handler.
    pub async fn start(&self) -> Result<(), ServiceError> {
        self.set_state(ServiceState::Starting).await;

        if let Err(err) = self.probe_substrate().await {
            self.fail(err.to_string()).await;
            return Err(err);
        }

        self.dial_peers().await;

        if let Err(err) = self.init_storage().await {
            self.fail(err.to_string()).await;
            return Err(err);
        }

        self.sync.start_sync().await;
        *self.started_at.lock().await = Some(Instant::now());
        self.cleanup_handlers.lock().await.clear();
        self.set_state(ServiceState::Running).await;
        info!(name = %self.config.name, "service started");
        Ok(())
    }

    /// Bring the service down: stop the synchronizer's watch loops and
    /// debounce timers.
    ///
    /// # Errors
    /// Currently infallible; returns `Result` for forward compatibility
    /// with adapters that need to flush state on stop.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        self.set_state(ServiceState::Stopping).await;
        self.sync.stop_sync().await;
        *self.started_at.lock().await = None;
        self.set_state(ServiceState::Stopped).await;
        info!(name = %self.config.name, "service stopped");
        Ok(())
    }

    /// Aggregate health derived from peer connectivity.
    pub async fn get_health(&self) -> Health {
        let peers = self.peers.lock().await;
        let total = peers.len();
        if total == 0 {
            return Health::Healthy;
        }
        let connected = peers.values().filter(|p| p.connected).count();
        if connected == 0 {
            Health::Unhealthy
        } else if connected * 2 > total {
            Health::Healthy
        } else {
            Health::Degraded
        }
    }

    /// A point-in-time metrics snapshot.
    pub async fn get_metrics(&self) -> ServiceMetrics {
        let peers = self.peers.lock().await;
        let total_peers = peers.len();
        let connected_peers = peers.values().filter(|p| p.connected).count();
        drop(peers);

        let uptime_ms = match *self.started_at.lock().await {
            Some(started) => u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            None => 0,
        };

        ServiceMetrics {
            connected_peers,
            total_peers,
            storage_type: self.config.storage.kind.label().to_string(),
            disk_usage: self.disk_usage().await,
            uptime_ms,
            state: *self.state.lock().await,
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }

    async fn set_state(&self, state: ServiceState) {
        *self.state.lock().await = state;
    }

    async fn fail(&self, cause: String) {
        warn!(name = %self.config.name, %cause, "service start failed");
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.set_state(ServiceState::Error).await;
        let handlers = std::mem::take(&mut *self.cleanup_handlers.lock().await);
        for handler in handlers {
            handler();
        }
    }

    async fn probe_substrate(&self) -> Result<(), ServiceError> {
        let probe_path = SubstratePath::new(["service", self.config.name.as_str(), "probe"]);
        self.substrate
            .put(probe_path.clone(), Value::Scalar(Scalar::Bool(true)))
            .await
            .map_err(|err| ServiceError::Substrate(err.to_string()))?;
        let read_back = self
            .substrate
            .get(&probe_path)
            .await
            .map_err(|err| ServiceError::Substrate(err.to_string()))?;
        if read_back.is_none() {
            return Err(ServiceError::Substrate("probe write did not read back".to_string()));
        }
        self.substrate
            .delete(&probe_path)
            .await
            .map(|_found| ())
            .map_err(|err| ServiceError::Substrate(err.to_string()))
    }

    async fn dial_peers(&self) {
        for endpoint in self.config.peers.endpoints.clone() {
            let mut connected = false;
            for attempt in 0..self.config.peers.max_retries {
                match self.dialer.dial(&endpoint, self.config.peers.timeout).await {
                    Ok(()) => {
                        connected = true;
                        break;
                    }
                    Err(cause) => {
                        warn!(%endpoint, attempt, %cause, "peer dial failed");
                        self.error_count.fetch_add(1, Ordering::Relaxed);
                        let delay = backoff::next_delay(attempt, self.config.peers.retry_delay, self.config.peers.timeout);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            if !connected {
                warn!(%endpoint, "peer exhausted retries; marked disconnected");
            }
            self.peers
                .lock()
                .await
                .entry(endpoint)
                .and_modify(|p| p.connected = connected)
                .or_insert(PeerState { connected });
        }
    }

    async fn init_storage(&self) -> Result<(), ServiceError> {
        let StorageKind::Disk = &self.config.storage.kind else {
            return Ok(());
        };
        let path = self
            .config
            .storage
            .path
            .clone()
            .ok_or_else(|| ServiceError::Storage("disk storage requires a path".to_string()))?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|err| ServiceError::Storage(err.to_string()))?;
        let probe = path.join(".mesh-probe");
        tokio::fs::write(&probe, b"ok")
            .await
            .map_err(|err| ServiceError::Storage(err.to_string()))?;
        tokio::fs::remove_file(&probe)
            .await
            .map_err(|err| ServiceError::Storage(err.to_string()))?;
        Ok(())
    }

    async fn disk_usage(&self) -> Option<u64> {
        let StorageKind::Disk = &self.config.storage.kind else {
            return None;
        };
        let path = self.config.storage.path.clone()?;
        directory_size(&path).await.ok()
    }
}

async fn directory_size(path: &PathBuf) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![path.clone()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                stack.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

/// Install a `tracing_subscriber::fmt` global subscriber honoring
/// `RUST_LOG`, matching the teacher's process-entry default. Library code
/// never calls this itself; it exists for binaries and tests that want it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Load a node's [`MeshConfig`] from the platform config directory under
/// `key`, falling back to [`MeshConfig::default`] when no file is present
/// yet.
///
/// # Errors
/// Returns [`mesh_config::config::ConfigError`] if the config directory
/// cannot be resolved or the stored file is not valid JSON.
pub fn load_config(key: &str) -> Result<MeshConfig, mesh_config::config::ConfigError> {
    let store = mesh_config_fs::FsConfigStore::new()?;
    let service = mesh_config::config::ConfigService::new(store);
    Ok(service.load(key)?.unwrap_or_default())
}

/// Persist `config` to the platform config directory under `key`.
///
/// # Errors
/// Returns [`mesh_config::config::ConfigError`] if the directory cannot be
/// resolved or the write fails.
pub fn save_config(key: &str, config: &MeshConfig) -> Result<(), mesh_config::config::ConfigError> {
    let store = mesh_config_fs::FsConfigStore::new()?;
    let service = mesh_config::config::ConfigService::new(store);
    service.save(key, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_substrate::InMemorySubstrate;
    use serde_json::json;

    fn config() -> MeshConfig {
        MeshConfig {
            name: "test".to_string(),
            ..MeshConfig::default()
        }
    }

    fn service() -> Service<InMemorySubstrate> {
        Service::new(config(), Arc::new(InMemorySubstrate::new()))
    }

    #[tokio::test]
    async fn start_with_no_peers_is_healthy() {
        let svc = service();
        svc.start().await.unwrap();
        assert_eq!(svc.get_health().await, Health::Healthy);
        assert_eq!(svc.get_metrics().await.state, ServiceState::Running);
    }

    #[tokio::test]
    async fn stop_is_reflected_in_metrics() {
        let svc = service();
        svc.start().await.unwrap();
        svc.stop().await.unwrap();
        let metrics = svc.get_metrics().await;
        assert_eq!(metrics.state, ServiceState::Stopped);
        assert_eq!(metrics.uptime_ms, 0);
    }

    #[tokio::test]
    async fn disk_storage_bootstraps_directory_and_reports_usage() {
        let dir = tempfile::tempdir().unwrap();
        let config = MeshConfig {
            name: "disk".to_string(),
            storage: StorageConfig { kind: StorageKind::Disk, path: Some(dir.path().to_path_buf()) },
            ..MeshConfig::default()
        };
        let svc = Service::new(config, Arc::new(InMemorySubstrate::new()));
        svc.start().await.unwrap();
        assert!(dir.path().exists());
        let metrics = svc.get_metrics().await;
        assert_eq!(metrics.storage_type, "disk");
        assert_eq!(metrics.disk_usage, Some(0));
    }

    #[tokio::test]
    async fn cleanup_handlers_run_on_substrate_failure() {
        struct FailingSubstrate(InMemorySubstrate);

        #[async_trait::async_trait]
        impl Substrate for FailingSubstrate {
            async fn put(&self, _path: SubstratePath, _value: Value) -> Result<(), mesh_substrate::SubstrateError> {
                Err(mesh_substrate::SubstrateError::ReplicationUnavailable)
            }
            async fn get(&self, path: &SubstratePath) -> Result<Option<Value>, mesh_substrate::SubstrateError> {
                self.0.get(path).await
            }
            async fn watch(&self, prefix: SubstratePath) -> mesh_substrate::Subscription {
                self.0.watch(prefix).await
            }
            async fn delete(&self, path: &SubstratePath) -> Result<bool, mesh_substrate::SubstrateError> {
                self.0.delete(path).await
            }
            async fn list(&self, prefix: &SubstratePath) -> Result<Vec<String>, mesh_substrate::SubstrateError> {
                self.0.list(prefix).await
            }
        }

        let svc = Service::new(config(), Arc::new(FailingSubstrate(InMemorySubstrate::new())));
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = ran.clone();
        svc.on_cleanup(move || {
            ran_clone.store(true, Ordering::SeqCst);
        })
        .await;

        let result = svc.start().await;
        assert!(result.is_err());
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(svc.get_metrics().await.state, ServiceState::Error);
    }

    // S1 — event-sourced counter.
    #[tokio::test]
    async fn scenario_event_sourced_counter() {
        let svc = service();
        svc.start().await.unwrap();
        svc.actors.set("c", "counter", json!({"count": 0}), 0).await.unwrap();
        for n in 1..=4 {
            svc.actors.update("c", json!({"count": n}), i64::from(n)).await.unwrap();
        }
        let current = svc.actors.get("c").await.unwrap().unwrap();
        assert_eq!(current.version, 5);
        assert_eq!(current.state["count"], json!(4));
        let at_v3 = svc.actors.get_state_at("c", 3).await.unwrap().unwrap();
        assert_eq!(at_v3.state["count"], json!(2));
    }

    // S2 — graph cascade.
    #[tokio::test]
    async fn scenario_graph_cascade() {
        let svc = service();
        svc.start().await.unwrap();
        svc.graph
            .put_node(mesh_graph::Node {
                id: "A".to_string(),
                node_type: "n".to_string(),
                properties: Default::default(),
                metadata: Default::default(),
            }, 1)
            .await
            .unwrap();
        svc.graph
            .put_node(mesh_graph::Node {
                id: "B".to_string(),
                node_type: "n".to_string(),
                properties: Default::default(),
                metadata: Default::default(),
            }, 1)
            .await
            .unwrap();
        svc.graph
            .put_edge(mesh_graph::Edge {
                id: "e".to_string(),
                from: "A".to_string(),
                to: "B".to_string(),
                edge_type: "X".to_string(),
                properties: Default::default(),
                weight: 1.0,
                directed: true,
                metadata: Default::default(),
            }, 1)
            .await
            .unwrap();
        svc.graph.delete_node("A").await.unwrap();
        assert!(svc.graph.get_edge("e").await.unwrap().is_none());
        assert!(svc.graph.get_incoming_edges("B", None).await.unwrap().is_empty());
    }

    // S3 — transaction rollback.
    #[tokio::test]
    async fn scenario_transaction_rollback() {
        let svc = service();
        svc.start().await.unwrap();
        let result: Result<(), mesh_txn::TransactionError> = svc
            .txn
            .execute(mesh_txn::TxnOptions::default(), |t| {
                Box::pin(async move {
                    t.put_node(mesh_graph::Node {
                        id: "N1".to_string(),
                        node_type: "n".to_string(),
                        properties: Default::default(),
                        metadata: Default::default(),
                    }, 1)
                    .await?;
                    t.put_edge(mesh_graph::Edge {
                        id: "E1".to_string(),
                        from: "N1".to_string(),
                        to: "N2".to_string(),
                        edge_type: "T".to_string(),
                        properties: Default::default(),
                        weight: 1.0,
                        directed: true,
                        metadata: Default::default(),
                    }, 1)
                    .await?;
                    Err(mesh_txn::TransactionError::NotActive)
                })
            })
            .await;
        assert!(result.is_err());
        assert!(svc.graph.get_node("N1").await.unwrap().is_none());
        assert!(svc.graph.get_edge("E1").await.unwrap().is_none());
    }

    // S4 — shortest path.
    #[tokio::test]
    async fn scenario_shortest_path() {
        let svc = service();
        svc.start().await.unwrap();
        for id in ["A", "B", "C", "D", "E"] {
            svc.graph
                .put_node(mesh_graph::Node {
                    id: id.to_string(),
                    node_type: "n".to_string(),
                    properties: Default::default(),
                    metadata: Default::default(),
                }, 1)
                .await
                .unwrap();
        }
        for (id, from, to) in [("ab", "A", "B"), ("bd", "B", "D"), ("ac", "A", "C"), ("ce", "C", "E"), ("ed", "E", "D")] {
            svc.graph
                .put_edge(mesh_graph::Edge {
                    id: id.to_string(),
                    from: from.to_string(),
                    to: to.to_string(),
                    edge_type: "t".to_string(),
                    properties: Default::default(),
                    weight: 1.0,
                    directed: true,
                    metadata: Default::default(),
                }, 1)
                .await
                .unwrap();
        }
        let path = svc
            .query
            .find_shortest_path("A", "D", &mesh_query::TraversalOptions::default())
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<&str> = path.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "D"]);
    }

    // S6 — debounce coalescing.
    #[tokio::test]
    async fn scenario_debounce_coalescing() {
        let svc = service();
        svc.start().await.unwrap();
        for n in 1..=3 {
            svc.sync
                .broadcast_state_change("counter".to_string(), "counter".to_string(), json!({"count": n}))
                .await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        let state = svc.actors.get("counter").await.unwrap().unwrap();
        assert_eq!(state.state["count"], json!(3));
        assert_eq!(state.version, 1, "debounce must coalesce to a single write");
    }
}
