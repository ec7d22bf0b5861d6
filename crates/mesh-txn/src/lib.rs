// SPDX-License-Identifier: Apache-2.0
//! Transaction manager (spec.md §4.4): buffers graph operations against a
//! [`GraphStore`], capturing a before-image the first time each entity is
//! touched, so a failed or requested rollback can restore exactly what was
//! there before the transaction began.

use std::collections::HashMap;
use std::sync::Arc;

use mesh_graph::{Edge, GraphError, GraphStore, Node};
use mesh_substrate::Substrate;

/// Options passed to [`TransactionManager::begin`].
#[derive(Debug, Clone, Copy)]
pub struct TxnOptions {
    /// Maximum number of operations a transaction may buffer.
    pub max_operations: usize,
    /// If true, the buffered operations are applied to the graph once
    /// `max_operations` is reached instead of rejecting the next operation;
    /// the transaction stays `ACTIVE` so more operations can still be
    /// enqueued afterward. Before-images captured before the flush are kept,
    /// so a later `rollback` still undoes everything, flushed or not.
    pub auto_commit: bool,
}

impl Default for TxnOptions {
    fn default() -> Self {
        Self {
            max_operations: 1000,
            auto_commit: false,
        }
    }
}

/// A transaction's lifecycle state (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Accepting operations.
    Active,
    /// Successfully applied.
    Committed,
    /// Rolled back to the before-images.
    RolledBack,
    /// Commit failed partway through and was automatically rolled back.
    Failed,
}

#[derive(Debug, Clone)]
enum TxnOperation {
    PutNode(Node, i64),
    DeleteNode(String),
    PutEdge(Edge, i64),
    DeleteEdge(String),
}

#[derive(Debug, Clone)]
enum BeforeImage {
    Node(Option<Node>),
    Edge(Option<Edge>),
}

/// Errors raised by a [`Transaction`] or [`TransactionManager`].
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// An operation was attempted on a transaction that is not `ACTIVE`.
    #[error("transaction is not active")]
    NotActive,
    /// `rollback` was called on a transaction that already committed.
    #[error("cannot roll back a committed transaction")]
    CannotRollbackCommitted,
    /// The transaction's `max_operations` limit was reached without
    /// `auto_commit`.
    #[error("transaction exceeded its operation limit of {0}")]
    TooManyOperations(usize),
    /// A buffered operation failed while committing.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// A single buffered unit of work against a [`GraphStore`].
pub struct Transaction<S> {
    graph: Arc<GraphStore<S>>,
    options: TxnOptions,
    state: TxnState,
    operations: Vec<TxnOperation>,
    before_images: HashMap<String, BeforeImage>,
}

impl<S: Substrate> Transaction<S> {
    fn new(graph: Arc<GraphStore<S>>, options: TxnOptions) -> Self {
        Self {
            graph,
            options,
            state: TxnState::Active,
            operations: Vec::new(),
            before_images: HashMap::new(),
        }
    }

    /// The transaction's current lifecycle state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Enqueue a node write, capturing its before-image on first touch.
    ///
    /// # Errors
    /// Returns [`TransactionError::NotActive`] or
    /// [`TransactionError::TooManyOperations`], or a [`GraphError`] if
    /// reading the before-image failed.
    pub async fn put_node(&mut self, node: Node, now: i64) -> Result<(), TransactionError> {
        self.check_active()?;
        self.capture_node_before_image(&node.id).await?;
        self.enqueue(TxnOperation::PutNode(node, now)).await
    }

    /// Enqueue a node deletion, capturing before-images for the node itself
    /// and every edge the cascade will remove.
    ///
    /// # Errors
    /// Same as [`Transaction::put_node`].
    pub async fn delete_node(&mut self, id: &str) -> Result<(), TransactionError> {
        self.check_active()?;
        self.capture_node_before_image(id).await?;
        let outgoing = self.graph.get_outgoing_edges(id, None).await?;
        let incoming = self.graph.get_incoming_edges(id, None).await?;
        for edge in outgoing.into_iter().chain(incoming) {
            self.capture_edge_before_image(&edge.id).await?;
        }
        self.enqueue(TxnOperation::DeleteNode(id.to_string())).await
    }

    /// Enqueue an edge write, capturing its before-image on first touch.
    ///
    /// # Errors
    /// Same as [`Transaction::put_node`].
    pub async fn put_edge(&mut self, edge: Edge, now: i64) -> Result<(), TransactionError> {
        self.check_active()?;
        self.capture_edge_before_image(&edge.id).await?;
        self.enqueue(TxnOperation::PutEdge(edge, now)).await
    }

    /// Enqueue an edge deletion, capturing its before-image on first touch.
    ///
    /// # Errors
    /// Same as [`Transaction::put_node`].
    pub async fn delete_edge(&mut self, id: &str) -> Result<(), TransactionError> {
        self.check_active()?;
        self.capture_edge_before_image(id).await?;
        self.enqueue(TxnOperation::DeleteEdge(id.to_string())).await
    }

    /// Apply queued operations in issue order. On any failure the
    /// transaction transitions to `FAILED`, every before-image is restored,
    /// and the cause is surfaced wrapped in [`TransactionError::Graph`].
    ///
    /// # Errors
    /// Returns [`TransactionError::NotActive`] if already resolved, or the
    /// wrapped [`GraphError`] of the operation that failed.
    pub async fn commit(&mut self) -> Result<(), TransactionError> {
        self.check_active()?;
        self.apply_queued().await?;
        self.state = TxnState::Committed;
        tracing::debug!(operations = self.before_images.len(), "transaction committed");
        Ok(())
    }

    /// Restore every before-image. Idempotent once `ROLLED_BACK`.
    ///
    /// # Errors
    /// Returns [`TransactionError::CannotRollbackCommitted`] if the
    /// transaction already committed.
    pub async fn rollback(&mut self) -> Result<(), TransactionError> {
        if self.state == TxnState::RolledBack {
            return Ok(());
        }
        if self.state == TxnState::Committed {
            return Err(TransactionError::CannotRollbackCommitted);
        }
        self.restore_before_images().await;
        self.state = TxnState::RolledBack;
        Ok(())
    }

    fn check_active(&self) -> Result<(), TransactionError> {
        if self.state == TxnState::Active {
            Ok(())
        } else {
            Err(TransactionError::NotActive)
        }
    }

    async fn enqueue(&mut self, operation: TxnOperation) -> Result<(), TransactionError> {
        if self.operations.len() >= self.options.max_operations {
            if !self.options.auto_commit {
                return Err(TransactionError::TooManyOperations(self.options.max_operations));
            }
            self.apply_queued().await?;
        }
        self.operations.push(operation);
        Ok(())
    }

    /// Apply every buffered operation in issue order, without changing
    /// `state`. On failure the transaction transitions to `FAILED` and every
    /// before-image captured so far is restored, mirroring `commit`'s
    /// failure path.
    async fn apply_queued(&mut self) -> Result<(), TransactionError> {
        let operations = std::mem::take(&mut self.operations);
        for operation in operations {
            if let Err(err) = self.apply(&operation).await {
                self.state = TxnState::Failed;
                self.restore_before_images().await;
                return Err(err.into());
            }
        }
        Ok(())
    }

    async fn apply(&self, operation: &TxnOperation) -> Result<(), GraphError> {
        match operation {
            TxnOperation::PutNode(node, now) => {
                self.graph.put_node(node.clone(), *now).await?;
            }
            TxnOperation::DeleteNode(id) => {
                self.graph.delete_node(id).await?;
            }
            TxnOperation::PutEdge(edge, now) => {
                self.graph.put_edge(edge.clone(), *now).await?;
            }
            TxnOperation::DeleteEdge(id) => {
                self.graph.delete_edge(id).await?;
            }
        }
        Ok(())
    }

    async fn capture_node_before_image(&mut self, id: &str) -> Result<(), GraphError> {
        let key = format!("node:{id}");
        if self.before_images.contains_key(&key) {
            return Ok(());
        }
        let existing = self.graph.get_node(id).await?;
        self.before_images.insert(key, BeforeImage::Node(existing));
        Ok(())
    }

    async fn capture_edge_before_image(&mut self, id: &str) -> Result<(), GraphError> {
        let key = format!("edge:{id}");
        if self.before_images.contains_key(&key) {
            return Ok(());
        }
        let existing = self.graph.get_edge(id).await?;
        self.before_images.insert(key, BeforeImage::Edge(existing));
        Ok(())
    }

    async fn restore_before_images(&mut self) {
        let images: Vec<(String, BeforeImage)> =
            self.before_images.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (key, image) in images {
            let result = match image {
                BeforeImage::Node(Some(node)) => {
                    let now = node.metadata.created_at.unwrap_or_default();
                    self.graph.put_node(node, now).await.map(|_| ())
                }
                BeforeImage::Node(None) => {
                    let id = key.split_once(':').map_or(key.as_str(), |(_, id)| id);
                    self.graph.delete_node(id).await.map(|_| ())
                }
                BeforeImage::Edge(Some(edge)) => {
                    let now = edge.metadata.created_at.unwrap_or_default();
                    self.graph.put_edge(edge, now).await.map(|_| ())
                }
                BeforeImage::Edge(None) => {
                    let id = key.split_once(':').map_or(key.as_str(), |(_, id)| id);
                    self.graph.delete_edge(id).await.map(|_| ())
                }
            };
            if let Err(err) = result {
                tracing::warn!(%err, entity = %key, "failed to restore before-image during rollback");
            }
        }
    }
}

/// Owns a [`GraphStore`] handle and hands out [`Transaction`]s over it.
pub struct TransactionManager<S> {
    graph: Arc<GraphStore<S>>,
}

impl<S: Substrate> TransactionManager<S> {
    /// Build a manager over a shared graph store handle.
    pub fn new(graph: Arc<GraphStore<S>>) -> Self {
        Self { graph }
    }

    /// Begin a new `ACTIVE` transaction.
    pub fn begin(&self, options: TxnOptions) -> Transaction<S> {
        Transaction::new(self.graph.clone(), options)
    }

    /// Begin a transaction, run `body` against it, commit on `Ok`, roll back
    /// on `Err`. Returns whatever `body` returned on success.
    ///
    /// `body` must box its future (`Box::pin(async move { ... })`) since it
    /// borrows the transaction for the duration of the call.
    ///
    /// # Errors
    /// Propagates `body`'s error (after rolling back), or the commit's
    /// error.
    pub async fn execute<T, F>(&self, options: TxnOptions, body: F) -> Result<T, TransactionError>
    where
        F: for<'a> FnOnce(
            &'a mut Transaction<S>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, TransactionError>> + Send + 'a>>,
    {
        let mut txn = self.begin(options);
        match body(&mut txn).await {
            Ok(value) => {
                txn.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let _ = txn.rollback().await;
                Err(err)
            }
        }
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

    fn edge(id: &str, from: &str, to: &str) -> Edge {
        Edge {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            edge_type: "knows".to_string(),
            properties: Default::default(),
            weight: 1.0,
            directed: true,
            metadata: Default::default(),
        }
    }

    fn manager() -> (TransactionManager<InMemorySubstrate>, Arc<GraphStore<InMemorySubstrate>>) {
        let substrate = Arc::new(InMemorySubstrate::new());
        let graph = Arc::new(GraphStore::new(substrate));
        (TransactionManager::new(graph.clone()), graph)
    }

    #[tokio::test]
    async fn commit_applies_operations_in_order() {
        let (manager, graph) = manager();
        let mut txn = manager.begin(TxnOptions::default());
        txn.put_node(node("a"), 1).await.unwrap();
        txn.put_node(node("b"), 1).await.unwrap();
        txn.put_edge(edge("e1", "a", "b"), 1).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(txn.state(), TxnState::Committed);
        assert!(graph.get_node("a").await.unwrap().is_some());
        assert!(graph.get_edge("e1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rollback_restores_prior_state_for_overwritten_node() {
        let (manager, graph) = manager();
        graph.put_node(node("a"), 1).await.unwrap();
        let mut pre = graph.get_node("a").await.unwrap().unwrap();
        pre.properties.insert("v".to_string(), serde_json::json!(1));
        graph.put_node(pre, 2).await.unwrap();

        let mut txn = manager.begin(TxnOptions::default());
        let mut updated = node("a");
        updated.properties.insert("v".to_string(), serde_json::json!(2));
        txn.put_node(updated, 3).await.unwrap();
        txn.rollback().await.unwrap();

        let restored = graph.get_node("a").await.unwrap().unwrap();
        assert_eq!(restored.properties.get("v"), Some(&serde_json::json!(1)));
    }

    #[tokio::test]
    async fn rollback_deletes_a_node_that_did_not_exist_before_the_transaction() {
        let (manager, graph) = manager();
        let mut txn = manager.begin(TxnOptions::default());
        txn.put_node(node("new"), 1).await.unwrap();
        txn.rollback().await.unwrap();

        assert!(graph.get_node("new").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rollback_is_idempotent_once_rolled_back() {
        let (manager, _graph) = manager();
        let mut txn = manager.begin(TxnOptions::default());
        txn.put_node(node("a"), 1).await.unwrap();
        txn.rollback().await.unwrap();
        txn.rollback().await.unwrap();
        assert_eq!(txn.state(), TxnState::RolledBack);
    }

    #[tokio::test]
    async fn rollback_after_commit_is_rejected() {
        let (manager, _graph) = manager();
        let mut txn = manager.begin(TxnOptions::default());
        txn.put_node(node("a"), 1).await.unwrap();
        txn.commit().await.unwrap();
        let err = txn.rollback().await.unwrap_err();
        assert!(matches!(err, TransactionError::CannotRollbackCommitted));
    }

    #[tokio::test]
    async fn enqueue_past_the_operation_limit_is_rejected() {
        let (manager, _graph) = manager();
        let mut txn = manager.begin(TxnOptions {
            max_operations: 1,
            auto_commit: false,
        });
        txn.put_node(node("a"), 1).await.unwrap();
        let err = txn.put_node(node("b"), 1).await.unwrap_err();
        assert!(matches!(err, TransactionError::TooManyOperations(1)));
    }

    #[tokio::test]
    async fn auto_commit_flushes_at_the_limit_instead_of_rejecting() {
        let (manager, graph) = manager();
        let mut txn = manager.begin(TxnOptions {
            max_operations: 1,
            auto_commit: true,
        });
        txn.put_node(node("a"), 1).await.unwrap();
        txn.put_node(node("b"), 1).await.unwrap();

        assert_eq!(txn.state(), TxnState::Active, "auto-commit flush must not end the transaction");
        assert!(graph.get_node("a").await.unwrap().is_some(), "the flushed operation must be applied");
        assert!(graph.get_node("b").await.unwrap().is_none(), "the triggering operation is buffered, not yet applied");

        txn.commit().await.unwrap();
        assert!(graph.get_node("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rollback_after_auto_commit_flush_still_undoes_it() {
        let (manager, graph) = manager();
        graph
            .put_node(Node { node_type: "original".to_string(), ..node("a") }, 0)
            .await
            .unwrap();
        let mut txn = manager.begin(TxnOptions {
            max_operations: 1,
            auto_commit: true,
        });
        txn.put_node(node("a"), 1).await.unwrap();
        txn.put_node(node("b"), 1).await.unwrap();
        assert_eq!(graph.get_node("a").await.unwrap().unwrap().node_type, "widget", "flush already overwrote it");

        txn.rollback().await.unwrap();

        assert_eq!(
            graph.get_node("a").await.unwrap().unwrap().node_type,
            "original",
            "rollback must undo the already-flushed batch, not just the buffered one"
        );
        assert!(graph.get_node("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn execute_commits_on_success_and_rolls_back_on_failure() {
        let (manager, graph) = manager();
        let result = manager
            .execute(TxnOptions::default(), |txn| {
                Box::pin(async move {
                    txn.put_node(node("a"), 1).await?;
                    Ok(())
                })
            })
            .await;
        assert!(result.is_ok());
        assert!(graph.get_node("a").await.unwrap().is_some());

        let result: Result<(), TransactionError> = manager
            .execute(TxnOptions::default(), |txn| {
                Box::pin(async move {
                    txn.put_node(node("b"), 1).await?;
                    Err(TransactionError::NotActive)
                })
            })
            .await;
        assert!(result.is_err());
        assert!(graph.get_node("b").await.unwrap().is_none());
    }
}
