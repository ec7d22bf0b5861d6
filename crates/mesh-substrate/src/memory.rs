// SPDX-License-Identifier: Apache-2.0
//! In-memory reference [`Substrate`](crate::Substrate) implementation.
//!
//! Single process, single copy of the data — there is no peer to converge
//! with, so every write is immediately "replicated". This is what the rest
//! of the mesh's crates test against; a real deployment backs [`Substrate`]
//! with an actual CRDT-capable or LWW-KV gossip layer instead.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::{Path, Scalar, Subscription, SubstrateError, Value, WatchEvent};

struct Watcher {
    id: u64,
    prefix: Path,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

/// In-memory, single-node [`Substrate`](crate::Substrate).
pub struct InMemorySubstrate {
    data: DashMap<Path, Value>,
    watchers: std::sync::Arc<Mutex<Vec<Watcher>>>,
    next_watch_id: AtomicU64,
}

impl Default for InMemorySubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySubstrate {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            watchers: std::sync::Arc::new(Mutex::new(Vec::new())),
            next_watch_id: AtomicU64::new(1),
        }
    }

    fn notify(&self, path: &Path, value: Option<Value>) {
        let event = WatchEvent {
            path: path.clone(),
            value,
        };
        #[allow(clippy::unwrap_used)]
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|w| {
            if path.starts_with(&w.prefix) {
                w.tx.send(event.clone()).is_ok()
            } else {
                !w.tx.is_closed()
            }
        });
    }
}

#[async_trait::async_trait]
impl crate::Substrate for InMemorySubstrate {
    async fn put(&self, path: Path, value: Value) -> Result<(), SubstrateError> {
        self.data.insert(path.clone(), value.clone());
        self.notify(&path, Some(value));
        Ok(())
    }

    async fn get(&self, path: &Path) -> Result<Option<Value>, SubstrateError> {
        Ok(self.data.get(path).map(|entry| entry.value().clone()))
    }

    async fn watch(&self, prefix: Path) -> Subscription {
        let id = self.next_watch_id.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(watch_id = id, %prefix, "subscribed");
        let (tx, rx) = mpsc::unbounded_channel();
        #[allow(clippy::unwrap_used)]
        self.watchers.lock().unwrap().push(Watcher {
            id,
            prefix,
            tx,
        });
        let watchers = self.watchers.clone();
        Subscription {
            id,
            rx,
            unsubscribe: std::sync::Arc::new(move |id| {
                tracing::trace!(watch_id = id, "unsubscribed");
                #[allow(clippy::unwrap_used)]
                let mut watchers = watchers.lock().unwrap();
                watchers.retain(|w| w.id != id);
            }),
        }
    }

    async fn delete(&self, path: &Path) -> Result<bool, SubstrateError> {
        let existed = self.data.remove(path).is_some();
        if existed {
            tracing::debug!(%path, "deleted");
            self.notify(path, None);
        }
        Ok(existed)
    }

    async fn list(&self, prefix: &Path) -> Result<Vec<String>, SubstrateError> {
        let depth = prefix.segments().len() + 1;
        let mut out = BTreeSet::new();
        for entry in &self.data {
            let key = entry.key();
            if key.starts_with(prefix) && key.segments().len() == depth {
                if let Some(leaf) = key.segments().last() {
                    out.insert(leaf.clone());
                }
            }
        }
        Ok(out.into_iter().collect())
    }
}

impl Clone for WatchEvent {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            value: self.value.clone(),
        }
    }
}

/// Convenience constructor for a scalar-only map value, used by the higher
/// level stores when assembling snapshot/document records.
pub fn map(fields: impl IntoIterator<Item = (&'static str, Scalar)>) -> Value {
    Value::Map(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}
