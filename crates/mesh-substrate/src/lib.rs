// SPDX-License-Identifier: Apache-2.0
//! The replication substrate: an abstract key-addressed, subtree-subscribable
//! document store that every other mesh component is built on top of.
//!
//! The substrate is deliberately minimal (`put`/`get`/`watch`) so that any
//! CRDT-capable or last-write-wins replicated KV store can back it. Values
//! are restricted to scalars or flat maps of scalars; callers that need to
//! carry a nested document (an actor's `state`, a node's `properties`) must
//! serialize it into a single string leaf first — see [`encode_nested`] /
//! [`decode_nested`]. This mirrors the source system's own policy of JSON-
//! encoding nested values at leaves because a replicated store's native
//! nested-write semantics are unreliable inside subscription callbacks.

use std::collections::BTreeMap;
use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub mod keys;
pub mod memory;
pub mod wire;

pub use memory::InMemorySubstrate;

/// A path into the substrate's hierarchical namespace: an ordered sequence
/// of string segments, e.g. `["actors", "c"]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Path(Vec<String>);

impl Path {
    /// Build a path from an iterator of segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Borrow the path's segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Append a segment, returning a new path.
    pub fn join(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// True iff `self` is `other` or a descendant of `other` in the
    /// hierarchical namespace (used for subtree subscription matching).
    pub fn starts_with(&self, other: &Path) -> bool {
        self.0.len() >= other.0.len() && self.0[..other.0.len()] == other.0[..]
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0.join("/"))
    }
}

impl<const N: usize> From<[&str; N]> for Path {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

/// A substrate scalar: string, number, bool, or null. Numbers are split into
/// integer and float variants rather than collapsed into one `f64`, since
/// `ActorState.version` and similar counters must round-trip exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Absence of a value (not the same as the key being unset).
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// Floating point scalar.
    Float(f64),
    /// UTF-8 string scalar; nested documents are carried here as JSON text.
    String(String),
}

impl Scalar {
    /// View this scalar as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// View this scalar as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }
}

/// A substrate value: a bare scalar, or a flat map of scalars. This is the
/// full expressiveness the wire contract in spec.md §6 allows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// A single scalar leaf.
    Scalar(Scalar),
    /// A flat map of scalar fields (e.g. an `ActorState` snapshot record).
    Map(BTreeMap<String, Scalar>),
}

impl Value {
    /// Read a field out of a `Map` value; `None` for `Scalar` values or
    /// missing fields.
    pub fn field(&self, name: &str) -> Option<&Scalar> {
        match self {
            Self::Map(m) => m.get(name),
            Self::Scalar(_) => None,
        }
    }
}

impl From<BTreeMap<String, Scalar>> for Value {
    fn from(map: BTreeMap<String, Scalar>) -> Self {
        Self::Map(map)
    }
}

/// Serialize an arbitrary structured document to the JSON-string encoding
/// the substrate requires for nested values (spec.md §6, §9).
///
/// # Errors
/// Returns [`SubstrateError::Serde`] if `value` cannot be serialized.
pub fn encode_nested<T: Serialize>(value: &T) -> Result<String, SubstrateError> {
    Ok(serde_json::to_string(value)?)
}

/// Inverse of [`encode_nested`].
///
/// # Errors
/// Returns [`SubstrateError::Serde`] if `raw` is not valid JSON for `T`.
pub fn decode_nested<T: DeserializeOwned>(raw: &str) -> Result<T, SubstrateError> {
    Ok(serde_json::from_str(raw)?)
}

/// Error kinds surfaced by substrate operations (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    /// The substrate did not acknowledge a `put` before its deadline.
    #[error("write not acknowledged before deadline")]
    WriteTimeout,
    /// The substrate could not be reached within the read budget.
    #[error("replication substrate unavailable")]
    ReplicationUnavailable,
    /// A stored value failed to deserialize into the requested shape.
    #[error("corrupt value at {path}: {source}")]
    Corrupt {
        /// The path whose value failed to parse.
        path: Path,
        /// Underlying deserialization failure.
        #[source]
        source: serde_json::Error,
    },
    /// Nested JSON (de)serialization failure, independent of substrate I/O.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// An event delivered by a [`Substrate::watch`] subscription: the full value
/// currently stored at `path` after a write, and the path itself (the spec's
/// `cb: (value, key) -> void`).
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// The path that was written.
    pub path: Path,
    /// The value now stored at that path (`None` on a logical delete).
    pub value: Option<Value>,
}

/// A live subtree subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: tokio::sync::mpsc::UnboundedReceiver<WatchEvent>,
    unsubscribe: std::sync::Arc<dyn Fn(u64) + Send + Sync>,
}

impl Subscription {
    /// Await the next change under the subscribed subtree. Returns `None`
    /// once the substrate has dropped this subscription's sender (e.g. the
    /// substrate itself shut down).
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        (self.unsubscribe)(self.id);
    }
}

/// The replication substrate contract (spec.md §6). Every node exposes one;
/// the core treats it as an interface and owns no specific implementation.
#[async_trait::async_trait]
pub trait Substrate: Send + Sync {
    /// Write `value` at `path`. Resolves once the substrate acknowledges the
    /// write locally; replication to peers is best-effort and asynchronous.
    ///
    /// # Errors
    /// Returns [`SubstrateError::WriteTimeout`] if the substrate does not
    /// acknowledge within its configured deadline.
    async fn put(&self, path: Path, value: Value) -> Result<(), SubstrateError>;

    /// Read the current local value at `path`, or `None` if absent.
    ///
    /// # Errors
    /// Returns [`SubstrateError::ReplicationUnavailable`] if the substrate
    /// cannot be reached within its read budget.
    async fn get(&self, path: &Path) -> Result<Option<Value>, SubstrateError>;

    /// Subscribe to every write (local or remote) to `prefix` or any of its
    /// descendants. The returned [`Subscription`] is a live handle; dropping
    /// it cancels the subscription (a named suspension point, spec.md §5).
    async fn watch(&self, prefix: Path) -> Subscription;

    /// Delete the value at `path`. Returns `true` iff a value previously
    /// existed. Implementations that only support tombstoning (rather than
    /// physical removal) still report `true`/`false` based on prior
    /// presence, consistent with [`Substrate::get`].
    async fn delete(&self, path: &Path) -> Result<bool, SubstrateError>;

    /// List the immediate keys stored under `prefix` (one level of the
    /// namespace below it), used by index scans. Order is unspecified.
    async fn list(&self, prefix: &Path) -> Result<Vec<String>, SubstrateError>;
}
