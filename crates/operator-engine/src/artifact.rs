//! Derived artifacts and their side channels
//!
//! An [`Artifact`] is the value an operator produces: an opaque payload
//! (usually a mesh) stamped with a shape timestamp, plus a typed metadata
//! map used for out-of-band results such as "this result is partial" or
//! "here is the discarded half".
//!
//! Shape timestamps come from one process-wide counter, so two artifacts
//! with different geometry never share a stamp and downstream caches can
//! key on the stamp alone.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

static NEXT_SHAPE_TIMESTAMP: AtomicU64 = AtomicU64::new(1);

fn next_shape_timestamp() -> u64 {
    NEXT_SHAPE_TIMESTAMP.fetch_add(1, Ordering::Relaxed)
}

/// Bound for anything an operator chain can carry
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}

/// Well-known metadata keys
pub mod keys {
    /// Derivation stopped early and the result covers only part of the input
    pub const IS_PARTIAL: &str = "is_partial";
    /// Complementary piece produced alongside the result (e.g. the far side of a cut)
    pub const OTHER_SIDE: &str = "other_side";
    /// Per-element source index, used to split merged results
    pub const SOURCE_INDEX: &str = "source_index";
}

/// Typed string-keyed side channel attached to an artifact
#[derive(Default)]
pub struct Metadata {
    entries: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous value under the same key
    pub fn insert<V: Any + Send + Sync>(&mut self, key: impl Into<String>, value: V) {
        self.entries.insert(key.into(), Box::new(value));
    }

    /// Borrow a value if present and of type `V`
    pub fn get<V: Any>(&self, key: &str) -> Option<&V> {
        self.entries.get(key)?.downcast_ref::<V>()
    }

    /// Move a value of type `V` out of the map
    ///
    /// An entry of a different type is left in place.
    pub fn take<V: Any>(&mut self, key: &str) -> Option<V> {
        let entry = self.entries.remove(key)?;
        match entry.downcast::<V>() {
            Ok(value) => Some(*value),
            Err(entry) => {
                self.entries.insert(key.to_string(), entry);
                None
            }
        }
    }

    /// Remove an entry regardless of its type
    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("Metadata").field("keys", &keys).finish()
    }
}

/// Annotation carried by a failure artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    /// Operator whose derivation failed
    pub operator: String,
    /// Failure message
    pub message: String,
}

/// A derived value plus its shape timestamp and side channels
#[derive(Debug)]
pub struct Artifact<T> {
    payload: T,
    shape_timestamp: u64,
    metadata: Metadata,
    failure: Option<FailureInfo>,
}

impl<T> Artifact<T> {
    /// Wrap a payload, stamping it with a fresh shape timestamp
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            shape_timestamp: next_shape_timestamp(),
            metadata: Metadata::new(),
            failure: None,
        }
    }

    /// Attach a metadata entry (builder style)
    pub fn with_metadata<V: Any + Send + Sync>(mut self, key: impl Into<String>, value: V) -> Self {
        self.metadata.insert(key, value);
        self
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Mutable access to the payload; bumps the shape timestamp
    pub fn payload_mut(&mut self) -> &mut T {
        self.shape_timestamp = next_shape_timestamp();
        &mut self.payload
    }

    /// Transform the payload, keeping metadata and bumping the timestamp
    pub fn map_payload<U>(self, f: impl FnOnce(T) -> U) -> Artifact<U> {
        Artifact {
            payload: f(self.payload),
            shape_timestamp: next_shape_timestamp(),
            metadata: self.metadata,
            failure: self.failure,
        }
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Split into payload and metadata
    pub fn into_parts(self) -> (T, Metadata) {
        (self.payload, self.metadata)
    }

    pub fn shape_timestamp(&self) -> u64 {
        self.shape_timestamp
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// True if the result is partial (see [`keys::IS_PARTIAL`])
    pub fn is_partial(&self) -> bool {
        self.metadata.contains(keys::IS_PARTIAL)
    }

    /// True if this artifact stands in for a failed derivation
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }

    pub fn failure(&self) -> Option<&FailureInfo> {
        self.failure.as_ref()
    }
}

impl<T: Clone> Artifact<T> {
    /// Copy of this artifact's payload annotated as a failure
    ///
    /// Keeps the shape timestamp since the geometry is unchanged; metadata
    /// is not carried over.
    pub(crate) fn failure_copy(&self, failure: FailureInfo) -> Self {
        Self {
            payload: self.payload.clone(),
            shape_timestamp: self.shape_timestamp,
            metadata: Metadata::new(),
            failure: Some(failure),
        }
    }

    /// Deep copy with a fresh timestamp and no metadata
    pub fn duplicate(&self) -> Self {
        Self::new(self.payload.clone())
    }
}

/// Value derived from an artifact, rebuilt only when its shape changes
///
/// Typical use is a spatial index held by a derivation across runs.
pub struct ShapeCache<V> {
    slot: Mutex<Option<(u64, Arc<V>)>>,
}

impl<V> Default for ShapeCache<V> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<V> ShapeCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value for this artifact's shape, building it if needed
    pub fn get_or_build<T>(&self, artifact: &Artifact<T>, build: impl FnOnce(&T) -> V) -> Arc<V> {
        let stamp = artifact.shape_timestamp();
        let mut slot = self.slot.lock();
        if let Some((cached_stamp, value)) = slot.as_ref() {
            if *cached_stamp == stamp {
                return Arc::clone(value);
            }
        }
        let value = Arc::new(build(artifact.payload()));
        *slot = Some((stamp, Arc::clone(&value)));
        value
    }

    /// Shape timestamp the cached value was built for
    pub fn stamp(&self) -> Option<u64> {
        self.slot.lock().as_ref().map(|(stamp, _)| *stamp)
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }
}
