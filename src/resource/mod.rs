//! Resource tracking
//!
//! # Architecture
//!
//! ```text
//! ResourceRegistry (coarse mutex)
//!   ├─→ "model_shards:encoder" → Ownership::OwnedHandle(Arc<dyn ManagedResource>)
//!   ├─→ "render_cache:frame_12" → Ownership::WeakRef(Weak<dyn ManagedResource>)
//!   └─→ ...
//!
//! TypePolicy
//!   ├─→ temp_buffers  → priority 1, retain 60s
//!   └─→ model_weights → priority 5, retain 3600s
//!
//! calculate_release_priority(views, policy) → [id, id, ...] (release first → last)
//! ```
//!
//! Consumers hand the registry either an owned handle (the registry keeps the
//! object alive until released) or a weak handle (lookup only; the consumer
//! keeps ownership and the entry becomes dead when the object is dropped).

pub mod buffer;
pub mod policy;
pub mod prioritizer;
pub mod registry;

pub use buffer::{BufferState, ByteBuffer, ValueResource};
pub use policy::{ReleaseWeights, ResourceTypeConfig, TypePolicy};
pub use prioritizer::{calculate_release_priority, release_score, ResourceView};
pub use registry::{RegistryStats, ResourceInfo, ResourceRegistry, TypeStats};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

pub(crate) const MB: f64 = 1024.0 * 1024.0;

/// Unique resource identifier in `type:name` form
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Build an id from its type and name
    pub fn new(resource_type: &str, name: &str) -> Self {
        Self(format!("{}:{}", resource_type, name))
    }

    /// Type part of the id (`unknown` when the id has no separator)
    pub fn resource_type(&self) -> &str {
        self.0.split_once(':').map(|(t, _)| t).unwrap_or("unknown")
    }

    /// Name part of the id
    pub fn name(&self) -> &str {
        self.0.split_once(':').map(|(_, n)| n).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Caller-supplied description of a resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceMetadata {
    /// Size in MB; derived from [`ManagedResource::size_bytes`] when zero
    pub size_mb: f64,
    /// In use right now; strongly protected from release
    pub is_active: bool,
    /// Can be compressed in place instead of released
    pub compressible: bool,
    /// Free-form attributes carried through snapshots
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ResourceMetadata {
    pub fn new(size_mb: f64) -> Self {
        Self {
            size_mb,
            ..Default::default()
        }
    }

    pub fn active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    pub fn compressible(mut self, compressible: bool) -> Self {
        self.compressible = compressible;
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Copy of a resource taken before release
#[derive(Clone)]
pub enum Backup {
    /// Raw byte copy
    Bytes(Vec<u8>),
    /// Structural copy of a value type
    Value(serde_json::Value),
    /// Detached copy produced by the resource itself
    Custom(Arc<dyn ManagedResource>),
}

impl Backup {
    /// Best-effort generic deep copy through serde
    pub fn from_serialize<T: Serialize>(value: &T) -> Option<Self> {
        serde_json::to_value(value).ok().map(Backup::Value)
    }

    /// Approximate memory held by the backup
    pub fn size_bytes(&self) -> u64 {
        match self {
            Backup::Bytes(bytes) => bytes.len() as u64,
            Backup::Value(value) => serde_json::to_vec(value)
                .map(|v| v.len() as u64)
                .unwrap_or(0),
            Backup::Custom(resource) => resource.size_bytes().unwrap_or(0),
        }
    }

    /// Turn the backup into a live resource for re-registration
    pub fn into_resource(self) -> Arc<dyn ManagedResource> {
        match self {
            Backup::Bytes(bytes) => Arc::new(ByteBuffer::new(bytes)),
            Backup::Value(value) => Arc::new(ValueResource::new(value)),
            Backup::Custom(resource) => resource,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Backup::Bytes(_) => "bytes",
            Backup::Value(_) => "value",
            Backup::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for Backup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backup")
            .field("kind", &self.kind())
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

/// An object whose memory the engine manages
///
/// Only `as_any` is required. The remaining hooks opt a type into sizing,
/// snapshots, in-place compression and release notification.
pub trait ManagedResource: Send + Sync + 'static {
    /// Current payload size, when the resource can tell
    fn size_bytes(&self) -> Option<u64> {
        None
    }

    /// Detached copy for rollback; `None` when the type cannot be copied
    fn backup(&self) -> Option<Backup> {
        None
    }

    /// Overwrite the live contents from a backup
    fn restore(&self, _backup: &Backup) -> Result<()> {
        Err(Error::SnapshotUnavailable(
            "resource does not support in-place restore".to_string(),
        ))
    }

    /// Compress in place, returning the bytes saved (`None` if not applicable)
    fn compress(&self, _level: i32) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Called once when the registry drops its handle
    fn on_release(&self) {}

    fn as_any(&self) -> &dyn Any;
}

/// How the registry holds a resource
#[derive(Clone)]
pub enum Ownership {
    /// Lookup only; the caller keeps the object alive
    WeakRef(Weak<dyn ManagedResource>),
    /// The registry keeps the object alive until released
    OwnedHandle(Arc<dyn ManagedResource>),
}

impl Ownership {
    pub fn owned<R: ManagedResource>(resource: Arc<R>) -> Self {
        Ownership::OwnedHandle(resource)
    }

    pub fn weak<R: ManagedResource>(resource: &Arc<R>) -> Self {
        let resource: Arc<dyn ManagedResource> = resource.clone();
        Ownership::WeakRef(Arc::downgrade(&resource))
    }

    /// Resolve to the live object, if any
    pub fn resolve(&self) -> Option<Arc<dyn ManagedResource>> {
        match self {
            Ownership::WeakRef(weak) => weak.upgrade(),
            Ownership::OwnedHandle(strong) => Some(strong.clone()),
        }
    }

    pub fn is_weak(&self) -> bool {
        matches!(self, Ownership::WeakRef(_))
    }

    pub fn is_alive(&self) -> bool {
        match self {
            Ownership::WeakRef(weak) => weak.strong_count() > 0,
            Ownership::OwnedHandle(_) => true,
        }
    }
}

impl fmt::Debug for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ownership::WeakRef(_) => write!(f, "WeakRef(alive={})", self.is_alive()),
            Ownership::OwnedHandle(_) => f.write_str("OwnedHandle"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_parts() {
        let id = ResourceId::new("model_shards", "encoder:layer0");
        assert_eq!(id.as_str(), "model_shards:encoder:layer0");
        assert_eq!(id.resource_type(), "model_shards");
        assert_eq!(id.name(), "encoder:layer0");

        let bare = ResourceId::from("orphan");
        assert_eq!(bare.resource_type(), "unknown");
        assert_eq!(bare.name(), "orphan");
    }

    #[test]
    fn test_weak_ownership_dies_with_owner() {
        let buffer = Arc::new(ByteBuffer::new(vec![1, 2, 3]));
        let ownership = Ownership::weak(&buffer);
        assert!(ownership.is_weak());
        assert!(ownership.resolve().is_some());

        drop(buffer);
        assert!(!ownership.is_alive());
        assert!(ownership.resolve().is_none());
    }

    #[test]
    fn test_backup_into_resource() {
        let restored = Backup::Bytes(vec![7; 16]).into_resource();
        assert_eq!(restored.size_bytes(), Some(16));

        let value = Backup::from_serialize(&vec![1, 2, 3]).unwrap();
        assert_eq!(value.kind(), "value");
        let restored = value.into_resource();
        let value = restored
            .as_any()
            .downcast_ref::<ValueResource>()
            .unwrap()
            .get();
        assert_eq!(value, serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_metadata_builder() {
        let meta = ResourceMetadata::new(12.5)
            .active(true)
            .compressible(true)
            .with("source", "decoder");
        assert_eq!(meta.size_mb, 12.5);
        assert!(meta.is_active);
        assert!(meta.compressible);
        assert_eq!(meta.extra["source"], "decoder");
    }
}
