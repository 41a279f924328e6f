//! Pre-release snapshots and rollback
//!
//! Snapshots are in-memory and time-bounded: the store holds at most
//! `max_snapshots` entries (oldest dropped first) and a background sweep
//! purges entries older than `snapshot_ttl`. Only resources whose type
//! priority is at or below `snapshot_priority_threshold` are copied.

use crate::config::SnapshotConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::resource::{Backup, Ownership, ResourceId, ResourceMetadata, ResourceRegistry};
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Backup of one resource taken before release
#[derive(Debug, Clone)]
struct Snapshot {
    metadata: ResourceMetadata,
    backup: Backup,
    created_at: Instant,
    created_wall: DateTime<Utc>,
}

/// Description of a held snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub resource_id: ResourceId,
    pub created_at: DateTime<Utc>,
    pub age_secs: f64,
    pub backup_kind: &'static str,
    pub size_bytes: u64,
    pub metadata: ResourceMetadata,
}

/// Outcome of a successful rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RollbackKind {
    /// The live resource was overwritten in place
    Restored,
    /// The resource was gone and has been registered again from its backup
    Reregistered,
}

/// Bounded store of pre-release backups
pub struct SnapshotStore {
    snapshots: Mutex<LruCache<ResourceId, Snapshot>>,
    config: SnapshotConfig,
    registry: Arc<ResourceRegistry>,
}

impl SnapshotStore {
    pub fn new(config: SnapshotConfig, registry: Arc<ResourceRegistry>) -> Self {
        let capacity = NonZeroUsize::new(config.max_snapshots).unwrap_or(NonZeroUsize::MIN);
        info!(
            max_snapshots = capacity.get(),
            ttl_secs = config.snapshot_ttl_secs,
            priority_threshold = config.snapshot_priority_threshold,
            "Snapshot store initialized"
        );
        Self {
            snapshots: Mutex::new(LruCache::new(capacity)),
            config,
            registry,
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Whether a resource type is eligible for snapshots
    pub fn qualifies(&self, id: &ResourceId) -> bool {
        self.registry.type_config(id.resource_type()).priority
            <= self.config.snapshot_priority_threshold
    }

    /// Copy a registered resource so it can be rolled back after release
    ///
    /// Failure is non-fatal to callers: the release may proceed without
    /// rollback capability.
    pub fn take_snapshot(&self, id: &ResourceId) -> Result<()> {
        let priority = self.registry.type_config(id.resource_type()).priority;
        if priority > self.config.snapshot_priority_threshold {
            debug!(
                resource = %id,
                priority,
                threshold = self.config.snapshot_priority_threshold,
                "Type priority above snapshot threshold"
            );
            return Err(Error::SnapshotUnavailable(format!(
                "{} has priority {} above threshold {}",
                id, priority, self.config.snapshot_priority_threshold
            )));
        }

        let metadata = self
            .registry
            .metadata(id)
            .ok_or_else(|| Error::ResourceNotFound(id.to_string()))?;
        let resource = self
            .registry
            .get(id)
            .ok_or_else(|| Error::ResourceNotFound(id.to_string()))?;
        let backup = resource.backup().ok_or_else(|| {
            warn!(resource = %id, "Resource cannot be copied, no snapshot taken");
            Error::SnapshotUnavailable(format!("{} does not support backups", id))
        })?;

        let size_bytes = backup.size_bytes();
        let snapshot = Snapshot {
            metadata,
            backup,
            created_at: Instant::now(),
            created_wall: Utc::now(),
        };

        let held = {
            let mut snapshots = self.snapshots.lock();
            if let Some((evicted, _)) = snapshots.push(id.clone(), snapshot) {
                if &evicted != id {
                    debug!(evicted = %evicted, "Snapshot limit reached, dropped oldest");
                }
            }
            snapshots.len()
        };
        metrics::SNAPSHOTS_HELD.set(held as i64);
        info!(resource = %id, size_bytes, "Snapshot taken");
        Ok(())
    }

    /// Restore a resource from its snapshot
    ///
    /// A live resource is overwritten in place and the snapshot kept. A
    /// released resource is registered again as an owned handle from the
    /// backup; that consumes the snapshot.
    pub fn rollback(&self, id: &ResourceId) -> Result<RollbackKind> {
        let mut snapshots = self.snapshots.lock();
        let Some(snapshot) = snapshots.peek(id) else {
            metrics::ROLLBACKS.with_label_values(&["missing"]).inc();
            warn!(resource = %id, "No snapshot to roll back to");
            return Err(Error::SnapshotUnavailable(format!("no snapshot for {}", id)));
        };

        if let Some(live) = self.registry.get(id) {
            let result = live.restore(&snapshot.backup);
            drop(snapshots);
            return match result {
                Ok(()) => {
                    metrics::ROLLBACKS.with_label_values(&["restored"]).inc();
                    info!(resource = %id, "Resource restored in place from snapshot");
                    Ok(RollbackKind::Restored)
                }
                Err(e) => {
                    metrics::ROLLBACKS.with_label_values(&["failed"]).inc();
                    warn!(resource = %id, error = %e, "In-place restore failed");
                    Err(e)
                }
            };
        }

        let snapshot = match snapshots.pop(id) {
            Some(snapshot) => snapshot,
            None => return Err(Error::SnapshotUnavailable(format!("no snapshot for {}", id))),
        };
        let held = snapshots.len();
        drop(snapshots);
        metrics::SNAPSHOTS_HELD.set(held as i64);

        let resource = snapshot.backup.into_resource();
        self.registry.register(
            id.resource_type(),
            id.name(),
            Ownership::OwnedHandle(resource),
            snapshot.metadata,
        )?;
        metrics::ROLLBACKS.with_label_values(&["reregistered"]).inc();
        info!(resource = %id, "Released resource re-registered from snapshot");
        Ok(RollbackKind::Reregistered)
    }

    pub fn has_snapshot(&self, id: &ResourceId) -> bool {
        self.snapshots.lock().contains(id)
    }

    pub fn snapshot_info(&self, id: &ResourceId) -> Option<SnapshotInfo> {
        self.snapshots
            .lock()
            .peek(id)
            .map(|snapshot| Self::describe(id, snapshot))
    }

    /// All snapshots, newest first
    pub fn list_snapshots(&self) -> Vec<SnapshotInfo> {
        let mut infos: Vec<(Instant, SnapshotInfo)> = self
            .snapshots
            .lock()
            .iter()
            .map(|(id, snapshot)| (snapshot.created_at, Self::describe(id, snapshot)))
            .collect();
        infos.sort_by(|(a, _), (b, _)| b.cmp(a));
        infos.into_iter().map(|(_, info)| info).collect()
    }

    pub fn delete_snapshot(&self, id: &ResourceId) -> bool {
        let (deleted, held) = {
            let mut snapshots = self.snapshots.lock();
            (snapshots.pop(id).is_some(), snapshots.len())
        };
        metrics::SNAPSHOTS_HELD.set(held as i64);
        if deleted {
            debug!(resource = %id, "Snapshot deleted");
        }
        deleted
    }

    pub fn clear(&self) -> usize {
        let count = {
            let mut snapshots = self.snapshots.lock();
            let count = snapshots.len();
            snapshots.clear();
            count
        };
        metrics::SNAPSHOTS_HELD.set(0);
        info!(count, "All snapshots cleared");
        count
    }

    /// Drop snapshots older than the TTL
    pub fn purge_expired(&self) -> usize {
        let ttl = self.config.snapshot_ttl();
        let now = Instant::now();
        let (purged, held) = {
            let mut snapshots = self.snapshots.lock();
            let expired: Vec<ResourceId> = snapshots
                .iter()
                .filter(|(_, snapshot)| now.saturating_duration_since(snapshot.created_at) > ttl)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                snapshots.pop(id);
            }
            (expired.len(), snapshots.len())
        };
        metrics::SNAPSHOTS_HELD.set(held as i64);
        if purged > 0 {
            info!(purged, "Purged expired snapshots");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }

    fn describe(id: &ResourceId, snapshot: &Snapshot) -> SnapshotInfo {
        SnapshotInfo {
            resource_id: id.clone(),
            created_at: snapshot.created_wall,
            age_secs: snapshot.created_at.elapsed().as_secs_f64(),
            backup_kind: snapshot.backup.kind(),
            size_bytes: snapshot.backup.size_bytes(),
            metadata: snapshot.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ByteBuffer, ManagedResource, ValueResource};
    use std::thread;
    use std::time::Duration;

    struct Opaque;

    impl ManagedResource for Opaque {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn store(config: SnapshotConfig) -> (Arc<ResourceRegistry>, SnapshotStore) {
        let registry = Arc::new(ResourceRegistry::with_defaults());
        let store = SnapshotStore::new(config, registry.clone());
        (registry, store)
    }

    #[test]
    fn test_rollback_in_place() -> Result<()> {
        let (registry, store) = store(SnapshotConfig::default());
        let buffer = Arc::new(ByteBuffer::new(b"original".to_vec()));
        let id = registry.register_weak("render_cache", "f1", &buffer, ResourceMetadata::new(1.0))?;

        store.take_snapshot(&id)?;
        buffer.write(|data| data.copy_from_slice(b"mutated!"))?;

        assert_eq!(store.rollback(&id)?, RollbackKind::Restored);
        assert_eq!(buffer.read()?, b"original");
        // In-place restore keeps the snapshot
        assert!(store.has_snapshot(&id));
        Ok(())
    }

    #[test]
    fn test_rollback_after_release_reregisters() -> Result<()> {
        let (registry, store) = store(SnapshotConfig::default());
        let id = registry.register_owned(
            "decoder_cache",
            "ctx",
            Arc::new(ValueResource::new(serde_json::json!({"codec": "h264"}))),
            ResourceMetadata::new(2.0).with("track", 1),
        )?;

        store.take_snapshot(&id)?;
        assert!(registry.release(&id, false));
        assert!(!registry.contains(&id));

        assert_eq!(store.rollback(&id)?, RollbackKind::Reregistered);
        let restored = registry.get(&id).unwrap();
        let value = restored.as_any().downcast_ref::<ValueResource>().unwrap().get();
        assert_eq!(value, serde_json::json!({"codec": "h264"}));
        assert_eq!(registry.metadata(&id).unwrap().extra["track"], 1);
        assert!(!store.has_snapshot(&id));
        Ok(())
    }

    #[test]
    fn test_priority_gate() -> Result<()> {
        let (registry, store) = store(SnapshotConfig::default());
        let id = registry.register_owned(
            "model_weights",
            "w",
            Arc::new(ByteBuffer::new(vec![1])),
            ResourceMetadata::new(1.0),
        )?;
        assert!(!store.qualifies(&id));
        assert!(matches!(
            store.take_snapshot(&id),
            Err(Error::SnapshotUnavailable(_))
        ));
        Ok(())
    }

    #[test]
    fn test_uncopyable_resource() -> Result<()> {
        let (registry, store) = store(SnapshotConfig::default());
        let id = registry.register_owned("temp_buffers", "raw", Arc::new(Opaque), ResourceMetadata::new(1.0))?;
        assert!(matches!(
            store.take_snapshot(&id),
            Err(Error::SnapshotUnavailable(_))
        ));
        assert!(matches!(store.rollback(&id), Err(Error::SnapshotUnavailable(_))));
        Ok(())
    }

    #[test]
    fn test_capacity_drops_oldest() -> Result<()> {
        let (registry, store) = store(SnapshotConfig {
            max_snapshots: 2,
            ..Default::default()
        });
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let id = registry.register_owned(
                "temp_buffers",
                name,
                Arc::new(ByteBuffer::new(vec![0; 8])),
                ResourceMetadata::new(1.0),
            )?;
            store.take_snapshot(&id)?;
            ids.push(id);
            thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(store.len(), 2);
        assert!(!store.has_snapshot(&ids[0]));
        let listed: Vec<ResourceId> = store
            .list_snapshots()
            .into_iter()
            .map(|info| info.resource_id)
            .collect();
        assert_eq!(listed, vec![ids[2].clone(), ids[1].clone()]);
        Ok(())
    }

    #[test]
    fn test_purge_expired_and_clear() -> Result<()> {
        let (registry, store) = store(SnapshotConfig {
            snapshot_ttl_secs: 0,
            ..Default::default()
        });
        let id = registry.register_owned(
            "render_cache",
            "old",
            Arc::new(ByteBuffer::new(vec![0; 8])),
            ResourceMetadata::new(1.0),
        )?;
        store.take_snapshot(&id)?;
        let info = store.snapshot_info(&id).unwrap();
        assert_eq!(info.backup_kind, "bytes");
        assert_eq!(info.size_bytes, 8);

        thread::sleep(Duration::from_millis(10));
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());

        store.take_snapshot(&id)?;
        assert!(store.delete_snapshot(&id));
        assert!(!store.delete_snapshot(&id));
        store.take_snapshot(&id)?;
        assert_eq!(store.clear(), 1);
        Ok(())
    }
}
