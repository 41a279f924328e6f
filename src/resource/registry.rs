//! Canonical index of live resources
//!
//! One coarse mutex guards the id → entry map. Release hooks run after the
//! entry has been removed and the map lock dropped, so a resource's
//! `on_release` may call back into the registry.

use super::prioritizer::{calculate_release_priority, ResourceView};
use super::policy::{ResourceTypeConfig, TypePolicy};
use super::{ManagedResource, Ownership, ResourceId, ResourceMetadata, MB};
use crate::error::{Error, Result};
use crate::metrics;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

struct ResourceEntry {
    id: ResourceId,
    ownership: Ownership,
    metadata: ResourceMetadata,
    registered_at: Instant,
    last_access: Instant,
    access_count: u64,
}

impl ResourceEntry {
    fn view(&self) -> ResourceView {
        ResourceView {
            id: self.id.clone(),
            size_mb: self.metadata.size_mb,
            last_access: self.last_access,
            access_count: self.access_count,
            is_active: self.metadata.is_active,
            compressible: self.metadata.compressible,
        }
    }
}

/// Serializable description of one registered resource
#[derive(Debug, Clone, Serialize)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub resource_type: String,
    pub size_mb: f64,
    pub is_active: bool,
    pub compressible: bool,
    pub access_count: u64,
    pub idle_secs: f64,
    pub age_secs: f64,
    pub weak: bool,
    pub alive: bool,
    pub metadata: ResourceMetadata,
}

/// Per-type totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeStats {
    pub count: usize,
    pub size_mb: f64,
}

/// Registry totals
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub resource_count: usize,
    pub total_size_mb: f64,
    pub weak_handles: usize,
    pub owned_handles: usize,
    pub by_type: BTreeMap<String, TypeStats>,
}

/// Registry of managed resources with typed eviction priorities
pub struct ResourceRegistry {
    resources: Mutex<HashMap<ResourceId, ResourceEntry>>,
    policy: RwLock<TypePolicy>,
}

impl ResourceRegistry {
    pub fn new(policy: TypePolicy) -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            policy: RwLock::new(policy),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TypePolicy::default())
    }

    /// Register a resource; an existing entry under the same id is replaced
    pub fn register(
        &self,
        resource_type: &str,
        name: &str,
        ownership: Ownership,
        mut metadata: ResourceMetadata,
    ) -> Result<ResourceId> {
        if resource_type.is_empty() || name.is_empty() {
            return Err(Error::InvalidArgument(
                "resource type and name must be non-empty".to_string(),
            ));
        }
        // The id splits on the first ':' to recover the type
        if resource_type.contains(':') {
            return Err(Error::InvalidArgument(format!(
                "resource type {:?} must not contain ':'",
                resource_type
            )));
        }
        let resource = ownership.resolve().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "{}:{} handle no longer resolves",
                resource_type, name
            ))
        })?;

        if metadata.size_mb <= 0.0 {
            if let Some(bytes) = resource.size_bytes() {
                metadata.size_mb = bytes as f64 / MB;
            }
        }

        let id = ResourceId::new(resource_type, name);
        let now = Instant::now();
        let entry = ResourceEntry {
            id: id.clone(),
            ownership,
            metadata,
            registered_at: now,
            last_access: now,
            access_count: 0,
        };

        let (replaced, count) = {
            let mut resources = self.resources.lock();
            let replaced = resources.insert(id.clone(), entry).is_some();
            (replaced, resources.len())
        };
        metrics::RESOURCES_REGISTERED.set(count as i64);

        if replaced {
            debug!(id = %id, "Resource re-registered, previous entry replaced");
        } else {
            debug!(id = %id, "Resource registered");
        }
        Ok(id)
    }

    /// Register with the registry keeping the object alive
    pub fn register_owned<R: ManagedResource>(
        &self,
        resource_type: &str,
        name: &str,
        resource: Arc<R>,
        metadata: ResourceMetadata,
    ) -> Result<ResourceId> {
        self.register(resource_type, name, Ownership::owned(resource), metadata)
    }

    /// Register for lookup only; the caller keeps ownership
    pub fn register_weak<R: ManagedResource>(
        &self,
        resource_type: &str,
        name: &str,
        resource: &Arc<R>,
        metadata: ResourceMetadata,
    ) -> Result<ResourceId> {
        self.register(resource_type, name, Ownership::weak(resource), metadata)
    }

    /// Record an access; unknown ids are ignored
    pub fn touch(&self, id: &ResourceId) {
        if let Some(entry) = self.resources.lock().get_mut(id) {
            entry.last_access = Instant::now();
            entry.access_count += 1;
        }
    }

    /// Mark a resource as in use (or not); returns false for unknown ids
    pub fn set_active(&self, id: &ResourceId, is_active: bool) -> bool {
        match self.resources.lock().get_mut(id) {
            Some(entry) => {
                entry.metadata.is_active = is_active;
                true
            }
            None => false,
        }
    }

    /// Update the recorded size, e.g. after in-place compression
    pub fn set_size_mb(&self, id: &ResourceId, size_mb: f64) -> bool {
        match self.resources.lock().get_mut(id) {
            Some(entry) => {
                entry.metadata.size_mb = size_mb.max(0.0);
                true
            }
            None => false,
        }
    }

    /// Live object behind an id
    pub fn get(&self, id: &ResourceId) -> Option<Arc<dyn ManagedResource>> {
        self.resources
            .lock()
            .get(id)
            .and_then(|entry| entry.ownership.resolve())
    }

    pub fn metadata(&self, id: &ResourceId) -> Option<ResourceMetadata> {
        self.resources
            .lock()
            .get(id)
            .map(|entry| entry.metadata.clone())
    }

    pub fn info(&self, id: &ResourceId) -> Option<ResourceInfo> {
        let now = Instant::now();
        self.resources.lock().get(id).map(|entry| ResourceInfo {
            id: entry.id.clone(),
            resource_type: entry.id.resource_type().to_string(),
            size_mb: entry.metadata.size_mb,
            is_active: entry.metadata.is_active,
            compressible: entry.metadata.compressible,
            access_count: entry.access_count,
            idle_secs: now.saturating_duration_since(entry.last_access).as_secs_f64(),
            age_secs: now.saturating_duration_since(entry.registered_at).as_secs_f64(),
            weak: entry.ownership.is_weak(),
            alive: entry.ownership.is_alive(),
            metadata: entry.metadata.clone(),
        })
    }

    /// Views of every resource whose handle still resolves
    pub fn views(&self) -> Vec<ResourceView> {
        self.resources
            .lock()
            .values()
            .filter(|entry| entry.ownership.is_alive())
            .map(ResourceEntry::view)
            .collect()
    }

    /// Drop a resource, returning false for unknown ids unless `force`
    pub fn release(&self, id: &ResourceId, force: bool) -> bool {
        match self.try_release(id) {
            Ok(_) => true,
            Err(Error::ResourceNotFound(_)) => {
                debug!(id = %id, force, "Release of unknown resource");
                force
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Release failed");
                false
            }
        }
    }

    /// Drop a resource and return the approximate bytes it held
    pub fn try_release(&self, id: &ResourceId) -> Result<u64> {
        self.remove_entry(id, "explicit")
    }

    /// `try_release` labelled with the reason recorded in metrics
    pub(crate) fn release_for(&self, id: &ResourceId, reason: &str) -> Result<u64> {
        self.remove_entry(id, reason)
    }

    fn remove_entry(&self, id: &ResourceId, reason: &str) -> Result<u64> {
        let (entry, count) = {
            let mut resources = self.resources.lock();
            let entry = resources
                .remove(id)
                .ok_or_else(|| Error::ResourceNotFound(id.to_string()))?;
            (entry, resources.len())
        };
        metrics::RESOURCES_REGISTERED.set(count as i64);

        let recorded = (entry.metadata.size_mb * MB) as u64;
        let freed = match entry.ownership.resolve() {
            Some(resource) => {
                let bytes = resource.size_bytes().unwrap_or(recorded);
                resource.on_release();
                bytes
            }
            // Already collected by its owner
            None => 0,
        };

        metrics::RESOURCES_RELEASED
            .with_label_values(&[id.resource_type(), reason])
            .inc();
        debug!(id = %id, freed_bytes = freed, reason, "Resource released");
        Ok(freed)
    }

    /// Every live resource, first to release first
    pub fn release_order(&self) -> Vec<ResourceId> {
        let views = self.views();
        let policy = self.policy.read();
        calculate_release_priority(&views, &policy, Instant::now())
    }

    /// Ids in release order, accumulated until their size covers `required_mb`
    pub fn get_release_candidates(&self, required_mb: f64) -> Vec<ResourceId> {
        let views = self.views();
        let sizes: HashMap<&ResourceId, f64> =
            views.iter().map(|view| (&view.id, view.size_mb)).collect();
        let order = {
            let policy = self.policy.read();
            calculate_release_priority(&views, &policy, Instant::now())
        };

        let mut candidates = Vec::new();
        let mut accumulated = 0.0;
        for id in order {
            if accumulated >= required_mb {
                break;
            }
            accumulated += sizes.get(&id).copied().unwrap_or(0.0);
            candidates.push(id);
        }
        candidates
    }

    /// Release candidates until `required_mb` is covered; returns the count
    pub fn release_by_memory_pressure(&self, required_mb: f64) -> usize {
        let candidates = self.get_release_candidates(required_mb);
        let mut released = 0;
        for id in &candidates {
            match self.remove_entry(id, "pressure") {
                Ok(_) => released += 1,
                Err(e) => debug!(id = %id, error = %e, "Candidate vanished before release"),
            }
        }
        info!(
            required_mb,
            candidates = candidates.len(),
            released,
            "Released resources under memory pressure"
        );
        released
    }

    /// Inactive resources idle longer than their type's retain time
    ///
    /// Only lists them; expiry goes through the orchestrator so each one is
    /// released under its write lock.
    pub fn expired_ids(&self) -> Vec<ResourceId> {
        let now = Instant::now();
        let policy = self.policy.read();
        let mut expired: Vec<ResourceId> = self
            .resources
            .lock()
            .values()
            .filter(|entry| !entry.metadata.is_active)
            .filter(|entry| {
                let retain = policy.type_config(entry.id.resource_type()).max_retain_time();
                now.saturating_duration_since(entry.last_access) > retain
            })
            .map(|entry| entry.id.clone())
            .collect();
        expired.sort();
        expired
    }

    /// Drop entries whose weak handle no longer resolves
    pub fn collect_garbage(&self) -> usize {
        let (removed, count) = {
            let mut resources = self.resources.lock();
            let before = resources.len();
            resources.retain(|_, entry| entry.ownership.is_alive());
            (before - resources.len(), resources.len())
        };
        metrics::RESOURCES_REGISTERED.set(count as i64);
        if removed > 0 {
            debug!(removed, "Collected dead weak entries");
        }
        removed
    }

    pub fn type_config(&self, resource_type: &str) -> ResourceTypeConfig {
        self.policy.read().type_config(resource_type)
    }

    pub fn policy(&self) -> TypePolicy {
        self.policy.read().clone()
    }

    pub fn set_policy(&self, policy: TypePolicy) {
        *self.policy.write() = policy;
    }

    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.lock().is_empty()
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources.lock().contains_key(id)
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        self.resources.lock().keys().cloned().collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let resources = self.resources.lock();
        let mut stats = RegistryStats {
            resource_count: resources.len(),
            ..Default::default()
        };
        for entry in resources.values() {
            stats.total_size_mb += entry.metadata.size_mb;
            if entry.ownership.is_weak() {
                stats.weak_handles += 1;
            } else {
                stats.owned_handles += 1;
            }
            let by_type = stats
                .by_type
                .entry(entry.id.resource_type().to_string())
                .or_default();
            by_type.count += 1;
            by_type.size_mb += entry.metadata.size_mb;
        }
        stats
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ByteBuffer, ValueResource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct Counted {
        releases: AtomicUsize,
    }

    impl ManagedResource for Counted {
        fn on_release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn buffer(len: usize) -> Arc<ByteBuffer> {
        Arc::new(ByteBuffer::new(vec![0; len]))
    }

    #[test]
    fn test_register_and_touch() -> Result<()> {
        let registry = ResourceRegistry::with_defaults();
        let id = registry.register_owned(
            "render_cache",
            "frame_1",
            buffer(16),
            ResourceMetadata::new(4.0),
        )?;
        assert_eq!(id.as_str(), "render_cache:frame_1");

        registry.touch(&id);
        registry.touch(&id);
        registry.touch(&ResourceId::from("render_cache:missing"));

        let info = registry.info(&id).unwrap();
        assert_eq!(info.access_count, 2);
        assert_eq!(info.size_mb, 4.0);
        assert!(!info.weak);
        Ok(())
    }

    #[test]
    fn test_register_rejects_null_handles() {
        let registry = ResourceRegistry::with_defaults();
        let dead = {
            let buf = buffer(8);
            Ownership::weak(&buf)
        };
        let result = registry.register("temp_buffers", "gone", dead, ResourceMetadata::default());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        let result = registry.register(
            "",
            "x",
            Ownership::owned(buffer(1)),
            ResourceMetadata::default(),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_register_rejects_separator_in_type() -> Result<()> {
        let registry = ResourceRegistry::with_defaults();
        let err = registry
            .register_owned("render:cache", "frame", buffer(1), ResourceMetadata::new(1.0))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(registry.is_empty());

        // Names may contain the separator; the type still resolves
        let id = registry.register_owned("render_cache", "a:b", buffer(1), ResourceMetadata::new(1.0))?;
        assert_eq!(id.resource_type(), "render_cache");
        assert_eq!(registry.type_config(id.resource_type()).priority, 2);
        Ok(())
    }

    #[test]
    fn test_release_order_covers_every_resource() -> Result<()> {
        let registry = ResourceRegistry::with_defaults();
        let weights = registry.register_owned("model_weights", "w", buffer(1), ResourceMetadata::new(10.0))?;
        let scratch = registry.register_owned("temp_buffers", "s", buffer(1), ResourceMetadata::new(10.0))?;

        assert_eq!(registry.release_order(), vec![scratch, weights]);
        assert_eq!(registry.get_release_candidates(5.0).len(), 1);
        Ok(())
    }

    #[test]
    fn test_size_derived_from_resource() -> Result<()> {
        let registry = ResourceRegistry::with_defaults();
        let id = registry.register_owned(
            "temp_buffers",
            "scratch",
            buffer(2 * 1024 * 1024),
            ResourceMetadata::default(),
        )?;
        assert!((registry.info(&id).unwrap().size_mb - 2.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_reregister_overwrites() -> Result<()> {
        let registry = ResourceRegistry::with_defaults();
        registry.register_owned("temp_buffers", "a", buffer(1), ResourceMetadata::new(1.0))?;
        let id =
            registry.register_owned("temp_buffers", "a", buffer(1), ResourceMetadata::new(9.0))?;
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.info(&id).unwrap().size_mb, 9.0);
        Ok(())
    }

    #[test]
    fn test_release_is_idempotent() -> Result<()> {
        let registry = ResourceRegistry::with_defaults();
        let counted = Arc::new(Counted {
            releases: AtomicUsize::new(0),
        });
        let id = registry.register_owned(
            "decoder_cache",
            "ctx",
            counted.clone(),
            ResourceMetadata::new(1.0),
        )?;

        assert!(registry.release(&id, false));
        assert!(!registry.release(&id, false));
        assert!(registry.release(&id, true));
        assert_eq!(counted.releases.load(Ordering::SeqCst), 1);
        assert!(matches!(
            registry.try_release(&id),
            Err(Error::ResourceNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_release_of_collected_weak_handle_succeeds() -> Result<()> {
        let registry = ResourceRegistry::with_defaults();
        let value = Arc::new(ValueResource::new(serde_json::json!({"k": 1})));
        let id = registry.register_weak("subtitle_cache", "doc", &value, ResourceMetadata::new(1.0))?;

        drop(value);
        assert!(registry.get(&id).is_none());
        assert!(registry.views().is_empty());
        assert_eq!(registry.try_release(&id)?, 0);
        Ok(())
    }

    #[test]
    fn test_collect_garbage() -> Result<()> {
        let registry = ResourceRegistry::with_defaults();
        let kept = buffer(4);
        let dropped = buffer(4);
        registry.register_weak("render_cache", "kept", &kept, ResourceMetadata::new(1.0))?;
        registry.register_weak("render_cache", "dropped", &dropped, ResourceMetadata::new(1.0))?;

        drop(dropped);
        assert_eq!(registry.collect_garbage(), 1);
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn test_expired_ids_skip_active() -> Result<()> {
        let policy = TypePolicy::default().with_type("ephemeral", ResourceTypeConfig::new(1, 0));
        let registry = ResourceRegistry::new(policy);
        registry.register_owned("ephemeral", "idle", buffer(1), ResourceMetadata::new(1.0))?;
        let busy = registry.register_owned(
            "ephemeral",
            "busy",
            buffer(1),
            ResourceMetadata::new(1.0).active(true),
        )?;
        registry.register_owned("model_weights", "w", buffer(1), ResourceMetadata::new(1.0))?;

        thread::sleep(Duration::from_millis(20));
        let expired = registry.expired_ids();
        assert_eq!(expired, vec![ResourceId::from("ephemeral:idle")]);
        assert!(!expired.contains(&busy));
        // Listing never releases
        assert_eq!(registry.len(), 3);
        Ok(())
    }

    #[test]
    fn test_candidates_stop_at_required_size() -> Result<()> {
        let registry = ResourceRegistry::with_defaults();
        registry.register_owned("temp_buffers", "a", buffer(1), ResourceMetadata::new(100.0))?;
        registry.register_owned("temp_buffers", "b", buffer(1), ResourceMetadata::new(100.0))?;
        registry.register_owned("model_weights", "w", buffer(1), ResourceMetadata::new(100.0))?;

        let candidates = registry.get_release_candidates(150.0);
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|id| id.resource_type() == "temp_buffers"));

        assert_eq!(registry.release_by_memory_pressure(150.0), 2);
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn test_stats_by_type() -> Result<()> {
        let registry = ResourceRegistry::with_defaults();
        let weak = buffer(1);
        registry.register_owned("render_cache", "a", buffer(1), ResourceMetadata::new(2.0))?;
        registry.register_owned("render_cache", "b", buffer(1), ResourceMetadata::new(3.0))?;
        registry.register_weak("model_shards", "s", &weak, ResourceMetadata::new(10.0))?;

        let stats = registry.stats();
        assert_eq!(stats.resource_count, 3);
        assert_eq!(stats.weak_handles, 1);
        assert_eq!(stats.owned_handles, 2);
        assert!((stats.total_size_mb - 15.0).abs() < 1e-9);
        assert_eq!(
            stats.by_type["render_cache"],
            TypeStats {
                count: 2,
                size_mb: 5.0
            }
        );
        Ok(())
    }
}
