//! Engine composition root
//!
//! `MemoryContext` owns one instance of every component and the background
//! loops that drive them. Build it once and share it by reference or `Arc`.

use crate::alloc::{CompressedAllocator, CompressionStats};
use crate::config::EngineConfig;
use crate::defrag::{CompactionReport, Defragmenter};
use crate::error::Result;
use crate::leak::{AllocatorSampler, LeakDetector, ProcessSampler, RegistrySampler};
use crate::lock::LockManager;
use crate::metrics;
use crate::monitor::{MemoryMonitor, MemoryStatus, PressureWatcher};
use crate::orchestrator::{ReleaseOrchestrator, ReleaseReport};
use crate::resource::{Ownership, ResourceId, ResourceMetadata, ResourceRegistry};
use crate::snapshot::SnapshotStore;
use crate::state::MemoryStateSnapshot;
use crate::task::BackgroundTask;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

pub struct MemoryContext {
    config: EngineConfig,
    registry: Arc<ResourceRegistry>,
    locks: Arc<LockManager>,
    snapshots: Arc<SnapshotStore>,
    allocator: Arc<CompressedAllocator>,
    monitor: Arc<MemoryMonitor>,
    defragmenter: Arc<Defragmenter>,
    leak_detector: Arc<LeakDetector>,
    orchestrator: Arc<ReleaseOrchestrator>,
    watcher: Arc<PressureWatcher>,
    tasks: Mutex<Vec<BackgroundTask>>,
}

impl MemoryContext {
    /// Build every component; no background thread is started
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        metrics::init_metrics();

        let registry = Arc::new(ResourceRegistry::new(config.registry.clone()));
        let locks = Arc::new(LockManager::new(&config.locks));
        let snapshots = Arc::new(SnapshotStore::new(config.snapshots.clone(), registry.clone()));
        let allocator = Arc::new(CompressedAllocator::new(config.allocator.clone()));
        let monitor = Arc::new(MemoryMonitor::new(config.monitor.clone()));

        let defragmenter = Arc::new(Defragmenter::new(
            config.defrag.clone(),
            monitor.clone(),
            config.report_dir.clone(),
        ));
        {
            let registry = registry.clone();
            defragmenter.add_collection_hook("registry", move || registry.collect_garbage());
        }
        {
            let snapshots = snapshots.clone();
            defragmenter.add_collection_hook("snapshots", move || snapshots.purge_expired());
        }

        let leak_detector = Arc::new(LeakDetector::new(
            config.leak.clone(),
            monitor.clone(),
            config.report_dir.clone(),
        ));
        leak_detector.add_sampler(Box::new(ProcessSampler::new(monitor.clone())));
        leak_detector.add_sampler(Box::new(RegistrySampler::new(registry.clone())));
        leak_detector.add_sampler(Box::new(AllocatorSampler::new(allocator.clone())));
        {
            let registry = registry.clone();
            leak_detector.set_collect_hook(move || registry.collect_garbage());
        }

        let orchestrator = Arc::new(ReleaseOrchestrator::new(
            config.orchestrator.clone(),
            registry.clone(),
            locks.clone(),
            snapshots.clone(),
            defragmenter.clone(),
            config.allocator.compression_level,
        ));
        let watcher = Arc::new(PressureWatcher::new(monitor.clone(), orchestrator.clone()));

        info!(
            budget_mb = config.monitor.budget_mb,
            resource_types = config.registry.resource_types.len(),
            "Memory context created"
        );

        Ok(Self {
            config,
            registry,
            locks,
            snapshots,
            allocator,
            monitor,
            defragmenter,
            leak_detector,
            orchestrator,
            watcher,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Build the context and start its background loops
    pub fn start(config: EngineConfig) -> Result<Self> {
        let ctx = Self::new(config)?;
        ctx.start_background_tasks()?;
        Ok(ctx)
    }

    /// Spawn the periodic loops; a second call is a no-op
    pub fn start_background_tasks(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!("Background tasks already running");
            return Ok(());
        }

        {
            let locks = self.locks.clone();
            tasks.push(BackgroundTask::spawn(
                "lock-sweep",
                self.config.locks.sweep_interval(),
                move || {
                    locks.sweep_expired();
                    Ok(())
                },
            )?);
        }

        {
            let snapshots = self.snapshots.clone();
            let orchestrator = self.orchestrator.clone();
            let expire_idle = self.config.orchestrator.expire_idle;
            tasks.push(BackgroundTask::spawn(
                "retention",
                self.config.snapshots.cleanup_interval(),
                move || {
                    snapshots.purge_expired();
                    if expire_idle {
                        orchestrator.release_expired();
                    }
                    Ok(())
                },
            )?);
        }

        {
            let allocator = self.allocator.clone();
            tasks.push(BackgroundTask::spawn(
                "block-compress",
                self.config.allocator.scan_interval(),
                move || {
                    allocator.compress_idle_blocks(None);
                    Ok(())
                },
            )?);
        }

        if let Some(interval) = self.config.defrag.auto_compact_interval() {
            let defragmenter = self.defragmenter.clone();
            tasks.push(BackgroundTask::spawn("defrag", interval, move || {
                defragmenter.compact_on_timer();
                Ok(())
            })?);
        }

        if self.config.leak.enabled {
            let detector = self.leak_detector.clone();
            tasks.push(BackgroundTask::spawn(
                "leak-check",
                self.config.leak.check_interval(),
                move || detector.check().map(|_| ()),
            )?);
        }

        if self.config.monitor.watch_enabled {
            let watcher = self.watcher.clone();
            tasks.push(BackgroundTask::spawn(
                "pressure-watch",
                self.config.monitor.watch_interval(),
                move || {
                    watcher.check_once();
                    Ok(())
                },
            )?);
        }

        info!(tasks = tasks.len(), "Background tasks started");
        Ok(())
    }

    pub fn running_tasks(&self) -> Vec<String> {
        self.tasks
            .lock()
            .iter()
            .filter(|task| task.is_running())
            .map(|task| task.name().to_string())
            .collect()
    }

    /// Stop and join every background loop
    pub fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.stop();
        }
        for task in tasks.iter_mut() {
            task.join();
        }
        if !tasks.is_empty() {
            info!(tasks = tasks.len(), "Background tasks stopped");
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn allocator(&self) -> &Arc<CompressedAllocator> {
        &self.allocator
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.monitor
    }

    pub fn defragmenter(&self) -> &Arc<Defragmenter> {
        &self.defragmenter
    }

    pub fn leak_detector(&self) -> &Arc<LeakDetector> {
        &self.leak_detector
    }

    pub fn orchestrator(&self) -> &Arc<ReleaseOrchestrator> {
        &self.orchestrator
    }

    pub fn watcher(&self) -> &Arc<PressureWatcher> {
        &self.watcher
    }

    // Consumer-facing shortcuts

    pub fn register(
        &self,
        resource_type: &str,
        name: &str,
        ownership: Ownership,
        metadata: ResourceMetadata,
    ) -> Result<ResourceId> {
        self.registry.register(resource_type, name, ownership, metadata)
    }

    pub fn touch(&self, id: &ResourceId) {
        self.registry.touch(id);
    }

    pub fn release(&self, id: &ResourceId, force: bool) -> bool {
        self.registry.release(id, force)
    }

    pub fn get_memory_status(&self) -> MemoryStatus {
        self.monitor.get_memory_status()
    }

    pub fn get_compression_stats(&self) -> CompressionStats {
        self.allocator.get_compression_stats()
    }

    pub fn handle_memory_pressure(&self, required_mb: f64) -> ReleaseReport {
        self.orchestrator.handle_memory_pressure(required_mb)
    }

    pub fn compact_memory(&self) -> Option<CompactionReport> {
        self.defragmenter.compact_memory()
    }

    pub fn create_memory_snapshot(&self, label: &str) -> MemoryStateSnapshot {
        MemoryStateSnapshot::capture(label, &self.monitor, &self.registry)
    }
}

impl Drop for MemoryContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ByteBuffer;
    use std::time::Duration;

    fn quiet_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.monitor.watch_enabled = false;
        config.leak.enabled = false;
        config
    }

    #[test]
    fn test_context_wires_components() -> Result<()> {
        let ctx = MemoryContext::new(quiet_config())?;
        let buffer = Arc::new(ByteBuffer::new(vec![3; 1024]));
        let id = ctx.register(
            "temp_buffers",
            "scratch",
            Ownership::owned(buffer),
            ResourceMetadata::new(0.0),
        )?;
        ctx.touch(&id);

        let before = ctx.create_memory_snapshot("before");
        assert_eq!(before.resources["temp_buffers"].count, 1);

        let report = ctx.handle_memory_pressure(0.0001);
        assert_eq!(report.released, vec![id.clone()]);
        assert!(!ctx.release(&id, false));
        assert!(ctx.running_tasks().is_empty());
        assert_eq!(ctx.watcher().overflow_callback_count(), 0);
        Ok(())
    }

    #[test]
    fn test_background_tasks_start_and_stop() -> Result<()> {
        let mut config = quiet_config();
        config.leak.enabled = true;
        config.leak.check_interval_secs = 1;
        let ctx = MemoryContext::start(config)?;
        ctx.start_background_tasks()?;

        let running = ctx.running_tasks();
        assert!(running.contains(&"lock-sweep".to_string()));
        assert!(running.contains(&"leak-check".to_string()));
        assert!(!running.contains(&"pressure-watch".to_string()));

        std::thread::sleep(Duration::from_millis(20));
        ctx.shutdown();
        assert!(ctx.running_tasks().is_empty());
        Ok(())
    }
}
