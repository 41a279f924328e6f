//! Release passes under memory pressure
//!
//! A pass walks every live resource in prioritizer order, taking each one's
//! write lock before touching it, and stops as soon as the requested volume
//! is freed. Candidates whose lock cannot be taken in time are skipped;
//! nothing in a pass blocks on a single resource for longer than
//! `lock_acquire_timeout`.
//!
//! Expiry of idle resources goes through the same per-resource step with a
//! non-blocking lock attempt, so a resource somebody holds is never expired
//! underneath them.

use crate::config::OrchestratorConfig;
use crate::defrag::Defragmenter;
use crate::error::Result;
use crate::lock::{LockManager, LockOwner};
use crate::metrics;
use crate::resource::{ResourceId, ResourceRegistry, MB};
use crate::snapshot::{RollbackKind, SnapshotStore};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Post-release check; returning false marks the release as harmful
pub type ReleaseValidator = Box<dyn Fn(&ReleaseEvent) -> bool + Send + Sync>;

/// Outcome of one pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReleaseReport {
    pub requested_mb: f64,
    pub freed_mb: f64,
    pub released: Vec<ResourceId>,
    pub compressed: Vec<ResourceId>,
    pub skipped_locked: Vec<ResourceId>,
    /// Released or compressed, then restored after failing validation
    pub rolled_back: Vec<ResourceId>,
    pub snapshots_taken: usize,
    pub snapshot_failures: usize,
    pub duration_ms: u64,
}

impl ReleaseReport {
    pub fn satisfied(&self) -> bool {
        self.freed_mb >= self.requested_mb
    }
}

/// What happened to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseAction {
    Released,
    Expired,
    Compressed,
    SkippedLocked,
    RolledBack,
}

/// Entry of the in-memory release history
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseEvent {
    pub at: DateTime<Utc>,
    pub resource_id: ResourceId,
    pub action: ReleaseAction,
    pub freed_mb: f64,
    pub duration_ms: f64,
    pub snapshot: bool,
    /// `None` when no validator ran
    pub validated: Option<bool>,
    pub rolled_back: bool,
}

impl ReleaseEvent {
    fn new(id: &ResourceId, action: ReleaseAction, freed_mb: f64, snapshot: bool) -> Self {
        Self {
            at: Utc::now(),
            resource_id: id.clone(),
            action,
            freed_mb,
            duration_ms: 0.0,
            snapshot,
            validated: None,
            rolled_back: false,
        }
    }

    /// MB freed per millisecond spent
    pub fn efficiency(&self) -> f64 {
        self.freed_mb / self.duration_ms.max(0.1)
    }
}

/// Running totals
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorStats {
    pub passes: u64,
    pub total_released_mb: f64,
    pub released_count: u64,
    pub expired_count: u64,
    pub compressed_count: u64,
    pub skipped_locked: u64,
    pub rollback_count: u64,
    pub validation_failures: u64,
    pub auto_rollbacks: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Pressure,
    Expiry,
}

impl Trigger {
    fn reason(self) -> &'static str {
        match self {
            Trigger::Pressure => "pressure",
            Trigger::Expiry => "expired",
        }
    }

    fn release_action(self) -> ReleaseAction {
        match self {
            Trigger::Pressure => ReleaseAction::Released,
            Trigger::Expiry => ReleaseAction::Expired,
        }
    }
}

enum Disposal {
    Compressed { saved_mb: f64, resident_mb: f64 },
    Released(f64),
}

/// Composes registry, locks, snapshots and the defragmenter
pub struct ReleaseOrchestrator {
    config: OrchestratorConfig,
    registry: Arc<ResourceRegistry>,
    locks: Arc<LockManager>,
    snapshots: Arc<SnapshotStore>,
    defragmenter: Arc<Defragmenter>,
    compression_level: i32,
    validators: RwLock<Vec<(String, ReleaseValidator)>>,
    pass: Mutex<()>,
    history: Mutex<VecDeque<ReleaseEvent>>,
    stats: Mutex<OrchestratorStats>,
}

impl ReleaseOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<ResourceRegistry>,
        locks: Arc<LockManager>,
        snapshots: Arc<SnapshotStore>,
        defragmenter: Arc<Defragmenter>,
        compression_level: i32,
    ) -> Self {
        Self {
            config,
            registry,
            locks,
            snapshots,
            defragmenter,
            compression_level,
            validators: RwLock::new(Vec::new()),
            pass: Mutex::new(()),
            history: Mutex::new(VecDeque::new()),
            stats: Mutex::new(OrchestratorStats::default()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Check run after every release or in-place compression
    ///
    /// When any validator rejects an event and a snapshot was taken, the
    /// resource is rolled back and its volume no longer counts as freed.
    pub fn add_release_validator<F>(&self, name: &str, validator: F)
    where
        F: Fn(&ReleaseEvent) -> bool + Send + Sync + 'static,
    {
        self.validators
            .write()
            .push((name.to_string(), Box::new(validator)));
        debug!(validator = name, "Release validator registered");
    }

    /// Free at least `required_mb` if enough releasable resources exist
    ///
    /// Passes are serialized; a second caller waits for the running pass
    /// and then plans against the registry as it stands.
    pub fn handle_memory_pressure(&self, required_mb: f64) -> ReleaseReport {
        let _pass = self.pass.lock();
        let started = Instant::now();
        let mut report = ReleaseReport {
            requested_mb: required_mb,
            ..Default::default()
        };
        if required_mb <= 0.0 {
            return report;
        }

        let order = self.registry.release_order();
        info!(required_mb, resources = order.len(), "Memory pressure pass started");

        let owner = LockOwner::new_unique();
        let wait = Some(self.config.lock_acquire_timeout());
        let mut freed_bytes = 0u64;
        for id in order {
            if report.freed_mb >= required_mb {
                break;
            }
            freed_bytes += self.process(&id, &owner, wait, Trigger::Pressure, &mut report);
        }

        self.finish_pass(&mut report, started, freed_bytes, Trigger::Pressure);
        info!(
            required_mb,
            freed_mb = report.freed_mb,
            released = report.released.len(),
            compressed = report.compressed.len(),
            skipped = report.skipped_locked.len(),
            rolled_back = report.rolled_back.len(),
            duration_ms = report.duration_ms,
            "Memory pressure pass finished"
        );
        report
    }

    /// Release inactive resources past their type's retain time
    ///
    /// Locks are tried without waiting; a held resource stays registered
    /// and is retried on the next sweep.
    pub fn release_expired(&self) -> ReleaseReport {
        let _pass = self.pass.lock();
        let started = Instant::now();
        let mut report = ReleaseReport::default();

        let expired = self.registry.expired_ids();
        if expired.is_empty() {
            return report;
        }

        let owner = LockOwner::new_unique();
        let mut freed_bytes = 0u64;
        for id in expired {
            freed_bytes += self.process(&id, &owner, None, Trigger::Expiry, &mut report);
        }

        self.finish_pass(&mut report, started, freed_bytes, Trigger::Expiry);
        if !report.released.is_empty() || !report.skipped_locked.is_empty() {
            info!(
                released = report.released.len(),
                skipped = report.skipped_locked.len(),
                freed_mb = report.freed_mb,
                "Expired resources swept"
            );
        }
        report
    }

    /// Lock, snapshot, dispose and validate one resource; returns bytes freed
    ///
    /// `wait` of `None` tries the lock without blocking.
    fn process(
        &self,
        id: &ResourceId,
        owner: &LockOwner,
        wait: Option<Duration>,
        trigger: Trigger,
        report: &mut ReleaseReport,
    ) -> u64 {
        let acquired = match wait {
            Some(timeout) => self.locks.acquire_write(id, owner, Some(timeout), true),
            None => self.locks.acquire_write(id, owner, None, false),
        };
        if !acquired {
            debug!(resource = %id, trigger = trigger.reason(), "Resource locked, skipping");
            self.push_event(ReleaseEvent::new(id, ReleaseAction::SkippedLocked, 0.0, false));
            report.skipped_locked.push(id.clone());
            return 0;
        }

        let started = Instant::now();
        let snapshot = self.snapshots.qualifies(id) && self.snapshot(id, report);
        let recorded_mb = self
            .registry
            .metadata(id)
            .map(|meta| meta.size_mb)
            .unwrap_or(0.0);
        let outcome = self.dispose(id, trigger, recorded_mb);
        self.locks.release_write(id, owner);

        let (action, freed_mb) = match outcome {
            Ok(Disposal::Compressed {
                saved_mb,
                resident_mb,
            }) => {
                self.registry.set_size_mb(id, resident_mb);
                (ReleaseAction::Compressed, saved_mb)
            }
            Ok(Disposal::Released(freed_mb)) => (trigger.release_action(), freed_mb),
            Err(e) => {
                debug!(resource = %id, error = %e, "Resource vanished during pass");
                return 0;
            }
        };

        let mut event = ReleaseEvent::new(id, action, freed_mb, snapshot);
        event.duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let rejected = self.validate(&mut event);
        if rejected
            && snapshot
            && self.config.rollback_on_failed_validation
            && self.auto_rollback(&mut event, recorded_mb)
        {
            report.rolled_back.push(id.clone());
            self.push_event(event);
            return 0;
        }

        report.freed_mb += freed_mb;
        match action {
            ReleaseAction::Compressed => report.compressed.push(id.clone()),
            _ => report.released.push(id.clone()),
        }
        self.push_event(event);
        (freed_mb * MB) as u64
    }

    fn snapshot(&self, id: &ResourceId, report: &mut ReleaseReport) -> bool {
        match self.snapshots.take_snapshot(id) {
            Ok(()) => {
                report.snapshots_taken += 1;
                true
            }
            Err(e) => {
                // Release goes ahead without rollback capability
                warn!(resource = %id, error = %e, "Snapshot failed before release");
                report.snapshot_failures += 1;
                false
            }
        }
    }

    /// Compress in place when allowed and effective, otherwise release
    fn dispose(&self, id: &ResourceId, trigger: Trigger, recorded_mb: f64) -> Result<Disposal> {
        if trigger == Trigger::Pressure && self.config.compress_before_release {
            if let Some(disposal) = self.try_compress(id, recorded_mb) {
                return Ok(disposal);
            }
        }

        // Registered size wins unless the resource reports more
        let bytes = self.registry.release_for(id, trigger.reason())?;
        Ok(Disposal::Released(recorded_mb.max(bytes as f64 / MB)))
    }

    fn try_compress(&self, id: &ResourceId, recorded_mb: f64) -> Option<Disposal> {
        let compressible = self
            .registry
            .metadata(id)
            .map(|meta| meta.compressible)
            .unwrap_or(false);
        if !compressible {
            return None;
        }
        let resource = self.registry.get(id)?;

        match resource.compress(self.compression_level) {
            Ok(Some(saved)) => {
                let saved_mb = saved as f64 / MB;
                let resident_mb = resource
                    .size_bytes()
                    .map(|bytes| bytes as f64 / MB)
                    .unwrap_or((recorded_mb - saved_mb).max(0.0));
                debug!(resource = %id, saved_bytes = saved, "Compressed in place instead of release");
                Some(Disposal::Compressed {
                    saved_mb,
                    resident_mb,
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!(resource = %id, error = %e, "In-place compression failed, releasing");
                None
            }
        }
    }

    /// Run validators; true when any of them rejected the event
    fn validate(&self, event: &mut ReleaseEvent) -> bool {
        let validators = self.validators.read();
        if validators.is_empty() {
            return false;
        }

        let mut passed = true;
        for (name, validator) in validators.iter() {
            if !validator(event) {
                warn!(resource = %event.resource_id, validator = %name, "Release validation failed");
                passed = false;
            }
        }
        event.validated = Some(passed);
        if !passed {
            self.stats.lock().validation_failures += 1;
        }
        !passed
    }

    fn auto_rollback(&self, event: &mut ReleaseEvent, recorded_mb: f64) -> bool {
        let id = &event.resource_id;
        match self.snapshots.rollback(id) {
            Ok(kind) => {
                if kind == RollbackKind::Restored {
                    self.registry.set_size_mb(id, recorded_mb);
                }
                event.rolled_back = true;
                let mut stats = self.stats.lock();
                stats.auto_rollbacks += 1;
                stats.rollback_count += 1;
                info!(resource = %id, ?kind, "Release rolled back after failed validation");
                true
            }
            Err(e) => {
                warn!(resource = %id, error = %e, "Rollback after failed validation failed");
                false
            }
        }
    }

    fn finish_pass(
        &self,
        report: &mut ReleaseReport,
        started: Instant,
        freed_bytes: u64,
        trigger: Trigger,
    ) {
        report.duration_ms = started.elapsed().as_millis() as u64;
        metrics::FREED_BYTES.inc_by(freed_bytes);
        {
            let mut stats = self.stats.lock();
            stats.total_released_mb += report.freed_mb;
            stats.compressed_count += report.compressed.len() as u64;
            stats.skipped_locked += report.skipped_locked.len() as u64;
            match trigger {
                Trigger::Pressure => {
                    metrics::PRESSURE_PASSES.inc();
                    stats.passes += 1;
                    stats.released_count += report.released.len() as u64;
                }
                Trigger::Expiry => stats.expired_count += report.released.len() as u64,
            }
        }

        if freed_bytes > 0 {
            self.defragmenter.notify_released(freed_bytes);
        }
    }

    /// Restore a released or modified resource from its snapshot
    pub fn rollback(&self, id: &ResourceId) -> Result<RollbackKind> {
        let kind = self.snapshots.rollback(id)?;
        self.stats.lock().rollback_count += 1;
        self.push_event(ReleaseEvent::new(id, ReleaseAction::RolledBack, 0.0, true));
        Ok(kind)
    }

    fn push_event(&self, event: ReleaseEvent) {
        let mut history = self.history.lock();
        history.push_back(event);
        while history.len() > self.config.history_size {
            history.pop_front();
        }
    }

    /// Recent events, oldest first
    pub fn history(&self) -> Vec<ReleaseEvent> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats.lock().clone()
    }
}
