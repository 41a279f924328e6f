//! Memory compaction
//!
//! A compaction pass runs every registered collection hook (caches dropping
//! dead entries, registries collecting dead handles) and then asks the
//! platform to return free heap pages. Passes are mutually exclusive: a
//! trigger that arrives while a pass is running returns immediately.
//!
//! Triggers: explicit calls, a timer, and cumulative released volume
//! reported through [`Defragmenter::notify_released`].

use crate::config::DefragConfig;
use crate::error::Result;
use crate::metrics;
use crate::monitor::MemoryMonitor;
use crate::report::{write_report, DiagnosticReport};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Collection callback run at the start of each pass; returns items collected
pub type CollectionHook = Box<dyn Fn() -> usize + Send + Sync>;

/// Returns free heap pages to the operating system
pub trait WorkingSetTrimmer: Send + Sync {
    fn name(&self) -> &'static str;

    fn trim(&self) -> Result<()>;
}

/// Trimmer for the current platform
///
/// glibc Linux uses `malloc_trim(0)`; other platforms report
/// [`crate::error::Error::PlatformCompaction`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformTrimmer;

impl WorkingSetTrimmer for PlatformTrimmer {
    fn name(&self) -> &'static str {
        "malloc_trim"
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn trim(&self) -> Result<()> {
        // SAFETY: malloc_trim only walks allocator-internal state
        let released = unsafe { libc::malloc_trim(0) };
        debug!(released = released != 0, "malloc_trim finished");
        Ok(())
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    fn trim(&self) -> Result<()> {
        Err(crate::error::Error::PlatformCompaction(
            "working-set trim is not supported on this platform".to_string(),
        ))
    }
}

/// What started a compaction pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionTrigger {
    Manual,
    Timer,
    ReleaseThreshold,
}

impl CompactionTrigger {
    fn label(self) -> &'static str {
        match self {
            CompactionTrigger::Manual => "manual",
            CompactionTrigger::Timer => "timer",
            CompactionTrigger::ReleaseThreshold => "release_threshold",
        }
    }
}

/// Outcome of one compaction pass
#[derive(Debug, Clone, Serialize)]
pub struct CompactionReport {
    pub trigger: CompactionTrigger,
    pub started_at: DateTime<Utc>,
    pub rss_before_bytes: u64,
    pub rss_after_bytes: u64,
    pub freed_bytes: u64,
    pub collected_objects: usize,
    pub duration_ms: u64,
    pub trimmer: &'static str,
    /// Set when the platform trim failed; the pass still counts
    pub trim_error: Option<String>,
}

/// Compaction counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct DefragStats {
    pub compactions: u64,
    pub skipped_concurrent: u64,
    pub trim_failures: u64,
    pub total_freed_bytes: u64,
    pub pending_released_bytes: u64,
    pub is_compacting: bool,
    pub last: Option<CompactionReport>,
}

struct CompactingGuard<'a>(&'a AtomicBool);

impl Drop for CompactingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Serialized compaction service
pub struct Defragmenter {
    config: DefragConfig,
    monitor: Arc<MemoryMonitor>,
    trimmer: Box<dyn WorkingSetTrimmer>,
    hooks: RwLock<Vec<(String, CollectionHook)>>,
    is_compacting: AtomicBool,
    released_since_compaction: AtomicU64,
    last_release_compaction: Mutex<Option<Instant>>,
    history: Mutex<VecDeque<CompactionReport>>,
    report_dir: Option<PathBuf>,
    compactions: AtomicU64,
    skipped_concurrent: AtomicU64,
    trim_failures: AtomicU64,
    total_freed_bytes: AtomicU64,
}

impl Defragmenter {
    pub fn new(config: DefragConfig, monitor: Arc<MemoryMonitor>, report_dir: Option<PathBuf>) -> Self {
        Self {
            config,
            monitor,
            trimmer: Box::new(PlatformTrimmer),
            hooks: RwLock::new(Vec::new()),
            is_compacting: AtomicBool::new(false),
            released_since_compaction: AtomicU64::new(0),
            last_release_compaction: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            report_dir,
            compactions: AtomicU64::new(0),
            skipped_concurrent: AtomicU64::new(0),
            trim_failures: AtomicU64::new(0),
            total_freed_bytes: AtomicU64::new(0),
        }
    }

    /// Replace the platform trimmer
    pub fn with_trimmer(mut self, trimmer: Box<dyn WorkingSetTrimmer>) -> Self {
        self.trimmer = trimmer;
        self
    }

    pub fn config(&self) -> &DefragConfig {
        &self.config
    }

    pub fn add_collection_hook<F>(&self, name: &str, hook: F)
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        self.hooks.write().push((name.to_string(), Box::new(hook)));
        debug!(hook = name, "Collection hook registered");
    }

    pub fn is_compacting(&self) -> bool {
        self.is_compacting.load(Ordering::Acquire)
    }

    /// Run one compaction pass; `None` if another pass is in progress
    pub fn compact_memory(&self) -> Option<CompactionReport> {
        self.compact(CompactionTrigger::Manual)
    }

    /// Timer entry point
    pub fn compact_on_timer(&self) -> Option<CompactionReport> {
        self.compact(CompactionTrigger::Timer)
    }

    fn compact(&self, trigger: CompactionTrigger) -> Option<CompactionReport> {
        if self
            .is_compacting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.skipped_concurrent.fetch_add(1, Ordering::Relaxed);
            debug!(trigger = trigger.label(), "Compaction already running, skipped");
            return None;
        }
        let _guard = CompactingGuard(&self.is_compacting);

        let started_at = Utc::now();
        let start = Instant::now();
        let rss_before = self.monitor.process_rss_bytes();

        let collected_objects: usize = self
            .hooks
            .read()
            .iter()
            .map(|(name, hook)| {
                let collected = hook();
                debug!(hook = %name, collected, "Collection hook ran");
                collected
            })
            .sum();

        let trim_error = match self.trimmer.trim() {
            Ok(()) => None,
            Err(e) => {
                self.trim_failures.fetch_add(1, Ordering::Relaxed);
                warn!(trimmer = self.trimmer.name(), error = %e, "Working-set trim failed");
                Some(e.to_string())
            }
        };

        let rss_after = self.monitor.process_rss_bytes();
        let report = CompactionReport {
            trigger,
            started_at,
            rss_before_bytes: rss_before,
            rss_after_bytes: rss_after,
            freed_bytes: rss_before.saturating_sub(rss_after),
            collected_objects,
            duration_ms: start.elapsed().as_millis() as u64,
            trimmer: self.trimmer.name(),
            trim_error,
        };

        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.total_freed_bytes
            .fetch_add(report.freed_bytes, Ordering::Relaxed);
        metrics::COMPACTIONS
            .with_label_values(&[trigger.label()])
            .inc();
        {
            let mut history = self.history.lock();
            history.push_back(report.clone());
            while history.len() > self.config.history_size.max(1) {
                history.pop_front();
            }
        }

        info!(
            trigger = trigger.label(),
            freed_mb = report.freed_bytes as f64 / (1024.0 * 1024.0),
            collected_objects,
            duration_ms = report.duration_ms,
            "Memory compaction finished"
        );

        if let Some(dir) = &self.report_dir {
            let doc = DiagnosticReport::new("compaction", self.monitor.get_memory_status())
                .with_compaction(report.clone());
            if let Err(e) = write_report(dir, &doc) {
                warn!(error = %e, "Failed to write compaction report");
            }
        }

        Some(report)
    }

    /// Account released volume; compacts once it passes the threshold
    ///
    /// Release-triggered passes are rate-limited to one per
    /// `min_release_compaction_interval`.
    pub fn notify_released(&self, bytes: u64) -> Option<CompactionReport> {
        let pending = self
            .released_since_compaction
            .fetch_add(bytes, Ordering::AcqRel)
            + bytes;
        if pending < self.config.release_threshold_bytes() {
            return None;
        }

        {
            let mut last = self.last_release_compaction.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.config.min_release_compaction_interval() {
                    debug!(pending, "Release threshold reached, compaction rate-limited");
                    return None;
                }
            }
            *last = Some(Instant::now());
        }

        self.released_since_compaction.store(0, Ordering::Release);
        info!(pending, "Released volume passed threshold, compacting");
        self.compact(CompactionTrigger::ReleaseThreshold)
    }

    /// Most recent passes, oldest first
    pub fn history(&self) -> Vec<CompactionReport> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> DefragStats {
        DefragStats {
            compactions: self.compactions.load(Ordering::Relaxed),
            skipped_concurrent: self.skipped_concurrent.load(Ordering::Relaxed),
            trim_failures: self.trim_failures.load(Ordering::Relaxed),
            total_freed_bytes: self.total_freed_bytes.load(Ordering::Relaxed),
            pending_released_bytes: self.released_since_compaction.load(Ordering::Relaxed),
            is_compacting: self.is_compacting(),
            last: self.history.lock().back().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;

    struct FailingTrimmer;

    impl WorkingSetTrimmer for FailingTrimmer {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn trim(&self) -> Result<()> {
            Err(Error::PlatformCompaction("denied".into()))
        }
    }

    fn defragmenter(config: DefragConfig) -> Defragmenter {
        let monitor = Arc::new(MemoryMonitor::new(MonitorConfig::default()));
        Defragmenter::new(config, monitor, None)
    }

    #[test]
    fn test_pass_runs_hooks() {
        let defrag = defragmenter(DefragConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        defrag.add_collection_hook("cache", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            3
        });

        let report = defrag.compact_memory().unwrap();
        assert_eq!(report.trigger, CompactionTrigger::Manual);
        assert_eq!(report.collected_objects, 3);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!defrag.is_compacting());
        assert_eq!(defrag.stats().compactions, 1);
    }

    #[test]
    fn test_trim_failure_still_counts() {
        let defrag = defragmenter(DefragConfig::default()).with_trimmer(Box::new(FailingTrimmer));
        let report = defrag.compact_memory().unwrap();
        assert!(report.trim_error.unwrap().contains("denied"));

        let stats = defrag.stats();
        assert_eq!(stats.compactions, 1);
        assert_eq!(stats.trim_failures, 1);
    }

    #[test]
    fn test_release_threshold_and_rate_limit() {
        let defrag = defragmenter(DefragConfig {
            release_threshold_mb: 1,
            min_release_compaction_interval_secs: 3600,
            ..Default::default()
        });

        assert!(defrag.notify_released(512 * 1024).is_none());
        assert_eq!(defrag.stats().pending_released_bytes, 512 * 1024);

        let report = defrag.notify_released(512 * 1024).unwrap();
        assert_eq!(report.trigger, CompactionTrigger::ReleaseThreshold);
        assert_eq!(defrag.stats().pending_released_bytes, 0);

        // Second crossing inside the interval is suppressed
        assert!(defrag.notify_released(2 * 1024 * 1024).is_none());
        assert_eq!(defrag.stats().compactions, 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let defrag = defragmenter(DefragConfig {
            history_size: 2,
            ..Default::default()
        });
        for _ in 0..3 {
            defrag.compact_on_timer();
        }
        let history = defrag.history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.trigger == CompactionTrigger::Timer));
    }
}
