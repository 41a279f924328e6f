//! Allocation growth tracking
//!
//! Every check samples allocation volume per site and diffs it against the
//! previous sample. A site growing faster than `leak_threshold_percent` is a
//! candidate; it is confirmed only after `consecutive_leaks_threshold`
//! consecutive growing checks, so one-off spikes never report.

use crate::alloc::CompressedAllocator;
use crate::config::LeakConfig;
use crate::defrag::CollectionHook;
use crate::error::Result;
use crate::metrics;
use crate::monitor::MemoryMonitor;
use crate::report::{write_report, DiagnosticReport};
use crate::resource::{ResourceRegistry, MB};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

const RSS_HISTORY: usize = 64;
const PROCESS_SITE: &str = "process:rss";

/// Source of per-site allocation volumes in bytes
pub trait AllocationSampler: Send + Sync {
    fn name(&self) -> &str;

    fn sample(&self) -> Result<HashMap<String, u64>>;
}

/// Process resident set size
pub struct ProcessSampler {
    monitor: Arc<MemoryMonitor>,
}

impl ProcessSampler {
    pub fn new(monitor: Arc<MemoryMonitor>) -> Self {
        Self { monitor }
    }
}

impl AllocationSampler for ProcessSampler {
    fn name(&self) -> &str {
        "process"
    }

    fn sample(&self) -> Result<HashMap<String, u64>> {
        Ok(HashMap::from([(
            PROCESS_SITE.to_string(),
            self.monitor.process_rss_bytes(),
        )]))
    }
}

/// Registered volume per resource type
pub struct RegistrySampler {
    registry: Arc<ResourceRegistry>,
}

impl RegistrySampler {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self { registry }
    }
}

impl AllocationSampler for RegistrySampler {
    fn name(&self) -> &str {
        "registry"
    }

    fn sample(&self) -> Result<HashMap<String, u64>> {
        Ok(self
            .registry
            .stats()
            .by_type
            .into_iter()
            .map(|(resource_type, stats)| {
                (format!("registry:{}", resource_type), (stats.size_mb * MB) as u64)
            })
            .collect())
    }
}

/// Resident bytes held by allocator blocks
pub struct AllocatorSampler {
    allocator: Arc<CompressedAllocator>,
}

impl AllocatorSampler {
    pub fn new(allocator: Arc<CompressedAllocator>) -> Self {
        Self { allocator }
    }
}

impl AllocationSampler for AllocatorSampler {
    fn name(&self) -> &str {
        "allocator"
    }

    fn sample(&self) -> Result<HashMap<String, u64>> {
        let stats = self.allocator.get_compression_stats();
        Ok(HashMap::from([(
            "allocator:blocks".to_string(),
            stats.total_original_bytes - stats.memory_saved,
        )]))
    }
}

/// Growth observed at one site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakRecord {
    pub site: String,
    /// Bytes gained since the previous sample
    pub size_diff: i64,
    /// Growth since the previous sample, in percent
    pub growth_rate: f64,
    pub consecutive_count: u32,
}

/// Linear trend of process RSS over recent checks
#[derive(Debug, Clone, Serialize)]
pub struct LeakTrend {
    pub samples: usize,
    pub initial_mb: f64,
    pub final_mb: f64,
    pub slope_mb_per_sample: f64,
    /// Fitted growth over the window relative to the first sample, in percent
    pub growth_percent: f64,
    pub r_squared: f64,
    pub leak_suspected: bool,
}

#[derive(Default)]
struct DetectorState {
    previous: HashMap<String, u64>,
    consecutive: HashMap<String, u32>,
    candidates: Vec<LeakRecord>,
    rss_history: VecDeque<f64>,
    checks: u64,
    confirmed_total: u64,
}

/// Periodic allocation diffing
pub struct LeakDetector {
    config: LeakConfig,
    monitor: Arc<MemoryMonitor>,
    samplers: RwLock<Vec<Box<dyn AllocationSampler>>>,
    collect_hook: RwLock<Option<CollectionHook>>,
    state: Mutex<DetectorState>,
    report_dir: Option<PathBuf>,
}

impl LeakDetector {
    pub fn new(config: LeakConfig, monitor: Arc<MemoryMonitor>, report_dir: Option<PathBuf>) -> Self {
        Self {
            config,
            monitor,
            samplers: RwLock::new(Vec::new()),
            collect_hook: RwLock::new(None),
            state: Mutex::new(DetectorState::default()),
            report_dir,
        }
    }

    pub fn config(&self) -> &LeakConfig {
        &self.config
    }

    pub fn add_sampler(&self, sampler: Box<dyn AllocationSampler>) {
        debug!(sampler = sampler.name(), "Allocation sampler added");
        self.samplers.write().push(sampler);
    }

    /// Collection run on confirmation when `auto_collect` is set
    pub fn set_collect_hook<F>(&self, hook: F)
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        *self.collect_hook.write() = Some(Box::new(hook));
    }

    /// Sample, diff and return the leaks confirmed by this check
    ///
    /// A confirmed site starts counting from zero again.
    pub fn check(&self) -> Result<Vec<LeakRecord>> {
        let mut current: HashMap<String, u64> = HashMap::new();
        for sampler in self.samplers.read().iter() {
            match sampler.sample() {
                Ok(sites) => current.extend(sites),
                Err(e) => warn!(sampler = sampler.name(), error = %e, "Allocation sampling failed"),
            }
        }

        let threshold = self.config.consecutive_leaks_threshold.max(1);
        let mut confirmed = Vec::new();
        {
            let mut state = self.state.lock();
            let mut candidates = Vec::new();

            for (site, &size) in &current {
                let previous = state.previous.get(site).copied().unwrap_or(0);
                // First sighting or an empty site gives no rate
                if previous == 0 {
                    state.consecutive.remove(site);
                    continue;
                }

                let size_diff = size as i64 - previous as i64;
                let growth_rate = size_diff as f64 / previous as f64 * 100.0;
                if growth_rate <= self.config.leak_threshold_percent {
                    state.consecutive.remove(site);
                    continue;
                }

                let count = state.consecutive.entry(site.clone()).or_insert(0);
                *count += 1;
                let record = LeakRecord {
                    site: site.clone(),
                    size_diff,
                    growth_rate,
                    consecutive_count: *count,
                };
                if *count >= threshold {
                    *count = 0;
                    confirmed.push(record.clone());
                }
                debug!(site = %site, growth_rate, consecutive = record.consecutive_count, "Allocation growth");
                candidates.push(record);
            }

            state.consecutive.retain(|site, _| current.contains_key(site));
            if let Some(&rss) = current.get(PROCESS_SITE) {
                state.rss_history.push_back(rss as f64 / MB);
                while state.rss_history.len() > RSS_HISTORY {
                    state.rss_history.pop_front();
                }
            }
            state.previous = current;
            state.candidates = candidates;
            state.checks += 1;
            state.confirmed_total += confirmed.len() as u64;
        }

        if !confirmed.is_empty() {
            self.on_confirmed(&confirmed);
        }
        Ok(confirmed)
    }

    fn on_confirmed(&self, leaks: &[LeakRecord]) {
        metrics::LEAKS_CONFIRMED.inc_by(leaks.len() as u64);
        for leak in leaks {
            warn!(
                site = %leak.site,
                size_diff = leak.size_diff,
                growth_rate = leak.growth_rate,
                consecutive_count = leak.consecutive_count,
                "Memory leak confirmed"
            );
        }

        if self.config.auto_collect {
            if let Some(hook) = self.collect_hook.read().as_ref() {
                let collected = hook();
                info!(collected, "Collection triggered by leak confirmation");
            }
        }

        if let Some(dir) = &self.report_dir {
            let report = DiagnosticReport::new("leak", self.monitor.get_memory_status())
                .with_leaks(leaks.to_vec());
            if let Err(e) = write_report(dir, &report) {
                warn!(error = %e, "Failed to write leak report");
            }
        }
    }

    /// Growing sites from the latest check
    pub fn candidates(&self) -> Vec<LeakRecord> {
        self.state.lock().candidates.clone()
    }

    pub fn checks(&self) -> u64 {
        self.state.lock().checks
    }

    pub fn confirmed_total(&self) -> u64 {
        self.state.lock().confirmed_total
    }

    /// Least-squares trend of process RSS; needs at least three samples
    pub fn analyze_trend(&self) -> Option<LeakTrend> {
        let history: Vec<f64> = self.state.lock().rss_history.iter().copied().collect();
        fit_trend(&history, self.config.leak_threshold_percent)
    }

    /// Forget all samples
    pub fn reset(&self) {
        *self.state.lock() = DetectorState::default();
    }
}

fn fit_trend(values: &[f64], threshold_percent: f64) -> Option<LeakTrend> {
    let n = values.len();
    if n < 3 || values[0] <= 0.0 {
        return None;
    }

    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / nf;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (i, &y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        let dy = y - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }

    let slope = sxy / sxx;
    let r_squared = if syy > 0.0 { (sxy * sxy) / (sxx * syy) } else { 0.0 };
    let growth_percent = slope * nf / values[0] * 100.0;

    Some(LeakTrend {
        samples: n,
        initial_mb: values[0],
        final_mb: values[n - 1],
        slope_mb_per_sample: slope,
        growth_percent,
        r_squared,
        leak_suspected: growth_percent > threshold_percent,
    })
}
