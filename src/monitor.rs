//! Process and system memory observation
//!
//! `MemoryMonitor` reads memory figures through sysinfo. `PressureWatcher`
//! compares process RSS against the configured budget, notifies overflow
//! callbacks and hands the excess to the release orchestrator.

use crate::config::MonitorConfig;
use crate::orchestrator::{ReleaseOrchestrator, ReleaseReport};
use crate::resource::MB;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, error, info, warn};

/// Memory snapshot of the system and this process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStatus {
    pub used_mb: f64,
    pub available_mb: f64,
    /// System memory in use, 0-100
    pub percent: f64,
    pub total_mb: f64,
    pub process_rss_mb: f64,
    pub process_virtual_mb: f64,
    pub pid: u32,
}

/// Coarse pressure level of the process against its budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemoryPressure {
    Low,
    Medium,
    High,
    Critical,
}

/// sysinfo-backed memory reader
pub struct MemoryMonitor {
    system: Mutex<System>,
    pid: Option<Pid>,
    config: MonitorConfig,
}

impl MemoryMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = e, "Cannot determine current pid, process RSS unavailable");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Refresh system memory and this process only
    pub fn get_memory_status(&self) -> MemoryStatus {
        let mut sys = self.system.lock();
        sys.refresh_memory();
        self.refresh_own_process(&mut sys);

        let total = sys.total_memory() as f64;
        let used = sys.used_memory() as f64;
        let available = sys.available_memory() as f64;
        let (rss, virt) = self
            .pid
            .and_then(|pid| sys.process(pid))
            .map(|process| (process.memory() as f64, process.virtual_memory() as f64))
            .unwrap_or((0.0, 0.0));

        MemoryStatus {
            used_mb: used / MB,
            available_mb: available / MB,
            percent: if total > 0.0 { used / total * 100.0 } else { 0.0 },
            total_mb: total / MB,
            process_rss_mb: rss / MB,
            process_virtual_mb: virt / MB,
            pid: self.pid.map(|pid| pid.as_u32()).unwrap_or(0),
        }
    }

    /// Current process RSS in bytes
    pub fn process_rss_bytes(&self) -> u64 {
        let mut sys = self.system.lock();
        self.refresh_own_process(&mut sys);
        self.pid
            .and_then(|pid| sys.process(pid))
            .map(|process| process.memory())
            .unwrap_or(0)
    }

    fn refresh_own_process(&self, sys: &mut System) {
        if let Some(pid) = self.pid {
            sys.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::new().with_memory(),
            );
        }
    }

    /// Level of `status` against the budget
    pub fn pressure_level(&self, status: &MemoryStatus) -> MemoryPressure {
        let budget = self.config.budget_mb as f64;
        if budget <= 0.0 {
            return MemoryPressure::Low;
        }
        let ratio = status.process_rss_mb / budget;
        if ratio >= self.config.critical_ratio {
            MemoryPressure::Critical
        } else if ratio >= self.config.high_ratio {
            MemoryPressure::High
        } else if ratio >= self.config.medium_ratio {
            MemoryPressure::Medium
        } else {
            MemoryPressure::Low
        }
    }

    /// MB to free to get back to `target_ratio` of `budget_mb`
    pub fn required_free_mb(&self, status: &MemoryStatus, budget_mb: u64) -> f64 {
        let target = budget_mb as f64 * self.config.target_ratio;
        (status.process_rss_mb - target).max(0.0)
    }
}

/// Budget overrun handed to overflow callbacks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverflowInfo {
    pub current_usage_mb: f64,
    pub limit_mb: f64,
    pub overflow_mb: f64,
    /// Highest RSS the watcher has seen
    pub peak_usage_mb: f64,
    /// Unix time in seconds
    pub timestamp: f64,
    pub pid: u32,
}

pub type OverflowCallback = Box<dyn Fn(&OverflowInfo) + Send + Sync>;

/// Periodic budget check that drives pressure passes
pub struct PressureWatcher {
    monitor: Arc<MemoryMonitor>,
    orchestrator: Arc<ReleaseOrchestrator>,
    callbacks: RwLock<Vec<(String, OverflowCallback)>>,
    peak_usage_mb: Mutex<f64>,
}

impl PressureWatcher {
    pub fn new(monitor: Arc<MemoryMonitor>, orchestrator: Arc<ReleaseOrchestrator>) -> Self {
        Self {
            monitor,
            orchestrator,
            callbacks: RwLock::new(Vec::new()),
            peak_usage_mb: Mutex::new(0.0),
        }
    }

    /// Call `callback` every time RSS is found above the budget
    ///
    /// Callbacks run on the watcher thread before the release pass. A
    /// panicking callback is logged and does not stop the others.
    pub fn register_overflow_callback<F>(&self, name: &str, callback: F)
    where
        F: Fn(&OverflowInfo) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .push((name.to_string(), Box::new(callback)));
        info!(callback = name, "Overflow callback registered");
    }

    pub fn overflow_callback_count(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Highest RSS seen so far, in MB
    pub fn peak_usage_mb(&self) -> f64 {
        *self.peak_usage_mb.lock()
    }

    fn notify_overflow(&self, status: &MemoryStatus, peak_usage_mb: f64) {
        let limit_mb = self.monitor.config().budget_mb as f64;
        if limit_mb <= 0.0 || status.process_rss_mb <= limit_mb {
            return;
        }

        let info = OverflowInfo {
            current_usage_mb: status.process_rss_mb,
            limit_mb,
            overflow_mb: status.process_rss_mb - limit_mb,
            peak_usage_mb,
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
            pid: status.pid,
        };
        warn!(
            current_mb = info.current_usage_mb,
            limit_mb,
            overflow_mb = info.overflow_mb,
            "Memory budget exceeded"
        );

        for (name, callback) in self.callbacks.read().iter() {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&info))).is_err() {
                error!(callback = %name, "Overflow callback panicked");
            }
        }
    }

    /// Sample memory and run a pass when over budget
    pub fn check_once(&self) -> Option<ReleaseReport> {
        let status = self.monitor.get_memory_status();
        self.evaluate(&status)
    }

    /// Run a pass for `status` when it is above the High level
    pub fn evaluate(&self, status: &MemoryStatus) -> Option<ReleaseReport> {
        let peak = {
            let mut peak = self.peak_usage_mb.lock();
            *peak = peak.max(status.process_rss_mb);
            *peak
        };
        self.notify_overflow(status, peak);

        let level = self.monitor.pressure_level(status);
        if level < MemoryPressure::High {
            debug!(rss_mb = status.process_rss_mb, ?level, "Memory within budget");
            return None;
        }

        let required_mb = self
            .monitor
            .required_free_mb(status, self.monitor.config().budget_mb);
        if required_mb <= 0.0 {
            return None;
        }
        warn!(
            rss_mb = status.process_rss_mb,
            budget_mb = self.monitor.config().budget_mb,
            required_mb,
            ?level,
            "Memory pressure detected"
        );
        Some(self.orchestrator.handle_memory_pressure(required_mb))
    }
}
