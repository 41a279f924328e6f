//! Point-in-time memory state and growth comparison
//!
//! A `MemoryStateSnapshot` records process memory alongside per-type
//! registry totals. Comparing two of them gives the RSS change, its rate
//! and a coarse severity, plus how each resource type moved.

use crate::error::{Error, Result};
use crate::monitor::{MemoryMonitor, MemoryStatus};
use crate::resource::{ResourceRegistry, TypeStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Process memory plus registry totals at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStateSnapshot {
    pub label: String,
    /// Unix time in seconds
    pub timestamp: f64,
    pub datetime: String,
    pub memory: MemoryStatus,
    pub resources: BTreeMap<String, TypeStats>,
}

impl MemoryStateSnapshot {
    /// Sample the monitor and registry now
    pub fn capture(label: &str, monitor: &MemoryMonitor, registry: &ResourceRegistry) -> Self {
        let snapshot = Self::at(
            Utc::now(),
            label,
            monitor.get_memory_status(),
            registry.stats().by_type,
        );
        debug!(
            label,
            rss_mb = snapshot.memory.process_rss_mb,
            types = snapshot.resources.len(),
            "Memory state captured"
        );
        snapshot
    }

    pub fn at(
        now: DateTime<Utc>,
        label: &str,
        memory: MemoryStatus,
        resources: BTreeMap<String, TypeStats>,
    ) -> Self {
        Self {
            label: label.to_string(),
            timestamp: now.timestamp_millis() as f64 / 1000.0,
            datetime: now.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            memory,
            resources,
        }
    }

    /// Write as `state_<label>_<time>.json` under `dir`
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let stamp = (self.timestamp * 1000.0) as i64;
        let path = dir.join(format!("state_{}_{}.json", self.label, stamp));

        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to encode memory state: {}", e)))?;
        std::fs::write(&path, body)?;
        info!(path = %path.display(), label = %self.label, "Memory state saved");
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let body = std::fs::read(path)?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::Serialization(format!("Failed to decode memory state: {}", e)))
    }
}

/// How fast RSS moved between two snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthSeverity {
    /// Above 5 MB/min
    High,
    /// Above 1 MB/min
    Medium,
    /// Above 0.1 MB/min
    Low,
    Stable,
    /// Shrinking faster than 1 MB/min
    Decreasing,
}

impl GrowthSeverity {
    pub fn from_rate(rate_mb_per_min: f64) -> Self {
        if rate_mb_per_min > 5.0 {
            GrowthSeverity::High
        } else if rate_mb_per_min > 1.0 {
            GrowthSeverity::Medium
        } else if rate_mb_per_min > 0.1 {
            GrowthSeverity::Low
        } else if rate_mb_per_min < -1.0 {
            GrowthSeverity::Decreasing
        } else {
            GrowthSeverity::Stable
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RssChange {
    pub before_mb: f64,
    pub after_mb: f64,
    pub diff_mb: f64,
    /// Relative change; 0 when the earlier value is 0
    pub percent: f64,
    pub rate_mb_per_min: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeChange {
    pub count_diff: i64,
    pub size_diff_mb: f64,
}

/// Difference between two snapshots, later minus earlier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotComparison {
    pub before: String,
    pub after: String,
    pub duration_secs: f64,
    pub rss: RssChange,
    pub severity: GrowthSeverity,
    /// Only types whose count or size changed
    pub type_changes: BTreeMap<String, TypeChange>,
}

pub fn compare_snapshots(
    before: &MemoryStateSnapshot,
    after: &MemoryStateSnapshot,
) -> SnapshotComparison {
    let duration_secs = after.timestamp - before.timestamp;
    let before_mb = before.memory.process_rss_mb;
    let after_mb = after.memory.process_rss_mb;
    let diff_mb = after_mb - before_mb;

    let percent = if before_mb > 0.0 {
        diff_mb / before_mb * 100.0
    } else {
        0.0
    };
    let rate_mb_per_min = if duration_secs > 0.0 {
        diff_mb / duration_secs * 60.0
    } else {
        0.0
    };

    let types: BTreeSet<&String> = before.resources.keys().chain(after.resources.keys()).collect();
    let empty = TypeStats::default();
    let type_changes = types
        .into_iter()
        .filter_map(|name| {
            let a = before.resources.get(name).unwrap_or(&empty);
            let b = after.resources.get(name).unwrap_or(&empty);
            let change = TypeChange {
                count_diff: b.count as i64 - a.count as i64,
                size_diff_mb: b.size_mb - a.size_mb,
            };
            (change != TypeChange::default()).then(|| (name.clone(), change))
        })
        .collect();

    SnapshotComparison {
        before: before.label.clone(),
        after: after.label.clone(),
        duration_secs,
        rss: RssChange {
            before_mb,
            after_mb,
            diff_mb,
            percent,
            rate_mb_per_min,
        },
        severity: GrowthSeverity::from_rate(rate_mb_per_min),
        type_changes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn state(label: &str, at: DateTime<Utc>, rss_mb: f64, frames: usize) -> MemoryStateSnapshot {
        let mut resources = BTreeMap::new();
        if frames > 0 {
            resources.insert(
                "render_cache".to_string(),
                TypeStats {
                    count: frames,
                    size_mb: frames as f64 * 2.0,
                },
            );
        }
        resources.insert(
            "model_weights".to_string(),
            TypeStats {
                count: 1,
                size_mb: 400.0,
            },
        );
        let memory = MemoryStatus {
            process_rss_mb: rss_mb,
            ..Default::default()
        };
        MemoryStateSnapshot::at(at, label, memory, resources)
    }

    #[test]
    fn test_growth_rate_and_severity() {
        let start = Utc::now();
        let before = state("start", start, 500.0, 0);
        let after = state("later", start + Duration::seconds(120), 520.0, 3);

        let cmp = compare_snapshots(&before, &after);
        assert!((cmp.duration_secs - 120.0).abs() < 1e-3);
        assert!((cmp.rss.diff_mb - 20.0).abs() < 1e-9);
        assert!((cmp.rss.percent - 4.0).abs() < 1e-9);
        assert!((cmp.rss.rate_mb_per_min - 10.0).abs() < 1e-3);
        assert_eq!(cmp.severity, GrowthSeverity::High);

        assert_eq!(cmp.type_changes.len(), 1);
        let frames = &cmp.type_changes["render_cache"];
        assert_eq!(frames.count_diff, 3);
        assert!((frames.size_diff_mb - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_severity_bands() {
        assert_eq!(GrowthSeverity::from_rate(2.0), GrowthSeverity::Medium);
        assert_eq!(GrowthSeverity::from_rate(0.5), GrowthSeverity::Low);
        assert_eq!(GrowthSeverity::from_rate(0.05), GrowthSeverity::Stable);
        assert_eq!(GrowthSeverity::from_rate(-0.5), GrowthSeverity::Stable);
        assert_eq!(GrowthSeverity::from_rate(-3.0), GrowthSeverity::Decreasing);
    }

    #[test]
    fn test_zero_baseline_and_zero_duration() {
        let now = Utc::now();
        let cmp = compare_snapshots(&state("a", now, 0.0, 1), &state("b", now, 50.0, 0));
        assert_eq!(cmp.rss.percent, 0.0);
        assert_eq!(cmp.rss.rate_mb_per_min, 0.0);
        assert_eq!(cmp.severity, GrowthSeverity::Stable);
        assert_eq!(cmp.type_changes["render_cache"].count_diff, -1);
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("memwarden_state_test_{}", std::process::id()));
        let snapshot = state("baseline", Utc::now(), 123.5, 2);

        let path = snapshot.save(&dir)?;
        let loaded = MemoryStateSnapshot::load(&path)?;
        assert_eq!(loaded.label, "baseline");
        assert_eq!(loaded.resources, snapshot.resources);
        assert_eq!(loaded.memory.process_rss_mb, 123.5);
        assert!((loaded.timestamp - snapshot.timestamp).abs() < 1e-3);

        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn test_capture_reads_live_process() {
        let monitor = MemoryMonitor::new(Default::default());
        let registry = ResourceRegistry::with_defaults();
        let snapshot = MemoryStateSnapshot::capture("live", &monitor, &registry);
        assert!(snapshot.memory.process_rss_mb > 0.0);
        assert!(snapshot.resources.is_empty());
    }
}
