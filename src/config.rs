//! Engine configuration
//!
//! Every component reads its own section. Values come from (lowest to
//! highest precedence) the built-in defaults, an optional TOML file and
//! `MEMWARDEN__<SECTION>__<KEY>` environment variables.
//!
//! ```toml
//! report_dir = "logs/memory"
//!
//! [snapshots]
//! max_snapshots = 20
//! snapshot_ttl_secs = 600
//!
//! [registry.resource_types.model_shards]
//! priority = 4
//! max_retain_secs = 1800
//! ```

use crate::error::{Error, Result};
use crate::resource::TypePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for a [`crate::MemoryContext`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Resource type table and release scoring weights
    pub registry: TypePolicy,
    pub locks: LockConfig,
    pub snapshots: SnapshotConfig,
    pub allocator: AllocatorConfig,
    pub defrag: DefragConfig,
    pub leak: LeakConfig,
    pub orchestrator: OrchestratorConfig,
    pub monitor: MonitorConfig,
    /// Directory for JSON diagnostic reports (disabled when unset)
    pub report_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Load configuration from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MEMWARDEN")
                .prefix_separator("__")
                .separator("__"),
        );

        let cfg: EngineConfig = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to read configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml_str(doc: &str) -> Result<Self> {
        let cfg: EngineConfig =
            toml::from_str(doc).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would make a component misbehave
    pub fn validate(&self) -> Result<()> {
        if self.snapshots.max_snapshots == 0 {
            return Err(Error::Config("snapshots.max_snapshots must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.allocator.compression_ratio_threshold) {
            return Err(Error::Config(
                "allocator.compression_ratio_threshold must be within 0.0..=1.0".into(),
            ));
        }
        if self.leak.consecutive_leaks_threshold == 0 {
            return Err(Error::Config(
                "leak.consecutive_leaks_threshold must be > 0".into(),
            ));
        }
        if self.monitor.budget_mb == 0 {
            return Err(Error::Config("monitor.budget_mb must be > 0".into()));
        }
        Ok(())
    }
}

/// Lock manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Wait used by callers that do not pass their own timeout
    pub default_timeout_ms: u64,
    /// Locks held longer than this are force-released by the sweep
    pub lock_timeout_secs: u64,
    pub sweep_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            lock_timeout_secs: 60,
            sweep_interval_ms: 1_000,
        }
    }
}

impl LockConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Snapshot store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub max_snapshots: usize,
    pub snapshot_ttl_secs: u64,
    /// Only types with priority <= this value are snapshotted
    pub snapshot_priority_threshold: u32,
    pub cleanup_interval_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 20,
            snapshot_ttl_secs: 600,
            snapshot_priority_threshold: 3,
            cleanup_interval_secs: 120,
        }
    }
}

impl SnapshotConfig {
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Compressed allocator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// zstd level
    pub compression_level: i32,
    /// Blocks smaller than this (bytes) are never compressed
    pub compression_threshold: usize,
    /// Idle time before a block becomes a compression candidate
    pub auto_compress_after_ms: u64,
    /// Compressed form is kept only when compressed/original <= this
    pub compression_ratio_threshold: f64,
    pub scan_interval_ms: u64,
    /// Longest `access` waits for a block another view holds
    pub access_timeout_ms: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            compression_level: 3,
            compression_threshold: 1024 * 1024,
            auto_compress_after_ms: 5_000,
            compression_ratio_threshold: 0.7,
            scan_interval_ms: 500,
            access_timeout_ms: 5_000,
        }
    }
}

impl AllocatorConfig {
    pub fn auto_compress_after(&self) -> Duration {
        Duration::from_millis(self.auto_compress_after_ms)
    }

    pub fn access_timeout(&self) -> Duration {
        Duration::from_millis(self.access_timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

/// Defragmenter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefragConfig {
    /// Timer-driven compaction (0 disables the timer)
    pub auto_compact_interval_secs: u64,
    /// Cumulative released volume that triggers a compaction
    pub release_threshold_mb: u64,
    /// Rate limit for release-triggered compactions
    pub min_release_compaction_interval_secs: u64,
    /// Number of compaction reports kept in memory
    pub history_size: usize,
}

impl Default for DefragConfig {
    fn default() -> Self {
        Self {
            auto_compact_interval_secs: 300,
            release_threshold_mb: 500,
            min_release_compaction_interval_secs: 60,
            history_size: 32,
        }
    }
}

impl DefragConfig {
    pub fn auto_compact_interval(&self) -> Option<Duration> {
        (self.auto_compact_interval_secs > 0)
            .then(|| Duration::from_secs(self.auto_compact_interval_secs))
    }

    pub fn release_threshold_bytes(&self) -> u64 {
        self.release_threshold_mb.saturating_mul(1024 * 1024)
    }

    pub fn min_release_compaction_interval(&self) -> Duration {
        Duration::from_secs(self.min_release_compaction_interval_secs)
    }
}

/// Leak detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeakConfig {
    pub enabled: bool,
    pub check_interval_secs: u64,
    /// Growth between two samples (percent) that marks a site as a candidate
    pub leak_threshold_percent: f64,
    /// Consecutive detections required to confirm a leak
    pub consecutive_leaks_threshold: u32,
    /// Run collection hooks when a leak is confirmed
    pub auto_collect: bool,
}

impl Default for LeakConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 60,
            leak_threshold_percent: 5.0,
            consecutive_leaks_threshold: 3,
            auto_collect: true,
        }
    }
}

impl LeakConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Release orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Per-candidate write lock wait; candidates that time out are skipped
    pub lock_acquire_timeout_ms: u64,
    /// Try in-place compression before releasing compressible resources
    pub compress_before_release: bool,
    /// Number of release events kept in memory
    pub history_size: usize,
    /// Release idle resources past their type's retain time in the background
    pub expire_idle: bool,
    /// Roll back from the snapshot when a release validator rejects a release
    pub rollback_on_failed_validation: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_acquire_timeout_ms: 500,
            compress_before_release: true,
            history_size: 200,
            expire_idle: true,
            rollback_on_failed_validation: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_ms)
    }
}

/// Memory monitor and pressure watcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Resident memory budget for the process
    pub budget_mb: u64,
    /// Fraction of the budget a pressure pass frees down to
    pub target_ratio: f64,
    pub watch_enabled: bool,
    pub watch_interval_ms: u64,
    pub medium_ratio: f64,
    pub high_ratio: f64,
    pub critical_ratio: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            budget_mb: 3_800,
            target_ratio: 0.9,
            watch_enabled: false,
            watch_interval_ms: 2_000,
            medium_ratio: 0.70,
            high_ratio: 0.85,
            critical_ratio: 0.95,
        }
    }
}

impl MonitorConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.snapshots.max_snapshots, 20);
        assert_eq!(cfg.allocator.compression_threshold, 1024 * 1024);
        assert_eq!(cfg.monitor.budget_mb, 3_800);
        assert!(cfg.report_dir.is_none());
    }

    #[test]
    fn test_from_toml_partial_sections() -> Result<()> {
        let cfg = EngineConfig::from_toml_str(
            r#"
            report_dir = "/tmp/memwarden-reports"

            [snapshots]
            max_snapshots = 5

            [allocator]
            compression_ratio_threshold = 0.5

            [registry.resource_types.model_shards]
            priority = 4
            max_retain_secs = 1800
            "#,
        )?;

        assert_eq!(cfg.snapshots.max_snapshots, 5);
        // Untouched keys keep their defaults
        assert_eq!(cfg.snapshots.snapshot_ttl_secs, 600);
        assert_eq!(cfg.allocator.compression_ratio_threshold, 0.5);
        assert_eq!(cfg.registry.type_config("model_shards").priority, 4);
        assert_eq!(
            cfg.report_dir.as_deref(),
            Some(Path::new("/tmp/memwarden-reports"))
        );
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = EngineConfig::default();
        cfg.allocator.compression_ratio_threshold = 1.5;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = EngineConfig::default();
        cfg.snapshots.max_snapshots = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_without_file() -> Result<()> {
        let cfg = EngineConfig::load(None)?;
        assert_eq!(cfg.locks.lock_timeout_secs, 60);
        Ok(())
    }

    #[test]
    fn test_timer_disabled_when_zero() {
        let cfg = DefragConfig {
            auto_compact_interval_secs: 0,
            ..Default::default()
        };
        assert!(cfg.auto_compact_interval().is_none());
    }
}
