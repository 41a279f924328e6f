//! Timestamped JSON diagnostic reports
//!
//! Reports are write-only artifacts; nothing in the crate reads them back.

use crate::defrag::CompactionReport;
use crate::error::{Error, Result};
use crate::leak::LeakRecord;
use crate::monitor::MemoryStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Report document
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    /// Unix time in seconds
    pub timestamp: f64,
    pub datetime: String,
    pub kind: String,
    pub detected_leaks: Vec<LeakRecord>,
    pub memory_info: MemoryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction: Option<CompactionReport>,
}

impl DiagnosticReport {
    pub fn new(kind: &str, memory_info: MemoryStatus) -> Self {
        Self::at(Utc::now(), kind, memory_info)
    }

    fn at(now: DateTime<Utc>, kind: &str, memory_info: MemoryStatus) -> Self {
        Self {
            timestamp: now.timestamp_millis() as f64 / 1000.0,
            datetime: now.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            kind: kind.to_string(),
            detected_leaks: Vec::new(),
            memory_info,
            compaction: None,
        }
    }

    pub fn with_leaks(mut self, leaks: Vec<LeakRecord>) -> Self {
        self.detected_leaks = leaks;
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionReport) -> Self {
        self.compaction = Some(compaction);
        self
    }
}

/// Write `report` under `dir` as `<kind>_report_<time>_<suffix>.json`
pub fn write_report(dir: &Path, report: &DiagnosticReport) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let path = dir.join(format!("{}_report_{}_{}.json", report.kind, stamp, &suffix[..8]));

    let body = serde_json::to_vec_pretty(report)
        .map_err(|e| Error::Serialization(format!("Failed to encode report: {}", e)))?;
    std::fs::write(&path, body)?;

    info!(path = %path.display(), kind = %report.kind, "Diagnostic report written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_schema() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("memwarden_report_test_{}", std::process::id()));
        let report = DiagnosticReport::new("leak", MemoryStatus::default()).with_leaks(vec![
            LeakRecord {
                site: "registry:render_cache".to_string(),
                size_diff: 4096,
                growth_rate: 12.5,
                consecutive_count: 3,
            },
        ]);

        let path = write_report(&dir, &report)?;
        let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&path)?)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        assert!(doc["timestamp"].as_f64().unwrap() > 0.0);
        assert!(doc["datetime"].is_string());
        assert_eq!(doc["detected_leaks"][0]["site"], "registry:render_cache");
        assert!(doc["memory_info"].is_object());
        assert!(doc.get("compaction").is_none());

        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }
}
