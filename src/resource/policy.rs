//! Per-type eviction policy

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Eviction settings for one resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeConfig {
    /// Lower values are released sooner
    pub priority: u32,
    /// Age after which an idle resource counts as expired
    pub max_retain_secs: u64,
}

impl ResourceTypeConfig {
    pub const fn new(priority: u32, max_retain_secs: u64) -> Self {
        Self {
            priority,
            max_retain_secs,
        }
    }

    pub fn max_retain_time(&self) -> Duration {
        Duration::from_secs(self.max_retain_secs)
    }
}

/// Weights of the release score
///
/// The defaults are an empirical starting point; deployments recalibrate them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseWeights {
    pub type_priority: f64,
    pub access_age: f64,
    pub size: f64,
    pub active: f64,
    pub compressible: f64,
    pub expired: f64,
    /// Size at which the size factor saturates
    pub size_saturation_mb: f64,
}

impl Default for ReleaseWeights {
    fn default() -> Self {
        Self {
            type_priority: 100.0,
            access_age: 50.0,
            size: 30.0,
            active: 200.0,
            compressible: 20.0,
            expired: 100.0,
            size_saturation_mb: 1000.0,
        }
    }
}

/// Process-wide resource type table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypePolicy {
    pub resource_types: HashMap<String, ResourceTypeConfig>,
    /// Used for types missing from the table
    pub default_type: ResourceTypeConfig,
    pub weights: ReleaseWeights,
}

impl Default for TypePolicy {
    fn default() -> Self {
        let resource_types = [
            ("temp_buffers", ResourceTypeConfig::new(1, 60)),
            ("render_cache", ResourceTypeConfig::new(2, 300)),
            ("decoder_cache", ResourceTypeConfig::new(2, 300)),
            ("subtitle_cache", ResourceTypeConfig::new(3, 600)),
            ("model_shards", ResourceTypeConfig::new(4, 1800)),
            ("model_weights", ResourceTypeConfig::new(5, 3600)),
        ]
        .into_iter()
        .map(|(name, cfg)| (name.to_string(), cfg))
        .collect();

        Self {
            resource_types,
            default_type: ResourceTypeConfig::new(3, 600),
            weights: ReleaseWeights::default(),
        }
    }
}

impl TypePolicy {
    /// Empty table with the given default entry
    pub fn with_default(default_type: ResourceTypeConfig) -> Self {
        Self {
            resource_types: HashMap::new(),
            default_type,
            weights: ReleaseWeights::default(),
        }
    }

    pub fn with_type(mut self, name: &str, config: ResourceTypeConfig) -> Self {
        self.resource_types.insert(name.to_string(), config);
        self
    }

    pub fn type_config(&self, resource_type: &str) -> ResourceTypeConfig {
        self.resource_types
            .get(resource_type)
            .copied()
            .unwrap_or(self.default_type)
    }

    pub fn priority(&self, resource_type: &str) -> u32 {
        self.type_config(resource_type).priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type_uses_default() {
        let policy = TypePolicy::default();
        assert_eq!(policy.priority("temp_buffers"), 1);
        assert_eq!(policy.type_config("no_such_type"), policy.default_type);
    }

    #[test]
    fn test_builder() {
        let policy = TypePolicy::with_default(ResourceTypeConfig::new(9, 10))
            .with_type("frames", ResourceTypeConfig::new(2, 30));
        assert_eq!(policy.priority("frames"), 2);
        assert_eq!(policy.priority("other"), 9);
        assert_eq!(
            policy.type_config("frames").max_retain_time(),
            Duration::from_secs(30)
        );
    }
}
