//! Release ordering
//!
//! Pure scoring over registry views. Lower score is released first:
//!
//! ```text
//! score = priority·W_type − age_factor·W_age − size_factor·W_size
//!       + W_active·is_active + W_compressible·compressible − W_expired·is_expired
//!
//! age_factor  = min(1, age / (2·max_retain_time))
//! size_factor = min(1, size_mb / size_saturation_mb)
//! ```
//!
//! Active resources are strongly protected; expired ones are pushed forward.

use super::policy::{ReleaseWeights, ResourceTypeConfig, TypePolicy};
use super::ResourceId;
use std::time::Instant;

/// Point-in-time view of a registered resource
#[derive(Debug, Clone)]
pub struct ResourceView {
    pub id: ResourceId,
    pub size_mb: f64,
    pub last_access: Instant,
    pub access_count: u64,
    pub is_active: bool,
    pub compressible: bool,
}

impl ResourceView {
    pub fn resource_type(&self) -> &str {
        self.id.resource_type()
    }
}

/// Score a single resource
pub fn release_score(
    view: &ResourceView,
    config: &ResourceTypeConfig,
    weights: &ReleaseWeights,
    now: Instant,
) -> f64 {
    let age = now.saturating_duration_since(view.last_access).as_secs_f64();
    let retain = config.max_retain_secs as f64;

    let age_factor = if retain > 0.0 {
        (age / (2.0 * retain)).min(1.0)
    } else {
        1.0
    };
    let size_factor = if weights.size_saturation_mb > 0.0 {
        (view.size_mb / weights.size_saturation_mb).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let is_expired = age > retain;

    let mut score = config.priority as f64 * weights.type_priority
        - age_factor * weights.access_age
        - size_factor * weights.size;
    if view.is_active {
        score += weights.active;
    }
    if view.compressible {
        score += weights.compressible;
    }
    if is_expired {
        score -= weights.expired;
    }
    score
}

/// Order resources for release, first to release first
///
/// Ties break by older `last_access`, then by id.
pub fn calculate_release_priority(
    resources: &[ResourceView],
    policy: &TypePolicy,
    now: Instant,
) -> Vec<ResourceId> {
    let mut scored: Vec<(f64, &ResourceView)> = resources
        .iter()
        .map(|view| {
            let config = policy.type_config(view.resource_type());
            (release_score(view, &config, &policy.weights, now), view)
        })
        .collect();

    scored.sort_by(|(score_a, a), (score_b, b)| {
        score_a
            .total_cmp(score_b)
            .then_with(|| a.last_access.cmp(&b.last_access))
            .then_with(|| a.id.cmp(&b.id))
    });

    scored.into_iter().map(|(_, view)| view.id.clone()).collect()
}
