//! Engine configuration.
//!
//! All knobs recognized by the core live here and are injected at
//! construction time; nothing reads process-global state.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the storage engine and the reindex coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ceiling for simultaneously active reindex jobs, both at deployment
    /// scope and for a single worker's local leases.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// A job lease is considered expired when no heartbeat has been recorded
    /// for longer than this.
    #[serde(default = "default_heartbeat_threshold_secs")]
    pub job_heartbeat_threshold_secs: u64,

    /// Cadence of the worker's acquire loop.
    #[serde(default = "default_poll_interval_secs")]
    pub job_poll_interval_secs: u64,

    /// Starting batch size for reindex paging; the throttle oracle may
    /// shrink it at runtime.
    #[serde(default = "default_batch_size")]
    pub reindex_batch_size: usize,

    /// Whether upserts retain prior versions, per resource type.
    #[serde(default)]
    pub keep_history: TypePolicy,

    /// Whether an upsert may create a record that does not exist yet,
    /// per resource type.
    #[serde(default)]
    pub allow_create: TypePolicy,
}

fn default_max_concurrent_jobs() -> usize {
    1
}

fn default_heartbeat_threshold_secs() -> u64 {
    60
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_batch_size() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            job_heartbeat_threshold_secs: default_heartbeat_threshold_secs(),
            job_poll_interval_secs: default_poll_interval_secs(),
            reindex_batch_size: default_batch_size(),
            keep_history: TypePolicy::default(),
            allow_create: TypePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Heartbeat threshold as a [`Duration`].
    pub fn heartbeat_threshold(&self) -> Duration {
        Duration::from_secs(self.job_heartbeat_threshold_secs)
    }

    /// Worker poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.job_poll_interval_secs)
    }

    /// Upsert options for a resource type under this deployment's policies.
    /// The caller's `If-Match` expectation is layered on top.
    pub fn upsert_options_for(&self, resource_type: &str) -> crate::core::UpsertOptions {
        crate::core::UpsertOptions {
            if_match: None,
            allow_create: self.allow_create.for_type(resource_type),
            keep_history: self.keep_history.for_type(resource_type),
        }
    }
}

/// A per-resource-type boolean policy with a deployment default.
///
/// Sourced from the capability document at deployment time; types absent
/// from `overrides` use `default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypePolicy {
    /// Value applied to types without an explicit override.
    #[serde(default = "default_true")]
    pub default: bool,

    /// Per-type exceptions.
    #[serde(default)]
    pub overrides: HashMap<String, bool>,
}

fn default_true() -> bool {
    true
}

impl Default for TypePolicy {
    fn default() -> Self {
        Self {
            default: true,
            overrides: HashMap::new(),
        }
    }
}

impl TypePolicy {
    /// Resolves the policy for a resource type.
    pub fn for_type(&self, resource_type: &str) -> bool {
        self.overrides
            .get(resource_type)
            .copied()
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_jobs, 1);
        assert_eq!(config.heartbeat_threshold(), Duration::from_secs(60));
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.reindex_batch_size, 100);
        assert!(config.keep_history.for_type("Patient"));
        assert!(config.allow_create.for_type("Patient"));
    }

    #[test]
    fn type_policy_overrides() {
        let mut policy = TypePolicy::default();
        policy.overrides.insert("AuditEvent".to_string(), false);
        assert!(!policy.for_type("AuditEvent"));
        assert!(policy.for_type("Patient"));
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_concurrent_jobs": 2}"#).unwrap();
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.reindex_batch_size, 100);
    }

    #[test]
    fn upsert_options_follow_type_policies() {
        let mut config = EngineConfig::default();
        config.keep_history.overrides.insert("AuditEvent".to_string(), false);
        config.allow_create.overrides.insert("Provenance".to_string(), false);

        let options = config.upsert_options_for("AuditEvent");
        assert!(!options.keep_history);
        assert!(options.allow_create);

        let options = config.upsert_options_for("Provenance");
        assert!(options.keep_history);
        assert!(!options.allow_create);
    }
}
