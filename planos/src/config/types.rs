//! Typed configuration tree with the engine's numeric defaults.

use crate::dispatch::RetryPolicy;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Outer (queue-driven) retry policy. `max_attempts` is the attempt
    /// budget before a step dead-letters.
    pub outer_retry: RetryPolicy,
    /// Per-step timeout budget applied when the submitter leaves it unset.
    pub default_timeout_secs: u64,
    /// How long a processed invocation id is remembered to absorb duplicate
    /// queue deliveries.
    pub dedupe_window_secs: u64,
    pub dispatch: DispatchConfig,
    pub event_bus: EventBusConfig,
    pub policy: PolicyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            outer_retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1_000,
                multiplier: 2.0,
                max_delay_ms: 60_000,
                jitter: 0.2,
            },
            default_timeout_secs: 900,
            dedupe_window_secs: 120,
            dispatch: DispatchConfig::default(),
            event_bus: EventBusConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file. Missing keys fall back to the
    /// defaults above.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Dispatch client configuration. The internal retry budget is independent
/// of the engine's outer budget; an exhausted internal budget counts as one
/// outer attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub default_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Event bus bounds: history cap and post-terminal retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Per-plan history cap; oldest events evict FIFO beyond this.
    pub history_cap: usize,
    /// Seconds after the last terminal transition before a settled plan's
    /// history is evicted.
    pub retention_secs: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_cap: 200,
            retention_secs: 300,
        }
    }
}

/// Policy gate configuration: the capability → requires-approval table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub approval_gated: HashMap<String, bool>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let mut approval_gated = HashMap::new();
        approval_gated.insert("repo.write".to_string(), true);
        approval_gated.insert("network.egress".to_string(), true);
        Self { approval_gated }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_documented_budgets() {
        let config = EngineConfig::default();
        assert_eq!(config.outer_retry.max_attempts, 3);
        assert_eq!(config.default_timeout_secs, 900);
        assert_eq!(config.event_bus.history_cap, 200);
        assert_eq!(config.event_bus.retention_secs, 300);
        assert_eq!(config.policy.approval_gated.get("repo.write"), Some(&true));
        assert_eq!(
            config.policy.approval_gated.get("network.egress"),
            Some(&true)
        );
    }

    #[test]
    fn toml_file_overrides_only_named_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
default_timeout_secs = 120

[outer_retry]
max_attempts = 5

[event_bus]
history_cap = 50

[policy.approval_gated]
"payments.charge" = true
"#
        )
        .unwrap();

        let config = EngineConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.default_timeout_secs, 120);
        assert_eq!(config.outer_retry.max_attempts, 5);
        // unnamed keys keep their defaults
        assert_eq!(config.outer_retry.multiplier, 2.0);
        assert_eq!(config.event_bus.history_cap, 50);
        assert_eq!(config.event_bus.retention_secs, 300);
        assert_eq!(
            config.policy.approval_gated.get("payments.charge"),
            Some(&true)
        );
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = EngineConfig::from_toml_file("/nonexistent/planos.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_timeout_secs = \"not a number\"").unwrap();
        let err = EngineConfig::from_toml_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
