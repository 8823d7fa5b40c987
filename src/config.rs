//! Manager configuration, loaded from YAML
//!
//! Every field is optional; anything left out takes its default.
//!
//! ```yaml
//! lock:
//!   ttl_ms: 60000
//! file_index_manager:
//!   enabled: true
//!   interval_ms: 300000
//!   accept_mime_types: [application/pdf, text/plain]
//! rule_manager:
//!   interval_ms: 10000
//!   rules:
//!     - id: located_at_located
//!       left_type: located-at
//!       right_type: located-at
//!       output_type: located-at
//! ```

use crate::error::{ManagerError, ManagerResult};
use crate::inference::{RelationToRelationRule, RuleDefinition, DEFAULT_MAX_CASCADE_STEPS};
use crate::lock::LockOptions;
use crate::stream::{StartFrom, StreamConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// MIME types indexed when none are configured
pub const DEFAULT_ACCEPT_MIME_TYPES: [&str; 5] = [
    "application/pdf",
    "text/plain",
    "text/csv",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub lock: LockConfig,
    pub file_index_manager: FileIndexConfig,
    pub rule_manager: RuleManagerConfig,
}

impl ManagerConfig {
    /// Read and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> ManagerResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ManagerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> ManagerResult<Self> {
        // An empty document deserializes to unit, not to a map
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a manager spin or never run
    pub fn validate(&self) -> ManagerResult<()> {
        let positive = [
            ("lock.ttl_ms", self.lock.ttl_ms),
            ("file_index_manager.interval_ms", self.file_index_manager.interval_ms),
            (
                "file_index_manager.stream_interval_ms",
                self.file_index_manager.stream_interval_ms,
            ),
            ("rule_manager.interval_ms", self.rule_manager.interval_ms),
            (
                "file_index_manager.stream.poll_interval_ms",
                self.file_index_manager.stream.poll_interval_ms,
            ),
            (
                "rule_manager.stream.poll_interval_ms",
                self.rule_manager.stream.poll_interval_ms,
            ),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ManagerError::Config(format!("{} must be positive", name)));
        }
        if self.file_index_manager.load_concurrency == 0 {
            return Err(ManagerError::Config(
                "file_index_manager.load_concurrency must be positive".into(),
            ));
        }
        if self.file_index_manager.stream.batch_size == 0 || self.rule_manager.stream.batch_size == 0 {
            return Err(ManagerError::Config("stream.batch_size must be positive".into()));
        }
        if self.rule_manager.max_cascade_steps == 0 {
            return Err(ManagerError::Config(
                "rule_manager.max_cascade_steps must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Lease settings shared by every manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub ttl_ms: u64,
    pub retry_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            retry_delay_ms: 200,
        }
    }
}

impl LockConfig {
    /// Non-blocking acquisition options
    pub fn options(&self) -> LockOptions {
        LockOptions {
            retry_count: 0,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            ttl: Duration::from_millis(self.ttl_ms),
        }
    }
}

/// File index manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileIndexConfig {
    pub enabled: bool,
    pub lock_key: String,
    pub stream_lock_key: String,
    /// Pause between backfill scans
    pub interval_ms: u64,
    /// Pause between stream supervisor checks
    pub stream_interval_ms: u64,
    pub max_file_size: u64,
    pub accept_mime_types: Vec<String>,
    pub path_prefix: String,
    pub exclude_path: String,
    /// Concurrent content loads during a scan
    pub load_concurrency: usize,
    pub stream: StreamConfig,
}

impl Default for FileIndexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lock_key: "file_index_manager_lock".to_string(),
            stream_lock_key: "file_index_manager_stream_lock".to_string(),
            interval_ms: 300_000,
            stream_interval_ms: 10_000,
            max_file_size: 5_242_880,
            accept_mime_types: DEFAULT_ACCEPT_MIME_TYPES
                .iter()
                .map(|m| m.to_string())
                .collect(),
            path_prefix: "import/".to_string(),
            exclude_path: "import/pending/".to_string(),
            load_concurrency: 5,
            stream: StreamConfig::new("file_index_manager").with_start_from(StartFrom::Live),
        }
    }
}

impl FileIndexConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms)
    }
}

/// Rule manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleManagerConfig {
    pub enabled: bool,
    pub lock_key: String,
    /// Pause between stream supervisor checks
    pub interval_ms: u64,
    pub max_cascade_steps: usize,
    pub stream: StreamConfig,
    pub rules: Vec<RuleDefinition>,
}

impl Default for RuleManagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lock_key: "rule_engine_lock".to_string(),
            interval_ms: 10_000,
            max_cascade_steps: DEFAULT_MAX_CASCADE_STEPS,
            stream: StreamConfig::new("rule_manager"),
            rules: vec![RuleDefinition::from(
                &RelationToRelationRule::located_at_located(),
            )],
        }
    }
}

impl RuleManagerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ManagerConfig::default();
        assert_eq!(config.lock.ttl_ms, 60_000);
        assert_eq!(config.file_index_manager.interval_ms, 300_000);
        assert_eq!(config.file_index_manager.stream_interval_ms, 10_000);
        assert_eq!(config.file_index_manager.max_file_size, 5_242_880);
        assert_eq!(config.file_index_manager.accept_mime_types.len(), 5);
        assert_eq!(config.file_index_manager.load_concurrency, 5);
        assert_eq!(config.file_index_manager.stream.start_from, StartFrom::Live);
        assert_eq!(config.rule_manager.lock_key, "rule_engine_lock");
        assert_eq!(config.rule_manager.stream.start_from, StartFrom::Beginning);
        assert_eq!(config.rule_manager.rules[0].id, "located_at_located");
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let config = ManagerConfig::from_yaml_str(
            r#"
file_index_manager:
  interval_ms: 1000
  accept_mime_types: [application/pdf]
  stream:
    poll_interval_ms: 50
rule_manager:
  enabled: false
"#,
        )
        .unwrap();
        assert_eq!(config.file_index_manager.interval_ms, 1_000);
        assert_eq!(config.file_index_manager.accept_mime_types, vec!["application/pdf"]);
        assert_eq!(config.file_index_manager.stream.poll_interval_ms, 50);
        assert_eq!(config.file_index_manager.stream.batch_size, 100);
        assert_eq!(config.file_index_manager.lock_key, "file_index_manager_lock");
        assert!(!config.rule_manager.enabled);
        assert_eq!(config.rule_manager.rules.len(), 1);
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(ManagerConfig::from_yaml_str("").unwrap(), ManagerConfig::default());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = ManagerConfig::from_yaml_str("rule_manager:\n  interval_ms: 0\n").unwrap_err();
        assert!(matches!(err, ManagerError::Config(msg) if msg.contains("rule_manager.interval_ms")));
    }

    #[test]
    fn malformed_yaml_is_a_config_error() {
        let err = ManagerConfig::from_yaml_str("lock: [not, a, map]").unwrap_err();
        assert!(matches!(err, ManagerError::Config(_)));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.yaml");
        std::fs::write(&path, "lock:\n  ttl_ms: 5000\n").unwrap();
        let config = ManagerConfig::load(&path).unwrap();
        assert_eq!(config.lock.options().ttl, Duration::from_millis(5_000));

        let missing = ManagerConfig::load(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(missing, ManagerError::Config(_)));
    }
}
