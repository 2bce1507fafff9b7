//! Cluster configuration structures.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DlmError, DlmResult};
use crate::types::HostId;

/// Top-level lock manager configuration.
///
/// # Example
///
/// ```rust
/// use dlm_common::config::DlmConfig;
///
/// let config = DlmConfig::from_toml_str("hosts = [1, 2, 3]\nlocal_host = 2").unwrap();
/// assert_eq!(config.hosts.len(), 3);
/// assert!(config.deadlock_detection);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DlmConfig {
    /// Participating hosts. Each runs one lock table.
    #[serde(default = "default_hosts")]
    pub hosts: Vec<HostId>,

    /// Host used when a lock request names no hosts.
    #[serde(default = "default_local_host")]
    pub local_host: HostId,

    /// Whether agents run the probe protocol when they become blocked.
    #[serde(default = "default_true")]
    pub deadlock_detection: bool,

    /// Defaults applied to new transactions.
    #[serde(default)]
    pub txn: TxnDefaults,

    /// Lock table settings.
    #[serde(default)]
    pub lock_table: LockTableConfig,
}

/// Defaults for new transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TxnDefaults {
    /// Abort the whole transaction instead of surrendering a lock when
    /// chosen as deadlock victim.
    #[serde(default)]
    pub abort_on_deadlock: bool,
}

/// Lock table settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockTableConfig {
    /// Remove entries once they have no holders and no waiters.
    #[serde(default = "default_true")]
    pub gc_empty_entries: bool,
}

impl Default for LockTableConfig {
    fn default() -> Self {
        Self {
            gc_empty_entries: true,
        }
    }
}

fn default_hosts() -> Vec<HostId> {
    vec![HostId::new(1)]
}

fn default_local_host() -> HostId {
    HostId::new(1)
}

fn default_true() -> bool {
    true
}

impl Default for DlmConfig {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            local_host: default_local_host(),
            deadlock_detection: true,
            txn: TxnDefaults::default(),
            lock_table: LockTableConfig::default(),
        }
    }
}

impl DlmConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration for the given hosts, the first being local.
    #[must_use]
    pub fn with_hosts(hosts: impl IntoIterator<Item = u64>) -> Self {
        let hosts: Vec<HostId> = hosts.into_iter().map(HostId::new).collect();
        let local_host = hosts.first().copied().unwrap_or_else(default_local_host);
        Self {
            hosts,
            local_host,
            ..Default::default()
        }
    }

    /// Parses a TOML document.
    pub fn from_toml_str(content: &str) -> DlmResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| DlmError::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file.
    pub fn from_file(path: &Path) -> DlmResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DlmError::invalid_config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Converts configuration to a TOML string.
    pub fn to_toml(&self) -> DlmResult<String> {
        toml::to_string_pretty(self).map_err(|e| DlmError::invalid_config(e.to_string()))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> DlmResult<()> {
        if self.hosts.is_empty() {
            return Err(DlmError::invalid_config("at least one host is required"));
        }

        let mut sorted = self.hosts.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != self.hosts.len() {
            return Err(DlmError::invalid_config("duplicate host ids"));
        }

        if !self.hosts.contains(&self.local_host) {
            return Err(DlmError::invalid_config(format!(
                "local_host {} is not in hosts",
                self.local_host
            )));
        }

        Ok(())
    }

    /// Creates a builder for configuration.
    pub fn builder() -> DlmConfigBuilder {
        DlmConfigBuilder::new()
    }
}

/// Builder for [`DlmConfig`].
#[derive(Debug, Default)]
pub struct DlmConfigBuilder {
    config: DlmConfig,
}

impl DlmConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the participating hosts.
    pub fn hosts(mut self, hosts: impl IntoIterator<Item = u64>) -> Self {
        self.config.hosts = hosts.into_iter().map(HostId::new).collect();
        self
    }

    /// Sets the local host.
    pub fn local_host(mut self, host: u64) -> Self {
        self.config.local_host = HostId::new(host);
        self
    }

    /// Enables or disables deadlock detection.
    pub fn deadlock_detection(mut self, enabled: bool) -> Self {
        self.config.deadlock_detection = enabled;
        self
    }

    /// Sets the default `abort_on_deadlock` for new transactions.
    pub fn abort_on_deadlock(mut self, abort: bool) -> Self {
        self.config.txn.abort_on_deadlock = abort;
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> DlmResult<DlmConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DlmConfig::default();
        assert_eq!(config.hosts, vec![HostId::new(1)]);
        assert_eq!(config.local_host, HostId::new(1));
        assert!(config.deadlock_detection);
        assert!(!config.txn.abort_on_deadlock);
        assert!(config.lock_table.gc_empty_entries);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config = DlmConfig::from_toml_str(
            r#"
            hosts = [1, 2]
            local_host = 2
            deadlock_detection = false

            [txn]
            abort_on_deadlock = true
            "#,
        )
        .unwrap();

        assert_eq!(config.local_host, HostId::new(2));
        assert!(!config.deadlock_detection);
        assert!(config.txn.abort_on_deadlock);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = DlmConfig::from_toml_str("hosts = [1]\nlock_timeout = 5");
        assert!(matches!(result, Err(DlmError::InvalidConfig { .. })));
    }

    #[test]
    fn test_validation() {
        let config = DlmConfig {
            hosts: vec![HostId::new(1), HostId::new(1)],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DlmConfig {
            local_host: HostId::new(5),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        assert!(DlmConfig::builder().hosts(Vec::new()).build().is_err());
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlm.toml");

        let config = DlmConfig::builder()
            .hosts([1, 2, 3])
            .local_host(3)
            .abort_on_deadlock(true)
            .build()
            .unwrap();
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        assert_eq!(DlmConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_with_hosts() {
        let config = DlmConfig::with_hosts([4, 5]);
        assert_eq!(config.local_host, HostId::new(4));
        assert!(config.validate().is_ok());
    }
}
