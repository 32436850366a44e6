//! Configuration module for Tessera.

use crate::error::{Result, TesseraError};
use crate::types::{HashPathSalt, PolicyId, StoragePolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a Tessera node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TesseraConfig {
    /// Node identity.
    pub node: NodeConfig,
    /// Local storage layout.
    pub storage: StorageConfig,
    /// Storage policies served by the cluster, each with its own ring.
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
    /// Replicator daemon (replicated policies).
    #[serde(default)]
    pub replicator: SchedulerConfig,
    /// Reconstructor daemon (erasure-coded policies).
    #[serde(default)]
    pub reconstructor: SchedulerConfig,
    /// Auditor daemon.
    #[serde(default)]
    pub auditor: AuditorConfig,
    /// Async update sweeper daemon.
    #[serde(default)]
    pub updater: UpdaterConfig,
    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl TesseraConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TesseraError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| TesseraError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.policies.is_empty() {
            return Err(invalid("policies", "At least one storage policy is required"));
        }

        let mut seen = HashSet::new();
        for policy in &self.policies {
            if !seen.insert(policy.index) {
                return Err(invalid(
                    "policies.index",
                    &format!("Duplicate policy index {}", policy.index),
                ));
            }
            match policy.policy {
                StoragePolicy::Replicated { replica_count } if replica_count == 0 => {
                    return Err(invalid("policies.policy.replica_count", "Must be non-zero"));
                }
                StoragePolicy::ErasureCoded {
                    data_fragments,
                    parity_fragments,
                    ..
                } if data_fragments == 0 || parity_fragments == 0 => {
                    return Err(invalid(
                        "policies.policy",
                        "Erasure-coded policies need non-zero data and parity fragments",
                    ));
                }
                _ => {}
            }
        }

        self.replicator.validate("replicator")?;
        self.reconstructor.validate("reconstructor")?;

        if self.updater.max_attempts == 0 {
            return Err(invalid("updater.max_attempts", "Must be non-zero"));
        }
        if self.updater.concurrency == 0 {
            return Err(invalid("updater.concurrency", "Must be non-zero"));
        }

        Ok(())
    }

    /// Look up a policy by index.
    pub fn policy(&self, index: PolicyId) -> Option<&PolicyConfig> {
        self.policies.iter().find(|p| p.index == index)
    }

    /// Create a single-host development configuration.
    pub fn development() -> Self {
        let root = PathBuf::from("/tmp/tessera");
        Self {
            node: NodeConfig {
                name: "dev-node".to_string(),
                bind_ip: "127.0.0.1".to_string(),
                bind_port: 6200,
            },
            storage: StorageConfig {
                devices_root: root.join("devices"),
                mount_check: false,
                hash_path_prefix: String::new(),
                hash_path_suffix: "changeme".to_string(),
            },
            policies: vec![
                PolicyConfig {
                    index: 0,
                    name: "gold".to_string(),
                    policy: StoragePolicy::Replicated { replica_count: 3 },
                    ring_path: root.join("object.ring.json"),
                },
                PolicyConfig {
                    index: 1,
                    name: "ec42".to_string(),
                    policy: StoragePolicy::ErasureCoded {
                        data_fragments: 4,
                        parity_fragments: 2,
                        scheme: Default::default(),
                    },
                    ring_path: root.join("object-1.ring.json"),
                },
            ],
            replicator: SchedulerConfig {
                interval: Duration::from_secs(5),
                ..Default::default()
            },
            reconstructor: SchedulerConfig {
                interval: Duration::from_secs(5),
                ..Default::default()
            },
            auditor: AuditorConfig {
                interval: Duration::from_secs(60),
                ..Default::default()
            },
            updater: UpdaterConfig {
                interval: Duration::from_secs(10),
                ..Default::default()
            },
            observability: ObservabilityConfig {
                metrics_enabled: false,
                log_level: "debug".to_string(),
                ..Default::default()
            },
        }
    }
}

fn invalid(field: &str, reason: &str) -> TesseraError {
    TesseraError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name.
    pub name: String,
    /// IP this node's devices are listed under in the rings.
    pub bind_ip: String,
    /// Port this node's devices are listed under in the rings.
    pub bind_port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "tessera-node".to_string(),
            bind_ip: "127.0.0.1".to_string(),
            bind_port: 6200,
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory containing one sub-directory per device.
    pub devices_root: PathBuf,
    /// Require each device directory to be a mount point.
    pub mount_check: bool,
    /// Cluster-wide secret mixed into object hashes.
    #[serde(default)]
    pub hash_path_prefix: String,
    /// Cluster-wide secret mixed into object hashes.
    #[serde(default)]
    pub hash_path_suffix: String,
}

impl StorageConfig {
    pub fn salt(&self) -> HashPathSalt {
        HashPathSalt::new(&self.hash_path_prefix, &self.hash_path_suffix)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            devices_root: PathBuf::from("/srv/node"),
            mount_check: true,
            hash_path_prefix: String::new(),
            hash_path_suffix: String::new(),
        }
    }
}

/// A storage policy and the ring placing its partitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub index: PolicyId,
    pub name: String,
    pub policy: StoragePolicy,
    pub ring_path: PathBuf,
}

/// Configuration shared by the replicator and the reconstructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum concurrent partition jobs.
    pub concurrency: usize,
    /// Delay between passes in daemon mode.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Upper bound for a single partition job.
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,
    /// A pass with no completed job for this long is torn down.
    #[serde(with = "humantime_serde")]
    pub lockup_timeout: Duration,
    /// Upper bound for all transfers to (or fetches from) one remote device.
    #[serde(with = "humantime_serde")]
    pub transfer_timeout: Duration,
    /// Dispatch handoff partitions before primary partitions.
    #[serde(default)]
    pub handoffs_first: bool,
}

impl SchedulerConfig {
    fn validate(&self, section: &str) -> Result<()> {
        if self.concurrency == 0 {
            return Err(invalid(&format!("{}.concurrency", section), "Must be non-zero"));
        }
        if self.lockup_timeout < self.job_timeout {
            return Err(invalid(
                &format!("{}.lockup_timeout", section),
                "Must be at least job_timeout",
            ));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            interval: Duration::from_secs(30),
            job_timeout: Duration::from_secs(900),
            lockup_timeout: Duration::from_secs(1800),
            transfer_timeout: Duration::from_secs(60),
            handoffs_first: false,
        }
    }
}

/// Auditor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditorConfig {
    /// Delay between sweeps in daemon mode.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Maximum files verified per second (0 = unlimited).
    pub files_per_second: u64,
    /// Maximum bytes read per second (0 = unlimited).
    pub bytes_per_second: u64,
    /// How often to log sweep progress.
    #[serde(with = "humantime_serde")]
    pub log_interval: Duration,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1800),
            files_per_second: 20,
            bytes_per_second: 10 * 1024 * 1024, // 10 MB/s
            log_interval: Duration::from_secs(3600),
        }
    }
}

/// Async update sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Delay between sweeps in daemon mode.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Concurrent deliveries per device.
    pub concurrency: usize,
    /// Attempts after which a record is moved to the dead-letter directory.
    pub max_attempts: u32,
    /// Timeout for one delivery to one node.
    #[serde(with = "humantime_serde")]
    pub node_timeout: Duration,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            concurrency: 8,
            max_attempts: 10,
            node_timeout: Duration::from_secs(10),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime-style strings (`250ms`, `30s`, `5m`, `1h`).
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = duration.as_millis();
        let text = if ms % 3_600_000 == 0 && ms > 0 {
            format!("{}h", ms / 3_600_000)
        } else if ms % 60_000 == 0 && ms > 0 {
            format!("{}m", ms / 60_000)
        } else if ms % 1000 == 0 && ms > 0 {
            format!("{}s", ms / 1000)
        } else {
            format!("{}ms", ms)
        };
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (value, scale) = if let Some(v) = s.strip_suffix("ms") {
            (v, 1)
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1000)
        } else if let Some(v) = s.strip_suffix('m') {
            (v, 60_000)
        } else if let Some(v) = s.strip_suffix('h') {
            (v, 3_600_000)
        } else {
            (s, 1)
        };
        value
            .trim()
            .parse::<u64>()
            .map(|v| Duration::from_millis(v * scale))
            .map_err(|e| format!("invalid duration '{}': {}", s, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_development_config() {
        let config = TesseraConfig::development();
        config.validate().unwrap();
        assert_eq!(config.policies.len(), 2);
        assert!(config.policy(1).unwrap().policy.is_erasure_coded());
        assert!(!config.storage.mount_check);
    }

    #[test]
    fn test_default_config_requires_policies() {
        let config = TesseraConfig::default();
        assert!(matches!(
            config.validate(),
            Err(TesseraError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_duplicate_policy_rejected() {
        let mut config = TesseraConfig::development();
        config.policies[1].index = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lockup_shorter_than_job_rejected() {
        let mut config = TesseraConfig::development();
        config.replicator.lockup_timeout = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_parsing() {
        use humantime_serde::parse_duration;
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("42").unwrap(), Duration::from_millis(42));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = TesseraConfig::development();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"interval\":\"5s\""));
        let parsed: TesseraConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.replicator.interval, Duration::from_secs(5));
        assert_eq!(parsed.auditor.log_interval, Duration::from_secs(3600));
    }
}
