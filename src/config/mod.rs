//! Configuration module for cohort.

use crate::error::{CohortError, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a cohort node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortConfig {
    /// Node identity and initial membership.
    pub node: NodeConfig,
    /// Write-ahead log configuration.
    pub wal: WalSettings,
    /// Timer configuration.
    pub timeouts: TimeoutConfig,
    /// Replication and apply tuning.
    pub replication: ReplicationConfig,
}

impl CohortConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CohortError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| CohortError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            return Err(CohortError::InvalidConfig {
                field: "node.id".to_string(),
                reason: "Node ID must be non-zero".to_string(),
            });
        }

        if self.node.initial_members.is_empty() {
            return Err(CohortError::InvalidConfig {
                field: "node.initial_members".to_string(),
                reason: "Cluster requires at least one member".to_string(),
            });
        }

        if !self.node.initial_members.contains(&self.node.id) {
            return Err(CohortError::InvalidConfig {
                field: "node.initial_members".to_string(),
                reason: "Initial members must include this node".to_string(),
            });
        }

        if self.wal.max_wal_size_bytes == 0 {
            return Err(CohortError::InvalidConfig {
                field: "wal.max_wal_size_bytes".to_string(),
                reason: "WAL size limit must be non-zero".to_string(),
            });
        }

        if self.timeouts.broadcast_interval.is_zero() {
            return Err(CohortError::InvalidConfig {
                field: "timeouts.broadcast_interval".to_string(),
                reason: "Broadcast interval must be non-zero".to_string(),
            });
        }

        if self.replication.max_append_entries == 0 {
            return Err(CohortError::InvalidConfig {
                field: "replication.max_append_entries".to_string(),
                reason: "Append batch size must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal single-node development configuration.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                id: 1,
                name: "dev-node".to_string(),
                initial_members: vec![1],
                data_dir: PathBuf::from("/tmp/cohort"),
            },
            wal: WalSettings::default(),
            timeouts: TimeoutConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

/// Node identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's ID.
    pub id: NodeId,
    /// Human-readable node name for logs.
    pub name: String,
    /// Member IDs of the initial cluster, including this node.
    pub initial_members: Vec<NodeId>,
    /// Directory for the node's log, metadata and snapshot files.
    pub data_dir: PathBuf,
}

/// Write-ahead log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalSettings {
    /// Directory holding `*.wal` files.
    pub dir: PathBuf,
    /// Rollover threshold for a single WAL file.
    pub max_wal_size_bytes: u64,
    /// Record per-record checksums (disabling writes 0 on the wire).
    pub compute_checksums: bool,
}

impl Default for WalSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp/cohort/wal"),
            max_wal_size_bytes: 256 * 1024 * 1024,
            compute_checksums: true,
        }
    }
}

/// Timer configuration.
///
/// Election timeouts are derived from the broadcast interval:
/// a follower waits `2 x broadcast + uniform(1x, 4x broadcast)`, a candidate
/// `4 x broadcast + uniform(1x, 4x broadcast)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Base interval between leader heartbeats.
    pub broadcast_interval: Duration,
    /// How long an await-condition role waits before reverting to follower.
    pub await_condition_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            broadcast_interval: Duration::from_millis(100),
            await_condition_timeout: Duration::from_secs(30),
        }
    }
}

impl TimeoutConfig {
    /// Sample a follower election timeout.
    pub fn follower_election_timeout(&self) -> Duration {
        self.broadcast_interval * 2 + self.jitter()
    }

    /// Sample a candidate election timeout.
    pub fn candidate_election_timeout(&self) -> Duration {
        self.broadcast_interval * 4 + self.jitter()
    }

    fn jitter(&self) -> Duration {
        use rand::Rng;
        let lo = self.broadcast_interval.as_millis() as u64;
        let hi = lo * 4;
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

/// Replication and apply tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Maximum entries per AppendEntries RPC.
    pub max_append_entries: usize,
    /// Entries fetched per apply-loop batch.
    pub apply_batch_size: usize,
    /// Applied entries between release-cursor hints.
    pub release_cursor_interval: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_append_entries: 128,
            apply_batch_size: 64,
            release_cursor_interval: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_development_config_valid() {
        assert!(CohortConfig::development().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_node_id() {
        let mut config = CohortConfig::development();
        config.node.id = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_membership_without_self() {
        let mut config = CohortConfig::development();
        config.node.initial_members = vec![2, 3];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_ranges() {
        let timeouts = TimeoutConfig::default();
        let broadcast = timeouts.broadcast_interval;
        for _ in 0..32 {
            let follower = timeouts.follower_election_timeout();
            assert!(follower >= broadcast * 3 && follower <= broadcast * 6);
            let candidate = timeouts.candidate_election_timeout();
            assert!(candidate >= broadcast * 5 && candidate <= broadcast * 8);
        }
    }
}
