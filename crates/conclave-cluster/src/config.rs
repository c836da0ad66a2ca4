//! conclave.toml configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::directory::NodeEntry;
use crate::error::{CoordError, CoordResult};

/// Token shared by every legitimate member of a cluster.
pub const DEFAULT_CLUSTER_TOKEN: &str = "conclave";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Name of the local node; must match one of `nodes`.
    pub name: String,
    pub data_dir: PathBuf,
    pub cluster_token: String,
    pub request_timeout_ms: u64,
    pub get_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub move_leader_timeout_ms: u64,
    pub ready_timeout_ms: u64,
    /// Period of the daemon's ensure-started driver.
    pub ensure_interval_ms: u64,
    pub heartbeat_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub nodes: Vec<NodeEntry>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            data_dir: PathBuf::from("/var/lib/conclave"),
            cluster_token: DEFAULT_CLUSTER_TOKEN.to_string(),
            request_timeout_ms: 5_000,
            get_timeout_ms: 1_000,
            join_timeout_ms: 30_000,
            move_leader_timeout_ms: 1_500,
            ready_timeout_ms: 10_000,
            ensure_interval_ms: 5_000,
            heartbeat_ms: 50,
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 600,
            nodes: Vec::new(),
        }
    }
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> CoordResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> CoordResult<Self> {
        let config: ClusterConfig =
            toml::from_str(content).map_err(|e| CoordError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CoordResult<String> {
        toml::to_string_pretty(self).map_err(|e| CoordError::Config(e.to_string()))
    }

    pub fn validate(&self) -> CoordResult<()> {
        for node in &self.nodes {
            if node.port > u16::MAX - 2 {
                return Err(CoordError::Config(format!(
                    "node {} base port {} leaves no room for peer and client ports",
                    node.name, node.port
                )));
            }
        }
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(CoordError::Config(
                "election_timeout_min_ms must be below election_timeout_max_ms".to_string(),
            ));
        }
        if self.heartbeat_ms >= self.election_timeout_min_ms {
            return Err(CoordError::Config(
                "heartbeat_ms must be below election_timeout_min_ms".to_string(),
            ));
        }
        // Voters refuse a successor's campaign until the old leader's lease,
        // election_timeout_max_ms, has run out.
        if self.move_leader_timeout_ms <= self.election_timeout_max_ms {
            return Err(CoordError::Config(
                "move_leader_timeout_ms must exceed election_timeout_max_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.get_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn move_leader_timeout(&self) -> Duration {
        Duration::from_millis(self.move_leader_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ensure_interval(&self) -> Duration {
        Duration::from_millis(self.ensure_interval_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }
}
