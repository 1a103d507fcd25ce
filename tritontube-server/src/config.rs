use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tritontube_core::{Result, TritonError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub bind_addr: String,
    #[serde(default)]
    pub advertise_addr: Option<String>,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub capacity_bytes: i64,
    #[serde(default)]
    pub available_bytes: i64,
}

impl NodeConfig {
    pub fn effective_address(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.bind_addr.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,
    #[serde(default = "default_write_quorum")]
    pub write_quorum: usize,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_rebalance_deadline_secs")]
    pub rebalance_deadline_secs: u64,
    #[serde(default = "default_cluster_prefix")]
    pub cluster_prefix: String,
    #[serde(default = "default_segments_prefix")]
    pub segments_prefix: String,
}

impl ClusterConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn rebalance_deadline(&self) -> Duration {
        Duration::from_secs(self.rebalance_deadline_secs)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replication_factor: default_replication_factor(),
            virtual_nodes: default_virtual_nodes(),
            write_quorum: default_write_quorum(),
            lease_ttl_secs: default_lease_ttl_secs(),
            rebalance_deadline_secs: default_rebalance_deadline_secs(),
            cluster_prefix: default_cluster_prefix(),
            segments_prefix: default_segments_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_replication_factor() -> usize {
    3
}

fn default_virtual_nodes() -> u32 {
    128
}

fn default_write_quorum() -> usize {
    1
}

fn default_lease_ttl_secs() -> u64 {
    15
}

fn default_rebalance_deadline_secs() -> u64 {
    5
}

fn default_cluster_prefix() -> String {
    "/storage/cluster".to_string()
}

fn default_segments_prefix() -> String {
    "/storage/segments".to_string()
}

fn default_key_prefix() -> String {
    "metadata/".to_string()
}

fn default_max_retries() -> u32 {
    5
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("TRITONTUBE"))
            .build()
            .map_err(|e| TritonError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| TritonError::Config(e.to_string()))?;

        if config.node.node_id.is_empty() {
            return Err(TritonError::Config("node_id cannot be empty".to_string()));
        }
        if config.cluster.write_quorum > config.cluster.replication_factor {
            return Err(TritonError::Config(format!(
                "write_quorum {} exceeds replication_factor {}",
                config.cluster.write_quorum, config.cluster.replication_factor
            )));
        }

        Ok(config)
    }
}
