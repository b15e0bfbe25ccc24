//! skein.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::DispatchMode;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkeinConfig {
    pub server: ServerSection,
    pub node: NodeSection,
    pub register: RegisterSection,
    pub pool: PoolSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen: String,
    pub workers: usize,
    pub dispatch_mode: DispatchMode,
    /// Frame delimiter, escapes allowed (`"\r\n\r\n"`).
    pub delimiter: Option<String>,
    pub heartbeat_secs: u64,
    pub read_timeout_ms: u64,
    pub max_frame_bytes: usize,
    pub reserved_prefix: String,
    pub forbidden_actions: Vec<String>,
    /// Reject encrypted envelopes issued longer ago than this.
    pub max_age_secs: Option<u64>,
    /// How far in the future an encrypted envelope may claim to be issued.
    pub skew_tolerance_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9501".to_string(),
            workers: 1,
            dispatch_mode: DispatchMode::Fd,
            delimiter: None,
            heartbeat_secs: 30,
            read_timeout_ms: 5_000,
            max_frame_bytes: 8 * 1024 * 1024,
            reserved_prefix: "_".to_string(),
            forbidden_actions: Vec::new(),
            max_age_secs: None,
            skew_tolerance_secs: 300,
        }
    }
}

/// Registration request fields of the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub id: Option<i64>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub task_port: u16,
    pub worker_num: u32,
    pub task_num: u32,
    pub group: String,
    pub encrypt: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: None,
            ip: None,
            port: None,
            task_port: 0,
            worker_num: 1,
            task_num: 0,
            group: "default".to_string(),
            encrypt: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterSection {
    pub ip: String,
    pub port: u16,
    pub shared_key: Option<String>,
    pub grace_secs: u64,
    pub sweep_secs: u64,
    pub reconnect_ms: u64,
    pub max_nodes_per_group: u32,
    /// Where the register server keeps its membership table; in-memory if unset.
    pub data_dir: Option<String>,
}

impl Default for RegisterSection {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 9500,
            shared_key: None,
            grace_secs: 60,
            sweep_secs: 10,
            reconnect_ms: 3_000,
            max_nodes_per_group: 65_536,
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub size: usize,
    pub max_waiting: usize,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            size: 8,
            max_waiting: 64,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl SkeinConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: SkeinConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
