use crate::consensus::state::ConsensusConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level node configuration, loaded from TOML with per-section
/// defaults so a partial file (or none at all) still boots a node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub consensus: ConsensusSection,
    #[serde(default)]
    pub wal: WalSection,
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub observability: ObservabilitySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_chain_id")]
    pub chain_id: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusSection {
    #[serde(default = "default_timeout_propose_ms")]
    pub timeout_propose_ms: u64,
    #[serde(default = "default_delta_ms")]
    pub timeout_propose_delta_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_prevote_ms: u64,
    #[serde(default = "default_delta_ms")]
    pub timeout_prevote_delta_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_precommit_ms: u64,
    #[serde(default = "default_delta_ms")]
    pub timeout_precommit_delta_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_commit_ms: u64,
    #[serde(default = "default_true")]
    pub skip_timeout_commit: bool,
    #[serde(default = "default_true")]
    pub create_empty_blocks: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalSection {
    /// Relative paths resolve under the data directory.
    #[serde(default = "default_wal_file")]
    pub file: String,
    #[serde(default = "default_wal_max_size")]
    pub max_file_size_bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppSection {
    /// "kv" for the built-in application, "socket" for an external one.
    #[serde(default = "default_app_mode")]
    pub mode: String,
    #[serde(default = "default_app_addr")]
    pub addr: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObservabilitySection {
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen_addr: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub module_levels: Option<String>,
}

fn default_chain_id() -> String {
    "localnet".to_string()
}
fn default_data_dir() -> String {
    "data".to_string()
}
fn default_timeout_propose_ms() -> u64 {
    3000
}
fn default_timeout_ms() -> u64 {
    1000
}
fn default_delta_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}
fn default_wal_file() -> String {
    "cs.wal".to_string()
}
fn default_wal_max_size() -> u64 {
    256 * 1024 * 1024
}
fn default_app_mode() -> String {
    "kv".to_string()
}
fn default_app_addr() -> String {
    "127.0.0.1:26658".to_string()
}
fn default_metrics_listen() -> String {
    "0.0.0.0:26660".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
            data_dir: default_data_dir(),
        }
    }
}
impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            timeout_propose_ms: default_timeout_propose_ms(),
            timeout_propose_delta_ms: default_delta_ms(),
            timeout_prevote_ms: default_timeout_ms(),
            timeout_prevote_delta_ms: default_delta_ms(),
            timeout_precommit_ms: default_timeout_ms(),
            timeout_precommit_delta_ms: default_delta_ms(),
            timeout_commit_ms: default_timeout_ms(),
            skip_timeout_commit: true,
            create_empty_blocks: true,
        }
    }
}
impl Default for WalSection {
    fn default() -> Self {
        Self {
            file: default_wal_file(),
            max_file_size_bytes: default_wal_max_size(),
        }
    }
}
impl Default for AppSection {
    fn default() -> Self {
        Self {
            mode: default_app_mode(),
            addr: default_app_addr(),
        }
    }
}
impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_listen_addr: default_metrics_listen(),
        }
    }
}
impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
            module_levels: None,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection::default(),
            consensus: ConsensusSection::default(),
            wal: WalSection::default(),
            app: AppSection::default(),
            observability: ObservabilitySection::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn consensus_config(&self) -> ConsensusConfig {
        ConsensusConfig {
            timeout_propose_ms: self.consensus.timeout_propose_ms,
            timeout_propose_delta_ms: self.consensus.timeout_propose_delta_ms,
            timeout_prevote_ms: self.consensus.timeout_prevote_ms,
            timeout_prevote_delta_ms: self.consensus.timeout_prevote_delta_ms,
            timeout_precommit_ms: self.consensus.timeout_precommit_ms,
            timeout_precommit_delta_ms: self.consensus.timeout_precommit_delta_ms,
            timeout_commit_ms: self.consensus.timeout_commit_ms,
            skip_timeout_commit: self.consensus.skip_timeout_commit,
            create_empty_blocks: self.consensus.create_empty_blocks,
        }
    }

    pub fn wal_path(&self) -> std::path::PathBuf {
        let wal = Path::new(&self.wal.file);
        if wal.is_absolute() {
            wal.to_path_buf()
        } else {
            Path::new(&self.node.data_dir).join(wal)
        }
    }
}
