use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::family::Family;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/lockwall/lockwall.yaml";

/// Daemon configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Enable lockdown at startup
    #[serde(default)]
    pub lockdown: bool,
    /// Lockdown whitelist file, empty whitelist when unset
    #[serde(default)]
    pub lockdown_whitelist: Option<PathBuf>,
    /// Permanent direct rules loaded at startup
    #[serde(default)]
    pub direct: Option<PathBuf>,
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Upper bound for every backend process invocation
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_iptables")]
    pub iptables: String,
    #[serde(default = "default_ip6tables")]
    pub ip6tables: String,
    #[serde(default = "default_ebtables")]
    pub ebtables: String,
    /// Pass `-w` so iptables waits for the xtables lock
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_iptables() -> String {
    "iptables".to_string()
}

fn default_ip6tables() -> String {
    "ip6tables".to_string()
}

fn default_ebtables() -> String {
    "ebtables".to_string()
}

fn default_wait() -> bool {
    true
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            iptables: default_iptables(),
            ip6tables: default_ip6tables(),
            ebtables: default_ebtables(),
            wait: default_wait(),
        }
    }
}

impl BackendConfig {
    /// Base command for a family, `-save`/`-restore` variants derive from it
    pub fn tool(&self, family: Family) -> &str {
        match family {
            Family::Ipv4 => &self.iptables,
            Family::Ipv6 => &self.ip6tables,
            Family::Eb => &self.ebtables,
        }
    }
}

impl DaemonConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read daemon config from {:?}", path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Load the file when it exists, fall back to defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub ipv: Family,
    pub table: String,
    pub chain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleEntry {
    pub ipv: Family,
    pub table: String,
    pub chain: String,
    #[serde(default)]
    pub priority: i32,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassthroughEntry {
    pub ipv: Family,
    pub args: Vec<String>,
}

/// Permanent direct configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectConfig {
    #[serde(default)]
    pub chains: Vec<ChainEntry>,
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
    #[serde(default)]
    pub passthroughs: Vec<PassthroughEntry>,
}

impl DirectConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read direct config from {:?}", path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {:?}", path))
    }
}
