use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::lockdown::WhitelistMatcher;

/// Lockdown whitelist as stored in its YAML file.
///
/// Contexts, uids and users match exactly. A command entry ending in `*`
/// matches any command line starting with the text before the `*`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockdownWhitelist {
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub uids: Vec<u32>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
}

impl LockdownWhitelist {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read lockdown whitelist from {:?}", path))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse lockdown whitelist {:?}", path))
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
            && self.uids.is_empty()
            && self.users.is_empty()
            && self.commands.is_empty()
    }
}

impl WhitelistMatcher for LockdownWhitelist {
    fn match_context(&self, context: &str) -> bool {
        self.contexts.iter().any(|c| c == context)
    }

    fn match_uid(&self, uid: u32) -> bool {
        self.uids.contains(&uid)
    }

    fn match_user(&self, user: &str) -> bool {
        self.users.iter().any(|u| u == user)
    }

    fn match_command(&self, command: &str) -> bool {
        self.commands.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => command.starts_with(prefix),
            None => pattern == command,
        })
    }
}
