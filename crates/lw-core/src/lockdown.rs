use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::whitelist::LockdownWhitelist;

/// Pattern sets consulted by access checks
pub trait WhitelistMatcher: Send + Sync {
    fn match_context(&self, context: &str) -> bool;
    fn match_uid(&self, uid: u32) -> bool;
    fn match_user(&self, user: &str) -> bool;
    fn match_command(&self, command: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockdownState {
    #[default]
    Disabled,
    Enabled,
}

/// A single whitelist criterion with its value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessCheck {
    Context(String),
    Uid(u32),
    User(String),
    Command(String),
}

impl AccessCheck {
    /// Parse a wire key/value pair. Unknown keys and ill-typed values yield `None`.
    pub fn from_key_value(key: &str, value: &Value) -> Option<Self> {
        match key {
            "context" => value.as_str().map(|v| AccessCheck::Context(v.to_string())),
            "uid" => {
                let uid = match value {
                    Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
                    Value::String(s) => s.parse().ok(),
                    _ => None,
                };
                uid.map(AccessCheck::Uid)
            }
            "user" => value.as_str().map(|v| AccessCheck::User(v.to_string())),
            "command" => value.as_str().map(|v| AccessCheck::Command(v.to_string())),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            AccessCheck::Context(_) => "context",
            AccessCheck::Uid(_) => "uid",
            AccessCheck::User(_) => "user",
            AccessCheck::Command(_) => "command",
        }
    }
}

/// Lockdown mode and the whitelist that gates callers while it is on
pub struct LockdownPolicy {
    state: RwLock<LockdownState>,
    whitelist: RwLock<Arc<dyn WhitelistMatcher>>,
}

impl LockdownPolicy {
    pub fn new(whitelist: Arc<dyn WhitelistMatcher>) -> Self {
        Self {
            state: RwLock::new(LockdownState::Disabled),
            whitelist: RwLock::new(whitelist),
        }
    }

    pub async fn enable_lockdown(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state == LockdownState::Enabled {
            return Err(Error::AlreadyEnabled("enable_lockdown()".into()));
        }
        *state = LockdownState::Enabled;
        info!("lockdown enabled");
        Ok(())
    }

    pub async fn disable_lockdown(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state == LockdownState::Disabled {
            return Err(Error::NotEnabled("disable_lockdown()".into()));
        }
        *state = LockdownState::Disabled;
        info!("lockdown disabled");
        Ok(())
    }

    pub async fn query_lockdown(&self) -> bool {
        *self.state.read().await == LockdownState::Enabled
    }

    pub async fn state(&self) -> LockdownState {
        *self.state.read().await
    }

    /// Whitelist lookup for one criterion. Does not look at the lockdown state.
    pub async fn access_check(&self, check: &AccessCheck) -> bool {
        let whitelist = self.whitelist.read().await;
        let matched = match check {
            AccessCheck::Context(context) => {
                debug!("Doing access check for context \"{}\"", context);
                whitelist.match_context(context)
            }
            AccessCheck::Uid(uid) => {
                debug!("Doing access check for uid {}", uid);
                whitelist.match_uid(*uid)
            }
            AccessCheck::User(user) => {
                debug!("Doing access check for user \"{}\"", user);
                whitelist.match_user(user)
            }
            AccessCheck::Command(command) => {
                debug!("Doing access check for command \"{}\"", command);
                whitelist.match_command(command)
            }
        };
        if matched {
            trace!("{} matches", check.key());
        }
        matched
    }

    /// String-keyed access check; unknown keys never match
    pub async fn access_check_raw(&self, key: &str, value: &Value) -> bool {
        match AccessCheck::from_key_value(key, value) {
            Some(check) => self.access_check(&check).await,
            None => {
                debug!("access check for unknown criterion \"{}\" denied", key);
                false
            }
        }
    }

    pub async fn replace_whitelist(&self, whitelist: Arc<dyn WhitelistMatcher>) {
        *self.whitelist.write().await = whitelist;
    }

    /// Back to `Disabled` with an empty whitelist
    pub async fn cleanup(&self) {
        *self.state.write().await = LockdownState::Disabled;
        *self.whitelist.write().await = Arc::new(LockdownWhitelist::default());
    }
}

impl Default for LockdownPolicy {
    fn default() -> Self {
        Self::new(Arc::new(LockdownWhitelist::default()))
    }
}
