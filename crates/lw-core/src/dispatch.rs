use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::direct::DirectEngine;
use crate::error::{Error, ErrorKind, Result};
use crate::family::Family;
use crate::lockdown::{AccessCheck, LockdownPolicy};

/// Credentials of the remote caller, as reported by the transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
}

impl Caller {
    /// Whitelist checks in the order lockdown evaluates them
    pub fn access_checks(&self) -> Vec<AccessCheck> {
        let mut checks = Vec::new();
        if let Some(context) = &self.context {
            checks.push(AccessCheck::Context(context.clone()));
        }
        if let Some(uid) = self.uid {
            checks.push(AccessCheck::Uid(uid));
        }
        if let Some(user) = &self.user {
            checks.push(AccessCheck::User(user.clone()));
        }
        if let Some(command) = &self.command {
            checks.push(AccessCheck::Command(command.clone()));
        }
        checks
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Request {
    AddChain {
        ipv: Family,
        table: String,
        chain: String,
    },
    RemoveChain {
        ipv: Family,
        table: String,
        chain: String,
    },
    QueryChain {
        ipv: Family,
        table: String,
        chain: String,
    },
    GetChains {
        ipv: Family,
        table: String,
    },
    GetAllChains,
    AddRule {
        ipv: Family,
        table: String,
        chain: String,
        priority: i32,
        args: Vec<String>,
    },
    RemoveRule {
        ipv: Family,
        table: String,
        chain: String,
        priority: i32,
        args: Vec<String>,
    },
    RemoveRules {
        ipv: Family,
        table: String,
        chain: String,
    },
    QueryRule {
        ipv: Family,
        table: String,
        chain: String,
        priority: i32,
        args: Vec<String>,
    },
    GetRules {
        ipv: Family,
        table: String,
        chain: String,
    },
    GetAllRules,
    Passthrough {
        ipv: Family,
        args: Vec<String>,
    },
    Reload,
    EnableLockdown,
    DisableLockdown,
    QueryLockdown,
    AccessCheck {
        key: String,
        value: Value,
    },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::AddChain { .. } => "addChain",
            Request::RemoveChain { .. } => "removeChain",
            Request::QueryChain { .. } => "queryChain",
            Request::GetChains { .. } => "getChains",
            Request::GetAllChains => "getAllChains",
            Request::AddRule { .. } => "addRule",
            Request::RemoveRule { .. } => "removeRule",
            Request::RemoveRules { .. } => "removeRules",
            Request::QueryRule { .. } => "queryRule",
            Request::GetRules { .. } => "getRules",
            Request::GetAllRules => "getAllRules",
            Request::Passthrough { .. } => "passthrough",
            Request::Reload => "reload",
            Request::EnableLockdown => "enableLockdown",
            Request::DisableLockdown => "disableLockdown",
            Request::QueryLockdown => "queryLockdown",
            Request::AccessCheck { .. } => "accessCheck",
        }
    }

    /// Requests that change firewall state and are gated while lockdown is on
    pub fn is_gated(&self) -> bool {
        matches!(
            self,
            Request::AddChain { .. }
                | Request::RemoveChain { .. }
                | Request::AddRule { .. }
                | Request::RemoveRule { .. }
                | Request::RemoveRules { .. }
                | Request::Passthrough { .. }
                | Request::Reload
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Self {
            ok: true,
            result: if result.is_null() { None } else { Some(result) },
            error: None,
        }
    }

    pub fn error(err: &Error) -> Self {
        let (exit_code, stderr) = match err {
            Error::Backend(backend) => (backend.exit_code, backend.stderr.clone()),
            _ => (None, None),
        };
        Self {
            ok: false,
            result: None,
            error: Some(ErrorBody {
                kind: err.kind(),
                message: err.to_string(),
                exit_code,
                stderr,
            }),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Routes requests to the direct engine or the lockdown policy
pub struct Dispatcher<B> {
    direct: Arc<DirectEngine<B>>,
    lockdown: Arc<LockdownPolicy>,
}

impl<B> Clone for Dispatcher<B> {
    fn clone(&self) -> Self {
        Self {
            direct: self.direct.clone(),
            lockdown: self.lockdown.clone(),
        }
    }
}

impl<B: Backend> Dispatcher<B> {
    pub fn new(direct: Arc<DirectEngine<B>>, lockdown: Arc<LockdownPolicy>) -> Self {
        Self { direct, lockdown }
    }

    pub fn direct(&self) -> &DirectEngine<B> {
        &self.direct
    }

    pub fn lockdown(&self) -> &LockdownPolicy {
        &self.lockdown
    }

    pub async fn handle(&self, caller: &Caller, request: Request) -> Response {
        let method = request.method();
        match self.execute(caller, request).await {
            Ok(result) => Response::ok(result),
            Err(err) => {
                match err.kind() {
                    ErrorKind::BackendError => warn!(method, "request failed: {}", err),
                    _ => debug!(method, "request rejected: {}", err),
                }
                Response::error(&err)
            }
        }
    }

    async fn execute(&self, caller: &Caller, request: Request) -> Result<Value> {
        if request.is_gated() {
            self.authorize(caller, request.method()).await?;
        }

        let direct = &self.direct;
        let value = match request {
            Request::AddChain { ipv, table, chain } => {
                direct.add_chain(ipv, &table, &chain).await?;
                Value::Null
            }
            Request::RemoveChain { ipv, table, chain } => {
                direct.remove_chain(ipv, &table, &chain).await?;
                Value::Null
            }
            Request::QueryChain { ipv, table, chain } => {
                json!(direct.query_chain(ipv, &table, &chain).await)
            }
            Request::GetChains { ipv, table } => json!(direct.get_chains(ipv, &table).await),
            Request::GetAllChains => json!(direct.get_all_chains().await),
            Request::AddRule {
                ipv,
                table,
                chain,
                priority,
                args,
            } => {
                direct.add_rule(ipv, &table, &chain, priority, &args).await?;
                Value::Null
            }
            Request::RemoveRule {
                ipv,
                table,
                chain,
                priority,
                args,
            } => {
                direct.remove_rule(ipv, &table, &chain, priority, &args).await?;
                Value::Null
            }
            Request::RemoveRules { ipv, table, chain } => {
                direct.remove_rules(ipv, &table, &chain).await?;
                Value::Null
            }
            Request::QueryRule {
                ipv,
                table,
                chain,
                priority,
                args,
            } => json!(direct.query_rule(ipv, &table, &chain, priority, &args).await),
            Request::GetRules { ipv, table, chain } => {
                json!(direct.get_rules(ipv, &table, &chain).await)
            }
            Request::GetAllRules => json!(direct.get_all_rules().await),
            Request::Passthrough { ipv, args } => json!(direct.passthrough(ipv, &args).await?),
            Request::Reload => {
                direct.reload().await?;
                Value::Null
            }
            Request::EnableLockdown => {
                self.lockdown.enable_lockdown().await?;
                Value::Null
            }
            Request::DisableLockdown => {
                self.lockdown.disable_lockdown().await?;
                Value::Null
            }
            Request::QueryLockdown => json!(self.lockdown.query_lockdown().await),
            Request::AccessCheck { key, value } => {
                json!(self.lockdown.access_check_raw(&key, &value).await)
            }
        };
        Ok(value)
    }

    /// While lockdown is enabled the caller must match at least one criterion
    async fn authorize(&self, caller: &Caller, method: &str) -> Result<()> {
        if !self.lockdown.query_lockdown().await {
            return Ok(());
        }
        for check in caller.access_checks() {
            if self.lockdown.access_check(&check).await {
                return Ok(());
            }
        }
        Err(Error::AccessDenied(format!("lockdown is enabled, {} not allowed", method)))
    }
}
