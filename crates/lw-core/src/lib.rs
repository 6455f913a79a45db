//! Direct rule engine and lockdown policy for the lockwall daemon.
//!
//! - [`store`]: priority-ordered chains and rules per family and table
//! - [`direct`]: the store composed with a [`backend::Backend`], plus passthrough and reload
//! - [`lockdown`]: the lockdown state machine and whitelist access checks
//! - [`dispatch`]: transport-agnostic request routing with lockdown gating

pub mod backend;
pub mod config;
pub mod direct;
pub mod dispatch;
pub mod error;
pub mod family;
pub mod lockdown;
pub mod store;
pub mod whitelist;

pub use backend::{AppliedTable, Backend, BackendError, MemoryBackend};
pub use config::{
    BackendConfig, ChainEntry, DEFAULT_CONFIG_PATH, DaemonConfig, DirectConfig, PassthroughEntry,
    RuleEntry,
};
pub use direct::DirectEngine;
pub use dispatch::{Caller, Dispatcher, ErrorBody, Request, Response};
pub use error::{Error, ErrorKind, Result};
pub use family::Family;
pub use lockdown::{AccessCheck, LockdownPolicy, LockdownState, WhitelistMatcher};
pub use store::{ChainRuleStore, Rule, TableKey, TableState};
pub use whitelist::LockdownWhitelist;
