use std::future::Future;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::family::Family;
use crate::store::{Rule, TableState};

/// Failure reported by the packet-filter backend
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stderr: None,
            exit_code: None,
            timed_out: false,
        }
    }

    pub fn exit(program: &str, exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        let status = exit_code
            .map(|code| format!("exit status {}", code))
            .unwrap_or_else(|| "terminated by signal".to_string());
        Self {
            message: format!("{} failed ({}): {}", program, status, stderr.trim()),
            stderr: Some(stderr),
            exit_code,
            timed_out: false,
        }
    }

    pub fn timeout(program: &str, secs: u64) -> Self {
        Self {
            message: format!("{} timed out after {}s", program, secs),
            stderr: None,
            exit_code: None,
            timed_out: true,
        }
    }
}

/// Renders store state into the live packet filter
pub trait Backend: Send + Sync {
    /// Replace the live contents of one family+table with `state`.
    /// Applying an unchanged state again must leave the filter unchanged.
    fn apply(
        &self,
        family: Family,
        table: &str,
        state: &TableState,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Run a raw filter command, returning its standard output
    fn run(
        &self,
        family: Family,
        args: &[String],
    ) -> impl Future<Output = Result<String, BackendError>> + Send;
}

/// Snapshot of one `apply` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTable {
    pub family: Family,
    pub table: String,
    pub chains: Vec<String>,
    pub rules: Vec<(String, Vec<Rule>)>,
}

/// Backend that only records what it was asked to do (dry runs)
#[derive(Debug, Default)]
pub struct MemoryBackend {
    applied: Mutex<Vec<AppliedTable>>,
    commands: Mutex<Vec<(Family, Vec<String>)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn applied(&self) -> Vec<AppliedTable> {
        self.applied.lock().await.clone()
    }

    /// Most recent apply for a family+table
    pub async fn last_applied(&self, family: Family, table: &str) -> Option<AppliedTable> {
        self.applied
            .lock()
            .await
            .iter()
            .rev()
            .find(|a| a.family == family && a.table == table)
            .cloned()
    }

    pub async fn commands(&self) -> Vec<(Family, Vec<String>)> {
        self.commands.lock().await.clone()
    }
}

impl Backend for MemoryBackend {
    async fn apply(
        &self,
        family: Family,
        table: &str,
        state: &TableState,
    ) -> Result<(), BackendError> {
        debug!(
            family = %family,
            table,
            chains = state.chains().len(),
            rules = state.rule_count(),
            "recording table apply"
        );
        self.applied.lock().await.push(AppliedTable {
            family,
            table: table.to_string(),
            chains: state.chains().to_vec(),
            rules: state
                .rule_chains()
                .map(|(chain, rules)| (chain.to_string(), rules.to_vec()))
                .collect(),
        });
        Ok(())
    }

    async fn run(&self, family: Family, args: &[String]) -> Result<String, BackendError> {
        debug!(family = %family, args = ?args, "recording passthrough");
        self.commands.lock().await.push((family, args.to_vec()));
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_error_carries_status_and_stderr() {
        let err = BackendError::exit(
            "iptables",
            Some(2),
            "iptables: No chain/target/match by that name.\n",
        );
        assert_eq!(err.exit_code, Some(2));
        assert!(err.message.contains("exit status 2"));
        assert!(err.stderr.as_deref().unwrap().contains("No chain"));
        assert!(!err.timed_out);
    }

    #[test]
    fn timeout_error_is_flagged() {
        let err = BackendError::timeout("iptables-restore", 10);
        assert!(err.timed_out);
        assert!(err.to_string().contains("10s"));
    }

    #[tokio::test]
    async fn memory_backend_records_calls() {
        let backend = MemoryBackend::new();
        let state = TableState::default();

        backend.apply(Family::Ipv4, "filter", &state).await.unwrap();
        backend
            .run(Family::Ipv6, &["-L".to_string()])
            .await
            .unwrap();

        let applied = backend.last_applied(Family::Ipv4, "filter").await.unwrap();
        assert!(applied.chains.is_empty());
        assert_eq!(backend.commands().await, vec![(Family::Ipv6, vec!["-L".to_string()])]);
        assert!(backend.last_applied(Family::Ipv6, "filter").await.is_none());
    }
}
