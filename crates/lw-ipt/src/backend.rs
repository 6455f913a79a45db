use lw_core::{Backend, BackendConfig, BackendError, Family, TableKey, TableState};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::restore::{ManagedChains, render_table};

/// Applies direct tables with `iptables-restore --noflush` and friends
pub struct IptablesBackend {
    config: BackendConfig,
    managed: Mutex<HashMap<TableKey, ManagedChains>>,
}

impl IptablesBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            managed: Mutex::new(HashMap::new()),
        }
    }

    /// Chains owned in a table after the last successful apply
    pub async fn managed_chains(&self, family: Family, table: &str) -> ManagedChains {
        self.managed
            .lock()
            .await
            .get(&TableKey::new(family, table))
            .cloned()
            .unwrap_or_default()
    }

    /// Current live contents of a table, as printed by `<tool>-save`
    pub async fn save_table(&self, family: Family, table: &str) -> Result<String, BackendError> {
        let program = format!("{}-save", self.config.tool(family));
        let args = vec!["-t".to_string(), table.to_string()];
        self.exec(&program, &args, None).await
    }

    /// Jumps left live by an earlier run, so they are not inserted twice.
    /// `None` when the table could not be read; the next apply tries again.
    async fn seed_managed(&self, family: Family, table: &str) -> Option<ManagedChains> {
        match self.save_table(family, table).await {
            Ok(save) => {
                let seeded = ManagedChains::from_save(family, &save);
                if !seeded.hooked_builtins.is_empty() {
                    debug!(
                        family = %family,
                        table,
                        hooked = ?seeded.hooked_builtins,
                        "found live direct jumps"
                    );
                }
                Some(seeded)
            }
            Err(e) => {
                warn!(
                    family = %family,
                    table,
                    "could not snapshot table before apply: {}",
                    e
                );
                None
            }
        }
    }

    fn wait_args(&self, family: Family) -> Vec<String> {
        // ebtables has no -w
        if self.config.wait && family != Family::Eb {
            vec!["-w".to_string()]
        } else {
            vec![]
        }
    }

    async fn exec(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<String, BackendError> {
        let secs = self.config.timeout_secs;
        debug!(program, args = ?args, "running backend command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::new(format!("Failed to spawn {}: {}", program, e)))?;

        let pipe = child.stdin.take();
        let run = async move {
            if let (Some(mut pipe), Some(input)) = (pipe, stdin) {
                pipe.write_all(input.as_bytes()).await?;
                drop(pipe);
            }
            let output = child.wait_with_output().await?;
            Ok::<_, std::io::Error>(output)
        };

        let output = match timeout(Duration::from_secs(secs), run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(BackendError::new(format!(
                    "Failed to communicate with {}: {}",
                    program, e
                )));
            }
            Err(_) => return Err(BackendError::timeout(program, secs)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(BackendError::exit(program, output.status.code(), stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Backend for IptablesBackend {
    async fn apply(
        &self,
        family: Family,
        table: &str,
        state: &TableState,
    ) -> Result<(), BackendError> {
        let key = TableKey::new(family, table);
        let mut managed = self.managed.lock().await;

        if !managed.contains_key(&key) {
            if let Some(seeded) = self.seed_managed(family, table).await {
                managed.insert(key.clone(), seeded);
            }
        }

        let plan = render_table(family, table, state, managed.get(&key));
        let program = format!("{}-restore", self.config.tool(family));
        let mut args = self.wait_args(family);
        args.push("--noflush".to_string());

        self.exec(&program, &args, Some(&plan.payload)).await?;

        info!(
            family = %family,
            table,
            chains = state.chains().len(),
            rules = state.rule_count(),
            "applied direct table"
        );
        managed.insert(key, plan.managed);
        Ok(())
    }

    async fn run(&self, family: Family, args: &[String]) -> Result<String, BackendError> {
        let program = self.config.tool(family);
        let mut full = self.wait_args(family);
        full.extend(args.iter().cloned());
        self.exec(program, &full, None).await
    }
}
