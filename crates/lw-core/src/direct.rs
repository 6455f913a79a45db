use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::{ChainEntry, DirectConfig, RuleEntry};
use crate::error::{Error, Result};
use crate::family::Family;
use crate::store::{ChainRuleStore, Rule, TableKey, TableState};

/// Direct chains and rules, mirrored into a backend after every change.
///
/// Mutations run check-then-mutate-then-apply under the store's write lock,
/// so two identical concurrent requests can never both succeed and readers
/// never see a mutation whose backend apply is still in flight.
pub struct DirectEngine<B> {
    store: RwLock<ChainRuleStore>,
    backend: B,
}

impl<B: Backend> DirectEngine<B> {
    pub fn new(backend: B) -> Self {
        Self {
            store: RwLock::new(ChainRuleStore::new()),
            backend,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn add_chain(&self, family: Family, table: &str, chain: &str) -> Result<()> {
        let mut store = self.store.write().await;
        store.add_chain(family, table, chain)?;
        debug!(family = %family, table, chain, "chain added");
        self.apply_table(&store, &TableKey::new(family, table)).await
    }

    pub async fn remove_chain(&self, family: Family, table: &str, chain: &str) -> Result<()> {
        let mut store = self.store.write().await;
        store.remove_chain(family, table, chain)?;
        debug!(family = %family, table, chain, "chain removed");
        self.apply_table(&store, &TableKey::new(family, table)).await
    }

    pub async fn query_chain(&self, family: Family, table: &str, chain: &str) -> bool {
        self.store.read().await.query_chain(family, table, chain)
    }

    pub async fn get_chains(&self, family: Family, table: &str) -> Vec<String> {
        self.store.read().await.get_chains(family, table)
    }

    pub async fn get_all_chains(&self) -> Vec<ChainEntry> {
        self.store.read().await.get_all_chains()
    }

    pub async fn add_rule(
        &self,
        family: Family,
        table: &str,
        chain: &str,
        priority: i32,
        args: &[String],
    ) -> Result<()> {
        let mut store = self.store.write().await;
        store.add_rule(family, table, chain, priority, args)?;
        debug!(family = %family, table, chain, priority, args = ?args, "rule added");
        self.apply_table(&store, &TableKey::new(family, table)).await
    }

    pub async fn remove_rule(
        &self,
        family: Family,
        table: &str,
        chain: &str,
        priority: i32,
        args: &[String],
    ) -> Result<()> {
        let mut store = self.store.write().await;
        store.remove_rule(family, table, chain, priority, args)?;
        debug!(family = %family, table, chain, priority, args = ?args, "rule removed");
        self.apply_table(&store, &TableKey::new(family, table)).await
    }

    pub async fn remove_rules(&self, family: Family, table: &str, chain: &str) -> Result<()> {
        let mut store = self.store.write().await;
        let removed = store.remove_rules(family, table, chain)?;
        if removed == 0 {
            return Ok(());
        }
        debug!(family = %family, table, chain, removed, "rules flushed");
        self.apply_table(&store, &TableKey::new(family, table)).await
    }

    pub async fn query_rule(
        &self,
        family: Family,
        table: &str,
        chain: &str,
        priority: i32,
        args: &[String],
    ) -> bool {
        self.store
            .read()
            .await
            .query_rule(family, table, chain, priority, args)
    }

    pub async fn get_rules(&self, family: Family, table: &str, chain: &str) -> Vec<Rule> {
        self.store.read().await.get_rules(family, table, chain)
    }

    pub async fn get_all_rules(&self) -> Vec<RuleEntry> {
        self.store.read().await.get_all_rules()
    }

    /// Run a raw command against the backend. Nothing is recorded in the store.
    pub async fn passthrough(&self, family: Family, args: &[String]) -> Result<String> {
        if args.is_empty() {
            return Err(Error::InvalidArgument(
                "passthrough arguments must not be empty".into(),
            ));
        }
        debug!(family = %family, args = ?args, "passthrough");
        self.backend.run(family, args).await.map_err(|err| {
            warn!(family = %family, "passthrough failed: {}", err);
            Error::from(err)
        })
    }

    /// Re-apply every table, family by family, table by table.
    ///
    /// Every table is attempted; the first failure is returned.
    pub async fn reload(&self) -> Result<()> {
        let store = self.store.write().await;
        let tables = store.table_keys();
        info!(tables = tables.len(), "reloading direct configuration");
        self.apply_tables(&store, &tables).await
    }

    /// Replace the store with a permanent configuration, apply it, then run
    /// its passthroughs in order.
    ///
    /// The configuration is validated in full before the live store changes.
    pub async fn load(&self, config: &DirectConfig) -> Result<()> {
        let next = ChainRuleStore::from_config(config)?;
        if let Some(entry) = config.passthroughs.iter().find(|p| p.args.is_empty()) {
            return Err(Error::InvalidArgument(format!(
                "empty {} passthrough in direct configuration",
                entry.ipv
            )));
        }

        let mut store = self.store.write().await;
        let mut tables = store.table_keys();
        for key in next.table_keys() {
            if !tables.contains(&key) {
                tables.push(key);
            }
        }
        tables.sort();
        *store = next;

        info!(
            chains = config.chains.len(),
            rules = config.rules.len(),
            passthroughs = config.passthroughs.len(),
            "loading direct configuration"
        );
        let applied = self.apply_tables(&store, &tables).await;

        for entry in &config.passthroughs {
            self.passthrough(entry.ipv, &entry.args).await?;
        }

        applied
    }

    /// Forget every chain and rule and tear them down in the backend
    pub async fn cleanup(&self) -> Result<()> {
        let mut store = self.store.write().await;
        let tables = store.table_keys();
        store.clear();
        info!(tables = tables.len(), "cleaning up direct configuration");
        self.apply_tables(&store, &tables).await
    }

    async fn apply_tables(&self, store: &ChainRuleStore, tables: &[TableKey]) -> Result<()> {
        let mut first_error = None;
        for key in tables {
            if let Err(err) = self.apply_table(store, key).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn apply_table(&self, store: &ChainRuleStore, key: &TableKey) -> Result<()> {
        let empty = TableState::default();
        let state = store.table(key).unwrap_or(&empty);
        self.backend
            .apply(key.family, &key.table, state)
            .await
            .map_err(|err| {
                warn!(
                    family = %key.family,
                    table = %key.table,
                    "backend apply failed, store and live filter diverge until reload: {}",
                    err
                );
                Error::from(err)
            })
    }
}
