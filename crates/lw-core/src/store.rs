use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{ChainEntry, DirectConfig, RuleEntry};
use crate::error::{Error, Result};
use crate::family::Family;

/// iptables rejects chain names longer than this many bytes
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// A rule inside a chain. Argument vectors compare by exact token sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub priority: i32,
    pub args: Vec<String>,
}

impl Rule {
    pub fn new(priority: i32, args: Vec<String>) -> Self {
        Self { priority, args }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableKey {
    pub family: Family,
    pub table: String,
}

impl TableKey {
    pub fn new(family: Family, table: &str) -> Self {
        Self {
            family,
            table: table.to_string(),
        }
    }
}

/// Chains and rules of one family+table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableState {
    /// User-defined chains, insertion order
    chains: Vec<String>,
    /// Rules per chain, kept sorted by priority with insertion order on ties
    rules: BTreeMap<String, Vec<Rule>>,
}

impl TableState {
    pub fn chains(&self) -> &[String] {
        &self.chains
    }

    pub fn rules(&self, chain: &str) -> &[Rule] {
        self.rules.get(chain).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Non-empty rule lists, by chain name
    pub fn rule_chains(&self) -> impl Iterator<Item = (&str, &[Rule])> {
        self.rules
            .iter()
            .filter(|(_, rules)| !rules.is_empty())
            .map(|(chain, rules)| (chain.as_str(), rules.as_slice()))
    }

    pub fn has_chain(&self, chain: &str) -> bool {
        self.chains.iter().any(|c| c == chain)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty() && self.rule_count() == 0
    }

    fn insert_rule(&mut self, chain: &str, rule: Rule) {
        let rules = self.rules.entry(chain.to_string()).or_default();
        let pos = rules.partition_point(|r| r.priority <= rule.priority);
        rules.insert(pos, rule);
    }
}

/// In-memory source of truth for direct chains and rules
#[derive(Debug, Clone, Default)]
pub struct ChainRuleStore {
    tables: BTreeMap<TableKey, TableState>,
}

impl ChainRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a permanent configuration, rejecting it whole on
    /// the first invalid or duplicate entry
    pub fn from_config(config: &DirectConfig) -> Result<Self> {
        let mut store = Self::new();
        for entry in &config.chains {
            store.add_chain(entry.ipv, &entry.table, &entry.chain)?;
        }
        for entry in &config.rules {
            store.add_rule(entry.ipv, &entry.table, &entry.chain, entry.priority, &entry.args)?;
        }
        Ok(store)
    }

    pub fn add_chain(&mut self, family: Family, table: &str, chain: &str) -> Result<()> {
        validate_table(table)?;
        validate_chain(chain)?;
        if family.is_builtin_chain(chain) {
            return Err(Error::InvalidArgument(format!(
                "'{}' is a built-in {} chain",
                chain, family
            )));
        }

        let state = self.tables.entry(TableKey::new(family, table)).or_default();
        if state.has_chain(chain) {
            return Err(Error::AlreadyEnabled(format!(
                "chain '{}' already exists in {} {}",
                chain, family, table
            )));
        }

        state.chains.push(chain.to_string());
        Ok(())
    }

    /// Removes the chain together with every rule keyed to it
    pub fn remove_chain(&mut self, family: Family, table: &str, chain: &str) -> Result<()> {
        validate_table(table)?;
        validate_chain(chain)?;

        let state = self
            .tables
            .get_mut(&TableKey::new(family, table))
            .filter(|state| state.has_chain(chain))
            .ok_or_else(|| {
                Error::NotEnabled(format!(
                    "chain '{}' does not exist in {} {}",
                    chain, family, table
                ))
            })?;

        state.chains.retain(|c| c != chain);
        state.rules.remove(chain);
        Ok(())
    }

    pub fn query_chain(&self, family: Family, table: &str, chain: &str) -> bool {
        self.table(&TableKey::new(family, table))
            .is_some_and(|state| state.has_chain(chain))
    }

    pub fn get_chains(&self, family: Family, table: &str) -> Vec<String> {
        self.table(&TableKey::new(family, table))
            .map(|state| state.chains.clone())
            .unwrap_or_default()
    }

    /// Built-in chains may be addressed without a prior `add_chain`
    pub fn add_rule(
        &mut self,
        family: Family,
        table: &str,
        chain: &str,
        priority: i32,
        args: &[String],
    ) -> Result<()> {
        validate_table(table)?;
        validate_chain(chain)?;
        validate_args(args)?;

        let state = self.tables.entry(TableKey::new(family, table)).or_default();
        if contains_rule(state.rules(chain), priority, args) {
            return Err(Error::AlreadyEnabled(format!(
                "rule '{}' (priority {}) already exists in {} {} {}",
                args.join(" "),
                priority,
                family,
                table,
                chain
            )));
        }

        state.insert_rule(chain, Rule::new(priority, args.to_vec()));
        Ok(())
    }

    pub fn remove_rule(
        &mut self,
        family: Family,
        table: &str,
        chain: &str,
        priority: i32,
        args: &[String],
    ) -> Result<()> {
        validate_table(table)?;
        validate_chain(chain)?;

        let not_enabled = || {
            Error::NotEnabled(format!(
                "rule '{}' (priority {}) does not exist in {} {} {}",
                args.join(" "),
                priority,
                family,
                table,
                chain
            ))
        };

        let rules = self
            .tables
            .get_mut(&TableKey::new(family, table))
            .and_then(|state| state.rules.get_mut(chain))
            .ok_or_else(not_enabled)?;

        let pos = rules
            .iter()
            .position(|r| r.priority == priority && r.args == args)
            .ok_or_else(not_enabled)?;

        rules.remove(pos);
        Ok(())
    }

    pub fn query_rule(
        &self,
        family: Family,
        table: &str,
        chain: &str,
        priority: i32,
        args: &[String],
    ) -> bool {
        self.table(&TableKey::new(family, table))
            .is_some_and(|state| contains_rule(state.rules(chain), priority, args))
    }

    pub fn get_rules(&self, family: Family, table: &str, chain: &str) -> Vec<Rule> {
        self.table(&TableKey::new(family, table))
            .map(|state| state.rules(chain).to_vec())
            .unwrap_or_default()
    }

    /// Drops every rule of a chain, returning how many were removed
    pub fn remove_rules(&mut self, family: Family, table: &str, chain: &str) -> Result<usize> {
        validate_table(table)?;
        validate_chain(chain)?;

        let removed = self
            .tables
            .get_mut(&TableKey::new(family, table))
            .and_then(|state| state.rules.remove(chain))
            .map(|rules| rules.len())
            .unwrap_or(0);

        Ok(removed)
    }

    pub fn get_all_chains(&self) -> Vec<ChainEntry> {
        self.tables
            .iter()
            .flat_map(|(key, state)| {
                state.chains.iter().map(move |chain| ChainEntry {
                    ipv: key.family,
                    table: key.table.clone(),
                    chain: chain.clone(),
                })
            })
            .collect()
    }

    pub fn get_all_rules(&self) -> Vec<RuleEntry> {
        self.tables
            .iter()
            .flat_map(|(key, state)| {
                state.rule_chains().flat_map(move |(chain, rules)| {
                    rules.iter().map(move |rule| RuleEntry {
                        ipv: key.family,
                        table: key.table.clone(),
                        chain: chain.to_string(),
                        priority: rule.priority,
                        args: rule.args.clone(),
                    })
                })
            })
            .collect()
    }

    pub fn table(&self, key: &TableKey) -> Option<&TableState> {
        self.tables.get(key)
    }

    /// Every table ever touched, ordered by family then table name
    pub fn tables(&self) -> impl Iterator<Item = (&TableKey, &TableState)> {
        self.tables.iter()
    }

    pub fn table_keys(&self) -> Vec<TableKey> {
        self.tables.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(TableState::is_empty)
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }
}

fn contains_rule(rules: &[Rule], priority: i32, args: &[String]) -> bool {
    rules.iter().any(|r| r.priority == priority && r.args == args)
}

fn validate_table(table: &str) -> Result<()> {
    if table.is_empty() {
        return Err(Error::InvalidArgument("table name must not be empty".into()));
    }
    Ok(())
}

fn validate_chain(chain: &str) -> Result<()> {
    if chain.is_empty() {
        return Err(Error::InvalidArgument("chain name must not be empty".into()));
    }
    if chain.len() > MAX_CHAIN_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "chain name '{}' exceeds {} bytes",
            chain, MAX_CHAIN_NAME_LEN
        )));
    }
    if chain.chars().any(char::is_whitespace) {
        return Err(Error::InvalidArgument(format!(
            "chain name '{}' contains whitespace",
            chain
        )));
    }
    Ok(())
}

fn validate_args(args: &[String]) -> Result<()> {
    if args.is_empty() {
        return Err(Error::InvalidArgument("rule arguments must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn args(spec: &str) -> Vec<String> {
        spec.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn add_chain_twice_is_already_enabled() {
        let mut store = ChainRuleStore::new();
        store.add_chain(Family::Ipv4, "filter", "X").unwrap();

        let err = store.add_chain(Family::Ipv4, "filter", "X").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyEnabled);
        assert_eq!(store.get_chains(Family::Ipv4, "filter"), vec!["X"]);
    }

    #[test]
    fn chains_are_scoped_by_family_and_table() {
        let mut store = ChainRuleStore::new();
        store.add_chain(Family::Ipv4, "filter", "X").unwrap();
        store.add_chain(Family::Ipv6, "filter", "X").unwrap();
        store.add_chain(Family::Ipv4, "nat", "X").unwrap();

        assert!(store.query_chain(Family::Ipv6, "filter", "X"));
        assert!(!store.query_chain(Family::Eb, "filter", "X"));
        assert_eq!(store.get_all_chains().len(), 3);
    }

    #[test]
    fn get_chains_keeps_insertion_order() {
        let mut store = ChainRuleStore::new();
        for name in ["zeta", "alpha", "mid"] {
            store.add_chain(Family::Ipv4, "filter", name).unwrap();
        }
        assert_eq!(
            store.get_chains(Family::Ipv4, "filter"),
            vec!["zeta", "alpha", "mid"]
        );
    }

    #[test]
    fn remove_missing_chain_is_not_enabled() {
        let mut store = ChainRuleStore::new();
        store.add_chain(Family::Ipv4, "filter", "X").unwrap();
        store.remove_chain(Family::Ipv4, "filter", "X").unwrap();

        let err = store.remove_chain(Family::Ipv4, "filter", "X").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotEnabled);
        assert!(!store.query_chain(Family::Ipv4, "filter", "X"));
    }

    #[test]
    fn remove_chain_cascades_rules() {
        let mut store = ChainRuleStore::new();
        store.add_chain(Family::Ipv4, "filter", "X").unwrap();
        store
            .add_rule(Family::Ipv4, "filter", "X", 0, &args("-j ACCEPT"))
            .unwrap();
        store
            .add_rule(Family::Ipv4, "filter", "X", 3, &args("-j DROP"))
            .unwrap();

        store.remove_chain(Family::Ipv4, "filter", "X").unwrap();

        assert!(store.get_rules(Family::Ipv4, "filter", "X").is_empty());
        assert!(!store.query_rule(Family::Ipv4, "filter", "X", 0, &args("-j ACCEPT")));
        assert!(store.get_all_rules().is_empty());
    }

    #[test]
    fn rules_order_by_priority_then_insertion() {
        let mut store = ChainRuleStore::new();
        let priorities = [0, 0, 1, -5, -10, -5];
        for (i, priority) in priorities.iter().enumerate() {
            store
                .add_rule(
                    Family::Ipv4,
                    "filter",
                    "C",
                    *priority,
                    &args(&format!("--dport {} -j ACCEPT", 330 + i)),
                )
                .unwrap();
        }

        let rules = store.get_rules(Family::Ipv4, "filter", "C");
        let order: Vec<(i32, &str)> = rules
            .iter()
            .map(|r| (r.priority, r.args[1].as_str()))
            .collect();

        assert_eq!(
            order,
            vec![
                (-10, "334"),
                (-5, "333"),
                (-5, "335"),
                (0, "330"),
                (0, "331"),
                (1, "332"),
            ]
        );
    }

    #[test]
    fn rule_identity_is_exact_key() {
        let mut store = ChainRuleStore::new();
        let rule = args("-m tcp -p tcp --dport 22 -j ACCEPT");
        store.add_rule(Family::Ipv4, "filter", "INPUT", 0, &rule).unwrap();

        let err = store
            .add_rule(Family::Ipv4, "filter", "INPUT", 0, &rule)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyEnabled);

        // Same tokens, different priority: a distinct rule
        store.add_rule(Family::Ipv4, "filter", "INPUT", 1, &rule).unwrap();

        let permuted = args("-p tcp -m tcp --dport 22 -j ACCEPT");
        let err = store
            .remove_rule(Family::Ipv4, "filter", "INPUT", 0, &permuted)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotEnabled);

        let err = store
            .remove_rule(Family::Ipv4, "filter", "INPUT", 7, &rule)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotEnabled);

        store.remove_rule(Family::Ipv4, "filter", "INPUT", 0, &rule).unwrap();
        assert_eq!(store.get_rules(Family::Ipv4, "filter", "INPUT").len(), 1);
    }

    #[test]
    fn remove_rules_keeps_chain() {
        let mut store = ChainRuleStore::new();
        store.add_chain(Family::Ipv6, "filter", "X").unwrap();
        store.add_rule(Family::Ipv6, "filter", "X", 0, &args("-j LOG")).unwrap();
        store.add_rule(Family::Ipv6, "filter", "X", 1, &args("-j DROP")).unwrap();

        assert_eq!(store.remove_rules(Family::Ipv6, "filter", "X").unwrap(), 2);
        assert_eq!(store.remove_rules(Family::Ipv6, "filter", "X").unwrap(), 0);
        assert!(store.query_chain(Family::Ipv6, "filter", "X"));
        assert!(store.get_rules(Family::Ipv6, "filter", "X").is_empty());
    }

    #[test]
    fn malformed_input_is_rejected_without_change() {
        let mut store = ChainRuleStore::new();

        for chain in ["", "has space", "a_chain_name_that_is_far_too_long"] {
            let err = store.add_chain(Family::Ipv4, "filter", chain).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        let err = store.add_chain(Family::Ipv4, "", "X").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = store.add_chain(Family::Ipv4, "filter", "INPUT").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = store
            .add_rule(Family::Ipv4, "filter", "INPUT", 0, &[])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        assert!(store.is_empty());
        assert!(store.table_keys().is_empty());
    }

    #[test]
    fn all_rules_follow_table_then_render_order() {
        let mut store = ChainRuleStore::new();
        store.add_rule(Family::Ipv6, "filter", "INPUT", 0, &args("-j ACCEPT")).unwrap();
        store.add_rule(Family::Ipv4, "filter", "INPUT", 5, &args("-j DROP")).unwrap();
        store.add_rule(Family::Ipv4, "filter", "INPUT", -5, &args("-j LOG")).unwrap();

        let all = store.get_all_rules();
        let summary: Vec<(Family, i32)> = all.iter().map(|r| (r.ipv, r.priority)).collect();
        assert_eq!(
            summary,
            vec![(Family::Ipv4, -5), (Family::Ipv4, 5), (Family::Ipv6, 0)]
        );
    }

    #[test]
    fn from_config_rejects_duplicates() {
        let yaml = r#"
chains:
  - { ipv: ipv4, table: filter, chain: direct_foo1 }
rules:
  - { ipv: ipv4, table: filter, chain: direct_foo1, args: ["-j", "DROP"] }
  - { ipv: ipv4, table: filter, chain: direct_foo1, args: ["-j", "DROP"] }
"#;
        let config = DirectConfig::from_yaml(yaml).unwrap();
        let err = ChainRuleStore::from_config(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyEnabled);

        let mut config = config;
        config.rules.pop();
        let store = ChainRuleStore::from_config(&config).unwrap();
        assert!(store.query_chain(Family::Ipv4, "filter", "direct_foo1"));
        assert_eq!(store.get_all_rules().len(), 1);
    }

    #[test]
    fn chain_name_limit_counts_bytes() {
        let mut store = ChainRuleStore::new();
        let ascii = "a".repeat(MAX_CHAIN_NAME_LEN);
        store.add_chain(Family::Ipv4, "filter", &ascii).unwrap();

        // 15 characters, 30 bytes
        let wide = "é".repeat(15);
        let err = store.add_chain(Family::Ipv4, "filter", &wide).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("28 bytes"));
    }
}
