// iptables-restore payload rendering
use lw_core::{Family, TableState};
use std::collections::BTreeSet;

/// Chains this backend owns in one family+table after a successful apply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedChains {
    /// User chains from the store
    pub user_chains: Vec<String>,
    /// Built-in chains that already jump to their `<CHAIN>_direct` chain
    pub hooked_builtins: BTreeSet<String>,
    /// Chains holding rules without being declared in the store, such as
    /// chains created by a passthrough. Flushed on every apply, never deleted.
    pub adopted_chains: BTreeSet<String>,
}

impl ManagedChains {
    /// Seed from a live `<tool>-save` snapshot, for the first apply of a
    /// table in this process
    pub fn from_save(family: Family, save_output: &str) -> Self {
        Self {
            hooked_builtins: hooked_builtins_in(family, save_output),
            ..Default::default()
        }
    }

    pub fn contains(&self, chain: &str) -> bool {
        self.user_chains.iter().any(|c| c == chain)
            || self.adopted_chains.contains(chain)
            || self
                .hooked_builtins
                .iter()
                .any(|builtin| direct_chain_name(builtin) == chain)
    }

    /// Every chain whose rules this backend writes
    pub fn rule_targets(&self) -> Vec<String> {
        let mut chains = self.user_chains.clone();
        chains.extend(self.adopted_chains.iter().cloned());
        chains.extend(self.hooked_builtins.iter().map(|b| direct_chain_name(b)));
        chains
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePlan {
    pub payload: String,
    pub managed: ManagedChains,
}

/// Rules for a built-in chain live in this chain, reached by one jump
pub fn direct_chain_name(builtin: &str) -> String {
    format!("{}_direct", builtin)
}

/// Built-in chains whose `-A <CHAIN> -j <CHAIN>_direct` jump is already live
pub fn hooked_builtins_in(family: Family, save_output: &str) -> BTreeSet<String> {
    save_output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
                (Some("-A"), Some(chain), Some("-j"), Some(target))
                    if family.is_builtin_chain(chain) && target == direct_chain_name(chain) =>
                {
                    Some(chain.to_string())
                }
                _ => None,
            }
        })
        .collect()
}

/// Render `state` as an `iptables-restore --noflush` payload.
///
/// Declaring a chain flushes it, so every managed chain is declared and
/// refilled. Jumps from built-in chains are only emitted the first time.
pub fn render_table(
    family: Family,
    table: &str,
    state: &TableState,
    previous: Option<&ManagedChains>,
) -> RestorePlan {
    let previous = previous.cloned().unwrap_or_default();

    let mut hooked = previous.hooked_builtins.clone();
    let mut new_hooks = Vec::new();
    let mut adopted = BTreeSet::new();
    for (chain, _) in state.rule_chains() {
        if family.is_builtin_chain(chain) {
            if hooked.insert(chain.to_string()) {
                new_hooks.push(chain.to_string());
            }
        } else if !state.has_chain(chain) {
            adopted.insert(chain.to_string());
        }
    }

    let stale: Vec<&String> = previous
        .user_chains
        .iter()
        .filter(|chain| !state.has_chain(chain))
        .collect();

    // chains that lost all their rules still need one last flush
    let flushed: BTreeSet<&String> = adopted
        .iter()
        .chain(previous.adopted_chains.iter())
        .filter(|chain| !state.has_chain(chain) && !stale.contains(chain))
        .collect();

    let mut lines = vec![format!("*{}", table)];

    for builtin in &hooked {
        lines.push(declare_chain(family, &direct_chain_name(builtin)));
    }
    for chain in state.chains() {
        lines.push(declare_chain(family, chain));
    }
    for chain in &flushed {
        lines.push(declare_chain(family, chain));
    }
    for chain in &stale {
        lines.push(declare_chain(family, chain));
    }

    for builtin in &new_hooks {
        lines.push(format!("-I {} 1 -j {}", builtin, direct_chain_name(builtin)));
    }

    lines.extend(rule_lines(family, state));

    for chain in &stale {
        lines.push(format!("-X {}", chain));
    }
    lines.push("COMMIT".to_string());

    let mut payload = lines.join("\n");
    payload.push('\n');

    RestorePlan {
        payload,
        managed: ManagedChains {
            user_chains: state.chains().to_vec(),
            hooked_builtins: hooked,
            adopted_chains: adopted,
        },
    }
}

/// `-A` lines in render order
pub fn rule_lines(family: Family, state: &TableState) -> Vec<String> {
    let mut lines = Vec::new();
    for (chain, rules) in state.rule_chains() {
        let target = if family.is_builtin_chain(chain) {
            direct_chain_name(chain)
        } else {
            chain.to_string()
        };
        for rule in rules {
            let args: Vec<String> = rule.args.iter().map(|a| quote_arg(a)).collect();
            lines.push(format!("-A {} {}", target, args.join(" ")));
        }
    }
    lines
}

fn declare_chain(family: Family, chain: &str) -> String {
    match family {
        Family::Ipv4 | Family::Ipv6 => format!(":{} - [0:0]", chain),
        Family::Eb => format!(":{} RETURN", chain),
    }
}

/// iptables-restore splits on whitespace and honours double quotes
fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
        return arg.to_string();
    }
    format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
}
