use anyhow::{Context, Result};
use lw_core::{Family, TableState};
use similar::{ChangeTag, TextDiff};

use crate::backend::IptablesBackend;
use crate::restore::{render_table, rule_lines};

pub struct TableDiff {
    pub family: Family,
    pub table: String,
    pub matches: bool,
    pub diff: Option<String>,
}

impl IptablesBackend {
    /// Compare the rules of a desired table with what the live table holds
    /// in the chains this table would manage
    pub async fn diff_table(
        &self,
        family: Family,
        table: &str,
        state: &TableState,
    ) -> Result<TableDiff> {
        let current_raw = self
            .save_table(family, table)
            .await
            .with_context(|| format!("Failed to snapshot {} table {}", family, table))?;

        let previous = self.managed_chains(family, table).await;
        let plan = render_table(family, table, state, Some(&previous));
        let managed = plan.managed.rule_targets();

        let current = managed_rule_lines(&current_raw, &managed);
        let desired = rule_lines(family, state).join("\n");

        if normalize(&current) == normalize(&desired) {
            return Ok(TableDiff {
                family,
                table: table.to_string(),
                matches: true,
                diff: None,
            });
        }

        Ok(TableDiff {
            family,
            table: table.to_string(),
            matches: false,
            diff: Some(render_diff(&normalize(&current), &normalize(&desired))),
        })
    }
}

/// `-A` lines of `save_output` that target one of `chains`
pub fn managed_rule_lines(save_output: &str, chains: &[String]) -> String {
    save_output
        .lines()
        .filter(|line| {
            line.strip_prefix("-A ")
                .and_then(|rest| rest.split_whitespace().next())
                .is_some_and(|chain| chains.iter().any(|c| c == chain))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn normalize(text: &str) -> String {
    let mut lines: Vec<&str> = text.lines().map(str::trim_end).filter(|l| !l.is_empty()).collect();
    lines.push("");
    lines.join("\n")
}

pub fn render_diff(current: &str, desired: &str) -> String {
    let diff = TextDiff::from_lines(current, desired);
    let mut output = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => ' ',
        };
        output.push(sign);
        output.push_str(change.value());
    }

    output
}
