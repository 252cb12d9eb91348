use anyhow::{Context, Result};
use gw_core::TableFamily;
use serde_json::{json, Value};
use similar::{ChangeTag, TextDiff};
use tokio::process::Command;
use tracing::{debug, info};

use crate::program::TableProgram;
use crate::render::{render_delete_table, render_table};

/// Drives the `nft` binary with JSON payloads.
pub struct NftManager;

pub struct NftDiff {
    pub table: String,
    pub matches: bool,
    pub current_exists: bool,
    pub diff: Option<String>,
}

impl NftManager {
    pub fn new() -> Self {
        Self
    }

    /// Render a table program as the pretty-printed batch `nft -j -f` reads.
    pub fn render_program(&self, program: &TableProgram) -> Result<String> {
        let payload = render_table(program)
            .with_context(|| format!("Failed to render table {}", program.name))?;
        Ok(serde_json::to_string_pretty(&payload)?)
    }

    /// Compare the rendering of what was last installed with a desired program.
    pub fn diff_programs(
        &self,
        current: Option<&TableProgram>,
        desired: &TableProgram,
    ) -> Result<NftDiff> {
        let desired_text = self.render_program(desired)?;

        let Some(current) = current else {
            return Ok(NftDiff {
                table: desired.name.clone(),
                matches: false,
                current_exists: false,
                diff: Some(render_diff("", &desired_text)),
            });
        };

        let current_text = self.render_program(current)?;
        if current_text == desired_text {
            return Ok(NftDiff {
                table: desired.name.clone(),
                matches: true,
                current_exists: true,
                diff: None,
            });
        }

        Ok(NftDiff {
            table: desired.name.clone(),
            matches: false,
            current_exists: true,
            diff: Some(render_diff(&current_text, &desired_text)),
        })
    }

    /// Write a table program, returning the previous kernel snapshot (if any).
    pub async fn apply_program(&self, program: &TableProgram) -> Result<Option<String>> {
        let payload = self.render_program(program)?;
        let snapshot = self.snapshot_table(program.family, &program.name).await?;
        self.apply_payload(&payload).await?;
        info!(
            table = %program.name,
            family = %program.family,
            rules = program.rule_count(),
            "Applied nftables table"
        );
        Ok(snapshot)
    }

    async fn apply_payload(&self, payload: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut child = Command::new("nft")
            .arg("-j")
            .arg("-f")
            .arg("-")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .context("Failed to spawn nft command")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await?;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("nft command failed: {}", stderr);
        }

        Ok(())
    }

    /// Snapshot an existing table, returning its JSON listing if it exists.
    pub async fn snapshot_table(&self, family: TableFamily, name: &str) -> Result<Option<String>> {
        let output = Command::new("nft")
            .arg("-j")
            .arg("list")
            .arg("table")
            .arg(family.as_str())
            .arg(name)
            .output()
            .await
            .context("Failed to list nftables table")?;

        if output.status.success() {
            return Ok(Some(String::from_utf8_lossy(&output.stdout).to_string()));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such file or directory") {
            debug!(table = name, family = %family, "No table to snapshot");
            return Ok(None);
        }

        anyhow::bail!("Failed to snapshot table {} {}: {}", family, name, stderr);
    }

    /// Put a table back the way a snapshot recorded it. Without a snapshot the
    /// table did not exist before, so it is deleted.
    pub async fn restore_table(
        &self,
        family: TableFamily,
        name: &str,
        snapshot: Option<&str>,
    ) -> Result<()> {
        match snapshot {
            Some(data) => {
                let payload = restore_payload(family, name, data)?;
                self.apply_payload(&payload)
                    .await
                    .with_context(|| format!("Failed to restore table {}", name))?;
                info!(table = name, family = %family, "Restored nftables table from snapshot");
            }
            None => self.delete_table(family, name).await?,
        }
        Ok(())
    }

    /// Delete a table. A table that is already gone is not an error.
    pub async fn delete_table(&self, family: TableFamily, name: &str) -> Result<()> {
        let payload = serde_json::to_string(&render_delete_table(family, name))?;

        match self.apply_payload(&payload).await {
            Ok(()) => {}
            Err(e) if e.to_string().contains("No such file or directory") => {
                debug!(table = name, family = %family, "Table already absent");
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to delete table {}", name)),
        }

        info!(table = name, family = %family, "Deleted nftables table");
        Ok(())
    }

    /// List existing tables as (family, name) pairs.
    pub async fn list_tables(&self) -> Result<Vec<(String, String)>> {
        let output = Command::new("nft")
            .arg("-j")
            .arg("list")
            .arg("tables")
            .output()
            .await
            .context("Failed to list nftables tables")?;

        if !output.status.success() {
            return Ok(vec![]);
        }

        let json_output = String::from_utf8_lossy(&output.stdout);
        parse_table_listing(&json_output)
    }
}

impl Default for NftManager {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_table_listing(listing: &str) -> Result<Vec<(String, String)>> {
    let parsed: serde_json::Value =
        serde_json::from_str(listing).context("Failed to parse nft table listing")?;

    let mut tables = vec![];
    if let Some(nftables) = parsed.get("nftables").and_then(|n| n.as_array()) {
        for item in nftables {
            let Some(table) = item.get("table") else {
                continue;
            };
            let family = table.get("family").and_then(|f| f.as_str());
            let name = table.get("name").and_then(|n| n.as_str());
            if let (Some(family), Some(name)) = (family, name) {
                tables.push((family.to_string(), name.to_string()));
            }
        }
    }

    Ok(tables)
}

/// Turn a `nft -j list table` snapshot into a batch that replaces the table
/// with the listed objects. Kernel handles are dropped.
fn restore_payload(family: TableFamily, name: &str, snapshot: &str) -> Result<String> {
    let parsed: Value = serde_json::from_str(snapshot).context("Failed to parse table snapshot")?;
    let table = json!({"table": {"family": family.as_str(), "name": name}});
    let mut nftables = vec![json!({"add": table.clone()}), json!({"delete": table})];

    if let Some(items) = parsed.get("nftables").and_then(|n| n.as_array()) {
        for item in items.iter().filter(|item| item.get("metainfo").is_none()) {
            let mut item = item.clone();
            if let Some(object) = item
                .as_object_mut()
                .and_then(|o| o.values_mut().next())
                .and_then(|v| v.as_object_mut())
            {
                object.remove("handle");
            }
            nftables.push(json!({"add": item}));
        }
    }

    Ok(serde_json::to_string(&json!({"nftables": nftables}))?)
}

fn render_diff(current: &str, desired: &str) -> String {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::compile_table;
    use gw_core::{
        Chain, ChainHook, ChainPolicy, ChainType, FilterAction, FilterRule, RulesSet, Table,
    };

    fn program(action: FilterAction) -> TableProgram {
        let table = Table {
            name: "gw".into(),
            family: TableFamily::Inet,
            chains: vec![Chain {
                name: "forward".into(),
                chain_type: ChainType::Filter,
                policy: ChainPolicy::Accept,
                hook: ChainHook::Forward,
                priority: 0,
                rules: RulesSet::Filter(vec![FilterRule {
                    name: Some("only".into()),
                    matches: vec![],
                    action,
                    value: None,
                }]),
            }],
        };
        compile_table(&table).unwrap()
    }

    #[test]
    fn identical_programs_match() {
        let manager = NftManager::new();
        let p = program(FilterAction::Accept);
        let diff = manager.diff_programs(Some(&p), &p).unwrap();
        assert!(diff.matches);
        assert!(diff.diff.is_none());
    }

    #[test]
    fn changed_verdict_shows_in_diff() {
        let manager = NftManager::new();
        let diff = manager
            .diff_programs(
                Some(&program(FilterAction::Accept)),
                &program(FilterAction::Drop),
            )
            .unwrap();
        let text = diff.diff.unwrap();
        assert!(!diff.matches);
        assert!(text.contains("-") && text.contains("\"accept\""));
        assert!(text.contains("+") && text.contains("\"drop\""));
    }

    #[test]
    fn missing_current_is_all_inserts() {
        let manager = NftManager::new();
        let diff = manager
            .diff_programs(None, &program(FilterAction::Accept))
            .unwrap();
        assert!(!diff.current_exists);
        assert!(diff
            .diff
            .unwrap()
            .lines()
            .all(|line| line.starts_with('+')));
    }

    #[test]
    fn restore_payload_replaces_the_table() {
        let snapshot = r#"{"nftables": [
            {"metainfo": {"version": "1.0.9"}},
            {"table": {"family": "inet", "name": "gw", "handle": 3}},
            {"chain": {"family": "inet", "table": "gw", "name": "forward", "handle": 1,
                       "type": "filter", "hook": "forward", "prio": 0, "policy": "drop"}},
            {"rule": {"family": "inet", "table": "gw", "chain": "forward", "handle": 4,
                      "comment": "only", "expr": [{"accept": null}]}}
        ]}"#;

        let payload = restore_payload(TableFamily::Inet, "gw", snapshot).unwrap();
        let doc: Value = serde_json::from_str(&payload).unwrap();
        let entries = doc["nftables"].as_array().unwrap();

        assert_eq!(entries.len(), 5);
        assert_eq!(entries[1]["delete"]["table"]["name"], "gw");
        assert_eq!(entries[3]["add"]["chain"]["policy"], "drop");
        assert_eq!(entries[4]["add"]["rule"]["comment"], "only");
        assert!(entries[4]["add"]["rule"].get("handle").is_none());
        assert!(entries.iter().all(|e| e.get("metainfo").is_none()));
    }

    #[test]
    fn restore_payload_rejects_garbage() {
        assert!(restore_payload(TableFamily::Inet, "gw", "not json").is_err());
    }

    #[test]
    fn parses_table_listing() {
        let listing = r#"{"nftables": [
            {"metainfo": {"version": "1.0.9"}},
            {"table": {"family": "inet", "name": "gw", "handle": 3}},
            {"table": {"family": "ip", "name": "nat", "handle": 4}}
        ]}"#;
        assert_eq!(
            parse_table_listing(listing).unwrap(),
            vec![
                ("inet".to_string(), "gw".to_string()),
                ("ip".to_string(), "nat".to_string())
            ]
        );
    }
}
