use anyhow::{Context, Result};
use gw_core::{
    check_table, ChainHook, ChainPolicy, ChainType, RuleRef, Table, TableFamily, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::compiler::{compile_rule, ChainRef, CompileError};
use crate::expr::{sequences_equal, Expression};

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("table {table}, chain {chain}, rule {rule}: {source}")]
    Compile {
        table: String,
        chain: String,
        rule: String,
        #[source]
        source: CompileError,
    },

    #[error("duplicate rule identifier {rule} in chain {chain}")]
    DuplicateRule { chain: String, rule: String },
}

/// A compiled rule, keyed by the comment it is installed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledRule {
    pub id: String,
    pub chain: ChainRef,
    pub exprs: Vec<Expression>,
}

/// A rule as it currently exists in the kernel.
pub type InstalledRule = CompiledRule;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainProgram {
    pub name: String,
    #[serde(rename = "type")]
    pub chain_type: ChainType,
    pub hook: ChainHook,
    pub priority: i32,
    pub policy: ChainPolicy,
    pub rules: Vec<CompiledRule>,
}

impl ChainProgram {
    /// Type, hook, priority and policy agree.
    pub fn same_header(&self, other: &ChainProgram) -> bool {
        self.chain_type == other.chain_type
            && self.hook == other.hook
            && self.priority == other.priority
            && self.policy == other.policy
    }
}

/// The full compiled form of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProgram {
    pub name: String,
    pub family: TableFamily,
    pub chains: Vec<ChainProgram>,
}

impl TableProgram {
    pub fn rules(&self) -> impl Iterator<Item = &CompiledRule> {
        self.chains.iter().flat_map(|c| c.rules.iter())
    }

    pub fn rule_count(&self) -> usize {
        self.chains.iter().map(|c| c.rules.len()).sum()
    }
}

/// Stable identifier of a rule inside its chain. Named rules use their
/// name; unnamed rules fall back to their position.
pub fn rule_id(chain: &str, index: usize, rule: RuleRef<'_>) -> String {
    match rule.name() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("{}-{}", chain, index),
    }
}

/// Validate and compile every chain of a table, rules in list order.
pub fn compile_table(table: &Table) -> Result<TableProgram, ProgramError> {
    check_table(table)?;

    let mut chains = Vec::with_capacity(table.chains.len());
    for chain in &table.chains {
        let chain_ref = ChainRef::new(table.family, &table.name, &chain.name);
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(chain.rules.len());

        for (idx, rule) in chain.rules.iter().enumerate() {
            let id = rule_id(&chain.name, idx, rule);
            if !seen.insert(id.clone()) {
                return Err(ProgramError::DuplicateRule {
                    chain: chain.name.clone(),
                    rule: id,
                });
            }

            let exprs = compile_rule(&chain_ref, rule).map_err(|source| ProgramError::Compile {
                table: table.name.clone(),
                chain: chain.name.clone(),
                rule: id.clone(),
                source,
            })?;

            rules.push(CompiledRule {
                id,
                chain: chain_ref.clone(),
                exprs,
            });
        }

        chains.push(ChainProgram {
            name: chain.name.clone(),
            chain_type: chain.chain_type,
            hook: chain.hook,
            priority: chain.priority,
            policy: chain.policy,
            rules,
        });
    }

    debug!(table = %table.name, chains = chains.len(), "Compiled table");

    Ok(TableProgram {
        name: table.name.clone(),
        family: table.family,
        chains,
    })
}

/// Whether an installed rule already matches a candidate rule. The candidate
/// is compiled against the installed rule's own chain so the family and
/// table context are the same on both sides.
pub fn rule_equal(installed: &InstalledRule, candidate: RuleRef<'_>) -> Result<bool, CompileError> {
    let exprs = compile_rule(&installed.chain, candidate)?;
    Ok(sequences_equal(&installed.exprs, &exprs))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainChange {
    Create,
    Header,
    Reorder,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOp {
    Add(CompiledRule),
    Replace(CompiledRule),
    Delete { chain: ChainRef, id: String },
    Chain { chain: ChainRef, change: ChainChange },
}

impl RuleOp {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Replace(_) => "replace",
            Self::Delete { .. } => "delete",
            Self::Chain { .. } => "chain",
        }
    }
}

impl fmt::Display for RuleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add(rule) => write!(f, "Add rule {} to {}/{}", rule.id, rule.chain.table, rule.chain.chain),
            Self::Replace(rule) => write!(
                f,
                "Replace rule {} in {}/{}",
                rule.id, rule.chain.table, rule.chain.chain
            ),
            Self::Delete { chain, id } => {
                write!(f, "Delete rule {} from {}/{}", id, chain.table, chain.chain)
            }
            Self::Chain { chain, change } => {
                let what = match change {
                    ChainChange::Create => "Create chain",
                    ChainChange::Header => "Update type, hook, priority or policy of chain",
                    ChainChange::Reorder => "Reorder rules of chain",
                    ChainChange::Delete => "Delete chain",
                };
                write!(f, "{} {}/{}", what, chain.table, chain.chain)
            }
        }
    }
}

/// Writes needed to bring the kernel from the installed rules to a desired
/// program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RulePlan {
    pub ops: Vec<RuleOp>,
    pub unchanged: usize,
}

impl RulePlan {
    pub fn is_noop(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of ops with the given label.
    pub fn count(&self, label: &str) -> usize {
        self.ops.iter().filter(|op| op.label() == label).count()
    }

    pub fn display(&self) {
        println!(
            "Plan ({} changes, {} unchanged):",
            self.ops.len(),
            self.unchanged
        );
        for (i, op) in self.ops.iter().enumerate() {
            println!("  {}. {}", i + 1, op);
        }
    }
}

/// Diff the installed program of a table against the desired one. Chains
/// are compared by header and by the relative order of the rules they keep;
/// rules are keyed by (chain, id). Desired order is preserved for adds and
/// replaces; stale rules and chains come after.
pub fn plan(installed: Option<&TableProgram>, desired: &TableProgram) -> RulePlan {
    let mut stale: BTreeMap<&str, &ChainProgram> = installed
        .filter(|t| t.name == desired.name && t.family == desired.family)
        .map(|t| t.chains.iter().map(|c| (c.name.as_str(), c)).collect())
        .unwrap_or_default();

    let mut result = RulePlan::default();

    for chain in &desired.chains {
        let chain_ref = ChainRef::new(desired.family, &desired.name, &chain.name);
        let Some(existing) = stale.remove(chain.name.as_str()) else {
            result.ops.push(RuleOp::Chain {
                chain: chain_ref,
                change: ChainChange::Create,
            });
            result.ops.extend(chain.rules.iter().cloned().map(RuleOp::Add));
            continue;
        };

        if !existing.same_header(chain) {
            result.ops.push(RuleOp::Chain {
                chain: chain_ref.clone(),
                change: ChainChange::Header,
            });
        }
        plan_chain_rules(&chain_ref, existing, chain, &mut result);
    }

    for chain in stale.into_values() {
        let chain_ref = ChainRef::new(desired.family, &desired.name, &chain.name);
        for rule in &chain.rules {
            result.ops.push(RuleOp::Delete {
                chain: chain_ref.clone(),
                id: rule.id.clone(),
            });
        }
        result.ops.push(RuleOp::Chain {
            chain: chain_ref,
            change: ChainChange::Delete,
        });
    }

    result
}

fn plan_chain_rules(
    chain_ref: &ChainRef,
    existing: &ChainProgram,
    desired: &ChainProgram,
    result: &mut RulePlan,
) {
    let mut current: HashMap<&str, &CompiledRule> =
        existing.rules.iter().map(|r| (r.id.as_str(), r)).collect();

    for rule in &desired.rules {
        match current.remove(rule.id.as_str()) {
            Some(previous) if sequences_equal(&previous.exprs, &rule.exprs) => {
                result.unchanged += 1;
            }
            Some(_) => result.ops.push(RuleOp::Replace(rule.clone())),
            None => result.ops.push(RuleOp::Add(rule.clone())),
        }
    }

    for rule in existing.rules.iter().filter(|r| current.contains_key(r.id.as_str())) {
        result.ops.push(RuleOp::Delete {
            chain: chain_ref.clone(),
            id: rule.id.clone(),
        });
    }

    // Rules are evaluated in list order, so kept rules must keep their
    // relative positions.
    let desired_ids: HashSet<&str> = desired.rules.iter().map(|r| r.id.as_str()).collect();
    let existing_ids: HashSet<&str> = existing.rules.iter().map(|r| r.id.as_str()).collect();
    let before = existing
        .rules
        .iter()
        .map(|r| r.id.as_str())
        .filter(|id| desired_ids.contains(id));
    let after = desired
        .rules
        .iter()
        .map(|r| r.id.as_str())
        .filter(|id| existing_ids.contains(id));
    if !before.eq(after) {
        result.ops.push(RuleOp::Chain {
            chain: chain_ref.clone(),
            change: ChainChange::Reorder,
        });
    }
}

/// The programs last written to the kernel, persisted between runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstalledState {
    #[serde(default)]
    pub tables: Vec<TableProgram>,
}

impl InstalledState {
    /// Load installed state, treating a missing file as nothing installed.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read installed state from {:?}", path))?;
        serde_json::from_str(&content).context("Failed to parse installed state")
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write installed state to {:?}", path))?;
        info!(path = %path.display(), tables = self.tables.len(), "Saved installed state");
        Ok(())
    }

    pub fn table(&self, family: TableFamily, table: &str) -> Option<&TableProgram> {
        self.tables
            .iter()
            .find(|t| t.family == family && t.name == table)
    }

    pub fn upsert(&mut self, program: TableProgram) {
        match self
            .tables
            .iter_mut()
            .find(|t| t.family == program.family && t.name == program.name)
        {
            Some(existing) => *existing = program,
            None => self.tables.push(program),
        }
    }

    pub fn remove(&mut self, family: TableFamily, table: &str) {
        self.tables.retain(|t| !(t.family == family && t.name == table));
    }
}
