use thiserror::Error;

use crate::model::{ChainHook, ChainType, NatType, TableFamily};

/// Structural problems with a policy object. These are never retried; they
/// are reported back to whoever authored the object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("chain type {chain_type} is not allowed on hook {hook} for family {family}")]
    HookNotAllowed {
        family: TableFamily,
        chain_type: ChainType,
        hook: ChainHook,
    },

    #[error("no rule set defined")]
    NoRuleSet,

    #[error("only one rule set must be defined")]
    MultipleRuleSets,

    #[error("{chain_type} chain requires field {missing}, but {found} is set")]
    RuleKindMismatch {
        chain_type: ChainType,
        missing: &'static str,
        found: &'static str,
    },

    #[error("{nat_type} nat rule {rule} is not allowed on hook {hook}")]
    NatDirection {
        rule: String,
        nat_type: NatType,
        hook: ChainHook,
    },

    #[error("duplicate chain name {chain} in table {table}")]
    DuplicateChain { table: String, chain: String },

    #[error("table name {table} is already used by configuration {other}")]
    DuplicateTable { table: String, other: String },

    #[error("chain {chain}: {source}")]
    InChain {
        chain: String,
        #[source]
        source: Box<ValidationError>,
    },
}

impl ValidationError {
    /// The innermost error, with chain context stripped.
    pub fn root(&self) -> &ValidationError {
        match self {
            Self::InChain { source, .. } => source.root(),
            other => other,
        }
    }

    /// Short machine-friendly label, used for metrics.
    pub fn reason(&self) -> &'static str {
        match self.root() {
            Self::HookNotAllowed { .. } => "hook_not_allowed",
            Self::NoRuleSet => "no_rule_set",
            Self::MultipleRuleSets => "multiple_rule_sets",
            Self::RuleKindMismatch { .. } => "rule_kind_mismatch",
            Self::NatDirection { .. } => "nat_direction",
            Self::DuplicateChain { .. } => "duplicate_chain",
            Self::DuplicateTable { .. } => "duplicate_table",
            Self::InChain { .. } => "invalid_chain",
        }
    }
}
