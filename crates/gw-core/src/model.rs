use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;

/// Address family of a table. Names follow the nftables families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableFamily {
    /// Dual-stack IPv4 + IPv6.
    Inet,
    #[serde(rename = "ip")]
    Ipv4,
    #[serde(rename = "ip6")]
    Ipv6,
    Arp,
    Bridge,
    Netdev,
}

impl TableFamily {
    pub const ALL: [TableFamily; 6] = [
        Self::Inet,
        Self::Ipv4,
        Self::Ipv6,
        Self::Arp,
        Self::Bridge,
        Self::Netdev,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inet => "inet",
            Self::Ipv4 => "ip",
            Self::Ipv6 => "ip6",
            Self::Arp => "arp",
            Self::Bridge => "bridge",
            Self::Netdev => "netdev",
        }
    }
}

impl fmt::Display for TableFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TableFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|family| family.as_str() == s)
            .ok_or_else(|| format!("unknown table family {:?}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    Nat,
    Filter,
    Route,
}

impl ChainType {
    pub const ALL: [ChainType; 3] = [Self::Nat, Self::Filter, Self::Route];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nat => "nat",
            Self::Filter => "filter",
            Self::Route => "route",
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainHook {
    Prerouting,
    Input,
    Output,
    Postrouting,
    Forward,
    Ingress,
}

impl ChainHook {
    pub const ALL: [ChainHook; 6] = [
        Self::Prerouting,
        Self::Input,
        Self::Output,
        Self::Postrouting,
        Self::Forward,
        Self::Ingress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prerouting => "prerouting",
            Self::Input => "input",
            Self::Output => "output",
            Self::Postrouting => "postrouting",
            Self::Forward => "forward",
            Self::Ingress => "ingress",
        }
    }
}

impl fmt::Display for ChainHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainPolicy {
    #[default]
    Accept,
    Drop,
}

impl ChainPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Drop => "drop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub family: TableFamily,
    #[serde(default)]
    pub chains: Vec<Chain>,
}

impl Table {
    pub fn new(name: &str, family: TableFamily) -> Self {
        Self {
            name: name.to_string(),
            family,
            chains: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub name: String,
    #[serde(rename = "type")]
    pub chain_type: ChainType,
    #[serde(default)]
    pub policy: ChainPolicy,
    pub hook: ChainHook,
    #[serde(default)]
    pub priority: i32,
    pub rules: RulesSet,
}

/// The rule collection of a chain. A chain carries exactly one kind of rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRulesSet", into = "RawRulesSet")]
pub enum RulesSet {
    Nat(Vec<NatRule>),
    Filter(Vec<FilterRule>),
    Route(Vec<RouteRule>),
}

impl RulesSet {
    /// Build a rule set from independently populated collections, as they
    /// arrive from a serialized policy object.
    pub fn from_parts(
        nat: Vec<NatRule>,
        filter: Vec<FilterRule>,
        route: Vec<RouteRule>,
    ) -> Result<Self, ValidationError> {
        let populated = [!nat.is_empty(), !filter.is_empty(), !route.is_empty()]
            .iter()
            .filter(|p| **p)
            .count();

        match populated {
            0 => Err(ValidationError::NoRuleSet),
            1 if !nat.is_empty() => Ok(Self::Nat(nat)),
            1 if !filter.is_empty() => Ok(Self::Filter(filter)),
            1 => Ok(Self::Route(route)),
            _ => Err(ValidationError::MultipleRuleSets),
        }
    }

    /// The chain type this collection belongs to.
    pub fn kind(&self) -> ChainType {
        match self {
            Self::Nat(_) => ChainType::Nat,
            Self::Filter(_) => ChainType::Filter,
            Self::Route(_) => ChainType::Route,
        }
    }

    /// Serialized field name of this collection.
    pub fn field_name(&self) -> &'static str {
        field_name_for(self.kind())
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Nat(rules) => rules.len(),
            Self::Filter(rules) => rules.len(),
            Self::Route(rules) => rules.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate the rules in list order as a closed set of variants.
    pub fn iter(&self) -> Box<dyn Iterator<Item = RuleRef<'_>> + '_> {
        match self {
            Self::Nat(rules) => Box::new(rules.iter().map(RuleRef::Nat)),
            Self::Filter(rules) => Box::new(rules.iter().map(RuleRef::Filter)),
            Self::Route(rules) => Box::new(rules.iter().map(RuleRef::Route)),
        }
    }
}

pub fn field_name_for(kind: ChainType) -> &'static str {
    match kind {
        ChainType::Nat => "natRules",
        ChainType::Filter => "filterRules",
        ChainType::Route => "routeRules",
    }
}

/// Wire shape of a rule set: three optional lists, as authored.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRulesSet {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    nat_rules: Vec<NatRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    filter_rules: Vec<FilterRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    route_rules: Vec<RouteRule>,
}

impl TryFrom<RawRulesSet> for RulesSet {
    type Error = ValidationError;

    fn try_from(raw: RawRulesSet) -> Result<Self, Self::Error> {
        RulesSet::from_parts(raw.nat_rules, raw.filter_rules, raw.route_rules)
    }
}

impl From<RulesSet> for RawRulesSet {
    fn from(set: RulesSet) -> Self {
        match set {
            RulesSet::Nat(nat_rules) => Self {
                nat_rules,
                ..Default::default()
            },
            RulesSet::Filter(filter_rules) => Self {
                filter_rules,
                ..Default::default()
            },
            RulesSet::Route(route_rules) => Self {
                route_rules,
                ..Default::default()
            },
        }
    }
}

/// Borrowed view of a single rule of any kind.
#[derive(Debug, Clone, Copy)]
pub enum RuleRef<'a> {
    Nat(&'a NatRule),
    Filter(&'a FilterRule),
    Route(&'a RouteRule),
}

impl<'a> RuleRef<'a> {
    pub fn name(&self) -> Option<&'a str> {
        match self {
            Self::Nat(rule) => rule.name.as_deref(),
            Self::Filter(rule) => rule.name.as_deref(),
            Self::Route(rule) => rule.name.as_deref(),
        }
    }

    pub fn matches(&self) -> &'a [Match] {
        match self {
            Self::Nat(rule) => &rule.matches,
            Self::Filter(rule) => &rule.matches,
            Self::Route(rule) => &rule.matches,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchOperation {
    Eq,
    Neq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpPosition {
    Src,
    Dst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevPosition {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpMatch {
    pub value: Option<String>,
    pub position: Option<IpPosition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevMatch {
    pub value: String,
    pub position: Option<DevPosition>,
}

/// What a match inspects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchTarget {
    Ip(IpMatch),
    Dev(DevMatch),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub op: MatchOperation,
    #[serde(flatten)]
    pub target: MatchTarget,
}

impl Match {
    pub fn ip(op: MatchOperation, position: IpPosition, value: &str) -> Self {
        Self {
            op,
            target: MatchTarget::Ip(IpMatch {
                value: Some(value.to_string()),
                position: Some(position),
            }),
        }
    }

    pub fn dev(op: MatchOperation, position: DevPosition, value: &str) -> Self {
        Self {
            op,
            target: MatchTarget::Dev(DevMatch {
                value: value.to_string(),
                position: Some(position),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    Destination,
    Source,
    Masquerade,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Destination => "destination",
            Self::Source => "source",
            Self::Masquerade => "masquerade",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "match")]
    pub matches: Vec<Match>,
    #[serde(rename = "natType")]
    pub nat_type: NatType,
    #[serde(default)]
    pub to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    Accept,
    Drop,
    /// Set the conntrack mark from the rule value.
    #[serde(rename = "ctmark")]
    CtMark,
    /// Copy the conntrack mark into the packet mark.
    #[serde(rename = "metamarkfromctmark")]
    MetaMarkFromCtMark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "match")]
    pub matches: Vec<Match>,
    pub action: FilterAction,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "match")]
    pub matches: Vec<Match>,
    /// Packet mark used to steer the flow to a routing table.
    #[serde(default)]
    pub mark: Option<u32>,
}

/// A stored policy object: one table owned by one cluster entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallConfiguration {
    /// Object name, unique in the policy store.
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub table: Table,
}
