use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use tracing::warn;

use crate::model::{FilterAction, FirewallConfiguration, RulesSet};

/// Persisted cluster objects that carry allocated marks and addresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    #[serde(default)]
    pub route_configurations: Vec<RouteConfiguration>,
    #[serde(default)]
    pub firewall_configurations: Vec<FirewallConfiguration>,
    #[serde(default)]
    pub address_assignments: Vec<AddressAssignment>,
}

/// Kernel routing policy owned by one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfiguration {
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(default)]
    pub fw_mark: Option<u32>,
    #[serde(default)]
    pub table: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressAssignment {
    pub pool: String,
    pub key: String,
    pub address: IpAddr,
}

/// A mark found in persisted state, with the entity it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredMark {
    pub owner: String,
    pub mark: u32,
}

/// Read access to previously persisted objects, consulted once at startup.
pub trait RecoverySource: Send + Sync {
    /// Every mark in use across routing and filtering objects.
    fn persisted_marks(&self) -> Result<Vec<RecoveredMark>>;

    /// Every (key, address) reservation of a pool.
    fn persisted_addresses(&self, pool: &str) -> Result<Vec<(String, IpAddr)>>;
}

impl ClusterState {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse cluster state")
    }

    /// Load state, treating a missing file as empty.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cluster state from {:?}", path))?;
        Self::from_yaml(&content)
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize cluster state")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write cluster state to {:?}", path))
    }

    /// Persist a committed mark on the owner's route configuration.
    pub fn record_mark(&mut self, owner: &str, mark: u32) {
        let name = format!("{}-mark", owner);
        let rule = RoutingRule {
            fw_mark: Some(mark),
            table: Some(owner.to_string()),
        };

        match self.route_configurations.iter_mut().find(|r| r.name == name) {
            Some(existing) => existing.rules = vec![rule],
            None => self.route_configurations.push(RouteConfiguration {
                name,
                owner: Some(owner.to_string()),
                rules: vec![rule],
            }),
        }
    }

    /// Drop the route configuration created by [`record_mark`](Self::record_mark).
    pub fn remove_mark(&mut self, owner: &str) {
        let name = format!("{}-mark", owner);
        self.route_configurations.retain(|r| r.name != name);
    }

    /// Names of persisted objects, other than the route configuration made by
    /// [`record_mark`](Self::record_mark), that carry a mark for `owner`. Marks
    /// they carry come back on recovery even after `remove_mark`.
    pub fn mark_holders(&self, owner: &str) -> Vec<String> {
        let own_route = format!("{}-mark", owner);
        let mut holders: Vec<String> = self
            .route_configurations
            .iter()
            .filter(|r| r.name != own_route)
            .filter(|r| r.owner.as_deref().unwrap_or(&r.name) == owner)
            .filter(|r| r.rules.iter().any(|rule| rule.fw_mark.is_some()))
            .map(|r| r.name.clone())
            .collect();

        holders.extend(
            self.firewall_configurations
                .iter()
                .filter(|c| c.owner.as_deref().unwrap_or(&c.name) == owner)
                .filter(|c| c.table.chains.iter().any(|chain| carries_mark(&chain.rules)))
                .map(|c| c.name.clone()),
        );
        holders
    }

    pub fn record_address(&mut self, pool: &str, key: &str, address: IpAddr) {
        match self
            .address_assignments
            .iter_mut()
            .find(|a| a.pool == pool && a.key == key)
        {
            Some(existing) => existing.address = address,
            None => self.address_assignments.push(AddressAssignment {
                pool: pool.to_string(),
                key: key.to_string(),
                address,
            }),
        }
    }

    pub fn remove_address(&mut self, pool: &str, key: &str) {
        self.address_assignments
            .retain(|a| !(a.pool == pool && a.key == key));
    }
}

impl RecoverySource for ClusterState {
    fn persisted_marks(&self) -> Result<Vec<RecoveredMark>> {
        let mut marks = Vec::new();

        for route in &self.route_configurations {
            let owner = route.owner.as_deref().unwrap_or(&route.name);
            for rule in &route.rules {
                if let Some(mark) = rule.fw_mark {
                    marks.push(RecoveredMark {
                        owner: owner.to_string(),
                        mark,
                    });
                }
            }
        }

        for config in &self.firewall_configurations {
            let owner = config.owner.as_deref().unwrap_or(&config.name);
            for chain in &config.table.chains {
                match &chain.rules {
                    RulesSet::Filter(rules) => {
                        for rule in rules.iter().filter(|r| r.action == FilterAction::CtMark) {
                            let Some(value) = rule.value.as_deref() else {
                                continue;
                            };
                            match parse_mark(value) {
                                Some(mark) => marks.push(RecoveredMark {
                                    owner: owner.to_string(),
                                    mark,
                                }),
                                None => warn!(
                                    configuration = %config.name,
                                    value,
                                    "Ignoring unparseable ctmark value"
                                ),
                            }
                        }
                    }
                    RulesSet::Route(rules) => {
                        for mark in rules.iter().filter_map(|r| r.mark) {
                            marks.push(RecoveredMark {
                                owner: owner.to_string(),
                                mark,
                            });
                        }
                    }
                    RulesSet::Nat(_) => {}
                }
            }
        }

        Ok(marks)
    }

    fn persisted_addresses(&self, pool: &str) -> Result<Vec<(String, IpAddr)>> {
        Ok(self
            .address_assignments
            .iter()
            .filter(|a| a.pool == pool)
            .map(|a| (a.key.clone(), a.address))
            .collect())
    }
}

fn carries_mark(rules: &RulesSet) -> bool {
    match rules {
        RulesSet::Filter(rules) => rules
            .iter()
            .any(|r| r.action == FilterAction::CtMark && r.value.is_some()),
        RulesSet::Route(rules) => rules.iter().any(|r| r.mark.is_some()),
        RulesSet::Nat(_) => false,
    }
}

/// Parse a mark value as written on filter actions: decimal or 0x-prefixed hex.
pub fn parse_mark(value: &str) -> Option<u32> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATE: &str = r#"
routeConfigurations:
  - name: remote-a-mark
    owner: remote-a
    rules:
      - fwMark: 3
        table: remote-a
firewallConfigurations:
  - name: gw-remote-b
    owner: remote-b
    table:
      name: remote-b
      family: inet
      chains:
        - name: forward
          type: filter
          hook: forward
          rules:
            filterRules:
              - name: mark-b
                action: ctmark
                value: "0x10"
              - name: restore
                action: metamarkfromctmark
addressAssignments:
  - pool: fabric
    key: remote-a
    address: 10.80.0.1
  - pool: gateway
    key: remote-a
    address: 10.70.0.1
"#;

    #[test]
    fn collects_marks_from_routes_and_filters() {
        let state = ClusterState::from_yaml(STATE).unwrap();
        let marks = state.persisted_marks().unwrap();
        assert_eq!(
            marks,
            vec![
                RecoveredMark {
                    owner: "remote-a".into(),
                    mark: 3
                },
                RecoveredMark {
                    owner: "remote-b".into(),
                    mark: 16
                },
            ]
        );
    }

    #[test]
    fn collects_addresses_per_pool() {
        let state = ClusterState::from_yaml(STATE).unwrap();
        let fabric = state.persisted_addresses("fabric").unwrap();
        assert_eq!(fabric, vec![("remote-a".to_string(), "10.80.0.1".parse().unwrap())]);
        assert!(state.persisted_addresses("unknown").unwrap().is_empty());
    }

    #[test]
    fn records_and_removes_marks() {
        let mut state = ClusterState::default();
        state.record_mark("remote-c", 9);
        state.record_mark("remote-c", 10);
        assert_eq!(state.route_configurations.len(), 1);
        assert_eq!(state.persisted_marks().unwrap()[0].mark, 10);

        state.remove_mark("remote-c");
        assert!(state.persisted_marks().unwrap().is_empty());
    }

    #[test]
    fn firewall_ctmark_holds_a_mark_past_remove() {
        let mut state = ClusterState::from_yaml(STATE).unwrap();
        assert!(state.mark_holders("remote-a").is_empty());
        assert_eq!(state.mark_holders("remote-b"), vec!["gw-remote-b".to_string()]);

        state.remove_mark("remote-b");
        let marks = state.persisted_marks().unwrap();
        assert!(marks.iter().any(|m| m.owner == "remote-b" && m.mark == 16));
    }

    #[test]
    fn records_and_removes_addresses() {
        let mut state = ClusterState::default();
        state.record_address("fabric", "a", "10.80.0.1".parse().unwrap());
        state.record_address("fabric", "a", "10.80.0.2".parse().unwrap());
        state.record_address("gateway", "a", "10.70.0.1".parse().unwrap());
        assert_eq!(state.address_assignments.len(), 2);

        state.remove_address("fabric", "a");
        assert!(state.persisted_addresses("fabric").unwrap().is_empty());
        assert_eq!(state.persisted_addresses("gateway").unwrap().len(), 1);
    }

    #[test]
    fn parses_mark_values() {
        assert_eq!(parse_mark("42"), Some(42));
        assert_eq!(parse_mark("0x2a"), Some(42));
        assert_eq!(parse_mark("mark"), None);
        assert_eq!(parse_mark("-1"), None);
    }
}
