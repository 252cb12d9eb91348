use std::collections::HashSet;

use crate::error::ValidationError;
use crate::model::{
    field_name_for, Chain, ChainHook, ChainType, FirewallConfiguration, NatType, RulesSet, Table,
    TableFamily,
};

use ChainHook::*;

const IP_FILTER_HOOKS: &[ChainHook] = &[Prerouting, Input, Forward, Output, Postrouting];
const INET_FILTER_HOOKS: &[ChainHook] = &[Prerouting, Input, Forward, Output, Postrouting, Ingress];
const IP_NAT_HOOKS: &[ChainHook] = &[Prerouting, Input, Output, Postrouting];
const ROUTE_HOOKS: &[ChainHook] = &[Output];
const ARP_FILTER_HOOKS: &[ChainHook] = &[Input, Output];
const NETDEV_FILTER_HOOKS: &[ChainHook] = &[Ingress];

/// Hooks a chain of the given type may attach to in a table of the given
/// family. Mirrors the kernel's hook attachment rules.
pub fn allowed_hooks(family: TableFamily, chain_type: ChainType) -> &'static [ChainHook] {
    match (family, chain_type) {
        (TableFamily::Inet, ChainType::Filter) => INET_FILTER_HOOKS,
        (TableFamily::Ipv4 | TableFamily::Ipv6, ChainType::Filter) => IP_FILTER_HOOKS,
        (TableFamily::Inet | TableFamily::Ipv4 | TableFamily::Ipv6, ChainType::Nat) => {
            IP_NAT_HOOKS
        }
        (TableFamily::Inet | TableFamily::Ipv4 | TableFamily::Ipv6, ChainType::Route) => {
            ROUTE_HOOKS
        }
        (TableFamily::Arp, ChainType::Filter) => ARP_FILTER_HOOKS,
        (TableFamily::Bridge, ChainType::Filter) => IP_FILTER_HOOKS,
        (TableFamily::Netdev, ChainType::Filter) => NETDEV_FILTER_HOOKS,
        (TableFamily::Arp | TableFamily::Bridge | TableFamily::Netdev, _) => &[],
    }
}

pub fn hook_allowed(family: TableFamily, chain_type: ChainType, hook: ChainHook) -> bool {
    allowed_hooks(family, chain_type).contains(&hook)
}

/// Check a single chain against the compatibility matrix and its rule set.
pub fn check_chain(family: TableFamily, chain: &Chain) -> Result<(), ValidationError> {
    if !hook_allowed(family, chain.chain_type, chain.hook) {
        return Err(ValidationError::HookNotAllowed {
            family,
            chain_type: chain.chain_type,
            hook: chain.hook,
        });
    }

    if chain.rules.is_empty() {
        return Err(ValidationError::NoRuleSet);
    }

    if chain.rules.kind() != chain.chain_type {
        return Err(ValidationError::RuleKindMismatch {
            chain_type: chain.chain_type,
            missing: field_name_for(chain.chain_type),
            found: chain.rules.field_name(),
        });
    }

    if let RulesSet::Nat(rules) = &chain.rules {
        for (idx, rule) in rules.iter().enumerate() {
            check_nat_direction(rule.nat_type, chain.hook).map_err(|()| {
                ValidationError::NatDirection {
                    rule: rule.name.clone().unwrap_or_else(|| format!("#{}", idx)),
                    nat_type: rule.nat_type,
                    hook: chain.hook,
                }
            })?;
        }
    }

    Ok(())
}

/// Destination rewrites belong before routing, source rewrites after it.
fn check_nat_direction(nat_type: NatType, hook: ChainHook) -> Result<(), ()> {
    match (nat_type, hook) {
        (NatType::Destination, Postrouting | Output) => Err(()),
        (NatType::Source | NatType::Masquerade, Prerouting | Input) => Err(()),
        _ => Ok(()),
    }
}

/// Check every chain of a table and that chain names are unique.
pub fn check_table(table: &Table) -> Result<(), ValidationError> {
    let mut names = HashSet::new();

    for chain in &table.chains {
        if !names.insert(chain.name.as_str()) {
            return Err(ValidationError::DuplicateChain {
                table: table.name.clone(),
                chain: chain.name.clone(),
            });
        }

        check_chain(table.family, chain).map_err(|e| ValidationError::InChain {
            chain: chain.name.clone(),
            source: Box::new(e),
        })?;
    }

    Ok(())
}

/// Validates policy objects against the rest of the policy store.
pub struct PolicyValidator<'a> {
    store: &'a [FirewallConfiguration],
}

impl<'a> PolicyValidator<'a> {
    pub fn new(store: &'a [FirewallConfiguration]) -> Self {
        Self { store }
    }

    /// Admission check for one configuration. The configuration itself may
    /// already be part of the store; it is skipped by object name.
    pub fn check_configuration(&self, config: &FirewallConfiguration) -> Result<(), ValidationError> {
        check_table(&config.table)?;

        if let Some(other) = self
            .store
            .iter()
            .find(|other| other.name != config.name && other.table.name == config.table.name)
        {
            return Err(ValidationError::DuplicateTable {
                table: config.table.name.clone(),
                other: other.name.clone(),
            });
        }

        Ok(())
    }

    /// Check every configuration in the store, returning all failures.
    pub fn validate(&self) -> Vec<(String, ValidationError)> {
        self.store
            .iter()
            .filter_map(|config| {
                self.check_configuration(config)
                    .err()
                    .map(|e| (config.name.clone(), e))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChainPolicy, FilterAction, FilterRule, NatRule, RouteRule};

    fn filter_rules() -> RulesSet {
        RulesSet::Filter(vec![FilterRule {
            name: Some("allow".into()),
            matches: vec![],
            action: FilterAction::Accept,
            value: None,
        }])
    }

    fn nat_rules(nat_type: NatType) -> RulesSet {
        let to = match nat_type {
            NatType::Masquerade => None,
            _ => Some("10.0.0.1".to_string()),
        };
        RulesSet::Nat(vec![NatRule {
            name: Some("nat".into()),
            matches: vec![],
            nat_type,
            to,
        }])
    }

    fn route_rules() -> RulesSet {
        RulesSet::Route(vec![RouteRule {
            name: Some("steer".into()),
            matches: vec![],
            mark: Some(1),
        }])
    }

    fn rules_for(chain_type: ChainType) -> RulesSet {
        match chain_type {
            ChainType::Nat => nat_rules(NatType::Masquerade),
            ChainType::Filter => filter_rules(),
            ChainType::Route => route_rules(),
        }
    }

    fn chain(chain_type: ChainType, hook: ChainHook, rules: RulesSet) -> Chain {
        Chain {
            name: "c".into(),
            chain_type,
            policy: ChainPolicy::Accept,
            hook,
            priority: 0,
            rules,
        }
    }

    /// Expected (family, type, hook) combinations, written out independently
    /// of the lookup table.
    fn expected_allowed(family: TableFamily, chain_type: ChainType, hook: ChainHook) -> bool {
        use TableFamily::*;
        match chain_type {
            ChainType::Filter => match family {
                Inet => true,
                Ipv4 | Ipv6 | Bridge => hook != Ingress,
                Arp => matches!(hook, Input | Output),
                Netdev => hook == Ingress,
            },
            ChainType::Nat => {
                matches!(family, Inet | Ipv4 | Ipv6)
                    && matches!(hook, Prerouting | Input | Output | Postrouting)
            }
            ChainType::Route => matches!(family, Inet | Ipv4 | Ipv6) && hook == Output,
        }
    }

    #[test]
    fn compatibility_matrix_is_exhaustive() {
        for family in TableFamily::ALL {
            for chain_type in ChainType::ALL {
                for hook in ChainHook::ALL {
                    // Masquerade keeps NAT direction out of the picture except
                    // on pre/input; use destination NAT there.
                    let rules = match (chain_type, hook) {
                        (ChainType::Nat, Prerouting | Input) => nat_rules(NatType::Destination),
                        _ => rules_for(chain_type),
                    };
                    let result = check_chain(family, &chain(chain_type, hook, rules));
                    if expected_allowed(family, chain_type, hook) {
                        assert!(
                            result.is_ok(),
                            "{family} {chain_type} {hook} should pass: {result:?}"
                        );
                    } else {
                        assert!(
                            matches!(result, Err(ValidationError::HookNotAllowed { .. })),
                            "{family} {chain_type} {hook} should be rejected"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn representative_matrix_entries() {
        assert!(hook_allowed(TableFamily::Inet, ChainType::Filter, Ingress));
        assert!(!hook_allowed(TableFamily::Ipv4, ChainType::Filter, Ingress));
        assert!(!hook_allowed(TableFamily::Ipv6, ChainType::Filter, Ingress));
        assert!(!hook_allowed(TableFamily::Arp, ChainType::Nat, Input));
        assert!(!hook_allowed(TableFamily::Bridge, ChainType::Nat, Postrouting));
        assert!(!hook_allowed(TableFamily::Netdev, ChainType::Nat, Ingress));
        assert!(hook_allowed(TableFamily::Ipv4, ChainType::Route, Output));
        assert!(!hook_allowed(TableFamily::Ipv4, ChainType::Route, Prerouting));
    }

    #[test]
    fn empty_rule_set_is_rejected() {
        let c = chain(ChainType::Filter, Forward, RulesSet::Filter(vec![]));
        assert_eq!(
            check_chain(TableFamily::Inet, &c),
            Err(ValidationError::NoRuleSet)
        );
    }

    #[test]
    fn rule_kind_must_match_chain_type() {
        for chain_type in ChainType::ALL {
            for kind in ChainType::ALL {
                let c = chain(chain_type, Output, rules_for(kind));
                let result = check_chain(TableFamily::Inet, &c);
                if chain_type == kind {
                    assert!(result.is_ok(), "{chain_type} with {kind} rules: {result:?}");
                } else {
                    assert_eq!(
                        result,
                        Err(ValidationError::RuleKindMismatch {
                            chain_type,
                            missing: field_name_for(chain_type),
                            found: field_name_for(kind),
                        })
                    );
                }
            }
        }
    }

    #[test]
    fn nat_direction_follows_hook() {
        let cases = [
            (NatType::Destination, Prerouting, true),
            (NatType::Destination, Input, true),
            (NatType::Destination, Postrouting, false),
            (NatType::Destination, Output, false),
            (NatType::Source, Postrouting, true),
            (NatType::Source, Output, true),
            (NatType::Source, Prerouting, false),
            (NatType::Source, Input, false),
        ];

        for (nat_type, hook, ok) in cases {
            let c = chain(ChainType::Nat, hook, nat_rules(nat_type));
            let result = check_chain(TableFamily::Ipv4, &c);
            assert_eq!(result.is_ok(), ok, "{nat_type} on {hook}: {result:?}");
            if !ok {
                assert!(matches!(result, Err(ValidationError::NatDirection { .. })));
            }
        }
    }

    #[test]
    fn masquerade_is_a_source_rewrite() {
        let c = chain(ChainType::Nat, Prerouting, nat_rules(NatType::Masquerade));
        assert!(matches!(
            check_chain(TableFamily::Inet, &c),
            Err(ValidationError::NatDirection { .. })
        ));
    }

    #[test]
    fn duplicate_chain_names_are_rejected() {
        let mut table = Table::new("gw", TableFamily::Inet);
        table.chains.push(chain(ChainType::Filter, Forward, filter_rules()));
        table.chains.push(chain(ChainType::Filter, Input, filter_rules()));

        assert!(matches!(
            check_table(&table),
            Err(ValidationError::DuplicateChain { .. })
        ));
    }

    #[test]
    fn table_errors_carry_chain_context() {
        let mut table = Table::new("gw", TableFamily::Ipv4);
        table.chains.push(chain(ChainType::Filter, Ingress, filter_rules()));

        let err = check_table(&table).unwrap_err();
        assert_eq!(err.reason(), "hook_not_allowed");
        assert!(err.to_string().starts_with("chain c:"));
    }

    #[test]
    fn table_names_are_unique_across_the_store() {
        let mut table = Table::new("gw", TableFamily::Inet);
        table.chains.push(chain(ChainType::Filter, Forward, filter_rules()));

        let first = FirewallConfiguration {
            name: "node-a".into(),
            owner: None,
            table: table.clone(),
        };
        let second = FirewallConfiguration {
            name: "node-b".into(),
            owner: None,
            table,
        };
        let store = vec![first.clone(), second.clone()];
        let validator = PolicyValidator::new(&store);

        // Re-validating an object already in the store does not clash with itself.
        let alone = vec![first.clone()];
        assert!(PolicyValidator::new(&alone).check_configuration(&first).is_ok());

        assert!(matches!(
            validator.check_configuration(&second),
            Err(ValidationError::DuplicateTable { .. })
        ));
        assert_eq!(validator.validate().len(), 2);
    }
}
