//! Translate compiled programs into the nftables JSON schema accepted by
//! `nft -j -f`.

use gw_core::TableFamily;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

use crate::expr::{
    CmpOp, Expression, MarkSource, MarkTarget, MetaKey, NatFamily, NatKind, PayloadBase, Verdict,
};
use crate::program::{CompiledRule, TableProgram};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("rule {rule}: register {reg} read before it was loaded")]
    UnsetRegister { rule: String, reg: u8 },

    #[error("rule {rule}: {detail}")]
    Operand { rule: String, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Address,
    IfName,
}

#[derive(Debug, Clone)]
enum Operand {
    Loaded { left: Value, kind: Kind },
    Constant(Vec<u8>),
}

/// Render a whole table: make sure it exists, drop it, then recreate it with
/// its chains and rules. Dropping the table clears stale chains and lets base
/// chains change hook or priority. `nft` applies the batch atomically.
pub fn render_table(program: &TableProgram) -> Result<Value, RenderError> {
    let family = program.family.as_str();
    let table = json!({"table": {"family": family, "name": program.name}});
    let mut nftables = vec![
        json!({"add": table.clone()}),
        json!({"delete": table.clone()}),
        json!({"add": table}),
    ];

    for chain in &program.chains {
        nftables.push(json!({
            "add": {
                "chain": {
                    "family": family,
                    "table": program.name,
                    "name": chain.name,
                    "type": chain.chain_type.as_str(),
                    "hook": chain.hook.as_str(),
                    "prio": chain.priority,
                    "policy": chain.policy.as_str(),
                }
            }
        }));
    }

    for rule in program.rules() {
        nftables.push(json!({"add": {"rule": render_rule(rule)?}}));
    }

    Ok(json!({"nftables": nftables}))
}

pub fn render_delete_table(family: TableFamily, name: &str) -> Value {
    json!({"nftables": [
        {"delete": {"table": {"family": family.as_str(), "name": name}}}
    ]})
}

/// Render a single rule object, keyed by its comment.
pub fn render_rule(rule: &CompiledRule) -> Result<Value, RenderError> {
    Ok(json!({
        "family": rule.chain.family.as_str(),
        "table": rule.chain.table,
        "chain": rule.chain.chain,
        "comment": rule.id,
        "expr": render_statements(&rule.id, &rule.exprs)?,
    }))
}

/// Fold register loads, masks and compares into nftables statements.
fn render_statements(rule: &str, exprs: &[Expression]) -> Result<Vec<Value>, RenderError> {
    let mut regs: HashMap<u8, Operand> = HashMap::new();
    let mut statements = Vec::new();

    let operand_err = |detail: String| RenderError::Operand {
        rule: rule.to_string(),
        detail,
    };

    for expr in exprs {
        match expr {
            Expression::Payload {
                base,
                offset,
                len,
                dreg,
            } => {
                let base = match base {
                    PayloadBase::Link => "ll",
                    PayloadBase::Network => "nh",
                    PayloadBase::Transport => "th",
                };
                regs.insert(
                    *dreg,
                    Operand::Loaded {
                        left: json!({"payload": {"base": base, "offset": offset * 8, "len": len * 8}}),
                        kind: Kind::Address,
                    },
                );
            }
            Expression::Meta { key, dreg } => {
                let (name, kind) = match key {
                    MetaKey::IifName => ("iifname", Kind::IfName),
                    MetaKey::OifName => ("oifname", Kind::IfName),
                    MetaKey::Mark => ("mark", Kind::Address),
                };
                regs.insert(
                    *dreg,
                    Operand::Loaded {
                        left: json!({"meta": {"key": name}}),
                        kind,
                    },
                );
            }
            Expression::Bitwise {
                sreg, dreg, mask, ..
            } => {
                let Some(Operand::Loaded { left, kind }) = regs.get(sreg).cloned() else {
                    return Err(RenderError::UnsetRegister {
                        rule: rule.to_string(),
                        reg: *sreg,
                    });
                };
                let mask = bytes_to_addr(mask)
                    .ok_or_else(|| operand_err(format!("unsupported mask width {}", mask.len())))?;
                regs.insert(
                    *dreg,
                    Operand::Loaded {
                        left: json!({"&": [left, mask.to_string()]}),
                        kind,
                    },
                );
            }
            Expression::Cmp { op, sreg, data } => {
                let Some(Operand::Loaded { left, kind }) = regs.get(sreg).cloned() else {
                    return Err(RenderError::UnsetRegister {
                        rule: rule.to_string(),
                        reg: *sreg,
                    });
                };
                let right = match kind {
                    Kind::Address => bytes_to_addr(data)
                        .map(|a| Value::String(a.to_string()))
                        .ok_or_else(|| {
                            operand_err(format!("unsupported address width {}", data.len()))
                        })?,
                    Kind::IfName => Value::String(
                        String::from_utf8_lossy(data)
                            .trim_end_matches('\0')
                            .to_string(),
                    ),
                };
                let op = match op {
                    CmpOp::Eq => "==",
                    CmpOp::Neq => "!=",
                };
                statements.push(json!({"match": {"op": op, "left": left, "right": right}}));
            }
            Expression::Immediate { dreg, data } => {
                regs.insert(*dreg, Operand::Constant(data.clone()));
            }
            Expression::Nat {
                kind,
                family,
                reg_addr_min,
                reg_addr_max,
                ..
            } => {
                let min = constant_addr(&regs, *reg_addr_min)
                    .ok_or_else(|| operand_err(format!("nat register {} holds no address", reg_addr_min)))?;
                let max = constant_addr(&regs, *reg_addr_max)
                    .ok_or_else(|| operand_err(format!("nat register {} holds no address", reg_addr_max)))?;

                let addr = if min == max {
                    Value::String(min.to_string())
                } else {
                    json!({"range": [min.to_string(), max.to_string()]})
                };
                let family = match family {
                    NatFamily::Ipv4 => "ip",
                    NatFamily::Ipv6 => "ip6",
                };
                let statement = match kind {
                    NatKind::Destination => "dnat",
                    NatKind::Source => "snat",
                };
                statements.push(json!({statement: {"family": family, "addr": addr}}));
            }
            Expression::Masquerade => statements.push(json!({"masquerade": null})),
            Expression::SetMark { target, source } => {
                let key = match target {
                    MarkTarget::Conntrack => json!({"ct": {"key": "mark"}}),
                    MarkTarget::Packet => json!({"meta": {"key": "mark"}}),
                };
                let value = match source {
                    MarkSource::Value(mark) => json!(mark),
                    MarkSource::Conntrack => json!({"ct": {"key": "mark"}}),
                };
                statements.push(json!({"mangle": {"key": key, "value": value}}));
            }
            Expression::Verdict(Verdict::Accept) => statements.push(json!({"accept": null})),
            Expression::Verdict(Verdict::Drop) => statements.push(json!({"drop": null})),
        }
    }

    Ok(statements)
}

fn constant_addr(regs: &HashMap<u8, Operand>, reg: u8) -> Option<IpAddr> {
    match regs.get(&reg) {
        Some(Operand::Constant(data)) => bytes_to_addr(data),
        _ => None,
    }
}

fn bytes_to_addr(data: &[u8]) -> Option<IpAddr> {
    match data.len() {
        4 => {
            let octets: [u8; 4] = data.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = data.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
