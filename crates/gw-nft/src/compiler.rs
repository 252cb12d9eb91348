use gw_core::{
    classify_address, parse_mark, AddressClass, ClassifyError, DevMatch, DevPosition,
    FilterAction, FilterRule, IpMatch, IpPosition, Match, MatchOperation, MatchTarget, NatRule,
    NatType, RouteRule, RuleRef, TableFamily,
};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;
use tracing::debug;

use crate::expr::{
    CmpOp, Expression, MarkSource, MarkTarget, MetaKey, NatFamily, NatKind, PayloadBase, Verdict,
    IFNAME_SIZE, REG_1, REG_2,
};

const IPV4_SADDR_OFFSET: u32 = 12;
const IPV4_DADDR_OFFSET: u32 = 16;
const IPV6_SADDR_OFFSET: u32 = 8;
const IPV6_DADDR_OFFSET: u32 = 24;

/// A malformed rule. Editing the policy object is the only fix, so these are
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    InvalidValue(#[from] ClassifyError),

    #[error("ip match requires a value")]
    MissingMatchValue,

    #[error("{0} match requires a position")]
    MissingPosition(&'static str),

    #[error("{kind} nat requires a target address")]
    MissingNatTarget { kind: NatType },

    #[error("masquerade does not take a target address, got {0:?}")]
    MasqueradeWithTarget(String),

    #[error("address {value} does not belong to table family {family}")]
    FamilyMismatch { value: String, family: TableFamily },

    #[error("interface name {0:?} must be 1 to 15 bytes long")]
    InterfaceName(String),

    #[error("{action} action requires a value")]
    MissingActionValue { action: &'static str },

    #[error("invalid mark value {0:?}")]
    InvalidActionValue(String),

    #[error("route rule requires a mark")]
    MissingRouteMark,
}

/// Identifies the chain a rule is compiled for. The family decides how
/// addresses are loaded and rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainRef {
    pub family: TableFamily,
    pub table: String,
    pub chain: String,
}

impl ChainRef {
    pub fn new(family: TableFamily, table: &str, chain: &str) -> Self {
        Self {
            family,
            table: table.to_string(),
            chain: chain.to_string(),
        }
    }
}

/// Compile one rule into its ordered primitive sequence: matches first, in
/// list order, then the rule's statement.
pub fn compile_rule(chain: &ChainRef, rule: RuleRef<'_>) -> Result<Vec<Expression>, CompileError> {
    let mut exprs = Vec::new();

    for m in rule.matches() {
        exprs.extend(compile_match(chain.family, m)?);
    }

    match rule {
        RuleRef::Nat(nat) => exprs.extend(compile_nat(chain.family, nat)?),
        RuleRef::Filter(filter) => exprs.push(compile_filter_action(filter)?),
        RuleRef::Route(route) => exprs.push(compile_route_action(route)?),
    }

    debug!(
        table = %chain.table,
        chain = %chain.chain,
        rule = rule.name().unwrap_or("<unnamed>"),
        expressions = exprs.len(),
        "Compiled rule"
    );

    Ok(exprs)
}

pub fn compile_match(family: TableFamily, m: &Match) -> Result<Vec<Expression>, CompileError> {
    let op = cmp_op(m.op);
    match &m.target {
        MatchTarget::Ip(ip) => compile_ip_match(family, op, ip),
        MatchTarget::Dev(dev) => compile_dev_match(op, dev),
    }
}

fn cmp_op(op: MatchOperation) -> CmpOp {
    match op {
        MatchOperation::Eq => CmpOp::Eq,
        MatchOperation::Neq => CmpOp::Neq,
    }
}

fn compile_ip_match(
    family: TableFamily,
    op: CmpOp,
    ip: &IpMatch,
) -> Result<Vec<Expression>, CompileError> {
    let position = ip.position.ok_or(CompileError::MissingPosition("ip"))?;

    match classify_address(ip.value.as_deref())? {
        AddressClass::Void => Err(CompileError::MissingMatchValue),
        AddressClass::Address(addr) => {
            check_family(family, &addr)?;
            Ok(vec![
                load_address(&addr, position),
                Expression::Cmp {
                    op,
                    sreg: REG_1,
                    data: addr_bytes(&addr),
                },
            ])
        }
        AddressClass::Subnet(net) => {
            let network = net.network();
            check_family(family, &network)?;
            let len = addr_len(&network);
            Ok(vec![
                load_address(&network, position),
                Expression::Bitwise {
                    sreg: REG_1,
                    dreg: REG_1,
                    len,
                    mask: addr_bytes(&net.netmask()),
                    xor: vec![0; len as usize],
                },
                Expression::Cmp {
                    op,
                    sreg: REG_1,
                    data: addr_bytes(&network),
                },
            ])
        }
    }
}

fn load_address(addr: &IpAddr, position: IpPosition) -> Expression {
    let offset = match (addr, position) {
        (IpAddr::V4(_), IpPosition::Src) => IPV4_SADDR_OFFSET,
        (IpAddr::V4(_), IpPosition::Dst) => IPV4_DADDR_OFFSET,
        (IpAddr::V6(_), IpPosition::Src) => IPV6_SADDR_OFFSET,
        (IpAddr::V6(_), IpPosition::Dst) => IPV6_DADDR_OFFSET,
    };

    Expression::Payload {
        base: PayloadBase::Network,
        offset,
        len: addr_len(addr),
        dreg: REG_1,
    }
}

fn compile_dev_match(op: CmpOp, dev: &DevMatch) -> Result<Vec<Expression>, CompileError> {
    let position = dev.position.ok_or(CompileError::MissingPosition("dev"))?;
    let key = match position {
        DevPosition::In => MetaKey::IifName,
        DevPosition::Out => MetaKey::OifName,
    };

    Ok(vec![
        Expression::Meta { key, dreg: REG_1 },
        Expression::Cmp {
            op,
            sreg: REG_1,
            data: ifname_bytes(&dev.value)?,
        },
    ])
}

/// Encode an interface name the way the kernel stores it: fixed width,
/// NUL padded, always NUL terminated.
pub fn ifname_bytes(name: &str) -> Result<Vec<u8>, CompileError> {
    let raw = name.as_bytes();
    if raw.is_empty() || raw.len() >= IFNAME_SIZE || raw.contains(&0) {
        return Err(CompileError::InterfaceName(name.to_string()));
    }

    let mut buf = vec![0u8; IFNAME_SIZE];
    buf[..raw.len()].copy_from_slice(raw);
    Ok(buf)
}

fn compile_nat(family: TableFamily, rule: &NatRule) -> Result<Vec<Expression>, CompileError> {
    let target = classify_address(rule.to.as_deref())?;

    let kind = match rule.nat_type {
        NatType::Destination => NatKind::Destination,
        NatType::Source => NatKind::Source,
        NatType::Masquerade => {
            return match target {
                AddressClass::Void => Ok(vec![Expression::Masquerade]),
                _ => Err(CompileError::MasqueradeWithTarget(
                    rule.to.clone().unwrap_or_default(),
                )),
            };
        }
    };

    match target {
        AddressClass::Void => Err(CompileError::MissingNatTarget {
            kind: rule.nat_type,
        }),
        AddressClass::Address(addr) => {
            check_family(family, &addr)?;
            Ok(vec![
                Expression::Immediate {
                    dreg: REG_1,
                    data: addr_bytes(&addr),
                },
                Expression::Nat {
                    kind,
                    family: nat_family(&addr),
                    reg_addr_min: REG_1,
                    reg_addr_max: REG_1,
                    prefix: false,
                },
            ])
        }
        AddressClass::Subnet(net) => {
            let (first, last) = nat_range(&net);
            check_family(family, &first)?;
            Ok(vec![
                Expression::Immediate {
                    dreg: REG_1,
                    data: addr_bytes(&first),
                },
                Expression::Immediate {
                    dreg: REG_2,
                    data: addr_bytes(&last),
                },
                Expression::Nat {
                    kind,
                    family: nat_family(&first),
                    reg_addr_min: REG_1,
                    reg_addr_max: REG_2,
                    prefix: true,
                },
            ])
        }
    }
}

/// Inclusive bounds of a NAT range: the network address and the highest
/// address of the block.
pub fn nat_range(net: &IpNet) -> (IpAddr, IpAddr) {
    match net {
        IpNet::V4(v4) => {
            let base = u32::from(v4.network());
            let last = base | !u32::from(v4.netmask());
            (IpAddr::V4(base.into()), IpAddr::V4(last.into()))
        }
        IpNet::V6(v6) => {
            let base = u128::from(v6.network());
            let last = base | !u128::from(v6.netmask());
            (IpAddr::V6(base.into()), IpAddr::V6(last.into()))
        }
    }
}

fn compile_filter_action(rule: &FilterRule) -> Result<Expression, CompileError> {
    Ok(match rule.action {
        FilterAction::Accept => Expression::Verdict(Verdict::Accept),
        FilterAction::Drop => Expression::Verdict(Verdict::Drop),
        FilterAction::CtMark => {
            let raw = rule
                .value
                .as_deref()
                .ok_or(CompileError::MissingActionValue { action: "ctmark" })?;
            let mark = parse_mark(raw).ok_or_else(|| CompileError::InvalidActionValue(raw.into()))?;
            Expression::SetMark {
                target: MarkTarget::Conntrack,
                source: MarkSource::Value(mark),
            }
        }
        FilterAction::MetaMarkFromCtMark => Expression::SetMark {
            target: MarkTarget::Packet,
            source: MarkSource::Conntrack,
        },
    })
}

fn compile_route_action(rule: &RouteRule) -> Result<Expression, CompileError> {
    let mark = rule.mark.ok_or(CompileError::MissingRouteMark)?;
    Ok(Expression::SetMark {
        target: MarkTarget::Packet,
        source: MarkSource::Value(mark),
    })
}

fn check_family(family: TableFamily, addr: &IpAddr) -> Result<(), CompileError> {
    let ok = match family {
        TableFamily::Ipv4 => addr.is_ipv4(),
        TableFamily::Ipv6 => addr.is_ipv6(),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(CompileError::FamilyMismatch {
            value: addr.to_string(),
            family,
        })
    }
}

fn nat_family(addr: &IpAddr) -> NatFamily {
    match addr {
        IpAddr::V4(_) => NatFamily::Ipv4,
        IpAddr::V6(_) => NatFamily::Ipv6,
    }
}

fn addr_len(addr: &IpAddr) -> u32 {
    match addr {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 16,
    }
}

fn addr_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}
