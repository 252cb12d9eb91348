//! Low-level rule primitives and their stable byte encoding.
//!
//! Each [`Expression`] corresponds to one kernel packet-filter primitive.
//! [`Expression::encode`] produces the versioned representation used to
//! decide whether an installed rule must be replaced, so the layout below
//! must only change together with [`ENCODING_VERSION`].

use serde::{Deserialize, Serialize};

/// Version prefix written in front of every encoded expression.
pub const ENCODING_VERSION: u8 = 1;

/// First general purpose data register.
pub const REG_1: u8 = 1;
/// Second general purpose data register.
pub const REG_2: u8 = 2;

/// Fixed width of an interface name, including the trailing NUL.
pub const IFNAME_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadBase {
    Link,
    Network,
    Transport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaKey {
    IifName,
    OifName,
    Mark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Eq,
    Neq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatKind {
    Destination,
    Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatFamily {
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkTarget {
    Conntrack,
    Packet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkSource {
    Value(u32),
    Conntrack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accept,
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expression {
    /// Load `len` bytes at `offset` from a packet header into `dreg`.
    Payload {
        base: PayloadBase,
        offset: u32,
        len: u32,
        dreg: u8,
    },
    /// Load packet metadata into `dreg`.
    Meta { key: MetaKey, dreg: u8 },
    /// Compare `sreg` against `data`; the rule stops on mismatch.
    Cmp { op: CmpOp, sreg: u8, data: Vec<u8> },
    /// `dreg = (sreg & mask) ^ xor` over `len` bytes.
    Bitwise {
        sreg: u8,
        dreg: u8,
        len: u32,
        mask: Vec<u8>,
        xor: Vec<u8>,
    },
    /// Load constant `data` into `dreg`.
    Immediate { dreg: u8, data: Vec<u8> },
    /// Rewrite an address to the range held in the two registers.
    Nat {
        kind: NatKind,
        family: NatFamily,
        reg_addr_min: u8,
        reg_addr_max: u8,
        prefix: bool,
    },
    Masquerade,
    SetMark {
        target: MarkTarget,
        source: MarkSource,
    },
    Verdict(Verdict),
}

mod tag {
    pub const PAYLOAD: u8 = 1;
    pub const META: u8 = 2;
    pub const CMP: u8 = 3;
    pub const BITWISE: u8 = 4;
    pub const IMMEDIATE: u8 = 5;
    pub const NAT: u8 = 6;
    pub const MASQUERADE: u8 = 7;
    pub const SET_MARK: u8 = 8;
    pub const VERDICT: u8 = 9;
}

impl Expression {
    /// Append the encoded form of this expression to `buf`.
    ///
    /// Layout: version byte, tag byte, then fields in declaration order.
    /// Integers are little-endian, byte strings are prefixed by a `u32` length.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(ENCODING_VERSION);

        match self {
            Self::Payload {
                base,
                offset,
                len,
                dreg,
            } => {
                buf.push(tag::PAYLOAD);
                buf.push(match base {
                    PayloadBase::Link => 0,
                    PayloadBase::Network => 1,
                    PayloadBase::Transport => 2,
                });
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&len.to_le_bytes());
                buf.push(*dreg);
            }
            Self::Meta { key, dreg } => {
                buf.push(tag::META);
                buf.push(match key {
                    MetaKey::IifName => 0,
                    MetaKey::OifName => 1,
                    MetaKey::Mark => 2,
                });
                buf.push(*dreg);
            }
            Self::Cmp { op, sreg, data } => {
                buf.push(tag::CMP);
                buf.push(match op {
                    CmpOp::Eq => 0,
                    CmpOp::Neq => 1,
                });
                buf.push(*sreg);
                put_bytes(buf, data);
            }
            Self::Bitwise {
                sreg,
                dreg,
                len,
                mask,
                xor,
            } => {
                buf.push(tag::BITWISE);
                buf.push(*sreg);
                buf.push(*dreg);
                buf.extend_from_slice(&len.to_le_bytes());
                put_bytes(buf, mask);
                put_bytes(buf, xor);
            }
            Self::Immediate { dreg, data } => {
                buf.push(tag::IMMEDIATE);
                buf.push(*dreg);
                put_bytes(buf, data);
            }
            Self::Nat {
                kind,
                family,
                reg_addr_min,
                reg_addr_max,
                prefix,
            } => {
                buf.push(tag::NAT);
                buf.push(match kind {
                    NatKind::Destination => 0,
                    NatKind::Source => 1,
                });
                buf.push(match family {
                    NatFamily::Ipv4 => 4,
                    NatFamily::Ipv6 => 6,
                });
                buf.push(*reg_addr_min);
                buf.push(*reg_addr_max);
                buf.push(u8::from(*prefix));
            }
            Self::Masquerade => buf.push(tag::MASQUERADE),
            Self::SetMark { target, source } => {
                buf.push(tag::SET_MARK);
                buf.push(match target {
                    MarkTarget::Conntrack => 0,
                    MarkTarget::Packet => 1,
                });
                match source {
                    MarkSource::Value(value) => {
                        buf.push(0);
                        buf.extend_from_slice(&value.to_le_bytes());
                    }
                    MarkSource::Conntrack => buf.push(1),
                }
            }
            Self::Verdict(verdict) => {
                buf.push(tag::VERDICT);
                buf.push(match verdict {
                    Verdict::Accept => 0,
                    Verdict::Drop => 1,
                });
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Short mnemonic, used in logs and text listings.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::Payload { .. } => "payload",
            Self::Meta { .. } => "meta",
            Self::Cmp { .. } => "cmp",
            Self::Bitwise { .. } => "bitwise",
            Self::Immediate { .. } => "immediate",
            Self::Nat { .. } => "nat",
            Self::Masquerade => "masq",
            Self::SetMark { .. } => "mark",
            Self::Verdict(_) => "verdict",
        }
    }
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
}

/// Compare two expression sequences by length, then by encoded bytes.
pub fn sequences_equal(left: &[Expression], right: &[Expression]) -> bool {
    left.len() == right.len() && left.iter().zip(right).all(|(l, r)| l.encode() == r.encode())
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Payload {
                base,
                offset,
                len,
                dreg,
            } => write!(f, "[ payload load {}b @ {:?} + {} => reg {} ]", len, base, offset, dreg),
            Self::Meta { key, dreg } => write!(f, "[ meta load {:?} => reg {} ]", key, dreg),
            Self::Cmp { op, sreg, data } => {
                write!(f, "[ cmp {:?} reg {} 0x{} ]", op, sreg, hex(data))
            }
            Self::Bitwise {
                sreg, dreg, mask, xor, ..
            } => write!(
                f,
                "[ bitwise reg {} = ( reg {} & 0x{} ) ^ 0x{} ]",
                dreg,
                sreg,
                hex(mask),
                hex(xor)
            ),
            Self::Immediate { dreg, data } => {
                write!(f, "[ immediate reg {} 0x{} ]", dreg, hex(data))
            }
            Self::Nat {
                kind,
                family,
                reg_addr_min,
                reg_addr_max,
                prefix,
            } => write!(
                f,
                "[ nat {:?} {:?} addr_min reg {} addr_max reg {}{} ]",
                kind,
                family,
                reg_addr_min,
                reg_addr_max,
                if *prefix { " prefix" } else { "" }
            ),
            Self::Masquerade => write!(f, "[ masq ]"),
            Self::SetMark { target, source } => {
                write!(f, "[ mark set {:?} from {:?} ]", target, source)
            }
            Self::Verdict(verdict) => write!(f, "[ immediate reg 0 {:?} ]", verdict),
        }
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}
