use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

/// Shape of a free-form address value found in matches and NAT targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Void,
    Address(IpAddr),
    Subnet(IpNet),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid match value {value:?}")]
pub struct ClassifyError {
    pub value: String,
}

/// Classify an optional address string. CIDR notation wins over a bare
/// address, so "10.0.0.1/32" is a subnet.
pub fn classify_address(value: Option<&str>) -> Result<AddressClass, ClassifyError> {
    let Some(raw) = value else {
        return Ok(AddressClass::Void);
    };

    let trimmed = raw.trim();
    if let Ok(net) = trimmed.parse::<IpNet>() {
        return Ok(AddressClass::Subnet(net));
    }
    if let Ok(addr) = trimmed.parse::<IpAddr>() {
        return Ok(AddressClass::Address(addr));
    }

    Err(ClassifyError {
        value: raw.to_string(),
    })
}
