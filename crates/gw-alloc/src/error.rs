use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("no free mark in 1..={max}")]
    MarksExhausted { max: u32 },

    #[error("pool {pool} ({cidr}) has no free address")]
    PoolExhausted { pool: String, cidr: IpNet },

    #[error("address {address} is outside pool {pool} ({cidr})")]
    OutsidePool {
        pool: String,
        address: IpAddr,
        cidr: IpNet,
    },

    #[error("address {address} in pool {pool} is already reserved by {holder}")]
    AddressInUse {
        pool: String,
        address: IpAddr,
        holder: String,
    },

    #[error("pool {0} is not configured")]
    UnknownPool(String),

    #[error("failed to recover allocator state: {0}")]
    Recovery(String),
}

impl AllocError {
    /// Exhaustion clears up once other entities release their resources.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MarksExhausted { .. } | Self::PoolExhausted { .. } | Self::Recovery(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exhaustion_and_recovery_are_retryable() {
        let cidr: IpNet = "10.0.0.0/30".parse().unwrap();
        assert!(AllocError::MarksExhausted { max: 4 }.is_retryable());
        assert!(AllocError::PoolExhausted {
            pool: "fabric".into(),
            cidr
        }
        .is_retryable());
        assert!(!AllocError::UnknownPool("nope".into()).is_retryable());
        assert!(!AllocError::AddressInUse {
            pool: "fabric".into(),
            address: "10.0.0.1".parse().unwrap(),
            holder: "a".into(),
        }
        .is_retryable());
    }
}
