use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::model::FirewallConfiguration;

/// Pool serving inter-node fabric addresses.
pub const FABRIC_POOL: &str = "fabric";
/// Pool serving gateway addresses.
pub const GATEWAY_POOL: &str = "gateway";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub version: u32,
    /// Pool name to CIDR.
    #[serde(default)]
    pub pools: BTreeMap<String, String>,
    #[serde(default)]
    pub marks: MarkConfig,
    /// Persisted cluster objects used to recover allocator state.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    /// Last program written to the kernel, used to skip no-op writes.
    #[serde(default)]
    pub installed_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkConfig {
    #[serde(default = "default_max_mark")]
    pub max: u32,
}

fn default_max_mark() -> u32 {
    u32::MAX
}

impl Default for MarkConfig {
    fn default() -> Self {
        Self {
            max: default_max_mark(),
        }
    }
}

impl GatewayConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Failed to parse gateway config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read gateway config from {:?}", path))?;
        Self::from_yaml(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.marks.max == 0 {
            anyhow::bail!("marks.max must be at least 1");
        }
        for (name, cidr) in &self.pools {
            cidr.parse::<IpNet>()
                .with_context(|| format!("Invalid CIDR '{}' for pool {}", cidr, name))?;
        }
        Ok(())
    }

    /// Parsed CIDR of a configured pool.
    pub fn pool_cidr(&self, pool: &str) -> Result<IpNet> {
        let cidr = self
            .pools
            .get(pool)
            .with_context(|| format!("Pool {} is not configured", pool))?;
        cidr.parse()
            .with_context(|| format!("Invalid CIDR '{}' for pool {}", cidr, pool))
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let mut pools = BTreeMap::new();
        pools.insert(FABRIC_POOL.to_string(), "10.80.0.0/16".to_string());
        pools.insert(GATEWAY_POOL.to_string(), "10.70.0.0/24".to_string());

        Self {
            version: 1,
            pools,
            marks: MarkConfig::default(),
            state_path: None,
            installed_path: None,
        }
    }
}

/// Every stored firewall configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyStore {
    #[serde(default)]
    pub configurations: Vec<FirewallConfiguration>,
}

impl PolicyStore {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse policy store")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policies from {:?}", path))?;
        Self::from_yaml(&content)
    }

    pub fn get(&self, name: &str) -> Option<&FirewallConfiguration> {
        self.configurations.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gateway_config() {
        let yaml = r#"
version: 1
pools:
  fabric: 10.80.0.0/16
  gateway: 10.70.0.0/29
marks:
  max: 4096
statePath: /var/lib/gwarden/cluster.yaml
"#;
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.marks.max, 4096);
        assert_eq!(
            config.pool_cidr(GATEWAY_POOL).unwrap(),
            "10.70.0.0/29".parse::<IpNet>().unwrap()
        );
        assert!(config.installed_path.is_none());
    }

    #[test]
    fn rejects_invalid_pool_cidr() {
        let yaml = "version: 1\npools:\n  fabric: 10.80.0.0/99\n";
        assert!(GatewayConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn marks_default_to_full_range() {
        let config = GatewayConfig::from_yaml("version: 1\n").unwrap();
        assert_eq!(config.marks.max, u32::MAX);
        assert!(config.pool_cidr(FABRIC_POOL).is_err());
    }

    #[test]
    fn parses_policy_store() {
        let yaml = r#"
configurations:
  - name: gw-remote-a
    owner: remote-a
    table:
      name: remote-a
      family: ip
      chains:
        - name: postrouting
          type: nat
          hook: postrouting
          priority: 100
          rules:
            natRules:
              - name: masq
                natType: masquerade
                match:
                  - op: eq
                    dev:
                      value: eth0
                      position: out
"#;
        let store = PolicyStore::from_yaml(yaml).unwrap();
        assert_eq!(store.configurations.len(), 1);
        assert_eq!(store.get("gw-remote-a").unwrap().owner.as_deref(), Some("remote-a"));
    }
}
