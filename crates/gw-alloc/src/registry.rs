use anyhow::Result;
use gw_core::{GatewayConfig, RecoverySource};
use ipnet::IpNet;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::AllocError;
use crate::mark::MarkAllocator;
use crate::pool::IpPool;

/// Process-wide allocator handles. The mark allocator and each pool are
/// populated from the recovery source on first use; concurrent first callers
/// wait for that single scan.
pub struct AllocatorRegistry {
    max_mark: u32,
    cidrs: BTreeMap<String, IpNet>,
    source: Arc<dyn RecoverySource>,
    marks: OnceCell<Arc<MarkAllocator>>,
    pools: Mutex<HashMap<String, Arc<OnceCell<Arc<IpPool>>>>>,
}

impl AllocatorRegistry {
    pub fn new(config: &GatewayConfig, source: Arc<dyn RecoverySource>) -> Result<Self> {
        let cidrs = config
            .pools
            .keys()
            .map(|name| Ok((name.clone(), config.pool_cidr(name)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self {
            max_mark: config.marks.max,
            cidrs,
            source,
            marks: OnceCell::new(),
            pools: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool_names(&self) -> impl Iterator<Item = &str> {
        self.cidrs.keys().map(String::as_str)
    }

    pub async fn marks(&self) -> Result<Arc<MarkAllocator>, AllocError> {
        let marks = self
            .marks
            .get_or_try_init(|| async {
                let recovered = self
                    .source
                    .persisted_marks()
                    .map_err(|e| AllocError::Recovery(format!("{:#}", e)))?;
                Ok::<_, AllocError>(Arc::new(MarkAllocator::from_recovered(
                    self.max_mark,
                    &recovered,
                )))
            })
            .await?;
        Ok(Arc::clone(marks))
    }

    pub async fn pool(&self, name: &str) -> Result<Arc<IpPool>, AllocError> {
        let cidr = *self
            .cidrs
            .get(name)
            .ok_or_else(|| AllocError::UnknownPool(name.to_string()))?;

        let cell = {
            let mut cells = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cells.entry(name.to_string()).or_default())
        };

        let pool = cell
            .get_or_try_init(|| async {
                let pool = IpPool::new(name, cidr);
                let persisted = self
                    .source
                    .persisted_addresses(name)
                    .map_err(|e| AllocError::Recovery(format!("{:#}", e)))?;

                for (key, address) in persisted {
                    if let Err(e) = pool.configure(&key, address) {
                        warn!(pool = name, key = %key, error = %e, "Skipping persisted address");
                    }
                }

                info!(
                    pool = name,
                    cidr = %cidr,
                    in_use = pool.in_use(),
                    "Recovered address pool"
                );
                Ok::<_, AllocError>(Arc::new(pool))
            })
            .await?;

        Ok(Arc::clone(pool))
    }

    /// Pools that have been bootstrapped so far.
    pub fn loaded_pools(&self) -> Vec<Arc<IpPool>> {
        let cells = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pools: Vec<_> = cells.values().filter_map(|cell| cell.get().cloned()).collect();
        pools.sort_by(|a, b| a.name().cmp(b.name()));
        pools
    }
}
