//! Address pools loaded from `[[networks]]`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use pilotgrid_core::config::{NetworkConfig, NetworkEntry};
use pilotgrid_core::*;

#[derive(Default)]
struct Pool {
    free: VecDeque<NetworkEntry>,
    /// (vm id, nic name) → entry
    leased: HashMap<(VmId, String), NetworkEntry>,
}

/// Hands out configured addresses first come, first served.
pub struct NetworkPool {
    pools: Mutex<HashMap<String, Pool>>,
}

impl NetworkPool {
    pub fn new(networks: &[NetworkConfig]) -> Self {
        let pools = networks
            .iter()
            .map(|n| {
                (
                    n.name.clone(),
                    Pool {
                        free: n.entries.iter().cloned().collect(),
                        leased: HashMap::new(),
                    },
                )
            })
            .collect();
        Self {
            pools: Mutex::new(pools),
        }
    }

    /// Free addresses left on `network`.
    pub fn available(&self, network: &str) -> usize {
        let pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools.get(network).map_or(0, |p| p.free.len())
    }

    /// Re-lease the addresses recorded on persisted instances, so a
    /// restart does not hand them out twice. Returns how many were found.
    pub fn restore(&self, instances: &[InstanceResource]) -> usize {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        let mut restored = 0;
        for instance in instances {
            for nic in &instance.vm.nics {
                let Some(ip) = nic.ip.as_deref() else { continue };
                let Some(pool) = pools.get_mut(&nic.network) else {
                    warn!(vmid = instance.id, network = %nic.network, "instance uses a network that is no longer configured");
                    continue;
                };
                match pool.free.iter().position(|e| e.ip == ip) {
                    Some(pos) => {
                        if let Some(entry) = pool.free.remove(pos) {
                            pool.leased.insert((instance.id, nic.name.clone()), entry);
                            restored += 1;
                        }
                    }
                    None => {
                        warn!(vmid = instance.id, %ip, network = %nic.network, "persisted address is not free in the pool")
                    }
                }
            }
        }
        restored
    }

    fn release(pools: &mut HashMap<String, Pool>, vmid: VmId) -> usize {
        let mut released = 0;
        for pool in pools.values_mut() {
            let keys: Vec<(VmId, String)> = pool
                .leased
                .keys()
                .filter(|(id, _)| *id == vmid)
                .cloned()
                .collect();
            for key in keys {
                if let Some(entry) = pool.leased.remove(&key) {
                    pool.free.push_back(entry);
                    released += 1;
                }
            }
        }
        released
    }
}

fn lease(
    pools: &mut HashMap<String, Pool>,
    vms: &mut [VirtualMachine],
    requested: &[NicRequest],
    leased_here: &mut Vec<VmId>,
) -> Result<(), NetworkError> {
    for vm in vms.iter_mut() {
        let vmid = vm.id.ok_or_else(|| NetworkError::Unassigned(vm.name.clone()))?;
        if vm.nics.is_empty() {
            vm.nics = requested
                .iter()
                .map(|n| Nic::unallocated(&n.name, &n.network))
                .collect();
        }
        leased_here.push(vmid);
        for nic in &mut vm.nics {
            let pool = pools
                .get_mut(&nic.network)
                .ok_or_else(|| NetworkError::UnknownNetwork(nic.network.clone()))?;
            let entry = pool
                .free
                .pop_front()
                .ok_or_else(|| NetworkError::Exhausted(nic.network.clone()))?;
            nic.ip = Some(entry.ip.clone());
            nic.hostname = Some(entry.hostname.clone());
            nic.gateway = entry.gateway.clone();
            nic.mac = entry.mac.clone();
            pool.leased.insert((vmid, nic.name.clone()), entry);
        }
    }
    Ok(())
}

#[async_trait]
impl NetworkAdapter for NetworkPool {
    async fn consume(
        &self,
        vms: &mut [VirtualMachine],
        requested: &[NicRequest],
    ) -> Result<(), NetworkError> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        let mut leased_here: Vec<VmId> = Vec::new();
        let outcome = lease(&mut pools, vms, requested, &mut leased_here);

        if outcome.is_err() {
            // All or nothing.
            for vmid in leased_here {
                Self::release(&mut pools, vmid);
            }
        } else {
            info!(count = vms.len(), "addresses allocated");
        }
        outcome
    }

    async fn back_out_ip_allocations(&self, vms: &[VirtualMachine]) -> Result<(), NetworkError> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        for vm in vms {
            if let Some(vmid) = vm.id {
                let released = Self::release(&mut pools, vmid);
                debug!(vmid, released, "addresses returned");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> NetworkPool {
        NetworkPool::new(&[NetworkConfig {
            name: "public".to_string(),
            entries: (0..n)
                .map(|i| NetworkEntry {
                    ip: format!("10.0.0.{i}"),
                    hostname: format!("vm{i}"),
                    gateway: Some("10.0.0.254".to_string()),
                    mac: None,
                })
                .collect(),
        }])
    }

    fn vm(id: VmId) -> VirtualMachine {
        VirtualMachine {
            id: Some(id),
            name: format!("vm-{id}"),
            image: "base".to_string(),
            deployment: Deployment {
                memory_mb: 256,
                cpu_count: 1,
                duration_secs: 60,
                charge_ratio: 1.0,
            },
            associations: vec!["public".to_string()],
            nics: vec![Nic::unallocated("eth0", "public")],
            unprop_target_suffix: None,
        }
    }

    #[tokio::test]
    async fn allocate_and_return() {
        let pool = pool(2);
        let mut vms = vec![vm(1), vm(2)];
        pool.consume(&mut vms, &[]).await.unwrap();
        assert_eq!(vms[0].nics[0].ip.as_deref(), Some("10.0.0.0"));
        assert_eq!(vms[1].nics[0].hostname.as_deref(), Some("vm1"));
        assert_eq!(pool.available("public"), 0);

        pool.back_out_ip_allocations(&vms).await.unwrap();
        assert_eq!(pool.available("public"), 2);
    }

    #[tokio::test]
    async fn exhaustion_rolls_back_partial_allocation() {
        let pool = pool(1);
        let mut vms = vec![vm(1), vm(2)];
        assert!(matches!(
            pool.consume(&mut vms, &[]).await,
            Err(NetworkError::Exhausted(_))
        ));
        assert_eq!(pool.available("public"), 1);
    }

    #[tokio::test]
    async fn restored_leases_are_not_handed_out_again() {
        let first = pool(3);
        let mut vms = vec![vm(1)];
        first.consume(&mut vms, &[]).await.unwrap();
        let persisted = InstanceResource::blank(1, vms.remove(0));

        let pool = pool(3);
        assert_eq!(pool.restore(std::slice::from_ref(&persisted)), 1);
        assert_eq!(pool.available("public"), 2);

        let mut next = vec![vm(2)];
        pool.consume(&mut next, &[]).await.unwrap();
        assert_eq!(next[0].nics[0].ip.as_deref(), Some("10.0.0.1"));

        pool.back_out_ip_allocations(std::slice::from_ref(&persisted.vm))
            .await
            .unwrap();
        assert_eq!(pool.available("public"), 2);
    }

    #[tokio::test]
    async fn unknown_network_and_missing_id() {
        let pool = pool(1);
        let mut bad = vm(1);
        bad.nics = vec![Nic::unallocated("eth0", "private")];
        assert!(matches!(
            pool.consume(&mut [bad], &[]).await,
            Err(NetworkError::UnknownNetwork(_))
        ));

        let mut unassigned = vm(1);
        unassigned.id = None;
        assert!(matches!(
            pool.consume(&mut [unassigned], &[]).await,
            Err(NetworkError::Unassigned(_))
        ));
    }
}
