//! Per-creator resource limits.

use async_trait::async_trait;

use pilotgrid_core::*;

/// Denies requests that exceed fixed per-request limits.
pub struct LimitAuthorizer {
    max_memory_mb: u64,
    max_duration_secs: u64,
    max_nodes: u32,
}

impl LimitAuthorizer {
    pub fn new(max_memory_mb: u64, max_duration_secs: u64, max_nodes: u32) -> Self {
        Self {
            max_memory_mb,
            max_duration_secs,
            max_nodes,
        }
    }
}

#[async_trait]
impl Authorizer for LimitAuthorizer {
    async fn authorize(
        &self,
        caller: &Caller,
        _request: &CreateRequest,
        vms: &[VirtualMachine],
    ) -> Result<(), AuthorizationError> {
        if vms.len() > self.max_nodes as usize {
            return Err(AuthorizationError::Denied(format!(
                "{} may not start {} vms at once",
                caller.identity,
                vms.len()
            )));
        }
        for vm in vms {
            if vm.deployment.memory_mb > self.max_memory_mb {
                return Err(AuthorizationError::Denied(format!(
                    "{} MB exceeds the {} MB allowed",
                    vm.deployment.memory_mb, self.max_memory_mb
                )));
            }
            if vm.deployment.duration_secs > self.max_duration_secs {
                return Err(AuthorizationError::Denied(format!(
                    "{}s exceeds the {}s allowed",
                    vm.deployment.duration_secs, self.max_duration_secs
                )));
            }
        }
        Ok(())
    }
}
