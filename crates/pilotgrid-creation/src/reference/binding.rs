//! One identical VM per requested node.

use async_trait::async_trait;
use tracing::debug;

use pilotgrid_core::config::CreationConfig;
use pilotgrid_core::*;

pub struct DefaultBinding {
    config: CreationConfig,
}

impl DefaultBinding {
    pub fn new(config: CreationConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BindingAdapter for DefaultBinding {
    async fn process_request(
        &self,
        request: &CreateRequest,
    ) -> Result<Vec<VirtualMachine>, BindingError> {
        if request.image.trim().is_empty() {
            return Err(BindingError::Invalid("image is empty".to_string()));
        }
        if request.resources.cpu_count > self.config.max_cpu_count {
            return Err(BindingError::Denied(format!(
                "{} cpus exceeds limit of {}",
                request.resources.cpu_count, self.config.max_cpu_count
            )));
        }

        let mut associations: Vec<String> = Vec::new();
        for nic in &request.nics {
            if !associations.contains(&nic.network) {
                associations.push(nic.network.clone());
            }
        }
        let vm = VirtualMachine {
            id: None,
            name: request.name.clone(),
            image: request.image.clone(),
            deployment: Deployment {
                memory_mb: request.resources.memory_mb,
                cpu_count: request.resources.cpu_count,
                duration_secs: request.duration_secs,
                charge_ratio: self.config.default_charge_ratio,
            },
            associations,
            nics: request
                .nics
                .iter()
                .map(|n| Nic::unallocated(&n.name, &n.network))
                .collect(),
            unprop_target_suffix: None,
        };
        Ok(vec![vm; request.resources.node_count as usize])
    }

    async fn back_out_allocations(&self, vms: &[VirtualMachine]) {
        debug!(count = vms.len(), "binding holds no allocations to back out");
    }
}
