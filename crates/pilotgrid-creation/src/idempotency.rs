//! Client-token idempotency.
//!
//! A (creator, token) pair is bound to the first request that used it. The
//! binding is recorded in two steps under a per-pair lock: an in-flight
//! marker before creation and the full reservation after. A marker without
//! a group or vm id was left by a crash mid-creation and counts as absent.

use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use pilotgrid_core::*;
use pilotgrid_state::{idempotency_key, IdempotentInstance, IdempotentReservation};

use crate::error::{CreationError, CreationResult};
use crate::manager::CreationManager;

impl CreationManager {
    pub(crate) async fn create_idempotent(
        &self,
        request: &CreateRequest,
        caller: &Caller,
        vms: Vec<VirtualMachine>,
        token: &str,
    ) -> CreationResult<Vec<InstanceResource>> {
        let creator = caller.identity.as_str();
        let timeout = Duration::from_millis(self.config.idempotency_lock_timeout_ms);
        let Some(_guard) = self
            .token_locks
            .lock_timeout(idempotency_key(creator, token), timeout)
            .await
        else {
            self.binding.back_out_allocations(&vms).await;
            return Err(CreationError::Interrupted(format!(
                "timed out after {timeout:?} waiting for another request with the same client token"
            )));
        };

        match self.store.get_reservation(creator, token)? {
            Some(existing) if existing.is_complete() => {
                // The fresh bindings are not needed.
                self.binding.back_out_allocations(&vms).await;
                return self.reuse(&existing, request, token).await;
            }
            Some(_) => {
                warn!(%creator, "discarding incomplete reservation for client token");
            }
            None => {}
        }

        self.store
            .put_reservation(&IdempotentReservation::in_flight(creator, token))?;

        let created = match self.create_vms(request, caller, vms, Some(token)).await {
            Ok(created) => created,
            Err(e) => {
                if let Err(se) = self.store.delete_reservation(creator, token) {
                    error!(%creator, error = %se, "failed to clear in-flight reservation");
                }
                return Err(e);
            }
        };

        let reservation = IdempotentReservation {
            creator_id: creator.to_string(),
            client_token: token.to_string(),
            group_id: created.first().and_then(|r| r.group_id.clone()),
            vm_id: match created.as_slice() {
                [single] if single.group_id.is_none() => Some(single.id),
                _ => None,
            },
            instances: created
                .iter()
                .map(|r| IdempotentInstance {
                    id: r.id,
                    name: r.name.clone(),
                    launch_index: r.launch_index,
                    snapshot: r.clone(),
                })
                .collect(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.put_reservation(&reservation) {
            // The instances exist and are returned; only replay protection
            // for this token is lost.
            error!(%creator, error = %e, "failed to record client token reservation");
        }
        Ok(created)
    }

    /// Return what the token is already bound to, if `request` matches it.
    async fn reuse(
        &self,
        existing: &IdempotentReservation,
        request: &CreateRequest,
        token: &str,
    ) -> CreationResult<Vec<InstanceResource>> {
        let mismatch = |reason: String| CreationError::IdempotentMismatch {
            token: token.to_string(),
            reason,
        };

        let expected = request.resources.node_count as usize;
        if existing.instances.len() != expected {
            return Err(mismatch(format!(
                "{} instances requested, {} bound",
                expected,
                existing.instances.len()
            )));
        }
        if request.is_group() != existing.group_id.is_some() {
            return Err(mismatch("group shape differs".to_string()));
        }

        let mut bound: Vec<&IdempotentInstance> = existing.instances.iter().collect();
        bound.sort_by_key(|i| i.launch_index);

        let mut result = Vec::with_capacity(bound.len());
        for instance in bound {
            if instance.name != request.name {
                return Err(mismatch(format!(
                    "name {:?} differs from bound {:?}",
                    request.name, instance.name
                )));
            }
            match self.home.find(instance.id).await? {
                Some(live) => {
                    let deployed = &live.vm.deployment;
                    if deployed.duration_secs != request.duration_secs {
                        return Err(mismatch("duration differs".to_string()));
                    }
                    if deployed.memory_mb != request.resources.memory_mb {
                        return Err(mismatch("memory differs".to_string()));
                    }
                    if deployed.cpu_count != request.resources.cpu_count {
                        return Err(mismatch("cpu count differs".to_string()));
                    }
                    result.push(live);
                }
                None => {
                    let mut historical = instance.snapshot.clone();
                    historical.state = InstanceState::Destroyed;
                    result.push(historical);
                }
            }
        }

        info!(
            creator = %existing.creator_id,
            count = result.len(),
            "returning instances already bound to client token"
        );
        Ok(result)
    }
}
