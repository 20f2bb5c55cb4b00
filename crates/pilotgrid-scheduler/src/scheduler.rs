//! SlotScheduler — one pilot slot per VM, group or ensemble.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use pilotgrid_core::*;
use pilotgrid_pilot::{PilotSlotManager, SlotRequest};
use pilotgrid_state::StateStore;

use crate::error::{SchedulerError, SchedulerResult};

/// Node and run window a pilot reported for one VM.
#[derive(Debug, Clone)]
struct Placement {
    node: String,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
}

/// Schedules VMs by reserving pilot slots.
pub struct SlotScheduler {
    store: StateStore,
    slots: Arc<PilotSlotManager>,
    home: SharedHome,
    terminator: OnceLock<Weak<dyn InstanceTerminator>>,
    /// Members collected per co-scheduling id, submitted on proceed.
    ensembles: RwLock<HashMap<String, Vec<SlotRequest>>>,
    /// Pilots that reported before their instance record was written.
    /// Applied on the instance's first state notification.
    early: Mutex<HashMap<VmId, Placement>>,
}

impl SlotScheduler {
    pub fn new(store: StateStore, slots: Arc<PilotSlotManager>, home: SharedHome) -> Self {
        Self {
            store,
            slots,
            home,
            terminator: OnceLock::new(),
            ensembles: RwLock::new(HashMap::new()),
            early: Mutex::new(HashMap::new()),
        }
    }

    /// Register who tears instances down when their slot goes away.
    pub fn set_terminator(&self, terminator: &Arc<dyn InstanceTerminator>) {
        if self.terminator.set(Arc::downgrade(terminator)).is_err() {
            warn!("instance terminator already registered, ignoring");
        }
    }

    /// VM ids waiting on `proceed_coschedule` for `cosched_id`.
    pub async fn pending_ensemble(&self, cosched_id: &str) -> Vec<VmId> {
        self.ensembles
            .read()
            .await
            .get(cosched_id)
            .map(|reqs| reqs.iter().flat_map(|r| r.vmids.iter().copied()).collect())
            .unwrap_or_default()
    }

    /// Rebuild the ensembles still waiting on `proceed_coschedule` from
    /// persisted instances: members carry an ensemble id but have no slot
    /// row yet. Returns how many VMs were recovered.
    pub async fn recover_ensembles(&self) -> SchedulerResult<usize> {
        let mut members: Vec<InstanceResource> = Vec::new();
        for resource in self.store.list_instances()? {
            if resource.ensemble_id.is_some() && self.store.get_slot(resource.id)?.is_none() {
                members.push(resource);
            }
        }
        members.sort_by_key(|r| r.id);

        // One slot request per original schedule call: a group, or a lone VM.
        let mut requests: Vec<(String, Option<String>, SlotRequest)> = Vec::new();
        for member in &members {
            let Some(cosched_id) = member.ensemble_id.clone() else { continue };
            let existing = member.group_id.as_ref().and_then(|group| {
                requests
                    .iter_mut()
                    .find(|(c, g, _)| *c == cosched_id && g.as_ref() == Some(group))
            });
            match existing {
                Some((_, _, request)) => request.vmids.push(member.id),
                None => requests.push((
                    cosched_id,
                    member.group_id.clone(),
                    SlotRequest {
                        vmids: vec![member.id],
                        memory_mb: member.vm.deployment.memory_mb,
                        duration_secs: member.vm.deployment.duration_secs,
                    },
                )),
            }
        }

        let mut ensembles = self.ensembles.write().await;
        for (cosched_id, _, request) in requests {
            let pending = ensembles.entry(cosched_id).or_default();
            if pending.iter().any(|r| r.vmids.iter().any(|id| request.vmids.contains(id))) {
                continue;
            }
            pending.push(request);
        }
        let recovered = members.len();
        if recovered > 0 {
            info!(recovered, ensembles = ensembles.len(), "pending ensembles recovered");
        }
        Ok(recovered)
    }

    async fn reserve(&self, request: &ScheduleRequest) -> SchedulerResult<Vec<VmId>> {
        let ids = self.store.next_vm_ids(request.num_nodes)?;
        let slot_request = SlotRequest {
            vmids: ids.clone(),
            memory_mb: request.memory_mb,
            duration_secs: request.duration_secs,
        };

        if let Some(cosched_id) = &request.cosched_id {
            self.ensembles
                .write()
                .await
                .entry(cosched_id.clone())
                .or_default()
                .push(slot_request);
            debug!(%cosched_id, ?ids, "vms held for co-scheduling");
            return Ok(ids);
        }

        let uuid = self.slots.reserve_space(&slot_request).await?;
        info!(
            ?ids,
            %uuid,
            caller = %request.caller_id,
            group_id = request.group_id.as_deref().unwrap_or(""),
            "vms scheduled"
        );
        Ok(ids)
    }

    async fn place(&self, mut resource: InstanceResource, placement: &Placement) -> Result<(), SchedulingError> {
        resource.node = Some(placement.node.clone());
        resource.start_time = Some(placement.start);
        resource.termination_time = Some(placement.stop);
        resource.ops_enabled = true;
        resource.state = InstanceState::Propagating;
        self.home
            .update(&resource)
            .await
            .map_err(|e| SchedulingError::Internal(e.to_string()))?;
        info!(vmid = resource.id, node = %placement.node, stop = %placement.stop, "instance placed");
        Ok(())
    }

    /// Drop `vmid` from any ensemble still being collected. Returns true if
    /// it was found there.
    async fn forget_pending(&self, vmid: VmId) -> bool {
        let mut ensembles = self.ensembles.write().await;
        let mut found = false;
        for requests in ensembles.values_mut() {
            for request in requests.iter_mut() {
                let before = request.vmids.len();
                request.vmids.retain(|&id| id != vmid);
                found |= request.vmids.len() != before;
            }
            requests.retain(|r| !r.vmids.is_empty());
        }
        ensembles.retain(|_, requests| !requests.is_empty());
        found
    }
}

#[async_trait]
impl Scheduler for SlotScheduler {
    async fn schedule(&self, request: ScheduleRequest) -> Result<Reservation, SchedulingError> {
        if request.num_nodes == 0 {
            return Err(SchedulingError::Denied("zero nodes requested".to_string()));
        }
        let ids = self.reserve(&request).await?;
        Ok(Reservation::pending(ids))
    }

    async fn remove(&self, vmid: VmId) -> Result<(), SchedulingError> {
        self.early.lock().await.remove(&vmid);
        if self.forget_pending(vmid).await {
            debug!(vmid, "removed vm from pending ensemble");
            return Ok(());
        }
        self.slots
            .release_space(vmid)
            .await
            .map_err(|e| SchedulerError::from(e).into())
    }

    async fn state_notification(&self, vmid: VmId, state: InstanceState) {
        debug!(vmid, ?state, "instance state notification");
        if state != InstanceState::Unpropagated {
            return;
        }
        let Some(placement) = self.early.lock().await.remove(&vmid) else {
            return;
        };
        let outcome = match self.home.find(vmid).await {
            Ok(Some(resource)) => self.place(resource, &placement).await,
            Ok(None) => Err(SchedulingError::UnknownVm(vmid)),
            Err(e) => Err(SchedulingError::Internal(e.to_string())),
        };
        if let Err(e) = outcome {
            error!(vmid, error = %e, "failed to apply early placement");
            self.cancel_instance(vmid, TerminationMode::Immediate).await;
        }
    }

    async fn proceed_coschedule(&self, cosched_id: &str) -> Result<(), SchedulingError> {
        let Some(requests) = self.ensembles.write().await.remove(cosched_id) else {
            return Err(SchedulingError::UnknownCosched(cosched_id.to_string()));
        };
        let uuid = self
            .slots
            .reserve_coscheduled_space(&requests, cosched_id)
            .await
            .map_err(SchedulerError::from)?;
        info!(%cosched_id, %uuid, members = requests.len(), "ensemble submitted");
        Ok(())
    }
}

#[async_trait]
impl SlotAdapter for SlotScheduler {
    async fn slot_reserved(
        &self,
        vmid: VmId,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        hostname: &str,
    ) -> Result<(), SchedulingError> {
        let placement = Placement {
            node: hostname.to_string(),
            start,
            stop,
        };
        // Held across the lookup so a placement parked here cannot miss the
        // first state notification.
        let mut early = self.early.lock().await;
        let found = self
            .home
            .find(vmid)
            .await
            .map_err(|e| SchedulingError::Internal(e.to_string()))?;
        let Some(resource) = found else {
            let slot = self
                .store
                .get_slot(vmid)
                .map_err(|e| SchedulingError::from(SchedulerError::from(e)))?;
            if slot.is_none() {
                return Err(SchedulingError::UnknownVm(vmid));
            }
            info!(vmid, %hostname, "pilot reported before the instance was persisted");
            early.insert(vmid, placement);
            return Ok(());
        };
        drop(early);
        self.place(resource, &placement).await
    }

    async fn cancel_instance(&self, vmid: VmId, mode: TerminationMode) {
        if let Some(terminator) = self.terminator.get().and_then(Weak::upgrade) {
            terminator.terminate(vmid, mode).await;
            return;
        }

        warn!(vmid, "no instance terminator registered, removing directly");
        if let Err(e) = self.home.destroy(vmid).await {
            error!(vmid, error = %e, "failed to remove instance record");
        }
        if let Err(e) = self.slots.release_space(vmid).await {
            error!(vmid, error = %e, "failed to release slot");
        }
    }
}
