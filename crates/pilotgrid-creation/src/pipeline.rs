//! The multi-phase creation pipeline.
//!
//! ```text
//! 1 authorize ─▶ 2 schedule ─▶ 3 network ─▶ 4 ids ─▶ 5 charge ─▶ 6 persist ─▶ 7 notify
//! ```
//!
//! A failure in phase *k* undoes what phases before *k* committed, in
//! reverse order, and nothing else. Ids are copied onto the bindings just
//! before network allocation because address leases are keyed by VM id;
//! the copy has no side effect to undo.

use std::time::Duration;

use tracing::{error, info};
use uuid::Uuid;

use pilotgrid_core::*;

use crate::bootstrap::bootstrap_file;
use crate::error::{CreationError, CreationResult};
use crate::manager::CreationManager;

/// What has been committed so far and must be undone on failure.
#[derive(Default)]
struct Committed<'a> {
    vms: &'a [VirtualMachine],
    scheduled: Vec<VmId>,
    network: bool,
    charged: Vec<VmId>,
    persisted: Vec<VmId>,
}

impl CreationManager {
    pub(crate) async fn create_vms(
        &self,
        request: &CreateRequest,
        caller: &Caller,
        mut vms: Vec<VirtualMachine>,
        client_token: Option<&str>,
    ) -> CreationResult<Vec<InstanceResource>> {
        let group_id = request.is_group().then(|| Uuid::new_v4().to_string());

        // 1. Authorization.
        if !caller.superuser && !request.kind.skips_authorization() {
            if let Err(e) = self.authorizer.authorize(caller, request, &vms).await {
                self.compensate("authorization", caller, Committed { vms: &vms, ..Default::default() })
                    .await;
                return Err(e.into());
            }
        }

        // 2. Scheduling.
        let reservation = match self.schedule_impl(request, caller, &vms, group_id.as_deref()).await {
            Ok(reservation) => reservation,
            Err(e) => {
                self.compensate("scheduling", caller, Committed { vms: &vms, ..Default::default() })
                    .await;
                return Err(e);
            }
        };
        let ids = reservation.ids.clone();
        if let Err(msg) = reservation.validate(vms.len()) {
            let committed = Committed {
                vms: &vms,
                scheduled: ids,
                ..Default::default()
            };
            self.compensate("scheduling", caller, committed).await;
            return Err(CreationError::Scheduling(msg));
        }

        // 3. Network, 4. ids.
        for (vm, id) in vms.iter_mut().zip(&ids) {
            vm.id = Some(*id);
        }
        if let Err(e) = self.network.consume(&mut vms, &request.nics).await {
            let committed = Committed {
                vms: &vms,
                scheduled: ids,
                network: true,
                ..Default::default()
            };
            self.compensate("network allocation", caller, committed).await;
            return Err(e.into());
        }
        if vms.len() > 1 {
            for vm in &mut vms {
                vm.unprop_target_suffix = vm.id.map(|id| format!("-{id}"));
            }
        }

        // 5. Accounting.
        let mut charged = Vec::with_capacity(vms.len());
        if let Some(accounting) = &self.accounting {
            for vm in &vms {
                let Some(vmid) = vm.id else { continue };
                let charge = Charge {
                    vmid,
                    creator: caller.identity.clone(),
                    minutes: vm.deployment.duration_secs.div_ceil(60),
                    cpu_count: vm.deployment.cpu_count,
                    memory_mb: vm.deployment.memory_mb,
                    charge_ratio: vm.deployment.charge_ratio,
                };
                if let Err(e) = accounting.create(charge).await {
                    let committed = Committed {
                        vms: &vms,
                        scheduled: ids,
                        network: true,
                        charged,
                        ..Default::default()
                    };
                    self.compensate("accounting", caller, committed).await;
                    return Err(e.into());
                }
                charged.push(vmid);
            }
        }

        // 6. Materialization.
        let mut created: Vec<InstanceResource> = Vec::with_capacity(vms.len());
        for (index, vm) in vms.iter().enumerate() {
            let result = match vm.id {
                Some(vmid) => {
                    let resource = self.populate(request, caller, vm, vmid, index as u32, group_id.as_deref(), client_token);
                    self.home.create(&resource).await.map(|()| resource)
                }
                None => Err(HomeError::Storage(format!("vm {} has no id", vm.name))),
            };
            match result {
                Ok(resource) => created.push(resource),
                Err(e) => {
                    error!(index, error = %e, "failed to persist instance, destroying earlier ones");
                    let committed = Committed {
                        vms: &vms,
                        scheduled: ids,
                        network: true,
                        charged,
                        persisted: created.iter().map(|r| r.id).collect(),
                    };
                    self.compensate("materialization", caller, committed).await;
                    return Err(CreationError::Materialization { source: e });
                }
            }
        }

        // 7. Deferred notifications.
        self.notify_first_state(ids.clone(), request.kind);

        info!(
            ?ids,
            caller = %caller.identity,
            group_id = group_id.as_deref().unwrap_or(""),
            cosched_id = request.cosched_id.as_deref().unwrap_or(""),
            "instances created"
        );
        Ok(created)
    }

    /// Derive the reservation from the first binding; group members are
    /// homogeneous.
    async fn schedule_impl(
        &self,
        request: &CreateRequest,
        caller: &Caller,
        vms: &[VirtualMachine],
        group_id: Option<&str>,
    ) -> CreationResult<Reservation> {
        let Some(first) = vms.first() else {
            return Err(CreationError::Request("nothing to schedule".to_string()));
        };
        let schedule = ScheduleRequest {
            memory_mb: first.deployment.memory_mb,
            cores: first.deployment.cpu_count,
            duration_secs: first.deployment.duration_secs,
            associations: first.associations.clone(),
            num_nodes: vms.len() as u32,
            group_id: group_id.map(str::to_string),
            cosched_id: request.cosched_id.clone(),
            preemptable: request.preemptable,
            caller_id: caller.identity.clone(),
        };
        Ok(self.scheduler.schedule(schedule).await?)
    }

    #[allow(clippy::too_many_arguments)]
    fn populate(
        &self,
        request: &CreateRequest,
        caller: &Caller,
        vm: &VirtualMachine,
        vmid: VmId,
        launch_index: u32,
        group_id: Option<&str>,
        client_token: Option<&str>,
    ) -> InstanceResource {
        let mut resource = self.home.new_instance(vmid, vm.clone());
        resource.name = vm.name.clone();
        resource.creator = caller.identity.clone();
        resource.group_id = group_id.map(str::to_string);
        resource.ensemble_id = request.cosched_id.clone();
        resource.launch_index = launch_index;
        resource.state = InstanceState::Unpropagated;
        resource.ops_enabled = false;
        resource.client_token = client_token.map(str::to_string);
        resource.file_copy =
            bootstrap_file(vm, request.context.as_deref(), &self.config.bootstrap_path);
        resource
    }

    /// Undo `committed` in reverse phase order.
    async fn compensate(
        &self,
        phase: &str,
        caller: &Caller,
        committed: Committed<'_>,
    ) -> CompensationResult {
        let mut result = CompensationResult::new(format!("create rollback after {phase} failure"));

        for vmid in &committed.persisted {
            result.record(
                format!("destroy instance {vmid}"),
                self.home.destroy(*vmid).await.map(|_| ()),
            );
        }
        if let Some(accounting) = &self.accounting {
            for vmid in &committed.charged {
                result.record(
                    format!("accounting {vmid}"),
                    accounting.destroy(*vmid, &caller.identity).await,
                );
            }
        }
        if committed.network {
            result.record(
                "network",
                self.network.back_out_ip_allocations(committed.vms).await,
            );
        }
        for vmid in &committed.scheduled {
            result.record(
                format!("scheduling {vmid}"),
                self.scheduler.remove(*vmid).await,
            );
        }
        self.binding.back_out_allocations(committed.vms).await;
        result.succeeded("binding");

        result.log();
        result
    }

    /// Tell the scheduler, then the async request manager, that the
    /// instances reached their first legal state. Runs off the calling task.
    fn notify_first_state(&self, ids: Vec<VmId>, kind: RequestKind) {
        let scheduler = self.scheduler.clone();
        let async_requests = self.async_requests.clone();
        let first = Duration::from_millis(self.config.first_notification_delay_ms);
        let second = Duration::from_millis(self.config.second_notification_delay_ms);

        tokio::spawn(async move {
            tokio::time::sleep(first).await;
            for vmid in &ids {
                scheduler
                    .state_notification(*vmid, InstanceState::Unpropagated)
                    .await;
            }
            if kind == RequestKind::Spot {
                return;
            }
            tokio::time::sleep(second.saturating_sub(first)).await;
            for vmid in &ids {
                async_requests
                    .state_notification(*vmid, InstanceState::Unpropagated)
                    .await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::testing::{alice, request, Faults, Harness};
    use crate::CreationError;
    use pilotgrid_core::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn single_node_commits_every_phase() {
        let h = Harness::new(Faults::default());

        let created = h.manager.create(&request("web", 1), &alice()).await.unwrap();

        assert_eq!(created.len(), 1);
        let vm = &created[0];
        assert_eq!(vm.id, 1);
        assert_eq!(vm.state, InstanceState::Unpropagated);
        assert!(!vm.ops_enabled);
        assert!(vm.group_id.is_none());
        assert!(vm.vm.unprop_target_suffix.is_none());
        assert_eq!(vm.vm.nics[0].ip.as_deref(), Some("10.0.0.1"));
        assert!(vm.file_copy.is_some());
        assert_eq!(
            h.log(),
            strings(&["schedule", "network.consume", "accounting.create 1", "home.create 1"])
        );
        assert!(h.store.get_instance(1).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn group_members_share_group_and_get_suffixes() {
        let h = Harness::new(Faults::default());

        let created = h.manager.create(&request("grid", 3), &alice()).await.unwrap();

        assert_eq!(created.len(), 3);
        let group = created[0].group_id.clone().unwrap();
        for (index, vm) in created.iter().enumerate() {
            assert_eq!(vm.group_id.as_deref(), Some(group.as_str()));
            assert_eq!(vm.launch_index, index as u32);
            assert_eq!(vm.vm.unprop_target_suffix, Some(format!("-{}", vm.id)));
        }
        assert_eq!(h.store.list_instances_for_group(&group).unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn first_state_reaches_scheduler_before_async_manager() {
        let h = Harness::new(Faults::default());
        h.manager.create(&request("web", 2), &alice()).await.unwrap();

        // Nothing is delivered on the calling task.
        assert!(h.scheduler.notified.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;

        let scheduler = h.scheduler.notified.lock().unwrap().clone();
        let asynchronous = h.async_requests.notified.lock().unwrap().clone();
        assert_eq!(scheduler.iter().map(|n| n.0).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(asynchronous.len(), 2);
        assert!(asynchronous.iter().all(|n| n.1 == InstanceState::Unpropagated));
        assert!(asynchronous[0].2 > scheduler[1].1);
    }

    #[tokio::test(start_paused = true)]
    async fn spot_requests_skip_authorization_and_async_notification() {
        let h = Harness::new(Faults {
            deny: true,
            ..Default::default()
        });
        let mut spot = request("spot", 1);
        spot.kind = RequestKind::Spot;

        h.manager.create(&spot, &alice()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(h.scheduler.notified.lock().unwrap().len(), 1);
        assert!(h.async_requests.notified.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn authorization_failure_only_backs_out_binding() {
        let h = Harness::new(Faults {
            deny: true,
            ..Default::default()
        });

        let err = h.manager.create(&request("web", 1), &alice()).await.unwrap_err();

        assert!(matches!(err, CreationError::Denied(_)));
        assert_eq!(h.log(), strings(&["binding.backout"]));
    }

    #[tokio::test]
    async fn superuser_bypasses_authorization() {
        let h = Harness::new(Faults {
            deny: true,
            ..Default::default()
        });

        let created = h
            .manager
            .create(&request("web", 1), &Caller::superuser("root"))
            .await
            .unwrap();
        assert_eq!(created[0].creator, "root");
    }

    #[tokio::test]
    async fn scheduling_failure_undoes_binding() {
        let h = Harness::new(Faults {
            schedule: true,
            ..Default::default()
        });

        let err = h.manager.create(&request("web", 2), &alice()).await.unwrap_err();

        assert!(matches!(err, CreationError::Denied(_)));
        assert_eq!(h.log(), strings(&["schedule", "binding.backout"]));
    }

    #[tokio::test]
    async fn network_failure_releases_reservation() {
        let h = Harness::new(Faults {
            network: true,
            ..Default::default()
        });

        let err = h.manager.create(&request("web", 2), &alice()).await.unwrap_err();

        assert!(matches!(err, CreationError::Network(_)));
        assert_eq!(
            h.log(),
            strings(&[
                "schedule",
                "network.consume",
                "network.backout [1, 2]",
                "scheduler.remove 1",
                "scheduler.remove 2",
                "binding.backout",
            ])
        );
    }

    #[tokio::test]
    async fn accounting_failure_refunds_only_charged_members() {
        let h = Harness::new(Faults {
            accounting_at: Some(1),
            ..Default::default()
        });

        let err = h.manager.create(&request("grid", 3), &alice()).await.unwrap_err();

        assert!(matches!(err, CreationError::Accounting(_)));
        assert_eq!(
            h.log(),
            strings(&[
                "schedule",
                "network.consume",
                "accounting.create 1",
                "accounting.destroy 1",
                "network.backout [1, 2, 3]",
                "scheduler.remove 1",
                "scheduler.remove 2",
                "scheduler.remove 3",
                "binding.backout",
            ])
        );
    }

    #[tokio::test]
    async fn materialization_failure_destroys_earlier_members() {
        let h = Harness::new(Faults {
            home_at: Some(1),
            ..Default::default()
        });

        let err = h.manager.create(&request("grid", 3), &alice()).await.unwrap_err();

        assert!(matches!(err, CreationError::Materialization { .. }));
        assert_eq!(
            h.log(),
            strings(&[
                "schedule",
                "network.consume",
                "accounting.create 1",
                "accounting.create 2",
                "accounting.create 3",
                "home.create 1",
                "home.destroy 1",
                "accounting.destroy 1",
                "accounting.destroy 2",
                "accounting.destroy 3",
                "network.backout [1, 2, 3]",
                "scheduler.remove 1",
                "scheduler.remove 2",
                "scheduler.remove 3",
                "binding.backout",
            ])
        );
        assert!(h.store.list_instances().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_creation_sends_no_notifications() {
        let h = Harness::new(Faults {
            home_at: Some(0),
            ..Default::default()
        });
        h.manager.create(&request("web", 1), &alice()).await.unwrap_err();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(h.scheduler.notified.lock().unwrap().is_empty());
        assert!(h.async_requests.notified.lock().unwrap().is_empty());
    }
}
