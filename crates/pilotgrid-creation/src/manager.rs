//! CreationManager — entry point for creating and tearing down instances.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pilotgrid_core::config::CreationConfig;
use pilotgrid_core::*;
use pilotgrid_state::StateStore;

use crate::error::{CreationError, CreationResult};

/// Everything the creation pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub binding: Arc<dyn BindingAdapter>,
    pub authorizer: Arc<dyn Authorizer>,
    pub scheduler: SharedScheduler,
    pub network: Arc<dyn NetworkAdapter>,
    /// `None` disables charging.
    pub accounting: Option<Arc<dyn AccountingAdapter>>,
    pub home: SharedHome,
    pub async_requests: Arc<dyn AsyncRequestManager>,
}

/// Creates instances through the multi-phase pipeline and tears them down.
pub struct CreationManager {
    pub(crate) config: CreationConfig,
    pub(crate) store: StateStore,
    pub(crate) binding: Arc<dyn BindingAdapter>,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    pub(crate) scheduler: SharedScheduler,
    pub(crate) network: Arc<dyn NetworkAdapter>,
    pub(crate) accounting: Option<Arc<dyn AccountingAdapter>>,
    pub(crate) home: SharedHome,
    pub(crate) async_requests: Arc<dyn AsyncRequestManager>,
    pub(crate) token_locks: KeyedLock<String>,
}

impl CreationManager {
    pub fn new(config: CreationConfig, store: StateStore, collaborators: Collaborators) -> Self {
        Self {
            config,
            store,
            binding: collaborators.binding,
            authorizer: collaborators.authorizer,
            scheduler: collaborators.scheduler,
            network: collaborators.network,
            accounting: collaborators.accounting,
            home: collaborators.home,
            async_requests: collaborators.async_requests,
            token_locks: KeyedLock::new(),
        }
    }

    // ── Create ────────────────────────────────────────────────────

    /// Create the instances described by `request` on behalf of `caller`.
    ///
    /// With a client token (and idempotency enabled) a repeated call
    /// returns the instances of the first one instead of creating more.
    pub async fn create(
        &self,
        request: &CreateRequest,
        caller: &Caller,
    ) -> CreationResult<Vec<InstanceResource>> {
        validate_caller(caller)?;
        self.validate_request(request)?;
        let vms = self.bind(request).await?;

        let token = request
            .client_token
            .as_deref()
            .filter(|t| self.config.idempotency_enabled && !t.is_empty());
        match token {
            Some(token) => self.create_idempotent(request, caller, vms, token).await,
            None => self.create_vms(request, caller, vms, None).await,
        }
    }

    /// Queue a spot or backfill request; nothing is allocated now.
    pub async fn add_async_request(
        &self,
        request: &AsyncCreateRequest,
        caller: &Caller,
    ) -> CreationResult<AsyncRequest> {
        validate_caller(caller)?;
        self.validate_request(&request.request)?;
        if let Some(price) = request.spot_price {
            if !price.is_finite() || price < 0.0 {
                return Err(CreationError::Request(format!("invalid spot price {price}")));
            }
        }
        let vms = self.bind(&request.request).await?;

        let record = AsyncRequest {
            id: Uuid::new_v4().to_string(),
            caller: caller.clone(),
            spot_price: request.spot_price,
            persistent: request.persistent,
            instance_count: vms.len() as u32,
            bindings: vms.clone(),
            request: request.request.clone(),
            created_at: Utc::now(),
        };
        match self.async_requests.add_request(record).await {
            Ok(accepted) => {
                info!(
                    id = %accepted.id,
                    caller = %caller.identity,
                    count = accepted.instance_count,
                    spot = accepted.spot_price.is_some(),
                    "async request accepted"
                );
                Ok(accepted)
            }
            Err(e) => {
                self.binding.back_out_allocations(&vms).await;
                Err(e.into())
            }
        }
    }

    /// Run binding policy and check it produced one VM per node.
    async fn bind(&self, request: &CreateRequest) -> CreationResult<Vec<VirtualMachine>> {
        let vms = self.binding.process_request(request).await?;
        if vms.len() != request.resources.node_count as usize {
            self.binding.back_out_allocations(&vms).await;
            return Err(CreationError::Request(format!(
                "binding produced {} vms for {} nodes",
                vms.len(),
                request.resources.node_count
            )));
        }
        Ok(vms)
    }

    fn validate_request(&self, request: &CreateRequest) -> CreationResult<()> {
        let r = &request.resources;
        let problem = if request.name.trim().is_empty() {
            Some("name is empty".to_string())
        } else if r.node_count == 0 {
            Some("node count must be at least 1".to_string())
        } else if r.node_count > self.config.max_group_size {
            Some(format!(
                "{} nodes exceeds group limit of {}",
                r.node_count, self.config.max_group_size
            ))
        } else if r.memory_mb == 0 {
            Some("memory must be positive".to_string())
        } else if r.cpu_count == 0 {
            Some("cpu count must be positive".to_string())
        } else if request.duration_secs == 0 {
            Some("duration must be positive".to_string())
        } else if request.duration_secs > self.config.max_duration_secs {
            Some(format!(
                "duration {}s exceeds limit of {}s",
                request.duration_secs, self.config.max_duration_secs
            ))
        } else {
            None
        };
        match problem {
            Some(msg) => Err(CreationError::Request(msg)),
            None => Ok(()),
        }
    }

    // ── Co-scheduling ─────────────────────────────────────────────

    /// Start every instance created under `cosched_id` together.
    ///
    /// If the scheduler cannot submit the ensemble its members are torn
    /// down, since they would never get a node.
    pub async fn proceed_coschedule(&self, cosched_id: &str, caller: &Caller) -> CreationResult<()> {
        validate_caller(caller)?;
        let members: Vec<InstanceResource> = self
            .home
            .list()
            .await?
            .into_iter()
            .filter(|r| r.ensemble_id.as_deref() == Some(cosched_id))
            .collect();
        if members.iter().any(|m| !may_manage(caller, m)) {
            return Err(CreationError::Denied(format!(
                "{} may not start ensemble {cosched_id}",
                caller.identity
            )));
        }

        if let Err(e) = self.scheduler.proceed_coschedule(cosched_id).await {
            warn!(%cosched_id, error = %e, members = members.len(), "ensemble could not be started");
            if !matches!(e, SchedulingError::UnknownCosched(_)) {
                for member in &members {
                    self.teardown(member, TerminationMode::Immediate).await;
                }
            }
            return Err(e.into());
        }
        info!(%cosched_id, members = members.len(), "ensemble started");
        Ok(())
    }

    // ── Queries ───────────────────────────────────────────────────

    pub async fn find(&self, vmid: VmId, caller: &Caller) -> CreationResult<InstanceResource> {
        let resource = self
            .home
            .find(vmid)
            .await?
            .ok_or(CreationError::NotFound(vmid))?;
        if !may_manage(caller, &resource) {
            // Do not reveal other creators' instances.
            return Err(CreationError::NotFound(vmid));
        }
        Ok(resource)
    }

    /// Instances visible to `caller`: their own, or all for a superuser.
    pub async fn list(&self, caller: &Caller) -> CreationResult<Vec<InstanceResource>> {
        let all = self.home.list().await?;
        Ok(all.into_iter().filter(|r| may_manage(caller, r)).collect())
    }

    // ── Teardown ──────────────────────────────────────────────────

    /// Destroy an instance on behalf of its creator (or a superuser).
    pub async fn destroy(&self, vmid: VmId, caller: &Caller) -> CreationResult<CompensationResult> {
        validate_caller(caller)?;
        let resource = self.find(vmid, caller).await?;
        info!(vmid, caller = %caller.identity, "destroying instance");
        Ok(self.teardown(&resource, TerminationMode::Shutdown).await)
    }

    /// Release everything an instance holds. Every step runs even if an
    /// earlier one failed.
    pub(crate) async fn teardown(
        &self,
        resource: &InstanceResource,
        mode: TerminationMode,
    ) -> CompensationResult {
        let vmid = resource.id;
        let mut result = CompensationResult::new(format!("teardown of vm {vmid}"));

        if mode == TerminationMode::Shutdown && resource.state != InstanceState::ShuttingDown {
            let mut shutting_down = resource.clone();
            shutting_down.state = InstanceState::ShuttingDown;
            result.record("guest shutdown", self.home.update(&shutting_down).await);
        }
        result.record(
            "network release",
            self.network
                .back_out_ip_allocations(std::slice::from_ref(&resource.vm))
                .await,
        );
        if let Some(accounting) = &self.accounting {
            result.record(
                "accounting destroy",
                accounting.destroy(vmid, &resource.creator).await,
            );
        }
        result.record(
            "instance record",
            self.home.destroy(vmid).await.map(|_| ()),
        );
        result.record("scheduler removal", self.scheduler.remove(vmid).await);

        self.async_requests
            .state_notification(vmid, InstanceState::Destroyed)
            .await;
        result.log();
        result
    }
}

#[async_trait]
impl InstanceTerminator for CreationManager {
    async fn terminate(&self, vmid: VmId, mode: TerminationMode) {
        match self.home.find(vmid).await {
            Ok(Some(resource)) => {
                info!(vmid, ?mode, "terminating instance whose slot ended");
                self.teardown(&resource, mode).await;
            }
            Ok(None) => {
                debug!(vmid, "instance already gone, releasing its slot");
                if let Err(e) = self.scheduler.remove(vmid).await {
                    warn!(vmid, error = %e, "failed to release slot");
                }
            }
            Err(e) => warn!(vmid, error = %e, "cannot load instance for termination"),
        }
    }
}

fn validate_caller(caller: &Caller) -> CreationResult<()> {
    if caller.identity.trim().is_empty() {
        return Err(CreationError::Request("caller identity is missing".to_string()));
    }
    Ok(())
}

fn may_manage(caller: &Caller, resource: &InstanceResource) -> bool {
    caller.superuser || caller.identity == resource.creator
}

#[cfg(test)]
mod tests {
    use pilotgrid_core::*;

    use crate::testing::{alice, request, Faults, Harness};
    use crate::CreationError;

    #[tokio::test]
    async fn anonymous_caller_is_rejected_before_binding() {
        let h = Harness::new(Faults::default());

        let err = h
            .manager
            .create(&request("web", 1), &Caller::new(" "))
            .await
            .unwrap_err();

        assert!(matches!(err, CreationError::Request(_)));
        assert!(h.log().is_empty());
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected() {
        let h = Harness::new(Faults::default());
        let mut cases = Vec::new();

        let mut r = request("web", 1);
        r.resources.node_count = 0;
        cases.push(r);
        let mut r = request("web", 1);
        r.resources.node_count = 65;
        cases.push(r);
        let mut r = request("web", 1);
        r.duration_secs = 0;
        cases.push(r);
        let mut r = request("web", 1);
        r.resources.memory_mb = 0;
        cases.push(r);
        cases.push(request("", 1));

        for r in cases {
            let err = h.manager.create(&r, &alice()).await.unwrap_err();
            assert!(matches!(err, CreationError::Request(_)), "{err}");
        }
        assert!(h.log().is_empty());
    }

    #[tokio::test]
    async fn binding_policy_denial_is_denied() {
        let h = Harness::new(Faults::default());
        let mut r = request("web", 1);
        r.resources.cpu_count = 1000;

        let err = h.manager.create(&r, &alice()).await.unwrap_err();
        assert!(matches!(err, CreationError::Denied(_)));
    }

    #[tokio::test]
    async fn other_creators_cannot_see_or_destroy() {
        let h = Harness::new(Faults::default());
        let created = h.manager.create(&request("web", 1), &alice()).await.unwrap();
        let id = created[0].id;
        let bob = Caller::new("bob");

        assert!(matches!(
            h.manager.find(id, &bob).await,
            Err(CreationError::NotFound(_))
        ));
        assert!(matches!(
            h.manager.destroy(id, &bob).await,
            Err(CreationError::NotFound(_))
        ));
        assert!(h.manager.list(&bob).await.unwrap().is_empty());
        assert_eq!(h.manager.list(&alice()).await.unwrap().len(), 1);
        assert_eq!(
            h.manager.list(&Caller::superuser("root")).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn destroy_releases_everything() {
        let h = Harness::new(Faults::default());
        let created = h.manager.create(&request("web", 1), &alice()).await.unwrap();
        h.clear_log();

        let result = h.manager.destroy(created[0].id, &alice()).await.unwrap();

        assert!(result.is_clean());
        assert_eq!(
            h.log(),
            vec![
                "network.backout [1]".to_string(),
                "accounting.destroy 1".to_string(),
                "home.destroy 1".to_string(),
                "scheduler.remove 1".to_string(),
            ]
        );
        assert!(h.store.get_instance(1).unwrap().is_none());
        assert!(matches!(
            h.manager.destroy(1, &alice()).await,
            Err(CreationError::NotFound(1))
        ));
    }

    #[tokio::test]
    async fn slot_termination_tears_down_or_releases() {
        let h = Harness::new(Faults::default());
        h.manager.create(&request("web", 1), &alice()).await.unwrap();
        h.clear_log();

        h.manager.terminate(1, TerminationMode::Immediate).await;
        assert!(h.log().contains(&"home.destroy 1".to_string()));
        assert!(h.store.get_instance(1).unwrap().is_none());

        h.clear_log();
        h.manager.terminate(1, TerminationMode::Immediate).await;
        assert_eq!(h.log(), vec!["scheduler.remove 1".to_string()]);
    }

    #[tokio::test]
    async fn async_requests_are_queued_not_created() {
        let h = Harness::new(Faults::default());
        let request = AsyncCreateRequest {
            request: request("spot", 2),
            spot_price: Some(0.25),
            persistent: true,
        };

        let accepted = h.manager.add_async_request(&request, &alice()).await.unwrap();

        assert_eq!(accepted.instance_count, 2);
        assert_eq!(accepted.bindings.len(), 2);
        assert_eq!(h.async_requests.added.lock().unwrap().len(), 1);
        assert!(h.log().is_empty());
        assert!(h.store.list_instances().unwrap().is_empty());

        let bad = AsyncCreateRequest {
            spot_price: Some(-1.0),
            ..request
        };
        assert!(matches!(
            h.manager.add_async_request(&bad, &alice()).await,
            Err(CreationError::Request(_))
        ));
    }

    #[tokio::test]
    async fn proceed_starts_ensemble() {
        let h = Harness::new(Faults::default());
        let mut r = request("member", 1);
        r.cosched_id = Some("ens".to_string());
        let created = h.manager.create(&r, &alice()).await.unwrap();
        assert_eq!(created[0].ensemble_id.as_deref(), Some("ens"));

        h.manager.proceed_coschedule("ens", &alice()).await.unwrap();
        assert!(h.log().contains(&"scheduler.proceed ens".to_string()));

        let err = h
            .manager
            .proceed_coschedule("ens", &Caller::new("bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, CreationError::Denied(_)));
    }

    #[tokio::test]
    async fn failed_ensemble_start_tears_members_down() {
        let h = Harness::new(Faults {
            proceed: true,
            ..Default::default()
        });
        for name in ["a", "b"] {
            let mut r = request(name, 1);
            r.cosched_id = Some("ens".to_string());
            h.manager.create(&r, &alice()).await.unwrap();
        }

        let err = h.manager.proceed_coschedule("ens", &alice()).await.unwrap_err();

        assert!(matches!(err, CreationError::Denied(_)));
        assert!(h.store.list_instances().unwrap().is_empty());
    }
}
