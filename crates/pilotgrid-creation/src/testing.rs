//! Recording fakes for the creation pipeline tests.
//!
//! Every collaborator appends to one shared log so tests can assert the
//! exact order of commits and backouts.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::Instant;

use pilotgrid_core::config::CreationConfig;
use pilotgrid_core::*;
use pilotgrid_state::{StateStore, StoreInstanceHome};

use crate::manager::{Collaborators, CreationManager};
use crate::reference::DefaultBinding;

pub type Log = Arc<Mutex<Vec<String>>>;

fn push(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

pub struct FakeBinding {
    inner: DefaultBinding,
    log: Log,
}

#[async_trait]
impl BindingAdapter for FakeBinding {
    async fn process_request(
        &self,
        request: &CreateRequest,
    ) -> Result<Vec<VirtualMachine>, BindingError> {
        self.inner.process_request(request).await
    }

    async fn back_out_allocations(&self, _vms: &[VirtualMachine]) {
        push(&self.log, "binding.backout");
    }
}

pub struct FakeAuthorizer {
    deny: bool,
}

#[async_trait]
impl Authorizer for FakeAuthorizer {
    async fn authorize(
        &self,
        caller: &Caller,
        _request: &CreateRequest,
        _vms: &[VirtualMachine],
    ) -> Result<(), AuthorizationError> {
        if self.deny {
            return Err(AuthorizationError::Denied(caller.identity.clone()));
        }
        Ok(())
    }
}

pub struct FakeScheduler {
    log: Log,
    next_id: AtomicU64,
    fail: bool,
    fail_proceed: bool,
    pub notified: Mutex<Vec<(VmId, Instant)>>,
}

#[async_trait]
impl Scheduler for FakeScheduler {
    async fn schedule(&self, request: ScheduleRequest) -> Result<Reservation, SchedulingError> {
        push(&self.log, "schedule");
        if self.fail {
            return Err(SchedulingError::Denied("no capacity".to_string()));
        }
        let first = self
            .next_id
            .fetch_add(request.num_nodes as u64, Ordering::SeqCst);
        Ok(Reservation::pending(
            (first..first + request.num_nodes as u64).collect(),
        ))
    }

    async fn remove(&self, vmid: VmId) -> Result<(), SchedulingError> {
        push(&self.log, format!("scheduler.remove {vmid}"));
        Ok(())
    }

    async fn state_notification(&self, vmid: VmId, _state: InstanceState) {
        self.notified.lock().unwrap().push((vmid, Instant::now()));
    }

    async fn proceed_coschedule(&self, cosched_id: &str) -> Result<(), SchedulingError> {
        push(&self.log, format!("scheduler.proceed {cosched_id}"));
        if self.fail_proceed {
            return Err(SchedulingError::Denied("ensemble too large".to_string()));
        }
        Ok(())
    }
}

pub struct FakeNetwork {
    log: Log,
    fail: bool,
}

#[async_trait]
impl NetworkAdapter for FakeNetwork {
    async fn consume(
        &self,
        vms: &mut [VirtualMachine],
        _requested: &[NicRequest],
    ) -> Result<(), NetworkError> {
        push(&self.log, "network.consume");
        if self.fail {
            return Err(NetworkError::Exhausted("public".to_string()));
        }
        for vm in vms.iter_mut() {
            for nic in &mut vm.nics {
                nic.ip = vm.id.map(|id| format!("10.0.0.{id}"));
                nic.hostname = vm.id.map(|id| format!("vm{id}"));
            }
        }
        Ok(())
    }

    async fn back_out_ip_allocations(&self, vms: &[VirtualMachine]) -> Result<(), NetworkError> {
        let ids: Vec<VmId> = vms.iter().filter_map(|v| v.id).collect();
        push(&self.log, format!("network.backout {ids:?}"));
        Ok(())
    }
}

pub struct FakeAccounting {
    log: Log,
    fail_at: Option<usize>,
    calls: AtomicUsize,
}

#[async_trait]
impl AccountingAdapter for FakeAccounting {
    async fn create(&self, charge: Charge) -> Result<(), AccountingError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_at == Some(n) {
            return Err(AccountingError::Denied("over quota".to_string()));
        }
        push(&self.log, format!("accounting.create {}", charge.vmid));
        Ok(())
    }

    async fn destroy(&self, vmid: VmId, _creator: &str) -> Result<(), AccountingError> {
        push(&self.log, format!("accounting.destroy {vmid}"));
        Ok(())
    }
}

/// Store-backed home that can fail the n-th create.
pub struct FakeHome {
    inner: StoreInstanceHome,
    log: Log,
    fail_at: Option<usize>,
    calls: AtomicUsize,
}

#[async_trait]
impl InstanceHome for FakeHome {
    async fn create(&self, resource: &InstanceResource) -> Result<(), HomeError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_at == Some(n) {
            return Err(HomeError::Storage("disk full".to_string()));
        }
        push(&self.log, format!("home.create {}", resource.id));
        self.inner.create(resource).await
    }

    async fn update(&self, resource: &InstanceResource) -> Result<(), HomeError> {
        self.inner.update(resource).await
    }

    async fn find(&self, id: VmId) -> Result<Option<InstanceResource>, HomeError> {
        self.inner.find(id).await
    }

    async fn find_by_group(&self, group_id: &str) -> Result<Vec<InstanceResource>, HomeError> {
        self.inner.find_by_group(group_id).await
    }

    async fn list(&self) -> Result<Vec<InstanceResource>, HomeError> {
        self.inner.list().await
    }

    async fn destroy(&self, id: VmId) -> Result<bool, HomeError> {
        push(&self.log, format!("home.destroy {id}"));
        self.inner.destroy(id).await
    }
}

#[derive(Default)]
pub struct FakeAsync {
    pub added: Mutex<Vec<AsyncRequest>>,
    pub notified: Mutex<Vec<(VmId, InstanceState, Instant)>>,
}

#[async_trait]
impl AsyncRequestManager for FakeAsync {
    async fn add_request(&self, request: AsyncRequest) -> Result<AsyncRequest, AsyncRequestError> {
        self.added.lock().unwrap().push(request.clone());
        Ok(request)
    }

    async fn state_notification(&self, vmid: VmId, state: InstanceState) {
        self.notified
            .lock()
            .unwrap()
            .push((vmid, state, Instant::now()));
    }
}

/// Which collaborator should fail.
#[derive(Default, Clone)]
pub struct Faults {
    pub deny: bool,
    pub schedule: bool,
    pub proceed: bool,
    pub network: bool,
    pub accounting_at: Option<usize>,
    pub home_at: Option<usize>,
}

pub struct Harness {
    pub manager: Arc<CreationManager>,
    pub store: StateStore,
    pub log: Log,
    pub scheduler: Arc<FakeScheduler>,
    pub async_requests: Arc<FakeAsync>,
}

impl Harness {
    pub fn new(faults: Faults) -> Self {
        Self::with_config(faults, CreationConfig::default())
    }

    pub fn with_config(faults: Faults, config: CreationConfig) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let log: Log = Arc::default();
        let scheduler = Arc::new(FakeScheduler {
            log: log.clone(),
            next_id: AtomicU64::new(1),
            fail: faults.schedule,
            fail_proceed: faults.proceed,
            notified: Mutex::new(Vec::new()),
        });
        let async_requests = Arc::new(FakeAsync::default());
        let collaborators = Collaborators {
            binding: Arc::new(FakeBinding {
                inner: DefaultBinding::new(config.clone()),
                log: log.clone(),
            }),
            authorizer: Arc::new(FakeAuthorizer { deny: faults.deny }),
            scheduler: scheduler.clone(),
            network: Arc::new(FakeNetwork {
                log: log.clone(),
                fail: faults.network,
            }),
            accounting: Some(Arc::new(FakeAccounting {
                log: log.clone(),
                fail_at: faults.accounting_at,
                calls: AtomicUsize::new(0),
            })),
            home: Arc::new(FakeHome {
                inner: StoreInstanceHome::new(store.clone()),
                log: log.clone(),
                fail_at: faults.home_at,
                calls: AtomicUsize::new(0),
            }),
            async_requests: async_requests.clone(),
        };
        let manager = Arc::new(CreationManager::new(config, store.clone(), collaborators));
        Self {
            manager,
            store,
            log,
            scheduler,
            async_requests,
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }
}

pub fn alice() -> Caller {
    Caller::new("alice")
}

/// A request with one NIC on "public".
pub fn request(name: &str, nodes: u32) -> CreateRequest {
    let mut request = CreateRequest::single(name, 512, 1, 600);
    request.resources.node_count = nodes;
    request.nics = vec![NicRequest {
        name: "eth0".to_string(),
        network: "public".to_string(),
    }];
    request
}
