//! Collaborator contracts consumed by the creation pipeline and the slot
//! manager.
//!
//! Every contract is an object-safe async trait so the daemon can wire
//! concrete implementations behind `Arc<dyn ...>` and tests can substitute
//! recording fakes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::*;
use crate::types::*;

/// Places VMs and tracks their reservations.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Reserve capacity for `num_nodes` VMs and assign their IDs.
    async fn schedule(&self, request: ScheduleRequest) -> Result<Reservation, SchedulingError>;

    /// Release everything held for `vmid`. Used for backout and teardown.
    async fn remove(&self, vmid: VmId) -> Result<(), SchedulingError>;

    /// An instance reached a new state (e.g. its first legal state).
    async fn state_notification(&self, vmid: VmId, state: InstanceState);

    /// Submit every member collected under `cosched_id` as one ensemble.
    async fn proceed_coschedule(&self, cosched_id: &str) -> Result<(), SchedulingError>;
}

/// Turns a request into per-node VM descriptors according to policy.
#[async_trait]
pub trait BindingAdapter: Send + Sync {
    async fn process_request(
        &self,
        request: &CreateRequest,
    ) -> Result<Vec<VirtualMachine>, BindingError>;

    /// Undo any allocation `process_request` made. Best-effort.
    async fn back_out_allocations(&self, vms: &[VirtualMachine]);
}

/// Allocates addresses for the NICs of scheduled VMs.
#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    /// Fill in the NICs of every VM. The VMs must already carry IDs.
    async fn consume(
        &self,
        vms: &mut [VirtualMachine],
        requested: &[NicRequest],
    ) -> Result<(), NetworkError>;

    /// Return every address held by `vms` to its pool.
    async fn back_out_ip_allocations(&self, vms: &[VirtualMachine]) -> Result<(), NetworkError>;
}

/// A single accounting charge.
#[derive(Debug, Clone, PartialEq)]
pub struct Charge {
    pub vmid: VmId,
    pub creator: String,
    pub minutes: u64,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub charge_ratio: f64,
}

/// Records usage charges. Optional: without one, nothing is charged.
#[async_trait]
pub trait AccountingAdapter: Send + Sync {
    async fn create(&self, charge: Charge) -> Result<(), AccountingError>;

    async fn destroy(&self, vmid: VmId, creator: &str) -> Result<(), AccountingError>;
}

/// Durable storage of instance resources.
#[async_trait]
pub trait InstanceHome: Send + Sync {
    /// Blank resource for `id`; not persisted until `create`.
    fn new_instance(&self, id: VmId, vm: VirtualMachine) -> InstanceResource {
        InstanceResource::blank(id, vm)
    }

    async fn create(&self, resource: &InstanceResource) -> Result<(), HomeError>;

    async fn update(&self, resource: &InstanceResource) -> Result<(), HomeError>;

    async fn find(&self, id: VmId) -> Result<Option<InstanceResource>, HomeError>;

    async fn find_by_group(&self, group_id: &str) -> Result<Vec<InstanceResource>, HomeError>;

    async fn list(&self) -> Result<Vec<InstanceResource>, HomeError>;

    /// Remove the durable record. Returns false if it was already gone.
    async fn destroy(&self, id: VmId) -> Result<bool, HomeError>;
}

/// Decides whether a caller may create the bound VMs.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        caller: &Caller,
        request: &CreateRequest,
        vms: &[VirtualMachine],
    ) -> Result<(), AuthorizationError>;
}

/// Holds requests satisfied outside the calling thread (spot, backfill).
#[async_trait]
pub trait AsyncRequestManager: Send + Sync {
    async fn add_request(&self, request: AsyncRequest) -> Result<AsyncRequest, AsyncRequestError>;

    async fn state_notification(&self, vmid: VmId, state: InstanceState);
}

/// Receives slot lifecycle results from the slot manager.
#[async_trait]
pub trait SlotAdapter: Send + Sync {
    /// A pilot reported in; the VM now has a node and a fixed stop time.
    async fn slot_reserved(
        &self,
        vmid: VmId,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        hostname: &str,
    ) -> Result<(), SchedulingError>;

    /// The slot backing `vmid` is gone; tear the VM down.
    async fn cancel_instance(&self, vmid: VmId, mode: TerminationMode);
}

/// Full teardown of an instance.
#[async_trait]
pub trait InstanceTerminator: Send + Sync {
    async fn terminate(&self, vmid: VmId, mode: TerminationMode);
}

pub type SharedScheduler = Arc<dyn Scheduler>;
pub type SharedHome = Arc<dyn InstanceHome>;
