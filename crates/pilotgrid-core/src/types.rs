//! Domain types shared by the PilotGrid crates.
//!
//! These types describe a VM creation request as it travels through the
//! creation pipeline: the immutable `CreateRequest`, the per-node
//! `VirtualMachine` binding, the `Reservation` returned by the scheduler and
//! the durable `InstanceResource`. All of them serialize to JSON so they can
//! be stored in redb value columns and returned by the admin API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric identifier assigned to a VM by the scheduler.
pub type VmId = u64;

// ── Request ───────────────────────────────────────────────────────

/// Identity of whoever is asking for resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Caller {
    pub identity: String,
    #[serde(default)]
    pub superuser: bool,
}

impl Caller {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            superuser: false,
        }
    }

    pub fn superuser(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            superuser: true,
        }
    }
}

/// Memory/CPU/node counts requested for every VM of a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceAllocation {
    /// Memory per VM in MiB.
    pub memory_mb: u64,
    /// Virtual CPUs per VM.
    pub cpu_count: u32,
    /// Number of identical VMs.
    pub node_count: u32,
}

/// A NIC the caller wants, attached to a named network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NicRequest {
    pub name: String,
    pub network: String,
}

/// How the request entered the system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    #[default]
    Normal,
    Spot,
    Backfill,
}

impl RequestKind {
    /// Spot and backfill requests are pre-authorized by the async manager.
    pub fn skips_authorization(self) -> bool {
        matches!(self, RequestKind::Spot | RequestKind::Backfill)
    }
}

/// Immutable description of the VM(s) a caller wants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateRequest {
    pub name: String,
    pub image: String,
    pub resources: ResourceAllocation,
    /// Requested running time in seconds.
    pub duration_secs: u64,
    #[serde(default)]
    pub nics: Vec<NicRequest>,
    /// Caller-supplied idempotency key, scoped to the creator.
    #[serde(default)]
    pub client_token: Option<String>,
    /// Ensemble membership: requests sharing this ID start together.
    #[serde(default)]
    pub cosched_id: Option<String>,
    /// Context document handed to the guest at boot.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub kind: RequestKind,
    #[serde(default)]
    pub preemptable: bool,
}

impl CreateRequest {
    /// Convenience constructor for a plain single-node request.
    pub fn single(name: &str, memory_mb: u64, cpu_count: u32, duration_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            image: "default".to_string(),
            resources: ResourceAllocation {
                memory_mb,
                cpu_count,
                node_count: 1,
            },
            duration_secs,
            nics: Vec::new(),
            client_token: None,
            cosched_id: None,
            context: None,
            kind: RequestKind::Normal,
            preemptable: false,
        }
    }

    pub fn is_group(&self) -> bool {
        self.resources.node_count > 1
    }
}

// ── Binding ───────────────────────────────────────────────────────

/// Resources a single VM is deployed with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub memory_mb: u64,
    pub cpu_count: u32,
    pub duration_secs: u64,
    /// Multiplier applied to charged minutes.
    pub charge_ratio: f64,
}

/// A NIC after network allocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Nic {
    pub name: String,
    pub network: String,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub gateway: Option<String>,
    pub mac: Option<String>,
}

impl Nic {
    pub fn unallocated(name: &str, network: &str) -> Self {
        Self {
            name: name.to_string(),
            network: network.to_string(),
            ip: None,
            hostname: None,
            gateway: None,
            mac: None,
        }
    }
}

/// Policy-resolved descriptor of one VM, produced by the binding step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualMachine {
    /// Assigned only once scheduling succeeded.
    pub id: Option<VmId>,
    pub name: String,
    pub image: String,
    pub deployment: Deployment,
    /// Network names the VM must be attached to.
    pub associations: Vec<String>,
    pub nics: Vec<Nic>,
    /// Set on group members so each one unpropagates to its own target.
    pub unprop_target_suffix: Option<String>,
}

// ── Scheduling ────────────────────────────────────────────────────

/// Parameters handed to `Scheduler::schedule`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleRequest {
    pub memory_mb: u64,
    pub cores: u32,
    pub duration_secs: u64,
    pub associations: Vec<String>,
    pub num_nodes: u32,
    pub group_id: Option<String>,
    pub cosched_id: Option<String>,
    pub preemptable: bool,
    pub caller_id: String,
}

/// Result of a successful `Scheduler::schedule` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reservation {
    pub ids: Vec<VmId>,
    /// Known placements, if the scheduler already knows them.
    pub hostnames: Option<Vec<(VmId, String)>>,
    /// True when start and stop are fixed.
    pub concrete: bool,
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
}

impl Reservation {
    /// A best-effort reservation whose times are not known yet.
    pub fn pending(ids: Vec<VmId>) -> Self {
        Self {
            ids,
            hostnames: None,
            concrete: false,
            start: None,
            stop: None,
        }
    }

    /// Check the reservation against the number of VMs that were requested.
    pub fn validate(&self, expected: usize) -> Result<(), String> {
        if self.ids.len() != expected {
            return Err(format!(
                "scheduler returned {} ids for {} requested VMs",
                self.ids.len(),
                expected
            ));
        }
        if self.concrete && (self.start.is_none() || self.stop.is_none()) {
            return Err("concrete reservation without start/stop times".to_string());
        }
        Ok(())
    }
}

// ── Instances ─────────────────────────────────────────────────────

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// First legal state: persisted, waiting for a node.
    Unpropagated,
    Propagating,
    Running,
    ShuttingDown,
    Cancelled,
    Destroyed,
}

/// A file the guest needs at boot (context bootstrap).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileCopyNeed {
    pub contents: String,
    pub dest_path: String,
}

/// Durable representation of one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceResource {
    pub id: VmId,
    pub name: String,
    pub creator: String,
    pub group_id: Option<String>,
    pub ensemble_id: Option<String>,
    pub launch_index: u32,
    pub state: InstanceState,
    pub vm: VirtualMachine,
    /// Operations are blocked until the pilot reports a node.
    pub ops_enabled: bool,
    pub node: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub termination_time: Option<DateTime<Utc>>,
    pub client_token: Option<String>,
    pub file_copy: Option<FileCopyNeed>,
    pub created_at: DateTime<Utc>,
}

impl InstanceResource {
    /// Blank instance for `id`, as handed out by an instance home.
    pub fn blank(id: VmId, vm: VirtualMachine) -> Self {
        Self {
            id,
            name: vm.name.clone(),
            creator: String::new(),
            group_id: None,
            ensemble_id: None,
            launch_index: 0,
            state: InstanceState::Unpropagated,
            vm,
            ops_enabled: false,
            node: None,
            start_time: None,
            termination_time: None,
            client_token: None,
            file_copy: None,
            created_at: Utc::now(),
        }
    }
}

/// How an instance is cancelled when its slot goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationMode {
    /// Run guest shutdown first.
    Shutdown,
    /// State is not trustworthy, tear down without touching the guest.
    Immediate,
}

// ── Async requests ────────────────────────────────────────────────

/// A request that is satisfied later, outside the calling thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AsyncCreateRequest {
    pub request: CreateRequest,
    /// Maximum price for spot requests; `None` means backfill.
    #[serde(default)]
    pub spot_price: Option<f64>,
    /// Persistent requests are re-submitted after their instances end.
    #[serde(default)]
    pub persistent: bool,
}

/// Record handed to the async request manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AsyncRequest {
    pub id: String,
    pub caller: Caller,
    pub spot_price: Option<f64>,
    pub persistent: bool,
    pub instance_count: u32,
    pub bindings: Vec<VirtualMachine>,
    pub request: CreateRequest,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_validate_checks_id_count() {
        let r = Reservation::pending(vec![1, 2]);
        assert!(r.validate(2).is_ok());
        assert!(r.validate(3).is_err());
    }

    #[test]
    fn concrete_reservation_requires_times() {
        let mut r = Reservation::pending(vec![1]);
        r.concrete = true;
        assert!(r.validate(1).is_err());

        r.start = Some(Utc::now());
        r.stop = Some(Utc::now());
        assert!(r.validate(1).is_ok());
    }

    #[test]
    fn request_kind_authorization() {
        assert!(!RequestKind::Normal.skips_authorization());
        assert!(RequestKind::Spot.skips_authorization());
        assert!(RequestKind::Backfill.skips_authorization());
    }

    #[test]
    fn create_request_defaults_from_json() {
        let json = r#"{
            "name": "vm",
            "image": "debian",
            "resources": {"memory_mb": 512, "cpu_count": 1, "node_count": 2},
            "duration_secs": 600
        }"#;
        let req: CreateRequest = serde_json::from_str(json).unwrap();
        assert!(req.is_group());
        assert_eq!(req.kind, RequestKind::Normal);
        assert!(req.client_token.is_none());
        assert!(req.nics.is_empty());
    }
}
