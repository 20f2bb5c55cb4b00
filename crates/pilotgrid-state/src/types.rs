//! Persisted record types.
//!
//! `PilotSlot` carries the slot lifecycle as an explicit `SlotState` with
//! checked transitions:
//!
//! ```text
//! Requested ──reserve──▶ Reserved ──terminate──▶ Terminal
//!     │                                             │
//!     └────────────────terminate────────────────────┤
//!                                                   ▼
//!                 (any live state) ──remove──▶ Removed
//! ```
//!
//! `pending_remove` is orthogonal and only used by group slots: it marks a
//! member whose VM already asked for release.

use chrono::{DateTime, Utc};
use pilotgrid_core::{InstanceResource, VmId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ── Pilot slots ───────────────────────────────────────────────────

/// Where a slot is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    /// Job submitted, no pilot has reported in.
    Requested,
    /// A pilot is running on `node`.
    Reserved { node: String },
    /// The pilot exited, failed or was killed.
    Terminal { node: Option<String> },
    /// Release fully processed; the row is about to be deleted.
    Removed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal slot transition for vm {vmid}: {from} -> {to}")]
pub struct SlotTransitionError {
    pub vmid: VmId,
    pub from: &'static str,
    pub to: &'static str,
}

impl SlotState {
    pub fn name(&self) -> &'static str {
        match self {
            SlotState::Requested => "requested",
            SlotState::Reserved { .. } => "reserved",
            SlotState::Terminal { .. } => "terminal",
            SlotState::Removed => "removed",
        }
    }
}

/// One capacity reservation row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PilotSlot {
    /// Slot identifier, shared by all members of a group.
    pub uuid: String,
    pub vmid: VmId,
    pub state: SlotState,
    pub pending_remove: bool,
    /// Batch-scheduler job handle, set once submission returns.
    pub lrm_handle: Option<String>,
    /// Running time this member asked for.
    pub duration_secs: u64,
    /// Running time the job was sized for (max over the group).
    pub slot_duration_secs: u64,
    pub memory_mb: u64,
    pub part_of_group: bool,
    pub group_size: u32,
    pub cosched_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PilotSlot {
    pub fn requested(uuid: &str, vmid: VmId, duration_secs: u64, memory_mb: u64) -> Self {
        Self {
            uuid: uuid.to_string(),
            vmid,
            state: SlotState::Requested,
            pending_remove: false,
            lrm_handle: None,
            duration_secs,
            slot_duration_secs: duration_secs,
            memory_mb,
            part_of_group: false,
            group_size: 1,
            cosched_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn table_key(&self) -> String {
        self.vmid.to_string()
    }

    /// No node has been assigned yet.
    pub fn is_pending(&self) -> bool {
        self.state == SlotState::Requested
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SlotState::Terminal { .. })
    }

    pub fn node(&self) -> Option<&str> {
        match &self.state {
            SlotState::Reserved { node } => Some(node),
            SlotState::Terminal { node } => node.as_deref(),
            _ => None,
        }
    }

    fn illegal(&self, to: &'static str) -> SlotTransitionError {
        SlotTransitionError {
            vmid: self.vmid,
            from: self.state.name(),
            to,
        }
    }

    /// Requested → Reserved.
    pub fn reserve(&mut self, node: &str) -> Result<(), SlotTransitionError> {
        match self.state {
            SlotState::Requested => {
                self.state = SlotState::Reserved {
                    node: node.to_string(),
                };
                Ok(())
            }
            _ => Err(self.illegal("reserved")),
        }
    }

    /// Requested | Reserved → Terminal.
    pub fn terminate(&mut self) -> Result<(), SlotTransitionError> {
        let node = match &self.state {
            SlotState::Requested => None,
            SlotState::Reserved { node } => Some(node.clone()),
            _ => return Err(self.illegal("terminal")),
        };
        self.state = SlotState::Terminal { node };
        Ok(())
    }

    /// Flag a group member as released by its VM.
    pub fn mark_pending_remove(&mut self) -> Result<(), SlotTransitionError> {
        if self.state == SlotState::Removed {
            return Err(self.illegal("pending_remove"));
        }
        self.pending_remove = true;
        Ok(())
    }

    /// Any live state → Removed.
    pub fn remove(&mut self) -> Result<(), SlotTransitionError> {
        if self.state == SlotState::Removed {
            return Err(self.illegal("removed"));
        }
        self.state = SlotState::Removed;
        Ok(())
    }
}

// ── Idempotency ───────────────────────────────────────────────────

/// Snapshot of one instance created under a client token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotentInstance {
    pub id: VmId,
    pub name: String,
    pub launch_index: u32,
    /// State at creation time, returned once the live record is gone.
    pub snapshot: InstanceResource,
}

/// What a (creator, client token) pair is bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotentReservation {
    pub creator_id: String,
    pub client_token: String,
    pub group_id: Option<String>,
    pub vm_id: Option<VmId>,
    pub instances: Vec<IdempotentInstance>,
    pub created_at: DateTime<Utc>,
}

impl IdempotentReservation {
    /// Placeholder recorded before creation finishes.
    pub fn in_flight(creator_id: &str, client_token: &str) -> Self {
        Self {
            creator_id: creator_id.to_string(),
            client_token: client_token.to_string(),
            group_id: None,
            vm_id: None,
            instances: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.group_id.is_some() || self.vm_id.is_some()
    }

    pub fn table_key(&self) -> String {
        idempotency_key(&self.creator_id, &self.client_token)
    }
}

/// Fixed-length key for a (creator, token) pair.
pub fn idempotency_key(creator_id: &str, client_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(creator_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(client_token.as_bytes());
    hex::encode(hasher.finalize())
}

// ── Accounting ────────────────────────────────────────────────────

/// A pre-charge recorded when an instance is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeRecord {
    pub vmid: VmId,
    pub creator: String,
    pub minutes: u64,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub charge_ratio: f64,
    pub charged_at: DateTime<Utc>,
}

impl ChargeRecord {
    pub fn table_key(&self) -> String {
        self.vmid.to_string()
    }

    /// Minutes after the charge ratio, rounded up.
    pub fn charged_minutes(&self) -> u64 {
        (self.minutes as f64 * self.charge_ratio).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_happy_path() {
        let mut slot = PilotSlot::requested("u-1", 7, 600, 512);
        assert!(slot.is_pending());
        assert_eq!(slot.node(), None);

        slot.reserve("node7").unwrap();
        assert!(!slot.is_pending());
        assert_eq!(slot.node(), Some("node7"));

        slot.terminate().unwrap();
        assert!(slot.is_terminal());
        assert_eq!(slot.node(), Some("node7"));

        slot.remove().unwrap();
        assert_eq!(slot.state, SlotState::Removed);
    }

    #[test]
    fn slot_rejects_double_reserve() {
        let mut slot = PilotSlot::requested("u-1", 7, 600, 512);
        slot.reserve("a").unwrap();
        let err = slot.reserve("b").unwrap_err();
        assert_eq!(err.from, "reserved");
        assert_eq!(err.to, "reserved");
    }

    #[test]
    fn slot_can_go_terminal_without_node() {
        let mut slot = PilotSlot::requested("u-1", 7, 600, 512);
        slot.terminate().unwrap();
        assert_eq!(slot.state, SlotState::Terminal { node: None });
        assert!(slot.terminate().is_err());
        assert!(slot.reserve("late").is_err());
    }

    #[test]
    fn removed_slot_is_final() {
        let mut slot = PilotSlot::requested("u-1", 7, 600, 512);
        slot.remove().unwrap();
        assert!(slot.mark_pending_remove().is_err());
        assert!(slot.remove().is_err());
    }

    #[test]
    fn idempotency_key_separates_fields() {
        assert_ne!(idempotency_key("ab", "c"), idempotency_key("a", "bc"));
        assert_eq!(idempotency_key("a", "b").len(), 64);
    }

    #[test]
    fn charged_minutes_rounds_up() {
        let charge = ChargeRecord {
            vmid: 1,
            creator: "alice".to_string(),
            minutes: 10,
            cpu_count: 1,
            memory_mb: 256,
            charge_ratio: 1.25,
            charged_at: Utc::now(),
        };
        assert_eq!(charge.charged_minutes(), 13);
    }
}
