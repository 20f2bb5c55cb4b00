//! Pilot slot reservation and release.

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use pilotgrid_core::config::PilotConfig;
use pilotgrid_core::{KeyedLock, SlotAdapter, TerminationMode, VmId};
use pilotgrid_state::{PilotSlot, StateResult, StateStore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::command::{PilotCommandBuilder, SubmitSpec};
use crate::error::{SlotError, SlotResult};
use crate::notification::CursorDebouncer;
use crate::runner::CommandRunner;

/// Capacity for one or more VMs sharing memory and duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRequest {
    pub vmids: Vec<VmId>,
    pub memory_mb: u64,
    pub duration_secs: u64,
}

impl SlotRequest {
    pub fn single(vmid: VmId, memory_mb: u64, duration_secs: u64) -> Self {
        Self {
            vmids: vec![vmid],
            memory_mb,
            duration_secs,
        }
    }
}

/// Tracks pilot slots and drives the batch scheduler.
///
/// Every mutation of the rows sharing a slot uuid happens under that uuid's
/// entry in `slot_locks`. The lock is never held while calling out to the
/// [`SlotAdapter`], because the adapter may call back into
/// [`release_space`](Self::release_space).
pub struct PilotSlotManager {
    pub(crate) store: StateStore,
    pub(crate) config: PilotConfig,
    builder: PilotCommandBuilder,
    runner: Arc<dyn CommandRunner>,
    adapter: OnceLock<Weak<dyn SlotAdapter>>,
    pub(crate) slot_locks: KeyedLock<String>,
    pub(crate) pending: AtomicUsize,
    pub(crate) cursor: CursorDebouncer,
}

impl PilotSlotManager {
    pub fn new(
        store: StateStore,
        config: PilotConfig,
        runner: Arc<dyn CommandRunner>,
        cursor_debounce: Duration,
    ) -> Self {
        Self {
            cursor: CursorDebouncer::new(store.clone(), cursor_debounce),
            builder: PilotCommandBuilder::new(config.clone()),
            store,
            config,
            runner,
            adapter: OnceLock::new(),
            slot_locks: KeyedLock::new(),
            pending: AtomicUsize::new(0),
        }
    }

    /// Register the receiver of slot lifecycle results. Only the first call
    /// takes effect.
    pub fn set_adapter(&self, adapter: &Arc<dyn SlotAdapter>) {
        if self.adapter.set(Arc::downgrade(adapter)).is_err() {
            warn!("slot adapter already registered, ignoring");
        }
    }

    pub(crate) fn adapter(&self) -> Option<Arc<dyn SlotAdapter>> {
        self.adapter.get().and_then(Weak::upgrade)
    }

    // ── Reservation ───────────────────────────────────────────────

    /// Submit one job for every VM in `request`. Returns the slot uuid.
    ///
    /// Success means the batch scheduler accepted the job, not that
    /// capacity was granted; that arrives later as a notification.
    pub async fn reserve_space(&self, request: &SlotRequest) -> SlotResult<String> {
        self.submit_slots(std::slice::from_ref(request), None).await
    }

    /// Submit one job covering every member of a co-scheduled ensemble.
    pub async fn reserve_coscheduled_space(
        &self,
        requests: &[SlotRequest],
        cosched_id: &str,
    ) -> SlotResult<String> {
        self.submit_slots(requests, Some(cosched_id)).await
    }

    async fn submit_slots(
        &self,
        requests: &[SlotRequest],
        cosched_id: Option<&str>,
    ) -> SlotResult<String> {
        let members: Vec<(VmId, u64, u64)> = requests
            .iter()
            .flat_map(|r| r.vmids.iter().map(|&id| (id, r.memory_mb, r.duration_secs)))
            .collect();
        if members.is_empty() {
            return Err(SlotError::Denied("no vms to reserve space for".to_string()));
        }

        // The job is sized by the high-water mark across members.
        let memory_mb = members.iter().map(|m| m.1).max().unwrap_or(0);
        let duration_secs = members.iter().map(|m| m.2).max().unwrap_or(0);
        if memory_mb > self.config.max_memory_mb {
            return Err(SlotError::Denied(format!(
                "requested {memory_mb} MB exceeds node capacity of {} MB",
                self.config.max_memory_mb
            )));
        }

        let uuid = Uuid::new_v4().to_string();
        let group = members.len() > 1 || cosched_id.is_some();
        let group_size = members.len() as u32;
        let mut rows: Vec<PilotSlot> = members
            .iter()
            .map(|&(vmid, mem, dur)| {
                let mut slot = PilotSlot::requested(&uuid, vmid, dur, mem);
                slot.slot_duration_secs = duration_secs;
                slot.part_of_group = group;
                slot.group_size = group_size;
                slot.cosched_id = cosched_id.map(str::to_string);
                slot
            })
            .collect();

        let spec = SubmitSpec {
            uuid: uuid.clone(),
            nodes: group_size,
            memory_mb,
            duration_secs,
        };
        let command = self.builder.submit(&spec)?;

        let _guard = self.slot_locks.lock(uuid.clone()).await;

        if let Err(e) = self.store.put_slots(&rows) {
            error!(%uuid, error = %e, "failed to record slot rows");
            return Err(SlotError::Denied(format!("recording slot: {e}")));
        }

        let handle = match self
            .runner
            .run(&command.argv, Some(&command.script))
            .await
            .and_then(|output| output.job_handle())
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(%uuid, error = %e, "slot submission failed");
                self.forget_rows(&rows);
                return Err(SlotError::Denied(format!("submitting slot: {e}")));
            }
        };

        for row in &mut rows {
            row.lrm_handle = Some(handle.clone());
        }
        if let Err(e) = self.store.put_slots(&rows) {
            error!(%uuid, %handle, error = %e, "failed to record job handle");
            self.cancel_job(Some(&handle)).await;
            self.forget_rows(&rows);
            return Err(SlotError::Denied(format!("recording job handle: {e}")));
        }

        info!(
            %uuid,
            %handle,
            nodes = group_size,
            memory_mb,
            duration_secs,
            cosched_id = cosched_id.unwrap_or(""),
            "slot submitted"
        );
        Ok(uuid)
    }

    fn forget_rows(&self, rows: &[PilotSlot]) {
        let ids: Vec<VmId> = rows.iter().map(|r| r.vmid).collect();
        if let Err(e) = self.store.delete_slots(&ids) {
            error!(?ids, error = %e, "failed to delete slot rows after failed submission");
        }
    }

    // ── Release ───────────────────────────────────────────────────

    /// Give up the capacity held for `vmid`.
    ///
    /// Group members only cancel the job once every member has asked.
    pub async fn release_space(&self, vmid: VmId) -> SlotResult<()> {
        let Some(slot) = self.store.get_slot(vmid)? else {
            debug!(vmid, "no slot to release");
            return Ok(());
        };
        let _guard = self.slot_locks.lock(slot.uuid.clone()).await;

        // Re-read under the lock; another release may have finished first.
        let Some(mut slot) = self.store.get_slot(vmid)? else {
            debug!(vmid, "slot released concurrently");
            return Ok(());
        };

        if !slot.part_of_group {
            if !slot.is_terminal() {
                self.cancel_job(slot.lrm_handle.as_deref()).await;
            }
            self.store.delete_slot(vmid)?;
            info!(vmid, uuid = %slot.uuid, "slot released");
            return Ok(());
        }

        slot.mark_pending_remove()?;
        self.store.put_slot(&slot)?;

        let members = self.store.list_slots_for_uuid(&slot.uuid)?;
        if !members.iter().all(|m| m.pending_remove) {
            debug!(vmid, uuid = %slot.uuid, "group member released, others still running");
            return Ok(());
        }
        if members.len() < slot.group_size as usize {
            warn!(
                uuid = %slot.uuid,
                present = members.len(),
                group_size = slot.group_size,
                "group has missing member rows, treating them as released"
            );
        }

        if members.iter().any(|m| !m.is_terminal()) {
            self.cancel_job(slot.lrm_handle.as_deref()).await;
        }
        let mut ids = Vec::with_capacity(members.len());
        for mut member in members {
            member.remove()?;
            ids.push(member.vmid);
        }
        let deleted = self.store.delete_slots(&ids)?;
        info!(uuid = %slot.uuid, deleted, "group slot released");
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────

    /// Best-effort job cancellation. Failures are logged only.
    pub(crate) async fn cancel_job(&self, handle: Option<&str>) {
        let Some(handle) = handle else {
            debug!("no job handle recorded, nothing to cancel");
            return;
        };
        let argv = self.builder.cancel(handle);
        match self.runner.run(&argv, None).await {
            Ok(output) if output.success() => debug!(%handle, "job cancelled"),
            Ok(output) => warn!(
                %handle,
                status = ?output.status,
                stderr = %output.stderr.trim(),
                "job cancellation failed"
            ),
            Err(e) => warn!(%handle, error = %e, "job cancellation failed"),
        }
    }

    /// Tear down the VM backing a slot. Must be called without holding the
    /// slot lock.
    pub(crate) async fn cancel_vm(&self, vmid: VmId, mode: TerminationMode) {
        match self.adapter() {
            Some(adapter) => adapter.cancel_instance(vmid, mode).await,
            None => {
                error!(vmid, "no slot adapter registered, releasing slot directly");
                if let Err(e) = self.release_space(vmid).await {
                    error!(vmid, error = %e, "failed to release slot");
                }
            }
        }
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn slots(&self) -> StateResult<Vec<PilotSlot>> {
        self.store.list_slots()
    }

    /// Notification log position last written to the store.
    pub fn persisted_cursor(&self) -> StateResult<u64> {
        self.cursor.persisted()
    }

    /// Write any debounced cursor position now.
    pub fn flush_cursor(&self) -> StateResult<()> {
        self.cursor.flush()
    }
}
