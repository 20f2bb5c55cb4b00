//! Pilot lifecycle notifications.
//!
//! These are the only way a slot advances past `requested`. They arrive
//! from a remote pilot, so nothing here returns an error: anomalies end in
//! a log line and, where the VM can no longer be trusted, a hard cancel.

use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use pilotgrid_core::{TerminationMode, VmId};
use pilotgrid_state::PilotSlot;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn, Level};

use crate::manager::PilotSlotManager;

/// Extra seconds on top of the pilot grace period within which an
/// early-unreserving notice still counts as fresh.
const FRESHNESS_SLACK_SECS: i64 = 2;

/// One message from a pilot, as carried by either notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PilotEvent {
    Reserved {
        slot_id: String,
        #[serde(default)]
        hostname: Option<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    ErrorReserving {
        slot_id: String,
        #[serde(default)]
        hostname: Option<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        error: Option<String>,
    },
    EarlyUnreserving {
        slot_id: String,
        #[serde(default)]
        hostname: Option<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    Unreserving {
        slot_id: String,
        #[serde(default)]
        hostname: Option<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    ErrorUnreserving {
        slot_id: String,
        #[serde(default)]
        hostname: Option<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        error: Option<String>,
    },
    Killed {
        slot_id: String,
        #[serde(default)]
        hostnames: Vec<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
}

impl PilotEvent {
    pub fn slot_id(&self) -> &str {
        match self {
            PilotEvent::Reserved { slot_id, .. }
            | PilotEvent::ErrorReserving { slot_id, .. }
            | PilotEvent::EarlyUnreserving { slot_id, .. }
            | PilotEvent::Unreserving { slot_id, .. }
            | PilotEvent::ErrorUnreserving { slot_id, .. }
            | PilotEvent::Killed { slot_id, .. } => slot_id,
        }
    }
}

struct PendingGuard<'a>(&'a PilotSlotManager);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PilotSlotManager {
    /// Route one event to its handler.
    pub async fn dispatch(&self, event: PilotEvent) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _pending = PendingGuard(self);

        match event {
            PilotEvent::Reserved {
                slot_id,
                hostname,
                timestamp,
            } => self.reserved(&slot_id, hostname.as_deref(), timestamp).await,
            PilotEvent::ErrorReserving {
                slot_id,
                hostname,
                error,
                ..
            } => {
                self.error_reserving(&slot_id, hostname.as_deref(), error.as_deref())
                    .await
            }
            PilotEvent::EarlyUnreserving {
                slot_id,
                hostname,
                timestamp,
            } => {
                self.early_unreserving(&slot_id, hostname.as_deref(), timestamp)
                    .await
            }
            PilotEvent::Unreserving {
                slot_id, hostname, ..
            } => self.unreserving(&slot_id, hostname.as_deref()).await,
            PilotEvent::ErrorUnreserving {
                slot_id,
                hostname,
                error,
                ..
            } => {
                self.error_unreserving(&slot_id, hostname.as_deref(), error.as_deref())
                    .await
            }
            PilotEvent::Killed {
                slot_id, hostnames, ..
            } => self.kills(&slot_id, &hostnames).await,
        }
    }

    /// Events from either channel whose handler has not returned yet.
    /// Checked at shutdown, after the last cursor flush.
    pub fn num_pending_notifications(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Record how far the notification log has been consumed.
    pub fn cursor_position(&self, position: u64) {
        self.cursor.update(position);
    }

    // ── reserved ──────────────────────────────────────────────────

    /// A pilot started on `hostname`; bind it to the next waiting member.
    pub async fn reserved(
        &self,
        slot_id: &str,
        hostname: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
    ) {
        enum Outcome {
            Notify {
                vmid: VmId,
                start: DateTime<Utc>,
                stop: DateTime<Utc>,
                hostname: String,
            },
            Cancel(VmId),
        }

        let outcome = {
            let _guard = self.slot_locks.lock(slot_id.to_string()).await;
            let rows = match self.store.list_slots_for_uuid(slot_id) {
                Ok(rows) => rows,
                Err(e) => {
                    error!(%slot_id, error = %e, "failed to load slot for reserved notification");
                    return;
                }
            };
            if rows.is_empty() {
                warn!(%slot_id, "reserved notification for unknown slot");
                return;
            }
            if let Some(host) = hostname {
                if rows.iter().any(|r| r.node() == Some(host)) {
                    debug!(%slot_id, hostname = %host, "duplicate reserved notification");
                    return;
                }
            }
            let Some(mut target) = rows.into_iter().find(PilotSlot::is_pending) else {
                warn!(%slot_id, "reserved notification but no member is waiting");
                return;
            };

            match (hostname, timestamp) {
                (Some(host), Some(start)) if target.duration_secs <= target.slot_duration_secs => {
                    match target.reserve(host).map_err(|e| e.to_string()).and_then(|()| {
                        self.store.put_slot(&target).map_err(|e| e.to_string())
                    }) {
                        Ok(()) => Outcome::Notify {
                            vmid: target.vmid,
                            start,
                            stop: start + chrono::Duration::seconds(target.duration_secs as i64),
                            hostname: host.to_string(),
                        },
                        Err(e) => {
                            error!(%slot_id, vmid = target.vmid, error = %e, "failed to record reservation");
                            Outcome::Cancel(target.vmid)
                        }
                    }
                }
                (Some(_), Some(_)) => {
                    error!(
                        %slot_id,
                        vmid = target.vmid,
                        duration_secs = target.duration_secs,
                        slot_duration_secs = target.slot_duration_secs,
                        "vm duration exceeds slot window"
                    );
                    Outcome::Cancel(target.vmid)
                }
                _ => {
                    error!(%slot_id, vmid = target.vmid, "reserved notification without hostname or timestamp");
                    Outcome::Cancel(target.vmid)
                }
            }
        };

        match outcome {
            Outcome::Notify {
                vmid,
                start,
                stop,
                hostname,
            } => {
                let Some(adapter) = self.adapter() else {
                    error!(%slot_id, vmid, "no slot adapter registered, cannot start vm");
                    self.cancel_vm(vmid, TerminationMode::Immediate).await;
                    return;
                };
                match adapter.slot_reserved(vmid, start, stop, &hostname).await {
                    Ok(()) => info!(%slot_id, vmid, %hostname, %stop, "slot reserved"),
                    Err(e) => {
                        error!(%slot_id, vmid, error = %e, "scheduler rejected reserved slot");
                        self.cancel_vm(vmid, TerminationMode::Immediate).await;
                    }
                }
            }
            Outcome::Cancel(vmid) => self.cancel_vm(vmid, TerminationMode::Immediate).await,
        }
    }

    // ── terminal paths ────────────────────────────────────────────

    pub async fn error_reserving(&self, slot_id: &str, hostname: Option<&str>, cause: Option<&str>) {
        warn!(%slot_id, hostname = hostname.unwrap_or(""), error = cause.unwrap_or(""), "pilot failed to reserve");
        let hosts: Vec<&str> = hostname.into_iter().collect();
        self.terminate_and_cancel(slot_id, &hosts, TerminationMode::Immediate, Level::WARN)
            .await;
    }

    /// The pilot is being preempted. A fresh notice still gets a clean
    /// guest shutdown; a stale one means we were not listening in time.
    pub async fn early_unreserving(
        &self,
        slot_id: &str,
        hostname: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
    ) {
        let window = self.config.grace_secs as i64 + FRESHNESS_SLACK_SECS;
        let fresh = timestamp.is_some_and(|ts| (Utc::now() - ts).num_seconds() <= window);
        let mode = if fresh {
            TerminationMode::Shutdown
        } else {
            TerminationMode::Immediate
        };
        info!(%slot_id, hostname = hostname.unwrap_or(""), fresh, "pilot unreserving early");
        let hosts: Vec<&str> = hostname.into_iter().collect();
        self.terminate_and_cancel(slot_id, &hosts, mode, Level::DEBUG)
            .await;
    }

    pub async fn unreserving(&self, slot_id: &str, hostname: Option<&str>) {
        debug!(%slot_id, hostname = hostname.unwrap_or(""), "pilot unreserving");
        let hosts: Vec<&str> = hostname.into_iter().collect();
        self.terminate_and_cancel(slot_id, &hosts, TerminationMode::Immediate, Level::DEBUG)
            .await;
    }

    pub async fn error_unreserving(&self, slot_id: &str, hostname: Option<&str>, cause: Option<&str>) {
        error!(%slot_id, hostname = hostname.unwrap_or(""), error = cause.unwrap_or(""), "pilot failed while unreserving");
        let hosts: Vec<&str> = hostname.into_iter().collect();
        self.terminate_and_cancel(slot_id, &hosts, TerminationMode::Immediate, Level::WARN)
            .await;
    }

    /// The batch scheduler killed the pilot on `hostnames` (all members
    /// when empty).
    pub async fn kills(&self, slot_id: &str, hostnames: &[String]) {
        info!(%slot_id, ?hostnames, "pilot killed");
        let hosts: Vec<&str> = hostnames.iter().map(String::as_str).collect();
        self.terminate_and_cancel(slot_id, &hosts, TerminationMode::Immediate, Level::DEBUG)
            .await;
    }

    /// Mark the affected members terminal, then cancel their VMs outside
    /// the slot lock. Members that are already terminal are skipped, so a
    /// replayed event does nothing.
    async fn terminate_and_cancel(
        &self,
        slot_id: &str,
        hostnames: &[&str],
        mode: TerminationMode,
        missing: Level,
    ) {
        let vmids = {
            let _guard = self.slot_locks.lock(slot_id.to_string()).await;
            let rows = match self.store.list_slots_for_uuid(slot_id) {
                Ok(rows) => rows,
                Err(e) => {
                    error!(%slot_id, error = %e, "failed to load slot");
                    return;
                }
            };
            if rows.is_empty() {
                // Expected when we cancelled the job ourselves.
                if missing == Level::DEBUG {
                    debug!(%slot_id, "notification for slot that is already gone");
                } else {
                    warn!(%slot_id, "notification for unknown slot");
                }
                return;
            }

            let mut affected = Vec::new();
            for mut row in select_members(rows, hostnames) {
                if row.is_terminal() {
                    debug!(%slot_id, vmid = row.vmid, "member already terminal");
                    continue;
                }
                if let Err(e) = row.terminate() {
                    error!(%slot_id, vmid = row.vmid, error = %e, "cannot mark slot terminal");
                    continue;
                }
                if let Err(e) = self.store.put_slot(&row) {
                    error!(%slot_id, vmid = row.vmid, error = %e, "failed to record terminal slot");
                }
                affected.push(row.vmid);
            }
            affected
        };

        for vmid in vmids {
            self.cancel_vm(vmid, mode).await;
        }
    }
}

/// Rows named by `hostnames`. A hostname with no reserved row falls back to
/// the next member still waiting for a node. No hostnames means every row.
fn select_members(rows: Vec<PilotSlot>, hostnames: &[&str]) -> Vec<PilotSlot> {
    if hostnames.is_empty() {
        return rows;
    }
    let mut remaining = rows;
    let mut selected = Vec::new();
    for host in hostnames {
        let index = remaining
            .iter()
            .position(|r| r.node() == Some(*host))
            .or_else(|| remaining.iter().position(PilotSlot::is_pending));
        if let Some(index) = index {
            selected.push(remaining.remove(index));
        }
    }
    selected
}
