//! StateStore — redb-backed state persistence for PilotGrid.
//!
//! Provides typed CRUD over instances, idempotent reservations, pilot slots
//! and accounting charges, plus the notification cursor and the VM id
//! sequence. Every call is one short transaction; nothing holds a
//! transaction open across an await point. The store supports both on-disk
//! and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use pilotgrid_core::{InstanceResource, VmId};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(IDEMPOTENCY).map_err(map_err!(Table))?;
        txn.open_table(SLOTS).map_err(map_err!(Table))?;
        txn.open_table(CHARGES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values in `table` accepted by `keep`.
    fn scan_json<T, F>(&self, table: JsonTable, keep: F) -> StateResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&item) {
                results.push(item);
            }
        }
        Ok(results)
    }

    fn delete_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert a new instance; fails if the id is already taken.
    pub fn insert_instance(&self, resource: &InstanceResource) -> StateResult<()> {
        let key = resource.id.to_string();
        let value = serde_json::to_vec(resource).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!("instance {key}")));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(vmid = resource.id, "instance stored");
        Ok(())
    }

    /// Insert or update an instance.
    pub fn put_instance(&self, resource: &InstanceResource) -> StateResult<()> {
        self.put_json(INSTANCES, &resource.id.to_string(), resource)
    }

    pub fn get_instance(&self, vmid: VmId) -> StateResult<Option<InstanceResource>> {
        self.get_json(INSTANCES, &vmid.to_string())
    }

    pub fn list_instances(&self) -> StateResult<Vec<InstanceResource>> {
        self.scan_json(INSTANCES, |_: &InstanceResource| true)
    }

    /// Instances of a group, ordered by launch index.
    pub fn list_instances_for_group(&self, group_id: &str) -> StateResult<Vec<InstanceResource>> {
        let mut members = self.scan_json(INSTANCES, |r: &InstanceResource| {
            r.group_id.as_deref() == Some(group_id)
        })?;
        members.sort_by_key(|r| r.launch_index);
        Ok(members)
    }

    /// Delete an instance. Returns true if it existed.
    pub fn delete_instance(&self, vmid: VmId) -> StateResult<bool> {
        let existed = self.delete_key(INSTANCES, &vmid.to_string())?;
        debug!(vmid, existed, "instance deleted");
        Ok(existed)
    }

    // ── Idempotent reservations ────────────────────────────────────

    pub fn put_reservation(&self, reservation: &IdempotentReservation) -> StateResult<()> {
        self.put_json(IDEMPOTENCY, &reservation.table_key(), reservation)
    }

    pub fn get_reservation(
        &self,
        creator_id: &str,
        client_token: &str,
    ) -> StateResult<Option<IdempotentReservation>> {
        self.get_json(IDEMPOTENCY, &idempotency_key(creator_id, client_token))
    }

    pub fn delete_reservation(&self, creator_id: &str, client_token: &str) -> StateResult<bool> {
        self.delete_key(IDEMPOTENCY, &idempotency_key(creator_id, client_token))
    }

    // ── Pilot slots ────────────────────────────────────────────────

    pub fn put_slot(&self, slot: &PilotSlot) -> StateResult<()> {
        self.put_json(SLOTS, &slot.table_key(), slot)
    }

    /// Write several slot rows in one transaction.
    pub fn put_slots(&self, slots: &[PilotSlot]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SLOTS).map_err(map_err!(Table))?;
            for slot in slots {
                let value = serde_json::to_vec(slot).map_err(map_err!(Serialize))?;
                table
                    .insert(slot.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = slots.len(), "slots stored");
        Ok(())
    }

    pub fn get_slot(&self, vmid: VmId) -> StateResult<Option<PilotSlot>> {
        self.get_json(SLOTS, &vmid.to_string())
    }

    pub fn list_slots(&self) -> StateResult<Vec<PilotSlot>> {
        self.scan_json(SLOTS, |_: &PilotSlot| true)
    }

    /// Every row sharing a slot uuid, ordered by vmid.
    pub fn list_slots_for_uuid(&self, uuid: &str) -> StateResult<Vec<PilotSlot>> {
        let mut rows = self.scan_json(SLOTS, |s: &PilotSlot| s.uuid == uuid)?;
        rows.sort_by_key(|s| s.vmid);
        Ok(rows)
    }

    pub fn delete_slot(&self, vmid: VmId) -> StateResult<bool> {
        self.delete_key(SLOTS, &vmid.to_string())
    }

    /// Delete several slot rows in one transaction. Returns how many existed.
    pub fn delete_slots(&self, vmids: &[VmId]) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        {
            let mut table = txn.open_table(SLOTS).map_err(map_err!(Table))?;
            for vmid in vmids {
                if table
                    .remove(vmid.to_string().as_str())
                    .map_err(map_err!(Write))?
                    .is_some()
                {
                    count += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Accounting charges ─────────────────────────────────────────

    pub fn put_charge(&self, charge: &ChargeRecord) -> StateResult<()> {
        self.put_json(CHARGES, &charge.table_key(), charge)
    }

    pub fn get_charge(&self, vmid: VmId) -> StateResult<Option<ChargeRecord>> {
        self.get_json(CHARGES, &vmid.to_string())
    }

    pub fn list_charges_for_creator(&self, creator: &str) -> StateResult<Vec<ChargeRecord>> {
        self.scan_json(CHARGES, |c: &ChargeRecord| c.creator == creator)
    }

    pub fn delete_charge(&self, vmid: VmId) -> StateResult<bool> {
        self.delete_key(CHARGES, &vmid.to_string())
    }

    // ── Meta ───────────────────────────────────────────────────────

    fn get_meta(&self, key: &str) -> StateResult<Option<u64>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        Ok(table.get(key).map_err(map_err!(Read))?.map(|g| g.value()))
    }

    fn set_meta(&self, key: &str, value: u64) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Persisted notification log position (0 if never written).
    pub fn notification_cursor(&self) -> StateResult<u64> {
        Ok(self.get_meta(META_NOTIFICATION_CURSOR)?.unwrap_or(0))
    }

    pub fn set_notification_cursor(&self, position: u64) -> StateResult<()> {
        self.set_meta(META_NOTIFICATION_CURSOR, position)?;
        debug!(position, "notification cursor persisted");
        Ok(())
    }

    /// Reserve `count` consecutive VM ids. The sequence starts at 1.
    pub fn next_vm_ids(&self, count: u32) -> StateResult<Vec<VmId>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let first;
        {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            first = table
                .get(META_NEXT_VM_ID)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(1);
            table
                .insert(META_NEXT_VM_ID, first + count as u64)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok((first..first + count as u64).collect())
    }
}
