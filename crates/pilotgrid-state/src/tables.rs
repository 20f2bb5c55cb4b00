//! redb table definitions for the PilotGrid state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Counters and cursors live in `meta` as plain `u64` values.

use redb::TableDefinition;

/// Instance resources keyed by `{vmid}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Idempotent reservations keyed by `hex(sha256(creator \0 token))`.
pub const IDEMPOTENCY: TableDefinition<&str, &[u8]> = TableDefinition::new("idempotency");

/// Pilot slot rows keyed by `{vmid}`. Group members share a `uuid`.
pub const SLOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("slots");

/// Accounting charges keyed by `{vmid}`.
pub const CHARGES: TableDefinition<&str, &[u8]> = TableDefinition::new("charges");

/// Counters and cursors.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Byte offset into the notification log already consumed.
pub const META_NOTIFICATION_CURSOR: &str = "notification_cursor";

/// Next VM id to hand out.
pub const META_NEXT_VM_ID: &str = "next_vm_id";
