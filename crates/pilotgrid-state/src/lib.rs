//! pilotgrid-state — embedded state store for PilotGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for instance resources, idempotent reservations, pilot slots,
//! accounting charges, the notification cursor and the VM id sequence.
//!
//! # Architecture
//!
//! Domain types are JSON-serialized into redb's `&[u8]` value columns and
//! keyed by VM id (or by a digest of creator and client token for
//! idempotent reservations). Group slot rows share a uuid and are found by
//! scanning the `slots` table.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod home;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use home::StoreInstanceHome;
pub use store::StateStore;
pub use types::*;
