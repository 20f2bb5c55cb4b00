//! pilotgrid-core — shared vocabulary for PilotGrid.
//!
//! Holds the domain types that flow through VM creation and slot
//! scheduling, the collaborator contracts (`Scheduler`, `BindingAdapter`,
//! `NetworkAdapter`, `AccountingAdapter`, `InstanceHome`, ...), the
//! `pilotgrid.toml` configuration, per-key locks and the
//! `CompensationResult` used by every rollback path.

pub mod adapters;
pub mod compensation;
pub mod config;
pub mod error;
pub mod sync;
pub mod types;

pub use adapters::*;
pub use compensation::{CompensationFailure, CompensationResult};
pub use config::PilotGridConfig;
pub use error::*;
pub use sync::{KeyedGuard, KeyedLock};
pub use types::*;
