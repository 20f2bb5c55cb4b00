//! pilotgrid-scheduler — VM scheduling on top of pilot slots.
//!
//! `SlotScheduler` implements the `Scheduler` contract used by VM creation
//! and the `SlotAdapter` contract used by the slot manager:
//!
//! ```text
//! CreationManager ──schedule/remove──▶ SlotScheduler ──reserve/release──▶ PilotSlotManager
//!        ▲                                   │  ▲                               │
//!        └──────terminate (InstanceTerminator)┘  └──slot_reserved/cancel_instance┘
//! ```
//!
//! Reservations are always best-effort: ids are assigned immediately, the
//! node and times arrive later when the pilot reports in.

pub mod error;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::SlotScheduler;
