//! pilotgrid-pilot — pilot slot manager for PilotGrid.
//!
//! Capacity on the batch cluster is obtained by submitting a pilot job per
//! slot. The job reserves a node (or one node per group member) and starts
//! the pilot, which reports its lifecycle back over HTTP or a local log.
//!
//! # Architecture
//!
//! - [`PilotSlotManager`] owns the slot rows in the state store and is the
//!   only writer. Reservation inserts rows as `requested`, submits the job
//!   and records its handle; release cancels the job (for groups, only
//!   once every member has asked).
//! - [`PilotEvent`]s advance slots past `requested`. Results flow out
//!   through the registered [`SlotAdapter`](pilotgrid_core::SlotAdapter).
//! - [`PilotCommandBuilder`] and [`CommandRunner`] turn slots into
//!   `qsub`/`qdel` invocations.
//! - [`notification`] hosts the HTTP route and the log poller with its
//!   debounced cursor.

pub mod command;
pub mod error;
pub mod events;
pub mod manager;
pub mod notification;
pub mod runner;

#[cfg(test)]
mod testing;

pub use command::{PilotCommandBuilder, SubmitCommand, SubmitSpec};
pub use error::{SlotError, SlotResult};
pub use events::PilotEvent;
pub use manager::{PilotSlotManager, SlotRequest};
pub use notification::{notification_router, CursorDebouncer, LogPoller};
pub use runner::{CommandOutput, CommandRunner, ProcessRunner};
