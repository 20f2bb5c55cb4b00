//! pilotgrid-creation — turning create requests into running instances.
//!
//! [`CreationManager`] accepts a request, binds it to concrete VM
//! descriptors and drives it through the creation pipeline. Every phase
//! that commits something registers the matching undo, so a failure at
//! any point leaves nothing behind.
//!
//! # Architecture
//!
//! ```text
//!   create(request, caller)
//!        │
//!        ├── validate ─▶ bind ─────────────────────────────┐
//!        │                                                 │
//!        ├── client token? ── lock(creator, token) ──┐     │
//!        │                     bound? ─▶ reuse       │     │
//!        ▼                                           ▼     ▼
//!   authorize ─▶ schedule ─▶ network ─▶ charge ─▶ persist ─▶ notify
//!        ▲           │           │          │         │
//!        └───────────┴── compensate in reverse ───────┘
//! ```
//!
//! The collaborators behind each phase are traits from `pilotgrid-core`.
//! The [`reference`] module has in-process implementations used by the
//! daemon and the tests.

pub mod bootstrap;
pub mod error;
mod idempotency;
pub mod manager;
mod pipeline;
pub mod reference;

#[cfg(test)]
mod testing;

pub use bootstrap::bootstrap_file;
pub use error::{CreationError, CreationResult};
pub use manager::{Collaborators, CreationManager};
pub use reference::{AsyncRequestQueue, DefaultBinding, LedgerAccounting, LimitAuthorizer, NetworkPool};
