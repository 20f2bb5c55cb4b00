//! Minimal collaborator implementations used by the daemon.
//!
//! Binding policy, address allocation, accounting and authorization belong
//! to other systems; these stand-ins implement the contracts simply enough
//! that every creation path can run end to end.

pub mod accounting;
pub mod async_queue;
pub mod authorization;
pub mod binding;
pub mod network;

pub use accounting::LedgerAccounting;
pub use async_queue::AsyncRequestQueue;
pub use authorization::LimitAuthorizer;
pub use binding::DefaultBinding;
pub use network::NetworkPool;
