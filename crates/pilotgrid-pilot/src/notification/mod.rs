//! The two channels pilots report through: an HTTP endpoint and a polled
//! JSON-lines log. Both feed [`PilotSlotManager::dispatch`](crate::PilotSlotManager::dispatch).

pub mod cursor;
pub mod http;
pub mod log;

pub use cursor::CursorDebouncer;
pub use http::notification_router;
pub use log::LogPoller;
