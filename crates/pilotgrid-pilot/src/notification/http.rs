//! HTTP notification endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tracing::debug;

use crate::events::PilotEvent;
use crate::manager::PilotSlotManager;

/// Router serving `POST /pilot/v1/notify`.
pub fn notification_router(manager: Arc<PilotSlotManager>) -> Router {
    Router::new()
        .route("/pilot/v1/notify", post(notify))
        .with_state(manager)
}

/// POST /pilot/v1/notify
///
/// Handled before responding, so a pilot that sees 202 knows the event
/// was applied.
pub async fn notify(
    State(manager): State<Arc<PilotSlotManager>>,
    Json(event): Json<PilotEvent>,
) -> StatusCode {
    debug!(slot_id = %event.slot_id(), "notification received over http");
    manager.dispatch(event).await;
    StatusCode::ACCEPTED
}
