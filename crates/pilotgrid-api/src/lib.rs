//! pilotgrid-api — REST API for PilotGrid.
//!
//! Axum routes for creating, inspecting and destroying instances, plus the
//! pilot notification endpoint served from the same listener.
//!
//! The caller is taken from the `x-pilotgrid-caller` header; a
//! `x-pilotgrid-superuser: true` header grants superuser rights. The
//! daemon is expected to sit behind something that authenticates and sets
//! these headers.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/instances` | List the caller's instances |
//! | POST | `/api/v1/instances` | Create instances |
//! | GET | `/api/v1/instances/{id}` | Get one instance |
//! | DELETE | `/api/v1/instances/{id}` | Destroy an instance |
//! | POST | `/api/v1/async-requests` | Queue a spot or backfill request |
//! | POST | `/api/v1/coschedule/{id}/proceed` | Start a co-scheduled ensemble |
//! | GET | `/api/v1/slots` | List pilot slots |
//! | POST | `/pilot/v1/notify` | Pilot lifecycle notification |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use pilotgrid_creation::CreationManager;
use pilotgrid_pilot::{PilotSlotManager, notification_router};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub creation: Arc<CreationManager>,
    pub slots: Arc<PilotSlotManager>,
}

/// Build the complete router. The notification endpoint is mounted only
/// when pilots report over HTTP.
pub fn build_router(state: ApiState, http_notifications: bool) -> Router {
    let api_routes = Router::new()
        .route("/instances", get(handlers::list_instances).post(handlers::create_instances))
        .route("/instances/{id}", get(handlers::get_instance).delete(handlers::destroy_instance))
        .route("/async-requests", post(handlers::add_async_request))
        .route("/coschedule/{id}/proceed", post(handlers::proceed_coschedule))
        .route("/slots", get(handlers::list_slots))
        .with_state(state.clone());

    let router = Router::new().nest("/api/v1", api_routes);
    if http_notifications {
        router.merge(notification_router(state.slots))
    } else {
        router
    }
}
