//! In-memory holder for spot and backfill requests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use pilotgrid_core::*;

#[derive(Default)]
pub struct AsyncRequestQueue {
    requests: RwLock<HashMap<String, AsyncRequest>>,
}

impl AsyncRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn requests(&self) -> Vec<AsyncRequest> {
        let mut all: Vec<AsyncRequest> = self.requests.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }
}

#[async_trait]
impl AsyncRequestManager for AsyncRequestQueue {
    async fn add_request(&self, request: AsyncRequest) -> Result<AsyncRequest, AsyncRequestError> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id) {
            return Err(AsyncRequestError::Rejected(format!(
                "duplicate request id {}",
                request.id
            )));
        }
        info!(id = %request.id, persistent = request.persistent, "async request queued");
        requests.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    async fn state_notification(&self, vmid: VmId, state: InstanceState) {
        debug!(vmid, ?state, "async request manager notified");
    }
}
