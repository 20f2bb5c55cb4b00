//! Wiring of every PilotGrid subsystem into one running daemon.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::watch;
use tracing::{error, info, warn};

use pilotgrid_core::{InstanceTerminator, PilotGridConfig, SharedHome, SlotAdapter};
use pilotgrid_creation::{
    AsyncRequestQueue, Collaborators, CreationManager, DefaultBinding, LedgerAccounting,
    LimitAuthorizer, NetworkPool,
};
use pilotgrid_pilot::{CommandRunner, LogPoller, PilotSlotManager};
use pilotgrid_scheduler::SlotScheduler;
use pilotgrid_state::{StateStore, StoreInstanceHome};

/// Every long-lived component, already cross-registered.
pub struct Daemon {
    pub config: PilotGridConfig,
    pub store: StateStore,
    pub slots: Arc<PilotSlotManager>,
    pub scheduler: Arc<SlotScheduler>,
    pub creation: Arc<CreationManager>,
    pub network: Arc<NetworkPool>,
}

impl Daemon {
    /// Open the store and build the component graph.
    ///
    /// The slot manager and scheduler only hold weak references back to
    /// the scheduler and creation manager; `Daemon` owns the strong ones.
    /// Address leases and ensembles waiting to start are rebuilt from the
    /// persisted instances.
    pub async fn assemble(
        config: PilotGridConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.store.data_dir)?;
        let db_path = config.db_path();
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");

        let slots = Arc::new(PilotSlotManager::new(
            store.clone(),
            config.pilot.clone(),
            runner,
            Duration::from_millis(config.notifications.cursor_debounce_ms),
        ));
        let home: SharedHome = Arc::new(StoreInstanceHome::new(store.clone()));
        let scheduler = Arc::new(SlotScheduler::new(store.clone(), slots.clone(), home.clone()));
        let adapter: Arc<dyn SlotAdapter> = scheduler.clone();
        slots.set_adapter(&adapter);
        info!(
            max_memory_mb = config.pilot.max_memory_mb,
            queue = config.pilot.queue.as_deref().unwrap_or(""),
            "slot manager initialized"
        );

        let recovered = scheduler.recover_ensembles().await?;
        let network = Arc::new(NetworkPool::new(&config.networks));
        let restored = network.restore(&store.list_instances()?);
        info!(leases = restored, ensemble_members = recovered, "persisted state restored");

        let accounting = config.accounting.enabled.then(|| {
            Arc::new(LedgerAccounting::new(store.clone(), config.accounting.clone()))
                as Arc<dyn pilotgrid_core::AccountingAdapter>
        });
        let collaborators = Collaborators {
            binding: Arc::new(DefaultBinding::new(config.creation.clone())),
            authorizer: Arc::new(LimitAuthorizer::new(
                config.pilot.max_memory_mb,
                config.creation.max_duration_secs,
                config.creation.max_group_size,
            )),
            scheduler: scheduler.clone(),
            network: network.clone(),
            accounting,
            home,
            async_requests: Arc::new(AsyncRequestQueue::new()),
        };
        let creation = Arc::new(CreationManager::new(
            config.creation.clone(),
            store.clone(),
            collaborators,
        ));
        let terminator: Arc<dyn InstanceTerminator> = creation.clone();
        scheduler.set_terminator(&terminator);
        info!(
            networks = config.networks.len(),
            accounting = config.accounting.enabled,
            idempotency = config.creation.idempotency_enabled,
            "creation manager initialized"
        );

        Ok(Self {
            config,
            store,
            slots,
            scheduler,
            creation,
            network,
        })
    }

    pub fn router(&self) -> Router {
        let state = pilotgrid_api::ApiState {
            creation: self.creation.clone(),
            slots: self.slots.clone(),
        };
        pilotgrid_api::build_router(state, self.config.notifications.http_enabled)
    }

    /// Serve until Ctrl-C, then stop the background tasks and persist the
    /// notification cursor.
    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // ── Background tasks ───────────────────────────────────────

        let poller_handle = match &self.config.notifications.log_path {
            Some(path) => {
                let poller = LogPoller::new(
                    path.clone(),
                    self.slots.clone(),
                    Duration::from_millis(self.config.notifications.poll_interval_ms),
                )?;
                info!(path = ?path, position = poller.position(), "notification log poller starting");
                let shutdown = shutdown_rx.clone();
                Some(tokio::spawn(poller.run(shutdown)))
            }
            None => None,
        };

        // ── API server ─────────────────────────────────────────────

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.api.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, http_notifications = self.config.notifications.http_enabled, "API server starting");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "failed to listen for shutdown signal");
                }
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            })
            .await?;

        if let Some(handle) = poller_handle {
            let _ = handle.await;
        }
        if let Err(e) = self.slots.flush_cursor() {
            warn!(error = %e, "failed to persist notification cursor");
        }
        let pending = self.slots.num_pending_notifications();
        if pending > 0 {
            warn!(pending, "stopping with notifications still in flight");
        }

        info!("PilotGrid daemon stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use pilotgrid_core::config::{NetworkConfig, NetworkEntry};
    use pilotgrid_core::{Caller, CreateRequest, NicRequest};
    use pilotgrid_pilot::{CommandOutput, SlotResult};
    use tower::ServiceExt;

    struct Queue;

    #[async_trait]
    impl CommandRunner for Queue {
        async fn run(&self, argv: &[String], _stdin: Option<&str>) -> SlotResult<CommandOutput> {
            let stdout = if argv[0] == "qsub" { "100.head\n" } else { "" };
            Ok(CommandOutput {
                status: Some(0),
                stdout: stdout.to_string(),
                stderr: String::new(),
            })
        }
    }

    fn config(dir: &std::path::Path) -> PilotGridConfig {
        let mut config = PilotGridConfig::default();
        config.store.data_dir = dir.join("state");
        config.networks = vec![NetworkConfig {
            name: "public".to_string(),
            entries: vec![NetworkEntry {
                ip: "10.1.0.5".to_string(),
                hostname: "vm5".to_string(),
                gateway: None,
                mac: None,
            }],
        }];
        config
    }

    #[tokio::test]
    async fn assembled_daemon_creates_and_places_instances() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon::assemble(config(dir.path()), Arc::new(Queue)).await.unwrap();
        assert!(daemon.config.db_path().exists());
        let app = daemon.router();

        let body = serde_json::json!({
            "name": "web",
            "image": "base",
            "resources": { "memory_mb": 512, "cpu_count": 1, "node_count": 1 },
            "duration_secs": 600,
            "nics": [{ "name": "eth0", "network": "public" }]
        });
        let resp = app
            .clone()
            .oneshot(
                Request::post("/api/v1/instances")
                    .header("content-type", "application/json")
                    .header("x-pilotgrid-caller", "alice")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let slot = daemon.slots.slots().unwrap().remove(0);
        assert_eq!(slot.lrm_handle.as_deref(), Some("100.head"));

        let event = serde_json::json!({
            "event": "reserved",
            "slot_id": slot.uuid,
            "hostname": "node1",
            "timestamp": "2026-03-01T12:00:00Z"
        });
        let resp = app
            .oneshot(
                Request::post("/pilot/v1/notify")
                    .header("content-type", "application/json")
                    .body(Body::from(event.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let instance = daemon.store.get_instance(slot.vmid).unwrap().unwrap();
        assert_eq!(instance.node.as_deref(), Some("node1"));
        assert!(instance.ops_enabled);
        assert_eq!(instance.vm.nics[0].ip.as_deref(), Some("10.1.0.5"));
    }

    #[tokio::test]
    async fn state_survives_reassembly() {
        let dir = tempfile::tempdir().unwrap();
        let first = Daemon::assemble(config(dir.path()), Arc::new(Queue)).await.unwrap();
        first.store.set_notification_cursor(42).unwrap();
        let ids = first.store.next_vm_ids(2).unwrap();
        drop(first);

        let second = Daemon::assemble(config(dir.path()), Arc::new(Queue)).await.unwrap();
        assert_eq!(second.slots.persisted_cursor().unwrap(), 42);
        assert!(second.store.next_vm_ids(1).unwrap()[0] > ids[1]);
    }

    #[tokio::test]
    async fn leases_and_waiting_ensembles_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let alice = Caller::new("alice");
        let mut head = CreateRequest::single("head", 512, 1, 600);
        head.nics = vec![NicRequest {
            name: "eth0".to_string(),
            network: "public".to_string(),
        }];
        head.cosched_id = Some("ens".to_string());

        let vmid = {
            let first = Daemon::assemble(config(dir.path()), Arc::new(Queue)).await.unwrap();
            let created = first.creation.create(&head, &alice).await.unwrap();
            assert_eq!(first.network.available("public"), 0);
            // Let the deferred notifications finish so nothing holds the store.
            tokio::time::sleep(Duration::from_millis(200)).await;
            created[0].id
        };

        let second = Daemon::assemble(config(dir.path()), Arc::new(Queue)).await.unwrap();
        assert_eq!(second.network.available("public"), 0);
        assert_eq!(second.scheduler.pending_ensemble("ens").await, vec![vmid]);

        let mut web = head.clone();
        web.name = "web".to_string();
        web.cosched_id = None;
        assert!(second.creation.create(&web, &alice).await.is_err());

        second.creation.proceed_coschedule("ens", &alice).await.unwrap();
        let slot = second.store.get_slot(vmid).unwrap().unwrap();
        assert_eq!(slot.lrm_handle.as_deref(), Some("100.head"));

        second.creation.destroy(vmid, &alice).await.unwrap();
        assert_eq!(second.network.available("public"), 1);
    }
}
