//! Fakes shared by the unit tests of this crate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pilotgrid_core::config::PilotConfig;
use pilotgrid_core::{SchedulingError, SlotAdapter, TerminationMode, VmId};
use pilotgrid_state::StateStore;

use crate::error::SlotResult;
use crate::manager::PilotSlotManager;
use crate::runner::{CommandOutput, CommandRunner};

/// Answers `qsub` with `N.head` and `qdel` with success.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<(Vec<String>, Option<String>)>>,
    fail_submit: bool,
}

impl FakeRunner {
    pub fn failing_submit() -> Self {
        Self {
            fail_submit: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(Vec<String>, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn submits(&self) -> Vec<(Vec<String>, String)> {
        self.calls()
            .into_iter()
            .filter(|(argv, _)| argv[0] == "qsub")
            .map(|(argv, script)| (argv, script.unwrap_or_default()))
            .collect()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(argv, _)| argv[0] == "qdel")
            .map(|(argv, _)| argv[1].clone())
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, argv: &[String], stdin: Option<&str>) -> SlotResult<CommandOutput> {
        let submitted = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((argv.to_vec(), stdin.map(str::to_string)));
            calls.iter().filter(|(a, _)| a[0] == "qsub").count()
        };
        let output = match argv[0].as_str() {
            "qsub" if self.fail_submit => CommandOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: "qsub: queue is disabled".to_string(),
            },
            "qsub" => CommandOutput {
                status: Some(0),
                stdout: format!("{submitted}.head\n"),
                stderr: String::new(),
            },
            _ => CommandOutput {
                status: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            },
        };
        Ok(output)
    }
}

pub fn manager_with(runner: FakeRunner) -> (PilotSlotManager, Arc<FakeRunner>) {
    let runner = Arc::new(runner);
    let mgr = PilotSlotManager::new(
        StateStore::open_in_memory().unwrap(),
        PilotConfig::default(),
        runner.clone(),
        Duration::from_millis(50),
    );
    (mgr, runner)
}

pub fn manager() -> (PilotSlotManager, Arc<FakeRunner>) {
    manager_with(FakeRunner::default())
}

type ReservedCall = (VmId, DateTime<Utc>, DateTime<Utc>, String);

/// Records what the slot manager reports.
#[derive(Default)]
pub struct RecordingAdapter {
    reserved: Mutex<Vec<ReservedCall>>,
    cancels: Mutex<Vec<(VmId, TerminationMode)>>,
    reject: bool,
}

impl RecordingAdapter {
    fn register(mgr: &PilotSlotManager, adapter: RecordingAdapter) -> Arc<Self> {
        let adapter = Arc::new(adapter);
        let shared: Arc<dyn SlotAdapter> = adapter.clone();
        mgr.set_adapter(&shared);
        adapter
    }

    pub fn install(mgr: &PilotSlotManager) -> Arc<Self> {
        Self::register(mgr, Self::default())
    }

    pub fn install_rejecting(mgr: &PilotSlotManager) -> Arc<Self> {
        Self::register(
            mgr,
            Self {
                reject: true,
                ..Self::default()
            },
        )
    }

    pub fn reserved_calls(&self) -> Vec<ReservedCall> {
        self.reserved.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> Vec<(VmId, TerminationMode)> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait]
impl SlotAdapter for RecordingAdapter {
    async fn slot_reserved(
        &self,
        vmid: VmId,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        hostname: &str,
    ) -> Result<(), SchedulingError> {
        if self.reject {
            return Err(SchedulingError::UnknownVm(vmid));
        }
        self.reserved
            .lock()
            .unwrap()
            .push((vmid, start, stop, hostname.to_string()));
        Ok(())
    }

    async fn cancel_instance(&self, vmid: VmId, mode: TerminationMode) {
        self.cancels.lock().unwrap().push((vmid, mode));
    }
}
