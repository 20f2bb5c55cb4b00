//! Batch-scheduler and pilot argument vectors.
//!
//! Submission uses the PBS/Torque `qsub` flag set; the job script is fed
//! on stdin and simply execs the pilot with the protocol-0.2 layout:
//!
//! ```text
//! <pilot> --protocol 0.2 --memory <mb> --duration <secs> --grace <secs> \
//!         --slot <uuid> --notify <contact>
//! ```

use pilotgrid_core::config::PilotConfig;

use crate::error::{SlotError, SlotResult};

/// Separates the SSH and HTTP contacts in the pilot's `--notify` value.
pub const CONTACT_SEPARATOR: &str = "+++";

/// What a single job submission must reserve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitSpec {
    pub uuid: String,
    pub nodes: u32,
    /// Memory the pilot holds back for the VM (max over the group).
    pub memory_mb: u64,
    /// VM running time (max over the group), without padding.
    pub duration_secs: u64,
}

/// A ready-to-run submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitCommand {
    pub argv: Vec<String>,
    /// Job script written to the submit command's stdin.
    pub script: String,
}

/// Builds submission, cancellation and pilot argument vectors.
#[derive(Debug, Clone)]
pub struct PilotCommandBuilder {
    config: PilotConfig,
}

impl PilotCommandBuilder {
    pub fn new(config: PilotConfig) -> Self {
        Self { config }
    }

    /// Combined SSH and HTTP notification contact.
    pub fn notification_contact(&self) -> Option<String> {
        let parts: Vec<&str> = [
            self.config.ssh_contact.as_deref(),
            self.config.http_contact.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(CONTACT_SEPARATOR))
        }
    }

    /// Pilot argv for one slot.
    pub fn pilot_args(&self, spec: &SubmitSpec) -> SlotResult<Vec<String>> {
        if self.config.protocol_version != "0.2" {
            return Err(SlotError::Denied(format!(
                "unsupported pilot protocol {}",
                self.config.protocol_version
            )));
        }
        let contact = self
            .notification_contact()
            .ok_or_else(|| SlotError::Denied("no notification contact configured".to_string()))?;

        Ok(vec![
            self.config.pilot_path.clone(),
            "--protocol".to_string(),
            "0.2".to_string(),
            "--memory".to_string(),
            spec.memory_mb.to_string(),
            "--duration".to_string(),
            spec.duration_secs.to_string(),
            "--grace".to_string(),
            self.config.grace_secs.to_string(),
            "--slot".to_string(),
            spec.uuid.clone(),
            "--notify".to_string(),
            contact,
        ])
    }

    /// Submit argv plus the job script that launches the pilot.
    pub fn submit(&self, spec: &SubmitSpec) -> SlotResult<SubmitCommand> {
        let pilot = self.pilot_args(spec)?;
        let walltime = spec.duration_secs + self.config.padding_secs;

        let mut argv = vec![self.config.submit_path.clone()];
        if let Some(queue) = &self.config.queue {
            argv.push("-q".to_string());
            argv.push(queue.clone());
        }
        argv.push("-N".to_string());
        argv.push(self.config.job_name.clone());
        argv.push("-l".to_string());
        argv.push(format!(
            "nodes={}:ppn={}",
            spec.nodes, self.config.processors_per_node
        ));
        argv.push("-l".to_string());
        argv.push(format!("walltime={}", format_walltime(walltime)));
        argv.push("-l".to_string());
        argv.push(format!("mem={}mb", spec.memory_mb * spec.nodes as u64));
        if let Some(account) = &self.config.account {
            argv.push("-A".to_string());
            argv.push(account.clone());
        }
        argv.extend(["-j", "oe", "-o", "/dev/null"].map(String::from));

        let quoted: Vec<String> = pilot.iter().map(|a| shell_quote(a)).collect();
        let script = format!("#!/bin/sh\nexec {}\n", quoted.join(" "));

        Ok(SubmitCommand { argv, script })
    }

    pub fn cancel(&self, handle: &str) -> Vec<String> {
        vec![self.config.cancel_path.clone(), handle.to_string()]
    }
}

/// `HH:MM:SS`, hours unbounded.
pub fn format_walltime(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Single-quote `arg` for `/bin/sh`.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@+".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}
