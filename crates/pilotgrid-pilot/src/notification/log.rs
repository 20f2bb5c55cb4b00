//! Polled notification log.
//!
//! Pilots that cannot reach the HTTP endpoint append one JSON
//! [`PilotEvent`] per line to a local file. The poller resumes from the
//! persisted byte offset, so entries consumed before a restart are not
//! handled twice.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::SlotResult;
use crate::events::PilotEvent;
use crate::manager::PilotSlotManager;

pub struct LogPoller {
    path: PathBuf,
    manager: Arc<PilotSlotManager>,
    interval: Duration,
    position: u64,
}

impl LogPoller {
    /// Start from the cursor last persisted by `manager`.
    pub fn new(path: PathBuf, manager: Arc<PilotSlotManager>, interval: Duration) -> SlotResult<Self> {
        let position = manager.persisted_cursor()?;
        Ok(Self {
            path,
            manager,
            interval,
            position,
        })
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Consume every complete line past the cursor. Returns the number of
    /// events dispatched.
    pub async fn poll_once(&mut self) -> SlotResult<usize> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "notification log does not exist yet");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if len < self.position {
            warn!(
                path = %self.path.display(),
                len,
                cursor = self.position,
                "notification log truncated, starting over"
            );
            self.position = 0;
            self.manager.cursor_position(0);
        }
        if len == self.position {
            return Ok(0);
        }

        file.seek(SeekFrom::Start(self.position)).await?;
        let mut buf = Vec::with_capacity((len - self.position) as usize);
        file.read_to_end(&mut buf).await?;

        let mut dispatched = 0;
        let mut rest = buf.as_slice();
        // A trailing partial line is left for the next poll.
        while let Some(end) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(end + 1);
            rest = tail;
            self.position += line.len() as u64;

            let text = String::from_utf8_lossy(line);
            let text = text.trim();
            if !text.is_empty() {
                match serde_json::from_str::<PilotEvent>(text) {
                    Ok(event) => {
                        self.manager.dispatch(event).await;
                        dispatched += 1;
                    }
                    Err(e) => warn!(offset = self.position, error = %e, "skipping malformed notification"),
                }
            }
            self.manager.cursor_position(self.position);
        }
        Ok(dispatched)
    }

    /// Poll until `shutdown` flips, then flush the cursor.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(path = %self.path.display(), cursor = self.position, "notification log poller started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.poll_once().await {
                        error!(path = %self.path.display(), error = %e, "notification log poll failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        if let Err(e) = self.manager.flush_cursor() {
            error!(error = %e, "failed to flush notification cursor");
        }
        info!(
            cursor = self.position,
            in_flight = self.manager.num_pending_notifications(),
            "notification log poller stopped"
        );
    }
}
