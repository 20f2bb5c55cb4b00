//! Debounced persistence of the notification log cursor.
//!
//! The log poller may advance the cursor many times per second. Instead of
//! writing each position, the debouncer keeps only the latest value and a
//! single armed timer; when the timer fires it persists whatever the latest
//! value is at that moment. Check-and-arm happens under one mutex so at most
//! one timer is ever outstanding.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pilotgrid_state::{StateResult, StateStore};
use tracing::warn;

#[derive(Default)]
struct PendingCursor {
    latest: Option<u64>,
    armed: bool,
}

struct Inner {
    store: StateStore,
    delay: Duration,
    pending: Mutex<PendingCursor>,
    writes: AtomicU64,
}

impl Inner {
    fn take_latest(&self, disarm: bool) -> Option<u64> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if disarm {
            pending.armed = false;
        }
        pending.latest.take()
    }

    fn persist(&self, position: u64) -> StateResult<()> {
        self.store.set_notification_cursor(position)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn fire(&self) {
        if let Some(position) = self.take_latest(true) {
            if let Err(e) = self.persist(position) {
                warn!(position, error = %e, "failed to persist notification cursor");
            }
        }
    }
}

/// Single-slot "latest value + armed timer" cursor writer.
#[derive(Clone)]
pub struct CursorDebouncer {
    inner: Arc<Inner>,
}

impl CursorDebouncer {
    pub fn new(store: StateStore, delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                delay,
                pending: Mutex::new(PendingCursor::default()),
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// Record a new position; persisted once the debounce window closes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn update(&self, position: u64) {
        let arm = {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.latest = Some(position);
            !std::mem::replace(&mut pending.armed, true)
        };
        if arm {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(inner.delay).await;
                inner.fire();
            });
        }
    }

    /// Persist a pending position right away (used on shutdown).
    pub fn flush(&self) -> StateResult<()> {
        match self.inner.take_latest(false) {
            Some(position) => self.inner.persist(position),
            None => Ok(()),
        }
    }

    /// Position last written to the store.
    pub fn persisted(&self) -> StateResult<u64> {
        self.inner.store.notification_cursor()
    }

    /// Number of store writes performed so far.
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }
}
