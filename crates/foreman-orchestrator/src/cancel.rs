use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

// ---------------------------------------------------------------------------
// CancelHandle
// ---------------------------------------------------------------------------

/// Cooperative cancellation for one pipeline.
///
/// Triggering is idempotent. The orchestrator skips subtasks that have not
/// started when it observes the flag; in-flight worker calls are left to
/// finish so their outcomes can still be recorded.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    notify: broadcast::Sender<()>,
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            notify,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the cancellation notification. Parked subtasks select
    /// on this so a cancel cuts their backoff sleep short.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    /// Trigger cancellation. Returns `true` only for the call that actually
    /// flipped the flag.
    pub fn trigger(&self) -> bool {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            debug!("cancellation triggered");
            // Send fails when nothing is parked; the flag still holds.
            let _ = self.notify.send(());
            true
        } else {
            false
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
