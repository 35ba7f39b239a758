use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

/// Graceful-shutdown fan-out. Components subscribe before start; the
/// first `shutdown()` call broadcasts to all of them, later calls are
/// no-ops.
#[derive(Clone)]
pub struct ShutdownManager {
    tx: broadcast::Sender<()>,
    fired: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn shutdown(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!("shutdown already triggered");
            return;
        }
        info!(subscribers = self.tx.receiver_count(), "broadcasting shutdown");
        let _ = self.tx.send(());
    }

    pub fn is_shutdown(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
