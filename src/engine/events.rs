// Lifecycle event emission — fire-and-forget notifications to the host.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// One lifecycle notification, tagged with the originating request's logical
/// reference. Delivery is ordered per cache key only.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageEvent {
    /// Waiting for a worker slot.
    Queued { id: String },
    /// A network fetch began.
    Started { id: String },
    Progress {
        id: String,
        bytes_received: u64,
        bytes_total: Option<u64>,
    },
    Succeeded { id: String, local_path: PathBuf },
    Failed { id: String, reason: String },
    Cancelled { id: String },
    /// Resolution diagnostics, emitted only when the request asked for them.
    Log { id: String, message: String },
    /// The disk cache was cleared by the host.
    CacheCleared,
}

/// Sends events to the host channel without ever blocking the pipeline.
/// A full or closed channel drops the event; loss of a notification is not
/// a protocol failure.
#[derive(Clone)]
pub struct EventEmitter {
    tx: Option<mpsc::Sender<ImageEvent>>,
}

impl EventEmitter {
    /// Emitter backed by a bounded channel; the receiver belongs to the
    /// host bridge.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ImageEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// Emitter that discards everything. Used when the host does not listen.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ImageEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            debug!("event dropped: {}", e);
        }
    }
}
