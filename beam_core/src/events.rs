//! Lifecycle notifications for the push layer.
//!
//! Events serialize as `{"type": "<snake_case>", ...}` so a WebSocket
//! broadcaster can forward them unchanged.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1000;

/// Snapshot of one outgoing file transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferUpdate {
    pub id: String,
    pub file_name: String,
    pub target_host: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// KB/s, when throttled
    pub speed_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    ServerStatus {
        running: bool,
        port: u16,
    },

    FileReceived {
        id: String,
        file_name: String,
        path: PathBuf,
        directory: PathBuf,
        size: u64,
        /// Unix timestamp in milliseconds
        received_at: u64,
        sender: String,
    },

    /// Received file kept on disk but its hash does not match
    VerificationFailed {
        file_name: String,
        path: PathBuf,
        sender: String,
        reason: String,
    },

    TransferStarted(TransferUpdate),
    TransferProgress(TransferUpdate),
    TransferCompleted(TransferUpdate),
    TransferFailed(TransferUpdate),

    TransferQueued {
        id: String,
        description: String,
    },
    QueueStarted,
    QueueStopped,
    QueueCleared,
    QueueJobFinished {
        id: String,
        description: String,
        success: bool,
        error: Option<String>,
    },
    /// Backlog ran empty
    QueueDrained,
}

/// Publish/subscribe channel for [`AppEvent`]s.
///
/// Emitting never blocks and never fails; with no subscribers the event is
/// dropped. Slow subscribers lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: AppEvent) {
        tracing::trace!(?event, "event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }
}
