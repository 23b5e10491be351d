//! Human-readable rendering of engine events.

use beam_core::{AppEvent, EventBus};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 * 100.0 / total as f64
    }
}

pub fn render(event: &AppEvent) -> String {
    match event {
        AppEvent::ServerStatus { running: true, port } => format!("Listening on port {}", port),
        AppEvent::ServerStatus { running: false, .. } => "Receiver stopped".to_string(),
        AppEvent::FileReceived {
            file_name,
            path,
            size,
            sender,
            ..
        } => format!(
            "Received {} ({} bytes) from {} -> {}",
            file_name,
            size,
            sender,
            path.display()
        ),
        AppEvent::VerificationFailed {
            file_name, reason, ..
        } => format!("Verification FAILED for {}: {}", file_name, reason),
        AppEvent::TransferStarted(u) => format!(
            "Sending {} ({} bytes) to {}",
            u.file_name, u.total_bytes, u.target_host
        ),
        AppEvent::TransferProgress(u) => format!(
            "  {} {:>5.1}% ({}/{} bytes)",
            u.file_name,
            percent(u.bytes_transferred, u.total_bytes),
            u.bytes_transferred,
            u.total_bytes
        ),
        AppEvent::TransferCompleted(u) => format!("Sent {}", u.file_name),
        AppEvent::TransferFailed(u) => format!(
            "Failed {}: {}",
            u.file_name,
            u.error.as_deref().unwrap_or("unknown error")
        ),
        AppEvent::TransferQueued { id, description } => format!("Queued {} [{}]", description, id),
        AppEvent::QueueStarted => "Queue started".to_string(),
        AppEvent::QueueStopped => "Queue stopping".to_string(),
        AppEvent::QueueCleared => "Queue cleared".to_string(),
        AppEvent::QueueJobFinished {
            description,
            success: true,
            ..
        } => format!("Job done: {}", description),
        AppEvent::QueueJobFinished {
            description, error, ..
        } => format!(
            "Job failed: {}: {}",
            description,
            error.as_deref().unwrap_or("unknown error")
        ),
        AppEvent::QueueDrained => "Queue empty".to_string(),
    }
}

/// Print every event on `events` until the bus closes
pub fn spawn(events: &EventBus) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => println!("{}", render(&event)),
                Err(RecvError::Lagged(n)) => tracing::debug!("Printer skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
