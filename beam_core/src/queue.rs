//! Sequential transfer queue.
//!
//! Jobs run one at a time on a background task. `stop` cancels at job
//! boundaries; only a job that tracks resume state sees the cancellation
//! mid-file, since it can pick up where it left off. A persisted backlog is
//! re-read under a file lock before every change.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransferError};
use crate::events::{AppEvent, EventBus};
use crate::resume::now_millis;
use crate::transfer::{BatchReport, SendOptions, TransferClient};

pub const QUEUE_FILE: &str = "queue.json";
pub const STOP_MARKER_FILE: &str = "queue.stop";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum JobKind {
    SingleFile(PathBuf),
    MultiFile(Vec<PathBuf>),
    Directory(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    pub kind: JobKind,
    pub options: SendOptions,
    pub description: String,
    /// Unix timestamp in milliseconds
    pub queued_at: u64,
}

impl QueuedJob {
    pub fn new(kind: JobKind, options: SendOptions) -> Self {
        let what = match &kind {
            JobKind::SingleFile(path) => display_name(path),
            JobKind::MultiFile(paths) => format!("{} files", paths.len()),
            JobKind::Directory(path) => format!("{}/", display_name(path)),
        };
        let description = format!("{} -> {}", what, options.target());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            options,
            description,
            queued_at: now_millis(),
        }
    }

    pub async fn execute(&self, client: &TransferClient, cancel: &CancellationToken) -> Result<()> {
        match &self.kind {
            JobKind::SingleFile(path) => client
                .send_file(path, &self.options, cancel)
                .await
                .map(|_| ()),
            JobKind::MultiFile(paths) => {
                batch_result(client.send_multiple_files(paths, &self.options, cancel).await)
            }
            JobKind::Directory(root) => {
                batch_result(client.send_directory(root, &self.options, cancel).await?)
            }
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn batch_result(report: BatchReport) -> Result<()> {
    match report.failed.first() {
        None => Ok(()),
        Some((path, error)) => Err(TransferError::Batch {
            failed: report.failed.len(),
            total: report.total(),
            first: format!("{}: {}", path.display(), error),
        }),
    }
}

struct QueueInner {
    client: TransferClient,
    events: EventBus,
    backlog: Mutex<VecDeque<QueuedJob>>,
    processing: AtomicBool,
    cancel: Mutex<CancellationToken>,
    persist_path: Option<PathBuf>,
}

impl QueueInner {
    /// Backlog guard. A persisted queue is refreshed from disk, since other
    /// processes may have changed it.
    fn backlog(&self) -> MutexGuard<'_, VecDeque<QueuedJob>> {
        let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(path) = &self.persist_path {
            *backlog = read_backlog(path);
        }
        backlog
    }

    /// Read, modify and write the backlog while holding the queue file lock.
    fn update<T>(&self, f: impl FnOnce(&mut VecDeque<QueuedJob>) -> T) -> T {
        let _lock = self
            .persist_path
            .as_deref()
            .and_then(|path| match lock_backlog(path) {
                Ok(lock) => Some(lock),
                Err(e) => {
                    tracing::warn!("Failed to lock queue file {:?}: {}", path, e);
                    None
                }
            });
        let mut backlog = self.backlog();
        let out = f(&mut backlog);
        self.persist(&backlog);
        out
    }

    fn persist(&self, backlog: &VecDeque<QueuedJob>) {
        let Some(path) = &self.persist_path else {
            return;
        };
        if let Err(e) = write_backlog(path, backlog) {
            tracing::warn!("Failed to save queue to {:?}: {}", path, e);
        }
    }

    /// Pop the head, or mark the loop idle when there is none. Both happen
    /// under the backlog lock, so a job enqueued afterwards always finds
    /// `start` free.
    fn next_job(&self) -> Option<QueuedJob> {
        self.update(|backlog| {
            let job = backlog.pop_front();
            if job.is_none() {
                self.processing.store(false, Ordering::SeqCst);
            }
            job
        })
    }
}

/// Backlog of transfers drained one at a time.
#[derive(Clone)]
pub struct TransferQueue {
    inner: Arc<QueueInner>,
}

impl TransferQueue {
    pub fn new(client: TransferClient) -> Self {
        Self::build(client, None, VecDeque::new())
    }

    /// Queue stored in a JSON file. The file is the source of truth, so
    /// handles in other processes see each other's changes.
    pub fn with_persistence(client: TransferClient, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let backlog = read_backlog(&path);
        if !backlog.is_empty() {
            tracing::info!("Loaded {} queued jobs from {:?}", backlog.len(), path);
        }
        Self::build(client, Some(path), backlog)
    }

    fn build(
        client: TransferClient,
        persist_path: Option<PathBuf>,
        backlog: VecDeque<QueuedJob>,
    ) -> Self {
        let events = client.events().clone();
        Self {
            inner: Arc::new(QueueInner {
                client,
                events,
                backlog: Mutex::new(backlog),
                processing: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                persist_path,
            }),
        }
    }

    /// Append a job. Valid at any time, including while draining.
    pub fn enqueue(&self, job: QueuedJob) -> String {
        let id = job.id.clone();
        let description = job.description.clone();
        self.inner.update(|backlog| backlog.push_back(job));
        tracing::info!("Queued {}", description);
        self.inner.events.emit(AppEvent::TransferQueued {
            id: id.clone(),
            description,
        });
        id
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn list(&self) -> Vec<QueuedJob> {
        self.inner.backlog().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.backlog().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.backlog().is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::SeqCst)
    }

    /// Launch the drain loop. Returns `None` when it is already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.inner.processing.swap(true, Ordering::SeqCst) {
            return None;
        }
        let cancel = CancellationToken::new();
        *self.inner.cancel.lock().unwrap_or_else(PoisonError::into_inner) = cancel.clone();

        self.inner.events.emit(AppEvent::QueueStarted);
        tracing::info!("Queue started ({} jobs)", self.len());
        Some(tokio::spawn(drain(self.inner.clone(), cancel)))
    }

    /// Stop dequeuing. The running job is cancelled only if it tracks
    /// resume state.
    pub fn stop(&self) {
        self.inner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        self.inner.events.emit(AppEvent::QueueStopped);
        tracing::info!("Queue stop requested");
    }

    /// Drop every pending job. A job already running is unaffected.
    pub fn clear(&self) -> usize {
        let removed = self.inner.update(|backlog| {
            let removed = backlog.len();
            backlog.clear();
            removed
        });
        self.inner.events.emit(AppEvent::QueueCleared);
        tracing::info!("Queue cleared ({} jobs removed)", removed);
        removed
    }
}

async fn drain(inner: Arc<QueueInner>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            inner.processing.store(false, Ordering::SeqCst);
            tracing::info!("Queue stopped with {} jobs pending", inner.backlog().len());
            break;
        }
        let Some(job) = inner.next_job() else {
            inner.events.emit(AppEvent::QueueDrained);
            tracing::info!("Queue drained");
            break;
        };

        tracing::info!("Running job {}", job.description);
        let job_cancel = if job.options.resume {
            cancel.clone()
        } else {
            CancellationToken::new()
        };
        let result = job.execute(&inner.client, &job_cancel).await;
        if let Err(e) = &result {
            tracing::warn!("Job {} failed: {}", job.description, e);
        }
        inner.events.emit(AppEvent::QueueJobFinished {
            id: job.id,
            description: job.description,
            success: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        });
    }
}

fn read_backlog(path: &Path) -> VecDeque<QueuedJob> {
    match std::fs::read(path) {
        Ok(content) => serde_json::from_slice(&content).unwrap_or_else(|e| {
            tracing::warn!("Ignoring corrupt queue file {:?}: {}", path, e);
            VecDeque::new()
        }),
        Err(_) => VecDeque::new(),
    }
}

/// Exclusive lock shared with every process using the same queue file.
/// Released when the returned handle is dropped.
fn lock_backlog(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path.with_extension("json.lock"))?;
    file.lock()?;
    Ok(file)
}

fn write_backlog(path: &Path, backlog: &VecDeque<QueuedJob>) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(backlog).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(&json)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)
}

/// File that asks a running queue in another process to stop.
#[derive(Debug, Clone)]
pub struct StopMarker {
    path: PathBuf,
}

impl StopMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn request(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, now_millis().to_string())
    }

    /// Consume a pending request
    pub fn take(&self) -> bool {
        std::fs::remove_file(&self.path).is_ok()
    }
}
