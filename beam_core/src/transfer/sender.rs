use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::constants::{
    BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_IDLE_TIMEOUT_SECS, PROGRESS_INTERVAL,
    TRANSFER_PORT,
};
use super::hash::{ContentHash, compute_file_hash};
use super::pipeline::{Compression, Pipeline};
use super::protocol::{
    TransferHeader, TransferMode, TransferMsg, frame_payload, recv_msg, write_header,
};
use super::utils::{format_transfer_speed, relative_dir_for};
use crate::error::{Result, TransferError};
use crate::events::{AppEvent, EventBus, TransferUpdate};
use crate::resume::{ResumeRecord, ResumeStore};

/// Per-send settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Track progress in the resume store
    #[serde(default)]
    pub resume: bool,
    /// KB/s
    #[serde(default)]
    pub speed_limit_kbs: Option<u64>,
}

impl SendOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            compression: Compression::None,
            password: None,
            resume: false,
            speed_limit_kbs: None,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_speed_limit(mut self, kbs: u64) -> Self {
        self.speed_limit_kbs = Some(kbs);
        self
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.compression,
            self.password.as_deref(),
            self.speed_limit_kbs,
        )
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(TransferError::InvalidOptions("target host is empty".into()));
        }
        if self.port == 0 {
            return Err(TransferError::InvalidOptions("target port is 0".into()));
        }
        Ok(())
    }
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::new("127.0.0.1", TRANSFER_PORT)
    }
}

/// Result of one verified file transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub file_name: String,
    pub original_size: u64,
    /// Payload bytes put on the wire, header excluded
    pub wire_bytes: u64,
    pub resumed_from: u64,
    pub content_hash: ContentHash,
}

/// Outcome of a batch or directory send
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<SendOutcome>,
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Where a file sits in the transfer it belongs to
#[derive(Debug, Clone)]
struct FileEntry {
    path: PathBuf,
    mode: TransferMode,
    relative_path: String,
    directory_name: Option<String>,
}

impl FileEntry {
    fn single(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            mode: TransferMode::Single,
            relative_path: String::new(),
            directory_name: None,
        }
    }

    fn batch(path: &Path) -> Self {
        Self {
            mode: TransferMode::Batch,
            ..Self::single(path)
        }
    }

    fn in_directory(root: &Path, path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            mode: TransferMode::Directory,
            relative_path: relative_dir_for(root, path),
            directory_name: root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
        }
    }

    fn from_record(record: &ResumeRecord) -> Self {
        let mode = if record.directory_name.is_some() {
            TransferMode::Directory
        } else if record.is_multi_file {
            TransferMode::Batch
        } else {
            TransferMode::Single
        };
        Self {
            path: record.source_path.clone(),
            mode,
            relative_path: record.relative_path.clone(),
            directory_name: record.directory_name.clone(),
        }
    }
}

enum Attempt {
    Done(SendOutcome),
    /// Receiver holds fewer bytes than requested; retry from here
    RetryFrom(u64),
}

/// Throttled progress publisher for one transfer
struct Progress<'a> {
    events: &'a EventBus,
    update: TransferUpdate,
    last_emit: Instant,
    started: Instant,
}

impl<'a> Progress<'a> {
    fn new(events: &'a EventBus, update: TransferUpdate) -> Self {
        let now = Instant::now();
        Self {
            events,
            update,
            last_emit: now,
            started: now,
        }
    }

    /// Returns true when an event went out
    fn report(&mut self, bytes_transferred: u64, force: bool) -> bool {
        self.update.bytes_transferred = bytes_transferred;
        if !force && self.last_emit.elapsed() < PROGRESS_INTERVAL {
            return false;
        }
        self.last_emit = Instant::now();
        self.events
            .emit(AppEvent::TransferProgress(self.update.clone()));
        true
    }
}

/// Sends files to a receiver over TCP, one connection per file.
#[derive(Debug, Clone)]
pub struct TransferClient {
    events: EventBus,
    store: Option<ResumeStore>,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl TransferClient {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            store: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    pub fn with_resume_store(mut self, store: ResumeStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, idle: Duration) -> Self {
        self.connect_timeout = connect;
        self.idle_timeout = idle;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn resume_store(&self) -> Option<&ResumeStore> {
        self.store.as_ref()
    }

    pub async fn send_file(
        &self,
        path: &Path,
        options: &SendOptions,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome> {
        self.send_entry(FileEntry::single(path), options, None, cancel)
            .await
    }

    /// Send each file on its own connection, in order. A failed file does
    /// not stop the rest.
    pub async fn send_multiple_files(
        &self,
        paths: &[PathBuf],
        options: &SendOptions,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for (idx, path) in paths.iter().enumerate() {
            if cancel.is_cancelled() {
                report
                    .failed
                    .push((path.clone(), TransferError::Cancelled.to_string()));
                continue;
            }
            tracing::info!("Sending file {}/{}: {}", idx + 1, paths.len(), path.display());
            match self
                .send_entry(FileEntry::batch(path), options, None, cancel)
                .await
            {
                Ok(outcome) => report.succeeded.push(outcome),
                Err(e) => report.failed.push((path.clone(), e.to_string())),
            }
        }
        report
    }

    /// Send every regular file under `root`, preserving the tree below the
    /// root's own name on the receiver.
    pub async fn send_directory(
        &self,
        root: &Path,
        options: &SendOptions,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        if root.as_os_str().is_empty() {
            return Err(TransferError::EmptyPath);
        }
        match fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(TransferError::MissingSource(root.to_path_buf())),
        }
        options.validate()?;

        let files = collect_files(root).await?;
        tracing::info!(
            "Sending directory {} ({} files) to {}",
            root.display(),
            files.len(),
            options.target()
        );

        let mut report = BatchReport::default();
        for path in files {
            if cancel.is_cancelled() {
                report
                    .failed
                    .push((path, TransferError::Cancelled.to_string()));
                continue;
            }
            match self
                .send_entry(FileEntry::in_directory(root, &path), options, None, cancel)
                .await
            {
                Ok(outcome) => report.succeeded.push(outcome),
                Err(e) => report.failed.push((path, e.to_string())),
            }
        }
        Ok(report)
    }

    /// Continue sending `path` from `start_offset`.
    ///
    /// Compressed or encrypted sends cannot continue mid-stream and restart
    /// from zero instead.
    pub async fn resume(
        &self,
        path: &Path,
        start_offset: u64,
        options: &SendOptions,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome> {
        let entry = match &self.store {
            Some(store) => store
                .load(path)
                .await
                .map(|record| FileEntry::from_record(&record))
                .unwrap_or_else(|| FileEntry::single(path)),
            None => FileEntry::single(path),
        };
        self.send_entry(entry, options, Some(start_offset), cancel)
            .await
    }

    /// Resume a stored transfer with the settings it was started with.
    pub async fn resume_from_record(
        &self,
        record: &ResumeRecord,
        password: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome> {
        let password = password.filter(|p| !p.is_empty());
        if record.encrypted && password.is_none() {
            return Err(TransferError::InvalidOptions(format!(
                "{} was sent encrypted; a password is required to resume it",
                record.file_name
            )));
        }

        let options = SendOptions {
            host: record.host.clone(),
            port: record.port,
            compression: record.compression,
            password: password.map(str::to_string),
            resume: true,
            speed_limit_kbs: record.speed_limit_kbs,
        };
        self.send_entry(
            FileEntry::from_record(record),
            &options,
            Some(record.bytes_transferred),
            cancel,
        )
        .await
    }

    async fn send_entry(
        &self,
        entry: FileEntry,
        options: &SendOptions,
        start_offset: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome> {
        // Preconditions, before any network I/O
        if entry.path.as_os_str().is_empty() {
            return Err(TransferError::EmptyPath);
        }
        let metadata = match fs::metadata(&entry.path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return Err(TransferError::MissingSource(entry.path.clone())),
        };
        options.validate()?;

        let total_size = metadata.len();
        let file_name = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::MissingSource(entry.path.clone()))?;
        let pipeline = options.pipeline();

        let stored = match (&self.store, options.resume || start_offset.is_some()) {
            (Some(store), true) => store.load(&entry.path).await,
            _ => None,
        };

        let mut offset = start_offset.unwrap_or(0);
        if offset > 0 && !pipeline.is_identity() {
            tracing::warn!(
                "{} is compressed or encrypted; restarting from the beginning",
                file_name
            );
            offset = 0;
        }
        if offset > total_size {
            tracing::warn!(
                "Resume offset {} is past the end of {} ({} bytes); restarting",
                offset,
                file_name,
                total_size
            );
            offset = 0;
        }

        let content_hash = match &stored {
            Some(record) if record.total_size == total_size && start_offset.is_some() => {
                record.content_hash
            }
            Some(_) if offset > 0 => {
                tracing::warn!("{} changed since it was recorded; restarting", file_name);
                offset = 0;
                compute_file_hash(&entry.path).await?
            }
            _ => compute_file_hash(&entry.path).await?,
        };
        tracing::debug!("Hash for {}: {}", file_name, content_hash.short());

        let mut record = if options.resume && self.store.is_some() {
            Some(ResumeRecord {
                source_path: entry.path.clone(),
                file_name: file_name.clone(),
                total_size,
                bytes_transferred: offset,
                content_hash,
                compression: options.compression,
                encrypted: pipeline.encrypted(),
                host: options.host.clone(),
                port: options.port,
                relative_path: entry.relative_path.clone(),
                directory_name: entry.directory_name.clone(),
                is_multi_file: entry.mode == TransferMode::Batch,
                speed_limit_kbs: pipeline.speed_limit_kbs(),
                timestamp: 0,
            })
        } else {
            None
        };
        self.save_record(record.as_mut()).await;

        let update = TransferUpdate {
            id: uuid::Uuid::new_v4().to_string(),
            file_name: file_name.clone(),
            target_host: options.host.clone(),
            bytes_transferred: offset,
            total_bytes: total_size,
            speed_limit: pipeline.speed_limit_kbs(),
            error: None,
        };
        self.events.emit(AppEvent::TransferStarted(update.clone()));
        tracing::info!(
            "Sending {} ({} bytes) to {} [compression: {}, encrypted: {}, offset: {}]",
            file_name,
            total_size,
            options.target(),
            pipeline.compression(),
            pipeline.encrypted(),
            offset
        );

        let header = TransferHeader {
            mode: entry.mode,
            relative_path: entry.relative_path.clone(),
            file_name: file_name.clone(),
            original_size: total_size,
            transformed_size: 0,
            content_hash,
            compression: pipeline.compression(),
            encrypted: pipeline.encrypted(),
            resume_offset: 0,
        };

        let mut progress = Progress::new(&self.events, update.clone());
        let mut retried = false;
        let result = loop {
            let attempt = self
                .transmit(
                    &entry.path,
                    &header,
                    &pipeline,
                    offset,
                    options,
                    &mut progress,
                    &mut record,
                    cancel,
                )
                .await;
            match attempt {
                Ok(Attempt::RetryFrom(available)) if !retried => {
                    tracing::info!(
                        "Receiver holds {} of {} bytes for {}; retrying from there",
                        available,
                        offset,
                        file_name
                    );
                    retried = true;
                    offset = available;
                    if let Some(rec) = record.as_mut() {
                        rec.bytes_transferred = available;
                    }
                    self.save_record(record.as_mut()).await;
                }
                Ok(Attempt::RetryFrom(_)) => {
                    break Err(TransferError::Rejected(
                        "receiver refused the resume offset twice".into(),
                    ));
                }
                Ok(Attempt::Done(outcome)) => break Ok(outcome),
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(outcome) => {
                if record.is_some() {
                    if let Some(store) = &self.store {
                        if let Err(e) = store.delete(&entry.path).await {
                            tracing::warn!("Failed to delete resume record: {}", e);
                        }
                    }
                }
                let mut done = progress.update.clone();
                done.bytes_transferred = total_size;
                self.events.emit(AppEvent::TransferCompleted(done));
                tracing::info!(
                    "Sent {} ({}) in {:.1}s",
                    file_name,
                    format_transfer_speed(
                        outcome.wire_bytes,
                        progress.started.elapsed().as_secs_f64()
                    ),
                    progress.started.elapsed().as_secs_f64()
                );
                Ok(outcome)
            }
            Err(e) => {
                if let (TransferError::IntegrityMismatch { .. }, Some(rec)) =
                    (&e, record.as_mut())
                {
                    // The destination prefix cannot be trusted; start over next time
                    rec.bytes_transferred = 0;
                }
                self.save_record(record.as_mut()).await;
                let mut failed = progress.update.clone();
                failed.error = Some(e.to_string());
                self.events.emit(AppEvent::TransferFailed(failed));
                tracing::error!("Failed to send {}: {}", file_name, e);
                Err(e)
            }
        }
    }

    async fn save_record(&self, record: Option<&mut ResumeRecord>) {
        if let (Some(store), Some(record)) = (&self.store, record) {
            if let Err(e) = store.create_or_update(record).await {
                tracing::warn!("{}", e);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn transmit(
        &self,
        path: &Path,
        header: &TransferHeader,
        pipeline: &Pipeline,
        offset: u64,
        options: &SendOptions,
        progress: &mut Progress<'_>,
        record: &mut Option<ResumeRecord>,
        cancel: &CancellationToken,
    ) -> Result<Attempt> {
        let total_size = header.original_size;

        // Transformed payloads are spooled so the header can carry their size
        let (mut payload, transformed_size, _spool) = if pipeline.is_identity() {
            let mut file = File::open(path).await?;
            if offset > 0 {
                file.seek(SeekFrom::Start(offset)).await?;
            }
            (file, total_size - offset, None)
        } else {
            let source = path.to_path_buf();
            let encoder = pipeline.clone();
            let (spool, size) =
                tokio::task::spawn_blocking(move || encoder.encode_to_spool(&source)).await??;
            tracing::debug!(
                "Encoded {} bytes into {} wire bytes",
                total_size,
                size
            );
            let file = File::from_std(spool.reopen()?);
            (file, size, Some(spool))
        };

        let header = TransferHeader {
            transformed_size,
            resume_offset: offset,
            ..header.clone()
        };

        let mut stream = self.connect(options, cancel).await?;
        let (mut reader, mut writer) = stream.split();

        self.with_idle(cancel, "sending header", write_header(&mut writer, &header))
            .await?;

        match self
            .with_idle(cancel, "waiting for receiver", recv_msg(&mut reader))
            .await?
        {
            TransferMsg::Ready { offset: accepted } if accepted == offset => {}
            TransferMsg::Ready { offset: accepted } => {
                return Err(TransferError::Protocol(format!(
                    "receiver accepted offset {} instead of {}",
                    accepted, offset
                )));
            }
            TransferMsg::Rejected {
                available: Some(available),
                ..
            } if available < offset => return Ok(Attempt::RetryFrom(available)),
            TransferMsg::Rejected { reason, .. } => return Err(TransferError::Rejected(reason)),
            other => {
                return Err(TransferError::Protocol(format!(
                    "expected Ready, got {:?}",
                    other
                )));
            }
        }

        let mut throttle = pipeline.throttle();
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut sent: u64 = 0;
        let remaining = total_size - offset;
        let mut bounded = frame_payload(&header, &mut payload);

        loop {
            let n = bounded.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            self.write_chunk(&mut writer, &buffer[..n], cancel).await?;
            if let Some(throttle) = throttle.as_mut() {
                throttle.consume(n, cancel).await?;
            }
            sent += n as u64;

            // Original-byte progress; transformed payloads are scaled
            let done = if pipeline.is_identity() {
                offset + sent
            } else {
                offset + scale(sent, transformed_size, remaining)
            };
            if progress.report(done, false) && pipeline.is_identity() {
                if let Some(rec) = record.as_mut() {
                    rec.bytes_transferred = done;
                }
                self.save_record(record.as_mut()).await;
            }
        }

        if sent != transformed_size {
            return Err(TransferError::Protocol(format!(
                "{} shrank while sending ({} of {} bytes)",
                header.file_name, sent, transformed_size
            )));
        }
        self.with_idle(cancel, "flushing payload", async {
            writer.flush().await?;
            Ok(())
        })
        .await?;
        let _ = writer.shutdown().await;
        progress.report(total_size, true);

        match self
            .with_idle(cancel, "waiting for verification", recv_msg(&mut reader))
            .await?
        {
            TransferMsg::Completed { verified: true, .. } => Ok(Attempt::Done(SendOutcome {
                file_name: header.file_name.clone(),
                original_size: total_size,
                wire_bytes: sent,
                resumed_from: offset,
                content_hash: header.content_hash,
            })),
            TransferMsg::Completed {
                actual_hash: Some(actual),
                ..
            } => Err(TransferError::IntegrityMismatch {
                file_name: header.file_name.clone(),
                expected: header.content_hash.to_hex(),
                actual: actual.to_hex(),
            }),
            TransferMsg::Completed { message, .. } => Err(TransferError::Rejected(
                message.unwrap_or_else(|| "receiver could not verify the file".into()),
            )),
            TransferMsg::Rejected { reason, .. } => Err(TransferError::Rejected(reason)),
            other => Err(TransferError::Protocol(format!(
                "expected Completed, got {:?}",
                other
            ))),
        }
    }

    async fn connect(&self, options: &SendOptions, cancel: &CancellationToken) -> Result<TcpStream> {
        let addr = options.target();
        let connect = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((options.host.as_str(), options.port)),
        );
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            res = connect => match res {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => return Err(TransferError::Connect { addr, source }),
                Err(_) => return Err(TransferError::Timeout(format!("connecting to {}", addr))),
            },
        };
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    async fn write_chunk<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        chunk: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.with_idle(cancel, "sending payload", async {
            writer.write_all(chunk).await?;
            Ok(())
        })
        .await
    }

    /// Bound `fut` by the idle timeout and the cancellation token
    async fn with_idle<T, F>(&self, cancel: &CancellationToken, what: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            res = tokio::time::timeout(self.idle_timeout, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(TransferError::Timeout(what.to_string())),
            },
        }
    }
}

/// Map `part` of `whole` onto `target` without overflowing
fn scale(part: u64, whole: u64, target: u64) -> u64 {
    if whole == 0 {
        return target;
    }
    ((part as u128 * target as u128) / whole as u128) as u64
}

/// Regular files under `root`, sorted. Symlinks are skipped.
async fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_source_fails_before_connecting() {
        let client = TransferClient::new(EventBus::new());
        let mut rx = client.events().subscribe();
        // Port 1 on localhost would refuse; a missing file must win first
        let options = SendOptions::new("127.0.0.1", 1);
        let err = client
            .send_file(
                Path::new("/definitely/not/here.bin"),
                &options,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::MissingSource(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_path_rejected() {
        let client = TransferClient::new(EventBus::new());
        let err = client
            .send_file(Path::new(""), &SendOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::EmptyPath));
    }

    #[tokio::test]
    async fn test_invalid_host_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"a").unwrap();

        let client = TransferClient::new(EventBus::new());
        let err = client
            .send_file(&path, &SendOptions::new(" ", 9000), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidOptions(_)));
    }

    #[tokio::test]
    async fn test_collect_files_recurses_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("album");
        std::fs::create_dir_all(root.join("2024/july")).unwrap();
        std::fs::write(root.join("b.jpg"), b"b").unwrap();
        std::fs::write(root.join("a.jpg"), b"a").unwrap();
        std::fs::write(root.join("2024/july/c.jpg"), b"c").unwrap();

        let files = collect_files(&root).await.unwrap();
        assert_eq!(files.len(), 3);
        let mut sorted = files.clone();
        sorted.sort();
        assert_eq!(files, sorted);
    }

    #[test]
    fn test_scale() {
        assert_eq!(scale(50, 100, 1000), 500);
        assert_eq!(scale(0, 0, 7), 7);
        assert_eq!(scale(u64::MAX, u64::MAX, u64::MAX), u64::MAX);
    }

    #[test]
    fn test_options_serde_skips_missing_password() {
        let options = SendOptions::new("10.0.0.2", 9000).with_compression(Compression::Gzip);
        let json = serde_json::to_value(&options).unwrap();
        assert!(json.get("password").is_none());
        let back: SendOptions = serde_json::from_value(json).unwrap();
        assert_eq!(back, options);
    }

    #[test]
    fn test_entry_from_record_mode() {
        let mut record = ResumeRecord {
            source_path: PathBuf::from("/a/b.bin"),
            file_name: "b.bin".into(),
            total_size: 1,
            bytes_transferred: 0,
            content_hash: crate::transfer::hash::hash_bytes(b"b"),
            compression: Compression::None,
            encrypted: false,
            host: "h".into(),
            port: 1,
            relative_path: "a".into(),
            directory_name: Some("a".into()),
            is_multi_file: false,
            speed_limit_kbs: None,
            timestamp: 0,
        };
        assert_eq!(FileEntry::from_record(&record).mode, TransferMode::Directory);
        record.directory_name = None;
        record.is_multi_file = true;
        assert_eq!(FileEntry::from_record(&record).mode, TransferMode::Batch);
    }
}
