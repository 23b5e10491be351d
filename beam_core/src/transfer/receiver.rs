use bytes::BytesMut;
use std::collections::HashMap;
use std::io::{self, BufWriter, Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio_util::sync::CancellationToken;

use super::constants::{BUFFER_SIZE, DECODE_CHANNEL_DEPTH, DEFAULT_IDLE_TIMEOUT_SECS};
use super::hash::{ContentHash, HashingWriter};
use super::pipeline::{ChannelReader, Pipeline};
use super::protocol::{TransferHeader, TransferMode, TransferMsg, decode, send_msg};
use super::utils::{
    open_destination, sanitize_file_name, sanitize_relative_path, validate_transfer_info,
};
use crate::error::{Result, TransferError};
use crate::events::{AppEvent, EventBus};
use crate::resume::now_millis;

/// Receiver-side settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub download_dir: PathBuf,
    /// Needed to accept encrypted transfers
    pub password: Option<String>,
    pub idle_timeout: Duration,
}

impl ServerConfig {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            password: None,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

/// One async lock per destination path, so two senders never write the
/// same file at once.
#[derive(Debug, Clone, Default)]
pub struct PathLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl PathLocks {
    pub async fn acquire(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            // Only the map holds idle entries
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(path.to_path_buf()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// State shared by every connection of one server
#[derive(Debug, Clone)]
pub struct ReceiveContext {
    pub config: ServerConfig,
    pub events: EventBus,
    pub locks: PathLocks,
}

impl ReceiveContext {
    pub fn new(config: ServerConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            locks: PathLocks::default(),
        }
    }
}

/// A file written and verified by the receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub id: String,
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
    pub resumed_from: u64,
}

struct Decoded {
    hash: ContentHash,
    total: u64,
    leftover: u64,
}

/// Serve one connection: read the frame, write the file, verify, reply.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: &ReceiveContext,
    cancel: &CancellationToken,
) -> Result<ReceivedFile> {
    let idle = ctx.config.idle_timeout;
    let sender = peer.ip().to_string();
    let (mut reader, mut writer) = stream.split();

    let (header, mut payload) = match tokio::time::timeout(idle, decode(&mut reader)).await {
        Ok(frame) => frame?,
        Err(_) => return Err(TransferError::Timeout("waiting for header".into())),
    };
    tracing::info!(
        "Incoming {} from {} ({} bytes, {} on wire, compression: {}, encrypted: {}, offset: {})",
        header.file_name,
        peer,
        header.original_size,
        header.transformed_size,
        header.compression,
        header.encrypted,
        header.resume_offset
    );

    let (directory, file_name) = match check_header(&header, &ctx.config) {
        Ok(target) => target,
        Err(reason) => {
            tracing::warn!("Rejected {} from {}: {}", header.file_name, peer, reason);
            reply(&mut writer, idle, TransferMsg::Rejected {
                reason: reason.clone(),
                available: None,
            })
            .await?;
            return Err(TransferError::Rejected(reason));
        }
    };

    tokio::fs::create_dir_all(&directory).await?;
    let dest = directory.join(&file_name);
    let _guard = ctx.locks.acquire(&dest).await;

    let offset = header.resume_offset;
    if offset > 0 {
        let existing = tokio::fs::metadata(&dest).await.map(|m| m.len()).unwrap_or(0);
        if existing < offset {
            let reason = format!(
                "only {} of the requested {} bytes of {} are present",
                existing, offset, file_name
            );
            tracing::info!("{}", reason);
            reply(&mut writer, idle, TransferMsg::Rejected {
                reason: reason.clone(),
                available: Some(existing),
            })
            .await?;
            return Err(TransferError::Rejected(reason));
        }
    }

    let file = {
        let dest = dest.clone();
        tokio::task::spawn_blocking(move || open_destination(&dest, offset)).await??
    };
    reply(&mut writer, idle, TransferMsg::Ready { offset }).await?;

    let pipeline = Pipeline::new(
        header.compression,
        header
            .encrypted
            .then_some(ctx.config.password.as_deref())
            .flatten(),
        None,
    );

    let (tx, rx) = mpsc::channel::<bytes::Bytes>(DECODE_CHANNEL_DEPTH);
    let worker = {
        let dest = dest.clone();
        tokio::task::spawn_blocking(move || decode_into(file, &dest, offset, &pipeline, rx))
    };

    // Payload reader stops at the declared size
    let streamed: Result<u64> = async {
        let mut received = 0u64;
        loop {
            let mut chunk = BytesMut::with_capacity(BUFFER_SIZE);
            let n = tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                res = tokio::time::timeout(idle, payload.read_buf(&mut chunk)) => match res {
                    Ok(n) => n?,
                    Err(_) => return Err(TransferError::Timeout("receiving payload".into())),
                },
            };
            if n == 0 {
                break;
            }
            received += n as u64;
            if tx.send(chunk.freeze()).await.is_err() {
                break;
            }
        }
        if received != header.transformed_size {
            return Err(TransferError::Protocol(format!(
                "connection closed after {} of {} payload bytes",
                received, header.transformed_size
            )));
        }
        Ok(received)
    }
    .await;
    drop(tx);

    let decoded = worker.await?;
    let path_display = dest.clone();

    if let Err(e) = streamed {
        tracing::warn!("Transfer of {} from {} aborted: {}", file_name, peer, e);
        return Err(e);
    }

    let decoded = match decoded {
        Ok(decoded) => decoded,
        Err(e) => {
            let err = TransferError::from(e);
            tracing::warn!("Could not decode {} from {}: {}", file_name, peer, err);
            ctx.events.emit(AppEvent::VerificationFailed {
                file_name: file_name.clone(),
                path: path_display,
                sender,
                reason: err.to_string(),
            });
            reply(&mut writer, idle, TransferMsg::Completed {
                verified: false,
                bytes_written: 0,
                actual_hash: None,
                message: Some(err.to_string()),
            })
            .await
            .ok();
            return Err(err);
        }
    };

    if decoded.leftover > 0 {
        tracing::warn!(
            "{} trailing payload bytes after the end of {}",
            decoded.leftover,
            file_name
        );
    }

    let verified = decoded.hash == header.content_hash && decoded.total == header.original_size;
    if !verified {
        tracing::error!(
            "Hash verification FAILED for {}! Expected: {}..., Got: {}...",
            file_name,
            header.content_hash.short(),
            decoded.hash.short()
        );
        ctx.events.emit(AppEvent::VerificationFailed {
            file_name: file_name.clone(),
            path: path_display,
            sender,
            reason: format!(
                "expected {} ({} bytes), got {} ({} bytes)",
                header.content_hash.short(),
                header.original_size,
                decoded.hash.short(),
                decoded.total
            ),
        });
        reply(&mut writer, idle, TransferMsg::Completed {
            verified: false,
            bytes_written: decoded.total,
            actual_hash: Some(decoded.hash),
            message: Some("content hash mismatch".into()),
        })
        .await
        .ok();
        return Err(TransferError::IntegrityMismatch {
            file_name,
            expected: header.content_hash.to_hex(),
            actual: decoded.hash.to_hex(),
        });
    }

    let received = ReceivedFile {
        id: uuid::Uuid::new_v4().to_string(),
        file_name: file_name.clone(),
        path: dest.clone(),
        size: decoded.total,
        resumed_from: offset,
    };
    ctx.events.emit(AppEvent::FileReceived {
        id: received.id.clone(),
        file_name,
        path: dest,
        directory,
        size: decoded.total,
        received_at: now_millis(),
        sender,
    });
    reply(&mut writer, idle, TransferMsg::Completed {
        verified: true,
        bytes_written: decoded.total,
        actual_hash: Some(decoded.hash),
        message: None,
    })
    .await?;

    tracing::info!(
        "Received {} ({} bytes, hash {})",
        received.file_name,
        received.size,
        decoded.hash.short()
    );
    Ok(received)
}

/// Validate a header and resolve where its file goes. Errors are reasons
/// sent back to the sender.
fn check_header(
    header: &TransferHeader,
    config: &ServerConfig,
) -> std::result::Result<(PathBuf, String), String> {
    validate_transfer_info(&header.file_name, header.original_size).map_err(|e| e.to_string())?;

    if header.encrypted && config.password.is_none() {
        return Err("receiver has no password for encrypted transfers".into());
    }
    if header.is_resume() && header.is_transformed() {
        return Err("resume is only supported for uncompressed, unencrypted transfers".into());
    }
    if header.resume_offset > header.original_size {
        return Err(format!(
            "resume offset {} is past the end of the file ({} bytes)",
            header.resume_offset, header.original_size
        ));
    }
    if !header.is_transformed() && header.transformed_size != header.original_size - header.resume_offset {
        return Err(format!(
            "payload size {} does not match the file size {} from offset {}",
            header.transformed_size, header.original_size, header.resume_offset
        ));
    }

    let relative = if header.mode == TransferMode::Directory {
        sanitize_relative_path(&header.relative_path)
            .ok_or_else(|| format!("relative path {:?} escapes the downloads root", header.relative_path))?
    } else {
        PathBuf::new()
    };

    Ok((
        config.download_dir.join(relative),
        sanitize_file_name(&header.file_name),
    ))
}

/// Blocking half: decode channel bytes into the destination while hashing.
fn decode_into(
    file: std::fs::File,
    dest: &Path,
    offset: u64,
    pipeline: &Pipeline,
    rx: mpsc::Receiver<bytes::Bytes>,
) -> io::Result<Decoded> {
    let mut channel = ChannelReader::new(rx);
    let mut writer = HashingWriter::new(BufWriter::with_capacity(BUFFER_SIZE, file));

    let copied = (|| {
        if offset > 0 {
            let existing = std::fs::File::open(dest)?;
            writer.absorb_existing(existing.take(offset))?;
        }
        let mut decoder = pipeline.decoder(&mut channel);
        io::copy(&mut decoder, &mut writer)
    })();
    // Keep the socket side moving even when decoding failed
    let leftover = channel.drain();
    copied?;

    let (buffered, hash, total) = writer.finish()?;
    let mut file = buffered.into_inner().map_err(|e| e.into_error())?;
    file.flush()?;
    file.sync_all()?;

    Ok(Decoded {
        hash,
        total,
        leftover,
    })
}

async fn reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    idle: Duration,
    msg: TransferMsg,
) -> Result<()> {
    match tokio::time::timeout(idle, send_msg(writer, &msg)).await {
        Ok(res) => res,
        Err(_) => Err(TransferError::Timeout("sending reply".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::hash::hash_bytes;
    use crate::transfer::pipeline::Compression;

    fn header() -> TransferHeader {
        TransferHeader {
            mode: TransferMode::Single,
            relative_path: String::new(),
            file_name: "report.pdf".into(),
            original_size: 10,
            transformed_size: 10,
            content_hash: hash_bytes(b"0123456789"),
            compression: Compression::None,
            encrypted: false,
            resume_offset: 0,
        }
    }

    #[test]
    fn test_check_header_resolves_destination() {
        let config = ServerConfig::new("/downloads");
        let (dir, name) = check_header(&header(), &config).unwrap();
        assert_eq!(dir, PathBuf::from("/downloads"));
        assert_eq!(name, "report.pdf");

        let mut h = header();
        h.mode = TransferMode::Directory;
        h.relative_path = "album/2024".into();
        h.file_name = "../../evil.jpg".into();
        let (dir, name) = check_header(&h, &config).unwrap();
        assert_eq!(dir, PathBuf::from("/downloads").join("album").join("2024"));
        assert_eq!(name, "evil.jpg");
    }

    #[test]
    fn test_check_header_rejections() {
        let config = ServerConfig::new("/downloads");

        let mut h = header();
        h.mode = TransferMode::Directory;
        h.relative_path = "../outside".into();
        assert!(check_header(&h, &config).is_err());

        let mut h = header();
        h.encrypted = true;
        assert!(check_header(&h, &config).is_err());
        let with_pw = ServerConfig::new("/downloads").with_password(Some("pw".into()));
        assert!(check_header(&h, &with_pw).is_ok());

        let mut h = header();
        h.compression = Compression::Gzip;
        h.resume_offset = 4;
        assert!(check_header(&h, &config).is_err());

        let mut h = header();
        h.transformed_size = 3;
        assert!(check_header(&h, &config).is_err());
    }

    #[tokio::test]
    async fn test_path_locks_serialize_same_path() {
        let locks = PathLocks::default();
        let path = Path::new("/downloads/a.bin");

        let guard = locks.acquire(path).await;
        let second = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(Path::new("/downloads/a.bin")).await; })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        // A different path is independent
        let _other = locks.acquire(Path::new("/downloads/b.bin")).await;

        drop(guard);
        second.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_decode_into_resumes_hash() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        std::fs::write(&dest, b"hello XXXX").unwrap();

        let file = open_destination(&dest, 6).unwrap();
        let (tx, rx) = mpsc::channel(4);
        let worker = {
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || {
                decode_into(file, &dest, 6, &Pipeline::default(), rx)
            })
        };
        tx.send(bytes::Bytes::from_static(b"world")).await.unwrap();
        drop(tx);

        let decoded = worker.await.unwrap().unwrap();
        assert_eq!(decoded.total, 11);
        assert_eq!(decoded.hash, hash_bytes(b"hello world"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
    }
}
