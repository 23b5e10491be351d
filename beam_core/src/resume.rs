//! Durable per-file transfer progress.
//!
//! One pretty-printed JSON file per tracked source file, named by the BLAKE3
//! hex of its absolute path. Unreadable records are treated as missing so a
//! damaged store degrades to a fresh transfer instead of an error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;

use crate::error::{Result, TransferError};
use crate::transfer::hash::ContentHash;
use crate::transfer::pipeline::Compression;

/// Subdirectory of the data directory holding the records
pub const RESUME_DIR: &str = "resume";
const RECORD_EXT: &str = "json";

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub source_path: PathBuf,
    pub file_name: String,
    pub total_size: u64,
    pub bytes_transferred: u64,
    pub content_hash: ContentHash,
    pub compression: Compression,
    pub encrypted: bool,
    pub host: String,
    pub port: u16,
    /// Directory of the file relative to the receiver's root (directory mode)
    #[serde(default)]
    pub relative_path: String,
    /// Root directory name when the file belongs to a directory transfer
    #[serde(default)]
    pub directory_name: Option<String>,
    #[serde(default)]
    pub is_multi_file: bool,
    #[serde(default)]
    pub speed_limit_kbs: Option<u64>,
    /// Unix timestamp in milliseconds of the last write
    #[serde(default)]
    pub timestamp: u64,
}

impl ResumeRecord {
    pub fn remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.bytes_transferred)
    }

    pub fn progress_percent(&self) -> f32 {
        if self.total_size == 0 {
            return 100.0;
        }
        (self.bytes_transferred as f32 / self.total_size as f32) * 100.0
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Stable record key for a source path
pub fn record_key(source: &Path) -> String {
    let absolute = absolute(source);
    blake3::hash(absolute.to_string_lossy().as_bytes())
        .to_hex()
        .to_string()
}

#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, source: &Path) -> PathBuf {
        self.dir
            .join(format!("{}.{}", record_key(source), RECORD_EXT))
    }

    /// Write `record`, replacing any previous one for the same source.
    /// The timestamp is always refreshed.
    pub async fn create_or_update(&self, record: &mut ResumeRecord) -> Result<()> {
        record.source_path = absolute(&record.source_path);
        record.timestamp = now_millis();

        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| TransferError::ResumeState(e.to_string()))?;
        let target = self.record_path(&record.source_path);
        let tmp = target.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));

        let write = async {
            fs::create_dir_all(&self.dir).await?;
            fs::write(&tmp, &json).await?;
            fs::rename(&tmp, &target).await
        };
        if let Err(e) = write.await {
            let _ = fs::remove_file(&tmp).await;
            return Err(TransferError::ResumeState(format!(
                "cannot write {:?}: {}",
                target, e
            )));
        }

        tracing::debug!(
            "Resume record saved for {:?} ({}/{} bytes)",
            record.source_path,
            record.bytes_transferred,
            record.total_size
        );
        Ok(())
    }

    pub async fn load(&self, source: &Path) -> Option<ResumeRecord> {
        let path = self.record_path(source);
        let content = fs::read(&path).await.ok()?;
        match serde_json::from_slice(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Ignoring corrupt resume record {:?}: {}", path, e);
                None
            }
        }
    }

    /// Every readable record, newest first
    pub async fn list_all(&self) -> Vec<ResumeRecord> {
        let mut records = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return records,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Ok(content) = fs::read(&path).await else {
                continue;
            };
            match serde_json::from_slice::<ResumeRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping corrupt resume record {:?}: {}", path, e),
            }
        }

        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records
    }

    /// Remove the record for `source`. Returns whether one existed.
    pub async fn delete(&self, source: &Path) -> Result<bool> {
        match fs::remove_file(self.record_path(source)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TransferError::ResumeState(e.to_string())),
        }
    }
}
