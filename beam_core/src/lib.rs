//! Point-to-point file transfer over TCP with optional compression,
//! encryption, throttling, resumable sends and a sequential queue.

use anyhow::Context;
use std::path::PathBuf;

pub mod config;
pub mod error;
pub mod events;
pub mod queue;
pub mod resume;
pub mod transfer;

pub use config::AppConfig;
pub use error::{Result, TransferError};
pub use events::{AppEvent, EventBus, TransferUpdate};
pub use queue::{JobKind, QueuedJob, StopMarker, TransferQueue};
pub use resume::{ResumeRecord, ResumeStore};
pub use transfer::{
    BatchReport, Compression, SendOptions, SendOutcome, ServerConfig, TransferClient,
    TransferServer,
};

/// Shared services, built once at startup and handed to every component.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub config: AppConfig,
    pub resume_store: ResumeStore,
    pub events: EventBus,
    data_dir: PathBuf,
}

impl AppContext {
    /// Load the config and open the per-user data directory.
    pub fn init() -> anyhow::Result<Self> {
        let config = AppConfig::load();
        let data_dir = config::get_data_dir().context("No data directory available")?;
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
        Ok(Self::with_dirs(config, data_dir))
    }

    /// Context rooted at an explicit data directory
    pub fn with_dirs(config: AppConfig, data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            config,
            resume_store: ResumeStore::new(data_dir.join(resume::RESUME_DIR)),
            events: EventBus::new(),
            data_dir,
        }
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }

    /// Client wired to this context's resume store, events and timeouts
    pub fn client(&self) -> TransferClient {
        TransferClient::new(self.events.clone())
            .with_resume_store(self.resume_store.clone())
            .with_timeouts(self.config.connect_timeout(), self.config.idle_timeout())
    }

    /// Queue persisted next to the resume records
    pub fn queue(&self) -> TransferQueue {
        TransferQueue::with_persistence(self.client(), self.data_dir.join(queue::QUEUE_FILE))
    }

    pub fn stop_marker(&self) -> StopMarker {
        StopMarker::new(self.data_dir.join(queue::STOP_MARKER_FILE))
    }

    /// Receiver settings from the config
    pub fn server_config(&self, password: Option<String>) -> ServerConfig {
        ServerConfig::new(self.config.download_path.clone())
            .with_password(password)
            .with_idle_timeout(self.config.idle_timeout())
    }
}
