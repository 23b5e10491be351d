#![allow(dead_code)]

use beam_core::{AppEvent, EventBus, ResumeStore, ServerConfig, TransferClient, TransferServer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub struct TestServer {
    pub addr: SocketAddr,
    pub download_dir: PathBuf,
    pub events: EventBus,
    pub cancel: CancellationToken,
    _dir: TempDir,
}

impl TestServer {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.download_dir.join(relative)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Helper to spawn a receiver on an ephemeral port
pub async fn spawn_server(password: Option<&str>) -> TestServer {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let download_dir = dir.path().join("downloads");
    let events = EventBus::new();

    let config = ServerConfig::new(&download_dir)
        .with_password(password.map(str::to_string))
        .with_idle_timeout(Duration::from_secs(5));
    let server = TransferServer::bind("127.0.0.1:0".parse().unwrap(), config, events.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let cancel = CancellationToken::new();
    tokio::spawn(server.run(cancel.clone()));

    TestServer {
        addr,
        download_dir,
        events,
        cancel,
        _dir: dir,
    }
}

pub fn client() -> TransferClient {
    TransferClient::new(EventBus::new())
        .with_timeouts(Duration::from_secs(2), Duration::from_secs(5))
}

pub fn client_with_store(dir: &Path) -> TransferClient {
    client().with_resume_store(ResumeStore::new(dir.join("resume")))
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, data).unwrap();
    path
}

/// Next event matching `pred`, failing the test after a few seconds
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<AppEvent>, mut pred: F) -> AppEvent
where
    F: FnMut(&AppEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// A port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
