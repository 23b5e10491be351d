use std::time::Duration;

/// Default TCP port for file transfer
pub const TRANSFER_PORT: u16 = 9000;

/// Buffer size for file transfer (64KB)
pub const BUFFER_SIZE: usize = 64 * 1024;

/// Maximum accepted file size (64GB)
pub const MAX_FILE_SIZE: u64 = 64 * 1024 * 1024 * 1024;

/// Maximum file name length in bytes
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Maximum length of any string field in the header
pub const MAX_HEADER_STRING: usize = 4096;

/// Maximum size of a JSON control reply
pub const MAX_REPLY_SIZE: usize = 64 * 1024;

/// Minimum gap between two progress events for the same transfer
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Chunks queued between the socket reader and the decode worker
pub const DECODE_CHANNEL_DEPTH: usize = 16;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
