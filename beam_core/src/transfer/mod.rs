//! TCP file transfer.
//!
//! This module provides:
//! - The frame codec and control replies
//! - The transform pipeline (compression, encryption, throttling)
//! - The sending client and the receiving server

pub mod constants;
pub mod hash;
pub mod pipeline;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod utils;

// Re-export public API
pub use constants::TRANSFER_PORT;
pub use hash::ContentHash;
pub use pipeline::{Compression, Pipeline};
pub use protocol::{TransferHeader, TransferMode, TransferMsg};
pub use receiver::{ReceivedFile, ServerConfig};
pub use sender::{BatchReport, SendOptions, SendOutcome, TransferClient};
pub use server::{TransferServer, start};
