//! Wire codec.
//!
//! One connection carries one frame: the magic, the header fields in fixed
//! order, then exactly `transformed_size` payload bytes. The receiver answers
//! on the same connection with length-prefixed JSON control replies.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Take};

use super::constants::{MAX_HEADER_STRING, MAX_REPLY_SIZE};
use super::hash::ContentHash;
use super::pipeline::Compression;
use crate::error::{Result, TransferError};

/// Magic bytes opening every frame ("BEAM" + protocol version 1)
pub const FRAME_MAGIC: &[u8; 5] = b"BEAM\x01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    #[default]
    Single,
    Batch,
    Directory,
}

impl TransferMode {
    pub fn to_wire(self) -> u8 {
        match self {
            TransferMode::Single => 0,
            TransferMode::Batch => 1,
            TransferMode::Directory => 2,
        }
    }

    pub fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(TransferMode::Single),
            1 => Some(TransferMode::Batch),
            2 => Some(TransferMode::Directory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub mode: TransferMode,
    /// Directory of the file relative to the receiver's downloads root.
    /// Empty outside directory mode.
    pub relative_path: String,
    pub file_name: String,
    pub original_size: u64,
    /// Payload bytes following the header
    pub transformed_size: u64,
    /// BLAKE3 of the whole original file, even when resuming
    pub content_hash: ContentHash,
    pub compression: Compression,
    pub encrypted: bool,
    /// Non-zero: append to the destination from this offset
    pub resume_offset: u64,
}

impl TransferHeader {
    pub fn is_resume(&self) -> bool {
        self.resume_offset > 0
    }

    pub fn is_transformed(&self) -> bool {
        self.compression.is_enabled() || self.encrypted
    }
}

/// Encode the header into its wire form (magic included)
pub fn header_bytes(header: &TransferHeader) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(128 + header.relative_path.len() + header.file_name.len());
    buf.extend_from_slice(FRAME_MAGIC);
    buf.push(header.mode.to_wire());
    put_string(&mut buf, &header.relative_path)?;
    put_string(&mut buf, &header.file_name)?;
    buf.extend_from_slice(&header.original_size.to_be_bytes());
    buf.extend_from_slice(&header.transformed_size.to_be_bytes());
    buf.extend_from_slice(header.content_hash.as_bytes());
    buf.push(header.compression.to_wire());
    buf.push(header.encrypted as u8);
    buf.extend_from_slice(&header.resume_offset.to_be_bytes());
    Ok(buf)
}

fn put_string(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    if value.len() > MAX_HEADER_STRING {
        return Err(TransferError::Protocol(format!(
            "header field too long ({} bytes, max {})",
            value.len(),
            MAX_HEADER_STRING
        )));
    }
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

pub async fn write_header<W: AsyncWrite + Unpin>(
    sink: &mut W,
    header: &TransferHeader,
) -> Result<()> {
    sink.write_all(&header_bytes(header)?).await?;
    Ok(())
}

async fn read_string<R: AsyncRead + Unpin>(source: &mut R) -> Result<String> {
    let len = source.read_u32().await? as usize;
    if len > MAX_HEADER_STRING {
        return Err(TransferError::Protocol(format!(
            "header field too long ({} bytes, max {})",
            len, MAX_HEADER_STRING
        )));
    }
    let mut buf = vec![0u8; len];
    source.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| TransferError::Protocol("header field is not UTF-8".into()))
}

pub async fn read_header<R: AsyncRead + Unpin>(source: &mut R) -> Result<TransferHeader> {
    let mut magic = [0u8; 5];
    source.read_exact(&mut magic).await?;
    if &magic != FRAME_MAGIC {
        return Err(TransferError::Protocol("bad frame magic".into()));
    }

    let mode_tag = source.read_u8().await?;
    let mode = TransferMode::from_wire(mode_tag)
        .ok_or_else(|| TransferError::Protocol(format!("unknown transfer mode {}", mode_tag)))?;
    let relative_path = read_string(source).await?;
    let file_name = read_string(source).await?;
    let original_size = source.read_u64().await?;
    let transformed_size = source.read_u64().await?;

    let mut digest = [0u8; ContentHash::LEN];
    source.read_exact(&mut digest).await?;

    let compression_tag = source.read_u8().await?;
    let compression = Compression::from_wire(compression_tag).ok_or_else(|| {
        TransferError::Protocol(format!("unknown compression algorithm {}", compression_tag))
    })?;
    let encrypted = match source.read_u8().await? {
        0 => false,
        1 => true,
        other => {
            return Err(TransferError::Protocol(format!(
                "invalid encrypted flag {}",
                other
            )));
        }
    };
    let resume_offset = source.read_u64().await?;

    Ok(TransferHeader {
        mode,
        relative_path,
        file_name,
        original_size,
        transformed_size,
        content_hash: ContentHash::from_bytes(digest),
        compression,
        encrypted,
        resume_offset,
    })
}

/// Payload source cut off at the frame's declared size
pub fn frame_payload<R: AsyncRead + Unpin>(header: &TransferHeader, payload: R) -> Take<R> {
    payload.take(header.transformed_size)
}

/// Write the header followed by exactly `transformed_size` bytes of payload.
#[cfg(test)]
pub async fn encode<R, W>(header: &TransferHeader, payload: &mut R, sink: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_header(sink, header).await?;
    let mut bounded = frame_payload(header, payload);
    let copied = tokio::io::copy(&mut bounded, sink).await?;
    if copied != header.transformed_size {
        return Err(TransferError::Protocol(format!(
            "payload ended after {} of {} bytes",
            copied, header.transformed_size
        )));
    }
    sink.flush().await?;
    Ok(copied)
}

/// Read one header and hand back a reader bounded to its payload.
pub async fn decode<R: AsyncRead + Unpin>(
    source: &mut R,
) -> Result<(TransferHeader, Take<&mut R>)> {
    let header = read_header(source).await?;
    let payload = frame_payload(&header, source);
    Ok((header, payload))
}

/// Control replies from receiver to sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMsg {
    /// Payload may start; the receiver appends from `offset`
    Ready { offset: u64 },
    /// Frame refused before any payload was read
    Rejected {
        reason: String,
        /// Bytes already at the destination, when a resume offset was refused
        available: Option<u64>,
    },
    /// Payload fully processed
    Completed {
        verified: bool,
        bytes_written: u64,
        /// Digest the receiver computed, when it got that far
        actual_hash: Option<ContentHash>,
        message: Option<String>,
    },
}

/// Send a control reply over the connection
pub async fn send_msg<W: AsyncWrite + Unpin>(send: &mut W, msg: &TransferMsg) -> Result<()> {
    let json = serde_json::to_vec(msg)?;
    let len = (json.len() as u32).to_be_bytes();
    send.write_all(&len).await?;
    send.write_all(&json).await?;
    send.flush().await?;
    Ok(())
}

/// Receive a control reply from the connection
pub async fn recv_msg<R: AsyncRead + Unpin>(recv: &mut R) -> Result<TransferMsg> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_REPLY_SIZE {
        return Err(TransferError::Protocol(format!(
            "control reply too large ({} bytes)",
            len
        )));
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf).await?;

    let msg: TransferMsg = serde_json::from_slice(&buf)?;
    Ok(msg)
}
