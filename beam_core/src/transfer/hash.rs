use blake3::Hasher;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::constants::BUFFER_SIZE;

/// BLAKE3 digest of the original, untransformed file content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex)
            .ok()
            .map(|h| Self(*h.as_bytes()))
    }

    /// Short form for log lines
    pub fn short(&self) -> String {
        self.to_hex()[..16].to_string()
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        ContentHash::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom("invalid BLAKE3 hex digest"))
    }
}

/// Files at least this large are hashed across the rayon pool
const PARALLEL_HASH_THRESHOLD: u64 = 16 * 1024 * 1024;
const PARALLEL_HASH_CHUNK: usize = 8 * 1024 * 1024;

/// Compute BLAKE3 hash of a file
pub async fn compute_file_hash(file_path: &Path) -> io::Result<ContentHash> {
    let mut file = File::open(file_path).await?;
    if file.metadata().await?.len() >= PARALLEL_HASH_THRESHOLD {
        let file = file.into_std().await;
        return tokio::task::spawn_blocking(move || hash_parallel(file))
            .await
            .map_err(io::Error::other)?;
    }
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize().into())
}

fn hash_parallel(mut file: impl Read) -> io::Result<ContentHash> {
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; PARALLEL_HASH_CHUNK];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update_rayon(&buffer[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Hash of an in-memory buffer
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    blake3::hash(data).into()
}

/// Writer that hashes everything passing through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
            written: 0,
        }
    }

    /// Feed bytes already present at the destination into the digest
    /// without writing them again.
    pub fn absorb_existing<R: Read>(&mut self, mut existing: R) -> io::Result<u64> {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = existing.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            self.hasher.update(&buffer[..n]);
            total += n as u64;
        }
        self.written += total;
        Ok(total)
    }

    pub fn finish(mut self) -> io::Result<(W, ContentHash, u64)> {
        self.inner.flush()?;
        Ok((self.inner, self.hasher.finalize().into(), self.written))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
