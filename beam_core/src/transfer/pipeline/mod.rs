//! Stream transform pipeline.
//!
//! On send the payload is `Throttle(Encrypt(Compress(raw)))`; on receive the
//! byte transforms are undone in reverse order. The chain is resolved once
//! per transfer from the options into concrete reader types, so there is no
//! dynamic wrapper stacking at runtime.

pub mod compress;
pub mod crypto;
pub mod throttle;

use bytes::{Buf, Bytes};
use std::io::{self, BufReader, Read};
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

pub use compress::{Compression, CompressReader, DecompressReader};
pub use crypto::{CryptoError, DecryptReader, EncryptReader};
pub use throttle::Throttle;

use super::constants::BUFFER_SIZE;

/// Encryption stage: passthrough, sealing or opening.
pub enum CipherReader<R: Read> {
    Plain(R),
    Encrypt(EncryptReader<R>),
    Decrypt(DecryptReader<R>),
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            CipherReader::Plain(r) => r.read(buf),
            CipherReader::Encrypt(r) => r.read(buf),
            CipherReader::Decrypt(r) => r.read(buf),
        }
    }
}

/// Raw file bytes in, wire bytes out
pub type EncodeReader<R> = CipherReader<CompressReader<R>>;

/// Wire bytes in, original file bytes out
pub type DecodeReader<R> = DecompressReader<CipherReader<R>>;

/// Transforms selected for one transfer.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    compression: Compression,
    password: Option<String>,
    speed_limit_kbs: Option<u64>,
}

impl Pipeline {
    pub fn new(
        compression: Compression,
        password: Option<&str>,
        speed_limit_kbs: Option<u64>,
    ) -> Self {
        Self {
            compression,
            password: password.filter(|p| !p.is_empty()).map(str::to_string),
            speed_limit_kbs: speed_limit_kbs.filter(|kbs| *kbs > 0),
        }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn encrypted(&self) -> bool {
        self.password.is_some()
    }

    pub fn speed_limit_kbs(&self) -> Option<u64> {
        self.speed_limit_kbs
    }

    /// True when wire bytes equal file bytes. Throttling does not count,
    /// it changes timing only.
    pub fn is_identity(&self) -> bool {
        !self.compression.is_enabled() && !self.encrypted()
    }

    pub fn encoder<R: Read>(&self, raw: R) -> EncodeReader<R> {
        let compressed = CompressReader::new(raw, self.compression);
        match &self.password {
            Some(password) => CipherReader::Encrypt(EncryptReader::new(compressed, password)),
            None => CipherReader::Plain(compressed),
        }
    }

    pub fn decoder<R: Read>(&self, wire: R) -> DecodeReader<R> {
        let opened = match &self.password {
            Some(password) => CipherReader::Decrypt(DecryptReader::new(wire, password)),
            None => CipherReader::Plain(wire),
        };
        DecompressReader::new(opened, self.compression)
    }

    pub fn throttle(&self) -> Option<Throttle> {
        self.speed_limit_kbs.map(Throttle::from_kbs)
    }

    /// Run the byte transforms over `source` into a temporary spool file.
    ///
    /// The header announces the transformed size up front, so transformed
    /// payloads are materialised before the first byte goes out. Blocking.
    pub fn encode_to_spool(&self, source: &Path) -> io::Result<(NamedTempFile, u64)> {
        let file = std::fs::File::open(source)?;
        let mut reader = self.encoder(BufReader::with_capacity(BUFFER_SIZE, file));
        let mut spool = NamedTempFile::new()?;
        let written = io::copy(&mut reader, spool.as_file_mut())?;
        spool.as_file_mut().sync_data()?;
        Ok((spool, written))
    }
}

/// Blocking reader over chunks delivered by an async task.
///
/// Lets the socket side stay async while the decode chain runs on a
/// blocking worker.
pub struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl ChannelReader {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }

    /// Consume whatever is left, returning how many bytes were discarded
    pub fn drain(&mut self) -> u64 {
        let mut discarded = self.current.len() as u64;
        self.current = Bytes::new();
        while let Some(chunk) = self.rx.blocking_recv() {
            discarded += chunk.len() as u64;
        }
        discarded
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(pipeline: &Pipeline, data: &[u8]) -> (Vec<u8>, usize) {
        let mut wire = Vec::new();
        pipeline.encoder(data).read_to_end(&mut wire).unwrap();
        let mut back = Vec::new();
        pipeline.decoder(&wire[..]).read_to_end(&mut back).unwrap();
        (back, wire.len())
    }

    #[test]
    fn test_all_combinations_roundtrip() {
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 7) as u8).collect();
        for compression in [Compression::None, Compression::Gzip, Compression::Brotli] {
            for password in [None, Some("pw")] {
                let pipeline = Pipeline::new(compression, password, None);
                let (back, _) = roundtrip(&pipeline, &data);
                assert_eq!(back, data, "{} / {:?}", compression, password);
            }
        }
    }

    #[test]
    fn test_identity_detection() {
        assert!(Pipeline::new(Compression::None, None, Some(100)).is_identity());
        assert!(Pipeline::new(Compression::None, Some(""), None).is_identity());
        assert!(!Pipeline::new(Compression::Gzip, None, None).is_identity());
        assert!(!Pipeline::new(Compression::None, Some("pw"), None).is_identity());
        assert!(Pipeline::new(Compression::None, None, Some(0)).throttle().is_none());
    }

    #[test]
    fn test_identity_wire_equals_source() {
        let pipeline = Pipeline::default();
        let (back, wire_len) = roundtrip(&pipeline, b"plain bytes");
        assert_eq!(back, b"plain bytes");
        assert_eq!(wire_len, 11);
    }

    #[test]
    fn test_encode_to_spool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        std::fs::write(&path, vec![b'X'; 1024 * 1024]).unwrap();

        let pipeline = Pipeline::new(Compression::Gzip, None, None);
        let (spool, size) = pipeline.encode_to_spool(&path).unwrap();
        assert!(size < 64 * 1024);
        assert_eq!(std::fs::metadata(spool.path()).unwrap().len(), size);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_channel_reader_feeds_blocking_worker() {
        let (tx, rx) = mpsc::channel::<Bytes>(2);
        let worker = tokio::task::spawn_blocking(move || {
            let mut reader = ChannelReader::new(rx);
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            out
        });
        for part in [&b"abc"[..], b"", b"defg"] {
            tx.send(Bytes::copy_from_slice(part)).await.unwrap();
        }
        drop(tx);
        assert_eq!(worker.await.unwrap(), b"abcdefg");
    }
}
