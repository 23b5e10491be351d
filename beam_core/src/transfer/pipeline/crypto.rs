//! Password-based payload encryption.
//!
//! Stream layout:
//!
//! ```text
//! salt (16) | nonce prefix (8) | record*
//! record = flag u8 | len u32 BE | AES-256-GCM ciphertext + tag
//! ```
//!
//! The key is PBKDF2-HMAC-SHA256 over the password and the per-stream salt.
//! Each record nonce is the prefix followed by a big-endian record counter,
//! and the flag byte is bound as associated data. The last record carries
//! `FLAG_FINAL`, so a stream cut short is detected instead of silently
//! accepted.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use std::io::{self, Read};

pub const SALT_LEN: usize = 16;
pub const NONCE_PREFIX_LEN: usize = 8;
/// Plaintext bytes sealed per record
pub const RECORD_SIZE: usize = 64 * 1024;

const TAG_LEN: usize = 16;
const KDF_ROUNDS: u32 = 100_000;
const FLAG_MORE: u8 = 0;
const FLAG_FINAL: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("authentication failed (wrong password or corrupted data)")]
    Authentication,

    #[error("encrypted stream is truncated")]
    Truncated,

    #[error("malformed encrypted record: {0}")]
    Malformed(String),

    #[error("encrypted stream exceeds the record limit")]
    CounterExhausted,

    #[error("failed to seal record")]
    Seal,
}

fn crypto_io(err: CryptoError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

fn derive_cipher(password: &str, salt: &[u8]) -> Aes256Gcm {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, KDF_ROUNDS, &mut key);
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key))
}

fn record_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Reads at most `buf.len()` bytes, stopping early only at end of input.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Reader yielding the encrypted form of its inner reader.
pub struct EncryptReader<R> {
    inner: R,
    cipher: Aes256Gcm,
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    plain: Vec<u8>,
    out: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: Read> EncryptReader<R> {
    pub fn new(inner: R, password: &str) -> Self {
        let mut rng = rand::rng();
        let mut salt = [0u8; SALT_LEN];
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce_prefix);

        let mut preamble = Vec::with_capacity(SALT_LEN + NONCE_PREFIX_LEN);
        preamble.extend_from_slice(&salt);
        preamble.extend_from_slice(&nonce_prefix);

        Self {
            inner,
            cipher: derive_cipher(password, &salt),
            nonce_prefix,
            counter: 0,
            plain: vec![0u8; RECORD_SIZE],
            out: preamble,
            pos: 0,
            finished: false,
        }
    }

    fn seal_next_record(&mut self) -> io::Result<()> {
        let filled = read_full(&mut self.inner, &mut self.plain)?;
        let flag = if filled < RECORD_SIZE { FLAG_FINAL } else { FLAG_MORE };

        let nonce = record_nonce(&self.nonce_prefix, self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| crypto_io(CryptoError::CounterExhausted))?;

        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &self.plain[..filled],
                    aad: &[flag],
                },
            )
            .map_err(|_| crypto_io(CryptoError::Seal))?;

        self.out.clear();
        self.out.push(flag);
        self.out
            .extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        self.out.extend_from_slice(&sealed);
        self.pos = 0;
        self.finished = flag == FLAG_FINAL;
        Ok(())
    }
}

impl<R: Read> Read for EncryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.out.len() {
                let n = buf.len().min(self.out.len() - self.pos);
                buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }
            self.seal_next_record()?;
        }
    }
}

/// Reader yielding the decrypted form of its inner reader.
///
/// Key derivation is deferred until the first read, so constructing the
/// reader is cheap and the work lands on whichever thread drives it.
pub struct DecryptReader<R> {
    inner: R,
    password: String,
    cipher: Option<Aes256Gcm>,
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    out: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(inner: R, password: &str) -> Self {
        Self {
            inner,
            password: password.to_string(),
            cipher: None,
            nonce_prefix: [0u8; NONCE_PREFIX_LEN],
            counter: 0,
            out: Vec::new(),
            pos: 0,
            finished: false,
        }
    }

    fn read_exact_or_truncated(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match self.inner.read_exact(buf) {
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(crypto_io(CryptoError::Truncated))
            }
            other => other,
        }
    }

    fn open_next_record(&mut self) -> io::Result<()> {
        if self.cipher.is_none() {
            let mut preamble = [0u8; SALT_LEN + NONCE_PREFIX_LEN];
            self.read_exact_or_truncated(&mut preamble)?;
            self.nonce_prefix
                .copy_from_slice(&preamble[SALT_LEN..]);
            self.cipher = Some(derive_cipher(&self.password, &preamble[..SALT_LEN]));
        }

        let mut head = [0u8; 5];
        self.read_exact_or_truncated(&mut head)?;
        let flag = head[0];
        if flag != FLAG_MORE && flag != FLAG_FINAL {
            return Err(crypto_io(CryptoError::Malformed(format!(
                "unknown record flag {}",
                flag
            ))));
        }
        let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
        if !(TAG_LEN..=RECORD_SIZE + TAG_LEN).contains(&len) {
            return Err(crypto_io(CryptoError::Malformed(format!(
                "record length {} out of range",
                len
            ))));
        }

        let mut sealed = vec![0u8; len];
        self.read_exact_or_truncated(&mut sealed)?;

        let nonce = record_nonce(&self.nonce_prefix, self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| crypto_io(CryptoError::CounterExhausted))?;

        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| crypto_io(CryptoError::Authentication))?;
        let plain = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: &[flag],
                },
            )
            .map_err(|_| crypto_io(CryptoError::Authentication))?;

        self.out = plain;
        self.pos = 0;
        self.finished = flag == FLAG_FINAL;
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.out.len() {
                let n = buf.len().min(self.out.len() - self.pos);
                buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }
            self.open_next_record()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt(data: &[u8], password: &str) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        EncryptReader::new(data, password).read_to_end(&mut out)?;
        Ok(out)
    }

    fn decrypt(data: &[u8], password: &str) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        DecryptReader::new(data, password).read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_roundtrip_sizes() {
        for len in [0usize, 1, RECORD_SIZE - 1, RECORD_SIZE, RECORD_SIZE * 3 + 17] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let sealed = encrypt(&data, "secret").unwrap();
            assert_ne!(sealed.len(), data.len());
            assert_eq!(decrypt(&sealed, "secret").unwrap(), data, "len {}", len);
        }
    }

    #[test]
    fn test_wrong_password_never_yields_plaintext() {
        let data = b"the quick brown fox".to_vec();
        let sealed = encrypt(&data, "pw1").unwrap();
        match decrypt(&sealed, "pw2") {
            Ok(out) => assert_ne!(out, data),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidData),
        }
    }

    #[test]
    fn test_fresh_salt_per_stream() {
        let a = encrypt(b"same", "pw").unwrap();
        let b = encrypt(b"same", "pw").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_truncated_stream_detected() {
        let data = vec![3u8; RECORD_SIZE * 2];
        let sealed = encrypt(&data, "pw").unwrap();
        let cut = &sealed[..sealed.len() - 40];
        let err = decrypt(cut, "pw").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_tampered_record_rejected() {
        let mut sealed = encrypt(b"payload bytes", "pw").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        let err = decrypt(&sealed, "pw").unwrap_err();
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<CryptoError>());
        assert!(matches!(inner, Some(CryptoError::Authentication)));
    }
}
