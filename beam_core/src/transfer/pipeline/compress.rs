//! Compression stage of the pipeline.
//!
//! gzip goes through `flate2`, brotli through the `brotli` crate. Both
//! formats are self-describing, so the decoder only needs the algorithm tag
//! carried in the header.

use flate2::Compression as GzLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

use crate::transfer::constants::BUFFER_SIZE;

const BROTLI_QUALITY: u32 = 5;
const BROTLI_WINDOW: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Brotli,
}

impl Compression {
    pub fn to_wire(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
            Compression::Brotli => 2,
        }
    }

    pub fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Compression::None),
            1 => Some(Compression::Gzip),
            2 => Some(Compression::Brotli),
            _ => None,
        }
    }

    pub fn is_enabled(self) -> bool {
        self != Compression::None
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Brotli => "brotli",
        };
        f.write_str(name)
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Compression::None),
            "gzip" | "gz" => Ok(Compression::Gzip),
            "brotli" | "br" => Ok(Compression::Brotli),
            other => Err(format!("unknown compression algorithm: {}", other)),
        }
    }
}

/// Reader yielding the compressed form of its inner reader.
pub enum CompressReader<R: Read> {
    Plain(R),
    Gzip(flate2::read::GzEncoder<R>),
    Brotli(Box<brotli::CompressorReader<R>>),
}

impl<R: Read> CompressReader<R> {
    pub fn new(inner: R, algorithm: Compression) -> Self {
        match algorithm {
            Compression::None => CompressReader::Plain(inner),
            Compression::Gzip => {
                CompressReader::Gzip(flate2::read::GzEncoder::new(inner, GzLevel::default()))
            }
            Compression::Brotli => CompressReader::Brotli(Box::new(
                brotli::CompressorReader::new(inner, BUFFER_SIZE, BROTLI_QUALITY, BROTLI_WINDOW),
            )),
        }
    }
}

impl<R: Read> Read for CompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            CompressReader::Plain(r) => r.read(buf),
            CompressReader::Gzip(r) => r.read(buf),
            CompressReader::Brotli(r) => r.read(buf),
        }
    }
}

/// Reader yielding the decompressed form of its inner reader.
pub enum DecompressReader<R: Read> {
    Plain(R),
    Gzip(flate2::read::GzDecoder<R>),
    Brotli(Box<brotli::Decompressor<R>>),
}

impl<R: Read> DecompressReader<R> {
    pub fn new(inner: R, algorithm: Compression) -> Self {
        match algorithm {
            Compression::None => DecompressReader::Plain(inner),
            Compression::Gzip => DecompressReader::Gzip(flate2::read::GzDecoder::new(inner)),
            Compression::Brotli => {
                DecompressReader::Brotli(Box::new(brotli::Decompressor::new(inner, BUFFER_SIZE)))
            }
        }
    }
}

impl<R: Read> Read for DecompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DecompressReader::Plain(r) => r.read(buf),
            DecompressReader::Gzip(r) => r.read(buf),
            DecompressReader::Brotli(r) => r.read(buf),
        }
    }
}
