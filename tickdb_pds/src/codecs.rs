//! Block compression codecs applied by the file store before writing.
//!
//! Every codec is identified by a one byte [`Algorithm`] code stored in front of the compressed
//! block, so that a reader can pick the matching [`BlockDecompressor`].

use std::{
    fmt::Debug,
    io::{Read, Write},
};

use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown compression algorithm code {0}")]
    UnknownAlgorithm(u8),

    #[error("io error while (de)compressing: {0}")]
    Io(#[from] std::io::Error),

    #[error("snappy error: {0}")]
    Snappy(#[from] snap::Error),

    #[error("inflated {actual} bytes but expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Deflate cannot expand data by more than this factor
const MAX_DEFLATE_RATIO: usize = 1032;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Algorithm {
    #[default]
    None = 0,
    Zlib = 1,
    Snappy = 2,
}

impl Algorithm {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Zlib),
            2 => Ok(Self::Snappy),
            other => Err(CodecError::UnknownAlgorithm(other)),
        }
    }

    /// Upper bound of the uncompressed length of the block `src`.
    pub fn max_inflated_len(self, src: &[u8]) -> Result<usize, CodecError> {
        match self {
            Self::None => Ok(src.len()),
            Self::Zlib => Ok(src.len().saturating_mul(MAX_DEFLATE_RATIO)),
            Self::Snappy => Ok(snap::raw::decompress_len(src)?),
        }
    }

    pub fn compressor(self) -> Box<dyn BlockCompressor> {
        match self {
            Self::None => Box::new(NoCompression),
            Self::Zlib => Box::new(ZlibCompressor::default()),
            Self::Snappy => Box::new(SnappyCompressor),
        }
    }

    pub fn decompressor(self) -> Box<dyn BlockDecompressor> {
        match self {
            Self::None => Box::new(NoCompression),
            Self::Zlib => Box::new(ZlibDecompressor),
            Self::Snappy => Box::new(SnappyDecompressor),
        }
    }
}

pub trait BlockCompressor: Debug + Send + Sync {
    /// Algorithm code written in front of blocks produced by this compressor
    fn code(&self) -> u8;

    /// Compresses `src` onto the end of `append_to`, returning the number of bytes appended.
    fn deflate(&self, src: &[u8], append_to: &mut Vec<u8>) -> Result<usize, CodecError>;
}

pub trait BlockDecompressor: Debug + Send + Sync {
    /// Inflates `src` into `out`, which must be exactly the uncompressed length.
    fn inflate(&self, src: &[u8], out: &mut [u8]) -> Result<(), CodecError>;
}

#[derive(Debug, Clone, Copy)]
pub struct NoCompression;

impl BlockCompressor for NoCompression {
    fn code(&self) -> u8 {
        Algorithm::None.code()
    }

    fn deflate(&self, src: &[u8], append_to: &mut Vec<u8>) -> Result<usize, CodecError> {
        append_to.extend_from_slice(src);
        Ok(src.len())
    }
}

impl BlockDecompressor for NoCompression {
    fn inflate(&self, src: &[u8], out: &mut [u8]) -> Result<(), CodecError> {
        if src.len() != out.len() {
            return Err(CodecError::LengthMismatch {
                expected: out.len(),
                actual: src.len(),
            });
        }
        out.copy_from_slice(src);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    level: Compression,
}

impl ZlibCompressor {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl BlockCompressor for ZlibCompressor {
    fn code(&self) -> u8 {
        Algorithm::Zlib.code()
    }

    fn deflate(&self, src: &[u8], append_to: &mut Vec<u8>) -> Result<usize, CodecError> {
        let start = append_to.len();
        let mut encoder = ZlibEncoder::new(&mut *append_to, self.level);
        encoder.write_all(src)?;
        encoder.finish()?;
        Ok(append_to.len() - start)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZlibDecompressor;

impl BlockDecompressor for ZlibDecompressor {
    fn inflate(&self, src: &[u8], out: &mut [u8]) -> Result<(), CodecError> {
        let mut decoder = ZlibDecoder::new(src);
        decoder.read_exact(out)?;
        // anything left over means the block is longer than its recorded size
        let trailing = decoder.read(&mut [0u8; 1])?;
        if trailing != 0 {
            return Err(CodecError::LengthMismatch {
                expected: out.len(),
                actual: out.len() + trailing,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SnappyCompressor;

impl BlockCompressor for SnappyCompressor {
    fn code(&self) -> u8 {
        Algorithm::Snappy.code()
    }

    fn deflate(&self, src: &[u8], append_to: &mut Vec<u8>) -> Result<usize, CodecError> {
        let start = append_to.len();
        append_to.resize(start + snap::raw::max_compress_len(src.len()), 0);
        let written = snap::raw::Encoder::new().compress(src, &mut append_to[start..])?;
        append_to.truncate(start + written);
        Ok(written)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SnappyDecompressor;

impl BlockDecompressor for SnappyDecompressor {
    fn inflate(&self, src: &[u8], out: &mut [u8]) -> Result<(), CodecError> {
        let expected = snap::raw::decompress_len(src)?;
        if expected != out.len() {
            return Err(CodecError::LengthMismatch {
                expected: out.len(),
                actual: expected,
            });
        }
        snap::raw::Decoder::new().decompress(src, out)?;
        Ok(())
    }
}
