//! Compression engines for operation payloads.
//!
//! # Identity rules
//! Every algorithm has one frozen numeric id.  That id is written into the
//! COW header and is the only thing a reader uses to pick a codec: there is
//! no format sniffing and no fallback.  A reader that does not know the id
//! MUST refuse the log.
//!
//! | Id | Algorithm |
//! |----|-----------|
//! | 0  | none (payload stored verbatim) |
//! | 1  | gzip: reserved, not built in |
//! | 2  | brotli |
//! | 3  | lz4 (raw block format, no size prefix) |
//! | 4  | zstd |
//! | 5  | lzma |
//!
//! # Engine contract
//! An engine is configured with a level at construction, must be
//! [`CompressionEngine::init`]ed once before use, and is stateless per call.
//! `decompress` produces exactly `expected_len` bytes or fails with a
//! [`CorruptionError`]; it never returns a partial or padded buffer.

use std::io::{Read, Write};
use thiserror::Error;

use crate::error::CorruptionError;

// ── Frozen algorithm ids ────────────────────────────────────────────────────

pub const ALGORITHM_NONE:   u32 = 0;
pub const ALGORITHM_GZ:     u32 = 1;
pub const ALGORITHM_BROTLI: u32 = 2;
pub const ALGORITHM_LZ4:    u32 = 3;
pub const ALGORITHM_ZSTD:   u32 = 4;
pub const ALGORITHM_LZMA:   u32 = 5;

/// Default zstd level; also used as the generic default.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

// ── CompressionAlgorithm ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    None,
    Brotli,
    Lz4,
    Zstd,
    Lzma,
}

impl CompressionAlgorithm {
    /// Stable id stored in the header.
    #[inline]
    pub fn id(self) -> u32 {
        match self {
            CompressionAlgorithm::None   => ALGORITHM_NONE,
            CompressionAlgorithm::Brotli => ALGORITHM_BROTLI,
            CompressionAlgorithm::Lz4    => ALGORITHM_LZ4,
            CompressionAlgorithm::Zstd   => ALGORITHM_ZSTD,
            CompressionAlgorithm::Lzma   => ALGORITHM_LZMA,
        }
    }

    /// Resolve a header id.  Returns `None` for ids this build cannot decode,
    /// including the reserved gzip id.
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            ALGORITHM_NONE   => Some(CompressionAlgorithm::None),
            ALGORITHM_BROTLI => Some(CompressionAlgorithm::Brotli),
            ALGORITHM_LZ4    => Some(CompressionAlgorithm::Lz4),
            ALGORITHM_ZSTD   => Some(CompressionAlgorithm::Zstd),
            ALGORITHM_LZMA   => Some(CompressionAlgorithm::Lzma),
            _                => None,
        }
    }

    /// Human-readable name, for diagnostics; never read from disk.
    pub fn name(self) -> &'static str {
        match self {
            CompressionAlgorithm::None   => "none",
            CompressionAlgorithm::Brotli => "brotli",
            CompressionAlgorithm::Lz4    => "lz4",
            CompressionAlgorithm::Zstd   => "zstd",
            CompressionAlgorithm::Lzma   => "lzma",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none"   => Some(CompressionAlgorithm::None),
            "brotli" => Some(CompressionAlgorithm::Brotli),
            "lz4"    => Some(CompressionAlgorithm::Lz4),
            "zstd"   => Some(CompressionAlgorithm::Zstd),
            "lzma"   => Some(CompressionAlgorithm::Lzma),
            _        => None,
        }
    }

    /// Level used when the caller does not pick one.
    pub fn default_level(self) -> i32 {
        match self {
            CompressionAlgorithm::Brotli => 11,
            CompressionAlgorithm::Zstd   => DEFAULT_COMPRESSION_LEVEL,
            _                            => 0,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Compression level {level} is out of range for {codec}")]
    InvalidLevel { codec: &'static str, level: i32 },
    #[error("Engine {0} used before init()")]
    NotInitialized(&'static str),
    /// The header names an algorithm this build cannot supply.  Opening the
    /// log MUST fail; there is no fallback codec.
    #[error("Compression algorithm id {0} is not available in this build")]
    UnavailableAlgorithm(u32),
}

// ── Engine trait ─────────────────────────────────────────────────────────────

pub trait CompressionEngine: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    fn level(&self) -> i32;

    /// Prepare codec state.  Must succeed before any other call.
    fn init(&mut self) -> Result<(), CodecError>;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Codec-specific inflate.  Implementations must not produce more than
    /// `limit` bytes; the length contract is enforced by [`decompress`].
    ///
    /// [`decompress`]: CompressionEngine::decompress
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CorruptionError>;

    /// Inflate `data` into exactly `expected_len` bytes.
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CorruptionError> {
        let out = self.decompress_bounded(data, expected_len.saturating_add(1))?;
        if out.len() != expected_len {
            return Err(CorruptionError::LengthMismatch { expected: expected_len, actual: out.len() });
        }
        Ok(out)
    }
}

fn codec_failure(codec: &'static str, e: impl std::fmt::Display) -> CorruptionError {
    CorruptionError::Codec { codec, message: e.to_string() }
}

/// Drain a streaming decoder, stopping one byte past `limit` so oversized
/// output is detected without inflating it completely.
fn read_bounded<R: Read>(codec: &'static str, decoder: R, limit: usize) -> Result<Vec<u8>, CorruptionError> {
    let mut out = Vec::new();
    decoder
        .take(limit as u64)
        .read_to_end(&mut out)
        .map_err(|e| codec_failure(codec, e))?;
    Ok(out)
}

// ── Built-in engines ─────────────────────────────────────────────────────────

pub struct NoneEngine;
impl CompressionEngine for NoneEngine {
    fn algorithm(&self) -> CompressionAlgorithm { CompressionAlgorithm::None }
    fn level(&self) -> i32 { 0 }
    fn init(&mut self) -> Result<(), CodecError> { Ok(()) }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CorruptionError> {
        Ok(data[..data.len().min(limit)].to_vec())
    }
}

pub struct ZstdEngine {
    level:       i32,
    initialized: bool,
}

impl ZstdEngine {
    pub fn new(level: i32) -> Self { Self { level, initialized: false } }
}

impl CompressionEngine for ZstdEngine {
    fn algorithm(&self) -> CompressionAlgorithm { CompressionAlgorithm::Zstd }
    fn level(&self) -> i32 { self.level }
    fn init(&mut self) -> Result<(), CodecError> {
        if !zstd::compression_level_range().contains(&self.level) {
            return Err(CodecError::InvalidLevel { codec: "zstd", level: self.level });
        }
        self.initialized = true;
        Ok(())
    }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        if !self.initialized { return Err(CodecError::NotInitialized("zstd")); }
        zstd::encode_all(data, self.level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CorruptionError> {
        let decoder = zstd::stream::read::Decoder::new(data).map_err(|e| codec_failure("zstd", e))?;
        read_bounded("zstd", decoder, limit)
    }
}

pub struct Lz4Engine {
    initialized: bool,
}

impl Lz4Engine {
    pub fn new() -> Self { Self { initialized: false } }
}

impl Default for Lz4Engine {
    fn default() -> Self { Self::new() }
}

impl CompressionEngine for Lz4Engine {
    fn algorithm(&self) -> CompressionAlgorithm { CompressionAlgorithm::Lz4 }
    fn level(&self) -> i32 { 0 }
    fn init(&mut self) -> Result<(), CodecError> {
        self.initialized = true;
        Ok(())
    }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        if !self.initialized { return Err(CodecError::NotInitialized("lz4")); }
        Ok(lz4_flex::block::compress(data))
    }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CorruptionError> {
        // Raw blocks carry no length; the caller's bound is the output size.
        lz4_flex::block::decompress(data, limit).map_err(|e| codec_failure("lz4", e))
    }
}

pub struct BrotliEngine {
    quality:     i32,
    initialized: bool,
}

impl BrotliEngine {
    pub fn new(quality: i32) -> Self { Self { quality, initialized: false } }
}

impl CompressionEngine for BrotliEngine {
    fn algorithm(&self) -> CompressionAlgorithm { CompressionAlgorithm::Brotli }
    fn level(&self) -> i32 { self.quality }
    fn init(&mut self) -> Result<(), CodecError> {
        if !(0..=11).contains(&self.quality) {
            return Err(CodecError::InvalidLevel { codec: "brotli", level: self.quality });
        }
        self.initialized = true;
        Ok(())
    }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        if !self.initialized { return Err(CodecError::NotInitialized("brotli")); }
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, self.quality as u32, 22);
            w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(out)
    }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CorruptionError> {
        read_bounded("brotli", brotli::Decompressor::new(data, 4096), limit)
    }
}

pub struct LzmaEngine {
    initialized: bool,
}

impl LzmaEngine {
    pub fn new() -> Self { Self { initialized: false } }
}

impl Default for LzmaEngine {
    fn default() -> Self { Self::new() }
}

impl CompressionEngine for LzmaEngine {
    fn algorithm(&self) -> CompressionAlgorithm { CompressionAlgorithm::Lzma }
    fn level(&self) -> i32 { 0 }
    fn init(&mut self) -> Result<(), CodecError> {
        self.initialized = true;
        Ok(())
    }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        if !self.initialized { return Err(CodecError::NotInitialized("lzma")); }
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut std::io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CorruptionError> {
        let mut out = Vec::new();
        let options = lzma_rs::decompress::Options {
            memlimit: Some(limit),
            ..Default::default()
        };
        lzma_rs::lzma_decompress_with_options(&mut std::io::Cursor::new(data), &mut out, &options)
            .map_err(|e| codec_failure("lzma", e))?;
        Ok(out)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Build an engine for `algorithm` at `level`, without initializing it.
pub fn engine_for(algorithm: CompressionAlgorithm, level: i32) -> Box<dyn CompressionEngine> {
    match algorithm {
        CompressionAlgorithm::None   => Box::new(NoneEngine),
        CompressionAlgorithm::Zstd   => Box::new(ZstdEngine::new(level)),
        CompressionAlgorithm::Lz4    => Box::new(Lz4Engine::new()),
        CompressionAlgorithm::Brotli => Box::new(BrotliEngine::new(level)),
        CompressionAlgorithm::Lzma   => Box::new(LzmaEngine::new()),
    }
}

/// Resolve a header id to an initialized engine at the algorithm's default
/// level.  Unknown ids fail hard.
pub fn open_engine(id: u32) -> Result<Box<dyn CompressionEngine>, CodecError> {
    let algorithm = CompressionAlgorithm::from_id(id).ok_or(CodecError::UnavailableAlgorithm(id))?;
    let mut engine = engine_for(algorithm, algorithm.default_level());
    engine.init()?;
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CompressionAlgorithm; 5] = [
        CompressionAlgorithm::None,
        CompressionAlgorithm::Brotli,
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Zstd,
        CompressionAlgorithm::Lzma,
    ];

    fn ready(algorithm: CompressionAlgorithm) -> Box<dyn CompressionEngine> {
        let mut engine = engine_for(algorithm, algorithm.default_level());
        engine.init().unwrap();
        engine
    }

    #[test]
    fn ids_are_stable() {
        for a in ALL {
            assert_eq!(CompressionAlgorithm::from_id(a.id()), Some(a));
            assert_eq!(CompressionAlgorithm::from_name(a.name()), Some(a));
        }
        assert_eq!(CompressionAlgorithm::from_id(ALGORITHM_GZ), None);
        assert_eq!(CompressionAlgorithm::from_id(99), None);
    }

    #[test]
    fn roundtrip_block_and_empty() {
        let block: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        for a in ALL {
            let engine = ready(a);
            for data in [&block[..], &[][..]] {
                let packed = engine.compress(data).unwrap();
                let unpacked = engine.decompress(&packed, data.len()).unwrap();
                assert_eq!(unpacked, data, "{}", a.name());
            }
        }
    }

    #[test]
    fn wrong_expected_length_is_corruption() {
        let data = vec![7u8; 4096];
        for a in ALL {
            let engine = ready(a);
            let packed = engine.compress(&data).unwrap();
            assert!(engine.decompress(&packed, 4095).is_err(), "{} short", a.name());
            assert!(engine.decompress(&packed, 4097).is_err(), "{} long", a.name());
        }
    }

    #[test]
    fn garbage_input_is_corruption() {
        let engine = ready(CompressionAlgorithm::Zstd);
        let err = engine.decompress(b"definitely not zstd", 4096).unwrap_err();
        assert!(matches!(err, CorruptionError::Codec { codec: "zstd", .. }));
    }

    #[test]
    fn compress_requires_init() {
        let engine = engine_for(CompressionAlgorithm::Lz4, 0);
        assert!(matches!(engine.compress(b"abc"), Err(CodecError::NotInitialized("lz4"))));
    }

    #[test]
    fn init_rejects_bad_level() {
        let mut engine = engine_for(CompressionAlgorithm::Brotli, 12);
        assert!(matches!(engine.init(), Err(CodecError::InvalidLevel { codec: "brotli", level: 12 })));
        assert!(matches!(open_engine(ALGORITHM_GZ), Err(CodecError::UnavailableAlgorithm(1))));
    }
}
