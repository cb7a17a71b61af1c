//! Corruption taxonomy shared by the header, record, codec and merge layers.
//!
//! A [`CorruptionError`] always means the log itself cannot be trusted.  It is
//! never retried and never silently skipped; callers must abort the update
//! rather than schedule another attempt.  I/O failures are reported through
//! the component-specific error types instead (`ParseError::Io`,
//! `MergeError::Io`).

use std::io;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorruptionError {
    #[error("Invalid magic number {0:#010x}")]
    BadMagic(u32),
    #[error("Unsupported format version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("Header size {0} is smaller than the fixed header")]
    HeaderTooSmall(u16),
    #[error("Header needs {expected} bytes but the log holds {available}")]
    TruncatedHeader { expected: usize, available: usize },
    #[error("Block size {0} is not a non-zero power of two")]
    InvalidBlockSize(u32),
    #[error("Cluster size 1 is invalid; clusters need at least two operations")]
    InvalidClusterSize,
    #[error("Unknown feature flags {0:#010x}")]
    UnknownFeatures(u32),
    #[error("Unknown compression algorithm id {0}")]
    UnknownCompression(u32),
    #[error("Unknown operation type {tag:#04x} at offset {offset}")]
    UnknownOpType { offset: u64, tag: u8 },
    #[error("Invalid record at offset {offset}: {reason}")]
    InvalidRecord { offset: u64, reason: String },
    #[error("Label {label} at offset {offset} does not follow label {previous}")]
    NonIncreasingLabel { offset: u64, previous: u64, label: u64 },
    #[error("Copy at offset {offset} reads block {block}, which an earlier operation writes")]
    ForwardDependency { offset: u64, block: u64 },
    #[error("Cluster ending at offset {offset} holds more than {cluster_size} operations")]
    OversizedCluster { offset: u64, cluster_size: u32 },
    #[error("Cluster holding operation {op_index} stages {blocks} blocks, over the limit of {limit}")]
    StagingLimit { op_index: usize, blocks: u64, limit: u64 },
    #[error("Resume label {0} not found among confirmed labels")]
    ResumeLabelNotFound(u64),
    #[error("Data follows the end record at offset {0}")]
    TrailingData(u64),
    #[error("End record declares {declared} operations, log holds {actual}")]
    OpCountMismatch { declared: u64, actual: u64 },
    #[error("Log checksum mismatch")]
    ChecksumMismatch,
    #[error("Log is marked finalized but has no end record")]
    MissingEndRecord,
    #[error("Decompressed length {actual} does not match declared {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("Codec {codec} reported: {message}")]
    Codec { codec: &'static str, message: String },
    #[error("Operation {op_index} touches blocks {start}..{end} beyond device end {device_blocks}")]
    OutOfRange { op_index: usize, start: u64, end: u64, device_blocks: u64 },
    #[error("Log block size {log} does not match device block size {device}")]
    BlockSizeMismatch { log: u32, device: u32 },
    #[error("Persisted checkpoint does not match the log: {0}")]
    CheckpointMismatch(String),
}

impl CorruptionError {
    pub(crate) fn invalid(offset: u64, reason: impl Into<String>) -> Self {
        CorruptionError::InvalidRecord { offset, reason: reason.into() }
    }
}

/// Failure while reading a log: either the bytes are wrong or the stream is.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error(transparent)]
    Corrupt(#[from] CorruptionError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
