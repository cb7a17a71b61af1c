//! Sequential, resumable COW log parser.
//!
//! # Confirmed prefix
//! Label, ClusterEnd and End records are boundaries.  Everything up to and
//! including the last boundary is the confirmed prefix and is returned as the
//! operation list.  Operations after it belong to a cluster that was still
//! being written when the stream ended; they are dropped and reported as a
//! [`TruncatedTail`] so they are never replayed partially.
//!
//! # Truncated versus corrupt
//! A record is truncated when the stream ends before the bytes it declares
//! (prefix, body or payload) have been read.  Parsing stops there.  Any other
//! structural fault is a [`CorruptionError`], regardless of whether it sits in
//! the confirmed prefix or in the tail.
//!
//! # Log-level rules
//! - labels strictly increase
//! - a Copy never reads a block an earlier operation in the log writes
//! - a cluster holds at most `cluster_size` data operations (when non-zero)
//! - the Copy and Xor operations of one cluster read at most
//!   [`MAX_CLUSTER_STAGING`](crate::op::MAX_CLUSTER_STAGING) bytes of the
//!   base device
//! - an End record matches the op count, is the last thing in the stream and,
//!   with the checksum feature, seals a matching BLAKE3 digest

use std::io::{self, Read};
use tracing::{debug, warn};

use crate::codec::CompressionAlgorithm;
use crate::error::{CorruptionError, ParseError};
use crate::extent::ExtentSet;
use crate::header::CowHeader;
use crate::op::{read_record, staging_limit_blocks, CowOperation, Decoded, Record};

// ── Result types ────────────────────────────────────────────────────────────

/// Unconfirmed trailing data dropped by the parser.  Not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncatedTail {
    /// File offset of the first dropped byte.
    pub offset:            u64,
    /// Complete operations dropped because no boundary followed them.
    pub discarded_ops:     usize,
    /// The stream ended inside a record.
    pub incomplete_record: bool,
}

#[derive(Debug, Clone)]
pub struct ParsedCow {
    pub header:         CowHeader,
    /// Confirmed operations in log order, boundaries included.
    pub ops:            Vec<CowOperation>,
    pub algorithm:      CompressionAlgorithm,
    /// Highest label in the confirmed prefix.
    pub last_label:     Option<u64>,
    /// Index of the first operation after the resume label (0 without one).
    pub resume_index:   usize,
    pub truncated:      Option<TruncatedTail>,
    /// The log ends with a valid End record.
    pub finalized:      bool,
    /// Bytes from the start of the stream through the last confirmed record.
    pub bytes_consumed: u64,
}

impl ParsedCow {
    /// Number of data operations (boundaries excluded).
    pub fn data_ops(&self) -> usize {
        self.ops.iter().filter(|op| op.is_data()).count()
    }

    /// Confirmed label values in order.
    pub fn labels(&self) -> Vec<u64> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                CowOperation::Label(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    /// Index just past label `value`, if the confirmed prefix holds it.
    pub fn index_after_label(&self, value: u64) -> Option<usize> {
        self.ops
            .iter()
            .position(|op| *op == CowOperation::Label(value))
            .map(|i| i + 1)
    }

    /// Whether `index` sits on a cluster boundary (just after one, or at 0).
    pub fn is_boundary_index(&self, index: usize) -> bool {
        index == 0 || self.ops.get(index - 1).map_or(false, |op| op.is_boundary())
    }
}

// ── Parser ──────────────────────────────────────────────────────────────────

/// Feeds everything read after the header into the checksum.
struct HashingReader<R> {
    inner:  R,
    hasher: blake3::Hasher,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CowParser {
    resume_label: Option<u64>,
}

impl CowParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after a previously confirmed label.  The whole log is still
    /// read and validated; the label must be present in the confirmed prefix.
    pub fn resume_from(mut self, label: u64) -> Self {
        self.resume_label = Some(label);
        self
    }

    pub fn parse_bytes(&self, bytes: &[u8]) -> Result<ParsedCow, ParseError> {
        self.parse(bytes)
    }

    pub fn parse<R: Read>(&self, mut reader: R) -> Result<ParsedCow, ParseError> {
        let header = CowHeader::read(&mut reader)?;
        let mut reader = HashingReader { inner: reader, hasher: blake3::Hasher::new() };

        let mut offset           = header.header_size as u64;
        let mut ops              = Vec::new();
        let mut written          = ExtentSet::new();
        let mut last_label       = None::<u64>;
        let mut resume_index     = None::<usize>;
        let mut cluster_data     = 0u32;
        let mut cluster_staged   = 0u64;
        let staging_limit        = staging_limit_blocks(header.block_size);
        let mut confirmed        = 0usize;
        let mut confirmed_offset = offset;
        let mut end_count        = None::<u64>;
        let mut incomplete       = false;

        loop {
            let (record, len) = match read_record(&mut reader, &header, offset)? {
                Decoded::Eof => break,
                Decoded::Truncated { available } => {
                    debug!(offset, available, "record cut short by end of stream");
                    incomplete = true;
                    break;
                }
                Decoded::Record { record, len } => (record, len),
            };

            let op = match record {
                Record::End { op_count } => {
                    let actual = ops.len() as u64;
                    if op_count != actual {
                        return Err(CorruptionError::OpCountMismatch { declared: op_count, actual }.into());
                    }
                    offset += len;
                    let mut extra = [0u8; 1];
                    if reader.read(&mut extra)? != 0 {
                        return Err(CorruptionError::TrailingData(offset).into());
                    }
                    end_count = Some(op_count);
                    confirmed = ops.len();
                    confirmed_offset = offset;
                    break;
                }
                Record::Op(op) => op,
            };

            match &op {
                CowOperation::Label(value) => {
                    if let Some(previous) = last_label {
                        if *value <= previous {
                            return Err(CorruptionError::NonIncreasingLabel { offset, previous, label: *value }.into());
                        }
                    }
                    last_label = Some(*value);
                    if self.resume_label == Some(*value) {
                        resume_index = Some(ops.len() + 1);
                    }
                }
                CowOperation::ClusterEnd => {}
                data => {
                    if let CowOperation::Copy { src, blocks, .. } = data {
                        let src_end = src + *blocks as u64;
                        if let Some(block) = written.first_overlap(*src, src_end) {
                            return Err(CorruptionError::ForwardDependency { offset, block }.into());
                        }
                    }
                    cluster_data += 1;
                    if header.cluster_size != 0 && cluster_data > header.cluster_size {
                        return Err(CorruptionError::OversizedCluster { offset, cluster_size: header.cluster_size }.into());
                    }
                    cluster_staged += data.staged_blocks();
                    if cluster_staged > staging_limit {
                        return Err(CorruptionError::StagingLimit {
                            op_index: ops.len(),
                            blocks:   cluster_staged,
                            limit:    staging_limit,
                        }
                        .into());
                    }
                    if let Some((start, end)) = data.dst_range() {
                        written.insert(start, end);
                    }
                }
            }

            let boundary = op.is_boundary();
            ops.push(op);
            offset += len;
            if boundary {
                cluster_data = 0;
                cluster_staged = 0;
                confirmed = ops.len();
                confirmed_offset = offset;
            }
        }

        match (end_count, header.checksum) {
            (None, Some(_)) => return Err(CorruptionError::MissingEndRecord.into()),
            (Some(_), Some(expected)) => {
                if *reader.hasher.finalize().as_bytes() != expected {
                    return Err(CorruptionError::ChecksumMismatch.into());
                }
            }
            _ => {}
        }
        if let Some(actual) = end_count {
            if header.op_count != 0 && header.op_count != actual {
                return Err(CorruptionError::OpCountMismatch { declared: header.op_count, actual }.into());
            }
        }

        let discarded_ops = ops.len() - confirmed;
        ops.truncate(confirmed);
        let truncated = (discarded_ops > 0 || incomplete).then(|| TruncatedTail {
            offset: confirmed_offset,
            discarded_ops,
            incomplete_record: incomplete,
        });
        if let Some(tail) = &truncated {
            warn!(
                offset = tail.offset,
                discarded_ops = tail.discarded_ops,
                incomplete_record = tail.incomplete_record,
                "discarding unconfirmed tail of COW log"
            );
        }

        let resume_index = match self.resume_label {
            Some(label) => resume_index.ok_or(CorruptionError::ResumeLabelNotFound(label))?,
            None => 0,
        };

        debug!(
            ops = ops.len(),
            last_label = ?last_label,
            finalized = end_count.is_some(),
            "COW log parsed"
        );

        Ok(ParsedCow {
            algorithm: header.compression,
            header,
            ops,
            last_label,
            resume_index,
            truncated,
            finalized: end_count.is_some(),
            bytes_consumed: confirmed_offset,
        })
    }
}

/// Parse `reader`, optionally resuming after `resume_label`.
pub fn parse_cow<R: Read>(reader: R, resume_label: Option<u64>) -> Result<ParsedCow, ParseError> {
    let parser = match resume_label {
        Some(label) => CowParser::new().resume_from(label),
        None => CowParser::new(),
    };
    parser.parse(reader)
}
