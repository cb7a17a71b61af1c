//! COW log writer.
//!
//! [`CowWriter`] writes a valid header up front so a log can be read while
//! it is still growing.  Operations are appended in call order; a ClusterEnd
//! record is emitted automatically every `cluster_size` data records.  On
//! [`CowWriter::finalize`] an End record is appended and the header at offset
//! 0 is patched with the final op count and, if enabled, the BLAKE3 checksum
//! of everything after the header.
//!
//! v2 records cannot describe multi-block operations, so for v2 logs every
//! operation is split into one record per block.  Payloads that do not shrink
//! under the configured codec are stored verbatim.
//!
//! A cluster's Copy and Xor records may read at most
//! [`MAX_CLUSTER_STAGING`](crate::op::MAX_CLUSTER_STAGING) bytes of the base
//! device.  Larger copies are split into windows, and a cluster is closed
//! early when the next record would push it over the limit.

use std::io::{self, Seek, SeekFrom, Write};
use tracing::debug;

use crate::codec::{engine_for, CompressionAlgorithm, CompressionEngine};
use crate::extent::ExtentSet;
use crate::header::{CowHeader, FormatVersion};
use crate::op::{staging_limit_blocks, write_record, CowOperation, Record, MAX_PAYLOAD};

// ── Options ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub version:      FormatVersion,
    pub block_size:   u32,
    /// Data records per cluster; 0 leaves cluster boundaries to labels.
    pub cluster_size: u32,
    pub compression:  CompressionAlgorithm,
    pub level:        i32,
    /// Record a whole-file checksum on finalize.
    pub checksum:     bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            version:      FormatVersion::V3,
            block_size:   4096,
            cluster_size: 0,
            compression:  CompressionAlgorithm::None,
            level:        0,
            checksum:     true,
        }
    }
}

impl WriterOptions {
    /// Options for `compression` at its default level.
    pub fn compressed(compression: CompressionAlgorithm) -> Self {
        Self { compression, level: compression.default_level(), ..Self::default() }
    }
}

fn invalid_input(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}

// ── Writer ──────────────────────────────────────────────────────────────────

pub struct CowWriter<W: Write + Seek> {
    writer:         W,
    header:         CowHeader,
    engine:         Box<dyn CompressionEngine>,
    hasher:         blake3::Hasher,
    checksum:       bool,
    /// Destination blocks written so far; Copy may not read them.
    written:        ExtentSet,
    ops_written:    u64,
    cluster_ops:    u32,
    /// Blocks the open cluster's Copy and Xor records read.
    cluster_staged: u64,
    last_label:     Option<u64>,
}

impl<W: Write + Seek> CowWriter<W> {
    pub fn new(mut writer: W, options: WriterOptions) -> io::Result<Self> {
        let bs = options.block_size;
        if bs == 0 || !bs.is_power_of_two() {
            return Err(invalid_input(format!("block size {bs} is not a power of two")));
        }
        if options.cluster_size == 1 {
            return Err(invalid_input("cluster size must be 0 or at least 2"));
        }
        let header = CowHeader::new(options.version, bs, options.cluster_size, options.compression);
        if header.is_v2() && bs > u16::MAX as u32 {
            return Err(invalid_input("v2 logs need blocks that fit a 16-bit payload length"));
        }

        let mut engine = engine_for(options.compression, options.level);
        engine.init().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        writer.seek(SeekFrom::Start(0))?;
        header.write(&mut writer)?;

        Ok(Self {
            writer,
            header,
            engine,
            hasher:         blake3::Hasher::new(),
            checksum:       options.checksum,
            written:        ExtentSet::new(),
            ops_written:    0,
            cluster_ops:    0,
            cluster_staged: 0,
            last_label:     None,
        })
    }

    pub fn header(&self) -> &CowHeader {
        &self.header
    }

    /// Operation records written so far, boundaries included.
    pub fn ops_written(&self) -> u64 {
        self.ops_written
    }

    fn emit(&mut self, record: &Record) -> io::Result<()> {
        let mut buf = Vec::new();
        write_record(&mut buf, self.header.version, record)?;
        self.writer.write_all(&buf)?;
        self.hasher.update(&buf);
        if matches!(record, Record::Op(_)) {
            self.ops_written += 1;
        }
        Ok(())
    }

    fn emit_data(&mut self, op: CowOperation) -> io::Result<()> {
        let staged = op.staged_blocks();
        if staged > 0 && self.cluster_staged + staged > staging_limit_blocks(self.header.block_size) {
            self.end_cluster()?;
        }
        self.cluster_staged += staged;
        if let Some((start, end)) = op.dst_range() {
            self.written.insert(start, end);
        }
        self.emit(&Record::Op(op))?;
        self.cluster_ops += 1;
        if self.header.cluster_size != 0 && self.cluster_ops >= self.header.cluster_size {
            self.end_cluster()?;
        }
        Ok(())
    }

    /// Blocks per record: one for v2, as many as a payload allows for v3.
    fn chunk_blocks(&self) -> u64 {
        if self.header.is_v2() {
            1
        } else {
            (MAX_PAYLOAD as u64 / self.header.block_size as u64).max(1)
        }
    }

    fn blocks_in(&self, data: &[u8]) -> io::Result<u64> {
        let bs = self.header.block_size as usize;
        if data.is_empty() || data.len() % bs != 0 {
            return Err(invalid_input(format!(
                "payload of {} bytes is not a whole number of {bs}-byte blocks",
                data.len()
            )));
        }
        Ok((data.len() / bs) as u64)
    }

    /// Compress `raw`, keeping it verbatim when that is not smaller.
    fn pack(&self, raw: &[u8]) -> io::Result<(bool, Vec<u8>)> {
        if self.header.compression == CompressionAlgorithm::None {
            return Ok((false, raw.to_vec()));
        }
        let packed = self.engine.compress(raw).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let fits = !self.header.is_v2() || packed.len() <= u16::MAX as usize;
        if packed.len() < raw.len() && fits {
            Ok((true, packed))
        } else {
            Ok((false, raw.to_vec()))
        }
    }

    // ── Operations ──────────────────────────────────────────────────────────

    /// Copy `blocks` base-device blocks from `src` to `dst`.
    ///
    /// The source may not include any block an earlier operation in this log
    /// writes.
    pub fn add_copy(&mut self, dst: u64, src: u64, blocks: u32) -> io::Result<()> {
        if blocks == 0 {
            return Err(invalid_input("copy of zero blocks"));
        }
        let src_end = src.checked_add(blocks as u64).ok_or_else(|| invalid_input("copy source overflows"))?;
        let dst_end = dst.checked_add(blocks as u64).ok_or_else(|| invalid_input("copy target overflows"))?;
        if let Some(block) = self.written.first_overlap(src, src_end) {
            return Err(invalid_input(format!("copy reads block {block}, which this log already writes")));
        }
        if self.header.is_v2() {
            if blocks > 1 && src < dst_end && dst < src_end {
                return Err(invalid_input("overlapping multi-block copy cannot be split into v2 records"));
            }
            for i in 0..blocks as u64 {
                self.emit_data(CowOperation::Copy { dst: dst + i, src: src + i, blocks: 1 })?;
            }
            Ok(())
        } else {
            let window = staging_limit_blocks(self.header.block_size).min(u32::MAX as u64) as u32;
            let mut starts: Vec<u32> = (0..blocks).step_by(window as usize).collect();
            // Copying upwards, a window may not read blocks an earlier
            // window wrote, so emit from the top down.
            if dst > src {
                starts.reverse();
            }
            for offset in starts {
                let n = window.min(blocks - offset);
                let (dst, src) = (dst + offset as u64, src + offset as u64);
                self.emit_data(CowOperation::Copy { dst, src, blocks: n })?;
            }
            Ok(())
        }
    }

    /// Write `data` (whole blocks) at `dst`.
    pub fn add_replace(&mut self, dst: u64, data: &[u8]) -> io::Result<()> {
        self.add_payload(dst, data, false)
    }

    /// XOR `data` (whole blocks) into the blocks at `dst`.
    pub fn add_xor(&mut self, dst: u64, data: &[u8]) -> io::Result<()> {
        self.add_payload(dst, data, true)
    }

    fn add_payload(&mut self, dst: u64, data: &[u8], xor: bool) -> io::Result<()> {
        let total = self.blocks_in(data)?;
        dst.checked_add(total).ok_or_else(|| invalid_input("target range overflows"))?;
        let chunk = self.chunk_blocks();
        let bs = self.header.block_size as usize;

        let mut done = 0u64;
        while done < total {
            let n = chunk.min(total - done);
            let raw = &data[done as usize * bs..(done + n) as usize * bs];
            let (compressed, payload) = self.pack(raw)?;
            let (dst, blocks) = (dst + done, n as u32);
            let op = if xor {
                CowOperation::Xor { dst, blocks, compressed, payload }
            } else {
                CowOperation::Replace { dst, blocks, compressed, payload }
            };
            self.emit_data(op)?;
            done += n;
        }
        Ok(())
    }

    pub fn add_zero(&mut self, dst: u64, blocks: u32) -> io::Result<()> {
        if blocks == 0 {
            return Err(invalid_input("zero of zero blocks"));
        }
        dst.checked_add(blocks as u64).ok_or_else(|| invalid_input("target range overflows"))?;
        if self.header.is_v2() {
            for i in 0..blocks as u64 {
                self.emit_data(CowOperation::Zero { dst: dst + i, blocks: 1 })?;
            }
            Ok(())
        } else {
            self.emit_data(CowOperation::Zero { dst, blocks })
        }
    }

    /// Append a label.  Values must strictly increase.
    pub fn add_label(&mut self, value: u64) -> io::Result<()> {
        if let Some(prev) = self.last_label {
            if value <= prev {
                return Err(invalid_input(format!("label {value} does not follow label {prev}")));
            }
        }
        self.emit(&Record::Op(CowOperation::Label(value)))?;
        self.last_label = Some(value);
        self.cluster_ops = 0;
        self.cluster_staged = 0;
        Ok(())
    }

    /// Close the open cluster, if it holds any data records.
    pub fn end_cluster(&mut self) -> io::Result<()> {
        if self.cluster_ops == 0 {
            return Ok(());
        }
        self.emit(&Record::Op(CowOperation::ClusterEnd))?;
        self.cluster_ops = 0;
        self.cluster_staged = 0;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Stop without finalizing.  The log stays open-ended; anything after
    /// the last boundary is an unconfirmed tail to a reader.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }

    /// Append the End record, patch the header and return the sink.
    pub fn finalize(mut self) -> io::Result<W> {
        let op_count = self.ops_written;
        self.emit(&Record::End { op_count })?;
        let end = self.writer.stream_position()?;

        self.header.op_count = op_count;
        if self.checksum {
            self.header.checksum = Some(*self.hasher.finalize().as_bytes());
        }
        self.writer.seek(SeekFrom::Start(0))?;
        self.header.write(&mut self.writer)?;
        self.writer.seek(SeekFrom::Start(end))?;
        self.writer.flush()?;

        debug!(op_count, bytes = end, checksum = self.checksum, "COW log finalized");
        Ok(self.writer)
    }
}
