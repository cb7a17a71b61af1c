//! Operation records.
//!
//! Both revisions share the tag values and the flags byte; they differ in how
//! a record is framed.
//!
//! ## v2: fixed 20-byte records
//! ```text
//! off  size  field
//!   0     1  type
//!   1     1  flags          bit 0 = payload compressed
//!   2     2  data_length    payload bytes following the record
//!   4     8  new_block      destination block
//!  12     8  source         Copy source block, Label value, End op count
//! ```
//! Every data operation covers exactly one block.
//!
//! ## v3: prefixed records
//! ```text
//! off  size  field
//!   0     1  type
//!   1     1  flags
//!   2     2  body_len
//!   4     …  body (see `OpKind::v3_body_size`)
//! ```
//! Replace and Xor carry `payload_len` bytes of payload after the body.  A
//! log from a newer minor revision may append fields to a body; anything past
//! the fields known here is skipped.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{CorruptionError, ParseError};
use crate::header::{CowHeader, FormatVersion, VERSION_V2};

pub const FLAG_COMPRESSED: u8 = 0x01;
pub const V2_RECORD_SIZE: usize = 20;
pub const V3_PREFIX_SIZE: usize = 4;
/// Upper bound on a single payload, compressed or not.
pub const MAX_PAYLOAD: usize = 64 << 20;
/// Upper bound on the base-device bytes one cluster's Copy and Xor
/// operations may read.  The merge stages all of them before the cluster's
/// first write.
pub const MAX_CLUSTER_STAGING: u64 = 64 << 20;

/// [`MAX_CLUSTER_STAGING`] in blocks of `block_size`; never less than one.
pub fn staging_limit_blocks(block_size: u32) -> u64 {
    (MAX_CLUSTER_STAGING / block_size.max(1) as u64).max(1)
}

// ── Operation kinds ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    Copy       = 1,
    Replace    = 2,
    Zero       = 3,
    Label      = 4,
    ClusterEnd = 5,
    Xor        = 6,
    /// Terminates a finalized log.  Never surfaced as an operation.
    End        = 0xFF,
}

impl OpKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1    => Some(OpKind::Copy),
            2    => Some(OpKind::Replace),
            3    => Some(OpKind::Zero),
            4    => Some(OpKind::Label),
            5    => Some(OpKind::ClusterEnd),
            6    => Some(OpKind::Xor),
            0xFF => Some(OpKind::End),
            _    => None,
        }
    }

    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Body size of a v3 record of this kind, payload excluded.
    pub fn v3_body_size(self) -> usize {
        match self {
            OpKind::Copy       => 20,
            OpKind::Replace    => 16,
            OpKind::Xor        => 16,
            OpKind::Zero       => 12,
            OpKind::Label      => 8,
            OpKind::ClusterEnd => 0,
            OpKind::End        => 8,
        }
    }

    pub fn has_payload(self) -> bool {
        matches!(self, OpKind::Replace | OpKind::Xor)
    }

    pub fn name(self) -> &'static str {
        match self {
            OpKind::Copy       => "copy",
            OpKind::Replace    => "replace",
            OpKind::Zero       => "zero",
            OpKind::Label      => "label",
            OpKind::ClusterEnd => "cluster-end",
            OpKind::Xor        => "xor",
            OpKind::End        => "end",
        }
    }
}

/// On-disk size of a record, payload excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSize {
    Fixed(usize),
    /// The prefix must be read before the body length is known.
    Prefixed { prefix: usize, body: usize },
}

impl RecordSize {
    pub fn total(self) -> usize {
        match self {
            RecordSize::Fixed(n)                => n,
            RecordSize::Prefixed { prefix, body } => prefix + body,
        }
    }
}

pub fn operation_size(version: FormatVersion, kind: OpKind) -> RecordSize {
    if version.major == VERSION_V2 {
        RecordSize::Fixed(V2_RECORD_SIZE)
    } else {
        RecordSize::Prefixed { prefix: V3_PREFIX_SIZE, body: kind.v3_body_size() }
    }
}

// ── CowOperation ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CowOperation {
    /// Copy `blocks` blocks of the base device from `src` to `dst`.
    Copy { dst: u64, src: u64, blocks: u32 },
    Replace { dst: u64, blocks: u32, compressed: bool, payload: Vec<u8> },
    Zero { dst: u64, blocks: u32 },
    /// XOR the payload into the existing contents of `dst`.
    Xor { dst: u64, blocks: u32, compressed: bool, payload: Vec<u8> },
    Label(u64),
    ClusterEnd,
}

impl CowOperation {
    pub fn kind(&self) -> OpKind {
        match self {
            CowOperation::Copy { .. }    => OpKind::Copy,
            CowOperation::Replace { .. } => OpKind::Replace,
            CowOperation::Zero { .. }    => OpKind::Zero,
            CowOperation::Xor { .. }     => OpKind::Xor,
            CowOperation::Label(_)       => OpKind::Label,
            CowOperation::ClusterEnd     => OpKind::ClusterEnd,
        }
    }

    /// Label and ClusterEnd close a cluster.
    pub fn is_boundary(&self) -> bool {
        matches!(self, CowOperation::Label(_) | CowOperation::ClusterEnd)
    }

    pub fn is_data(&self) -> bool {
        !self.is_boundary()
    }

    /// Copy and Xor read the device before writing it.
    pub fn reads_base(&self) -> bool {
        matches!(self, CowOperation::Copy { .. } | CowOperation::Xor { .. })
    }

    /// Blocks this operation needs staged before its cluster is applied.
    pub fn staged_blocks(&self) -> u64 {
        if self.reads_base() {
            self.blocks() as u64
        } else {
            0
        }
    }

    pub fn blocks(&self) -> u32 {
        match self {
            CowOperation::Copy { blocks, .. }
            | CowOperation::Replace { blocks, .. }
            | CowOperation::Zero { blocks, .. }
            | CowOperation::Xor { blocks, .. } => *blocks,
            _ => 0,
        }
    }

    /// Destination range `[start, end)` in blocks.
    pub fn dst_range(&self) -> Option<(u64, u64)> {
        match self {
            CowOperation::Copy { dst, blocks, .. }
            | CowOperation::Replace { dst, blocks, .. }
            | CowOperation::Zero { dst, blocks }
            | CowOperation::Xor { dst, blocks, .. } => Some((*dst, dst.saturating_add(*blocks as u64))),
            _ => None,
        }
    }
}

/// A decoded record.  End is kept apart because it never reaches the
/// operation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Op(CowOperation),
    End { op_count: u64 },
}

// ── Encoding ────────────────────────────────────────────────────────────────

fn payload_len(payload: &[u8]) -> io::Result<u32> {
    if payload.len() > MAX_PAYLOAD {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "payload exceeds 64 MiB"));
    }
    Ok(payload.len() as u32)
}

/// Encode one record.  v2 records can only describe single-block operations.
pub fn encode_record(version: FormatVersion, record: &Record) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(V2_RECORD_SIZE);
    write_record(&mut buf, version, record)?;
    Ok(buf)
}

/// Write one record; returns the number of bytes written.
pub fn write_record<W: Write>(mut writer: W, version: FormatVersion, record: &Record) -> io::Result<u64> {
    if version.major == VERSION_V2 {
        write_v2(&mut writer, record)
    } else {
        write_v3(&mut writer, record)
    }
}

fn write_v2<W: Write>(w: &mut W, record: &Record) -> io::Result<u64> {
    const NONE: &[u8] = &[];
    let (kind, flags, dst, source, payload): (OpKind, u8, u64, u64, &[u8]) = match record {
        Record::End { op_count } => (OpKind::End, 0, 0, *op_count, NONE),
        Record::Op(op) => {
            if op.is_data() && op.blocks() != 1 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "v2 records cover exactly one block",
                ));
            }
            match op {
                CowOperation::Copy { dst, src, .. } => (OpKind::Copy, 0, *dst, *src, NONE),
                CowOperation::Replace { dst, compressed, payload, .. } => {
                    (OpKind::Replace, compressed_flag(*compressed), *dst, 0, payload.as_slice())
                }
                CowOperation::Xor { dst, compressed, payload, .. } => {
                    (OpKind::Xor, compressed_flag(*compressed), *dst, 0, payload.as_slice())
                }
                CowOperation::Zero { dst, .. } => (OpKind::Zero, 0, *dst, 0, NONE),
                CowOperation::Label(value) => (OpKind::Label, 0, 0, *value, NONE),
                CowOperation::ClusterEnd => (OpKind::ClusterEnd, 0, 0, 0, NONE),
            }
        }
    };
    let data_length = u16::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "v2 payload exceeds 65535 bytes"))?;
    w.write_u8(kind.tag())?;
    w.write_u8(flags)?;
    w.write_u16::<LittleEndian>(data_length)?;
    w.write_u64::<LittleEndian>(dst)?;
    w.write_u64::<LittleEndian>(source)?;
    w.write_all(payload)?;
    Ok((V2_RECORD_SIZE + payload.len()) as u64)
}

fn write_v3<W: Write>(w: &mut W, record: &Record) -> io::Result<u64> {
    let kind = match record {
        Record::End { .. } => OpKind::End,
        Record::Op(op) => op.kind(),
    };
    let flags = match record {
        Record::Op(CowOperation::Replace { compressed, .. })
        | Record::Op(CowOperation::Xor { compressed, .. }) => compressed_flag(*compressed),
        _ => 0,
    };
    w.write_u8(kind.tag())?;
    w.write_u8(flags)?;
    w.write_u16::<LittleEndian>(kind.v3_body_size() as u16)?;

    let mut payload_bytes = 0usize;
    match record {
        Record::End { op_count } => w.write_u64::<LittleEndian>(*op_count)?,
        Record::Op(CowOperation::Copy { dst, src, blocks }) => {
            w.write_u64::<LittleEndian>(*dst)?;
            w.write_u64::<LittleEndian>(*src)?;
            w.write_u32::<LittleEndian>(*blocks)?;
        }
        Record::Op(CowOperation::Replace { dst, blocks, payload, .. })
        | Record::Op(CowOperation::Xor { dst, blocks, payload, .. }) => {
            w.write_u64::<LittleEndian>(*dst)?;
            w.write_u32::<LittleEndian>(*blocks)?;
            w.write_u32::<LittleEndian>(payload_len(payload)?)?;
            w.write_all(payload)?;
            payload_bytes = payload.len();
        }
        Record::Op(CowOperation::Zero { dst, blocks }) => {
            w.write_u64::<LittleEndian>(*dst)?;
            w.write_u32::<LittleEndian>(*blocks)?;
        }
        Record::Op(CowOperation::Label(value)) => w.write_u64::<LittleEndian>(*value)?,
        Record::Op(CowOperation::ClusterEnd) => {}
    }
    Ok((V3_PREFIX_SIZE + kind.v3_body_size() + payload_bytes) as u64)
}

#[inline]
fn compressed_flag(compressed: bool) -> u8 {
    if compressed { FLAG_COMPRESSED } else { 0 }
}

// ── Decoding ────────────────────────────────────────────────────────────────

/// Outcome of reading one record.
#[derive(Debug)]
pub enum Decoded {
    Record { record: Record, len: u64 },
    /// The stream ended inside a record.
    Truncated { available: u64 },
    /// The stream ended cleanly on a record boundary.
    Eof,
}

/// Fill `buf` as far as the stream allows.
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

/// Read `len` payload bytes; `None` if the stream ends first.
fn read_payload<R: Read>(reader: &mut R, len: usize) -> io::Result<Option<Vec<u8>>> {
    let mut payload = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut payload)?;
    Ok((payload.len() == len).then_some(payload))
}

/// Check the declared payload against the block span and header.
fn check_payload(
    header:     &CowHeader,
    offset:     u64,
    blocks:     u32,
    compressed: bool,
    len:        usize,
) -> Result<(), CorruptionError> {
    let expanded = blocks as u64 * header.block_size as u64;
    if len > MAX_PAYLOAD || expanded > MAX_PAYLOAD as u64 {
        return Err(CorruptionError::invalid(offset, "payload exceeds 64 MiB"));
    }
    if !compressed && len as u64 != expanded {
        return Err(CorruptionError::invalid(
            offset,
            format!("uncompressed payload of {len} bytes for {blocks} block(s)"),
        ));
    }
    Ok(())
}

fn check_flags(kind: OpKind, flags: u8, offset: u64) -> Result<bool, CorruptionError> {
    let allowed = if kind.has_payload() { FLAG_COMPRESSED } else { 0 };
    if flags & !allowed != 0 {
        return Err(CorruptionError::invalid(
            offset,
            format!("flags {flags:#04x} not valid for {}", kind.name()),
        ));
    }
    Ok(flags & FLAG_COMPRESSED != 0)
}

fn check_span(offset: u64, start: u64, blocks: u32) -> Result<(), CorruptionError> {
    if blocks == 0 {
        return Err(CorruptionError::invalid(offset, "operation covers zero blocks"));
    }
    if start.checked_add(blocks as u64).is_none() {
        return Err(CorruptionError::invalid(offset, "block range overflows"));
    }
    Ok(())
}

/// Read the record starting at `offset`.
///
/// A stream that ends inside the record is reported as [`Decoded::Truncated`];
/// every other malformation is corruption.
pub fn read_record<R: Read>(reader: &mut R, header: &CowHeader, offset: u64) -> Result<Decoded, ParseError> {
    if header.is_v2() {
        read_v2(reader, header, offset)
    } else {
        read_v3(reader, header, offset)
    }
}

fn read_v2<R: Read>(reader: &mut R, header: &CowHeader, offset: u64) -> Result<Decoded, ParseError> {
    let mut buf = [0u8; V2_RECORD_SIZE];
    let n = read_full(reader, &mut buf)?;
    if n == 0 {
        return Ok(Decoded::Eof);
    }
    if n < V2_RECORD_SIZE {
        return Ok(Decoded::Truncated { available: n as u64 });
    }
    let tag = buf[0];
    let kind = OpKind::from_tag(tag).ok_or(CorruptionError::UnknownOpType { offset, tag })?;
    let compressed = check_flags(kind, buf[1], offset)?;
    let data_length = LittleEndian::read_u16(&buf[2..4]) as usize;
    let new_block = LittleEndian::read_u64(&buf[4..12]);
    let source = LittleEndian::read_u64(&buf[12..20]);

    if !kind.has_payload() && data_length != 0 {
        return Err(CorruptionError::invalid(offset, format!("{} carries a payload", kind.name())).into());
    }

    let record = match kind {
        OpKind::Copy => {
            check_span(offset, new_block, 1)?;
            check_span(offset, source, 1)?;
            Record::Op(CowOperation::Copy { dst: new_block, src: source, blocks: 1 })
        }
        OpKind::Zero => {
            check_span(offset, new_block, 1)?;
            Record::Op(CowOperation::Zero { dst: new_block, blocks: 1 })
        }
        OpKind::Replace | OpKind::Xor => {
            check_span(offset, new_block, 1)?;
            check_payload(header, offset, 1, compressed, data_length)?;
            let payload = match read_payload(reader, data_length)? {
                Some(p) => p,
                None => return Ok(Decoded::Truncated { available: V2_RECORD_SIZE as u64 }),
            };
            let op = if kind == OpKind::Replace {
                CowOperation::Replace { dst: new_block, blocks: 1, compressed, payload }
            } else {
                CowOperation::Xor { dst: new_block, blocks: 1, compressed, payload }
            };
            Record::Op(op)
        }
        OpKind::Label      => Record::Op(CowOperation::Label(source)),
        OpKind::ClusterEnd => Record::Op(CowOperation::ClusterEnd),
        OpKind::End        => Record::End { op_count: source },
    };
    Ok(Decoded::Record { record, len: (V2_RECORD_SIZE + data_length) as u64 })
}

fn read_v3<R: Read>(reader: &mut R, header: &CowHeader, offset: u64) -> Result<Decoded, ParseError> {
    let mut prefix = [0u8; V3_PREFIX_SIZE];
    let n = read_full(reader, &mut prefix)?;
    if n == 0 {
        return Ok(Decoded::Eof);
    }
    if n < V3_PREFIX_SIZE {
        return Ok(Decoded::Truncated { available: n as u64 });
    }
    let tag = prefix[0];
    let kind = OpKind::from_tag(tag).ok_or(CorruptionError::UnknownOpType { offset, tag })?;
    let compressed = check_flags(kind, prefix[1], offset)?;
    let body_len = LittleEndian::read_u16(&prefix[2..4]) as usize;
    let known = kind.v3_body_size();
    if body_len < known || (body_len > known && !header.version.is_newer_minor()) {
        return Err(CorruptionError::invalid(
            offset,
            format!("{} body of {body_len} bytes, expected {known}", kind.name()),
        )
        .into());
    }

    let mut body = vec![0u8; body_len];
    let got = read_full(reader, &mut body)?;
    if got < body_len {
        return Ok(Decoded::Truncated { available: (V3_PREFIX_SIZE + got) as u64 });
    }
    let mut len = (V3_PREFIX_SIZE + body_len) as u64;

    let record = match kind {
        OpKind::Copy => {
            let dst = LittleEndian::read_u64(&body[0..8]);
            let src = LittleEndian::read_u64(&body[8..16]);
            let blocks = LittleEndian::read_u32(&body[16..20]);
            check_span(offset, dst, blocks)?;
            check_span(offset, src, blocks)?;
            Record::Op(CowOperation::Copy { dst, src, blocks })
        }
        OpKind::Replace | OpKind::Xor => {
            let dst = LittleEndian::read_u64(&body[0..8]);
            let blocks = LittleEndian::read_u32(&body[8..12]);
            let payload_len = LittleEndian::read_u32(&body[12..16]) as usize;
            check_span(offset, dst, blocks)?;
            check_payload(header, offset, blocks, compressed, payload_len)?;
            let payload = match read_payload(reader, payload_len)? {
                Some(p) => p,
                None => return Ok(Decoded::Truncated { available: len }),
            };
            len += payload_len as u64;
            let op = if kind == OpKind::Replace {
                CowOperation::Replace { dst, blocks, compressed, payload }
            } else {
                CowOperation::Xor { dst, blocks, compressed, payload }
            };
            Record::Op(op)
        }
        OpKind::Zero => {
            let dst = LittleEndian::read_u64(&body[0..8]);
            let blocks = LittleEndian::read_u32(&body[8..12]);
            check_span(offset, dst, blocks)?;
            Record::Op(CowOperation::Zero { dst, blocks })
        }
        OpKind::Label      => Record::Op(CowOperation::Label(LittleEndian::read_u64(&body[0..8]))),
        OpKind::ClusterEnd => Record::Op(CowOperation::ClusterEnd),
        OpKind::End        => Record::End { op_count: LittleEndian::read_u64(&body[0..8]) },
    };
    Ok(Decoded::Record { record, len })
}
