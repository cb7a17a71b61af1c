//! COW log header.
//!
//! ```text
//! off  size  field
//!   0     4  magic                 "COW!" (LE u32 0x21574F43)
//!   4     2  major_version         2 or 3
//!   6     2  minor_version
//!   8     2  header_size           >= 68
//!  10     2  reserved
//!  12     4  block_size            power of two
//!  16     4  cluster_size          data ops per cluster, 0 = unclustered
//!  20     4  compression_algorithm see codec module
//!  24     4  feature_flags
//!  28     8  op_count              advisory, 0 while streaming
//!  36    32  checksum              BLAKE3 of the record region
//! ```
//!
//! All fields little-endian.  A header from a newer minor version may be
//! longer; the extra bytes are skipped as long as no unknown feature bit is
//! set.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::codec::CompressionAlgorithm;
use crate::error::{CorruptionError, ParseError};

pub const COW_MAGIC: u32 = 0x2157_4F43;
pub const VERSION_V2: u16 = 2;
pub const VERSION_V3: u16 = 3;
/// Highest minor version this build writes and fully understands.
pub const CURRENT_MINOR: u16 = 0;
pub const HEADER_SIZE: usize = 68;

/// The header carries a whole-file checksum.
pub const FEATURE_CHECKSUM: u32 = 1 << 0;
const KNOWN_FEATURES: u32 = FEATURE_CHECKSUM;

/// Format revision of a log.  Decides the record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    pub const V2: FormatVersion = FormatVersion { major: VERSION_V2, minor: CURRENT_MINOR };
    pub const V3: FormatVersion = FormatVersion { major: VERSION_V3, minor: CURRENT_MINOR };

    /// True when this log was written by a newer minor revision than ours.
    pub fn is_newer_minor(self) -> bool {
        self.minor > CURRENT_MINOR
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CowHeader {
    pub version:       FormatVersion,
    pub header_size:   u16,
    pub block_size:    u32,
    pub cluster_size:  u32,
    pub compression:   CompressionAlgorithm,
    pub feature_flags: u32,
    pub op_count:      u64,
    pub checksum:      Option<[u8; 32]>,
}

impl CowHeader {
    pub fn new(version: FormatVersion, block_size: u32, cluster_size: u32, compression: CompressionAlgorithm) -> Self {
        Self {
            version,
            header_size: HEADER_SIZE as u16,
            block_size,
            cluster_size,
            compression,
            feature_flags: 0,
            op_count: 0,
            checksum: None,
        }
    }

    pub fn is_v2(&self) -> bool {
        self.version.major == VERSION_V2
    }

    /// Write the header, padded to `header_size`.
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let flags = if self.checksum.is_some() {
            self.feature_flags | FEATURE_CHECKSUM
        } else {
            self.feature_flags & !FEATURE_CHECKSUM
        };
        writer.write_u32::<LittleEndian>(COW_MAGIC)?;
        writer.write_u16::<LittleEndian>(self.version.major)?;
        writer.write_u16::<LittleEndian>(self.version.minor)?;
        writer.write_u16::<LittleEndian>(self.header_size)?;
        writer.write_u16::<LittleEndian>(0)?;
        writer.write_u32::<LittleEndian>(self.block_size)?;
        writer.write_u32::<LittleEndian>(self.cluster_size)?;
        writer.write_u32::<LittleEndian>(self.compression.id())?;
        writer.write_u32::<LittleEndian>(flags)?;
        writer.write_u64::<LittleEndian>(self.op_count)?;
        writer.write_all(&self.checksum.unwrap_or([0u8; 32]))?;
        let pad = (self.header_size as usize).saturating_sub(HEADER_SIZE);
        if pad > 0 {
            writer.write_all(&vec![0u8; pad])?;
        }
        Ok(())
    }

    /// Read and validate a header, consuming exactly `header_size` bytes.
    /// A stream that ends inside the header is corruption, not an I/O error.
    pub fn read<R: Read>(mut reader: R) -> Result<Self, ParseError> {
        let mut fixed = [0u8; HEADER_SIZE];
        fill_header(&mut reader, &mut fixed)?;
        let mut r = &fixed[..];

        let magic = r.read_u32::<LittleEndian>()?;
        if magic != COW_MAGIC {
            return Err(CorruptionError::BadMagic(magic).into());
        }
        let major = r.read_u16::<LittleEndian>()?;
        let minor = r.read_u16::<LittleEndian>()?;
        if major != VERSION_V2 && major != VERSION_V3 {
            return Err(CorruptionError::UnsupportedVersion { major, minor }.into());
        }
        let version = FormatVersion { major, minor };

        let header_size = r.read_u16::<LittleEndian>()?;
        if (header_size as usize) < HEADER_SIZE {
            return Err(CorruptionError::HeaderTooSmall(header_size).into());
        }
        if header_size as usize > HEADER_SIZE && !version.is_newer_minor() {
            return Err(CorruptionError::UnsupportedVersion { major, minor }.into());
        }
        let _reserved = r.read_u16::<LittleEndian>()?;

        let block_size = r.read_u32::<LittleEndian>()?;
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(CorruptionError::InvalidBlockSize(block_size).into());
        }
        let cluster_size = r.read_u32::<LittleEndian>()?;
        if cluster_size == 1 {
            return Err(CorruptionError::InvalidClusterSize.into());
        }
        let algorithm_id = r.read_u32::<LittleEndian>()?;
        let compression = CompressionAlgorithm::from_id(algorithm_id)
            .ok_or(CorruptionError::UnknownCompression(algorithm_id))?;

        let feature_flags = r.read_u32::<LittleEndian>()?;
        if feature_flags & !KNOWN_FEATURES != 0 {
            return Err(CorruptionError::UnknownFeatures(feature_flags & !KNOWN_FEATURES).into());
        }
        let op_count = r.read_u64::<LittleEndian>()?;
        let mut sum = [0u8; 32];
        r.read_exact(&mut sum)?;
        let checksum = (feature_flags & FEATURE_CHECKSUM != 0).then_some(sum);

        // Fields appended by a newer minor revision.
        let extra = header_size as u64 - HEADER_SIZE as u64;
        if extra > 0 {
            let skipped = io::copy(&mut (&mut reader).take(extra), &mut io::sink())?;
            if skipped != extra {
                return Err(CorruptionError::TruncatedHeader {
                    expected:  header_size as usize,
                    available: HEADER_SIZE + skipped as usize,
                }
                .into());
            }
        }

        Ok(Self {
            version,
            header_size,
            block_size,
            cluster_size,
            compression,
            feature_flags,
            op_count,
            checksum,
        })
    }
}

/// Fill `buf` from `reader`; running out of bytes is a truncated header.
fn fill_header<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), ParseError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(CorruptionError::TruncatedHeader { expected: buf.len(), available: filled }.into());
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Parse a header from the front of `bytes`.
pub fn parse_header(bytes: &[u8]) -> Result<CowHeader, ParseError> {
    CowHeader::read(bytes)
}
