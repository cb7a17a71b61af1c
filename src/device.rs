//! Block devices the merge writes to.
//!
//! I/O is synchronous and addressed in whole blocks.  Implementations
//! surface failures as `io::Error`; they never decide whether data is
//! corrupt.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub trait BlockDevice: Send {
    fn block_size(&self) -> u32;

    fn block_count(&self) -> u64;

    /// Read `count` blocks starting at `block`.
    fn read_blocks(&mut self, block: u64, count: u32) -> io::Result<Vec<u8>>;

    /// Write whole blocks starting at `block`.
    fn write_blocks(&mut self, block: u64, data: &[u8]) -> io::Result<()>;

    /// Make every completed write durable.
    fn flush(&mut self) -> io::Result<()>;
}

fn check_range(block_size: u32, block_count: u64, block: u64, len: usize) -> io::Result<()> {
    let bs = block_size as usize;
    if len % bs != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{len} bytes is not a whole number of {bs}-byte blocks"),
        ));
    }
    let end = block.checked_add((len / bs) as u64);
    if end.map_or(true, |end| end > block_count) {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("blocks {block}+{} beyond device end {block_count}", len / bs),
        ));
    }
    Ok(())
}

// ── File-backed device ──────────────────────────────────────────────────────

/// A regular file or raw block node used as a device.
pub struct FileDevice {
    file:        File,
    block_size:  u32,
    block_count: u64,
}

impl FileDevice {
    /// Open an existing image; trailing bytes short of a block are ignored.
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> io::Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "block size must be a power of two"));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let block_count = file.metadata()?.len() / block_size as u64;
        Ok(Self { file, block_size, block_count })
    }

    /// Create (or truncate) an image of `block_count` zeroed blocks.
    pub fn create(path: impl AsRef<Path>, block_size: u32, block_count: u64) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path.as_ref())?;
        file.set_len(block_count * block_size as u64)?;
        drop(file);
        Self::open(path, block_size)
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> u32 { self.block_size }

    fn block_count(&self) -> u64 { self.block_count }

    fn read_blocks(&mut self, block: u64, count: u32) -> io::Result<Vec<u8>> {
        let len = count as usize * self.block_size as usize;
        check_range(self.block_size, self.block_count, block, len)?;
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(block * self.block_size as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_blocks(&mut self, block: u64, data: &[u8]) -> io::Result<()> {
        check_range(self.block_size, self.block_count, block, data.len())?;
        self.file.seek(SeekFrom::Start(block * self.block_size as u64))?;
        self.file.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }
}

// ── In-memory device ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDevice {
    data:       Vec<u8>,
    block_size: u32,
}

impl MemoryDevice {
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self { data: vec![0u8; block_count as usize * block_size as usize], block_size }
    }

    /// Wrap an existing image.  `data` must be a whole number of blocks.
    pub fn from_bytes(block_size: u32, data: Vec<u8>) -> io::Result<Self> {
        if block_size == 0 || data.len() % block_size as usize != 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "image is not block aligned"));
        }
        Ok(Self { data, block_size })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Contents of one block.
    pub fn block(&self, index: u64) -> &[u8] {
        let bs = self.block_size as usize;
        let start = index as usize * bs;
        &self.data[start..start + bs]
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> u32 { self.block_size }

    fn block_count(&self) -> u64 { (self.data.len() / self.block_size as usize) as u64 }

    fn read_blocks(&mut self, block: u64, count: u32) -> io::Result<Vec<u8>> {
        let bs = self.block_size as usize;
        let len = count as usize * bs;
        check_range(self.block_size, self.block_count(), block, len)?;
        let start = block as usize * bs;
        Ok(self.data[start..start + len].to_vec())
    }

    fn write_blocks(&mut self, block: u64, data: &[u8]) -> io::Result<()> {
        check_range(self.block_size, self.block_count(), block, data.len())?;
        let start = block as usize * self.block_size as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
