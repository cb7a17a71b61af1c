//! Durable merge progress.
//!
//! Two pieces of state survive a crash:
//!
//! - the [`MergeCheckpoint`], rewritten at every cluster boundary, which says
//!   how much of the log is known to be applied;
//! - the [`ScratchArea`], present only while a cluster is in flight, holding
//!   the device contents that the cluster's Copy and Xor operations read
//!   before anything in the cluster was written.
//!
//! [`FileCheckpointStore`] keeps the checkpoint as JSON and the scratch area
//! in a CRC32-protected binary sidecar.  Both are replaced with
//! write-fsync-rename so a reader sees either the old or the new file.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

const SCRATCH_MAGIC: u32 = 0x5243_5353; // "SSCR"

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Checkpoint decode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Scratch area is corrupt: {0}")]
    CorruptScratch(String),
}

// ── MergeCheckpoint ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCheckpoint {
    /// Last label applied, if any boundary so far was a label.
    pub label:            Option<u64>,
    /// Operations applied, counted from the start of the log.  Always sits
    /// just past a boundary.
    pub ops_merged:       u64,
    pub labels_completed: u64,
    /// Unix seconds.
    pub updated_at:       i64,
}

impl MergeCheckpoint {
    pub fn new(label: Option<u64>, ops_merged: u64, labels_completed: u64) -> Self {
        Self { label, ops_merged, labels_completed, updated_at: Utc::now().timestamp() }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ── ScratchArea ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScratchArea {
    /// Index of the first operation of the staged cluster.
    pub cluster_start: u64,
    /// Block index → contents, one block per entry.
    pub blocks:        BTreeMap<u64, Vec<u8>>,
}

impl ScratchArea {
    pub fn new(cluster_start: u64) -> Self {
        Self { cluster_start, blocks: BTreeMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, block: u64) -> Option<&[u8]> {
        self.blocks.get(&block).map(Vec::as_slice)
    }

    /// `magic | cluster_start | count | (block, len, bytes)* | crc32`
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(SCRATCH_MAGIC)?;
        buf.write_u64::<LittleEndian>(self.cluster_start)?;
        buf.write_u32::<LittleEndian>(self.blocks.len() as u32)?;
        for (block, data) in &self.blocks {
            buf.write_u64::<LittleEndian>(*block)?;
            buf.write_u32::<LittleEndian>(data.len() as u32)?;
            buf.write_all(data)?;
        }
        let crc = crc32fast::hash(&buf);
        buf.write_u32::<LittleEndian>(crc)?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let corrupt = |msg: &str| CheckpointError::CorruptScratch(msg.to_string());
        if bytes.len() < 20 {
            return Err(corrupt("too short"));
        }
        let (body, tail) = bytes.split_at(bytes.len() - 4);
        let stored = (&tail[..]).read_u32::<LittleEndian>()?;
        if crc32fast::hash(body) != stored {
            return Err(corrupt("crc32 mismatch"));
        }

        let mut r = body;
        if r.read_u32::<LittleEndian>()? != SCRATCH_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let cluster_start = r.read_u64::<LittleEndian>()?;
        let count = r.read_u32::<LittleEndian>()?;
        let mut blocks = BTreeMap::new();
        for _ in 0..count {
            let block = r.read_u64::<LittleEndian>()?;
            let len = r.read_u32::<LittleEndian>()? as usize;
            if len > r.len() {
                return Err(corrupt("entry runs past end"));
            }
            let mut data = vec![0u8; len];
            r.read_exact(&mut data)?;
            blocks.insert(block, data);
        }
        if !r.is_empty() {
            return Err(corrupt("trailing bytes"));
        }
        Ok(Self { cluster_start, blocks })
    }
}

// ── Store trait ─────────────────────────────────────────────────────────────

pub trait CheckpointStore: Send {
    fn load(&mut self) -> Result<Option<MergeCheckpoint>, CheckpointError>;
    fn persist(&mut self, checkpoint: &MergeCheckpoint) -> Result<(), CheckpointError>;
    fn load_scratch(&mut self) -> Result<Option<ScratchArea>, CheckpointError>;
    fn persist_scratch(&mut self, scratch: &ScratchArea) -> Result<(), CheckpointError>;
    fn clear_scratch(&mut self) -> Result<(), CheckpointError>;
}

// ── File store ──────────────────────────────────────────────────────────────

/// Checkpoint at `path` (JSON), scratch at `path` + `.scratch`.
pub struct FileCheckpointStore {
    path:    PathBuf,
    scratch: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut scratch = OsString::from(path.as_os_str());
        scratch.push(".scratch");
        Self { path, scratch: PathBuf::from(scratch) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scratch_path(&self) -> &Path {
        &self.scratch
    }
}

fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn sync_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if parent.as_os_str().is_empty() {
            return Ok(());
        }
        if parent.exists() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

/// Replace `path` with `bytes` via a synced temporary file.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut temp = OsString::from(path.as_os_str());
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, path)?;
    sync_parent(path)
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&mut self) -> Result<Option<MergeCheckpoint>, CheckpointError> {
        match read_optional(&self.path)? {
            Some(bytes) => Ok(Some(MergeCheckpoint::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn persist(&mut self, checkpoint: &MergeCheckpoint) -> Result<(), CheckpointError> {
        write_atomic(&self.path, &checkpoint.to_bytes()?)?;
        Ok(())
    }

    fn load_scratch(&mut self) -> Result<Option<ScratchArea>, CheckpointError> {
        match read_optional(&self.scratch)? {
            Some(bytes) => Ok(Some(ScratchArea::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn persist_scratch(&mut self, scratch: &ScratchArea) -> Result<(), CheckpointError> {
        write_atomic(&self.scratch, &scratch.to_bytes()?)?;
        Ok(())
    }

    fn clear_scratch(&mut self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.scratch) {
            Ok(()) => sync_parent(&self.scratch)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

// ── In-memory store ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryState {
    checkpoint: Option<MergeCheckpoint>,
    scratch:    Option<ScratchArea>,
}

/// Volatile store.  Clones share state, so a clone outlives a dropped
/// coordinator the way a file would.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint(&self) -> Option<MergeCheckpoint> {
        self.state.lock().checkpoint.clone()
    }

    pub fn scratch(&self) -> Option<ScratchArea> {
        self.state.lock().scratch.clone()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&mut self) -> Result<Option<MergeCheckpoint>, CheckpointError> {
        Ok(self.checkpoint())
    }

    fn persist(&mut self, checkpoint: &MergeCheckpoint) -> Result<(), CheckpointError> {
        self.state.lock().checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    fn load_scratch(&mut self) -> Result<Option<ScratchArea>, CheckpointError> {
        Ok(self.scratch())
    }

    fn persist_scratch(&mut self, scratch: &ScratchArea) -> Result<(), CheckpointError> {
        self.state.lock().scratch = Some(scratch.clone());
        Ok(())
    }

    fn clear_scratch(&mut self) -> Result<(), CheckpointError> {
        self.state.lock().scratch = None;
        Ok(())
    }
}
