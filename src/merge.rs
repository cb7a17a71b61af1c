//! Merge engine: replays a parsed COW log onto the base device.
//!
//! # Model
//! [`MergeCoordinator`] is a resumable state object.  Its position is an
//! operation cursor that only ever rests just past a cluster boundary.
//! [`MergeCoordinator::step`] applies one whole cluster and then makes it
//! durable (flush the device, persist the checkpoint, drop the scratch area);
//! [`MergeCoordinator::run`] steps until the log is exhausted or the caller
//! cancels.  A crash anywhere inside a cluster is recovered by applying that
//! cluster again from the start.
//!
//! # Re-applying a cluster
//! Replace and Zero are idempotent on their own.  Copy and Xor read the
//! device, and the blocks they read may already have been overwritten by a
//! partial earlier attempt.  Before the first write of a cluster containing
//! either, the blocks they read are staged in a [`ScratchArea`] and
//! persisted.  Every attempt at that cluster reads from the staged copy, so
//! all attempts write the same bytes.  A cluster stages at most
//! [`MAX_CLUSTER_STAGING`](crate::op::MAX_CLUSTER_STAGING) bytes; larger
//! clusters are rejected before the merge starts.
//!
//! # Failures
//! Device I/O is retried `io_retries` times; after that the step fails with
//! [`MergeError::Io`] and the coordinator stays resumable.  Corruption is
//! fatal and sticky: once seen, every later step reports it again.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointError, CheckpointStore, MergeCheckpoint, ScratchArea};
use crate::codec::{open_engine, CodecError, CompressionEngine};
use crate::device::BlockDevice;
use crate::error::CorruptionError;
use crate::header::CowHeader;
use crate::lifecycle::{DeviceHandle, DeviceLifecycleManager, MappingError};
use crate::op::{staging_limit_blocks, CowOperation};
use crate::parser::ParsedCow;

/// Zero operations are written in pieces of at most this many blocks.
const ZERO_CHUNK_BLOCKS: u64 = 256;

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Extra attempts after a failed device read, write or flush.
    pub io_retries:       u32,
    pub retry_backoff_ms: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self { io_retries: 3, retry_backoff_ms: 10 }
    }
}

impl MergeConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    fn backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum MergeError {
    /// The log cannot be trusted.  Never retry.
    #[error("Corrupt COW log: {0}")]
    Corruption(#[from] CorruptionError),
    #[error("I/O failure at operation {op_index} after {attempts} attempt(s): {source}")]
    Io {
        op_index: usize,
        attempts: u32,
        #[source]
        source:   io::Error,
    },
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl MergeError {
    /// Whether running the merge again later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            MergeError::Io { .. } | MergeError::Mapping(_) => true,
            MergeError::Checkpoint(CheckpointError::Io(_)) => true,
            MergeError::Corruption(_) | MergeError::Codec(_) | MergeError::Checkpoint(_) => false,
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, MergeError::Corruption(_))
    }
}

// ── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    NotStarted,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// One cluster applied and made durable.
    Progressed { ops: usize },
    /// Everything confirmed is applied, but the log has an unconfirmed tail;
    /// the rest arrives with a later version of the log.
    AwaitingLog,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    AwaitingLog,
    /// Stopped at a cluster boundary on request.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeProgress {
    pub state:            MergeState,
    pub labels_completed: u64,
    pub last_label:       Option<u64>,
    pub ops_merged:       u64,
    pub total_ops:        u64,
}

impl MergeProgress {
    pub fn percent(&self) -> f64 {
        if self.total_ops == 0 {
            return 100.0;
        }
        self.ops_merged as f64 * 100.0 / self.total_ops as f64
    }
}

/// Shared stop flag, checked between clusters.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Finalizer {
    manager: Arc<DeviceLifecycleManager>,
    promote: Option<DeviceHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Position {
    cursor:           usize,
    labels_completed: u64,
    last_label:       Option<u64>,
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Run `f` against the device, retrying I/O failures.
fn with_retry<D: BlockDevice, T>(
    config:   &MergeConfig,
    device:   &mut D,
    op_index: usize,
    what:     &'static str,
    mut f:    impl FnMut(&mut D) -> io::Result<T>,
) -> Result<T, MergeError> {
    let attempts = config.io_retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        match f(device) {
            Ok(v) => return Ok(v),
            Err(source) if attempt >= attempts => {
                error!(op_index, attempts, error = %source, "device {what} failed; giving up");
                return Err(MergeError::Io { op_index, attempts, source });
            }
            Err(e) => {
                warn!(op_index, attempt, error = %e, "device {what} failed; retrying");
                thread::sleep(config.backoff());
                attempt += 1;
            }
        }
    }
}

fn xor_into(base: &mut [u8], delta: &[u8]) {
    for (b, d) in base.iter_mut().zip(delta) {
        *b ^= d;
    }
}

fn label_prefix(ops: &[CowOperation]) -> (u64, Option<u64>) {
    let mut count = 0;
    let mut last = None;
    for op in ops {
        if let CowOperation::Label(v) = op {
            count += 1;
            last = Some(*v);
        }
    }
    (count, last)
}

/// Find where to continue: the persisted checkpoint if there is one,
/// otherwise the parser's resume point.
fn locate(parsed: &ParsedCow, checkpoint: Option<&MergeCheckpoint>) -> Result<Position, CorruptionError> {
    let cursor = match checkpoint {
        Some(cp) => {
            let cursor = usize::try_from(cp.ops_merged).unwrap_or(usize::MAX);
            if cursor > parsed.ops.len() {
                return Err(CorruptionError::CheckpointMismatch(format!(
                    "{} operations merged but the log confirms only {}",
                    cp.ops_merged,
                    parsed.ops.len()
                )));
            }
            if !parsed.is_boundary_index(cursor) {
                return Err(CorruptionError::CheckpointMismatch(format!(
                    "operation {cursor} is not a cluster boundary"
                )));
            }
            cursor
        }
        None => parsed.resume_index,
    };
    let (labels_completed, last_label) = label_prefix(&parsed.ops[..cursor]);
    if let Some(cp) = checkpoint {
        if cp.label != last_label || cp.labels_completed != labels_completed {
            return Err(CorruptionError::CheckpointMismatch(format!(
                "checkpoint label {:?} ({} completed) but the log has {:?} ({}) at operation {cursor}",
                cp.label, cp.labels_completed, last_label, labels_completed
            )));
        }
    }
    Ok(Position { cursor, labels_completed, last_label })
}

/// Every cluster's staged inputs must fit the staging limit; `stage` holds
/// them in memory at once.
fn check_staging(ops: &[CowOperation], block_size: u32) -> Result<(), CorruptionError> {
    let limit = staging_limit_blocks(block_size);
    let mut blocks = 0u64;
    for (op_index, op) in ops.iter().enumerate() {
        if op.is_boundary() {
            blocks = 0;
            continue;
        }
        blocks += op.staged_blocks();
        if blocks > limit {
            return Err(CorruptionError::StagingLimit { op_index, blocks, limit });
        }
    }
    Ok(())
}

fn check_ranges(ops: &[CowOperation], device_blocks: u64) -> Result<(), CorruptionError> {
    for (op_index, op) in ops.iter().enumerate() {
        let mut ranges = Vec::with_capacity(2);
        ranges.extend(op.dst_range());
        if let CowOperation::Copy { src, blocks, .. } = op {
            ranges.push((*src, src.saturating_add(*blocks as u64)));
        }
        for (start, end) in ranges {
            if end > device_blocks {
                return Err(CorruptionError::OutOfRange { op_index, start, end, device_blocks });
            }
        }
    }
    Ok(())
}

// ── Coordinator ─────────────────────────────────────────────────────────────

pub struct MergeCoordinator<D: BlockDevice, S: CheckpointStore> {
    header:        CowHeader,
    ops:           Vec<CowOperation>,
    /// The log had an unconfirmed tail when it was parsed.
    awaiting_tail: bool,
    engine:        Box<dyn CompressionEngine>,
    device:        D,
    store:         S,
    config:        MergeConfig,
    position:      Position,
    checkpoint:    Option<MergeCheckpoint>,
    state:         MergeState,
    fatal:         Option<CorruptionError>,
    finalizer:     Option<Finalizer>,
    finalized:     bool,
}

impl<D: BlockDevice, S: CheckpointStore> MergeCoordinator<D, S> {
    /// Prepare a merge of `parsed` onto `device`, continuing from whatever
    /// `store` holds.
    pub fn new(parsed: ParsedCow, device: D, mut store: S, config: MergeConfig) -> Result<Self, MergeError> {
        let engine = open_engine(parsed.algorithm.id())?;
        if parsed.header.block_size != device.block_size() {
            return Err(CorruptionError::BlockSizeMismatch {
                log:    parsed.header.block_size,
                device: device.block_size(),
            }
            .into());
        }
        check_staging(&parsed.ops, parsed.header.block_size)?;
        check_ranges(&parsed.ops, device.block_count())?;

        let checkpoint = store.load()?;
        let position = locate(&parsed, checkpoint.as_ref())?;
        let awaiting_tail = parsed.truncated.is_some() && !parsed.finalized;

        let state = if position.cursor == 0 && checkpoint.is_none() {
            MergeState::NotStarted
        } else if position.cursor == parsed.ops.len() && !awaiting_tail {
            MergeState::Completed
        } else {
            MergeState::InProgress
        };
        info!(
            algorithm = parsed.algorithm.name(),
            ops = parsed.ops.len(),
            cursor = position.cursor,
            last_label = ?position.last_label,
            ?state,
            "merge coordinator ready"
        );

        Ok(Self {
            header: parsed.header,
            ops: parsed.ops,
            awaiting_tail,
            engine,
            device,
            store,
            config,
            position,
            checkpoint,
            state,
            fatal: None,
            finalizer: None,
            finalized: false,
        })
    }

    /// On completion, release `promote` (if any) and tear down every other
    /// mapping `manager` holds.
    pub fn with_lifecycle(mut self, manager: Arc<DeviceLifecycleManager>, promote: Option<DeviceHandle>) -> Self {
        self.finalizer = Some(Finalizer { manager, promote });
        self
    }

    /// Swap in a newer parse of the same log, e.g. once the writer has
    /// confirmed the cluster that was the unconfirmed tail.
    pub fn reload(&mut self, parsed: ParsedCow) -> Result<(), MergeError> {
        if parsed.header.block_size != self.header.block_size {
            return Err(CorruptionError::BlockSizeMismatch {
                log:    parsed.header.block_size,
                device: self.header.block_size,
            }
            .into());
        }
        check_staging(&parsed.ops, parsed.header.block_size)?;
        check_ranges(&parsed.ops, self.device.block_count())?;
        let position = locate(&parsed, self.checkpoint.as_ref())?;
        if position.cursor < self.position.cursor {
            return Err(CorruptionError::CheckpointMismatch("reloaded log is behind the merge".into()).into());
        }
        self.engine = open_engine(parsed.algorithm.id())?;
        self.header = parsed.header;
        self.ops = parsed.ops;
        self.awaiting_tail = parsed.truncated.is_some() && !parsed.finalized;
        self.position = position;
        if self.state == MergeState::Completed && self.position.cursor < self.ops.len() {
            self.state = MergeState::InProgress;
        }
        debug!(ops = self.ops.len(), cursor = self.position.cursor, "COW log reloaded");
        Ok(())
    }

    pub fn state(&self) -> MergeState {
        self.state
    }

    pub fn progress(&self) -> MergeProgress {
        MergeProgress {
            state:            self.state,
            labels_completed: self.position.labels_completed,
            last_label:       self.position.last_label,
            ops_merged:       self.position.cursor as u64,
            total_ops:        self.ops.len() as u64,
        }
    }

    pub fn checkpoint(&self) -> Option<&MergeCheckpoint> {
        self.checkpoint.as_ref()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_device(self) -> D {
        self.device
    }

    /// Apply the next cluster.
    pub fn step(&mut self) -> Result<StepOutcome, MergeError> {
        if let Some(err) = &self.fatal {
            return Err(err.clone().into());
        }
        match self.step_inner() {
            Err(MergeError::Corruption(c)) => {
                error!(error = %c, cursor = self.position.cursor, "merge aborted: log is corrupt");
                self.fatal = Some(c.clone());
                Err(c.into())
            }
            other => other,
        }
    }

    /// Step until done, waiting for more log, or cancelled.  Cancellation is
    /// only observed between clusters.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<RunOutcome, MergeError> {
        loop {
            if cancel.is_cancelled() {
                info!(ops_merged = self.position.cursor, "merge paused");
                return Ok(RunOutcome::Cancelled);
            }
            match self.step()? {
                StepOutcome::Progressed { .. } => continue,
                StepOutcome::AwaitingLog => return Ok(RunOutcome::AwaitingLog),
                StepOutcome::Completed => return Ok(RunOutcome::Completed),
            }
        }
    }

    fn step_inner(&mut self) -> Result<StepOutcome, MergeError> {
        let start = self.position.cursor;
        if start >= self.ops.len() {
            if self.awaiting_tail {
                return Ok(StepOutcome::AwaitingLog);
            }
            self.complete()?;
            return Ok(StepOutcome::Completed);
        }
        if self.state == MergeState::NotStarted {
            info!(ops = self.ops.len(), "merge started");
            self.state = MergeState::InProgress;
        }

        let end = self.ops[start..]
            .iter()
            .position(|op| op.is_boundary())
            .map_or(self.ops.len(), |i| start + i + 1);

        let scratch = self.stage(start, end)?;
        let xor_reads = self.xor_blocks(start, end);
        let mut pending: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        for index in start..end {
            self.apply(index, scratch.as_ref(), &xor_reads, &mut pending)?;
        }
        self.commit(end, scratch.is_some())?;
        Ok(StepOutcome::Progressed { ops: end - start })
    }

    fn block_bytes(&self, blocks: u32) -> usize {
        blocks as usize * self.header.block_size as usize
    }

    /// Blocks that Xor operations in `[start, end)` read.
    fn xor_blocks(&self, start: usize, end: usize) -> BTreeSet<u64> {
        let mut set = BTreeSet::new();
        for op in &self.ops[start..end] {
            if let CowOperation::Xor { dst, blocks, .. } = op {
                set.extend(*dst..*dst + *blocks as u64);
            }
        }
        set
    }

    /// Stage the blocks Copy and Xor read, or pick up an earlier staging of
    /// the same cluster.
    fn stage(&mut self, start: usize, end: usize) -> Result<Option<ScratchArea>, MergeError> {
        let reads: Vec<(usize, u64, u32)> = self.ops[start..end]
            .iter()
            .enumerate()
            .filter_map(|(i, op)| match op {
                CowOperation::Copy { src, blocks, .. } => Some((start + i, *src, *blocks)),
                CowOperation::Xor { dst, blocks, .. } => Some((start + i, *dst, *blocks)),
                _ => None,
            })
            .collect();
        if reads.is_empty() {
            return Ok(None);
        }

        if let Some(existing) = self.store.load_scratch()? {
            if existing.cluster_start == start as u64 {
                debug!(cluster_start = start, blocks = existing.blocks.len(), "reusing staged cluster inputs");
                return Ok(Some(existing));
            }
        }

        let bs = self.header.block_size as usize;
        let mut scratch = ScratchArea::new(start as u64);
        for (op_index, first, blocks) in reads {
            let data = with_retry(&self.config, &mut self.device, op_index, "read", |d| d.read_blocks(first, blocks))?;
            for (k, chunk) in data.chunks(bs).enumerate() {
                scratch.blocks.entry(first + k as u64).or_insert_with(|| chunk.to_vec());
            }
        }
        self.store.persist_scratch(&scratch)?;
        debug!(cluster_start = start, blocks = scratch.blocks.len(), "cluster inputs staged");
        Ok(Some(scratch))
    }

    fn payload(&self, compressed: bool, payload: &[u8], blocks: u32) -> Result<Vec<u8>, CorruptionError> {
        let expected = self.block_bytes(blocks);
        if compressed {
            self.engine.decompress(payload, expected)
        } else if payload.len() != expected {
            Err(CorruptionError::LengthMismatch { expected, actual: payload.len() })
        } else {
            Ok(payload.to_vec())
        }
    }

    fn staged<'a>(scratch: Option<&'a ScratchArea>, block: u64) -> Result<&'a [u8], CorruptionError> {
        scratch
            .and_then(|s| s.get(block))
            .ok_or_else(|| CorruptionError::CheckpointMismatch(format!("block {block} missing from scratch area")))
    }

    fn apply(
        &mut self,
        index:     usize,
        scratch:   Option<&ScratchArea>,
        xor_reads: &BTreeSet<u64>,
        pending:   &mut BTreeMap<u64, Vec<u8>>,
    ) -> Result<(), MergeError> {
        let bs = self.header.block_size as usize;
        let (dst, data) = match &self.ops[index] {
            CowOperation::Label(_) | CowOperation::ClusterEnd => return Ok(()),
            CowOperation::Copy { dst, src, blocks } => {
                let mut data = Vec::with_capacity(self.block_bytes(*blocks));
                for k in 0..*blocks as u64 {
                    data.extend_from_slice(Self::staged(scratch, src + k)?);
                }
                (*dst, data)
            }
            CowOperation::Replace { dst, blocks, compressed, payload } => {
                (*dst, self.payload(*compressed, payload, *blocks)?)
            }
            CowOperation::Xor { dst, blocks, compressed, payload } => {
                let mut data = self.payload(*compressed, payload, *blocks)?;
                for (k, delta) in data.chunks_mut(bs).enumerate() {
                    let block = dst + k as u64;
                    let base = match pending.get(&block) {
                        Some(current) => current.as_slice(),
                        None => Self::staged(scratch, block)?,
                    };
                    xor_into(delta, base);
                }
                (*dst, data)
            }
            CowOperation::Zero { dst, blocks } => {
                let (dst, blocks) = (*dst, *blocks as u64);
                let mut done = 0;
                while done < blocks {
                    let n = ZERO_CHUNK_BLOCKS.min(blocks - done);
                    let zeros = vec![0u8; n as usize * bs];
                    let at = dst + done;
                    with_retry(&self.config, &mut self.device, index, "write", |d| d.write_blocks(at, &zeros))?;
                    done += n;
                }
                for block in xor_reads.range(dst..dst + blocks) {
                    pending.insert(*block, vec![0u8; bs]);
                }
                return Ok(());
            }
        };

        with_retry(&self.config, &mut self.device, index, "write", |d| d.write_blocks(dst, &data))?;
        let written = (data.len() / bs) as u64;
        for block in xor_reads.range(dst..dst + written) {
            let k = (block - dst) as usize;
            pending.insert(*block, data[k * bs..(k + 1) * bs].to_vec());
        }
        Ok(())
    }

    /// Make the cluster ending at `end` durable and move the cursor past it.
    fn commit(&mut self, end: usize, staged: bool) -> Result<(), MergeError> {
        with_retry(&self.config, &mut self.device, end - 1, "flush", |d| d.flush())?;

        let mut next = self.position;
        if let CowOperation::Label(v) = self.ops[end - 1] {
            next.labels_completed += 1;
            next.last_label = Some(v);
        }
        next.cursor = end;

        let checkpoint = MergeCheckpoint::new(next.last_label, end as u64, next.labels_completed);
        self.store.persist(&checkpoint)?;
        if staged {
            self.store.clear_scratch()?;
        }
        self.position = next;
        self.checkpoint = Some(checkpoint);
        debug!(
            ops_merged = end,
            label = ?next.last_label,
            labels_completed = next.labels_completed,
            "cluster committed"
        );
        Ok(())
    }

    /// Mark the merge complete and hand the devices back.  Safe to repeat.
    fn complete(&mut self) -> Result<(), MergeError> {
        if self.state != MergeState::Completed {
            self.state = MergeState::Completed;
            info!(
                ops = self.ops.len(),
                labels = self.position.labels_completed,
                "merge completed"
            );
        }
        if self.finalized {
            return Ok(());
        }
        if let Some(fin) = &self.finalizer {
            if let Some(handle) = &fin.promote {
                fin.manager.release(handle)?;
            }
            let report = fin.manager.teardown();
            if let Some(failure) = report.failures.into_iter().next() {
                return Err(failure.into());
            }
        }
        self.finalized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::device::MemoryDevice;
    use crate::header::FormatVersion;
    use crate::parser::CowParser;
    use crate::writer::{CowWriter, WriterOptions};
    use std::io::Cursor;

    fn log(build: impl FnOnce(&mut CowWriter<Cursor<Vec<u8>>>)) -> ParsedCow {
        let options = WriterOptions { block_size: 4, ..WriterOptions::default() };
        let mut w = CowWriter::new(Cursor::new(Vec::new()), options).unwrap();
        build(&mut w);
        let bytes = w.finalize().unwrap().into_inner();
        CowParser::new().parse_bytes(&bytes).unwrap()
    }

    fn device() -> MemoryDevice {
        let data: Vec<u8> = (0..16u8).flat_map(|b| [b'a' + b; 4]).collect();
        MemoryDevice::from_bytes(4, data).unwrap()
    }

    #[test]
    fn copy_reads_base_even_when_cluster_overwrites_source() {
        let parsed = log(|w| {
            w.add_copy(8, 2, 1).unwrap();
            w.add_replace(2, b"ZZZZ").unwrap();
            w.add_label(1).unwrap();
        });
        let mut m = MergeCoordinator::new(parsed, device(), MemoryCheckpointStore::new(), MergeConfig::default()).unwrap();
        assert_eq!(m.run(&CancelToken::new()).unwrap(), RunOutcome::Completed);
        assert_eq!(m.device().block(8), b"cccc");
        assert_eq!(m.device().block(2), b"ZZZZ");
    }

    #[test]
    fn xor_sees_earlier_write_in_same_cluster() {
        let parsed = log(|w| {
            w.add_replace(1, &[0x0F; 4]).unwrap();
            w.add_xor(1, &[0xF0; 4]).unwrap();
            w.add_label(1).unwrap();
        });
        let mut m = MergeCoordinator::new(parsed, device(), MemoryCheckpointStore::new(), MergeConfig::default()).unwrap();
        m.run(&CancelToken::new()).unwrap();
        assert_eq!(m.device().block(1), &[0xFF; 4]);
    }

    #[test]
    fn block_size_and_range_are_checked_up_front() {
        let parsed = log(|w| {
            w.add_zero(15, 2).unwrap();
            w.add_label(1).unwrap();
        });
        let err = MergeCoordinator::new(parsed.clone(), device(), MemoryCheckpointStore::new(), MergeConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, MergeError::Corruption(CorruptionError::OutOfRange { start: 15, end: 17, .. })));

        let wide = MemoryDevice::new(8, 16);
        let err = MergeCoordinator::new(parsed, wide, MemoryCheckpointStore::new(), MergeConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, MergeError::Corruption(CorruptionError::BlockSizeMismatch { log: 4, device: 8 })));
    }

    #[test]
    fn oversized_staging_is_rejected_before_any_read() {
        let mut parsed = log(|w| {
            w.add_zero(0, 1).unwrap();
            w.add_label(1).unwrap();
        });
        parsed.ops = vec![
            CowOperation::Copy { dst: 0, src: 1, blocks: 20_000_000 },
            CowOperation::Label(1),
        ];
        let err = MergeCoordinator::new(parsed, device(), MemoryCheckpointStore::new(), MergeConfig::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            MergeError::Corruption(CorruptionError::StagingLimit { op_index: 0, limit: 16_777_216, .. })
        ));
    }

    #[test]
    fn checkpoint_off_boundary_is_rejected() {
        let parsed = log(|w| {
            w.add_zero(0, 1).unwrap();
            w.add_zero(1, 1).unwrap();
            w.add_label(1).unwrap();
        });
        let mut store = MemoryCheckpointStore::new();
        store.persist(&MergeCheckpoint::new(None, 1, 0)).unwrap();
        let err = MergeCoordinator::new(parsed, device(), store, MergeConfig::default()).err().unwrap();
        assert!(matches!(err, MergeError::Corruption(CorruptionError::CheckpointMismatch(_))));
    }

    #[test]
    fn progress_counts_labels() {
        let parsed = log(|w| {
            w.add_zero(0, 1).unwrap();
            w.add_label(3).unwrap();
            w.add_zero(1, 1).unwrap();
            w.add_label(4).unwrap();
        });
        let mut m = MergeCoordinator::new(parsed, device(), MemoryCheckpointStore::new(), MergeConfig::default()).unwrap();
        assert_eq!(m.state(), MergeState::NotStarted);
        assert_eq!(m.step().unwrap(), StepOutcome::Progressed { ops: 2 });
        let p = m.progress();
        assert_eq!((p.labels_completed, p.last_label, p.ops_merged), (1, Some(3), 2));
        assert_eq!(p.percent(), 50.0);
        assert_eq!(m.state(), MergeState::InProgress);
    }

    #[test]
    fn config_from_json_fills_defaults() {
        let cfg = MergeConfig::from_json(br#"{"io_retries": 7}"#).unwrap();
        assert_eq!(cfg.io_retries, 7);
        assert_eq!(cfg.retry_backoff_ms, MergeConfig::default().retry_backoff_ms);
    }

    #[test]
    fn v2_log_merges_like_v3() {
        let build = |w: &mut CowWriter<Cursor<Vec<u8>>>| {
            w.add_replace(0, b"AAAABBBB").unwrap();
            w.add_copy(5, 12, 2).unwrap();
            w.add_label(1).unwrap();
        };
        let mut images = Vec::new();
        for version in [FormatVersion::V2, FormatVersion::V3] {
            let options = WriterOptions { version, block_size: 4, ..WriterOptions::default() };
            let mut w = CowWriter::new(Cursor::new(Vec::new()), options).unwrap();
            build(&mut w);
            let parsed = CowParser::new().parse_bytes(&w.finalize().unwrap().into_inner()).unwrap();
            let mut m = MergeCoordinator::new(parsed, device(), MemoryCheckpointStore::new(), MergeConfig::default()).unwrap();
            m.run(&CancelToken::new()).unwrap();
            images.push(m.into_device().into_bytes());
        }
        assert_eq!(images[0], images[1]);
    }
}
