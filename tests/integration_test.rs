use parking_lot::Mutex;
use snapcow::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use snapcow::codec::{engine_for, CompressionAlgorithm};
use snapcow::device::{BlockDevice, FileDevice, MemoryDevice};
use snapcow::header::{CowHeader, FormatVersion};
use snapcow::lifecycle::{DeviceLifecycleManager, HandleState, MappingFacility, MappingKind, MappingRequest, MappingSpec};
use snapcow::merge::{CancelToken, MergeConfig, MergeCoordinator, MergeError, MergeState, RunOutcome, StepOutcome};
use snapcow::op::{encode_record, CowOperation, Record};
use snapcow::parser::{CowParser, ParsedCow};
use snapcow::writer::{CowWriter, WriterOptions};
use snapcow::{CorruptionError, ParseError};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;

const BS: u32 = 4;

// ── Fixtures ─────────────────────────────────────────────────────────────────

fn options() -> WriterOptions {
    WriterOptions { block_size: BS, ..WriterOptions::default() }
}

fn write_log(options: WriterOptions, build: impl FnOnce(&mut CowWriter<Cursor<Vec<u8>>>)) -> Vec<u8> {
    let mut w = CowWriter::new(Cursor::new(Vec::new()), options).unwrap();
    build(&mut w);
    w.finalize().unwrap().into_inner()
}

fn parse(bytes: &[u8]) -> ParsedCow {
    CowParser::new().parse_bytes(bytes).unwrap()
}

/// 32 blocks, block `i` filled with `'A' + i`.
fn base_image() -> MemoryDevice {
    let data: Vec<u8> = (0..32u8).flat_map(|i| [b'A' + i; BS as usize]).collect();
    MemoryDevice::from_bytes(BS, data).unwrap()
}

fn no_backoff(io_retries: u32) -> MergeConfig {
    MergeConfig { io_retries, retry_backoff_ms: 0 }
}

/// Device whose writes start failing once a shared budget runs out.
/// A negative budget never fails.
struct FlakyDevice {
    inner:  MemoryDevice,
    budget: Arc<AtomicI64>,
}

impl FlakyDevice {
    fn new(inner: MemoryDevice, budget: i64) -> (Self, Arc<AtomicI64>) {
        let budget = Arc::new(AtomicI64::new(budget));
        (Self { inner, budget: budget.clone() }, budget)
    }
}

impl BlockDevice for FlakyDevice {
    fn block_size(&self) -> u32 { self.inner.block_size() }
    fn block_count(&self) -> u64 { self.inner.block_count() }
    fn read_blocks(&mut self, block: u64, count: u32) -> io::Result<Vec<u8>> {
        self.inner.read_blocks(block, count)
    }
    fn write_blocks(&mut self, block: u64, data: &[u8]) -> io::Result<()> {
        let left = self.budget.load(Ordering::SeqCst);
        if left == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        if left > 0 {
            self.budget.store(left - 1, Ordering::SeqCst);
        }
        self.inner.write_blocks(block, data)
    }
    fn flush(&mut self) -> io::Result<()> { self.inner.flush() }
}

/// Three clusters mixing every data operation, including an Xor over a
/// block written earlier in the same cluster and an overlapping Copy.
fn mixed_log() -> Vec<u8> {
    write_log(options(), |w| {
        w.add_copy(20, 4, 2).unwrap();
        w.add_xor(4, &[0x11; 4]).unwrap();
        w.add_replace(6, b"rrrrssss").unwrap();
        w.add_label(1).unwrap();

        w.add_xor(4, &[0x22; 4]).unwrap();
        w.add_zero(8, 3).unwrap();
        w.add_copy(12, 14, 2).unwrap();
        w.add_label(2).unwrap();

        w.add_copy(16, 17, 2).unwrap();
        w.add_xor(16, &[0x0F; 8]).unwrap();
        w.add_label(3).unwrap();
    })
}

fn merge_all(bytes: &[u8]) -> Vec<u8> {
    let mut m = MergeCoordinator::new(parse(bytes), base_image(), MemoryCheckpointStore::new(), no_backoff(0)).unwrap();
    assert_eq!(m.run(&CancelToken::new()).unwrap(), RunOutcome::Completed);
    m.into_device().into_bytes()
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[test]
fn scenario_a_single_replace_completes() {
    let log = NamedTempFile::new().unwrap();
    let state_dir = tempfile::tempdir().unwrap();
    let base_path = state_dir.path().join("base.img");

    {
        let mut w = CowWriter::new(File::create(log.path()).unwrap(), options()).unwrap();
        w.add_replace(5, b"AAAA").unwrap();
        w.add_label(1).unwrap();
        w.finalize().unwrap();
    }
    FileDevice::create(&base_path, BS, 16).unwrap();

    let parsed = CowParser::new().parse(File::open(log.path()).unwrap()).unwrap();
    assert_eq!(parsed.last_label, Some(1));
    let device = FileDevice::open(&base_path, BS).unwrap();
    let store = FileCheckpointStore::new(state_dir.path().join("merge.json"));
    let mut m = MergeCoordinator::new(parsed, device, store, MergeConfig::default()).unwrap();
    assert_eq!(m.state(), MergeState::NotStarted);
    assert_eq!(m.run(&CancelToken::new()).unwrap(), RunOutcome::Completed);
    assert_eq!(m.state(), MergeState::Completed);
    assert_eq!(m.checkpoint().and_then(|c| c.label), Some(1));
    drop(m);

    let mut device = FileDevice::open(&base_path, BS).unwrap();
    assert_eq!(device.read_blocks(5, 1).unwrap(), b"AAAA");
    assert_eq!(device.read_blocks(4, 1).unwrap(), [0u8; 4]);
    let mut store = FileCheckpointStore::new(state_dir.path().join("merge.json"));
    assert_eq!(store.load().unwrap().unwrap().label, Some(1));
}

#[test]
fn scenario_b_unconfirmed_tail_waits_for_next_label() {
    let original_block_2 = base_image().block(2).to_vec();

    // Streaming log: the writer was interrupted before closing the cluster.
    let streaming = {
        let mut w = CowWriter::new(Cursor::new(Vec::new()), options()).unwrap();
        w.add_replace(5, b"AAAA").unwrap();
        w.add_label(1).unwrap();
        w.add_replace(5, b"BBBB").unwrap();
        w.add_copy(9, 2, 1).unwrap();
        w.into_inner().unwrap().into_inner()
    };
    let parsed = parse(&streaming);
    assert_eq!(parsed.truncated.as_ref().map(|t| t.discarded_ops), Some(2));

    let store = MemoryCheckpointStore::new();
    let mut m = MergeCoordinator::new(parsed, base_image(), store.clone(), MergeConfig::default()).unwrap();
    assert_eq!(m.run(&CancelToken::new()).unwrap(), RunOutcome::AwaitingLog);
    assert_eq!(m.state(), MergeState::InProgress);
    assert_eq!(m.device().block(5), b"AAAA");
    assert_eq!(m.device().block(9), base_image().block(9));
    assert_eq!(store.checkpoint().unwrap().label, Some(1));
    let device = m.into_device();

    // The cluster is re-logged with its closing label.
    let complete = write_log(options(), |w| {
        w.add_replace(5, b"AAAA").unwrap();
        w.add_label(1).unwrap();
        w.add_replace(5, b"BBBB").unwrap();
        w.add_copy(9, 2, 1).unwrap();
        w.add_label(2).unwrap();
    });
    let resumed = CowParser::new().resume_from(1).parse_bytes(&complete).unwrap();
    assert_eq!(resumed.resume_index, 2);
    let mut m = MergeCoordinator::new(resumed, device, store.clone(), MergeConfig::default()).unwrap();
    assert_eq!(m.state(), MergeState::InProgress);
    assert_eq!(m.run(&CancelToken::new()).unwrap(), RunOutcome::Completed);
    assert_eq!(m.device().block(5), b"BBBB");
    assert_eq!(m.device().block(9), original_block_2.as_slice());
    assert_eq!(m.progress().labels_completed, 2);
}

#[test]
fn scenario_b_reload_in_place() {
    let streaming = {
        let mut w = CowWriter::new(Cursor::new(Vec::new()), options()).unwrap();
        w.add_replace(5, b"AAAA").unwrap();
        w.add_label(1).unwrap();
        w.add_replace(5, b"BBBB").unwrap();
        w.into_inner().unwrap().into_inner()
    };
    let mut m = MergeCoordinator::new(parse(&streaming), base_image(), MemoryCheckpointStore::new(), MergeConfig::default()).unwrap();
    assert_eq!(m.step().unwrap(), StepOutcome::Progressed { ops: 2 });
    assert_eq!(m.step().unwrap(), StepOutcome::AwaitingLog);

    let mut extended = streaming.clone();
    extended.extend(encode_record(FormatVersion::V3, &Record::Op(CowOperation::Label(2))).unwrap());
    m.reload(parse(&extended)).unwrap();
    assert_eq!(m.run(&CancelToken::new()).unwrap(), RunOutcome::Completed);
    assert_eq!(m.device().block(5), b"BBBB");
}

#[test]
fn scenario_c_codec_length_mismatch_is_fatal() {
    let mut zstd = engine_for(CompressionAlgorithm::Zstd, 3);
    zstd.init().unwrap();
    // Eight bytes of payload for a one-block (four byte) operation.
    let payload = zstd.compress(b"XXXXYYYY").unwrap();

    let mut bytes = Vec::new();
    CowHeader::new(FormatVersion::V3, BS, 0, CompressionAlgorithm::Zstd).write(&mut bytes).unwrap();
    for record in [
        Record::Op(CowOperation::Replace { dst: 0, blocks: 1, compressed: true, payload }),
        Record::Op(CowOperation::Label(1)),
    ] {
        bytes.extend(encode_record(FormatVersion::V3, &record).unwrap());
    }

    let parsed = parse(&bytes);
    let mut m = MergeCoordinator::new(parsed, base_image(), MemoryCheckpointStore::new(), MergeConfig::default()).unwrap();
    let err = m.step().unwrap_err();
    assert!(matches!(err, MergeError::Corruption(CorruptionError::LengthMismatch { expected: 4, .. })));
    assert!(!err.is_retryable());
    assert_eq!(m.device().block(0), base_image().block(0));

    // Sticky: the log is never retried.
    assert!(m.step().unwrap_err().is_corruption());
    assert!(m.run(&CancelToken::new()).unwrap_err().is_corruption());
    assert_eq!(m.state(), MergeState::InProgress);
}

#[test]
fn scenario_d_repeated_label_is_corruption() {
    let mut bytes = Vec::new();
    CowHeader::new(FormatVersion::V2, BS, 0, CompressionAlgorithm::None).write(&mut bytes).unwrap();
    let records = [
        Record::Op(CowOperation::Zero { dst: 1, blocks: 1 }),
        Record::Op(CowOperation::Label(1)),
        Record::Op(CowOperation::Label(1)),
    ];
    let mut second_label = 0;
    for (i, record) in records.iter().enumerate() {
        if i == 2 {
            second_label = bytes.len() as u64;
        }
        bytes.extend(encode_record(FormatVersion::V2, record).unwrap());
    }
    match CowParser::new().parse_bytes(&bytes) {
        Err(ParseError::Corrupt(CorruptionError::NonIncreasingLabel { offset, previous: 1, label: 1 })) => {
            assert_eq!(offset, second_label);
        }
        other => panic!("expected a label error, got {other:?}"),
    }
}

// ── Crash recovery ───────────────────────────────────────────────────────────

#[test]
fn resuming_from_every_label_matches_a_full_merge() {
    let log = mixed_log();
    let expected = merge_all(&log);

    for stop_after in 1..=3 {
        let store = MemoryCheckpointStore::new();
        let mut m = MergeCoordinator::new(parse(&log), base_image(), store.clone(), no_backoff(0)).unwrap();
        for _ in 0..stop_after {
            assert!(matches!(m.step().unwrap(), StepOutcome::Progressed { .. }));
        }
        let device = m.into_device();

        let label = store.checkpoint().unwrap().label.unwrap();
        let resumed = CowParser::new().resume_from(label).parse_bytes(&log).unwrap();
        let mut m = MergeCoordinator::new(resumed, device, store, no_backoff(0)).unwrap();
        assert_eq!(m.run(&CancelToken::new()).unwrap(), RunOutcome::Completed);
        assert_eq!(m.into_device().into_bytes(), expected, "resumed after label {label}");
    }
}

#[test]
fn crash_inside_a_cluster_converges() {
    let log = mixed_log();
    let expected = merge_all(&log);

    for writes_before_crash in 0..12 {
        let store = MemoryCheckpointStore::new();
        let (flaky, _) = FlakyDevice::new(base_image(), writes_before_crash);
        let mut m = MergeCoordinator::new(parse(&log), flaky, store.clone(), no_backoff(0)).unwrap();
        let first = m.run(&CancelToken::new());
        let device = m.into_device().inner;

        let (healthy, _) = FlakyDevice::new(device, -1);
        let mut m = MergeCoordinator::new(parse(&log), healthy, store, no_backoff(0)).unwrap();
        assert_eq!(m.run(&CancelToken::new()).unwrap(), RunOutcome::Completed);
        assert_eq!(
            m.into_device().inner.into_bytes(),
            expected,
            "crash after {writes_before_crash} writes (first run: {first:?})"
        );
    }
}

#[test]
fn repeated_crashes_in_one_cluster_are_idempotent() {
    let log = mixed_log();
    let expected = merge_all(&log);

    let store = MemoryCheckpointStore::new();
    // Clusters one and two take three writes each.  The first run dies
    // between the Copy and the Xor of cluster three; later runs restart
    // at cluster three and die at varying points inside it.
    let mut device = base_image();
    for budget in [7, 1, 0, 1] {
        let (flaky, _) = FlakyDevice::new(device, budget);
        let mut m = MergeCoordinator::new(parse(&log), flaky, store.clone(), no_backoff(0)).unwrap();
        let err = m.run(&CancelToken::new()).unwrap_err();
        assert!(err.is_retryable());
        device = m.into_device().inner;
    }
    assert_eq!(store.checkpoint().unwrap().label, Some(2));
    assert!(store.scratch().is_some(), "cluster inputs stay staged across crashes");

    let mut m = MergeCoordinator::new(parse(&log), device, store.clone(), no_backoff(0)).unwrap();
    assert_eq!(m.run(&CancelToken::new()).unwrap(), RunOutcome::Completed);
    assert_eq!(m.into_device().into_bytes(), expected);
    assert!(store.scratch().is_none());
}

#[test]
fn io_retry_exhaustion_leaves_merge_resumable() {
    let log = mixed_log();
    let expected = merge_all(&log);

    let (flaky, budget) = FlakyDevice::new(base_image(), 0);
    let mut m = MergeCoordinator::new(parse(&log), flaky, MemoryCheckpointStore::new(), no_backoff(2)).unwrap();
    match m.step() {
        Err(MergeError::Io { attempts, op_index, .. }) => {
            assert_eq!(attempts, 3);
            assert_eq!(op_index, 0);
        }
        other => panic!("expected an I/O error, got {other:?}"),
    }
    assert_eq!(m.state(), MergeState::InProgress);
    assert_eq!(m.progress().ops_merged, 0);

    budget.store(-1, Ordering::SeqCst);
    assert_eq!(m.run(&CancelToken::new()).unwrap(), RunOutcome::Completed);
    assert_eq!(m.into_device().inner.into_bytes(), expected);
}

#[test]
fn cancellation_stops_on_a_cluster_boundary() {
    let log = mixed_log();
    let store = MemoryCheckpointStore::new();
    let mut m = MergeCoordinator::new(parse(&log), base_image(), store.clone(), MergeConfig::default()).unwrap();

    let cancel = CancelToken::new();
    m.step().unwrap();
    cancel.cancel();
    assert_eq!(m.run(&cancel).unwrap(), RunOutcome::Cancelled);
    let progress = m.progress();
    assert_eq!(progress.labels_completed, 1);
    assert_eq!(store.checkpoint().unwrap().ops_merged, progress.ops_merged);

    assert_eq!(m.run(&CancelToken::new()).unwrap(), RunOutcome::Completed);
    assert_eq!(m.progress().labels_completed, 3);
    assert_eq!(m.progress().percent(), 100.0);
}

#[test]
fn completed_checkpoint_reopens_as_completed() {
    let log = mixed_log();
    let store = MemoryCheckpointStore::new();
    let mut m = MergeCoordinator::new(parse(&log), base_image(), store.clone(), MergeConfig::default()).unwrap();
    m.run(&CancelToken::new()).unwrap();
    let device = m.into_device();

    let mut m = MergeCoordinator::new(parse(&log), device, store, MergeConfig::default()).unwrap();
    assert_eq!(m.state(), MergeState::Completed);
    assert_eq!(m.step().unwrap(), StepOutcome::Completed);
}

// ── Lifecycle on completion ──────────────────────────────────────────────────

#[derive(Default)]
struct RecordingFacility {
    mapped: Mutex<HashMap<String, MappingSpec>>,
    calls:  Mutex<Vec<String>>,
}

impl MappingFacility for RecordingFacility {
    fn create(&self, name: &str, spec: &MappingSpec) -> io::Result<()> {
        self.calls.lock().push(format!("create {name}"));
        self.mapped.lock().insert(name.to_string(), spec.clone());
        Ok(())
    }
    fn destroy(&self, name: &str) -> io::Result<()> {
        self.calls.lock().push(format!("destroy {name}"));
        self.mapped.lock().remove(name);
        Ok(())
    }
    fn is_mapped(&self, name: &str) -> bool {
        self.mapped.lock().contains_key(name)
    }
}

#[test]
fn completion_releases_new_base_and_tears_down_overlay() {
    let facility = Arc::new(RecordingFacility::default());
    let manager = Arc::new(DeviceLifecycleManager::with_facility(facility.clone()));
    let spec = MappingSpec::new("snapshot-merge", 256, "base cow P 8");
    let handles = manager
        .acquire_all(&[
            MappingRequest::new("system_b-cow-img", MappingKind::CowImage, spec.clone()),
            MappingRequest::new("system_b-cow", MappingKind::SnapshotDevice, spec.clone()),
            MappingRequest::new("system_b", MappingKind::MergeTarget, spec),
        ])
        .unwrap();
    let target = handles[2].clone();

    let log = mixed_log();
    let mut m = MergeCoordinator::new(parse(&log), base_image(), MemoryCheckpointStore::new(), MergeConfig::default())
        .unwrap()
        .with_lifecycle(manager.clone(), Some(target.clone()));
    assert_eq!(m.run(&CancelToken::new()).unwrap(), RunOutcome::Completed);

    let destroys: Vec<String> = facility.calls.lock().iter().filter(|c| c.starts_with("destroy")).cloned().collect();
    assert_eq!(destroys, vec!["destroy system_b-cow", "destroy system_b-cow-img"]);
    assert_eq!(manager.state(&target), Some(HandleState::Released));
    assert!(facility.is_mapped("system_b"));

    // Finalizing again changes nothing.
    assert_eq!(m.step().unwrap(), StepOutcome::Completed);
    assert_eq!(facility.calls.lock().len(), 5);
}
