//! Ownership of named virtual block-device mappings.
//!
//! [`DeviceLifecycleManager`] is the only component that maps or unmaps a
//! name.  Every mapping it creates is recorded in acquisition order; teardown
//! walks that record backwards because later mappings may be stacked on
//! earlier ones.  A handle that has been [`release`]d keeps its mapping and
//! is left alone by every teardown pass.
//!
//! Teardown never stops at the first failure: each live handle gets a
//! destroy attempt and the failures are collected in a [`TeardownReport`].
//!
//! [`release`]: DeviceLifecycleManager::release

use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

// ── Collaborator interface ──────────────────────────────────────────────────

/// Target description handed to the mapping facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingSpec {
    pub target_type:    String,
    pub length_sectors: u64,
    pub params:         String,
}

impl MappingSpec {
    pub fn new(target_type: impl Into<String>, length_sectors: u64, params: impl Into<String>) -> Self {
        Self { target_type: target_type.into(), length_sectors, params: params.into() }
    }
}

/// The block-device mapping facility.  Assumed idempotent per name.
pub trait MappingFacility: Send + Sync {
    fn create(&self, name: &str, spec: &MappingSpec) -> io::Result<()>;
    fn destroy(&self, name: &str) -> io::Result<()>;
    fn is_mapped(&self, name: &str) -> bool;
}

// ── Handles ─────────────────────────────────────────────────────────────────

/// What a mapping is; decides which facility destroys it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKind {
    SnapshotDevice,
    /// Backed by the image facility rather than the device facility.
    CowImage,
    MergeTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Unmapped,
    Mapped,
    /// Detached from automatic teardown; the mapping stays in place.
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub name: String,
    pub kind: MappingKind,
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.name, self.kind)
    }
}

/// One mapping to acquire as part of a stack.
#[derive(Debug, Clone)]
pub struct MappingRequest {
    pub name: String,
    pub kind: MappingKind,
    pub spec: MappingSpec,
}

impl MappingRequest {
    pub fn new(name: impl Into<String>, kind: MappingKind, spec: MappingSpec) -> Self {
        Self { name: name.into(), kind, spec }
    }
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("Mapping {name} already exists with a different target")]
    Conflict { name: String },
    #[error("Mapping {name} exists but is not owned by this manager")]
    Foreign { name: String },
    #[error("Mapping {name} is not mapped")]
    NotMapped { name: String },
    #[error("Mapping {name} is not tracked by this manager")]
    UnknownHandle { name: String },
    #[error("Failed to create mapping {name}: {source}")]
    Create { name: String, #[source] source: io::Error },
    #[error("Failed to destroy mapping {name}: {source}")]
    Destroy { name: String, #[source] source: io::Error },
}

/// Outcome of a teardown pass.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Destroyed during this pass, in destruction order.
    pub destroyed: Vec<String>,
    /// Already gone before this pass reached them.
    pub already_unmapped: Vec<String>,
    pub failures: Vec<MappingError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

// ── Manager ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Entry {
    handle: DeviceHandle,
    spec:   MappingSpec,
    state:  HandleState,
}

pub struct DeviceLifecycleManager {
    devices: Arc<dyn MappingFacility>,
    images:  Arc<dyn MappingFacility>,
    /// Acquisition order.  The lock also serializes acquire against acquire.
    entries: Mutex<Vec<Entry>>,
}

impl DeviceLifecycleManager {
    pub fn new(devices: Arc<dyn MappingFacility>, images: Arc<dyn MappingFacility>) -> Self {
        Self { devices, images, entries: Mutex::new(Vec::new()) }
    }

    /// One facility serving both devices and images.
    pub fn with_facility(facility: Arc<dyn MappingFacility>) -> Self {
        Self::new(facility.clone(), facility)
    }

    fn facility(&self, kind: MappingKind) -> &dyn MappingFacility {
        match kind {
            MappingKind::CowImage => self.images.as_ref(),
            MappingKind::SnapshotDevice | MappingKind::MergeTarget => self.devices.as_ref(),
        }
    }

    /// Map `name`.  Acquiring a name this manager already holds with the
    /// same kind and spec returns the existing handle unchanged; a released
    /// handle stays released and out of teardown.
    pub fn acquire(&self, name: &str, kind: MappingKind, spec: &MappingSpec) -> Result<DeviceHandle, MappingError> {
        self.acquire_locked(&mut self.entries.lock(), name, kind, spec).map(|(handle, _)| handle)
    }

    /// Returns the handle and whether this call created the mapping.
    fn acquire_locked(
        &self,
        entries: &mut Vec<Entry>,
        name:    &str,
        kind:    MappingKind,
        spec:    &MappingSpec,
    ) -> Result<(DeviceHandle, bool), MappingError> {
        if let Some(pos) = entries.iter().position(|e| e.handle.name == name) {
            match entries[pos].state {
                state @ (HandleState::Mapped | HandleState::Released) => {
                    let entry = &entries[pos];
                    if entry.handle.kind != kind || entry.spec != *spec {
                        return Err(MappingError::Conflict { name: name.to_string() });
                    }
                    debug!(name, ?state, "mapping already held");
                    return Ok((entry.handle.clone(), false));
                }
                HandleState::Unmapped => {
                    entries.remove(pos);
                }
            }
        }

        let facility = self.facility(kind);
        if facility.is_mapped(name) {
            return Err(MappingError::Foreign { name: name.to_string() });
        }
        facility
            .create(name, spec)
            .map_err(|source| MappingError::Create { name: name.to_string(), source })?;
        info!(name, ?kind, target = %spec.target_type, "mapping created");

        let handle = DeviceHandle { name: name.to_string(), kind };
        entries.push(Entry { handle: handle.clone(), spec: spec.clone(), state: HandleState::Mapped });
        Ok((handle, true))
    }

    /// Take ownership of a mapping that already exists, typically one left
    /// behind by an interrupted run of the same update.
    pub fn adopt(&self, name: &str, kind: MappingKind, spec: &MappingSpec) -> Result<DeviceHandle, MappingError> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.handle.name == name && e.state != HandleState::Unmapped) {
            drop(entries);
            return self.acquire(name, kind, spec);
        }
        if !self.facility(kind).is_mapped(name) {
            return Err(MappingError::NotMapped { name: name.to_string() });
        }
        entries.retain(|e| e.handle.name != name);
        let handle = DeviceHandle { name: name.to_string(), kind };
        entries.push(Entry { handle: handle.clone(), spec: spec.clone(), state: HandleState::Mapped });
        info!(name, ?kind, "existing mapping adopted");
        Ok(handle)
    }

    /// Acquire a stack of mappings in order.  If any step fails, the
    /// mappings this call created are destroyed again, newest first.
    pub fn acquire_all(&self, requests: &[MappingRequest]) -> Result<Vec<DeviceHandle>, MappingError> {
        let mut entries = self.entries.lock();
        let mut handles = Vec::with_capacity(requests.len());
        let mut created = Vec::new();
        for req in requests {
            match self.acquire_locked(&mut entries, &req.name, req.kind, &req.spec) {
                Ok((handle, fresh)) => {
                    if fresh {
                        created.push(handle.clone());
                    }
                    handles.push(handle);
                }
                Err(e) => {
                    error!(name = %req.name, error = %e, "acquire failed; rolling back");
                    for handle in created.iter().rev() {
                        if let Err(rollback) = self.destroy_locked(&mut entries, handle) {
                            error!(name = %handle.name, error = %rollback, "rollback destroy failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    /// Detach `handle` from automatic teardown.  The mapping stays in place.
    pub fn release(&self, handle: &DeviceHandle) -> Result<(), MappingError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.handle == *handle)
            .ok_or_else(|| MappingError::UnknownHandle { name: handle.name.clone() })?;
        match entry.state {
            HandleState::Mapped => {
                entry.state = HandleState::Released;
                info!(name = %handle.name, "mapping released from teardown");
                Ok(())
            }
            HandleState::Released => Ok(()),
            HandleState::Unmapped => Err(MappingError::NotMapped { name: handle.name.clone() }),
        }
    }

    /// Destroy one mapping now.  Destroying an unmapped handle is a no-op.
    pub fn destroy(&self, handle: &DeviceHandle) -> Result<(), MappingError> {
        self.destroy_locked(&mut self.entries.lock(), handle)
    }

    fn destroy_locked(&self, entries: &mut [Entry], handle: &DeviceHandle) -> Result<(), MappingError> {
        let entry = entries
            .iter_mut()
            .find(|e| e.handle == *handle)
            .ok_or_else(|| MappingError::UnknownHandle { name: handle.name.clone() })?;
        if entry.state == HandleState::Unmapped {
            return Ok(());
        }
        let facility = self.facility(handle.kind);
        if facility.is_mapped(&handle.name) {
            facility
                .destroy(&handle.name)
                .map_err(|source| MappingError::Destroy { name: handle.name.clone(), source })?;
        }
        entry.state = HandleState::Unmapped;
        Ok(())
    }

    pub fn state(&self, handle: &DeviceHandle) -> Option<HandleState> {
        self.entries.lock().iter().find(|e| e.handle == *handle).map(|e| e.state)
    }

    /// Handles in acquisition order with their current state.
    pub fn handles(&self) -> Vec<(DeviceHandle, HandleState)> {
        self.entries.lock().iter().map(|e| (e.handle.clone(), e.state)).collect()
    }

    /// Destroy every live handle, newest first.  Released and unmapped
    /// handles are skipped.  Failed handles stay mapped so a later pass can
    /// retry them.
    pub fn teardown(&self) -> TeardownReport {
        let mut entries = self.entries.lock();
        let mut report = TeardownReport::default();
        for entry in entries.iter_mut().rev() {
            if entry.state != HandleState::Mapped {
                continue;
            }
            let name = entry.handle.name.clone();
            let facility = self.facility(entry.handle.kind);
            if !facility.is_mapped(&name) {
                entry.state = HandleState::Unmapped;
                report.already_unmapped.push(name);
                continue;
            }
            match facility.destroy(&name) {
                Ok(()) => {
                    entry.state = HandleState::Unmapped;
                    debug!(name = %name, "mapping destroyed");
                    report.destroyed.push(name);
                }
                Err(source) => {
                    error!(name = %name, error = %source, "failed to tear down mapping");
                    report.failures.push(MappingError::Destroy { name, source });
                }
            }
        }
        report
    }
}

impl Drop for DeviceLifecycleManager {
    fn drop(&mut self) {
        let report = self.teardown();
        if !report.is_clean() {
            error!(failures = report.failures.len(), "mappings left behind on drop");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeFacility;
    use super::*;

    fn spec(n: u64) -> MappingSpec {
        MappingSpec::new("snapshot", n, "base cow P 8")
    }

    fn setup() -> (Arc<FakeFacility>, DeviceLifecycleManager) {
        let fake = Arc::new(FakeFacility::default());
        let mgr = DeviceLifecycleManager::with_facility(fake.clone());
        (fake, mgr)
    }

    fn destroys(fake: &FakeFacility) -> Vec<String> {
        fake.calls.lock().iter().filter(|c| c.starts_with("destroy")).cloned().collect()
    }

    #[test]
    fn teardown_is_reverse_order_and_skips_released() {
        let (fake, mgr) = setup();
        let a = mgr.acquire("a", MappingKind::CowImage, &spec(1)).unwrap();
        let b = mgr.acquire("b", MappingKind::SnapshotDevice, &spec(2)).unwrap();
        let _c = mgr.acquire("c", MappingKind::MergeTarget, &spec(3)).unwrap();
        let _d = mgr.acquire("d", MappingKind::SnapshotDevice, &spec(4)).unwrap();
        mgr.release(&b).unwrap();

        let report = mgr.teardown();
        assert!(report.is_clean());
        assert_eq!(report.destroyed, vec!["d", "c", "a"]);
        assert_eq!(destroys(&fake), vec!["destroy d", "destroy c", "destroy a"]);
        assert!(fake.is_mapped("b"));
        assert_eq!(mgr.state(&b), Some(HandleState::Released));
        assert_eq!(mgr.state(&a), Some(HandleState::Unmapped));

        // A second pass has nothing left to do.
        let again = mgr.teardown();
        assert!(again.destroyed.is_empty());
        assert_eq!(destroys(&fake).len(), 3);
    }

    #[test]
    fn acquire_is_idempotent_and_rejects_conflicts() {
        let (fake, mgr) = setup();
        let first = mgr.acquire("snap", MappingKind::SnapshotDevice, &spec(8)).unwrap();
        let second = mgr.acquire("snap", MappingKind::SnapshotDevice, &spec(8)).unwrap();
        assert_eq!(first, second);
        assert_eq!(fake.calls.lock().len(), 1);

        let err = mgr.acquire("snap", MappingKind::SnapshotDevice, &spec(9)).unwrap_err();
        assert!(matches!(err, MappingError::Conflict { .. }));

        fake.mapped.lock().insert("other".into(), spec(1));
        let err = mgr.acquire("other", MappingKind::SnapshotDevice, &spec(1)).unwrap_err();
        assert!(matches!(err, MappingError::Foreign { .. }));
        let adopted = mgr.adopt("other", MappingKind::SnapshotDevice, &spec(1)).unwrap();
        assert_eq!(mgr.state(&adopted), Some(HandleState::Mapped));
    }

    #[test]
    fn reacquiring_a_released_mapping_keeps_it_released() {
        let (fake, mgr) = setup();
        let target = mgr.acquire("system_b", MappingKind::MergeTarget, &spec(8)).unwrap();
        mgr.release(&target).unwrap();

        let again = mgr.acquire("system_b", MappingKind::MergeTarget, &spec(8)).unwrap();
        assert_eq!(again, target);
        assert_eq!(mgr.state(&target), Some(HandleState::Released));
        let handles = mgr
            .acquire_all(&[MappingRequest::new("system_b", MappingKind::MergeTarget, spec(8))])
            .unwrap();
        assert_eq!(handles, vec![target.clone()]);
        assert_eq!(mgr.state(&target), Some(HandleState::Released));

        drop(mgr);
        assert!(fake.is_mapped("system_b"));
        assert!(destroys(&fake).is_empty());
    }

    #[test]
    fn concurrent_acquire_creates_once() {
        let (fake, mgr) = setup();
        let barrier = std::sync::Barrier::new(8);
        let (barrier, shared) = (&barrier, &mgr);
        let handles: Vec<DeviceHandle> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(move || {
                        barrier.wait();
                        shared.acquire("shared", MappingKind::SnapshotDevice, &spec(4)).unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert!(handles.iter().all(|h| h.name == "shared"));
        let creates = fake.calls.lock().iter().filter(|c| c.starts_with("create")).count();
        assert_eq!(creates, 1);
        assert_eq!(mgr.handles().len(), 1);
    }

    #[test]
    fn acquire_all_rolls_back_on_failure() {
        let (fake, mgr) = setup();
        fake.fail_create.lock().insert("third".into());
        let requests = [
            MappingRequest::new("first", MappingKind::CowImage, spec(1)),
            MappingRequest::new("second", MappingKind::SnapshotDevice, spec(2)),
            MappingRequest::new("third", MappingKind::MergeTarget, spec(3)),
        ];
        let err = mgr.acquire_all(&requests).unwrap_err();
        assert!(matches!(err, MappingError::Create { ref name, .. } if name == "third"));
        assert!(fake.mapped.lock().is_empty());
        assert_eq!(destroys(&fake), vec!["destroy second", "destroy first"]);
    }

    #[test]
    fn teardown_failure_does_not_stop_siblings() {
        let (fake, mgr) = setup();
        for name in ["x", "y", "z"] {
            mgr.acquire(name, MappingKind::SnapshotDevice, &spec(1)).unwrap();
        }
        fake.fail_destroy.lock().insert("y".into());
        let report = mgr.teardown();
        assert_eq!(report.destroyed, vec!["z", "x"]);
        assert_eq!(report.failures.len(), 1);
        assert!(fake.is_mapped("y"));

        fake.fail_destroy.lock().clear();
        let retry = mgr.teardown();
        assert_eq!(retry.destroyed, vec!["y"]);
    }

    #[test]
    fn externally_unmapped_handle_is_a_noop() {
        let (fake, mgr) = setup();
        let h = mgr.acquire("gone", MappingKind::SnapshotDevice, &spec(1)).unwrap();
        fake.mapped.lock().clear();
        let report = mgr.teardown();
        assert_eq!(report.already_unmapped, vec!["gone"]);
        assert!(destroys(&fake).is_empty());
        assert_eq!(mgr.state(&h), Some(HandleState::Unmapped));
    }

    #[test]
    fn images_go_through_the_image_facility() {
        let devices = Arc::new(FakeFacility::default());
        let images = Arc::new(FakeFacility::default());
        {
            let mgr = DeviceLifecycleManager::new(devices.clone(), images.clone());
            mgr.acquire("cow-img", MappingKind::CowImage, &spec(1)).unwrap();
            mgr.acquire("snap", MappingKind::SnapshotDevice, &spec(1)).unwrap();
            assert!(images.is_mapped("cow-img"));
            assert!(!devices.is_mapped("cow-img"));
        }
        // Dropped: both torn down.
        assert!(images.mapped.lock().is_empty());
        assert!(devices.mapped.lock().is_empty());
    }
}
