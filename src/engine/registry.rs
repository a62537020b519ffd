// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Activation, tracking and guaranteed removal of devices.

use std::sync::{Mutex, MutexGuard};

use indexmap::IndexMap;
use log::{debug, error, info, warn};
use uuid::Uuid;

use devicemapper::Sectors;

use crate::{
    engine::{
        engine::Backend,
        table::{Table, TargetParams},
        types::{BlockDevice, DeviceId, TargetKind},
    },
    harness::errors::{DmTestError, DmTestResult},
};

const DEFAULT_NAME_PREFIX: &str = "dmtest";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegistryConfig {
    /// Every device name starts with this prefix.
    pub name_prefix: String,
}

impl RegistryConfig {
    pub fn new(name_prefix: &str) -> RegistryConfig {
        RegistryConfig {
            name_prefix: name_prefix.to_owned(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> RegistryConfig {
        RegistryConfig::new(DEFAULT_NAME_PREFIX)
    }
}

/// A device activated by a registry. Only the registry that returned it
/// can act on it.
#[derive(Debug, Eq, PartialEq)]
pub struct DeviceHandle {
    id: DeviceId,
    name: String,
    kind: TargetKind,
}

impl DeviceHandle {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// The device-mapper name of the device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The kind of the table the device was activated with.
    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    /// The device, for use in the tables of devices layered on it.
    pub fn device(&self) -> BlockDevice {
        BlockDevice::Mapped(self.name.clone())
    }
}

#[derive(Debug)]
struct LiveDevice {
    name: String,
    table: Table,
    /// Loaded while suspended, live at the next resume.
    staged: Option<Table>,
    suspended: bool,
    /// Still being created; not usable by anyone but the activator.
    pending: bool,
}

impl LiveDevice {
    fn tables(&self) -> impl Iterator<Item = &Table> {
        std::iter::once(&self.table).chain(self.staged.iter())
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    devices: IndexMap<DeviceId, LiveDevice>,
    next_id: u64,
}

impl RegistryState {
    fn live(&self, handle: &DeviceHandle) -> DmTestResult<&LiveDevice> {
        match self.devices.get(&handle.id) {
            Some(dev) if !dev.pending => Ok(dev),
            _ => Err(DmTestError::Invalid(format!(
                "device {} is not active",
                handle.name
            ))),
        }
    }

    fn live_mut(&mut self, handle: &DeviceHandle) -> DmTestResult<&mut LiveDevice> {
        match self.devices.get_mut(&handle.id) {
            Some(dev) if !dev.pending => Ok(dev),
            _ => Err(DmTestError::Invalid(format!(
                "device {} is not active",
                handle.name
            ))),
        }
    }

    /// Names of the devices whose tables name the device.
    fn dependents(&self, name: &str) -> Vec<&str> {
        let dev = BlockDevice::Mapped(name.to_owned());
        self.devices
            .values()
            .filter(|d| d.name != name && d.tables().any(|t| t.references().contains(&&dev)))
            .map(|d| d.name.as_str())
            .collect()
    }

    /// Check that every device the table layers on is active here, and
    /// that none of its claims overlaps a claim already held by a device
    /// other than except.
    fn admit(&self, table: &Table, except: Option<DeviceId>) -> DmTestResult<()> {
        for reference in table.references() {
            if let Some(name) = reference.mapped_name() {
                let active = self
                    .devices
                    .iter()
                    .any(|(id, d)| d.name == name && !d.pending && Some(*id) != except);
                if !active {
                    return Err(DmTestError::Invalid(format!(
                        "table references {reference}, which is not an active device"
                    )));
                }
            }
        }

        for claim in table.claims() {
            for (_, dev) in self.devices.iter().filter(|(id, _)| Some(**id) != except) {
                if let Some(held) = dev
                    .tables()
                    .flat_map(|t| t.claims())
                    .find(|held| held.overlaps(&claim))
                {
                    return Err(DmTestError::DeviceBusy(format!(
                        "{} overlaps {} held by {}",
                        claim, held, dev.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Combine the result of a body with the result of the teardown that
/// followed it. The body's failure wins.
fn combine<T>(result: DmTestResult<T>, teardown: DmTestResult<()>) -> DmTestResult<T> {
    match (result, teardown) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(DmTestError::Teardown(Box::new(err))),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(teardown_err)) => {
            warn!("Teardown also failed: {teardown_err}");
            Err(err)
        }
    }
}

/// Removes its devices, last first, when released or dropped.
struct Teardown<'a, B: Backend> {
    registry: &'a DeviceRegistry<B>,
    handles: Vec<DeviceHandle>,
}

impl<B: Backend> Teardown<'_, B> {
    /// Remove every device, returning the first failure.
    fn release(&mut self) -> DmTestResult<()> {
        let mut first = None;
        while let Some(handle) = self.handles.pop() {
            if let Err(err) = self.registry.remove_if_live(&handle) {
                warn!("Failed to remove device {}: {}", handle.name, err);
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl<B: Backend> Drop for Teardown<'_, B> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            warn!("Removing {} devices after a panic", self.handles.len());
            let _ = self.release();
        }
    }
}

/// Resumes a device when finished or dropped.
struct Resumer<'a, B: Backend> {
    registry: &'a DeviceRegistry<B>,
    handle: &'a DeviceHandle,
    done: bool,
}

impl<B: Backend> Resumer<'_, B> {
    fn finish(mut self) -> DmTestResult<()> {
        self.done = true;
        self.registry.resume(self.handle)
    }
}

impl<B: Backend> Drop for Resumer<'_, B> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(err) = self.registry.resume(self.handle) {
                error!("Failed to resume device {}: {}", self.handle.name, err);
            }
        }
    }
}

/// Activates tables into devices and guarantees their removal.
///
/// The registry may be shared between threads. Its state lock is never
/// held across a backend call or a caller's body, so independent device
/// trees can be activated concurrently.
#[derive(Debug)]
pub struct DeviceRegistry<B: Backend> {
    backend: B,
    config: RegistryConfig,
    /// Distinguishes the names of this registry's devices from those of
    /// other registries using the same prefix.
    session: String,
    state: Mutex<RegistryState>,
}

impl<B: Backend> DeviceRegistry<B> {
    pub fn new(backend: B, config: RegistryConfig) -> DeviceRegistry<B> {
        let session = Uuid::new_v4().simple().to_string()[..8].to_owned();
        DeviceRegistry {
            backend,
            config,
            session,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn lock(&self) -> DmTestResult<MutexGuard<'_, RegistryState>> {
        Ok(self.state.lock()?)
    }

    fn device_name(&self, kind: TargetKind, id: DeviceId) -> String {
        format!("{}-{}-{}-{}", self.config.name_prefix, self.session, kind, id)
    }

    /// Create, load and resume. A created device is removed again if a
    /// later step fails.
    fn create_and_load(&self, name: &str, table: &Table) -> DmTestResult<()> {
        self.backend.create(name)?;
        if let Err(err) = self
            .backend
            .load(name, table)
            .and_then(|_| self.backend.resume(name))
        {
            if let Err(remove_err) = self.backend.remove(name) {
                error!("Failed to remove partially activated device {name}: {remove_err}");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Activate the table as a new device.
    pub fn activate(&self, table: Table) -> DmTestResult<DeviceHandle> {
        let kind = table.kind();
        let (id, name) = {
            let mut state = self.lock()?;
            let id = DeviceId(state.next_id);
            let name = self.device_name(kind, id);
            if let Err(err) = table.validate().and_then(|_| state.admit(&table, None)) {
                return Err(DmTestError::activation(&name, err));
            }
            state.next_id += 1;
            state.devices.insert(
                id,
                LiveDevice {
                    name: name.clone(),
                    table: table.clone(),
                    staged: None,
                    suspended: false,
                    pending: true,
                },
            );
            (id, name)
        };

        debug!("Activating {name}: {table}");
        if let Err(err) = self.create_and_load(&name, &table) {
            self.lock()?.devices.shift_remove(&id);
            return Err(DmTestError::activation(&name, err));
        }

        if let Some(dev) = self.lock()?.devices.get_mut(&id) {
            dev.pending = false;
        }
        info!("Activated {kind} device {name}");
        Ok(DeviceHandle { id, name, kind })
    }

    /// Activate the table, run body with the device, and remove the device
    /// on every exit path.
    pub fn scoped_activate<T, F>(&self, table: Table, body: F) -> DmTestResult<T>
    where
        F: FnOnce(&DeviceHandle) -> DmTestResult<T>,
    {
        let handle = self.activate(table)?;
        let mut teardown = Teardown {
            registry: self,
            handles: vec![handle],
        };
        let result = body(&teardown.handles[0]);
        combine(result, teardown.release())
    }

    /// Activate the tables in order, run body with the devices, and remove
    /// them in reverse order on every exit path. If an activation fails the
    /// devices already activated are removed and the failure returned.
    pub fn scoped_activate_many<T, F>(&self, tables: Vec<Table>, body: F) -> DmTestResult<T>
    where
        F: FnOnce(&[DeviceHandle]) -> DmTestResult<T>,
    {
        let mut teardown = Teardown {
            registry: self,
            handles: Vec::with_capacity(tables.len()),
        };
        for table in tables {
            match self.activate(table) {
                Ok(handle) => teardown.handles.push(handle),
                Err(err) => {
                    if let Err(teardown_err) = teardown.release() {
                        warn!("Teardown after failed activation also failed: {teardown_err}");
                    }
                    return Err(err);
                }
            }
        }
        let result = body(&teardown.handles);
        combine(result, teardown.release())
    }

    fn suspend(&self, handle: &DeviceHandle) -> DmTestResult<()> {
        self.lock()?.live(handle)?;
        debug!("Suspending {}", handle.name);
        self.backend.suspend(&handle.name)?;
        self.lock()?.live_mut(handle)?.suspended = true;
        Ok(())
    }

    fn resume(&self, handle: &DeviceHandle) -> DmTestResult<()> {
        self.lock()?.live(handle)?;
        debug!("Resuming {}", handle.name);
        self.backend.resume(&handle.name)?;
        let mut state = self.lock()?;
        let dev = state.live_mut(handle)?;
        dev.suspended = false;
        if let Some(table) = dev.staged.take() {
            info!("Device {} now live with {}", handle.name, table);
            dev.table = table;
        }
        Ok(())
    }

    /// Run body with the device suspended, resuming it afterwards whatever
    /// the outcome. A device that is already suspended is left suspended.
    pub fn pause<T, F>(&self, handle: &DeviceHandle, body: F) -> DmTestResult<T>
    where
        F: FnOnce() -> DmTestResult<T>,
    {
        if self.is_suspended(handle)? {
            return body();
        }

        self.suspend(handle)?;
        let resumer = Resumer {
            registry: self,
            handle,
            done: false,
        };
        let result = body();
        match (result, resumer.finish()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) | (Err(err), Ok(())) => Err(err),
            (Err(err), Err(resume_err)) => {
                warn!("Resume of {} also failed: {}", handle.name, resume_err);
                Err(err)
            }
        }
    }

    /// Load a new table into a suspended device. It becomes live when the
    /// device is resumed.
    pub fn reload(&self, handle: &DeviceHandle, table: Table) -> DmTestResult<()> {
        {
            let state = self.lock()?;
            if !state.live(handle)?.suspended {
                return Err(DmTestError::Invalid(format!(
                    "device {} must be suspended to reload it",
                    handle.name
                )));
            }
            table.validate()?;
            state.admit(&table, Some(handle.id))?;
        }

        debug!("Reloading {}: {}", handle.name, table);
        self.backend.load(&handle.name, &table)?;
        self.lock()?.live_mut(handle)?.staged = Some(table);
        Ok(())
    }

    /// Remove the device. Fails with DeviceBusy if devices are layered on
    /// it. The handle is of no further use once this succeeds.
    pub fn remove(&self, handle: &DeviceHandle) -> DmTestResult<()> {
        {
            let state = self.lock()?;
            state.live(handle)?;
            let dependents = state.dependents(&handle.name);
            if !dependents.is_empty() {
                return Err(DmTestError::DeviceBusy(format!(
                    "{} is in use by {}",
                    handle.name,
                    dependents.join(", ")
                )));
            }
        }

        debug!("Removing {}", handle.name);
        self.backend.remove(&handle.name)?;
        self.lock()?.devices.shift_remove(&handle.id);
        info!("Removed device {}", handle.name);
        Ok(())
    }

    fn remove_if_live(&self, handle: &DeviceHandle) -> DmTestResult<()> {
        if self.lock()?.live(handle).is_err() {
            debug!("Device {} already removed", handle.name);
            return Ok(());
        }
        self.remove(handle)
    }

    pub fn message(
        &self,
        handle: &DeviceHandle,
        sector: Option<Sectors>,
        msg: &str,
    ) -> DmTestResult<Option<String>> {
        self.lock()?.live(handle)?;
        debug!("Sending message \"{}\" to {}", msg, handle.name);
        self.backend.message(&handle.name, sector, msg)
    }

    /// The raw status line of the device.
    pub fn status(&self, handle: &DeviceHandle) -> DmTestResult<String> {
        self.lock()?.live(handle)?;
        self.backend.status(&handle.name)
    }

    /// The table currently live on the device.
    pub fn table(&self, handle: &DeviceHandle) -> DmTestResult<Table> {
        Ok(self.lock()?.live(handle)?.table.clone())
    }

    pub fn is_suspended(&self, handle: &DeviceHandle) -> DmTestResult<bool> {
        Ok(self.lock()?.live(handle)?.suspended)
    }

    /// Names of the active devices, in activation order.
    pub fn live_devices(&self) -> DmTestResult<Vec<String>> {
        Ok(self
            .lock()?
            .devices
            .values()
            .filter(|d| !d.pending)
            .map(|d| d.name.clone())
            .collect())
    }

    /// Remove every active device, most recently activated first. Every
    /// removal is attempted; the first failure is returned.
    pub fn remove_all(&self) -> DmTestResult<()> {
        let devices: Vec<(DeviceId, String)> = self
            .lock()?
            .devices
            .iter()
            .rev()
            .filter(|(_, d)| !d.pending)
            .map(|(id, d)| (*id, d.name.clone()))
            .collect();

        let mut first = None;
        for (id, name) in devices {
            match self.backend.remove(&name) {
                Ok(()) => {
                    self.lock()?.devices.shift_remove(&id);
                    info!("Removed device {name}");
                }
                Err(err) => {
                    warn!("Failed to remove device {name}: {err}");
                    first.get_or_insert(err);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// The name of an active device that opens thin_id in the pool.
    pub(crate) fn thin_user(
        &self,
        pool: &DeviceHandle,
        thin_id: u32,
    ) -> DmTestResult<Option<String>> {
        let state = self.lock()?;
        state.live(pool)?;
        let pool_dev = pool.device();
        Ok(state
            .devices
            .values()
            .find(|d| {
                d.tables().any(|t| match t.params() {
                    TargetParams::Thin(params) => {
                        params.pool == pool_dev && u32::from(params.thin_id) == thin_id
                    }
                    _ => false,
                })
            })
            .map(|d| d.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::{panic, path::PathBuf};

    use assert_matches::assert_matches;

    use crate::engine::sim_engine::{SimBackend, SimOp};

    use super::*;

    fn disk() -> BlockDevice {
        BlockDevice::External(PathBuf::from("/dev/sim0"))
    }

    fn registry() -> DeviceRegistry<SimBackend> {
        let backend = SimBackend::new();
        backend.add_disk("/dev/sim0", Sectors(10_000)).unwrap();
        DeviceRegistry::new(backend, RegistryConfig::default())
    }

    fn linear(offset: u64, length: u64) -> Table {
        Table::linear(Sectors(length), &disk(), Sectors(offset))
    }

    /// (op, name) pairs of the journal for creates and removes.
    fn lifecycle(registry: &DeviceRegistry<SimBackend>) -> Vec<(SimOp, String)> {
        registry
            .backend()
            .journal()
            .unwrap()
            .into_iter()
            .filter(|e| e.op == SimOp::Create || e.op == SimOp::Remove)
            .map(|e| (e.op, e.name))
            .collect()
    }

    #[test]
    /// A failing body is reported and the device is still removed.
    fn test_scoped_removal_on_error() {
        let registry = registry();
        let mut name = String::new();
        let result: DmTestResult<()> = registry.scoped_activate(linear(0, 100), |handle| {
            name = handle.name().to_owned();
            assert!(registry.live_devices().unwrap().contains(&name));
            Err(DmTestError::Invalid("body failed".into()))
        });
        assert_matches!(result, Err(DmTestError::Invalid(_)));
        assert!(registry.live_devices().unwrap().is_empty());
        assert_eq!(
            lifecycle(&registry),
            vec![(SimOp::Create, name.clone()), (SimOp::Remove, name)]
        );
    }

    #[test]
    fn test_scoped_removal_on_panic() {
        let registry = registry();
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            registry.scoped_activate(linear(0, 100), |_| -> DmTestResult<()> {
                panic!("body panicked")
            })
        }));
        assert!(result.is_err());
        assert!(registry.live_devices().unwrap().is_empty());
        assert!(registry.backend().device_names().unwrap().is_empty());
    }

    #[test]
    /// Devices come down in exactly the reverse of the order they went up.
    fn test_scoped_many_reverse_order() {
        let registry = registry();
        let names = registry
            .scoped_activate_many(
                vec![linear(0, 10), linear(10, 10), linear(20, 10)],
                |handles| Ok(handles.iter().map(|h| h.name().to_owned()).collect::<Vec<_>>()),
            )
            .unwrap();

        let mut expected: Vec<(SimOp, String)> =
            names.iter().map(|n| (SimOp::Create, n.clone())).collect();
        expected.extend(names.iter().rev().map(|n| (SimOp::Remove, n.clone())));
        assert_eq!(lifecycle(&registry), expected);
    }

    /// Check that count creates are followed by removal of the same devices
    /// in reverse order.
    fn assert_reverse_removal(registry: &DeviceRegistry<SimBackend>, count: usize) {
        let ops = lifecycle(registry);
        assert_eq!(ops.len(), 2 * count);
        let (creates, removes) = ops.split_at(count);
        assert!(creates.iter().all(|(op, _)| *op == SimOp::Create));
        let expected: Vec<(SimOp, String)> = creates
            .iter()
            .rev()
            .map(|(_, name)| (SimOp::Remove, name.clone()))
            .collect();
        assert_eq!(removes, expected.as_slice());
    }

    #[test]
    /// A failing body still brings the devices down in reverse order.
    fn test_scoped_many_reverse_order_on_error() {
        let registry = registry();
        let result: DmTestResult<()> = registry.scoped_activate_many(
            vec![linear(0, 10), linear(10, 10), linear(20, 10)],
            |handles| {
                assert_eq!(handles.len(), 3);
                Err(DmTestError::Invalid("body failed".into()))
            },
        );
        assert_matches!(result, Err(DmTestError::Invalid(_)));
        assert!(registry.live_devices().unwrap().is_empty());
        assert_reverse_removal(&registry, 3);
    }

    #[test]
    fn test_scoped_many_reverse_order_on_panic() {
        let registry = registry();
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            registry.scoped_activate_many(
                vec![linear(0, 10), linear(10, 10)],
                |_| -> DmTestResult<()> { panic!("body panicked") },
            )
        }));
        assert!(result.is_err());
        assert!(registry.backend().device_names().unwrap().is_empty());
        assert_reverse_removal(&registry, 2);
    }

    #[test]
    /// A failure part way through removes what was already activated.
    fn test_scoped_many_partial_failure() {
        let registry = registry();
        registry
            .backend()
            .fail_next(SimOp::Resume, "linear-2")
            .unwrap();
        let result = registry.scoped_activate_many(
            vec![linear(0, 10), linear(10, 10), linear(20, 10)],
            |_| Ok(()),
        );
        assert_matches!(result, Err(DmTestError::Activation { .. }));
        assert!(registry.live_devices().unwrap().is_empty());
        assert!(registry.backend().device_names().unwrap().is_empty());

        assert_reverse_removal(&registry, 3);
    }

    #[test]
    fn test_overlapping_claims() {
        let registry = registry();
        let first = registry.activate(linear(0, 100)).unwrap();
        let err = registry.activate(linear(99, 10)).unwrap_err();
        assert!(err.is_busy());
        assert_matches!(err, DmTestError::Activation { .. });
        registry.activate(linear(100, 10)).unwrap();
        registry.remove(&first).unwrap();
        registry.activate(linear(50, 10)).unwrap();
        assert_matches!(
            registry.activate(linear(u64::MAX - 5, 10)),
            Err(DmTestError::Activation { .. })
        );
        registry.remove_all().unwrap();
        assert!(registry.live_devices().unwrap().is_empty());
    }

    #[test]
    fn test_references_must_be_active() {
        let registry = registry();
        let table = Table::linear(
            Sectors(10),
            &BlockDevice::Mapped("dmtest-nothing".into()),
            Sectors(0),
        );
        assert_matches!(
            registry.activate(table),
            Err(DmTestError::Activation { .. })
        );
        assert!(registry.backend().journal().unwrap().is_empty());
    }

    #[test]
    /// A device with a device layered on it can not be removed.
    fn test_remove_busy() {
        let registry = registry();
        let lower = registry.activate(linear(0, 100)).unwrap();
        let upper = registry
            .activate(Table::linear(Sectors(50), &lower.device(), Sectors(10)))
            .unwrap();
        assert_matches!(registry.remove(&lower), Err(DmTestError::DeviceBusy(_)));
        registry.remove(&upper).unwrap();
        registry.remove(&lower).unwrap();
        assert_matches!(registry.remove(&lower), Err(DmTestError::Invalid(_)));
    }

    #[test]
    fn test_pause_and_reload() {
        let registry = registry();
        let handle = registry.activate(linear(0, 100)).unwrap();

        assert_matches!(
            registry.reload(&handle, Table::error(Sectors(100))),
            Err(DmTestError::Invalid(_))
        );

        let result: DmTestResult<()> = registry.pause(&handle, || {
            assert!(registry.is_suspended(&handle).unwrap());
            registry.reload(&handle, Table::error(Sectors(100)))?;
            // Still the old table until resumed.
            assert_eq!(registry.table(&handle).unwrap().kind(), TargetKind::Linear);
            Err(DmTestError::Invalid("body failed".into()))
        });
        assert_matches!(result, Err(DmTestError::Invalid(_)));
        assert!(!registry.is_suspended(&handle).unwrap());
        assert_eq!(registry.table(&handle).unwrap().kind(), TargetKind::Error);
        assert_eq!(handle.kind(), TargetKind::Linear);
    }

    #[test]
    /// A teardown failure with a successful body is reported as such.
    fn test_teardown_only_failure() {
        let registry = registry();
        registry.backend().fail_next(SimOp::Remove, "linear").unwrap();
        let result = registry.scoped_activate(linear(0, 100), |_| Ok(3));
        assert_matches!(result, Err(DmTestError::Teardown(_)));
        assert_eq!(registry.live_devices().unwrap().len(), 1);
        registry.remove_all().unwrap();
    }
}
