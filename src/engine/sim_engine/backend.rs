// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Mutex,
};

use indexmap::IndexMap;
use log::debug;

use devicemapper::Sectors;

use crate::{
    engine::{
        engine::Backend,
        metadata::MetadataDump,
        sim_engine::pool::SimPool,
        table::{PoolParams, Table, TargetParams},
        types::BlockDevice,
    },
    harness::errors::{DmTestError, DmTestResult},
};

/// Where pool metadata lives: the device at the bottom of any stack of
/// linear devices, and the offset into it.
type Location = (BlockDevice, u64);

/// The control-plane operations recorded in the journal.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum_macros::Display)]
pub enum SimOp {
    Create,
    Load,
    Suspend,
    Resume,
    Remove,
    Message,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JournalEntry {
    pub op: SimOp,
    pub name: String,
}

#[derive(Debug, Default)]
struct SimDevice {
    active: Option<Table>,
    inactive: Option<Table>,
    suspended: bool,
}

#[derive(Debug, Default)]
struct SimState {
    disks: HashMap<PathBuf, Sectors>,
    devices: IndexMap<String, SimDevice>,
    pools: HashMap<Location, SimPool>,
    journal: Vec<JournalEntry>,
    injected: Vec<(SimOp, String)>,
}

fn no_device(name: &str) -> DmTestError {
    DmTestError::Backend(format!("No such device or address: {name}"))
}

fn busy(name: &str) -> DmTestError {
    DmTestError::Backend(format!("Device or resource busy: {name}"))
}

fn suspended_io(name: &str) -> DmTestError {
    DmTestError::Backend(format!("I/O to suspended device {name}"))
}

impl SimState {
    fn device(&self, name: &str) -> DmTestResult<&SimDevice> {
        self.devices.get(name).ok_or_else(|| no_device(name))
    }

    fn device_mut(&mut self, name: &str) -> DmTestResult<&mut SimDevice> {
        self.devices.get_mut(name).ok_or_else(|| no_device(name))
    }

    fn active_table(&self, name: &str) -> DmTestResult<&Table> {
        self.device(name)?
            .active
            .as_ref()
            .ok_or_else(|| DmTestError::Backend(format!("device {name} has no live table")))
    }

    /// Fail if an injected failure matches this call, consuming it.
    fn check_injected(&mut self, op: SimOp, name: &str) -> DmTestResult<()> {
        if let Some(index) = self
            .injected
            .iter()
            .position(|(o, fragment)| *o == op && name.contains(fragment.as_str()))
        {
            self.injected.remove(index);
            debug!("Injecting {op} failure on {name}");
            return Err(DmTestError::Backend(format!(
                "injected {op} failure on {name}"
            )));
        }
        Ok(())
    }

    fn record(&mut self, op: SimOp, name: &str) {
        self.journal.push(JournalEntry {
            op,
            name: name.to_owned(),
        });
    }

    fn size(&self, dev: &BlockDevice) -> DmTestResult<Sectors> {
        match dev {
            BlockDevice::External(path) => self
                .disks
                .get(path)
                .copied()
                .ok_or_else(|| no_device(&path.display().to_string())),
            BlockDevice::Mapped(name) => Ok(self.active_table(name)?.length()),
        }
    }

    fn resolve(&self, dev: &BlockDevice) -> DmTestResult<Location> {
        match dev {
            BlockDevice::External(_) => {
                self.size(dev)?;
                Ok((dev.clone(), 0))
            }
            BlockDevice::Mapped(name) => match self.active_table(name)?.params() {
                TargetParams::Linear(params) => {
                    let (base, offset) = self.resolve(&params.device)?;
                    Ok((base, offset + *params.offset))
                }
                _ => Ok((dev.clone(), 0)),
            },
        }
    }

    /// Metadata locations of every pool table loaded, live or staged,
    /// except those of the named device.
    fn pool_locations(&self, except: Option<&str>) -> HashSet<Location> {
        self.devices
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != except)
            .flat_map(|(_, dev)| dev.active.iter().chain(dev.inactive.iter()))
            .filter_map(|table| match table.params() {
                TargetParams::Pool(params) => self.resolve(&params.metadata_dev).ok(),
                _ => None,
            })
            .collect()
    }

    /// Whether any table, other than the named device's own, names the
    /// device.
    fn is_referenced(&self, name: &str) -> bool {
        let dev = BlockDevice::Mapped(name.to_owned());
        self.devices
            .iter()
            .filter(|(other, _)| other.as_str() != name)
            .flat_map(|(_, d)| d.active.iter().chain(d.inactive.iter()))
            .any(|table| table.references().contains(&&dev))
    }

    /// Whether a loaded thin table opens thin_id in the named pool.
    fn thin_is_open(&self, pool_name: &str, thin_id: u32) -> bool {
        let pool_dev = BlockDevice::Mapped(pool_name.to_owned());
        self.devices
            .values()
            .flat_map(|d| d.active.iter().chain(d.inactive.iter()))
            .any(|table| match table.params() {
                TargetParams::Thin(params) => {
                    params.pool == pool_dev && u32::from(params.thin_id) == thin_id
                }
                _ => false,
            })
    }

    /// The live pool table and the location of its metadata.
    fn pool_of(&self, name: &str) -> DmTestResult<(&PoolParams, Location)> {
        match self.active_table(name)?.params() {
            TargetParams::Pool(params) => {
                let location = self.resolve(&params.metadata_dev)?;
                Ok((params, location))
            }
            _ => Err(DmTestError::Backend(format!(
                "Invalid argument: {name} is not a pool"
            ))),
        }
    }

    fn check_pool_load(&mut self, name: &str, table: &Table, params: &PoolParams) -> DmTestResult<()> {
        let data_size = self.size(&params.data_dev)?;
        if data_size < table.length() {
            return Err(DmTestError::Backend(format!(
                "Invalid argument: data device {} ({}) smaller than pool ({})",
                params.data_dev,
                data_size,
                table.length()
            )));
        }
        self.size(&params.metadata_dev)?;

        let location = self.resolve(&params.metadata_dev)?;
        if self.pool_locations(Some(name)).contains(&location) {
            return Err(busy(&format!(
                "metadata device {} already in use by a pool",
                params.metadata_dev
            )));
        }

        let nr_data_blocks = *table.length() / *params.data_block_size;
        match self.pools.get(&location) {
            Some(pool) => {
                if pool.data_block_size() != params.data_block_size {
                    return Err(DmTestError::Backend(format!(
                        "Invalid argument: pool data block size {} does not match metadata block size {}",
                        params.data_block_size,
                        pool.data_block_size()
                    )));
                }
                if nr_data_blocks < pool.nr_data_blocks() {
                    return Err(DmTestError::Backend(format!(
                        "Invalid argument: pool target ({} blocks) too small: expected {}",
                        nr_data_blocks,
                        pool.nr_data_blocks()
                    )));
                }
            }
            None => {
                debug!("Formatting pool metadata on {}", params.metadata_dev);
                self.pools
                    .insert(location, SimPool::new(params.data_block_size));
            }
        }
        Ok(())
    }

    fn check_load(&mut self, name: &str, table: &Table) -> DmTestResult<()> {
        table.validate()?;
        for dev in table.references() {
            if dev.mapped_name() == Some(name) {
                return Err(DmTestError::Backend(format!(
                    "Invalid argument: {name} can not map onto itself"
                )));
            }
            self.size(dev)?;
        }

        match table.params() {
            TargetParams::Linear(params) => {
                let size = self.size(&params.device)?;
                if params.offset + table.length() > size {
                    return Err(DmTestError::Backend(format!(
                        "Invalid argument: device {} ({}) too small for target",
                        params.device, size
                    )));
                }
            }
            TargetParams::Pool(params) => self.check_pool_load(name, table, params)?,
            TargetParams::Thin(params) => {
                let pool_name = params.pool.mapped_name().ok_or_else(|| {
                    DmTestError::Backend(format!("Invalid argument: {} is not a pool", params.pool))
                })?;
                let (_, location) = self.pool_of(pool_name)?;
                let id = u32::from(params.thin_id);
                if !self.pools.get(&location).is_some_and(|p| p.has_thin(id)) {
                    return Err(DmTestError::Backend(format!(
                        "No data available: couldn't open thin internal device {id}"
                    )));
                }
            }
            TargetParams::Snapshot(_) | TargetParams::Cache(_) | TargetParams::Error => (),
        }
        Ok(())
    }

    fn pool_status(&self, params: &PoolParams, location: &Location) -> String {
        let pool = match self.pools.get(location) {
            Some(pool) => pool,
            None => return "Fail".to_owned(),
        };
        let total_meta = self
            .size(&params.metadata_dev)
            .map(|s| *s / 8)
            .unwrap_or(0);
        let mode = if params.features.read_only {
            "ro"
        } else if pool.is_out_of_space() {
            "out_of_data_space"
        } else {
            "rw"
        };
        let passdown = if params.features.discard && params.features.discard_passdown {
            "discard_passdown"
        } else {
            "no_discard_passdown"
        };
        format!(
            "{} {}/{} {}/{} {} {} {} queue_if_no_space - {}",
            pool.transaction_id(),
            pool.used_metadata_blocks(),
            total_meta.max(pool.used_metadata_blocks()),
            pool.used_data_blocks(),
            pool.nr_data_blocks(),
            pool.held_root().map_or("-".to_owned(), |r| r.to_string()),
            mode,
            passdown,
            total_meta / 4
        )
    }

    fn status(&self, name: &str) -> DmTestResult<String> {
        let table = match &self.device(name)?.active {
            Some(table) => table,
            None => return Ok(String::new()),
        };
        Ok(match table.params() {
            TargetParams::Pool(params) => {
                let location = self.resolve(&params.metadata_dev)?;
                self.pool_status(params, &location)
            }
            TargetParams::Thin(params) => {
                let usage = params
                    .pool
                    .mapped_name()
                    .and_then(|pool_name| self.pool_of(pool_name).ok())
                    .and_then(|(_, location)| self.pools.get(&location))
                    .and_then(|pool| pool.thin_usage(u32::from(params.thin_id)));
                match usage {
                    Some((mapped, Some(highest))) => format!("{} {}", *mapped, *highest),
                    Some((mapped, None)) => format!("{} -", *mapped),
                    None => "Fail".to_owned(),
                }
            }
            TargetParams::Snapshot(params) => {
                format!("0/{} 0", *self.size(&params.cow)?)
            }
            TargetParams::Cache(params) => {
                let nr_blocks = *table.length() / *params.block_size;
                format!(
                    "8 27/{} {} 0/{} 0 0 0 0 0 0 0 1 writethrough 2 migration_threshold 2048 {} 0 rw -",
                    *self.size(&params.metadata_dev)? / 8,
                    *params.block_size,
                    nr_blocks,
                    params.policy
                )
            }
            TargetParams::Linear(_) | TargetParams::Error => String::new(),
        })
    }

    fn message(&mut self, name: &str, msg: &str) -> DmTestResult<()> {
        let (params, location) = self.pool_of(name)?;
        if params.features.read_only {
            return Err(DmTestError::Backend(format!(
                "Operation not permitted: pool {name} is read only"
            )));
        }

        let words: Vec<&str> = msg.split_whitespace().collect();
        let number = |word: &str| -> DmTestResult<u64> {
            word.parse::<u64>().map_err(|_| {
                DmTestError::Backend(format!("Invalid argument: bad number \"{word}\" in \"{msg}\""))
            })
        };
        let thin_id = |word: &str| -> DmTestResult<u32> {
            u32::try_from(number(word)?).map_err(|_| {
                DmTestError::Backend(format!("Invalid argument: thin id {word} too large"))
            })
        };

        let open = match words.as_slice() {
            ["delete", id] => self.thin_is_open(name, thin_id(*id)?),
            _ => false,
        };
        let pool = self.pools.get_mut(&location).ok_or_else(|| {
            DmTestError::Backend(format!("Input/output error: pool {name} has no metadata"))
        })?;

        match words.as_slice() {
            ["create_thin", id] => pool.create_thin(thin_id(*id)?),
            ["create_snap", id, origin] => pool.create_snap(thin_id(*id)?, thin_id(*origin)?),
            ["delete", id] => pool.delete(thin_id(*id)?, open),
            ["set_transaction_id", old, new] => {
                pool.set_transaction_id(number(*old)?, number(*new)?)
            }
            ["reserve_metadata_snap"] => pool.reserve_metadata_snap(),
            ["release_metadata_snap"] => pool.release_metadata_snap(),
            _ => Err(DmTestError::Backend(format!(
                "Invalid argument: unrecognised pool message \"{msg}\""
            ))),
        }
    }

    /// Forget pool metadata whose first sector lies in the written range of
    /// a device, unless a loaded pool holds it.
    fn wipe_metadata(&mut self, dev: &BlockDevice, offset: Sectors, length: Sectors) {
        let in_use = self.pool_locations(None);
        self.pools.retain(|(base, start), _| {
            let hit = base == dev && *offset <= *start && *start < *offset + *length;
            if hit && !in_use.contains(&(base.clone(), *start)) {
                debug!("Write to {dev} wiped pool metadata at sector {start}");
                return false;
            }
            true
        });
    }

    /// The thin device's pool metadata, if the pool is live and writable.
    fn thin_pool_mut(&mut self, name: &str, params_pool: &BlockDevice) -> DmTestResult<&mut SimPool> {
        let pool_name = params_pool
            .mapped_name()
            .ok_or_else(|| no_device(&params_pool.to_string()))?;
        if self.device(pool_name)?.suspended {
            return Err(suspended_io(pool_name));
        }
        let (pool_params, location) = self
            .pool_of(pool_name)
            .map_err(|_| DmTestError::Backend(format!("Input/output error: pool of {name} failed")))?;
        if pool_params.features.read_only {
            return Err(DmTestError::Backend(format!(
                "Input/output error: pool {pool_name} is read only"
            )));
        }
        self.pools
            .get_mut(&location)
            .ok_or_else(|| DmTestError::Backend(format!("Input/output error: pool of {name} failed")))
    }

    fn write(&mut self, dev: &BlockDevice, offset: Sectors, length: Sectors) -> DmTestResult<()> {
        let size = self.size(dev)?;
        if offset + length > size {
            return Err(DmTestError::Backend(format!(
                "No space left on device: write ({offset}, {length}) beyond end of {dev} ({size})"
            )));
        }

        let name = match dev.mapped_name() {
            Some(name) => name,
            None => {
                self.wipe_metadata(dev, offset, length);
                return Ok(());
            }
        };
        if self.device(name)?.suspended {
            return Err(suspended_io(name));
        }

        match self.active_table(name)?.params().clone() {
            TargetParams::Linear(params) => self.write(&params.device, params.offset + offset, length),
            TargetParams::Thin(params) => {
                self.wipe_metadata(dev, offset, length);
                let id = u32::from(params.thin_id);
                self.thin_pool_mut(name, &params.pool)?.write(id, offset, length)
            }
            TargetParams::Error => Err(DmTestError::Backend(format!(
                "Input/output error: write to error target {name}"
            ))),
            TargetParams::Pool(_) | TargetParams::Snapshot(_) | TargetParams::Cache(_) => {
                self.wipe_metadata(dev, offset, length);
                Ok(())
            }
        }
    }

    fn discard(&mut self, dev: &BlockDevice, offset: Sectors, length: Sectors) -> DmTestResult<()> {
        let size = self.size(dev)?;
        if offset + length > size {
            return Err(DmTestError::Backend(format!(
                "Invalid argument: discard ({offset}, {length}) beyond end of {dev} ({size})"
            )));
        }

        let name = match dev.mapped_name() {
            Some(name) => name,
            None => return Ok(()),
        };
        if self.device(name)?.suspended {
            return Err(suspended_io(name));
        }

        match self.active_table(name)?.params().clone() {
            TargetParams::Linear(params) => {
                self.discard(&params.device, params.offset + offset, length)
            }
            TargetParams::Thin(params) => {
                let pool_name = params.pool.mapped_name().unwrap_or_default().to_owned();
                let (pool_params, _) = self.pool_of(&pool_name)?;
                if !pool_params.features.discard {
                    return Ok(());
                }
                let id = u32::from(params.thin_id);
                self.thin_pool_mut(name, &params.pool)?.discard(id, offset, length)
            }
            TargetParams::Error => Err(DmTestError::Backend(format!(
                "Input/output error: discard to error target {name}"
            ))),
            TargetParams::Pool(_) | TargetParams::Snapshot(_) | TargetParams::Cache(_) => Ok(()),
        }
    }
}

/// An in-memory model of the device-mapper targets. Pool metadata is kept
/// per metadata location and outlives the devices that use it, as it would
/// on disk.
#[derive(Debug, Default)]
pub struct SimBackend {
    state: Mutex<SimState>,
}

impl SimBackend {
    pub fn new() -> SimBackend {
        SimBackend::default()
    }

    /// Make an external disk of the given size available.
    pub fn add_disk<P: Into<PathBuf>>(&self, path: P, size: Sectors) -> DmTestResult<()> {
        let path = path.into();
        let mut state = self.state.lock()?;
        if state.disks.contains_key(&path) {
            return Err(DmTestError::Invalid(format!(
                "disk {} already exists",
                path.display()
            )));
        }
        state.disks.insert(path, size);
        Ok(())
    }

    /// Make the next op on a device whose name contains fragment fail.
    pub fn fail_next(&self, op: SimOp, fragment: &str) -> DmTestResult<()> {
        self.state.lock()?.injected.push((op, fragment.to_owned()));
        Ok(())
    }

    /// Every successful control-plane call, oldest first.
    pub fn journal(&self) -> DmTestResult<Vec<JournalEntry>> {
        Ok(self.state.lock()?.journal.clone())
    }

    pub fn clear_journal(&self) -> DmTestResult<()> {
        self.state.lock()?.journal.clear();
        Ok(())
    }

    /// Names of all existing devices, in creation order.
    pub fn device_names(&self) -> DmTestResult<Vec<String>> {
        Ok(self.state.lock()?.devices.keys().cloned().collect())
    }
}

impl Backend for SimBackend {
    fn create(&self, name: &str) -> DmTestResult<()> {
        let mut state = self.state.lock()?;
        state.check_injected(SimOp::Create, name)?;
        if state.devices.contains_key(name) {
            return Err(DmTestError::Backend(format!(
                "File exists: device {name} already exists"
            )));
        }
        state.devices.insert(name.to_owned(), SimDevice::default());
        state.record(SimOp::Create, name);
        Ok(())
    }

    fn load(&self, name: &str, table: &Table) -> DmTestResult<()> {
        let mut state = self.state.lock()?;
        state.check_injected(SimOp::Load, name)?;
        state.device(name)?;
        state.check_load(name, table)?;
        state.device_mut(name)?.inactive = Some(table.clone());
        state.record(SimOp::Load, name);
        Ok(())
    }

    fn suspend(&self, name: &str) -> DmTestResult<()> {
        let mut state = self.state.lock()?;
        state.check_injected(SimOp::Suspend, name)?;
        state.device_mut(name)?.suspended = true;
        state.record(SimOp::Suspend, name);
        Ok(())
    }

    fn resume(&self, name: &str) -> DmTestResult<()> {
        let mut state = self.state.lock()?;
        state.check_injected(SimOp::Resume, name)?;

        if let Some(table) = state.device(name)?.inactive.clone() {
            if let TargetParams::Pool(params) = table.params() {
                let location = state.resolve(&params.metadata_dev)?;
                let nr_data_blocks = *table.length() / *params.data_block_size;
                state
                    .pools
                    .get_mut(&location)
                    .ok_or_else(|| {
                        DmTestError::Backend(format!("Input/output error: {name} lost its metadata"))
                    })?
                    .set_nr_data_blocks(nr_data_blocks)?;
            }
            let device = state.device_mut(name)?;
            device.active = Some(table);
            device.inactive = None;
        }
        state.device_mut(name)?.suspended = false;
        state.record(SimOp::Resume, name);
        Ok(())
    }

    fn remove(&self, name: &str) -> DmTestResult<()> {
        let mut state = self.state.lock()?;
        state.check_injected(SimOp::Remove, name)?;
        state.device(name)?;
        if state.is_referenced(name) {
            return Err(busy(name));
        }
        state.devices.shift_remove(name);
        state.record(SimOp::Remove, name);
        Ok(())
    }

    fn message(
        &self,
        name: &str,
        _sector: Option<Sectors>,
        msg: &str,
    ) -> DmTestResult<Option<String>> {
        let mut state = self.state.lock()?;
        state.check_injected(SimOp::Message, name)?;
        state.message(name, msg)?;
        state.record(SimOp::Message, name);
        Ok(None)
    }

    fn status(&self, name: &str) -> DmTestResult<String> {
        self.state.lock()?.status(name)
    }

    fn device_size(&self, dev: &BlockDevice) -> DmTestResult<Sectors> {
        self.state.lock()?.size(dev)
    }

    fn write(&self, dev: &BlockDevice, offset: Sectors, length: Sectors) -> DmTestResult<()> {
        self.state.lock()?.write(dev, offset, length)
    }

    fn discard(&self, dev: &BlockDevice, offset: Sectors, length: Sectors) -> DmTestResult<()> {
        self.state.lock()?.discard(dev, offset, length)
    }

    fn dump_metadata(&self, dev: &BlockDevice, held_root: Option<u64>) -> DmTestResult<String> {
        let state = self.state.lock()?;
        let location = state.resolve(dev)?;
        let pool = state.pools.get(&location).ok_or_else(|| {
            DmTestError::Backend(format!("bad checksum in superblock on {dev}"))
        })?;
        Ok(pool.dump(held_root)?.to_xml())
    }

    fn restore_metadata(&self, xml: &str, dev: &BlockDevice) -> DmTestResult<()> {
        let dump = MetadataDump::parse(xml)?;
        let mut state = self.state.lock()?;
        let location = state.resolve(dev)?;
        if state.pool_locations(None).contains(&location) {
            return Err(busy(&dev.to_string()));
        }
        let pool = SimPool::restore(&dump)?;
        state.pools.insert(location, pool);
        Ok(())
    }

    fn check_metadata(&self, dev: &BlockDevice) -> DmTestResult<()> {
        let state = self.state.lock()?;
        let location = state.resolve(dev)?;
        state
            .pools
            .get(&location)
            .ok_or_else(|| DmTestError::Backend(format!("bad checksum in superblock on {dev}")))?
            .check()
    }
}
