// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Compositions of the core used by most thin-provisioning scenarios.

use log::{debug, info};

use devicemapper::{DataBlocks, Sectors, ThinDevId};

use crate::{
    engine::{
        self, Backend, BlockDevice, CacheParams, DeviceHandle, DeviceRegistry, MetadataDump,
        PoolControl, PoolFeatures, PoolParams, RegistryConfig, Table, ThinControl,
        VolumeAllocator,
    },
    harness::{
        config::HarnessConfig,
        errors::{DmTestError, DmTestResult},
    },
};

/// Largest metadata device a pool makes use of.
const MAX_METADATA_DEV_SIZE: Sectors = Sectors(8_355_840);

/// Sectors zeroed at the start of a metadata device to get a fresh pool.
const METADATA_WIPE: Sectors = Sectors(8);

/// Size of the metadata volume of the standard cache.
const CACHE_METADATA_SIZE: Sectors = Sectors(8192);

/// Cap a metadata device size at the largest size a pool uses.
pub fn limit_metadata_dev_size(size: Sectors) -> Sectors {
    size.min(MAX_METADATA_DEV_SIZE)
}

/// Run op on every item concurrently; see engine::in_parallel.
pub fn in_parallel<I, T, F>(items: Vec<I>, op: F) -> DmTestResult<Vec<T>>
where
    I: Send,
    T: Send,
    F: Fn(I) -> DmTestResult<T> + Sync,
{
    engine::in_parallel(items, op)
}

fn round_up(value: Sectors, multiple: Sectors) -> Sectors {
    Sectors((*value).div_ceil(*multiple) * *multiple)
}

/// A configured pair of metadata and data devices with a registry that
/// activates devices on them.
#[derive(Debug)]
pub struct Harness<B: Backend> {
    config: HarnessConfig,
    registry: DeviceRegistry<B>,
}

impl<B: Backend> Harness<B> {
    /// Set up a harness. The start of the metadata device is zeroed so that
    /// the first pool gets fresh metadata.
    pub fn new(config: HarnessConfig, backend: B) -> DmTestResult<Harness<B>> {
        let registry = DeviceRegistry::new(backend, RegistryConfig::new(&config.name_prefix));
        let harness = Harness { config, registry };
        harness.wipe_device(&harness.config.metadata_dev, Some(METADATA_WIPE))?;
        Ok(harness)
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry<B> {
        &self.registry
    }

    pub fn backend(&self) -> &B {
        self.registry.backend()
    }

    pub fn pool_control<'a>(&'a self, pool: &'a DeviceHandle) -> DmTestResult<PoolControl<'a, B>> {
        PoolControl::new(&self.registry, pool)
    }

    pub fn thin_control<'a>(&'a self, thin: &'a DeviceHandle) -> DmTestResult<ThinControl<'a, B>> {
        ThinControl::new(&self.registry, thin)
    }

    /// The table of a pool of size sectors over the configured devices.
    pub fn standard_pool_table(&self, size: Sectors, opts: PoolFeatures) -> Table {
        Table::pool(
            size,
            PoolParams::new(
                self.config.metadata_dev.clone(),
                self.config.data_dev.clone(),
                self.config.data_block_size,
                DataBlocks(self.config.low_water_mark),
                opts,
            ),
        )
    }

    /// Run body with a pool of size sectors on the configured devices.
    pub fn with_standard_pool<T, F>(&self, size: Sectors, opts: PoolFeatures, body: F) -> DmTestResult<T>
    where
        F: FnOnce(&DeviceHandle) -> DmTestResult<T>,
    {
        self.registry
            .scoped_activate(self.standard_pool_table(size, opts), body)
    }

    /// Run body with the existing thin device id of the pool active.
    pub fn with_thin<T, F>(
        &self,
        pool: &DeviceHandle,
        size: Sectors,
        id: ThinDevId,
        body: F,
    ) -> DmTestResult<T>
    where
        F: FnOnce(&DeviceHandle) -> DmTestResult<T>,
    {
        self.registry
            .scoped_activate(Table::thin(size, &pool.device(), id), body)
    }

    /// Create thin device id in the pool and run body with it active.
    pub fn with_new_thin<T, F>(
        &self,
        pool: &DeviceHandle,
        size: Sectors,
        id: ThinDevId,
        body: F,
    ) -> DmTestResult<T>
    where
        F: FnOnce(&DeviceHandle) -> DmTestResult<T>,
    {
        self.pool_control(pool)?.create_thin(id)?;
        self.with_thin(pool, size, id, body)
    }

    /// Run body with the existing thin devices ids of the pool active, in
    /// the order given.
    pub fn with_thins<T, F>(
        &self,
        pool: &DeviceHandle,
        size: Sectors,
        ids: &[ThinDevId],
        body: F,
    ) -> DmTestResult<T>
    where
        F: FnOnce(&[DeviceHandle]) -> DmTestResult<T>,
    {
        let pool_dev = pool.device();
        let tables = ids
            .iter()
            .map(|id| Table::thin(size, &pool_dev, *id))
            .collect();
        self.registry.scoped_activate_many(tables, body)
    }

    pub fn with_new_thins<T, F>(
        &self,
        pool: &DeviceHandle,
        size: Sectors,
        ids: &[ThinDevId],
        body: F,
    ) -> DmTestResult<T>
    where
        F: FnOnce(&[DeviceHandle]) -> DmTestResult<T>,
    {
        let control = self.pool_control(pool)?;
        for id in ids {
            control.create_thin(*id)?;
        }
        self.with_thins(pool, size, ids, body)
    }

    /// Snapshot origin as id and run body with the snapshot active. If the
    /// origin is active, pass its handle so that it is paused while the
    /// snapshot is taken.
    pub fn with_new_snap<T, F>(
        &self,
        pool: &DeviceHandle,
        size: Sectors,
        id: ThinDevId,
        origin: ThinDevId,
        active_origin: Option<&DeviceHandle>,
        body: F,
    ) -> DmTestResult<T>
    where
        F: FnOnce(&DeviceHandle) -> DmTestResult<T>,
    {
        let control = self.pool_control(pool)?;
        match active_origin {
            Some(handle) => control.create_snap_paused(id, origin, handle)?,
            None => control.create_snap(id, origin)?,
        }
        self.with_thin(pool, size, id, body)
    }

    /// Run body with a linear device over the start of the data device.
    pub fn with_standard_linear<T, F>(&self, body: F) -> DmTestResult<T>
    where
        F: FnOnce(&DeviceHandle) -> DmTestResult<T>,
    {
        self.registry.scoped_activate(
            Table::linear(self.config.data_size, &self.config.data_dev, Sectors(0)),
            body,
        )
    }

    /// Run body with the data device cached. The cache and its metadata
    /// are carved from the metadata device; the cache is at most a
    /// sixteenth of the data size.
    pub fn with_standard_cache<T, F>(&self, body: F) -> DmTestResult<T>
    where
        F: FnOnce(&DeviceHandle) -> DmTestResult<T>,
    {
        let block_size = self.config.data_block_size;
        let md_size = self.backend().device_size(&self.config.metadata_dev)?;
        let mut allocator = VolumeAllocator::new();
        allocator.add_allocation_source(self.config.metadata_dev.clone(), Sectors(0), md_size)?;
        allocator.add_volume("cache_metadata", CACHE_METADATA_SIZE)?;
        let cache_size = allocator
            .free_space()
            .min(round_up(Sectors(*self.config.data_size / 16), block_size));
        allocator.add_volume("cache", cache_size)?;

        let origin_size = self.backend().device_size(&self.config.data_dev)?;
        self.registry.scoped_activate_many(
            vec![
                allocator.table_for("cache_metadata")?,
                allocator.table_for("cache")?,
            ],
            |volumes| {
                self.wipe_device(&volumes[0].device(), Some(METADATA_WIPE))?;
                let params = CacheParams::new(
                    volumes[0].device(),
                    volumes[1].device(),
                    self.config.data_dev.clone(),
                    block_size,
                );
                self.registry
                    .scoped_activate(Table::cache(origin_size, params), body)
            },
        )
    }

    /// Build a pool from dev, or its first max_size sectors, and run body
    /// with a thin device as large as the pool. A sixteenth of the space
    /// goes to metadata.
    pub fn with_pool_volume<T, F>(
        &self,
        dev: &BlockDevice,
        max_size: Option<Sectors>,
        body: F,
    ) -> DmTestResult<T>
    where
        F: FnOnce(&DeviceHandle) -> DmTestResult<T>,
    {
        let block_size = self.config.data_block_size;
        let dev_size = self.backend().device_size(dev)?;
        let size = max_size.map_or(dev_size, |max| dev_size.min(max));

        let mut allocator = VolumeAllocator::new();
        allocator.add_allocation_source(dev.clone(), Sectors(0), size)?;
        allocator.add_volume("md", Sectors(*allocator.free_space() / 16))?;
        let data_size = Sectors(*allocator.free_space() / *block_size * *block_size);
        allocator.add_volume("data", data_size)?;
        debug!("Pool volume on {dev}: data {data_size}");

        self.registry.scoped_activate_many(
            vec![allocator.table_for("md")?, allocator.table_for("data")?],
            |volumes| {
                self.wipe_device(&volumes[0].device(), Some(METADATA_WIPE))?;
                let table = Table::pool(
                    data_size,
                    PoolParams::new(
                        volumes[0].device(),
                        volumes[1].device(),
                        block_size,
                        DataBlocks(0),
                        PoolFeatures::default(),
                    ),
                );
                self.registry.scoped_activate(table, |pool| {
                    self.with_new_thin(pool, data_size, ThinDevId::new_u64(0)?, body)
                })
            },
        )
    }

    /// Check that the table can not be activated.
    pub fn assert_bad_table(&self, table: Table) -> DmTestResult<()> {
        match self.registry.activate(table) {
            Ok(handle) => {
                let name = handle.name().to_owned();
                self.registry.remove(&handle)?;
                Err(DmTestError::Invalid(format!(
                    "table was unexpectedly accepted as {name}"
                )))
            }
            Err(DmTestError::Activation { name, source }) => {
                info!("Table for {name} rejected as expected: {source}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub fn trans_id(&self, pool: &DeviceHandle) -> DmTestResult<u64> {
        Ok(self.pool_control(pool)?.status()?.transaction_id)
    }

    pub fn set_trans_id(&self, pool: &DeviceHandle, old: u64, new: u64) -> DmTestResult<()> {
        self.pool_control(pool)?.set_transaction_id(old, new)
    }

    /// Replace the live table of the device with an error target of the
    /// same length.
    pub fn reload_with_error_target(&self, handle: &DeviceHandle) -> DmTestResult<()> {
        let length = self.registry.table(handle)?.length();
        self.registry.pause(handle, || {
            self.registry.reload(handle, Table::error(length))
        })
    }

    /// Write the first sectors of dev, all of it if not specified.
    pub fn wipe_device(&self, dev: &BlockDevice, sectors: Option<Sectors>) -> DmTestResult<()> {
        let length = match sectors {
            Some(sectors) => sectors,
            None => self.backend().device_size(dev)?,
        };
        self.backend().write(dev, Sectors(0), length)
    }

    /// The metadata on dev as thin_dump XML. The pool using it should be
    /// inactive, unless a held root is read.
    pub fn dump_metadata(&self, dev: &BlockDevice, held_root: Option<u64>) -> DmTestResult<String> {
        self.backend().dump_metadata(dev, held_root)
    }

    pub fn read_metadata(&self, dev: &BlockDevice) -> DmTestResult<MetadataDump> {
        MetadataDump::parse(&self.dump_metadata(dev, None)?)
    }

    /// Read the metadata snapshot the live pool reports as its held root.
    pub fn read_held_root(&self, pool: &DeviceHandle, dev: &BlockDevice) -> DmTestResult<MetadataDump> {
        let held_root = self
            .pool_control(pool)?
            .status()?
            .held_root
            .ok_or_else(|| DmTestError::Invalid(format!("pool {} holds no root", pool.name())))?;
        MetadataDump::parse(&self.dump_metadata(dev, Some(held_root))?)
    }

    pub fn restore_metadata(&self, xml: &str, dev: &BlockDevice) -> DmTestResult<()> {
        self.backend().restore_metadata(xml, dev)
    }
}
