// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fmt, io::Write};

use log::debug;

use devicemapper::{errors, DevId, DmError, DmFlags, DmName, DmOptions, Sectors, DM};
use nix::errno::Errno;

use crate::{
    engine::{
        dm_engine::{
            cmd::{thin_check, thin_dump, thin_restore, udev_settle},
            writing::{blkdev_size, discard_sectors, wipe_sectors},
        },
        engine::Backend,
        table::Table,
        types::BlockDevice,
    },
    harness::errors::{DmTestError, DmTestResult},
};

/// The kernel's device-mapper, driven through ioctls, with metadata tools
/// run as external commands.
pub struct DmBackend {
    dm: DM,
}

impl fmt::Debug for DmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DmBackend")
    }
}

impl DmBackend {
    pub fn new() -> DmTestResult<DmBackend> {
        Ok(DmBackend { dm: DM::new()? })
    }
}

impl Backend for DmBackend {
    fn create(&self, name: &str) -> DmTestResult<()> {
        debug!("dm create {name}");
        self.dm
            .device_create(DmName::new(name)?, None, DmOptions::default())?;
        Ok(())
    }

    fn load(&self, name: &str, table: &Table) -> DmTestResult<()> {
        debug!("dm load {name}: {table}");
        self.dm.table_load(
            &DevId::Name(DmName::new(name)?),
            &table.to_raw_table(),
            DmOptions::default(),
        )?;
        Ok(())
    }

    fn suspend(&self, name: &str) -> DmTestResult<()> {
        debug!("dm suspend {name}");
        self.dm.device_suspend(
            &DevId::Name(DmName::new(name)?),
            DmOptions::default().set_flags(DmFlags::DM_SUSPEND),
        )?;
        Ok(())
    }

    fn resume(&self, name: &str) -> DmTestResult<()> {
        debug!("dm resume {name}");
        self.dm
            .device_suspend(&DevId::Name(DmName::new(name)?), DmOptions::default())?;
        udev_settle()
    }

    fn remove(&self, name: &str) -> DmTestResult<()> {
        debug!("dm remove {name}");
        udev_settle()?;
        self.dm
            .device_remove(&DevId::Name(DmName::new(name)?), DmOptions::default())?;
        Ok(())
    }

    fn message(
        &self,
        name: &str,
        sector: Option<Sectors>,
        msg: &str,
    ) -> DmTestResult<Option<String>> {
        debug!("dm message {name}: {msg}");
        match self
            .dm
            .target_msg(&DevId::Name(DmName::new(name)?), sector.map(|s| *s), msg)
        {
            Ok((_, reply)) => Ok(reply),
            // The pool reports ids it does not hold with ENODATA.
            Err(DmError::Core(errors::Error::Ioctl(_, _, _, errno)))
                if *errno == Errno::ENODATA =>
            {
                Err(DmTestError::NoData(format!("{name}: \"{msg}\"")))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn status(&self, name: &str) -> DmTestResult<String> {
        let (_, lines) = self
            .dm
            .table_status(&DevId::Name(DmName::new(name)?), DmOptions::default())?;
        Ok(lines
            .into_iter()
            .next()
            .map(|(_, _, _, params)| params)
            .unwrap_or_default())
    }

    fn device_size(&self, dev: &BlockDevice) -> DmTestResult<Sectors> {
        blkdev_size(dev.devnode())
    }

    fn write(&self, dev: &BlockDevice, offset: Sectors, length: Sectors) -> DmTestResult<()> {
        debug!("Writing ({offset}, {length}) of {dev}");
        wipe_sectors(dev.devnode(), offset, length)
    }

    fn discard(&self, dev: &BlockDevice, offset: Sectors, length: Sectors) -> DmTestResult<()> {
        debug!("Discarding ({offset}, {length}) of {dev}");
        discard_sectors(dev.devnode(), offset, length)
    }

    fn dump_metadata(&self, dev: &BlockDevice, held_root: Option<u64>) -> DmTestResult<String> {
        thin_dump(&dev.devnode(), held_root)
    }

    fn restore_metadata(&self, xml: &str, dev: &BlockDevice) -> DmTestResult<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(xml.as_bytes())?;
        file.flush()?;
        thin_restore(file.path(), &dev.devnode())
    }

    fn check_metadata(&self, dev: &BlockDevice) -> DmTestResult<()> {
        thin_check(&dev.devnode())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use devicemapper::{DataBlocks, ThinDevId};

    use crate::engine::{
        dm_engine::{
            cmd::verify_binaries,
            tests::{loopbacked, util::TEST_PREFIX},
        },
        metadata::MetadataDump,
        registry::{DeviceRegistry, RegistryConfig},
        table::{PoolFeatures, PoolParams},
        targets::{PoolControl, ThinControl},
    };

    use super::*;

    /// Activate a pool on two loop devices, provision a thin device
    /// completely, and check the metadata the tools read back afterwards.
    fn test_pool_lifecycle(paths: &[&Path]) {
        verify_binaries().unwrap();
        let backend = DmBackend::new().unwrap();
        let md = BlockDevice::External(paths[0].to_owned());
        let data = BlockDevice::External(paths[1].to_owned());
        backend.write(&md, Sectors(0), Sectors(8)).unwrap();
        let data_size = backend.device_size(&data).unwrap();

        let registry = DeviceRegistry::new(backend, RegistryConfig::new(TEST_PREFIX));
        let table = Table::pool(
            data_size,
            PoolParams::new(
                md.clone(),
                data,
                Sectors(128),
                DataBlocks(5),
                PoolFeatures::default(),
            ),
        );
        registry
            .scoped_activate(table, |pool| {
                let control = PoolControl::new(&registry, pool)?;
                let id = ThinDevId::new_u64(0)?;
                control.create_thin(id)?;
                registry.scoped_activate(
                    Table::thin(Sectors(128 * 16), &pool.device(), id),
                    |thin| ThinControl::new(&registry, thin)?.wipe(),
                )?;
                assert_eq!(*control.status()?.used_data_blocks, 16);
                Ok(())
            })
            .unwrap();
        assert!(registry.live_devices().unwrap().is_empty());

        registry.backend().check_metadata(&md).unwrap();
        let dump =
            MetadataDump::parse(&registry.backend().dump_metadata(&md, None).unwrap()).unwrap();
        assert_eq!(dump.device(0).map(|d| d.mapped_blocks), Some(16));
    }

    #[test]
    #[ignore = "needs root, loop devices and thin-provisioning-tools"]
    fn loop_test_pool_lifecycle() {
        loopbacked::test_with_spec(2, None, test_pool_lifecycle);
    }

    /// The kernel refuses a second pool on metadata already in use.
    fn test_metadata_in_use(paths: &[&Path]) {
        let backend = DmBackend::new().unwrap();
        let md = BlockDevice::External(paths[0].to_owned());
        backend.write(&md, Sectors(0), Sectors(8)).unwrap();
        let registry = DeviceRegistry::new(backend, RegistryConfig::new(TEST_PREFIX));

        let pool_table = |data: &Path| {
            Table::pool(
                Sectors(128 * 1024),
                PoolParams::new(
                    md.clone(),
                    BlockDevice::External(data.to_owned()),
                    Sectors(128),
                    DataBlocks(5),
                    PoolFeatures::default(),
                ),
            )
        };
        let first = registry.activate(pool_table(paths[1])).unwrap();
        assert!(registry.activate(pool_table(paths[2])).is_err());
        registry.remove(&first).unwrap();
    }

    #[test]
    #[ignore = "needs root and loop devices"]
    fn loop_test_metadata_in_use() {
        loopbacked::test_with_spec(3, None, test_metadata_in_use);
    }
}
