// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Typed control of pool and thin devices. Pool changes are made with
// messages to the live pool, never by reloading its table.

use log::debug;

use devicemapper::{Sectors, ThinDevId};

use crate::{
    engine::{
        engine::Backend,
        registry::{DeviceHandle, DeviceRegistry},
        status::{PoolStatus, ThinStatus},
        table::TargetParams,
        types::TargetKind,
    },
    harness::errors::{DmTestError, DmTestResult},
};

fn check_kind(handle: &DeviceHandle, kind: TargetKind) -> DmTestResult<()> {
    if handle.kind() != kind {
        return Err(DmTestError::Invalid(format!(
            "device {} is a {} device, not a {} device",
            handle.name(),
            handle.kind(),
            kind
        )));
    }
    Ok(())
}

/// Control messages for an active pool.
#[derive(Debug)]
pub struct PoolControl<'a, B: Backend> {
    registry: &'a DeviceRegistry<B>,
    pool: &'a DeviceHandle,
}

impl<'a, B: Backend> PoolControl<'a, B> {
    pub fn new(registry: &'a DeviceRegistry<B>, pool: &'a DeviceHandle) -> DmTestResult<Self> {
        check_kind(pool, TargetKind::Pool)?;
        Ok(PoolControl { registry, pool })
    }

    pub fn handle(&self) -> &DeviceHandle {
        self.pool
    }

    fn send(&self, msg: &str) -> DmTestResult<()> {
        self.registry.message(self.pool, None, msg).map(|_| ())
    }

    pub fn create_thin(&self, thin_id: ThinDevId) -> DmTestResult<()> {
        self.send(&format!("create_thin {}", u32::from(thin_id)))
    }

    /// Create thin_id as a snapshot of origin_id. The origin must not be
    /// written to while this runs; see create_snap_paused.
    pub fn create_snap(&self, thin_id: ThinDevId, origin_id: ThinDevId) -> DmTestResult<()> {
        self.send(&format!(
            "create_snap {} {}",
            u32::from(thin_id),
            u32::from(origin_id)
        ))
    }

    /// Create a snapshot of an origin that is active as origin, with the
    /// origin suspended for the duration.
    pub fn create_snap_paused(
        &self,
        thin_id: ThinDevId,
        origin_id: ThinDevId,
        origin: &DeviceHandle,
    ) -> DmTestResult<()> {
        self.registry
            .pause(origin, || self.create_snap(thin_id, origin_id))
    }

    /// Delete a thin device. Fails with DeviceBusy while an active device
    /// opens it, and with UnknownDevice if the pool has no such id.
    pub fn delete(&self, thin_id: ThinDevId) -> DmTestResult<()> {
        let id = u32::from(thin_id);
        if let Some(user) = self.registry.thin_user(self.pool, id)? {
            return Err(DmTestError::DeviceBusy(format!(
                "thin device {id} is open as {user}"
            )));
        }

        match self.send(&format!("delete {id}")) {
            Err(DmTestError::NoData(msg)) => {
                debug!("Pool {} has no thin device {}: {}", self.pool.name(), id, msg);
                Err(DmTestError::UnknownDevice(id))
            }
            result => result,
        }
    }

    pub fn set_transaction_id(&self, old: u64, new: u64) -> DmTestResult<()> {
        self.send(&format!("set_transaction_id {old} {new}"))
    }

    /// Take a snapshot of the metadata, reported as the held root.
    pub fn reserve_metadata_snap(&self) -> DmTestResult<()> {
        self.send("reserve_metadata_snap")
    }

    pub fn release_metadata_snap(&self) -> DmTestResult<()> {
        self.send("release_metadata_snap")
    }

    pub fn data_block_size(&self) -> DmTestResult<Sectors> {
        match self.registry.table(self.pool)?.params() {
            TargetParams::Pool(params) => Ok(params.data_block_size),
            _ => Err(DmTestError::Invalid(format!(
                "device {} no longer has a pool table",
                self.pool.name()
            ))),
        }
    }

    pub fn status(&self) -> DmTestResult<PoolStatus> {
        let data_block_size = self.data_block_size()?;
        PoolStatus::parse(&self.registry.status(self.pool)?, data_block_size)
    }
}

/// I/O and status for an active thin device.
#[derive(Debug)]
pub struct ThinControl<'a, B: Backend> {
    registry: &'a DeviceRegistry<B>,
    thin: &'a DeviceHandle,
}

impl<'a, B: Backend> ThinControl<'a, B> {
    pub fn new(registry: &'a DeviceRegistry<B>, thin: &'a DeviceHandle) -> DmTestResult<Self> {
        check_kind(thin, TargetKind::Thin)?;
        Ok(ThinControl { registry, thin })
    }

    pub fn size(&self) -> DmTestResult<Sectors> {
        Ok(self.registry.table(self.thin)?.length())
    }

    /// Write length sectors at offset, provisioning the blocks touched.
    pub fn write(&self, offset: Sectors, length: Sectors) -> DmTestResult<()> {
        self.registry.table(self.thin)?;
        self.registry
            .backend()
            .write(&self.thin.device(), offset, length)
    }

    /// Write the whole device.
    pub fn wipe(&self) -> DmTestResult<()> {
        self.write(Sectors(0), self.size()?)
    }

    /// Discard length sectors at offset. Only whole blocks are unmapped.
    pub fn discard(&self, offset: Sectors, length: Sectors) -> DmTestResult<()> {
        self.registry.table(self.thin)?;
        self.registry
            .backend()
            .discard(&self.thin.device(), offset, length)
    }

    pub fn status(&self) -> DmTestResult<ThinStatus> {
        ThinStatus::parse(&self.registry.status(self.thin)?)
    }
}
