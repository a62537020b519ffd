// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt::Debug;

use devicemapper::Sectors;

use crate::{
    engine::{table::Table, types::BlockDevice},
    harness::errors::DmTestResult,
};

/// The control plane through which devices are created and driven.
///
/// Devices are addressed by their device-mapper name. A device is created
/// with no table; load stages a table which becomes live at the next
/// resume. Every method is a single synchronous request.
pub trait Backend: Debug + Send + Sync {
    /// Create a device with no table.
    fn create(&self, name: &str) -> DmTestResult<()>;

    /// Stage table as the inactive table of the named device.
    fn load(&self, name: &str, table: &Table) -> DmTestResult<()>;

    fn suspend(&self, name: &str) -> DmTestResult<()>;

    /// Resume the device, making any staged table live.
    fn resume(&self, name: &str) -> DmTestResult<()>;

    /// Remove the device. Fails if another device is layered on it.
    fn remove(&self, name: &str) -> DmTestResult<()>;

    /// Send a target message, returning the target's reply if it gave one.
    fn message(&self, name: &str, sector: Option<Sectors>, msg: &str)
        -> DmTestResult<Option<String>>;

    /// The status line of the live table, without start, length or target
    /// type.
    fn status(&self, name: &str) -> DmTestResult<String>;

    /// The size of any block device, mapped or not.
    fn device_size(&self, dev: &BlockDevice) -> DmTestResult<Sectors>;

    /// Write length sectors at offset, provisioning any thin blocks touched.
    fn write(&self, dev: &BlockDevice, offset: Sectors, length: Sectors) -> DmTestResult<()>;

    /// Discard length sectors at offset.
    fn discard(&self, dev: &BlockDevice, offset: Sectors, length: Sectors) -> DmTestResult<()>;

    /// Dump the pool metadata on dev as XML, optionally from a held root.
    fn dump_metadata(&self, dev: &BlockDevice, held_root: Option<u64>) -> DmTestResult<String>;

    /// Write XML pool metadata to dev.
    fn restore_metadata(&self, xml: &str, dev: &BlockDevice) -> DmTestResult<()>;

    /// Check the consistency of the pool metadata on dev.
    fn check_metadata(&self, dev: &BlockDevice) -> DmTestResult<()>;
}
