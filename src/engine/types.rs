// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use devicemapper::Sectors;

/// Directory in which device-mapper exposes the nodes of its devices.
pub const DEVICEMAPPER_PATH: &str = "/dev/mapper";

/// A block device that can be named in a table.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum BlockDevice {
    /// A device the harness did not create, e.g., a loop device.
    External(PathBuf),
    /// A device activated through a DeviceRegistry, identified by its
    /// device-mapper name.
    Mapped(String),
}

impl BlockDevice {
    /// The device node through which I/O to this device is done.
    pub fn devnode(&self) -> PathBuf {
        match self {
            BlockDevice::External(path) => path.clone(),
            BlockDevice::Mapped(name) => Path::new(DEVICEMAPPER_PATH).join(name),
        }
    }

    /// The name of the mapped device, if this is a mapped device.
    pub fn mapped_name(&self) -> Option<&str> {
        match self {
            BlockDevice::External(_) => None,
            BlockDevice::Mapped(name) => Some(name),
        }
    }
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.devnode().display())
    }
}

/// A contiguous range of sectors on a block device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Extent {
    pub name: String,
    pub device: BlockDevice,
    pub offset: Sectors,
    pub length: Sectors,
}

impl Extent {
    /// The first sector past the end of the extent.
    pub fn end(&self) -> Sectors {
        self.offset + self.length
    }
}

/// The behavior a virtual device exposes. The serialized form is the
/// kernel's name for the target.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    strum_macros::AsRefStr,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum TargetKind {
    #[strum(serialize = "thin-pool")]
    Pool,
    #[strum(serialize = "thin")]
    Thin,
    #[strum(serialize = "snapshot")]
    Snapshot,
    #[strum(serialize = "cache")]
    Cache,
    #[strum(serialize = "linear")]
    Linear,
    #[strum(serialize = "error")]
    Error,
}

/// Identifies a device for the lifetime of the registry that activated it.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
