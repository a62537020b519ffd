// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use devicemapper::{Sectors, ThinDevId};

use dmtest::{
    engine::{BlockDevice, SimBackend},
    harness::{limit_metadata_dev_size, Harness, HarnessConfig},
};

use crate::common::logger::init_logger;

pub const METADATA_DEV: &str = "/dev/sim-metadata";
pub const DATA_DEV: &str = "/dev/sim-data";

pub fn metadata_dev() -> BlockDevice {
    BlockDevice::External(PathBuf::from(METADATA_DEV))
}

pub fn data_dev() -> BlockDevice {
    BlockDevice::External(PathBuf::from(DATA_DEV))
}

/// A harness over simulated devices, sized like a default configuration.
pub fn sim_harness() -> Harness<SimBackend> {
    init_logger();
    let config = HarnessConfig::from_json(&format!(
        r#"{{"metadata_dev": "{METADATA_DEV}", "data_dev": "{DATA_DEV}"}}"#
    ))
    .unwrap();

    let backend = SimBackend::new();
    backend
        .add_disk(METADATA_DEV, limit_metadata_dev_size(Sectors(10_000_000)))
        .unwrap();
    backend.add_disk(DATA_DEV, config.data_size).unwrap();
    Harness::new(config, backend).unwrap()
}

pub fn id(n: u64) -> ThinDevId {
    ThinDevId::new_u64(n).unwrap()
}

/// Number of data blocks needed to map size sectors.
pub fn blocks(harness: &Harness<SimBackend>, size: Sectors) -> u64 {
    (*size).div_ceil(*harness.config().data_block_size)
}
