// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub use self::{
    allocator::VolumeAllocator,
    dm_engine::{verify_binaries, DmBackend},
    engine::Backend,
    metadata::{DeviceDump, Mapping, MetadataDump, Superblock},
    parallel::in_parallel,
    registry::{DeviceHandle, DeviceRegistry, RegistryConfig},
    sim_engine::{JournalEntry, SimBackend, SimOp},
    status::{PoolMode, PoolStatus, ThinStatus, ThinUsage},
    table::{
        CacheParams, Claim, LinearParams, PoolFeatures, PoolParams, SnapshotParams, Table,
        TargetParams, ThinParams,
    },
    targets::{PoolControl, ThinControl},
    types::{BlockDevice, DeviceId, Extent, TargetKind, DEVICEMAPPER_PATH},
};

mod allocator;
mod dm_engine;
#[allow(clippy::module_inception)]
mod engine;
mod metadata;
mod parallel;
mod registry;
mod sim_engine;
mod status;
mod table;
mod targets;
mod types;
