// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Tables describe one virtual device: a target kind, its parameters, and its
// length. They are immutable; a device changes behavior by loading a
// different table.

use std::fmt;

use itertools::Itertools;

use devicemapper::{DataBlocks, Sectors, ThinDevId};

use crate::{
    engine::types::{BlockDevice, Extent, TargetKind},
    harness::errors::{DmTestError, DmTestResult},
};

const MIN_POOL_BLOCK_SIZE: Sectors = Sectors(128); // 64 KiB
const MAX_POOL_BLOCK_SIZE: Sectors = Sectors(2_097_152); // 1 GiB
const MIN_CACHE_BLOCK_SIZE: Sectors = Sectors(64); // 32 KiB
const MAX_CACHE_BLOCK_SIZE: Sectors = Sectors(2_097_152); // 1 GiB

/// Optional behavior of a thin pool. Each false value is written to the
/// table as a feature argument.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolFeatures {
    pub zero_new_blocks: bool,
    pub discard: bool,
    pub discard_passdown: bool,
    pub read_only: bool,
}

impl Default for PoolFeatures {
    fn default() -> PoolFeatures {
        PoolFeatures {
            zero_new_blocks: true,
            discard: true,
            discard_passdown: true,
            read_only: false,
        }
    }
}

impl PoolFeatures {
    /// The feature arguments, in the order the kernel documents them.
    fn feature_args(self) -> Vec<&'static str> {
        let mut args = Vec::new();
        if !self.zero_new_blocks {
            args.push("skip_block_zeroing");
        }
        if !self.discard {
            args.push("ignore_discard");
        }
        if !self.discard_passdown {
            args.push("no_discard_passdown");
        }
        if self.read_only {
            args.push("read_only");
        }
        args
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolParams {
    pub metadata_dev: BlockDevice,
    pub data_dev: BlockDevice,
    pub data_block_size: Sectors,
    pub low_water_mark: DataBlocks,
    pub features: PoolFeatures,
}

impl PoolParams {
    pub fn new(
        metadata_dev: BlockDevice,
        data_dev: BlockDevice,
        data_block_size: Sectors,
        low_water_mark: DataBlocks,
        features: PoolFeatures,
    ) -> PoolParams {
        PoolParams {
            metadata_dev,
            data_dev,
            data_block_size,
            low_water_mark,
            features,
        }
    }

    fn param_str(&self) -> String {
        let features = self.features.feature_args();
        let feature_str = if features.is_empty() {
            "0".to_owned()
        } else {
            format!("{} {}", features.len(), features.iter().join(" "))
        };
        format!(
            "{} {} {} {} {}",
            self.metadata_dev, self.data_dev, *self.data_block_size, *self.low_water_mark, feature_str
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThinParams {
    pub pool: BlockDevice,
    pub thin_id: ThinDevId,
    /// A read-only device supplying blocks the thin device has not mapped.
    pub external_origin: Option<BlockDevice>,
}

impl ThinParams {
    fn param_str(&self) -> String {
        match &self.external_origin {
            Some(origin) => format!("{} {} {}", self.pool, u32::from(self.thin_id), origin),
            None => format!("{} {}", self.pool, u32::from(self.thin_id)),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotParams {
    pub origin: BlockDevice,
    pub cow: BlockDevice,
    pub persistent: bool,
    pub chunk_size: Sectors,
}

impl SnapshotParams {
    fn param_str(&self) -> String {
        format!(
            "{} {} {} {}",
            self.origin,
            self.cow,
            if self.persistent { "P" } else { "N" },
            *self.chunk_size
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheParams {
    pub metadata_dev: BlockDevice,
    pub cache_dev: BlockDevice,
    pub origin_dev: BlockDevice,
    pub block_size: Sectors,
    pub feature_args: Vec<String>,
    pub policy: String,
}

impl CacheParams {
    /// A writethrough cache using the default policy.
    pub fn new(
        metadata_dev: BlockDevice,
        cache_dev: BlockDevice,
        origin_dev: BlockDevice,
        block_size: Sectors,
    ) -> CacheParams {
        CacheParams {
            metadata_dev,
            cache_dev,
            origin_dev,
            block_size,
            feature_args: vec!["writethrough".to_owned()],
            policy: "default".to_owned(),
        }
    }

    fn param_str(&self) -> String {
        let feature_str = if self.feature_args.is_empty() {
            "0".to_owned()
        } else {
            format!(
                "{} {}",
                self.feature_args.len(),
                self.feature_args.iter().join(" ")
            )
        };
        format!(
            "{} {} {} {} {} {} 0",
            self.metadata_dev,
            self.cache_dev,
            self.origin_dev,
            *self.block_size,
            feature_str,
            self.policy
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinearParams {
    pub device: BlockDevice,
    pub offset: Sectors,
}

/// The parameters of a table, one variant per target kind.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TargetParams {
    Pool(PoolParams),
    Thin(ThinParams),
    Snapshot(SnapshotParams),
    Cache(CacheParams),
    Linear(LinearParams),
    Error,
}

impl TargetParams {
    pub fn kind(&self) -> TargetKind {
        match self {
            TargetParams::Pool(_) => TargetKind::Pool,
            TargetParams::Thin(_) => TargetKind::Thin,
            TargetParams::Snapshot(_) => TargetKind::Snapshot,
            TargetParams::Cache(_) => TargetKind::Cache,
            TargetParams::Linear(_) => TargetKind::Linear,
            TargetParams::Error => TargetKind::Error,
        }
    }

    /// The parameter string, in the positional order the kernel expects.
    pub fn param_str(&self) -> String {
        match self {
            TargetParams::Pool(params) => params.param_str(),
            TargetParams::Thin(params) => params.param_str(),
            TargetParams::Snapshot(params) => params.param_str(),
            TargetParams::Cache(params) => params.param_str(),
            TargetParams::Linear(params) => format!("{} {}", params.device, *params.offset),
            TargetParams::Error => String::new(),
        }
    }
}

impl fmt::Display for TargetParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetParams::Error => write!(f, "{}", self.kind()),
            _ => write!(f, "{} {}", self.kind(), self.param_str()),
        }
    }
}

/// A range of a device that a table uses exclusively. A range of None
/// claims the whole device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Claim {
    pub device: BlockDevice,
    pub range: Option<(Sectors, Sectors)>,
}

impl Claim {
    fn whole(device: &BlockDevice) -> Claim {
        Claim {
            device: device.clone(),
            range: None,
        }
    }

    pub fn overlaps(&self, other: &Claim) -> bool {
        if self.device != other.device {
            return false;
        }
        match (self.range, other.range) {
            (Some((off, len)), Some((other_off, other_len))) => {
                *off < other_off.saturating_add(*other_len)
                    && *other_off < off.saturating_add(*len)
            }
            _ => true,
        }
    }
}

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.range {
            Some((off, len)) => write!(f, "{} ({}, {})", self.device, off, len),
            None => write!(f, "{}", self.device),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Table {
    length: Sectors,
    params: TargetParams,
}

impl Table {
    pub fn new(length: Sectors, params: TargetParams) -> Table {
        Table { length, params }
    }

    pub fn pool(length: Sectors, params: PoolParams) -> Table {
        Table::new(length, TargetParams::Pool(params))
    }

    pub fn thin(length: Sectors, pool: &BlockDevice, thin_id: ThinDevId) -> Table {
        Table::new(
            length,
            TargetParams::Thin(ThinParams {
                pool: pool.clone(),
                thin_id,
                external_origin: None,
            }),
        )
    }

    /// A thin device whose unmapped blocks are read from origin.
    pub fn thin_with_origin(
        length: Sectors,
        pool: &BlockDevice,
        thin_id: ThinDevId,
        origin: &BlockDevice,
    ) -> Table {
        Table::new(
            length,
            TargetParams::Thin(ThinParams {
                pool: pool.clone(),
                thin_id,
                external_origin: Some(origin.clone()),
            }),
        )
    }

    pub fn snapshot(length: Sectors, params: SnapshotParams) -> Table {
        Table::new(length, TargetParams::Snapshot(params))
    }

    pub fn cache(length: Sectors, params: CacheParams) -> Table {
        Table::new(length, TargetParams::Cache(params))
    }

    pub fn linear(length: Sectors, device: &BlockDevice, offset: Sectors) -> Table {
        Table::new(
            length,
            TargetParams::Linear(LinearParams {
                device: device.clone(),
                offset,
            }),
        )
    }

    pub fn linear_extent(extent: &Extent) -> Table {
        Table::linear(extent.length, &extent.device, extent.offset)
    }

    pub fn error(length: Sectors) -> Table {
        Table::new(length, TargetParams::Error)
    }

    pub fn kind(&self) -> TargetKind {
        self.params.kind()
    }

    pub fn length(&self) -> Sectors {
        self.length
    }

    pub fn params(&self) -> &TargetParams {
        &self.params
    }

    /// The table in the form device-mapper loads it:
    /// (start, length, target type, params).
    pub fn to_raw_table(&self) -> Vec<(u64, u64, String, String)> {
        vec![(
            0u64,
            *self.length,
            self.kind().as_ref().to_owned(),
            self.params.param_str(),
        )]
    }

    /// Every device the table names. Mapped devices among them must be
    /// active for the table to load.
    pub fn references(&self) -> Vec<&BlockDevice> {
        match &self.params {
            TargetParams::Pool(p) => vec![&p.metadata_dev, &p.data_dev],
            TargetParams::Thin(p) => {
                let mut refs = vec![&p.pool];
                refs.extend(p.external_origin.as_ref());
                refs
            }
            TargetParams::Snapshot(p) => vec![&p.origin, &p.cow],
            TargetParams::Cache(p) => vec![&p.metadata_dev, &p.cache_dev, &p.origin_dev],
            TargetParams::Linear(p) => vec![&p.device],
            TargetParams::Error => Vec::new(),
        }
    }

    /// The ranges this table must own exclusively while loaded.
    pub fn claims(&self) -> Vec<Claim> {
        match &self.params {
            TargetParams::Pool(p) => vec![Claim::whole(&p.metadata_dev), Claim::whole(&p.data_dev)],
            TargetParams::Cache(p) => vec![
                Claim::whole(&p.metadata_dev),
                Claim::whole(&p.cache_dev),
                Claim::whole(&p.origin_dev),
            ],
            TargetParams::Snapshot(p) => vec![Claim::whole(&p.cow)],
            TargetParams::Linear(p) => vec![Claim {
                device: p.device.clone(),
                range: Some((p.offset, self.length)),
            }],
            TargetParams::Thin(_) | TargetParams::Error => Vec::new(),
        }
    }

    /// Reject tables the kernel would refuse to load.
    pub fn validate(&self) -> DmTestResult<()> {
        if self.length == Sectors(0) {
            return Err(DmTestError::Invalid(format!(
                "{} table has zero length",
                self.kind()
            )));
        }

        match &self.params {
            TargetParams::Pool(p) => {
                let block = p.data_block_size;
                if block < MIN_POOL_BLOCK_SIZE
                    || block > MAX_POOL_BLOCK_SIZE
                    || *block % *MIN_POOL_BLOCK_SIZE != 0
                {
                    return Err(DmTestError::Invalid(format!(
                        "pool data block size {block} must be a multiple of {MIN_POOL_BLOCK_SIZE} between {MIN_POOL_BLOCK_SIZE} and {MAX_POOL_BLOCK_SIZE}"
                    )));
                }
                if *self.length % *block != 0 {
                    return Err(DmTestError::Invalid(format!(
                        "pool length {} is not a multiple of the data block size {}",
                        self.length, block
                    )));
                }
                if p.metadata_dev == p.data_dev {
                    return Err(DmTestError::Invalid(format!(
                        "pool metadata and data share device {}",
                        p.data_dev
                    )));
                }
            }
            TargetParams::Cache(p) => {
                let block = p.block_size;
                if block < MIN_CACHE_BLOCK_SIZE
                    || block > MAX_CACHE_BLOCK_SIZE
                    || *block % *MIN_CACHE_BLOCK_SIZE != 0
                {
                    return Err(DmTestError::Invalid(format!(
                        "cache block size {block} must be a multiple of {MIN_CACHE_BLOCK_SIZE} between {MIN_CACHE_BLOCK_SIZE} and {MAX_CACHE_BLOCK_SIZE}"
                    )));
                }
                if p.metadata_dev == p.cache_dev
                    || p.metadata_dev == p.origin_dev
                    || p.cache_dev == p.origin_dev
                {
                    return Err(DmTestError::Invalid(
                        "cache metadata, cache and origin devices must be distinct".into(),
                    ));
                }
            }
            TargetParams::Snapshot(p) => {
                if !p.chunk_size.is_power_of_two() {
                    return Err(DmTestError::Invalid(format!(
                        "snapshot chunk size {} is not a power of two",
                        p.chunk_size
                    )));
                }
                if p.origin == p.cow {
                    return Err(DmTestError::Invalid(format!(
                        "snapshot origin and exception store share device {}",
                        p.cow
                    )));
                }
            }
            TargetParams::Linear(p) => {
                if p.offset.checked_add(self.length).is_none() {
                    return Err(DmTestError::Invalid(format!(
                        "linear range ({}, {}) of {} does not fit in a sector count",
                        p.offset, self.length, p.device
                    )));
                }
            }
            TargetParams::Thin(_) | TargetParams::Error => (),
        }
        Ok(())
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0 {} {}", *self.length, self.params)
    }
}
