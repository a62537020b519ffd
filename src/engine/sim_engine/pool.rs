// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// In-memory thin-pool metadata: thin devices, their block mappings, and
// data block reference counts.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use devicemapper::Sectors;

use crate::{
    engine::metadata::{DeviceDump, Mapping, MetadataDump, Superblock},
    harness::errors::{DmTestError, DmTestResult},
};

/// Largest thin id the pool accepts.
const MAX_THIN_ID: u32 = (1 << 24) - 1;

/// Metadata blocks used by an empty pool.
const BASE_METADATA_BLOCKS: u64 = 10;

/// Mappings held by one metadata block.
const MAPPINGS_PER_METADATA_BLOCK: u64 = 126;

#[derive(Clone, Debug, Default)]
struct SimThin {
    /// thin block -> (data block, time mapped)
    mappings: BTreeMap<u64, (u64, u32)>,
    transaction: u64,
    creation_time: u32,
    snap_time: u32,
}

/// The thin devices of a pool, as captured by a metadata snapshot.
#[derive(Clone, Debug)]
struct HeldRoot {
    root: u64,
    transaction_id: u64,
    thins: BTreeMap<u32, SimThin>,
}

#[derive(Debug)]
pub struct SimPool {
    data_block_size: Sectors,
    nr_data_blocks: u64,
    transaction_id: u64,
    time: u32,
    thins: BTreeMap<u32, SimThin>,
    refcounts: HashMap<u64, u32>,
    next_free: u64,
    released: BTreeSet<u64>,
    held_root: Option<HeldRoot>,
    /// Set when an allocation failed, cleared once space is available.
    out_of_space: bool,
}

fn busy(msg: String) -> DmTestError {
    DmTestError::Backend(format!("Device or resource busy: {msg}"))
}

fn no_data(msg: String) -> DmTestError {
    DmTestError::NoData(msg)
}

fn invalid(msg: String) -> DmTestError {
    DmTestError::Backend(format!("Invalid argument: {msg}"))
}

impl SimPool {
    /// Format new metadata for a pool with the given block size.
    pub fn new(data_block_size: Sectors) -> SimPool {
        SimPool {
            data_block_size,
            nr_data_blocks: 0,
            transaction_id: 0,
            time: 0,
            thins: BTreeMap::new(),
            refcounts: HashMap::new(),
            next_free: 0,
            released: BTreeSet::new(),
            held_root: None,
            out_of_space: false,
        }
    }

    pub fn data_block_size(&self) -> Sectors {
        self.data_block_size
    }

    pub fn nr_data_blocks(&self) -> u64 {
        self.nr_data_blocks
    }

    /// Grow the data device to nr_data_blocks. Shrinking is refused.
    pub fn set_nr_data_blocks(&mut self, nr_data_blocks: u64) -> DmTestResult<()> {
        if nr_data_blocks < self.nr_data_blocks {
            return Err(invalid(format!(
                "pool target ({} blocks) too small: expected {}",
                nr_data_blocks, self.nr_data_blocks
            )));
        }
        if nr_data_blocks > self.nr_data_blocks {
            self.out_of_space = false;
        }
        self.nr_data_blocks = nr_data_blocks;
        Ok(())
    }

    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    pub fn used_data_blocks(&self) -> u64 {
        self.refcounts.len() as u64
    }

    pub fn used_metadata_blocks(&self) -> u64 {
        let mappings: u64 = self.thins.values().map(|t| t.mappings.len() as u64).sum();
        BASE_METADATA_BLOCKS
            + self.thins.len() as u64
            + mappings.div_ceil(MAPPINGS_PER_METADATA_BLOCK)
    }

    pub fn held_root(&self) -> Option<u64> {
        self.held_root.as_ref().map(|h| h.root)
    }

    pub fn is_out_of_space(&self) -> bool {
        self.out_of_space && self.used_data_blocks() >= self.nr_data_blocks
    }

    pub fn has_thin(&self, thin_id: u32) -> bool {
        self.thins.contains_key(&thin_id)
    }

    pub fn thin_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.thins.keys().copied()
    }

    /// (mapped sectors, highest mapped sector) for the thin device.
    pub fn thin_usage(&self, thin_id: u32) -> Option<(Sectors, Option<Sectors>)> {
        self.thins.get(&thin_id).map(|thin| {
            let mapped = Sectors(thin.mappings.len() as u64 * *self.data_block_size);
            let highest = thin
                .mappings
                .keys()
                .next_back()
                .map(|b| Sectors((b + 1) * *self.data_block_size - 1));
            (mapped, highest)
        })
    }

    fn check_new_id(&self, thin_id: u32) -> DmTestResult<()> {
        if thin_id > MAX_THIN_ID {
            return Err(invalid(format!("thin id {thin_id} too large")));
        }
        if self.thins.contains_key(&thin_id) {
            return Err(DmTestError::Backend(format!(
                "File exists: thin device {thin_id} already exists"
            )));
        }
        Ok(())
    }

    pub fn create_thin(&mut self, thin_id: u32) -> DmTestResult<()> {
        self.check_new_id(thin_id)?;
        self.thins.insert(
            thin_id,
            SimThin {
                transaction: self.transaction_id,
                creation_time: self.time,
                snap_time: self.time,
                ..SimThin::default()
            },
        );
        Ok(())
    }

    pub fn create_snap(&mut self, thin_id: u32, origin_id: u32) -> DmTestResult<()> {
        self.check_new_id(thin_id)?;
        let origin = self
            .thins
            .get_mut(&origin_id)
            .ok_or_else(|| no_data(format!("origin thin device {origin_id} does not exist")))?;

        self.time += 1;
        origin.snap_time = self.time;
        let mut snap = origin.clone();
        snap.transaction = self.transaction_id;
        snap.creation_time = self.time;

        for (data_block, _) in snap.mappings.values() {
            *self.refcounts.entry(*data_block).or_insert(0) += 1;
        }
        self.thins.insert(thin_id, snap);
        Ok(())
    }

    /// Delete a thin device. in_use says whether a live device is layered
    /// on it.
    pub fn delete(&mut self, thin_id: u32, in_use: bool) -> DmTestResult<()> {
        if in_use {
            return Err(busy(format!("thin device {thin_id} is open")));
        }
        let thin = self
            .thins
            .remove(&thin_id)
            .ok_or_else(|| no_data(format!("thin device {thin_id} does not exist")))?;
        for (data_block, _) in thin.mappings.values() {
            self.release_block(*data_block);
        }
        Ok(())
    }

    pub fn set_transaction_id(&mut self, old: u64, new: u64) -> DmTestResult<()> {
        if old != self.transaction_id {
            return Err(invalid(format!(
                "transaction id mismatch: expected {}, got {}",
                self.transaction_id, old
            )));
        }
        self.transaction_id = new;
        Ok(())
    }

    pub fn reserve_metadata_snap(&mut self) -> DmTestResult<()> {
        if self.held_root.is_some() {
            return Err(busy("metadata snapshot already held".into()));
        }
        self.held_root = Some(HeldRoot {
            root: self.used_metadata_blocks() + 1,
            transaction_id: self.transaction_id,
            thins: self.thins.clone(),
        });
        Ok(())
    }

    pub fn release_metadata_snap(&mut self) -> DmTestResult<()> {
        self.held_root
            .take()
            .map(|_| ())
            .ok_or_else(|| invalid("no metadata snapshot held".into()))
    }

    fn allocate_block(&mut self) -> DmTestResult<u64> {
        let block = match self.released.pop_first() {
            Some(block) => block,
            None if self.next_free < self.nr_data_blocks => {
                self.next_free += 1;
                self.next_free - 1
            }
            None => {
                self.out_of_space = true;
                return Err(DmTestError::Backend(
                    "No space left on device: pool is out of data space".into(),
                ));
            }
        };
        self.refcounts.insert(block, 1);
        Ok(block)
    }

    fn release_block(&mut self, block: u64) {
        if let Some(count) = self.refcounts.get_mut(&block) {
            *count -= 1;
            if *count == 0 {
                self.refcounts.remove(&block);
                self.released.insert(block);
                self.out_of_space = false;
            }
        }
    }

    /// Provision every block of the thin device touched by the sector range,
    /// breaking sharing where a block is shared with a snapshot.
    pub fn write(&mut self, thin_id: u32, offset: Sectors, length: Sectors) -> DmTestResult<()> {
        if length == Sectors(0) {
            return Ok(());
        }
        let bs = *self.data_block_size;
        let first = *offset / bs;
        let last = (*offset + *length - 1) / bs;
        let time = self.time;

        for block in first..=last {
            let mapped = self
                .thins
                .get(&thin_id)
                .ok_or_else(|| invalid(format!("thin device {thin_id} does not exist")))?
                .mappings
                .get(&block)
                .copied();

            let shared = match mapped {
                Some((data_block, _)) => {
                    if self.refcounts.get(&data_block).copied().unwrap_or(0) <= 1 {
                        continue;
                    }
                    Some(data_block)
                }
                None => None,
            };

            let new_block = self.allocate_block()?;
            if let Some(old) = shared {
                self.release_block(old);
            }
            if let Some(thin) = self.thins.get_mut(&thin_id) {
                thin.mappings.insert(block, (new_block, time));
            }
        }
        Ok(())
    }

    /// Unmap every block of the thin device wholly covered by the range.
    pub fn discard(&mut self, thin_id: u32, offset: Sectors, length: Sectors) -> DmTestResult<()> {
        let bs = *self.data_block_size;
        let first = (*offset).div_ceil(bs);
        let end = (*offset + *length) / bs;

        let thin = self
            .thins
            .get_mut(&thin_id)
            .ok_or_else(|| invalid(format!("thin device {thin_id} does not exist")))?;
        let unmapped: Vec<u64> = thin
            .mappings
            .range(first..end.max(first))
            .map(|(_, (data_block, _))| *data_block)
            .collect();
        thin.mappings.retain(|block, _| *block < first || *block >= end);

        for data_block in unmapped {
            self.release_block(data_block);
        }
        Ok(())
    }

    fn dump_thins(&self, transaction_id: u64, thins: &BTreeMap<u32, SimThin>) -> MetadataDump {
        let devices = thins
            .iter()
            .map(|(dev_id, thin)| {
                let mut mappings: Vec<Mapping> = Vec::new();
                for (block, (data_block, time)) in &thin.mappings {
                    match mappings.last_mut() {
                        Some(run)
                            if run.origin_end() == *block
                                && run.data_begin + run.length == *data_block
                                && run.time == *time =>
                        {
                            run.length += 1
                        }
                        _ => mappings.push(Mapping {
                            origin_begin: *block,
                            data_begin: *data_block,
                            length: 1,
                            time: *time,
                        }),
                    }
                }
                DeviceDump {
                    dev_id: *dev_id,
                    mapped_blocks: thin.mappings.len() as u64,
                    transaction: thin.transaction,
                    creation_time: thin.creation_time,
                    snap_time: thin.snap_time,
                    mappings,
                }
            })
            .collect();

        MetadataDump {
            superblock: Superblock {
                uuid: String::new(),
                time: self.time,
                transaction: transaction_id,
                data_block_size: self.data_block_size,
                nr_data_blocks: self.nr_data_blocks,
            },
            devices,
        }
    }

    /// The metadata as a dump, either live or from the held root.
    pub fn dump(&self, held_root: Option<u64>) -> DmTestResult<MetadataDump> {
        match held_root {
            None => Ok(self.dump_thins(self.transaction_id, &self.thins)),
            Some(root) => match &self.held_root {
                Some(held) if held.root == root => {
                    Ok(self.dump_thins(held.transaction_id, &held.thins))
                }
                _ => Err(invalid(format!("no metadata snapshot at root {root}"))),
            },
        }
    }

    /// Build pool metadata from a dump.
    pub fn restore(dump: &MetadataDump) -> DmTestResult<SimPool> {
        let sb = &dump.superblock;
        let mut pool = SimPool::new(sb.data_block_size);
        pool.nr_data_blocks = sb.nr_data_blocks;
        pool.transaction_id = sb.transaction;
        pool.time = sb.time;

        for dev in &dump.devices {
            let mut thin = SimThin {
                transaction: dev.transaction,
                creation_time: dev.creation_time,
                snap_time: dev.snap_time,
                ..SimThin::default()
            };
            for m in &dev.mappings {
                for i in 0..m.length {
                    let data_block = m.data_begin + i;
                    if data_block >= sb.nr_data_blocks {
                        return Err(invalid(format!(
                            "data block {data_block} beyond end of data device"
                        )));
                    }
                    thin.mappings.insert(m.origin_begin + i, (data_block, m.time));
                    *pool.refcounts.entry(data_block).or_insert(0) += 1;
                }
            }
            pool.thins.insert(dev.dev_id, thin);
        }

        pool.next_free = pool.refcounts.keys().max().map_or(0, |b| b + 1);
        pool.released = (0..pool.next_free)
            .filter(|b| !pool.refcounts.contains_key(b))
            .collect();
        Ok(pool)
    }

    /// Verify that reference counts agree with the mappings.
    pub fn check(&self) -> DmTestResult<()> {
        let mut counts: HashMap<u64, u32> = HashMap::new();
        for thin in self.thins.values() {
            for (data_block, _) in thin.mappings.values() {
                *counts.entry(*data_block).or_insert(0) += 1;
            }
        }
        if counts != self.refcounts {
            return Err(DmTestError::Backend(
                "metadata check failed: reference counts disagree with mappings".into(),
            ));
        }
        Ok(())
    }
}
