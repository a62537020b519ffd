// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Carve backing devices into named volumes. Pure bookkeeping, no I/O.

use devicemapper::Sectors;
use indexmap::IndexMap;
use log::debug;

use crate::{
    engine::{
        table::Table,
        types::{BlockDevice, Extent},
    },
    harness::errors::{DmTestError, DmTestResult},
};

/// A free extent registered with the allocator.
#[derive(Debug)]
struct AllocationSource {
    device: BlockDevice,
    offset: Sectors,
    length: Sectors,
    /// Sectors carved from the front of this source so far.
    used: Sectors,
}

impl AllocationSource {
    fn available(&self) -> Sectors {
        self.length - self.used
    }

    fn overlaps(&self, device: &BlockDevice, offset: Sectors, length: Sectors) -> bool {
        &self.device == device
            && offset < self.offset + self.length
            && self.offset < offset + length
    }
}

/// Hands out named volumes first-fit, in the order the sources were
/// registered. Space is never returned, so the same sequence of calls
/// always yields the same layout.
#[derive(Debug, Default)]
pub struct VolumeAllocator {
    sources: Vec<AllocationSource>,
    volumes: IndexMap<String, Extent>,
}

impl VolumeAllocator {
    pub fn new() -> VolumeAllocator {
        VolumeAllocator::default()
    }

    /// Register the extent (offset, length) of device as free space.
    pub fn add_allocation_source(
        &mut self,
        device: BlockDevice,
        offset: Sectors,
        length: Sectors,
    ) -> DmTestResult<()> {
        if length == Sectors(0) {
            return Err(DmTestError::Invalid(format!(
                "allocation source on {device} has no sectors"
            )));
        }

        if offset.checked_add(length).is_none() {
            return Err(DmTestError::Invalid(format!(
                "allocation source ({offset}, {length}) inexpressible in this format"
            )));
        }

        if let Some(source) = self
            .sources
            .iter()
            .find(|s| s.overlaps(&device, offset, length))
        {
            return Err(DmTestError::Invalid(format!(
                "allocation source ({}, {}) on {} overlaps previous source ({}, {})",
                offset, length, device, source.offset, source.length
            )));
        }

        debug!("Adding allocation source ({offset}, {length}) on {device}");
        self.sources.push(AllocationSource {
            device,
            offset,
            length,
            used: Sectors(0),
        });
        Ok(())
    }

    /// Carve a volume of length sectors from the first source with enough
    /// room left. On failure nothing changes.
    pub fn add_volume(&mut self, name: &str, length: Sectors) -> DmTestResult<&Extent> {
        if self.volumes.contains_key(name) {
            return Err(DmTestError::DuplicateName(name.to_owned()));
        }

        if length == Sectors(0) {
            return Err(DmTestError::Invalid(format!("volume {name} has no sectors")));
        }

        let index = match self.sources.iter().position(|s| s.available() >= length) {
            Some(index) => index,
            None => {
                return Err(DmTestError::OutOfSpace {
                    name: name.to_owned(),
                    requested: length,
                    available: self
                        .sources
                        .iter()
                        .map(|s| s.available())
                        .max()
                        .unwrap_or(Sectors(0)),
                })
            }
        };
        let source = &mut self.sources[index];

        let extent = Extent {
            name: name.to_owned(),
            device: source.device.clone(),
            offset: source.offset + source.used,
            length,
        };
        source.used += length;

        debug!(
            "Allocated volume {} at ({}, {}) on {}",
            name, extent.offset, extent.length, extent.device
        );

        Ok(self.volumes.entry(name.to_owned()).or_insert(extent))
    }

    /// The extent carved for the named volume.
    pub fn extent(&self, name: &str) -> DmTestResult<&Extent> {
        self.volumes
            .get(name)
            .ok_or_else(|| DmTestError::UnknownVolume(name.to_owned()))
    }

    /// A linear table mapping the named volume.
    pub fn table_for(&self, name: &str) -> DmTestResult<Table> {
        self.extent(name).map(Table::linear_extent)
    }

    /// Total unallocated sectors over all sources.
    pub fn free_space(&self) -> Sectors {
        self.sources.iter().map(|s| s.available()).sum()
    }

    /// Total sectors registered over all sources.
    pub fn total_space(&self) -> Sectors {
        self.sources.iter().map(|s| s.length).sum()
    }

    /// The volumes carved so far, in the order they were added.
    pub fn volumes(&self) -> impl Iterator<Item = &Extent> {
        self.volumes.values()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use assert_matches::assert_matches;
    use proptest::{collection::vec, prelude::*};

    use crate::engine::table::TargetParams;

    use super::*;

    fn disk(name: &str) -> BlockDevice {
        BlockDevice::External(PathBuf::from(format!("/dev/{name}")))
    }

    #[test]
    /// Volumes are carved back to back from the first source until it is
    /// exhausted, then from the next.
    fn test_first_fit_in_order() {
        let mut tvm = VolumeAllocator::new();
        tvm.add_allocation_source(disk("a"), Sectors(0), Sectors(100))
            .unwrap();
        tvm.add_allocation_source(disk("b"), Sectors(50), Sectors(100))
            .unwrap();

        tvm.add_volume("one", Sectors(60)).unwrap();
        tvm.add_volume("two", Sectors(30)).unwrap();
        tvm.add_volume("three", Sectors(20)).unwrap();
        tvm.add_volume("four", Sectors(10)).unwrap();

        let one = tvm.extent("one").unwrap();
        assert_eq!((one.device.clone(), one.offset), (disk("a"), Sectors(0)));
        let two = tvm.extent("two").unwrap();
        assert_eq!((two.device.clone(), two.offset), (disk("a"), Sectors(60)));
        let three = tvm.extent("three").unwrap();
        assert_eq!(
            (three.device.clone(), three.offset),
            (disk("b"), Sectors(50))
        );
        // Fits in the remainder of the first source.
        let four = tvm.extent("four").unwrap();
        assert_eq!((four.device.clone(), four.offset), (disk("a"), Sectors(90)));

        assert_eq!(tvm.free_space(), Sectors(80));
        assert_eq!(
            tvm.volumes().map(|v| v.name.as_str()).collect::<Vec<_>>(),
            vec!["one", "two", "three", "four"]
        );
    }

    #[test]
    /// A failed allocation leaves the allocator untouched.
    fn test_out_of_space_is_idempotent() {
        let mut tvm = VolumeAllocator::new();
        tvm.add_allocation_source(disk("a"), Sectors(0), Sectors(100))
            .unwrap();
        tvm.add_volume("md", Sectors(40)).unwrap();

        assert_matches!(
            tvm.add_volume("data", Sectors(61)),
            Err(DmTestError::OutOfSpace { requested: Sectors(61), available: Sectors(60), .. })
        );
        assert_eq!(tvm.free_space(), Sectors(60));
        assert_matches!(tvm.extent("data"), Err(DmTestError::UnknownVolume(_)));

        let data = tvm.add_volume("data", Sectors(60)).unwrap();
        assert_eq!(data.offset, Sectors(40));
        assert_eq!(tvm.free_space(), Sectors(0));
    }

    #[test]
    fn test_duplicate_name() {
        let mut tvm = VolumeAllocator::new();
        tvm.add_allocation_source(disk("a"), Sectors(0), Sectors(100))
            .unwrap();
        tvm.add_volume("md", Sectors(10)).unwrap();
        assert_matches!(
            tvm.add_volume("md", Sectors(10)),
            Err(DmTestError::DuplicateName(_))
        );
        assert_eq!(tvm.free_space(), Sectors(90));
    }

    #[test]
    fn test_bad_sources() {
        let mut tvm = VolumeAllocator::new();
        tvm.add_allocation_source(disk("a"), Sectors(10), Sectors(100))
            .unwrap();
        assert_matches!(
            tvm.add_allocation_source(disk("a"), Sectors(109), Sectors(5)),
            Err(DmTestError::Invalid(_))
        );
        assert_matches!(
            tvm.add_allocation_source(disk("a"), Sectors(0), Sectors(11)),
            Err(DmTestError::Invalid(_))
        );
        assert_matches!(
            tvm.add_allocation_source(disk("a"), Sectors(200), Sectors(0)),
            Err(DmTestError::Invalid(_))
        );
        assert_matches!(
            tvm.add_allocation_source(disk("a"), Sectors(u64::MAX), Sectors(1)),
            Err(DmTestError::Invalid(_))
        );
        // Adjacent extents and other devices are fine.
        tvm.add_allocation_source(disk("a"), Sectors(0), Sectors(10))
            .unwrap();
        tvm.add_allocation_source(disk("b"), Sectors(10), Sectors(100))
            .unwrap();
        assert_eq!(tvm.total_space(), Sectors(210));
    }

    #[test]
    fn test_table_for() {
        let mut tvm = VolumeAllocator::new();
        tvm.add_allocation_source(disk("a"), Sectors(8), Sectors(100))
            .unwrap();
        tvm.add_volume("cache", Sectors(16)).unwrap();
        tvm.add_volume("origin", Sectors(32)).unwrap();

        let table = tvm.table_for("origin").unwrap();
        assert_eq!(table.length(), Sectors(32));
        assert_matches!(
            table.params(),
            TargetParams::Linear(params) if params.device == disk("a") && params.offset == Sectors(24)
        );
        assert_matches!(tvm.table_for("md"), Err(DmTestError::UnknownVolume(_)));
    }

    proptest! {
        #[test]
        /// Whatever fits is allocated, and free space accounts for every
        /// sector.
        fn test_free_space_accounting(
            sources in vec(1u64..10_000, 1..4),
            volumes in vec(1u64..5_000, 0..16),
        ) {
            let mut tvm = VolumeAllocator::new();
            for (i, len) in sources.iter().enumerate() {
                tvm.add_allocation_source(disk(&format!("d{i}")), Sectors(0), Sectors(*len)).unwrap();
            }
            let total = Sectors(sources.iter().sum());
            prop_assert_eq!(tvm.total_space(), total);

            let mut allocated = Sectors(0);
            for (i, len) in volumes.iter().enumerate() {
                let before = tvm.free_space();
                match tvm.add_volume(&format!("v{i}"), Sectors(*len)) {
                    Ok(_) => allocated += Sectors(*len),
                    Err(DmTestError::OutOfSpace { .. }) => prop_assert_eq!(tvm.free_space(), before),
                    Err(err) => panic!("unexpected error {err}"),
                }
                prop_assert_eq!(tvm.free_space(), total - allocated);
            }

            let mut extents: Vec<_> = tvm.volumes().cloned().collect();
            extents.sort_by(|a, b| (a.device.clone(), a.offset).cmp(&(b.device.clone(), b.offset)));
            for pair in extents.windows(2) {
                if pair[0].device == pair[1].device {
                    prop_assert!(pair[0].end() <= pair[1].offset);
                }
            }
        }
    }
}
