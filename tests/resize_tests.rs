// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod common;

use devicemapper::Sectors;

use dmtest::engine::{PoolFeatures, PoolMode};

use crate::common::sim::{id, sim_harness};

#[test]
/// A pool that runs out of data space recovers when its table is reloaded
/// with a larger data device.
fn test_resize_out_of_space_pool() {
    let harness = sim_harness();
    let block_size = harness.config().data_block_size;
    let small = Sectors(*block_size * 64);
    let large = Sectors(*block_size * 128);
    harness
        .with_standard_pool(small, PoolFeatures::default(), |pool| {
            harness.with_new_thin(pool, large, id(0), |thin| {
                let control = harness.pool_control(pool)?;
                let thin_control = harness.thin_control(thin)?;

                thin_control.write(Sectors(0), small)?;
                assert!(thin_control.write(small, block_size).is_err());
                let status = control.status()?;
                assert_eq!(status.mode, PoolMode::OutOfDataSpace);
                assert_eq!(status.free_data_sectors, Sectors(0));

                harness.registry().pause(pool, || {
                    harness
                        .registry()
                        .reload(pool, harness.standard_pool_table(large, PoolFeatures::default()))
                })?;

                let status = control.status()?;
                assert_eq!(status.mode, PoolMode::ReadWrite);
                assert_eq!(*status.total_data_blocks, 128);
                thin_control.wipe()?;
                assert_eq!(*control.status()?.used_data_blocks, 128);
                Ok(())
            })
        })
        .unwrap();
}

#[test]
/// Shrinking a pool below its metadata's data size is refused, and the
/// pool keeps running with its old table.
fn test_shrink_refused() {
    let harness = sim_harness();
    let block_size = harness.config().data_block_size;
    let size = Sectors(*block_size * 128);
    harness
        .with_standard_pool(size, PoolFeatures::default(), |pool| {
            let smaller = harness.standard_pool_table(Sectors(*block_size * 64), PoolFeatures::default());
            let result = harness
                .registry()
                .pause(pool, || harness.registry().reload(pool, smaller));
            assert!(result.is_err());
            assert!(!harness.registry().is_suspended(pool)?);
            assert_eq!(harness.registry().table(pool)?.length(), size);
            assert_eq!(*harness.pool_control(pool)?.status()?.total_data_blocks, 128);
            Ok(())
        })
        .unwrap();
}

#[test]
/// Reloading a thin device with a larger table grows it.
fn test_grow_thin() {
    let harness = sim_harness();
    let tiny_size = harness.config().tiny_size();
    harness
        .with_standard_pool(harness.config().data_size, PoolFeatures::default(), |pool| {
            harness.with_new_thin(pool, tiny_size, id(0), |thin| {
                let larger = dmtest::engine::Table::thin(
                    Sectors(*tiny_size * 4),
                    &pool.device(),
                    id(0),
                );
                harness
                    .registry()
                    .pause(thin, || harness.registry().reload(thin, larger))?;
                let control = harness.thin_control(thin)?;
                assert_eq!(control.size()?, Sectors(*tiny_size * 4));
                control.wipe()?;
                assert_eq!(*harness.pool_control(pool)?.status()?.used_data_blocks, 4);
                Ok(())
            })
        })
        .unwrap();
}
