// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod common;

use devicemapper::Sectors;

use dmtest::{
    engine::{DeviceHandle, MetadataDump, PoolFeatures, SimBackend},
    harness::{DmTestResult, Harness},
};

use crate::common::sim::{blocks, id, metadata_dev, sim_harness};

fn assert_used_blocks(
    harness: &Harness<SimBackend>,
    pool: &DeviceHandle,
    count: u64,
) -> DmTestResult<()> {
    assert_eq!(*harness.pool_control(pool)?.status()?.used_data_blocks, count);
    Ok(())
}

fn assert_no_mappings(md: &MetadataDump, thin_id: u32) {
    let dev = md.device(thin_id).unwrap();
    assert_eq!(dev.mapped_blocks, 0);
    assert!(dev.mappings.is_empty());
}

fn assert_fully_mapped(harness: &Harness<SimBackend>, md: &MetadataDump, thin_id: u32) {
    let dev = md.device(thin_id).unwrap();
    assert_eq!(
        dev.mapped_blocks,
        blocks(harness, harness.config().volume_size)
    );
}

#[test]
fn test_discard_empty_device() {
    let harness = sim_harness();
    let volume_size = harness.config().volume_size;
    harness
        .with_standard_pool(harness.config().data_size, PoolFeatures::default(), |pool| {
            harness.with_new_thin(pool, volume_size, id(0), |thin| {
                harness.thin_control(thin)?.discard(Sectors(0), volume_size)?;
                assert_used_blocks(&harness, pool, 0)
            })
        })
        .unwrap();

    assert_no_mappings(&harness.read_metadata(&metadata_dev()).unwrap(), 0);
}

#[test]
fn test_discard_fully_provisioned_device() {
    let harness = sim_harness();
    let volume_size = harness.config().volume_size;
    let blocks_per_dev = blocks(&harness, volume_size);
    harness
        .with_standard_pool(harness.config().data_size, PoolFeatures::default(), |pool| {
            harness.with_new_thins(pool, volume_size, &[id(0), id(1)], |thins| {
                harness.wipe_device(&thins[0].device(), None)?;
                harness.wipe_device(&thins[1].device(), None)?;
                assert_used_blocks(&harness, pool, 2 * blocks_per_dev)?;
                harness
                    .thin_control(&thins[0])?
                    .discard(Sectors(0), volume_size)?;
                assert_used_blocks(&harness, pool, blocks_per_dev)
            })
        })
        .unwrap();

    let md = harness.read_metadata(&metadata_dev()).unwrap();
    assert_no_mappings(&md, 0);
    assert_fully_mapped(&harness, &md, 1);
}

#[test]
fn test_discard_single_block() {
    let harness = sim_harness();
    let volume_size = harness.config().volume_size;
    let block_size = harness.config().data_block_size;
    let nr_blocks = blocks(&harness, volume_size);
    harness
        .with_standard_pool(harness.config().data_size, PoolFeatures::default(), |pool| {
            harness.with_new_thin(pool, volume_size, id(0), |thin| {
                harness.wipe_device(&thin.device(), None)?;
                assert_used_blocks(&harness, pool, nr_blocks)?;
                harness.thin_control(thin)?.discard(Sectors(0), block_size)?;
                assert_used_blocks(&harness, pool, nr_blocks - 1)
            })
        })
        .unwrap();

    let md = harness.read_metadata(&metadata_dev()).unwrap();
    let provisioned = md.provisioned_blocks(0, nr_blocks);
    assert!(!provisioned[0]);
    assert!(provisioned.iter().skip(1).all(|b| *b));
}

#[test]
/// Discards that cover no whole block unmap nothing.
fn test_discard_partial_blocks() {
    let harness = sim_harness();
    let volume_size = harness.config().volume_size;
    harness
        .with_standard_pool(harness.config().data_size, PoolFeatures::default(), |pool| {
            harness.with_new_thin(pool, volume_size, id(0), |thin| {
                harness.wipe_device(&thin.device(), None)?;
                let control = harness.thin_control(thin)?;
                control.discard(Sectors(0), Sectors(127))?;
                control.discard(Sectors(63), Sectors(159))
            })
        })
        .unwrap();

    assert_fully_mapped(
        &harness,
        &harness.read_metadata(&metadata_dev()).unwrap(),
        0,
    );
}

#[test]
fn test_discard_alternate_blocks() {
    let harness = sim_harness();
    let volume_size = harness.config().volume_size;
    let block_size = harness.config().data_block_size;
    let nr_blocks = blocks(&harness, volume_size);
    harness
        .with_standard_pool(harness.config().data_size, PoolFeatures::default(), |pool| {
            harness.with_new_thin(pool, volume_size, id(0), |thin| {
                harness.wipe_device(&thin.device(), None)?;
                let control = harness.thin_control(thin)?;
                for b in (0..nr_blocks).step_by(2) {
                    control.discard(Sectors(b * *block_size), block_size)?;
                }
                Ok(())
            })
        })
        .unwrap();

    let md = harness.read_metadata(&metadata_dev()).unwrap();
    for (b, provisioned) in md.provisioned_blocks(0, nr_blocks).into_iter().enumerate() {
        assert_eq!(provisioned, b % 2 == 1, "bad provision status for block {b}");
    }
}

#[test]
/// A discarded device rewritten in full is provisioned as before.
fn test_discard_then_rewrite() {
    let harness = sim_harness();
    let volume_size = harness.config().volume_size;
    let nr_blocks = blocks(&harness, volume_size);
    harness
        .with_standard_pool(harness.config().data_size, PoolFeatures::default(), |pool| {
            harness.with_new_thin(pool, volume_size, id(0), |thin| {
                let control = harness.thin_control(thin)?;
                control.wipe()?;
                assert_used_blocks(&harness, pool, nr_blocks)?;
                control.discard(Sectors(0), volume_size)?;
                assert_used_blocks(&harness, pool, 0)?;
                control.wipe()?;
                assert_used_blocks(&harness, pool, nr_blocks)
            })
        })
        .unwrap();
}
