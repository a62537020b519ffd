// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Configuration for a harness run, read once and passed explicitly to the
// components that need it.

use std::{
    env,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use devicemapper::Sectors;
use serde_derive::Deserialize;

use crate::{
    engine::BlockDevice,
    harness::errors::{DmTestError, DmTestResult},
};

/// Environment variable naming the JSON configuration file.
pub const CONFIG_ENV_VAR: &str = "DMTEST_CONFIG";

const DEFAULT_DATA_BLOCK_SIZE: u64 = 128;
const DEFAULT_DATA_SIZE: u64 = 20_971_520;
const DEFAULT_VOLUME_SIZE: u64 = 2_097_152;
const DEFAULT_LOW_WATER_MARK: u64 = 5;
const DEFAULT_NAME_PREFIX: &str = "dmtest";

fn default_name_prefix() -> String {
    DEFAULT_NAME_PREFIX.to_owned()
}

/// The on-disk form of the configuration. Every field except the two
/// devices may be omitted.
#[derive(Debug, Deserialize)]
struct ConfigSave {
    metadata_dev: PathBuf,
    data_dev: PathBuf,
    data_block_size: Option<u64>,
    data_size: Option<u64>,
    volume_size: Option<u64>,
    low_water_mark: Option<u64>,
    #[serde(default = "default_name_prefix")]
    name_prefix: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HarnessConfig {
    pub metadata_dev: BlockDevice,
    pub data_dev: BlockDevice,
    pub data_block_size: Sectors,
    /// Size of a standard pool; always a multiple of data_block_size.
    pub data_size: Sectors,
    pub volume_size: Sectors,
    pub low_water_mark: u64,
    pub name_prefix: String,
}

impl HarnessConfig {
    /// Build a configuration with the default sizes for the given devices.
    pub fn new(metadata_dev: BlockDevice, data_dev: BlockDevice) -> HarnessConfig {
        HarnessConfig {
            metadata_dev,
            data_dev,
            data_block_size: Sectors(DEFAULT_DATA_BLOCK_SIZE),
            data_size: Sectors(DEFAULT_DATA_SIZE),
            volume_size: Sectors(DEFAULT_VOLUME_SIZE),
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            name_prefix: DEFAULT_NAME_PREFIX.to_owned(),
        }
    }

    fn from_save(save: ConfigSave) -> DmTestResult<HarnessConfig> {
        let data_block_size = save.data_block_size.unwrap_or(DEFAULT_DATA_BLOCK_SIZE);
        if data_block_size == 0 {
            return Err(DmTestError::Invalid(
                "data_block_size must be non-zero".into(),
            ));
        }
        let data_size = save.data_size.unwrap_or(DEFAULT_DATA_SIZE);

        Ok(HarnessConfig {
            metadata_dev: BlockDevice::External(save.metadata_dev),
            data_dev: BlockDevice::External(save.data_dev),
            data_block_size: Sectors(data_block_size),
            data_size: Sectors(data_size / data_block_size * data_block_size),
            volume_size: Sectors(save.volume_size.unwrap_or(DEFAULT_VOLUME_SIZE)),
            low_water_mark: save.low_water_mark.unwrap_or(DEFAULT_LOW_WATER_MARK),
            name_prefix: save.name_prefix,
        })
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> DmTestResult<HarnessConfig> {
        HarnessConfig::from_save(serde_json::from_str(json)?)
    }

    /// Read the configuration from a JSON file.
    pub fn from_file(path: &Path) -> DmTestResult<HarnessConfig> {
        let reader = BufReader::new(File::open(path)?);
        HarnessConfig::from_save(serde_json::from_reader(reader)?)
    }

    /// Read the configuration from the file named by DMTEST_CONFIG.
    pub fn from_env() -> DmTestResult<HarnessConfig> {
        let path = env::var_os(CONFIG_ENV_VAR).ok_or_else(|| {
            DmTestError::Invalid(format!("{CONFIG_ENV_VAR} is not set"))
        })?;
        HarnessConfig::from_file(Path::new(&path))
    }

    /// The size of a tiny thin device, a single data block.
    pub fn tiny_size(&self) -> Sectors {
        self.data_block_size
    }
}
