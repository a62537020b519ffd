// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub use self::{
    config::{HarnessConfig, CONFIG_ENV_VAR},
    errors::{DmTestError, DmTestResult},
    fixtures::{in_parallel, limit_metadata_dev_size, Harness},
};

pub mod config;
pub mod errors;
mod fixtures;
