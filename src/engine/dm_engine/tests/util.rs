// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{thread::sleep, time::Duration};

use log::{debug, error};

use devicemapper::{DevId, DmName, DmOptions, DM};

use crate::{
    engine::dm_engine::cmd::udev_settle,
    harness::errors::{DmTestError, DmTestResult},
};

/// Prefix of every device made by the loopbacked tests.
pub const TEST_PREFIX: &str = "dmtest";

/// One pass over the devices carrying the prefix, removing what can be
/// removed. Devices layered on others go first, so several passes may be
/// needed. Returns whether anything was removed, and what is left.
fn one_iteration(dm: &DM, prefix: &str) -> DmTestResult<(bool, Vec<String>)> {
    let mut progress_made = false;
    let mut remain = Vec::new();

    for (name, _, _) in dm
        .list_devices()?
        .iter()
        .filter(|(n, _, _)| n.to_string().starts_with(prefix))
    {
        match dm.device_remove(&DevId::Name(name), DmOptions::default()) {
            Ok(_) => progress_made = true,
            Err(_) => remain.push(name.to_string()),
        }
    }

    // Retries if no progress has been made.
    if !remain.is_empty() && !progress_made {
        remain.retain(|name| {
            let dm_name = match DmName::new(name) {
                Ok(n) => n,
                Err(_) => return true,
            };
            for _ in 0..3 {
                match dm.device_remove(&DevId::Name(dm_name), DmOptions::default()) {
                    Ok(_) => {
                        progress_made = true;
                        return false;
                    }
                    Err(e) => {
                        debug!("Failed to remove device {name} on retry: {e}");
                        sleep(Duration::from_secs(1));
                    }
                }
            }
            true
        });
    }

    Ok((progress_made, remain))
}

/// Remove every device-mapper device whose name starts with prefix.
pub fn dm_devices_remove(prefix: &str) -> DmTestResult<()> {
    udev_settle()?;
    let dm = DM::new()?;
    let mut result = one_iteration(&dm, prefix)?;
    while result.0 {
        result = one_iteration(&dm, prefix)?;
    }
    if result.1.is_empty() {
        Ok(())
    } else {
        error!("Failed to remove devices {:?}", result.1);
        Err(DmTestError::Teardown(Box::new(DmTestError::Backend(
            format!("devices remaining: {:?}", result.1),
        ))))
    }
}

/// When a test panics it can leave devices behind. Remove every device
/// made by the tests.
pub fn clean_up() -> DmTestResult<()> {
    dm_devices_remove(TEST_PREFIX)
}
