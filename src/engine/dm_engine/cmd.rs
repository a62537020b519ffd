// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Handles invoking external binaries.
// This module assumes that, for a given machine, there is only one place
// where the desired executable might be installed. The binaries are located
// once, on first use; verify_binaries() reports any that are missing so that
// a test run can give up before it starts.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use lazy_static::lazy_static;
use log::debug;

use crate::harness::errors::{DmTestError, DmTestResult};

const BINARIES_PATHS: [&str; 4] = ["/usr/sbin", "/sbin", "/usr/bin", "/bin"];

/// Find the binary with the given name by looking in likely locations.
/// Return None if no binary was found.
fn find_binary(name: &str) -> Option<PathBuf> {
    BINARIES_PATHS
        .iter()
        .map(|pre| [pre, name].iter().collect::<PathBuf>())
        .find(|path| path.exists())
}

// These are the external binaries that the real backend relies on.
// Any change in this list requires a corresponding change to BINARIES,
// and vice-versa.
const THIN_CHECK: &str = "thin_check";
const THIN_DUMP: &str = "thin_dump";
const THIN_RESTORE: &str = "thin_restore";
const UDEVADM: &str = "udevadm";

lazy_static! {
    static ref BINARIES: HashMap<String, Option<PathBuf>> = [
        (THIN_CHECK.to_string(), find_binary(THIN_CHECK)),
        (THIN_DUMP.to_string(), find_binary(THIN_DUMP)),
        (THIN_RESTORE.to_string(), find_binary(THIN_RESTORE)),
        (UDEVADM.to_string(), find_binary(UDEVADM)),
    ]
    .iter()
    .cloned()
    .collect();
}

/// Verify that all binaries that the backend might invoke are available at
/// some path. Return an error naming any that are missing.
pub fn verify_binaries() -> DmTestResult<()> {
    let missing: Vec<&str> = BINARIES
        .iter()
        .filter(|(_, path)| path.is_none())
        .map(|(name, _)| name.as_str())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DmTestError::Invalid(format!(
            "executables {} not found in any of {}",
            missing.join(", "),
            BINARIES_PATHS.join(", ")
        )))
    }
}

/// Invoke the specified command. Return an error if invoking the command
/// fails or if the command itself fails.
fn execute_cmd(cmd: &mut Command) -> DmTestResult<Output> {
    debug!("Executing {cmd:?}");
    match cmd.output() {
        Err(err) => Err(DmTestError::CommandExecution {
            cmd: format!("{cmd:?}"),
            source: err,
        }),
        Ok(result) => {
            if result.status.success() {
                Ok(result)
            } else {
                Err(DmTestError::Command {
                    cmd: format!("{cmd:?}"),
                    output: result,
                })
            }
        }
    }
}

/// Get an absolute path for the executable with the given name.
fn get_executable(name: &str) -> DmTestResult<&Path> {
    BINARIES
        .get(name)
        .and_then(|path| path.as_deref())
        .ok_or_else(|| DmTestError::Invalid(format!("executable {name} not found")))
}

/// Dump the pool metadata on devnode as XML, from the held root if given.
pub fn thin_dump(devnode: &Path, held_root: Option<u64>) -> DmTestResult<String> {
    let mut cmd = Command::new(get_executable(THIN_DUMP)?);
    if let Some(root) = held_root {
        cmd.arg("-m").arg(root.to_string());
    }
    let output = execute_cmd(cmd.arg(devnode))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Write the XML metadata in input to devnode.
pub fn thin_restore(input: &Path, devnode: &Path) -> DmTestResult<()> {
    execute_cmd(
        Command::new(get_executable(THIN_RESTORE)?)
            .arg("-i")
            .arg(input)
            .arg("-o")
            .arg(devnode),
    )
    .map(|_| ())
}

/// Call thin_check on the pool metadata on devnode.
pub fn thin_check(devnode: &Path) -> DmTestResult<()> {
    execute_cmd(
        Command::new(get_executable(THIN_CHECK)?)
            .arg("-q")
            .arg(devnode),
    )
    .map(|_| ())
}

/// Call udevadm settle
pub fn udev_settle() -> DmTestResult<()> {
    execute_cmd(Command::new(get_executable(UDEVADM)?).arg("settle")).map(|_| ())
}
