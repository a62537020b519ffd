// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{error::Error, fmt, io, process::Output, sync};

use devicemapper::Sectors;

pub type DmTestResult<T> = Result<T, DmTestError>;

#[derive(Debug)]
pub enum DmTestError {
    /// No allocation source has room for the requested volume.
    OutOfSpace {
        name: String,
        requested: Sectors,
        available: Sectors,
    },
    /// A volume with this name was already carved by the allocator.
    DuplicateName(String),
    /// The allocator never carved a volume with this name.
    UnknownVolume(String),

    /// The backend refused, or the registry could not admit, a table.
    Activation {
        name: String,
        source: Box<DmTestError>,
    },
    /// The device, or the thin id, is still in use.
    DeviceBusy(String),
    /// A status line did not match the grammar for its target kind.
    StatusParse { line: String, reason: String },
    /// A pool message named a thin id the pool does not hold.
    UnknownDevice(u32),
    /// The target has no record of the object a message names.
    NoData(String),
    /// An error reported by the backend that has no finer classification.
    Backend(String),
    /// Removing devices at the end of a scope failed, and nothing else did.
    Teardown(Box<DmTestError>),
    /// The caller violated a precondition of the operation.
    Invalid(String),

    /// The attempt to execute an external binary failed.
    CommandExecution { cmd: String, source: io::Error },
    /// An external binary was executed but it returned an error code.
    Command { cmd: String, output: Output },
    /// A branch of a parallel fan-out panicked.
    Parallel(String),

    Io(io::Error),
    Nix(nix::Error),
    DM(devicemapper::DmError),
    Serde(serde_json::error::Error),
}

impl DmTestError {
    /// Wrap an error as the cause of a failed activation of the named device.
    pub fn activation(name: &str, source: DmTestError) -> DmTestError {
        match source {
            err @ DmTestError::Activation { .. } => err,
            err => DmTestError::Activation {
                name: name.to_owned(),
                source: Box::new(err),
            },
        }
    }

    /// Whether this error, or the error wrapped by an activation or teardown
    /// failure, reports a busy device.
    pub fn is_busy(&self) -> bool {
        match self {
            DmTestError::DeviceBusy(_) => true,
            DmTestError::Activation { source, .. } | DmTestError::Teardown(source) => {
                source.is_busy()
            }
            _ => false,
        }
    }
}

impl fmt::Display for DmTestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmTestError::OutOfSpace {
                name,
                requested,
                available,
            } => write!(
                f,
                "no allocation source can hold volume {name}: requested {requested}, largest remaining {available}"
            ),
            DmTestError::DuplicateName(name) => write!(f, "volume {name} already exists"),
            DmTestError::UnknownVolume(name) => write!(f, "no volume named {name}"),
            DmTestError::Activation { name, source } => {
                write!(f, "failed to activate device {name}: {source}")
            }
            DmTestError::DeviceBusy(msg) => write!(f, "device busy: {msg}"),
            DmTestError::StatusParse { line, reason } => {
                write!(f, "unable to parse status line \"{line}\": {reason}")
            }
            DmTestError::UnknownDevice(id) => write!(f, "pool holds no thin device with id {id}"),
            DmTestError::NoData(msg) => write!(f, "No data available: {msg}"),
            DmTestError::Backend(msg) => write!(f, "Backend error: {msg}"),
            DmTestError::Teardown(err) => write!(f, "Teardown failed: {err}"),
            DmTestError::Invalid(msg) => write!(f, "Invalid operation: {msg}"),
            DmTestError::CommandExecution { cmd, source } => {
                write!(f, "failed to execute cmd {cmd}: {source}")
            }
            DmTestError::Command { cmd, output } => write!(
                f,
                "command {} failed. status: {}, stdout: \"{}\", stderr:\"{}\"",
                cmd,
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            ),
            DmTestError::Parallel(msg) => write!(f, "Parallel branch panicked: {msg}"),
            DmTestError::Io(err) => write!(f, "IO error: {err}"),
            DmTestError::Nix(err) => write!(f, "Nix error: {err}"),
            DmTestError::DM(err) => write!(f, "DM error: {err}"),
            DmTestError::Serde(err) => write!(f, "Serde error: {err}"),
        }
    }
}

impl Error for DmTestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DmTestError::Activation { source, .. } => Some(&**source),
            DmTestError::Teardown(err) => Some(&**err),
            DmTestError::CommandExecution { source, .. } => Some(source),
            DmTestError::Io(err) => Some(err),
            DmTestError::Nix(err) => Some(err),
            DmTestError::DM(err) => Some(err),
            DmTestError::Serde(err) => Some(err),
            DmTestError::OutOfSpace { .. }
            | DmTestError::DuplicateName(_)
            | DmTestError::UnknownVolume(_)
            | DmTestError::DeviceBusy(_)
            | DmTestError::StatusParse { .. }
            | DmTestError::UnknownDevice(_)
            | DmTestError::NoData(_)
            | DmTestError::Backend(_)
            | DmTestError::Invalid(_)
            | DmTestError::Command { .. }
            | DmTestError::Parallel(_) => None,
        }
    }
}

impl From<io::Error> for DmTestError {
    fn from(err: io::Error) -> DmTestError {
        DmTestError::Io(err)
    }
}

impl From<nix::Error> for DmTestError {
    fn from(err: nix::Error) -> DmTestError {
        DmTestError::Nix(err)
    }
}

impl From<devicemapper::DmError> for DmTestError {
    fn from(err: devicemapper::DmError) -> DmTestError {
        DmTestError::DM(err)
    }
}

impl From<serde_json::error::Error> for DmTestError {
    fn from(err: serde_json::error::Error) -> DmTestError {
        DmTestError::Serde(err)
    }
}

impl<T> From<sync::PoisonError<T>> for DmTestError {
    fn from(err: sync::PoisonError<T>) -> DmTestError {
        DmTestError::Invalid(format!("registry state lock poisoned: {err}"))
    }
}
