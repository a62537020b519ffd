// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Functions for doing I/O to block devices

use std::{
    cmp::min,
    fs::{File, OpenOptions},
    io::{BufWriter, Seek, SeekFrom, Write},
    os::unix::io::AsRawFd,
    path::Path,
};

use devicemapper::{Sectors, IEC, SECTOR_SIZE};

use crate::harness::errors::{DmTestError, DmTestResult};

nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
nix::ioctl_write_ptr_bad!(blkdiscard, nix::request_code_none!(0x12, 119), [u64; 2]);

fn to_bytes(sectors: Sectors) -> DmTestResult<u64> {
    (*sectors)
        .checked_mul(SECTOR_SIZE as u64)
        .ok_or_else(|| DmTestError::Invalid(format!("{sectors} is too large to address")))
}

/// Write buf at offset length times.
fn write_sectors<P: AsRef<Path>>(
    path: P,
    offset: Sectors,
    length: Sectors,
    buf: &[u8; SECTOR_SIZE],
) -> DmTestResult<()> {
    let capacity = min(IEC::Mi, to_bytes(length)?);
    let mut f = BufWriter::with_capacity(
        usize::try_from(capacity).unwrap_or(SECTOR_SIZE),
        OpenOptions::new().write(true).open(path)?,
    );

    f.seek(SeekFrom::Start(to_bytes(offset)?))?;
    for _ in 0..*length {
        f.write_all(buf)?;
    }

    f.flush()?;
    f.get_ref().sync_all()?;
    Ok(())
}

/// Zero sectors at the given offset for length sectors.
/// Note that this method buffers the zeros and syncs only when all are
/// written.
pub fn wipe_sectors<P: AsRef<Path>>(path: P, offset: Sectors, length: Sectors) -> DmTestResult<()> {
    write_sectors(path, offset, length, &[0u8; SECTOR_SIZE])
}

/// Discard length sectors at offset.
pub fn discard_sectors<P: AsRef<Path>>(path: P, offset: Sectors, length: Sectors) -> DmTestResult<()> {
    let f = OpenOptions::new().write(true).open(path)?;
    let range = [to_bytes(offset)?, to_bytes(length)?];
    // SAFETY: the descriptor is open for the duration of the call and range
    // outlives it.
    unsafe { blkdiscard(f.as_raw_fd(), &range) }?;
    Ok(())
}

/// The size of the block device at path.
pub fn blkdev_size<P: AsRef<Path>>(path: P) -> DmTestResult<Sectors> {
    let f = File::open(path)?;
    let mut bytes = 0u64;
    // SAFETY: the descriptor is open for the duration of the call and bytes
    // outlives it.
    unsafe { blkgetsize64(f.as_raw_fd(), &mut bytes) }?;
    Ok(Sectors(bytes / SECTOR_SIZE as u64))
}
