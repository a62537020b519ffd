// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Functions for interpreting the status lines reported by pool and thin
// devices.

use std::str::FromStr;

use devicemapper::{DataBlocks, MetaBlocks, Sectors};

use crate::harness::errors::{DmTestError, DmTestResult};

/// The state of a working pool. The serialized form matches the token the
/// kernel uses in the status line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::AsRefStr, strum_macros::EnumString)]
pub enum PoolMode {
    #[strum(serialize = "rw")]
    ReadWrite,
    #[strum(serialize = "ro")]
    ReadOnly,
    #[strum(serialize = "out_of_data_space")]
    OutOfDataSpace,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolStatus {
    pub transaction_id: u64,
    pub used_metadata_blocks: MetaBlocks,
    pub total_metadata_blocks: MetaBlocks,
    pub used_data_blocks: DataBlocks,
    pub total_data_blocks: DataBlocks,
    pub free_data_sectors: Sectors,
    /// Root of the metadata snapshot, if one is held.
    pub held_root: Option<u64>,
    pub mode: PoolMode,
    pub read_only: bool,
    pub discard_passdown: bool,
    pub error_if_no_space: bool,
    pub needs_check: bool,
    pub meta_low_water: Option<u64>,
}

fn parse_error(line: &str, reason: String) -> DmTestError {
    DmTestError::StatusParse {
        line: line.to_owned(),
        reason,
    }
}

fn parse_u64(line: &str, field: &str, what: &str) -> DmTestResult<u64> {
    u64::from_str(field).map_err(|_| parse_error(line, format!("{what} \"{field}\" is not a number")))
}

/// Parse a "<used>/<total>" pair.
fn parse_usage(line: &str, field: &str, what: &str) -> DmTestResult<(u64, u64)> {
    let (used, total) = field
        .split_once('/')
        .ok_or_else(|| parse_error(line, format!("{what} usage \"{field}\" is not used/total")))?;
    let used = parse_u64(line, used, what)?;
    let total = parse_u64(line, total, what)?;
    if used > total {
        return Err(parse_error(
            line,
            format!("{what} usage {used} exceeds total {total}"),
        ));
    }
    Ok((used, total))
}

impl PoolStatus {
    /// Parse a pool status line. data_block_size is the block size the pool
    /// was activated with.
    pub fn parse(line: &str, data_block_size: Sectors) -> DmTestResult<PoolStatus> {
        let fields: Vec<&str> = line.split_whitespace().collect();

        if fields.first() == Some(&"Fail") {
            return Err(parse_error(line, "pool has failed".into()));
        }
        if fields.len() < 3 {
            return Err(parse_error(
                line,
                format!("expected at least 3 fields, found {}", fields.len()),
            ));
        }

        let transaction_id = parse_u64(line, fields[0], "transaction id")?;
        let (used_meta, total_meta) = parse_usage(line, fields[1], "metadata")?;
        let (used_data, total_data) = parse_usage(line, fields[2], "data")?;

        let mut rest = fields[3..].iter().peekable();

        let held_root = match rest.peek() {
            Some(&&"-") => {
                rest.next();
                None
            }
            Some(field) if PoolMode::from_str(field).is_err() => {
                let root = parse_u64(line, field, "held root")?;
                rest.next();
                Some(root)
            }
            _ => None,
        };

        let mode = match rest.next() {
            Some(field) => PoolMode::from_str(field)
                .map_err(|_| parse_error(line, format!("unknown pool mode \"{field}\"")))?,
            None => PoolMode::ReadWrite,
        };

        let discard_passdown = match rest.next() {
            Some(&"discard_passdown") | None => true,
            Some(&"no_discard_passdown") => false,
            Some(field) => {
                return Err(parse_error(
                    line,
                    format!("unknown discard passdown value \"{field}\""),
                ))
            }
        };

        let error_if_no_space = match rest.next() {
            Some(&"queue_if_no_space") | None => false,
            Some(&"error_if_no_space") => true,
            Some(field) => {
                return Err(parse_error(
                    line,
                    format!("unknown no space policy \"{field}\""),
                ))
            }
        };

        let needs_check = match rest.next() {
            Some(&"-") | None => false,
            Some(&"needs_check") => true,
            Some(field) => {
                return Err(parse_error(
                    line,
                    format!("unknown needs_check value \"{field}\""),
                ))
            }
        };

        let meta_low_water = rest
            .next()
            .map(|field| parse_u64(line, field, "metadata low water mark"))
            .transpose()?;

        let trailing: Vec<&str> = rest.copied().collect();
        if !trailing.is_empty() {
            return Err(parse_error(
                line,
                format!("unexpected trailing fields \"{}\"", trailing.join(" ")),
            ));
        }

        let free_data_sectors = (total_data - used_data)
            .checked_mul(*data_block_size)
            .ok_or_else(|| {
                parse_error(
                    line,
                    format!("{} free data blocks overflow a sector count", total_data - used_data),
                )
            })?;

        Ok(PoolStatus {
            transaction_id,
            used_metadata_blocks: MetaBlocks(used_meta),
            total_metadata_blocks: MetaBlocks(total_meta),
            used_data_blocks: DataBlocks(used_data),
            total_data_blocks: DataBlocks(total_data),
            free_data_sectors: Sectors(free_data_sectors),
            held_root,
            mode,
            read_only: mode == PoolMode::ReadOnly,
            discard_passdown,
            error_if_no_space,
            needs_check,
            meta_low_water,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ThinUsage {
    pub mapped_sectors: Sectors,
    pub highest_mapped_sector: Option<Sectors>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThinStatus {
    Working(ThinUsage),
    Fail,
}

impl ThinStatus {
    pub fn parse(line: &str) -> DmTestResult<ThinStatus> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["Fail"] => Ok(ThinStatus::Fail),
            [mapped, highest] => {
                let mapped_sectors = Sectors(parse_u64(line, mapped, "mapped sectors")?);
                let highest_mapped_sector = match *highest {
                    "-" => None,
                    highest => Some(Sectors(parse_u64(line, highest, "highest mapped sector")?)),
                };
                Ok(ThinStatus::Working(ThinUsage {
                    mapped_sectors,
                    highest_mapped_sector,
                }))
            }
            _ => Err(parse_error(
                line,
                format!("expected 2 fields, found {}", fields.len()),
            )),
        }
    }

    /// Usage of a working thin device, None if it has failed.
    pub fn usage(&self) -> Option<&ThinUsage> {
        match self {
            ThinStatus::Working(usage) => Some(usage),
            ThinStatus::Fail => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_full_pool_line() {
        let status = PoolStatus::parse(
            "3 141/4161600 20/163840 - rw discard_passdown queue_if_no_space - 1024",
            Sectors(128),
        )
        .unwrap();
        assert_eq!(status.transaction_id, 3);
        assert_eq!(status.used_metadata_blocks, MetaBlocks(141));
        assert_eq!(status.total_metadata_blocks, MetaBlocks(4_161_600));
        assert_eq!(status.used_data_blocks, DataBlocks(20));
        assert_eq!(status.free_data_sectors, Sectors((163_840 - 20) * 128));
        assert_eq!(status.held_root, None);
        assert_eq!(status.mode, PoolMode::ReadWrite);
        assert!(!status.read_only);
        assert!(status.discard_passdown);
        assert!(!status.needs_check);
        assert_eq!(status.meta_low_water, Some(1024));
    }

    #[test]
    fn test_held_root_and_flags() {
        let status = PoolStatus::parse(
            "0 10/100 0/100 17 ro no_discard_passdown error_if_no_space needs_check",
            Sectors(256),
        )
        .unwrap();
        assert_eq!(status.held_root, Some(17));
        assert!(status.read_only);
        assert!(!status.discard_passdown);
        assert!(status.error_if_no_space);
        assert!(status.needs_check);
        assert_eq!(status.meta_low_water, None);
    }

    #[test]
    /// The held root may be left out entirely.
    fn test_short_lines() {
        let status = PoolStatus::parse("1 1/2 2/2 out_of_data_space", Sectors(128)).unwrap();
        assert_eq!(status.mode, PoolMode::OutOfDataSpace);
        assert_eq!(status.held_root, None);
        assert_eq!(status.free_data_sectors, Sectors(0));

        let status = PoolStatus::parse("1 1/2 0/2", Sectors(128)).unwrap();
        assert_eq!(status.mode, PoolMode::ReadWrite);
    }

    #[test]
    fn test_bad_pool_lines() {
        for line in [
            "Fail",
            "",
            "1 1/2",
            "x 1/2 1/2",
            "1 1/2 3/2",
            "1 1/2 1-2",
            "1 1/2 1/2 - rx",
            "1 1/2 1/2 - rw discard_everything",
            "0 10/100 0/100 - rw discard_passdown queue_if_no_space - 1024 junk more junk",
            "0 1/2 0/18446744073709551615 - rw",
        ] {
            assert_matches!(
                PoolStatus::parse(line, Sectors(128)),
                Err(DmTestError::StatusParse { .. })
            );
        }
    }

    #[test]
    fn test_thin_lines() {
        assert_eq!(
            ThinStatus::parse("256 255").unwrap().usage(),
            Some(&ThinUsage {
                mapped_sectors: Sectors(256),
                highest_mapped_sector: Some(Sectors(255)),
            })
        );
        assert_eq!(
            ThinStatus::parse("0 -").unwrap().usage().unwrap().highest_mapped_sector,
            None
        );
        assert_eq!(ThinStatus::parse("Fail").unwrap(), ThinStatus::Fail);
        assert_matches!(ThinStatus::parse("1"), Err(DmTestError::StatusParse { .. }));
    }
}
