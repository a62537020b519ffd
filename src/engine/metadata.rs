// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Reading and writing the subset of the thin_dump XML format needed to make
// assertions about pool metadata.

use std::{collections::HashMap, fmt::Write, str::FromStr};

use lazy_static::lazy_static;
use regex::Regex;

use devicemapper::Sectors;

use crate::harness::errors::{DmTestError, DmTestResult};

lazy_static! {
    static ref TAG: Regex =
        Regex::new(r#"<(/?)([a-z_]+)((?:\s+[a-z_]+="[^"]*")*)\s*(/?)>"#).expect("valid regex");
    static ref ATTRIBUTE: Regex = Regex::new(r#"([a-z_]+)="([^"]*)""#).expect("valid regex");
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Superblock {
    pub uuid: String,
    pub time: u32,
    pub transaction: u64,
    pub data_block_size: Sectors,
    pub nr_data_blocks: u64,
}

/// A run of length thin blocks starting at origin_begin, mapped to
/// consecutive data blocks starting at data_begin.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Mapping {
    pub origin_begin: u64,
    pub data_begin: u64,
    pub length: u64,
    pub time: u32,
}

impl Mapping {
    pub fn origin_end(&self) -> u64 {
        self.origin_begin + self.length
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceDump {
    pub dev_id: u32,
    pub mapped_blocks: u64,
    pub transaction: u64,
    pub creation_time: u32,
    pub snap_time: u32,
    /// Runs in the order they appear in the dump.
    pub mappings: Vec<Mapping>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetadataDump {
    pub superblock: Superblock,
    pub devices: Vec<DeviceDump>,
}

fn bad_dump(reason: String) -> DmTestError {
    DmTestError::Invalid(format!("malformed metadata dump: {reason}"))
}

struct Attributes<'a> {
    tag: &'a str,
    values: HashMap<&'a str, &'a str>,
}

impl<'a> Attributes<'a> {
    fn new(tag: &'a str, text: &'a str) -> Attributes<'a> {
        Attributes {
            tag,
            values: ATTRIBUTE
                .captures_iter(text)
                .filter_map(|c| match (c.get(1), c.get(2)) {
                    (Some(k), Some(v)) => Some((k.as_str(), v.as_str())),
                    _ => None,
                })
                .collect(),
        }
    }

    fn get<T: FromStr>(&self, name: &str) -> DmTestResult<T> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| bad_dump(format!("<{}> has no attribute {}", self.tag, name)))?;
        T::from_str(value).map_err(|_| {
            bad_dump(format!(
                "attribute {} of <{}> has bad value \"{}\"",
                name, self.tag, value
            ))
        })
    }

    /// Like get, but missing attributes take the default value.
    fn get_or_default<T: FromStr + Default>(&self, name: &str) -> DmTestResult<T> {
        if self.values.contains_key(name) {
            self.get(name)
        } else {
            Ok(T::default())
        }
    }
}

impl MetadataDump {
    pub fn parse(xml: &str) -> DmTestResult<MetadataDump> {
        let mut superblock = None;
        let mut devices: Vec<DeviceDump> = Vec::new();
        let mut in_device = false;

        for captures in TAG.captures_iter(xml) {
            let closing = captures.get(1).is_some_and(|m| !m.as_str().is_empty());
            let tag = captures.get(2).map_or("", |m| m.as_str());
            let attrs = Attributes::new(tag, captures.get(3).map_or("", |m| m.as_str()));

            match (closing, tag) {
                (false, "superblock") => {
                    if superblock.is_some() {
                        return Err(bad_dump("more than one superblock".into()));
                    }
                    superblock = Some(Superblock {
                        uuid: attrs.get_or_default("uuid")?,
                        time: attrs.get_or_default("time")?,
                        transaction: attrs.get("transaction")?,
                        data_block_size: Sectors(attrs.get("data_block_size")?),
                        nr_data_blocks: attrs.get("nr_data_blocks")?,
                    });
                }
                (false, "device") => {
                    if superblock.is_none() {
                        return Err(bad_dump("device outside superblock".into()));
                    }
                    devices.push(DeviceDump {
                        dev_id: attrs.get("dev_id")?,
                        mapped_blocks: attrs.get("mapped_blocks")?,
                        transaction: attrs.get_or_default("transaction")?,
                        creation_time: attrs.get_or_default("creation_time")?,
                        snap_time: attrs.get_or_default("snap_time")?,
                        mappings: Vec::new(),
                    });
                    in_device = true;
                }
                (true, "device") => in_device = false,
                (false, "range_mapping" | "single_mapping") => {
                    let device = match devices.last_mut() {
                        Some(device) if in_device => device,
                        _ => return Err(bad_dump(format!("<{tag}> outside a device"))),
                    };
                    let mapping = if tag == "range_mapping" {
                        Mapping {
                            origin_begin: attrs.get("origin_begin")?,
                            data_begin: attrs.get("data_begin")?,
                            length: attrs.get("length")?,
                            time: attrs.get_or_default("time")?,
                        }
                    } else {
                        Mapping {
                            origin_begin: attrs.get("origin_block")?,
                            data_begin: attrs.get("data_block")?,
                            length: 1,
                            time: attrs.get_or_default("time")?,
                        }
                    };
                    device.mappings.push(mapping);
                }
                // Closing superblock and any tags outside the subset read.
                _ => (),
            }
        }

        Ok(MetadataDump {
            superblock: superblock.ok_or_else(|| bad_dump("no superblock".into()))?,
            devices,
        })
    }

    pub fn to_xml(&self) -> String {
        let sb = &self.superblock;
        let mut xml = String::new();
        // Writing to a String can not fail.
        let _ = writeln!(
            xml,
            r#"<superblock uuid="{}" time="{}" transaction="{}" flags="0" version="2" data_block_size="{}" nr_data_blocks="{}">"#,
            sb.uuid, sb.time, sb.transaction, *sb.data_block_size, sb.nr_data_blocks
        );
        for dev in &self.devices {
            let _ = writeln!(
                xml,
                r#"  <device dev_id="{}" mapped_blocks="{}" transaction="{}" creation_time="{}" snap_time="{}">"#,
                dev.dev_id, dev.mapped_blocks, dev.transaction, dev.creation_time, dev.snap_time
            );
            for m in &dev.mappings {
                if m.length == 1 {
                    let _ = writeln!(
                        xml,
                        r#"    <single_mapping origin_block="{}" data_block="{}" time="{}"/>"#,
                        m.origin_begin, m.data_begin, m.time
                    );
                } else {
                    let _ = writeln!(
                        xml,
                        r#"    <range_mapping origin_begin="{}" data_begin="{}" length="{}" time="{}"/>"#,
                        m.origin_begin, m.data_begin, m.length, m.time
                    );
                }
            }
            let _ = writeln!(xml, "  </device>");
        }
        let _ = writeln!(xml, "</superblock>");
        xml
    }

    pub fn device(&self, dev_id: u32) -> Option<&DeviceDump> {
        self.devices.iter().find(|d| d.dev_id == dev_id)
    }

    /// For the first nr_blocks blocks of the thin device, whether each is
    /// provisioned. An unknown device has nothing provisioned.
    pub fn provisioned_blocks(&self, dev_id: u32, nr_blocks: u64) -> Vec<bool> {
        let mut blocks: Vec<bool> = (0..nr_blocks).map(|_| false).collect();
        if let Some(dev) = self.device(dev_id) {
            for m in &dev.mappings {
                let start = m.origin_begin.min(nr_blocks);
                let end = m.origin_end().min(nr_blocks);
                blocks
                    .iter_mut()
                    .skip(usize::try_from(start).unwrap_or(usize::MAX))
                    .take(usize::try_from(end - start).unwrap_or(usize::MAX))
                    .for_each(|b| *b = true);
            }
        }
        blocks
    }
}
