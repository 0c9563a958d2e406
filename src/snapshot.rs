// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Platform snapshots.
//!
//! A `Snapshot` records everything the checks read from a
//! platform, so that an audit can be captured in one place and
//! replayed in another.  Snapshots are stored as JSON.  Sources
//! the platform could not produce are recorded as `null`, and
//! replay reports them as not found.

use crate::context::AuditContext;
use crate::exempt::{ImageRange, SpecialRegion};
use crate::image::LoadedImage;
use crate::inventory::{AddressSpaceDescriptor, MemoryMapEntry};
use crate::platform::Platform;
use crate::table::{fill_from, RangeEntry};
use crate::{Error, Result};
use anyhow::Context;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::ops::Range;
use std::path::Path;

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub range_table: Vec<RangeEntry>,
    pub memory_map: Vec<MemoryMapEntry>,
    pub address_space_map: Option<Vec<AddressSpaceDescriptor>>,
    pub special_regions: Option<Vec<SpecialRegion>>,
    pub non_protected_images: Option<Vec<ImageRange>>,
    pub loaded_images: Vec<LoadedImage>,
    pub boot_stack: Option<Range<u64>>,
    pub memory_attribute_interface: bool,
}

impl Snapshot {
    /// Captures the state of the platform behind `ctx`.  Only
    /// the range table is mandatory; anything else that cannot
    /// be fetched is recorded as missing.
    pub fn capture<P: Platform>(
        ctx: &mut AuditContext<P>,
    ) -> anyhow::Result<Snapshot> {
        ctx.ensure_range_table().context("capturing the range table")?;
        let memory_map = match ctx.ensure_memory_map() {
            Ok(()) => ctx.memory_map().to_vec(),
            Err(e) => {
                warn!("Memory map not captured: {e}");
                Vec::new()
            }
        };
        let address_space_map = match ctx.ensure_address_space_map() {
            Ok(()) => Some(ctx.address_space_map().to_vec()),
            Err(e) => {
                warn!("Address-space map not captured: {e}");
                None
            }
        };
        let platform = ctx.platform();
        let loaded_images = platform.loaded_images().unwrap_or_else(|e| {
            warn!("Loaded images not captured: {e}");
            Vec::new()
        });
        let boot_stack = platform.boot_stack().unwrap_or_else(|e| {
            warn!("Boot stack not captured: {e}");
            None
        });
        Ok(Snapshot {
            range_table: ctx.range_table().to_vec(),
            memory_map,
            address_space_map,
            special_regions: platform.special_regions().ok(),
            non_protected_images: platform.non_protected_images().ok(),
            loaded_images,
            boot_stack,
            memory_attribute_interface: platform
                .has_memory_attribute_interface(),
        })
    }

    /// Writes the snapshot to `path` as JSON.
    pub fn store(&self, path: &Path) -> anyhow::Result<()> {
        let file = File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .with_context(|| format!("writing {}", path.display()))?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Reads a snapshot from the JSON file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Snapshot> {
        let file = File::open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))
    }
}

impl Platform for Snapshot {
    fn build_range_table(&self, buf: &mut [RangeEntry]) -> Result<usize> {
        fill_from(&self.range_table, buf)
    }

    fn address_space_map(&self) -> Result<Vec<AddressSpaceDescriptor>> {
        self.address_space_map.clone().ok_or(Error::NotFound)
    }

    fn memory_map(&self, buf: &mut [MemoryMapEntry]) -> Result<usize> {
        fill_from(&self.memory_map, buf)
    }

    fn special_regions(&self) -> Result<Vec<SpecialRegion>> {
        self.special_regions.clone().ok_or(Error::NotFound)
    }

    fn non_protected_images(&self) -> Result<Vec<ImageRange>> {
        self.non_protected_images.clone().ok_or(Error::NotFound)
    }

    fn loaded_images(&self) -> Result<Vec<LoadedImage>> {
        Ok(self.loaded_images.clone())
    }

    fn boot_stack(&self) -> Result<Option<Range<u64>>> {
        Ok(self.boot_stack.clone())
    }

    fn has_memory_attribute_interface(&self) -> bool {
        self.memory_attribute_interface
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::{self, Check};
    use crate::fakes::FakePlatform;
    use crate::inventory::{GcdMemoryType, MemoryType};
    use crate::mem::Attributes;

    fn platform() -> FakePlatform {
        let mut platform = FakePlatform::with_ranges(&[
            RangeEntry::new(0x1000, 0x1000, Attributes::RO),
            RangeEntry::new(0x2000, 0x1000, Attributes::NONE),
        ]);
        platform.memory_map = vec![
            MemoryMapEntry::new(MemoryType::LoaderCode, 0x1000, 0x1000),
            MemoryMapEntry::new(MemoryType::Conventional, 0x2000, 0x1000),
        ];
        platform.address_space = Some(vec![AddressSpaceDescriptor::new(
            GcdMemoryType::SystemMemory,
            0,
            0x4000,
        )]);
        platform.boot_stack = Some(0x3000..0x4000);
        platform
    }

    #[test]
    fn capture_records_missing_sources() {
        let mut ctx = AuditContext::new(platform());
        let snapshot = Snapshot::capture(&mut ctx).unwrap();
        assert_eq!(snapshot.range_table.len(), 2);
        assert_eq!(snapshot.memory_map[0].kind, MemoryType::LoaderCode);
        assert_eq!(snapshot.special_regions, None);
        assert_eq!(snapshot.boot_stack, Some(0x3000..0x4000));
    }

    #[test]
    fn stored_snapshot_audits_the_same() {
        let mut ctx = AuditContext::new(platform());
        let snapshot = Snapshot::capture(&mut ctx).unwrap();
        let expected = checks::run_all(&mut ctx);

        let path = std::env::temp_dir()
            .join(format!("paging-audit-{}.json", std::process::id()));
        snapshot.store(&path).unwrap();
        let loaded = Snapshot::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, snapshot);

        let report = checks::run_all(&mut AuditContext::new(loaded));
        assert_eq!(report, expected);
        assert!(!report.verdict(Check::NoReadWriteExecute).unwrap().passed);
    }

    #[test]
    fn fields_default_when_absent() {
        let json = r#"{ "range_table": [ { "base": 0, "length": 4096, "attributes": 8192 } ] }"#;
        let snapshot: Snapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.range_table[0].attributes, Attributes::RP);
        assert!(snapshot.memory_map.is_empty());
        assert_eq!(snapshot.address_space_map, None);
        assert!(!snapshot.memory_attribute_interface);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Snapshot::load(Path::new("/nonexistent/snapshot.json")).unwrap_err();
        assert!(format!("{err:#}").contains("opening /nonexistent/snapshot.json"));
    }
}
