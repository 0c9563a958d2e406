// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The state of one audit run.
//!
//! An `AuditContext` owns the point-in-time snapshots the checks
//! read: the flat range table, the boot-time memory map, the
//! address-space map and the exemption sets.  Each is fetched
//! from the platform on first use by an `ensure_*` method and
//! cached until `release`.  Checks call the `ensure_*` methods
//! they need up front, then read through the getters.

use crate::exempt::ExemptionSets;
use crate::inventory::{AddressSpaceDescriptor, MemoryMap, MemoryMapEntry};
use crate::platform::Platform;
use crate::table::{RangeEntry, RangeTable};
use crate::{Error, Result};
use alloc::vec::Vec;
use log::{debug, error, warn};

pub struct AuditContext<P> {
    platform: P,
    table: RangeTable,
    table_ready: bool,
    memory_map: MemoryMap,
    memory_map_ready: bool,
    address_space: Option<Vec<AddressSpaceDescriptor>>,
    exemptions: Option<ExemptionSets>,
}

impl<P: Platform> AuditContext<P> {
    pub fn new(platform: P) -> AuditContext<P> {
        AuditContext {
            platform,
            table: RangeTable::new(),
            table_ready: false,
            memory_map: MemoryMap::new(),
            memory_map_ready: false,
            address_space: None,
            exemptions: None,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Fetches the flat range table, growing its buffer as the
    /// producer requires.
    pub fn ensure_range_table(&mut self) -> Result<()> {
        if self.table_ready {
            return Ok(());
        }
        let platform = &self.platform;
        self.table.ensure_capacity(|buf| platform.build_range_table(buf))?;
        match self.table.populate(|buf| platform.build_range_table(buf)) {
            Ok(()) => {}
            Err(Error::BufferTooSmall(required)) => {
                error!(
                    "Range table still too small after growth: {required} entries required, {} available",
                    self.table.capacity()
                );
                return Err(Error::ResourceExhaustion);
            }
            Err(e) => return Err(e),
        }
        self.table_ready = true;
        Ok(())
    }

    /// Fetches the boot-time memory map, sorted by base address.
    pub fn ensure_memory_map(&mut self) -> Result<()> {
        if self.memory_map_ready {
            return Ok(());
        }
        let platform = &self.platform;
        self.memory_map.ensure_capacity(|buf| platform.memory_map(buf))?;
        match self.memory_map.populate(|buf| platform.memory_map(buf)) {
            Ok(()) => {}
            Err(Error::BufferTooSmall(required)) => {
                error!(
                    "Memory map still too small after growth: {required} entries required, {} available",
                    self.memory_map.capacity()
                );
                return Err(Error::ResourceExhaustion);
            }
            Err(e) => return Err(e),
        }
        self.memory_map_ready = true;
        Ok(())
    }

    /// Fetches the address-space map, sorted by base address.
    pub fn ensure_address_space_map(&mut self) -> Result<()> {
        if self.address_space.is_some() {
            return Ok(());
        }
        let mut map = self.platform.address_space_map().map_err(|e| {
            error!("Unable to fetch the address-space map: {e}");
            e
        })?;
        map.sort_unstable_by_key(|d| d.base);
        debug!("address-space map: {} descriptors", map.len());
        self.address_space = Some(map);
        Ok(())
    }

    /// Builds the exemption sets.  A source that cannot be
    /// fetched contributes nothing, so the checks that consult
    /// the sets only become stricter.
    pub fn ensure_exemptions(&mut self) -> Result<()> {
        if self.exemptions.is_some() {
            return Ok(());
        }
        let special = self.platform.special_regions().unwrap_or_else(|e| {
            warn!("Unable to fetch the special region list: {e}");
            Vec::new()
        });
        let images = self.platform.non_protected_images().unwrap_or_else(|e| {
            warn!("Unable to fetch the non-protected image list: {e}");
            Vec::new()
        });
        if let Err(e) = self.ensure_address_space_map() {
            warn!("No non-existent ranges will be exempted: {e}");
        }
        let sets =
            ExemptionSets::new(&special, &images, self.address_space_map());
        self.exemptions = Some(sets);
        Ok(())
    }

    /// The flat range table, or nothing if it has not been
    /// fetched.
    pub fn range_table(&self) -> &[RangeEntry] {
        if self.table_ready {
            self.table.entries()
        } else {
            &[]
        }
    }

    pub fn memory_map(&self) -> &[MemoryMapEntry] {
        if self.memory_map_ready {
            self.memory_map.entries()
        } else {
            &[]
        }
    }

    pub fn address_space_map(&self) -> &[AddressSpaceDescriptor] {
        self.address_space.as_deref().unwrap_or(&[])
    }

    /// The exemption sets.  Empty if they have not been built,
    /// which permits nothing.
    pub fn exemptions(&self) -> &ExemptionSets {
        const NONE: &ExemptionSets = &ExemptionSets::EMPTY;
        self.exemptions.as_ref().unwrap_or(NONE)
    }

    /// Drops every snapshot.  The next `ensure_*` call fetches
    /// afresh.
    pub fn release(&mut self) {
        self.table.release();
        self.table_ready = false;
        self.memory_map.release();
        self.memory_map_ready = false;
        self.address_space = None;
        self.exemptions = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exempt::SpecialRegion;
    use crate::inventory::{GcdMemoryType, MemoryType};
    use crate::mem::Attributes;
    use crate::platform::MockPlatform;
    use crate::table::fill_from;
    use alloc::vec;

    fn entries(n: u64) -> Vec<RangeEntry> {
        (0..n).map(|k| RangeEntry::new(k * 0x2000, 0x1000, Attributes::XP)).collect()
    }

    #[test]
    fn range_table_is_fetched_once() {
        let src = entries(1000);
        let expected = src.clone();
        let mut platform = MockPlatform::new();
        platform
            .expect_build_range_table()
            .times(2)
            .returning(move |buf| fill_from(&src, buf));
        let mut ctx = AuditContext::new(platform);
        assert!(ctx.range_table().is_empty());
        ctx.ensure_range_table().unwrap();
        ctx.ensure_range_table().unwrap();
        assert_eq!(ctx.range_table(), &expected[..]);
    }

    #[test]
    fn persistent_overflow_is_exhaustion() {
        let mut platform = MockPlatform::new();
        let mut calls = 0;
        platform.expect_build_range_table().returning(move |_| {
            calls += 1;
            Err(Error::BufferTooSmall(calls * 100_000))
        });
        let mut ctx = AuditContext::new(platform);
        assert_eq!(ctx.ensure_range_table(), Err(Error::ResourceExhaustion));
        assert!(ctx.range_table().is_empty());
    }

    #[test]
    fn empty_producers_are_ready() {
        let mut platform = MockPlatform::new();
        platform
            .expect_build_range_table()
            .times(2)
            .returning(|buf| fill_from(&[], buf));
        platform
            .expect_memory_map()
            .times(2)
            .returning(|buf| fill_from(&[], buf));
        let mut ctx = AuditContext::new(platform);
        ctx.ensure_range_table().unwrap();
        ctx.ensure_memory_map().unwrap();
        ctx.ensure_range_table().unwrap();
        ctx.ensure_memory_map().unwrap();
        assert!(ctx.range_table().is_empty());
        assert!(ctx.memory_map().is_empty());
    }

    #[test]
    fn memory_map_is_sorted() {
        let src = vec![
            MemoryMapEntry::new(MemoryType::Conventional, 0x9000, 0x1000),
            MemoryMapEntry::new(MemoryType::Mmio, 0x1000, 0x1000),
        ];
        let mut platform = MockPlatform::new();
        platform
            .expect_memory_map()
            .times(2)
            .returning(move |buf| fill_from(&src, buf));
        let mut ctx = AuditContext::new(platform);
        ctx.ensure_memory_map().unwrap();
        let bases: Vec<u64> = ctx.memory_map().iter().map(|e| e.base).collect();
        assert_eq!(bases, [0x1000, 0x9000]);
    }

    #[test]
    fn address_space_map_is_sorted_and_cached() {
        let mut platform = MockPlatform::new();
        platform.expect_address_space_map().times(1).returning(|| {
            Ok(vec![
                AddressSpaceDescriptor::new(GcdMemoryType::MemoryMappedIo, 0x8000, 0x1000),
                AddressSpaceDescriptor::new(GcdMemoryType::SystemMemory, 0, 0x8000),
            ])
        });
        let mut ctx = AuditContext::new(platform);
        ctx.ensure_address_space_map().unwrap();
        ctx.ensure_address_space_map().unwrap();
        assert_eq!(ctx.address_space_map()[0].base, 0);
        assert_eq!(ctx.address_space_map()[1].base, 0x8000);
    }

    #[test]
    fn missing_exemption_sources_are_empty() {
        let mut platform = MockPlatform::new();
        platform.expect_special_regions().returning(|| Err(Error::NotFound));
        platform.expect_non_protected_images().returning(|| Err(Error::NotFound));
        platform.expect_address_space_map().returning(|| Err(Error::NotFound));
        let mut ctx = AuditContext::new(platform);
        ctx.ensure_exemptions().unwrap();
        assert!(ctx.exemptions().is_empty());
    }

    #[test]
    fn exemptions_combine_sources() {
        let mut platform = MockPlatform::new();
        platform.expect_special_regions().returning(|| {
            Ok(vec![SpecialRegion { base: 0x1000, length: 0x1000, attributes: Attributes::NONE }])
        });
        platform.expect_non_protected_images().returning(|| Err(Error::NotFound));
        platform.expect_address_space_map().returning(|| {
            Ok(vec![AddressSpaceDescriptor::new(GcdMemoryType::NonExistent, 0x10000, 0x10000)])
        });
        let mut ctx = AuditContext::new(platform);
        ctx.ensure_exemptions().unwrap();
        assert!(ctx.exemptions().permits_rwx(0x1000, 0x1000));
        assert!(ctx.exemptions().permits_rwx(0x18000, 0x1000));
        assert!(!ctx.exemptions().permits_rwx(0x3000, 0x1000));
    }

    #[test]
    fn release_forgets_snapshots() {
        let src = entries(4);
        let mut platform = MockPlatform::new();
        platform
            .expect_build_range_table()
            .times(4)
            .returning(move |buf| fill_from(&src, buf));
        let mut ctx = AuditContext::new(platform);
        ctx.ensure_range_table().unwrap();
        ctx.release();
        assert!(ctx.range_table().is_empty());
        assert!(ctx.exemptions().is_empty());
        ctx.ensure_range_table().unwrap();
        assert_eq!(ctx.range_table().len(), 4);
    }
}
