// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The platform memory inventory.
//!
//! Two views of physical memory feed the audit: the boot-time
//! memory map, which says what each range of RAM is being used
//! for, and the address-space map, which classifies the whole
//! physical address space (system memory, MMIO, non-existent,
//! and so on).  Both are kept sorted by base address.

use crate::mem::{self, PAGE_SIZE};
use crate::{Error, Result};
use alloc::vec::Vec;
use core::ops::Range;
use log::{debug, error};
use serde::{Deserialize, Serialize};

/// The type of a boot-time memory map entry.  Converts from
/// the raw UEFI memory type encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MemoryType {
    Reserved,
    LoaderCode,
    LoaderData,
    BootServicesCode,
    BootServicesData,
    RuntimeServicesCode,
    RuntimeServicesData,
    Conventional,
    Unusable,
    AcpiReclaim,
    AcpiNvs,
    Mmio,
    MmioPortSpace,
    PalCode,
    Persistent,
    Unaccepted,
    Other(u32),
}

impl From<u32> for MemoryType {
    fn from(raw: u32) -> MemoryType {
        match raw {
            0 => MemoryType::Reserved,
            1 => MemoryType::LoaderCode,
            2 => MemoryType::LoaderData,
            3 => MemoryType::BootServicesCode,
            4 => MemoryType::BootServicesData,
            5 => MemoryType::RuntimeServicesCode,
            6 => MemoryType::RuntimeServicesData,
            7 => MemoryType::Conventional,
            8 => MemoryType::Unusable,
            9 => MemoryType::AcpiReclaim,
            10 => MemoryType::AcpiNvs,
            11 => MemoryType::Mmio,
            12 => MemoryType::MmioPortSpace,
            13 => MemoryType::PalCode,
            14 => MemoryType::Persistent,
            15 => MemoryType::Unaccepted,
            other => MemoryType::Other(other),
        }
    }
}

/// An entry in the boot-time memory map.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryMapEntry {
    pub kind: MemoryType,
    pub base: u64,
    pub length: u64,
}

impl MemoryMapEntry {
    pub const fn new(kind: MemoryType, base: u64, length: u64) -> Self {
        MemoryMapEntry { kind, base, length }
    }

    /// Describes `pages` 4KiB pages starting at `base`.
    pub const fn from_pages(kind: MemoryType, base: u64, pages: u64) -> Self {
        MemoryMapEntry::new(kind, base, pages.saturating_mul(PAGE_SIZE))
    }

    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    pub const fn range(&self) -> Range<u64> {
        mem::span(self.base, self.length)
    }
}

impl Default for MemoryMapEntry {
    fn default() -> Self {
        MemoryMapEntry::new(MemoryType::Reserved, 0, 0)
    }
}

/// The classification of a range of the physical address space.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum GcdMemoryType {
    NonExistent,
    Reserved,
    SystemMemory,
    MemoryMappedIo,
    Persistent,
    MoreReliable,
    Unaccepted,
}

/// An entry in the physical address-space map.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AddressSpaceDescriptor {
    pub kind: GcdMemoryType,
    pub base: u64,
    pub length: u64,
}

impl AddressSpaceDescriptor {
    pub const fn new(kind: GcdMemoryType, base: u64, length: u64) -> Self {
        AddressSpaceDescriptor { kind, base, length }
    }

    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    pub const fn range(&self) -> Range<u64> {
        mem::span(self.base, self.length)
    }
}

/// Owns a snapshot of the boot-time memory map.
///
/// The map is fetched with the same two-phase protocol as the
/// range table: an empty buffer yields the required entry
/// count, we allocate that plus 20%, and fill.  Entries are
/// sorted by base address after every fill.
#[derive(Debug, Default)]
pub struct MemoryMap {
    entries: Vec<MemoryMapEntry>,
    count: usize,
}

impl MemoryMap {
    pub const fn new() -> MemoryMap {
        MemoryMap { entries: Vec::new(), count: 0 }
    }

    pub fn entries(&self) -> &[MemoryMapEntry] {
        &self.entries[..self.count]
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Asks the producer for the size of the map and grows the
    /// buffer if needed.  Growth discards the old contents.
    pub fn ensure_capacity<F>(&mut self, mut fill: F) -> Result<()>
    where
        F: FnMut(&mut [MemoryMapEntry]) -> Result<usize>,
    {
        let required = match fill(&mut []) {
            Err(Error::BufferTooSmall(required)) => required,
            Ok(0) => 0,
            Err(e) => {
                error!("Failed to get the required memory map size: {e}");
                return Err(e);
            }
            Ok(_) => {
                error!("Failed to get the required memory map size!");
                return Err(Error::Producer("no memory map size reported"));
            }
        };
        if required <= self.capacity() && !self.entries.is_empty() {
            return Ok(());
        }
        self.release();
        let capacity = usize::max(required.saturating_add(required / 5), 1);
        let mut entries = Vec::new();
        if entries.try_reserve_exact(capacity).is_err() {
            error!("Failed to allocate {capacity} memory map entries!");
            return Err(Error::ResourceExhaustion);
        }
        entries.resize(capacity, MemoryMapEntry::default());
        debug!("memory map: allocated {capacity} entries");
        self.entries = entries;
        Ok(())
    }

    /// Fills the buffer from the producer and sorts the result.
    pub fn populate<F>(&mut self, mut fill: F) -> Result<()>
    where
        F: FnMut(&mut [MemoryMapEntry]) -> Result<usize>,
    {
        if self.entries.is_empty() {
            return Err(Error::AllocationTooSmall);
        }
        self.entries.fill(MemoryMapEntry::default());
        self.count = 0;
        let count = fill(&mut self.entries)?;
        if count > self.entries.len() {
            return Err(Error::Producer("memory map overran its buffer"));
        }
        self.entries[..count].sort_unstable_by_key(|e| e.base);
        self.count = count;
        debug!("memory map: {count} entries");
        Ok(())
    }

    pub fn release(&mut self) {
        self.entries = Vec::new();
        self.count = 0;
    }
}

/// Returns the span of the physical address space described by
/// a sorted address-space map: from the base of the first
/// descriptor to the end of the last.
pub fn address_space_bounds(
    map: &[AddressSpaceDescriptor],
) -> Option<Range<u64>> {
    let first = map.first()?;
    let last = map.last()?;
    Some(first.base..last.end())
}

/// Returns the holes in a sorted memory map within `bounds`:
/// the space before the first entry, between consecutive
/// entries, and after the last entry.
///
/// Each hole is measured from the end of the entry immediately
/// before it, so an entry nested inside its predecessor can make
/// a hole appear that the predecessor actually covers.
pub fn memory_map_gaps(
    map: &[MemoryMapEntry],
    bounds: Range<u64>,
) -> Vec<Range<u64>> {
    let mut gaps = Vec::new();
    let Some((first, rest)) = map.split_first() else {
        return gaps;
    };
    if first.base > bounds.start {
        gaps.push(bounds.start..first.base);
    }
    let mut last_end = first.end();
    for entry in rest {
        if entry.base > last_end {
            gaps.push(last_end..entry.base);
        }
        last_end = entry.end();
    }
    if last_end < bounds.end {
        gaps.push(last_end..bounds.end);
    }
    gaps
}
