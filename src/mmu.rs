// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Flattening x86-64 page tables.
//!
//! The audit consumes a flat range table rather than a native
//! paging structure.  This module produces one from a 4-level
//! x86-64 paging hierarchy, read out of some image of physical
//! memory: a memory dump, or the live machine when running
//! in firmware.
//!
//! We walk the radix tree from the root (the value in `%cr3`),
//! visiting every present entry in address order:
//!
//! * An entry is a leaf if it is at the PML1 level, or if it
//!   has the "huge" bit set at the PML2 (2MiB page) or PML3
//!   (1GiB page) level.  Otherwise it names the next table.
//! * Permissions accumulate down the tree: a page is writable
//!   only if every entry on the path to it is writable, and it
//!   is non-executable if any entry on that path sets NX.
//! * Non-present entries leave holes in the output.
//! * Addresses in the upper half of the 48-bit space are
//!   sign-extended, so that emitted bases are canonical.
//!
//! Leaves are emitted with `RO` set when the page is not
//! writable and `XP` set when it is not executable.  Present
//! pages are readable, so `RP` is never set.  Adjacent leaves
//! with identical attributes are merged, so the result is the
//! minimal sorted, disjoint table for the hierarchy.

use crate::mem::Attributes;
use crate::table::RangeEntry;
use crate::{Error, Result};
use alloc::vec::Vec;
use bitstruct::bitstruct;
use log::debug;
use static_assertions::const_assert_eq;
use x86::bits64::paging::{
    BASE_PAGE_SIZE, HUGE_PAGE_SIZE, LARGE_PAGE_SIZE, PAGE_SIZE_ENTRIES,
};

const_assert_eq!(PAGE_SIZE_ENTRIES, 512);

/// A source of physical memory contents.
pub trait PhysicalMemory {
    /// Reads the little-endian quadword at physical address
    /// `pa`, or returns None if that address is not backed.
    fn read_u64(&self, pa: u64) -> Option<u64>;
}

/// A byte slice is physical memory starting at address zero.
impl PhysicalMemory for [u8] {
    fn read_u64(&self, pa: u64) -> Option<u64> {
        let start = usize::try_from(pa).ok()?;
        let bytes = self.get(start..start.checked_add(8)?)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }
}

impl PhysicalMemory for Vec<u8> {
    fn read_u64(&self, pa: u64) -> Option<u64> {
        self.as_slice().read_u64(pa)
    }
}

bitstruct! {
    /// A page table entry at any level of the paging hierarchy.
    /// We only define the bits that matter for flattening.
    #[derive(Copy, Clone, Debug)]
    struct PTE(u64) {
        p: bool = 0;
        w: bool = 1;
        h: bool = 7;  // Large or Huge page.
        pfn: u64 = 12..52;
        nx: bool = 63;
    }
}

impl PTE {
    fn phys_addr(self) -> u64 {
        self.pfn() << 12
    }
}

/// A level in the paging radix tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Level {
    PML4,
    PML3,
    PML2,
    PML1,
}

impl Level {
    /// The shift of the virtual address bits that index a
    /// table at this level.
    const fn shift(self) -> u32 {
        match self {
            Level::PML4 => 39,
            Level::PML3 => 30,
            Level::PML2 => 21,
            Level::PML1 => 12,
        }
    }

    /// The size of the page mapped by a leaf at this level.
    const fn page_size(self) -> u64 {
        match self {
            Level::PML4 => 1 << 39,
            Level::PML3 => HUGE_PAGE_SIZE as u64,
            Level::PML2 => LARGE_PAGE_SIZE as u64,
            Level::PML1 => BASE_PAGE_SIZE as u64,
        }
    }

    fn next(self) -> Option<Level> {
        match self {
            Level::PML4 => Some(Level::PML3),
            Level::PML3 => Some(Level::PML2),
            Level::PML2 => Some(Level::PML1),
            Level::PML1 => None,
        }
    }

    fn is_leaf(self, pte: PTE) -> bool {
        match self {
            Level::PML4 => false,
            Level::PML3 | Level::PML2 => pte.h(),
            Level::PML1 => true,
        }
    }
}

/// Sign-extends a 48-bit virtual address.
fn canonical(va: u64) -> u64 {
    (((va << 16) as i64) >> 16) as u64
}

/// Permissions accumulated along a path through the tree.
#[derive(Clone, Copy, Debug)]
struct Perms {
    writable: bool,
    nx: bool,
}

impl Perms {
    const ROOT: Perms = Perms { writable: true, nx: false };

    fn combine(self, pte: PTE) -> Perms {
        Perms { writable: self.writable && pte.w(), nx: self.nx || pte.nx() }
    }

    fn attributes(self) -> Attributes {
        Attributes::NONE.with_ro(!self.writable).with_xp(self.nx)
    }
}

struct Walker<'a, M: PhysicalMemory + ?Sized> {
    memory: &'a M,
    entries: Vec<RangeEntry>,
}

impl<M: PhysicalMemory + ?Sized> Walker<'_, M> {
    fn walk(
        &mut self,
        table: u64,
        level: Level,
        va_base: u64,
        inherited: Perms,
    ) -> Result<()> {
        for index in 0..PAGE_SIZE_ENTRIES as u64 {
            let raw = self
                .memory
                .read_u64(table + index * 8)
                .ok_or(Error::Producer("page table outside physical memory"))?;
            let pte = PTE(raw);
            if !pte.p() {
                continue;
            }
            let va = va_base | (index << level.shift());
            let perms = inherited.combine(pte);
            match level.next() {
                Some(next) if !level.is_leaf(pte) => {
                    self.walk(pte.phys_addr(), next, va, perms)?;
                }
                _ => self.emit(canonical(va), level.page_size(), perms.attributes()),
            }
        }
        Ok(())
    }

    /// Appends a leaf, merging it into the previous entry when
    /// they are contiguous and equally permissioned.
    fn emit(&mut self, base: u64, length: u64, attributes: Attributes) {
        if let Some(last) = self.entries.last_mut() {
            if last.attributes == attributes
                && last.base.checked_add(last.length) == Some(base)
            {
                last.length += length;
                return;
            }
        }
        self.entries.push(RangeEntry::new(base, length, attributes));
    }
}

/// Flattens the paging hierarchy rooted at `root` into a sorted,
/// disjoint, merged list of range entries.
pub fn flatten<M: PhysicalMemory + ?Sized>(
    memory: &M,
    root: u64,
) -> Result<Vec<RangeEntry>> {
    let root = root & !(BASE_PAGE_SIZE as u64 - 1);
    let mut walker = Walker { memory, entries: Vec::new() };
    walker.walk(root, Level::PML4, 0, Perms::ROOT)?;
    debug!("flattened page table at {root:#x}: {} entries", walker.entries.len());
    Ok(walker.entries)
}
