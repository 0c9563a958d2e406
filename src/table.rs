// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flat range table.
//!
//! A platform's translation structure is audited in a normalized
//! form: an ordered list of disjoint `RangeEntry` records, each
//! describing a run of mapped addresses that share access
//! attributes.  Gaps between entries are unmapped.
//!
//! The table is filled by an external producer using a
//! two-phase protocol.  We first call the producer with an empty
//! buffer; it reports `Error::BufferTooSmall(n)` with the exact
//! number of entries it needs.  We then allocate with 20%
//! headroom, since the act of allocating may itself change the
//! translation structure, and call the producer again to fill
//! the buffer.  The buffer is sized in whole pages, as firmware
//! page allocations would be.

use crate::mem::{self, Attributes, PAGE_SIZE};
use crate::{Error, Result};
use alloc::vec::Vec;
use core::ops::Range;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

/// A run of mapped addresses with uniform access attributes.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize,
)]
pub struct RangeEntry {
    pub base: u64,
    pub length: u64,
    pub attributes: Attributes,
}

impl RangeEntry {
    pub const fn new(base: u64, length: u64, attributes: Attributes) -> Self {
        RangeEntry { base, length, attributes }
    }

    /// Returns the end of the entry.  This saturates: an entry
    /// that runs to the very top of the address space ends at
    /// `u64::MAX`.
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    pub const fn range(&self) -> Range<u64> {
        mem::span(self.base, self.length)
    }
}

const ENTRY_SIZE: usize = core::mem::size_of::<RangeEntry>();
const_assert!(ENTRY_SIZE <= PAGE_SIZE as usize);

/// Owns the buffer backing a flat range table and tracks how
/// much of it the producer filled.
#[derive(Debug, Default)]
pub struct RangeTable {
    entries: Vec<RangeEntry>,
    count: usize,
    pages: usize,
}

impl RangeTable {
    /// Returns a new, unallocated table.
    pub const fn new() -> RangeTable {
        RangeTable { entries: Vec::new(), count: 0, pages: 0 }
    }

    /// Returns an allocated, empty table with room for at least
    /// `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Result<RangeTable> {
        let mut table = RangeTable::new();
        table.allocate(capacity)?;
        Ok(table)
    }

    /// Returns a populated table holding the given entries.
    pub fn from_entries(entries: &[RangeEntry]) -> Result<RangeTable> {
        let mut table = RangeTable::with_capacity(entries.len())?;
        table.entries[..entries.len()].copy_from_slice(entries);
        table.count = entries.len();
        Ok(table)
    }

    /// The populated entries.
    pub fn entries(&self) -> &[RangeEntry] {
        &self.entries[..self.count]
    }

    /// The number of entries the current allocation can hold.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// The size of the current allocation, in pages.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Asks the producer how many entries it needs, and grows
    /// the allocation if it is too small.  Growth frees the old
    /// buffer first, so the table must be populated afterwards.
    pub fn ensure_capacity<F>(&mut self, mut fill: F) -> Result<()>
    where
        F: FnMut(&mut [RangeEntry]) -> Result<usize>,
    {
        let required = match fill(&mut []) {
            Err(Error::BufferTooSmall(required)) => required,
            Ok(0) => 0,
            Err(e) => {
                error!("Failed to get the required range table size: {e}");
                return Err(e);
            }
            Ok(_) => {
                error!("Failed to get the required range table size!");
                return Err(Error::Producer("no range table size reported"));
            }
        };
        if required <= self.capacity() && !self.entries.is_empty() {
            return Ok(());
        }
        self.release();
        self.allocate(usize::max(required.saturating_add(required / 5), 1))
    }

    /// Fills the allocated buffer from the producer.  The
    /// buffer is cleared first, so nothing from a previous
    /// population survives.
    pub fn populate<F>(&mut self, mut fill: F) -> Result<()>
    where
        F: FnMut(&mut [RangeEntry]) -> Result<usize>,
    {
        if self.entries.is_empty() {
            return Err(Error::AllocationTooSmall);
        }
        self.entries.fill(RangeEntry::default());
        self.count = 0;
        let count = fill(&mut self.entries)?;
        if count > self.entries.len() {
            return Err(Error::Producer("range table overran its buffer"));
        }
        self.count = count;
        debug!("range table: {count} entries in {} pages", self.pages);
        Ok(())
    }

    /// Frees the buffer and forgets its contents.
    pub fn release(&mut self) {
        self.entries = Vec::new();
        self.count = 0;
        self.pages = 0;
    }

    /// Allocates whole pages to hold at least `count` entries.
    /// The table can use every entry that fits in those pages.
    fn allocate(&mut self, count: usize) -> Result<()> {
        let bytes = count
            .checked_mul(ENTRY_SIZE)
            .ok_or(Error::ResourceExhaustion)?;
        let pages = mem::size_to_pages(bytes as u64) as usize;
        let capacity = pages * PAGE_SIZE as usize / ENTRY_SIZE;
        let mut entries = Vec::new();
        if entries.try_reserve_exact(capacity).is_err() {
            error!("Failed to allocate {pages} pages for the range table!");
            return Err(Error::ResourceExhaustion);
        }
        entries.resize(capacity, RangeEntry::default());
        debug!("range table: allocated {pages} pages for {capacity} entries");
        self.entries = entries;
        self.count = 0;
        self.pages = pages;
        Ok(())
    }
}

/// Serves a pre-built list of records through the two-phase
/// producer protocol: reports `BufferTooSmall` when `buf` is
/// empty, as in the sizing call, or cannot hold `src`, otherwise copies
/// `src` into it and returns the number of records written.
pub fn fill_from<T: Copy>(src: &[T], buf: &mut [T]) -> Result<usize> {
    if buf.is_empty() || buf.len() < src.len() {
        return Err(Error::BufferTooSmall(src.len()));
    }
    buf[..src.len()].copy_from_slice(src);
    Ok(src.len())
}
