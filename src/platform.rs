// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The platform interface.
//!
//! Everything the audit reads comes from a `Platform`: the flat
//! range table, the memory inventories, the exemption sources,
//! the loaded images and the boot stack.  Firmware would back
//! this with its own services; the command line driver backs it
//! with a snapshot file.
//!
//! `build_range_table` and `memory_map` use a two-phase
//! protocol.  Given a buffer too small for the whole result,
//! they must fail with `Error::BufferTooSmall(n)`, where `n` is
//! the number of entries required, and write nothing.
//! Otherwise they fill the buffer and return the number of
//! entries written.

use crate::exempt::{ImageRange, SpecialRegion};
use crate::image::LoadedImage;
use crate::inventory::{AddressSpaceDescriptor, MemoryMapEntry};
use crate::table::RangeEntry;
use crate::Result;
use alloc::vec::Vec;
use core::ops::Range;

#[cfg_attr(test, mockall::automock)]
pub trait Platform {
    /// Fills `buf` with the flat range table.
    fn build_range_table(&self, buf: &mut [RangeEntry]) -> Result<usize>;

    /// Returns the physical address-space map.  Need not be
    /// sorted.
    fn address_space_map(&self) -> Result<Vec<AddressSpaceDescriptor>>;

    /// Fills `buf` with the boot-time memory map.  Need not be
    /// sorted.
    fn memory_map(&self, buf: &mut [MemoryMapEntry]) -> Result<usize>;

    /// Returns the regions declared by platform configuration.
    fn special_regions(&self) -> Result<Vec<SpecialRegion>>;

    /// Returns the images excluded from code protection.
    fn non_protected_images(&self) -> Result<Vec<ImageRange>>;

    fn loaded_images(&self) -> Result<Vec<LoadedImage>>;

    /// Returns the memory allocated for the boot stack, if the
    /// platform recorded it.
    fn boot_stack(&self) -> Result<Option<Range<u64>>>;

    /// Returns true IFF the platform exposes an interface to
    /// query and set memory attributes.
    fn has_memory_attribute_interface(&self) -> bool;
}
