// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stand-ins for platform services that are not available in
//! tests.

use crate::exempt::{ImageRange, SpecialRegion};
use crate::image::LoadedImage;
use crate::inventory::{AddressSpaceDescriptor, MemoryMapEntry};
use crate::platform::Platform;
use crate::table::{fill_from, RangeEntry};
use crate::{Error, Result};
use alloc::vec::Vec;
use core::ops::Range;

/// A platform described entirely by its fields.  Sources set to
/// `None` report `NotFound`.
#[derive(Clone, Debug, Default)]
pub(crate) struct FakePlatform {
    pub ranges: Vec<RangeEntry>,
    pub memory_map: Vec<MemoryMapEntry>,
    pub address_space: Option<Vec<AddressSpaceDescriptor>>,
    pub special_regions: Option<Vec<SpecialRegion>>,
    pub non_protected_images: Option<Vec<ImageRange>>,
    pub images: Vec<LoadedImage>,
    pub boot_stack: Option<Range<u64>>,
    pub memory_attribute_interface: bool,
}

impl FakePlatform {
    /// A platform with the given range table, an empty
    /// address-space map, and nothing else.
    pub fn with_ranges(ranges: &[RangeEntry]) -> FakePlatform {
        FakePlatform {
            ranges: ranges.to_vec(),
            address_space: Some(Vec::new()),
            ..FakePlatform::default()
        }
    }
}

impl Platform for FakePlatform {
    fn build_range_table(&self, buf: &mut [RangeEntry]) -> Result<usize> {
        fill_from(&self.ranges, buf)
    }

    fn address_space_map(&self) -> Result<Vec<AddressSpaceDescriptor>> {
        self.address_space.clone().ok_or(Error::NotFound)
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
        Ok(self.images.clone())
    }

    fn boot_stack(&self) -> Result<Option<Range<u64>>> {
        Ok(self.boot_stack.clone())
    }

    fn has_memory_attribute_interface(&self) -> bool {
        self.memory_attribute_interface
    }
}
