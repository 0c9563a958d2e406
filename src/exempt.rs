// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Allow-lists for read/write/execute memory.
//!
//! A range that is readable, writable and executable is a
//! failure unless one of three sources exempts it: a special
//! region declared by platform configuration with no required
//! attributes, a loaded image excluded from code protection, or
//! a non-existent range of the physical address space.  An
//! exemption must contain the whole range; overlapping it is
//! not enough.

use crate::inventory::{AddressSpaceDescriptor, GcdMemoryType};
use crate::mem::{self, Attributes};
use alloc::vec::Vec;
use core::ops::Range;
use serde::{Deserialize, Serialize};

/// A region explicitly declared by platform configuration.  Only
/// regions that require no attributes permit RWX.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SpecialRegion {
    pub base: u64,
    pub length: u64,
    pub attributes: Attributes,
}

/// The extent of a loaded image exempted from code protection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageRange {
    pub base: u64,
    pub length: u64,
}

/// The three exemption sources, flattened into intervals.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExemptionSets {
    special: Vec<Range<u128>>,
    images: Vec<Range<u128>>,
    nonexistent: Vec<Range<u128>>,
}

impl ExemptionSets {
    pub const EMPTY: ExemptionSets = ExemptionSets {
        special: Vec::new(),
        images: Vec::new(),
        nonexistent: Vec::new(),
    };

    pub fn new(
        special: &[SpecialRegion],
        images: &[ImageRange],
        address_space: &[AddressSpaceDescriptor],
    ) -> ExemptionSets {
        let special = special
            .iter()
            .filter(|r| r.attributes == Attributes::NONE)
            .map(|r| mem::wide_span(r.base, r.length))
            .collect();
        let images =
            images.iter().map(|r| mem::wide_span(r.base, r.length)).collect();
        let nonexistent = address_space
            .iter()
            .filter(|d| d.kind == GcdMemoryType::NonExistent)
            .map(|d| mem::wide_span(d.base, d.length))
            .collect();
        ExemptionSets { special, images, nonexistent }
    }

    pub fn is_empty(&self) -> bool {
        self.special.is_empty()
            && self.images.is_empty()
            && self.nonexistent.is_empty()
    }

    /// Returns true IFF `[address, address + length)` may be
    /// readable, writable and executable.
    pub fn permits_rwx(&self, address: u64, length: u64) -> bool {
        let range = mem::wide_span(address, length);
        self.special
            .iter()
            .chain(&self.images)
            .chain(&self.nonexistent)
            .any(|exempt| mem::subsumes(exempt, &range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn special(base: u64, length: u64, attributes: Attributes) -> SpecialRegion {
        SpecialRegion { base, length, attributes }
    }

    #[test]
    fn empty_sets_fail_closed() {
        let sets = ExemptionSets::default();
        assert!(sets.is_empty());
        assert!(!sets.permits_rwx(0x1000, 0x1000));
    }

    #[test]
    fn special_regions_need_no_attributes() {
        let sets = ExemptionSets::new(
            &[
                special(0x1000, 0x1000, Attributes::NONE),
                special(0x4000, 0x1000, Attributes::XP),
            ],
            &[],
            &[],
        );
        assert!(sets.permits_rwx(0x1000, 0x1000));
        assert!(!sets.permits_rwx(0x4000, 0x1000));
    }

    #[test]
    fn overlap_is_not_exemption() {
        let sets = ExemptionSets::new(&[], &[ImageRange { base: 0, length: 100 }], &[]);
        assert!(sets.permits_rwx(10, 20));
        assert!(!sets.permits_rwx(50, 100));
    }

    #[test]
    fn top_of_address_space_is_exact() {
        // The exemption stops one byte short of the top, so an
        // entry running to 2^64 is not covered by it.
        let short = ExemptionSets::new(
            &[special(u64::MAX - 0xFFF, 0xFFF, Attributes::NONE)],
            &[],
            &[],
        );
        assert!(!short.permits_rwx(u64::MAX - 0xFFF, 0x1000));
        let full = ExemptionSets::new(
            &[],
            &[ImageRange { base: u64::MAX - 0xFFF, length: 0x1000 }],
            &[],
        );
        assert!(full.permits_rwx(u64::MAX - 0xFFF, 0x1000));
    }

    #[test]
    fn nonexistent_address_space() {
        let map = [
            AddressSpaceDescriptor::new(GcdMemoryType::SystemMemory, 0, 0x10000),
            AddressSpaceDescriptor::new(GcdMemoryType::NonExistent, 0x10000, 0x10000),
        ];
        let sets = ExemptionSets::new(&[], &[], &map);
        assert!(sets.permits_rwx(0x11000, 0x1000));
        assert!(!sets.permits_rwx(0x1000, 0x1000));
        assert!(!sets.permits_rwx(0xF000, 0x2000));
    }
}
