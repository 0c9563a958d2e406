// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Addresses, intervals and memory access attributes.

use bitstruct::bitstruct;
use core::fmt;
use core::ops::{BitOr, Range};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// The allocation granularity of the platform, and the size of
/// the null page.
pub const PAGE_SIZE: u64 = 4 * KIB;
const_assert_eq!(PAGE_SIZE as usize, x86::bits64::paging::BASE_PAGE_SIZE);

/// Allocation granularity of runtime memory.  On aarch64 runtime
/// allocations are made in 64KiB units so that an OS using 64KiB
/// pages can map them.
#[cfg(target_arch = "aarch64")]
pub const RUNTIME_PAGE_GRANULARITY: u64 = 64 * KIB;
#[cfg(not(target_arch = "aarch64"))]
pub const RUNTIME_PAGE_GRANULARITY: u64 = PAGE_SIZE;

bitstruct! {
    /// The access attributes of a range of memory.  Bit positions
    /// match the UEFI memory attribute definitions, so firmware
    /// attribute words can be wrapped without translation.
    ///
    /// Note that these are restrictions: a range with none of
    /// them set is readable, writable and executable.
    #[derive(Clone, Copy, Default, Eq, PartialEq, Hash)]
    pub struct Attributes(u64) {
        pub rp: bool = 13;  // Read-protected: any access faults.
        pub xp: bool = 14;  // Execute-protected.
        pub ro: bool = 17;  // Read-only: writes fault.
    }
}

impl Attributes {
    /// The empty set.  Memory with no restrictions is RWX.
    pub const NONE: Attributes = Attributes(0);
    pub const RP: Attributes = Attributes(1 << 13);
    pub const XP: Attributes = Attributes(1 << 14);
    pub const RO: Attributes = Attributes(1 << 17);
    /// Every access restriction we understand.
    pub const ACCESS_MASK: Attributes =
        Attributes(Self::RP.0 | Self::XP.0 | Self::RO.0);

    /// Wraps a raw attribute word.  Bits outside the access
    /// mask (e.g. cacheability) are kept, but ignored.
    pub const fn from_bits(bits: u64) -> Attributes {
        Attributes(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns true IFF every attribute in `other` is also set
    /// in `self`.
    pub const fn contains(self, other: Attributes) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true IFF at least one attribute in `other` is
    /// also set in `self`.
    pub const fn intersects(self, other: Attributes) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true IFF memory with these attributes may be
    /// read, written and executed.
    pub const fn is_rwx(self) -> bool {
        !self.intersects(Self::ACCESS_MASK)
    }
}

impl BitOr for Attributes {
    type Output = Attributes;

    fn bitor(self, rhs: Attributes) -> Attributes {
        Attributes(self.0 | rhs.0)
    }
}

impl From<u64> for Attributes {
    fn from(bits: u64) -> Attributes {
        Attributes(bits)
    }
}

impl From<Attributes> for u64 {
    fn from(attrs: Attributes) -> u64 {
        attrs.0
    }
}

impl Serialize for Attributes {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Attributes {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Attributes, D::Error> {
        u64::deserialize(deserializer).map(Attributes)
    }
}

/// Prints the names of the set access attributes, e.g.
/// `RP|XP`.  The empty set prints as `none`.
impl fmt::Display for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [(self.rp(), "RP"), (self.ro(), "RO"), (self.xp(), "XP")];
        let mut sep = "";
        for (_, name) in names.iter().filter(|&&(set, _)| set) {
            write!(f, "{sep}{name}")?;
            sep = "|";
        }
        if sep.is_empty() {
            write!(f, "none")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Attributes({self})")
    }
}

/// Returns true IFF the half-open interval `a` fully contains
/// `b`.  Any interval subsumes an empty interval that starts
/// within or at its bounds.
pub fn subsumes<T: PartialOrd>(a: &Range<T>, b: &Range<T>) -> bool {
    a.start <= b.start && a.end >= b.end
}

/// Returns true IFF the half-open intervals `a` and `b` share
/// at least one address.  Empty intervals overlap nothing.
pub const fn overlaps(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.end > a.start
        && b.end > b.start
        && ((a.start <= b.start && a.end > b.start)
            || (b.start <= a.start && b.end > a.start))
}

/// Returns the half-open interval `[base, base + length)`.  The
/// end saturates at the top of the address space.
pub const fn span(base: u64, length: u64) -> Range<u64> {
    base..base.saturating_add(length)
}

/// Returns `[base, base + length)` in 128 bits, so that an
/// interval ending at exactly 2^64 is represented exactly.
pub const fn wide_span(base: u64, length: u64) -> Range<u128> {
    base as u128..base as u128 + length as u128
}

/// Aligns `addr` down to a multiple of `align`, which must be a
/// power of two.
pub const fn align_down(addr: u64, align: u64) -> u64 {
    addr & !(align - 1)
}

/// Aligns `value` up to a multiple of `align`, which must be a
/// power of two.  Returns None on overflow.
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Returns the number of pages needed to hold `size` bytes.
pub const fn size_to_pages(size: u64) -> u64 {
    size / PAGE_SIZE + (size % PAGE_SIZE != 0) as u64
}

/// Returns true IFF the given 48-bit virtual address is
/// canonical.
pub const fn is_canonical(va: u64) -> bool {
    va <= 0x0000_7FFF_FFFF_FFFF || 0xFFFF_8000_0000_0000 <= va
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn attribute_bits() {
        assert_eq!(Attributes::RP.bits(), 0x2000);
        assert_eq!(Attributes::XP.bits(), 0x4000);
        assert_eq!(Attributes::RO.bits(), 0x2_0000);
        let attrs = Attributes::default().with_ro(true).with_xp(true);
        assert_eq!(attrs, Attributes::RO | Attributes::XP);
        assert!(attrs.ro());
        assert!(!attrs.rp());
    }

    #[test]
    fn contains_and_intersects() {
        let rp_xp = Attributes::RP | Attributes::XP;
        assert!(rp_xp.contains(Attributes::XP));
        assert!(!Attributes::XP.contains(rp_xp));
        assert!(Attributes::XP.intersects(rp_xp));
        assert!(!Attributes::RO.intersects(rp_xp));
        assert!(Attributes::NONE.contains(Attributes::NONE));
    }

    #[test]
    fn rwx_ignores_cache_bits() {
        // Writeback caching, no access restrictions.
        assert!(Attributes::from_bits(0x8).is_rwx());
        assert!(!Attributes::from_bits(0x8 | 0x4000).is_rwx());
    }

    #[test]
    fn display() {
        assert_eq!(format!("{}", Attributes::NONE), "none");
        assert_eq!(format!("{}", Attributes::XP | Attributes::RP), "RP|XP");
        assert_eq!(format!("{}", Attributes::ACCESS_MASK), "RP|RO|XP");
    }

    #[test]
    fn subsumption() {
        assert!(subsumes(&(0..100), &(0..100)));
        assert!(subsumes(&(0..100), &(10..20)));
        assert!(!subsumes(&(0..100), &(50..150)));
        assert!(!subsumes(&(50..150), &(0..100)));
        // Degenerate intervals.
        assert!(subsumes(&(0..100), &(100..100)));
        assert!(subsumes(&(5..5), &(5..5)));
        assert!(!subsumes(&(5..5), &(5..6)));
    }

    #[test]
    fn wide_spans_reach_the_top() {
        let top = wide_span(u64::MAX - 0xFFF, 0x1000);
        assert_eq!(top.end, 1u128 << 64);
        assert!(!subsumes(&wide_span(u64::MAX - 0xFFF, 0xFFF), &top));
        assert!(subsumes(&wide_span(0, u64::MAX), &wide_span(0x1000, 0x1000)));
    }

    #[test]
    fn overlap() {
        assert!(overlaps(&(0..100), &(50..150)));
        assert!(overlaps(&(50..150), &(0..100)));
        assert!(!overlaps(&(0..100), &(100..200)));
        assert!(overlaps(&(0..100), &(10..20)));
        // Empty intervals overlap nothing, not even themselves.
        assert!(!overlaps(&(10..10), &(0..100)));
        assert!(!overlaps(&(0..100), &(10..10)));
        assert!(!overlaps(&(10..10), &(10..10)));
    }

    #[test]
    fn alignment() {
        assert_eq!(align_down(0x1234, PAGE_SIZE), 0x1000);
        assert_eq!(align_up(0x1234, PAGE_SIZE), Some(0x2000));
        assert_eq!(align_up(0x2000, PAGE_SIZE), Some(0x2000));
        assert_eq!(align_up(u64::MAX, PAGE_SIZE), None);
        assert_eq!(size_to_pages(0), 0);
        assert_eq!(size_to_pages(1), 1);
        assert_eq!(size_to_pages(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn spans_saturate() {
        assert_eq!(span(0x1000, 0x1000), 0x1000..0x2000);
        assert_eq!(span(u64::MAX - 1, 16), u64::MAX - 1..u64::MAX);
    }

    #[test]
    fn canonical() {
        assert!(is_canonical(0));
        assert!(is_canonical(0x0000_7FFF_FFFF_F000));
        assert!(!is_canonical(0x0000_8000_0000_0000));
        assert!(is_canonical(0xFFFF_8000_0000_0000));
    }
}
