// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Attribute queries against a flat range table.
//!
//! A query asks what access attributes apply at the start of a
//! byte range, and how far those attributes extend.  The answer
//! covers the longest prefix of the range that is either mapped
//! with uniform attributes (possibly across several contiguous
//! entries), or entirely unmapped.  Callers advance by the
//! covered length and query again for the remainder.
//!
//! Arithmetic is done in 128 bits, so that a range ending at
//! exactly 2^64 is representable.

use crate::mem::Attributes;
use crate::table::RangeEntry;
use crate::{Error, Result};

/// The answer to a query: the attributes observed over a prefix
/// of the requested range, and the length of that prefix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Coverage {
    Mapped { attributes: Attributes, length: u64 },
    Unmapped { length: u64 },
}

impl Coverage {
    /// The number of bytes classified by this answer.
    pub fn length(&self) -> u64 {
        match *self {
            Coverage::Mapped { length, .. } => length,
            Coverage::Unmapped { length } => length,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Coverage::Mapped { .. })
    }
}

fn end_of(entry: &RangeEntry) -> u128 {
    u128::from(entry.base) + u128::from(entry.length)
}

/// Classifies the longest prefix of `[address, address + length)`
/// that has uniform attributes in `table`.
///
/// Fails with `InvalidParameter` on a zero-length request, and
/// with `MalformedTable` if the entries scanned are unsorted or
/// overlap.
pub fn query(
    table: &[RangeEntry],
    address: u64,
    length: u64,
) -> Result<Coverage> {
    if length == 0 {
        return Err(Error::InvalidParameter);
    }
    let start = u128::from(address);
    let limit = start + u128::from(length);
    let clamp = |end: u128| (end.min(limit) - start) as u64;

    let mut entries = table.iter().filter(|e| e.length != 0).peekable();
    let mut prev_end = 0u128;
    while let Some(entry) = entries.next() {
        let base = u128::from(entry.base);
        if base < prev_end {
            return Err(Error::MalformedTable);
        }
        let end = end_of(entry);
        prev_end = end;
        if end <= start {
            continue;
        }
        if base > start {
            return Ok(Coverage::Unmapped { length: clamp(base) });
        }

        // `entry` maps `address`.  Extend the answer across
        // contiguous entries with the same attributes.
        let attributes = entry.attributes;
        let mut covered = end;
        while covered < limit {
            let Some(next) = entries.peek() else { break };
            let next_base = u128::from(next.base);
            if next_base < covered {
                return Err(Error::MalformedTable);
            }
            if next_base != covered || next.attributes != attributes {
                break;
            }
            covered = end_of(next);
            entries.next();
        }
        return Ok(Coverage::Mapped { attributes, length: clamp(covered) });
    }

    Ok(Coverage::Unmapped { length: clamp(limit) })
}
