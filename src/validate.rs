// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Region attribute validation.
//!
//! Walks an arbitrarily long address range in successive
//! covered segments, comparing each segment's attributes against
//! a requirement.  A single call audits the whole range: every
//! failing segment is recorded, and the overall answer is false
//! if any segment failed.

use crate::checks::Verdict;
use crate::mem::{self, Attributes};
use crate::query::{self, Coverage};
use crate::table::RangeEntry;
use alloc::format;
use core::fmt;
use log::info;

/// How observed attributes are compared against required ones.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Match {
    /// Every required attribute must be present.
    All,
    /// At least one required attribute must be present.
    Any,
}

impl Match {
    pub fn satisfied(self, observed: Attributes, required: Attributes) -> bool {
        match self {
            Match::All => observed.contains(required),
            Match::Any => observed.intersects(required),
        }
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Match::All => write!(f, "all of"),
            Match::Any => write!(f, "any of"),
        }
    }
}

/// A requirement on the attributes of a region.
#[derive(Clone, Copy, Debug)]
pub struct RegionCheck {
    required: Attributes,
    mode: Match,
    allow_unmapped: bool,
    report: bool,
}

impl RegionCheck {
    /// Requires every attribute in `required`.  Unmapped
    /// segments fail, and failures are reported.
    pub const fn all(required: Attributes) -> RegionCheck {
        RegionCheck {
            required,
            mode: Match::All,
            allow_unmapped: false,
            report: true,
        }
    }

    /// Requires at least one attribute in `required`.
    pub const fn any(required: Attributes) -> RegionCheck {
        RegionCheck { mode: Match::Any, ..RegionCheck::all(required) }
    }

    /// Accepts segments with no mapping at all.
    pub const fn allow_unmapped(self) -> RegionCheck {
        RegionCheck { allow_unmapped: true, ..self }
    }

    /// Leaves mismatch reporting to the caller.
    pub const fn quiet(self) -> RegionCheck {
        RegionCheck { report: false, ..self }
    }

    /// Validates `[address, address + length)` in `table`.
    ///
    /// Mismatched and (if disallowed) unmapped segments are
    /// recorded in `verdict` when reporting is enabled.  Failures
    /// to classify the range at all, i.e. a malformed table or
    /// a query that makes no progress, are always recorded and
    /// end the walk.  A zero-length range is vacuously valid.
    pub fn validate(
        &self,
        table: &[RangeEntry],
        mut address: u64,
        length: u64,
        verdict: &mut Verdict,
    ) -> bool {
        let mut remaining = length;
        let mut matched = true;
        let mut stalled = false;
        while remaining > 0 {
            let coverage = match query::query(table, address, remaining) {
                Ok(coverage) => coverage,
                Err(e) => {
                    info!(
                        "Failed to get attributes for {address:#x}, length {remaining:#x}: {e}"
                    );
                    verdict.fail(
                        Some(mem::span(address, remaining)),
                        format!("attributes could not be determined: {e}"),
                    );
                    return false;
                }
            };
            let covered = coverage.length();
            if covered == 0 {
                if stalled {
                    let range = mem::span(address, remaining);
                    info!(
                        "Unexpected error parsing the range table for {:#x}-{:#x}!",
                        range.start, range.end
                    );
                    verdict.fail(Some(range), "range table walk made no progress");
                    return false;
                }
                stalled = true;
                continue;
            }
            stalled = false;

            let segment = mem::span(address, covered);
            match coverage {
                Coverage::Mapped { attributes, .. } => {
                    if !self.mode.satisfied(attributes, self.required) {
                        matched = false;
                        if self.report {
                            verdict.fail(
                                Some(segment),
                                format!(
                                    "does not have {} {} (found {attributes})",
                                    self.mode, self.required
                                ),
                            );
                        }
                    }
                }
                Coverage::Unmapped { .. } => {
                    if !self.allow_unmapped {
                        matched = false;
                        if self.report {
                            verdict.fail(Some(segment), "is not mapped");
                        }
                    }
                }
            }

            remaining -= covered;
            match address.checked_add(covered) {
                Some(next) => address = next,
                None => break,
            }
        }
        matched
    }
}
