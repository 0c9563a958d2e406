// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Paging audit
//!
//! Verifies that a platform's address translation structures and
//! memory inventory uphold a set of memory protection
//! invariants:
//!
//! * No range is simultaneously readable, writable and
//!   executable, unless it is explicitly exempted.
//! * Free memory, the zero page, and every physical address
//!   outside the memory map is unmapped or read-protected.
//! * Device (MMIO) memory is not executable.
//! * Loaded image code sections are read-only and data sections
//!   are non-executable.
//! * The boot stack is non-executable and sits above a guard
//!   page.
//! * The platform exposes a memory attribute interface.
//!
//! The translation structure is consumed in a normalized form:
//! a sorted list of disjoint `RangeEntry` records, each with an
//! access attribute set.  Everything that produces those records
//! and the memory inventories sits behind the `Platform` trait;
//! the audit itself is a read-only pass over a point-in-time
//! snapshot held by an `AuditContext`.
//!
//! The library is `no_std` (it needs only `alloc`) so that it
//! can run inside firmware.  The `std` feature adds snapshot
//! files and the command line driver.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod checks;
pub mod context;
pub mod exempt;
pub mod image;
pub mod inventory;
pub mod mem;
pub mod mmu;
pub mod platform;
pub mod query;
#[cfg(feature = "std")]
pub mod snapshot;
pub mod table;
pub mod validate;

#[cfg(test)]
mod fakes;

pub use checks::{run, run_all, Check, Diagnostic, Report, Verdict};
pub use context::AuditContext;
pub use mem::Attributes;
pub use platform::Platform;
pub use table::{RangeEntry, RangeTable};

use core::fmt;

/// Errors raised while building or scanning audit snapshots.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The buffer handed to a producer cannot hold its output.
    /// Carries the number of entries required.
    BufferTooSmall(usize),
    /// The requested data source is not present on the
    /// platform.
    NotFound,
    /// An argument was out of range, e.g. a zero-length query.
    InvalidParameter,
    /// A buffer was populated before it was allocated.
    AllocationTooSmall,
    /// Memory for a snapshot could not be allocated, or a
    /// producer still overflowed after growth.
    ResourceExhaustion,
    /// The range table is unsorted or has overlapping entries.
    MalformedTable,
    /// A producer failed in some unexpected way.
    Producer(&'static str),
    /// An executable image could not be parsed.
    Image(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BufferTooSmall(n) => {
                write!(f, "buffer too small: {n} entries required")
            }
            Error::NotFound => write!(f, "not found"),
            Error::InvalidParameter => write!(f, "invalid parameter"),
            Error::AllocationTooSmall => {
                write!(f, "buffer used before it was allocated")
            }
            Error::ResourceExhaustion => write!(f, "out of resources"),
            Error::MalformedTable => {
                write!(f, "range table is unsorted or overlapping")
            }
            Error::Producer(msg) => write!(f, "producer failed: {msg}"),
            Error::Image(msg) => write!(f, "image: {msg}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
