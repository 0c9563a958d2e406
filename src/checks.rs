// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The memory protection invariants.
//!
//! Each check is a pass/fail predicate over the snapshots held
//! by an `AuditContext`.  A check scans everything relevant to
//! it before giving a verdict, so a single run enumerates every
//! offending range.  Only a missing prerequisite, such as an
//! inventory the platform cannot produce, stops a check early;
//! the check then fails, and the run moves on to the next one.

use crate::context::AuditContext;
use crate::inventory::{self, GcdMemoryType, MemoryType};
use crate::mem::{self, Attributes, PAGE_SIZE};
use crate::platform::Platform;
use crate::validate::RegionCheck;
use crate::{Error, Result};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;
use core::str::FromStr;
use log::{error, info, warn};

/// A failing range, or the reason a check could not complete.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Diagnostic {
    pub range: Option<Range<u64>>,
    pub reason: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.range {
            Some(range) => {
                write!(f, "{:#x}-{:#x} {}", range.start, range.end, self.reason)
            }
            None => write!(f, "{}", self.reason),
        }
    }
}

/// The outcome of one check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Verdict {
    pub passed: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl Verdict {
    pub fn new() -> Verdict {
        Verdict { passed: true, diagnostics: Vec::new() }
    }

    /// A verdict for a check that could not run to completion.
    pub fn aborted(reason: impl Into<String>) -> Verdict {
        let mut verdict = Verdict::new();
        verdict.fail(None, reason);
        verdict
    }

    /// Records a failure, and logs it.
    pub fn fail(&mut self, range: Option<Range<u64>>, reason: impl Into<String>) {
        let diagnostic = Diagnostic { range, reason: reason.into() };
        error!("{diagnostic}");
        self.passed = false;
        self.diagnostics.push(diagnostic);
    }
}

impl Default for Verdict {
    fn default() -> Verdict {
        Verdict::new()
    }
}

/// The invariants, in the order a full run checks them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Check {
    NoReadWriteExecute,
    UnallocatedIsReadProtected,
    MemoryAttributeInterface,
    NullPageIsReadProtected,
    MmioIsNonExecutable,
    ImageSections,
    StackGuarded,
    OutsideMemoryMapInaccessible,
}

impl Check {
    pub const ALL: [Check; 8] = [
        Check::NoReadWriteExecute,
        Check::UnallocatedIsReadProtected,
        Check::MemoryAttributeInterface,
        Check::NullPageIsReadProtected,
        Check::MmioIsNonExecutable,
        Check::ImageSections,
        Check::StackGuarded,
        Check::OutsideMemoryMapInaccessible,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Check::NoReadWriteExecute => "no-rwx",
            Check::UnallocatedIsReadProtected => "unallocated-rp",
            Check::MemoryAttributeInterface => "memory-attribute-interface",
            Check::NullPageIsReadProtected => "null-page-rp",
            Check::MmioIsNonExecutable => "mmio-xp",
            Check::ImageSections => "image-sections",
            Check::StackGuarded => "stack-guard",
            Check::OutsideMemoryMapInaccessible => "outside-memory-map",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Check::NoReadWriteExecute => {
                "no memory is readable, writable and executable"
            }
            Check::UnallocatedIsReadProtected => {
                "free memory is read-protected or unmapped"
            }
            Check::MemoryAttributeInterface => {
                "the memory attribute interface is present"
            }
            Check::NullPageIsReadProtected => {
                "the null page is read-protected or unmapped"
            }
            Check::MmioIsNonExecutable => "MMIO is non-executable",
            Check::ImageSections => {
                "image code sections are read-only and data sections non-executable"
            }
            Check::StackGuarded => {
                "the boot stack is non-executable with a guard page"
            }
            Check::OutsideMemoryMapInaccessible => {
                "memory outside the memory map is inaccessible"
            }
        }
    }

    /// Runs the check against `ctx`.
    pub fn run<P: Platform>(self, ctx: &mut AuditContext<P>) -> Verdict {
        info!("{}: checking that {}", self.name(), self.description());
        let result = match self {
            Check::NoReadWriteExecute => no_read_write_execute(ctx),
            Check::UnallocatedIsReadProtected => unallocated_is_rp(ctx),
            Check::MemoryAttributeInterface => memory_attribute_interface(ctx),
            Check::NullPageIsReadProtected => null_page_is_rp(ctx),
            Check::MmioIsNonExecutable => mmio_is_xp(ctx),
            Check::ImageSections => image_sections(ctx),
            Check::StackGuarded => stack_guarded(ctx),
            Check::OutsideMemoryMapInaccessible => outside_memory_map(ctx),
        };
        result.unwrap_or_else(|e| {
            Verdict::aborted(format!("{}: could not complete: {e}", self.name()))
        })
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Check {
    type Err = Error;

    fn from_str(s: &str) -> Result<Check> {
        Check::ALL.into_iter().find(|c| c.name() == s).ok_or(Error::NotFound)
    }
}

/// The verdicts of a run, in the order the checks ran.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Report {
    pub results: Vec<(Check, Verdict)>,
}

impl Report {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|(_, verdict)| verdict.passed)
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|(_, verdict)| !verdict.passed).count()
    }

    pub fn verdict(&self, check: Check) -> Option<&Verdict> {
        self.results.iter().find(|(c, _)| *c == check).map(|(_, v)| v)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (check, verdict) in self.results.iter() {
            let status = if verdict.passed { "PASS" } else { "FAIL" };
            writeln!(f, "{status} {check}: {}", check.description())?;
            for diagnostic in verdict.diagnostics.iter() {
                writeln!(f, "    {diagnostic}")?;
            }
        }
        let total = self.results.len();
        write!(f, "{} of {total} checks passed", total - self.failures())
    }
}

/// Runs the given checks in order, then releases the context's
/// snapshots.
pub fn run<P: Platform>(ctx: &mut AuditContext<P>, checks: &[Check]) -> Report {
    let results = checks.iter().map(|&check| (check, check.run(ctx))).collect();
    ctx.release();
    Report { results }
}

/// Runs every check.
pub fn run_all<P: Platform>(ctx: &mut AuditContext<P>) -> Report {
    run(ctx, &Check::ALL)
}

fn no_read_write_execute<P: Platform>(ctx: &mut AuditContext<P>) -> Result<Verdict> {
    ctx.ensure_exemptions()?;
    ctx.ensure_address_space_map()?;
    ctx.ensure_range_table()?;
    let mut verdict = Verdict::new();
    let exemptions = ctx.exemptions();
    for entry in ctx.range_table() {
        if entry.attributes.is_rwx()
            && !exemptions.permits_rwx(entry.base, entry.length)
        {
            verdict.fail(Some(entry.range()), "is read/write/execute");
        }
    }
    Ok(verdict)
}

fn unallocated_is_rp<P: Platform>(ctx: &mut AuditContext<P>) -> Result<Verdict> {
    ctx.ensure_range_table()?;
    ctx.ensure_memory_map()?;
    let mut verdict = Verdict::new();
    let check = RegionCheck::any(Attributes::RP).allow_unmapped();
    for entry in ctx.memory_map() {
        if entry.kind == MemoryType::Conventional {
            check.validate(ctx.range_table(), entry.base, entry.length, &mut verdict);
        }
    }
    Ok(verdict)
}

fn memory_attribute_interface<P: Platform>(
    ctx: &mut AuditContext<P>,
) -> Result<Verdict> {
    let mut verdict = Verdict::new();
    if !ctx.platform().has_memory_attribute_interface() {
        verdict.fail(None, "the memory attribute interface is not present");
    }
    Ok(verdict)
}

fn null_page_is_rp<P: Platform>(ctx: &mut AuditContext<P>) -> Result<Verdict> {
    ctx.ensure_range_table()?;
    let mut verdict = Verdict::new();
    RegionCheck::any(Attributes::RP).allow_unmapped().validate(
        ctx.range_table(),
        0,
        PAGE_SIZE,
        &mut verdict,
    );
    Ok(verdict)
}

fn mmio_is_xp<P: Platform>(ctx: &mut AuditContext<P>) -> Result<Verdict> {
    ctx.ensure_range_table()?;
    ctx.ensure_address_space_map()?;
    ctx.ensure_memory_map()?;
    let mut verdict = Verdict::new();
    let check = RegionCheck::any(Attributes::RP | Attributes::XP).allow_unmapped();
    let table = ctx.range_table();
    let from_memory_map = ctx
        .memory_map()
        .iter()
        .filter(|e| e.kind == MemoryType::Mmio)
        .map(|e| e.range());
    let from_address_space = ctx
        .address_space_map()
        .iter()
        .filter(|d| d.kind == GcdMemoryType::MemoryMappedIo)
        .map(|d| d.range());
    for range in from_memory_map.chain(from_address_space) {
        check.validate(table, range.start, range.end - range.start, &mut verdict);
    }
    Ok(verdict)
}

fn image_sections<P: Platform>(ctx: &mut AuditContext<P>) -> Result<Verdict> {
    ctx.ensure_range_table()?;
    let images = ctx.platform().loaded_images().map_err(|e| {
        error!("Unable to enumerate loaded images: {e}");
        e
    })?;
    let table = ctx.range_table();
    let mut verdict = Verdict::new();
    for image in images.iter() {
        let name = image.display_name();
        if image.name.is_none() {
            let range = image.range();
            warn!(
                "Could not get name of image loaded at {:#x}-{:#x}",
                range.start, range.end
            );
        }
        if !image.is_section_aligned() {
            verdict.fail(
                Some(image.range()),
                format!(
                    "is image {name}, whose section alignment {:#x} does not suit {:?} memory",
                    image.section_alignment, image.code_type
                ),
            );
            continue;
        }
        for section in image.sections.iter() {
            let Some(range) = image.section_range(section) else {
                verdict.fail(
                    None,
                    format!(
                        "image {name}: section at {:#x} overflows the address space",
                        section.virtual_address
                    ),
                );
                continue;
            };
            let Some(required) = section.kind().required() else {
                verdict.fail(
                    Some(range),
                    format!("in image {name} contains code and data"),
                );
                continue;
            };
            let check = RegionCheck::all(required).quiet();
            if !check.validate(table, range.start, range.end - range.start, &mut verdict)
            {
                verdict.fail(Some(range), format!("in image {name} is not {required}"));
            }
        }
    }
    Ok(verdict)
}

fn stack_guarded<P: Platform>(ctx: &mut AuditContext<P>) -> Result<Verdict> {
    ctx.ensure_range_table()?;
    let mut verdict = Verdict::new();
    let Some(stack) = ctx.platform().boot_stack()? else {
        warn!("No boot stack allocation was recorded");
        return Ok(verdict);
    };
    let base = mem::align_down(stack.start, PAGE_SIZE);
    let end = mem::size_to_pages(stack.end.saturating_sub(stack.start))
        .checked_mul(PAGE_SIZE)
        .and_then(|length| base.checked_add(length));
    let Some(end) = end else {
        verdict.fail(
            Some(stack),
            "is a boot stack record that overflows the address space",
        );
        return Ok(verdict);
    };
    info!("Boot stack located at {base:#x}-{end:#x}");

    let table = ctx.range_table();
    let guard = base..end.min(base.saturating_add(PAGE_SIZE));
    let body = guard.end..end;
    if body.is_empty() {
        warn!("Boot stack at {base:#x}-{end:#x} has no pages above its guard page");
    }
    let guarded = RegionCheck::any(Attributes::RP).allow_unmapped().quiet();
    if !guarded.validate(table, guard.start, guard.end - guard.start, &mut verdict) {
        verdict.fail(
            Some(guard),
            "does not have a read-protected page to catch stack overflow",
        );
    }
    let nx = RegionCheck::any(Attributes::XP).quiet();
    if !nx.validate(table, body.start, body.end - body.start, &mut verdict) {
        verdict.fail(Some(body), "is boot stack that is not XP");
    }
    Ok(verdict)
}

fn outside_memory_map<P: Platform>(ctx: &mut AuditContext<P>) -> Result<Verdict> {
    ctx.ensure_range_table()?;
    ctx.ensure_address_space_map()?;
    ctx.ensure_memory_map()?;
    let Some(bounds) = inventory::address_space_bounds(ctx.address_space_map())
    else {
        return Ok(Verdict::aborted("the address-space map is empty"));
    };
    if ctx.memory_map().is_empty() {
        return Ok(Verdict::aborted("the memory map is empty"));
    }
    let mut verdict = Verdict::new();
    let check = RegionCheck::any(Attributes::RP).allow_unmapped();
    for gap in inventory::memory_map_gaps(ctx.memory_map(), bounds) {
        check.validate(ctx.range_table(), gap.start, gap.end - gap.start, &mut verdict);
    }
    Ok(verdict)
}
