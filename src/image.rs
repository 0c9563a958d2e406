// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loaded executable images and their sections.
//!
//! The image check only needs each section's placement and
//! characteristics, plus the image's section alignment.  Those
//! are captured in `LoadedImage`; `LoadedImage::parse` extracts
//! them from a PE/COFF image as it sits in memory.

use crate::inventory::MemoryType;
use crate::mem::{Attributes, PAGE_SIZE, RUNTIME_PAGE_GRANULARITY};
use crate::{Error, Result};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use bitstruct::bitstruct;
use core::ops::Range;
use goblin::pe::options::ParseOptions;
use goblin::pe::PE;
use serde::{Deserialize, Serialize};

bitstruct! {
    /// The subset of PE section characteristics that say what
    /// a section holds and how it may be accessed.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct SectionFlags(u32) {
        pub code: bool = 5;
        pub initialized_data: bool = 6;
        pub uninitialized_data: bool = 7;
        pub execute: bool = 29;
        pub read: bool = 30;
        pub write: bool = 31;
    }
}

/// What a section holds, which decides the attributes its
/// memory must have.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SectionKind {
    /// Code together with data.  Such a section can never be
    /// both read-only and non-executable.
    Mixed,
    /// Executable and not writable; must be read-only.
    Code,
    /// Anything else; must be non-executable.
    Data,
}

impl SectionKind {
    /// The attributes the section's memory must carry.  Mixed
    /// sections have no satisfiable requirement.
    pub fn required(self) -> Option<Attributes> {
        match self {
            SectionKind::Mixed => None,
            SectionKind::Code => Some(Attributes::RO),
            SectionKind::Data => Some(Attributes::XP),
        }
    }
}

/// A section header, as placed relative to its image base.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub virtual_address: u32,
    pub raw_size: u32,
    pub characteristics: u32,
}

impl Section {
    pub fn flags(&self) -> SectionFlags {
        SectionFlags(self.characteristics)
    }

    pub fn kind(&self) -> SectionKind {
        let flags = self.flags();
        if flags.code() && (flags.initialized_data() || flags.uninitialized_data())
        {
            SectionKind::Mixed
        } else if flags.execute() && !flags.write() {
            SectionKind::Code
        } else {
            SectionKind::Data
        }
    }
}

/// An executable image loaded in memory.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LoadedImage {
    /// The debug file name recorded in the image, if any.
    pub name: Option<String>,
    pub base: u64,
    pub size: u64,
    /// The memory type the image's code was allocated from.
    pub code_type: MemoryType,
    pub section_alignment: u32,
    pub sections: Vec<Section>,
}

impl LoadedImage {
    /// A printable name for the image.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    pub fn range(&self) -> Range<u64> {
        crate::mem::span(self.base, self.size)
    }

    /// Returns true IFF the section alignment is non-zero and a
    /// multiple of the allocation granularity of the memory the
    /// image was loaded into.
    pub fn is_section_aligned(&self) -> bool {
        let granularity = match self.code_type {
            MemoryType::RuntimeServicesCode
            | MemoryType::RuntimeServicesData
            | MemoryType::AcpiNvs
            | MemoryType::AcpiReclaim => RUNTIME_PAGE_GRANULARITY,
            _ => PAGE_SIZE,
        };
        let alignment = u64::from(self.section_alignment);
        alignment != 0 && alignment % granularity == 0
    }

    /// Returns the memory occupied by `section`: from its
    /// virtual address up to its raw size rounded up to the
    /// section alignment.  Returns None if the alignment is zero
    /// or the range would overflow.
    pub fn section_range(&self, section: &Section) -> Option<Range<u64>> {
        let alignment = u64::from(self.section_alignment);
        if alignment == 0 {
            return None;
        }
        let start = self.base.checked_add(u64::from(section.virtual_address))?;
        let size =
            u64::from(section.raw_size).div_ceil(alignment).checked_mul(alignment)?;
        let end = start.checked_add(size)?;
        Some(start..end)
    }

    /// Extracts section records from a PE32 or PE32+ image
    /// loaded at `base`, given its bytes as laid out in memory.
    pub fn parse(
        base: u64,
        code_type: MemoryType,
        bytes: &[u8],
    ) -> Result<LoadedImage> {
        let mut opts = ParseOptions::default();
        opts.resolve_rva = false;
        let pe = PE::parse_with_opts(bytes, &opts)
            .map_err(|_| Error::Image("cannot parse PE image"))?;
        let optional = pe
            .header
            .optional_header
            .ok_or(Error::Image("PE image has no optional header"))?;
        let windows = optional.windows_fields;
        let name = pe
            .debug_data
            .and_then(|debug| debug.codeview_pdb70_debug_info)
            .map(|info| info.filename)
            .and_then(|filename| {
                let len =
                    filename.iter().position(|&b| b == 0).unwrap_or(filename.len());
                core::str::from_utf8(&filename[..len]).ok()
            })
            .filter(|name| !name.is_empty())
            .map(ToString::to_string);
        let sections = pe
            .sections
            .iter()
            .map(|s| Section {
                virtual_address: s.virtual_address,
                raw_size: s.size_of_raw_data,
                characteristics: s.characteristics,
            })
            .collect();
        Ok(LoadedImage {
            name,
            base,
            size: u64::from(windows.size_of_image),
            code_type,
            section_alignment: windows.section_alignment,
            sections,
        })
    }
}
