//! PE (Portable Executable) Format Definitions
//!
//! Constants and parsed-image types for 32-bit Windows executables.
//!
//! # PE File Structure
//! ```text
//! +------------------+
//! | DOS Header (MZ)  |  64 bytes
//! +------------------+
//! | DOS Stub         |  Variable
//! +------------------+
//! | PE Signature     |  4 bytes ("PE\0\0")
//! +------------------+
//! | COFF Header      |  20 bytes
//! +------------------+
//! | Optional Header  |  96 bytes (PE32)
//! +------------------+
//! | Data Directories |  Up to 16 entries
//! +------------------+
//! | Section Headers  |  40 bytes each
//! +------------------+
//! | Sections         |  Variable
//! +------------------+
//! ```

pub mod parser;

pub use parser::{parse, PeError};

use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;

/// DOS header signature ("MZ")
pub const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D;

/// PE signature ("PE\0\0")
pub const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550;

/// PE32 optional header magic
pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10B;

/// PE32+ (64-bit) optional header magic
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20B;

/// Number of data directories
pub const IMAGE_NUMBEROF_DIRECTORY_ENTRIES: usize = 16;

/// Size of a section name
pub const IMAGE_SIZEOF_SHORT_NAME: usize = 8;

/// Size of the DOS header
pub const IMAGE_SIZEOF_DOS_HEADER: usize = 64;

/// Size of the COFF file header
pub const IMAGE_SIZEOF_FILE_HEADER: usize = 20;

/// Size of a section header
pub const IMAGE_SIZEOF_SECTION_HEADER: usize = 40;

/// Size of an import descriptor
pub const IMAGE_SIZEOF_IMPORT_DESCRIPTOR: usize = 20;

/// Ordinal flag for 32-bit import lookup entries
pub const IMAGE_ORDINAL_FLAG32: u32 = 0x8000_0000;

/// Machine type constants
pub mod machine_type {
    /// Intel 386 or later
    pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014C;
    /// AMD64 (x64)
    pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
}

/// File characteristics flags
pub mod file_characteristics {
    /// Relocation info stripped from file
    pub const IMAGE_FILE_RELOCS_STRIPPED: u16 = 0x0001;
    /// File is executable
    pub const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
    /// 32 bit word machine
    pub const IMAGE_FILE_32BIT_MACHINE: u16 = 0x0100;
    /// File is a DLL
    pub const IMAGE_FILE_DLL: u16 = 0x2000;
}

/// Subsystem constants
pub mod subsystem {
    /// Windows GUI subsystem
    pub const IMAGE_SUBSYSTEM_WINDOWS_GUI: u16 = 2;
    /// Windows CUI (console) subsystem
    pub const IMAGE_SUBSYSTEM_WINDOWS_CUI: u16 = 3;
}

/// Data directory entry indices
pub mod directory_entry {
    /// Export Directory
    pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
    /// Import Directory
    pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
    /// Base Relocation Table
    pub const IMAGE_DIRECTORY_ENTRY_BASERELOC: usize = 5;
    /// Import Address Table
    pub const IMAGE_DIRECTORY_ENTRY_IAT: usize = 12;
}

/// Section characteristics flags
pub mod section_characteristics {
    /// Section contains code
    pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
    /// Section contains initialized data
    pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
    /// Section contains uninitialized data
    pub const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
    /// Section can be discarded
    pub const IMAGE_SCN_MEM_DISCARDABLE: u32 = 0x0200_0000;
    /// Section is executable
    pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
    /// Section is readable
    pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
    /// Section is writable
    pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;
}

/// Relocation types
pub mod relocation_type {
    /// Relocation is ignored (block padding)
    pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
    /// Add the 32-bit delta
    pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
    /// Add the 64-bit delta (PE32+; rejected for I386 images)
    pub const IMAGE_REL_BASED_DIR64: u16 = 10;
}

bitflags! {
    /// Advisory per-section permissions, condensed from the raw
    /// characteristics word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const CODE = 1 << 3;
        const INITIALIZED = 1 << 4;
        const UNINITIALIZED = 1 << 5;
    }
}

impl SectionFlags {
    /// Condense an `IMAGE_SCN_*` characteristics word.
    pub fn from_characteristics(ch: u32) -> Self {
        use section_characteristics::*;
        let mut flags = SectionFlags::empty();
        if ch & IMAGE_SCN_MEM_READ != 0 {
            flags |= SectionFlags::READ;
        }
        if ch & IMAGE_SCN_MEM_WRITE != 0 {
            flags |= SectionFlags::WRITE;
        }
        if ch & IMAGE_SCN_MEM_EXECUTE != 0 {
            flags |= SectionFlags::EXECUTE;
        }
        if ch & IMAGE_SCN_CNT_CODE != 0 {
            flags |= SectionFlags::CODE | SectionFlags::EXECUTE;
        }
        if ch & IMAGE_SCN_CNT_INITIALIZED_DATA != 0 {
            flags |= SectionFlags::INITIALIZED | SectionFlags::READ;
        }
        if ch & IMAGE_SCN_CNT_UNINITIALIZED_DATA != 0 {
            flags |= SectionFlags::UNINITIALIZED | SectionFlags::READ | SectionFlags::WRITE;
        }
        flags
    }
}

/// One data directory entry (RVA + size).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDirectory {
    /// RVA of the data
    pub virtual_address: u32,
    /// Size of the data
    pub size: u32,
}

impl DataDirectory {
    /// Whether this directory entry is present.
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 && self.size != 0
    }
}

/// A validated section table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section name (up to 8 bytes, NUL-trimmed)
    pub name: String,
    /// Virtual address (RVA)
    pub vaddr: u32,
    /// Size in memory
    pub vsize: u32,
    /// File offset of raw data
    pub raw_ptr: u32,
    /// Size of raw data in the file
    pub raw_size: u32,
    /// Condensed permissions
    pub flags: SectionFlags,
    /// Raw characteristics word
    pub characteristics: u32,
}

impl Section {
    /// Extent of the section in guest memory: `vaddr + max(vsize, raw_size)`.
    /// Saturates; the parser rejects sections whose extent overflows u32.
    pub fn virtual_end(&self) -> u32 {
        self.vaddr.saturating_add(self.vsize.max(self.raw_size))
    }

    /// Whether `rva` falls inside this section's virtual range.
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.vaddr && rva < self.virtual_end()
    }
}

/// How an import entry names its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportSymbol {
    /// Import by name (hint/name table entry)
    Name(String),
    /// Import by ordinal
    Ordinal(u16),
}

/// One imported symbol and the IAT slot it binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    /// Name or ordinal
    pub symbol: ImportSymbol,
    /// Export-table hint (0 for ordinal imports)
    pub hint: u16,
    /// RVA of the 32-bit IAT slot this entry binds
    pub iat_slot_rva: u32,
}

/// All imports declared against one DLL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedDll {
    /// DLL name as written in the image (case preserved)
    pub name: String,
    /// Entries in declaration order
    pub entries: Vec<ImportEntry>,
}

/// One base-relocation fixup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocEntry {
    /// `IMAGE_REL_BASED_*` kind (high 4 bits of the raw entry)
    pub kind: u16,
    /// Offset within the block's page (low 12 bits)
    pub offset: u16,
}

/// One base-relocation block covering a 4 KiB page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocBlock {
    /// RVA of the page the entries patch
    pub page_rva: u32,
    /// Entries in table order
    pub entries: Vec<RelocEntry>,
}

/// A fully validated PE32 image descriptor.
///
/// Produced by [`parse`] from a borrowed byte buffer; the buffer itself is
/// not retained. All RVAs herein have been bounds-checked against the
/// declared image size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeImage {
    /// Machine type (always I386 for accepted images)
    pub machine: u16,
    /// Subsystem (always console for accepted images)
    pub subsystem: u16,
    /// Whether the image is a DLL (parsed, but not runnable)
    pub is_dll: bool,
    /// Preferred load base from the optional header
    pub preferred_base: u32,
    /// Entry point RVA
    pub entry_rva: u32,
    /// Section alignment in memory
    pub section_alignment: u32,
    /// File alignment of raw data
    pub file_alignment: u32,
    /// Authoritative total virtual size
    pub size_of_image: u32,
    /// Bytes of headers mapped at RVA 0
    pub size_of_headers: u32,
    /// Whether relocations were stripped at link time
    pub relocs_stripped: bool,
    /// First 16 data directories
    pub data_directories: [DataDirectory; IMAGE_NUMBEROF_DIRECTORY_ENTRIES],
    /// Section table in file order
    pub sections: Vec<Section>,
    /// Import directory contents
    pub imports: Vec<ImportedDll>,
    /// Base relocation blocks
    pub relocations: Vec<RelocBlock>,
}

impl PeImage {
    /// Find the section containing `rva`, if any.
    pub fn section_for_rva(&self, rva: u32) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    /// Translate an RVA to a file offset through the section table.
    /// RVAs below `size_of_headers` map directly.
    pub fn rva_to_offset(&self, rva: u32) -> Option<u32> {
        for section in &self.sections {
            if section.contains_rva(rva) {
                let delta = rva - section.vaddr;
                if delta < section.raw_size {
                    return Some(section.raw_ptr + delta);
                }
                return None; // inside BSS tail
            }
        }
        if rva < self.size_of_headers {
            return Some(rva);
        }
        None
    }

    /// Total number of imported symbols across all DLLs.
    pub fn import_count(&self) -> usize {
        self.imports.iter().map(|d| d.entries.len()).sum()
    }
}
