//! PE32 image parser.
//!
//! Validates an untrusted byte buffer into a [`PeImage`]. The buffer is
//! only ever borrowed read-only; every header field, section range,
//! import string, and relocation block is bounds-checked before it lands
//! in the descriptor. Anything out of contract is a typed [`PeError`] and
//! aborts the load.

use super::*;
use alloc::format;
use alloc::string::ToString;
use thiserror::Error;

/// Longest accepted DLL or symbol name.
const MAX_NAME: usize = 256;

/// Upper bound on sections; matches what the on-disk format can sanely
/// carry for a console program.
const MAX_SECTIONS: usize = 96;

/// Typed parse failures. All abort the load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeError {
    #[error("not a PE executable")]
    NotPe,
    #[error("file truncated (need {need} bytes at offset {offset})")]
    Truncated { offset: usize, need: usize },
    #[error("unsupported machine type {0:#06x} (only i386)")]
    UnsupportedMachine(u16),
    #[error("PE32+ images are not supported")]
    UnsupportedPe32Plus,
    #[error("unsupported subsystem {0} (only console)")]
    UnsupportedSubsystem(u16),
    #[error("not an executable image")]
    NotExecutable,
    #[error("bad section table: {0}")]
    BadSection(alloc::string::String),
    #[error("bad import table: {0}")]
    BadImportTable(alloc::string::String),
    #[error("bad relocation data: {0}")]
    BadReloc(alloc::string::String),
}

fn read_u16(b: &[u8], off: usize) -> Result<u16, PeError> {
    let s = b
        .get(off..off + 2)
        .ok_or(PeError::Truncated { offset: off, need: 2 })?;
    Ok(u16::from_le_bytes([s[0], s[1]]))
}

fn read_u32(b: &[u8], off: usize) -> Result<u32, PeError> {
    let s = b
        .get(off..off + 4)
        .ok_or(PeError::Truncated { offset: off, need: 4 })?;
    Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

/// Read a bounded NUL-terminated string at a file offset.
fn read_cstr(b: &[u8], off: usize, what: &str) -> Result<String, PeError> {
    let tail = b.get(off..).ok_or(PeError::Truncated { offset: off, need: 1 })?;
    let end = tail
        .iter()
        .take(MAX_NAME)
        .position(|&c| c == 0)
        .ok_or_else(|| PeError::BadImportTable(format!("unterminated {what} string")))?;
    core::str::from_utf8(&tail[..end])
        .map(|s| s.to_string())
        .map_err(|_| PeError::BadImportTable(format!("non-ASCII {what} string")))
}

/// Parse and validate a PE32 console executable.
pub fn parse(bytes: &[u8]) -> Result<PeImage, PeError> {
    if bytes.len() < IMAGE_SIZEOF_DOS_HEADER {
        return Err(PeError::Truncated {
            offset: 0,
            need: IMAGE_SIZEOF_DOS_HEADER,
        });
    }
    if read_u16(bytes, 0)? != IMAGE_DOS_SIGNATURE {
        return Err(PeError::NotPe);
    }

    // e_lfanew sits at the end of the DOS header; the NT headers
    // (signature + COFF) must fit behind it.
    let pe_offset = read_u32(bytes, 0x3C)? as usize;
    if pe_offset + 4 + IMAGE_SIZEOF_FILE_HEADER > bytes.len() {
        return Err(PeError::Truncated {
            offset: pe_offset,
            need: 4 + IMAGE_SIZEOF_FILE_HEADER,
        });
    }
    if read_u32(bytes, pe_offset)? != IMAGE_NT_SIGNATURE {
        return Err(PeError::NotPe);
    }

    // COFF file header.
    let coff = pe_offset + 4;
    let machine = read_u16(bytes, coff)?;
    if machine != machine_type::IMAGE_FILE_MACHINE_I386 {
        return Err(PeError::UnsupportedMachine(machine));
    }
    let num_sections = read_u16(bytes, coff + 2)? as usize;
    let optional_header_size = read_u16(bytes, coff + 16)? as usize;
    let characteristics = read_u16(bytes, coff + 18)?;
    if characteristics & file_characteristics::IMAGE_FILE_EXECUTABLE_IMAGE == 0 {
        return Err(PeError::NotExecutable);
    }
    let is_dll = characteristics & file_characteristics::IMAGE_FILE_DLL != 0;
    let relocs_stripped = characteristics & file_characteristics::IMAGE_FILE_RELOCS_STRIPPED != 0;
    if num_sections == 0 || num_sections > MAX_SECTIONS {
        return Err(PeError::BadSection(format!("{num_sections} sections")));
    }

    // PE32 optional header.
    let opt = coff + IMAGE_SIZEOF_FILE_HEADER;
    let magic = read_u16(bytes, opt)?;
    match magic {
        IMAGE_NT_OPTIONAL_HDR32_MAGIC => {}
        IMAGE_NT_OPTIONAL_HDR64_MAGIC => return Err(PeError::UnsupportedPe32Plus),
        _ => return Err(PeError::NotPe),
    }

    let entry_rva = read_u32(bytes, opt + 16)?;
    let preferred_base = read_u32(bytes, opt + 28)?;
    let section_alignment = read_u32(bytes, opt + 32)?.max(1);
    let file_alignment = read_u32(bytes, opt + 36)?.max(1);
    let size_of_image = read_u32(bytes, opt + 56)?;
    let size_of_headers = read_u32(bytes, opt + 60)?;
    let subsystem_val = read_u16(bytes, opt + 68)?;
    let num_data_dirs = read_u32(bytes, opt + 92)? as usize;

    if subsystem_val != subsystem::IMAGE_SUBSYSTEM_WINDOWS_CUI {
        return Err(PeError::UnsupportedSubsystem(subsystem_val));
    }

    let mut data_directories = [DataDirectory::default(); IMAGE_NUMBEROF_DIRECTORY_ENTRIES];
    for (i, dir) in data_directories
        .iter_mut()
        .enumerate()
        .take(num_data_dirs.min(IMAGE_NUMBEROF_DIRECTORY_ENTRIES))
    {
        let at = opt + 96 + i * 8;
        dir.virtual_address = read_u32(bytes, at)?;
        dir.size = read_u32(bytes, at + 4)?;
    }

    // Section table, immediately after the optional header.
    let section_table = opt + optional_header_size;
    let mut sections = Vec::with_capacity(num_sections);
    for i in 0..num_sections {
        let at = section_table + i * IMAGE_SIZEOF_SECTION_HEADER;
        let name_bytes = bytes
            .get(at..at + IMAGE_SIZEOF_SHORT_NAME)
            .ok_or(PeError::Truncated {
                offset: at,
                need: IMAGE_SIZEOF_SECTION_HEADER,
            })?;
        let name_len = name_bytes
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(IMAGE_SIZEOF_SHORT_NAME);
        let name = core::str::from_utf8(&name_bytes[..name_len])
            .unwrap_or("")
            .to_string();

        let vsize = read_u32(bytes, at + 8)?;
        let vaddr = read_u32(bytes, at + 12)?;
        let raw_size = read_u32(bytes, at + 16)?;
        let raw_ptr = read_u32(bytes, at + 20)?;
        let characteristics = read_u32(bytes, at + 36)?;

        if raw_size > 0 {
            let raw_end = raw_ptr
                .checked_add(raw_size)
                .ok_or_else(|| PeError::BadSection(format!("{name}: raw range overflows")))?;
            if raw_end as usize > bytes.len() {
                return Err(PeError::BadSection(format!(
                    "{name}: raw data {raw_ptr:#x}+{raw_size:#x} beyond end of file"
                )));
            }
        }
        if vaddr.checked_add(vsize.max(raw_size)).is_none() {
            return Err(PeError::BadSection(format!(
                "{name}: virtual range {vaddr:#x}+{:#x} overflows",
                vsize.max(raw_size)
            )));
        }

        let section = Section {
            name,
            vaddr,
            vsize,
            raw_ptr,
            raw_size,
            flags: SectionFlags::from_characteristics(characteristics),
            characteristics,
        };
        if section.virtual_end() > size_of_image {
            return Err(PeError::BadSection(format!(
                "{}: extends to {:#x}, image declares {size_of_image:#x}",
                section.name,
                section.virtual_end()
            )));
        }
        sections.push(section);
    }

    // Virtual ranges must not overlap.
    for (i, a) in sections.iter().enumerate() {
        for b in sections.iter().skip(i + 1) {
            if a.vaddr < b.virtual_end() && b.vaddr < a.virtual_end() {
                return Err(PeError::BadSection(format!(
                    "{} and {} overlap",
                    a.name, b.name
                )));
            }
        }
    }

    let mut image = PeImage {
        machine,
        subsystem: subsystem_val,
        is_dll,
        preferred_base,
        entry_rva,
        section_alignment,
        file_alignment,
        size_of_image,
        size_of_headers,
        relocs_stripped,
        data_directories,
        sections,
        imports: Vec::new(),
        relocations: Vec::new(),
    };

    parse_imports(bytes, &mut image)?;
    parse_relocations(bytes, &mut image)?;

    log::debug!(
        "parsed PE32: base={:#010x} entry=+{:#x} {} sections, {} imports, {} reloc blocks",
        image.preferred_base,
        image.entry_rva,
        image.sections.len(),
        image.import_count(),
        image.relocations.len()
    );

    Ok(image)
}

/// Walk the import directory: a NUL-terminated array of descriptors, each
/// naming a DLL and pointing at parallel lookup/address tables.
fn parse_imports(bytes: &[u8], image: &mut PeImage) -> Result<(), PeError> {
    let dir = image.data_directories[directory_entry::IMAGE_DIRECTORY_ENTRY_IMPORT];
    if !dir.is_present() {
        return Ok(());
    }

    let mut desc_rva = dir.virtual_address;
    loop {
        let off = image
            .rva_to_offset(desc_rva)
            .ok_or_else(|| PeError::BadImportTable(format!("descriptor RVA {desc_rva:#x} unmapped")))?
            as usize;

        let lookup_rva = read_u32(bytes, off)?;
        let name_rva = read_u32(bytes, off + 12)?;
        let iat_rva = read_u32(bytes, off + 16)?;
        if name_rva == 0 {
            break; // null terminator
        }

        let name_off = image
            .rva_to_offset(name_rva)
            .ok_or_else(|| PeError::BadImportTable(format!("DLL name RVA {name_rva:#x} unmapped")))?;
        let dll_name = read_cstr(bytes, name_off as usize, "DLL name")?;

        // Prefer the lookup table; fall back to the IAT when the linker
        // omitted it, as the original loader does.
        let table_rva = if lookup_rva != 0 { lookup_rva } else { iat_rva };
        if table_rva == 0 || iat_rva == 0 {
            return Err(PeError::BadImportTable(format!("{dll_name}: no thunk table")));
        }

        let mut entries = Vec::new();
        let mut index = 0u32;
        loop {
            let thunk_rva = table_rva + index * 4;
            let thunk_off = image.rva_to_offset(thunk_rva).ok_or_else(|| {
                PeError::BadImportTable(format!("{dll_name}: thunk RVA {thunk_rva:#x} unmapped"))
            })?;
            let thunk = read_u32(bytes, thunk_off as usize)?;
            if thunk == 0 {
                break;
            }

            let iat_slot_rva = iat_rva + index * 4;
            if image.section_for_rva(iat_slot_rva).is_none() {
                return Err(PeError::BadImportTable(format!(
                    "{dll_name}: IAT slot RVA {iat_slot_rva:#x} unmapped"
                )));
            }

            let entry = if thunk & IMAGE_ORDINAL_FLAG32 != 0 {
                ImportEntry {
                    symbol: ImportSymbol::Ordinal((thunk & 0xFFFF) as u16),
                    hint: 0,
                    iat_slot_rva,
                }
            } else {
                // Hint/name entry: u16 hint then the NUL-terminated name.
                let hn_off = image.rva_to_offset(thunk).ok_or_else(|| {
                    PeError::BadImportTable(format!("{dll_name}: name RVA {thunk:#x} unmapped"))
                })? as usize;
                let hint = read_u16(bytes, hn_off)?;
                let sym = read_cstr(bytes, hn_off + 2, "import name")?;
                ImportEntry {
                    symbol: ImportSymbol::Name(sym),
                    hint,
                    iat_slot_rva,
                }
            };
            entries.push(entry);
            index += 1;
        }

        log::trace!("import DLL {dll_name}: {} symbols", entries.len());
        image.imports.push(ImportedDll {
            name: dll_name,
            entries,
        });
        desc_rva += IMAGE_SIZEOF_IMPORT_DESCRIPTOR as u32;
    }

    Ok(())
}

/// Walk the base-relocation chain: blocks of `(page_rva, block_size)`
/// headers followed by packed 16-bit `kind:4 | offset:12` entries.
fn parse_relocations(bytes: &[u8], image: &mut PeImage) -> Result<(), PeError> {
    let dir = image.data_directories[directory_entry::IMAGE_DIRECTORY_ENTRY_BASERELOC];
    if !dir.is_present() {
        return Ok(());
    }

    let mut walked = 0u32;
    while walked < dir.size {
        let block_rva = dir.virtual_address + walked;
        let off = image
            .rva_to_offset(block_rva)
            .ok_or_else(|| PeError::BadReloc(format!("block RVA {block_rva:#x} unmapped")))?
            as usize;

        let page_rva = read_u32(bytes, off)?;
        let block_size = read_u32(bytes, off + 4)?;
        if page_rva == 0 && block_size == 0 {
            break;
        }
        if block_size < 8 || block_size % 2 != 0 {
            return Err(PeError::BadReloc(format!("block size {block_size}")));
        }
        if walked + block_size > dir.size {
            return Err(PeError::BadReloc(format!(
                "block at +{walked:#x} overruns directory"
            )));
        }

        let count = ((block_size - 8) / 2) as usize;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let raw = read_u16(bytes, off + 8 + i * 2)?;
            entries.push(RelocEntry {
                kind: raw >> 12,
                offset: raw & 0x0FFF,
            });
        }
        image.relocations.push(RelocBlock { page_rva, entries });
        walked += block_size;
    }

    Ok(())
}
