//! Image Loader
//!
//! Turns a parsed [`PeImage`] plus the original file bytes into a mapped
//! guest image: headers and sections copied to their virtual addresses,
//! base relocations applied when the image is placed away from its
//! preferred base, and every IAT slot rebound to a thunk token in the
//! reserved band above [`THUNK_BASE`].
//!
//! The mapping is a flat `Vec<u8>` of `size_of_image` bytes; the guest
//! address space module overlays it at the chosen base.

use crate::pe::{directory_entry, relocation_type, ImportSymbol, PeImage};
use crate::{THUNK_BASE, TERMINATE_TOKEN};
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use thiserror::Error;

/// Mapping and fixup failures. All abort the load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("cannot run a DLL image")]
    IsDll,
    #[error("image too large ({0} bytes)")]
    ImageTooLarge(u32),
    #[error("image at {base:#010x} needs relocation but relocations are stripped")]
    CannotRebase { base: u32 },
    #[error("relocation patches outside the image: RVA {rva:#x}")]
    RelocOutOfRange { rva: u32 },
    #[error("unsupported relocation kind {kind} at RVA {rva:#x}")]
    UnsupportedReloc { kind: u16, rva: u32 },
    #[error("too many imports ({0})")]
    TooManyImports(usize),
    #[error("import table error: {0}")]
    BadImport(String),
}

/// Largest image we will map (64 MiB).
const MAX_IMAGE_SIZE: u32 = 64 * 1024 * 1024;

/// One bound import, indexed by thunk token.
///
/// Token `THUNK_BASE + 4*i` dispatches `bindings[i]`. Whether a shim backs
/// the binding is decided later, at call time, so images that import a
/// symbol they never call still run.
#[derive(Debug, Clone)]
pub struct ImportBinding {
    /// DLL name as declared in the image.
    pub dll: String,
    /// Symbol name or ordinal.
    pub symbol: ImportSymbol,
}

impl ImportBinding {
    /// Human-readable `dll!symbol` form for diagnostics.
    pub fn display(&self) -> String {
        match &self.symbol {
            ImportSymbol::Name(n) => format!("{}!{}", self.dll, n),
            ImportSymbol::Ordinal(o) => format!("{}!#{}", self.dll, o),
        }
    }
}

/// A PE image mapped into guest memory.
#[derive(Debug)]
pub struct GuestImage {
    /// Guest address the image is mapped at.
    pub base: u32,
    /// The mapped bytes (`size_of_image` long, zero-filled gaps).
    pub memory: Vec<u8>,
    /// Absolute guest address of the entry point.
    pub entry: u32,
    /// Thunk bindings in token order.
    pub bindings: Vec<ImportBinding>,
}

impl GuestImage {
    /// One past the last mapped guest address.
    pub fn end(&self) -> u32 {
        self.base + self.memory.len() as u32
    }

    /// Whether `addr` falls inside the mapped image.
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// Map, relocate, and bind an image at `base`.
///
/// `bytes` must be the same buffer the descriptor was parsed from.
pub fn load(pe: &PeImage, bytes: &[u8], base: u32) -> Result<GuestImage, LoadError> {
    if pe.is_dll {
        return Err(LoadError::IsDll);
    }
    if pe.size_of_image == 0 || pe.size_of_image > MAX_IMAGE_SIZE {
        return Err(LoadError::ImageTooLarge(pe.size_of_image));
    }

    let mut memory = vec![0u8; pe.size_of_image as usize];

    // Headers map at RVA 0 so IAT slots inside the header region stay
    // reachable.
    let hdr_len = (pe.size_of_headers as usize).min(bytes.len()).min(memory.len());
    memory[..hdr_len].copy_from_slice(&bytes[..hdr_len]);

    // Copy each section's raw data; the virtual tail past raw_size stays
    // zeroed (BSS).
    for section in &pe.sections {
        let copy = section.raw_size as usize;
        if copy == 0 {
            continue;
        }
        let src = section.raw_ptr as usize;
        let dst = section.vaddr as usize;
        // Parser already validated both ranges.
        memory[dst..dst + copy].copy_from_slice(&bytes[src..src + copy]);
    }

    if base != pe.preferred_base {
        relocate(pe, &mut memory, base)?;
    }

    let bindings = bind_imports(pe, &mut memory)?;

    log::info!(
        "mapped {} KiB at {:#010x}, entry {:#010x}, {} import thunks",
        pe.size_of_image / 1024,
        base,
        base.wrapping_add(pe.entry_rva),
        bindings.len()
    );

    Ok(GuestImage {
        base,
        memory,
        entry: base.wrapping_add(pe.entry_rva),
        bindings,
    })
}

/// Apply HIGHLOW base relocations for a non-preferred load address.
fn relocate(pe: &PeImage, memory: &mut [u8], base: u32) -> Result<(), LoadError> {
    let dir = pe.data_directories[directory_entry::IMAGE_DIRECTORY_ENTRY_BASERELOC];
    if pe.relocs_stripped || (!dir.is_present() && !pe.relocations.is_empty()) {
        return Err(LoadError::CannotRebase { base });
    }
    if !dir.is_present() {
        // No relocation data at all: only runnable at the preferred base.
        return Err(LoadError::CannotRebase { base });
    }

    let delta = base.wrapping_sub(pe.preferred_base);
    let mut patched = 0usize;

    for block in &pe.relocations {
        for entry in &block.entries {
            if entry.kind == relocation_type::IMAGE_REL_BASED_ABSOLUTE {
                continue;
            }
            let rva = block
                .page_rva
                .checked_add(entry.offset as u32)
                .ok_or(LoadError::RelocOutOfRange { rva: block.page_rva })?;
            if entry.kind != relocation_type::IMAGE_REL_BASED_HIGHLOW {
                return Err(LoadError::UnsupportedReloc {
                    kind: entry.kind,
                    rva,
                });
            }
            let at = rva as usize;
            let slot = memory
                .get(at..at + 4)
                .ok_or(LoadError::RelocOutOfRange { rva })?;
            let value = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
            let patched_value = value.wrapping_add(delta);
            memory[at..at + 4].copy_from_slice(&patched_value.to_le_bytes());
            patched += 1;
        }
    }

    log::debug!("rebased by {delta:#x}: {patched} fixups");
    Ok(())
}

/// Rewrite every IAT slot to a thunk token and collect the bindings.
fn bind_imports(pe: &PeImage, memory: &mut [u8]) -> Result<Vec<ImportBinding>, LoadError> {
    let mut bindings = Vec::with_capacity(pe.import_count());

    for dll in &pe.imports {
        for entry in &dll.entries {
            let token_index = bindings.len() as u32;
            let token = THUNK_BASE + token_index * 4;
            if token >= TERMINATE_TOKEN {
                return Err(LoadError::TooManyImports(bindings.len()));
            }

            let at = entry.iat_slot_rva as usize;
            let slot = memory.get_mut(at..at + 4).ok_or_else(|| {
                LoadError::BadImport(format!(
                    "{}: IAT slot RVA {:#x} outside image",
                    dll.name, entry.iat_slot_rva
                ))
            })?;
            slot.copy_from_slice(&token.to_le_bytes());

            bindings.push(ImportBinding {
                dll: dll.name.clone(),
                symbol: entry.symbol.clone(),
            });
        }
    }

    Ok(bindings)
}

/// Map the distance from [`THUNK_BASE`] back to a binding index, if the
/// address lies in the thunk band and is token-aligned.
pub fn token_index(addr: u32) -> Option<usize> {
    if addr >= THUNK_BASE && addr < TERMINATE_TOKEN && addr % 4 == 0 {
        Some(((addr - THUNK_BASE) / 4) as usize)
    } else {
        None
    }
}
