//! Win32 API Shims
//!
//! Host-side implementations of the imports console programs actually
//! use. Each entry names its DLL family, export name, and calling
//! convention; the interpreter dispatches to a handler when the guest
//! calls through a bound thunk token. Stdcall entries carry their
//! argument count so the dispatcher can apply callee cleanup.
//!
//! Lookup is by (lower-cased DLL family, export name). Versioned CRT
//! DLLs (`msvcr71.dll`, `ucrtbase.dll`, `crtdll.dll`) all route to the
//! msvcrt table, matching how linkers vary the name across toolchains.

pub mod kernel32;
pub mod msvcrt;
pub mod user32;

use crate::host::HostEnv;
use crate::pe::ImportSymbol;
use crate::x86::exec::ProcessState;
use crate::x86::mem::MemFault;
use crate::x86::{AddressSpace, Cpu, Fault, Reg};
use alloc::string::String;
use alloc::vec::Vec;
use spin::Once;

/// Calling convention of a shimmed export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    /// Caller cleans the stack (CRT functions, varargs).
    Cdecl,
    /// Callee cleans `4 * n` argument bytes (Win32 API).
    Stdcall(u8),
}

/// Handler signature: full access to the guest, errors become faults.
pub type ShimFn = fn(&mut ShimContext<'_>) -> Result<(), Fault>;

/// One shimmed export.
pub struct ShimEntry {
    /// DLL family key ("kernel32", "user32", "msvcrt").
    pub dll: &'static str,
    /// Export name as it appears in import tables.
    pub name: &'static str,
    pub conv: CallConv,
    pub handler: ShimFn,
}

/// The guest state a shim may touch, split-borrowed from the machine.
pub struct ShimContext<'a> {
    pub cpu: &'a mut Cpu,
    pub mem: &'a mut AddressSpace,
    pub proc: &'a mut ProcessState,
    pub host: &'a mut dyn HostEnv,
}

impl ShimContext<'_> {
    fn fault(&self, e: MemFault) -> Fault {
        Fault::Memory {
            addr: e.addr,
            eip: self.cpu.eip,
        }
    }

    /// Argument `i` (0-based). The return address sits at `[ESP]`, so
    /// arguments start at `[ESP+4]`.
    pub fn arg(&self, i: u32) -> Result<u32, Fault> {
        let addr = self.cpu.esp().wrapping_add(4 + 4 * i);
        self.mem.read32(addr).map_err(|e| self.fault(e))
    }

    /// Set the EAX return value.
    pub fn ret(&mut self, value: u32) {
        self.cpu.set_reg(Reg::Eax, value);
    }

    /// Write a 32-bit out-parameter, ignoring a NULL pointer.
    pub fn out32(&mut self, addr: u32, value: u32) -> Result<(), Fault> {
        if addr == 0 {
            return Ok(());
        }
        let r = self.mem.write32(addr, value);
        r.map_err(|e| Fault::Memory {
            addr: e.addr,
            eip: self.cpu.eip,
        })
    }

    pub fn read_bytes(&self, addr: u32, len: u32) -> Result<Vec<u8>, Fault> {
        self.mem.read_block(addr, len).map_err(|e| self.fault(e))
    }

    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), Fault> {
        let r = self.mem.write_block(addr, bytes);
        r.map_err(|e| Fault::Memory {
            addr: e.addr,
            eip: self.cpu.eip,
        })
    }

    /// Bounded NUL-terminated string read (diagnostics and CRT shims).
    pub fn read_cstr(&self, addr: u32) -> Result<String, Fault> {
        self.mem.read_cstr(addr, 0x10000).map_err(|e| self.fault(e))
    }
}

static REGISTRY: Once<Vec<&'static ShimEntry>> = Once::new();

fn registry() -> &'static [&'static ShimEntry] {
    REGISTRY.call_once(|| {
        let mut all: Vec<&'static ShimEntry> = Vec::new();
        all.extend(kernel32::EXPORTS.iter());
        all.extend(user32::EXPORTS.iter());
        all.extend(msvcrt::EXPORTS.iter());
        all
    })
}

/// Map an imported DLL name to a shim family key.
fn dll_family(dll: &str) -> Option<&'static str> {
    let mut lower = [0u8; 64];
    let bytes = dll.as_bytes();
    if bytes.len() > lower.len() {
        return None;
    }
    for (d, s) in lower.iter_mut().zip(bytes) {
        *d = s.to_ascii_lowercase();
    }
    let lower = core::str::from_utf8(&lower[..bytes.len()]).ok()?;
    if lower.contains("kernel32") {
        Some("kernel32")
    } else if lower.contains("user32") {
        Some("user32")
    } else if lower.contains("msvcr") || lower.contains("crtdll") || lower.contains("ucrtbase") {
        Some("msvcrt")
    } else {
        None
    }
}

/// Resolve an import to its shim, if one exists.
///
/// Ordinal imports are never resolved; like any unknown symbol they stay
/// bound to a missing-symbol thunk that only faults when called.
pub fn resolve(dll: &str, symbol: &ImportSymbol) -> Option<&'static ShimEntry> {
    let family = dll_family(dll)?;
    let name = match symbol {
        ImportSymbol::Name(n) => n.as_str(),
        ImportSymbol::Ordinal(_) => return None,
    };
    registry()
        .iter()
        .find(|e| e.dll == family && e.name == name)
        .copied()
}
