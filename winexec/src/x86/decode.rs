//! Instruction stream decoding helpers.
//!
//! Prefix scanning, ModR/M + SIB effective-address computation, and the
//! condition-code table shared by Jcc/SETcc/CMOVcc. The executor owns the
//! fetch cursor; these helpers only consume bytes it hands them.

use super::mem::{AddressSpace, MemFault};
use super::{Cpu, EFlags, Reg, Width};

/// Decoded legacy prefixes. Segment overrides are accepted and ignored
/// (flat address space); only the ones that change meaning are kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prefixes {
    /// 0x66: operand size 16
    pub opsize: bool,
    /// 0x67: address size 16 (accepted, treated as 32)
    pub adsize: bool,
    /// 0xF3: REP / REPE
    pub rep: bool,
    /// 0xF2: REPNE
    pub repne: bool,
}

impl Prefixes {
    /// Whether `byte` is a legacy prefix; updates `self` when it is.
    pub fn consume(&mut self, byte: u8) -> bool {
        match byte {
            0x66 => self.opsize = true,
            0x67 => self.adsize = true,
            0xF3 => self.rep = true,
            0xF2 => self.repne = true,
            // Segment overrides: no-ops on a flat space.
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 => {}
            _ => return false,
        }
        true
    }

    /// Operand width for a non-byte opcode.
    pub fn operand_width(&self) -> Width {
        if self.opsize {
            Width::W16
        } else {
            Width::W32
        }
    }
}

/// Where a decoded r/m operand lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmOperand {
    /// A register, by 3-bit index (width decides the view).
    Reg(u8),
    /// A guest memory address.
    Mem(u32),
}

/// A decoded ModR/M byte plus its effective address.
#[derive(Debug, Clone, Copy)]
pub struct ModRm {
    /// The `reg` field (register index or opcode extension).
    pub reg: u8,
    /// The r/m operand.
    pub rm: RmOperand,
    /// Total bytes consumed including the ModR/M byte itself.
    pub len: u32,
}

/// Decode the ModR/M byte at `addr` and compute the effective address.
///
/// 32-bit addressing forms only: mod 00/01/10 with SIB and disp32
/// variants, mod 11 register direct.
pub fn decode_modrm(cpu: &Cpu, mem: &AddressSpace, addr: u32) -> Result<ModRm, MemFault> {
    let modrm = mem.read8(addr)?;
    let mode = modrm >> 6;
    let reg = (modrm >> 3) & 7;
    let rm = modrm & 7;
    let mut len = 1u32;

    if mode == 3 {
        return Ok(ModRm {
            reg,
            rm: RmOperand::Reg(rm),
            len,
        });
    }

    let mut base = 0u32;
    if rm == 4 {
        // SIB byte follows.
        let sib = mem.read8(addr + len)?;
        len += 1;
        let scale = sib >> 6;
        let index = (sib >> 3) & 7;
        let sib_base = sib & 7;

        if index != 4 {
            base = base.wrapping_add(cpu.gpr[index as usize] << scale);
        }
        if sib_base == 5 && mode == 0 {
            let disp = mem.read32(addr + len)?;
            len += 4;
            base = base.wrapping_add(disp);
        } else {
            base = base.wrapping_add(cpu.gpr[sib_base as usize]);
        }
    } else if rm == 5 && mode == 0 {
        // disp32, no base.
        base = mem.read32(addr + len)?;
        len += 4;
    } else {
        base = cpu.gpr[rm as usize];
    }

    match mode {
        1 => {
            let disp = mem.read8(addr + len)? as i8 as i32 as u32;
            len += 1;
            base = base.wrapping_add(disp);
        }
        2 => {
            let disp = mem.read32(addr + len)?;
            len += 4;
            base = base.wrapping_add(disp);
        }
        _ => {}
    }

    Ok(ModRm {
        reg,
        rm: RmOperand::Mem(base),
        len,
    })
}

/// Evaluate condition code `cc` (low nibble of Jcc/SETcc/CMOVcc opcodes).
pub fn condition(cc: u8, flags: EFlags) -> bool {
    let cf = flags.contains(EFlags::CF);
    let zf = flags.contains(EFlags::ZF);
    let sf = flags.contains(EFlags::SF);
    let of = flags.contains(EFlags::OF);
    let pf = flags.contains(EFlags::PF);
    match cc & 0x0F {
        0x0 => of,             // O
        0x1 => !of,            // NO
        0x2 => cf,             // B / C / NAE
        0x3 => !cf,            // AE / NB / NC
        0x4 => zf,             // E / Z
        0x5 => !zf,            // NE / NZ
        0x6 => cf || zf,       // BE / NA
        0x7 => !cf && !zf,     // A / NBE
        0x8 => sf,             // S
        0x9 => !sf,            // NS
        0xA => pf,             // P / PE
        0xB => !pf,            // NP / PO
        0xC => sf != of,       // L / NGE
        0xD => sf == of,       // GE / NL
        0xE => zf || sf != of, // LE / NG
        _ => !zf && sf == of,  // G / NLE
    }
}

/// Register view for diagnostics: the dump printed on a fault.
pub fn dump_registers(cpu: &Cpu) -> alloc::string::String {
    use alloc::format;
    format!(
        "EAX={:08X} EBX={:08X} ECX={:08X} EDX={:08X}\n\
         ESI={:08X} EDI={:08X} EBP={:08X} ESP={:08X}\n\
         EIP={:08X} EFL={:08X}",
        cpu.reg(Reg::Eax),
        cpu.reg(Reg::Ebx),
        cpu.reg(Reg::Ecx),
        cpu.reg(Reg::Edx),
        cpu.reg(Reg::Esi),
        cpu.reg(Reg::Edi),
        cpu.reg(Reg::Ebp),
        cpu.reg(Reg::Esp),
        cpu.eip,
        cpu.flags.to_pushed(),
    )
}
