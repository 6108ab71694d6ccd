//! Instruction interpreter.
//!
//! A straight fetch/decode/execute loop over the user-mode i386 subset
//! 32-bit compilers emit for console programs: the ALU families, MOV
//! forms, stack ops, control flow, shifts/rotates, multiply/divide,
//! string instructions with REP, and the common two-byte (0F) opcodes.
//! No FPU, no MMX/SSE, no segmentation, no privileged instructions;
//! anything outside the subset raises [`Fault::UnsupportedOpcode`].
//!
//! Control transfers into the reserved thunk band dispatch Win32 shims;
//! a RET to the terminate token ends the session with EAX as the exit
//! code.

use super::decode::{condition, decode_modrm, ModRm, Prefixes, RmOperand};
use super::flags;
use super::mem::{AddressSpace, HeapTable, MemFault};
use super::{Cpu, EFlags, Reg, Width};
use crate::host::HostEnv;
use crate::ldr::{token_index, ImportBinding};
use crate::winapi::{CallConv, ShimContext, ShimEntry};
use crate::TERMINATE_TOKEN;
use alloc::string::String;
use super::Reg::{Eax, Ebp, Ecx, Edi, Edx, Esi};
use alloc::vec::Vec;
use thiserror::Error;

/// Default ceiling on executed instructions (runaway-guest guard).
pub const DEFAULT_INSN_BUDGET: u64 = 100_000_000;

/// Instructions between cooperative yield points.
const YIELD_INTERVAL: u64 = 4096;

/// Reasons a guest stops abnormally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("unsupported opcode {opcode:#04x}{ext} at {eip:#010x}", ext = DisplayExt(*ext))]
    UnsupportedOpcode {
        eip: u32,
        opcode: u8,
        ext: Option<u8>,
    },
    #[error("memory access violation at {addr:#010x} (EIP {eip:#010x})")]
    Memory { addr: u32, eip: u32 },
    #[error("integer divide fault at {eip:#010x}")]
    DivideByZero { eip: u32 },
    #[error("call to unresolved import {symbol}")]
    MissingShim { symbol: String },
    #[error("instruction budget exhausted after {executed} instructions")]
    InstructionBudget { executed: u64 },
    #[error("cancelled by host")]
    Cancelled,
}

struct DisplayExt(Option<u8>);

impl core::fmt::Display for DisplayExt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.0 {
            Some(ext) => write!(f, " /{ext}"),
            None => Ok(()),
        }
    }
}

impl Fault {
    /// Shell-style exit status for the stopping reason.
    pub fn exit_code(&self) -> i32 {
        match self {
            Fault::UnsupportedOpcode { .. } => crate::EXIT_BAD_OPCODE,
            Fault::Memory { .. } => crate::EXIT_SEGV,
            Fault::DivideByZero { .. } => crate::EXIT_DIVIDE,
            Fault::MissingShim { .. } => crate::EXIT_MISSING_SHIM,
            Fault::InstructionBudget { .. } => crate::EXIT_CANCELLED,
            Fault::Cancelled => crate::EXIT_CANCELLED,
        }
    }
}

/// How a guest finished normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Entry function returned; value is EAX.
    Returned(u32),
    /// The guest called `ExitProcess`/`exit`; value is the argument.
    Exited(u32),
}

/// Per-process emulated state shared between the interpreter and shims.
pub struct ProcessState {
    /// `GetLastError` / `SetLastError` value.
    pub last_error: u32,
    /// The heap band allocator.
    pub heap: HeapTable,
    /// Guest address of the command-line string (`GetCommandLineA`).
    pub cmdline: u32,
    /// Argument count for the CRT.
    pub argc: u32,
    /// Guest address of the argv array.
    pub argv: u32,
    /// Guest slots the CRT accessors (`__p___argc` etc.) point at.
    pub argc_slot: u32,
    pub argv_slot: u32,
    pub env_slot: u32,
    /// Set by `ExitProcess`/`exit`; ends the run loop.
    pub exit: Option<u32>,
}

impl ProcessState {
    pub fn new() -> Self {
        ProcessState {
            last_error: 0,
            heap: HeapTable::new(),
            cmdline: 0,
            argc: 0,
            argv: 0,
            argc_slot: 0,
            argv_slot: 0,
            env_slot: 0,
            exit: None,
        }
    }
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::new()
    }
}

/// A loaded guest plus everything needed to run it.
pub struct Machine<'h> {
    pub cpu: Cpu,
    pub mem: AddressSpace,
    pub proc: ProcessState,
    pub host: &'h mut dyn HostEnv,
    /// Import bindings in thunk-token order.
    pub bindings: Vec<ImportBinding>,
    /// Shim resolved for each binding; `None` faults only when called.
    pub shims: Vec<Option<&'static ShimEntry>>,
    pub insn_count: u64,
    pub insn_budget: u64,
}

impl<'h> Machine<'h> {
    pub fn new(image_base: u32, image: Vec<u8>, host: &'h mut dyn HostEnv) -> Self {
        let mem = AddressSpace::new(image_base, image);
        let mut cpu = Cpu::new();
        cpu.set_esp(mem.stack_top() - 16);
        Machine {
            cpu,
            mem,
            proc: ProcessState::new(),
            host,
            bindings: Vec::new(),
            shims: Vec::new(),
            insn_count: 0,
            insn_budget: DEFAULT_INSN_BUDGET,
        }
    }

    // ==================== run loop ====================

    /// Execute until the guest finishes or faults.
    pub fn run(&mut self) -> Result<RunExit, Fault> {
        loop {
            if let Some(code) = self.proc.exit.take() {
                return Ok(RunExit::Exited(code));
            }
            let eip = self.cpu.eip;
            if eip == TERMINATE_TOKEN {
                return Ok(RunExit::Returned(self.cpu.reg(Eax)));
            }
            if let Some(index) = token_index(eip) {
                self.dispatch_thunk(index)?;
                continue;
            }
            if self.insn_count % YIELD_INTERVAL == 0 {
                self.host.yield_now();
                if self.host.cancel_requested() {
                    return Err(Fault::Cancelled);
                }
            }
            if self.insn_count >= self.insn_budget {
                return Err(Fault::InstructionBudget {
                    executed: self.insn_count,
                });
            }
            self.insn_count += 1;
            self.step()?;
        }
    }

    /// Call the shim behind thunk token `index`.
    ///
    /// The guest arrived here by CALL or JMP through an IAT slot, so the
    /// return address sits at `[ESP]` and stdcall arguments above it.
    /// Afterwards the return address is popped into EIP and, for
    /// stdcall, the callee's arguments are cleaned off the stack.
    fn dispatch_thunk(&mut self, index: usize) -> Result<(), Fault> {
        let Some(entry) = self.shims.get(index).copied().flatten() else {
            let symbol = self
                .bindings
                .get(index)
                .map(|b| b.display())
                .unwrap_or_else(|| String::from("?"));
            return Err(Fault::MissingShim { symbol });
        };
        log::trace!("shim {}!{}", entry.dll, entry.name);
        let mut ctx = ShimContext {
            cpu: &mut self.cpu,
            mem: &mut self.mem,
            proc: &mut self.proc,
            host: &mut *self.host,
        };
        (entry.handler)(&mut ctx)?;
        let ret = self.pop()?;
        if let CallConv::Stdcall(args) = entry.conv {
            self.cpu
                .set_esp(self.cpu.esp().wrapping_add(4 * args as u32));
        }
        self.cpu.eip = ret;
        Ok(())
    }

    // ==================== memory helpers ====================

    fn fault(&self, e: MemFault) -> Fault {
        Fault::Memory {
            addr: e.addr,
            eip: self.cpu.eip,
        }
    }

    fn load(&self, addr: u32, w: Width) -> Result<u32, Fault> {
        let r = match w {
            Width::W8 => self.mem.read8(addr).map(u32::from),
            Width::W16 => self.mem.read16(addr).map(u32::from),
            Width::W32 => self.mem.read32(addr),
        };
        r.map_err(|e| self.fault(e))
    }

    fn store(&mut self, addr: u32, w: Width, value: u32) -> Result<(), Fault> {
        let r = match w {
            Width::W8 => self.mem.write8(addr, value as u8),
            Width::W16 => self.mem.write16(addr, value as u16),
            Width::W32 => self.mem.write32(addr, value),
        };
        r.map_err(|e| Fault::Memory {
            addr: e.addr,
            eip: self.cpu.eip,
        })
    }

    fn code8(&self, at: u32) -> Result<u8, Fault> {
        self.mem.read8(at).map_err(|e| self.fault(e))
    }

    fn code16(&self, at: u32) -> Result<u16, Fault> {
        self.mem.read16(at).map_err(|e| self.fault(e))
    }

    fn code32(&self, at: u32) -> Result<u32, Fault> {
        self.mem.read32(at).map_err(|e| self.fault(e))
    }

    fn rm_read(&self, d: &ModRm, w: Width) -> Result<u32, Fault> {
        match d.rm {
            RmOperand::Reg(r) => Ok(self.cpu.reg_w(r, w)),
            RmOperand::Mem(addr) => self.load(addr, w),
        }
    }

    fn rm_write(&mut self, d: &ModRm, w: Width, value: u32) -> Result<(), Fault> {
        match d.rm {
            RmOperand::Reg(r) => {
                self.cpu.set_reg_w(r, w, value);
                Ok(())
            }
            RmOperand::Mem(addr) => self.store(addr, w, value),
        }
    }

    pub fn push(&mut self, value: u32) -> Result<(), Fault> {
        let esp = self.cpu.esp().wrapping_sub(4);
        self.store(esp, Width::W32, value)?;
        self.cpu.set_esp(esp);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<u32, Fault> {
        let esp = self.cpu.esp();
        let value = self.load(esp, Width::W32)?;
        self.cpu.set_esp(esp.wrapping_add(4));
        Ok(value)
    }

    fn push_w(&mut self, w: Width, value: u32) -> Result<(), Fault> {
        match w {
            Width::W16 => {
                let esp = self.cpu.esp().wrapping_sub(2);
                self.store(esp, Width::W16, value)?;
                self.cpu.set_esp(esp);
                Ok(())
            }
            _ => self.push(value),
        }
    }

    fn pop_w(&mut self, w: Width) -> Result<u32, Fault> {
        match w {
            Width::W16 => {
                let esp = self.cpu.esp();
                let value = self.load(esp, Width::W16)?;
                self.cpu.set_esp(esp.wrapping_add(2));
                Ok(value)
            }
            _ => self.pop(),
        }
    }

    // ==================== single step ====================

    /// Decode and execute one instruction at EIP.
    pub fn step(&mut self) -> Result<(), Fault> {
        let start = self.cpu.eip;
        let mut pfx = Prefixes::default();
        let mut at = start;
        // Prefix scan, bounded so a page of 0x66 cannot spin us.
        for _ in 0..15 {
            let byte = self.code8(at)?;
            if !pfx.consume(byte) {
                break;
            }
            at += 1;
        }

        let opcode = self.code8(at)?;
        at += 1;
        let w = pfx.operand_width();

        // ALU families 00-3D: op index in bits 5:3, form in bits 2:0.
        if opcode < 0x40 && (opcode & 7) < 6 {
            return self.exec_alu(opcode, at, pfx);
        }

        match opcode {
            // ---- INC/DEC/PUSH/POP reg ----
            0x40..=0x47 => {
                let r = opcode & 7;
                let v = self.inc_dec(self.cpu.reg_w(r, w), w, false);
                self.cpu.set_reg_w(r, w, v);
                self.cpu.eip = at;
            }
            0x48..=0x4F => {
                let r = opcode & 7;
                let v = self.inc_dec(self.cpu.reg_w(r, w), w, true);
                self.cpu.set_reg_w(r, w, v);
                self.cpu.eip = at;
            }
            0x50..=0x57 => {
                let v = self.cpu.reg_w(opcode & 7, w);
                self.push_w(w, v)?;
                self.cpu.eip = at;
            }
            0x58..=0x5F => {
                let v = self.pop_w(w)?;
                self.cpu.set_reg_w(opcode & 7, w, v);
                self.cpu.eip = at;
            }

            // ---- PUSHAD / POPAD ----
            0x60 => {
                let esp = self.cpu.esp();
                for r in 0..8u8 {
                    let v = if r == 4 { esp } else { self.cpu.reg_w(r, Width::W32) };
                    self.push(v)?;
                }
                self.cpu.eip = at;
            }
            0x61 => {
                for r in (0..8u8).rev() {
                    let v = self.pop()?;
                    if r != 4 {
                        self.cpu.set_reg_w(r, Width::W32, v);
                    }
                }
                self.cpu.eip = at;
            }

            // ---- PUSH imm ----
            0x68 => {
                // Immediate width follows the operand-size prefix.
                let (imm, ilen) = match w {
                    Width::W16 => (self.code16(at)? as u32, 2),
                    _ => (self.code32(at)?, 4),
                };
                self.push(imm)?;
                self.cpu.eip = at + ilen;
            }
            0x6A => {
                let imm = self.code8(at)? as i8 as i32 as u32;
                self.push(imm)?;
                self.cpu.eip = at + 1;
            }

            // ---- IMUL r, rm, imm ----
            0x69 => {
                let d = self.modrm(at)?;
                let (imm, ilen) = match w {
                    Width::W16 => (self.code16(at + d.len)? as u32, 2),
                    _ => (self.code32(at + d.len)?, 4),
                };
                let src = self.rm_read(&d, w)?;
                let r = self.imul2(src, imm, w);
                self.cpu.set_reg_w(d.reg, w, r);
                self.cpu.eip = at + d.len + ilen;
            }
            0x6B => {
                let d = self.modrm(at)?;
                let imm = self.code8(at + d.len)? as i8 as i32 as u32;
                let src = self.rm_read(&d, w)?;
                let r = self.imul2(src, imm, w);
                self.cpu.set_reg_w(d.reg, w, r);
                self.cpu.eip = at + d.len + 1;
            }

            // ---- Jcc rel8 ----
            0x70..=0x7F => {
                let rel = self.code8(at)? as i8 as i32;
                let next = at + 1;
                self.cpu.eip = if condition(opcode & 0x0F, self.cpu.flags) {
                    next.wrapping_add(rel as u32)
                } else {
                    next
                };
            }

            // ---- group 1: ALU rm, imm ----
            0x80 => self.exec_group1(at, Width::W8, false)?,
            0x81 => self.exec_group1(at, w, false)?,
            0x83 => self.exec_group1(at, w, true)?,

            // ---- TEST / XCHG ----
            0x84 | 0x85 => {
                let ow = if opcode == 0x84 { Width::W8 } else { w };
                let d = self.modrm(at)?;
                let a = self.rm_read(&d, ow)?;
                let b = self.cpu.reg_w(d.reg, ow);
                flags::logic(&mut self.cpu.flags, a & b, ow);
                self.cpu.eip = at + d.len;
            }
            0x86 | 0x87 => {
                let ow = if opcode == 0x86 { Width::W8 } else { w };
                let d = self.modrm(at)?;
                let a = self.rm_read(&d, ow)?;
                let b = self.cpu.reg_w(d.reg, ow);
                self.rm_write(&d, ow, b)?;
                self.cpu.set_reg_w(d.reg, ow, a);
                self.cpu.eip = at + d.len;
            }

            // ---- MOV ----
            0x88 | 0x89 => {
                let ow = if opcode == 0x88 { Width::W8 } else { w };
                let d = self.modrm(at)?;
                let v = self.cpu.reg_w(d.reg, ow);
                self.rm_write(&d, ow, v)?;
                self.cpu.eip = at + d.len;
            }
            0x8A | 0x8B => {
                let ow = if opcode == 0x8A { Width::W8 } else { w };
                let d = self.modrm(at)?;
                let v = self.rm_read(&d, ow)?;
                self.cpu.set_reg_w(d.reg, ow, v);
                self.cpu.eip = at + d.len;
            }

            // ---- LEA ----
            0x8D => {
                let d = self.modrm(at)?;
                let RmOperand::Mem(addr) = d.rm else {
                    return Err(self.bad_opcode(opcode, None));
                };
                self.cpu.set_reg_w(d.reg, w, addr);
                self.cpu.eip = at + d.len;
            }

            // ---- POP rm ----
            0x8F => {
                let d = self.modrm(at)?;
                let v = self.pop_w(w)?;
                self.rm_write(&d, w, v)?;
                self.cpu.eip = at + d.len;
            }

            // ---- NOP / XCHG eAX, r ----
            0x90 => self.cpu.eip = at,
            0x91..=0x97 => {
                let r = opcode & 7;
                let a = self.cpu.reg_w(0, w);
                let b = self.cpu.reg_w(r, w);
                self.cpu.set_reg_w(0, w, b);
                self.cpu.set_reg_w(r, w, a);
                self.cpu.eip = at;
            }

            // ---- CBW/CWDE, CWD/CDQ ----
            0x98 => {
                if pfx.opsize {
                    let v = self.cpu.reg_w(0, Width::W8) as i8 as i16 as u16;
                    self.cpu.set_reg_w(0, Width::W16, v as u32);
                } else {
                    let v = self.cpu.reg_w(0, Width::W16) as i16 as i32 as u32;
                    self.cpu.set_reg_w(0, Width::W32, v);
                }
                self.cpu.eip = at;
            }
            0x99 => {
                if pfx.opsize {
                    let sign = if self.cpu.reg_w(0, Width::W16) & 0x8000 != 0 {
                        0xFFFF
                    } else {
                        0
                    };
                    self.cpu.set_reg_w(2, Width::W16, sign);
                } else {
                    let sign = if self.cpu.reg(Eax) & 0x8000_0000 != 0 {
                        0xFFFF_FFFF
                    } else {
                        0
                    };
                    self.cpu.set_reg(Edx, sign);
                }
                self.cpu.eip = at;
            }

            // ---- PUSHFD / POPFD / SAHF / LAHF ----
            0x9C => {
                let f = self.cpu.flags.to_pushed();
                self.push(f)?;
                self.cpu.eip = at;
            }
            0x9D => {
                let v = self.pop()?;
                self.cpu.flags = EFlags::from_popped(v);
                self.cpu.eip = at;
            }
            0x9E => {
                let ah = self.cpu.reg_w(4, Width::W8);
                let keep = self.cpu.flags.bits() & !0xD5;
                self.cpu.flags = EFlags::from_bits_truncate(keep | (ah & 0xD5));
                self.cpu.eip = at;
            }
            0x9F => {
                let low = (self.cpu.flags.bits() as u8 & 0xD5) | 0x02;
                self.cpu.set_reg_w(4, Width::W8, low as u32);
                self.cpu.eip = at;
            }

            // ---- MOV AL/eAX <-> moffs32 ----
            0xA0 => {
                let addr = self.code32(at)?;
                let v = self.load(addr, Width::W8)?;
                self.cpu.set_reg_w(0, Width::W8, v);
                self.cpu.eip = at + 4;
            }
            0xA1 => {
                let addr = self.code32(at)?;
                let v = self.load(addr, w)?;
                self.cpu.set_reg_w(0, w, v);
                self.cpu.eip = at + 4;
            }
            0xA2 => {
                let addr = self.code32(at)?;
                let v = self.cpu.reg_w(0, Width::W8);
                self.store(addr, Width::W8, v)?;
                self.cpu.eip = at + 4;
            }
            0xA3 => {
                let addr = self.code32(at)?;
                let v = self.cpu.reg_w(0, w);
                self.store(addr, w, v)?;
                self.cpu.eip = at + 4;
            }

            // ---- string ops ----
            0xA4 | 0xA5 | 0xA6 | 0xA7 | 0xAA | 0xAB | 0xAC | 0xAD | 0xAE | 0xAF => {
                self.exec_string(opcode, w, pfx)?;
                self.cpu.eip = at;
            }

            // ---- TEST AL/eAX, imm ----
            0xA8 => {
                let imm = self.code8(at)? as u32;
                let a = self.cpu.reg_w(0, Width::W8);
                flags::logic(&mut self.cpu.flags, a & imm, Width::W8);
                self.cpu.eip = at + 1;
            }
            0xA9 => {
                let (imm, len) = self.imm(at, w)?;
                let a = self.cpu.reg_w(0, w);
                flags::logic(&mut self.cpu.flags, a & imm, w);
                self.cpu.eip = at + len;
            }

            // ---- MOV r, imm ----
            0xB0..=0xB7 => {
                let imm = self.code8(at)? as u32;
                self.cpu.set_reg_w(opcode & 7, Width::W8, imm);
                self.cpu.eip = at + 1;
            }
            0xB8..=0xBF => {
                let (imm, len) = self.imm(at, w)?;
                self.cpu.set_reg_w(opcode & 7, w, imm);
                self.cpu.eip = at + len;
            }

            // ---- shift group ----
            0xC0 | 0xC1 => {
                let ow = if opcode == 0xC0 { Width::W8 } else { w };
                let d = self.modrm(at)?;
                let count = self.code8(at + d.len)? as u32;
                self.exec_shift(&d, ow, count)?;
                self.cpu.eip = at + d.len + 1;
            }
            0xD0 | 0xD1 => {
                let ow = if opcode == 0xD0 { Width::W8 } else { w };
                let d = self.modrm(at)?;
                self.exec_shift(&d, ow, 1)?;
                self.cpu.eip = at + d.len;
            }
            0xD2 | 0xD3 => {
                let ow = if opcode == 0xD2 { Width::W8 } else { w };
                let d = self.modrm(at)?;
                let count = self.cpu.reg_w(1, Width::W8);
                self.exec_shift(&d, ow, count)?;
                self.cpu.eip = at + d.len;
            }

            // ---- RET ----
            0xC2 => {
                let extra = self.code16(at)? as u32;
                let ret = self.pop()?;
                self.cpu.set_esp(self.cpu.esp().wrapping_add(extra));
                self.cpu.eip = ret;
            }
            0xC3 => {
                self.cpu.eip = self.pop()?;
            }

            // ---- MOV rm, imm ----
            0xC6 => {
                let d = self.modrm(at)?;
                let imm = self.code8(at + d.len)? as u32;
                self.rm_write(&d, Width::W8, imm)?;
                self.cpu.eip = at + d.len + 1;
            }
            0xC7 => {
                let d = self.modrm(at)?;
                let (imm, len) = self.imm(at + d.len, w)?;
                self.rm_write(&d, w, imm)?;
                self.cpu.eip = at + d.len + len;
            }

            // ---- ENTER / LEAVE ----
            0xC8 => {
                let frame = self.code16(at)? as u32;
                let level = self.code8(at + 2)?;
                if level != 0 {
                    return Err(self.bad_opcode(opcode, Some(level)));
                }
                let ebp = self.cpu.reg(Ebp);
                self.push(ebp)?;
                let esp = self.cpu.esp();
                self.cpu.set_reg(Ebp, esp);
                self.cpu.set_esp(esp.wrapping_sub(frame));
                self.cpu.eip = at + 3;
            }
            0xC9 => {
                let ebp = self.cpu.reg(Ebp);
                self.cpu.set_esp(ebp);
                let v = self.pop()?;
                self.cpu.set_reg(Ebp, v);
                self.cpu.eip = at;
            }

            // ---- LOOP / JECXZ ----
            0xE0..=0xE2 => {
                let rel = self.code8(at)? as i8 as i32;
                let next = at + 1;
                let ecx = self.cpu.reg(Ecx).wrapping_sub(1);
                self.cpu.set_reg(Ecx, ecx);
                let zf = self.cpu.flags.contains(EFlags::ZF);
                let taken = ecx != 0
                    && match opcode {
                        0xE0 => !zf,
                        0xE1 => zf,
                        _ => true,
                    };
                self.cpu.eip = if taken { next.wrapping_add(rel as u32) } else { next };
            }
            0xE3 => {
                let rel = self.code8(at)? as i8 as i32;
                let next = at + 1;
                self.cpu.eip = if self.cpu.reg(Ecx) == 0 {
                    next.wrapping_add(rel as u32)
                } else {
                    next
                };
            }

            // ---- CALL / JMP ----
            0xE8 => {
                let rel = self.code32(at)? as i32;
                let next = at + 4;
                self.push(next)?;
                self.cpu.eip = next.wrapping_add(rel as u32);
            }
            0xE9 => {
                let rel = self.code32(at)? as i32;
                self.cpu.eip = (at + 4).wrapping_add(rel as u32);
            }
            0xEB => {
                let rel = self.code8(at)? as i8 as i32;
                self.cpu.eip = (at + 1).wrapping_add(rel as u32);
            }

            // ---- flag manipulation ----
            0xF5 => {
                self.cpu.flags.toggle(EFlags::CF);
                self.cpu.eip = at;
            }
            0xF8 => {
                self.cpu.flags.remove(EFlags::CF);
                self.cpu.eip = at;
            }
            0xF9 => {
                self.cpu.flags.insert(EFlags::CF);
                self.cpu.eip = at;
            }
            // CLI/STI are no-ops for user code.
            0xFA | 0xFB => self.cpu.eip = at,
            0xFC => {
                self.cpu.flags.remove(EFlags::DF);
                self.cpu.eip = at;
            }
            0xFD => {
                self.cpu.flags.insert(EFlags::DF);
                self.cpu.eip = at;
            }

            // ---- group 3: TEST/NOT/NEG/MUL/IMUL/DIV/IDIV ----
            0xF6 => self.exec_group3(at, Width::W8)?,
            0xF7 => self.exec_group3(at, w)?,

            // ---- group 4/5 ----
            0xFE => {
                let d = self.modrm(at)?;
                let v = self.rm_read(&d, Width::W8)?;
                match d.reg {
                    0 => {
                        let r = self.inc_dec(v, Width::W8, false);
                        self.rm_write(&d, Width::W8, r)?;
                    }
                    1 => {
                        let r = self.inc_dec(v, Width::W8, true);
                        self.rm_write(&d, Width::W8, r)?;
                    }
                    ext => return Err(self.bad_opcode(opcode, Some(ext))),
                }
                self.cpu.eip = at + d.len;
            }
            0xFF => {
                let d = self.modrm(at)?;
                match d.reg {
                    0 => {
                        let v = self.rm_read(&d, w)?;
                        let r = self.inc_dec(v, w, false);
                        self.rm_write(&d, w, r)?;
                        self.cpu.eip = at + d.len;
                    }
                    1 => {
                        let v = self.rm_read(&d, w)?;
                        let r = self.inc_dec(v, w, true);
                        self.rm_write(&d, w, r)?;
                        self.cpu.eip = at + d.len;
                    }
                    2 => {
                        let target = self.rm_read(&d, Width::W32)?;
                        self.push(at + d.len)?;
                        self.cpu.eip = target;
                    }
                    4 => {
                        self.cpu.eip = self.rm_read(&d, Width::W32)?;
                    }
                    6 => {
                        let v = self.rm_read(&d, w)?;
                        self.push_w(w, v)?;
                        self.cpu.eip = at + d.len;
                    }
                    ext => return Err(self.bad_opcode(opcode, Some(ext))),
                }
            }

            // ---- two-byte escape ----
            0x0F => return self.exec_0f(at, pfx),

            // INT/INT3/INTO/HLT and everything else unmodeled.
            _ => return Err(self.bad_opcode(opcode, None)),
        }

        Ok(())
    }

    fn bad_opcode(&self, opcode: u8, ext: Option<u8>) -> Fault {
        Fault::UnsupportedOpcode {
            eip: self.cpu.eip,
            opcode,
            ext,
        }
    }

    fn modrm(&self, at: u32) -> Result<ModRm, Fault> {
        decode_modrm(&self.cpu, &self.mem, at).map_err(|e| self.fault(e))
    }

    /// Immediate at the operand width (imm16 under 0x66, else imm32).
    fn imm(&self, at: u32, w: Width) -> Result<(u32, u32), Fault> {
        match w {
            Width::W8 => Ok((self.code8(at)? as u32, 1)),
            Width::W16 => Ok((self.code16(at)? as u32, 2)),
            Width::W32 => Ok((self.code32(at)?, 4)),
        }
    }

    /// INC/DEC: every arithmetic flag except CF.
    fn inc_dec(&mut self, value: u32, w: Width, dec: bool) -> u32 {
        let cf = self.cpu.flags.contains(EFlags::CF);
        let r = if dec {
            flags::sub(&mut self.cpu.flags, value, 1, false, w)
        } else {
            flags::add(&mut self.cpu.flags, value, 1, false, w)
        };
        self.cpu.flags.set(EFlags::CF, cf);
        r
    }

    fn alu_apply(&mut self, op: u8, a: u32, b: u32, w: Width) -> (u32, bool) {
        let f = &mut self.cpu.flags;
        match op {
            0 => (flags::add(f, a, b, false, w), true),
            1 => (flags::logic(f, a | b, w), true),
            2 => {
                let c = f.contains(EFlags::CF);
                (flags::add(f, a, b, c, w), true)
            }
            3 => {
                let c = f.contains(EFlags::CF);
                (flags::sub(f, a, b, c, w), true)
            }
            4 => (flags::logic(f, a & b, w), true),
            5 => (flags::sub(f, a, b, false, w), true),
            6 => (flags::logic(f, a ^ b, w), true),
            _ => (flags::sub(f, a, b, false, w), false), // CMP
        }
    }

    fn exec_alu(&mut self, opcode: u8, at: u32, pfx: Prefixes) -> Result<(), Fault> {
        let op = (opcode >> 3) & 7;
        let form = opcode & 7;
        let w = if form & 1 == 0 {
            Width::W8
        } else {
            pfx.operand_width()
        };
        match form {
            0 | 1 => {
                // rm ← op(rm, reg)
                let d = self.modrm(at)?;
                let a = self.rm_read(&d, w)?;
                let b = self.cpu.reg_w(d.reg, w);
                let (r, wb) = self.alu_apply(op, a, b, w);
                if wb {
                    self.rm_write(&d, w, r)?;
                }
                self.cpu.eip = at + d.len;
            }
            2 | 3 => {
                // reg ← op(reg, rm)
                let d = self.modrm(at)?;
                let a = self.cpu.reg_w(d.reg, w);
                let b = self.rm_read(&d, w)?;
                let (r, wb) = self.alu_apply(op, a, b, w);
                if wb {
                    self.cpu.set_reg_w(d.reg, w, r);
                }
                self.cpu.eip = at + d.len;
            }
            _ => {
                // AL/eAX ← op(AL/eAX, imm)
                let (imm, len) = self.imm(at, w)?;
                let a = self.cpu.reg_w(0, w);
                let (r, wb) = self.alu_apply(op, a, imm, w);
                if wb {
                    self.cpu.set_reg_w(0, w, r);
                }
                self.cpu.eip = at + len;
            }
        }
        Ok(())
    }

    fn exec_group1(&mut self, at: u32, w: Width, sign_extend_imm8: bool) -> Result<(), Fault> {
        let d = self.modrm(at)?;
        let (imm, len) = if sign_extend_imm8 {
            (self.code8(at + d.len)? as i8 as i32 as u32, 1)
        } else {
            self.imm(at + d.len, w)?
        };
        let a = self.rm_read(&d, w)?;
        let (r, wb) = self.alu_apply(d.reg, a, imm, w);
        if wb {
            self.rm_write(&d, w, r)?;
        }
        self.cpu.eip = at + d.len + len;
        Ok(())
    }

    fn exec_shift(&mut self, d: &ModRm, w: Width, count: u32) -> Result<(), Fault> {
        let v = self.rm_read(d, w)?;
        let f = &mut self.cpu.flags;
        let r = match d.reg {
            0 => flags::rol(f, v, count, w),
            1 => flags::ror(f, v, count, w),
            2 => flags::rcl(f, v, count, w),
            3 => flags::rcr(f, v, count, w),
            4 | 6 => flags::shl(f, v, count, w),
            5 => flags::shr(f, v, count, w),
            _ => flags::sar(f, v, count, w),
        };
        self.rm_write(d, w, r)
    }

    fn imul2(&mut self, a: u32, b: u32, w: Width) -> u32 {
        let sa = sign_extend(a, w) as i64;
        let sb = sign_extend(b, w) as i64;
        let full = sa * sb;
        let r = (full as u32) & w.mask();
        let overflow = full != sign_extend(r, w) as i64;
        self.cpu.flags.set(EFlags::CF, overflow);
        self.cpu.flags.set(EFlags::OF, overflow);
        flags::set_szp(&mut self.cpu.flags, r, w);
        r
    }

    fn exec_group3(&mut self, at: u32, w: Width) -> Result<(), Fault> {
        let d = self.modrm(at)?;
        let v = self.rm_read(&d, w)?;
        let mut next = at + d.len;
        match d.reg {
            0 | 1 => {
                let (imm, len) = self.imm(next, w)?;
                flags::logic(&mut self.cpu.flags, v & imm, w);
                next += len;
            }
            2 => {
                self.rm_write(&d, w, !v & w.mask())?;
            }
            3 => {
                let r = flags::sub(&mut self.cpu.flags, 0, v, false, w);
                self.cpu.flags.set(EFlags::CF, v & w.mask() != 0);
                self.rm_write(&d, w, r)?;
            }
            4 => self.exec_mul(v, w, false)?,
            5 => self.exec_mul(v, w, true)?,
            6 => self.exec_div(v, w, false)?,
            7 => self.exec_div(v, w, true)?,
            ext => return Err(self.bad_opcode(0xF7, Some(ext))),
        }
        self.cpu.eip = next;
        Ok(())
    }

    fn exec_mul(&mut self, src: u32, w: Width, signed: bool) -> Result<(), Fault> {
        match w {
            Width::W8 => {
                let a = self.cpu.reg_w(0, Width::W8);
                let full = if signed {
                    ((a as i8 as i16) * (src as i8 as i16)) as u16
                } else {
                    (a as u16) * (src as u16)
                };
                self.cpu.set_reg_w(0, Width::W16, full as u32);
                let high_used = if signed {
                    (full as i16) != (full as i8) as i16
                } else {
                    full > 0xFF
                };
                self.cpu.flags.set(EFlags::CF, high_used);
                self.cpu.flags.set(EFlags::OF, high_used);
            }
            Width::W16 => {
                let a = self.cpu.reg_w(0, Width::W16);
                let full = if signed {
                    ((a as i16 as i32) * (src as i16 as i32)) as u32
                } else {
                    (a as u32) * (src & 0xFFFF)
                };
                self.cpu.set_reg_w(0, Width::W16, full & 0xFFFF);
                self.cpu.set_reg_w(2, Width::W16, full >> 16);
                let high_used = if signed {
                    (full as i32) != (full as i16) as i32
                } else {
                    full > 0xFFFF
                };
                self.cpu.flags.set(EFlags::CF, high_used);
                self.cpu.flags.set(EFlags::OF, high_used);
            }
            Width::W32 => {
                let a = self.cpu.reg(Eax);
                let full = if signed {
                    ((a as i32 as i64) * (src as i32 as i64)) as u64
                } else {
                    (a as u64) * (src as u64)
                };
                self.cpu.set_reg(Eax, full as u32);
                self.cpu.set_reg(Edx, (full >> 32) as u32);
                let high_used = if signed {
                    (full as i64) != (full as u32 as i32) as i64
                } else {
                    full > 0xFFFF_FFFF
                };
                self.cpu.flags.set(EFlags::CF, high_used);
                self.cpu.flags.set(EFlags::OF, high_used);
            }
        }
        Ok(())
    }

    /// DIV/IDIV. Division by zero and quotient overflow both fault; the
    /// session maps either to the divide exit status.
    fn exec_div(&mut self, src: u32, w: Width, signed: bool) -> Result<(), Fault> {
        let eip = self.cpu.eip;
        let divide_fault = Fault::DivideByZero { eip };
        let src = src & w.mask();
        if src == 0 {
            return Err(divide_fault);
        }
        match w {
            Width::W8 => {
                let dividend = self.cpu.reg_w(0, Width::W16);
                if signed {
                    let q = (dividend as i16) / (src as i8 as i16);
                    let r = (dividend as i16) % (src as i8 as i16);
                    if q != q as i8 as i16 {
                        return Err(divide_fault);
                    }
                    self.cpu.set_reg_w(0, Width::W8, q as u32);
                    self.cpu.set_reg_w(4, Width::W8, r as u32);
                } else {
                    let q = dividend / src;
                    if q > 0xFF {
                        return Err(divide_fault);
                    }
                    self.cpu.set_reg_w(0, Width::W8, q);
                    self.cpu.set_reg_w(4, Width::W8, dividend % src);
                }
            }
            Width::W16 => {
                let dividend =
                    ((self.cpu.reg_w(2, Width::W16) << 16) | self.cpu.reg_w(0, Width::W16)) as u32;
                if signed {
                    let q = (dividend as i32) / (src as i16 as i32);
                    let r = (dividend as i32) % (src as i16 as i32);
                    if q != q as i16 as i32 {
                        return Err(divide_fault);
                    }
                    self.cpu.set_reg_w(0, Width::W16, q as u32);
                    self.cpu.set_reg_w(2, Width::W16, r as u32);
                } else {
                    let q = dividend / src;
                    if q > 0xFFFF {
                        return Err(divide_fault);
                    }
                    self.cpu.set_reg_w(0, Width::W16, q);
                    self.cpu.set_reg_w(2, Width::W16, dividend % src);
                }
            }
            Width::W32 => {
                let dividend =
                    ((self.cpu.reg(Edx) as u64) << 32) | self.cpu.reg(Eax) as u64;
                if signed {
                    let divisor = src as i32 as i64;
                    let dividend = dividend as i64;
                    // i64::MIN / -1 would trap in Rust too.
                    if dividend == i64::MIN && divisor == -1 {
                        return Err(divide_fault);
                    }
                    let q = dividend / divisor;
                    let r = dividend % divisor;
                    if q != q as i32 as i64 {
                        return Err(divide_fault);
                    }
                    self.cpu.set_reg(Eax, q as u32);
                    self.cpu.set_reg(Edx, r as u32);
                } else {
                    let q = dividend / src as u64;
                    if q > 0xFFFF_FFFF {
                        return Err(divide_fault);
                    }
                    self.cpu.set_reg(Eax, q as u32);
                    self.cpu.set_reg(Edx, (dividend % src as u64) as u32);
                }
            }
        }
        Ok(())
    }

    // ==================== string instructions ====================

    fn exec_string(&mut self, opcode: u8, w: Width, pfx: Prefixes) -> Result<(), Fault> {
        let ow = if opcode & 1 == 0 { Width::W8 } else { w };
        let step = if self.cpu.flags.contains(EFlags::DF) {
            (ow.bytes() as i32).wrapping_neg()
        } else {
            ow.bytes() as i32
        };
        let repeated = pfx.rep || pfx.repne;
        let is_cmp = matches!(opcode, 0xA6 | 0xA7 | 0xAE | 0xAF);

        loop {
            if repeated && self.cpu.reg(Ecx) == 0 {
                break;
            }

            let esi = self.cpu.reg(Esi);
            let edi = self.cpu.reg(Edi);
            match opcode {
                // MOVS
                0xA4 | 0xA5 => {
                    let v = self.load(esi, ow)?;
                    self.store(edi, ow, v)?;
                    self.cpu.set_reg(Esi, esi.wrapping_add(step as u32));
                    self.cpu.set_reg(Edi, edi.wrapping_add(step as u32));
                }
                // CMPS
                0xA6 | 0xA7 => {
                    let a = self.load(esi, ow)?;
                    let b = self.load(edi, ow)?;
                    flags::sub(&mut self.cpu.flags, a, b, false, ow);
                    self.cpu.set_reg(Esi, esi.wrapping_add(step as u32));
                    self.cpu.set_reg(Edi, edi.wrapping_add(step as u32));
                }
                // STOS
                0xAA | 0xAB => {
                    let v = self.cpu.reg_w(0, ow);
                    self.store(edi, ow, v)?;
                    self.cpu.set_reg(Edi, edi.wrapping_add(step as u32));
                }
                // LODS
                0xAC | 0xAD => {
                    let v = self.load(esi, ow)?;
                    self.cpu.set_reg_w(0, ow, v);
                    self.cpu.set_reg(Esi, esi.wrapping_add(step as u32));
                }
                // SCAS
                _ => {
                    let a = self.cpu.reg_w(0, ow);
                    let b = self.load(edi, ow)?;
                    flags::sub(&mut self.cpu.flags, a, b, false, ow);
                    self.cpu.set_reg(Edi, edi.wrapping_add(step as u32));
                }
            }

            if !repeated {
                break;
            }
            self.cpu.set_reg(Ecx, self.cpu.reg(Ecx).wrapping_sub(1));
            // Long REP blocks count against the budget and cross yield
            // points like any other instruction stream.
            self.insn_count += 1;
            if self.insn_count % YIELD_INTERVAL == 0 {
                self.host.yield_now();
                if self.host.cancel_requested() {
                    return Err(Fault::Cancelled);
                }
            }
            if self.insn_count >= self.insn_budget {
                return Err(Fault::InstructionBudget {
                    executed: self.insn_count,
                });
            }
            if is_cmp {
                let zf = self.cpu.flags.contains(EFlags::ZF);
                if pfx.repne && zf {
                    break;
                }
                if pfx.rep && !zf {
                    break;
                }
            }
        }
        Ok(())
    }

    // ==================== two-byte opcodes ====================

    fn exec_0f(&mut self, at: u32, pfx: Prefixes) -> Result<(), Fault> {
        let opcode = self.code8(at)?;
        let at = at + 1;
        let w = pfx.operand_width();

        match opcode {
            // Long NOP forms.
            0x1F => {
                let d = self.modrm(at)?;
                self.cpu.eip = at + d.len;
            }

            // CMOVcc
            0x40..=0x4F => {
                let d = self.modrm(at)?;
                // Source is read regardless of the condition.
                let v = self.rm_read(&d, w)?;
                if condition(opcode & 0x0F, self.cpu.flags) {
                    self.cpu.set_reg_w(d.reg, w, v);
                }
                self.cpu.eip = at + d.len;
            }

            // Jcc rel32
            0x80..=0x8F => {
                let rel = self.code32(at)? as i32;
                let next = at + 4;
                self.cpu.eip = if condition(opcode & 0x0F, self.cpu.flags) {
                    next.wrapping_add(rel as u32)
                } else {
                    next
                };
            }

            // SETcc
            0x90..=0x9F => {
                let d = self.modrm(at)?;
                let v = condition(opcode & 0x0F, self.cpu.flags) as u32;
                self.rm_write(&d, Width::W8, v)?;
                self.cpu.eip = at + d.len;
            }

            // BT/BTS/BTR/BTC with register bit offset.
            0xA3 | 0xAB | 0xB3 | 0xBB => {
                let d = self.modrm(at)?;
                let bit = self.cpu.reg_w(d.reg, w);
                self.exec_bit(&d, w, bit as i32, bt_op(opcode))?;
                self.cpu.eip = at + d.len;
            }

            // SHLD / SHRD
            0xA4 | 0xAC => {
                let d = self.modrm(at)?;
                let count = self.code8(at + d.len)? as u32;
                self.exec_double_shift(&d, w, count, opcode == 0xAC)?;
                self.cpu.eip = at + d.len + 1;
            }
            0xA5 | 0xAD => {
                let d = self.modrm(at)?;
                let count = self.cpu.reg_w(1, Width::W8);
                self.exec_double_shift(&d, w, count, opcode == 0xAD)?;
                self.cpu.eip = at + d.len;
            }

            // IMUL r, rm
            0xAF => {
                let d = self.modrm(at)?;
                let a = self.cpu.reg_w(d.reg, w);
                let b = self.rm_read(&d, w)?;
                let r = self.imul2(a, b, w);
                self.cpu.set_reg_w(d.reg, w, r);
                self.cpu.eip = at + d.len;
            }

            // Group 8: BT family with imm8 bit offset.
            0xBA => {
                let d = self.modrm(at)?;
                let imm = self.code8(at + d.len)? as u32;
                let op = match d.reg {
                    4 => BitOp::Test,
                    5 => BitOp::Set,
                    6 => BitOp::Reset,
                    7 => BitOp::Complement,
                    ext => return Err(self.bad_opcode(0xBA, Some(ext))),
                };
                // Immediate offsets never adjust the address.
                let bit = (imm % w.bits()) as i32;
                self.exec_bit_at(&d, w, bit, 0, op)?;
                self.cpu.eip = at + d.len + 1;
            }

            // BSF / BSR
            0xBC | 0xBD => {
                let d = self.modrm(at)?;
                let src = self.rm_read(&d, w)? & w.mask();
                if src == 0 {
                    self.cpu.flags.insert(EFlags::ZF);
                } else {
                    self.cpu.flags.remove(EFlags::ZF);
                    let index = if opcode == 0xBC {
                        src.trailing_zeros()
                    } else {
                        31 - src.leading_zeros()
                    };
                    self.cpu.set_reg_w(d.reg, w, index);
                }
                self.cpu.eip = at + d.len;
            }

            // MOVZX / MOVSX
            0xB6 | 0xB7 | 0xBE | 0xBF => {
                let sw = if opcode & 1 == 0 { Width::W8 } else { Width::W16 };
                let d = self.modrm(at)?;
                let v = self.rm_read(&d, sw)?;
                let v = if opcode >= 0xBE {
                    sign_extend(v, sw) as u32
                } else {
                    v
                };
                self.cpu.set_reg_w(d.reg, w, v);
                self.cpu.eip = at + d.len;
            }

            _ => {
                return Err(Fault::UnsupportedOpcode {
                    eip: self.cpu.eip,
                    opcode: 0x0F,
                    ext: Some(opcode),
                })
            }
        }
        Ok(())
    }

    /// BT family with a register bit offset: memory forms address the
    /// 32-bit chunk `4 * (offset / 32)` past the base, signed.
    fn exec_bit(&mut self, d: &ModRm, w: Width, bit: i32, op: BitOp) -> Result<(), Fault> {
        let bits = w.bits() as i32;
        match d.rm {
            RmOperand::Reg(_) => {
                let bit = bit.rem_euclid(bits);
                self.exec_bit_at(d, w, bit, 0, op)
            }
            RmOperand::Mem(_) => {
                let chunk = bit.div_euclid(bits);
                let bit = bit.rem_euclid(bits);
                let byte_off = chunk.wrapping_mul(bits / 8);
                self.exec_bit_at(d, w, bit, byte_off, op)
            }
        }
    }

    fn exec_bit_at(
        &mut self,
        d: &ModRm,
        w: Width,
        bit: i32,
        byte_off: i32,
        op: BitOp,
    ) -> Result<(), Fault> {
        let mask = 1u32 << bit;
        let (value, target) = match d.rm {
            RmOperand::Reg(r) => (self.cpu.reg_w(r, w), None),
            RmOperand::Mem(addr) => {
                let addr = addr.wrapping_add(byte_off as u32);
                (self.load(addr, w)?, Some(addr))
            }
        };
        self.cpu.flags.set(EFlags::CF, value & mask != 0);
        let new = match op {
            BitOp::Test => return Ok(()),
            BitOp::Set => value | mask,
            BitOp::Reset => value & !mask,
            BitOp::Complement => value ^ mask,
        };
        match (d.rm, target) {
            (RmOperand::Reg(r), _) => self.cpu.set_reg_w(r, w, new),
            (_, Some(addr)) => self.store(addr, w, new)?,
            _ => {}
        }
        Ok(())
    }

    /// SHLD/SHRD over the double-width concatenation of dst and src.
    fn exec_double_shift(
        &mut self,
        d: &ModRm,
        w: Width,
        count: u32,
        right: bool,
    ) -> Result<(), Fault> {
        let count = count & 0x1F;
        if count == 0 {
            return Ok(());
        }
        let bits = w.bits();
        let dst = (self.rm_read(d, w)? & w.mask()) as u64;
        let src = (self.cpu.reg_w(d.reg, w) & w.mask()) as u64;
        let (result, cf) = if right {
            let wide = (src << bits) | dst;
            let r = (wide >> count) as u32 & w.mask();
            let cf = (wide >> (count - 1)) & 1 != 0;
            (r, cf)
        } else {
            let wide = (dst << bits) | src;
            let shifted = wide << count;
            let r = (shifted >> bits) as u32 & w.mask();
            let cf = (shifted >> (2 * bits)) & 1 != 0;
            (r, cf)
        };
        self.cpu.flags.set(EFlags::CF, cf);
        flags::set_szp(&mut self.cpu.flags, result, w);
        self.rm_write(d, w, result)
    }
}

#[derive(Clone, Copy)]
enum BitOp {
    Test,
    Set,
    Reset,
    Complement,
}

fn bt_op(opcode: u8) -> BitOp {
    match opcode {
        0xA3 => BitOp::Test,
        0xAB => BitOp::Set,
        0xB3 => BitOp::Reset,
        _ => BitOp::Complement,
    }
}

fn sign_extend(value: u32, w: Width) -> i32 {
    match w {
        Width::W8 => value as u8 as i8 as i32,
        Width::W16 => value as u16 as i16 as i32,
        Width::W32 => value as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::BufferHost;
    use crate::x86::Reg::Ebx;
    use alloc::vec;

    const BASE: u32 = 0x0040_0000;

    /// Load `code` at the image base and run until the terminate token.
    fn run_code(code: &[u8]) -> (RunExit, Cpu) {
        let mut host = BufferHost::new();
        let mut image = vec![0u8; 0x4000];
        image[..code.len()].copy_from_slice(code);
        let mut m = Machine::new(BASE, image, &mut host);
        m.push(TERMINATE_TOKEN).unwrap();
        m.cpu.eip = BASE;
        let exit = m.run().unwrap();
        (exit, m.cpu)
    }

    fn run_fault(code: &[u8]) -> Fault {
        let mut host = BufferHost::new();
        let mut image = vec![0u8; 0x4000];
        image[..code.len()].copy_from_slice(code);
        let mut m = Machine::new(BASE, image, &mut host);
        m.push(TERMINATE_TOKEN).unwrap();
        m.cpu.eip = BASE;
        m.run().unwrap_err()
    }

    #[test]
    fn mov_add_ret() {
        // mov eax, 40; add eax, 2; ret
        let (exit, _) = run_code(&[0xB8, 40, 0, 0, 0, 0x05, 2, 0, 0, 0, 0xC3]);
        assert_eq!(exit, RunExit::Returned(42));
    }

    #[test]
    fn sub_and_conditional_jump() {
        // mov eax,5; sub eax,5; jz +2 (skip mov al,1); mov al,1; ret
        let code = [
            0xB8, 5, 0, 0, 0, // mov eax,5
            0x2D, 5, 0, 0, 0, // sub eax,5
            0x74, 2, // jz +2
            0xB0, 1, // mov al,1
            0xC3,
        ];
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(0));
    }

    #[test]
    fn call_and_stack_frames() {
        // call f; ret / f: push ebp; mov ebp,esp; mov eax,7; pop ebp; ret
        let code = [
            0xE8, 1, 0, 0, 0, // call +1
            0xC3, // ret (to terminate)
            0x55, // push ebp
            0x89, 0xE5, // mov ebp, esp
            0xB8, 7, 0, 0, 0, // mov eax, 7
            0x5D, // pop ebp
            0xC3, // ret
        ];
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(7));
    }

    #[test]
    fn memory_operands_and_lea() {
        // mov dword [0x00402000], 0x1111; mov eax,[0x00402000];
        // lea ecx,[eax+eax*2+5]; mov eax,ecx; ret
        let code = [
            0xC7, 0x05, 0x00, 0x20, 0x40, 0x00, 0x11, 0x11, 0x00, 0x00,
            0xA1, 0x00, 0x20, 0x40, 0x00,
            0x8D, 0x4C, 0x40, 0x05, // lea ecx,[eax+eax*2+5]
            0x89, 0xC8, // mov eax,ecx
            0xC3,
        ];
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(0x1111 * 3 + 5));
    }

    #[test]
    fn sixteen_bit_operand_prefix() {
        // mov eax, 0xFFFFFFFF; 66 mov ax, 1; ret -> high half preserved
        let code = [
            0xB8, 0xFF, 0xFF, 0xFF, 0xFF, // mov eax,-1
            0x66, 0xB8, 0x01, 0x00, // mov ax,1
            0xC3,
        ];
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(0xFFFF_0001));
    }

    #[test]
    fn eight_bit_registers() {
        // mov eax,0; mov ah,2; mov al,3; ret -> 0x0203
        let code = [0xB8, 0, 0, 0, 0, 0xB4, 2, 0xB0, 3, 0xC3];
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(0x0203));
    }

    #[test]
    fn mul_div_roundtrip() {
        // mov eax,1000; mov ecx,7; mul ecx; div ecx -> eax=1000, edx=0
        let code = [
            0xB8, 0xE8, 0x03, 0, 0, // mov eax,1000
            0xB9, 7, 0, 0, 0, // mov ecx,7
            0xF7, 0xE1, // mul ecx
            0xF7, 0xF1, // div ecx
            0xC3,
        ];
        let (exit, cpu) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(1000));
        assert_eq!(cpu.reg(Edx), 0);
    }

    #[test]
    fn idiv_negative() {
        // mov eax,-10; cdq; mov ecx,3; idiv ecx -> eax=-3, edx=-1
        let code = [
            0xB8, 0xF6, 0xFF, 0xFF, 0xFF, // mov eax,-10
            0x99, // cdq
            0xB9, 3, 0, 0, 0, // mov ecx,3
            0xF7, 0xF9, // idiv ecx
            0xC3,
        ];
        let (exit, cpu) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(-3i32 as u32));
        assert_eq!(cpu.reg(Edx), -1i32 as u32);
    }

    #[test]
    fn divide_by_zero_faults() {
        // xor ecx,ecx; mov eax,1; xor edx,edx; div ecx
        let code = [0x31, 0xC9, 0xB8, 1, 0, 0, 0, 0x31, 0xD2, 0xF7, 0xF1];
        let fault = run_fault(&code);
        assert!(matches!(fault, Fault::DivideByZero { .. }));
        assert_eq!(fault.exit_code(), crate::EXIT_DIVIDE);
    }

    #[test]
    fn divide_overflow_faults() {
        // mov edx,1; mov eax,0; mov ecx,1; div ecx -> quotient 2^32
        let code = [
            0xBA, 1, 0, 0, 0, 0xB8, 0, 0, 0, 0, 0xB9, 1, 0, 0, 0, 0xF7, 0xF1,
        ];
        assert!(matches!(run_fault(&code), Fault::DivideByZero { .. }));
    }

    #[test]
    fn unmapped_store_faults_with_address() {
        // mov dword [0x00001000], 1
        let code = [0xC7, 0x05, 0x00, 0x10, 0x00, 0x00, 1, 0, 0, 0];
        match run_fault(&code) {
            Fault::Memory { addr, .. } => assert_eq!(addr, 0x1000),
            other => panic!("unexpected fault {other:?}"),
        }
    }

    #[test]
    fn bad_opcode_faults() {
        // 0xF1 (ICEBP) is outside the subset.
        let fault = run_fault(&[0xF1]);
        assert!(matches!(
            fault,
            Fault::UnsupportedOpcode { opcode: 0xF1, .. }
        ));
        assert_eq!(fault.exit_code(), crate::EXIT_BAD_OPCODE);
    }

    #[test]
    fn int3_is_not_modeled() {
        assert!(matches!(
            run_fault(&[0xCC]),
            Fault::UnsupportedOpcode { opcode: 0xCC, .. }
        ));
    }

    #[test]
    fn rep_movsb_copies() {
        // Copy 5 bytes from 0x402000 to 0x402100.
        let mut code = vec![
            0xBE, 0x00, 0x20, 0x40, 0x00, // mov esi, src
            0xBF, 0x00, 0x21, 0x40, 0x00, // mov edi, dst
            0xB9, 5, 0, 0, 0, // mov ecx, 5
            0xF3, 0xA4, // rep movsb
            0xA1, 0x00, 0x21, 0x40, 0x00, // mov eax,[dst]
            0xC3,
        ];
        code.resize(0x2000, 0);
        code.extend_from_slice(b"HELLO");
        let (exit, cpu) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(u32::from_le_bytes(*b"HELL")));
        assert_eq!(cpu.reg(Ecx), 0);
    }

    #[test]
    fn rep_movsd_with_zero_count_is_noop() {
        // ECX=0: the repeat consumes the prefix and moves nothing.
        let code = [
            0xBE, 0x00, 0x20, 0x40, 0x00, // mov esi, 0x00402000
            0xBF, 0x00, 0x30, 0x40, 0x00, // mov edi, 0x00403000
            0x31, 0xC9, // xor ecx,ecx
            0xF3, 0xA5, // rep movsd
            0xB8, 42, 0, 0, 0, // mov eax,42
            0xC3,
        ];
        let (exit, cpu) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(42));
        assert_eq!(cpu.reg(Esi), 0x0040_2000);
        assert_eq!(cpu.reg(Edi), 0x0040_3000);
    }

    #[test]
    fn repne_scasb_strlen() {
        // Classic strlen: edi=s, al=0, ecx=-1, repne scasb, len = -ecx-2.
        let mut code = vec![
            0xBF, 0x00, 0x20, 0x40, 0x00, // mov edi, s
            0x31, 0xC0, // xor eax,eax
            0xB9, 0xFF, 0xFF, 0xFF, 0xFF, // mov ecx,-1
            0xF2, 0xAE, // repne scasb
            0xF7, 0xD1, // not ecx
            0x8D, 0x41, 0xFF, // lea eax,[ecx-1]
            0xC3,
        ];
        code.resize(0x2000, 0);
        code.extend_from_slice(b"four\0");
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(4));
    }

    #[test]
    fn stosd_fills() {
        let mut code = vec![
            0xBF, 0x00, 0x20, 0x40, 0x00, // mov edi, dst
            0xB8, 0xEF, 0xBE, 0xAD, 0xDE, // mov eax, 0xDEADBEEF
            0xB9, 4, 0, 0, 0, // mov ecx, 4
            0xF3, 0xAB, // rep stosd
            0xA1, 0x0C, 0x20, 0x40, 0x00, // mov eax,[dst+12]
            0xC3,
        ];
        code.resize(0x2000, 0);
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(0xDEAD_BEEF));
    }

    #[test]
    fn long_rep_crosses_yield_points() {
        // A 12 KiB rep stosb runs thousands of iterations inside one
        // instruction; the cooperative yield hook must still fire.
        let code = [
            0xBF, 0x00, 0x10, 0x40, 0x00, // mov edi, BASE+0x1000
            0xB9, 0x00, 0x30, 0x00, 0x00, // mov ecx, 0x3000
            0xB0, 0xAA, // mov al, 0xAA
            0xF3, 0xAA, // rep stosb
            0xC3,
        ];
        let mut host = BufferHost::new();
        let mut image = vec![0u8; 0x4000];
        image[..code.len()].copy_from_slice(&code);
        let mut m = Machine::new(BASE, image, &mut host);
        m.push(TERMINATE_TOKEN).unwrap();
        m.cpu.eip = BASE;
        m.run().unwrap();
        drop(m);
        // 0x3000 iterations cross the 4096-instruction mark at least twice.
        assert!(host.yields >= 3);
    }

    #[test]
    fn shifts_and_rotates() {
        // mov eax,1; shl eax,4; mov ecx,3; shr eax,cl; ret -> 2
        let code = [
            0xB8, 1, 0, 0, 0, 0xC1, 0xE0, 4, 0xB9, 3, 0, 0, 0, 0xD3, 0xE8, 0xC3,
        ];
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(2));
    }

    #[test]
    fn movzx_movsx() {
        // mov byte [0x402000],0xFF; movzx eax, byte [..]; movsx ecx, byte [..];
        // add eax, ecx; ret -> 0xFF + (-1) = 0xFE
        let code = [
            0xC6, 0x05, 0x00, 0x20, 0x40, 0x00, 0xFF, // mov byte [m],0xFF
            0x0F, 0xB6, 0x05, 0x00, 0x20, 0x40, 0x00, // movzx eax, byte [m]
            0x0F, 0xBE, 0x0D, 0x00, 0x20, 0x40, 0x00, // movsx ecx, byte [m]
            0x01, 0xC8, // add eax, ecx
            0xC3,
        ];
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(0xFE));
    }

    #[test]
    fn setcc_and_cmov() {
        // xor eax,eax; cmp eax,1; setb al; mov ecx,9; cmovb edx,ecx;
        // add eax,edx; ret -> 1 + 9
        let code = [
            0x31, 0xC0, // xor eax,eax
            0x31, 0xD2, // xor edx,edx
            0x83, 0xF8, 0x01, // cmp eax,1
            0x0F, 0x92, 0xC0, // setb al
            0xB9, 9, 0, 0, 0, // mov ecx,9
            0x0F, 0x42, 0xD1, // cmovb edx,ecx
            0x01, 0xD0, // add eax,edx
            0xC3,
        ];
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(10));
    }

    #[test]
    fn bit_test_family() {
        // mov eax,0; bts eax,3; bt eax,3 -> CF; setc cl; movzx eax,cl... simpler:
        // mov eax,0; mov ecx,3; bts eax,ecx; ret -> 8
        let code = [
            0xB8, 0, 0, 0, 0, 0xB9, 3, 0, 0, 0, 0x0F, 0xAB, 0xC8, 0xC3,
        ];
        let (exit, cpu) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(8));
        assert!(!cpu.flags.contains(EFlags::CF));
    }

    #[test]
    fn bsf_bsr() {
        // mov eax,0x48; bsf ecx,eax; bsr edx,eax; mov eax,ecx; shl eax,8;
        // or eax,edx... keep simple: return bsf only
        let code = [
            0xB8, 0x48, 0, 0, 0, // mov eax,0x48
            0x0F, 0xBC, 0xC8, // bsf ecx,eax
            0x0F, 0xBD, 0xD0, // bsr edx,eax
            0x89, 0xC8, // mov eax,ecx
            0xC3,
        ];
        let (exit, cpu) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(3));
        assert_eq!(cpu.reg(Edx), 6);
    }

    #[test]
    fn loop_counts_down() {
        // xor eax,eax; mov ecx,5; l: inc eax; loop l; ret -> 5
        let code = [0x31, 0xC0, 0xB9, 5, 0, 0, 0, 0x40, 0xE2, 0xFD, 0xC3];
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(5));
    }

    #[test]
    fn leave_unwinds_frame() {
        // push ebp; mov ebp,esp; sub esp,0x10; mov eax,3; leave; ret
        let code = [
            0x55, 0x89, 0xE5, 0x83, 0xEC, 0x10, 0xB8, 3, 0, 0, 0, 0xC9, 0xC3,
        ];
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(3));
    }

    #[test]
    fn pushfd_popfd_roundtrip() {
        // stc; pushfd; clc; popfd; setc al; movzx eax,al; ret -> 1
        let code = [
            0xF9, 0x9C, 0xF8, 0x9D, 0x0F, 0x92, 0xC0, 0x0F, 0xB6, 0xC0, 0xC3,
        ];
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(1));
    }

    #[test]
    fn ret_imm_cleans_arguments() {
        // push 1; push 2; call f; ret / f: mov eax,[esp+4]; add eax,[esp+8]; ret 8
        let code = [
            0x6A, 0x01, // push 1
            0x6A, 0x02, // push 2
            0xE8, 0x01, 0x00, 0x00, 0x00, // call f
            0xC3, // ret
            // f:
            0x8B, 0x44, 0x24, 0x04, // mov eax,[esp+4]
            0x03, 0x44, 0x24, 0x08, // add eax,[esp+8]
            0xC2, 0x08, 0x00, // ret 8
        ];
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(3));
    }

    #[test]
    fn instruction_budget_stops_runaway() {
        let mut host = BufferHost::new();
        let mut image = vec![0u8; 0x1000];
        image[0] = 0xEB; // jmp -2 (self)
        image[1] = 0xFE;
        let mut m = Machine::new(BASE, image, &mut host);
        m.cpu.eip = BASE;
        m.insn_budget = 10_000;
        assert!(matches!(
            m.run().unwrap_err(),
            Fault::InstructionBudget { .. }
        ));
    }

    #[test]
    fn cancel_request_observed() {
        let mut host = BufferHost::new();
        host.cancel = true;
        let mut image = vec![0u8; 0x1000];
        image[0] = 0xEB;
        image[1] = 0xFE;
        let mut m = Machine::new(BASE, image, &mut host);
        m.cpu.eip = BASE;
        assert_eq!(m.run().unwrap_err(), Fault::Cancelled);
    }

    #[test]
    fn unresolved_thunk_faults_only_when_called() {
        use crate::pe::ImportSymbol;
        let mut host = BufferHost::new();
        let mut image = vec![0u8; 0x1000];
        // mov eax, 11; ret -- never touches the thunk
        image[..7].copy_from_slice(&[0xB8, 11, 0, 0, 0, 0xC3, 0x00]);
        let mut m = Machine::new(BASE, image, &mut host);
        m.bindings.push(ImportBinding {
            dll: "KERNEL32.dll".into(),
            symbol: ImportSymbol::Name("Beep".into()),
        });
        m.shims.push(None);
        m.push(TERMINATE_TOKEN).unwrap();
        m.cpu.eip = BASE;
        assert_eq!(m.run().unwrap(), RunExit::Returned(11));
    }

    #[test]
    fn calling_unresolved_thunk_faults() {
        let mut host = BufferHost::new();
        let mut image = vec![0u8; 0x1000];
        // IAT slot at +0x100 holds the token; call [0x00400100]
        image[..6].copy_from_slice(&[0xFF, 0x15, 0x00, 0x01, 0x40, 0x00]);
        image[0x100..0x104].copy_from_slice(&crate::THUNK_BASE.to_le_bytes());
        let mut m = Machine::new(BASE, image, &mut host);
        m.bindings.push(crate::ldr::ImportBinding {
            dll: "KERNEL32.dll".into(),
            symbol: crate::pe::ImportSymbol::Name("Beep".into()),
        });
        m.shims.push(None);
        m.cpu.eip = BASE;
        match m.run().unwrap_err() {
            Fault::MissingShim { symbol } => assert_eq!(symbol, "KERNEL32.dll!Beep"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn xchg_and_pushad() {
        // mov eax,1; mov ebx,2; xchg eax,ebx; pushad; popad; ret -> 2
        let code = [
            0xB8, 1, 0, 0, 0, 0xBB, 2, 0, 0, 0, 0x93, 0x60, 0x61, 0xC3,
        ];
        let (exit, cpu) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(2));
        assert_eq!(cpu.reg(Ebx), 1);
    }

    #[test]
    fn neg_and_not() {
        // mov eax,5; neg eax; not eax; ret -> !( -5 ) = 4
        let code = [0xB8, 5, 0, 0, 0, 0xF7, 0xD8, 0xF7, 0xD0, 0xC3];
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(4));
    }

    #[test]
    fn imul_three_operand() {
        // imul eax, ecx, 10 with ecx=7 -> 70
        let code = [0xB9, 7, 0, 0, 0, 0x6B, 0xC1, 0x0A, 0xC3];
        let (exit, _) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(70));
    }

    #[test]
    fn operand_size_prefix_shortens_immediates() {
        // 66-prefixed PUSH and IMUL carry 2-byte immediates; a 4-byte
        // read would swallow the following pop and ret.
        let code = [
            0xB9, 7, 0, 0, 0, // mov ecx, 7
            0x66, 0x69, 0xC1, 0x0A, 0x00, // imul ax, cx, 10
            0x66, 0x68, 0x34, 0x12, // push word 0x1234
            0x5B, // pop ebx
            0xC3,
        ];
        let (exit, cpu) = run_code(&code);
        assert_eq!(exit, RunExit::Returned(70));
        assert_eq!(cpu.reg(Ebx), 0x1234);
    }
}
