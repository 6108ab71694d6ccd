//! i386 Machine Model
//!
//! Architectural state and the interpreter for the 32-bit protected-mode
//! user subset. Flat address space, no segmentation beyond ignoring
//! segment override prefixes, no FPU/MMX/SSE.
//!
//! - **mod** - registers, EFLAGS, operand widths
//! - **flags** - arithmetic flag computation (Intel semantics per width)
//! - **mem** - guest address space and the heap band allocator
//! - **decode** - prefixes, ModR/M + SIB effective addresses, condition codes
//! - **exec** - the fetch/decode/execute loop and fault taxonomy

pub mod decode;
pub mod exec;
pub mod flags;
pub mod mem;

pub use exec::{Fault, Machine, RunExit};
pub use mem::AddressSpace;

use bitflags::bitflags;

bitflags! {
    /// EFLAGS bits the interpreter models. Reserved bit 1 is always set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EFlags: u32 {
        /// Carry
        const CF = 1 << 0;
        /// Parity (of the low result byte)
        const PF = 1 << 2;
        /// Auxiliary carry (BCD)
        const AF = 1 << 4;
        /// Zero
        const ZF = 1 << 6;
        /// Sign
        const SF = 1 << 7;
        /// Trap (never acted on)
        const TF = 1 << 8;
        /// Interrupt enable (always set for user code)
        const IF = 1 << 9;
        /// Direction (string ops decrement when set)
        const DF = 1 << 10;
        /// Overflow
        const OF = 1 << 11;
    }
}

impl EFlags {
    /// Initial user-mode flags image: IF set, reserved bit 1 set.
    pub const INITIAL: u32 = 0x0000_0202;

    /// Pack into a PUSHFD image (reserved bit 1 forced on).
    pub fn to_pushed(self) -> u32 {
        self.bits() | 0x2
    }

    /// Unpack a POPFD image, keeping only modeled bits.
    pub fn from_popped(value: u32) -> Self {
        EFlags::from_bits_truncate(value) | EFlags::IF
    }
}

/// General-purpose register indices in ModR/M encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Reg {
    /// Decode a 3-bit register field.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 7 {
            0 => Reg::Eax,
            1 => Reg::Ecx,
            2 => Reg::Edx,
            3 => Reg::Ebx,
            4 => Reg::Esp,
            5 => Reg::Ebp,
            6 => Reg::Esi,
            _ => Reg::Edi,
        }
    }
}

/// Operand width selected by the opcode and the 0x66 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    /// Number of bytes.
    pub fn bytes(self) -> u32 {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
        }
    }

    /// Value mask at this width.
    pub fn mask(self) -> u32 {
        match self {
            Width::W8 => 0xFF,
            Width::W16 => 0xFFFF,
            Width::W32 => 0xFFFF_FFFF,
        }
    }

    /// Sign bit at this width.
    pub fn sign_bit(self) -> u32 {
        match self {
            Width::W8 => 0x80,
            Width::W16 => 0x8000,
            Width::W32 => 0x8000_0000,
        }
    }

    /// Bit count.
    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }
}

/// Architectural register file and flags.
#[derive(Debug, Clone)]
pub struct Cpu {
    /// EAX..EDI in encoding order.
    pub gpr: [u32; 8],
    /// Instruction pointer.
    pub eip: u32,
    /// Flags register.
    pub flags: EFlags,
}

impl Cpu {
    pub fn new() -> Self {
        Cpu {
            gpr: [0; 8],
            eip: 0,
            flags: EFlags::from_bits_truncate(EFlags::INITIAL),
        }
    }

    pub fn reg(&self, r: Reg) -> u32 {
        self.gpr[r as usize]
    }

    pub fn set_reg(&mut self, r: Reg, value: u32) {
        self.gpr[r as usize] = value;
    }

    /// Read a register at width; 8-bit indices 4..8 select AH/CH/DH/BH.
    pub fn reg_w(&self, index: u8, width: Width) -> u32 {
        let index = (index & 7) as usize;
        match width {
            Width::W32 => self.gpr[index],
            Width::W16 => self.gpr[index] & 0xFFFF,
            Width::W8 => {
                if index < 4 {
                    self.gpr[index] & 0xFF
                } else {
                    (self.gpr[index - 4] >> 8) & 0xFF
                }
            }
        }
    }

    /// Write a register at width, preserving the untouched high bits.
    pub fn set_reg_w(&mut self, index: u8, width: Width, value: u32) {
        let index = (index & 7) as usize;
        match width {
            Width::W32 => self.gpr[index] = value,
            Width::W16 => {
                self.gpr[index] = (self.gpr[index] & 0xFFFF_0000) | (value & 0xFFFF)
            }
            Width::W8 => {
                if index < 4 {
                    self.gpr[index] = (self.gpr[index] & 0xFFFF_FF00) | (value & 0xFF);
                } else {
                    self.gpr[index - 4] =
                        (self.gpr[index - 4] & 0xFFFF_00FF) | ((value & 0xFF) << 8);
                }
            }
        }
    }

    pub fn esp(&self) -> u32 {
        self.gpr[Reg::Esp as usize]
    }

    pub fn set_esp(&mut self, value: u32) {
        self.gpr[Reg::Esp as usize] = value;
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}
