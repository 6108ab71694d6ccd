//! KikiOS Windows Executable Support
//!
//! Loads 32-bit Windows PE console executables and runs them on a
//! non-x86 host by interpretation. The pipeline:
//!
//! ```text
//! .exe bytes            Guest address space           Host
//! ┌────────────┐        ┌──────────────────┐          ┌─────────────┐
//! │ DOS/PE     │ parse  │ image  @ base    │   run    │ stdio sinks │
//! │ headers    │ ─────► │ stack  @ 7FFx    │ ───────► │ clock/yield │
//! │ sections   │  map   │ heap   @ 9000    │  shims   │ scheduler   │
//! │ imports    │ reloc  │ thunks @ FFxx    │ ◄──────  │             │
//! │ relocs     │ bind   │                  │          │             │
//! └────────────┘        └──────────────────┘          └─────────────┘
//! ```
//!
//! - **pe** - PE32 format definitions and the image parser
//! - **ldr** - section mapper, base relocator, import binder
//! - **x86** - i386 register/flags/memory model and the interpreter
//! - **winapi** - kernel32/user32/msvcrt shims with calling conventions
//! - **session** - one-shot launch orchestration and exit-code mapping
//! - **host** - the environment trait the embedder provides
//!
//! Only I386 machine / console subsystem images are accepted. Execution
//! is strictly single-threaded and cooperative: the interpreter calls the
//! host's yield hook at instruction-count boundaries and never blocks
//! outside a shim.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod host;
pub mod ldr;
pub mod pe;
pub mod session;
pub mod winapi;
pub mod x86;

pub use host::HostEnv;
pub use session::{run, LoadOptions, SessionError};

/// Exit status when the image cannot be parsed or mapped.
pub const EXIT_LOAD_FAILURE: i32 = 126;
/// Exit status when the guest calls through a missing-symbol thunk.
pub const EXIT_MISSING_SHIM: i32 = 127;
/// Exit status when the host requested cancellation.
pub const EXIT_CANCELLED: i32 = 130;
/// Exit status for an undecodable or unimplemented instruction.
pub const EXIT_BAD_OPCODE: i32 = 134;
/// Exit status for integer division faults.
pub const EXIT_DIVIDE: i32 = 136;
/// Exit status for guest memory access violations.
pub const EXIT_SEGV: i32 = 139;

/// First value of the reserved thunk-token band. Every IAT slot is bound
/// to a value in `THUNK_BASE..TERMINATE_TOKEN`; the band never overlaps
/// the image, stack, or heap regions.
pub const THUNK_BASE: u32 = 0xFF00_0000;

/// Sentinel return address pushed under the initial frame. Reaching it
/// via RET ends the session with EAX as the exit code.
pub const TERMINATE_TOKEN: u32 = 0xFFFF_FFF0;

/// Guest address one past the top of the stack region.
pub const STACK_TOP: u32 = 0x7FFF_0000;
/// Guest stack size (grows down from [`STACK_TOP`]).
pub const STACK_SIZE: u32 = 256 * 1024;

/// Base of the host-owned heap band serving `malloc`/`HeapAlloc`.
pub const HEAP_BASE: u32 = 0x9000_0000;
/// Capacity of the heap band.
pub const HEAP_SIZE: u32 = 8 * 1024 * 1024;

/// Load base used when the image's preferred base is unusable.
pub const DEFAULT_LOAD_BASE: u32 = 0x0040_0000;
