//! Session Orchestration
//!
//! One session per launch: parse, map, bind, fabricate the initial
//! `main` frame, interpret until the guest stops, map the outcome to a
//! shell-style exit status. Everything the guest touched (image copy,
//! stack, heap band) is owned by the session and freed when it returns,
//! whether or not the guest cleaned up after itself.

use crate::host::HostEnv;
use crate::ldr::{self, GuestImage, LoadError};
use crate::pe::{self, PeError};
use crate::winapi;
use crate::x86::decode::dump_registers;
use crate::x86::exec::DEFAULT_INSN_BUDGET;
use crate::x86::{Fault, Machine, Reg, RunExit};
use crate::{DEFAULT_LOAD_BASE, STACK_SIZE, STACK_TOP, TERMINATE_TOKEN};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use thiserror::Error;

/// Failures before the guest ever runs. The embedder reports these and
/// exits with the load-failure status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Pe(#[from] PeError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("failed to stage process arguments")]
    ArgSetup,
}

/// Per-launch knobs. `Default` is right for normal use.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Force a load base (testing rebase paths). `None` follows the
    /// image's preferred base when usable.
    pub base: Option<u32>,
    /// Override the runaway-guest instruction ceiling.
    pub insn_budget: Option<u64>,
}

/// Pick the load base: the preferred base when it keeps the whole image
/// inside the low user range, otherwise the conventional default.
fn choose_base(pe: &pe::PeImage, opts: &LoadOptions) -> u32 {
    if let Some(base) = opts.base {
        return base;
    }
    let preferred = pe.preferred_base;
    let fits = preferred >= 0x0001_0000
        && preferred
            .checked_add(pe.size_of_image)
            .is_some_and(|end| end <= STACK_TOP - STACK_SIZE);
    if fits {
        preferred
    } else {
        DEFAULT_LOAD_BASE
    }
}

/// Load and run a PE32 console executable to completion.
///
/// `args[0]` is the program name; the rest become guest `argv` entries.
/// On a pre-run failure the error is returned; once the guest starts,
/// every outcome (including faults) is an exit status, with fault
/// diagnostics rendered onto the host's stderr sink.
pub fn run(
    bytes: &[u8],
    args: &[&str],
    opts: &LoadOptions,
    host: &mut dyn HostEnv,
) -> Result<i32, SessionError> {
    let image = pe::parse(bytes)?;
    let base = choose_base(&image, opts);
    let guest = ldr::load(&image, bytes, base)?;

    let shims: Vec<_> = guest
        .bindings
        .iter()
        .map(|b| {
            let shim = winapi::resolve(&b.dll, &b.symbol);
            if shim.is_none() {
                log::warn!("unresolved import {} (fails only if called)", b.display());
            }
            shim
        })
        .collect();

    let GuestImage {
        base,
        memory,
        entry,
        bindings,
    } = guest;

    let mut machine = Machine::new(base, memory, host);
    machine.bindings = bindings;
    machine.shims = shims;
    if let Some(budget) = opts.insn_budget {
        machine.insn_budget = budget;
    }

    stage_arguments(&mut machine, args)?;
    machine.cpu.eip = entry;
    log::info!("starting guest at {entry:#010x}");

    match machine.run() {
        Ok(RunExit::Returned(eax)) => Ok(eax as i32),
        Ok(RunExit::Exited(code)) => Ok(code as i32),
        Err(fault) => {
            let report = format!("winexec: {fault}\n{}\n", dump_registers(&machine.cpu));
            machine.host.stderr_write(report.as_bytes());
            log::error!("guest fault: {fault}");
            Ok(fault.exit_code())
        }
    }
}

/// Build the command line, argv block, and CRT slots in the heap band,
/// then lay down the initial frame: argc/argv as `main` arguments and
/// the terminate token as the return address.
fn stage_arguments(machine: &mut Machine<'_>, args: &[&str]) -> Result<(), SessionError> {
    let argc = args.len() as u32;

    // Each argument as a NUL-terminated string.
    let mut arg_ptrs = Vec::with_capacity(args.len());
    for arg in args {
        let addr = machine
            .proc
            .heap
            .alloc(arg.len() as u32 + 1)
            .ok_or(SessionError::ArgSetup)?;
        machine
            .mem
            .write_block(addr, arg.as_bytes())
            .map_err(|_| SessionError::ArgSetup)?;
        machine
            .mem
            .write8(addr + arg.len() as u32, 0)
            .map_err(|_| SessionError::ArgSetup)?;
        arg_ptrs.push(addr);
    }

    // argv array, NULL-terminated.
    let argv = machine
        .proc
        .heap
        .alloc((argc + 1) * 4)
        .ok_or(SessionError::ArgSetup)?;
    for (i, ptr) in arg_ptrs.iter().enumerate() {
        machine
            .mem
            .write32(argv + 4 * i as u32, *ptr)
            .map_err(|_| SessionError::ArgSetup)?;
    }
    machine
        .mem
        .write32(argv + 4 * argc, 0)
        .map_err(|_| SessionError::ArgSetup)?;

    // Flat command line for GetCommandLineA.
    let cmdline_text: String = args.join(" ");
    let cmdline = machine
        .proc
        .heap
        .alloc(cmdline_text.len() as u32 + 1)
        .ok_or(SessionError::ArgSetup)?;
    machine
        .mem
        .write_block(cmdline, cmdline_text.as_bytes())
        .map_err(|_| SessionError::ArgSetup)?;
    machine
        .mem
        .write8(cmdline + cmdline_text.len() as u32, 0)
        .map_err(|_| SessionError::ArgSetup)?;

    // CRT accessor slots: argc, argv, and an empty environment array.
    let slots = machine.proc.heap.alloc(12).ok_or(SessionError::ArgSetup)?;
    machine
        .mem
        .write32(slots, argc)
        .map_err(|_| SessionError::ArgSetup)?;
    machine
        .mem
        .write32(slots + 4, argv)
        .map_err(|_| SessionError::ArgSetup)?;
    machine
        .mem
        .write32(slots + 8, 0)
        .map_err(|_| SessionError::ArgSetup)?;

    machine.proc.argc = argc;
    machine.proc.argv = argv;
    machine.proc.cmdline = cmdline;
    machine.proc.argc_slot = slots;
    machine.proc.argv_slot = slots + 4;
    machine.proc.env_slot = slots + 8;

    // Initial frame: main(argc, argv) with the terminate token as the
    // return address. EBP = 0 terminates frame walks.
    machine.cpu.set_esp(STACK_TOP - 16);
    machine.push(argv).map_err(|_| SessionError::ArgSetup)?;
    machine.push(argc).map_err(|_| SessionError::ArgSetup)?;
    machine
        .push(TERMINATE_TOKEN)
        .map_err(|_| SessionError::ArgSetup)?;
    machine.cpu.set_reg(Reg::Ebp, 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pe_with_base(preferred: u32, size: u32) -> pe::PeImage {
        pe::PeImage {
            machine: pe::machine_type::IMAGE_FILE_MACHINE_I386,
            subsystem: pe::subsystem::IMAGE_SUBSYSTEM_WINDOWS_CUI,
            is_dll: false,
            preferred_base: preferred,
            entry_rva: 0x1000,
            section_alignment: 0x1000,
            file_alignment: 0x200,
            size_of_image: size,
            size_of_headers: 0x200,
            relocs_stripped: false,
            data_directories: Default::default(),
            sections: Vec::new(),
            imports: Vec::new(),
            relocations: Vec::new(),
        }
    }

    #[test]
    fn preferred_base_used_when_sane() {
        let pe = pe_with_base(0x0040_0000, 0x4000);
        assert_eq!(choose_base(&pe, &LoadOptions::default()), 0x0040_0000);
    }

    #[test]
    fn degenerate_bases_fall_back() {
        let pe = pe_with_base(0, 0x4000);
        assert_eq!(choose_base(&pe, &LoadOptions::default()), DEFAULT_LOAD_BASE);
        let pe = pe_with_base(0xFFFF_0000, 0x4000);
        assert_eq!(choose_base(&pe, &LoadOptions::default()), DEFAULT_LOAD_BASE);
    }

    #[test]
    fn explicit_base_wins() {
        let pe = pe_with_base(0x0040_0000, 0x4000);
        let opts = LoadOptions {
            base: Some(0x0100_0000),
            ..Default::default()
        };
        assert_eq!(choose_base(&pe, &opts), 0x0100_0000);
    }
}
