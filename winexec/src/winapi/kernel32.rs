//! kernel32 exports: console I/O, process exit, heap and virtual memory,
//! error state, and timing. All stdcall.

use super::{CallConv, ShimContext, ShimEntry};
use crate::x86::Fault;
use alloc::vec;

/// `GetStdHandle` argument values.
pub const STD_INPUT_HANDLE: u32 = -10i32 as u32;
pub const STD_OUTPUT_HANDLE: u32 = -11i32 as u32;
pub const STD_ERROR_HANDLE: u32 = -12i32 as u32;

/// Pseudo-handles returned for the three standard streams.
pub const HANDLE_STDIN: u32 = 0x100;
pub const HANDLE_STDOUT: u32 = 0x101;
pub const HANDLE_STDERR: u32 = 0x102;

pub const INVALID_HANDLE_VALUE: u32 = 0xFFFF_FFFF;

/// Handle value returned by `GetProcessHeap`.
pub const PROCESS_HEAP_HANDLE: u32 = 1;

pub const ERROR_INVALID_HANDLE: u32 = 6;
pub const ERROR_NOT_ENOUGH_MEMORY: u32 = 8;
pub const ERROR_INVALID_PARAMETER: u32 = 87;

/// `HeapAlloc` flag: zero the returned block.
const HEAP_ZERO_MEMORY: u32 = 0x0000_0008;

pub static EXPORTS: &[ShimEntry] = &[
    ShimEntry {
        dll: "kernel32",
        name: "GetStdHandle",
        conv: CallConv::Stdcall(1),
        handler: get_std_handle,
    },
    ShimEntry {
        dll: "kernel32",
        name: "WriteFile",
        conv: CallConv::Stdcall(5),
        handler: write_file,
    },
    ShimEntry {
        dll: "kernel32",
        name: "WriteConsoleA",
        conv: CallConv::Stdcall(5),
        handler: write_file, // identical shape for console handles
    },
    ShimEntry {
        dll: "kernel32",
        name: "ReadFile",
        conv: CallConv::Stdcall(5),
        handler: read_file,
    },
    ShimEntry {
        dll: "kernel32",
        name: "ReadConsoleA",
        conv: CallConv::Stdcall(5),
        handler: read_file,
    },
    ShimEntry {
        dll: "kernel32",
        name: "ExitProcess",
        conv: CallConv::Stdcall(1),
        handler: exit_process,
    },
    ShimEntry {
        dll: "kernel32",
        name: "GetCommandLineA",
        conv: CallConv::Stdcall(0),
        handler: get_command_line,
    },
    ShimEntry {
        dll: "kernel32",
        name: "GetLastError",
        conv: CallConv::Stdcall(0),
        handler: get_last_error,
    },
    ShimEntry {
        dll: "kernel32",
        name: "SetLastError",
        conv: CallConv::Stdcall(1),
        handler: set_last_error,
    },
    ShimEntry {
        dll: "kernel32",
        name: "GetProcessHeap",
        conv: CallConv::Stdcall(0),
        handler: get_process_heap,
    },
    ShimEntry {
        dll: "kernel32",
        name: "HeapAlloc",
        conv: CallConv::Stdcall(3),
        handler: heap_alloc,
    },
    ShimEntry {
        dll: "kernel32",
        name: "HeapFree",
        conv: CallConv::Stdcall(3),
        handler: heap_free,
    },
    ShimEntry {
        dll: "kernel32",
        name: "VirtualAlloc",
        conv: CallConv::Stdcall(4),
        handler: virtual_alloc,
    },
    ShimEntry {
        dll: "kernel32",
        name: "VirtualFree",
        conv: CallConv::Stdcall(3),
        handler: virtual_free,
    },
    ShimEntry {
        dll: "kernel32",
        name: "GetTickCount",
        conv: CallConv::Stdcall(0),
        handler: get_tick_count,
    },
    ShimEntry {
        dll: "kernel32",
        name: "Sleep",
        conv: CallConv::Stdcall(1),
        handler: sleep,
    },
];

fn get_std_handle(ctx: &mut ShimContext) -> Result<(), Fault> {
    let which = ctx.arg(0)?;
    let handle = match which {
        STD_INPUT_HANDLE => HANDLE_STDIN,
        STD_OUTPUT_HANDLE => HANDLE_STDOUT,
        STD_ERROR_HANDLE => HANDLE_STDERR,
        _ => {
            ctx.proc.last_error = ERROR_INVALID_PARAMETER;
            ctx.ret(INVALID_HANDLE_VALUE);
            return Ok(());
        }
    };
    ctx.ret(handle);
    Ok(())
}

fn write_file(ctx: &mut ShimContext) -> Result<(), Fault> {
    let handle = ctx.arg(0)?;
    let buf = ctx.arg(1)?;
    let len = ctx.arg(2)?;
    let written_ptr = ctx.arg(3)?;

    if handle != HANDLE_STDOUT && handle != HANDLE_STDERR {
        ctx.proc.last_error = ERROR_INVALID_HANDLE;
        ctx.ret(0);
        return Ok(());
    }
    let bytes = ctx.read_bytes(buf, len)?;
    if handle == HANDLE_STDERR {
        ctx.host.stderr_write(&bytes);
    } else {
        ctx.host.stdout_write(&bytes);
    }
    ctx.out32(written_ptr, len)?;
    ctx.ret(1);
    Ok(())
}

/// Read up to `len` bytes, stopping at a newline (console line mode).
/// CR is normalized to LF. A drained input source reads as EOF.
fn read_file(ctx: &mut ShimContext) -> Result<(), Fault> {
    let handle = ctx.arg(0)?;
    let buf = ctx.arg(1)?;
    let len = ctx.arg(2)?;
    let read_ptr = ctx.arg(3)?;

    if handle != HANDLE_STDIN {
        ctx.proc.last_error = ERROR_INVALID_HANDLE;
        ctx.ret(0);
        return Ok(());
    }

    let mut count = 0u32;
    'line: while count < len {
        // Block until a key arrives; a momentarily empty queue is not EOF.
        let byte = loop {
            if let Some(b) = ctx.host.stdio_getc() {
                break b;
            }
            if ctx.host.cancel_requested() {
                return Err(Fault::Cancelled);
            }
            if ctx.host.stdio_eof() {
                break 'line;
            }
            ctx.host.yield_now();
        };
        let byte = if byte == b'\r' { b'\n' } else { byte };
        ctx.write_bytes(buf + count, &[byte])?;
        count += 1;
        if byte == b'\n' {
            break;
        }
    }
    ctx.out32(read_ptr, count)?;
    ctx.ret(1);
    Ok(())
}

fn exit_process(ctx: &mut ShimContext) -> Result<(), Fault> {
    let code = ctx.arg(0)?;
    log::debug!("ExitProcess({code})");
    ctx.proc.exit = Some(code);
    ctx.ret(code);
    Ok(())
}

fn get_command_line(ctx: &mut ShimContext) -> Result<(), Fault> {
    let cmdline = ctx.proc.cmdline;
    ctx.ret(cmdline);
    Ok(())
}

fn get_last_error(ctx: &mut ShimContext) -> Result<(), Fault> {
    let e = ctx.proc.last_error;
    ctx.ret(e);
    Ok(())
}

fn set_last_error(ctx: &mut ShimContext) -> Result<(), Fault> {
    ctx.proc.last_error = ctx.arg(0)?;
    Ok(())
}

fn get_process_heap(ctx: &mut ShimContext) -> Result<(), Fault> {
    ctx.ret(PROCESS_HEAP_HANDLE);
    Ok(())
}

fn heap_alloc(ctx: &mut ShimContext) -> Result<(), Fault> {
    let flags = ctx.arg(1)?;
    let size = ctx.arg(2)?;
    match ctx.proc.heap.alloc(size) {
        Some(addr) => {
            if flags & HEAP_ZERO_MEMORY != 0 {
                let zeroed = vec![0u8; size.max(1) as usize];
                ctx.write_bytes(addr, &zeroed)?;
            }
            ctx.ret(addr);
        }
        None => {
            ctx.proc.last_error = ERROR_NOT_ENOUGH_MEMORY;
            ctx.ret(0);
        }
    }
    Ok(())
}

fn heap_free(ctx: &mut ShimContext) -> Result<(), Fault> {
    let addr = ctx.arg(2)?;
    let ok = ctx.proc.heap.free(addr);
    if !ok {
        ctx.proc.last_error = ERROR_INVALID_PARAMETER;
    }
    ctx.ret(ok as u32);
    Ok(())
}

fn virtual_alloc(ctx: &mut ShimContext) -> Result<(), Fault> {
    let size = ctx.arg(1)?;
    // Fixed-address requests are not honored; the band allocator picks.
    match ctx.proc.heap.alloc_aligned(size, 0x1000) {
        Some(addr) => ctx.ret(addr),
        None => {
            ctx.proc.last_error = ERROR_NOT_ENOUGH_MEMORY;
            ctx.ret(0);
        }
    }
    Ok(())
}

fn virtual_free(ctx: &mut ShimContext) -> Result<(), Fault> {
    let addr = ctx.arg(0)?;
    let ok = ctx.proc.heap.free(addr);
    ctx.ret(ok as u32);
    Ok(())
}

fn get_tick_count(ctx: &mut ShimContext) -> Result<(), Fault> {
    let ms = ctx.host.uptime_ms() as u32;
    ctx.ret(ms);
    Ok(())
}

fn sleep(ctx: &mut ShimContext) -> Result<(), Fault> {
    let ms = ctx.arg(0)?;
    ctx.host.sleep_ms(ms);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostEnv;
    use crate::x86::exec::ProcessState;
    use crate::x86::{AddressSpace, Cpu, Reg};
    use crate::STACK_TOP;
    use alloc::collections::VecDeque;
    use alloc::vec;

    /// Keyboard that only starts delivering after a few yields, the way a
    /// real console sits empty between keystrokes.
    struct SlowKeyHost {
        input: VecDeque<u8>,
        ready_after: u64,
        yields: u64,
    }

    impl SlowKeyHost {
        fn new(line: &[u8], ready_after: u64) -> Self {
            SlowKeyHost {
                input: line.iter().copied().collect(),
                ready_after,
                yields: 0,
            }
        }

        fn ready(&self) -> bool {
            self.yields >= self.ready_after
        }
    }

    impl HostEnv for SlowKeyHost {
        fn stdout_write(&mut self, _bytes: &[u8]) {}
        fn stderr_write(&mut self, _bytes: &[u8]) {}

        fn stdio_getc(&mut self) -> Option<u8> {
            if self.ready() {
                self.input.pop_front()
            } else {
                None
            }
        }

        fn stdio_has_key(&mut self) -> bool {
            self.ready() && !self.input.is_empty()
        }

        fn stdio_eof(&mut self) -> bool {
            self.ready() && self.input.is_empty()
        }

        fn sleep_ms(&mut self, _ms: u32) {}

        fn uptime_ms(&mut self) -> u64 {
            0
        }

        fn yield_now(&mut self) {
            self.yields += 1;
        }
    }

    const BUF: u32 = 0x0040_0800;
    const READ_PTR: u32 = 0x0040_0900;

    /// Stack layout for a stdcall ReadFile(handle, buf, len, read_ptr, 0).
    fn read_call<'a>(
        cpu: &'a mut Cpu,
        mem: &'a mut AddressSpace,
        proc: &'a mut ProcessState,
        host: &'a mut SlowKeyHost,
    ) -> ShimContext<'a> {
        let esp = STACK_TOP - 0x100;
        let args = [HANDLE_STDIN, BUF, 64, READ_PTR, 0];
        for (i, a) in args.iter().enumerate() {
            mem.write32(esp + 4 + 4 * i as u32, *a).unwrap();
        }
        mem.write32(esp, 0xDEAD_0000).unwrap(); // return address
        cpu.set_esp(esp);
        ShimContext {
            cpu,
            mem,
            proc,
            host,
        }
    }

    #[test]
    fn read_file_blocks_until_input_arrives() {
        let mut cpu = Cpu::new();
        let mut mem = AddressSpace::new(0x0040_0000, vec![0u8; 0x1000]);
        let mut proc = ProcessState::new();
        let mut host = SlowKeyHost::new(b"hi\n", 3);
        let mut ctx = read_call(&mut cpu, &mut mem, &mut proc, &mut host);
        read_file(&mut ctx).unwrap();
        drop(ctx);
        assert!(host.yields >= 3);
        assert_eq!(mem.read_block(BUF, 3).unwrap(), b"hi\n");
        assert_eq!(mem.read32(READ_PTR).unwrap(), 3);
        assert_eq!(cpu.reg(Reg::Eax), 1);
    }

    #[test]
    fn read_file_sees_eof_on_exhausted_input() {
        let mut cpu = Cpu::new();
        let mut mem = AddressSpace::new(0x0040_0000, vec![0u8; 0x1000]);
        let mut proc = ProcessState::new();
        let mut host = SlowKeyHost::new(b"", 0);
        let mut ctx = read_call(&mut cpu, &mut mem, &mut proc, &mut host);
        read_file(&mut ctx).unwrap();
        drop(ctx);
        assert_eq!(mem.read32(READ_PTR).unwrap(), 0);
        assert_eq!(cpu.reg(Reg::Eax), 1);
    }
}
