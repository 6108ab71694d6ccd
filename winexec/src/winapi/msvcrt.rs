//! C runtime exports. All cdecl; varargs read straight off the guest
//! stack. Covers the startup protocol (`__getmainargs` and the argc/argv
//! accessors), stream output with a small printf formatter, and the
//! allocator entry points over the heap band.

use super::{CallConv, ShimContext, ShimEntry};
use crate::x86::Fault;
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

pub static EXPORTS: &[ShimEntry] = &[
    ShimEntry {
        dll: "msvcrt",
        name: "printf",
        conv: CallConv::Cdecl,
        handler: printf,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "puts",
        conv: CallConv::Cdecl,
        handler: puts,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "putchar",
        conv: CallConv::Cdecl,
        handler: putchar,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "fputs",
        conv: CallConv::Cdecl,
        handler: fputs,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "fwrite",
        conv: CallConv::Cdecl,
        handler: fwrite,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "malloc",
        conv: CallConv::Cdecl,
        handler: malloc,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "calloc",
        conv: CallConv::Cdecl,
        handler: calloc,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "realloc",
        conv: CallConv::Cdecl,
        handler: realloc,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "free",
        conv: CallConv::Cdecl,
        handler: free,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "memcpy",
        conv: CallConv::Cdecl,
        handler: memcpy,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "memset",
        conv: CallConv::Cdecl,
        handler: memset,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "strlen",
        conv: CallConv::Cdecl,
        handler: strlen,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "strcpy",
        conv: CallConv::Cdecl,
        handler: strcpy,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "strcmp",
        conv: CallConv::Cdecl,
        handler: strcmp,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "exit",
        conv: CallConv::Cdecl,
        handler: exit,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "__getmainargs",
        conv: CallConv::Cdecl,
        handler: getmainargs,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "__p___argc",
        conv: CallConv::Cdecl,
        handler: p_argc,
    },
    ShimEntry {
        dll: "msvcrt",
        name: "__p___argv",
        conv: CallConv::Cdecl,
        handler: p_argv,
    },
];

// ==================== stream output ====================

fn printf(ctx: &mut ShimContext) -> Result<(), Fault> {
    let fmt_ptr = ctx.arg(0)?;
    let fmt = ctx.read_cstr(fmt_ptr)?;
    let out = format_args_from_stack(ctx, fmt.as_bytes(), 1)?;
    ctx.host.stdout_write(&out);
    ctx.ret(out.len() as u32);
    Ok(())
}

fn puts(ctx: &mut ShimContext) -> Result<(), Fault> {
    let s = ctx.read_cstr(ctx.arg(0)?)?;
    ctx.host.stdout_write(s.as_bytes());
    ctx.host.stdout_write(b"\n");
    ctx.ret(s.len() as u32 + 1);
    Ok(())
}

fn putchar(ctx: &mut ShimContext) -> Result<(), Fault> {
    let c = ctx.arg(0)?;
    ctx.host.stdout_write(&[c as u8]);
    ctx.ret(c & 0xFF);
    Ok(())
}

/// FILE* values are opaque to the guest and to us; stderr-looking ones
/// route to stderr, everything else to stdout.
fn is_stderr_stream(stream: u32) -> bool {
    stream == 2 || stream == super::kernel32::HANDLE_STDERR
}

fn fputs(ctx: &mut ShimContext) -> Result<(), Fault> {
    let s = ctx.read_cstr(ctx.arg(0)?)?;
    if is_stderr_stream(ctx.arg(1)?) {
        ctx.host.stderr_write(s.as_bytes());
    } else {
        ctx.host.stdout_write(s.as_bytes());
    }
    ctx.ret(0);
    Ok(())
}

fn fwrite(ctx: &mut ShimContext) -> Result<(), Fault> {
    let ptr = ctx.arg(0)?;
    let size = ctx.arg(1)?;
    let count = ctx.arg(2)?;
    let stream = ctx.arg(3)?;
    let total = size.saturating_mul(count);
    let bytes = ctx.read_bytes(ptr, total)?;
    if is_stderr_stream(stream) {
        ctx.host.stderr_write(&bytes);
    } else {
        ctx.host.stdout_write(&bytes);
    }
    ctx.ret(count);
    Ok(())
}

// ==================== allocator ====================

fn malloc(ctx: &mut ShimContext) -> Result<(), Fault> {
    let size = ctx.arg(0)?;
    let addr = ctx.proc.heap.alloc(size).unwrap_or(0);
    ctx.ret(addr);
    Ok(())
}

fn calloc(ctx: &mut ShimContext) -> Result<(), Fault> {
    let count = ctx.arg(0)?;
    let size = ctx.arg(1)?;
    let Some(total) = count.checked_mul(size) else {
        ctx.ret(0);
        return Ok(());
    };
    match ctx.proc.heap.alloc(total) {
        Some(addr) => {
            let zeroed = vec![0u8; total.max(1) as usize];
            ctx.write_bytes(addr, &zeroed)?;
            ctx.ret(addr);
        }
        None => ctx.ret(0),
    }
    Ok(())
}

fn realloc(ctx: &mut ShimContext) -> Result<(), Fault> {
    let old = ctx.arg(0)?;
    let size = ctx.arg(1)?;
    if old == 0 {
        let addr = ctx.proc.heap.alloc(size).unwrap_or(0);
        ctx.ret(addr);
        return Ok(());
    }
    if size == 0 {
        ctx.proc.heap.free(old);
        ctx.ret(0);
        return Ok(());
    }
    let Some(old_size) = ctx.proc.heap.size_of(old) else {
        ctx.ret(0);
        return Ok(());
    };
    match ctx.proc.heap.alloc(size) {
        Some(new) => {
            let data = ctx.read_bytes(old, old_size.min(size))?;
            ctx.write_bytes(new, &data)?;
            ctx.proc.heap.free(old);
            ctx.ret(new);
        }
        None => ctx.ret(0),
    }
    Ok(())
}

fn free(ctx: &mut ShimContext) -> Result<(), Fault> {
    let addr = ctx.arg(0)?;
    if addr != 0 {
        ctx.proc.heap.free(addr);
    }
    Ok(())
}

// ==================== string/memory ====================

fn memcpy(ctx: &mut ShimContext) -> Result<(), Fault> {
    let dst = ctx.arg(0)?;
    let src = ctx.arg(1)?;
    let n = ctx.arg(2)?;
    let data = ctx.read_bytes(src, n)?;
    ctx.write_bytes(dst, &data)?;
    ctx.ret(dst);
    Ok(())
}

fn memset(ctx: &mut ShimContext) -> Result<(), Fault> {
    let dst = ctx.arg(0)?;
    let fill = ctx.arg(1)? as u8;
    let n = ctx.arg(2)?;
    let data = vec![fill; n as usize];
    ctx.write_bytes(dst, &data)?;
    ctx.ret(dst);
    Ok(())
}

fn strlen(ctx: &mut ShimContext) -> Result<(), Fault> {
    let s = ctx.read_cstr(ctx.arg(0)?)?;
    ctx.ret(s.len() as u32);
    Ok(())
}

fn strcpy(ctx: &mut ShimContext) -> Result<(), Fault> {
    let dst = ctx.arg(0)?;
    let src = ctx.arg(1)?;
    let s = ctx.read_cstr(src)?;
    ctx.write_bytes(dst, s.as_bytes())?;
    ctx.write_bytes(dst + s.len() as u32, &[0])?;
    ctx.ret(dst);
    Ok(())
}

fn strcmp(ctx: &mut ShimContext) -> Result<(), Fault> {
    let a = ctx.read_cstr(ctx.arg(0)?)?;
    let b = ctx.read_cstr(ctx.arg(1)?)?;
    let r = match a.as_bytes().cmp(b.as_bytes()) {
        core::cmp::Ordering::Less => -1i32,
        core::cmp::Ordering::Equal => 0,
        core::cmp::Ordering::Greater => 1,
    };
    ctx.ret(r as u32);
    Ok(())
}

// ==================== process / startup ====================

fn exit(ctx: &mut ShimContext) -> Result<(), Fault> {
    let code = ctx.arg(0)?;
    log::debug!("exit({code})");
    ctx.proc.exit = Some(code);
    Ok(())
}

/// `__getmainargs(&argc, &argv, &env, doWildCard, startInfo)`: hand out
/// the argc/argv fabricated at session start and an empty environment.
fn getmainargs(ctx: &mut ShimContext) -> Result<(), Fault> {
    let argc_ptr = ctx.arg(0)?;
    let argv_ptr = ctx.arg(1)?;
    let env_ptr = ctx.arg(2)?;
    let (argc, argv, env_slot) = (ctx.proc.argc, ctx.proc.argv, ctx.proc.env_slot);
    ctx.out32(argc_ptr, argc)?;
    ctx.out32(argv_ptr, argv)?;
    ctx.out32(env_ptr, env_slot)?;
    ctx.ret(0);
    Ok(())
}

fn p_argc(ctx: &mut ShimContext) -> Result<(), Fault> {
    let slot = ctx.proc.argc_slot;
    ctx.ret(slot);
    Ok(())
}

fn p_argv(ctx: &mut ShimContext) -> Result<(), Fault> {
    let slot = ctx.proc.argv_slot;
    ctx.ret(slot);
    Ok(())
}

// ==================== printf engine ====================

/// Expand a printf format using varargs from the guest stack, starting
/// at cdecl argument index `first`. Supported conversions:
/// `%c %s %d %i %u %x %X %p %%` with optional `-`/`0` flags and a
/// decimal field width; `l`/`h` length modifiers are accepted and
/// ignored (all integer varargs are 32-bit).
fn format_args_from_stack(
    ctx: &mut ShimContext,
    fmt: &[u8],
    first: u32,
) -> Result<Vec<u8>, Fault> {
    let mut out = Vec::with_capacity(fmt.len());
    let mut arg_index = first;
    let mut i = 0usize;

    while i < fmt.len() {
        let c = fmt[i];
        if c != b'%' {
            out.push(c);
            i += 1;
            continue;
        }
        i += 1;
        if i >= fmt.len() {
            out.push(b'%');
            break;
        }

        let mut left_align = false;
        let mut zero_pad = false;
        loop {
            match fmt.get(i) {
                Some(b'-') => {
                    left_align = true;
                    i += 1;
                }
                Some(b'0') => {
                    zero_pad = true;
                    i += 1;
                }
                _ => break,
            }
        }
        let mut width = 0usize;
        while let Some(d @ b'0'..=b'9') = fmt.get(i) {
            width = width * 10 + (d - b'0') as usize;
            i += 1;
        }
        while matches!(fmt.get(i), Some(b'l') | Some(b'h')) {
            i += 1;
        }

        let Some(&spec) = fmt.get(i) else {
            out.push(b'%');
            break;
        };
        i += 1;

        let mut next_arg = |ctx: &ShimContext| -> Result<u32, Fault> {
            let v = ctx.arg(arg_index)?;
            arg_index += 1;
            Ok(v)
        };

        let rendered: String = match spec {
            b'%' => {
                out.push(b'%');
                continue;
            }
            b'c' => {
                let v = next_arg(ctx)? as u8;
                String::from_utf8_lossy(&[v]).into_owned()
            }
            b's' => {
                let ptr = next_arg(ctx)?;
                if ptr == 0 {
                    String::from("(null)")
                } else {
                    ctx.read_cstr(ptr)?
                }
            }
            b'd' | b'i' => {
                let v = next_arg(ctx)? as i32;
                format!("{v}")
            }
            b'u' => {
                let v = next_arg(ctx)?;
                format!("{v}")
            }
            b'x' => {
                let v = next_arg(ctx)?;
                format!("{v:x}")
            }
            b'X' => {
                let v = next_arg(ctx)?;
                format!("{v:X}")
            }
            b'p' => {
                let v = next_arg(ctx)?;
                format!("{v:08X}")
            }
            other => {
                // Unknown conversion: emit it verbatim, eat no argument.
                out.push(b'%');
                out.push(other);
                continue;
            }
        };

        let pad = width.saturating_sub(rendered.len());
        if pad > 0 && !left_align {
            let numeric = matches!(spec, b'd' | b'i' | b'u' | b'x' | b'X' | b'p');
            let fill = if zero_pad && numeric { b'0' } else { b' ' };
            // Zero-padding a negative number keeps the sign in front.
            if fill == b'0' && rendered.starts_with('-') {
                out.push(b'-');
                out.extend(core::iter::repeat(b'0').take(pad));
                out.extend_from_slice(&rendered.as_bytes()[1..]);
                continue;
            }
            out.extend(core::iter::repeat(fill).take(pad));
        }
        out.extend_from_slice(rendered.as_bytes());
        if pad > 0 && left_align {
            out.extend(core::iter::repeat(b' ').take(pad));
        }
    }

    Ok(out)
}
