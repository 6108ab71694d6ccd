//! user32 exports. Console sessions have no windowing; `MessageBoxA`
//! renders its caption and text onto the stderr sink and reports OK.

use super::{CallConv, ShimContext, ShimEntry};
use crate::x86::Fault;
use alloc::format;

/// `MessageBoxA` return value for the OK button.
const IDOK: u32 = 1;

pub static EXPORTS: &[ShimEntry] = &[ShimEntry {
    dll: "user32",
    name: "MessageBoxA",
    conv: CallConv::Stdcall(4),
    handler: message_box,
}];

fn message_box(ctx: &mut ShimContext) -> Result<(), Fault> {
    let text_ptr = ctx.arg(1)?;
    let caption_ptr = ctx.arg(2)?;
    let text = if text_ptr != 0 {
        ctx.read_cstr(text_ptr)?
    } else {
        Default::default()
    };
    let caption = if caption_ptr != 0 {
        ctx.read_cstr(caption_ptr)?
    } else {
        Default::default()
    };
    let rendered = format!("[{caption}] {text}\n");
    ctx.host.stderr_write(rendered.as_bytes());
    ctx.ret(IDOK);
    Ok(())
}
