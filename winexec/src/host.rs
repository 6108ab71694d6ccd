//! Host environment seam.
//!
//! The interpreter never talks to the outside world directly; every
//! observable effect funnels through [`HostEnv`]. On KikiOS the kernel
//! implements this over its console and cooperative scheduler; the hosted
//! CLI implements it over the process's standard streams. Tests use
//! [`BufferHost`] to capture guest output.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// Services the embedder provides to a session.
///
/// All methods take `&mut self`: a session owns its host exclusively for
/// its lifetime, and sinks are free to buffer internally.
pub trait HostEnv {
    /// Write bytes to the guest's standard output.
    fn stdout_write(&mut self, bytes: &[u8]);

    /// Write bytes to the guest's standard error. Fault diagnostics and
    /// loader errors also land here.
    fn stderr_write(&mut self, bytes: &[u8]);

    /// Non-blocking read of one byte of keyboard input.
    fn stdio_getc(&mut self) -> Option<u8>;

    /// Whether a key is buffered (used by polling guests).
    fn stdio_has_key(&mut self) -> bool;

    /// Whether the input source is exhausted for good. While this is
    /// false, a `None` from `stdio_getc` means "no key yet" and blocking
    /// shims keep yielding; a live console never reports EOF.
    fn stdio_eof(&mut self) -> bool {
        false
    }

    /// Sleep for at least `ms` milliseconds, yielding to the scheduler.
    fn sleep_ms(&mut self, ms: u32);

    /// Milliseconds since an arbitrary epoch (boot on KikiOS).
    fn uptime_ms(&mut self) -> u64;

    /// Cooperative yield point. The interpreter calls this every few
    /// thousand instructions and from blocking shims.
    fn yield_now(&mut self);

    /// Whether the host asked the session to stop. Checked at instruction
    /// boundaries; a pending request terminates the guest with exit 130.
    fn cancel_requested(&mut self) -> bool {
        false
    }
}

/// In-memory host: output captured into buffers, input scripted up front.
///
/// Intended for tests and for embedders that want to post-process guest
/// output (e.g. render it into a window) rather than stream it.
#[derive(Default)]
pub struct BufferHost {
    /// Everything the guest wrote to standard output.
    pub stdout: Vec<u8>,
    /// Everything the guest wrote to standard error.
    pub stderr: Vec<u8>,
    /// Pending keyboard input, consumed front to back.
    pub input: VecDeque<u8>,
    /// Virtual clock, advanced by `sleep_ms`.
    pub now_ms: u64,
    /// Number of yield points crossed.
    pub yields: u64,
    /// Set to terminate the guest at the next instruction boundary.
    pub cancel: bool,
}

impl BufferHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes as future keyboard input.
    pub fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }
}

impl HostEnv for BufferHost {
    fn stdout_write(&mut self, bytes: &[u8]) {
        self.stdout.extend_from_slice(bytes);
    }

    fn stderr_write(&mut self, bytes: &[u8]) {
        self.stderr.extend_from_slice(bytes);
    }

    fn stdio_getc(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    fn stdio_has_key(&mut self) -> bool {
        !self.input.is_empty()
    }

    // Scripted input: once drained it never refills.
    fn stdio_eof(&mut self) -> bool {
        self.input.is_empty()
    }

    fn sleep_ms(&mut self, ms: u32) {
        self.now_ms += ms as u64;
    }

    fn uptime_ms(&mut self) -> u64 {
        self.now_ms
    }

    fn yield_now(&mut self) {
        self.yields += 1;
    }

    fn cancel_requested(&mut self) -> bool {
        self.cancel
    }
}
