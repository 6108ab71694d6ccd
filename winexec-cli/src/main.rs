//! Hosted `winexec` launcher.
//!
//! Thin std wrapper over the winexec library: argument handling, file
//! pre-checks, a host environment over the process's standard streams,
//! and exit-status plumbing. The guest's stdout/stderr go straight to
//! ours; diagnostics and the exit trailer go to stderr only.

use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process;
use std::time::Instant;

use winexec::{HostEnv, LoadOptions, EXIT_LOAD_FAILURE};

const EXIT_USAGE: i32 = 2;

fn main() {
    init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: winexec <program.exe> [args...]");
        process::exit(EXIT_USAGE);
    }
    let path = &args[1];

    if !path.to_ascii_lowercase().ends_with(".exe") {
        eprintln!("winexec: warning: '{path}' does not end in .exe");
    }

    let bytes = match read_image(path) {
        Ok(bytes) => bytes,
        Err(message) => {
            eprintln!("winexec: {message}");
            process::exit(EXIT_LOAD_FAILURE);
        }
    };

    let guest_args: Vec<&str> = args[1..].iter().map(String::as_str).collect();
    let mut host = StdHost::new();

    let code = match winexec::run(&bytes, &guest_args, &LoadOptions::default(), &mut host) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("winexec: {path}: {error}");
            process::exit(EXIT_LOAD_FAILURE);
        }
    };

    eprintln!("winexec: '{path}' exited with code {code}");
    process::exit(code);
}

/// Open and pre-check the image file before the parser sees it.
fn read_image(path: &str) -> Result<Vec<u8>, String> {
    let p = Path::new(path);
    if p.is_dir() {
        return Err(format!("'{path}' is a directory"));
    }
    let bytes = fs::read(p).map_err(|e| format!("cannot open '{path}': {e}"))?;
    if bytes.len() < 64 {
        return Err(format!("'{path}' is too small to be an executable"));
    }
    if bytes[0] != b'M' || bytes[1] != b'Z' {
        return Err(format!("'{path}' has no MZ header"));
    }
    Ok(bytes)
}

/// Host environment over the standard streams and the wall clock.
struct StdHost {
    start: Instant,
    /// One byte of lookahead so `stdio_has_key` can answer truthfully.
    pending: Option<u8>,
    eof: bool,
}

impl StdHost {
    fn new() -> Self {
        StdHost {
            start: Instant::now(),
            pending: None,
            eof: false,
        }
    }

    fn fill(&mut self) {
        if self.pending.is_some() || self.eof {
            return;
        }
        let mut byte = [0u8; 1];
        match io::stdin().lock().read(&mut byte) {
            Ok(1) => self.pending = Some(byte[0]),
            _ => self.eof = true,
        }
    }
}

impl HostEnv for StdHost {
    fn stdout_write(&mut self, bytes: &[u8]) {
        let mut out = io::stdout().lock();
        let _ = out.write_all(bytes);
        let _ = out.flush();
    }

    fn stderr_write(&mut self, bytes: &[u8]) {
        let mut err = io::stderr().lock();
        let _ = err.write_all(bytes);
        let _ = err.flush();
    }

    fn stdio_getc(&mut self) -> Option<u8> {
        self.fill();
        self.pending.take()
    }

    fn stdio_has_key(&mut self) -> bool {
        self.fill();
        self.pending.is_some()
    }

    fn stdio_eof(&mut self) -> bool {
        self.fill();
        self.pending.is_none() && self.eof
    }

    fn sleep_ms(&mut self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    }

    fn uptime_ms(&mut self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn yield_now(&mut self) {
        std::thread::yield_now();
    }
}

/// Minimal stderr logger behind the `log` facade. Level comes from
/// `WINEXEC_LOG` (error/warn/info/debug/trace); default is warn.
struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

fn init_logging() {
    let level = match env::var("WINEXEC_LOG").as_deref() {
        Ok("error") => log::LevelFilter::Error,
        Ok("info") => log::LevelFilter::Info,
        Ok("debug") => log::LevelFilter::Debug,
        Ok("trace") => log::LevelFilter::Trace,
        _ => log::LevelFilter::Warn,
    };
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
