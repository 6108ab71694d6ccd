//! End-to-end tests: assemble small PE32 console images in memory and
//! run them through the full parse/map/bind/interpret pipeline.
//!
//! Fixed image layout produced by [`TestImage`]:
//!
//! ```text
//! RVA 0x0000  headers (0x200 in file)
//! RVA 0x1000  .text   entry point, hand-assembled code
//! RVA 0x2000  .data   import descriptors
//! RVA 0x2100  .data   IAT slots, packed per DLL with a NULL terminator
//! RVA 0x2180  .data   import lookup tables
//! RVA 0x2200  .data   DLL names and hint/name entries
//! RVA 0x2400  .data   test payload bytes
//! RVA 0x2800  .data   base relocation blocks
//! ```
//!
//! The first imported symbol's IAT slot is always at RVA 0x2100; each
//! DLL contributes its slot count plus one terminator slot.

use winexec::host::BufferHost;
use winexec::{LoadOptions, EXIT_DIVIDE, EXIT_MISSING_SHIM, EXIT_SEGV};

const BASE: u32 = 0x0040_0000;
const TEXT_RVA: u32 = 0x1000;
const DATA_RVA: u32 = 0x2000;
const IAT_RVA: u32 = 0x2100;
const PAYLOAD_RVA: u32 = 0x2400;
const RELOC_RVA: u32 = 0x2800;

#[derive(Default)]
struct TestImage {
    code: Vec<u8>,
    payload: Vec<u8>,
    imports: Vec<(&'static str, Vec<&'static str>)>,
    reloc_rvas: Vec<u32>,
}

impl TestImage {
    fn build(&self) -> Vec<u8> {
        let mut file = vec![0u8; 0x2200];

        // DOS header
        file[0] = b'M';
        file[1] = b'Z';
        put32(&mut file, 0x3C, 0x80);

        // NT signature + COFF header
        put32(&mut file, 0x80, 0x0000_4550);
        put16(&mut file, 0x84, 0x014C); // i386
        put16(&mut file, 0x86, 2); // sections
        put16(&mut file, 0x94, 224); // optional header size
        put16(&mut file, 0x96, 0x0102); // EXECUTABLE | 32BIT

        // PE32 optional header
        let opt = 0x98;
        put16(&mut file, opt, 0x10B);
        put32(&mut file, opt + 16, TEXT_RVA); // entry point
        put32(&mut file, opt + 28, BASE); // preferred base
        put32(&mut file, opt + 32, 0x1000); // section alignment
        put32(&mut file, opt + 36, 0x200); // file alignment
        put32(&mut file, opt + 56, 0x3000); // size_of_image
        put32(&mut file, opt + 60, 0x200); // size_of_headers
        put16(&mut file, opt + 68, 3); // console subsystem
        put32(&mut file, opt + 92, 16); // directory count

        // Section headers
        let sec = opt + 224;
        section(&mut file, sec, b".text", TEXT_RVA, 0x1000, 0x200, 0x1000, 0x6000_0020);
        section(
            &mut file,
            sec + 40,
            b".data",
            DATA_RVA,
            0x1000,
            0x1200,
            0x1000,
            0xC000_0040,
        );

        // Code and payload
        file[0x200..0x200 + self.code.len()].copy_from_slice(&self.code);
        let payload_off = 0x1200 + (PAYLOAD_RVA - DATA_RVA) as usize;
        file[payload_off..payload_off + self.payload.len()].copy_from_slice(&self.payload);

        if !self.imports.is_empty() {
            self.build_imports(&mut file, opt);
        }
        if !self.reloc_rvas.is_empty() {
            self.build_relocs(&mut file, opt);
        }
        file
    }

    fn build_imports(&self, file: &mut Vec<u8>, opt: usize) {
        let data = 0x1200usize;
        let mut iat_cursor = (IAT_RVA - DATA_RVA) as usize; // within .data
        let mut ilt_cursor = iat_cursor + 0x80;
        let mut name_cursor = iat_cursor + 0x100;

        for (i, (dll, symbols)) in self.imports.iter().enumerate() {
            let desc = data + 20 * i;
            let ilt_rva = DATA_RVA + ilt_cursor as u32;
            let iat_rva = DATA_RVA + iat_cursor as u32;

            // DLL name
            let dll_name_rva = DATA_RVA + name_cursor as u32;
            file[data + name_cursor..data + name_cursor + dll.len()]
                .copy_from_slice(dll.as_bytes());
            name_cursor += dll.len() + 1;

            put32(file, desc, ilt_rva);
            put32(file, desc + 12, dll_name_rva);
            put32(file, desc + 16, iat_rva);

            for symbol in symbols {
                // hint/name entry: 2-byte hint then the name
                let hn_rva = DATA_RVA + name_cursor as u32;
                name_cursor += 2;
                file[data + name_cursor..data + name_cursor + symbol.len()]
                    .copy_from_slice(symbol.as_bytes());
                name_cursor += symbol.len() + 1;

                put32(file, data + ilt_cursor, hn_rva);
                put32(file, data + iat_cursor, hn_rva);
                ilt_cursor += 4;
                iat_cursor += 4;
            }
            // NULL terminators for both tables
            ilt_cursor += 4;
            iat_cursor += 4;
        }

        put32(file, opt + 96 + 8, DATA_RVA); // import directory RVA
        put32(file, opt + 96 + 12, 20 * (self.imports.len() as u32 + 1));
    }

    fn build_relocs(&self, file: &mut Vec<u8>, opt: usize) {
        let mut pages: Vec<(u32, Vec<u32>)> = Vec::new();
        for &rva in &self.reloc_rvas {
            let page = rva & !0xFFF;
            match pages.iter_mut().find(|(p, _)| *p == page) {
                Some((_, list)) => list.push(rva),
                None => pages.push((page, vec![rva])),
            }
        }

        let mut off = 0x1200 + (RELOC_RVA - DATA_RVA) as usize;
        let mut total = 0u32;
        for (page, rvas) in &pages {
            let mut entries: Vec<u16> = rvas
                .iter()
                .map(|rva| (3u16 << 12) | (rva & 0xFFF) as u16)
                .collect();
            if entries.len() % 2 != 0 {
                entries.push(0); // ABSOLUTE padding
            }
            let block_size = 8 + 2 * entries.len() as u32;
            put32(file, off, *page);
            put32(file, off + 4, block_size);
            for (i, e) in entries.iter().enumerate() {
                put16(file, off + 8 + 2 * i, *e);
            }
            off += block_size as usize;
            total += block_size;
        }

        put32(file, opt + 96 + 40, RELOC_RVA);
        put32(file, opt + 96 + 44, total);
    }
}

fn put16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[allow(clippy::too_many_arguments)]
fn section(
    buf: &mut [u8],
    at: usize,
    name: &[u8],
    vaddr: u32,
    vsize: u32,
    raw_ptr: u32,
    raw_size: u32,
    characteristics: u32,
) {
    buf[at..at + name.len()].copy_from_slice(name);
    put32(buf, at + 8, vsize);
    put32(buf, at + 12, vaddr);
    put32(buf, at + 16, raw_size);
    put32(buf, at + 20, raw_ptr);
    put32(buf, at + 36, characteristics);
}

/// Absolute guest address of an IAT slot, assuming the preferred base.
fn iat_abs(slot: u32) -> [u8; 4] {
    (BASE + IAT_RVA + 4 * slot).to_le_bytes()
}

fn run(image: &TestImage, args: &[&str], opts: &LoadOptions) -> (i32, BufferHost) {
    let bytes = image.build();
    let mut host = BufferHost::new();
    let code = winexec::run(&bytes, args, opts, &mut host).expect("session should start");
    (code, host)
}

#[test]
fn hello_via_puts() {
    let mut code = vec![0x68]; // push payload
    code.extend_from_slice(&(BASE + PAYLOAD_RVA).to_le_bytes());
    code.extend_from_slice(&[0xFF, 0x15]); // call [puts]
    code.extend_from_slice(&iat_abs(0));
    code.extend_from_slice(&[0x83, 0xC4, 0x04]); // add esp, 4 (cdecl)
    code.extend_from_slice(&[0x31, 0xC0, 0xC3]); // xor eax,eax; ret

    let image = TestImage {
        code,
        payload: b"Hello, world!\0".to_vec(),
        imports: vec![("msvcrt.dll", vec!["puts"])],
        ..Default::default()
    };
    let (status, host) = run(&image, &["hello.exe"], &LoadOptions::default());
    assert_eq!(status, 0);
    assert_eq!(host.stdout, b"Hello, world!\n");
}

#[test]
fn exit_code_from_natural_return() {
    let image = TestImage {
        code: vec![0xB8, 42, 0, 0, 0, 0xC3], // mov eax,42; ret
        ..Default::default()
    };
    let (status, host) = run(&image, &["fortytwo.exe"], &LoadOptions::default());
    assert_eq!(status, 42);
    assert!(host.stdout.is_empty());
}

#[test]
fn exit_code_from_exit_process() {
    let mut code = vec![0x6A, 42]; // push 42
    code.extend_from_slice(&[0xFF, 0x15]);
    code.extend_from_slice(&iat_abs(0)); // call [ExitProcess]
    code.push(0xC3); // not reached

    let image = TestImage {
        code,
        imports: vec![("KERNEL32.dll", vec!["ExitProcess"])],
        ..Default::default()
    };
    let (status, _) = run(&image, &["fortytwo.exe"], &LoadOptions::default());
    assert_eq!(status, 42);
}

#[test]
fn main_receives_argc() {
    let image = TestImage {
        code: vec![0x8B, 0x44, 0x24, 0x04, 0xC3], // mov eax,[esp+4]; ret
        ..Default::default()
    };
    let (status, _) = run(&image, &["addargs.exe", "12", "30"], &LoadOptions::default());
    assert_eq!(status, 3);
}

#[test]
fn argv_strings_are_readable() {
    // Sum the first characters of argv[1] and argv[2]:
    // mov ecx,[esp+8]; mov eax,[ecx+4]; movzx eax, byte [eax];
    // mov edx,[ecx+8]; movzx edx, byte [edx]; add eax,edx; ret
    let code = vec![
        0x8B, 0x4C, 0x24, 0x08, // mov ecx,[esp+8]
        0x8B, 0x41, 0x04, // mov eax,[ecx+4]
        0x0F, 0xB6, 0x00, // movzx eax, byte [eax]
        0x8B, 0x51, 0x08, // mov edx,[ecx+8]
        0x0F, 0xB6, 0x12, // movzx edx, byte [edx]
        0x01, 0xD0, // add eax,edx
        0xC3,
    ];
    let image = TestImage {
        code,
        ..Default::default()
    };
    let (status, _) = run(&image, &["p.exe", "A", "B"], &LoadOptions::default());
    assert_eq!(status, (b'A' + b'B') as i32);
}

#[test]
fn divide_by_zero_maps_to_136() {
    let image = TestImage {
        // xor ecx,ecx; mov eax,1; xor edx,edx; div ecx
        code: vec![0x31, 0xC9, 0xB8, 1, 0, 0, 0, 0x31, 0xD2, 0xF7, 0xF1],
        ..Default::default()
    };
    let (status, host) = run(&image, &["div0.exe"], &LoadOptions::default());
    assert_eq!(status, EXIT_DIVIDE);
    let stderr = String::from_utf8_lossy(&host.stderr);
    assert!(stderr.contains("divide"), "stderr was: {stderr}");
    assert!(stderr.contains("EIP"), "diagnostic should dump registers");
}

#[test]
fn unresolved_import_is_fatal_only_when_called() {
    // Imports ExitProcess and CreateThread; only calls ExitProcess(7).
    let mut code = vec![0x6A, 7];
    code.extend_from_slice(&[0xFF, 0x15]);
    code.extend_from_slice(&iat_abs(0));
    code.push(0xC3);

    let image = TestImage {
        code,
        imports: vec![("KERNEL32.dll", vec!["ExitProcess", "CreateThread"])],
        ..Default::default()
    };
    let (status, _) = run(&image, &["quiet.exe"], &LoadOptions::default());
    assert_eq!(status, 7);
}

#[test]
fn calling_unresolved_import_exits_127() {
    let mut code = vec![0xFF, 0x15];
    code.extend_from_slice(&iat_abs(1)); // CreateThread slot
    code.push(0xC3);

    let image = TestImage {
        code,
        imports: vec![("KERNEL32.dll", vec!["ExitProcess", "CreateThread"])],
        ..Default::default()
    };
    let (status, host) = run(&image, &["loud.exe"], &LoadOptions::default());
    assert_eq!(status, EXIT_MISSING_SHIM);
    let stderr = String::from_utf8_lossy(&host.stderr);
    assert!(stderr.contains("CreateThread"), "stderr was: {stderr}");
}

#[test]
fn rebase_fixes_absolute_pointers() {
    // The payload holds a pointer to payload+4, which holds 42. The
    // code loads through the pointer; both absolute references carry
    // relocations, so the image must work at a forced non-preferred
    // base.
    let mut payload = Vec::new();
    payload.extend_from_slice(&(BASE + PAYLOAD_RVA + 4).to_le_bytes());
    payload.extend_from_slice(&42u32.to_le_bytes());

    let mut code = vec![0x8B, 0x0D]; // mov ecx,[payload]
    code.extend_from_slice(&(BASE + PAYLOAD_RVA).to_le_bytes());
    code.extend_from_slice(&[0x8B, 0x01]); // mov eax,[ecx]
    code.push(0xC3);

    let image = TestImage {
        code,
        payload,
        // disp32 of the mov sits 2 bytes into the code
        reloc_rvas: vec![TEXT_RVA + 2, PAYLOAD_RVA],
        ..Default::default()
    };

    // Sanity: works at the preferred base.
    let (status, _) = run(&image, &["reloc.exe"], &LoadOptions::default());
    assert_eq!(status, 42);

    // Forced rebase far from the preferred base.
    let opts = LoadOptions {
        base: Some(0x0100_0000),
        ..Default::default()
    };
    let (status, _) = run(&image, &["reloc.exe"], &opts);
    assert_eq!(status, 42);
}

#[test]
fn write_file_to_console_handle() {
    // h = GetStdHandle(-11); WriteFile(h, payload, 5, NULL, NULL)
    let mut code = vec![0x6A, 0xF5]; // push -11
    code.extend_from_slice(&[0xFF, 0x15]);
    code.extend_from_slice(&iat_abs(0)); // GetStdHandle
    code.extend_from_slice(&[0x6A, 0x00]); // push 0 (overlapped)
    code.extend_from_slice(&[0x6A, 0x00]); // push 0 (lpWritten)
    code.extend_from_slice(&[0x6A, 0x05]); // push 5 (length)
    code.push(0x68); // push payload
    code.extend_from_slice(&(BASE + PAYLOAD_RVA).to_le_bytes());
    code.push(0x50); // push eax (handle)
    code.extend_from_slice(&[0xFF, 0x15]);
    code.extend_from_slice(&iat_abs(1)); // WriteFile
    code.extend_from_slice(&[0x31, 0xC0, 0xC3]);

    let image = TestImage {
        code,
        payload: b"guest".to_vec(),
        imports: vec![("KERNEL32.dll", vec!["GetStdHandle", "WriteFile"])],
        ..Default::default()
    };
    let (status, host) = run(&image, &["con.exe"], &LoadOptions::default());
    assert_eq!(status, 0);
    assert_eq!(host.stdout, b"guest");
}

#[test]
fn printf_formats_stack_arguments() {
    // printf("%s=%d\n", payload, 7)
    let mut code = vec![0x6A, 0x07]; // push 7
    code.push(0x68); // push payload+8 ("value")
    code.extend_from_slice(&(BASE + PAYLOAD_RVA + 8).to_le_bytes());
    code.push(0x68); // push payload ("%s=%d\n")
    code.extend_from_slice(&(BASE + PAYLOAD_RVA).to_le_bytes());
    code.extend_from_slice(&[0xFF, 0x15]);
    code.extend_from_slice(&iat_abs(0)); // printf
    code.extend_from_slice(&[0x83, 0xC4, 0x0C]); // add esp, 12
    code.extend_from_slice(&[0x31, 0xC0, 0xC3]);

    let image = TestImage {
        code,
        payload: b"%s=%d\n\0\0value\0".to_vec(),
        imports: vec![("msvcrt.dll", vec!["printf"])],
        ..Default::default()
    };
    let (status, host) = run(&image, &["fmt.exe"], &LoadOptions::default());
    assert_eq!(status, 0);
    assert_eq!(host.stdout, b"value=7\n");
}

#[test]
fn fetch_outside_image_is_segv() {
    // jmp well past the mapped image
    let image = TestImage {
        code: vec![0xE9, 0x00, 0x00, 0x10, 0x00], // jmp +0x100000
        ..Default::default()
    };
    let (status, _) = run(&image, &["wild.exe"], &LoadOptions::default());
    assert_eq!(status, EXIT_SEGV);
}

#[test]
fn get_command_line_sees_all_arguments() {
    // Return the length of GetCommandLineA() via strlen-style loop:
    // call [GetCommandLineA]; mov ecx,eax; xor eax,eax;
    // l: cmp byte [ecx],0; je done; inc ecx; inc eax; jmp l; done: ret
    let mut code = vec![0xFF, 0x15];
    code.extend_from_slice(&iat_abs(0));
    code.extend_from_slice(&[
        0x89, 0xC1, // mov ecx,eax
        0x31, 0xC0, // xor eax,eax
        0x80, 0x39, 0x00, // cmp byte [ecx],0
        0x74, 0x04, // je done
        0x41, // inc ecx
        0x40, // inc eax
        0xEB, 0xF7, // jmp back to the cmp
        0xC3, // done: ret
    ]);

    let image = TestImage {
        code,
        imports: vec![("KERNEL32.dll", vec!["GetCommandLineA"])],
        ..Default::default()
    };
    let (status, _) = run(&image, &["cmd.exe", "a", "bc"], &LoadOptions::default());
    assert_eq!(status, "cmd.exe a bc".len() as i32);
}

#[test]
fn dll_image_is_rejected() {
    let image = TestImage {
        code: vec![0xC3],
        ..Default::default()
    };
    let mut bytes = image.build();
    // Flip on IMAGE_FILE_DLL.
    let flags = u16::from_le_bytes([bytes[0x96], bytes[0x97]]) | 0x2000;
    put16(&mut bytes, 0x96, flags);

    let mut host = BufferHost::new();
    let result = winexec::run(&bytes, &["lib.dll"], &LoadOptions::default(), &mut host);
    assert!(result.is_err());
}

#[test]
fn pe32_plus_is_rejected() {
    let image = TestImage {
        code: vec![0xC3],
        ..Default::default()
    };
    let mut bytes = image.build();
    put16(&mut bytes, 0x98, 0x20B);

    let mut host = BufferHost::new();
    let result = winexec::run(&bytes, &["w64.exe"], &LoadOptions::default(), &mut host);
    assert!(result.is_err());
}
