//! Guest Address Space
//!
//! Three disjoint host-backed regions cover everything a guest may
//! touch: the mapped image, the stack band under [`STACK_TOP`], and the
//! heap band at [`HEAP_BASE`] serving the allocation shims. Any access
//! outside them is a memory fault carried as a typed error; the
//! interpreter converts it to the SIGSEGV-style exit.
//!
//! ```text
//! 0x0040_0000  image (size_of_image bytes, relocatable)
//! 0x7FFB_0000  stack (256 KiB, grows down from STACK_TOP)
//! 0x9000_0000  heap  (8 MiB, bump/free-list allocator)
//! 0xFF00_0000  thunk tokens (no backing memory; execute-only sentinels)
//! ```

use crate::{HEAP_BASE, HEAP_SIZE, STACK_SIZE, STACK_TOP};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

/// A guest memory access violation: the address and the width attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFault {
    pub addr: u32,
    pub len: u32,
}

/// Flat guest address space backed by host vectors.
pub struct AddressSpace {
    image_base: u32,
    image: Vec<u8>,
    stack_base: u32,
    stack: Vec<u8>,
    heap: Vec<u8>,
}

impl AddressSpace {
    /// Build the space around a mapped image.
    pub fn new(image_base: u32, image: Vec<u8>) -> Self {
        AddressSpace {
            image_base,
            image,
            stack_base: STACK_TOP - STACK_SIZE,
            stack: vec![0u8; STACK_SIZE as usize],
            heap: vec![0u8; HEAP_SIZE as usize],
        }
    }

    /// Address of the first byte above the stack.
    pub fn stack_top(&self) -> u32 {
        STACK_TOP
    }

    /// Resolve an address range to a backing slice offset.
    fn backing(&self, addr: u32, len: u32) -> Result<(Region, usize), MemFault> {
        let fault = MemFault { addr, len };
        let end = addr.checked_add(len).ok_or(fault)?;
        if addr >= self.image_base && end <= self.image_base + self.image.len() as u32 {
            return Ok((Region::Image, (addr - self.image_base) as usize));
        }
        if addr >= self.stack_base && end <= STACK_TOP {
            return Ok((Region::Stack, (addr - self.stack_base) as usize));
        }
        if addr >= HEAP_BASE && end <= HEAP_BASE + HEAP_SIZE {
            return Ok((Region::Heap, (addr - HEAP_BASE) as usize));
        }
        Err(fault)
    }

    fn slice(&self, addr: u32, len: u32) -> Result<&[u8], MemFault> {
        let (region, off) = self.backing(addr, len)?;
        let backing = match region {
            Region::Image => &self.image,
            Region::Stack => &self.stack,
            Region::Heap => &self.heap,
        };
        Ok(&backing[off..off + len as usize])
    }

    fn slice_mut(&mut self, addr: u32, len: u32) -> Result<&mut [u8], MemFault> {
        let (region, off) = self.backing(addr, len)?;
        let backing = match region {
            Region::Image => &mut self.image,
            Region::Stack => &mut self.stack,
            Region::Heap => &mut self.heap,
        };
        Ok(&mut backing[off..off + len as usize])
    }

    pub fn read8(&self, addr: u32) -> Result<u8, MemFault> {
        Ok(self.slice(addr, 1)?[0])
    }

    pub fn read16(&self, addr: u32) -> Result<u16, MemFault> {
        let s = self.slice(addr, 2)?;
        Ok(u16::from_le_bytes([s[0], s[1]]))
    }

    pub fn read32(&self, addr: u32) -> Result<u32, MemFault> {
        let s = self.slice(addr, 4)?;
        Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn write8(&mut self, addr: u32, value: u8) -> Result<(), MemFault> {
        self.slice_mut(addr, 1)?[0] = value;
        Ok(())
    }

    pub fn write16(&mut self, addr: u32, value: u16) -> Result<(), MemFault> {
        self.slice_mut(addr, 2)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write32(&mut self, addr: u32, value: u32) -> Result<(), MemFault> {
        self.slice_mut(addr, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Copy a block out of guest memory.
    pub fn read_block(&self, addr: u32, len: u32) -> Result<Vec<u8>, MemFault> {
        Ok(self.slice(addr, len)?.to_vec())
    }

    /// Copy a block into guest memory.
    pub fn write_block(&mut self, addr: u32, bytes: &[u8]) -> Result<(), MemFault> {
        self.slice_mut(addr, bytes.len() as u32)?.copy_from_slice(bytes);
        Ok(())
    }

    /// Read a NUL-terminated string, bounded by `max` bytes. Non-UTF-8
    /// bytes are replaced so diagnostics stay printable.
    pub fn read_cstr(&self, addr: u32, max: u32) -> Result<String, MemFault> {
        let mut out = Vec::new();
        for i in 0..max {
            let b = self.read8(addr.wrapping_add(i))?;
            if b == 0 {
                break;
            }
            out.push(b);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

#[derive(Clone, Copy)]
enum Region {
    Image,
    Stack,
    Heap,
}

/// First-fit allocator over the heap band.
///
/// Backs `HeapAlloc`/`HeapFree`, `malloc`/`free`, and `VirtualAlloc`.
/// Blocks are tracked host-side only; guests never see the metadata.
pub struct HeapTable {
    blocks: Vec<Block>,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    addr: u32,
    size: u32,
    free: bool,
}

/// Granule for ordinary allocations.
const HEAP_ALIGN: u32 = 8;

impl HeapTable {
    pub fn new() -> Self {
        HeapTable {
            blocks: vec![Block {
                addr: HEAP_BASE,
                size: HEAP_SIZE,
                free: true,
            }],
        }
    }

    /// Allocate `size` bytes at `align` alignment; `None` when the band
    /// is exhausted. Zero-size requests take one granule. A misaligned
    /// free block is split so its aligned tail serves the request.
    pub fn alloc_aligned(&mut self, size: u32, align: u32) -> Option<u32> {
        let size = size.max(1);
        let size = size.checked_add(align - 1)? / align * align;

        let (index, pad) = self.blocks.iter().enumerate().find_map(|(i, b)| {
            if !b.free {
                return None;
            }
            let pad = b.addr.wrapping_neg() % align;
            if b.size >= pad.checked_add(size)? {
                Some((i, pad))
            } else {
                None
            }
        })?;

        let mut index = index;
        if pad > 0 {
            // Leading fragment stays free.
            let block = self.blocks[index];
            self.blocks[index].size = pad;
            self.blocks.insert(
                index + 1,
                Block {
                    addr: block.addr + pad,
                    size: block.size - pad,
                    free: true,
                },
            );
            index += 1;
        }

        let block = self.blocks[index];
        if block.size > size {
            self.blocks.insert(
                index + 1,
                Block {
                    addr: block.addr + size,
                    size: block.size - size,
                    free: true,
                },
            );
        }
        self.blocks[index] = Block {
            addr: block.addr,
            size,
            free: false,
        };
        Some(block.addr)
    }

    pub fn alloc(&mut self, size: u32) -> Option<u32> {
        self.alloc_aligned(size, HEAP_ALIGN)
    }

    /// Free a block by its start address. Unknown or already-free
    /// addresses are ignored, as the Win32 heap tolerates them.
    pub fn free(&mut self, addr: u32) -> bool {
        let Some(index) = self
            .blocks
            .iter()
            .position(|b| b.addr == addr && !b.free)
        else {
            return false;
        };
        self.blocks[index].free = true;
        self.coalesce(index);
        true
    }

    /// Size of a live block, if `addr` starts one.
    pub fn size_of(&self, addr: u32) -> Option<u32> {
        self.blocks
            .iter()
            .find(|b| b.addr == addr && !b.free)
            .map(|b| b.size)
    }

    fn coalesce(&mut self, index: usize) {
        // Merge with the following block first so `index` stays valid.
        if index + 1 < self.blocks.len() && self.blocks[index + 1].free {
            self.blocks[index].size += self.blocks[index + 1].size;
            self.blocks.remove(index + 1);
        }
        if index > 0 && self.blocks[index - 1].free {
            self.blocks[index - 1].size += self.blocks[index].size;
            self.blocks.remove(index);
        }
    }

    /// Bytes currently handed out.
    pub fn used(&self) -> u32 {
        self.blocks.iter().filter(|b| !b.free).map(|b| b.size).sum()
    }
}

impl Default for HeapTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> AddressSpace {
        AddressSpace::new(0x0040_0000, vec![0u8; 0x1000])
    }

    #[test]
    fn image_reads_and_writes() {
        let mut m = space();
        m.write32(0x0040_0010, 0xDEAD_BEEF).unwrap();
        assert_eq!(m.read32(0x0040_0010).unwrap(), 0xDEAD_BEEF);
        assert_eq!(m.read16(0x0040_0010).unwrap(), 0xBEEF);
        assert_eq!(m.read8(0x0040_0013).unwrap(), 0xDE);
    }

    #[test]
    fn unmapped_access_faults() {
        let m = space();
        assert_eq!(
            m.read32(0x1000),
            Err(MemFault { addr: 0x1000, len: 4 })
        );
        // One past the image end
        assert!(m.read8(0x0040_1000).is_err());
        // Straddling the image end
        assert!(m.read32(0x0040_0FFD).is_err());
        // Thunk band has no data backing
        assert!(m.read8(crate::THUNK_BASE).is_err());
    }

    #[test]
    fn stack_band_is_mapped() {
        let mut m = space();
        let esp = m.stack_top() - 4;
        m.write32(esp, 42).unwrap();
        assert_eq!(m.read32(esp).unwrap(), 42);
        assert!(m.read32(m.stack_top()).is_err());
        assert!(m.read8(m.stack_top() - STACK_SIZE - 1).is_err());
    }

    #[test]
    fn heap_band_is_mapped() {
        let mut m = space();
        m.write8(HEAP_BASE, 7).unwrap();
        assert_eq!(m.read8(HEAP_BASE).unwrap(), 7);
        assert!(m.read8(HEAP_BASE + HEAP_SIZE).is_err());
    }

    #[test]
    fn cstr_reads_stop_at_nul() {
        let mut m = space();
        m.write_block(0x0040_0100, b"hello\0world").unwrap();
        assert_eq!(m.read_cstr(0x0040_0100, 64).unwrap(), "hello");
    }

    #[test]
    fn heap_alloc_free_coalesce() {
        let mut h = HeapTable::new();
        let a = h.alloc(100).unwrap();
        let b = h.alloc(200).unwrap();
        assert_eq!(a, HEAP_BASE);
        assert_eq!(a % 8, 0);
        assert_eq!(b % 8, 0);
        assert!(b > a);
        assert_eq!(h.size_of(a), Some(104));

        assert!(h.free(a));
        assert!(!h.free(a)); // double free ignored
        assert!(h.free(b));
        // Fully coalesced: a max-size allocation fits again.
        let big = h.alloc_aligned(HEAP_SIZE, 8).unwrap();
        assert_eq!(big, HEAP_BASE);
    }

    #[test]
    fn page_aligned_allocations() {
        let mut h = HeapTable::new();
        let _pad = h.alloc(24).unwrap();
        let page = h.alloc_aligned(0x2000, 0x1000).unwrap();
        assert_eq!(page % 0x1000, 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut h = HeapTable::new();
        assert!(h.alloc(HEAP_SIZE - 8).is_some());
        assert!(h.alloc(64).is_none());
    }
}
