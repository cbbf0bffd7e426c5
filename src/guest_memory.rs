//! Guest memory abstraction.
//!
//! The emulator proper owns the real memory map; the command processor only
//! needs the slice of it that [`GuestMemory`] describes: a flat VRAM-like
//! byte region, page-granular dirty tracking in two independent domains,
//! and byte-range access intercepts for live render targets. [`Vram`]
//! implements the trait over a plain byte vector and is what the tests run
//! against; an integrator substitutes the emulator's memory system behind
//! the same trait.

use core::fmt;

pub const PAGE_SIZE: u64 = 4096;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("guest memory access out of bounds: addr=0x{addr:x}, len=0x{len:x}")]
pub struct GuestMemoryError {
    pub addr: u64,
    pub len: usize,
}

/// Independent dirty-bit domains. Surface downloads mark both; the texture
/// cache clears only its own so it can cheaply answer "did anything write
/// this range since I last decoded it".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirtyDomain {
    Generic,
    Texture,
}

/// Identifier for an installed byte-range access intercept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessHookId(u64);

impl AccessHookId {
    /// Placeholder for a binding whose hook is not yet installed. Real ids
    /// start at 1.
    pub const INVALID: AccessHookId = AccessHookId(0);
}

impl fmt::Display for AccessHookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook#{}", self.0)
    }
}

struct AccessHook {
    id: AccessHookId,
    start: u64,
    len: u64,
}

/// Everything the command processor needs from the guest memory system.
///
/// Offsets are relative to the start of the VRAM aperture. Dirty tracking
/// is page granular and per [`DirtyDomain`]; hooks are byte-range exact.
pub trait GuestMemory {
    fn len(&self) -> usize;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), GuestMemoryError>;

    /// Write that also marks both dirty domains, the way DMA into VRAM does.
    fn write(&mut self, addr: u64, src: &[u8]) -> Result<(), GuestMemoryError>;

    fn slice(&self, addr: u64, len: usize) -> Result<&[u8], GuestMemoryError>;

    fn slice_mut(&mut self, addr: u64, len: usize) -> Result<&mut [u8], GuestMemoryError>;

    /// Mark only one domain dirty. Surface downloads write VRAM on the
    /// host's behalf and must not look like guest writes to the generic
    /// domain, but textures sourced from the range do need redecoding.
    fn set_dirty_domain(&mut self, addr: u64, len: u64, domain: DirtyDomain);

    /// True if any page overlapping the range is dirty in `domain`; clears
    /// those pages' bits as a side effect.
    fn test_and_clear_dirty(&mut self, addr: u64, len: u64, domain: DirtyDomain) -> bool;

    fn install_hook(&mut self, start: u64, len: u64) -> AccessHookId;

    fn remove_hook(&mut self, id: AccessHookId);

    /// Hooks whose range overlaps `[addr, addr+len)`. The caller decides
    /// what the hit means; the intercept layer only reports it.
    fn hooks_hit(&self, addr: u64, len: u64) -> Vec<AccessHookId>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_dirty(&mut self, addr: u64, len: u64) {
        self.set_dirty_domain(addr, len, DirtyDomain::Generic);
        self.set_dirty_domain(addr, len, DirtyDomain::Texture);
    }

    /// Read a little-endian u32 word slice.
    fn read_words(&self, addr: u64, count: usize) -> Result<Vec<u32>, GuestMemoryError> {
        let bytes = self.slice(addr, count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }
}

/// Flat VRAM with dirty tracking and access intercepts.
pub struct Vram {
    mem: Vec<u8>,
    // One bit per page, per domain.
    dirty: [Vec<u64>; 2],
    hooks: Vec<AccessHook>,
    next_hook_id: u64,
}

impl Vram {
    pub fn new(size_bytes: usize) -> Self {
        let pages = (size_bytes as u64).div_ceil(PAGE_SIZE) as usize;
        let words = pages.div_ceil(64);
        Vram {
            mem: vec![0u8; size_bytes],
            dirty: [vec![0u64; words], vec![0u64; words]],
            hooks: Vec::new(),
            next_hook_id: 1,
        }
    }

    fn check(&self, addr: u64, len: usize) -> Result<(usize, usize), GuestMemoryError> {
        let start = usize::try_from(addr).map_err(|_| GuestMemoryError { addr, len })?;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= self.mem.len())
            .ok_or(GuestMemoryError { addr, len })?;
        Ok((start, end))
    }

    fn page_range(&self, addr: u64, len: u64) -> (usize, usize) {
        let first = (addr / PAGE_SIZE) as usize;
        let last = ((addr + len.max(1) - 1) / PAGE_SIZE) as usize;
        (first, last)
    }
}

impl GuestMemory for Vram {
    fn len(&self) -> usize {
        self.mem.len()
    }

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        let (start, end) = self.check(addr, dst.len())?;
        dst.copy_from_slice(&self.mem[start..end]);
        Ok(())
    }

    fn write(&mut self, addr: u64, src: &[u8]) -> Result<(), GuestMemoryError> {
        let (start, end) = self.check(addr, src.len())?;
        self.mem[start..end].copy_from_slice(src);
        self.set_dirty(addr, src.len() as u64);
        Ok(())
    }

    fn slice(&self, addr: u64, len: usize) -> Result<&[u8], GuestMemoryError> {
        let (start, end) = self.check(addr, len)?;
        Ok(&self.mem[start..end])
    }

    fn slice_mut(&mut self, addr: u64, len: usize) -> Result<&mut [u8], GuestMemoryError> {
        let (start, end) = self.check(addr, len)?;
        Ok(&mut self.mem[start..end])
    }

    fn set_dirty_domain(&mut self, addr: u64, len: u64, domain: DirtyDomain) {
        let (first, last) = self.page_range(addr, len);
        let bits = &mut self.dirty[domain as usize];
        for page in first..=last {
            if page / 64 < bits.len() {
                bits[page / 64] |= 1 << (page % 64);
            }
        }
    }

    fn test_and_clear_dirty(&mut self, addr: u64, len: u64, domain: DirtyDomain) -> bool {
        let (first, last) = self.page_range(addr, len);
        let bits = &mut self.dirty[domain as usize];
        let mut any = false;
        for page in first..=last {
            if page / 64 >= bits.len() {
                break;
            }
            let mask = 1u64 << (page % 64);
            if bits[page / 64] & mask != 0 {
                any = true;
                bits[page / 64] &= !mask;
            }
        }
        any
    }

    fn install_hook(&mut self, start: u64, len: u64) -> AccessHookId {
        let id = AccessHookId(self.next_hook_id);
        self.next_hook_id += 1;
        self.hooks.push(AccessHook { id, start, len });
        id
    }

    fn remove_hook(&mut self, id: AccessHookId) {
        self.hooks.retain(|h| h.id != id);
    }

    fn hooks_hit(&self, addr: u64, len: u64) -> Vec<AccessHookId> {
        let end = addr + len;
        self.hooks
            .iter()
            .filter(|h| addr < h.start + h.len && h.start < end)
            .map(|h| h.id)
            .collect()
    }
}

/// A DMA context object: a handle-addressed window into VRAM. Command
/// methods reference buffers by handle plus offset; the translation to a
/// linear address goes through here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaObject {
    pub address: u64,
    pub limit: u64,
}

/// Handle-to-object table maintained by the emulator's object model. A
/// handler asking for an unregistered handle is a configuration error and
/// aborts rather than corrupting guest memory.
#[derive(Default)]
pub struct DmaTable {
    objects: std::collections::HashMap<u32, DmaObject>,
}

impl DmaTable {
    pub fn insert(&mut self, handle: u32, object: DmaObject) {
        self.objects.insert(handle, object);
    }

    pub fn resolve(&self, handle: u32) -> DmaObject {
        match self.objects.get(&handle) {
            Some(obj) => *obj,
            None => panic!("dma: unregistered object handle {handle:#x}"),
        }
    }

    pub fn try_resolve(&self, handle: u32) -> Option<DmaObject> {
        self.objects.get(&handle).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dma_table_resolves_registered_handles() {
        let mut dma = DmaTable::default();
        dma.insert(
            0x9,
            DmaObject {
                address: 0x10000,
                limit: 0xfffff,
            },
        );
        assert_eq!(dma.resolve(0x9).address, 0x10000);
        assert_eq!(dma.try_resolve(0xa), None);
    }

    #[test]
    #[should_panic(expected = "unregistered object handle")]
    fn unregistered_dma_handle_aborts() {
        DmaTable::default().resolve(0x42);
    }

    #[test]
    fn out_of_bounds_access_is_an_error() {
        let mut vram = Vram::new(0x1000);
        let mut buf = [0u8; 8];
        assert!(vram.read(0xfff8, &mut buf).is_err());
        assert!(vram.write(0x1000, &buf).is_err());
        assert!(vram.read(0x0ff8, &mut buf).is_ok());
    }

    #[test]
    fn dirty_domains_are_independent() {
        let mut vram = Vram::new(0x4000);
        vram.write(0x1000, &[1, 2, 3]).unwrap();

        assert!(vram.test_and_clear_dirty(0x1000, 4, DirtyDomain::Generic));
        // Generic bit cleared, texture bit still set.
        assert!(!vram.test_and_clear_dirty(0x1000, 4, DirtyDomain::Generic));
        assert!(vram.test_and_clear_dirty(0x1000, 4, DirtyDomain::Texture));
        assert!(!vram.test_and_clear_dirty(0x1000, 4, DirtyDomain::Texture));
    }

    #[test]
    fn hooks_report_overlap_only() {
        let mut vram = Vram::new(0x10000);
        let a = vram.install_hook(0x1000, 0x1000);
        let b = vram.install_hook(0x3000, 0x1000);

        assert_eq!(vram.hooks_hit(0x1800, 4), vec![a]);
        assert_eq!(vram.hooks_hit(0x2000, 4), Vec::<AccessHookId>::new());
        assert_eq!(vram.hooks_hit(0x2fff, 2), vec![b]);

        vram.remove_hook(a);
        assert_eq!(vram.hooks_hit(0x1800, 4), Vec::<AccessHookId>::new());
    }

    #[test]
    fn read_words_decodes_little_endian() {
        let mut vram = Vram::new(0x100);
        vram.write(0x10, &[0x78, 0x56, 0x34, 0x12]).unwrap();
        assert_eq!(vram.read_words(0x10, 1).unwrap(), vec![0x12345678]);
    }
}
