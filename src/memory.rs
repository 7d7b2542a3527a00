//! Guest memory map
//!
//! Fixed table of up to [`MEM_REGIONS_MAX`] shared-mapped guest regions.
//! Each slot owns its mapping and fd through `vm-memory`, so clearing a slot
//! unmaps the region and closes the descriptor exactly once. Translation is
//! a linear scan, which is fine at this table size.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use vm_memory::{
    FileOffset, GuestAddress, GuestMemoryAtomic, GuestMemoryMmap, GuestMemoryRegion,
    GuestRegionMmap, MemoryRegionAddress, MmapRegion,
};

use crate::error::MemoryError;

/// Maximum number of guest memory regions a frontend may supply
pub const MEM_REGIONS_MAX: usize = 8;

pub const PAGE_SIZE: u64 = 4096;
const PAGE_SHIFT: u64 = 12;

struct MappedRegion {
    region: Arc<GuestRegionMmap<()>>,
    uva: u64,
    pages: u32,
    hva: usize,
}

impl MappedRegion {
    fn gpa(&self) -> u64 {
        self.region.start_addr().0
    }

    fn size(&self) -> u64 {
        (self.pages as u64) << PAGE_SHIFT
    }
}

/// Mapping table translating guest physical and frontend userspace
/// addresses to local pointers
#[derive(Default)]
pub struct MemoryMap {
    slots: [Option<MappedRegion>; MEM_REGIONS_MAX],
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a guest region into slot `index`.
    ///
    /// A slot that already holds the exact same `(guest_addr, size)` mapping
    /// is left untouched and the duplicate fd is closed; qemu re-sends
    /// unchanged regions whenever its internal tables change. Any other
    /// conflict is a busy error.
    pub fn map_region(
        &mut self,
        index: u32,
        guest_addr: u64,
        user_addr: u64,
        size: u64,
        offset: u64,
        fd: OwnedFd,
    ) -> Result<(), MemoryError> {
        if index as usize >= MEM_REGIONS_MAX {
            return Err(MemoryError::BadIndex(index));
        }

        if size % PAGE_SIZE != 0 {
            return Err(MemoryError::BadAlignment(size));
        }

        if offset % PAGE_SIZE != 0 {
            return Err(MemoryError::BadAlignment(offset));
        }

        let pages = (size >> PAGE_SHIFT) as u32;

        if let Some(existing) = &self.slots[index as usize] {
            if existing.gpa() == guest_addr && existing.pages == pages {
                tracing::debug!(index, "region unchanged, closing duplicate fd");
                drop(fd);
                return Ok(());
            }

            tracing::error!(
                index,
                gpa = format_args!("0x{guest_addr:x}"),
                pages,
                "region slot already mapped to a different range"
            );
            return Err(MemoryError::SlotBusy(index));
        }

        let file = File::from(fd);
        let mapping = MmapRegion::from_file(FileOffset::new(file, offset), size as usize)?;
        let region = GuestRegionMmap::new(mapping, GuestAddress(guest_addr))?;
        let hva = region.get_host_address(MemoryRegionAddress(0))? as usize;

        tracing::debug!(
            index,
            gpa = format_args!("0x{guest_addr:x}"),
            uva = format_args!("0x{user_addr:x}"),
            hva = format_args!("0x{hva:x}"),
            pages,
            "guest region mapped"
        );

        self.slots[index as usize] = Some(MappedRegion {
            region: Arc::new(region),
            uva: user_addr,
            pages,
            hva,
        });

        Ok(())
    }

    /// Unmap the region in slot `index`, closing its fd
    pub fn unmap_region(&mut self, index: usize) {
        if let Some(region) = self.slots[index].take() {
            tracing::debug!(
                index,
                gpa = format_args!("0x{:x}", region.gpa()),
                "guest region unmapped"
            );
        }
    }

    /// Unmap every populated slot
    pub fn unmap_all(&mut self) {
        for index in 0..MEM_REGIONS_MAX {
            self.unmap_region(index);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Resolve a frontend userspace address to a local pointer
    pub fn translate_uva(&self, uva: u64) -> Option<*mut u8> {
        self.slots.iter().flatten().find_map(|region| {
            if uva >= region.uva && uva - region.uva < region.size() {
                Some((region.hva + (uva - region.uva) as usize) as *mut u8)
            } else {
                None
            }
        })
    }

    /// Resolve a frontend userspace address to its guest physical address
    pub fn uva_to_gpa(&self, uva: u64) -> Option<u64> {
        self.slots.iter().flatten().find_map(|region| {
            if uva >= region.uva && uva - region.uva < region.size() {
                Some(region.gpa() + (uva - region.uva))
            } else {
                None
            }
        })
    }

    /// Resolve a guest physical range to a local pointer.
    ///
    /// The whole `[gpa, gpa + len)` range must fall inside one region;
    /// ranges crossing a region boundary are rejected.
    pub fn translate_gpa(&self, gpa: u64, len: u32) -> Option<*mut u8> {
        if len == 0 {
            return None;
        }

        let last = gpa.checked_add(len as u64 - 1)?;

        self.slots.iter().flatten().find_map(|region| {
            if gpa >= region.gpa() && gpa - region.gpa() < region.size() {
                if last - region.gpa() >= region.size() {
                    return None;
                }

                Some((region.hva + (gpa - region.gpa()) as usize) as *mut u8)
            } else {
                None
            }
        })
    }

    /// Build an atomic guest memory view over the mapped regions for
    /// attaching virtqueues
    pub fn guest_memory(
        &self,
    ) -> Result<GuestMemoryAtomic<GuestMemoryMmap<()>>, MemoryError> {
        let mut regions: Vec<Arc<GuestRegionMmap<()>>> = self
            .slots
            .iter()
            .flatten()
            .map(|slot| Arc::clone(&slot.region))
            .collect();

        if regions.is_empty() {
            return Err(MemoryError::NoMappedMemory);
        }

        regions.sort_by_key(|region| region.start_addr());

        let mmap = GuestMemoryMmap::from_arc_regions(regions)?;
        Ok(GuestMemoryAtomic::new(mmap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

    fn memfd(size: u64) -> OwnedFd {
        let fd = memfd_create(c"test-region", MemFdCreateFlag::MFD_CLOEXEC).unwrap();
        let file = File::from(fd);
        file.set_len(size).unwrap();
        OwnedFd::from(file)
    }

    const UVA_BASE: u64 = 0x7f00_0000_0000;

    #[test]
    fn map_and_translate() {
        let mut map = MemoryMap::new();
        map.map_region(0, 0x10000, UVA_BASE, 0x10000, 0, memfd(0x10000))
            .unwrap();

        let by_gpa = map.translate_gpa(0x10010, 4).unwrap();
        let by_uva = map.translate_uva(UVA_BASE + 0x10).unwrap();
        assert_eq!(by_gpa, by_uva);

        assert_eq!(map.uva_to_gpa(UVA_BASE + 0x20), Some(0x10020));
        assert_eq!(map.uva_to_gpa(UVA_BASE - 1), None);
        assert!(map.translate_gpa(0x20000, 1).is_none());

        // memory is shared through the mapping
        unsafe { by_gpa.write(0xa5) };
        assert_eq!(unsafe { map.translate_uva(UVA_BASE + 0x10).unwrap().read() }, 0xa5);
    }

    #[test]
    fn alignment_and_bounds() {
        let mut map = MemoryMap::new();

        assert!(matches!(
            map.map_region(8, 0, UVA_BASE, 0x1000, 0, memfd(0x1000)),
            Err(MemoryError::BadIndex(8))
        ));

        assert!(matches!(
            map.map_region(0, 0, UVA_BASE, 0x1234, 0, memfd(0x2000)),
            Err(MemoryError::BadAlignment(0x1234))
        ));

        assert!(matches!(
            map.map_region(0, 0, UVA_BASE, 0x1000, 0x10, memfd(0x2000)),
            Err(MemoryError::BadAlignment(0x10))
        ));
    }

    #[test]
    fn idempotent_remap() {
        let mut map = MemoryMap::new();
        map.map_region(0, 0, UVA_BASE, 0x2000, 0, memfd(0x2000))
            .unwrap();

        let before = map.translate_gpa(0, 1).unwrap();

        // identical region: accepted, duplicate fd closed, no fresh mmap
        map.map_region(0, 0, UVA_BASE, 0x2000, 0, memfd(0x2000))
            .unwrap();
        assert_eq!(map.translate_gpa(0, 1).unwrap(), before);

        // conflicting region: busy
        assert!(matches!(
            map.map_region(0, 0x4000, UVA_BASE, 0x2000, 0, memfd(0x2000)),
            Err(MemoryError::SlotBusy(0))
        ));
    }

    #[test]
    fn range_must_stay_in_one_region() {
        let mut map = MemoryMap::new();
        map.map_region(0, 0, UVA_BASE, 0x10000, 0, memfd(0x10000))
            .unwrap();
        map.map_region(1, 0x10000, UVA_BASE + 0x10000, 0x10000, 0, memfd(0x10000))
            .unwrap();

        assert!(map.translate_gpa(0xfff0, 8).is_some());
        assert!(map.translate_gpa(0xfff0, 0x20).is_none());
        assert!(map.translate_gpa(0x10000, 0x20).is_some());
        assert!(map.translate_gpa(0, 0).is_none());
    }

    #[test]
    fn unmap_all_clears_slots() {
        let mut map = MemoryMap::new();
        map.map_region(0, 0, UVA_BASE, 0x1000, 0, memfd(0x1000))
            .unwrap();
        map.map_region(3, 0x10000, UVA_BASE + 0x10000, 0x1000, 0, memfd(0x1000))
            .unwrap();
        assert!(!map.is_empty());

        map.unmap_all();
        assert!(map.is_empty());
        assert!(map.translate_gpa(0, 1).is_none());
        assert!(matches!(map.guest_memory(), Err(MemoryError::NoMappedMemory)));
    }

    #[test]
    fn guest_memory_view_spans_regions() {
        let mut map = MemoryMap::new();
        // insert out of address order, the view sorts by gpa
        map.map_region(0, 0x10000, UVA_BASE + 0x10000, 0x10000, 0, memfd(0x10000))
            .unwrap();
        map.map_region(1, 0, UVA_BASE, 0x10000, 0, memfd(0x10000))
            .unwrap();

        let mem = map.guest_memory().unwrap();
        use vm_memory::{Bytes, GuestAddressSpace};
        let guard = mem.memory();
        guard.write_obj(0x1122u16, GuestAddress(0x10008)).unwrap();
        assert_eq!(guard.read_obj::<u16>(GuestAddress(0x10008)).unwrap(), 0x1122);
    }
}
