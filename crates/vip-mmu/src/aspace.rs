//! Per-client address space: the two-level translation structure itself.

use std::sync::Arc;

use tracing::trace;

use crate::{
    BusAllocator, BusMapping, BusMemory, MmuError, Pte, PteFlags, PAGE_SHIFT, PAGE_SIZE,
    PD_ENTRIES, PT_ENTRIES,
};

const PT_SHIFT: u32 = PAGE_SHIFT; // 12: bits 21..12 index the page table
const PD_SHIFT: u32 = 22; // bits 31..22 index the directory

struct TableShadow {
    page: u64,
    valid_count: u32,
}

/// One client's GPU page tables.
///
/// Structure pages (the directory and each table) are bus pages; entries are
/// written through the bus so hardware can walk them. The shadow vector only
/// tracks table locations and valid-entry counts for garbage collection — the
/// bus copy is authoritative.
pub struct AddressSpace {
    pool: Arc<dyn BusAllocator>,
    directory_page: u64,
    tables: Vec<Option<TableShadow>>,
}

impl AddressSpace {
    pub fn new(pool: Arc<dyn BusAllocator>) -> Result<Self, MmuError> {
        let directory_page = pool.alloc_page()?;
        fill_invalid(pool.as_ref(), directory_page);
        let mut tables = Vec::with_capacity(PD_ENTRIES as usize);
        tables.resize_with(PD_ENTRIES as usize, || None);
        Ok(Self {
            pool,
            directory_page,
            tables,
        })
    }

    /// Bus address of the page directory, programmed into the hardware
    /// page-table-array slot.
    pub fn root_bus_addr(&self) -> u64 {
        self.directory_page
    }

    /// Map every page of `mapping` starting at `gpu_addr`.
    ///
    /// Page tables are allocated on demand and the run crosses table and
    /// directory boundaries transparently. On failure partway through, the
    /// already-written entries stay committed (fail-fast; the caller treats
    /// the request as fatal).
    pub fn insert(
        &mut self,
        gpu_addr: u64,
        mapping: &BusMapping,
        writable: bool,
    ) -> Result<(), MmuError> {
        self.check_range(gpu_addr, mapping.page_count() * PAGE_SIZE)?;
        let mut flags = PteFlags::VALID;
        if writable {
            flags |= PteFlags::WRITABLE;
        }

        for i in 0..mapping.page_count() {
            let va = gpu_addr + i * PAGE_SIZE;
            let (pdi, pti) = indices(va);
            let table_page = self.table_for_insert(pdi)?;
            let entry_addr = table_page + pti * 4;
            let existing = Pte(self.pool.read_u32(entry_addr));
            if existing.is_valid() {
                return Err(MmuError::AlreadyMapped { gpu_addr: va });
            }
            let pte = Pte::encode(mapping.page_addr(i), flags)?;
            self.pool.write_u32(entry_addr, pte.0);
            self.tables[pdi as usize].as_mut().unwrap().valid_count += 1;
        }
        trace!(gpu_addr, pages = mapping.page_count(), "mapped range");
        Ok(())
    }

    /// Unmap `page_count` pages starting at `gpu_addr`, resetting each entry
    /// to the invalid sentinel. A page table is freed (and its directory
    /// entry invalidated) exactly when its valid-entry count reaches zero.
    pub fn clear(&mut self, gpu_addr: u64, page_count: u64) -> Result<(), MmuError> {
        self.check_range(gpu_addr, page_count * PAGE_SIZE)?;

        for i in 0..page_count {
            let va = gpu_addr + i * PAGE_SIZE;
            let (pdi, pti) = indices(va);
            let table_page = match &self.tables[pdi as usize] {
                Some(shadow) => shadow.page,
                None => return Err(MmuError::NotMapped { gpu_addr: va }),
            };
            let entry_addr = table_page + pti * 4;
            if !Pte(self.pool.read_u32(entry_addr)).is_valid() {
                return Err(MmuError::NotMapped { gpu_addr: va });
            }
            self.pool.write_u32(entry_addr, Pte::INVALID.0);

            let shadow = self.tables[pdi as usize].as_mut().unwrap();
            shadow.valid_count -= 1;
            if shadow.valid_count == 0 {
                let page = shadow.page;
                self.tables[pdi as usize] = None;
                self.pool
                    .write_u32(self.directory_page + pdi * 4, Pte::INVALID.0);
                self.pool.free_page(page);
            }
        }
        trace!(gpu_addr, page_count, "cleared range");
        Ok(())
    }

    /// Translate a GPU virtual address to a bus address.
    pub fn translate(&self, gpu_addr: u64) -> Result<u64, MmuError> {
        walk(self.pool.as_ref(), self.directory_page, gpu_addr)
    }

    /// Number of live page tables (directory entries that are valid).
    pub fn page_table_count(&self) -> usize {
        self.tables.iter().filter(|t| t.is_some()).count()
    }

    fn table_for_insert(&mut self, pdi: u64) -> Result<u64, MmuError> {
        if let Some(shadow) = &self.tables[pdi as usize] {
            return Ok(shadow.page);
        }
        let page = self.pool.alloc_page()?;
        fill_invalid(self.pool.as_ref(), page);
        let pde = Pte::encode(page, PteFlags::VALID)?;
        self.pool.write_u32(self.directory_page + pdi * 4, pde.0);
        self.tables[pdi as usize] = Some(TableShadow {
            page,
            valid_count: 0,
        });
        Ok(page)
    }

    fn check_range(&self, gpu_addr: u64, len: u64) -> Result<(), MmuError> {
        if gpu_addr % PAGE_SIZE != 0 {
            return Err(MmuError::UnalignedGpuAddress { gpu_addr });
        }
        let end = gpu_addr
            .checked_add(len)
            .ok_or(MmuError::GpuRangeOutOfBounds { gpu_addr, len })?;
        if end > 1u64 << crate::GPU_ADDR_BITS {
            return Err(MmuError::GpuRangeOutOfBounds { gpu_addr, len });
        }
        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        for shadow in self.tables.drain(..).flatten() {
            self.pool.free_page(shadow.page);
        }
        self.pool.free_page(self.directory_page);
    }
}

/// Walk the two-level tables rooted at `directory_page` through bus memory.
///
/// This is the same walk the fetch engine performs; the software GPU model
/// calls it with nothing but the root address it was programmed with.
pub(crate) fn walk<B: BusMemory + ?Sized>(
    bus: &B,
    directory_page: u64,
    gpu_addr: u64,
) -> Result<u64, MmuError> {
    if gpu_addr >> crate::GPU_ADDR_BITS != 0 {
        return Err(MmuError::TranslationFault { gpu_addr });
    }
    let (pdi, pti) = indices(gpu_addr);
    let pde = Pte(bus.read_u32(directory_page + pdi * 4));
    if !pde.is_valid() {
        return Err(MmuError::TranslationFault { gpu_addr });
    }
    let pte = Pte(bus.read_u32(pde.bus_addr() + pti * 4));
    if !pte.is_valid() {
        return Err(MmuError::TranslationFault { gpu_addr });
    }
    Ok(pte.bus_addr() + (gpu_addr & (PAGE_SIZE - 1)))
}

impl AddressSpace {
    /// Walk arbitrary tables by root address; see [`AddressSpace::translate`].
    pub fn walk_root<B: BusMemory + ?Sized>(
        bus: &B,
        root: u64,
        gpu_addr: u64,
    ) -> Result<u64, MmuError> {
        walk(bus, root, gpu_addr)
    }
}

#[inline]
fn indices(gpu_addr: u64) -> (u64, u64) {
    let pdi = (gpu_addr >> PD_SHIFT) & (PD_ENTRIES - 1);
    let pti = (gpu_addr >> PT_SHIFT) & (PT_ENTRIES - 1);
    (pdi, pti)
}

fn fill_invalid<B: BusMemory + ?Sized>(bus: &B, page: u64) {
    let mut buf = [0u8; PAGE_SIZE as usize];
    for chunk in buf.chunks_exact_mut(4) {
        chunk.copy_from_slice(&Pte::INVALID.0.to_le_bytes());
    }
    bus.write_bytes(page, &buf);
}
