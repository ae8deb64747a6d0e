//! GPU-side MMU: per-client two-level page tables.
//!
//! Each client address space owns a page directory (1024 entries) pointing at
//! page tables (1024 entries each). Every structure page lives in device-bus
//! memory and is written through the [`BusMemory`] trait, because the hardware
//! fetch engine walks the tables from bus memory — and so does the software
//! GPU model used by the integration tests.
//!
//! Entries are 32-bit encodings of a 40-bit page-aligned bus address plus
//! valid/writable/exception bits; see [`Pte`].
#![forbid(unsafe_code)]

mod aspace;
mod bus;

use bitflags::bitflags;
use thiserror::Error;

pub use aspace::AddressSpace;
pub use bus::{alloc_mapping, BusMapping, SparseBus};

/// Page size shared by GPU virtual and bus address spaces.
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Entries per page table / per page directory.
pub const PT_ENTRIES: u64 = 1024;
pub const PD_ENTRIES: u64 = 1024;

/// GPU virtual addresses are 32-bit: 10 directory bits, 10 table bits, 12
/// offset bits.
pub const GPU_ADDR_BITS: u32 = 32;

/// Bus addresses the entry encoding can express.
pub const BUS_ADDR_BITS: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MmuError {
    #[error("bus address {addr:#x} is not page-aligned")]
    UnalignedBusAddress { addr: u64 },
    #[error("bus address {addr:#x} does not fit in {BUS_ADDR_BITS} bits")]
    BusAddressTooWide { addr: u64 },
    #[error("gpu address {gpu_addr:#x} is not page-aligned")]
    UnalignedGpuAddress { gpu_addr: u64 },
    #[error("gpu range {gpu_addr:#x}+{len:#x} exceeds the {GPU_ADDR_BITS}-bit space")]
    GpuRangeOutOfBounds { gpu_addr: u64, len: u64 },
    #[error("gpu address {gpu_addr:#x} is already mapped")]
    AlreadyMapped { gpu_addr: u64 },
    #[error("gpu address {gpu_addr:#x} is not mapped")]
    NotMapped { gpu_addr: u64 },
    #[error("no translation for gpu address {gpu_addr:#x}")]
    TranslationFault { gpu_addr: u64 },
    #[error("bus page pool exhausted")]
    OutOfBusPages,
}

bitflags! {
    /// Flag bits of a page-table (or page-directory) entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const VALID = 1 << 0;
        const WRITABLE = 1 << 1;
        /// Accessing an entry with EXCEPTION set (and VALID clear) raises an
        /// MMU exception instead of completing the access.
        const EXCEPTION = 1 << 2;
    }
}

/// 32-bit page-table entry.
///
/// Layout: bits 31..12 carry `bus_addr[31:12]`, bits 11..4 carry
/// `bus_addr[39:32]`, bits 2..0 are [`PteFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(pub u32);

impl Pte {
    /// The sentinel every unmapped entry holds: fault on access, never valid.
    pub const INVALID: Pte = Pte(PteFlags::EXCEPTION.bits());

    pub fn encode(bus_addr: u64, flags: PteFlags) -> Result<Pte, MmuError> {
        if bus_addr % PAGE_SIZE != 0 {
            return Err(MmuError::UnalignedBusAddress { addr: bus_addr });
        }
        if bus_addr >> BUS_ADDR_BITS != 0 {
            return Err(MmuError::BusAddressTooWide { addr: bus_addr });
        }
        let low = (bus_addr & 0xffff_f000) as u32;
        let high = ((bus_addr >> 32) as u32 & 0xff) << 4;
        Ok(Pte(low | high | flags.bits()))
    }

    #[inline]
    pub fn bus_addr(self) -> u64 {
        let low = u64::from(self.0 & 0xffff_f000);
        let high = u64::from((self.0 >> 4) & 0xff) << 32;
        high | low
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 & PteFlags::VALID.bits() != 0
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.0 & PteFlags::WRITABLE.bits() != 0
    }
}

/// Byte-addressed access to device-bus memory.
///
/// Access is shared (`&self`): implementations front their storage with a lock
/// so the device thread, client threads, and a hardware model can all hold the
/// same `Arc<dyn BusMemory>`.
pub trait BusMemory: Send + Sync {
    fn read_bytes(&self, addr: u64, dst: &mut [u8]);
    fn write_bytes(&self, addr: u64, src: &[u8]);

    #[inline]
    fn read_u32(&self, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf);
        u32::from_le_bytes(buf)
    }

    #[inline]
    fn write_u32(&self, addr: u64, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }
}

/// A [`BusMemory`] that can also hand out and take back whole pages — the bus
/// mapper the driver pins client buffers and page tables with.
pub trait BusAllocator: BusMemory {
    /// Allocate one zeroed page, returning its bus address.
    fn alloc_page(&self) -> Result<u64, MmuError>;
    fn free_page(&self, addr: u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_roundtrips_40_bit_addresses() {
        let addr = 0xab_1234_5000u64;
        let pte = Pte::encode(addr, PteFlags::VALID | PteFlags::WRITABLE).unwrap();
        assert_eq!(pte.bus_addr(), addr);
        assert!(pte.is_valid());
        assert!(pte.is_writable());
    }

    #[test]
    fn pte_rejects_unaligned_address() {
        assert_eq!(
            Pte::encode(0x1001, PteFlags::VALID),
            Err(MmuError::UnalignedBusAddress { addr: 0x1001 })
        );
    }

    #[test]
    fn pte_rejects_address_wider_than_40_bits() {
        let addr = 1u64 << BUS_ADDR_BITS;
        assert_eq!(
            Pte::encode(addr, PteFlags::VALID),
            Err(MmuError::BusAddressTooWide { addr })
        );
    }

    #[test]
    fn invalid_sentinel_is_never_valid() {
        assert!(!Pte::INVALID.is_valid());
        assert_ne!(Pte::INVALID.0, 0);
    }
}
