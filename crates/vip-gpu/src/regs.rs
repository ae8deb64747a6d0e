//! MMIO register map of the 3D core.

/// Register offsets, in bytes from the core's MMIO base.
pub mod mmio {
    pub const CLOCK_CONTROL: u32 = 0x0000;
    /// Reading returns the pending interrupt bits and clears them.
    pub const IRQ_ACK: u32 = 0x0010;
    pub const IRQ_ENABLE: u32 = 0x0014;
    /// Writing 1 soft-resets the core.
    pub const RESET: u32 = 0x0018;

    pub const CHIP_ID: u32 = 0x0020;
    pub const CHIP_REV: u32 = 0x0024;
    pub const CHIP_DATE: u32 = 0x0028;
    pub const CHIP_OPTIONS: u32 = 0x002c;

    /// Bit 0 enables translation; bits 7..4 select the active
    /// page-table-array slot.
    pub const MMU_CONFIG: u32 = 0x0180;
    /// Slot index addressed by the following `PTA_ADDR_*` writes.
    pub const PTA_SELECT: u32 = 0x0184;
    pub const PTA_ADDR_LO: u32 = 0x0188;
    pub const PTA_ADDR_HI: u32 = 0x018c;

    /// GPU virtual address the fetch engine starts from.
    pub const FETCH_ADDR: u32 = 0x0654;
    /// Bit 16 kicks the fetch engine; low 16 bits are the prefetch count in
    /// 8-byte units.
    pub const FETCH_CONTROL: u32 = 0x0658;

    /// Fetch-engine state, captured for fault dumps.
    pub const DMA_STATUS: u32 = 0x0660;
    /// GPU virtual address the fetch engine last touched.
    pub const DMA_ADDR: u32 = 0x0664;
}

/// Bit assignments of `IRQ_ACK` / `IRQ_ENABLE`.
pub mod irq_bits {
    pub const MMU_EXCEPTION: u32 = 1 << 31;
    pub const BUS_ERROR: u32 = 1 << 30;
    /// Bits 0..=29 report completion of the correspondingly numbered event.
    pub const EVENT_MASK: u32 = (1 << 30) - 1;

    #[inline]
    pub fn event(id: u32) -> u32 {
        debug_assert!(id < 30);
        1 << id
    }
}

pub mod mmu_config {
    pub const ENABLE: u32 = 1 << 0;
    pub const SLOT_SHIFT: u32 = 4;
    pub const SLOT_MASK: u32 = 0xf << SLOT_SHIFT;

    #[inline]
    pub fn enabled_with_slot(slot: u32) -> u32 {
        ENABLE | (slot << SLOT_SHIFT)
    }
}

pub mod fetch_control {
    pub const ENABLE: u32 = 1 << 16;
    pub const PREFETCH_MASK: u32 = 0xffff;
}

/// The one core revision this driver knows how to program.
pub const SUPPORTED_CHIP_MODEL: u32 = 0x7000;
pub const SUPPORTED_CHIP_REV: u32 = 0x6214;

/// Page-table-array slots the core exposes; one per open client.
pub const PTA_SLOTS: u32 = 8;
