//! The command ring buffer.
//!
//! The ring lives in pinned bus pages and is mapped at the same GPU virtual
//! address in every client address space, so the fetch engine can keep
//! spinning on its WAIT-LINK across address-space switches. The device thread
//! is the only writer; hardware only ever reads it.

use std::sync::Arc;

use vip_mmu::{alloc_mapping, BusAllocator, BusMapping, MmuError};

use crate::instr::{Instruction, INSTRUCTION_SIZE};

/// Bytes withheld from every reservation so a full ring can never make the
/// tail catch back up to the head and look empty.
pub const RESERVED_PAD: u64 = 4;

pub struct Ringbuffer {
    mapping: Arc<BusMapping>,
    bus: Arc<dyn BusAllocator>,
    size: u64,
    gpu_addr: u32,
    head: u64,
    tail: u64,
}

impl Ringbuffer {
    /// Allocate a ring of `size` bytes (a power of two, whole pages) that
    /// will be mapped at `gpu_addr` in every address space.
    pub fn new(bus: Arc<dyn BusAllocator>, size: u64, gpu_addr: u32) -> Result<Self, MmuError> {
        assert!(size.is_power_of_two());
        let mapping = alloc_mapping(Arc::clone(&bus), size)?;
        Ok(Self {
            mapping: Arc::new(mapping),
            bus,
            size,
            gpu_addr,
            head: 0,
            tail: 0,
        })
    }

    /// The pinned pages backing the ring, for mapping into client address
    /// spaces.
    pub fn mapping(&self) -> &Arc<BusMapping> {
        &self.mapping
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// GPU virtual address of a byte offset into the ring.
    pub fn gpu_addr(&self, offset: u64) -> u32 {
        debug_assert!(offset < self.size);
        self.gpu_addr + offset as u32
    }

    fn used(&self) -> u64 {
        if self.tail >= self.head {
            self.tail - self.head
        } else {
            self.size - self.head + self.tail
        }
    }

    /// Claim room for `bytes` of instructions that hardware will fetch
    /// linearly from the resulting tail.
    ///
    /// Instruction groups are only ever entered through a LINK, so when the
    /// run between the tail and the end of the buffer is too short the tail
    /// skips to offset zero and the dead run is simply never fetched. Returns
    /// false when the span (plus [`RESERVED_PAD`]) would overrun the head;
    /// the caller must wait for completions to advance it.
    pub fn reserve_contiguous(&mut self, bytes: u64) -> bool {
        if bytes == 0 || bytes % INSTRUCTION_SIZE != 0 {
            return false;
        }
        if self.tail + bytes <= self.size && self.used() + bytes + RESERVED_PAD <= self.size {
            return true;
        }
        // Wrapping over live data is only legal while the free span itself
        // wraps, i.e. head is at or behind the tail.
        if self.head <= self.tail {
            let dead = self.size - self.tail;
            if self.used() + dead + bytes + RESERVED_PAD <= self.size {
                self.tail = 0;
                return true;
            }
        }
        false
    }

    /// Append one instruction at the tail.
    pub fn write_instruction(&mut self, instr: Instruction) {
        debug_assert!(self.tail + INSTRUCTION_SIZE <= self.size);
        self.mapping
            .write(self.bus.as_ref(), self.tail, &crate::instr::to_bytes(instr));
        self.tail = (self.tail + INSTRUCTION_SIZE) % self.size;
    }

    /// True when `offset` holds instructions the hardware has not consumed.
    pub fn is_offset_populated(&self, offset: u64) -> bool {
        if offset >= self.size {
            return false;
        }
        if self.head <= self.tail {
            self.head <= offset && offset < self.tail
        } else {
            offset >= self.head || offset < self.tail
        }
    }

    /// Rewrite the LINK at `offset`, data word before opcode word.
    ///
    /// The fetch engine idling on the adjacent WAIT re-reads this slot; it
    /// must never observe a new opcode paired with the old target, so the
    /// target lands first.
    pub fn splice_link(&mut self, offset: u64, instr: Instruction) -> bool {
        if offset % INSTRUCTION_SIZE != 0 || !self.is_offset_populated(offset) {
            return false;
        }
        self.mapping
            .write(self.bus.as_ref(), offset + 4, &instr[1].to_le_bytes());
        self.mapping
            .write(self.bus.as_ref(), offset, &instr[0].to_le_bytes());
        true
    }

    /// Retire everything before `offset`; called when the event written
    /// at the end of a group completes.
    pub fn advance_head(&mut self, offset: u64) {
        debug_assert!(offset < self.size);
        self.head = offset;
    }

    /// Forget all contents after a core reset.
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr;
    use vip_mmu::{BusMemory, SparseBus};

    fn ring(size: u64) -> (Arc<SparseBus>, Ringbuffer) {
        let bus = Arc::new(SparseBus::new());
        let ring = Ringbuffer::new(bus.clone(), size, 0xfff0_0000).unwrap();
        (bus, ring)
    }

    #[test]
    fn reserve_keeps_the_disambiguation_pad() {
        let (_bus, mut ring) = ring(4096);
        assert!(!ring.reserve_contiguous(4096));
        assert!(!ring.reserve_contiguous(4096 - RESERVED_PAD));
        assert!(ring.reserve_contiguous(4096 - 8));
    }

    #[test]
    fn reserve_rejects_non_instruction_sizes() {
        let (_bus, mut ring) = ring(4096);
        assert!(!ring.reserve_contiguous(0));
        assert!(!ring.reserve_contiguous(12));
    }

    #[test]
    fn reserve_skips_dead_tail_run() {
        let (_bus, mut ring) = ring(4096);
        // Fill most of the ring, then retire all but the last group.
        for _ in 0..500 {
            ring.write_instruction(instr::wait(1));
        }
        ring.advance_head(496 * 8);
        assert_eq!(ring.tail(), 4000);

        // 96 bytes left at the end; a 256-byte group must continue at zero.
        assert!(ring.reserve_contiguous(256));
        assert_eq!(ring.tail(), 0);
        // The retired prefix is free, the live suffix is not.
        assert!(ring.is_offset_populated(496 * 8));
        assert!(!ring.is_offset_populated(0));
    }

    #[test]
    fn reserve_fails_when_head_blocks_the_span() {
        let (_bus, mut ring) = ring(4096);
        for _ in 0..500 {
            ring.write_instruction(instr::wait(1));
        }
        // Only the first two instructions retired: 16 bytes free in front of
        // the head plus the 96-byte tail run, nowhere for 128 bytes.
        ring.advance_head(16);
        assert!(!ring.reserve_contiguous(128));
        // Draining the ring makes room again.
        ring.advance_head(4000);
        assert!(ring.reserve_contiguous(128));
    }

    #[test]
    fn populated_tracks_head_and_tail() {
        let (_bus, mut ring) = ring(4096);
        assert!(!ring.is_offset_populated(0));
        ring.write_instruction(instr::wait(1));
        ring.write_instruction(instr::wait(1));
        assert!(ring.is_offset_populated(0));
        assert!(ring.is_offset_populated(8));
        assert!(!ring.is_offset_populated(16));
        ring.advance_head(8);
        assert!(!ring.is_offset_populated(0));
        assert!(ring.is_offset_populated(8));
    }

    #[test]
    fn splice_writes_data_word_then_opcode_word() {
        let (bus, mut ring) = ring(4096);
        ring.write_instruction(instr::wait(200));
        ring.write_instruction(instr::link(2, ring.gpu_addr(0)));

        assert!(ring.splice_link(8, instr::link(3, 0x1000_0000)));
        let base = ring.mapping().page_addr(0);
        assert_eq!(bus.read_u32(base + 8), instr::link(3, 0x1000_0000)[0]);
        assert_eq!(bus.read_u32(base + 12), 0x1000_0000);

        // Unpopulated offsets are refused.
        assert!(!ring.splice_link(64, instr::link(1, 0)));
    }
}
