//! Command-stream instruction encoding.
//!
//! Every instruction is two little-endian 32-bit words. The top 16 bits of
//! the first word carry the opcode, the low 16 bits an operand; the second
//! word is data (a register value, a link target, or unused).

/// Bytes per instruction; ring offsets and batch lengths are multiples of it.
pub const INSTRUCTION_SIZE: u64 = 8;

pub type Instruction = [u32; 2];

pub const OP_LOAD_STATE: u16 = 0x0801;
pub const OP_END: u16 = 0x1002;
pub const OP_WAIT: u16 = 0x3802;
pub const OP_LINK: u16 = 0x4002;
pub const OP_STALL: u16 = 0x4802;

/// State registers addressed by `LOAD_STATE`.
pub mod state {
    /// Writing an event id here raises the matching interrupt bit.
    pub const EVENT: u16 = 0x0e01;
    pub const SEMAPHORE: u16 = 0x0e02;
    /// Mirrors the MMU_CONFIG MMIO register, switchable from the stream.
    pub const MMU_CONFIG: u16 = 0x0061;
    /// Any write invalidates the translation cache.
    pub const MMU_FLUSH: u16 = 0x0062;
}

/// Little-endian wire form, as written to bus memory.
#[inline]
pub fn to_bytes(instr: Instruction) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&instr[0].to_le_bytes());
    bytes[4..].copy_from_slice(&instr[1].to_le_bytes());
    bytes
}

#[inline]
pub fn opcode(word: u32) -> u16 {
    (word >> 16) as u16
}

#[inline]
pub fn operand(word: u32) -> u16 {
    word as u16
}

#[inline]
pub fn load_state(reg: u16, value: u32) -> Instruction {
    [(u32::from(OP_LOAD_STATE) << 16) | u32::from(reg), value]
}

/// Signal event `id` (0..=29) once the fetch engine reaches this point.
#[inline]
pub fn event(id: u32) -> Instruction {
    debug_assert!(id < 30);
    load_state(state::EVENT, id)
}

/// Idle for `cycles` before fetching the next instruction. Paired with a
/// [`link`] back to itself it forms the ring's idle spin.
#[inline]
pub fn wait(cycles: u16) -> Instruction {
    [(u32::from(OP_WAIT) << 16) | u32::from(cycles), 0]
}

/// Redirect fetch to `gpu_addr`, prefetching `units` 8-byte instructions.
#[inline]
pub fn link(units: u16, gpu_addr: u32) -> Instruction {
    [(u32::from(OP_LINK) << 16) | u32::from(units), gpu_addr]
}

#[inline]
pub fn semaphore() -> Instruction {
    load_state(state::SEMAPHORE, 0)
}

/// Stall the front end until the outstanding semaphore clears.
#[inline]
pub fn stall() -> Instruction {
    [u32::from(OP_STALL) << 16, 0]
}

/// Halt the fetch engine.
#[inline]
pub fn end() -> Instruction {
    [u32::from(OP_END) << 16, 0]
}

/// Select page-table-array slot `slot` from the stream.
#[inline]
pub fn mmu_select(slot: u32) -> Instruction {
    load_state(state::MMU_CONFIG, crate::regs::mmu_config::enabled_with_slot(slot))
}

#[inline]
pub fn mmu_flush() -> Instruction {
    load_state(state::MMU_FLUSH, 1)
}
