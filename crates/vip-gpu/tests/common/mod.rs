//! A software model of the 3D core, faithful enough to drive the whole
//! driver stack: it walks the page tables from the programmed root, fetches
//! and decodes ring instructions, parks on the idle WAIT-LINK until bus
//! memory changes, and raises completion and fault interrupts.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use vip_gpu::device::{Device, DeviceConfig};
use vip_gpu::hal::{InterruptSource, InterruptWake, RegisterIo};
use vip_gpu::instr;
use vip_gpu::regs::{fetch_control, irq_bits, mmio, mmu_config};
use vip_mmu::{AddressSpace, BusMemory, SparseBus};

const CHIP_DATE: u32 = 0x2018_0105;

#[derive(Default)]
struct ModelState {
    pta: [u64; 16],
    pta_select: u32,
    mmu_config: u32,
    irq_status: u32,
    irq_enable: u32,
    fetch_addr: u32,
    dma_status: u32,
    dma_addr: u32,
    running: bool,
    /// Fetch address armed by the last FETCH_CONTROL kick.
    kick: Option<u32>,
    /// Bumped on every reset and kick so a stale fetch loop notices.
    epoch: u64,
    shutdown: bool,
}

struct ModelShared {
    bus: Arc<SparseBus>,
    state: Mutex<ModelState>,
    irq_cv: Condvar,
    run_cv: Condvar,
}

impl ModelShared {
    fn raise_irq(&self, state: &mut ModelState, bits: u32) {
        state.irq_status |= bits;
        self.irq_cv.notify_all();
    }
}

/// The MMIO window and interrupt line of the modelled core.
pub struct ModelHandle {
    shared: Arc<ModelShared>,
}

impl RegisterIo for ModelHandle {
    fn read32(&self, offset: u32) -> u32 {
        let mut state = self.shared.state.lock().unwrap();
        match offset {
            mmio::CHIP_ID => 0x7000,
            mmio::CHIP_REV => 0x6214,
            mmio::CHIP_DATE => CHIP_DATE,
            mmio::CHIP_OPTIONS => 0,
            mmio::IRQ_ACK => std::mem::take(&mut state.irq_status),
            mmio::DMA_STATUS => state.dma_status,
            mmio::DMA_ADDR => state.dma_addr,
            _ => 0,
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut state = self.shared.state.lock().unwrap();
        match offset {
            mmio::RESET => {
                state.running = false;
                state.kick = None;
                state.epoch += 1;
                state.irq_status = 0;
                state.mmu_config = 0;
                state.dma_status = 0;
                state.dma_addr = 0;
                self.shared.run_cv.notify_all();
            }
            mmio::CLOCK_CONTROL => {}
            mmio::IRQ_ENABLE => state.irq_enable = value,
            mmio::MMU_CONFIG => state.mmu_config = value,
            mmio::PTA_SELECT => state.pta_select = value & 0xf,
            mmio::PTA_ADDR_LO => {
                let slot = state.pta_select as usize;
                state.pta[slot] = (state.pta[slot] & !0xffff_ffff) | u64::from(value);
            }
            mmio::PTA_ADDR_HI => {
                let slot = state.pta_select as usize;
                state.pta[slot] =
                    (state.pta[slot] & 0xffff_ffff) | (u64::from(value) << 32);
            }
            mmio::FETCH_ADDR => state.fetch_addr = value,
            mmio::FETCH_CONTROL => {
                if value & fetch_control::ENABLE != 0 {
                    state.kick = Some(state.fetch_addr);
                    state.running = true;
                    state.epoch += 1;
                    self.shared.run_cv.notify_all();
                }
            }
            _ => {}
        }
    }
}

impl InterruptSource for ModelHandle {
    fn wait(&self) -> InterruptWake {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.shutdown {
                return InterruptWake::Shutdown;
            }
            if state.irq_status & state.irq_enable != 0 {
                return InterruptWake::Irq;
            }
            state = self.shared.irq_cv.wait(state).unwrap();
        }
    }

    fn unblock(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.shutdown = true;
        self.shared.irq_cv.notify_all();
        self.shared.run_cv.notify_all();
    }
}

pub struct GpuModel {
    pub handle: Arc<ModelHandle>,
    walker: Option<JoinHandle<()>>,
}

impl GpuModel {
    pub fn new(bus: Arc<SparseBus>) -> Self {
        let shared = Arc::new(ModelShared {
            bus,
            state: Mutex::new(ModelState::default()),
            irq_cv: Condvar::new(),
            run_cv: Condvar::new(),
        });
        let walker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("gpu-model".into())
                .spawn(move || fetch_engine(&shared))
                .expect("spawn model thread")
        };
        Self {
            handle: Arc::new(ModelHandle { shared }),
            walker: Some(walker),
        }
    }
}

impl Drop for GpuModel {
    fn drop(&mut self) {
        self.handle.unblock();
        if let Some(walker) = self.walker.take() {
            let _ = walker.join();
        }
    }
}

/// The fetch engine proper: runs until shut down, executing one kick at a
/// time.
fn fetch_engine(shared: &ModelShared) {
    loop {
        // Park until kicked.
        let (mut pc, epoch) = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutdown {
                    return;
                }
                if state.running {
                    if let Some(addr) = state.kick.take() {
                        break (u64::from(addr), state.epoch);
                    }
                }
                state = shared.run_cv.wait(state).unwrap();
            }
        };

        let mut visited: HashSet<u64> = HashSet::new();
        let mut generation = shared.bus.write_generation();
        loop {
            // Snapshot the registers that steer this instruction; bail out
            // if a reset or re-kick superseded this fetch loop.
            let (root, translate) = {
                let mut state = shared.state.lock().unwrap();
                if state.shutdown {
                    return;
                }
                if !state.running || state.epoch != epoch {
                    break;
                }
                state.dma_addr = pc as u32;
                let slot =
                    ((state.mmu_config & mmu_config::SLOT_MASK) >> mmu_config::SLOT_SHIFT) as usize;
                (state.pta[slot], state.mmu_config & mmu_config::ENABLE != 0)
            };

            // Re-reaching an address without any bus write in between means
            // the engine is spinning (the idle WAIT-LINK); sleep on the bus
            // instead of burning the CPU.
            if !visited.insert(pc) {
                generation = shared.bus.wait_for_write(generation, Duration::from_millis(10));
                visited.clear();
                continue;
            }

            let bus_addr = if translate {
                match AddressSpace::walk_root(shared.bus.as_ref(), root, pc) {
                    Ok(addr) => addr,
                    Err(_) => {
                        let mut state = shared.state.lock().unwrap();
                        state.running = false;
                        state.dma_status = 1;
                        state.dma_addr = pc as u32;
                        shared.raise_irq(&mut state, irq_bits::MMU_EXCEPTION);
                        break;
                    }
                }
            } else {
                pc
            };
            let op_word = shared.bus.read_u32(bus_addr);
            let data = shared.bus.read_u32(bus_addr + 4);

            match instr::opcode(op_word) {
                instr::OP_LINK => pc = u64::from(data),
                instr::OP_WAIT | instr::OP_STALL => pc += instr::INSTRUCTION_SIZE,
                instr::OP_END => {
                    let mut state = shared.state.lock().unwrap();
                    state.running = false;
                    break;
                }
                instr::OP_LOAD_STATE => {
                    let mut state = shared.state.lock().unwrap();
                    match instr::operand(op_word) {
                        instr::state::EVENT => {
                            shared.raise_irq(&mut state, irq_bits::event(data & 0x1f));
                        }
                        instr::state::MMU_CONFIG => state.mmu_config = data,
                        instr::state::MMU_FLUSH | instr::state::SEMAPHORE => {}
                        _ => {}
                    }
                    drop(state);
                    pc += instr::INSTRUCTION_SIZE;
                }
                _ => {
                    let mut state = shared.state.lock().unwrap();
                    state.running = false;
                    state.dma_status = 2;
                    state.dma_addr = pc as u32;
                    shared.raise_irq(&mut state, irq_bits::BUS_ERROR);
                    break;
                }
            }
        }
    }
}

/// A complete rig: sparse bus, modelled core, and the driver on top.
pub struct TestRig {
    // Field order matters: the device joins its threads (and quiesces the
    // model) before the model itself is torn down.
    pub device: Device,
    model: GpuModel,
    pub bus: Arc<SparseBus>,
}

pub fn setup() -> TestRig {
    setup_with(DeviceConfig::default())
}

pub fn setup_with(config: DeviceConfig) -> TestRig {
    init_tracing();
    let bus = Arc::new(SparseBus::new());
    let model = GpuModel::new(Arc::clone(&bus));
    let regs = model.handle.clone() as Arc<dyn RegisterIo>;
    let irq = model.handle.clone() as Arc<dyn InterruptSource>;
    let device = Device::create(regs, irq, bus.clone(), config).expect("device bring-up");
    TestRig { device, model, bus }
}

/// Write a client-authored instruction stream into a mapped buffer.
pub fn write_payload(
    bus: &SparseBus,
    mapping: &vip_gpu::GpuMapping,
    offset: u64,
    instructions: &[instr::Instruction],
) {
    let mut bytes = Vec::with_capacity(instructions.len() * 8);
    for &instruction in instructions {
        bytes.extend_from_slice(&instr::to_bytes(instruction));
    }
    mapping.bus().write(bus, offset, &bytes);
}

/// A harmless payload of `count` instructions.
pub fn nop_payload(count: usize) -> Vec<instr::Instruction> {
    vec![instr::semaphore(); count]
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
