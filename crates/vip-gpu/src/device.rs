//! The device core: bring-up, the device thread that owns all hardware
//! state, the interrupt thread, and recovery from faults and hangs.

use std::collections::{HashMap, VecDeque};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};
use vip_mmu::{AddressSpace, BusAllocator, BusMapping, MmuError};

use crate::batch::{BatchStatus, MappedBatch};
use crate::connection::{Connection, ConnectionInner, ContextId, ContextInner};
use crate::events::{EventTable, SubmittedEvent, EVENT_SLOTS};
use crate::hal::{InterruptSource, InterruptWake, RegisterIo};
use crate::instr;
use crate::progress::{GpuProgress, Sequencer};
use crate::regs::{fetch_control, irq_bits, mmio, mmu_config, PTA_SLOTS, SUPPORTED_CHIP_MODEL, SUPPORTED_CHIP_REV};
use crate::ring::Ringbuffer;

/// Ring size in bytes. Sized so 30 in-flight batches (each at most eight
/// ring instructions) always fit with room to spare.
pub const RING_SIZE: u64 = 4096;

/// GPU virtual address of the ring, identical in every address space.
pub const RING_GPU_ADDR: u32 = 0xfff0_0000;

/// Client mappings live below the ring window.
pub const CLIENT_GPU_ADDR_BASE: u64 = 0;
pub const CLIENT_GPU_ADDR_SIZE: u64 = RING_GPU_ADDR as u64;

/// Operand of the idle-spin WAIT, in core cycles.
const IDLE_WAIT_CYCLES: u16 = 200;

#[derive(Debug, Error)]
pub enum DeviceInitError {
    #[error("unsupported chip {model:#x} rev {revision:#x}")]
    UnsupportedChip { model: u32, revision: u32 },
    #[error(transparent)]
    Mmu(#[from] MmuError),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("all {PTA_SLOTS} page-table-array slots are in use")]
    OutOfPtaSlots,
    #[error(transparent)]
    Mmu(#[from] MmuError),
}

#[derive(Debug, Error)]
#[error("device thread has shut down")]
pub struct DeviceShutdownError;

#[derive(Debug, Clone, Copy)]
pub struct ChipIdentity {
    pub model: u32,
    pub revision: u32,
    pub date: u32,
    pub options: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    ChipModel,
    ChipRevision,
    ChipDate,
    ChipOptions,
    /// Bus handle of board-level external SRAM; zero when none is fitted.
    ExternalSramHandle,
    ClientGpuAddrBase,
    ClientGpuAddrSize,
}

/// Snapshot of device-thread state, for debugging and tests.
#[derive(Debug, Clone)]
pub struct DeviceDump {
    pub last_submitted_sequence: u64,
    pub last_completed_sequence: u64,
    pub ring_head: u64,
    pub ring_tail: u64,
    pub allocated_events: usize,
    pub backlog_len: usize,
    pub configured_pta_slot: Option<u32>,
    pub dma_status: u32,
    pub dma_addr: u32,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// How long the core may go without completing anything before it is
    /// declared hung.
    pub hang_check_interval: Duration,
    /// Bus address of board-level external SRAM, reported through
    /// [`Query::ExternalSramHandle`].
    pub external_sram_addr: Option<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            hang_check_interval: Duration::from_millis(500),
            external_sram_addr: None,
        }
    }
}

pub(crate) enum DeviceRequest {
    Submit(MappedBatch),
    /// Sent by the interrupt thread, which then blocks on `ack` until the
    /// interrupt has been serviced.
    Interrupt { ack: mpsc::SyncSender<()> },
    Dump { reply: mpsc::Sender<DeviceDump> },
    Shutdown,
}

pub(crate) struct PtaSlots {
    free: Vec<u32>,
}

impl PtaSlots {
    fn new() -> Self {
        Self {
            free: (0..PTA_SLOTS).rev().collect(),
        }
    }

    fn alloc(&mut self) -> Option<u32> {
        self.free.pop()
    }

    pub(crate) fn free(&mut self, slot: u32) {
        self.free.push(slot);
    }
}

/// The driver's device object. Owns the device and interrupt threads; both
/// are joined on drop.
pub struct Device {
    queue: mpsc::Sender<DeviceRequest>,
    slots: Arc<Mutex<PtaSlots>>,
    bus: Arc<dyn BusAllocator>,
    ring_pages: Arc<BusMapping>,
    identity: ChipIdentity,
    external_sram: Option<u64>,
    irq: Arc<dyn InterruptSource>,
    device_thread: Option<JoinHandle<()>>,
    irq_thread: Option<JoinHandle<()>>,
}

impl Device {
    pub fn create(
        regs: Arc<dyn RegisterIo>,
        irq: Arc<dyn InterruptSource>,
        bus: Arc<dyn BusAllocator>,
        config: DeviceConfig,
    ) -> Result<Device, DeviceInitError> {
        let identity = ChipIdentity {
            model: regs.read32(mmio::CHIP_ID),
            revision: regs.read32(mmio::CHIP_REV),
            date: regs.read32(mmio::CHIP_DATE),
            options: regs.read32(mmio::CHIP_OPTIONS),
        };
        if identity.model != SUPPORTED_CHIP_MODEL || identity.revision != SUPPORTED_CHIP_REV {
            return Err(DeviceInitError::UnsupportedChip {
                model: identity.model,
                revision: identity.revision,
            });
        }
        info!(
            model = identity.model,
            revision = identity.revision,
            date = identity.date,
            "chip identified"
        );

        regs.write32(mmio::RESET, 1);
        regs.write32(mmio::CLOCK_CONTROL, 1);
        regs.write32(mmio::IRQ_ENABLE, !0);

        let ring = Ringbuffer::new(Arc::clone(&bus), RING_SIZE, RING_GPU_ADDR)?;
        let ring_pages = Arc::clone(ring.mapping());

        let external_sram = config.external_sram_addr;
        let (queue, rx) = mpsc::channel();
        let device_thread = {
            let regs = Arc::clone(&regs);
            let bus = Arc::clone(&bus);
            let config = config.clone();
            std::thread::Builder::new()
                .name("gpu-device".into())
                .spawn(move || DeviceThread::new(regs, bus, config, rx, ring).run())
                .expect("spawn device thread")
        };
        let irq_thread = {
            let irq = Arc::clone(&irq);
            let queue = queue.clone();
            std::thread::Builder::new()
                .name("gpu-irq".into())
                .spawn(move || loop {
                    match irq.wait() {
                        InterruptWake::Shutdown => break,
                        InterruptWake::Irq => {
                            let (ack, acked) = mpsc::sync_channel(0);
                            if queue.send(DeviceRequest::Interrupt { ack }).is_err() {
                                break;
                            }
                            let _ = acked.recv();
                        }
                    }
                })
                .expect("spawn interrupt thread")
        };

        Ok(Device {
            queue,
            slots: Arc::new(Mutex::new(PtaSlots::new())),
            bus,
            ring_pages,
            identity,
            external_sram,
            irq,
            device_thread: Some(device_thread),
            irq_thread: Some(irq_thread),
        })
    }

    /// Open a client session: allocates a page-table-array slot and a fresh
    /// address space with the ring already mapped in.
    pub fn open_connection(&self) -> Result<Connection, ConnectError> {
        let slot = self
            .slots
            .lock()
            .unwrap()
            .alloc()
            .ok_or(ConnectError::OutOfPtaSlots)?;
        match self.build_aspace() {
            Ok(aspace) => {
                debug!(slot, "connection opened");
                Ok(Connection::new(
                    slot,
                    self.queue.clone(),
                    aspace,
                    Arc::clone(&self.slots),
                ))
            }
            Err(err) => {
                self.slots.lock().unwrap().free(slot);
                Err(err.into())
            }
        }
    }

    fn build_aspace(&self) -> Result<AddressSpace, MmuError> {
        let mut aspace = AddressSpace::new(Arc::clone(&self.bus))?;
        aspace.insert(u64::from(RING_GPU_ADDR), &self.ring_pages, false)?;
        Ok(aspace)
    }

    pub fn query(&self, query: Query) -> u64 {
        match query {
            Query::ChipModel => u64::from(self.identity.model),
            Query::ChipRevision => u64::from(self.identity.revision),
            Query::ChipDate => u64::from(self.identity.date),
            Query::ChipOptions => u64::from(self.identity.options),
            Query::ExternalSramHandle => self.external_sram.unwrap_or(0),
            Query::ClientGpuAddrBase => CLIENT_GPU_ADDR_BASE,
            Query::ClientGpuAddrSize => CLIENT_GPU_ADDR_SIZE,
        }
    }

    pub fn chip_identity(&self) -> ChipIdentity {
        self.identity
    }

    /// Snapshot and log the device thread's view of the world.
    pub fn dump_status(&self) -> Result<DeviceDump, DeviceShutdownError> {
        let (reply, rx) = mpsc::channel();
        self.queue
            .send(DeviceRequest::Dump { reply })
            .map_err(|_| DeviceShutdownError)?;
        rx.recv().map_err(|_| DeviceShutdownError)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = self.queue.send(DeviceRequest::Shutdown);
        self.irq.unblock();
        if let Some(handle) = self.device_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.irq_thread.take() {
            let _ = handle.join();
        }
    }
}

struct DeviceThread {
    regs: Arc<dyn RegisterIo>,
    bus: Arc<dyn BusAllocator>,
    config: DeviceConfig,
    rx: mpsc::Receiver<DeviceRequest>,
    ring: Ringbuffer,
    events: EventTable,
    backlog: VecDeque<MappedBatch>,
    sequencer: Sequencer,
    progress: GpuProgress,
    /// Directory root currently programmed into each slot's PTA registers.
    programmed_roots: HashMap<u32, u64>,
    configured_slot: Option<u32>,
    configured_aspace: Option<Arc<Mutex<AddressSpace>>>,
    /// Context whose state the core last executed, for context-state
    /// restore decisions.
    last_context: Option<ContextId>,
    /// Offset of the steady WAIT-LINK's LINK; None until the ring starts.
    link_offset: Option<u64>,
}

impl DeviceThread {
    fn new(
        regs: Arc<dyn RegisterIo>,
        bus: Arc<dyn BusAllocator>,
        config: DeviceConfig,
        rx: mpsc::Receiver<DeviceRequest>,
        ring: Ringbuffer,
    ) -> Self {
        Self {
            regs,
            bus,
            config,
            rx,
            ring,
            events: EventTable::new(),
            backlog: VecDeque::new(),
            sequencer: Sequencer::new(),
            progress: GpuProgress::new(),
            programmed_roots: HashMap::new(),
            configured_slot: None,
            configured_aspace: None,
            last_context: None,
            link_offset: None,
        }
    }

    fn run(mut self) {
        debug!("device thread running");
        loop {
            let timeout = match self.progress.hang_deadline(self.config.hang_check_interval) {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::from_secs(3600),
            };
            match self.rx.recv_timeout(timeout) {
                Ok(DeviceRequest::Shutdown) => break,
                Ok(DeviceRequest::Submit(batch)) => self.submit(batch),
                Ok(DeviceRequest::Interrupt { ack }) => {
                    self.service_interrupt();
                    let _ = ack.send(());
                }
                Ok(DeviceRequest::Dump { reply }) => {
                    let _ = reply.send(self.dump());
                }
                Err(mpsc::RecvTimeoutError::Timeout) => self.check_for_hang(),
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.regs.write32(mmio::RESET, 1);
        for event in self.events.take_submitted() {
            event.batch.fence().signal(BatchStatus::DeviceShutdown);
        }
        for batch in self.backlog.drain(..) {
            batch.fence().signal(BatchStatus::DeviceShutdown);
        }
        debug!("device thread stopped");
    }

    /// Batches that must be answered without touching hardware.
    fn refuse(&self, batch: &MappedBatch) -> Option<BatchStatus> {
        if let Some(context) = batch.context() {
            match context.upgrade() {
                None => return Some(BatchStatus::ContextKilled),
                Some(context) if context.is_killed() => {
                    return Some(BatchStatus::ContextKilled)
                }
                Some(_) => {}
            }
        }
        if let MappedBatch::Command(command) = batch {
            if let Err(err) = command.validate() {
                debug!(%err, "rejecting command buffer");
                return Some(BatchStatus::Rejected(err));
            }
        }
        None
    }

    fn submit(&mut self, batch: MappedBatch) {
        if let Some(status) = self.refuse(&batch) {
            batch.fence().signal(status);
            return;
        }
        // Anything already parked goes first; never overtake the backlog.
        if !self.backlog.is_empty() || !self.events.has_free() {
            trace!("backlogging submission");
            self.backlog.push_back(batch);
            return;
        }
        let event_id = self.events.alloc().unwrap();
        if let Err(batch) = self.write_batch(event_id, batch) {
            self.events.release(event_id);
            self.backlog.push_front(batch);
        }
    }

    fn drain_backlog(&mut self) {
        loop {
            let refused = match self.backlog.front() {
                None => return,
                Some(batch) => self.refuse(batch),
            };
            if let Some(status) = refused {
                let batch = self.backlog.pop_front().unwrap();
                batch.fence().signal(status);
                continue;
            }
            if !self.events.has_free() {
                return;
            }
            let batch = self.backlog.pop_front().unwrap();
            let event_id = self.events.alloc().unwrap();
            if let Err(batch) = self.write_batch(event_id, batch) {
                self.events.release(event_id);
                self.backlog.push_front(batch);
                return;
            }
        }
    }

    /// Resolve the objects a batch executes on behalf of. None means the
    /// owner is gone and the batch cannot run.
    fn resolve(
        &self,
        batch: &MappedBatch,
    ) -> Option<(Arc<ConnectionInner>, Option<Arc<ContextInner>>)> {
        match batch {
            MappedBatch::Command(_) | MappedBatch::Event(_) => {
                let context = batch.context().unwrap().upgrade()?;
                let connection = context.connection.upgrade()?;
                Some((connection, Some(context)))
            }
            MappedBatch::MappingRelease(release) => {
                let connection = release.connection.upgrade()?;
                Some((connection, None))
            }
        }
    }

    /// Program the hardware for one batch: PTA slot, address-space switch,
    /// payload links, and the trailing EVENT / WAIT / LINK group.
    ///
    /// Gives the batch back untouched when the ring has no room for it.
    fn write_batch(&mut self, event_id: u32, mut batch: MappedBatch) -> Result<(), MappedBatch> {
        let Some((connection, context)) = self.resolve(&batch) else {
            self.events.release(event_id);
            batch.fence().signal(BatchStatus::ContextKilled);
            return Ok(());
        };
        let slot = connection.pta_slot();
        let aspace = Arc::clone(&connection.aspace);

        let root = aspace.lock().unwrap().root_bus_addr();
        if self.programmed_roots.get(&slot) != Some(&root) {
            self.regs.write32(mmio::PTA_SELECT, slot);
            self.regs.write32(mmio::PTA_ADDR_LO, root as u32);
            self.regs.write32(mmio::PTA_ADDR_HI, (root >> 32) as u32);
            self.programmed_roots.insert(slot, root);
            trace!(slot, root, "programmed page-table root");
        }

        let starting = self.link_offset.is_none();
        // Slots are recycled across connections, so the switch decision is on
        // the address space itself, never the slot number.
        let same_space = self
            .configured_aspace
            .as_ref()
            .is_some_and(|configured| Arc::ptr_eq(configured, &aspace));
        let need_switch = !starting && !same_space;
        let startup_len = if starting { 2 * instr::INSTRUCTION_SIZE } else { 0 };
        let switch_len = if need_switch { 5 * instr::INSTRUCTION_SIZE } else { 0 };
        let group_len = 3 * instr::INSTRUCTION_SIZE;
        if !self.ring.reserve_contiguous(startup_len + switch_len + group_len) {
            warn!("ring full; parking batch");
            return Err(batch);
        }

        let base = self.ring.tail();
        let switch_offset = base + startup_len;
        let event_offset = switch_offset + switch_len;
        let wait_offset = event_offset + instr::INSTRUCTION_SIZE;
        let new_link_offset = wait_offset + instr::INSTRUCTION_SIZE;

        // Where the spliced (or switch-block) LINK sends the core, and how
        // many instructions it prefetches there.
        let (target_va, target_units) = match &batch {
            MappedBatch::Command(command) => {
                let payload = &command.payload;
                // The payload re-enters the ring at the EVENT.
                let back = instr::link(3, self.ring.gpu_addr(event_offset));
                payload.mapping.bus().write(
                    self.bus.as_ref(),
                    payload.offset + payload.length,
                    &instr::to_bytes(back),
                );

                let context_id = context.as_ref().map(|c| c.id);
                let restore = command
                    .context_state
                    .as_ref()
                    .filter(|_| self.last_context != context_id);
                match restore {
                    Some(state) => {
                        // Chain: context state first, then the payload.
                        let chain = instr::link(payload.units_with_link(), payload.gpu_addr());
                        state.mapping.bus().write(
                            self.bus.as_ref(),
                            state.offset + state.length,
                            &instr::to_bytes(chain),
                        );
                        (state.gpu_addr(), state.units_with_link())
                    }
                    None => (payload.gpu_addr(), payload.units_with_link()),
                }
            }
            MappedBatch::Event(_) | MappedBatch::MappingRelease(_) => {
                (self.ring.gpu_addr(event_offset), 3)
            }
        };

        if starting {
            self.start_ring(slot, base);
            self.configured_slot = Some(slot);
            self.configured_aspace = Some(Arc::clone(&aspace));
        }

        let prev_address_space = if need_switch {
            self.ring.write_instruction(instr::mmu_select(slot));
            self.ring.write_instruction(instr::mmu_flush());
            self.ring.write_instruction(instr::semaphore());
            self.ring.write_instruction(instr::stall());
            self.ring.write_instruction(instr::link(target_units, target_va));
            self.configured_slot = Some(slot);
            self.configured_aspace.replace(Arc::clone(&aspace))
        } else {
            None
        };

        debug_assert_eq!(self.ring.tail(), event_offset);
        self.ring.write_instruction(instr::event(event_id));
        self.ring.write_instruction(instr::wait(IDLE_WAIT_CYCLES));
        self.ring
            .write_instruction(instr::link(2, self.ring.gpu_addr(wait_offset)));

        let sequence = self.sequencer.next_sequence();
        batch.set_sequence(sequence);
        if let (MappedBatch::Command(_), Some(context)) = (&batch, &context) {
            self.last_context = Some(context.id);
        }

        // Hand the core the new group: repoint the old steady LINK, data
        // word first.
        let (splice_va, splice_units) = if need_switch {
            (self.ring.gpu_addr(switch_offset), 5)
        } else {
            (target_va, target_units)
        };
        let prev_link = self.link_offset.replace(new_link_offset).unwrap();
        let spliced = self
            .ring
            .splice_link(prev_link, instr::link(splice_units, splice_va));
        debug_assert!(spliced, "steady link at {prev_link:#x} was not live");

        trace!(
            event_id,
            sequence,
            slot,
            ring_tail = self.ring.tail(),
            "batch on hardware"
        );
        self.progress.submitted(sequence, Instant::now());
        if let Err(err) = self.events.write(
            event_id,
            SubmittedEvent {
                free_on_complete: true,
                ringbuffer_offset: event_offset,
                batch,
                prev_address_space,
            },
        ) {
            warn!(%err, "event slot in unexpected state");
        }
        Ok(())
    }

    /// First submission after creation or reset: write the idle WAIT-LINK
    /// pair at `base`, configure the MMU, and kick the fetch engine at it.
    fn start_ring(&mut self, slot: u32, base: u64) {
        self.regs
            .write32(mmio::MMU_CONFIG, mmu_config::enabled_with_slot(slot));

        debug_assert_eq!(self.ring.tail(), base);
        self.ring.write_instruction(instr::wait(IDLE_WAIT_CYCLES));
        self.ring
            .write_instruction(instr::link(2, self.ring.gpu_addr(base)));
        self.link_offset = Some(base + instr::INSTRUCTION_SIZE);

        self.regs.write32(mmio::FETCH_ADDR, self.ring.gpu_addr(base));
        self.regs
            .write32(mmio::FETCH_CONTROL, fetch_control::ENABLE | 2);
        debug!(slot, "ring started");
    }

    fn service_interrupt(&mut self) {
        let status = self.regs.read32(mmio::IRQ_ACK);
        trace!(status = format_args!("{status:#010x}"), "interrupt");
        if status & (irq_bits::MMU_EXCEPTION | irq_bits::BUS_ERROR) != 0 {
            self.fault(status);
        } else {
            // Several completions can arrive in one read. Slot ids wrap as
            // slots are reused, so retire by sequence number: the ring head
            // must only ever move forward.
            let mut completed: Vec<(u64, u32)> = (0..EVENT_SLOTS)
                .filter(|&id| status & irq_bits::event(id) != 0)
                .filter_map(|id| self.events.submitted_sequence(id).map(|seq| (seq, id)))
                .collect();
            completed.sort_unstable();
            for (_, id) in completed {
                self.complete_event(id);
            }
        }
        self.drain_backlog();
    }

    fn complete_event(&mut self, id: u32) {
        let event = match self.events.complete(id) {
            Ok(event) => event,
            Err(err) => {
                warn!(%err, "spurious event interrupt");
                return;
            }
        };
        self.ring.advance_head(event.ringbuffer_offset);
        self.progress
            .completed(event.batch.sequence(), Instant::now());
        // A switch event completing means the old space is no longer live.
        drop(event.prev_address_space);
        match event.batch {
            MappedBatch::MappingRelease(release) => {
                debug!(count = release.mappings.len(), "deferred mappings released");
                drop(release.mappings);
                release.fence.signal(BatchStatus::Completed);
            }
            batch => batch.fence().signal(BatchStatus::Completed),
        }
        trace!(event = id, "event completed");
    }

    fn fault(&mut self, status: u32) {
        error!(
            status = format_args!("{status:#010x}"),
            dma_status = format_args!("{:#010x}", self.regs.read32(mmio::DMA_STATUS)),
            dma_addr = format_args!("{:#010x}", self.regs.read32(mmio::DMA_ADDR)),
            "gpu fault"
        );
        self.kill_current_and_reset();
    }

    fn check_for_hang(&mut self) {
        let Some(deadline) = self.progress.hang_deadline(self.config.hang_check_interval) else {
            return;
        };
        if Instant::now() < deadline {
            return;
        }
        error!(
            last_submitted = self.progress.last_submitted(),
            last_completed = self.progress.last_completed(),
            "gpu hang detected"
        );
        self.kill_current_and_reset();
    }

    /// Kill the context of the oldest in-flight batch (the one the core was
    /// executing) and reset; everyone else's work is resubmitted.
    fn kill_current_and_reset(&mut self) {
        let victim = self
            .events
            .oldest_submitted()
            .and_then(|event| event.batch.context())
            .and_then(|context| context.upgrade());
        match victim {
            Some(context) => context.kill(),
            None => warn!("fault with no in-flight batch to attribute"),
        }
        self.reset();
    }

    /// Soft-reset the core and rebuild: in-flight batches go back ahead of
    /// the backlog in submission order, then everything is resubmitted.
    /// Batches of killed contexts are answered instead.
    fn reset(&mut self) {
        info!("resetting device");
        self.regs.write32(mmio::RESET, 1);
        self.regs.write32(mmio::CLOCK_CONTROL, 1);
        self.regs.write32(mmio::IRQ_ENABLE, !0);

        let mut pending = self.events.take_submitted();
        pending.sort_by_key(|event| event.batch.sequence());

        self.ring.reset();
        self.link_offset = None;
        self.configured_slot = None;
        self.configured_aspace = None;
        self.last_context = None;
        self.programmed_roots.clear();
        self.progress.reset();

        for event in pending.into_iter().rev() {
            self.backlog.push_front(event.batch);
        }
        self.drain_backlog();
    }

    fn dump(&self) -> DeviceDump {
        let dump = DeviceDump {
            last_submitted_sequence: self.progress.last_submitted(),
            last_completed_sequence: self.progress.last_completed(),
            ring_head: self.ring.head(),
            ring_tail: self.ring.tail(),
            allocated_events: self.events.allocated_count(),
            backlog_len: self.backlog.len(),
            configured_pta_slot: self.configured_slot,
            dma_status: self.regs.read32(mmio::DMA_STATUS),
            dma_addr: self.regs.read32(mmio::DMA_ADDR),
        };
        info!(?dump, "device status");
        dump
    }
}
