//! Client-facing objects: connections, contexts, and GPU mappings.
//!
//! A connection owns one address space and one page-table-array slot; its
//! contexts share both. Clients call in from their own threads; everything
//! that touches hardware is marshalled to the device thread through the
//! request channel.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};

use thiserror::Error;
use tracing::{debug, trace, warn};
use vip_mmu::{AddressSpace, BusMapping, MmuError};

use crate::batch::{
    BatchFence, BatchResource, CommandBatch, CommandBuffer, EventBatch, MappedBatch,
    MappingReleaseBatch, SubmitError,
};
use crate::device::{DeviceRequest, PtaSlots, CLIENT_GPU_ADDR_SIZE};

pub type ContextId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("gpu range {gpu_addr:#x}+{len:#x} is outside the client window")]
    OutOfClientRange { gpu_addr: u64, len: u64 },
    #[error("no mapping at gpu address {gpu_addr:#x}")]
    NotMapped { gpu_addr: u64 },
    #[error("mapping at {gpu_addr:#x} is still referenced; owning contexts killed")]
    StillReferenced { gpu_addr: u64 },
    #[error(transparent)]
    Mmu(#[from] MmuError),
}

/// A client buffer mapped into the connection's address space. Page-table
/// entries are cleared when the last reference drops, which for released
/// mappings happens only after the ring has drained past the release point.
pub struct GpuMapping {
    gpu_addr: u64,
    bus: Arc<BusMapping>,
    aspace: Arc<Mutex<AddressSpace>>,
}

impl GpuMapping {
    pub fn gpu_addr(&self) -> u64 {
        self.gpu_addr
    }

    pub fn len_bytes(&self) -> u64 {
        self.bus.len_bytes()
    }

    pub fn bus(&self) -> &Arc<BusMapping> {
        &self.bus
    }
}

impl Drop for GpuMapping {
    fn drop(&mut self) {
        let mut aspace = self.aspace.lock().unwrap();
        if let Err(err) = aspace.clear(self.gpu_addr, self.bus.page_count()) {
            warn!(gpu_addr = self.gpu_addr, %err, "failed to clear released mapping");
        }
    }
}

pub(crate) struct ConnectionInner {
    id: u64,
    pta_slot: u32,
    queue: mpsc::Sender<DeviceRequest>,
    pub(crate) aspace: Arc<Mutex<AddressSpace>>,
    weak_self: Weak<ConnectionInner>,
    mappings: Mutex<HashMap<u64, Arc<GpuMapping>>>,
    /// Released mappings parked until the next submission flushes them
    /// through the ring.
    pending_releases: Mutex<Vec<Arc<GpuMapping>>>,
    contexts: Mutex<Vec<Weak<ContextInner>>>,
    on_context_killed: Mutex<Option<Box<dyn Fn(ContextId) + Send>>>,
    slots: Arc<Mutex<PtaSlots>>,
}

impl ConnectionInner {
    pub(crate) fn pta_slot(&self) -> u32 {
        self.pta_slot
    }

    fn kill_contexts(&self) {
        for context in self.contexts.lock().unwrap().iter() {
            if let Some(context) = context.upgrade() {
                context.kill();
            }
        }
    }

    /// Queue a MappingRelease batch for everything released since the last
    /// submission. Called on the submit path so releases drain in order with
    /// the work that might still reference them.
    fn flush_releases(&self) -> Result<(), SubmitError> {
        let pending = mem::take(&mut *self.pending_releases.lock().unwrap());
        if pending.is_empty() {
            return Ok(());
        }
        debug!(connection = self.id, count = pending.len(), "flushing deferred releases");
        let batch = MappedBatch::MappingRelease(MappingReleaseBatch {
            connection: self.weak_self.clone(),
            mappings: pending,
            fence: BatchFence::new(),
            sequence: 0,
        });
        self.queue
            .send(DeviceRequest::Submit(batch))
            .map_err(|_| SubmitError::DeviceShutdown)
    }

    fn submit(&self, batch: MappedBatch) -> Result<(), SubmitError> {
        self.flush_releases()?;
        self.queue
            .send(DeviceRequest::Submit(batch))
            .map_err(|_| SubmitError::DeviceShutdown)
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.slots.lock().unwrap().free(self.pta_slot);
    }
}

/// Handle to one open client session.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        pta_slot: u32,
        queue: mpsc::Sender<DeviceRequest>,
        aspace: AddressSpace,
        slots: Arc<Mutex<PtaSlots>>,
    ) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new_cyclic(|weak_self| ConnectionInner {
            id,
            pta_slot,
            queue,
            aspace: Arc::new(Mutex::new(aspace)),
            weak_self: weak_self.clone(),
            mappings: Mutex::new(HashMap::new()),
            pending_releases: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
            on_context_killed: Mutex::new(None),
            slots,
        });
        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn pta_slot(&self) -> u32 {
        self.inner.pta_slot
    }

    /// Invoked (from whichever thread detects the failure) when one of this
    /// connection's contexts is killed.
    pub fn set_context_killed_callback(&self, callback: impl Fn(ContextId) + Send + 'static) {
        *self.inner.on_context_killed.lock().unwrap() = Some(Box::new(callback));
    }

    /// Map `buffer` at `gpu_addr` in this connection's address space.
    pub fn map_buffer(
        &self,
        buffer: Arc<BusMapping>,
        gpu_addr: u64,
        writable: bool,
    ) -> Result<Arc<GpuMapping>, MapError> {
        let len = buffer.len_bytes();
        if gpu_addr.checked_add(len).is_none_or(|end| end > CLIENT_GPU_ADDR_SIZE) {
            return Err(MapError::OutOfClientRange { gpu_addr, len });
        }
        self.inner
            .aspace
            .lock()
            .unwrap()
            .insert(gpu_addr, &buffer, writable)?;
        let mapping = Arc::new(GpuMapping {
            gpu_addr,
            bus: buffer,
            aspace: Arc::clone(&self.inner.aspace),
        });
        self.inner
            .mappings
            .lock()
            .unwrap()
            .insert(gpu_addr, Arc::clone(&mapping));
        trace!(connection = self.inner.id, gpu_addr, len, "mapped buffer");
        Ok(mapping)
    }

    /// Release the mapping at `gpu_addr`.
    ///
    /// The bus pages and page-table entries are reclaimed only after the
    /// ring drains past the next submission. A mapping still referenced
    /// outside the connection is a protocol violation: the connection's
    /// contexts are killed and the call fails.
    pub fn release_buffer(&self, gpu_addr: u64) -> Result<(), MapError> {
        let mapping = self
            .inner
            .mappings
            .lock()
            .unwrap()
            .remove(&gpu_addr)
            .ok_or(MapError::NotMapped { gpu_addr })?;
        if Arc::strong_count(&mapping) > 1 {
            warn!(
                connection = self.inner.id,
                gpu_addr, "mapping released while still referenced"
            );
            self.inner.kill_contexts();
            return Err(MapError::StillReferenced { gpu_addr });
        }
        self.inner.pending_releases.lock().unwrap().push(mapping);
        Ok(())
    }

    pub fn create_context(&self) -> Context {
        let inner = Arc::new(ContextInner {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            connection: Arc::downgrade(&self.inner),
            killed: AtomicBool::new(false),
        });
        self.inner
            .contexts
            .lock()
            .unwrap()
            .push(Arc::downgrade(&inner));
        Context { inner }
    }
}

pub(crate) struct ContextInner {
    pub(crate) id: ContextId,
    pub(crate) connection: Weak<ConnectionInner>,
    killed: AtomicBool,
}

impl ContextInner {
    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Mark the context dead and notify the client. Idempotent.
    pub(crate) fn kill(&self) {
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(context = self.id, "context killed");
        if let Some(connection) = self.connection.upgrade() {
            if let Some(callback) = &*connection.on_context_killed.lock().unwrap() {
                callback(self.id);
            }
        }
    }
}

/// An execution context. Work is submitted per-context; a fault or hang
/// attributed to a context kills it without disturbing its neighbours.
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn is_killed(&self) -> bool {
        self.inner.is_killed()
    }

    fn connection(&self) -> Result<Arc<ConnectionInner>, SubmitError> {
        if self.inner.is_killed() {
            return Err(SubmitError::ContextKilled);
        }
        self.inner
            .connection
            .upgrade()
            .ok_or(SubmitError::ConnectionClosed)
    }

    /// Submit a command buffer for execution; the returned fence signals
    /// exactly once.
    pub fn submit_command_buffer(&self, buffer: CommandBuffer) -> Result<BatchFence, SubmitError> {
        let connection = self.connection()?;
        let batch = self.build_batch(buffer)?;
        let fence = batch.fence.clone();
        connection.submit(MappedBatch::Command(batch))?;
        Ok(fence)
    }

    /// Submit an empty marker batch; its fence signals once everything
    /// submitted before it has executed.
    pub fn submit_event(&self) -> Result<BatchFence, SubmitError> {
        let connection = self.connection()?;
        let fence = BatchFence::new();
        connection.submit(MappedBatch::Event(EventBatch {
            context: Arc::downgrade(&self.inner),
            fence: fence.clone(),
            sequence: 0,
        }))?;
        Ok(fence)
    }

    fn build_batch(&self, buffer: CommandBuffer) -> Result<CommandBatch, SubmitError> {
        let count = buffer.resources.len();
        if count > 2 {
            return Err(SubmitError::TooManyResources { count });
        }
        let take = |index: usize| -> Result<BatchResource, SubmitError> {
            buffer
                .resources
                .get(index)
                .cloned()
                .ok_or(SubmitError::InvalidResourceIndex { index })
        };
        let payload = take(buffer.batch_index)?;
        let context_state = match buffer.context_state_index {
            Some(index) if index == buffer.batch_index => {
                return Err(SubmitError::InvalidResourceIndex { index });
            }
            Some(index) => Some(take(index)?),
            None => None,
        };
        Ok(CommandBatch {
            context: Arc::downgrade(&self.inner),
            fence: BatchFence::new(),
            payload,
            context_state,
            sequence: 0,
        })
    }
}
