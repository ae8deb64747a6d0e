//! Batches: the unit of work a client hands the device thread, and the
//! fence a client waits on.

use std::sync::{Arc, Condvar, Mutex, Weak};

use thiserror::Error;
use tracing::warn;

use crate::connection::{ConnectionInner, ContextInner, GpuMapping};
use crate::instr::INSTRUCTION_SIZE;

/// Why a submission was refused before reaching the hardware.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("command buffer carries {count} resources, at most 2 are allowed")]
    TooManyResources { count: usize },
    #[error("resource index {index} is out of range or duplicated")]
    InvalidResourceIndex { index: usize },
    #[error("payload start {offset:#x} is not instruction-aligned")]
    UnalignedStart { offset: u64 },
    #[error("payload length {length:#x} is not a whole number of instructions")]
    UnalignedLength { length: u64 },
    #[error("payload is empty")]
    EmptyPayload,
    #[error("no room for the trailing link: {length:#x} bytes at {offset:#x} fill the mapping")]
    NoRoomForLink { offset: u64, length: u64 },
    #[error("payload of {units} instructions overflows the 16-bit prefetch field")]
    PrefetchOverflow { units: u64 },
    #[error("context has been killed")]
    ContextKilled,
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("device has shut down")]
    DeviceShutdown,
}

/// Terminal state of a submitted batch. Every batch reaches exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatus {
    Completed,
    Rejected(SubmitError),
    ContextKilled,
    DeviceShutdown,
}

struct FenceInner {
    state: Mutex<Option<BatchStatus>>,
    signalled: Condvar,
}

/// Completion fence handed back at submit time; cloned freely, signalled
/// exactly once by the device thread.
#[derive(Clone)]
pub struct BatchFence {
    inner: Arc<FenceInner>,
}

impl BatchFence {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(FenceInner {
                state: Mutex::new(None),
                signalled: Condvar::new(),
            }),
        }
    }

    pub(crate) fn signal(&self, status: BatchStatus) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(old) = &*state {
            warn!(?old, ?status, "fence signalled twice; keeping first status");
            return;
        }
        *state = Some(status);
        drop(state);
        self.inner.signalled.notify_all();
    }

    pub fn status(&self) -> Option<BatchStatus> {
        self.inner.state.lock().unwrap().clone()
    }

    /// Block until the batch reaches a terminal state.
    pub fn wait(&self) -> BatchStatus {
        let state = self.inner.state.lock().unwrap();
        let state = self
            .inner
            .signalled
            .wait_while(state, |s| s.is_none())
            .unwrap();
        state.clone().unwrap()
    }

    pub fn wait_timeout(&self, timeout: std::time::Duration) -> Option<BatchStatus> {
        let state = self.inner.state.lock().unwrap();
        let (state, _) = self
            .inner
            .signalled
            .wait_timeout_while(state, timeout, |s| s.is_none())
            .unwrap();
        state.clone()
    }
}

/// One span of instructions inside a mapped buffer.
#[derive(Clone)]
pub struct BatchResource {
    pub mapping: Arc<GpuMapping>,
    pub offset: u64,
    pub length: u64,
}

impl BatchResource {
    /// GPU virtual address of the first instruction.
    pub(crate) fn gpu_addr(&self) -> u32 {
        (self.mapping.gpu_addr() + self.offset) as u32
    }

    /// Prefetch units covering the span plus the trailing link.
    pub(crate) fn units_with_link(&self) -> u16 {
        ((self.length + INSTRUCTION_SIZE) / INSTRUCTION_SIZE) as u16
    }

    fn validate(&self) -> Result<(), SubmitError> {
        if self.offset % INSTRUCTION_SIZE != 0 {
            return Err(SubmitError::UnalignedStart {
                offset: self.offset,
            });
        }
        if self.length == 0 {
            return Err(SubmitError::EmptyPayload);
        }
        if self.length % INSTRUCTION_SIZE != 0 {
            return Err(SubmitError::UnalignedLength {
                length: self.length,
            });
        }
        let units = (self.length + INSTRUCTION_SIZE) / INSTRUCTION_SIZE;
        if units > u64::from(u16::MAX) {
            return Err(SubmitError::PrefetchOverflow { units });
        }
        // The device appends a LINK directly after the payload; the client
        // must leave one instruction of slack in the mapping.
        let end = self
            .offset
            .checked_add(self.length)
            .and_then(|end| end.checked_add(INSTRUCTION_SIZE));
        match end {
            Some(end) if end <= self.mapping.len_bytes() => Ok(()),
            _ => Err(SubmitError::NoRoomForLink {
                offset: self.offset,
                length: self.length,
            }),
        }
    }
}

/// A command buffer as submitted: up to two resources, one of which is the
/// instruction payload, optionally one carrying context-restore state.
pub struct CommandBuffer {
    pub resources: Vec<BatchResource>,
    pub batch_index: usize,
    pub context_state_index: Option<usize>,
}

pub(crate) struct CommandBatch {
    pub(crate) context: Weak<ContextInner>,
    pub(crate) fence: BatchFence,
    pub(crate) payload: BatchResource,
    pub(crate) context_state: Option<BatchResource>,
    pub(crate) sequence: u64,
}

impl CommandBatch {
    /// Geometry checks, run on the device thread before any hardware state
    /// is touched.
    pub(crate) fn validate(&self) -> Result<(), SubmitError> {
        self.payload.validate()?;
        if let Some(state) = &self.context_state {
            state.validate()?;
        }
        Ok(())
    }
}

/// A marker with no payload: signals its fence once the ring reaches it.
pub(crate) struct EventBatch {
    pub(crate) context: Weak<ContextInner>,
    pub(crate) fence: BatchFence,
    pub(crate) sequence: u64,
}

/// Holds released mappings alive until the ring has drained past every
/// batch that might still reference them.
pub(crate) struct MappingReleaseBatch {
    pub(crate) connection: Weak<ConnectionInner>,
    pub(crate) mappings: Vec<Arc<GpuMapping>>,
    pub(crate) fence: BatchFence,
    pub(crate) sequence: u64,
}

pub(crate) enum MappedBatch {
    Command(CommandBatch),
    Event(EventBatch),
    MappingRelease(MappingReleaseBatch),
}

impl MappedBatch {
    pub(crate) fn fence(&self) -> &BatchFence {
        match self {
            MappedBatch::Command(b) => &b.fence,
            MappedBatch::Event(b) => &b.fence,
            MappedBatch::MappingRelease(b) => &b.fence,
        }
    }

    pub(crate) fn context(&self) -> Option<&Weak<ContextInner>> {
        match self {
            MappedBatch::Command(b) => Some(&b.context),
            MappedBatch::Event(b) => Some(&b.context),
            MappedBatch::MappingRelease(_) => None,
        }
    }

    pub(crate) fn sequence(&self) -> u64 {
        match self {
            MappedBatch::Command(b) => b.sequence,
            MappedBatch::Event(b) => b.sequence,
            MappedBatch::MappingRelease(b) => b.sequence,
        }
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        match self {
            MappedBatch::Command(b) => b.sequence = sequence,
            MappedBatch::Event(b) => b.sequence = sequence,
            MappedBatch::MappingRelease(b) => b.sequence = sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fence_keeps_first_status() {
        let fence = BatchFence::new();
        assert_eq!(fence.status(), None);
        fence.signal(BatchStatus::Completed);
        fence.signal(BatchStatus::ContextKilled);
        assert_eq!(fence.status(), Some(BatchStatus::Completed));
        assert_eq!(fence.wait(), BatchStatus::Completed);
    }

    #[test]
    fn fence_wakes_waiters_across_threads() {
        let fence = BatchFence::new();
        let waiter = {
            let fence = fence.clone();
            std::thread::spawn(move || fence.wait())
        };
        std::thread::sleep(Duration::from_millis(10));
        fence.signal(BatchStatus::Completed);
        assert_eq!(waiter.join().unwrap(), BatchStatus::Completed);
    }

    #[test]
    fn fence_wait_timeout_expires_unsignalled() {
        let fence = BatchFence::new();
        assert_eq!(fence.wait_timeout(Duration::from_millis(20)), None);
    }
}
