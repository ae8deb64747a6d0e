//! The hardware event table: 30 slots, each backing one in-flight batch.
//!
//! A slot moves Free -> Allocated -> Submitted -> (Free | Allocated); the
//! completion interrupt carries the slot id, which is all the hardware ever
//! tells us about what finished.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use vip_mmu::AddressSpace;

use crate::batch::MappedBatch;

pub const EVENT_SLOTS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("event id {id} is out of range")]
    BadId { id: u32 },
    #[error("event {id} has not been allocated")]
    NotAllocated { id: u32 },
    #[error("event {id} is already submitted and not yet complete")]
    AlreadySubmitted { id: u32 },
    #[error("event {id} has not been submitted")]
    NotSubmitted { id: u32 },
}

/// Everything tied to one in-flight event.
pub(crate) struct SubmittedEvent {
    /// Slot returns to Free on completion; cleared for slots the device
    /// re-arms itself.
    pub(crate) free_on_complete: bool,
    /// Ring offset of the EVENT instruction; the head advances here when the
    /// completion interrupt arrives.
    pub(crate) ringbuffer_offset: u64,
    pub(crate) batch: MappedBatch,
    /// The address space that was live before this batch switched away from
    /// it, kept alive until the switch is confirmed complete.
    pub(crate) prev_address_space: Option<Arc<Mutex<AddressSpace>>>,
}

enum Slot {
    Free,
    Allocated,
    Submitted(SubmittedEvent),
}

impl Slot {
    fn is_free(&self) -> bool {
        matches!(self, Slot::Free)
    }
}

pub(crate) struct EventTable {
    slots: Vec<Slot>,
}

impl EventTable {
    pub(crate) fn new() -> Self {
        let mut slots = Vec::with_capacity(EVENT_SLOTS as usize);
        slots.resize_with(EVENT_SLOTS as usize, || Slot::Free);
        Self { slots }
    }

    pub(crate) fn has_free(&self) -> bool {
        self.slots.iter().any(Slot::is_free)
    }

    /// Slots currently allocated or in flight.
    pub(crate) fn allocated_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }

    /// Claim the lowest free slot, or None when all 30 are in use.
    pub(crate) fn alloc(&mut self) -> Option<u32> {
        let id = self.slots.iter().position(Slot::is_free)?;
        self.slots[id] = Slot::Allocated;
        Some(id as u32)
    }

    /// Return an allocated (not submitted) slot to the free pool.
    pub(crate) fn release(&mut self, id: u32) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            debug_assert!(matches!(slot, Slot::Allocated));
            *slot = Slot::Free;
        }
    }

    /// Arm an allocated slot with its in-flight state.
    pub(crate) fn write(&mut self, id: u32, event: SubmittedEvent) -> Result<(), EventError> {
        let slot = self
            .slots
            .get_mut(id as usize)
            .ok_or(EventError::BadId { id })?;
        match slot {
            Slot::Allocated => {
                *slot = Slot::Submitted(event);
                Ok(())
            }
            Slot::Free => Err(EventError::NotAllocated { id }),
            Slot::Submitted(_) => Err(EventError::AlreadySubmitted { id }),
        }
    }

    /// Take the in-flight state out of a slot whose interrupt fired.
    pub(crate) fn complete(&mut self, id: u32) -> Result<SubmittedEvent, EventError> {
        let slot = self
            .slots
            .get_mut(id as usize)
            .ok_or(EventError::BadId { id })?;
        if !matches!(slot, Slot::Submitted(_)) {
            return Err(EventError::NotSubmitted { id });
        }
        let Slot::Submitted(event) = std::mem::replace(slot, Slot::Free) else {
            unreachable!()
        };
        if !event.free_on_complete {
            *slot = Slot::Allocated;
        }
        Ok(event)
    }

    /// Pull every in-flight event out, freeing the slots; used when a reset
    /// throws away all hardware state.
    pub(crate) fn take_submitted(&mut self) -> Vec<SubmittedEvent> {
        let mut out = Vec::new();
        for slot in &mut self.slots {
            if matches!(slot, Slot::Submitted(_)) {
                let Slot::Submitted(event) = std::mem::replace(slot, Slot::Free) else {
                    unreachable!()
                };
                out.push(event);
            }
        }
        out
    }

    /// Sequence number of the batch armed in `id`, if one is in flight.
    pub(crate) fn submitted_sequence(&self, id: u32) -> Option<u64> {
        match self.slots.get(id as usize) {
            Some(Slot::Submitted(event)) => Some(event.batch.sequence()),
            _ => None,
        }
    }

    /// The in-flight event with the lowest sequence number: the one the
    /// hardware was executing when it stopped making progress.
    pub(crate) fn oldest_submitted(&self) -> Option<&SubmittedEvent> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Submitted(event) => Some(event),
                _ => None,
            })
            .min_by_key(|event| event.batch.sequence())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchFence, EventBatch, MappedBatch};
    use std::sync::Weak;

    fn marker(sequence: u64) -> SubmittedEvent {
        SubmittedEvent {
            free_on_complete: true,
            ringbuffer_offset: 0,
            batch: MappedBatch::Event(EventBatch {
                context: Weak::new(),
                fence: BatchFence::new(),
                sequence,
            }),
            prev_address_space: None,
        }
    }

    #[test]
    fn thirty_first_allocation_fails() {
        let mut table = EventTable::new();
        for expected in 0..EVENT_SLOTS {
            assert_eq!(table.alloc(), Some(expected));
        }
        assert_eq!(table.alloc(), None);
        assert_eq!(table.allocated_count(), EVENT_SLOTS as usize);

        table.release(7);
        assert_eq!(table.alloc(), Some(7));
    }

    #[test]
    fn write_requires_an_allocated_slot() {
        let mut table = EventTable::new();
        assert_eq!(
            table.write(0, marker(1)),
            Err(EventError::NotAllocated { id: 0 })
        );

        let id = table.alloc().unwrap();
        table.write(id, marker(1)).unwrap();
        assert_eq!(
            table.write(id, marker(2)),
            Err(EventError::AlreadySubmitted { id })
        );
    }

    #[test]
    fn completed_slot_can_be_reallocated_and_rewritten() {
        let mut table = EventTable::new();
        let id = table.alloc().unwrap();
        table.write(id, marker(1)).unwrap();

        let done = table.complete(id).unwrap();
        assert_eq!(done.batch.sequence(), 1);
        assert!(matches!(
            table.complete(id),
            Err(EventError::NotSubmitted { .. })
        ));

        assert_eq!(table.alloc(), Some(id));
        table.write(id, marker(2)).unwrap();
    }

    #[test]
    fn rearmed_slot_stays_allocated_after_completion() {
        let mut table = EventTable::new();
        let id = table.alloc().unwrap();
        let mut event = marker(1);
        event.free_on_complete = false;
        table.write(id, event).unwrap();

        table.complete(id).unwrap();
        // Still allocated: writable again without another alloc.
        table.write(id, marker(2)).unwrap();
    }

    #[test]
    fn take_submitted_frees_everything() {
        let mut table = EventTable::new();
        for seq in 0..5 {
            let id = table.alloc().unwrap();
            table.write(id, marker(seq + 10)).unwrap();
        }
        assert_eq!(table.oldest_submitted().unwrap().batch.sequence(), 10);

        let pending = table.take_submitted();
        assert_eq!(pending.len(), 5);
        assert_eq!(table.allocated_count(), 0);
        assert!(table.oldest_submitted().is_none());
    }
}
