//! Slot registry - the array of reusable channel-pair slots.
//!
//! Has no locking of its own; the admission controller owns it behind its mutex.

use crate::bridge::channel::SlotChannels;
use crate::bridge::protocol::SlotIndex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown slot {0}")]
    UnknownSlot(SlotIndex),
    #[error("slot {0} is not in use")]
    NotInUse(SlotIndex),
}

struct Slot {
    index: SlotIndex,
    in_use: bool,
    channels: SlotChannels,
}

impl Slot {
    fn new(index: usize) -> Self {
        Self {
            index: SlotIndex::new(index),
            in_use: false,
            channels: SlotChannels::new(),
        }
    }

    /// Replace the channel pair if the previous session left messages behind.
    fn scrub(&mut self) -> bool {
        let Some((requests, responses)) = self.channels.residue() else {
            return false;
        };
        tracing::warn!(
            slot = %self.index,
            residual_requests = requests,
            residual_responses = responses,
            "Dirty channel on slot - discarding residual messages and replacing channel pair"
        );
        self.channels = SlotChannels::new();
        true
    }
}

pub struct SlotRegistry {
    slots: Vec<Slot>,
    dirty_recoveries: u64,
}

impl SlotRegistry {
    pub fn new(num_slots: usize) -> Self {
        Self {
            slots: (0..num_slots).map(Slot::new).collect(),
            dirty_recoveries: 0,
        }
    }

    /// Bind the lowest free slot. Hands back channels with no residual messages.
    pub fn acquire_free_slot(&mut self) -> Option<(SlotIndex, SlotChannels)> {
        let slot = self.slots.iter_mut().find(|s| !s.in_use)?;
        if slot.scrub() {
            self.dirty_recoveries += 1;
        }
        slot.in_use = true;
        tracing::trace!(slot = %slot.index, "Slot acquired");
        Some((slot.index, slot.channels.clone()))
    }

    pub fn release_slot(&mut self, index: SlotIndex) -> Result<(), RegistryError> {
        let slot = self.slot_mut(index)?;
        if !slot.in_use {
            return Err(RegistryError::NotInUse(index));
        }
        let dirty = slot.scrub();
        slot.in_use = false;
        if dirty {
            self.dirty_recoveries += 1;
        }
        tracing::trace!(slot = %index, "Slot released");
        Ok(())
    }

    /// Free a slot whose worker may still hold the current pair.
    ///
    /// The pair is always replaced; the detached worker keeps the old one.
    pub fn retire_slot(&mut self, index: SlotIndex) -> Result<(), RegistryError> {
        let slot = self.slot_mut(index)?;
        if !slot.in_use {
            return Err(RegistryError::NotInUse(index));
        }
        slot.channels = SlotChannels::new();
        slot.in_use = false;
        tracing::debug!(slot = %index, "Slot retired with fresh channel pair");
        Ok(())
    }

    pub fn grow(&mut self, additional: usize) {
        let start = self.slots.len();
        self.slots
            .extend((start..start + additional).map(Slot::new));
        tracing::debug!(from = start, to = self.slots.len(), "Slot registry grown");
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    pub fn is_in_use(&self, index: SlotIndex) -> bool {
        self.slots.get(index.get()).is_some_and(|s| s.in_use)
    }

    pub fn dirty_recoveries(&self) -> u64 {
        self.dirty_recoveries
    }

    /// Current channel pair of a slot, bound or not.
    pub fn channels(&self, index: SlotIndex) -> Option<&SlotChannels> {
        self.slots.get(index.get()).map(|s| &s.channels)
    }

    fn slot_mut(&mut self, index: SlotIndex) -> Result<&mut Slot, RegistryError> {
        self.slots
            .get_mut(index.get())
            .ok_or(RegistryError::UnknownSlot(index))
    }
}
