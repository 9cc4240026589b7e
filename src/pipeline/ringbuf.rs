//! Fixed ring of pinned frame slots

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::capture::{BufferId, FrameSlot};
use crate::error::RingError;

/// Owns the slot pool for one acquisition session.
///
/// Slots are allocated once, addressed by their logical index, and reused in place.
/// The camera reports completed frames by buffer identity, so the ring also keeps the
/// identity → index map, built at construction and never changed afterwards.
pub struct RingIndex {
    slots: Vec<Arc<FrameSlot>>,
    by_buffer: HashMap<BufferId, usize>,
    width: u32,
    height: u32,
}

impl RingIndex {
    /// Allocate `slot_count` slots of `width * height` pixels.
    ///
    /// If any slot cannot be allocated or locked, the slots acquired so far are unlocked
    /// and freed before the error is returned.
    #[instrument(skip(lock_memory))]
    pub fn create(
        width: u32,
        height: u32,
        slot_count: usize,
        lock_memory: bool,
    ) -> Result<Self, RingError> {
        if width == 0 || height == 0 {
            return Err(RingError::Geometry(format!(
                "frame size {width}x{height} is empty"
            )));
        }
        if slot_count < 2 {
            return Err(RingError::Geometry(format!(
                "a ring needs at least 2 slots, got {slot_count}"
            )));
        }
        (width as usize)
            .checked_mul(height as usize)
            .and_then(|frame| frame.checked_mul(slot_count))
            .ok_or_else(|| {
                RingError::Geometry(format!(
                    "{slot_count} frames of {width}x{height} overflow the address space"
                ))
            })?;

        let mut slots = Vec::with_capacity(slot_count);
        for index in 0..slot_count {
            match FrameSlot::new(index, width, height, lock_memory) {
                Ok(slot) => slots.push(Arc::new(slot)),
                Err(source) => {
                    warn!("Slot {} of {} failed, releasing {} slots", index, slot_count, slots.len());
                    // Dropping the partial pool unlocks and frees every slot in it.
                    drop(slots);
                    return Err(RingError::Allocation {
                        index,
                        count: slot_count,
                        source,
                    });
                }
            }
        }

        let by_buffer = slots
            .iter()
            .map(|slot| (slot.id(), slot.index()))
            .collect::<HashMap<_, _>>();

        info!(
            "Ring ready: {} slots of {}x{} ({} KiB{})",
            slot_count,
            width,
            height,
            slots.iter().map(|s| s.reserved()).sum::<usize>() / 1024,
            if lock_memory { ", locked" } else { "" }
        );

        Ok(Self {
            slots,
            by_buffer,
            width,
            height,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn slot_at(&self, index: usize) -> Result<&Arc<FrameSlot>, RingError> {
        self.slots.get(index).ok_or(RingError::OutOfRange {
            index,
            len: self.slots.len(),
        })
    }

    pub fn index_of_buffer(&self, id: BufferId) -> Result<usize, RingError> {
        self.by_buffer.get(&id).copied().ok_or(RingError::NotFound(id))
    }

    pub fn slots(&self) -> &[Arc<FrameSlot>] {
        &self.slots
    }

    /// Bytes reserved for pixel data, rounded to whole pages per slot
    pub fn reserved_bytes(&self) -> usize {
        self.slots.iter().map(|slot| slot.reserved()).sum()
    }
}
