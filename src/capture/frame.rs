//! Pinned frame slots written by the camera and drained by the storage thread

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use memmap2::MmapMut;
use tracing::warn;

/// Identity of a slot buffer, as handed back by the camera when a frame completes.
///
/// It is the address of the pinned mapping, which never moves for the lifetime of
/// the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(usize);

impl BufferId {
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Lifecycle of a slot inside an acquisition session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Armed as the camera's next target
    Filling,
    /// Holds a complete frame waiting for storage
    Ready,
    /// Being serialized by the storage thread
    Writing,
}

/// Anonymous page-aligned mapping, optionally locked against paging.
pub struct PinnedBuffer {
    map: MmapMut,
    len: usize,
    locked: bool,
}

impl PinnedBuffer {
    /// Map `len` zeroed bytes on their own pages and `mlock` them if `lock` is set.
    pub fn new(len: usize, lock: bool) -> io::Result<Self> {
        let map = MmapMut::map_anon(len.max(1))?;
        if lock {
            map.lock()?;
        }
        Ok(Self {
            map,
            len,
            locked: lock,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Bytes actually reserved (and locked), rounded up to whole pages
    pub fn reserved(&self) -> usize {
        self.map.len().next_multiple_of(page_size::get())
    }

    pub fn id(&self) -> BufferId {
        BufferId(self.map.as_ptr() as usize)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map[..self.len]
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        if self.locked {
            if let Err(e) = self.map.unlock() {
                warn!("munlock failed for {}: {}", self.id(), e);
            }
        }
    }
}

/// One slot of the ring: a pinned mono8 frame plus its capture metadata.
///
/// The slot's [`SlotState`] is owned by the session, not by the slot, so that every
/// state change happens under the session mutex.
pub struct FrameSlot {
    index: usize,
    id: BufferId,
    width: u32,
    height: u32,
    pixels: Mutex<PinnedBuffer>,
    timestamp_us: AtomicU64,
    writing: AtomicBool,
}

impl FrameSlot {
    pub fn new(index: usize, width: u32, height: u32, lock: bool) -> io::Result<Self> {
        let len = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
        let buffer = PinnedBuffer::new(len, lock)?;

        Ok(Self {
            index,
            id: buffer.id(),
            width,
            height,
            pixels: Mutex::new(buffer),
            timestamp_us: AtomicU64::new(0),
            writing: AtomicBool::new(false),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_locked(&self) -> bool {
        self.lock_pixels().is_locked()
    }

    pub fn reserved(&self) -> usize {
        self.lock_pixels().reserved()
    }

    /// Capture time in microseconds since the session started
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us.load(Ordering::Acquire)
    }

    pub fn set_timestamp_us(&self, timestamp: u64) {
        self.timestamp_us.store(timestamp, Ordering::Release);
    }

    /// Camera side: write a new frame into the slot.
    pub fn fill_with<R>(&self, fill: impl FnOnce(&mut [u8]) -> R) -> R {
        fill(self.lock_pixels().as_mut_slice())
    }

    /// Read the frame currently held by the slot.
    pub fn read_pixels<R>(&self, read: impl FnOnce(&[u8]) -> R) -> R {
        read(self.lock_pixels().as_slice())
    }

    pub fn is_being_written(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    /// Claim the slot for serialization. Returns `None` while another writer holds it.
    pub fn begin_write(&self) -> Option<WriteGuard<'_>> {
        self.writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| WriteGuard { slot: self })
    }

    fn lock_pixels(&self) -> std::sync::MutexGuard<'_, PinnedBuffer> {
        self.pixels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSlot")
            .field("index", &self.index)
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_us", &self.timestamp_us())
            .finish()
    }
}

/// Exclusive serialization rights on a slot, released on drop.
pub struct WriteGuard<'a> {
    slot: &'a FrameSlot,
}

impl WriteGuard<'_> {
    pub fn slot(&self) -> &FrameSlot {
        self.slot
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.slot.writing.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_zeroed_and_page_aligned() {
        let buffer = PinnedBuffer::new(1000, false).unwrap();
        assert_eq!(buffer.len(), 1000);
        assert!(buffer.as_slice().iter().all(|&b| b == 0));
        assert_eq!(buffer.id().as_raw() % page_size::get(), 0);
        assert_eq!(buffer.reserved() % page_size::get(), 0);
    }

    #[test]
    fn small_buffer_can_be_locked() {
        let buffer = PinnedBuffer::new(64, true).unwrap();
        assert!(buffer.is_locked());
    }

    #[test]
    fn slot_identity_is_stable_across_writes() {
        let slot = FrameSlot::new(3, 16, 8, false).unwrap();
        let id = slot.id();
        slot.fill_with(|px| px.fill(7));
        assert_eq!(slot.id(), id);
        assert_eq!(slot.frame_len(), 128);
        slot.read_pixels(|px| assert!(px.iter().all(|&b| b == 7)));
    }

    #[test]
    fn only_one_writer_at_a_time() {
        let slot = FrameSlot::new(0, 4, 4, false).unwrap();
        let guard = slot.begin_write().unwrap();
        assert!(slot.is_being_written());
        assert!(slot.begin_write().is_none());
        drop(guard);
        assert!(!slot.is_being_written());
        assert!(slot.begin_write().is_some());
    }
}
