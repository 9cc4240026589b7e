//! Shared state of one acquisition session.
//!
//! The write cursor, the read cursor, the ready count and every slot's state live behind
//! one mutex. Critical sections only do index arithmetic; the camera wait and the disk
//! write both happen outside it.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;

use super::ringbuf::RingIndex;
use crate::capture::SlotState;
use crate::error::RingError;

struct Cursor {
    next_write: usize,
    next_read: usize,
    ready_count: usize,
    states: Vec<SlotState>,
}

impl Cursor {
    fn consistent(&self, capacity: usize) -> bool {
        self.ready_count == (self.next_write + capacity - self.next_read) % capacity
    }
}

/// Copy of the cursors taken under the session mutex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorSnapshot {
    pub next_write: usize,
    pub next_read: usize,
    pub ready_count: usize,
}

/// Result of publishing a completed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    pub index: usize,
    pub ready_count: usize,
    /// The ring has reached `capacity - 1` unread frames; acquisition must stop.
    pub overflow: bool,
}

#[derive(Default)]
struct Stats {
    frames_acquired: AtomicU64,
    frames_persisted: AtomicU64,
    frames_dropped: AtomicU64,
}

pub struct Session {
    ring: RingIndex,
    cursor: Mutex<Cursor>,
    ready: Condvar,
    /// Capture must end: set by the controller, or by the producer on overflow/fault
    capture_stop: AtomicBool,
    /// No more frames will be published; the consumer may exit once the ring is empty
    drain_stop: AtomicBool,
    overflowed: AtomicBool,
    faulted: AtomicBool,
    fault_code: AtomicI32,
    started: Instant,
    stats: CachePadded<Stats>,
}

impl Session {
    pub fn new(ring: RingIndex) -> Self {
        let mut states = vec![SlotState::Free; ring.len()];
        states[0] = SlotState::Filling;

        Self {
            ring,
            cursor: Mutex::new(Cursor {
                next_write: 0,
                next_read: 0,
                ready_count: 0,
                states,
            }),
            ready: Condvar::new(),
            capture_stop: AtomicBool::new(false),
            drain_stop: AtomicBool::new(false),
            overflowed: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            fault_code: AtomicI32::new(0),
            started: Instant::now(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    pub fn ring(&self) -> &RingIndex {
        &self.ring
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    /// Microseconds since the session was created
    pub fn elapsed_us(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    pub fn started_at(&self) -> Instant {
        self.started
    }

    /// Producer side: mark slot `index` as holding a complete frame.
    ///
    /// The camera fills slots in ring order, so `index` must be the current write
    /// position. Publishing into a ring that already holds `capacity - 1` unread frames
    /// is refused; the overflow flag on the previous publish should have stopped
    /// capture before that point.
    pub fn publish(&self, index: usize, timestamp_us: u64) -> Result<Published, RingError> {
        let capacity = self.capacity();
        let slot = self.ring.slot_at(index)?;

        let mut cursor = self.lock();
        if cursor.ready_count >= capacity - 1 {
            return Err(RingError::Full(cursor.ready_count));
        }
        if index != cursor.next_write {
            return Err(RingError::OutOfOrder {
                expected: cursor.next_write,
                got: index,
            });
        }

        slot.set_timestamp_us(timestamp_us);
        cursor.states[index] = SlotState::Ready;
        cursor.next_write = (index + 1) % capacity;
        cursor.ready_count += 1;
        let next = cursor.next_write;
        if cursor.states[next] == SlotState::Free {
            cursor.states[next] = SlotState::Filling;
        }
        debug_assert!(cursor.consistent(capacity));

        let published = Published {
            index,
            ready_count: cursor.ready_count,
            overflow: cursor.ready_count == capacity - 1,
        };
        drop(cursor);

        self.stats.frames_acquired.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();
        Ok(published)
    }

    /// Consumer side: wait up to `timeout` for the oldest ready frame and mark it as
    /// being written. Returns its index, or `None` if nothing became ready.
    pub fn claim_next(&self, timeout: Duration) -> Option<usize> {
        let cursor = self.lock();
        let (mut cursor, _) = self
            .ready
            .wait_timeout_while(cursor, timeout, |c| {
                c.ready_count == 0 && !self.drain_stop.load(Ordering::Acquire)
            })
            .unwrap_or_else(PoisonError::into_inner);

        if cursor.ready_count == 0 {
            return None;
        }
        let index = cursor.next_read;
        cursor.states[index] = SlotState::Writing;
        Some(index)
    }

    /// Consumer side: return the slot claimed by [`claim_next`](Self::claim_next) to the
    /// free pool and advance the read cursor. Returns the frames still waiting.
    pub fn release(&self, index: usize) -> usize {
        let capacity = self.capacity();
        let mut cursor = self.lock();
        debug_assert_eq!(index, cursor.next_read);
        debug_assert_eq!(cursor.states[index], SlotState::Writing);

        cursor.states[index] = SlotState::Free;
        cursor.next_read = (index + 1) % capacity;
        cursor.ready_count -= 1;
        debug_assert!(cursor.consistent(capacity));
        cursor.ready_count
    }

    pub fn ready_count(&self) -> usize {
        self.lock().ready_count
    }

    pub fn cursor(&self) -> CursorSnapshot {
        let cursor = self.lock();
        CursorSnapshot {
            next_write: cursor.next_write,
            next_read: cursor.next_read,
            ready_count: cursor.ready_count,
        }
    }

    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.lock().states.get(index).copied()
    }

    pub fn request_stop(&self) {
        self.capture_stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.capture_stop.load(Ordering::Acquire)
    }

    /// Tell the consumer no further frames will arrive. Only call once the producer has
    /// been joined.
    pub fn finish_draining(&self) {
        self.drain_stop.store(true, Ordering::Release);
        let _cursor = self.lock();
        self.ready.notify_all();
    }

    /// The consumer loop runs while capture is live or frames remain.
    pub fn should_drain(&self) -> bool {
        !self.drain_stop.load(Ordering::Acquire) || self.ready_count() != 0
    }

    pub fn mark_overflow(&self) {
        self.overflowed.store(true, Ordering::Release);
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Any driver code counts as a fault, zero included.
    pub fn record_fault(&self, code: i32) {
        self.fault_code.store(code, Ordering::Relaxed);
        self.faulted.store(true, Ordering::Release);
    }

    pub fn fault(&self) -> Option<i32> {
        self.faulted
            .load(Ordering::Acquire)
            .then(|| self.fault_code.load(Ordering::Relaxed))
    }

    pub fn note_persisted(&self) {
        self.stats.frames_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_dropped(&self) {
        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_acquired(&self) -> u64 {
        self.stats.frames_acquired.load(Ordering::Relaxed)
    }

    pub fn frames_persisted(&self) -> u64 {
        self.stats.frames_persisted.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.stats.frames_dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_WAIT: Duration = Duration::from_millis(0);

    fn session(capacity: usize) -> Session {
        Session::new(RingIndex::create(8, 4, capacity, false).unwrap())
    }

    fn produce(session: &Session) -> Published {
        let index = session.cursor().next_write;
        session.publish(index, session.elapsed_us()).unwrap()
    }

    fn consume(session: &Session) -> usize {
        let index = session.claim_next(NO_WAIT).unwrap();
        session.release(index);
        index
    }

    #[test]
    fn ready_count_tracks_undrained_frames() {
        for capacity in 2..=12 {
            for frames in 0..capacity {
                let s = session(capacity);
                let tags: Vec<u64> = (0..frames as u64).map(|t| t * 10 + 1).collect();
                for &tag in &tags {
                    let index = s.cursor().next_write;
                    s.publish(index, tag).unwrap();
                }
                assert_eq!(s.ready_count(), frames);
                for (index, &tag) in tags.iter().enumerate() {
                    assert_eq!(s.slot_state(index), Some(SlotState::Ready));
                    assert_eq!(s.ring().slot_at(index).unwrap().timestamp_us(), tag);
                }
            }
        }
    }

    #[test]
    fn overflow_is_flagged_at_capacity_minus_one() {
        let s = session(5);
        for _ in 0..3 {
            assert!(!produce(&s).overflow);
        }
        let last = produce(&s);
        assert!(last.overflow);
        assert_eq!(last.ready_count, 4);
        assert!(matches!(s.publish(4, 0), Err(RingError::Full(4))));
        // The refused publish must not disturb the unread frames.
        assert_eq!(s.cursor().next_write, 4);
        assert_eq!(s.slot_state(0), Some(SlotState::Ready));
    }

    #[test]
    fn next_slot_is_claimed_for_the_camera() {
        let s = session(3);
        assert_eq!(s.slot_state(0), Some(SlotState::Filling));
        produce(&s);
        assert_eq!(s.slot_state(0), Some(SlotState::Ready));
        assert_eq!(s.slot_state(1), Some(SlotState::Filling));
    }

    #[test]
    fn out_of_order_completion_is_a_consistency_error() {
        let s = session(4);
        assert!(matches!(
            s.publish(2, 0),
            Err(RingError::OutOfOrder { expected: 0, got: 2 })
        ));
        assert!(matches!(
            s.publish(9, 0),
            Err(RingError::OutOfRange { index: 9, len: 4 })
        ));
    }

    #[test]
    fn capacity_four_scenario() {
        let s = session(4);
        produce(&s);
        produce(&s);
        produce(&s);
        assert_eq!(consume(&s), 0);
        produce(&s);
        assert_eq!(
            s.cursor(),
            CursorSnapshot {
                next_write: 0,
                next_read: 1,
                ready_count: 3,
            }
        );
    }

    #[test]
    fn claimed_slot_is_writing_until_released() {
        let s = session(4);
        produce(&s);
        let index = s.claim_next(NO_WAIT).unwrap();
        assert_eq!(s.slot_state(index), Some(SlotState::Writing));
        assert_eq!(s.release(index), 0);
        assert_eq!(s.slot_state(index), Some(SlotState::Free));
    }

    #[test]
    fn empty_ring_claims_nothing() {
        let s = session(4);
        assert_eq!(s.claim_next(Duration::from_millis(5)), None);
    }

    #[test]
    fn interleaved_traffic_never_reads_ahead_of_writes() {
        // Deterministic pseudo-random schedule over several capacities.
        let mut seed: u32 = 0x2545_f491;
        for capacity in [2usize, 3, 4, 7, 16] {
            let s = session(capacity);
            let mut produced = 0u64;
            let mut drained = Vec::new();

            for _ in 0..2000 {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                let before = s.cursor();
                if seed % 2 == 0 && before.ready_count < capacity - 1 {
                    let index = before.next_write;
                    s.publish(index, produced).unwrap();
                    produced += 1;
                } else if let Some(index) = s.claim_next(NO_WAIT) {
                    assert_eq!(s.slot_state(index), Some(SlotState::Writing));
                    drained.push(s.ring().slot_at(index).unwrap().timestamp_us());
                    s.release(index);
                }

                let after = s.cursor();
                assert!(after.ready_count < capacity);
                assert_eq!(
                    after.ready_count,
                    (after.next_write + capacity - after.next_read) % capacity
                );
            }

            // Each frame is drained once, in production order.
            let expected: Vec<u64> = (0..drained.len() as u64).collect();
            assert_eq!(drained, expected);
        }
    }

    #[test]
    fn drain_flag_releases_waiting_consumer() {
        let s = session(3);
        assert!(s.should_drain());
        s.finish_draining();
        assert!(!s.should_drain());
        assert_eq!(s.claim_next(Duration::from_secs(5)), None);
    }

    #[test]
    fn drain_continues_while_frames_remain() {
        let s = session(3);
        produce(&s);
        s.finish_draining();
        assert!(s.should_drain());
        consume(&s);
        assert!(!s.should_drain());
    }

    #[test]
    fn fault_code_is_recorded() {
        let s = session(2);
        assert_eq!(s.fault(), None);
        s.record_fault(-3);
        assert_eq!(s.fault(), Some(-3));
    }

    #[test]
    fn zero_fault_code_still_counts_as_a_fault() {
        let s = session(2);
        s.record_fault(0);
        assert_eq!(s.fault(), Some(0));
    }
}
