//! Runs in its own process: lowering RLIMIT_MEMLOCK must not leak into other tests.

use aperture::error::RingError;
use aperture::pipeline::RingIndex;
use nix::sys::resource::{getrlimit, setrlimit, Resource};

const LOCKABLE_SLOTS: usize = 4;

#[test]
fn partial_ring_allocation_unlocks_what_it_locked() {
    let page = page_size::get();
    let (soft, hard) = getrlimit(Resource::RLIMIT_MEMLOCK).unwrap();
    let limit = (LOCKABLE_SLOTS * page) as libc::rlim_t;
    setrlimit(Resource::RLIMIT_MEMLOCK, limit.min(hard), hard).unwrap();

    // One page per slot, so the limit runs out part way through the ring.
    let result = RingIndex::create(page as u32, 1, 2 * LOCKABLE_SLOTS, true);
    let Err(err) = result else {
        // CAP_IPC_LOCK ignores the limit; nothing to roll back.
        setrlimit(Resource::RLIMIT_MEMLOCK, soft, hard).unwrap();
        return;
    };

    let (index, count) = match err {
        RingError::Allocation { index, count, .. } => (index, count),
        other => panic!("expected an allocation failure, got {other}"),
    };
    assert_eq!(count, 2 * LOCKABLE_SLOTS);
    assert!(index >= 2, "the limit leaves room for {LOCKABLE_SLOTS} slots, failed at {index}");

    // Had the first `index` slots stayed locked, this ring would not fit.
    let ring = RingIndex::create(page as u32, 1, index, true).unwrap();
    assert_eq!(ring.len(), index);
    drop(ring);

    setrlimit(Resource::RLIMIT_MEMLOCK, soft, hard).unwrap();
}
