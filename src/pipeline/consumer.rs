//! Storage consumer: drains ready slots to disk in ring order

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use metrics::counter;
use tracing::{debug, error, info, warn};

use super::session::Session;
use crate::error::StorageError;
use crate::storage::FrameSink;
use crate::utils;

const BUSY_RETRY: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub persisted: u64,
    pub dropped: u64,
}

pub struct Consumer {
    session: Arc<Session>,
    sink: Arc<dyn FrameSink>,
    poll: Duration,
}

impl Consumer {
    pub fn new(session: Arc<Session>, sink: Arc<dyn FrameSink>, poll: Duration) -> Self {
        Self {
            session,
            sink,
            poll,
        }
    }

    pub fn spawn(self, core: Option<usize>) -> io::Result<JoinHandle<ConsumerReport>> {
        thread::Builder::new()
            .name("acq-storage".into())
            .spawn(move || {
                if let Some(core) = core {
                    utils::pin_current_thread(core);
                }
                self.run()
            })
    }

    /// Store frames until draining has been requested and the ring is empty.
    ///
    /// A frame that cannot be stored is logged and dropped; its slot goes back to the
    /// pool like any other so capture keeps going.
    pub fn run(self) -> ConsumerReport {
        let mut report = ConsumerReport::default();
        let mut sequence = 0u64;
        info!("Storage consumer started");

        while self.session.should_drain() {
            let Some(index) = self.session.claim_next(self.poll) else {
                continue;
            };

            match self.store(index, sequence) {
                Ok(()) => {
                    report.persisted += 1;
                    self.session.note_persisted();
                    counter!("aperture_frames_persisted_total").increment(1);
                }
                Err(e) => {
                    error!("Dropping frame {} (slot {}): {}", sequence, index, e);
                    report.dropped += 1;
                    self.session.note_dropped();
                    counter!("aperture_frames_dropped_total").increment(1);
                }
            }
            sequence += 1;

            let waiting = self.session.release(index);
            debug!("Slot {} free, {} frames waiting", index, waiting);
        }

        info!(
            "Storage consumer done: {} stored, {} dropped",
            report.persisted, report.dropped
        );
        report
    }

    fn store(&self, index: usize, sequence: u64) -> Result<(), StorageError> {
        let slot = self
            .session
            .ring()
            .slot_at(index)
            .map_err(|e| StorageError::Write {
                path: format!("slot {index}").into(),
                source: io::Error::other(e),
            })?;

        loop {
            match self.sink.persist(slot, sequence) {
                Err(StorageError::Busy(_)) => {
                    // A late dump holds the slot; wait for it rather than interleave.
                    warn!("Slot {} busy, retrying", index);
                    thread::sleep(BUSY_RETRY);
                }
                Ok(path) => {
                    debug!("Stored {}", path.display());
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }
}
