//! In-process transport for tests and bench runs without a supervisor

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, RecvTimeoutError, Sender};

use super::status::StatusFrame;
use super::Transport;
use crate::error::TransportError;

#[derive(Default)]
struct Shared {
    frames: Mutex<Vec<Bytes>>,
    failing_reads: AtomicU32,
}

pub struct MemoryTransport {
    commands: Receiver<u8>,
    shared: Arc<Shared>,
}

/// Supervisor end of a [`MemoryTransport`]
#[derive(Clone)]
pub struct MemoryLink {
    commands: Sender<u8>,
    shared: Arc<Shared>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryLink) {
        let (tx, rx) = flume::unbounded();
        let shared = Arc::new(Shared::default());
        (
            MemoryTransport {
                commands: rx,
                shared: shared.clone(),
            },
            MemoryLink {
                commands: tx,
                shared,
            },
        )
    }
}

impl Transport for MemoryTransport {
    fn read_command_byte(&self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        let failing = &self.shared.failing_reads;
        if failing
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Io(io::Error::other("injected read fault")));
        }

        match self.commands.recv_timeout(timeout) {
            Ok(byte) => Ok(Some(byte)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn write_status_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.shared
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Bytes::copy_from_slice(frame));
        Ok(())
    }
}

impl MemoryLink {
    pub fn send_command(&self, byte: u8) {
        let _ = self.commands.send(byte);
    }

    /// Make the next `count` reads fail with an I/O error.
    pub fn fail_next_reads(&self, count: u32) {
        self.shared.failing_reads.store(count, Ordering::Release);
    }

    pub fn raw_frames(&self) -> Vec<Bytes> {
        self.shared
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status_frames(&self) -> Vec<StatusFrame> {
        self.raw_frames()
            .iter()
            .filter_map(|raw| StatusFrame::decode(raw))
            .collect()
    }
}
