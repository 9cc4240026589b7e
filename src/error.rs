//! Error types for the acquisition pipeline.
//!
//! Only [`SetupFault`] and the capture-time variants of [`AcquisitionError`] travel back
//! to the controller. Storage and transport errors are handled where they are detected:
//! a frame that cannot be written is dropped, and a link that misbehaves is retried.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::capture::BufferId;

/// Failure reported by a camera driver, carrying the vendor status code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("driver error {code}: {message}")]
pub struct DriverError {
    pub code: i32,
    pub message: String,
}

impl DriverError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum RingError {
    #[error("invalid ring geometry: {0}")]
    Geometry(String),

    #[error("could not allocate pinned slot {index} of {count}: {source}")]
    Allocation {
        index: usize,
        count: usize,
        #[source]
        source: io::Error,
    },

    #[error("slot {index} is out of range (ring holds {len} slots)")]
    OutOfRange { index: usize, len: usize },

    #[error("buffer {0} does not belong to this ring")]
    NotFound(BufferId),

    #[error("camera filled slot {got} but slot {expected} was next in line")]
    OutOfOrder { expected: usize, got: usize },

    #[error("ring is full: {0} frames are waiting to be stored")]
    Full(usize),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("could not create {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("slot {0} is already being written")]
    Busy(usize),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("link I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("device rejected the request: {0}")]
    Rejected(String),

    #[error("no answer from device within the read timeout")]
    Timeout,

    #[error("link closed")]
    Closed,
}

/// Failures that abort the creation of an acquisition session. No thread survives one.
#[derive(Error, Debug)]
pub enum SetupFault {
    #[error("camera setup failed: {0}")]
    Camera(#[from] DriverError),

    #[error(transparent)]
    Memory(#[from] RingError),

    #[error("output storage unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("could not spawn the {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("setup fault: {0}")]
    Setup(#[from] SetupFault),

    #[error("camera reported fault {code} during capture")]
    Fault { code: i32 },

    #[error("ring consistency error: {0}")]
    Consistency(#[source] RingError),

    #[error("the {0} thread panicked")]
    Panicked(&'static str),
}

impl AcquisitionError {
    pub fn is_setup_fault(&self) -> bool {
        matches!(self, AcquisitionError::Setup(_))
    }
}

pub type Result<T, E = AcquisitionError> = std::result::Result<T, E>;
