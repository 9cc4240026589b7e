//! Persistent storage for drained frames

pub mod encoder;

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

pub use encoder::{encoder_for, Encoder, PgmEncoder, PngGrayEncoder};

use crate::capture::FrameSlot;
use crate::error::StorageError;
use crate::ImageFormat;

/// Destination for frames leaving the ring.
pub trait FrameSink: Send + Sync {
    /// Store the frame held by `slot` as number `sequence`. Returns the written path.
    fn persist(&self, slot: &FrameSlot, sequence: u64) -> Result<PathBuf, StorageError>;
}

/// Writes one image file per frame, `image<sequence>.<ext>`, into a directory.
pub struct FileSink {
    dir: PathBuf,
    encoder: Box<dyn Encoder>,
}

impl FileSink {
    /// Create `dir` (and parents) and write frames there in `format`.
    pub fn create(dir: impl Into<PathBuf>, format: ImageFormat) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageError::Create {
            path: dir.clone(),
            source,
        })?;
        info!("Writing {:?} frames to {}", format, dir.display());
        Ok(Self {
            dir,
            encoder: encoder_for(format),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, sequence: u64) -> PathBuf {
        self.dir
            .join(format!("image{}.{}", sequence, self.encoder.extension()))
    }
}

impl FrameSink for FileSink {
    /// Fails with [`StorageError::Busy`] if another writer is serializing the same slot.
    fn persist(&self, slot: &FrameSlot, sequence: u64) -> Result<PathBuf, StorageError> {
        let _guard = slot.begin_write().ok_or(StorageError::Busy(slot.index()))?;

        let path = self.path_for(sequence);
        let file = File::create(&path).map_err(|source| StorageError::Create {
            path: path.clone(),
            source,
        })?;
        let mut out = BufWriter::new(file);
        let comment = slot.timestamp_us().to_string();

        slot.read_pixels(|pixels| {
            self.encoder
                .serialize(pixels, slot.width(), slot.height(), &comment, &mut out)
        })
        .and_then(|_| out.flush())
        .map_err(|source| StorageError::Write {
            path: path.clone(),
            source,
        })?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_with(pattern: u8) -> FrameSlot {
        let slot = FrameSlot::new(1, 4, 2, false).unwrap();
        slot.fill_with(|px| px.fill(pattern));
        slot.set_timestamp_us(987);
        slot
    }

    #[test]
    fn writes_numbered_pgm_with_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::create(dir.path().join("session-000"), ImageFormat::Pgm).unwrap();

        let path = sink.persist(&slot_with(9), 7).unwrap();

        assert_eq!(path.file_name().unwrap(), "image7.pgm");
        let bytes = fs::read(&path).unwrap();
        let header = b"P5\n# 987\n4 2\n255\n";
        assert_eq!(&bytes[..header.len()], header);
        assert_eq!(&bytes[header.len()..], &[9u8; 8]);
    }

    #[test]
    fn concurrent_dump_reports_contention() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::create(dir.path(), ImageFormat::Pgm).unwrap();
        let slot = slot_with(1);

        let guard = slot.begin_write().unwrap();
        assert!(matches!(sink.persist(&slot, 0), Err(StorageError::Busy(1))));
        assert!(!sink.path_for(0).exists());

        drop(guard);
        assert!(sink.persist(&slot, 0).is_ok());
    }

    #[test]
    fn unwritable_directory_is_a_create_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::create(dir.path().join("gone"), ImageFormat::Png).unwrap();
        fs::remove_dir(sink.dir()).unwrap();

        let slot = slot_with(0);
        let err = sink.persist(&slot, 3).unwrap_err();
        assert!(matches!(err, StorageError::Create { .. }));
        // The slot is usable again once the failed write returns.
        assert!(!slot.is_being_written());
    }
}
