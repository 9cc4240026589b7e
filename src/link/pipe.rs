//! Named-pipe transport for a supervisor running on the same computer

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{debug, info};

use super::Transport;
use crate::error::TransportError;

/// Commands arrive on a FIFO; status frames go to a second FIFO or a plain file.
pub struct PipeTransport {
    commands: File,
    status_path: Option<PathBuf>,
    status: Mutex<Option<File>>,
}

impl PipeTransport {
    /// Open (creating if needed) the command FIFO at `command_path`.
    ///
    /// The FIFO is opened read-write so the open never blocks and the reader does not
    /// see end-of-file each time a supervisor process exits.
    pub fn open(
        command_path: impl AsRef<Path>,
        status_path: Option<PathBuf>,
    ) -> Result<Self, TransportError> {
        let command_path = command_path.as_ref();
        ensure_fifo(command_path)?;

        let commands = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(command_path)?;

        info!(
            "Listening for commands on {}{}",
            command_path.display(),
            status_path
                .as_ref()
                .map(|p| format!(", status to {}", p.display()))
                .unwrap_or_default()
        );

        Ok(Self {
            commands,
            status_path,
            status: Mutex::new(None),
        })
    }

    fn open_status(path: &Path) -> io::Result<File> {
        // Non-blocking: a FIFO without a reader fails with ENXIO instead of hanging.
        OpenOptions::new()
            .write(true)
            .append(true)
            .create(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
    }
}

pub fn ensure_fifo(path: &Path) -> Result<(), TransportError> {
    match path.metadata() {
        Ok(meta) if meta.file_type().is_fifo() => Ok(()),
        Ok(_) => Err(TransportError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a FIFO", path.display()),
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            mkfifo(path, Mode::from_bits_truncate(0o660))?;
            debug!("Created FIFO {}", path.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

impl Transport for PipeTransport {
    /// When several bytes are queued, the most recent one wins.
    fn read_command_byte(&self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
        let mut fds = [PollFd::new(self.commands.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(Errno::EINTR) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        let mut buf = [0u8; 32];
        match (&self.commands).read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(buf[n - 1])),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_status_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        let Some(path) = &self.status_path else {
            return Ok(());
        };

        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status.is_none() {
            *status = Some(Self::open_status(path)?);
        }
        let result = status
            .as_mut()
            .map(|file| file.write_all(frame))
            .unwrap_or(Ok(()));
        if result.is_err() {
            // Reopen on the next frame, e.g. after the reader went away.
            *status = None;
        }
        result.map_err(TransportError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_bytes_written_into_the_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("camera_pipe.p");
        let transport = PipeTransport::open(&fifo, None).unwrap();

        let mut writer = OpenOptions::new().write(true).open(&fifo).unwrap();
        writer.write_all(b"G").unwrap();

        let byte = transport
            .read_command_byte(Duration::from_secs(2))
            .unwrap();
        assert_eq!(byte, Some(b'G'));
    }

    #[test]
    fn last_byte_of_a_burst_wins() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("cmd");
        let transport = PipeTransport::open(&fifo, None).unwrap();

        let mut writer = OpenOptions::new().write(true).open(&fifo).unwrap();
        writer.write_all(b"GS").unwrap();
        assert_eq!(
            transport.read_command_byte(Duration::from_secs(2)).unwrap(),
            Some(b'S')
        );
    }

    #[test]
    fn idle_fifo_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let transport = PipeTransport::open(dir.path().join("cmd"), None).unwrap();
        let byte = transport
            .read_command_byte(Duration::from_millis(20))
            .unwrap();
        assert_eq!(byte, None);
    }

    #[test]
    fn refuses_a_regular_file_as_command_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        File::create(&path).unwrap();
        assert!(PipeTransport::open(&path, None).is_err());
    }

    #[test]
    fn status_frames_append_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let status = dir.path().join("status.bin");
        let transport = PipeTransport::open(dir.path().join("cmd"), Some(status.clone())).unwrap();

        transport.write_status_frame(&[1, 2, 3, 4]).unwrap();
        transport.write_status_frame(&[5, 6, 7, 8]).unwrap();
        assert_eq!(std::fs::read(&status).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
