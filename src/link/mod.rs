//! Supervisor link: one-byte commands in, fixed-layout status frames out

pub mod channel;
pub mod memory;
pub mod pipe;
pub mod status;
pub mod usbiss;

use std::time::Duration;

pub use channel::{ChannelState, CommandChannel, CommandReader, ControlEvent, Deduplicator};
pub use memory::{MemoryLink, MemoryTransport};
pub use pipe::PipeTransport;
pub use status::{StatusFlags, StatusFrame};
pub use usbiss::UsbIssTransport;

use crate::error::TransportError;

/// Byte the supervisor sends to open the acquisition window
pub const START_BYTE: u8 = b'G';
/// Byte the supervisor sends to close it
pub const STOP_BYTE: u8 = b'S';

/// Physical channel to the supervisor.
///
/// The reader thread and the controller use the transport at the same time, so
/// implementations serialize access internally.
pub trait Transport: Send + Sync {
    /// Block for at most `timeout` waiting for a command byte.
    fn read_command_byte(&self, timeout: Duration) -> Result<Option<u8>, TransportError>;

    fn write_status_frame(&self, frame: &[u8]) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    /// Any other byte; logged and ignored
    Reserved(u8),
}

impl From<u8> for Command {
    fn from(byte: u8) -> Self {
        match byte {
            START_BYTE => Command::Start,
            STOP_BYTE => Command::Stop,
            other => Command::Reserved(other),
        }
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> Self {
        match command {
            Command::Start => START_BYTE,
            Command::Stop => STOP_BYTE,
            Command::Reserved(byte) => byte,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_alphabet() {
        assert_eq!(Command::from(b'G'), Command::Start);
        assert_eq!(Command::from(b'S'), Command::Stop);
        assert_eq!(Command::from(0x00), Command::Reserved(0));
        assert_eq!(u8::from(Command::Reserved(b'x')), b'x');
        assert_eq!(u8::from(Command::Start), START_BYTE);
    }
}
