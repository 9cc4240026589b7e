//! Four-byte telemetry frame sent to the supervisor

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const STATUS_FRAME_LEN: usize = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u8 {
        /// The acquisition process is running
        const ON = 0x01;
        /// The camera accepted its configuration
        const CAMERA_READY = 0x02;
        const ACQUIRING = 0x04;
        /// Frames are waiting for, or being written to, storage
        const PERSISTING = 0x08;
    }
}

/// `{images_hi, images_lo, framerate, flags}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFrame {
    /// Saturates at `u16::MAX`
    pub images_acquired: u16,
    pub framerate: u8,
    pub flags: StatusFlags,
}

impl StatusFrame {
    pub fn new(images_acquired: u64, framerate: f64, flags: StatusFlags) -> Self {
        Self {
            images_acquired: u16::try_from(images_acquired).unwrap_or(u16::MAX),
            framerate: framerate.round().clamp(0.0, u8::MAX as f64) as u8,
            flags,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(STATUS_FRAME_LEN);
        buf.put_u16(self.images_acquired);
        buf.put_u8(self.framerate);
        buf.put_u8(self.flags.bits());
        buf.freeze()
    }

    /// Parse a frame; unknown flag bits are dropped.
    pub fn decode(mut raw: &[u8]) -> Option<Self> {
        if raw.len() < STATUS_FRAME_LEN {
            return None;
        }
        Some(Self {
            images_acquired: raw.get_u16(),
            framerate: raw.get_u8(),
            flags: StatusFlags::from_bits_truncate(raw.get_u8()),
        })
    }
}
