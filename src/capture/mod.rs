//! Camera side of the pipeline: frame slots and the driver seam

pub mod frame;
pub mod sim;

use std::sync::Arc;
use std::time::Duration;

pub use frame::{BufferId, FrameSlot, PinnedBuffer, SlotState, WriteGuard};
pub use sim::{FrameTrigger, SimulatedCamera};

use crate::error::DriverError;
use crate::CaptureConfig;

/// Outcome of waiting on the camera's frame-complete event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    Signaled,
    TimedOut,
    /// Hardware error with the driver's status code
    Fault(i32),
}

/// Capability interface to the camera hardware.
///
/// The camera fills slots it was armed with, in arming order, and raises a frame event
/// each time one completes. Methods take `&self` because the producer thread waits on
/// events while the controller drives setup and teardown.
pub trait CameraDriver: Send + Sync {
    /// Apply area of interest, exposure, gain and frame rate. Returns the frame rate the
    /// sensor actually runs at.
    fn configure(&self, settings: &CaptureConfig) -> Result<f64, DriverError>;

    /// Register the ring's slots as capture targets. Returns one handle per slot, equal
    /// to the slot's buffer identity.
    fn arm_slots(&self, slots: &[Arc<FrameSlot>]) -> Result<Vec<BufferId>, DriverError>;

    fn begin_capture(&self) -> Result<(), DriverError>;

    fn wait_for_frame_event(&self, timeout: Duration) -> FrameEvent;

    /// Buffer the camera completed most recently
    fn resolve_active_handle(&self) -> Result<BufferId, DriverError>;

    fn end_capture(&self) -> Result<(), DriverError>;

    /// Hand a slot back; the driver must not touch it afterwards.
    fn release(&self, handle: BufferId) -> Result<(), DriverError>;
}
