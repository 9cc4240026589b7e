//! Simulated camera for bench runs and tests.
//!
//! Free-running mode emits a synthetic gradient at the configured frame rate. Triggered
//! mode emits one frame per [`FrameTrigger::frame`] call so tests control exactly how
//! many notifications the producer sees.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

use super::{BufferId, CameraDriver, FrameEvent, FrameSlot};
use crate::error::DriverError;
use crate::CaptureConfig;

/// Driver code for "capture requested before slots were armed"
pub const NO_SLOTS_ARMED: i32 = -101;
/// Driver code for "no frame has completed yet"
pub const NO_ACTIVE_BUFFER: i32 = -102;
/// Driver code for an unknown handle passed to `release`
pub const UNKNOWN_HANDLE: i32 = -103;

const MAX_FRAMERATE: f64 = 60.0;

enum Trigger {
    Frame,
    Fault(i32),
}

enum Mode {
    FreeRunning { fault_after: Option<(u64, i32)> },
    Triggered(Receiver<Trigger>),
}

#[derive(Default)]
struct State {
    armed: Vec<Arc<FrameSlot>>,
    next: usize,
    active: Option<BufferId>,
    capturing: bool,
    period: Option<Duration>,
    next_due: Option<Instant>,
    frames: u64,
    setup_fault: Option<i32>,
}

pub struct SimulatedCamera {
    mode: Mode,
    state: Mutex<State>,
}

/// Test handle that makes a triggered [`SimulatedCamera`] complete frames.
#[derive(Clone)]
pub struct FrameTrigger {
    tx: Sender<Trigger>,
}

impl FrameTrigger {
    pub fn frame(&self) {
        let _ = self.tx.send(Trigger::Frame);
    }

    pub fn frames(&self, count: usize) {
        for _ in 0..count {
            self.frame();
        }
    }

    pub fn fault(&self, code: i32) {
        let _ = self.tx.send(Trigger::Fault(code));
    }

    /// Triggers not yet picked up by the producer
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

impl SimulatedCamera {
    pub fn free_running() -> Self {
        Self::with_mode(Mode::FreeRunning { fault_after: None })
    }

    pub fn triggered() -> (Self, FrameTrigger) {
        let (tx, rx) = flume::unbounded();
        (Self::with_mode(Mode::Triggered(rx)), FrameTrigger { tx })
    }

    /// Free-running camera that raises `code` after `frames` frames.
    pub fn failing_after(frames: u64, code: i32) -> Self {
        Self::with_mode(Mode::FreeRunning {
            fault_after: Some((frames, code)),
        })
    }

    /// Make the next `configure` call fail with `code`.
    pub fn with_setup_fault(self, code: i32) -> Self {
        self.lock().setup_fault = Some(code);
        self
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            state: Mutex::new(State::default()),
        }
    }

    pub fn frames_emitted(&self) -> u64 {
        self.lock().frames
    }

    pub fn armed_slots(&self) -> usize {
        self.lock().armed.len()
    }

    pub fn is_capturing(&self) -> bool {
        self.lock().capturing
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the next synthetic frame into the next armed slot, as the camera's DMA would.
    fn complete_frame(&self) -> FrameEvent {
        let mut state = self.lock();
        if !state.capturing || state.armed.is_empty() {
            return FrameEvent::TimedOut;
        }

        let slot = state.armed[state.next].clone();
        state.next = (state.next + 1) % state.armed.len();
        let seed = state.frames;
        state.frames += 1;
        state.active = Some(slot.id());
        drop(state);

        let width = slot.width() as usize;
        slot.fill_with(|pixels| {
            for (i, px) in pixels.iter_mut().enumerate() {
                let (x, y) = (i % width, i / width);
                *px = (x as u64 + y as u64 + seed) as u8;
            }
        });
        FrameEvent::Signaled
    }

    fn wait_free_running(&self, timeout: Duration, fault_after: Option<(u64, i32)>) -> FrameEvent {
        let now = Instant::now();
        let due = {
            let mut state = self.lock();
            if let Some((limit, code)) = fault_after {
                if state.capturing && state.frames >= limit {
                    return FrameEvent::Fault(code);
                }
            }
            match (state.capturing, state.next_due, state.period) {
                (true, Some(due), Some(period)) if due <= now + timeout => {
                    state.next_due = Some(due + period);
                    Some(due)
                }
                _ => None,
            }
        };

        match due {
            Some(due) => {
                thread::sleep(due.saturating_duration_since(now));
                self.complete_frame()
            }
            None => {
                thread::sleep(timeout);
                FrameEvent::TimedOut
            }
        }
    }
}

impl CameraDriver for SimulatedCamera {
    fn configure(&self, settings: &CaptureConfig) -> Result<f64, DriverError> {
        let mut state = self.lock();
        if let Some(code) = state.setup_fault.take() {
            return Err(DriverError::new(code, "simulated sensor did not respond"));
        }

        let framerate = settings.framerate.clamp(0.1, MAX_FRAMERATE);
        state.period = Some(Duration::from_secs_f64(1.0 / framerate));
        info!(
            "Simulated camera {}: AOI {}x{}+{}+{}, {:.2} fps",
            settings.camera_id,
            settings.aoi.width,
            settings.aoi.height,
            settings.aoi.x,
            settings.aoi.y,
            framerate
        );
        debug!(
            "Exposure {}, gain {}, pixel clock {} MHz",
            if settings.auto_exposure {
                "auto".to_string()
            } else {
                format!("{:.2} ms", settings.exposure_ms)
            },
            if settings.auto_gain {
                "auto".to_string()
            } else {
                settings.gain.to_string()
            },
            settings.pixel_clock_mhz
        );
        Ok(framerate)
    }

    fn arm_slots(&self, slots: &[Arc<FrameSlot>]) -> Result<Vec<BufferId>, DriverError> {
        let mut state = self.lock();
        state.armed = slots.to_vec();
        state.next = 0;
        state.active = None;
        debug!("Armed {} slots", slots.len());
        Ok(slots.iter().map(|slot| slot.id()).collect())
    }

    fn begin_capture(&self) -> Result<(), DriverError> {
        let mut state = self.lock();
        if state.armed.is_empty() {
            return Err(DriverError::new(NO_SLOTS_ARMED, "no slots armed"));
        }
        state.capturing = true;
        state.next_due = state.period.map(|period| Instant::now() + period);
        Ok(())
    }

    fn wait_for_frame_event(&self, timeout: Duration) -> FrameEvent {
        match &self.mode {
            Mode::FreeRunning { fault_after } => self.wait_free_running(timeout, *fault_after),
            Mode::Triggered(rx) => match rx.recv_timeout(timeout) {
                Ok(Trigger::Frame) => self.complete_frame(),
                Ok(Trigger::Fault(code)) => FrameEvent::Fault(code),
                Err(RecvTimeoutError::Timeout) => FrameEvent::TimedOut,
                Err(RecvTimeoutError::Disconnected) => {
                    thread::sleep(timeout);
                    FrameEvent::TimedOut
                }
            },
        }
    }

    fn resolve_active_handle(&self) -> Result<BufferId, DriverError> {
        self.lock()
            .active
            .ok_or_else(|| DriverError::new(NO_ACTIVE_BUFFER, "no frame completed yet"))
    }

    fn end_capture(&self) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.capturing = false;
        state.next_due = None;
        Ok(())
    }

    fn release(&self, handle: BufferId) -> Result<(), DriverError> {
        let mut state = self.lock();
        let before = state.armed.len();
        state.armed.retain(|slot| slot.id() != handle);
        if state.armed.len() == before {
            return Err(DriverError::new(UNKNOWN_HANDLE, format!("unknown buffer {handle}")));
        }
        if state.armed.is_empty() {
            state.next = 0;
            state.active = None;
        } else {
            state.next %= state.armed.len();
        }
        Ok(())
    }
}
