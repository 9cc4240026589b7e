//! Acquisition producer: turns camera frame events into ready slots

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};

use super::session::Session;
use crate::capture::{CameraDriver, FrameEvent};
use crate::error::{AcquisitionError, RingError};
use crate::utils;

/// What the producer did before it stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerReport {
    pub frames: u64,
    pub overflowed: bool,
}

pub struct Producer {
    session: Arc<Session>,
    driver: Arc<dyn CameraDriver>,
    event_timeout: Duration,
}

impl Producer {
    pub fn new(session: Arc<Session>, driver: Arc<dyn CameraDriver>, event_timeout: Duration) -> Self {
        Self {
            session,
            driver,
            event_timeout,
        }
    }

    /// Run the producer on its own named thread, optionally pinned to `core`.
    pub fn spawn(
        self,
        core: Option<usize>,
    ) -> io::Result<JoinHandle<Result<ProducerReport, AcquisitionError>>> {
        thread::Builder::new()
            .name("acq-producer".into())
            .spawn(move || {
                if let Some(core) = core {
                    utils::pin_current_thread(core);
                }
                self.run()
            })
    }

    /// Wait for frame events until a stop is requested.
    ///
    /// The loop ends on its own when the ring is one frame short of full, so the camera
    /// never completes a frame into a slot that has not been stored yet.
    pub fn run(self) -> Result<ProducerReport, AcquisitionError> {
        let mut report = ProducerReport::default();
        info!("Producer started ({} slots)", self.session.capacity());

        while !self.session.stop_requested() {
            match self.driver.wait_for_frame_event(self.event_timeout) {
                FrameEvent::TimedOut => continue,
                FrameEvent::Fault(code) => {
                    error!("Camera fault {} during capture, stopping acquisition", code);
                    counter!("aperture_camera_faults_total").increment(1);
                    self.session.record_fault(code);
                    self.session.request_stop();
                    return Err(AcquisitionError::Fault { code });
                }
                FrameEvent::Signaled => {
                    if let Err(e) = self.on_frame(&mut report) {
                        error!("Producer lost track of the ring: {}", e);
                        self.session.request_stop();
                        return Err(e);
                    }
                }
            }
        }

        info!("Producer stopped after {} frames", report.frames);
        Ok(report)
    }

    fn on_frame(&self, report: &mut ProducerReport) -> Result<(), AcquisitionError> {
        let handle = self
            .driver
            .resolve_active_handle()
            .map_err(|e| {
                self.session.record_fault(e.code);
                AcquisitionError::Fault { code: e.code }
            })?;
        let index = self
            .session
            .ring()
            .index_of_buffer(handle)
            .map_err(AcquisitionError::Consistency)?;

        let published = match self.session.publish(index, self.session.elapsed_us()) {
            Ok(published) => published,
            Err(RingError::Full(waiting)) => {
                // Only reachable if capture outlived a previous overflow stop.
                warn!("Ring full with {} frames waiting, discarding camera frame", waiting);
                self.session.mark_overflow();
                self.session.request_stop();
                report.overflowed = true;
                return Ok(());
            }
            Err(e) => return Err(AcquisitionError::Consistency(e)),
        };

        report.frames += 1;
        counter!("aperture_frames_acquired_total").increment(1);
        gauge!("aperture_ready_slots").set(published.ready_count as f64);
        debug!(
            "Frame {} in slot {} ({} waiting)",
            report.frames, published.index, published.ready_count
        );

        if published.overflow {
            warn!(
                "Ring holds {} unread frames, stopping acquisition to avoid overwriting them",
                published.ready_count
            );
            counter!("aperture_overflow_stops_total").increment(1);
            self.session.mark_overflow();
            self.session.request_stop();
            report.overflowed = true;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{BufferId, FrameSlot, SimulatedCamera};
    use crate::error::DriverError;
    use crate::pipeline::RingIndex;
    use crate::CaptureConfig;

    const TIMEOUT: Duration = Duration::from_millis(20);

    fn armed(capacity: usize) -> (Arc<Session>, Arc<SimulatedCamera>, crate::capture::FrameTrigger) {
        let ring = RingIndex::create(8, 4, capacity, false).unwrap();
        let (camera, trigger) = SimulatedCamera::triggered();
        let camera = Arc::new(camera);
        camera.configure(&CaptureConfig::default()).unwrap();
        camera.arm_slots(ring.slots()).unwrap();
        camera.begin_capture().unwrap();
        (Arc::new(Session::new(ring)), camera, trigger)
    }

    #[test]
    fn overflow_stops_before_the_next_notification() {
        for capacity in [2usize, 4, 10] {
            let (session, camera, trigger) = armed(capacity);
            // One more trigger than may be consumed.
            trigger.frames(capacity);

            let producer = Producer::new(session.clone(), camera.clone(), TIMEOUT);
            let report = producer.run().unwrap();

            assert!(report.overflowed);
            assert_eq!(report.frames, capacity as u64 - 1);
            assert_eq!(session.ready_count(), capacity - 1);
            assert!(session.stop_requested());
            assert_eq!(trigger.pending(), 1, "frame N must not reach the producer");
        }
    }

    #[test]
    fn fewer_frames_than_capacity_leave_capture_running() {
        let (session, camera, trigger) = armed(6);
        trigger.frames(3);

        let handle = Producer::new(session.clone(), camera, TIMEOUT).spawn(None).unwrap();
        while session.frames_acquired() < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!session.stop_requested());

        session.request_stop();
        let report = handle.join().unwrap().unwrap();
        assert_eq!(report.frames, 3);
        assert!(!report.overflowed);
        assert_eq!(session.ready_count(), 3);
    }

    #[test]
    fn camera_fault_ends_the_session() {
        let (session, camera, trigger) = armed(4);
        trigger.frame();
        trigger.fault(-17);

        let err = Producer::new(session.clone(), camera, TIMEOUT).run().unwrap_err();
        assert!(matches!(err, AcquisitionError::Fault { code: -17 }));
        assert!(session.stop_requested());
        assert_eq!(session.fault(), Some(-17));
        assert_eq!(session.ready_count(), 1);
    }

    /// Signals frames but can never say which buffer holds them.
    struct NoActiveBuffer;

    impl CameraDriver for NoActiveBuffer {
        fn configure(&self, settings: &CaptureConfig) -> Result<f64, DriverError> {
            Ok(settings.framerate)
        }

        fn arm_slots(&self, slots: &[Arc<FrameSlot>]) -> Result<Vec<BufferId>, DriverError> {
            Ok(slots.iter().map(|slot| slot.id()).collect())
        }

        fn begin_capture(&self) -> Result<(), DriverError> {
            Ok(())
        }

        fn wait_for_frame_event(&self, _timeout: Duration) -> FrameEvent {
            FrameEvent::Signaled
        }

        fn resolve_active_handle(&self) -> Result<BufferId, DriverError> {
            Err(DriverError::new(-9, "no active buffer"))
        }

        fn end_capture(&self) -> Result<(), DriverError> {
            Ok(())
        }

        fn release(&self, _handle: BufferId) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[test]
    fn unresolved_buffer_is_recorded_as_a_fault() {
        let session = Arc::new(Session::new(RingIndex::create(8, 4, 4, false).unwrap()));

        let err = Producer::new(session.clone(), Arc::new(NoActiveBuffer), TIMEOUT)
            .run()
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Fault { code: -9 }));
        assert!(session.stop_requested());
        assert_eq!(session.fault(), Some(-9));
        assert_eq!(session.frames_acquired(), 0);
    }
}
