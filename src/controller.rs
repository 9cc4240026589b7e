//! Acquisition controller: owns the camera, the supervisor link and at most one
//! running session.
//!
//! Everything here runs on the caller's thread. The controller spawns the producer and
//! storage threads for a session, joins them when it ends, and keeps the supervisor
//! informed with status frames.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError};
use metrics::counter;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{BufferId, CameraDriver};
use crate::error::{AcquisitionError, SetupFault, StorageError};
use crate::link::channel::Action;
use crate::link::{ChannelState, Command, CommandChannel, ControlEvent, StatusFlags, StatusFrame, Transport};
use crate::pipeline::{Consumer, ConsumerReport, Producer, ProducerReport, RingIndex, Session};
use crate::storage::{FileSink, FrameSink};
use crate::{utils, Config};

/// Builds the sink for a session from its index.
pub type SinkFactory = Box<dyn FnMut(u32) -> Result<Arc<dyn FrameSink>, StorageError> + Send>;

/// Outcome of one session, logged when it ends
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub index: u32,
    pub frames_acquired: u64,
    pub frames_persisted: u64,
    pub frames_dropped: u64,
    pub overflowed: bool,
    /// Camera status code if capture ended on a fault
    pub fault: Option<i32>,
    pub duration: Duration,
}

struct ActiveSession {
    index: u32,
    session: Arc<Session>,
    producer: Option<JoinHandle<Result<ProducerReport, AcquisitionError>>>,
    consumer: Option<JoinHandle<ConsumerReport>>,
    handles: Vec<BufferId>,
    started: Instant,
    capture_error: Option<AcquisitionError>,
}

pub struct Controller {
    config: Config,
    driver: Arc<dyn CameraDriver>,
    transport: Arc<dyn Transport>,
    channel: CommandChannel,
    sink_factory: SinkFactory,
    active: Option<ActiveSession>,
    camera_ready: bool,
    framerate: f64,
    first_index: u32,
    sessions_started: u32,
    last_summary: Option<SessionSummary>,
}

impl Controller {
    pub fn new(config: Config, driver: Arc<dyn CameraDriver>, transport: Arc<dyn Transport>) -> Self {
        let root = config.storage.output_dir.clone();
        let format = config.storage.format;
        let first_index = utils::next_session_index(&root);
        let framerate = config.capture.framerate;

        Self {
            config,
            driver,
            transport,
            channel: CommandChannel::new(),
            sink_factory: Box::new(move |index| {
                let sink = FileSink::create(utils::session_dir(&root, index), format)?;
                Ok(Arc::new(sink) as Arc<dyn FrameSink>)
            }),
            active: None,
            camera_ready: false,
            framerate,
            first_index,
            sessions_started: 0,
            last_summary: None,
        }
    }

    /// Replace the default per-session [`FileSink`].
    pub fn with_sink_factory(mut self, factory: SinkFactory) -> Self {
        self.sink_factory = factory;
        self
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn sessions_started(&self) -> u32 {
        self.sessions_started
    }

    pub fn last_summary(&self) -> Option<&SessionSummary> {
        self.last_summary.as_ref()
    }

    /// Frames captured by the running session, or by the last one once it ended.
    pub fn frames_acquired(&self) -> u64 {
        match &self.active {
            Some(active) => active.session.frames_acquired(),
            None => self
                .last_summary
                .as_ref()
                .map_or(0, |summary| summary.frames_acquired),
        }
    }

    /// Directory the next session would write to with the default sink.
    pub fn next_session_dir(&self) -> PathBuf {
        utils::session_dir(
            &self.config.storage.output_dir,
            self.first_index + self.sessions_started,
        )
    }

    /// Apply the camera settings once so the supervisor sees whether the camera is
    /// usable before the first START.
    pub fn prepare_camera(&mut self) -> Result<f64, SetupFault> {
        let result = self.driver.configure(&self.config.capture);
        self.camera_ready = result.is_ok();
        let framerate = result?;
        self.framerate = framerate;
        info!("Camera ready at {:.2} fps", framerate);
        Ok(framerate)
    }

    /// Build a ring, arm the camera with it and start the producer and storage threads.
    /// The command channel moves to Acquiring, or back to Idle if setup fails.
    ///
    /// On failure everything already started is stopped and joined, and the camera gets
    /// its handles back, before the error is returned.
    pub fn start(&mut self) -> Result<(), AcquisitionError> {
        if self.active.is_some() {
            warn!("A session is already running");
            return Ok(());
        }
        if self.channel.state() == ChannelState::Idle {
            self.channel.on_command(Command::Start);
        }

        let result = self.open_session();
        if result.is_err() {
            self.channel.abort_start();
        }
        result
    }

    #[instrument(skip(self), fields(session = self.first_index + self.sessions_started))]
    fn open_session(&mut self) -> Result<(), AcquisitionError> {
        let index = self.first_index + self.sessions_started;
        let pipeline = self.config.pipeline.clone();
        let threads = self.config.threads.clone();
        let aoi = self.config.capture.aoi;

        let ring = RingIndex::create(aoi.width, aoi.height, pipeline.ring_slots, pipeline.lock_memory)
            .map_err(SetupFault::from)?;
        self.prepare_camera()?;
        let handles = self.driver.arm_slots(ring.slots()).map_err(SetupFault::from)?;

        let sink = match (self.sink_factory)(index) {
            Ok(sink) => sink,
            Err(e) => {
                self.release_handles(&handles);
                return Err(SetupFault::from(e).into());
            }
        };

        let session = Arc::new(Session::new(ring));
        let consumer = match Consumer::new(session.clone(), sink, pipeline.drain_poll())
            .spawn(threads.consumer_core)
        {
            Ok(handle) => handle,
            Err(source) => {
                self.release_handles(&handles);
                return Err(SetupFault::Spawn { name: "storage", source }.into());
            }
        };

        let producer = match Producer::new(session.clone(), self.driver.clone(), pipeline.event_timeout())
            .spawn(threads.producer_core)
        {
            Ok(handle) => handle,
            Err(source) => {
                self.abandon(&session, None, consumer, &handles);
                return Err(SetupFault::Spawn { name: "producer", source }.into());
            }
        };

        if let Err(e) = self.driver.begin_capture() {
            self.abandon(&session, Some(producer), consumer, &handles);
            return Err(SetupFault::Camera(e).into());
        }

        self.sessions_started += 1;
        counter!("aperture_sessions_total").increment(1);
        info!(
            "Session {} acquiring: {} slots of {}x{}",
            index,
            session.capacity(),
            aoi.width,
            aoi.height
        );

        self.active = Some(ActiveSession {
            index,
            session,
            producer: Some(producer),
            consumer: Some(consumer),
            handles,
            started: Instant::now(),
            capture_error: None,
        });
        Ok(())
    }

    /// Stop capture: join the producer, end capture on the camera and let the storage
    /// thread drain what is left. Returns immediately after that.
    pub fn begin_stop(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let Some(producer) = active.producer.take() else {
            return;
        };

        active.session.request_stop();
        match producer.join() {
            Ok(Ok(report)) => debug!("Producer joined after {} frames", report.frames),
            Ok(Err(e)) => active.capture_error = Some(e),
            Err(_) => active.capture_error = Some(AcquisitionError::Panicked("producer")),
        }
        if let Err(e) = self.driver.end_capture() {
            warn!("Camera did not end capture cleanly: {}", e);
        }
        active.session.finish_draining();
        info!(
            "Capture ended, {} frames left to store",
            active.session.ready_count()
        );
    }

    /// Whether the storage thread has finished draining.
    pub fn poll_drain(&self) -> bool {
        self.active
            .as_ref()
            .and_then(|active| active.consumer.as_ref())
            .map_or(true, |consumer| consumer.is_finished())
    }

    /// Join the storage thread, hand the slots back to the camera and drop the ring.
    pub fn finish_stop(&mut self) -> Option<SessionSummary> {
        self.begin_stop();
        let mut active = self.active.take()?;

        if let Some(consumer) = active.consumer.take() {
            if consumer.join().is_err() {
                error!("Storage thread panicked");
            }
        }
        self.release_handles(&active.handles);

        let session = &active.session;
        let summary = SessionSummary {
            index: active.index,
            frames_acquired: session.frames_acquired(),
            frames_persisted: session.frames_persisted(),
            frames_dropped: session.frames_dropped(),
            overflowed: session.overflowed(),
            fault: session.fault(),
            duration: active.started.elapsed(),
        };

        if let Some(e) = active.capture_error.take() {
            error!("Session {} ended abnormally: {}", summary.index, e);
        }
        info!(
            "Session {} done in {:.1?}: {} acquired, {} stored, {} dropped{}",
            summary.index,
            summary.duration,
            summary.frames_acquired,
            summary.frames_persisted,
            summary.frames_dropped,
            if summary.overflowed { ", stopped on overflow" } else { "" }
        );

        self.last_summary = Some(summary.clone());
        Some(summary)
    }

    /// Stop the running session and wait until every ready frame is stored.
    pub fn stop(&mut self) -> Option<SessionSummary> {
        self.channel.begin_drain();
        let summary = self.finish_stop();
        self.channel.drain_complete();
        summary
    }

    pub fn status_frame(&self) -> StatusFrame {
        let mut flags = StatusFlags::ON;
        if self.camera_ready {
            flags |= StatusFlags::CAMERA_READY;
        }
        match self.channel.state() {
            ChannelState::Acquiring => flags |= StatusFlags::ACQUIRING,
            ChannelState::Draining => flags |= StatusFlags::PERSISTING,
            ChannelState::Idle => {}
        }
        if let Some(active) = &self.active {
            if active.session.ready_count() > 0 {
                flags |= StatusFlags::PERSISTING;
            }
        }
        StatusFrame::new(self.frames_acquired(), self.framerate, flags)
    }

    pub fn send_status(&self) {
        let frame = self.status_frame();
        if let Err(e) = self.transport.write_status_frame(&frame.encode()) {
            counter!("aperture_link_faults_total").increment(1);
            warn!("Could not send status frame: {}", e);
        }
    }

    pub fn handle_command(&mut self, command: Command) {
        match self.channel.on_command(command) {
            Some(Action::StartSession) => {
                if let Err(e) = self.start() {
                    error!("Could not start acquisition: {}", e);
                }
            }
            Some(Action::StopSession) => self.begin_stop(),
            None => {}
        }
    }

    /// Housekeeping between events: notice sessions that stopped on their own and
    /// complete drains.
    pub fn tick(&mut self) {
        let stopped_itself = self
            .active
            .as_ref()
            .is_some_and(|active| active.session.stop_requested());
        if stopped_itself && self.channel.begin_drain() {
            warn!("Acquisition stopped without a STOP command");
            self.begin_stop();
        }

        if self.channel.state() == ChannelState::Draining && self.poll_drain() {
            self.finish_stop();
            self.channel.drain_complete();
        }
    }

    /// Serve commands until a shutdown event arrives or the event channel closes.
    ///
    /// A status frame goes out on every state change and every telemetry interval
    /// while a session is active.
    pub fn run(&mut self, events: &Receiver<ControlEvent>) {
        if let Err(e) = self.prepare_camera() {
            error!("Camera not ready: {}", e);
        }
        self.send_status();

        let telemetry = self.config.link.telemetry_interval();
        let housekeeping = self.config.pipeline.drain_poll().min(telemetry);
        let mut next_telemetry = Instant::now() + telemetry;
        let mut last_state = self.state();

        loop {
            let wait = if self.state() == ChannelState::Idle {
                telemetry
            } else {
                housekeeping
            };
            let deadline = (Instant::now() + wait).min(next_telemetry);

            match events.recv_deadline(deadline) {
                Ok(ControlEvent::Command(command)) => self.handle_command(command),
                Ok(ControlEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.tick();

            let state = self.state();
            if state != last_state {
                debug!("{:?} -> {:?}", last_state, state);
                last_state = state;
                self.send_status();
            } else if Instant::now() >= next_telemetry && state != ChannelState::Idle {
                self.send_status();
            }
            if Instant::now() >= next_telemetry {
                next_telemetry = Instant::now() + telemetry;
            }
        }

        info!("Shutting down");
        if self.state() != ChannelState::Idle {
            self.stop();
        }
        self.camera_ready = false;
        self.send_status();
    }

    fn release_handles(&self, handles: &[BufferId]) {
        for &handle in handles {
            if let Err(e) = self.driver.release(handle) {
                warn!("Camera refused to release buffer {}: {}", handle, e);
            }
        }
    }

    /// Unwind a half-started session.
    fn abandon(
        &self,
        session: &Session,
        producer: Option<JoinHandle<Result<ProducerReport, AcquisitionError>>>,
        consumer: JoinHandle<ConsumerReport>,
        handles: &[BufferId],
    ) {
        session.request_stop();
        match producer.map(JoinHandle::join) {
            Some(Ok(Err(e))) => warn!("Producer of the abandoned session failed: {}", e),
            Some(Err(_)) => error!("Producer thread panicked"),
            Some(Ok(Ok(_))) | None => {}
        }
        if let Err(e) = self.driver.end_capture() {
            warn!("Camera did not end capture cleanly: {}", e);
        }
        session.finish_draining();
        if consumer.join().is_err() {
            error!("Storage thread panicked");
        }
        self.release_handles(handles);
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if self.active.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameEvent, FrameSlot, SimulatedCamera};
    use crate::error::DriverError;
    use crate::link::MemoryTransport;
    use crate::CaptureConfig;

    /// Arms like the simulated camera but refuses to start or end capture.
    struct RefusingCamera(Arc<SimulatedCamera>);

    impl CameraDriver for RefusingCamera {
        fn configure(&self, settings: &CaptureConfig) -> Result<f64, DriverError> {
            self.0.configure(settings)
        }

        fn arm_slots(&self, slots: &[Arc<FrameSlot>]) -> Result<Vec<BufferId>, DriverError> {
            self.0.arm_slots(slots)
        }

        fn begin_capture(&self) -> Result<(), DriverError> {
            Err(DriverError::new(-3, "sensor busy"))
        }

        fn wait_for_frame_event(&self, timeout: Duration) -> FrameEvent {
            self.0.wait_for_frame_event(timeout)
        }

        fn resolve_active_handle(&self) -> Result<BufferId, DriverError> {
            self.0.resolve_active_handle()
        }

        fn end_capture(&self) -> Result<(), DriverError> {
            Err(DriverError::new(-4, "not capturing"))
        }

        fn release(&self, handle: BufferId) -> Result<(), DriverError> {
            self.0.release(handle)
        }
    }

    fn controller(camera: SimulatedCamera) -> (Controller, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.output_dir = dir.path().to_path_buf();
        config.capture.aoi.width = 16;
        config.capture.aoi.height = 8;
        config.pipeline.ring_slots = 4;
        config.pipeline.lock_memory = false;
        config.pipeline.event_timeout_ms = 10;
        config.pipeline.drain_poll_ms = 5;
        let (transport, _link) = MemoryTransport::pair();
        let controller = Controller::new(config, Arc::new(camera), Arc::new(transport));
        (controller, dir)
    }

    #[test]
    fn idle_status_reports_only_power() {
        let (controller, _dir) = controller(SimulatedCamera::free_running());
        let frame = controller.status_frame();
        assert_eq!(frame.flags, StatusFlags::ON);
        assert_eq!(frame.images_acquired, 0);
        assert_eq!(frame.framerate, 3);
    }

    #[test]
    fn stop_without_session_is_a_no_op() {
        let (mut controller, _dir) = controller(SimulatedCamera::free_running());
        assert_eq!(controller.stop(), None);
        assert_eq!(controller.state(), ChannelState::Idle);
    }

    #[test]
    fn failed_setup_releases_the_camera() {
        let camera = Arc::new(SimulatedCamera::free_running());
        let mut config = Config::default();
        config.capture.aoi.width = 16;
        config.capture.aoi.height = 8;
        config.pipeline.ring_slots = 4;
        config.pipeline.lock_memory = false;
        let (transport, _link) = MemoryTransport::pair();
        let mut controller = Controller::new(config, camera.clone(), Arc::new(transport))
            .with_sink_factory(Box::new(
                |index: u32| -> Result<Arc<dyn FrameSink>, StorageError> {
                    Err(StorageError::Busy(index as usize))
                },
            ));

        let err = controller.start().unwrap_err();
        assert!(err.is_setup_fault());
        assert_eq!(controller.state(), ChannelState::Idle);
        assert_eq!(camera.armed_slots(), 0);
        assert_eq!(controller.sessions_started(), 0);
    }

    #[test]
    fn refused_capture_unwinds_the_started_threads() {
        let camera = Arc::new(SimulatedCamera::free_running());
        let mut config = Config::default();
        let dir = tempfile::tempdir().unwrap();
        config.storage.output_dir = dir.path().to_path_buf();
        config.capture.aoi.width = 16;
        config.capture.aoi.height = 8;
        config.pipeline.ring_slots = 4;
        config.pipeline.lock_memory = false;
        config.pipeline.event_timeout_ms = 10;
        let (transport, _link) = MemoryTransport::pair();
        let mut controller = Controller::new(
            config,
            Arc::new(RefusingCamera(camera.clone())),
            Arc::new(transport),
        );

        let err = controller.start().unwrap_err();
        assert!(matches!(err, AcquisitionError::Setup(SetupFault::Camera(ref e)) if e.code == -3));
        assert_eq!(controller.state(), ChannelState::Idle);
        assert_eq!(camera.armed_slots(), 0);
        assert_eq!(controller.stop(), None);

        // Unwinding leaves nothing behind that blocks the next attempt.
        assert!(controller.start().unwrap_err().is_setup_fault());
        assert_eq!(camera.armed_slots(), 0);
    }

    #[test]
    fn free_running_session_is_numbered_and_counted() {
        let (mut controller, dir) = controller(SimulatedCamera::free_running());
        controller.config.capture.framerate = 50.0;
        assert_eq!(controller.next_session_dir(), dir.path().join("session-001"));

        controller.start().unwrap();
        assert_eq!(controller.state(), ChannelState::Acquiring);
        std::thread::sleep(Duration::from_millis(60));
        let summary = controller.stop().unwrap();
        assert_eq!(controller.state(), ChannelState::Idle);

        assert_eq!(summary.index, 1);
        assert_eq!(summary.frames_acquired, summary.frames_persisted + summary.frames_dropped);
        assert!(dir.path().join("session-001").is_dir());
        assert_eq!(controller.next_session_dir(), dir.path().join("session-002"));
        assert!(controller.status_frame().flags.contains(StatusFlags::CAMERA_READY));
    }
}
