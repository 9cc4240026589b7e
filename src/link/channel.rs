//! Command state machine and the reader thread feeding it

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::Sender;
use metrics::counter;
use tracing::{debug, info, warn};

use super::{Command, Transport};

/// Acquisition lifecycle as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Acquiring,
    /// Capture has ended; storage is still flushing
    Draining,
}

/// Work the controller must do after a command was accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    StartSession,
    StopSession,
}

/// Events driving the controller loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Command(Command),
    /// Process shutdown requested locally
    Shutdown,
}

/// `Idle -> Acquiring -> Draining -> Idle`. Commands that do not apply to the current
/// state are ignored.
#[derive(Debug)]
pub struct CommandChannel {
    state: ChannelState,
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandChannel {
    pub fn new() -> Self {
        Self {
            state: ChannelState::Idle,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn on_command(&mut self, command: Command) -> Option<Action> {
        match (self.state, command) {
            (ChannelState::Idle, Command::Start) => {
                self.state = ChannelState::Acquiring;
                Some(Action::StartSession)
            }
            (ChannelState::Acquiring, Command::Stop) => {
                self.state = ChannelState::Draining;
                Some(Action::StopSession)
            }
            (state, Command::Reserved(byte)) => {
                debug!("Ignoring reserved command byte {:#04x} while {:?}", byte, state);
                None
            }
            (state, command) => {
                info!("Ignoring {:?} while {:?}", command, state);
                None
            }
        }
    }

    /// Session creation failed; fall back to idle.
    pub fn abort_start(&mut self) {
        if self.state == ChannelState::Acquiring {
            self.state = ChannelState::Idle;
        }
    }

    /// Capture ended on its own (overflow or camera fault). Returns whether the
    /// channel was acquiring.
    pub fn begin_drain(&mut self) -> bool {
        if self.state == ChannelState::Acquiring {
            self.state = ChannelState::Draining;
            true
        } else {
            false
        }
    }

    pub fn drain_complete(&mut self) {
        if self.state == ChannelState::Draining {
            self.state = ChannelState::Idle;
        }
    }
}

/// Drops command bytes identical to the previous one.
///
/// A polled register keeps returning the last value the supervisor wrote, so only
/// changes are commands.
#[derive(Debug, Default)]
pub struct Deduplicator {
    last: Option<u8>,
}

impl Deduplicator {
    pub fn accept(&mut self, byte: u8) -> bool {
        if self.last == Some(byte) {
            return false;
        }
        self.last = Some(byte);
        true
    }
}

/// Thread that reads command bytes from the transport and forwards new ones.
pub struct CommandReader {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    faults: Arc<AtomicU64>,
}

impl CommandReader {
    /// Read with `poll` as the per-call timeout; after a transport fault wait
    /// `backoff` and try again.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        poll: Duration,
        backoff: Duration,
        events: Sender<ControlEvent>,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let faults = Arc::new(AtomicU64::new(0));
        let handle = {
            let stop = stop.clone();
            let faults = faults.clone();
            thread::Builder::new()
                .name("link-reader".into())
                .spawn(move || {
                    let mut dedup = Deduplicator::default();
                    while !stop.load(Ordering::Acquire) {
                        match transport.read_command_byte(poll) {
                            Ok(Some(byte)) => {
                                if !dedup.accept(byte) {
                                    continue;
                                }
                                let command = Command::from(byte);
                                debug!("Received {:?}", command);
                                if events.send(ControlEvent::Command(command)).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                faults.fetch_add(1, Ordering::Relaxed);
                                counter!("aperture_link_faults_total").increment(1);
                                warn!("Link read failed, retrying: {}", e);
                                thread::sleep(backoff);
                            }
                        }
                    }
                    debug!("Link reader stopped");
                })?
        };

        Ok(Self {
            handle,
            stop,
            faults,
        })
    }

    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    /// Stop reading; returns after at most one poll interval.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Release);
        if self.handle.join().is_err() {
            warn!("Link reader panicked");
        }
    }
}
