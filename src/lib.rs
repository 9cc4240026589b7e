pub mod capture;
pub mod controller;
pub mod error;
pub mod link;
pub mod pipeline;
pub mod storage;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use controller::{Controller, SessionSummary};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    pub link: LinkConfig,
    pub threads: ThreadConfig,
}

/// Camera settings applied when a session starts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub camera_id: u32,
    pub aoi: AreaOfInterest,
    /// Requested frames per second; the driver reports what it actually uses
    pub framerate: f64,
    pub auto_exposure: bool,
    /// Ignored while auto exposure is on
    pub exposure_ms: f64,
    pub auto_gain: bool,
    pub gain: u32,
    pub pixel_clock_mhz: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaOfInterest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ring_slots: usize,
    /// Lock slot buffers into RAM (`mlock`)
    pub lock_memory: bool,
    pub event_timeout_ms: u64,
    /// How long the storage thread sleeps when the ring is empty
    pub drain_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub output_dir: PathBuf,
    pub format: ImageFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Pgm,
    Png,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// Named pipes on the local machine
    Pipe,
    /// USB-ISS I²C bridge
    #[value(name = "usbiss")]
    UsbIss,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub kind: LinkKind,
    pub command_path: PathBuf,
    /// Where status frames go for the pipe link; none disables them
    pub status_path: Option<PathBuf>,
    pub device: PathBuf,
    pub baud_rate: u32,
    pub poll_interval_ms: u64,
    pub telemetry_interval_ms: u64,
    pub retry_backoff_ms: u64,
    /// I²C address byte used to read the command register
    pub read_address: u8,
    /// I²C address byte used to write status frames
    pub write_address: u8,
    pub command_register: u8,
    pub status_register: u8,
    pub sensor_register: u8,
    /// Append the supervisor's sensor block to this file on every poll (USB-ISS only)
    pub sensor_log: Option<PathBuf>,
}

/// Optional CPU pinning for the pipeline threads
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    pub producer_core: Option<usize>,
    pub consumer_core: Option<usize>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera_id: 1,
            aoi: AreaOfInterest::default(),
            framerate: 3.0,
            auto_exposure: true,
            exposure_ms: 10.0,
            auto_gain: true,
            gain: 0,
            pixel_clock_mhz: 16,
        }
    }
}

impl Default for AreaOfInterest {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 2700,
            height: 900,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ring_slots: 50,
            lock_memory: true,
            event_timeout_ms: 1000,
            drain_poll_ms: 50,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("images"),
            format: ImageFormat::Pgm,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            kind: LinkKind::Pipe,
            command_path: PathBuf::from("/tmp/camera_pipe.p"),
            status_path: None,
            device: PathBuf::from("/dev/ttyACM0"),
            baud_rate: 19_200,
            poll_interval_ms: 100,
            telemetry_interval_ms: 200,
            retry_backoff_ms: 500,
            read_address: 0x23,
            write_address: 0x22,
            command_register: 0x00,
            status_register: 0x00,
            sensor_register: 0x01,
            sensor_log: None,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `APERTURE__SECTION__KEY`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix("APERTURE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

impl PipelineConfig {
    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }
}

impl LinkConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_flight_setup() {
        let config = Config::default();
        assert_eq!(config.capture.framerate, 3.0);
        assert_eq!(config.capture.aoi.width, 2700);
        assert_eq!(config.pipeline.ring_slots, 50);
        assert_eq!(config.storage.output_dir, PathBuf::from("images"));
        assert_eq!(config.link.command_path, PathBuf::from("/tmp/camera_pipe.p"));
        assert_eq!(config.link.telemetry_interval(), Duration::from_millis(200));
    }

    #[test]
    fn file_overrides_defaults_and_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[pipeline]\nring_slots = 8\nlock_memory = false\n\n[storage]\nformat = \"png\"\n\n[threads]\nproducer_core = 1"
        )
        .unwrap();

        std::env::set_var("APERTURE__THREADS__PRODUCER_CORE", "3");
        let config = Config::load(Some(file.path())).unwrap();
        std::env::remove_var("APERTURE__THREADS__PRODUCER_CORE");

        assert_eq!(config.pipeline.ring_slots, 8);
        assert!(!config.pipeline.lock_memory);
        assert_eq!(config.pipeline.event_timeout_ms, 1000);
        assert_eq!(config.storage.format, ImageFormat::Png);
        assert_eq!(config.threads.producer_core, Some(3));
        assert_eq!(config.link.kind, LinkKind::Pipe);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/aperture.toml"))).is_err());
    }
}
