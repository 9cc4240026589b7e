//! USB-ISS I²C bridge: the supervisor exposes a command register and accepts
//! status frames on a second address.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Buf;
use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info, instrument, warn};

use super::Transport;
use crate::error::TransportError;
use crate::LinkConfig;

/// I²C read/write with a one-byte register address
const I2C_AD1: u8 = 0x55;
/// Module commands
const USB_ISS: u8 = 0x5A;
const ISS_VERSION: u8 = 0x01;
const ISS_MODE: u8 = 0x02;
const GET_SER_NUM: u8 = 0x03;

/// 400 kHz hardware I²C, I/O pins left as inputs
const I2C_H_400KHZ: u8 = 0x70;
const IO_ALL_INPUTS: u8 = 0x02;

const ISS_ACK: u8 = 0xFF;
const MAX_FRAME: usize = 60;

/// Reply deadline for a single transaction
const REPLY_TIMEOUT: Duration = Duration::from_millis(500);
/// Port-level read timeout; the reply deadline is checked between reads
const PORT_TIMEOUT: Duration = Duration::from_millis(50);

/// Time word, four readings, two status bytes
pub const SENSOR_BLOCK_LEN: usize = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub id: u8,
    pub firmware: u8,
    pub serial: String,
}

/// Housekeeping block the supervisor publishes next to the command register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorBlock {
    pub time: u32,
    pub readings: [u16; 4],
    pub status: [u8; 2],
}

impl SensorBlock {
    /// All fields are little-endian.
    pub fn decode(mut raw: &[u8]) -> Option<Self> {
        if raw.len() < SENSOR_BLOCK_LEN {
            return None;
        }
        let time = raw.get_u32_le();
        let mut readings = [0u16; 4];
        for reading in &mut readings {
            *reading = raw.get_u16_le();
        }
        Some(Self {
            time,
            readings,
            status: [raw.get_u8(), raw.get_u8()],
        })
    }

    pub fn log_line(&self) -> String {
        let [r0, r1, r2, r3] = self.readings;
        let [s0, s1] = self.status;
        format!("{}\t{r0}\t{r1}\t{r2}\t{r3}\t{s0}\t{s1}", self.time)
    }
}

pub fn read_request(address: u8, register: u8, len: u8) -> [u8; 4] {
    [I2C_AD1, address, register, len]
}

pub fn write_request(address: u8, register: u8, data: &[u8]) -> Result<Vec<u8>, TransportError> {
    if data.len() > MAX_FRAME - 4 {
        return Err(TransportError::Rejected(format!(
            "{} byte payload exceeds the module buffer",
            data.len()
        )));
    }
    let mut request = Vec::with_capacity(4 + data.len());
    request.extend_from_slice(&[I2C_AD1, address, register, data.len() as u8]);
    request.extend_from_slice(data);
    Ok(request)
}

pub fn mode_request() -> [u8; 4] {
    [USB_ISS, ISS_MODE, I2C_H_400KHZ, IO_ALL_INPUTS]
}

fn parse_mode_reply(reply: [u8; 2]) -> Result<(), TransportError> {
    match reply {
        [ISS_ACK, _] => Ok(()),
        [_, 0x05] => Err(TransportError::Rejected("set mode: unknown command".into())),
        [_, code @ (0x06 | 0x07)] => Err(TransportError::Rejected(format!(
            "set mode: internal error {}",
            code - 5
        ))),
        [_, code] => Err(TransportError::Rejected(format!(
            "set mode: unknown error {code:#04x}"
        ))),
    }
}

/// Send `request` and fill `reply`, giving up once `timeout` has passed.
fn exchange<P>(
    port: &mut P,
    request: &[u8],
    reply: &mut [u8],
    timeout: Duration,
) -> Result<(), TransportError>
where
    P: Read + Write + ?Sized,
{
    port.write_all(request)?;
    port.flush()?;

    let deadline = Instant::now() + timeout;
    let mut filled = 0;
    while filled < reply.len() {
        match port.read(&mut reply[filled..]) {
            Ok(n) => filled += n,
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {}
            Err(e) => return Err(e.into()),
        }
        if filled < reply.len() && Instant::now() >= deadline {
            return Err(TransportError::Timeout);
        }
    }
    Ok(())
}

fn read_sensor_block<P>(
    port: &mut P,
    address: u8,
    register: u8,
    timeout: Duration,
) -> Result<SensorBlock, TransportError>
where
    P: Read + Write + ?Sized,
{
    let mut raw = [0u8; SENSOR_BLOCK_LEN];
    exchange(
        port,
        &read_request(address, register, SENSOR_BLOCK_LEN as u8),
        &mut raw,
        timeout,
    )?;
    SensorBlock::decode(&raw).ok_or_else(|| TransportError::Rejected("short sensor block".into()))
}

struct SensorLog {
    register: u8,
    out: Mutex<File>,
}

pub struct UsbIssTransport {
    port: Mutex<Box<dyn SerialPort>>,
    read_address: u8,
    write_address: u8,
    command_register: u8,
    status_register: u8,
    poll_interval: Duration,
    sensor: Option<SensorLog>,
}

impl UsbIssTransport {
    #[instrument(skip(config))]
    pub fn open(device: &Path, config: &LinkConfig) -> Result<Self, TransportError> {
        let port = serialport::new(device.to_string_lossy(), config.baud_rate)
            .timeout(PORT_TIMEOUT)
            .open()?;
        port.clear(ClearBuffer::All)?;

        let sensor = match &config.sensor_log {
            Some(path) => {
                let out = OpenOptions::new().create(true).append(true).open(path)?;
                info!("Logging supervisor sensor blocks to {}", path.display());
                Some(SensorLog {
                    register: config.sensor_register,
                    out: Mutex::new(out),
                })
            }
            None => None,
        };

        let transport = Self {
            port: Mutex::new(port),
            read_address: config.read_address,
            write_address: config.write_address,
            command_register: config.command_register,
            status_register: config.status_register,
            poll_interval: config.poll_interval(),
            sensor,
        };

        let module = transport.module_info()?;
        info!(
            "USB-ISS module {:#04x} firmware {:#04x} serial {}",
            module.id, module.firmware, module.serial
        );
        transport.set_i2c_mode()?;

        Ok(transport)
    }

    fn lock_port(&self) -> MutexGuard<'_, Box<dyn SerialPort>> {
        self.port.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transact(&self, request: &[u8], reply: &mut [u8]) -> Result<(), TransportError> {
        exchange(&mut **self.lock_port(), request, reply, REPLY_TIMEOUT)
    }

    pub fn module_info(&self) -> Result<ModuleInfo, TransportError> {
        let mut version = [0u8; 3];
        self.transact(&[USB_ISS, ISS_VERSION], &mut version)?;
        let mut serial = [0u8; 8];
        self.transact(&[USB_ISS, GET_SER_NUM], &mut serial)?;

        Ok(ModuleInfo {
            id: version[0],
            firmware: version[1],
            serial: String::from_utf8_lossy(&serial).trim().to_string(),
        })
    }

    fn set_i2c_mode(&self) -> Result<(), TransportError> {
        let mut reply = [0u8; 2];
        self.transact(&mode_request(), &mut reply)?;
        parse_mode_reply(reply)
    }

    fn log_sensor_block(&self, sensor: &SensorLog) {
        let block = read_sensor_block(
            &mut **self.lock_port(),
            self.read_address,
            sensor.register,
            REPLY_TIMEOUT,
        );
        match block {
            Ok(block) => {
                debug!("Sensor block {:?}", block);
                let mut out = sensor.out.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(e) = writeln!(out, "{}", block.log_line()) {
                    warn!("Could not append to sensor log: {}", e);
                }
            }
            Err(e) => warn!("Sensor block read failed: {}", e),
        }
    }
}

impl Transport for UsbIssTransport {
    /// The register is sampled once per poll interval; `timeout` only caps the wait.
    fn read_command_byte(&self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        thread::sleep(self.poll_interval.min(timeout));
        let mut byte = [0u8; 1];
        self.transact(
            &read_request(self.read_address, self.command_register, 1),
            &mut byte,
        )?;
        if let Some(sensor) = &self.sensor {
            self.log_sensor_block(sensor);
        }
        Ok(Some(byte[0]))
    }

    fn write_status_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        let request = write_request(self.write_address, self.status_register, frame)?;
        let mut ack = [0u8; 1];
        self.transact(&request, &mut ack)?;
        if ack[0] == 0 {
            return Err(TransportError::Rejected("status write not acknowledged".into()));
        }
        Ok(())
    }
}
