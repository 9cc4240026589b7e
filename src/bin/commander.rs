//! Supervisor stand-in: opens and closes an acquisition window over the command pipe
//! and prints the status frames that come back.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use aperture::link::pipe::ensure_fifo;
use aperture::link::{StatusFrame, START_BYTE, STOP_BYTE};
use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::uptime;

#[derive(Parser)]
#[command(name = "commander", about)]
struct Args {
    /// Command pipe the acquisition process listens on
    #[arg(long, default_value = "/tmp/camera_pipe.p")]
    pipe: PathBuf,

    /// FIFO the acquisition process writes status frames to
    #[arg(long)]
    status: Option<PathBuf>,

    /// Seconds before sending START
    #[arg(long, default_value = "1", value_parser = parse_seconds)]
    start_after: Duration,

    /// Seconds between START and STOP
    #[arg(long, default_value = "10", value_parser = parse_seconds)]
    stop_after: Duration,

    /// Number of START/STOP windows
    #[arg(long, default_value_t = 1)]
    cycles: u32,
}

/// Non-negative, finite seconds.
fn parse_seconds(arg: &str) -> Result<Duration, String> {
    let seconds: f64 = arg.parse().map_err(|e| format!("{arg:?} is not a number: {e}"))?;
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| format!("{arg} is not a usable delay in seconds"))
}

fn send(pipe: &mut File, byte: u8) -> Result<()> {
    pipe.write_all(&[byte]).wrap_err("writing command")?;
    info!("Sent {}", byte as char);
    Ok(())
}

fn print_status(mut fifo: File) {
    let mut raw = [0u8; 4];
    loop {
        match fifo.read_exact(&mut raw) {
            Ok(()) => {
                if let Some(frame) = StatusFrame::decode(&raw) {
                    println!(
                        "images={:5} fps={:3} flags={:?}",
                        frame.images_acquired, frame.framerate, frame.flags
                    );
                }
            }
            Err(e) => {
                warn!("Status stream ended: {}", e);
                break;
            }
        }
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("commander=info")
        .with_timer(uptime())
        .init();

    let args = Args::parse();

    if let Some(status) = args.status.clone() {
        ensure_fifo(&status)?;
        thread::Builder::new()
            .name("status".into())
            .spawn(move || match File::open(&status) {
                Ok(fifo) => print_status(fifo),
                Err(e) => warn!("Could not open {}: {}", status.display(), e),
            })?;
    }

    ensure_fifo(&args.pipe)?;
    let mut pipe = OpenOptions::new()
        .write(true)
        .open(&args.pipe)
        .wrap_err_with(|| format!("opening {}", args.pipe.display()))?;

    for _ in 0..args.cycles {
        thread::sleep(args.start_after);
        send(&mut pipe, START_BYTE)?;
        thread::sleep(args.stop_after);
        send(&mut pipe, STOP_BYTE)?;
    }

    // Leave time for the final status frames.
    thread::sleep(Duration::from_secs(1));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_must_be_finite_and_non_negative() {
        assert_eq!(parse_seconds("0.25"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_seconds("0"), Ok(Duration::ZERO));
        for bad in ["-1", "NaN", "inf", "soon"] {
            assert!(parse_seconds(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn negative_delay_is_a_usage_error() {
        assert!(Args::try_parse_from(["commander", "--stop-after", "-2"]).is_err());
        let args = Args::try_parse_from(["commander"]).unwrap();
        assert_eq!(args.start_after, Duration::from_secs(1));
        assert_eq!(args.stop_after, Duration::from_secs(10));
    }
}
