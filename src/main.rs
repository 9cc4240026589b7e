//! Aperture onboard acquisition process

use std::path::PathBuf;
use std::sync::Arc;

use aperture::capture::SimulatedCamera;
use aperture::link::{CommandReader, ControlEvent, PipeTransport, Transport, UsbIssTransport};
use aperture::pipeline::RingIndex;
use aperture::{utils, Config, Controller, LinkKind};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::WrapErr, Result};
use tracing::info;
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "aperture", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Wait for supervisor commands and acquire on demand
    Run {
        /// Root directory for session folders
        #[arg(short = 'd', long)]
        output_dir: Option<PathBuf>,

        #[arg(long, value_enum)]
        link: Option<LinkKind>,

        #[arg(long)]
        ring_slots: Option<usize>,
    },
    /// Validate the configuration and try allocating the frame ring
    Check,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aperture=info"));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_timer(uptime())
            .with_thread_names(true),
    );
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).wrap_err("loading configuration")?;

    match cli.command {
        Cmd::Run {
            output_dir,
            link,
            ring_slots,
        } => {
            if let Some(dir) = output_dir {
                config.storage.output_dir = dir;
            }
            if let Some(kind) = link {
                config.link.kind = kind;
            }
            if let Some(slots) = ring_slots {
                config.pipeline.ring_slots = slots;
            }
            run(config).await
        }
        Cmd::Check => check(&config),
    }
}

async fn run(config: Config) -> Result<()> {
    info!("Aperture launching");

    let transport: Arc<dyn Transport> = match config.link.kind {
        LinkKind::Pipe => Arc::new(
            PipeTransport::open(&config.link.command_path, config.link.status_path.clone())
                .wrap_err("opening command pipe")?,
        ),
        LinkKind::UsbIss => Arc::new(
            UsbIssTransport::open(&config.link.device, &config.link)
                .wrap_err("opening USB-ISS bridge")?,
        ),
    };
    let camera = Arc::new(SimulatedCamera::free_running());

    let (tx, rx) = flume::unbounded();
    let reader = CommandReader::spawn(
        transport.clone(),
        config.link.poll_interval(),
        config.link.retry_backoff(),
        tx.clone(),
    )?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            let _ = tx.send(ControlEvent::Shutdown);
        }
    });

    let mut controller = Controller::new(config, camera, transport);
    let sessions = tokio::task::spawn_blocking(move || {
        controller.run(&rx);
        controller.sessions_started()
    })
    .await?;

    reader.shutdown();
    info!("Aperture stopped after {} sessions", sessions);
    Ok(())
}

fn check(config: &Config) -> Result<()> {
    let aoi = config.capture.aoi;
    let pipeline = &config.pipeline;

    println!("page size:       {} bytes", page_size::get());
    match utils::memlock_limit()? {
        Some(limit) => println!("memlock limit:   {} bytes", limit),
        None => println!("memlock limit:   unlimited"),
    }

    let ring = RingIndex::create(aoi.width, aoi.height, pipeline.ring_slots, pipeline.lock_memory)
        .wrap_err("allocating the frame ring")?;
    println!(
        "frame ring:      {} slots of {}x{}, {} bytes reserved{}",
        ring.len(),
        ring.width(),
        ring.height(),
        ring.reserved_bytes(),
        if pipeline.lock_memory { ", locked" } else { "" }
    );
    println!("output:          {}", config.storage.output_dir.display());
    Ok(())
}
