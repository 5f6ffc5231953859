//! Command-line front end for the imaging pipeline.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use rust_oct::acquisition::{
    CaptureHeader, CaptureReader, DataSource, PlaybackManager, RecordingSource, SimulatedDaq,
};
use rust_oct::config::Settings;
use rust_oct::consumers::{spawn_consumer, CaptureRecorder, FrameRateMonitor};
use rust_oct::device::StaticDevice;
use rust_oct::error_recovery::{RetryPolicy, Supervisor};
use rust_oct::events::{EventBus, EventStreams, DEFAULT_EVENT_CAPACITY};
use rust_oct::logging;
use rust_oct::pipeline::{Pipeline, PipelineContext, PipelineStatus};
use rust_oct::reconstruction::{create_backend, describe_devices, DeviceChoice};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const SUPERVISE_INTERVAL: Duration = Duration::from_millis(20);
const CONSUMER_POLL: Duration = Duration::from_millis(2);

#[derive(Parser, Debug)]
#[command(name = "rust_oct", version, about = "Rotational OCT acquisition and reconstruction")]
struct Cli {
    /// TOML settings file (defaults plus RUSTOCT_* environment otherwise)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline on the simulated board or a recorded capture
    Run {
        /// Replay this capture instead of acquiring
        #[arg(long)]
        playback: Option<PathBuf>,
        /// Stop after this many reconstructed frames
        #[arg(long)]
        frames: Option<u64>,
        /// Write reconstructed frames into this directory
        #[arg(long)]
        record: Option<PathBuf>,
        /// Also save the raw buffers to this capture file
        #[arg(long)]
        capture: Option<PathBuf>,
        /// Seed for the simulated board
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
    /// List compute adapters and the one that would be used
    Devices,
    /// Print the effective settings (file, environment and defaults) as TOML
    Config,
    /// Print a capture file's header and buffer count
    Inspect {
        capture: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    logging::init(&settings.logging).context("Failed to initialize logging")?;

    match cli.command {
        Command::Run {
            playback,
            frames,
            record,
            capture,
            seed,
        } => {
            let mut source: Box<dyn DataSource> = match &playback {
                Some(path) => {
                    let manager = PlaybackManager::open(path, &settings.playback)
                        .with_context(|| format!("Failed to open capture {}", path.display()))?;
                    apply_capture_shape(&mut settings, manager.header());
                    Box::new(manager)
                }
                None => Box::new(SimulatedDaq::new(seed)),
            };
            if let Some(path) = &capture {
                source = Box::new(RecordingSource::new(source, path));
            }
            run(settings, source, frames, record.as_deref())
        }
        Command::Devices => devices(&settings),
        Command::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
        Command::Inspect { capture, json } => inspect(&capture, json),
    }
}

/// A capture fixes the buffer shape; everything else still comes from settings.
fn apply_capture_shape(settings: &mut Settings, header: CaptureHeader) {
    let acq = &mut settings.acquisition;
    acq.record_length = header.record_len as usize;
    acq.encoder_record_length = header.encoder_len as usize;
    acq.lines_per_buffer = header.lines_per_buffer as usize;
}

fn run(
    settings: Settings,
    source: Box<dyn DataSource>,
    target_frames: Option<u64>,
    record: Option<&Path>,
) -> Result<()> {
    let (events, mut streams) = EventBus::new(DEFAULT_EVENT_CAPACITY);
    let device = StaticDevice(settings.device.clone());
    let ctx = PipelineContext::new(settings.clone(), &device, source.policy(), events)
        .context("Pipeline configuration rejected")?;
    let backend = create_backend(&settings.reconstruction, ctx.frame_shape())
        .context("No usable compute backend")?;
    let frame_pool = std::sync::Arc::clone(ctx.frame_pool());

    let mut pipeline = Pipeline::start(ctx, source, backend).context("Failed to start pipeline")?;
    let mut consumers = vec![spawn_consumer(
        FrameRateMonitor::new(Duration::from_secs(1)),
        std::sync::Arc::clone(&frame_pool),
        CONSUMER_POLL,
    )?];
    if let Some(dir) = record {
        let recorder = CaptureRecorder::create(dir)
            .with_context(|| format!("Failed to create recorder in {}", dir.display()))?;
        consumers.push(spawn_consumer(recorder, frame_pool, CONSUMER_POLL)?);
    }

    let mut supervisor = Supervisor::new(RetryPolicy::default(), settings.acquisition.max_resets);
    let started = Instant::now();
    let mut source_finished = false;
    let result = loop {
        log_events(&mut streams);

        match pipeline.supervise(&mut supervisor) {
            Ok(PipelineStatus::Running) => {}
            Ok(PipelineStatus::Recovered { resets }) => {
                warn!(resets, "Acquisition reset completed");
            }
            Ok(PipelineStatus::Finished) => {
                info!("Source finished, draining raw buffers");
                source_finished = true;
            }
            Ok(PipelineStatus::Stopped) => break Ok(()),
            Err(err) => break Err(err).context("Pipeline failed"),
        }

        if target_frames.is_some_and(|n| pipeline.frames_completed() >= n) {
            break Ok(());
        }
        if source_finished && pipeline.context().raw_pool().is_empty() {
            // Give the last buffer time to leave the reconstruction thread.
            thread::sleep(settings.acquisition.wait_timeout);
            break Ok(());
        }
        thread::sleep(SUPERVISE_INTERVAL);
    };

    let completed = pipeline.frames_completed();
    let dropped = pipeline.frames_dropped();
    let telemetry = pipeline.telemetry().snapshot();
    pipeline.shutdown().context("Pipeline shutdown failed")?;
    for consumer in consumers {
        let report = consumer.join()?;
        info!(
            consumer = %report.name,
            frames = report.frames,
            missed = report.missed,
            fps = report.mean_fps(),
            "Consumer report"
        );
    }
    log_events(&mut streams);

    println!(
        "{completed} frames reconstructed, {dropped} dropped, {} revolutions in {:.1}s",
        telemetry.revolutions,
        started.elapsed().as_secs_f64()
    );
    result
}

fn log_events(streams: &mut EventStreams) {
    for fault in EventStreams::drain(&mut streams.faults) {
        warn!(stage = fault.stage, severity = ?fault.severity, "{}", fault.message);
    }
    for event in EventStreams::drain(&mut streams.control) {
        info!(?event, "Control event");
    }
    for direction in EventStreams::drain(&mut streams.direction) {
        info!(?direction, "Rotation direction changed");
    }
    // Frame and rotation notifications are for renderers; discard them here.
    EventStreams::drain(&mut streams.frame_ready);
    EventStreams::drain(&mut streams.raw_available);
    EventStreams::drain(&mut streams.rotation);
}

fn devices(settings: &Settings) -> Result<()> {
    let (candidates, choice) = describe_devices(&settings.reconstruction);
    if candidates.is_empty() {
        println!("No compute adapters found");
    }
    for (index, candidate) in candidates.iter().enumerate() {
        println!(
            "[{index}] {} ({:?}, {})",
            candidate.name, candidate.class, candidate.backend
        );
    }
    match choice {
        Ok(DeviceChoice::Adapter(index)) => println!("Selected: adapter {index}"),
        Ok(DeviceChoice::BuiltinCpu) => println!("Selected: built-in CPU kernels"),
        Err(err) => bail!("{err}"),
    }
    Ok(())
}

#[derive(Serialize)]
struct InspectReport<'a> {
    path: &'a Path,
    header: CaptureHeader,
    buffers: usize,
    buffer_bytes: usize,
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let reader = CaptureReader::open(path)
        .with_context(|| format!("Failed to open capture {}", path.display()))?;
    let header = reader.header();
    let report = InspectReport {
        path,
        header,
        buffers: reader.len(),
        buffer_bytes: header.buffer_bytes(),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", path.display());
        println!("  record length:    {}", header.record_len);
        println!("  encoder length:   {}", header.encoder_len);
        println!("  lines per buffer: {}", header.lines_per_buffer);
        println!("  buffers:          {}", report.buffers);
    }
    Ok(())
}
