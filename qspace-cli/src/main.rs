//! qspace command-line interface.
//!
//! Reads neutron event files or live UDP events, maps them to Q, and
//! reports peaks and integrations.
#![allow(clippy::cast_precision_loss, clippy::too_many_lines)]

use clap::{Parser, Subcommand};
use qspace_core::{Mat3, OrientationMatrix, Peak};
use qspace_histogram::{HistogramConfig, HistogramLayout, IntegrationConfig, PeakSearchConfig};
use qspace_io::{
    Command, EventFileReader, ReceiverConfig, RecordFormat, Reply, Session, UdpEventReceiver,
    WorkerPoolConfig,
};
use qspace_mapping::{Centering, InstrumentConfig};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    QspaceIo(#[from] qspace_io::Error),

    #[error("Instrument error: {0}")]
    Mapping(#[from] qspace_mapping::Error),

    #[error("Core error: {0}")]
    Core(#[from] qspace_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Command(#[from] qspace_io::CommandError),

    #[error("unexpected reply from {0}")]
    UnexpectedReply(&'static str),
}

/// Orientation matrix file: rows a*, b*, c* without the 2π factor.
#[derive(Deserialize)]
struct UbFile {
    ub: [[f64; 3]; 3],
}

fn load_ub(path: &Path) -> Result<Mat3> {
    let file: UbFile = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    Ok(*OrientationMatrix::from_isaw_rows(file.ub)?.ub())
}

/// Event-mode reciprocal-space reduction for neutron diffraction.
#[derive(Parser)]
#[command(name = "qspace")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show information about an event file
    Info {
        /// Input event file
        input: PathBuf,
    },

    /// Histogram an event file and find peaks
    Process {
        /// Input event file
        input: PathBuf,

        /// Instrument JSON
        #[arg(short, long)]
        instrument: PathBuf,

        /// First event to read
        #[arg(long, default_value = "0")]
        first: usize,

        /// Events to read (default: all)
        #[arg(long)]
        count: Option<usize>,

        /// Mapping worker threads
        #[arg(long, default_value = "4")]
        threads: usize,

        /// Bins per axis
        #[arg(long, default_value = "512")]
        bins: usize,

        /// Largest |Q| histogrammed (Å⁻¹)
        #[arg(long, default_value = "10.0")]
        max_q: f64,

        /// Smooth pages before searching
        #[arg(long)]
        smooth: bool,

        /// Peaks reported
        #[arg(long, default_value = "50")]
        max_peaks: usize,

        /// Smallest bin value considered a peak
        #[arg(long, default_value = "0.0")]
        min_intensity: f32,

        /// Integrate peaks with this sphere radius (Å⁻¹)
        #[arg(long)]
        radius: Option<f64>,

        /// Orientation matrix JSON, used to index peaks
        #[arg(long)]
        ub: Option<PathBuf>,
    },

    /// Histogram live events received over UDP
    Listen {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:8002")]
        bind: SocketAddr,

        /// Instrument JSON
        #[arg(short, long)]
        instrument: PathBuf,

        /// Seconds to listen
        #[arg(long, default_value = "60")]
        seconds: u64,

        /// Event record format: float, int or q
        #[arg(long, default_value = "float")]
        format: String,

        /// Bins per axis
        #[arg(long, default_value = "256")]
        bins: usize,

        /// Largest |Q| histogrammed (Å⁻¹)
        #[arg(long, default_value = "10.0")]
        max_q: f64,
    },

    /// List reflections the detectors can observe
    Predict {
        /// Instrument JSON
        #[arg(short, long)]
        instrument: PathBuf,

        /// Orientation matrix JSON
        #[arg(long)]
        ub: PathBuf,

        /// Largest |Q| (Å⁻¹)
        #[arg(long)]
        max_q: f64,

        /// Smallest |Q| (Å⁻¹)
        #[arg(long, default_value = "0.0")]
        min_q: f64,

        /// Lattice centering: P, A, B, C, I, F, R or RREV
        #[arg(long, default_value = "P")]
        centering: String,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn print_peaks(peaks: &[Peak]) {
    println!(
        "{:>4} | {:>9} {:>9} {:>9} | {:>12} | {:>12}",
        "#", "Qx", "Qy", "Qz", "Intensity", "hkl"
    );
    println!("{:-<68}", "");
    for (i, peak) in peaks.iter().enumerate() {
        let q = peak.position();
        let hkl = peak.hkl.map_or_else(|| "-".to_string(), |h| h.to_string());
        println!(
            "{:>4} | {:>9.4} {:>9.4} {:>9.4} | {:>12.1} | {:>12}",
            i + 1,
            q.x,
            q.y,
            q.z,
            peak.intensity,
            hkl
        );
    }
}

fn start_session(instrument: &Path, workers: usize, bins: usize, max_q: f64) -> Result<Session> {
    let histogram = HistogramConfig::default().with_bins_per_axis(bins);
    let layout = HistogramLayout::cartesian(max_q, &histogram);
    let mut session = Session::new(
        WorkerPoolConfig::default().with_workers(workers),
        histogram,
        IntegrationConfig::default(),
    )?;
    let config = InstrumentConfig::from_file(instrument)?;
    session.execute(Command::InitInstrument(Box::new(config)))?;
    let ready = session.execute(Command::InitHistogram(layout))?;
    println!("{}", ready.status);
    Ok(session)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Info { input } => {
            let reader = EventFileReader::open(&input)?;
            let file_size = reader.file_size();

            println!("File: {}", input.display());
            println!(
                "Size: {file_size} bytes ({:.2} MB)",
                file_size as f64 / 1_000_000.0
            );
            println!("Events: {}", reader.event_count());

            let ranges = reader.iter_events().fold(None, |acc, e| match acc {
                None => Some((e.tof, e.tof, e.pixel_id, e.pixel_id)),
                Some((t0, t1, p0, p1)) => Some((
                    e.tof.min(t0),
                    e.tof.max(t1),
                    e.pixel_id.min(p0),
                    e.pixel_id.max(p1),
                )),
            });
            if let Some((min_tof, max_tof, min_pixel, max_pixel)) = ranges {
                println!("TOF range: {min_tof} - {max_tof}");
                println!("Pixel id range: {min_pixel} - {max_pixel}");
            }
        }

        Commands::Process {
            input,
            instrument,
            first,
            count,
            threads,
            bins,
            max_q,
            smooth,
            max_peaks,
            min_intensity,
            radius,
            ub,
        } => {
            let start = Instant::now();
            let mut session = start_session(&instrument, threads, bins, max_q)?;

            let loaded = session.execute(Command::LoadEvents {
                path: input,
                first,
                count: count.unwrap_or(usize::MAX),
                threads: None,
            })?;
            println!("{}", loaded.status);
            let mapped = session.execute(Command::MapAndAddEvents(None))?;
            println!("{}", mapped.status);

            let config = PeakSearchConfig::default()
                .with_smooth(smooth)
                .with_max_peaks(max_peaks)
                .with_min_intensity(min_intensity);
            let found = session.execute(Command::FindPeaks(config))?;
            println!("{}", found.status);

            if let Some(path) = ub {
                session.execute(Command::SetOrientationMatrix(load_ub(&path)?))?;
                let indexed = session.execute(Command::IndexPeaks { tolerance: 0.15 })?;
                println!("{}", indexed.status);
            }
            print_peaks(session.peaks());

            if let Some(radius) = radius {
                let integrated = session.execute(Command::SphereIntegrate {
                    peaks: None,
                    radius,
                })?;
                println!("{}", integrated.status);
            }

            println!("Processed in {:.2}s", start.elapsed().as_secs_f64());
        }

        Commands::Listen {
            bind,
            instrument,
            seconds,
            format,
            bins,
            max_q,
        } => {
            let mut session =
                start_session(&instrument, WorkerPoolConfig::default().workers, bins, max_q)?;
            let config = ReceiverConfig::default()
                .with_bind_addr(bind)
                .with_format(format.parse::<RecordFormat>()?)
                .with_broadcast_scale_factor(true);
            let (tx, rx) = mpsc::channel();
            let receiver = UdpEventReceiver::start(&config, tx)?;
            println!("Listening on {} for {seconds}s", receiver.local_addr());

            let deadline = Instant::now() + Duration::from_secs(seconds);
            while let Some(left) = deadline.checked_duration_since(Instant::now()) {
                match rx.recv_timeout(left) {
                    Ok(message) => {
                        if let Err(e) = session.ingest(message) {
                            log::warn!("{e}");
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        log::error!("Event receiver stopped");
                        break;
                    }
                }
            }

            let stats = receiver.stats();
            receiver.stop();
            println!(
                "Packets: {} ({} malformed, {} dropped while paused)",
                stats.packets, stats.malformed, stats.dropped_while_paused
            );
            println!("Events: {}", stats.events);
            println!("Protons on target: {:.4e}", session.protons_on_target());
            let max = session.execute(Command::GetHistogramMax)?;
            println!("Histogram {}", max.status);
            let found = session.execute(Command::FindPeaks(PeakSearchConfig::default()))?;
            println!("{}", found.status);
            print_peaks(session.peaks());
        }

        Commands::Predict {
            instrument,
            ub,
            max_q,
            min_q,
            centering,
        } => {
            let mut session = Session::with_defaults()?;
            let config = InstrumentConfig::from_file(&instrument)?;
            session.execute(Command::InitInstrument(Box::new(config)))?;
            session.execute(Command::SetOrientationMatrix(load_ub(&ub)?))?;
            let outcome = session.execute(Command::PredictPeaks {
                min_q,
                max_q,
                centering: centering.parse::<Centering>()?,
            })?;
            let Reply::Predicted(peaks) = outcome.reply else {
                return Err(CliError::UnexpectedReply("PredictPeaks"));
            };
            println!("{}", outcome.status);
            print_peaks(&peaks);
        }
    }

    Ok(())
}
