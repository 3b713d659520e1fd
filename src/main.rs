//! Entry point: loads configuration, wires the camera, processing, and
//! durable-writer workers, and runs until a stop signal is observed.
//! Shutdown is cooperative: a `ctrlc` handler flips a shared `AtomicBool`
//! that every worker thread polls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use anpr_core::camera::{CameraStream, NullEventSink};
use anpr_core::config::{self, AppConfig};
use anpr_core::detector::{FilteringDetector, NullDetector};
use anpr_core::frame_bus::frame_bus;
use anpr_core::ocr::NullOracle;
use anpr_core::processor::Processor;
use anpr_core::stats::StatsRegistry;
use anpr_core::writer::{CameraRecord, DurableWriter};

#[derive(Parser, Debug)]
#[command(name = "anpr-core", about = "Multi-camera ANPR processing core")]
struct Cli {
    /// Path to the system YAML configuration. Written with demo defaults
    /// on first run if missing.
    #[arg(short, long, default_value = "config/config.yaml", global = true)]
    config: std::path::PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Read-only query subcommands share the same database handle the pipeline
/// writes through; they never start the camera/processor/writer workers.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start the camera, processor, and durable-writer workers (default).
    Run,
    /// Print aggregate event counters from the database.
    Stats,
    /// Print the most recent events, newest first.
    Recent {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        camera_id: Option<i64>,
    },
    /// Look up events and plate history for a given plate text.
    SearchPlate {
        plate: String,
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Print the camera registry and status.
    Cameras,
}

fn init_logging(cfg: &AppConfig) {
    let filter = EnvFilter::try_new(&cfg.system.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if let Some(log_file) = &cfg.system.log_file {
        if let Ok(file) = std::fs::File::create(log_file) {
            subscriber.with_writer(std::sync::Mutex::new(file)).init();
            return;
        }
    }
    subscriber.init();
}

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Join a worker thread, waiting no longer than `SHUTDOWN_JOIN_TIMEOUT`.
/// Every worker in this process polls the stop flag from within its own
/// blocking waits, so a well-behaved worker joins promptly; a thread that
/// overruns the bound is logged and left to finish in the background
/// rather than holding up process exit.
fn join_with_timeout(name: &str, handle: std::thread::JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel();
    let watched = std::thread::spawn(move || {
        let result = handle.join();
        let _ = tx.send(result.is_err());
    });
    match rx.recv_timeout(SHUTDOWN_JOIN_TIMEOUT) {
        Ok(panicked) => {
            if panicked {
                error!("{name} worker panicked during shutdown");
            }
            let _ = watched.join();
        }
        Err(_) => {
            error!("{name} worker did not join within {SHUTDOWN_JOIN_TIMEOUT:?}; continuing shutdown");
        }
    }
}

/// Query subcommands: open the database read-only (no writer worker, no
/// camera/processor threads) and print results, then exit.
fn run_query(cfg: &AppConfig, command: Command) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(true));
    let (writer, _handle) = DurableWriter::open(&cfg.database, stop).context("opening database")?;

    match command {
        Command::Run => unreachable!("handled by the caller"),
        Command::Stats => {
            let (total, entries, exits) = writer.db_counts()?;
            println!("total events: {total}");
            println!("entries: {entries}");
            println!("exits: {exits}");
        }
        Command::Recent { limit, camera_id } => {
            for row in writer.recent_events(limit, camera_id)? {
                println!(
                    "[{}] camera={} track={} {} plate={:?}",
                    row.timestamp, row.camera_id, row.track_id, row.event_type, row.plate_text
                );
            }
        }
        Command::SearchPlate { plate, limit } => {
            for row in writer.events_by_plate(&plate, limit)? {
                println!("[{}] camera={} track={} {}", row.timestamp, row.camera_id, row.track_id, row.event_type);
            }
            for row in writer.plates_by_text(&plate, limit)? {
                println!(
                    "plate record: camera={} track={} confidence={:.2} readings={} locked={}",
                    row.camera_id, row.track_id, row.confidence, row.num_readings, row.locked
                );
            }
        }
        Command::Cameras => {
            for row in writer.camera_statuses()? {
                println!("[{}] {} ({}) — {}", row.id, row.name, row.source, row.status);
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configuration errors are fatal at startup only, per the error
    // handling design — everything below this point treats I/O and
    // detector/OCR failures as transient.
    let cfg = config::load(&cli.config).context("loading configuration")?;

    if let Some(command) = cli.command {
        if !matches!(command, Command::Run) {
            return run_query(&cfg, command);
        }
    }

    init_logging(&cfg);

    info!("============================================================");
    info!("ANPR core starting");
    info!("mode: {:?}", cfg.system.mode);
    info!("cameras: {}", cfg.cameras.len());
    info!("detection model: {} on {}", cfg.detection.model, cfg.detection.device);
    info!("ocr enabled: {}", cfg.ocr.enabled);
    info!("database: {}", cfg.database.r#type);
    info!("============================================================");

    let stop = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(StatsRegistry::default());

    let stop_for_signal = stop.clone();
    ctrlc::set_handler(move || {
        info!("shutdown requested");
        stop_for_signal.store(true, Ordering::Relaxed);
    })
    .context("installing signal handler")?;

    let (frame_tx, frame_rx, frame_bus_stats) = frame_bus(cfg.system.frame_queue_size);

    let (writer, writer_handle) =
        DurableWriter::open(&cfg.database, stop.clone()).context("opening durable writer")?;
    for camera in &cfg.cameras {
        writer_handle.upsert_camera(CameraRecord {
            id: camera.id,
            name: camera.name.clone(),
            source: camera.source.clone(),
            location: None,
            status: if camera.enabled { "active".into() } else { "disabled".into() },
        });
    }
    let writer_thread = std::thread::spawn(move || writer.run());

    let event_sink = Arc::new(NullEventSink);
    let mut camera_threads = Vec::new();
    for camera in cfg.cameras.iter().filter(|c| c.enabled) {
        let stream = CameraStream::new(camera.clone(), frame_tx.clone(), event_sink.clone(), stop.clone());
        camera_threads.push(std::thread::spawn(move || stream.run()));
    }

    let detector = FilteringDetector::new(NullDetector, cfg.detection.clone());
    let ocr_oracle = Arc::new(NullOracle);
    let processor = Processor::new(
        &cfg,
        detector,
        frame_rx,
        writer_handle.clone(),
        stats.clone(),
        stop.clone(),
        ocr_oracle,
    );
    let processor_thread = std::thread::spawn(move || processor.run());

    stats.mark_ready();
    info!("pipeline running; press Ctrl+C to stop");

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_secs(10));
        let writer_stats = writer_handle.stats();

        // These counters live on the frame bus and writer's own stats
        // objects (each is the sole writer of its own atomics); mirror them
        // into the shared registry so `StatsRegistry::snapshot` is a single,
        // complete read surface instead of two sources the caller has to
        // know to combine.
        stats.frames_delivered.store(frame_bus_stats.delivered.load(Ordering::Relaxed), Ordering::Relaxed);
        stats.frames_dropped.store(frame_bus_stats.dropped.load(Ordering::Relaxed), Ordering::Relaxed);
        stats.writer_enqueued.store(writer_stats.enqueued, Ordering::Relaxed);
        stats.writer_dropped.store(writer_stats.dropped, Ordering::Relaxed);
        stats.writer_committed.store(writer_stats.committed, Ordering::Relaxed);
        stats.writer_failed.store(writer_stats.failed_batches, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        info!(
            "status: frames delivered={} dropped={} | writer enqueued={} dropped={} committed={} | entries={} exits={}",
            snapshot.frames_delivered,
            snapshot.frames_dropped,
            snapshot.writer_enqueued,
            snapshot.writer_dropped,
            snapshot.writer_committed,
            snapshot.total_entries,
            snapshot.total_exits,
        );
    }

    info!("stopping pipeline");

    for (i, handle) in camera_threads.into_iter().enumerate() {
        join_with_timeout(&format!("camera[{i}]"), handle);
    }
    join_with_timeout("processor", processor_thread);
    join_with_timeout("writer", writer_thread);

    info!("ANPR core stopped");
    Ok(())
}
