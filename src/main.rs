//! sqlreplay CLI entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sqlreplay::config::{Config, StorageMode};
use sqlreplay::dissect::SessionRegistry;
use sqlreplay::io::{JsonPacketSource, PacketSource};
use sqlreplay::queue::event_queue;
use sqlreplay::replay::{DbExecutorFactory, Scheduler};
use sqlreplay::sink::{
    remove_previous, run_persist, EventSink, EventSource, JsonEventReader, RotatingJsonSink,
    TableEventReader, TableSink,
};

#[derive(Parser)]
#[command(name = "sqlreplay", version, about = "SQL wire-traffic dissection and replay")]
struct Args {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dissect a captured packet file into a persisted SQL event stream
    Transcribe {
        /// Configuration file (TOML)
        config: PathBuf,
    },
    /// Replay a persisted SQL event stream against the target database
    Replay {
        /// Configuration file (TOML)
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    match args.command {
        Command::Transcribe { config } => transcribe(&config),
        Command::Replay { config } => replay(&config),
    }
}

fn open_sink(config: &Config) -> Result<Box<dyn EventSink>> {
    Ok(match config.storage_mode()? {
        StorageMode::Json => {
            let prefix = PathBuf::from(&config.storage.path);
            if config.storage.drop_previous {
                remove_previous(&prefix)?;
            }
            Box::new(RotatingJsonSink::new(prefix, config.storage.rotate_bytes))
        }
        StorageMode::Db => Box::new(TableSink::open(
            config.storage.path.as_ref(),
            config.storage.batch_size,
            config.storage.drop_previous,
        )?),
    })
}

fn transcribe(config_path: &PathBuf) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    config.validate_transcribe()?;

    let vendor = config.capture_vendor()?;
    let capture = config.capture.as_ref().context("capture section required")?;
    let mut source = JsonPacketSource::open(&capture.packet_file)
        .with_context(|| format!("failed to open packet file {}", capture.packet_file))?;

    let registry = SessionRegistry::new(vendor, capture.collect_results);
    let (producer, consumer) = event_queue(capture.queue_capacity);

    let mut sink = open_sink(&config)?;
    let persister = thread::spawn(move || run_persist(consumer, sink.as_mut()));

    let mut packets = 0u64;
    let mut last_timestamp_us = 0i64;
    while let Some(packet) = source.next_packet()? {
        packets += 1;
        last_timestamp_us = packet.timestamp_us;
        for event in registry.feed(&packet) {
            producer.push(event)?;
        }
    }
    for event in registry.close_all(last_timestamp_us) {
        producer.push(event)?;
    }
    drop(producer);

    let written = persister
        .join()
        .map_err(|_| anyhow::anyhow!("persistence thread panicked"))??;
    info!(packets, events = written, "transcription finished");
    println!("{packets} packets dissected, {written} events persisted");
    Ok(())
}

fn replay(config_path: &PathBuf) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    config.validate_replay()?;

    let source: Box<dyn EventSource> = match config.storage_mode()? {
        StorageMode::Json => Box::new(JsonEventReader::new(&config.storage.path)),
        StorageMode::Db => Box::new(TableEventReader::new(&config.storage.path)),
    };
    let job = config.replay_job()?;
    let mut scheduler = Scheduler::new(job, Arc::new(DbExecutorFactory));

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let report = runtime.block_on(scheduler.run(source))?;

    if let Some(mut analyzer) = scheduler.take_analyzer() {
        if let Some(path) = &config.replay.slow_csv {
            analyzer.write_slow_csv(path.as_ref())?;
            info!(path = %path, "slow statement summary written");
        }
        if let Some(path) = &config.replay.mismatch_report {
            analyzer.write_mismatch_report(path.as_ref())?;
            info!(path = %path, "mismatch report written");
        }
    }

    println!(
        "dispatched {} | skipped {} (filtered {}, unmapped {}, safety {}) | failed {} | slow {} | mismatched {} | {:.3}s",
        report.dispatched,
        report.skipped_filtered + report.skipped_unmapped + report.skipped_safety,
        report.skipped_filtered,
        report.skipped_unmapped,
        report.skipped_safety,
        report.failed,
        report.slow,
        report.mismatched,
        report.elapsed_us as f64 / 1_000_000.0
    );
    Ok(())
}
