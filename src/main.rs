use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use frametrace::replay::{replay_file, write_summary, CsvReport};
use frametrace::{Config, PresentConsumer, RING_CAPACITY_DEFAULT};

#[derive(Debug, Parser)]
#[command(name = "frametrace", about = "Reconstruct per-present timing from a graphics trace")]
struct Command {
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Replay an event stream and write one CSV row per completed present
    #[clap(name = "csv")]
    Csv(ReportOpts),
    /// Replay an event stream and print per-process aggregates
    #[clap(name = "summary")]
    Summary(ReportOpts),
}

#[derive(Debug, Args)]
struct ReportOpts {
    /// Verbosity (0 = warn, 1 = info, 2 = debug, 3+ = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Event stream to replay, one JSON event per line
    #[arg(short, long)]
    input: PathBuf,
    /// Output file; stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Only track presents through the runtime and the submit queue
    #[arg(long)]
    no_track_display: bool,
    /// Report only these process ids
    #[arg(short, long)]
    process: Vec<u32>,
    /// Capacity of the in-flight present ring
    #[arg(long, default_value_t = RING_CAPACITY_DEFAULT)]
    ring_capacity: usize,
    /// QPC ticks per second, for the seconds/milliseconds columns
    #[arg(long, default_value_t = 10_000_000)]
    qpc_frequency: u64,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
}

fn build_consumer(opts: &ReportOpts) -> PresentConsumer {
    let consumer = PresentConsumer::new(Config {
        track_display: !opts.no_track_display,
        filter_processes: !opts.process.is_empty(),
        ring_capacity: opts.ring_capacity,
    });
    for &pid in &opts.process {
        consumer.output().add_tracked_process(pid);
    }
    consumer
}

fn open_output(path: &Option<PathBuf>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("creating {}", path.display()))?;
            Box::new(BufWriter::new(file))
        }
        None => Box::new(io::stdout().lock()),
    })
}

fn csv(opts: ReportOpts) -> Result<()> {
    let mut consumer = build_consumer(&opts);
    let result = replay_file(&opts.input, &mut consumer)?;
    tracing::info!(
        events = result.events_read,
        skipped = result.lines_skipped,
        completed = result.completed.len(),
        lost = result.lost.len(),
        "replay finished"
    );

    let report = CsvReport {
        track_display: !opts.no_track_display,
        qpc_frequency: opts.qpc_frequency,
    };
    let mut out = open_output(&opts.output)?;
    report.write(&mut out, &result)?;
    out.flush()?;
    Ok(())
}

fn summary(opts: ReportOpts) -> Result<()> {
    let mut consumer = build_consumer(&opts);
    let result = replay_file(&opts.input, &mut consumer)?;
    let counters = consumer.output().counters.snapshot();

    let mut out = open_output(&opts.output)?;
    write_summary(&mut out, &result, counters, opts.qpc_frequency)?;
    out.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let opts = Command::parse();
    match opts.subcmd {
        SubCommand::Csv(opts) => {
            init_tracing(opts.verbose);
            csv(opts)
        }
        SubCommand::Summary(opts) => {
            init_tracing(opts.verbose);
            summary(opts)
        }
    }
}
