//! Replay front end: reads a recorded typed-event stream (one JSON event per
//! line), drives the engine, and renders per-present CSV or per-process
//! summary reports from the drained queues.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::consumer::{CounterSnapshot, PresentConsumer};
use crate::events::Event;
use crate::present::{PresentRecord, PresentResult, ProcessEvent};

/// How often to drain the output queues while replaying, in events.
const DRAIN_INTERVAL: u64 = 4096;

#[derive(Default)]
pub struct ReplayResult {
    /// Completed presents in emission order (per process: start-time order).
    pub completed: Vec<PresentRecord>,
    /// Lost presents in the order they were lost.
    pub lost: Vec<PresentRecord>,
    pub process_events: Vec<ProcessEvent>,
    pub events_read: u64,
    pub lines_skipped: u64,
}

impl ReplayResult {
    fn drain_from(&mut self, consumer: &PresentConsumer) {
        let output = consumer.output();
        self.completed.extend(output.dequeue_completed());
        self.lost.extend(output.dequeue_lost());
        self.process_events.extend(output.dequeue_process_events());
    }
}

/// Feed every event line from `path` through the consumer, finalize it, and
/// collect everything the engine produced. Lines that do not parse as a
/// recognized event are skipped.
pub fn replay_file(path: &Path, consumer: &mut PresentConsumer) -> Result<ReplayResult> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    replay_reader(BufReader::new(file), consumer)
}

pub fn replay_reader<R: BufRead>(reader: R, consumer: &mut PresentConsumer) -> Result<ReplayResult> {
    let mut result = ReplayResult::default();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.context("reading event line")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => {
                consumer.handle_event(&event);
                result.events_read += 1;
                if result.events_read % DRAIN_INTERVAL == 0 {
                    result.drain_from(consumer);
                }
            }
            Err(err) => {
                result.lines_skipped += 1;
                tracing::debug!(line = lineno + 1, %err, "skipping unrecognized event line");
            }
        }
    }
    consumer.finalize();
    result.drain_from(consumer);
    Ok(result)
}

/// Per-present CSV report. Column layout follows the classic present
/// tracker: the base columns always, the display columns when display
/// tracking was on.
pub struct CsvReport {
    pub track_display: bool,
    /// QPC ticks per second, for the seconds/milliseconds columns.
    pub qpc_frequency: u64,
}

impl CsvReport {
    pub fn write<W: Write>(&self, out: &mut W, result: &ReplayResult) -> Result<()> {
        let names = process_names(&result.process_events);
        let start_qpc = result.completed.iter().map(|r| r.qpc_start).min().unwrap_or(0);

        write!(
            out,
            "Application,ProcessID,SwapChainAddress,Runtime,SyncInterval,PresentFlags,\
             Dropped,TimeInSeconds,msBetweenPresents,msInPresentAPI"
        )?;
        if self.track_display {
            write!(
                out,
                ",AllowsTearing,PresentMode,msBetweenDisplayChange,msUntilRenderComplete,msUntilDisplayed"
            )?;
        }
        writeln!(out)?;

        let mut last_start: HashMap<(u32, u64), u64> = HashMap::new();
        let mut last_displayed: HashMap<(u32, u64), u64> = HashMap::new();
        for rec in &result.completed {
            let chain = (rec.pid, rec.swapchain);
            let application = names.get(&rec.pid).map(String::as_str).unwrap_or("<unknown>");
            let dropped = if rec.final_state == PresentResult::Presented { 0 } else { 1 };
            let time_in_seconds =
                (rec.qpc_start - start_qpc) as f64 / self.qpc_frequency as f64;
            let between_presents = last_start
                .insert(chain, rec.qpc_start)
                .map(|prev| self.to_ms(rec.qpc_start.saturating_sub(prev)))
                .unwrap_or(0.0);
            write!(
                out,
                "{},{},0x{:016X},{},{},{},{},{:.6},{:.4},{:.4}",
                application,
                rec.pid,
                rec.swapchain,
                rec.runtime,
                rec.sync_interval,
                rec.present_flags,
                dropped,
                time_in_seconds,
                between_presents,
                self.to_ms(rec.time_taken),
            )?;
            if self.track_display {
                let displayed = rec.final_state == PresentResult::Presented && rec.screen_time != 0;
                let between_display = if displayed {
                    last_displayed
                        .insert(chain, rec.screen_time)
                        .map(|prev| self.to_ms(rec.screen_time.saturating_sub(prev)))
                        .unwrap_or(0.0)
                } else {
                    0.0
                };
                let until_ready = self.to_ms(rec.ready_time.saturating_sub(rec.qpc_start));
                let until_displayed = if displayed {
                    self.to_ms(rec.screen_time.saturating_sub(rec.qpc_start))
                } else {
                    0.0
                };
                write!(
                    out,
                    ",{},{},{:.4},{:.4},{:.4}",
                    rec.supports_tearing as u8,
                    rec.present_mode,
                    between_display,
                    until_ready,
                    until_displayed,
                )?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    fn to_ms(&self, qpc: u64) -> f64 {
        qpc as f64 * 1000.0 / self.qpc_frequency as f64
    }
}

fn process_names(events: &[ProcessEvent]) -> HashMap<u32, String> {
    let mut names = HashMap::new();
    for event in events {
        if event.is_start {
            names.insert(event.pid, event.image_name.clone());
        }
    }
    names
}

#[derive(Default)]
struct ProcessSummary {
    presents: u64,
    displayed: u64,
    discarded: u64,
    errors: u64,
    in_api_qpc: u64,
}

/// Per-process aggregates plus the engine's error counters.
pub fn write_summary<W: Write>(
    out: &mut W,
    result: &ReplayResult,
    counters: CounterSnapshot,
    qpc_frequency: u64,
) -> Result<()> {
    let names = process_names(&result.process_events);
    let mut per_process: BTreeMap<u32, ProcessSummary> = BTreeMap::new();
    for rec in &result.completed {
        let entry = per_process.entry(rec.pid).or_default();
        entry.presents += 1;
        match rec.final_state {
            PresentResult::Presented => entry.displayed += 1,
            PresentResult::Error => entry.errors += 1,
            _ => entry.discarded += 1,
        }
        entry.in_api_qpc += rec.time_taken;
    }
    let mut lost_per_process: BTreeMap<u32, u64> = BTreeMap::new();
    for rec in &result.lost {
        *lost_per_process.entry(rec.pid).or_default() += 1;
    }

    writeln!(out, "{} events, {} lines skipped", result.events_read, result.lines_skipped)?;
    writeln!(out)?;
    writeln!(
        out,
        "{:<24} {:>8} {:>10} {:>10} {:>8} {:>8} {:>14}",
        "Application", "PID", "Presents", "Displayed", "Dropped", "Lost", "AvgMsInAPI"
    )?;
    for (pid, summary) in &per_process {
        let name = names.get(pid).map(String::as_str).unwrap_or("<unknown>");
        let avg_ms = if summary.presents > 0 {
            summary.in_api_qpc as f64 * 1000.0 / (qpc_frequency as f64 * summary.presents as f64)
        } else {
            0.0
        };
        writeln!(
            out,
            "{:<24} {:>8} {:>10} {:>10} {:>8} {:>8} {:>14.4}",
            name,
            pid,
            summary.presents,
            summary.displayed,
            summary.discarded + summary.errors,
            lost_per_process.get(pid).copied().unwrap_or(0),
            avg_ms,
        )?;
    }
    writeln!(out)?;
    writeln!(
        out,
        "orphan events: {}, lost to eviction: {}, lost to replacement: {}, \
         classification errors: {}, invariant breaches: {}",
        counters.orphan_events,
        counters.lost_by_eviction,
        counters.lost_by_replacement,
        counters.classification_errors,
        counters.invariant_breaches,
    )?;
    Ok(())
}
