use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::ProgressBar;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::fetch::{run_fetcher, ResourceSource};
use crate::model::{FetchResult, Identifier, RawResource, SpanDone};
use crate::persist::{run_persister, CompletionCounter};
use crate::tables::{CsvTables, TableSink};
use crate::transform::{run_transformer, RecordFlattener, TransformStats};

/// Shared stop flag for every worker of a run. Fetchers stop issuing
/// requests once it is set; spans still complete through the normal path.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Splits `ids` into at most `workers` contiguous spans of `len / workers`
/// identifiers, the last span taking the remainder. With more workers than
/// identifiers every identifier gets its own span. Empty spans are omitted.
pub fn partition(ids: &[Identifier], workers: usize) -> Vec<&[Identifier]> {
    let workers = workers.max(1);
    if ids.is_empty() {
        return Vec::new();
    }
    if workers >= ids.len() {
        return ids.chunks(1).collect();
    }
    let size = ids.len() / workers;
    let mut spans: Vec<&[Identifier]> = Vec::with_capacity(workers);
    for i in 0..workers {
        let start = i * size;
        let end = if i == workers - 1 { ids.len() } else { start + size };
        spans.push(&ids[start..end]);
    }
    spans
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub requested: usize,
    pub workers: usize,
    pub fetched: usize,
    pub fetch_failures: Vec<Identifier>,
    pub skipped: usize,
    pub files_written: usize,
    pub write_failures: usize,
    /// Workers whose fetcher or persister thread panicked.
    pub panicked_workers: Vec<usize>,
    /// Identifiers left unreported by a panicked worker.
    pub unaccounted: usize,
    pub transform: TransformStats,
    pub rows_per_table: HashMap<String, usize>,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Identifiers that produced no primary row, by cause.
    pub fn dropped(&self) -> usize {
        self.fetch_failures.len()
            + self.skipped
            + self.unaccounted
            + self.transform.rejected.len()
            + self.transform.unparseable.len()
    }

    pub fn log(&self) {
        info!("-------------------- FINAL SUMMARY --------------------");
        info!("Total execution time: {}", format_elapsed(self.elapsed));
        info!("Identifiers requested: {} across {} workers", self.requested, self.workers);
        info!("Fetched: {}, raw files written: {}", self.fetched, self.files_written);
        if self.write_failures > 0 {
            warn!("Raw file write failures: {}", self.write_failures);
        }
        if self.skipped > 0 {
            warn!("Skipped after cancellation: {}", self.skipped);
        }
        if !self.panicked_workers.is_empty() {
            error!("Workers panicked: {:?} ({} identifiers unaccounted)", self.panicked_workers, self.unaccounted);
        }
        log_failed("Fetch failures", &self.fetch_failures);
        log_failed("Non-success responses", &self.transform.rejected);
        log_failed("Unparseable responses", &self.transform.unparseable);
        let mut sorted_counts: Vec<_> = self.rows_per_table.iter().collect();
        sorted_counts.sort();
        for (table_name, count) in sorted_counts {
            info!("  - {}: {} rows", table_name, count);
        }
        info!("-------------------------------------------------------");
    }
}

fn log_failed(label: &str, ids: &[Identifier]) {
    if ids.is_empty() {
        return;
    }
    warn!("{}: {}", label, ids.len());
    for id in ids.iter().take(10) {
        warn!("  - {}", id);
    }
    if ids.len() > 10 {
        warn!("  ... (and {} more)", ids.len() - 10);
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}.{:03}s", seconds, elapsed.subsec_millis())
    }
}

/// Fan-out of fetcher/persister pairs feeding a single transformer.
pub struct Pipeline {
    config: PipelineConfig,
    source: Arc<dyn ResourceSource>,
    cancel: CancellationToken,
    progress: ProgressBar,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, source: Arc<dyn ResourceSource>) -> Self {
        Self { config, source, cancel: CancellationToken::new(), progress: ProgressBar::hidden() }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Opens both tables. Failure here aborts the run before any worker
    /// starts.
    fn prepare(&self) -> Result<CsvTables> {
        fs::create_dir_all(&self.config.output_dir)
            .with_context(|| format!("Failed to create output directory: {}", self.config.output_dir.display()))?;
        CsvTables::create(
            &self.config.primary_table_path(),
            &self.config.valuation_table_path(),
            &self.config.schema,
        )
    }

    pub fn run(&self, ids: &[Identifier]) -> Result<RunSummary> {
        let tables = self.prepare()?;
        self.run_with_sink(ids, Box::new(tables))
    }

    /// Runs the pipeline writing into `sink`. Blocks until every span is
    /// done and the transformer has drained the row queue. A worker that
    /// panics is joined here and reported in the summary; it does not abort
    /// the run.
    pub fn run_with_sink(&self, ids: &[Identifier], mut sink: Box<dyn TableSink>) -> Result<RunSummary> {
        let start_time = Instant::now();
        fs::create_dir_all(&self.config.download_dir)
            .with_context(|| format!("Failed to create download directory: {}", self.config.download_dir.display()))?;
        let spans = partition(ids, self.config.workers);
        info!("Scraping {} identifiers with {} workers (download dir: {})",
            ids.len(), spans.len(), self.config.download_dir.display());
        self.progress.set_length(ids.len() as u64);

        let flattener = RecordFlattener::new(self.config.schema.clone());
        let counter = CompletionCounter::new(spans.len());
        let (row_sender, row_receiver): (Sender<RawResource>, Receiver<RawResource>) =
            bounded(self.config.row_queue_capacity.max(1));

        let (reports, panicked, transform) = thread::scope(|scope| {
            let sink = &mut sink;
            let flattener = &flattener;
            let transformer = scope.spawn(move || {
                let stats = run_transformer(row_receiver, flattener, sink.as_mut());
                (stats, sink.report_rows_written())
            });

            let mut workers = Vec::with_capacity(spans.len() * 2);
            for (worker, span) in spans.iter().enumerate() {
                let (result_tx, result_rx): (Sender<FetchResult>, Receiver<FetchResult>) =
                    bounded(self.config.worker_channel_capacity.max(1));
                let source = self.source.as_ref();
                let cancel = &self.cancel;
                workers.push((worker, scope.spawn(move || run_fetcher(worker, span, source, result_tx, cancel))));

                let rows = row_sender.clone();
                let counter = &counter;
                let download_dir = self.config.download_dir.as_path();
                let progress = &self.progress;
                workers.push((
                    worker,
                    scope.spawn(move || run_persister(worker, result_rx, download_dir, rows, counter, progress)),
                ));
                debug!("Worker {} spawned for {} identifiers.", worker, span.len());
            }

            let reports = counter.wait();
            info!("All {} persisters finished. Closing row queue.", reports.len());
            drop(row_sender);

            let mut panicked = Vec::new();
            for (worker, handle) in workers {
                if handle.join().is_err() {
                    error!("Worker {} panicked.", worker);
                    panicked.push(worker);
                }
            }
            panicked.dedup();

            let transform = match transformer.join() {
                Ok(result) => Some(result),
                Err(e) => {
                    error!("Transformer thread panicked: {:?}", e);
                    None
                }
            };
            (reports, panicked, transform)
        });

        sink.flush().context("Final flush of output tables failed")?;
        let (transform, rows_per_table) =
            transform.ok_or_else(|| anyhow::anyhow!("Transformer thread panicked"))?;
        self.progress.finish_with_message("done");

        let mut summary = summarize(ids.len(), spans.len(), reports, transform, rows_per_table, start_time.elapsed());
        summary.panicked_workers = panicked;
        Ok(summary)
    }
}

fn summarize(
    requested: usize,
    workers: usize,
    reports: Vec<SpanDone>,
    transform: TransformStats,
    rows_per_table: HashMap<String, usize>,
    elapsed: Duration,
) -> RunSummary {
    let mut summary = RunSummary { requested, workers, transform, rows_per_table, elapsed, ..Default::default() };
    for report in reports {
        summary.fetched += report.fetched;
        summary.skipped += report.skipped;
        summary.files_written += report.files_written;
        summary.write_failures += report.write_failures;
        summary.fetch_failures.extend(report.failed);
    }
    summary.fetch_failures.sort_unstable();
    summary.unaccounted =
        requested.saturating_sub(summary.fetched + summary.fetch_failures.len() + summary.skipped);
    summary
}
