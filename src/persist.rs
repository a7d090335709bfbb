use crossbeam_channel::{unbounded, Receiver, Sender};
use indicatif::ProgressBar;
use log::{debug, error, info, warn};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::model::{FetchResult, RawResource, SpanDone};

/// Count of persisters still running. Each persister releases exactly once,
/// and the orchestrator blocks in [`CompletionCounter::wait`] until all have.
pub struct CompletionCounter {
    expected: usize,
    remaining: AtomicUsize,
    done_tx: Sender<SpanDone>,
    done_rx: Receiver<SpanDone>,
}

impl CompletionCounter {
    pub fn new(expected: usize) -> Self {
        let (done_tx, done_rx) = unbounded();
        Self { expected, remaining: AtomicUsize::new(expected), done_tx, done_rx }
    }

    #[cfg(test)]
    fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Decrements the counter and hands over the span report. Returns true
    /// for the release that brought the count to zero.
    pub fn release(&self, report: SpanDone) -> bool {
        let worker = report.worker;
        let previous = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if self.done_tx.send(report).is_err() {
            error!("Completion channel closed before worker {} reported.", worker);
        }
        previous == 1
    }

    pub fn guard(&self, worker: usize) -> CompletionGuard<'_> {
        CompletionGuard { counter: self, report: SpanDone { worker, ..Default::default() } }
    }

    /// Blocks until every expected persister has released, returning their
    /// reports in completion order.
    pub fn wait(&self) -> Vec<SpanDone> {
        let mut reports = Vec::with_capacity(self.expected);
        while reports.len() < self.expected {
            match self.done_rx.recv() {
                Ok(report) => reports.push(report),
                Err(_) => break,
            }
        }
        reports
    }
}

/// Releases its counter slot when dropped, including during a panic unwind.
pub struct CompletionGuard<'a> {
    counter: &'a CompletionCounter,
    report: SpanDone,
}

impl CompletionGuard<'_> {
    pub fn report_mut(&mut self) -> &mut SpanDone {
        &mut self.report
    }
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        let report = std::mem::take(&mut self.report);
        let worker = report.worker;
        if self.counter.release(report) {
            info!("Persister {} was the last to finish.", worker);
        }
    }
}

fn write_raw(download_dir: &Path, resource: &RawResource) -> std::io::Result<()> {
    fs::write(download_dir.join(resource.file_name()), &resource.payload)
}

/// Drains one fetcher's results: writes each payload to `<id>.json`, then
/// forwards it to the shared row queue. Write failures are logged and the
/// payload is forwarded anyway. Returns once the fetcher closes its channel.
pub fn run_persister(
    worker: usize,
    results: Receiver<FetchResult>,
    download_dir: &Path,
    rows: Sender<RawResource>,
    counter: &CompletionCounter,
    progress: &ProgressBar,
) {
    let mut guard = counter.guard(worker);
    debug!("Persister {} started.", worker);
    for result in results {
        let report = guard.report_mut();
        match result {
            FetchResult::Fetched(resource) => {
                report.fetched += 1;
                match write_raw(download_dir, &resource) {
                    Ok(()) => report.files_written += 1,
                    Err(e) => {
                        report.write_failures += 1;
                        error!("Persister {}: failed to write {}: {}", worker, resource.file_name(), e);
                    }
                }
                let id = resource.id;
                if rows.send(resource).is_err() {
                    error!("Persister {}: row queue closed, {} not transformed.", worker, id);
                }
            }
            FetchResult::Failed(id) => report.failed.push(id),
            FetchResult::Skipped(_) => report.skipped += 1,
        }
        progress.inc(1);
    }
    let report = guard.report_mut();
    if !report.failed.is_empty() {
        warn!("Persister {}: {} identifiers dropped after fetch errors.", worker, report.failed.len());
    }
    debug!("Persister {} finished: {} fetched, {} written.", worker, report.fetched, report.files_written);
}
