//! Live tailing of a CSV file that another process appends to.
//!
//! The engine remembers how many bytes of the file it has consumed. A change notification
//! arms a short debounce; when it fires, only the bytes past the consumed offset are read
//! and parsed, and that batch becomes the visible dataset (batches are not accumulated).
//!
//! Recovery:
//! - file shrank (truncated or rotated): full reload immediately
//! - read failure, or new lines with no valid row: counted; the third consecutive fault
//!   forces a full reload
//! - watcher failure: the watch is dropped and re-armed after a backoff

use crate::config::{Mode, DEFAULT_DEBOUNCE_MS, DEFAULT_WATCHER_RETRY_MS};
use crate::engine::{Engine, LoadedSource};
use crate::metrics;
use crate::parsers::utils::is_blank;
use crate::parsers::{parse_rows, CsvHeader};
use crate::track::{PlaybackInfo, Target, TrackSample};
use crate::watcher::{watch_file, Debounce, FileEvent, WATCHER_CHANNEL_CAPACITY};
use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::RecommendedWatcher;
use parking_lot::Mutex;
use serde::Serialize;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consecutive ingestion faults tolerated before the file is reloaded from scratch.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct TailSettings {
    pub debounce: Duration,
    pub watcher_retry: Duration,
}

impl Default for TailSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            watcher_retry: Duration::from_millis(DEFAULT_WATCHER_RETRY_MS),
        }
    }
}

/// What one read cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// File size matches the consumed offset.
    Unchanged,
    /// New rows replaced the visible dataset.
    Ingested(usize),
    /// Only blank lines were appended; the offset moved, the dataset did not.
    BlankGrowth,
    /// New lines held no valid row.
    Rejected { consecutive_errors: u32 },
    /// The whole file was re-read.
    Reloaded(usize),
    /// Stat, read or reload failed.
    Failed { consecutive_errors: u32 },
    /// The engine was stopped before the result could be applied.
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum ReloadReason {
    Truncated,
    Faults,
    Requested,
}

impl ReloadReason {
    fn label(self) -> &'static str {
        match self {
            ReloadReason::Truncated => "truncated",
            ReloadReason::Faults => "consecutive_errors",
            ReloadReason::Requested => "requested",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FaultKind {
    Read,
    EmptyBatch,
}

#[derive(Debug, Default)]
struct TailState {
    path: PathBuf,
    header: CsvHeader,
    samples: Vec<TrackSample>,
    consumed_offset: u64,
    consecutive_errors: u32,
    watching: bool,
}

/// Ingestion cursor and dataset summary, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TailStatus {
    pub path: PathBuf,
    pub consumed_offset: u64,
    pub consecutive_errors: u32,
    pub headers: Vec<String>,
    pub row_count: usize,
    pub watching: bool,
}

/// Read/apply logic shared by the engine handle and its watch task.
///
/// File I/O happens without the state lock. Results are applied under the lock after
/// checking `cancel`, which is what lets `stop()` guarantee no later mutation.
#[derive(Clone)]
struct Ingestor {
    state: Arc<Mutex<TailState>>,
}

impl Ingestor {
    async fn read_new_data(&self, cancel: &CancellationToken) -> ReadOutcome {
        let (path, offset, header) = {
            let state = self.state.lock();
            (state.path.clone(), state.consumed_offset, state.header.clone())
        };

        match self.try_read_new_data(&path, offset, &header, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    error = %err,
                    path = %path.display(),
                    "failed to read newly appended bytes"
                );
                self.record_fault(&path, FaultKind::Read, cancel).await
            }
        }
    }

    async fn try_read_new_data(
        &self,
        path: &Path,
        offset: u64,
        header: &CsvHeader,
        cancel: &CancellationToken,
    ) -> Result<ReadOutcome> {
        let current_size = fs::metadata(path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();

        if current_size < offset {
            warn!(
                path = %path.display(),
                previous_offset = offset,
                current_size,
                "file truncated or rotated; reloading entire file"
            );
            return Ok(match self.full_reload(ReloadReason::Truncated, cancel).await {
                Ok(rows) => ReadOutcome::Reloaded(rows),
                Err(err) => {
                    error!(error = %err, path = %path.display(), "critical error reloading file");
                    self.bump_errors(cancel)
                }
            });
        }

        if current_size == offset {
            return Ok(ReadOutcome::Unchanged);
        }

        let read_start = std::time::Instant::now();
        let appended = read_appended(path, offset, current_size).await?;
        let new_lines: Vec<&str> = appended.lines().filter(|line| !is_blank(line)).collect();

        if new_lines.is_empty() {
            let mut state = self.state.lock();
            if cancel.is_cancelled() {
                return Ok(ReadOutcome::Cancelled);
            }
            state.consumed_offset = current_size;
            return Ok(ReadOutcome::BlankGrowth);
        }

        let line_count = new_lines.len();
        let outcome = parse_rows(new_lines, header);
        metrics::record_parse("tail", &outcome, read_start.elapsed());

        if outcome.samples.is_empty() {
            warn!(
                path = %path.display(),
                lines = line_count,
                "no valid rows found in new data; file may be corrupted"
            );
            return Ok(self.record_fault(path, FaultKind::EmptyBatch, cancel).await);
        }

        let rows = outcome.samples.len();
        {
            let mut state = self.state.lock();
            if cancel.is_cancelled() {
                return Ok(ReadOutcome::Cancelled);
            }
            state.samples = outcome.samples;
            state.consumed_offset = current_size;
            state.consecutive_errors = 0;
        }
        metrics::LOADED_SAMPLES.set(rows as i64);

        info!(
            path = %path.display(),
            rows,
            rejected = outcome.rejected,
            offset = current_size,
            "ingested new tracks"
        );
        Ok(ReadOutcome::Ingested(rows))
    }

    fn set_watching(&self, armed: bool, cancel: &CancellationToken) {
        let mut state = self.state.lock();
        if !cancel.is_cancelled() {
            state.watching = armed;
        }
    }

    fn bump_errors(&self, cancel: &CancellationToken) -> ReadOutcome {
        let mut state = self.state.lock();
        if cancel.is_cancelled() {
            return ReadOutcome::Cancelled;
        }
        state.consecutive_errors += 1;
        ReadOutcome::Failed {
            consecutive_errors: state.consecutive_errors,
        }
    }

    async fn record_fault(
        &self,
        path: &Path,
        kind: FaultKind,
        cancel: &CancellationToken,
    ) -> ReadOutcome {
        let label = match kind {
            FaultKind::Read => "read",
            FaultKind::EmptyBatch => "empty_batch",
        };
        metrics::INGESTION_FAULTS_TOTAL
            .with_label_values(&[label])
            .inc();

        let consecutive_errors = match self.bump_errors(cancel) {
            ReadOutcome::Failed { consecutive_errors } => consecutive_errors,
            other => return other,
        };

        if consecutive_errors < MAX_CONSECUTIVE_ERRORS {
            return match kind {
                FaultKind::Read => ReadOutcome::Failed { consecutive_errors },
                FaultKind::EmptyBatch => ReadOutcome::Rejected { consecutive_errors },
            };
        }

        error!(
            path = %path.display(),
            consecutive_errors,
            "{} consecutive ingestion errors; attempting full reload",
            MAX_CONSECUTIVE_ERRORS
        );
        match self.full_reload(ReloadReason::Faults, cancel).await {
            Ok(rows) => ReadOutcome::Reloaded(rows),
            Err(err) => {
                error!(error = %err, path = %path.display(), "critical error reloading file");
                ReadOutcome::Failed { consecutive_errors }
            }
        }
    }

    /// Re-read the whole file, skipping its first line, and make every valid row visible.
    async fn full_reload(&self, reason: ReloadReason, cancel: &CancellationToken) -> Result<usize> {
        let (path, header) = {
            let state = self.state.lock();
            (state.path.clone(), state.header.clone())
        };

        info!(path = %path.display(), reason = reason.label(), "reloading entire CSV file");

        let started = std::time::Instant::now();
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let content = String::from_utf8_lossy(&bytes);
        let outcome = parse_rows(content.trim().lines().skip(1), &header);
        metrics::record_parse("reload", &outcome, started.elapsed());

        let rows = outcome.samples.len();
        {
            let mut state = self.state.lock();
            if cancel.is_cancelled() {
                anyhow::bail!("tail engine stopped during reload of {}", path.display());
            }
            state.samples = outcome.samples;
            state.consumed_offset = bytes.len() as u64;
            state.consecutive_errors = 0;
        }
        metrics::TAIL_RELOADS_TOTAL
            .with_label_values(&[reason.label()])
            .inc();
        metrics::LOADED_SAMPLES.set(rows as i64);

        info!(path = %path.display(), rows, "full reload complete");
        Ok(rows)
    }
}

/// Read the bytes in `offset..end` that belong to lines starting at or after `offset`.
///
/// One byte before `offset` is read as well: if it is not a newline, the consumed region
/// ended mid-line and the rest of that line is skipped.
async fn read_appended(path: &Path, offset: u64, end: u64) -> Result<String> {
    let start = offset.saturating_sub(1);
    let mut file = fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.seek(SeekFrom::Start(start))
        .await
        .with_context(|| format!("failed to seek {} to offset {}", path.display(), start))?;

    let len = end.saturating_sub(start);
    let mut buffer = Vec::with_capacity(len as usize);
    file.take(len)
        .read_to_end(&mut buffer)
        .await
        .with_context(|| format!("failed to read from {}", path.display()))?;

    let fresh = if offset == 0 {
        &buffer[..]
    } else {
        skip_partial_line(&buffer)
    };
    Ok(String::from_utf8_lossy(fresh).into_owned())
}

fn skip_partial_line(buffer: &[u8]) -> &[u8] {
    match buffer.split_first() {
        Some((b'\n', rest)) => rest,
        Some((_, rest)) => match rest.iter().position(|byte| *byte == b'\n') {
            Some(idx) => &rest[idx + 1..],
            None => &[],
        },
        None => &[],
    }
}

struct WatchTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    watcher: Arc<Mutex<Option<RecommendedWatcher>>>,
}

pub struct TailEngine {
    settings: TailSettings,
    ingestor: Ingestor,
    watch: Mutex<Option<WatchTask>>,
    /// Token for reads requested directly through the handle; never cancelled.
    manual: CancellationToken,
}

impl TailEngine {
    pub fn new(settings: TailSettings) -> Self {
        Self {
            settings,
            ingestor: Ingestor {
                state: Arc::new(Mutex::new(TailState::default())),
            },
            watch: Mutex::new(None),
            manual: CancellationToken::new(),
        }
    }

    /// Point the engine at `path` without starting a watch.
    ///
    /// The file's current size becomes the consumed offset and the visible dataset is
    /// cleared, so only rows appended from now on are ingested. Returns the offset.
    pub async fn attach(&self, path: PathBuf, header: CsvHeader) -> Result<u64> {
        let size = fs::metadata(&path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();

        self.stop();

        let mut state = self.ingestor.state.lock();
        *state = TailState {
            path,
            header,
            samples: Vec::new(),
            consumed_offset: size,
            consecutive_errors: 0,
            watching: false,
        };
        metrics::LOADED_SAMPLES.set(0);
        Ok(size)
    }

    /// Arm the file watch and debounce loop. Does nothing if already watching.
    ///
    /// The watch is armed from the spawned task, so `status().watching` turns true only once
    /// the notification backend has accepted it. Must be called from within a tokio runtime.
    pub fn start_watching(&self) {
        let mut watch = self.watch.lock();
        if watch.is_some() {
            return;
        }

        let path = self.ingestor.state.lock().path.clone();

        let cancel = CancellationToken::new();
        let watcher = Arc::new(Mutex::new(None));
        let handle = tokio::spawn(run_watch(
            self.ingestor.clone(),
            path,
            self.settings,
            cancel.clone(),
            watcher.clone(),
        ));

        *watch = Some(WatchTask {
            cancel,
            handle,
            watcher,
        });
    }

    /// Run one read cycle now, outside the debounce loop.
    pub async fn read_new_data(&self) -> ReadOutcome {
        self.ingestor.read_new_data(&self.manual).await
    }

    /// Re-read the whole file now. Returns the number of visible rows.
    pub async fn full_reload(&self) -> Result<usize> {
        self.ingestor
            .full_reload(ReloadReason::Requested, &self.manual)
            .await
    }

    pub fn status(&self) -> TailStatus {
        let state = self.ingestor.state.lock();
        TailStatus {
            path: state.path.clone(),
            consumed_offset: state.consumed_offset,
            consecutive_errors: state.consecutive_errors,
            headers: state.header.columns().to_vec(),
            row_count: state.samples.len(),
            watching: state.watching,
        }
    }
}

impl Drop for TailEngine {
    fn drop(&mut self) {
        if let Some(task) = self.watch.get_mut().take() {
            task.cancel.cancel();
            task.watcher.lock().take();
            task.handle.abort();
        }
    }
}

#[async_trait]
impl Engine for TailEngine {
    fn mode(&self) -> Mode {
        Mode::Live
    }

    async fn initialize(&self, source: LoadedSource) -> Result<()> {
        let path = source.path.clone();
        let offset = self.attach(source.path, source.header).await?;
        self.start_watching();

        info!(
            path = %path.display(),
            offset,
            "[live] initialized CSV handler, monitoring for new data"
        );
        Ok(())
    }

    fn current_targets(&self) -> Vec<Target> {
        self.ingestor
            .state
            .lock()
            .samples
            .iter()
            .map(Target::from)
            .collect()
    }

    fn playback_info(&self) -> PlaybackInfo {
        let state = self.ingestor.state.lock();
        let latest = state
            .samples
            .iter()
            .map(|sample| sample.timestamp)
            .reduce(f64::max)
            .unwrap_or(0.0);

        PlaybackInfo {
            current_timestamp: latest,
            total_timestamps: state.samples.len(),
            current_index: 0,
            is_playing: false,
        }
    }

    fn headers(&self) -> Vec<String> {
        self.ingestor.state.lock().header.columns().to_vec()
    }

    fn stop(&self) {
        let task = self.watch.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            task.watcher.lock().take();
            task.handle.abort();
            info!("stopped watching CSV file");
        }
        // Taking the state lock after cancelling waits out any in-flight apply.
        self.ingestor.state.lock().watching = false;
    }
}

async fn run_watch(
    ingestor: Ingestor,
    path: PathBuf,
    settings: TailSettings,
    cancel: CancellationToken,
    watcher: Arc<Mutex<Option<RecommendedWatcher>>>,
) {
    let (event_tx, mut event_rx) = mpsc::channel(WATCHER_CHANNEL_CAPACITY);
    let mut debounce = Debounce::new(settings.debounce);
    let mut rearm_at = arm_watch(
        &ingestor,
        &path,
        &event_tx,
        &watcher,
        &cancel,
        settings.watcher_retry,
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(event) = event_rx.recv() => match event {
                FileEvent::Modified(_) => debounce.record(Instant::now()),
                FileEvent::Failed(reason) => {
                    warn!(
                        path = %path.display(),
                        %reason,
                        retry_ms = settings.watcher_retry.as_millis() as u64,
                        "file watcher failed; re-arming after backoff"
                    );
                    disarm_watch(&ingestor, &watcher, &cancel);
                    if rearm_at.is_none() {
                        rearm_at = Some(Instant::now() + settings.watcher_retry);
                    }
                }
            },
            _ = wait_until(debounce.deadline()) => {
                if debounce.fire(Instant::now()) {
                    let outcome = ingestor.read_new_data(&cancel).await;
                    debug!(path = %path.display(), ?outcome, "tail read cycle finished");
                }
            }
            _ = wait_until(rearm_at) => {
                metrics::WATCHER_RESTARTS_TOTAL.inc();
                rearm_at = arm_watch(
                    &ingestor,
                    &path,
                    &event_tx,
                    &watcher,
                    &cancel,
                    settings.watcher_retry,
                );
            }
        }
    }

    watcher.lock().take();
    debug!(path = %path.display(), "watch loop exited");
}

/// Try to start a watch; on failure return when to try again.
fn arm_watch(
    ingestor: &Ingestor,
    path: &Path,
    event_tx: &mpsc::Sender<FileEvent>,
    slot: &Mutex<Option<RecommendedWatcher>>,
    cancel: &CancellationToken,
    retry: Duration,
) -> Option<Instant> {
    match watch_file(path, event_tx.clone()) {
        Ok(new_watcher) => {
            {
                let mut slot = slot.lock();
                if !cancel.is_cancelled() {
                    *slot = Some(new_watcher);
                }
            }
            ingestor.set_watching(true, cancel);
            None
        }
        Err(err) => {
            ingestor.set_watching(false, cancel);
            error!(
                error = %err,
                path = %path.display(),
                retry_ms = retry.as_millis() as u64,
                "failed to arm file watch; retrying after backoff"
            );
            Some(Instant::now() + retry)
        }
    }
}

/// Drop a failed watch; it counts as disarmed until the next successful arm.
fn disarm_watch(
    ingestor: &Ingestor,
    slot: &Mutex<Option<RecommendedWatcher>>,
    cancel: &CancellationToken,
) {
    slot.lock().take();
    ingestor.set_watching(false, cancel);
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
