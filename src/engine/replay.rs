//! Replay of a finished recording.
//!
//! The whole file is parsed up front and grouped into buckets of samples that share one
//! timestamp. A clock task then steps through the buckets at a fixed interval, wrapping back
//! to the first bucket after the last, so the display sees the recording as if it were live.

use crate::config::Mode;
use crate::engine::{Engine, LoadedSource};
use crate::metrics;
use crate::parsers::parse_rows;
use crate::track::{PlaybackInfo, Target, TrackSample};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Samples sharing one exact timestamp, in file order.
#[derive(Debug, Clone)]
struct Bucket {
    timestamp: f64,
    samples: Vec<TrackSample>,
}

#[derive(Debug, Default)]
struct ReplayState {
    buckets: Vec<Bucket>,
    sample_count: usize,
    index: usize,
    headers: Vec<String>,
    playing: bool,
}

struct Clock {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ReplayEngine {
    interval: Duration,
    state: Arc<Mutex<ReplayState>>,
    clock: Mutex<Option<Clock>>,
}

impl ReplayEngine {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Arc::new(Mutex::new(ReplayState::default())),
            clock: Mutex::new(None),
        }
    }

    /// Replace the dataset with `samples` and rewind to the first bucket.
    ///
    /// The clock is left as it is: a running playback keeps running over the new data.
    /// Returns the number of distinct timestamps.
    pub fn load(&self, samples: Vec<TrackSample>, headers: Vec<String>) -> usize {
        let sample_count = samples.len();
        let buckets = group_by_timestamp(samples);
        let bucket_count = buckets.len();

        let mut state = self.state.lock();
        state.buckets = buckets;
        state.sample_count = sample_count;
        state.index = 0;
        state.headers = headers;
        metrics::LOADED_SAMPLES.set(sample_count as i64);

        info!(
            tracks = sample_count,
            timestamps = bucket_count,
            "[replay] loaded recording"
        );
        bucket_count
    }

    /// Start the playback clock. Does nothing if it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut clock = self.clock.lock();
        if clock.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        self.state.lock().playing = true;
        let handle = tokio::spawn(run_clock(
            self.state.clone(),
            cancel.clone(),
            self.interval,
        ));
        *clock = Some(Clock { cancel, handle });

        info!(interval_ms = self.interval.as_millis() as u64, "starting CSV playback");
    }

    /// Step to the next bucket, wrapping after the last. Returns the new index.
    pub fn advance(&self) -> usize {
        advance_locked(&mut self.state.lock())
    }

    /// Stop playback and discard the dataset.
    pub fn reset(&self) {
        self.stop();
        *self.state.lock() = ReplayState::default();
        metrics::LOADED_SAMPLES.set(0);
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn current_index(&self) -> usize {
        self.state.lock().index
    }

    /// Distinct timestamps in playback order.
    pub fn timestamps(&self) -> Vec<f64> {
        self.state
            .lock()
            .buckets
            .iter()
            .map(|bucket| bucket.timestamp)
            .collect()
    }

    pub fn sample_count(&self) -> usize {
        self.state.lock().sample_count
    }
}

impl Drop for ReplayEngine {
    fn drop(&mut self) {
        if let Some(clock) = self.clock.get_mut().take() {
            clock.cancel.cancel();
            clock.handle.abort();
        }
    }
}

#[async_trait]
impl Engine for ReplayEngine {
    fn mode(&self) -> Mode {
        Mode::Replay
    }

    async fn initialize(&self, source: LoadedSource) -> Result<()> {
        let started = std::time::Instant::now();
        let outcome = parse_rows(source.data_lines(), &source.header);
        metrics::record_parse("replay", &outcome, started.elapsed());

        self.load(outcome.samples, source.header.columns().to_vec());
        self.start();
        Ok(())
    }

    fn current_targets(&self) -> Vec<Target> {
        let state = self.state.lock();
        state
            .buckets
            .get(state.index)
            .map(|bucket| bucket.samples.iter().map(Target::from).collect())
            .unwrap_or_default()
    }

    fn playback_info(&self) -> PlaybackInfo {
        let state = self.state.lock();
        PlaybackInfo {
            current_timestamp: state
                .buckets
                .get(state.index)
                .map(|bucket| bucket.timestamp)
                .unwrap_or(0.0),
            total_timestamps: state.buckets.len(),
            current_index: state.index,
            is_playing: state.playing,
        }
    }

    fn headers(&self) -> Vec<String> {
        self.state.lock().headers.clone()
    }

    fn stop(&self) {
        let clock = self.clock.lock().take();
        if let Some(clock) = clock {
            // Cancel before taking the state lock: a tick that already holds the lock
            // finishes, and every later tick sees the cancellation.
            clock.cancel.cancel();
            clock.handle.abort();
            info!("stopped CSV playback");
        } else {
            debug!("stop requested while playback was idle");
        }
        self.state.lock().playing = false;
    }
}

async fn run_clock(state: Arc<Mutex<ReplayState>>, cancel: CancellationToken, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let mut guard = state.lock();
                if cancel.is_cancelled() {
                    return;
                }
                advance_locked(&mut guard);
            }
        }
    }
}

fn advance_locked(state: &mut ReplayState) -> usize {
    if state.buckets.is_empty() {
        state.index = 0;
        return 0;
    }

    state.index = (state.index + 1) % state.buckets.len();
    if state.index == 0 {
        metrics::REPLAY_LOOPS_TOTAL.inc();
        info!("playback loop - restarting from beginning");
    }
    state.index
}

/// Sort samples by timestamp and collapse equal timestamps into one bucket each.
///
/// The sort is stable, so samples inside a bucket keep their file order.
fn group_by_timestamp(mut samples: Vec<TrackSample>) -> Vec<Bucket> {
    samples.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

    let mut buckets: Vec<Bucket> = Vec::new();
    for sample in samples {
        match buckets.last_mut() {
            Some(bucket) if bucket.timestamp == sample.timestamp => bucket.samples.push(sample),
            _ => buckets.push(Bucket {
                timestamp: sample.timestamp,
                samples: vec![sample],
            }),
        }
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::{parse_rows, CsvHeader};

    const HEADER: &str = "track_id,timestamp,x,y,doppler,range,class";

    fn samples(lines: &[&str]) -> Vec<TrackSample> {
        let header = CsvHeader::parse(HEADER).expect("header");
        parse_rows(lines.iter().copied(), &header).samples
    }

    fn three_buckets() -> Vec<TrackSample> {
        samples(&[
            "1,0.10,1,1,-0.5,3,Human",
            "2,0.10,2,2,0.5,4,Vehicle",
            "1,0.05,1,1,-0.1,3,Human",
            "3,0.20,3,3,0.0,5,Bird",
            "2,0.05,2,2,0.2,4,Vehicle",
        ])
    }

    fn engine() -> ReplayEngine {
        ReplayEngine::new(Duration::from_millis(50))
    }

    #[test]
    fn timestamps_are_distinct_and_ascending_for_any_row_order() {
        let engine = engine();
        let mut rows = three_buckets();
        rows.reverse();
        engine.load(rows, Vec::new());

        assert_eq!(engine.timestamps(), vec![0.05, 0.10, 0.20]);
        assert_eq!(engine.sample_count(), 5);
    }

    #[test]
    fn negative_zero_shares_a_bucket_with_zero() {
        let engine = engine();
        engine.load(samples(&["1,0,1,1", "2,-0,1,1", "3,1,1,1"]), Vec::new());
        assert_eq!(engine.timestamps().len(), 2);
    }

    #[test]
    fn advancing_bucket_count_times_returns_to_start() {
        let engine = engine();
        let bucket_count = engine.load(three_buckets(), Vec::new());
        let start = engine.current_index();

        let visited: Vec<usize> = (0..bucket_count).map(|_| engine.advance()).collect();
        assert_eq!(visited, vec![1, 2, 0]);
        assert_eq!(engine.current_index(), start);
    }

    #[test]
    fn current_targets_share_one_timestamp() {
        let engine = engine();
        let bucket_count = engine.load(three_buckets(), Vec::new());

        for _ in 0..bucket_count {
            let targets = engine.current_targets();
            assert!(!targets.is_empty());
            let first = targets[0].timestamp;
            assert!(targets.iter().all(|t| t.timestamp == first));
            assert_eq!(engine.playback_info().current_timestamp, first);
            engine.advance();
        }
    }

    #[test]
    fn bucket_keeps_file_order() {
        let engine = engine();
        engine.load(three_buckets(), Vec::new());
        let ids: Vec<String> = engine
            .current_targets()
            .iter()
            .map(|t| t.track_id.to_string())
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn empty_dataset_yields_no_targets() {
        let engine = engine();
        assert_eq!(engine.load(Vec::new(), Vec::new()), 0);
        assert_eq!(engine.advance(), 0);
        assert!(engine.current_targets().is_empty());
        assert_eq!(engine.playback_info(), PlaybackInfo::default());
    }

    #[test]
    fn reload_rewinds_to_first_bucket() {
        let engine = engine();
        engine.load(three_buckets(), Vec::new());
        engine.advance();
        engine.advance();

        engine.load(samples(&["9,5.0,0,0"]), Vec::new());
        assert_eq!(engine.current_index(), 0);
        assert_eq!(engine.playback_info().current_timestamp, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn clock_advances_once_per_interval() {
        let engine = engine();
        engine.load(three_buckets(), Vec::new());
        engine.start();
        assert!(engine.is_playing());

        tokio::time::sleep(Duration::from_millis(125)).await;
        assert_eq!(engine.current_index(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.current_index(), 0);

        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let engine = engine();
        engine.load(three_buckets(), Vec::new());
        engine.start();
        engine.start();

        tokio::time::sleep(Duration::from_millis(75)).await;
        assert_eq!(engine.current_index(), 1);
        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn no_ticks_after_stop() {
        let engine = engine();
        engine.load(three_buckets(), Vec::new());
        engine.start();

        tokio::time::sleep(Duration::from_millis(75)).await;
        engine.stop();
        let index = engine.current_index();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.current_index(), index);
        assert!(!engine.is_playing());
        assert_eq!(engine.sample_count(), 5, "stop keeps the dataset");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_twice_is_harmless() {
        let engine = engine();
        engine.load(three_buckets(), Vec::new());
        engine.start();

        engine.stop();
        assert!(!engine.is_playing());
        engine.stop();
        assert!(!engine.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_parses_and_starts_playback() {
        let engine = engine();
        let header = CsvHeader::parse(HEADER).expect("header");
        let content = format!("{HEADER}\n1,0.5,1,1,-2,3,Human\nbad,row\n\n2,0.5,2,2,1,4,Bird");
        let source = LoadedSource::new("tracks.csv".into(), header, content);

        engine.initialize(source).await.expect("initialize");
        assert!(engine.is_playing());
        assert_eq!(engine.headers().len(), 7);

        let targets = engine.current_targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].velocity, Some(2.0));
        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn reset_discards_everything() {
        let engine = engine();
        engine.load(three_buckets(), vec!["track_id".into()]);
        engine.start();

        engine.reset();
        assert!(!engine.is_playing());
        assert_eq!(engine.sample_count(), 0);
        assert!(engine.timestamps().is_empty());
        assert!(engine.headers().is_empty());
    }
}
