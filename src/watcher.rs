use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub enum FileEvent {
    Modified(PathBuf),
    /// The notification backend reported an error; the watch should be re-armed.
    Failed(String),
}

pub const WATCHER_CHANNEL_CAPACITY: usize = 1000;

/// Start a change watch on a single file.
///
/// Events are forwarded into `event_tx`; the watch lasts until the returned watcher is
/// dropped.
pub fn watch_file(path: &Path, event_tx: mpsc::Sender<FileEvent>) -> Result<RecommendedWatcher> {
    let watcher_tx = event_tx.clone();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => handle_event(&watcher_tx, event),
            Err(err) => {
                error!(error = %err, "file watcher error");
                send_event(&watcher_tx, FileEvent::Failed(err.to_string()), "failed");
            }
        },
        NotifyConfig::default(),
    )
    .context("failed to create notify watcher")?;

    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch path {}", path.display()))?;

    info!(path = %path.display(), "file watcher started");
    Ok(watcher)
}

fn handle_event(event_tx: &mpsc::Sender<FileEvent>, event: Event) {
    match event.kind {
        EventKind::Modify(_) | EventKind::Create(_) => {
            for path in event.paths {
                debug!(path = %path.display(), "detected file modification");
                send_event(event_tx, FileEvent::Modified(path), "modified");
            }
        }
        _ => {}
    }
}

fn send_event(event_tx: &mpsc::Sender<FileEvent>, event: FileEvent, kind: &str) {
    match event_tx.try_send(event) {
        Ok(_) => {}
        Err(TrySendError::Full(_)) => {
            warn!(kind, "watcher channel full; dropping file event");
        }
        Err(TrySendError::Closed(_)) => {
            debug!(kind, "watcher channel closed; dropping file event");
        }
    }
}

/// Restart-on-new-event debounce.
///
/// Every recorded event pushes the deadline to `now + window`, so a burst of writes produces
/// a single read once the file has been quiet for one window. Time is always passed in by
/// the caller.
#[derive(Debug, Clone)]
pub struct Debounce {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true once the quiet window has elapsed, clearing the pending deadline.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
