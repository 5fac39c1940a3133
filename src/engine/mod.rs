//! Ingestion engines.
//!
//! Both engines sit behind [`Engine`] so the snapshot accessor can hold whichever one the
//! configured mode selects without caring which it is.

pub mod replay;
pub mod tail;

pub use replay::ReplayEngine;
pub use tail::{TailEngine, TailSettings};

use crate::config::{Config, Mode};
use crate::parsers::CsvHeader;
use crate::track::{PlaybackInfo, Target};
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// A CSV source that has been read and whose header has been validated.
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub path: PathBuf,
    pub header: CsvHeader,
    content: String,
}

impl LoadedSource {
    /// `content` must already be trimmed so that its first line is the header.
    pub(crate) fn new(path: PathBuf, header: CsvHeader, content: String) -> Self {
        Self {
            path,
            header,
            content,
        }
    }

    /// Every line after the header, blank lines included.
    pub fn data_lines(&self) -> impl Iterator<Item = &str> {
        self.content.lines().skip(1)
    }
}

#[async_trait]
pub trait Engine: Send + Sync {
    fn mode(&self) -> Mode;

    /// Take over a freshly loaded source, replacing whatever the engine held before.
    async fn initialize(&self, source: LoadedSource) -> Result<()>;

    fn current_targets(&self) -> Vec<Target>;

    fn playback_info(&self) -> PlaybackInfo;

    /// Header columns of the most recently loaded source.
    fn headers(&self) -> Vec<String>;

    /// Cancel every timer and watch the engine owns. Safe to call repeatedly.
    fn stop(&self);
}

pub fn build_engine(config: &Config) -> Arc<dyn Engine> {
    match config.mode {
        Mode::Replay => Arc::new(ReplayEngine::new(config.playback_interval())),
        Mode::Live => Arc::new(TailEngine::new(TailSettings {
            debounce: config.debounce(),
            watcher_retry: config.watcher_retry(),
        })),
    }
}
