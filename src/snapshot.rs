//! The single read path between the ingestion engines and the HTTP layer.

use crate::config::{Config, Mode};
use crate::engine::{build_engine, Engine, LoadedSource};
use crate::error::SourceError;
use crate::parsers::CsvHeader;
use crate::track::{PlaybackInfo, Target};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{error, info, warn};

/// Everything `/status` reports about the feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatus {
    pub mode: Mode,
    pub source: Option<PathBuf>,
    pub headers: Vec<String>,
    pub playback: PlaybackInfo,
}

pub struct SnapshotAccessor {
    engine: Arc<dyn Engine>,
    default_path: PathBuf,
    source_path: Mutex<Option<PathBuf>>,
}

impl SnapshotAccessor {
    pub fn new(engine: Arc<dyn Engine>, default_path: PathBuf) -> Self {
        Self {
            engine,
            default_path,
            source_path: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(build_engine(config), config.csv_path())
    }

    pub fn mode(&self) -> Mode {
        self.engine.mode()
    }

    /// Load `path` (or the configured default) into the active engine.
    ///
    /// Returns false when the file is missing, unreadable, empty or has no header; the
    /// engine keeps whatever it held before.
    pub async fn load_source(&self, path: Option<&Path>) -> bool {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_path.clone());

        match self.try_load(&path).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    error = %err,
                    path = %path.display(),
                    mode = %self.engine.mode(),
                    "failed to load CSV source"
                );
                false
            }
        }
    }

    async fn try_load(&self, path: &Path) -> Result<(), SourceError> {
        let source = read_source(path).await?;
        let columns = source.header.len();

        self.engine
            .initialize(source)
            .await
            .map_err(|source| SourceError::Engine {
                path: path.to_path_buf(),
                source,
            })?;

        *self.source_path.lock() = Some(path.to_path_buf());
        info!(
            path = %path.display(),
            mode = %self.engine.mode(),
            columns,
            "loaded CSV source"
        );
        Ok(())
    }

    pub fn current_targets(&self) -> Vec<Target> {
        self.engine.current_targets()
    }

    pub fn playback_info(&self) -> PlaybackInfo {
        self.engine.playback_info()
    }

    pub fn status(&self) -> FeedStatus {
        FeedStatus {
            mode: self.engine.mode(),
            source: self.source_path.lock().clone(),
            headers: self.engine.headers(),
            playback: self.engine.playback_info(),
        }
    }

    pub fn stop(&self) {
        self.engine.stop();
    }
}

/// Read a CSV file and validate that it has a header row.
pub async fn read_source(path: &Path) -> Result<LoadedSource, SourceError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(SourceError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(SourceError::Unreadable {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let content = String::from_utf8_lossy(&bytes).trim().to_string();
    if content.is_empty() {
        return Err(SourceError::Empty {
            path: path.to_path_buf(),
        });
    }

    let header = content
        .lines()
        .next()
        .and_then(CsvHeader::parse)
        .ok_or_else(|| SourceError::MissingHeader {
            path: path.to_path_buf(),
        })?;

    let missing = header.missing_required();
    if !missing.is_empty() {
        warn!(
            path = %path.display(),
            missing = ?missing,
            "CSV header lacks required columns; every row will be rejected"
        );
    }

    Ok(LoadedSource::new(path.to_path_buf(), header, content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReplayEngine;
    use std::time::Duration;

    fn scratch(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trks.csv");
        std::fs::write(&path, content).expect("write csv");
        (dir, path)
    }

    fn replay_accessor(default_path: PathBuf) -> SnapshotAccessor {
        SnapshotAccessor::new(
            Arc::new(ReplayEngine::new(Duration::from_millis(50))),
            default_path,
        )
    }

    #[tokio::test]
    async fn read_source_classifies_failures() {
        let dir = tempfile::tempdir().expect("tempdir");

        let missing = dir.path().join("absent.csv");
        assert!(matches!(
            read_source(&missing).await,
            Err(SourceError::NotFound { .. })
        ));

        let empty = dir.path().join("empty.csv");
        std::fs::write(&empty, "  \n\n").expect("write");
        assert!(matches!(
            read_source(&empty).await,
            Err(SourceError::Empty { .. })
        ));

        let headless = dir.path().join("headless.csv");
        std::fs::write(&headless, ",,,\n1,2,3,4\n").expect("write");
        assert!(matches!(
            read_source(&headless).await,
            Err(SourceError::MissingHeader { .. })
        ));

        assert!(matches!(
            read_source(dir.path()).await,
            Err(SourceError::Unreadable { .. })
        ));
    }

    #[tokio::test]
    async fn read_source_keeps_header_and_data_lines() {
        let (_dir, path) = scratch("\n track_id,timestamp,x,y \n1,0.5,1,2\n\n2,0.5,3,4\n");
        let source = read_source(&path).await.expect("source");

        assert_eq!(source.header.columns(), ["track_id", "timestamp", "x", "y"]);
        assert_eq!(
            source.data_lines().collect::<Vec<_>>(),
            vec!["1,0.5,1,2", "", "2,0.5,3,4"]
        );
    }

    #[tokio::test]
    async fn load_source_uses_default_path() {
        let (_dir, path) = scratch("track_id,timestamp,x,y,doppler\n4,1.0,0,0,-3\n");
        let accessor = replay_accessor(path.clone());

        assert!(accessor.load_source(None).await);
        let status = accessor.status();
        assert_eq!(status.mode, Mode::Replay);
        assert_eq!(status.source, Some(path));
        assert_eq!(status.headers.len(), 5);
        assert!(status.playback.is_playing);

        let targets = accessor.current_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].velocity, Some(3.0));
        accessor.stop();
    }

    #[tokio::test]
    async fn failed_load_keeps_previous_dataset() {
        let (dir, path) = scratch("track_id,timestamp,x,y\n1,1.0,0,0\n");
        let accessor = replay_accessor(path.clone());
        assert!(accessor.load_source(Some(&path)).await);

        assert!(!accessor.load_source(Some(&dir.path().join("gone.csv"))).await);
        assert_eq!(accessor.status().source, Some(path));
        assert_eq!(accessor.current_targets().len(), 1);
        accessor.stop();
    }

    #[test]
    fn status_serializes_camel_case() {
        let status = FeedStatus {
            mode: Mode::Live,
            source: None,
            headers: vec!["track_id".to_string()],
            playback: PlaybackInfo::default(),
        };
        let json = serde_json::to_value(&status).expect("json");
        assert_eq!(json["mode"], "live");
        assert_eq!(json["playback"]["isPlaying"], false);
        assert_eq!(json["playback"]["totalTimestamps"], 0);
    }
}
