//! Errors raised while loading a CSV source.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("CSV source {} does not exist", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read CSV source {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV source {} is empty", path.display())]
    Empty { path: PathBuf },

    #[error("CSV source {} has no header row", path.display())]
    MissingHeader { path: PathBuf },

    #[error("engine failed to initialize from {}: {source:#}", path.display())]
    Engine {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}
