//! Radar track feed.
//!
//! Ingests radar-track samples from a CSV file and serves the current set of targets to a
//! polling HTTP client. Two ingestion engines share one row parser:
//!
//! - [`engine::ReplayEngine`] loads a finished recording and cycles through its timestamp
//!   buckets on a fixed clock, simulating a live sensor.
//! - [`engine::TailEngine`] follows a file that another process is appending to and exposes
//!   the most recently ingested batch.
//!
//! [`snapshot::SnapshotAccessor`] picks one of them at startup and is the only read path the
//! HTTP layer in [`server`] uses.

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod parsers;
pub mod server;
pub mod snapshot;
pub mod track;
pub mod watcher;
