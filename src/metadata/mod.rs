//! Per-file records and the run summary, written through a [`MetadataSink`].

pub mod jsonl;

use std::path::Path;

use serde::Serialize;
use thiserror::Error;

/// One unpack found inside a scanned file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildRecord {
    /// Output directory relative to the unpack root; `None` when the format
    /// was recognised without producing anything.
    pub directory: Option<String>,
    pub offset: u64,
    pub consumed_length: u64,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub run_id: String,
    /// Relative to the unpack root.
    pub path: String,
    pub sha256: String,
    pub md5: String,
    pub size: u64,
    pub tags: Vec<String>,
    pub children: Vec<ChildRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub files_scanned: u64,
    pub bytes_scanned: u64,
    pub unpacks: u64,
    pub duplicates: u64,
    pub unreadable: u64,
    pub disabled_formats: Vec<String>,
    pub cancelled: bool,
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("metadata writer poisoned")]
    Poisoned,
}

/// Output sink for file records.
///
/// # Example
/// ```rust
/// use firmcarve::metadata::{self, MetadataSink, RunSummary};
///
/// let run_output_dir = std::env::temp_dir().join("firmcarve_meta_example");
/// std::fs::create_dir_all(&run_output_dir).unwrap();
///
/// let sink = metadata::build_sink("example_run", "0.2.1", "abc", &run_output_dir).unwrap();
/// let summary = RunSummary {
///     run_id: "example_run".to_string(),
///     ..RunSummary::default()
/// };
/// sink.record_run_summary(&summary).unwrap();
/// sink.flush().unwrap();
/// ```
pub trait MetadataSink: Send + Sync {
    fn record_file(&self, record: &FileRecord) -> Result<(), MetadataError>;
    fn record_run_summary(&self, summary: &RunSummary) -> Result<(), MetadataError>;
    fn flush(&self) -> Result<(), MetadataError>;
}

pub fn build_sink(
    run_id: &str,
    tool_version: &str,
    config_hash: &str,
    run_output_dir: &Path,
) -> Result<Box<dyn MetadataSink>, MetadataError> {
    Ok(Box::new(jsonl::JsonlSink::new(
        run_id,
        tool_version,
        config_hash,
        run_output_dir,
    )?))
}
