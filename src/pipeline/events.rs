//! Events sent from unpack workers to the metadata thread.

use crate::metadata::{FileRecord, RunSummary};

#[derive(Debug)]
pub enum MetadataEvent {
    /// A file was scanned (or skipped as empty or duplicate)
    File(FileRecord),
    /// Run summary statistics
    RunSummary(RunSummary),
}
