use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use crate::metadata::{FileRecord, MetadataError, MetadataSink, RunSummary};

/// Writes one JSON object per line to `metadata/records.jsonl`.
pub struct JsonlSink {
    tool_version: String,
    config_hash: String,
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

#[derive(Serialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
enum Line<'a> {
    File {
        #[serde(flatten)]
        record: &'a FileRecord,
        tool_version: &'a str,
        config_hash: &'a str,
    },
    RunSummary {
        #[serde(flatten)]
        summary: &'a RunSummary,
        tool_version: &'a str,
        config_hash: &'a str,
    },
}

impl JsonlSink {
    pub fn new(
        _run_id: &str,
        tool_version: &str,
        config_hash: &str,
        run_output_dir: &Path,
    ) -> Result<Self, MetadataError> {
        let meta_dir = run_output_dir.join("metadata");
        std::fs::create_dir_all(&meta_dir)?;
        let path = meta_dir.join("records.jsonl");
        let file = File::create(&path)?;
        Ok(Self {
            tool_version: tool_version.to_string(),
            config_hash: config_hash.to_string(),
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, line: &Line) -> Result<(), MetadataError> {
        let mut guard = self.writer.lock().map_err(|_| MetadataError::Poisoned)?;
        serde_json::to_writer(&mut *guard, line)?;
        guard.write_all(b"\n")?;
        Ok(())
    }
}

impl MetadataSink for JsonlSink {
    fn record_file(&self, record: &FileRecord) -> Result<(), MetadataError> {
        self.write_line(&Line::File {
            record,
            tool_version: &self.tool_version,
            config_hash: &self.config_hash,
        })
    }

    fn record_run_summary(&self, summary: &RunSummary) -> Result<(), MetadataError> {
        self.write_line(&Line::RunSummary {
            summary,
            tool_version: &self.tool_version,
            config_hash: &self.config_hash,
        })
    }

    fn flush(&self) -> Result<(), MetadataError> {
        let mut guard = self.writer.lock().map_err(|_| MetadataError::Poisoned)?;
        guard.flush()?;
        Ok(())
    }
}
