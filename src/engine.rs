//! Per-file unpacking engine.
//!
//! A file is scanned for markers once. Drivers then run in priority order
//! over their candidate offsets, sharing one [`Blacklist`] so that a byte
//! range claimed by one format is never offered to another. Each attempt
//! gets a fresh output directory which is kept only on success.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::blacklist::{Blacklist, ByteInterval};
use crate::carve::{CarveContext, CarveError, DriverRegistry, FormatDriver, has_output};
use crate::config::{Config, ScanOptions};
use crate::scanner::{OffsetTable, SignatureScanner, build_signature_scanner, scan_source};
use crate::scratch::ScratchSpace;
use crate::source::{ByteSource, FileSource, SourceError};
use crate::tool::{ToolBox, ToolRunner};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot read {path}: {source}")]
    UnreadableInput {
        path: PathBuf,
        #[source]
        source: SourceError,
    },
}

/// One successful unpack inside a scanned file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackResult {
    pub format: String,
    /// Produced output; `None` when the format was recognised but nothing
    /// needed extracting (a pass-through format spanning the whole file).
    pub directory: Option<PathBuf>,
    pub offset: u64,
    /// 0 when the extent is unknown.
    pub consumed_length: u64,
    pub tags: Vec<String>,
    pub new_blacklist_entries: Vec<ByteInterval>,
}

#[derive(Debug, Default)]
pub struct FileScan {
    pub results: Vec<UnpackResult>,
    pub blacklist: Blacklist,
    pub tags: Vec<String>,
}

pub struct Engine {
    registry: DriverRegistry,
    scanner: Box<dyn SignatureScanner>,
    tools: ToolBox,
    options: ScanOptions,
    window_size: u64,
    overlap: u64,
    cancel: Arc<AtomicBool>,
}

impl Engine {
    /// Build the driver registry from `cfg` and check every driver's tools
    /// once; formats with missing tools are disabled for the run.
    pub fn new(cfg: &Config, runner: Arc<dyn ToolRunner>, cancel: Arc<AtomicBool>) -> Result<Self> {
        let registry = DriverRegistry::from_config(cfg);
        let tools = ToolBox::new(runner, Duration::from_secs(cfg.tool_timeout_secs));
        for entry in registry.iter() {
            let driver = entry.driver.as_ref();
            tools.preflight(driver.name(), driver.required_tools(), driver.optional_tools());
        }
        let scanner = build_signature_scanner(cfg, &registry.marker_ids())?;
        Ok(Self {
            registry,
            scanner,
            tools,
            options: ScanOptions::from_env(cfg.environment.clone()),
            window_size: cfg.window_size,
            overlap: cfg.overlap_bytes,
            cancel,
        })
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    pub fn tools(&self) -> &ToolBox {
        &self.tools
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Unpack everything recognisable in `path`. Output directories are
    /// created next to the file.
    pub fn scan_file(&self, path: &Path) -> Result<FileScan, EngineError> {
        let unreadable = |source| EngineError::UnreadableInput {
            path: path.to_path_buf(),
            source,
        };
        let source = FileSource::open(path).map_err(unreadable)?;
        let table = scan_source(self.scanner.as_ref(), &source, self.window_size, self.overlap)
            .map_err(unreadable)?;
        let file_len = source.len();
        trace!(
            "{}: {} marker hits over {file_len} bytes",
            path.display(),
            table.total_hits()
        );

        let mut scan = FileScan::default();
        let mut scratch = ScratchSpace::for_file(path);
        for entry in self.registry.iter() {
            if self.cancelled() || file_len == 0 {
                break;
            }
            if scan.blacklist.covers(0, file_len) {
                debug!("{}: fully claimed, skipping remaining drivers", path.display());
                break;
            }
            let driver = entry.driver.as_ref();
            if file_len < entry.min_size || self.tools.is_disabled(driver.name()) {
                continue;
            }
            for offset in driver.candidates(&table) {
                if self.cancelled() || self.tools.is_disabled(driver.name()) {
                    break;
                }
                if offset >= file_len || scan.blacklist.is_blacklisted(offset).is_some() {
                    continue;
                }
                if let Some(result) = self.attempt(
                    driver,
                    path,
                    &source,
                    &table,
                    &mut scan.blacklist,
                    &mut scratch,
                    offset,
                ) {
                    scan.results.push(result);
                }
            }
        }

        if let [only] = scan.results.as_slice() {
            if only.offset == 0 && only.consumed_length == file_len {
                scan.tags.push(only.format.clone());
                let compressed = self
                    .registry
                    .get(&only.format)
                    .is_some_and(|d| d.is_compression());
                if compressed {
                    scan.tags.push("compressed".to_string());
                }
            }
        }
        Ok(scan)
    }

    /// Run one candidate through check, carve and blacklist update.
    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &self,
        driver: &dyn FormatDriver,
        path: &Path,
        source: &dyn ByteSource,
        table: &OffsetTable,
        blacklist: &mut Blacklist,
        scratch: &mut ScratchSpace,
        offset: u64,
    ) -> Option<UnpackResult> {
        let format = driver.name();
        let (dir, outcome) = {
            let ctx = CarveContext {
                path,
                source,
                table,
                blacklist,
                options: &self.options,
                tools: &self.tools,
                scratch,
            };
            if !driver.check(&ctx, offset) {
                trace!("{format} at {offset:#x}: header check failed");
                return None;
            }
            let dir = match scratch.create_dir(format) {
                Ok(dir) => dir,
                Err(err) => {
                    warn!("{format} at {offset:#x}: cannot create output directory: {err}");
                    return None;
                }
            };
            let outcome = driver.carve(&ctx, offset, &dir.path);
            (dir, outcome)
        };

        let carved = match outcome {
            Ok(carved) => carved,
            Err(err) => {
                match &err {
                    CarveError::ExpectedMiss => trace!("{format} at {offset:#x}: {err}"),
                    CarveError::ToolUnavailable(program) => {
                        self.tools.disable(format, &format!("{program} disappeared"));
                    }
                    CarveError::CorruptPartialOutput(_) => debug!("{format} at {offset:#x}: {err}"),
                    CarveError::ResourceExhaustion(_) => warn!("{format} at {offset:#x}: {err}"),
                    CarveError::Io(_) => debug!("{format} at {offset:#x}: {err}"),
                }
                scratch.discard(dir);
                return None;
            }
        };

        let file_len = source.len();
        let mut new_entries = Vec::new();
        if carved.length > 0 {
            let end = offset.saturating_add(carved.length);
            if end > file_len || blacklist.overlaps(offset, end) {
                debug!(
                    "{format} at {offset:#x}: claimed range [{offset:#x}, {end:#x}) overlaps or passes EOF, discarded"
                );
                scratch.discard(dir);
                return None;
            }
            blacklist.add(offset, end);
            new_entries.push(ByteInterval::new(offset, end));
        }
        scratch.succeeded(format, &dir);
        let directory = if has_output(&dir.path) {
            Some(dir.path)
        } else {
            scratch.discard(dir);
            None
        };
        debug!(
            "{format} at {offset:#x} in {}: consumed {} bytes",
            path.display(),
            carved.length
        );
        Some(UnpackResult {
            format: format.to_string(),
            directory,
            offset,
            consumed_length: carved.length,
            tags: carved.tags,
            new_blacklist_entries: new_entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;
    use crate::tool::SystemToolRunner;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn engine_for(formats: &[&str]) -> Engine {
        let mut cfg = load_config(None).expect("config").config;
        cfg.drivers.retain(|d| formats.contains(&d.name.as_str()));
        let cancel = Arc::new(AtomicBool::new(false));
        let runner = Arc::new(SystemToolRunner::new(cancel.clone()));
        Engine::new(&cfg, runner, cancel).expect("engine")
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).expect("write");
        encoder.finish().expect("finish")
    }

    #[test]
    fn whole_file_gzip_is_tagged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("blob.gz");
        let member = gzip(b"plain text inside");
        std::fs::write(&input, &member).expect("write");

        let scan = engine_for(&["gzip"]).scan_file(&input).expect("scan");
        assert_eq!(scan.results.len(), 1);
        assert_eq!(scan.results[0].consumed_length, member.len() as u64);
        assert_eq!(scan.tags, vec!["gzip", "compressed"]);
        let out = scan.results[0].directory.as_ref().expect("output dir");
        assert!(out.ends_with("blob.gz-gzip-1"));
    }

    #[test]
    fn embedded_gzip_claims_exact_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("fw.bin");
        let member = gzip(&b"rootfs ".repeat(64));
        let mut data = vec![0x55u8; 100];
        data.extend_from_slice(&member);
        data.extend_from_slice(&[0xaa; 40]);
        std::fs::write(&input, &data).expect("write");

        let scan = engine_for(&["gzip"]).scan_file(&input).expect("scan");
        assert_eq!(scan.results.len(), 1);
        let result = &scan.results[0];
        assert_eq!(result.offset, 100);
        assert_eq!(result.consumed_length, member.len() as u64);
        let claimed: Vec<_> = scan.blacklist.iter().copied().collect();
        assert_eq!(claimed, vec![ByteInterval::new(100, 100 + member.len() as u64)]);
        assert!(scan.tags.is_empty());
    }

    #[test]
    fn failed_attempt_leaves_no_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("noise.bin");
        let mut data = vec![0u8; 64];
        data.extend_from_slice(&[0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0, 0x03, 0x04, 0xff, 0xff]);
        data.extend_from_slice(&[0x11; 64]);
        std::fs::write(&input, &data).expect("write");

        let scan = engine_for(&["gzip"]).scan_file(&input).expect("scan");
        assert!(scan.results.is_empty());
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("noise.bin")]);
    }

    #[test]
    fn missing_file_is_unreadable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = engine_for(&["gzip"])
            .scan_file(&dir.path().join("absent"))
            .expect_err("missing");
        assert!(matches!(err, EngineError::UnreadableInput { .. }));
    }
}
